use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tracing::warn;

use rs_fleet::config::{DEFAULT_BECOME_USER, DEFAULT_FORKS, DEFAULT_INVENTORY_PATH, DEFAULT_REMOTE_USER};
use rs_fleet::keydist::DEFAULT_STORE_PATH;
use rs_fleet::{
    Credential, DistributionOptions, DistributionReport, Escalation, Inventory, KeyDistributor,
    PublicKey, RunCoordinator, RunOptions, RunRequest, RunResult, TaskFile, TaskOutcome,
};

#[derive(Parser)]
#[command(name = "rs-fleet")]
#[command(author, version, about = "Run ordered tasks over SSH on a fleet of hosts")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module or a task file against the hosts matching a pattern
    #[command(group(ArgGroup::new("escalation").required(true).args(["become_", "no_become"])))]
    #[command(group(ArgGroup::new("work").required(true).args(["module", "tasks"])))]
    Run {
        /// Host pattern: all, host names, group names or globs, comma separated
        pattern: String,
        #[arg(short, long, default_value = DEFAULT_INVENTORY_PATH)]
        inventory: PathBuf,
        /// Module to run ad hoc
        #[arg(short, long)]
        module: Option<String>,
        /// Module arguments
        #[arg(short, long, default_value = "", requires = "module")]
        args: String,
        /// YAML or JSON task file
        #[arg(short, long)]
        tasks: Option<PathBuf>,
        #[arg(short, long, default_value_t = DEFAULT_FORKS)]
        forks: usize,
        /// Run remote commands through sudo
        #[arg(short = 'b', long = "become")]
        become_: bool,
        #[arg(long, default_value = DEFAULT_BECOME_USER, requires = "become_")]
        become_user: String,
        /// Run remote commands as the login user
        #[arg(long)]
        no_become: bool,
        /// Login user for hosts without their own credentials
        #[arg(short, long, default_value = DEFAULT_REMOTE_USER)]
        user: String,
        #[arg(long, env = "FLEET_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, conflicts_with = "password")]
        private_key: Option<String>,
        /// Connect timeout in seconds
        #[arg(long, default_value_t = 8)]
        connect_timeout: u64,
        /// Per-task timeout in seconds
        #[arg(long)]
        task_timeout: Option<u64>,
        /// Whole-run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Skip modules that change remote state
        #[arg(short = 'C', long)]
        check: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved inventory
    Inventory {
        #[arg(short, long, default_value = DEFAULT_INVENTORY_PATH)]
        inventory: PathBuf,
        /// Only show hosts matching this pattern
        #[arg(short, long)]
        pattern: Option<String>,
        #[arg(long, value_enum, default_value_t = InventoryFormat::Ini)]
        format: InventoryFormat,
    },

    /// Install the local public key on every pending host in a credential file
    CopyId {
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        hostlist: PathBuf,
        #[arg(short, long, default_value_t = 10)]
        forks: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InventoryFormat {
    Ini,
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pattern,
            inventory,
            module,
            args,
            tasks,
            forks,
            become_,
            become_user,
            no_become: _,
            user,
            password,
            private_key,
            connect_timeout,
            task_timeout,
            timeout,
            check,
            json,
        } => {
            let escalation = if become_ {
                Escalation::Sudo { user: become_user }
            } else {
                Escalation::Disabled
            };
            let credential = match (password, private_key) {
                (Some(password), _) => Credential::password(&user, &password),
                (None, Some(path)) => Credential::private_key(&user, &path, None),
                (None, None) => Credential::agent(&user),
            };
            let mut options = RunOptions::new(escalation)
                .with_forks(forks)
                .with_connect_timeout(Duration::from_secs(connect_timeout))
                .with_check_mode(check)
                .with_default_credential(credential);
            if let Some(secs) = task_timeout {
                options = options.with_task_timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = timeout {
                options = options.with_run_timeout(Duration::from_secs(secs));
            }

            let task_file = match (module, tasks) {
                (Some(module), _) => TaskFile::ad_hoc(&module, &pattern, &module, &args)?,
                (None, Some(path)) => {
                    let mut task_file = TaskFile::from_file(&path)?;
                    task_file.hosts = pattern;
                    task_file
                }
                (None, None) => bail!("either --module or --tasks is required"),
            };

            let inventory = Inventory::from_file(&inventory)
                .with_context(|| format!("loading inventory {}", inventory.display()))?;
            let request = RunRequest::from_task_file(&inventory, &task_file, options)?;

            let coordinator = RunCoordinator::ssh();
            let token = coordinator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling outstanding tasks");
                    token.cancel();
                }
            });

            let result = coordinator.run(&request).await?;
            if json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
            Ok(exit_code(&result))
        }

        Commands::Inventory {
            inventory,
            pattern,
            format,
        } => {
            let mut inventory = Inventory::from_file(&inventory)
                .with_context(|| format!("loading inventory {}", inventory.display()))?;
            if let Some(pattern) = pattern {
                inventory = inventory.subset(&pattern)?;
            }
            match format {
                InventoryFormat::Ini => print!("{}", inventory.render()),
                InventoryFormat::Yaml => print!("{}", inventory.to_config().redacted().to_yaml()?),
                InventoryFormat::Json => println!("{}", inventory.to_config().redacted().to_json()?),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::CopyId { hostlist, forks } => {
            let (path, key) = PublicKey::discover()?;
            tracing::info!("Using public key {} ({})", path.display(), key.fingerprint());

            let distributor = KeyDistributor::new(
                RunCoordinator::ssh(),
                DistributionOptions::from_env().with_forks(forks),
            );
            match distributor.distribute(&hostlist, &key).await? {
                DistributionReport::Seeded(path) => {
                    println!(
                        "Created {}. Add your hosts to it and run again.",
                        path.display()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                DistributionReport::Completed(summary) => {
                    for host in &summary.installed {
                        println!("{} | key installed", host);
                    }
                    for (host, reason) in &summary.failed {
                        println!("{} | FAILED | {}", host, reason);
                    }
                    println!(
                        "installed={} failed={} already_done={}",
                        summary.installed.len(),
                        summary.failed.len(),
                        summary.already_done.len()
                    );
                    Ok(if summary.failed.is_empty() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    })
                }
            }
        }
    }
}

fn print_result(result: &RunResult) {
    for task in result.tasks() {
        println!("TASK [{}]", task.task);
        for entry in &task.hosts {
            match entry.outcome {
                TaskOutcome::Ok(ref payload) => {
                    let state = if payload.changed { "CHANGED" } else { "SUCCESS" };
                    match payload.rc {
                        Some(rc) => println!("{} | {} | rc={} >>", entry.host, state, rc),
                        None => println!("{} | {} >>", entry.host, state),
                    }
                    print_block(&payload.stdout);
                    if let Some(ref msg) = payload.msg {
                        print_block(msg);
                    }
                }
                TaskOutcome::Failed {
                    ref payload,
                    ref error,
                } => {
                    println!("{} | FAILED | {} >>", entry.host, error);
                    print_block(&payload.stdout);
                    print_block(&payload.stderr);
                }
                TaskOutcome::Unreachable(ref error) => {
                    println!("{} | UNREACHABLE | {}", entry.host, error)
                }
                TaskOutcome::Skipped(ref reason) => {
                    println!("{} | SKIPPED | {}", entry.host, reason)
                }
            }
        }
        println!();
    }

    println!("RECAP");
    for (host, recap) in result.recap() {
        println!(
            "{:<30} ok={} changed={} unreachable={} failed={} skipped={}",
            host, recap.ok, recap.changed, recap.unreachable, recap.failed, recap.skipped
        );
    }
}

fn print_block(text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        println!("{}", text);
    }
}

/// 2 表示有任务失败，4 表示有主机不可达
fn exit_code(result: &RunResult) -> ExitCode {
    let recap = result.recap();
    if recap.values().any(|r| r.unreachable > 0) {
        ExitCode::from(4)
    } else if recap.values().any(|r| r.failed > 0) {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
