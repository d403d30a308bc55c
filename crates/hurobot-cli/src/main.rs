//! Hurobot CLI
//!
//! Command-line interface for the hurobot command router

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hurobot_config::{Config, Role};
use hurobot_core::{tokenize, HurobotRuntime};
use hurobot_ipc::{EventBus, Message, OutboundMessage, Outbox};
use hurobot_policy::RoleResolver;
use hurobot_storage::{SqliteStore, Storage};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hurobot")]
#[command(about = "Chat-bot command router with per-command permissions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level, overrides core.log_level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with a console transport: one raw CQ message per stdin
    /// line in, outbound actions as JSON lines out
    Start {
        /// Sender of console messages (defaults to the master id)
        #[arg(long)]
        user: Option<u64>,
        /// Group of console messages, 0 for a private chat
        #[arg(long, default_value_t = 0)]
        group: u64,
        #[arg(long, default_value = "console")]
        nickname: String,
    },
    /// Show how a raw CQ message is tokenized
    Tokenize { raw: String },
    /// Inspect stored command policies
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
    /// Manage persisted user roles
    Role {
        #[command(subcommand)]
        action: RoleCommands,
    },
    /// Show the most recent logged messages
    Messages {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage log files
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Print the stored policy of a command as JSON
    Show { command: String },
}

#[derive(Subcommand)]
enum RoleCommands {
    /// Persist a role (guest|admin|master or 0|1|2)
    Set { user: u64, role: Role },
    /// Print the effective role of a user
    Show { user: u64 },
}

#[derive(Subcommand)]
enum LogCommands {
    List,
    /// Print the last lines of today's log
    Tail {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Remove logs older than 7 days
    Clean,
}

#[derive(Subcommand)]
enum ConfigCommands {
    Show,
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            user,
            group,
            nickname,
        } => {
            let config = load_config(cli.config)?;
            let data_dir = config.data_dir()?;
            fs::create_dir_all(&data_dir)?;

            let log_level = cli
                .log_level
                .unwrap_or_else(|| config.log_level().to_string());
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            let storage = open_storage(&config)?;
            let user = user.unwrap_or(config.permissions.master_id);

            let bus = EventBus::new();
            let inbound = bus.subscribe();
            let outbound = bus.outbound_subscribe();
            let runtime = HurobotRuntime::new(config, storage, Outbox::new(bus.outbound_sender()))?;

            let printer = tokio::spawn(print_outbound(outbound));
            let reader = tokio::spawn(read_console(bus, user, group, nickname));

            info!(
                "Starting hurobot with console transport (user {}, group {})",
                user, group
            );
            runtime.run(inbound).await?;
            reader.await??;
            drop(runtime);
            printer.await?;
        }

        Commands::Tokenize { raw } => {
            let message = Message::from_raw(raw);
            match tokenize(&message) {
                Some(invocation) => println!("{}", serde_json::to_string_pretty(&invocation)?),
                None => println!("Not a command"),
            }
        }

        Commands::Policy { action } => match action {
            PolicyCommands::Show { command } => {
                let config = load_config(cli.config)?;
                let storage = open_storage(&config)?;
                match storage.get_policy(&command)? {
                    Some(policy) => println!("{}", serde_json::to_string_pretty(&policy)?),
                    None => println!(
                        "No stored policy for '{}' (master only until the bot starts)",
                        command
                    ),
                }
            }
        },

        Commands::Role { action } => {
            let config = load_config(cli.config)?;
            let storage = open_storage(&config)?;
            match action {
                RoleCommands::Set { user, role } => {
                    storage.set_user_perm(user, role)?;
                    println!("Updated user {} role to {}", user, role);
                    if let Some(configured) = config.permissions.configured_role(user) {
                        println!(
                            "Note: the config file makes {} {}, which takes precedence",
                            user, configured
                        );
                    }
                }
                RoleCommands::Show { user } => {
                    let store =
                        SqliteStore::new(Arc::new(Mutex::new(storage)), config.permissions.clone());
                    println!("{}", store.resolve_user_role(user).await?);
                }
            }
        }

        Commands::Messages { limit } => {
            let config = load_config(cli.config)?;
            let storage = open_storage(&config)?;
            for logged in storage.recent_messages(limit)?.into_iter().rev() {
                println!(
                    "[{}] {}/{}{} {}",
                    logged.time,
                    logged.group_id,
                    logged.user_id,
                    if logged.is_cmd { " (cmd)" } else { "" },
                    logged.raw
                );
            }
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(config.data_dir()?.join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.display(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Tail { lines } => {
                    let current_log = manager.current_log_path();
                    if current_log.exists() {
                        let content = fs::read_to_string(&current_log)?;
                        let all_lines: Vec<&str> = content.lines().collect();
                        let start = all_lines.len().saturating_sub(lines);
                        for line in &all_lines[start..] {
                            println!("{}", line);
                        }
                    } else {
                        println!("No log file found at {}", current_log.display());
                    }
                }
                LogCommands::Clean => {
                    println!("Cleaned {} old log file(s)", manager.cleanup_old_logs()?);
                }
            }
        }

        Commands::Config { action } => {
            let config = load_config(cli.config)?;
            match action {
                ConfigCommands::Show => print!("{}", toml::to_string_pretty(&config)?),
                ConfigCommands::Validate => println!("Config OK"),
            }
        }
    }

    Ok(())
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => PathBuf::from(path),
        None => Config::default_path().context("No config directory found")?,
    };
    Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn open_storage(config: &Config) -> Result<Storage> {
    let db_path = config.storage_path()?;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Storage::new(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))
}

/// Publishes each non-empty stdin line; the bus is dropped at end of input,
/// which stops the runtime.
async fn read_console(bus: EventBus, user: u64, group: u64, nickname: String) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut message_id = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        message_id += 1;
        let message = Message::from_raw(line)
            .with_sender(user, group)
            .with_message_id(message_id)
            .with_nickname(nickname.as_str())
            .with_time(chrono::Utc::now().timestamp());
        bus.publish(message)?;
    }
    Ok(())
}

async fn print_outbound(mut outbound: broadcast::Receiver<OutboundMessage>) {
    loop {
        match outbound.recv().await {
            Ok(message) => match serde_json::to_string(&message) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode outbound message: {}", e),
            },
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Console output lagged by {} messages", n);
            }
        }
    }
}
