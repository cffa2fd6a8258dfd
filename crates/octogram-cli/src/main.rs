//! Octogram CLI
//!
//! Command-line interface for the OctoPrint Telegram bridge

mod chats;
mod logging;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use octogram_config::{bot_id, Config};
use octogram_core::commands::permission_keys;
use octogram_core::notify::notification_keys;
use octogram_core::store::ChatStore;
use octogram_core::Bridge;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "octogram")]
#[command(about = "Control and watch an OctoPrint printer from Telegram", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge in the foreground until Ctrl-C
    Start,

    /// Validate the configuration and print the bot id
    CheckConfig,

    /// Known chats and their rights
    Chats {
        #[command(subcommand)]
        action: ChatCommands,
    },

    /// Log management
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// List known chats
    List,
    /// Show one chat record
    Show {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
    },
    /// Switch rights on
    Grant {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
        #[command(flatten)]
        rights: chats::Rights,
    },
    /// Switch rights off
    Revoke {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
        #[command(flatten)]
        rights: chats::Rights,
    },
    /// Forget a chat
    Remove {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Clean up old logs
    Clean {
        /// Keep only N days of logs
        #[arg(short, long, default_value_t = logging::LOG_RETENTION_DAYS)]
        days: u64,
    },
    /// Show last N lines of today's log
    Tail {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config)?;
            let log_level = config.core.log_level.clone().unwrap_or(cli.log_level);
            let _logging_guard = logging::init_logging(&config.data_dir().join("logs"), &log_level)?;

            info!("Starting Octogram bridge in foreground...");
            let bridge = Bridge::from_config(config).await?;
            let shutdown = bridge.shutdown();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Ctrl-C received");
                        shutdown.trigger();
                    }
                    Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
                }
            });
            bridge.run().await?;
        }

        Commands::CheckConfig => {
            let path = config_path(cli.config)?;
            let config = Config::load(&path)?;
            let id = bot_id(config.telegram.bot_token.trim()).unwrap_or("?");
            println!("Configuration {} is valid", path.display());
            println!("  bot id:    {}", id);
            println!("  octoprint: {}", config.octoprint.base_url);
            println!("  data dir:  {}", config.data_dir().display());
        }

        Commands::Chats { action } => {
            let config = load_config(cli.config)?;
            let store = ChatStore::open(
                &config.state_path(),
                &config.notifications,
                &permission_keys(),
                &notification_keys(),
            )?;
            match action {
                ChatCommands::List => {
                    let all = store.all().await;
                    if all.is_empty() {
                        println!("No known chats yet. Write to the bot to register one.");
                    }
                    for (chat_id, record) in all {
                        println!("{}", chats::summary(&chat_id, &record));
                    }
                }
                ChatCommands::Show { chat_id } => {
                    let record = store
                        .get(&chat_id)
                        .await
                        .ok_or_else(|| anyhow!("unknown chat {}", chat_id))?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                ChatCommands::Grant { chat_id, rights } => {
                    change_rights(&store, &chat_id, &rights, true).await?;
                    println!("Granted rights to chat {}", chat_id);
                }
                ChatCommands::Revoke { chat_id, rights } => {
                    change_rights(&store, &chat_id, &rights, false).await?;
                    println!("Revoked rights from chat {}", chat_id);
                }
                ChatCommands::Remove { chat_id } => {
                    if store.delete(&chat_id).await? {
                        println!("Removed chat {}", chat_id);
                    } else {
                        println!("Chat {} is not known", chat_id);
                    }
                }
            }
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
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
                            file.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let deleted = manager.cleanup_older_than(days)?;
                    println!("Cleaned {} old log file(s)", deleted);
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
            }
        }
    }

    Ok(())
}

async fn change_rights(store: &ChatStore, chat_id: &str, rights: &chats::Rights, enabled: bool) -> Result<()> {
    let outcome = store
        .update_chat(chat_id, |record| chats::apply(record, rights, enabled))
        .await?;
    match outcome {
        Some(applied) => applied,
        None => Err(anyhow!("unknown chat {}", chat_id)),
    }
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config file found")),
    }
}

fn load_config(config_path_arg: Option<String>) -> Result<Config> {
    Config::load(config_path(config_path_arg)?)
}
