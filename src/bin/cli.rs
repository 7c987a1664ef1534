//! Chronicle Pattern Mining CLI
//!
//! Command-line interface for pattern mining operations:
//! - Register users and their timezones
//! - Import events from CSV
//! - Run a mining job on demand
//! - List discovered patterns

use anyhow::{bail, Context};
use chrono_tz::Tz;
use chronicle_patterns::config::{generate_default_config, Config, LoggingConfig};
use chronicle_patterns::events::EventCsvImporter;
use chronicle_patterns::logging::init_logging;
use chronicle_patterns::mining::{JobSummary, PatternMiner};
use chronicle_patterns::patterns::DiscoveredPattern;
use chronicle_patterns::storage::{
    EventSource, PatternStore, SqliteStore, UserDirectory, UserProfile,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chronicle-patterns")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Discover behavioral health patterns from personal event logs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: from config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Import events from CSV
    Import {
        /// Path to CSV file
        path: PathBuf,
        /// Owner of the events
        #[arg(short, long)]
        user: String,
        /// Parse and report without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run pattern mining now
    Mine {
        /// User to mine (default: all active users)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List active patterns
    Patterns {
        #[arg(short, long)]
        user: String,
    },

    /// Archive a pattern by ID
    Archive { pattern_id: String },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum UserAction {
    /// Register a user or update their timezone
    Add {
        user_id: String,
        /// IANA timezone, e.g. Europe/Berlin
        #[arg(short, long, default_value = "UTC")]
        timezone: String,
    },
    /// List active users
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let config = generate_default_config();
        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &config)?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", config),
        }
        return Ok(());
    }

    let config = Config::load_default();
    init_logging(&LoggingConfig {
        level: "warn".to_string(),
        ..config.logging.clone()
    })
    .context("failed to initialize logging")?;

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.storage.database_path));
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open {:?}", db_path))?
            .with_confidence(config.mining.confidence.clone()),
    );

    match cli.command {
        Commands::User { action } => match action {
            UserAction::Add { user_id, timezone } => {
                if timezone.parse::<Tz>().is_err() {
                    bail!("unknown timezone '{}'", timezone);
                }
                store
                    .upsert_user(&UserProfile::new(&user_id, &timezone))
                    .await?;
                println!("User {} registered ({})", user_id, timezone);
            }
            UserAction::List => {
                let users = store.list_active_users().await?;
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&users)?),
                    OutputFormat::Table => {
                        println!("{:<24} {:<24} {}", "User", "Timezone", "Last run");
                        println!("{}", "-".repeat(72));
                        for user in users {
                            let last_run = user
                                .last_run_at
                                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                                .unwrap_or_else(|| "never".to_string());
                            println!("{:<24} {:<24} {}", user.user_id, user.timezone, last_run);
                        }
                    }
                }
            }
        },

        Commands::Import {
            path,
            user,
            dry_run,
        } => {
            if !path.exists() {
                bail!("file not found: {:?}", path);
            }

            let timezone = match store.get_user(&user).await? {
                Some(profile) => profile
                    .timezone
                    .parse::<Tz>()
                    .map_err(|e| anyhow::anyhow!("user {} has invalid timezone: {}", user, e))?,
                None => bail!("unknown user '{}', add it with `user add` first", user),
            };

            let result = EventCsvImporter::new(&user)
                .with_timezone(timezone)
                .import(&path)?;

            println!(
                "Parsed {} rows: {} events, {} failed",
                result.rows_processed,
                result.events.len(),
                result.rows_failed
            );
            for error in result.errors.iter().take(10) {
                eprintln!("  {}", error);
            }

            if dry_run {
                println!("Dry run, nothing written");
            } else {
                let inserted = store.append_events(&result.events).await?;
                println!(
                    "Imported {} new events ({} already present)",
                    inserted,
                    result.events.len() - inserted
                );
            }
        }

        Commands::Mine { user } => {
            let miner = PatternMiner::with_store(config.mining.clone(), store.clone())
                .with_retry_policy(config.scheduler.retry.clone())
                .with_job_retries(config.scheduler.job_retries);

            let user_ids = match user {
                Some(user_id) => vec![user_id],
                None => store
                    .list_active_users()
                    .await?
                    .into_iter()
                    .map(|u| u.user_id)
                    .collect(),
            };

            let mut summaries = Vec::new();
            for user_id in user_ids {
                summaries.push(miner.run_pattern_mining(&user_id).await);
            }

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
                OutputFormat::Table => print_summaries(&summaries),
            }

            if summaries.iter().any(|s| !s.completed) {
                std::process::exit(1);
            }
        }

        Commands::Patterns { user } => {
            let patterns = store.get_active_patterns(&user).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&patterns)?),
                OutputFormat::Table => print_patterns(&patterns),
            }
        }

        Commands::Archive { pattern_id } => {
            store.archive_pattern(&pattern_id).await?;
            println!("Pattern {} archived", pattern_id);
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

fn print_summaries(summaries: &[JobSummary]) {
    if summaries.is_empty() {
        println!("No active users");
        return;
    }

    println!(
        "{:<24} {:>8} {:>8} {:>9} {:>10}  {}",
        "User", "Created", "Updated", "Archived", "Time (ms)", "Status"
    );
    println!("{}", "-".repeat(80));
    for summary in summaries {
        let status = if summary.completed { "ok" } else { "failed" };
        println!(
            "{:<24} {:>8} {:>8} {:>9} {:>10}  {}",
            summary.user_id,
            summary.patterns_created,
            summary.patterns_updated,
            summary.patterns_archived,
            summary.duration_ms,
            status
        );
        for error in &summary.errors {
            println!("    {}", error);
        }
    }
}

fn print_patterns(patterns: &[DiscoveredPattern]) {
    if patterns.is_empty() {
        println!("No active patterns yet.");
        println!();
        println!("Import events and run:");
        println!("  chronicle-patterns-cli mine --user <id>");
        return;
    }

    println!(
        "{:>6} {:>6} {:<22} {}",
        "Impact", "Conf", "Type", "Insight"
    );
    println!("{}", "-".repeat(100));
    for pattern in patterns {
        println!(
            "{:>6.0} {:>5.0}% {:<22} {}",
            pattern.impact_score,
            pattern.confidence * 100.0,
            pattern.pattern_type.as_str(),
            pattern.actionable_insight
        );
        println!("{:>37}{}", "", pattern.id);
    }
}
