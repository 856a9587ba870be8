//! Courier - conversation threads and batched notification mail
//!
//! Main entry point for the Courier CLI.

use clap::{Parser, Subcommand};
use courier::config::validate_config_result;
use courier::mail::metrics::encode_metrics;
use courier::mail::{MailScheduler, ProcessMode};
use courier::{CourierConfig, CourierError, Messenger};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// Courier - drain, watch and maintain the notification queue
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/courier/config.yaml)
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, env = "COURIER_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Deliver due notifications once
    Drain {
        /// Which events to process: true (forced), false (ordinary) or all
        #[arg(long, default_value = "all")]
        forced: ProcessMode,

        /// Ignore per-type intervals and per-user delivery rates
        #[arg(long)]
        bypass_delay: bool,
    },

    /// Drain periodically until interrupted
    Watch,

    /// Show queue depth and metrics
    Stats {
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },

    /// Delete stale threads and old delivered mail
    Prune {
        /// Age in days
        #[arg(short, long, default_value = "90")]
        days: u32,

        /// Only threads that are already closed or deleted
        #[arg(long)]
        closed_only: bool,

        /// Also remove the rows instead of flagging them deleted
        #[arg(long)]
        clear: bool,
    },

    /// Check the configuration file
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Watch => "info",
        _ => "warn",
    };
    if let Err(e) = courier::logging::init(default_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> courier::Result<i32> {
    let config_path = cli.config.clone().unwrap_or_else(CourierConfig::default_path);

    if let Commands::Init { force } = cli.command {
        handle_init_command(&config_path, force)?;
        return Ok(0);
    }

    let mut config = load_config(&config_path)?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    validate_config_result(&config)?;

    if let Commands::Validate = cli.command {
        println!("✓ Configuration is valid: {}", config_path.display());
        return Ok(0);
    }

    let messenger = Messenger::open(config)?;

    match cli.command {
        Commands::Drain {
            forced,
            bypass_delay,
        } => {
            let report = messenger.drain(forced, bypass_delay)?;
            println!(
                "Drained ({}): {} sent, {} failed, {} discarded, {} skipped",
                forced, report.sent, report.failed, report.discarded, report.skipped
            );
            if report.has_failures() {
                return Ok(1);
            }
        }

        Commands::Watch => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let mut scheduler = MailScheduler::new(
                Arc::clone(messenger.store()),
                Arc::clone(messenger.mail()),
                &messenger.config().mail,
            );
            let stats = runtime.block_on(scheduler.run())?;
            println!(
                "Stopped after {} runs: {} sent, {} failed, {} errors",
                stats.runs, stats.totals.sent, stats.totals.failed, stats.errors
            );
        }

        Commands::Stats { metrics } => {
            let mail = messenger.mail();
            let (forced, ordinary, by_type, next_due) = messenger.store().with_conn(|conn| {
                Ok((
                    mail.depth(conn, Some(true))?,
                    mail.depth(conn, Some(false))?,
                    mail.pending_by_type(conn)?,
                    mail.next_due(conn)?,
                ))
            })?;

            println!("Mail queue");
            println!("  Forced:   {}", forced);
            println!("  Ordinary: {}", ordinary);
            match next_due {
                Some(at) => println!("  Next due: {}", at.to_rfc3339()),
                None => println!("  Next due: -"),
            }
            if !by_type.is_empty() {
                println!();
                println!("By type:");
                for (mail_type, count) in by_type {
                    println!("  {:<40} {}", mail_type, count);
                }
            }
            if metrics {
                println!();
                print!("{}", encode_metrics());
            }
        }

        Commands::Prune {
            days,
            closed_only,
            clear,
        } => {
            let threads = messenger.prune(days, closed_only, clear)?;
            let mail = messenger
                .store()
                .transaction(|tx| messenger.mail().purge(tx, days))?;
            println!("Pruned {} threads and {} delivered notifications", threads, mail);
        }

        Commands::Init { .. } | Commands::Validate => {}
    }

    Ok(0)
}

fn load_config(path: &Path) -> courier::Result<CourierConfig> {
    match CourierConfig::load(path) {
        Ok(config) => Ok(config),
        Err(CourierError::Config(msg)) if msg.contains("Config file not found") => {
            Err(CourierError::Config(format!(
                "No configuration found at {}. Run 'courier init' first to create one.",
                path.display()
            )))
        }
        Err(e) => Err(e),
    }
}

fn handle_init_command(path: &Path, force: bool) -> courier::Result<()> {
    if path.exists() && !force {
        println!("Configuration already exists at: {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    let config = CourierConfig::new();
    config.save(path)?;

    println!("✓ Created configuration at: {}", path.display());
    println!("  Database: {}", config.database.display());
    println!();
    println!("Next steps:");
    println!("  courier drain --forced all   # deliver due notifications");
    println!("  courier watch                # keep draining in the background");

    Ok(())
}
