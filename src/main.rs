//! cloudshelf - command-line access to the storage cache and analytics

use anyhow::{anyhow, Result};
use std::env;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloudshelf::{AppContext, Config};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Print the analytics report as JSON
    Analytics,
    /// List a remote folder
    List { path: String },
    /// Print storage quota
    Usage,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"cloudshelf - Cached access to cloud file storage

USAGE:
    cloudshelf analytics
    cloudshelf list [path]
    cloudshelf usage
    cloudshelf help

COMMANDS:
    analytics   Print the page-view and bandwidth report as JSON
    list        List a remote folder (root when no path is given)
    usage       Show storage quota
    help        Show this help message

ENVIRONMENT:
    CLOUDSHELF_KV_URL              Redis connection URL (falls back to REDIS_URL)
    CLOUDSHELF_RUNTIME             "edge" disables persistent connections
    CLOUDSHELF_API_URL             Storage API base URL
    CLOUDSHELF_TOKEN_URL           OAuth token endpoint
    CLOUDSHELF_CLIENT_ID           OAuth client ID
    CLOUDSHELF_CLIENT_SECRET       OAuth client secret
    CLOUDSHELF_REFRESH_TOKEN       Refresh credential to seed on first run
    CLOUDSHELF_TZ_OFFSET_MINUTES   Analytics day offset from UTC
    RUST_LOG                       Log filter, e.g. "debug" or "cloudshelf::kv=trace"
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "analytics" => Ok(Command::Analytics),
        "list" => Ok(Command::List {
            path: args.get(2).cloned().unwrap_or_default(),
        }),
        "usage" => Ok(Command::Usage),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(anyhow!("Unknown command: {}", other)),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Log filter from RUST_LOG directives, `info` when unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = log_filter(env::var("RUST_LOG").ok().as_deref());

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = Config::from_env();
    let ctx = AppContext::from_config(&config).await?;
    info!(backend = ctx.kv.backend_name(), "cloudshelf ready");

    match command {
        Command::Analytics => {
            let report = ctx.analytics_report().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::List { path } => {
            let entries = match ctx.storage.list_folder(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!(path = %path, error = %e, "Failed to list folder");
                    if e.is_session_expired() {
                        eprintln!("Session expired. Set CLOUDSHELF_REFRESH_TOKEN to reconnect.");
                    }
                    return Err(e.into());
                }
            };
            if entries.is_empty() {
                println!("(empty)");
            }
            for entry in entries {
                let name = entry.path_display.as_deref().unwrap_or(&entry.name);
                if entry.is_folder() {
                    println!("  {}/", name);
                } else {
                    println!("  {}  ({})", name, format_bytes(entry.size));
                }
            }
        }
        Command::Usage => {
            let usage = ctx.storage.get_space_usage().await?;
            println!(
                "Used {} of {} ({:.1}%, {})",
                format_bytes(usage.used),
                format_bytes(usage.allocation.allocated),
                usage.used_ratio() * 100.0,
                usage.allocation.kind
            );
        }
        Command::Help => print_help(),
    }

    Ok(())
}
