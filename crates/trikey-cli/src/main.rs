//! Trikey CLI: headless inspection of a device's recovery state
//!
//! # Usage
//!
//! ```bash
//! trikey --config /path/to/trikey.toml --validate
//! trikey --config /path/to/trikey.toml --status
//! trikey --config /path/to/trikey.toml --status --json
//! ```

mod config;
mod status;

use anyhow::{Context, Result};
use std::path::PathBuf;
use trikey_core::{Clock, SystemClock};
use trikey_watch::{JsonFileRecoveryStore, LocalRecoveryStore};

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap dependency)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/trikey.toml");
    let mut validate_only = false;
    let mut show_status = false;
    let mut json = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--validate" => {
                validate_only = true;
            }
            "--status" => {
                show_status = true;
            }
            "--json" => {
                json = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("trikey {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut cli_config = config::CliConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    cli_config.apply_env_overrides();
    cli_config
        .validate()
        .context("Configuration validation failed")?;

    std::env::set_var("RUST_LOG", &cli_config.server.log_level);
    env_logger::init();

    if validate_only {
        println!("✅ Configuration is valid.");
        println!("  Account:       {}", cli_config.account_id());
        let watch = cli_config.watch_config();
        println!("  State file:    {}", watch.state_path.display());
        println!(
            "  Poll interval: {} secs (min {})",
            watch.poll_interval_secs, watch.min_poll_interval_secs
        );
        return Ok(());
    }

    if show_status {
        let store = JsonFileRecoveryStore::new(cli_config.state_path());
        log::debug!("Reading local recovery record from {}", store.path().display());
        let record = store
            .read()
            .with_context(|| format!("Failed to read {}", store.path().display()))?;

        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("Failed to encode record")?
            );
        } else {
            println!("Account: {}", cli_config.account_id());
            print!("{}", status::render(record.as_ref(), SystemClock.now()));
        }
        return Ok(());
    }

    print_help();
    Ok(())
}

fn print_help() {
    println!(
        r#"Trikey: recovery state inspection

USAGE:
    trikey [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/trikey.toml)
    --validate            Validate config file and exit
    --status              Show the local recovery record and delay progress
    --json                With --status, print the raw record as JSON
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    TRIKEY_DATA_DIR         Data directory path
    TRIKEY_LOG_LEVEL        Log level (error/warn/info/debug/trace)
    TRIKEY_ACCOUNT_ID       Account identifier
    TRIKEY_POLL_INTERVAL    Trust anchor poll interval in seconds
"#
    );
}
