//! DevGuard administrative CLI (devguard)
//!
//! Works directly on the whitelist and host key in the configuration
//! directory; a running daemon picks up changes on its next cycle.

mod cli;

use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli_args = cli::Cli::parse();

    // Library logs go to stderr so JSON on stdout stays clean
    let level = std::env::var("DEVGUARD_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(level)
        .init();

    match cli::run_cli(&cli_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
