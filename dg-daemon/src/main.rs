//! DevGuard Daemon (devguardd)
//!
//! Privileged agent that keeps every connected USB device in line with the
//! whitelist: unknown devices are blocked, registered storage media must
//! prove they are the medium that was registered.
//!
//! # Supported Platforms
//! - **Linux**: sysfs enumeration, umount / SCSI delete / USB deauthorize
//! - **Windows**: CIM enumeration, NoDrives policy / media eject / PnP disable
//!
//! # Security Model
//! - **Privilege**: Needs root (or an elevated token) to enforce
//! - **Isolation**: Restrictive umask, working directory set to /
//! - **Single instance**: PID file with stale-PID detection (Unix)
//! - **Signals**: SIGINT/SIGTERM stop the loop between cycles

mod monitor;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use dg_core::constants::paths;
use dg_core::platform::is_privileged;
use dg_core::{GuardSettings, Platform, ShutdownSignal, TracingEventSink};

use monitor::Monitor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Security Hardening
// ============================================================================

/// Set restrictive umask
#[cfg(unix)]
fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask for the process.
    unsafe { libc::umask(0o077) };
}

#[cfg(unix)]
fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
}

/// Enforcement needs root; running without it is allowed but mostly toothless
fn verify_privileges() {
    if is_privileged() {
        info!("Running with administrative privileges");
    } else {
        warn!("Not running as root/elevated: enforcement strategies will likely fail");
    }
}

// ============================================================================
// PID File Management
// ============================================================================

#[cfg(unix)]
fn pid_file_path() -> PathBuf {
    if std::path::Path::new("/run").exists() {
        PathBuf::from("/run/devguardd.pid")
    } else {
        PathBuf::from("/var/run/devguardd.pid")
    }
}

/// Write PID file, refusing to start when another live instance owns it
#[cfg(unix)]
fn write_pid_file(path: &std::path::Path) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if path.exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: signal 0 only checks that the process exists.
                if old_pid > 0 && unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(())
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when a journal socket exists, stdout otherwise. Returns true for journald.
fn init_logging(level: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/run/systemd/journal/socket").exists() {
            match tracing_journald::layer() {
                Ok(journald_layer) => {
                    use tracing_subscriber::prelude::*;
                    tracing_subscriber::registry()
                        .with(journald_layer)
                        .with(tracing_subscriber::EnvFilter::new(level))
                        .init();
                    return true;
                }
                Err(e) => {
                    eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
                }
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(level)
        .init();
    false
}

// ============================================================================
// Signals
// ============================================================================

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGNAL: Received SIGINT"),
                    _ = term.recv() => info!("SIGNAL: Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Could not listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("SIGNAL: Received Ctrl-C");
}

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("devguardd {} - DevGuard removable-device enforcement daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    devguardd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -f, --foreground        Run in foreground (always on)");
    eprintln!("    -c, --config-dir DIR    Configuration directory");
    eprintln!("    -v, --version           Print version");
    eprintln!("    -h, --help              Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    DEVGUARD_LOG            Log level (trace, debug, info, warn, error)");
    eprintln!("    {}     Configuration directory (overridden by -c)", paths::CONFIG_DIR_ENV);
}

fn print_version() {
    println!("devguardd {}", VERSION);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // PHASE 0: Panic hook, so a panic outside the loop's own guard is still visible
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC at {}: {}", location, message);
    }));

    // PHASE 1: Process hardening
    #[cfg(unix)]
    {
        set_secure_umask();
        secure_working_directory();
    }

    // PHASE 2: Arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config_dir: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                print_version();
                return Ok(());
            }
            "-f" | "--foreground" => {}
            "-c" | "--config-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config-dir requires a path argument");
                    std::process::exit(1);
                }
                config_dir = Some(PathBuf::from(&args[i]));
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // PHASE 3: Logging
    let log_level = std::env::var("DEVGUARD_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: devguardd {} starting on {}", VERSION, std::env::consts::OS);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    // PHASE 4: Privileges
    verify_privileges();

    // PHASE 5: Settings
    let config_dir = config_dir.unwrap_or_else(paths::config_dir);
    let settings = match GuardSettings::load(&config_dir) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration in {}: {}", config_dir.display(), e);
            std::process::exit(1);
        }
    };
    info!("STARTUP: Config dir: {}", config_dir.display());
    info!("STARTUP: Whitelist: {}", settings.whitelist_file.display());
    info!("STARTUP: Strategies: {:?}", settings.strategies);

    // PHASE 6: PID file
    #[cfg(unix)]
    let pid_file = {
        let path = pid_file_path();
        match write_pid_file(&path) {
            Ok(()) => Some(path),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                error!("{}", e);
                std::process::exit(1);
            }
            Err(e) if is_privileged() => {
                error!("Could not write PID file {}: {}", path.display(), e);
                std::process::exit(1);
            }
            Err(e) => {
                warn!("No PID file ({}): {}", path.display(), e);
                None
            }
        }
    };

    // PHASE 7: Build the loop
    let events = Arc::new(TracingEventSink);
    let platform = Platform::native();
    let monitor = Monitor::build(&settings, &platform, events)?;
    if monitor.degraded {
        warn!("STARTUP: Degraded mode, fingerprinted storage will be blocked until the host key is restored");
    }

    // PHASE 8: Start the loop thread
    let shutdown = Arc::new(ShutdownSignal::new());
    let loop_handle = monitor.spawn(Arc::clone(&shutdown))?;
    info!("STARTUP: PID {}, monitoring started", std::process::id());

    // PHASE 9: Run until signalled
    wait_for_shutdown_signal().await;

    // PHASE 10: Stop the loop; an in-flight cycle finishes first
    shutdown.request();
    match tokio::task::spawn_blocking(move || loop_handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!("Reconciliation thread panicked"),
        Err(e) => error!("Could not join reconciliation thread: {}", e),
    }

    // PHASE 11: Cleanup
    #[cfg(unix)]
    {
        if let Some(path) = pid_file {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove PID file: {}", e);
            }
        }
    }

    info!("SHUTDOWN: devguardd stopped");
    Ok(())
}
