//! Command Line Interface
//!
//! Inventory, registration, verification and whitelist maintenance.

use anyhow::{anyhow, bail, Context as _};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dg_core::constants::paths;
use dg_core::{
    CanonicalDeviceIdentity, DeviceRegistry, GuardSettings, HostKey, JsonWhitelist, Platform,
    RegistrationRequest, RegistrationResult, TracingEventSink, TrustEngine, VolumeRef,
};

#[derive(Parser)]
#[command(name = "devguard")]
#[command(version)]
#[command(about = "DevGuard - removable-device whitelist administration")]
#[command(long_about = "DevGuard - removable-device whitelist administration

Registers USB devices with the whitelist enforced by devguardd. Storage
media registered with --volume are fingerprinted and receive a marker
signed by this host's key.

EXAMPLES:
    devguard devices                          List connected devices
    devguard register VID_0781&PID_5591&SN_4C530001234 --name Backup --volume /media/stick
    devguard verify VID_0781&PID_5591&SN_4C530001234 --volume /media/stick
    devguard whitelist list --json
    devguard remove VID_046D&PID_C077&SN_NO_SERIAL

ENVIRONMENT VARIABLES:
    DEVGUARD_LOG=debug       Enable debug logging
    DEVGUARD_CONFIG_DIR      Configuration directory

FILES:
    <config>/settings.json   Guard settings
    <config>/whitelist.json  Registered devices
    <config>/host_key.pem    Host signing key")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration directory (default: DEVGUARD_CONFIG_DIR or the system location)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected USB devices with their whitelist status
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Whitelist maintenance
    #[command(subcommand, about = "List, export or clear the whitelist")]
    Whitelist(WhitelistCommands),

    /// Register a device
    Register {
        /// Canonical identity, e.g. VID_0781&PID_5591&SN_4C530001234
        id: String,
        /// Friendly name
        #[arg(long)]
        name: String,
        /// Mount point of a storage device; omit for peripherals
        #[arg(long, value_name = "PATH")]
        volume: Option<PathBuf>,
        /// Replace an existing registration and re-create the marker
        #[arg(long)]
        force: bool,
    },

    /// Check a mounted medium against its registration
    Verify {
        id: String,
        #[arg(long, value_name = "PATH")]
        volume: PathBuf,
    },

    /// Remove a device from the whitelist
    Remove { id: String },

    /// Show the physical descriptor and fingerprint of a mounted medium
    Fingerprint {
        #[arg(long, value_name = "PATH")]
        volume: PathBuf,
    },

    /// Host key diagnostics
    #[command(subcommand, about = "Inspect the host signing key")]
    Key(KeyCommands),
}

#[derive(Subcommand)]
pub enum WhitelistCommands {
    /// List registered devices
    List {
        #[arg(long)]
        json: bool,
    },
    /// Write all entries to a JSON file
    Export { file: PathBuf },
    /// Remove every entry
    Clear {
        /// Confirm
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Print key location and public key
    Show,
}

// ============================================================================
// Context
// ============================================================================

struct Context {
    settings: GuardSettings,
}

impl Context {
    fn load(config_dir: Option<&Path>) -> anyhow::Result<Self> {
        let dir = config_dir.map(Path::to_path_buf).unwrap_or_else(paths::config_dir);
        let settings = GuardSettings::load(&dir)
            .with_context(|| format!("loading settings from {}", dir.display()))?;
        Ok(Self { settings })
    }

    fn whitelist(&self) -> anyhow::Result<Arc<JsonWhitelist>> {
        Ok(Arc::new(JsonWhitelist::open(&self.settings.whitelist_file)?))
    }

    /// Registration creates the host key on first use; everything else only reads it
    fn registry(&self, platform: &Platform, create_key: bool) -> anyhow::Result<DeviceRegistry> {
        let key = if create_key {
            Some(HostKey::manage(&self.settings.host_key_file)?)
        } else {
            self.existing_key()?
        };
        let trust = TrustEngine::new(key, platform.inspector.clone(), Arc::new(TracingEventSink));
        Ok(DeviceRegistry::new(self.whitelist()?, Arc::new(trust)))
    }

    fn existing_key(&self) -> anyhow::Result<Option<HostKey>> {
        if !self.settings.host_key_file.exists() {
            return Ok(None);
        }
        Ok(Some(HostKey::load(&self.settings.host_key_file)?))
    }
}

fn parse_id(id: &str) -> anyhow::Result<CanonicalDeviceIdentity> {
    id.parse()
        .map_err(|e| anyhow!("{} (expected VID_xxxx&PID_xxxx&SN_serial)", e))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// CLI Execution
// ============================================================================

pub fn run_cli(cli: &Cli) -> anyhow::Result<()> {
    let ctx = Context::load(cli.config_dir.as_deref())?;
    execute_command(&ctx, &Platform::native(), &cli.command)
}

fn execute_command(ctx: &Context, platform: &Platform, cmd: &Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Devices { json } => cmd_devices(ctx, platform, *json),
        Commands::Whitelist(sub) => cmd_whitelist(ctx, sub),
        Commands::Register {
            id,
            name,
            volume,
            force,
        } => cmd_register(ctx, platform, id, name, volume.as_deref(), *force),
        Commands::Verify { id, volume } => cmd_verify(ctx, platform, id, volume),
        Commands::Remove { id } => cmd_remove(ctx, platform, id),
        Commands::Fingerprint { volume } => cmd_fingerprint(ctx, platform, volume),
        Commands::Key(sub) => cmd_key(ctx, sub),
    }
}

// ============================================================================
// Device Commands
// ============================================================================

fn cmd_devices(ctx: &Context, platform: &Platform, json: bool) -> anyhow::Result<()> {
    let registry = ctx.registry(platform, false)?;
    let devices = registry.inventory(platform.enumerator.as_ref())?;

    if json {
        return print_json(&devices);
    }

    println!("Connected Devices ({}):", devices.len());
    for device in &devices {
        let status = match (device.is_registered, device.is_fingerprinted) {
            (true, true) => "registered, fingerprinted",
            (true, false) => "registered",
            (false, _) => "NOT registered",
        };
        println!("  {} [{}] {}", device.identity, device.class, status);
        println!("      Caption: {}", device.caption);
        if let Some(name) = &device.friendly_name {
            println!("      Name: {}", name);
        }
        if let Some(volume) = &device.volume {
            println!("      Volume: {}", volume);
        }
    }
    Ok(())
}

fn cmd_register(
    ctx: &Context,
    platform: &Platform,
    id: &str,
    name: &str,
    volume: Option<&Path>,
    force: bool,
) -> anyhow::Result<()> {
    let request = RegistrationRequest {
        identity: parse_id(id)?,
        friendly_name: name.to_string(),
        volume: volume.map(VolumeRef::new),
    };
    let registry = ctx.registry(platform, volume.is_some())?;

    let result = if force {
        registry.reregister(request)?
    } else {
        registry.register(request)?
    };

    match result {
        RegistrationResult::Registered(entry) => {
            println!("Registered {} as \"{}\"", entry.canonical_id, entry.friendly_name);
            if let Some(fp) = &entry.structural_fingerprint {
                println!("  Fingerprint: {}", fp);
            }
        }
        RegistrationResult::AlreadyRegistered(entry) => {
            println!(
                "{} is already registered as \"{}\" (use --force to re-register)",
                entry.canonical_id, entry.friendly_name
            );
        }
    }
    Ok(())
}

fn cmd_verify(ctx: &Context, platform: &Platform, id: &str, volume: &Path) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let registry = ctx.registry(platform, false)?;
    let outcome = registry.verify(&id, &VolumeRef::new(volume))?;

    if !outcome.is_verified() {
        bail!("{} failed verification: {}", id, outcome);
    }
    println!("{}: {}", id, outcome);
    Ok(())
}

fn cmd_remove(ctx: &Context, platform: &Platform, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let registry = ctx.registry(platform, false)?;
    if !registry.remove(&id)? {
        bail!("{} is not registered", id);
    }
    println!("Removed {}", id);
    Ok(())
}

fn cmd_fingerprint(ctx: &Context, platform: &Platform, volume: &Path) -> anyhow::Result<()> {
    let registry = ctx.registry(platform, false)?;
    let volume = VolumeRef::new(volume);
    let descriptor = registry.trust().physical_descriptor(&volume)?;

    println!("Volume:      {}", volume);
    println!("Model:       {}", descriptor.model);
    println!("Size:        {} bytes", descriptor.size_bytes);
    println!("Signature:   {}", descriptor.signature.as_deref().unwrap_or("none"));
    println!("Fingerprint: {}", descriptor.fingerprint());
    Ok(())
}

// ============================================================================
// Whitelist Commands
// ============================================================================

fn cmd_whitelist(ctx: &Context, cmd: &WhitelistCommands) -> anyhow::Result<()> {
    let whitelist = ctx.whitelist()?;
    match cmd {
        WhitelistCommands::List { json } => {
            let entries = dg_core::Whitelist::list(whitelist.as_ref())?;
            if *json {
                return print_json(&entries);
            }
            println!("Whitelist ({}):", entries.len());
            for entry in &entries {
                let mode = if entry.requires_verification() {
                    "fingerprinted"
                } else {
                    "identity only"
                };
                println!("  {} \"{}\" [{}, {}]", entry.canonical_id, entry.friendly_name, entry.device_class, mode);
                println!("      Registered: {}", entry.registered_at.to_rfc3339());
            }
        }
        WhitelistCommands::Export { file } => {
            let count = whitelist.export(file)?;
            println!("Exported {} entries to {}", count, file.display());
        }
        WhitelistCommands::Clear { yes } => {
            if !yes {
                eprintln!("This will remove every registered device. Use --yes to confirm.");
                return Ok(());
            }
            let removed = whitelist.clear()?;
            println!("Removed {} entries", removed);
        }
    }
    Ok(())
}

// ============================================================================
// Key Commands
// ============================================================================

fn cmd_key(ctx: &Context, cmd: &KeyCommands) -> anyhow::Result<()> {
    match cmd {
        KeyCommands::Show => match ctx.existing_key()? {
            Some(key) => {
                println!("Path:       {}", key.path().display());
                println!("Public key: {}", key.public_key_hex());
            }
            None => {
                println!("No host key at {}", ctx.settings.host_key_file.display());
                println!("One is generated by devguardd or the first storage registration.");
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use dg_core::platform::UnsupportedPlatform;
    use dg_core::Whitelist;
    use tempfile::TempDir;

    const MOUSE: &str = "VID_046D&PID_C077&SN_NO_SERIAL";

    fn ctx(dir: &TempDir) -> Context {
        Context::load(Some(dir.path())).unwrap()
    }

    fn run(dir: &TempDir, args: &[&str]) -> anyhow::Result<()> {
        let mut argv = vec!["devguard"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        execute_command(&ctx(dir), &UnsupportedPlatform::platform(), &cli.command)
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn register_requires_name() {
        assert!(Cli::try_parse_from(["devguard", "register", MOUSE]).is_err());
    }

    #[test]
    fn global_config_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["devguard", "whitelist", "list", "--config-dir", "/tmp/x"]).unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn register_list_remove_peripheral() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["register", MOUSE, "--name", "Office mouse"]).unwrap();

        let whitelist = ctx(&dir).whitelist().unwrap();
        let entries = whitelist.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friendly_name, "Office mouse");
        // Peripherals never need the host key.
        assert!(!dir.path().join("host_key.pem").exists());

        run(&dir, &["remove", MOUSE]).unwrap();
        assert!(run(&dir, &["remove", MOUSE]).is_err());
    }

    #[test]
    fn malformed_identity_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(run(&dir, &["remove", r"USB\VID_046D&PID_C077"]).is_err());
    }

    #[test]
    fn clear_needs_confirmation() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["register", MOUSE, "--name", "mouse"]).unwrap();

        run(&dir, &["whitelist", "clear"]).unwrap();
        assert_eq!(ctx(&dir).whitelist().unwrap().list().unwrap().len(), 1);

        run(&dir, &["whitelist", "clear", "--yes"]).unwrap();
        assert!(ctx(&dir).whitelist().unwrap().list().unwrap().is_empty());
    }

    #[test]
    fn export_writes_json_array() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["register", MOUSE, "--name", "mouse"]).unwrap();

        let out = dir.path().join("export.json");
        run(&dir, &["whitelist", "export", out.to_str().unwrap()]).unwrap();
        let exported: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(exported.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn verify_unregistered_fails() {
        let dir = TempDir::new().unwrap();
        let medium = TempDir::new().unwrap();
        assert!(run(&dir, &["verify", MOUSE, "--volume", medium.path().to_str().unwrap()]).is_err());
    }

    #[test]
    fn key_show_without_key_succeeds() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["key", "show"]).unwrap();
        assert!(!dir.path().join("host_key.pem").exists());
    }
}
