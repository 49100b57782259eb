//! diskprep - partition planning and storage provisioning
//!
//! Prepares a disk for an OS installation: finds free space next to an
//! existing OS, creates EFI and root partitions, optionally encrypts the
//! root, and mounts a btrfs subvolume tree ready for the installer.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use diskprep::config::{PolicyKind, ProvisionConfig};
use diskprep::disk::detection::{find_foreign_efi, list_block_devices, WINDOWS_EFI_MARKER};
use diskprep::utils::audit::AuditLog;
use diskprep::utils::command::CommandRunner;
use diskprep::utils::error::ProvisionError;
use diskprep::utils::prompt::prompt_passphrase;
use diskprep::utils::signal;
use diskprep::Provisioner;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "diskprep")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run mode - show what would be done without making changes
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Write the JSON audit log of destructive commands to this file
    #[arg(long, global = true, env = "DISKPREP_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Automatic,
    Custom,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, encrypt, format and mount a disk
    Provision {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Target disk device (e.g., /dev/sda); starts the wizard
        #[arg(short, long)]
        device: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the partition plan for a disk without changing it
    Plan {
        /// Path to configuration file
        #[arg(short, long, conflicts_with = "device")]
        config: Option<String>,

        /// Target disk device
        #[arg(short, long, required_unless_present = "config")]
        device: Option<String>,

        /// Sizing policy
        #[arg(long, value_enum, default_value = "automatic")]
        policy: PolicyArg,

        /// EFI size for the custom policy (e.g. 512M)
        #[arg(long)]
        efi_size: Option<String>,

        /// Root size for the custom policy (default: remaining space)
        #[arg(long)]
        root_size: Option<String>,

        /// Partition numbers that would be deleted first
        #[arg(long = "delete", value_delimiter = ',')]
        delete: Vec<u32>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available disks
    ListDisks {
        /// Show all block devices, not just suitable targets
        #[arg(short, long)]
        all: bool,
    },

    /// Look for another OS's EFI boot files on all FAT volumes
    ScanEfi,

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "diskprep.toml")]
        output: String,
    },

    /// Unmount a previous run's tree and close its LUKS mapping
    Cleanup {
        /// Mount root of the previous run
        #[arg(short, long, default_value = "/mnt")]
        mount_root: String,

        /// Device-mapper name to close
        #[arg(long, default_value = "cryptroot")]
        mapper: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(ProvisionError::NotRoot.into());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dry_run = cli.dry_run;
    if dry_run {
        info!("Running in dry-run mode - no changes will be made");
    }
    let audit_path = cli.audit_log.as_deref();

    match cli.command {
        Some(Commands::Provision {
            config,
            device,
            yes,
        }) => {
            cmd_provision(config, device, yes, dry_run, audit_path)?;
        }
        Some(Commands::Plan {
            config,
            device,
            policy,
            efi_size,
            root_size,
            delete,
            json,
        }) => {
            let config = match (config, device) {
                (Some(path), _) => ProvisionConfig::from_file(&path)?,
                (None, Some(device)) => {
                    let mut config = ProvisionConfig::for_device(&device);
                    config.layout.policy = match policy {
                        PolicyArg::Automatic => PolicyKind::Automatic,
                        PolicyArg::Custom => PolicyKind::Custom,
                    };
                    config.layout.efi_size = efi_size;
                    config.layout.root_size = root_size;
                    config.disk.delete_partitions = delete;
                    config
                }
                (None, None) => anyhow::bail!("either --config or --device is required"),
            };
            cmd_plan(config, json)?;
        }
        Some(Commands::ListDisks { all }) => {
            cmd_list_disks(all)?;
        }
        Some(Commands::ScanEfi) => {
            cmd_scan_efi()?;
        }
        Some(Commands::Validate { config }) => {
            cmd_validate(&config)?;
        }
        Some(Commands::GenerateConfig { output }) => {
            cmd_generate_config(&output)?;
        }
        Some(Commands::Cleanup { mount_root, mapper }) => {
            cmd_cleanup(&mount_root, mapper.as_deref(), dry_run, audit_path)?;
        }
        None => {
            // Default: run interactive wizard
            cmd_provision(None, None, false, dry_run, audit_path)?;
        }
    }

    Ok(())
}

fn write_audit(log: &AuditLog, path: Option<&Path>) {
    if let Some(path) = path {
        match log.write_to(path) {
            Ok(()) => info!("Audit log written to {}", path.display()),
            Err(e) => warn!("Could not write audit log to {}: {}", path.display(), e),
        }
    }
}

fn cmd_provision(
    config_path: Option<String>,
    device: Option<String>,
    yes: bool,
    dry_run: bool,
    audit_path: Option<&Path>,
) -> Result<()> {
    require_root()?;
    signal::install_signal_handlers();

    // Load or create configuration
    let mut config = if let Some(path) = config_path {
        info!("Loading configuration from {}", path);
        ProvisionConfig::from_file(&path)?
    } else {
        info!("Starting interactive configuration wizard");
        ProvisionConfig::from_wizard(&CommandRunner::new(true), device)?
    };

    if config.encryption.enabled && config.encryption.passphrase.is_none() && !dry_run {
        config.encryption.passphrase = Some(prompt_passphrase(config.encryption.passphrase_attempts)?);
    }

    // Validate configuration
    config.validate()?;

    let provisioner = Provisioner::new(config, CommandRunner::new(dry_run)).with_skip_confirm(yes);
    if dry_run {
        let outcome = provisioner.rehearse();
        write_audit(&provisioner.audit_log(), audit_path);
        outcome?;
        return Ok(());
    }

    let outcome = provisioner.run();
    let log = provisioner.audit_log();
    println!("\nActions taken:\n{}", log.summary());
    write_audit(&log, audit_path);

    match outcome {
        Ok(storage) => {
            storage.print();
            println!("\n{} Storage is mounted and ready", "✓".green());
            Ok(())
        }
        Err(e) => {
            eprintln!("\n{} {}", "✗".red(), e);
            if signal::is_interrupted() {
                signal::reraise();
            }
            Err(e.into())
        }
    }
}

fn cmd_plan(config: ProvisionConfig, json: bool) -> Result<()> {
    require_root()?;

    let provisioner = Provisioner::new(config, CommandRunner::new(true));
    let preview = provisioner.preview()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
    } else {
        preview.print();
    }
    Ok(())
}

fn cmd_list_disks(all: bool) -> Result<()> {
    let devices = list_block_devices(all)?;

    if devices.is_empty() {
        println!("No suitable disks found.");
        return Ok(());
    }

    println!("{:<15} {:>10} {:<20} {}", "DEVICE", "SIZE", "MODEL", "TYPE");
    println!("{}", "-".repeat(60));

    for dev in devices {
        println!(
            "{:<15} {:>10} {:<20} {}",
            dev.path,
            dev.size_human(),
            dev.model.as_deref().unwrap_or("-"),
            dev.device_type
        );
    }

    Ok(())
}

fn cmd_scan_efi() -> Result<()> {
    require_root()?;

    let cmd = CommandRunner::new(false);
    match find_foreign_efi(&cmd, WINDOWS_EFI_MARKER) {
        Ok(Some(device)) => println!("Windows boot manager found on {}", device.bold()),
        Ok(None) => println!("No other operating system's EFI files found"),
        Err(e) => {
            warn!("{}", e);
            println!("Scan failed; treating as no other operating system");
        }
    }
    Ok(())
}

fn cmd_validate(config_path: &str) -> Result<()> {
    let config = ProvisionConfig::from_file(config_path)?;
    config.validate()?;
    println!("{} Configuration is valid", "✓".green());
    Ok(())
}

fn cmd_generate_config(output: &str) -> Result<()> {
    let content = ProvisionConfig::sample().to_toml()?;
    std::fs::write(output, content)?;
    println!("{} Sample configuration written to {}", "✓".green(), output);
    Ok(())
}

fn cmd_cleanup(
    mount_root: &str,
    mapper: Option<&str>,
    dry_run: bool,
    audit_path: Option<&Path>,
) -> Result<()> {
    use diskprep::cleanup::Cleaner;

    require_root()?;

    let cmd = CommandRunner::new(dry_run);
    Cleaner::new(&cmd).cleanup(mount_root, mapper)?;
    write_audit(&cmd.audit_log(), audit_path);

    Ok(())
}
