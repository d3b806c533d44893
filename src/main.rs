use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use homeserver_backups::config::{self, Config};
use homeserver_backups::managers::{logging, restore};
use homeserver_backups::utils::restic::Restic;
use homeserver_backups::{BackupScheduler, Backups, RestoreOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "homeserver-backups")]
#[command(about = "Backup and restore for a home server's data, wrapping restic", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/homeserver-backups.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a pending restore, then back up on schedule until interrupted
    Daemon,

    /// Validate configuration file
    Validate,

    /// List registered repositories
    Repositories,

    /// Create a repository on external or network storage
    Create {
        /// Virtual location, e.g. /External/SanDisk
        path: String,

        /// Repository password (prompted for if omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Register a repository created by another installation
    Connect {
        /// Virtual location holding the repository
        path: String,

        /// Repository password (prompted for if omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Remove a repository from the registry, leaving its data in place
    Forget {
        repository: String,
    },

    /// Back up now to one repository
    Backup {
        repository: String,
    },

    /// List backups of one repository, or of all of them
    Snapshots {
        repository: Option<String>,
    },

    /// List the entries of a directory inside a backup
    Files {
        /// Backup id (<repository>:<snapshot>)
        backup: String,

        /// Directory relative to the data directory
        #[arg(long)]
        path: Option<String>,
    },

    /// Expose a backup under the backup root
    Mount {
        backup: String,
    },

    /// Remove a mounted backup
    Unmount {
        /// Directory name returned by `mount`
        name: String,
    },

    /// Manage paths under /Home left out of backups
    Ignore {
        #[command(subcommand)]
        action: IgnoreAction,
    },

    /// Show space used by a repository and left on its storage
    Size {
        repository: String,
    },

    /// Stage a backup to replace the live data on next start
    Restore {
        backup: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum IgnoreAction {
    List,
    Add { path: String },
    Remove { path: String },
}

impl Commands {
    /// Registry and ignore list edits work without the restic binary
    fn needs_restic(&self) -> bool {
        !matches!(
            self,
            Commands::Validate | Commands::Repositories | Commands::Forget { .. } | Commands::Ignore { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate = cli.command {
        logging::init_console_logging();
        return handle_validate(&cli.config);
    }

    let config = config::load_config(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;

    // Setup logging with file rotation (must keep guard alive)
    let logging_config = logging::LoggingConfig::from_global(&config.global);
    let _log_guard = logging::init_logging(&logging_config)?;

    let restic = Restic::new(
        config.global.restic_binary.clone(),
        config.global.cache_directory.clone(),
    );
    if cli.command.needs_restic() {
        if let Err(e) = restic.locate() {
            eprintln!("⚠️  restic not found: {:#}", e);
            eprintln!();
            eprintln!("Install restic or point global.restic_binary at it.");
            std::process::exit(1);
        }
    }

    if let Commands::Daemon = cli.command {
        return run_daemon(config).await;
    }

    let backups = Arc::new(Backups::from_config(&config));

    match cli.command {
        // Handled above
        Commands::Daemon | Commands::Validate => {}

        Commands::Repositories => {
            let repositories = backups.get_repositories().await?;
            if repositories.is_empty() {
                println!("No repositories registered");
            }
            for repository in repositories {
                let last = repository
                    .last_backup
                    .map(format_time)
                    .unwrap_or_else(|| "never".to_string());
                println!("{}  {}  (last backup: {})", repository.id, repository.path, last);
            }
        }

        Commands::Create { path, password } => {
            let password = read_password(password, true)?;
            let id = backups.create_repository(&path, &password).await?;
            println!("✓ Created repository {}", id);
        }

        Commands::Connect { path, password } => {
            let password = read_password(password, false)?;
            let id = backups.connect_to_existing_repository(&path, &password).await?;
            println!("✓ Connected repository {}", id);
        }

        Commands::Forget { repository } => {
            backups.forget_repository(&repository).await?;
            println!("✓ Forgot repository {}", repository);
        }

        Commands::Backup { repository } => {
            println!("Backing up to repository {}...", repository);
            backups.backup(&repository).await?;
            println!("✓ Backup completed successfully");
        }

        Commands::Snapshots { repository } => {
            let list = match repository {
                Some(id) => backups.list_backups(&id).await?,
                None => backups.list_all_backups().await?,
            };
            if list.is_empty() {
                println!("No backups found");
            }
            for backup in list {
                println!("{}  {}  {}", backup.id, format_time(backup.time), format_bytes(backup.size));
            }
        }

        Commands::Files { backup, path } => {
            for name in backups.list_backup_files(&backup, path.as_deref()).await? {
                println!("{}", name);
            }
        }

        Commands::Mount { backup } => {
            let name = backups.mount_backup(&backup).await?;
            println!("✓ Mounted at /Backups/{}", name);
        }

        Commands::Unmount { name } => {
            backups.unmount_backup(&name).await?;
            println!("✓ Unmounted {}", name);
        }

        Commands::Ignore { action } => match action {
            IgnoreAction::List => {
                for path in backups.ignore().ignored_paths().await? {
                    println!("{}", path);
                }
            }
            IgnoreAction::Add { path } => {
                backups.ignore().add_ignored_path(&path).await?;
                println!("✓ {} will be left out of backups", path);
            }
            IgnoreAction::Remove { path } => {
                backups.ignore().remove_ignored_path(&path).await?;
                println!("✓ {} will be backed up again", path);
            }
        },

        Commands::Size { repository } => {
            let size = backups.repository_size(&repository).await?;
            println!("Used:      {}", format_bytes(size.used));
            println!("Capacity:  {}", format_bytes(size.capacity));
            println!("Available: {}", format_bytes(size.available));
        }

        Commands::Restore { backup, yes } => {
            use dialoguer::Confirm;

            if !yes {
                println!("Restoring {} replaces all data on this server on the next start.", backup);
                let confirmed = Confirm::new()
                    .with_prompt("Continue?")
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Restore cancelled");
                    return Ok(());
                }
            }

            let orchestrator = RestoreOrchestrator::new(Arc::clone(&backups), config.restore.clone());
            orchestrator.restore(&backup).await?;
            println!("✓ Backup staged, it will be applied on the next start");
        }
    }

    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    let backups = Arc::new(Backups::from_config(&config));

    if restore::apply_pending_restore(backups.layout())? {
        info!("Started from restored data");
    }
    if restore::is_restore_first_start(backups.layout()) {
        info!("First start after a restore");
        restore::clear_first_start_flag(backups.layout())?;
    }

    backups.start().await;
    let scheduler = BackupScheduler::new(Arc::clone(&backups), config.schedule.to_scheduler_config());
    scheduler.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down");

    scheduler.stop().await;
    backups.stop().await;
    Ok(())
}

fn handle_validate(path: &Path) -> Result<()> {
    let config = config::load_config(path)?;
    println!("✓ Configuration is valid");
    println!("  Data directory: {:?}", config.global.data_directory);
    println!("  Backup interval: {} minutes", config.schedule.interval_minutes);
    println!(
        "  Alert after: {} hours without a backup",
        config.schedule.failure_threshold_hours
    );

    let restic = Restic::new(config.global.restic_binary.clone(), None);
    match restic.locate() {
        Ok(binary) => println!("  restic: {:?}", binary),
        Err(e) => warn!("restic not found: {:#}", e),
    }
    Ok(())
}

fn read_password(password: Option<String>, confirm: bool) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    let mut prompt = dialoguer::Password::new().with_prompt("Repository password");
    if confirm {
        prompt = prompt.with_confirmation("Confirm password", "Passwords do not match");
    }
    Ok(prompt.interact()?)
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
