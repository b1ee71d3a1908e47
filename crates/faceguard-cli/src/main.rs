use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceguard::shell::{export_file_name, read_export_file};
use faceguard::{GuardConfig, IdentityStore};
use faceguard_core::format_file_size;
use faceguard_hw::V4lCamera;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceguard", about = "FaceGuard identity gallery administration")]
struct Cli {
    /// TOML config file; FACEGUARD_* environment variables still apply
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled users
    List,
    /// Delete an enrolled user
    Delete {
        /// User label
        label: String,
    },
    /// Delete every enrolled user
    Clear,
    /// Export enrolled users to faceguard-users-YYYY-MM-DD.json
    Export {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Replace enrolled users with the contents of an export file
    Import {
        /// Export file to read
        file: PathBuf,
    },
    /// Show configuration and store status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GuardConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GuardConfig::from_env(),
    };

    run(cli.command, &config).await
}

async fn open_store(config: &GuardConfig) -> Result<IdentityStore> {
    IdentityStore::initialize(&config.store_config())
        .await
        .context("failed to open identity store")
}

async fn run(command: Commands, config: &GuardConfig) -> Result<()> {
    match command {
        Commands::List => {
            let store = open_store(config).await?;
            let mut users = store.list_identities().await?;
            if users.is_empty() {
                println!("No users enrolled");
            }
            users.sort_by(|a, b| a.label.cmp(&b.label));
            for user in users {
                println!("{}  {} samples", user.label, user.sample_count());
            }
        }
        Commands::Delete { label } => {
            let store = open_store(config).await?;
            if store.delete_identity(&label).await? {
                println!("Deleted user {label}");
            } else {
                println!("No user named {label}");
            }
        }
        Commands::Clear => {
            open_store(config).await?.clear_all().await?;
            println!("All users cleared");
        }
        Commands::Export { out } => {
            let data = open_store(config).await?.export_snapshot().await?;
            let json = serde_json::to_string_pretty(&data)?;
            let path = out.join(export_file_name(chrono::Utc::now().date_naive()));
            tokio::fs::write(&path, &json)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "Exported {} users ({}) to {}",
                data.users.len(),
                format_file_size(json.len() as u64),
                path.display()
            );
        }
        Commands::Import { file } => {
            let data = read_export_file(&file)
                .await
                .context("Import failed. Please check file format.")?;
            open_store(config).await?.import_snapshot(&data).await?;
            println!("Imported {} users", data.users.len());
        }
        Commands::Status => {
            let store = open_store(config).await?;
            let users = store.list_identities().await?;
            let samples: usize = users.iter().map(|u| u.sample_count()).sum();
            println!("store:       {} ({})", store.location().display(), store.backend());
            println!("users:       {} ({samples} samples)", users.len());
            println!("threshold:   {}", config.threshold);
            println!("fps:         {}", config.fps);
            println!("max faces:   {}", config.max_faces);
            println!("models:      {}", config.model_dir.display());
            println!(
                "camera:      {}",
                config.camera_device.as_deref().unwrap_or("/dev/video0")
            );
        }
        Commands::Devices => print_devices(),
    }

    Ok(())
}

fn print_devices() {
    let devices = V4lCamera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
}
