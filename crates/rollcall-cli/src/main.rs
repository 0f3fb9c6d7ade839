use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use rollcall_core::imaging;
use rollcall_core::{RecognitionService, ServiceConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance engine")]
struct Cli {
    /// TOML config file (default: $ROLLCALL_CONFIG, if set)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image under an identity id
    Enroll {
        /// Identity id (letters, digits, '-', '_', '.')
        id: String,
        /// Image file (png, jpg, jpeg)
        image: PathBuf,
    },
    /// Identify the face in an image
    Recognize {
        image: PathBuf,
        /// Use the trained classifier when available
        #[arg(long)]
        deep: bool,
    },
    /// Train the classifier on the enrolled face crops
    Train {
        /// Build a fresh model instead of continuing from the active one
        #[arg(long)]
        force: bool,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity's encoding
    Remove { id: String },
    /// Show store and classifier status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())
        .context("failed to resolve configuration")?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration resolved");

    // Only enroll and recognize need the ONNX models up front.
    let service = match cli.command {
        Commands::Enroll { .. } | Commands::Recognize { .. } => {
            RecognitionService::from_config(&config)
        }
        _ => RecognitionService::open_lazy(&config),
    }
    .context("failed to start recognition service")?;

    match cli.command {
        Commands::Enroll { id, image } => {
            let image = read_image(&image)?;
            let record = service.enroll(&id, &image)?;
            print_json(&serde_json::json!({
                "identity_id": record.identity_id,
                "enrolled_at": record.enrolled_at,
                "source_crop_path": record.source_crop_path,
            }))?;
        }
        Commands::Recognize { image, deep } => {
            let image = read_image(&image)?;
            print_json(&service.recognize(&image, deep)?)?;
        }
        Commands::Train { force } => {
            print_json(&service.train(force)?)?;
        }
        Commands::List => {
            for id in service.identities() {
                println!("{id}");
            }
        }
        Commands::Remove { id } => {
            if service.remove(&id)? {
                println!("removed {id}");
            } else {
                anyhow::bail!("identity not enrolled: {id}");
            }
        }
        Commands::Status => {
            print_json(&service.status())?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<RgbImage> {
    imaging::open_image(path).with_context(|| format!("cannot read {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
