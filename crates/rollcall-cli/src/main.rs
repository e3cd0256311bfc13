use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::ImageInput;
use rollcall_engine::{Engine, EngineConfig};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment and attendance check-in")]
struct Cli {
    /// TOML config file; ROLLCALL_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) an identity from a photo with exactly one face
    Enroll {
        /// Identity key: letters, digits, '-' or '_'
        key: String,
        /// Photo file (PNG, JPEG or GIF)
        image: PathBuf,
        /// Display name recorded in the identity directory
        #[arg(short, long)]
        name: Option<String>,
        /// Treat IMAGE as a text file holding a data URI
        #[arg(long)]
        data_uri: bool,
    },
    /// Recognize the primary face in a photo and record attendance
    Recognize {
        image: PathBuf,
        /// Attendance date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        data_uri: bool,
    },
    /// Remove an identity's signature, photo and attendance history
    Remove { key: String },
    /// List enrolled identity keys
    List,
    /// Show the attendance register for a day
    Attendance {
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Show configuration and gallery size
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");
    let handle = Engine::initialize(config)
        .context("initializing engine")?
        .into_handle();

    match cli.command {
        Commands::Enroll {
            key,
            image,
            name,
            data_uri,
        } => {
            let input = read_image(&image, data_uri)?;
            let record = handle
                .enroll(key.clone(), name, input)
                .await
                .with_context(|| format!("enrolling {key}"))?;
            print_json(&record)?;
        }
        Commands::Recognize {
            image,
            date,
            data_uri,
        } => {
            let input = read_image(&image, data_uri)?;
            let outcome = handle
                .recognize(input, date.unwrap_or_else(today))
                .await
                .context("recognizing face")?;
            print_json(&outcome)?;
        }
        Commands::Remove { key } => {
            let outcome = handle
                .remove(key.clone())
                .await
                .with_context(|| format!("removing {key}"))?;
            print_json(&outcome)?;
        }
        Commands::List => {
            print_json(&handle.enrolled().await?)?;
        }
        Commands::Attendance { date } => {
            let events = handle.attendance_on(date.unwrap_or_else(today)).await?;
            print_json(&events)?;
        }
        Commands::Status => {
            print_json(&handle.status().await?)?;
        }
    }

    Ok(())
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn read_image(path: &Path, data_uri: bool) -> Result<ImageInput> {
    if data_uri {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading data URI from {}", path.display()))?;
        return Ok(ImageInput::DataUri(text));
    }

    let bytes =
        std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    Ok(ImageInput::Upload {
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        bytes,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
