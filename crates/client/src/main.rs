//! Command-line client for ferry.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ferry_client::{ClientError, FerryClient, RetryPolicy};
use ferry_core::{ErrorKind, OpenUploadResponse};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Send and receive files through a ferry server")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server URL
    #[arg(long, env = "FERRY_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Retries for transient failures
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file and print its share code.
    ///
    /// Progress is recorded next to the file so an interrupted upload
    /// continues where it stopped when run again.
    Upload {
        path: PathBuf,
        /// MIME type to record
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },
    /// Download a shared file, resuming a partial download
    Download {
        share_code: String,
        /// Output file (default: the uploaded file name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the progress of an upload
    Status { upload_id: String },
    /// Cancel an upload
    Cancel { upload_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let Cli { api, command } = Cli::parse();
    let client = FerryClient::connect(&api.server)
        .context("invalid server URL")?
        .with_retry(RetryPolicy {
            max_retries: api.retries,
            ..RetryPolicy::default()
        });

    let result = run(&client, command).await;
    if let Err(e) = &result
        && let Some(id) = e
            .downcast_ref::<ClientError>()
            .and_then(ClientError::correlation_id)
    {
        eprintln!("Server error reference: {id}");
    }
    result
}

async fn run(client: &FerryClient, command: Commands) -> Result<()> {
    match command {
        Commands::Upload { path, mime } => handle_upload(client, &path, &mime).await,
        Commands::Download { share_code, output } => {
            handle_download(client, &share_code, output).await
        }
        Commands::Status { upload_id } => {
            let status = client.status(&upload_id).await?;
            println!("State: {:?}", status.state);
            println!("Chunks received: {}", status.cursor);
            println!("Bytes received: {}", format_bytes(status.bytes_received));
            Ok(())
        }
        Commands::Cancel { upload_id } => {
            client.cancel(&upload_id).await?;
            println!("Upload {upload_id} cancelled");
            Ok(())
        }
    }
}

/// Sidecar file holding the open response of an upload in progress.
fn state_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".ferry");
    PathBuf::from(name)
}

async fn open_source(path: &Path) -> Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let total_size = file.metadata().await?.len();
    Ok((file, total_size))
}

async fn handle_upload(client: &FerryClient, path: &Path, mime: &str) -> Result<()> {
    let state_file = state_path(path);
    let previous = match tokio::fs::read(&state_file).await {
        Ok(bytes) => serde_json::from_slice::<OpenUploadResponse>(&bytes).ok(),
        Err(_) => None,
    };

    let mut outcome = None;
    if let Some(opened) = previous {
        println!("Resuming upload {}", opened.upload_id);
        let (file, total_size) = open_source(path).await?;
        match client.resume_upload(&opened, total_size, file).await {
            Ok(done) => outcome = Some(done),
            Err(e) if matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::Expired | ErrorKind::Cancelled
            ) =>
            {
                println!("Previous upload is gone ({e}), starting over");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let outcome = match outcome {
        Some(done) => done,
        None => {
            let (file, total_size) = open_source(path).await?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("file name is not valid UTF-8")?;
            let opened = client.open(filename, mime, total_size).await?;
            tokio::fs::write(&state_file, serde_json::to_vec(&opened)?)
                .await
                .with_context(|| format!("failed to write {}", state_file.display()))?;
            println!(
                "Uploading {} ({}, {} chunks)",
                path.display(),
                format_bytes(total_size),
                opened.chunks_expected
            );
            client.resume_upload(&opened, total_size, file).await?
        }
    };

    if let Err(e) = tokio::fs::remove_file(&state_file).await {
        tracing::warn!(path = %state_file.display(), error = %e, "Failed to remove upload state");
    }
    println!("Share code: {}", outcome.sealed.share_code);
    println!("Expires at: {}", outcome.sealed.expires_at);
    Ok(())
}

async fn handle_download(
    client: &FerryClient,
    share_code: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let (path, outcome) = match output {
        Some(path) => {
            let outcome = client.download_file(share_code, &path).await?;
            (path, outcome)
        }
        None => client.download_into(share_code, Path::new(".")).await?,
    };
    println!(
        "Saved {} ({})",
        path.display(),
        format_bytes(outcome.total_size)
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_path() {
        assert_eq!(
            state_path(Path::new("/tmp/video.mp4")),
            PathBuf::from("/tmp/video.mp4.ferry")
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(3 * 1024 * 1024 + 512 * 1024), "3.50 MB");
    }
}
