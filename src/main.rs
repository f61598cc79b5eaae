use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use batch_upload::core::StateStore;
use batch_upload::utils::{format_bytes, format_duration, format_speed, SpeedCalculator};
use batch_upload::{
    EventData,
    EventKind,
    FileInput,
    FileStatus,
    FileStore,
    HttpUploader,
    MemoryStore,
    RetryExecutor,
    RetryingTransport,
    Settings,
    UploadManager,
};

/// 用法: batch-upload [--config config.toml] <file>...
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1).peekable();
    let mut config_path = PathBuf::from("config.toml");
    if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        config_path = args.next().map(PathBuf::from).context("--config requires a path")?;
    }
    let paths: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let settings = if config_path.exists() {
        Settings::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Settings::default()
    };

    let store: Arc<dyn StateStore> = match &settings.store.dir {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };

    let executor = Arc::new(RetryExecutor::new(settings.retry.clone())?);
    let uploader = Arc::new(HttpUploader::new(&settings.http)?);
    let transport = Arc::new(RetryingTransport::new(uploader, executor));

    let handle = UploadManager::new(settings.upload.clone(), store);
    let manager = handle.manager.clone();

    let mut inputs = Vec::with_capacity(paths.len());
    for path in &paths {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        inputs.push(FileInput::new(name, guess_mime_type(path), data));
    }

    let added = manager.add_files(inputs).await?;
    for file in added.iter().filter(|file| file.status == FileStatus::Failed) {
        eprintln!("rejected {}: {}", file.name, file.error.as_deref().unwrap_or_default());
    }

    let mut events = manager.subscribe_events();
    let run = manager.start(transport).await?;

    let total_size = manager.batch().await?.total_size;
    let started = std::time::Instant::now();
    let printer = tokio::spawn({
        let manager = manager.clone();
        async move {
            let mut speed = SpeedCalculator::new(Duration::from_secs(5));
            loop {
                match events.recv().await {
                    Ok(event) => match event.kind {
                        EventKind::UploadProgress | EventKind::UploadComplete => {
                            let Ok(progress) = manager.overall_progress().await else {
                                break;
                            };
                            let sent = (progress / 100.0 * total_size as f64) as u64;
                            speed.add_sample(sent);
                            let eta = speed
                                .eta(total_size.saturating_sub(sent))
                                .map(format_duration)
                                .unwrap_or_else(|| "--".to_string());
                            print!(
                                "\r{:>6.2}%  {} / {}  {}  eta {}   ",
                                progress,
                                format_bytes(sent),
                                format_bytes(total_size),
                                format_speed(speed.speed()),
                                eta
                            );
                        }
                        EventKind::UploadError => {
                            if let Some(EventData::Error { message }) = event.data {
                                eprintln!("\nupload failed: {}", message);
                            }
                        }
                        _ => {}
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "progress display lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    let status = run.wait().await?;
    let batch = manager.batch().await?;
    println!(
        "\n{}: {} completed, {} failed in {}",
        status,
        batch.count(FileStatus::Completed),
        batch.count(FileStatus::Failed),
        format_duration(started.elapsed())
    );

    printer.abort();
    let _ = printer.await;
    drop(manager);
    handle.shutdown().await?;
    Ok(())
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
