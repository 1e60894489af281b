use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use log::{info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};
use tokio_util::sync::CancellationToken;

use gallery_stream::cache::keys::{gallery_id, parse_memory_key};
use gallery_stream::decode::EnqueueOutcome;
use gallery_stream::gallery::StreamRequest;
use gallery_stream::panic_handler;
use gallery_stream::services::GalleryServices;
use gallery_stream::settings::Settings;

/// Fetch a paginated gallery into memory, in order, with progress.
#[derive(Parser)]
#[command(name = "gallery-stream", version)]
struct Cli {
    /// Gallery URL; its hash names the cache keys
    gallery_url: String,

    /// File listing one page URL per line (`#` starts a comment)
    #[arg(long)]
    pages: PathBuf,

    /// Decode thumbnails for every delivered page
    #[arg(long)]
    thumbnails: bool,

    /// Settings file instead of the default config location
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Process-wide fetch limit
    #[arg(long)]
    global_concurrency: Option<usize>,

    /// Fetch limit per gallery
    #[arg(long)]
    per_session: Option<usize>,

    #[arg(long, default_value = "gallery-stream.log")]
    log_file: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from(path)?,
            None => Settings::load(),
        };
        if let Some(batch_size) = self.batch_size {
            settings.stream.batch_size = batch_size;
        }
        if let Some(global) = self.global_concurrency {
            settings.fetch.global_concurrency = Some(global);
        }
        if let Some(per_session) = self.per_session {
            settings.fetch.per_session = per_session;
        }
        Ok(settings.validated())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        cli.log_level,
        Config::default(),
        File::create(&cli.log_file)
            .with_context(|| format!("Failed to create log file {:?}", cli.log_file))?,
    )?;
    panic_handler::initialize_panic_handler();
    info!("Starting gallery-stream for {}", cli.gallery_url);

    let settings = cli.settings()?;
    let pages = read_pages(&cli.pages)?;
    let result = run(&cli, &settings, pages).await;

    if let Err(e) = &result {
        log::error!("Application error: {e:#}");
    }
    info!("Shutting down gallery-stream");
    result
}

async fn run(cli: &Cli, settings: &Settings, pages: Vec<String>) -> Result<()> {
    let services = GalleryServices::new(settings)?;
    let _sweeper = services.spawn_retention_sweeper();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let id = gallery_id(&cli.gallery_url);
    let request = StreamRequest::new(&id, pages)
        .with_batch_size(settings.stream.batch_size)
        .with_cancel(cancel.clone());

    let mut batches = services.stream(request);
    let mut delivered = 0;
    let mut total = 0;
    let mut queued_decodes = 0;
    while let Some(batch) = batches.next().await {
        delivered += batch.new_keys.len();
        total = batch.total;
        println!(
            "[{delivered}/{total}] +{} (resolved {})",
            batch.new_keys.len(),
            batch.completed
        );

        if cli.thumbnails {
            for key in &batch.new_keys {
                let Some((_, index)) = parse_memory_key(key) else {
                    continue;
                };
                if services.decoder.enqueue(index as u64, key, index, 0) == EnqueueOutcome::Queued {
                    queued_decodes += 1;
                }
            }
        }
    }

    if cancel.is_cancelled() {
        println!("Cancelled after {delivered}/{total} pages; run again to resume.");
        return Ok(());
    }

    if queued_decodes > 0 {
        let decoded = collect_decodes(&services, queued_decodes).await?;
        println!("Decoded {decoded}/{queued_decodes} thumbnails");
    }

    let bytes = services.bytes.usage();
    let thumbs = services.thumbnails.usage();
    println!(
        "{} {delivered}/{total} pages; byte cache {} entries / {} bytes; thumbnails {} / {} bytes",
        if delivered == total { "Complete:" } else { "Partial:" },
        bytes.entries,
        bytes.bytes,
        thumbs.entries,
        thumbs.bytes
    );
    services.shutdown();
    Ok(())
}

/// Wait for `expected` decode outcomes, giving up after a quiet period.
async fn collect_decodes(services: &GalleryServices, expected: usize) -> Result<usize> {
    let outcomes = services.decode_outcomes.clone();
    let decoded = tokio::task::spawn_blocking(move || {
        let mut decoded = 0;
        for _ in 0..expected {
            let Ok(outcome) = outcomes.recv_timeout(Duration::from_secs(30)) else {
                warn!("Timed out waiting for thumbnail decodes");
                break;
            };
            match outcome.result {
                Ok(_) => decoded += 1,
                Err(e) => warn!("Thumbnail for {} failed: {e}", outcome.source_key),
            }
        }
        decoded
    })
    .await
    .context("Decode collector task failed")?;
    Ok(decoded)
}

fn read_pages(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read page list {path:?}"))?;
    let pages: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if pages.is_empty() {
        bail!("Page list {path:?} is empty");
    }
    Ok(pages)
}
