mod cli;
mod files;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use echo_ft_protocol::PollStatus;
use echo_ft_receiver::{
    ListenerSlot, ProcessOutcome, ReceiverConfig, UploadListenerBridge, UploadProcessor, monitor,
};
use echo_ft_transfer::{TransferRegistry, generate_id};
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use crate::files::{DirectoryWriter, FilePartSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting echo-ft-copy");

    let args = Args::parse();
    let config = load_config(&args);
    config.validate().context("invalid receiver config")?;

    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("cannot create {}", args.dest.display()))?;
    let source = FilePartSource::new(args.files.clone()).context("cannot read input files")?;

    let registry = Arc::new(TransferRegistry::new());
    let processor = Arc::new(UploadProcessor::new(config));
    let writer = Arc::new(DirectoryWriter::new(&args.dest));
    let slot = Arc::new(ListenerSlot::new());
    slot.set(writer.clone())?;
    let bridge = UploadListenerBridge::new(slot);

    let id = generate_id();
    let group = registry.create_group(&id);
    bridge.attach(&group);
    tracing::info!(
        group = %id,
        files = args.files.len(),
        bandwidth = processor.bandwidth(),
        "upload group created"
    );

    let mut upload = {
        let processor = Arc::clone(&processor);
        let group = Arc::clone(&group);
        let mut source = source;
        tokio::task::spawn_blocking(move || processor.process(&group, &mut source, None))
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_ms.max(1)));
    let outcome = loop {
        tokio::select! {
            joined = &mut upload => break joined.context("upload task panicked")??,
            _ = ticker.tick() => log_poll(monitor::process_request(&registry, Some(&id), None)),
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(group = %id, "interrupt received, canceling upload");
                monitor::process_request(&registry, Some(&id), Some("cancel"));
                break upload.await.context("upload task panicked")??;
            }
        }
    };

    match outcome {
        ProcessOutcome::Completed { files } => {
            let delivered = bridge.finish(&registry, &id);
            tracing::info!(files, delivered, written = writer.written(), "upload finished");
            if writer.errors() > 0 {
                bail!("{} file(s) could not be stored", writer.errors());
            }
            Ok(())
        }
        ProcessOutcome::Canceled { files } => {
            registry.remove_group(&id);
            bail!("upload canceled after {files} file(s)")
        }
        ProcessOutcome::Failed { reason } => {
            registry.remove_group(&id);
            bail!("upload failed: {reason:?}")
        }
    }
}

fn load_config(args: &Args) -> ReceiverConfig {
    let mut config = match &args.config {
        Some(path) => ReceiverConfig::load(path).unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to load config, using defaults"
            );
            ReceiverConfig::default()
        }),
        None => ReceiverConfig::default(),
    };
    if let Some(bandwidth) = args.bandwidth {
        config.bandwidth = bandwidth;
    }
    if let Some(max_size) = args.max_size {
        config.max_upload_size = max_size;
    }
    config
}

fn log_poll(status: PollStatus) {
    if let PollStatus::InProgress { transferred, total } = status {
        match total {
            Some(total) if total > 0 => tracing::info!(
                transferred,
                total,
                percent = transferred * 100 / total,
                "uploading"
            ),
            _ => tracing::info!(transferred, "uploading"),
        }
    }
}
