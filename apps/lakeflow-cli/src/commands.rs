use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use lakeflow_store::LocalPathStore;
use lakeflow_transfer::{
    DownloadOptions, FileTransferClient, ProgressCallback, ProgressEvent, TransferConfig,
    UploadOptions, progress_callback,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Args, Command};

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransferConfig::default(),
    };
    config.validate()?;

    if let Command::Config = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(
        LocalPathStore::open(&args.root)
            .with_context(|| format!("opening store at {}", args.root.display()))?,
    );
    let cancel = cancel_on_ctrl_c();

    match args.command {
        Command::Upload {
            source,
            object,
            block_size,
            concurrency,
            overwrite,
        } => {
            let client = FileTransferClient::new(store, &object).with_config(config)?;
            let mut options = UploadOptions::default()
                .with_overwrite(overwrite)
                .with_cancel(cancel)
                .with_progress(progress_logger("upload"));
            options.block_size = block_size;
            options.max_concurrency = concurrency;

            let info = client
                .upload_file(&source, options)
                .await
                .with_context(|| format!("uploading {} to {object}", source.display()))?;
            info!(
                object = %object,
                length = info.content_length,
                etag = %info.etag,
                "uploaded"
            );
        }
        Command::Download {
            object,
            dest,
            offset,
            length,
            verify,
            retries,
            overwrite,
        } => {
            let client = FileTransferClient::new(store, &object).with_config(config)?;
            let mut options = DownloadOptions::default()
                .with_verify_hash(verify)
                .with_cancel(cancel)
                .with_progress(progress_logger("download"));
            if let Some(length) = length {
                options = options.with_range(offset.unwrap_or(0), length)?;
            }
            options.retry_budget = retries;

            let props = client
                .download_to_file(&dest, overwrite, options)
                .await
                .with_context(|| format!("downloading {object} to {}", dest.display()))?;
            info!(
                object = %object,
                dest = %dest.display(),
                etag = %props.etag,
                "downloaded"
            );
        }
        Command::Cat { object } => {
            let client = FileTransferClient::new(store, &object).with_config(config)?;
            let mut stdout = tokio::io::stdout();
            client
                .download_to(&mut stdout, DownloadOptions::default().with_cancel(cancel))
                .await
                .with_context(|| format!("reading {object}"))?;
        }
        Command::Config => {}
    }
    Ok(())
}

/// Cancels the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, stopping transfer");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
    cancel
}

/// Logs progress at every tenth of the total, or every 64 MiB when the
/// total is unknown.
fn progress_logger(label: &'static str) -> ProgressCallback {
    const UNKNOWN_STEP: u64 = 64 * 1024 * 1024;
    let last_step = AtomicU64::new(0);

    progress_callback(move |event: ProgressEvent| {
        let step = match event.fraction() {
            Some(fraction) => (fraction * 10.0) as u64,
            None => event.transferred / UNKNOWN_STEP,
        };
        if step > last_step.fetch_max(step, Ordering::Relaxed) {
            info!(
                transfer = label,
                transferred = event.transferred,
                total = ?event.total,
                mib_per_sec = %format!("{:.1}", event.bytes_per_second / (1024.0 * 1024.0)),
                eta_secs = ?event.eta.map(|d| d.as_secs()),
                "progress"
            );
        }
    })
}
