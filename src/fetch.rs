//! The batch fetch loop: walk a contiguous identifier range in fixed-size
//! chunks across a bounded pool of workers, archive each completed batch,
//! and hand archives to the upload slot while the next batch fetches.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::api::LogSource;
use crate::archive::{self, archive_name};
use crate::store::RemoteStore;

/// Cooperative cancellation, observed at iteration boundaries only: in-flight
/// fetches and uploads are always awaited, never aborted.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Trip `flag` on the first ctrl-c.
pub fn cancel_on_ctrl_c(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            flag.cancel();
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fetched over the network and written to disk.
    Saved,
    /// Already on disk; no network call made.
    Skipped,
}

pub fn record_path(scratch: &Path, id: u64) -> PathBuf {
    scratch.join(format!("assessment_instance_{}_log.json", id))
}

/// Fetch one record unless its file already exists (idempotent resume).
pub async fn fetch_record<S: LogSource + ?Sized>(
    source: &S,
    scratch: &Path,
    id: u64,
) -> Result<FetchOutcome> {
    let path = record_path(scratch, id);
    if path.exists() {
        return Ok(FetchOutcome::Skipped);
    }
    let body = source.get_log(id).await?;
    std::fs::write(&path, body).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(FetchOutcome::Saved)
}

/// What one worker did with its sub-chunk. Failures are counted rather than
/// swallowed; the records stay absent on disk for a resumed run.
#[derive(Debug, Clone, Copy)]
pub struct WorkerReport {
    pub start: u64,
    pub end: u64,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Fetch `[start, end]` sequentially in ascending identifier order.
async fn fetch_chunk<S: LogSource + ?Sized>(
    source: Arc<S>,
    scratch: PathBuf,
    start: u64,
    end: u64,
) -> WorkerReport {
    let mut report = WorkerReport { start, end, saved: 0, skipped: 0, failed: 0 };
    for id in start..=end {
        match fetch_record(source.as_ref(), &scratch, id).await {
            Ok(FetchOutcome::Saved) => report.saved += 1,
            Ok(FetchOutcome::Skipped) => report.skipped += 1,
            Err(error) => {
                warn!(id, %error, "fetch failed; leaving record for a future run");
                report.failed += 1;
            }
        }
    }
    report
}

#[derive(Debug)]
pub struct RunSummary {
    pub start: u64,
    pub end: u64,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub archives: Vec<String>,
    /// End of the last batch that was archived and handed to upload; resume
    /// from the next identifier.
    pub last_archived: Option<u64>,
    pub interrupted: bool,
}

/// Drive retrieval of every record in `[start, end]`.
///
/// Each outer iteration covers `workers * batch_size` identifiers: up to
/// `workers` tasks each fetch a contiguous sub-chunk of `batch_size` records,
/// the joined results are zipped into `{iter_start}_{iter_end}.zip` under
/// `archive_dir`, the raw files are removed, and the archive is handed to the
/// upload slot. At most one upload is in flight while the next batch fetches;
/// the previous upload is awaited before the next one starts, and the final
/// upload is awaited before returning.
#[allow(clippy::too_many_arguments)]
pub async fn run<S, R>(
    source: Arc<S>,
    store: Arc<R>,
    scratch: &Path,
    archive_dir: &Path,
    start: u64,
    end: u64,
    batch_size: u64,
    workers: usize,
    cancel: CancelFlag,
    progress: &ProgressBar,
) -> Result<RunSummary>
where
    S: LogSource + 'static,
    R: RemoteStore + 'static,
{
    anyhow::ensure!(batch_size > 0, "batch size must be positive");
    anyhow::ensure!(workers > 0, "worker count must be positive");

    let mut summary = RunSummary {
        start,
        end,
        saved: 0,
        skipped: 0,
        failed: 0,
        archives: Vec::new(),
        last_archived: None,
        interrupted: false,
    };

    let mut upload_slot: Option<JoinHandle<Result<String>>> = None;
    let mut next = start;

    while next <= end {
        if cancel.is_cancelled() {
            summary.interrupted = true;
            break;
        }

        let iter_start = next;
        let mut workers_in_flight = JoinSet::new();
        for _ in 0..workers {
            if next > end {
                break;
            }
            let chunk_end = end.min(next + batch_size - 1);
            workers_in_flight.spawn(fetch_chunk(
                source.clone(),
                scratch.to_path_buf(),
                next,
                chunk_end,
            ));
            next = chunk_end + 1;
        }
        let iter_end = next - 1;

        while let Some(joined) = workers_in_flight.join_next().await {
            let report = joined.context("fetch worker panicked")?;
            summary.saved += report.saved;
            summary.skipped += report.skipped;
            summary.failed += report.failed;
        }

        // an interrupt that arrived mid-fetch discards this iteration: the
        // raw files go away unarchived and the previous batch becomes the
        // resume boundary
        if cancel.is_cancelled() {
            archive::clear_json_files(scratch);
            summary.interrupted = true;
            break;
        }

        let name = archive_name(iter_start, iter_end);
        let archive_path = archive_dir.join(&name);
        let archived = archive::zip_dir(scratch, &archive_path)
            .with_context(|| format!("failed archiving batch {}", name))?;
        archive::clear_json_files(scratch);
        info!(archive = %name, files = archived, "batch archived");

        if let Some(handle) = upload_slot.take() {
            settle_upload(handle).await?;
        }
        upload_slot = Some(spawn_upload(store.clone(), archive_dir.to_path_buf(), name.clone()));

        summary.archives.push(name);
        summary.last_archived = Some(iter_end);
        progress.inc(iter_end - iter_start + 1);
    }

    if let Some(handle) = upload_slot.take() {
        settle_upload(handle).await?;
    }

    Ok(summary)
}

fn spawn_upload<R: RemoteStore + 'static>(
    store: Arc<R>,
    archive_dir: PathBuf,
    name: String,
) -> JoinHandle<Result<String>> {
    tokio::spawn(async move {
        let id = store.upload(&archive_dir, &name).await?;
        let _ = std::fs::remove_file(archive_dir.join(&name));
        info!(archive = %name, %id, "uploaded");
        Ok(id)
    })
}

async fn settle_upload(handle: JoinHandle<Result<String>>) -> Result<String> {
    handle.await.context("upload task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LogSource for CountingSource {
        async fn get_log(&self, _id: u64) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(r#"[{"event_date":"2023-05-01T09:00:00Z","submission_id":null}]"#.to_string())
        }
    }

    #[tokio::test]
    async fn refetch_of_existing_file_makes_no_network_call() {
        let scratch = tempfile::tempdir().unwrap();
        let source = CountingSource { calls: AtomicUsize::new(0) };

        let first = fetch_record(&source, scratch.path(), 12).await.unwrap();
        assert_eq!(first, FetchOutcome::Saved);
        let second = fetch_record(&source, scratch.path(), 12).await.unwrap();
        assert_eq!(second, FetchOutcome::Skipped);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
