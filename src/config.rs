//! Validated, immutable run configuration. Everything an operator can get
//! wrong is diagnosed up front in [`preflight`], before any download starts.

use std::path::PathBuf;

use anyhow::{bail, Result};
use jiff::civil::Date;
use tracing::{error, info, warn};

use crate::api::Api;
use crate::store::{self, RemoteStore};

/// Counts past these are allowed but almost certainly a mistake.
const BATCH_SIZE_ADVISORY: u64 = 1000;
const WORKERS_ADVISORY: usize = 100;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Records per worker per outer iteration.
    pub batch_size: u64,
    /// Parallel fetch workers.
    pub workers: usize,
    /// Inclusive date range to download.
    pub start_date: Date,
    pub end_date: Date,
    /// Raw per-record files land here before archiving.
    pub scratch_dir: PathBuf,
    /// Finished archives land here until uploaded.
    pub archive_dir: PathBuf,
}

fn check_limits(cfg: &FetcherConfig, problems: &mut Vec<String>) {
    if cfg.batch_size == 0 {
        problems.push("batch size must be positive".to_string());
    } else if cfg.batch_size > BATCH_SIZE_ADVISORY {
        warn!(batch_size = cfg.batch_size, "very large batch size; downloads may be slow");
    }
    if cfg.workers == 0 {
        problems.push("worker count must be positive".to_string());
    } else if cfg.workers > WORKERS_ADVISORY {
        warn!(workers = cfg.workers, "very high worker count; the API may throttle you");
    }
}

fn check_dates(cfg: &FetcherConfig, problems: &mut Vec<String>) {
    if cfg.end_date < cfg.start_date {
        problems.push(format!(
            "end date {} is earlier than start date {}",
            cfg.end_date, cfg.start_date
        ));
    }
}

/// Run every check, report every failure, and abort if any check failed.
/// The store check is a disposable upload+delete round trip, so passing it
/// means the credentials, folder, and permissions all actually work.
pub async fn preflight<R: RemoteStore + ?Sized>(
    cfg: &FetcherConfig,
    api: &Api,
    store: &R,
) -> Result<()> {
    let mut problems = Vec::new();

    check_limits(cfg, &mut problems);
    check_dates(cfg, &mut problems);

    match api.check_reachable().await {
        Ok(()) => info!("api config ok"),
        Err(error) => problems.push(format!("api: {error:#}")),
    }

    match store::check_round_trip(store, &cfg.scratch_dir).await {
        Ok(()) => info!("upload config ok"),
        Err(error) => problems.push(format!("upload: {error:#}")),
    }

    if problems.is_empty() {
        info!("preflight passed");
        return Ok(());
    }
    for problem in &problems {
        error!("{problem}");
    }
    bail!("preflight failed with {} problem(s)", problems.len());
}
