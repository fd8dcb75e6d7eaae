use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use jiff::civil::Date;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use coursedump::api::{Api, DEFAULT_BASE_URL};
use coursedump::archive::clear_json_files;
use coursedump::config::{preflight, FetcherConfig};
use coursedump::fetch::{self, cancel_on_ctrl_c, CancelFlag};
use coursedump::search::{date_search, find_upper_bound, Bound};
use coursedump::store::S3Store;

#[derive(Parser)]
/// Downloads assessment instance logs for an inclusive date range, zipping
/// each batch and uploading the archives while the next batch fetches.
struct Args {
    /// Records fetched by each worker per iteration
    #[arg(long, default_value_t = 50)]
    batch_size: u64,

    /// Number of parallel fetch workers
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// API access token
    #[arg(long)]
    api_token: String,

    /// Course instance identifier
    #[arg(long)]
    course_instance: u64,

    /// API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Where raw per-record files land before archiving. Defaults to a
    /// throwaway temp directory.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Where finished archives wait for upload. Defaults to a throwaway temp
    /// directory.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// AWS shared-credentials file for the upload store
    #[arg(long)]
    credentials: PathBuf,

    /// Upload folder: bucket or bucket/prefix
    #[arg(long)]
    folder: String,

    /// First day of logs to download (YYYY-MM-DD)
    #[arg(long)]
    start_date: Date,

    /// Last day of logs to download (YYYY-MM-DD)
    #[arg(long)]
    end_date: Date,
}

/// Resolve an optional operator path, or make a throwaway dir we will remove
/// on exit. Returns the path and whether we own it.
fn prepare_dir(requested: Option<PathBuf>) -> Result<(PathBuf, bool)> {
    let (path, owned) = match requested {
        Some(path) => (path, false),
        None => (std::env::temp_dir().join(Uuid::new_v4().to_string()), true),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok((path, owned))
}

fn cleanup(scratch: &Path, scratch_owned: bool, archives: &Path, archives_owned: bool) {
    clear_json_files(scratch);
    if scratch_owned {
        let _ = std::fs::remove_dir_all(scratch);
    }
    if archives_owned {
        let _ = std::fs::remove_dir_all(archives);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| ["logdump=info", "coursedump=info"].join(",").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let (scratch_dir, scratch_owned) = prepare_dir(args.scratch_dir)?;
    let (archive_dir, archives_owned) = prepare_dir(args.archive_dir)?;

    let cfg = FetcherConfig {
        batch_size: args.batch_size,
        workers: args.workers,
        start_date: args.start_date,
        end_date: args.end_date,
        scratch_dir,
        archive_dir,
    };
    let api = Api::new(args.base_url, args.course_instance, args.api_token);

    let result = download(&cfg, api, &args.credentials, &args.folder).await;
    cleanup(&cfg.scratch_dir, scratch_owned, &cfg.archive_dir, archives_owned);
    result
}

async fn download(cfg: &FetcherConfig, api: Api, credentials: &Path, folder: &str) -> Result<()> {
    let store = S3Store::connect(credentials, folder).await?;
    preflight(cfg, &api, &store).await?;

    info!("calculating search range");
    let Some(upper) = find_upper_bound(&api).await? else {
        info!("the collection is empty; nothing to download");
        return Ok(());
    };
    let start = date_search(&api, upper, cfg.start_date, Bound::Lower).await?;
    let end = date_search(&api, upper, cfg.end_date, Bound::Upper).await?;
    let (Some(start), Some(end)) = (start, end) else {
        info!(
            "no logs dated within {}..={}; nothing to download",
            cfg.start_date, cfg.end_date
        );
        return Ok(());
    };
    info!(start, end, total = end - start + 1, "download range located");

    let progress = ProgressBar::new(end - start + 1);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} records ({eta})")
            .context("bad progress template")?,
    );

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = fetch::run(
        Arc::new(api),
        Arc::new(store),
        &cfg.scratch_dir,
        &cfg.archive_dir,
        start,
        end,
        cfg.batch_size,
        cfg.workers,
        cancel,
        &progress,
    )
    .await?;
    progress.finish_and_clear();

    info!(
        saved = summary.saved,
        skipped = summary.skipped,
        failed = summary.failed,
        archives = summary.archives.len(),
        "run finished"
    );
    if summary.interrupted {
        match summary.last_archived {
            Some(boundary) => warn!(
                "interrupted; identifiers {}..={} are archived and uploaded, resume from {}",
                summary.start,
                boundary,
                boundary + 1
            ),
            None => warn!("interrupted before any batch was archived; rerun the same range"),
        }
    }
    Ok(())
}
