use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursedump::api::{Api, DEFAULT_BASE_URL};
use coursedump::snapshot::{self, Layout};

#[derive(Parser)]
/// Downloads a one-shot snapshot of a course instance: assessments,
/// gradebook, and per-instance questions, submissions, and logs.
struct Args {
    /// Course instance identifier
    #[arg(long)]
    course_instance: u64,

    /// API access token
    #[arg(long)]
    access_token: String,

    /// API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Root path under which the snapshot folder is created
    #[arg(long)]
    root_path: PathBuf,

    /// Folder name for this snapshot
    #[arg(long)]
    folder: String,

    /// Maximum requests in flight
    #[arg(long, default_value_t = 16)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| ["snapshot=info", "coursedump=info"].join(",").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let api = Api::new(args.base_url, args.course_instance, args.access_token);
    let layout = Layout::new(&args.root_path, &args.folder);

    let report = snapshot::run(&api, &layout, args.concurrency).await?;
    info!(
        saved = report.saved,
        skipped = report.skipped,
        failed = report.failed,
        instances = report.instances,
        "snapshot finished"
    );
    Ok(())
}
