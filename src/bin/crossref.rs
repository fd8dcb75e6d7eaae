use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use indicatif::ProgressBar;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursedump::crossref::{
    collect_instance_matches, download_missing, filter_archives, index_spreadsheets,
    join_matches, load_instance_matches, save_instance_matches, write_report,
};
use coursedump::store::{RemoteStore, S3Store};

#[derive(Parser)]
/// Cross-references spreadsheet submission exports against the archived
/// assessment instance logs in the upload folder, writing a JSON report that
/// maps each spreadsheet group to its assessment instance.
struct Args {
    /// AWS shared-credentials file for the archive store
    #[arg(long)]
    credentials: PathBuf,

    /// Folder holding the archives: bucket or bucket/prefix
    #[arg(long)]
    folder: String,

    /// Local cache of downloaded archives
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory containing the spreadsheet CSV exports
    #[arg(long)]
    submissions_dir: PathBuf,

    /// Where the final report is written
    #[arg(long, default_value = "result.json")]
    result_path: PathBuf,

    /// Where the instance-submission resume file is saved
    #[arg(long, default_value = "instance_submission_match.json")]
    save_match_path: PathBuf,

    /// Instance-submission resume file to load, if present
    #[arg(long, default_value = "instance_submission_match.json")]
    load_match_path: PathBuf,

    /// Ignore archives whose starting identifier is below this
    #[arg(long, default_value_t = 1)]
    starting_instance_id: u64,

    /// Overwrite an existing report
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| ["crossref=info", "coursedump=info"].join(",").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.result_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to overwrite",
            args.result_path.display()
        );
    }

    let store = S3Store::connect(&args.credentials, &args.folder).await?;

    info!("listing archives in the store");
    let items = store.list().await?;
    let kept = filter_archives(args.starting_instance_id, items);
    info!(archives = kept.len(), "archives selected");

    info!("downloading missing archives");
    let progress = ProgressBar::new(kept.len() as u64);
    let downloaded = download_missing(&store, &kept, &args.data_dir, &progress).await?;
    progress.finish_and_clear();
    info!(downloaded, "archive cache up to date");

    info!("indexing spreadsheet exports");
    let mut index = index_spreadsheets(&args.submissions_dir)?;
    info!(groups = index.len(), "spreadsheet groups indexed");

    info!("extracting instance submissions from archives");
    let existing = load_instance_matches(&args.load_match_path);
    let progress = ProgressBar::new(kept.len() as u64);
    let matches = collect_instance_matches(&args.data_dir, &kept, existing, &progress)?;
    progress.finish_and_clear();
    save_instance_matches(&args.save_match_path, &matches)?;
    info!(instances = matches.len(), "instance submissions collected");

    join_matches(&mut index, &matches);
    write_report(&args.result_path, &index)?;
    info!(report = %args.result_path.display(), "report written");
    Ok(())
}
