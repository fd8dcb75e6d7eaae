//! One-shot course snapshot: assessment list, gradebook, and then the
//! per-assessment and per-instance collections, fanned out with bounded
//! concurrency into a fixed directory layout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::api::Api;

const INSTANCES_DIR: &str = "Assessment_instances";
const QUESTIONS_DIR: &str = "Instance_questions";
const SUBMISSIONS_DIR: &str = "Submissions";
const LOG_DIR: &str = "Log";

#[derive(Debug, Clone, Deserialize)]
struct AssessmentRef {
    assessment_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceRef {
    assessment_instance_id: u64,
}

/// On-disk layout of one snapshot under `<root>/<folder>/`.
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(root: &Path, folder: &str) -> Self {
        Layout { base: root.join(folder) }
    }

    pub fn init(&self) -> Result<()> {
        for dir in [INSTANCES_DIR, QUESTIONS_DIR, SUBMISSIONS_DIR, LOG_DIR] {
            let path = self.base.join(dir);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
        }
        Ok(())
    }

    pub fn assessments(&self) -> PathBuf {
        self.base.join("assessments.json")
    }

    pub fn gradebook(&self) -> PathBuf {
        self.base.join("gradebook.json")
    }

    pub fn instance_list(&self, assessment_id: u64) -> PathBuf {
        self.base
            .join(INSTANCES_DIR)
            .join(format!("assessment_{}_instances.json", assessment_id))
    }

    pub fn instance_questions(&self, instance_id: u64) -> PathBuf {
        self.base
            .join(QUESTIONS_DIR)
            .join(format!("assessment_instance_{}_instance_questions.json", instance_id))
    }

    pub fn submissions(&self, instance_id: u64) -> PathBuf {
        self.base
            .join(SUBMISSIONS_DIR)
            .join(format!("assessment_instance_{}_submissions.json", instance_id))
    }

    pub fn log(&self, instance_id: u64) -> PathBuf {
        self.base
            .join(LOG_DIR)
            .join(format!("assessment_instance_{}_log.json", instance_id))
    }
}

#[derive(Debug, Default)]
pub struct SnapshotReport {
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub instances: usize,
}

/// Fetch one endpoint to a file unless the file already exists.
async fn download_file(api: &Api, tail: &str, path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let body = api.get_raw(tail).await?;
    std::fs::write(path, body).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(true)
}

/// Download a set of (endpoint, destination) jobs with at most `concurrency`
/// requests in flight. Per-file failures are logged and counted, not retried.
async fn download_many(
    api: &Api,
    jobs: Vec<(String, PathBuf)>,
    concurrency: usize,
    report: &mut SnapshotReport,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let tasks = jobs.into_iter().map(|(tail, path)| {
        let api = api.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let outcome = download_file(&api, &tail, &path).await;
            (tail, outcome)
        }
    });
    for (tail, outcome) in futures::future::join_all(tasks).await {
        match outcome {
            Ok(true) => report.saved += 1,
            Ok(false) => report.skipped += 1,
            Err(error) => {
                warn!(endpoint = %tail, %error, "download failed");
                report.failed += 1;
            }
        }
    }
}

fn parse_assessments(body: &str) -> Result<Vec<u64>> {
    let refs: Vec<AssessmentRef> =
        serde_json::from_str(body).context("assessments.json is not an assessment array")?;
    Ok(refs.into_iter().map(|a| a.assessment_id).collect())
}

/// Union of every assessment's instance ids, first-seen order, no duplicates.
fn collect_instance_ids(layout: &Layout, assessment_ids: &[u64]) -> Result<Vec<u64>> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for &assessment_id in assessment_ids {
        let path = layout.instance_list(assessment_id);
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("missing instance list {}", path.display()))?;
        let refs: Vec<InstanceRef> = serde_json::from_str(&body)
            .with_context(|| format!("bad instance list {}", path.display()))?;
        for r in refs {
            if seen.insert(r.assessment_instance_id) {
                ids.push(r.assessment_instance_id);
            }
        }
    }
    Ok(ids)
}

pub async fn run(api: &Api, layout: &Layout, concurrency: usize) -> Result<SnapshotReport> {
    layout.init()?;
    let mut report = SnapshotReport::default();

    download_many(
        api,
        vec![
            ("/assessments".to_string(), layout.assessments()),
            ("/gradebook".to_string(), layout.gradebook()),
        ],
        concurrency,
        &mut report,
    )
    .await;

    let assessments_body = std::fs::read_to_string(layout.assessments())
        .context("assessment list was not downloaded; cannot continue")?;
    let assessment_ids = parse_assessments(&assessments_body)?;
    info!(assessments = assessment_ids.len(), "fetching instance lists");

    let jobs = assessment_ids
        .iter()
        .map(|&id| {
            (
                format!("/assessments/{}/assessment_instances", id),
                layout.instance_list(id),
            )
        })
        .collect();
    download_many(api, jobs, concurrency, &mut report).await;

    let instance_ids = collect_instance_ids(layout, &assessment_ids)?;
    report.instances = instance_ids.len();
    info!(instances = instance_ids.len(), "fetching per-instance data");

    let jobs = instance_ids
        .iter()
        .map(|&id| {
            (
                format!("/assessment_instances/{}/instance_questions", id),
                layout.instance_questions(id),
            )
        })
        .collect();
    download_many(api, jobs, concurrency, &mut report).await;

    let jobs = instance_ids
        .iter()
        .map(|&id| {
            (
                format!("/assessment_instances/{}/submissions", id),
                layout.submissions(id),
            )
        })
        .collect();
    download_many(api, jobs, concurrency, &mut report).await;

    let jobs = instance_ids
        .iter()
        .map(|&id| (format!("/assessment_instances/{}/log", id), layout.log(id)))
        .collect();
    download_many(api, jobs, concurrency, &mut report).await;

    Ok(report)
}
