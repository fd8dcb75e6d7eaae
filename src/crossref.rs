//! Cross-referencing spreadsheet exports against archived logs: pull the
//! archive artifacts down from the store, index one submission id per
//! spreadsheet group, index submissions per assessment instance from the
//! archived logs, and join the two.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::parse_events;
use crate::archive::{parse_boundaries, unzip_to};
use crate::store::RemoteStore;

/// One spreadsheet group, keyed in [`SubmissionIndex`] by the submission id
/// that represents it. `instance` is filled in by [`join_matches`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionEntry {
    pub file_name: String,
    pub group: String,
    pub instance: Option<String>,
}

pub type SubmissionIndex = BTreeMap<String, SubmissionEntry>;

/// Submissions seen in one assessment instance's log. Also the row format of
/// the save/load resume file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMatch {
    pub assessment_instance_id: String,
    pub submissions: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    file_name: &'a str,
    #[serde(rename = "Username")]
    username: &'a str,
    assessment_instance_id: Option<&'a str>,
}

/// Keep only archive artifacts whose starting identifier is at least
/// `threshold`. Names that are not `{start}_{end}.zip` are dropped too.
pub fn filter_archives(
    threshold: u64,
    items: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    items
        .into_iter()
        .filter(|(_, name)| matches!(parse_boundaries(name), Some((start, _)) if start >= threshold))
        .collect()
}

/// Download every listed artifact that is not already in `data_dir`.
pub async fn download_missing<R: RemoteStore + ?Sized>(
    store: &R,
    items: &BTreeMap<String, String>,
    data_dir: &Path,
    progress: &ProgressBar,
) -> Result<usize> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let mut downloaded = 0;
    for (id, name) in items {
        let dest = data_dir.join(name);
        if !dest.exists() {
            store.download(id, &dest).await?;
            downloaded += 1;
        }
        progress.inc(1);
    }
    Ok(downloaded)
}

#[derive(Debug, Deserialize)]
struct SubmissionRow {
    #[serde(rename = "Usernames")]
    usernames: String,
    submission_id: i64,
}

/// Index every CSV under `dir` (recursively): the first row of each group in
/// each file contributes its submission id as the group's representative.
pub fn index_spreadsheets(dir: &Path) -> Result<SubmissionIndex> {
    let mut index = SubmissionIndex::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("unreadable dir {}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().map_or(true, |ext| ext != "csv") {
                continue;
            }
            index_one_spreadsheet(&path, &mut index)?;
        }
    }
    Ok(index)
}

fn index_one_spreadsheet(path: &Path, index: &mut SubmissionIndex) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut seen_groups = HashSet::new();
    for row in reader.deserialize() {
        let row: SubmissionRow =
            row.with_context(|| format!("bad row in {}", path.display()))?;
        if seen_groups.insert(row.usernames.clone()) {
            index.insert(
                row.submission_id.to_string(),
                SubmissionEntry {
                    file_name: file_name.clone(),
                    group: row.usernames,
                    instance: None,
                },
            );
        }
    }
    Ok(())
}

/// Resume file: previously extracted instance matches, or empty when the file
/// is missing or unreadable (a warning, not an error).
pub fn load_instance_matches(path: &Path) -> Vec<InstanceMatch> {
    if !path.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|body| serde_json::from_str(&body).map_err(anyhow::Error::from))
    {
        Ok(matches) => matches,
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring unreadable resume file");
            Vec::new()
        }
    }
}

pub fn save_instance_matches(path: &Path, matches: &[InstanceMatch]) -> Result<()> {
    let body = serde_json::to_string(matches)?;
    std::fs::write(path, body).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn instance_id_from_name(name: &str) -> Option<&str> {
    name.strip_prefix("assessment_instance_")?
        .strip_suffix("_log.json")
}

fn matches_from_archive(
    archive: &Path,
    skip: &HashSet<String>,
    out: &mut Vec<InstanceMatch>,
) -> Result<()> {
    let unpack_dir = archive
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&unpack_dir)?;
    let result = matches_from_unpacked(archive, &unpack_dir, skip, out);
    let _ = std::fs::remove_dir_all(&unpack_dir);
    result
}

fn matches_from_unpacked(
    archive: &Path,
    unpack_dir: &Path,
    skip: &HashSet<String>,
    out: &mut Vec<InstanceMatch>,
) -> Result<()> {
    unzip_to(archive, unpack_dir)?;
    for entry in std::fs::read_dir(unpack_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(instance_id) = instance_id_from_name(name) else {
            continue;
        };
        if skip.contains(instance_id) {
            continue;
        }
        let body = std::fs::read_to_string(&path)?;
        let events = parse_events(&body)
            .with_context(|| format!("bad log file {} in {}", name, archive.display()))?;
        out.push(InstanceMatch {
            assessment_instance_id: instance_id.to_string(),
            submissions: events.iter().filter_map(|e| e.submission_id).collect(),
        });
    }
    Ok(())
}

/// Extract instance -> submissions pairs from every kept archive in
/// `data_dir`, merging into `existing` (instances already there are skipped).
pub fn collect_instance_matches(
    data_dir: &Path,
    keep: &BTreeMap<String, String>,
    existing: Vec<InstanceMatch>,
    progress: &ProgressBar,
) -> Result<Vec<InstanceMatch>> {
    let mut matches = existing;
    let skip: HashSet<String> = matches
        .iter()
        .map(|m| m.assessment_instance_id.clone())
        .collect();
    let mut seen_names = HashSet::new();

    for name in keep.values() {
        if !seen_names.insert(name) {
            continue;
        }
        let path = data_dir.join(name.as_str());
        if !path.exists() {
            warn!(archive = %name, "listed archive missing on disk, skipping");
            continue;
        }
        matches_from_archive(&path, &skip, &mut matches)?;
        debug!(archive = %name, "scanned");
        progress.inc(1);
    }
    Ok(matches)
}

/// Point indexed submissions at instances whose logs contain them. An
/// instance claims at most one indexed submission (the first of its list
/// that is indexed); when several instances contain the same submission,
/// the one scanned last keeps the claim.
pub fn join_matches(index: &mut SubmissionIndex, matches: &[InstanceMatch]) {
    for m in matches {
        for submission in &m.submissions {
            if let Some(entry) = index.get_mut(&submission.to_string()) {
                entry.instance = Some(m.assessment_instance_id.clone());
                break;
            }
        }
    }
}

pub fn write_report(path: &Path, index: &SubmissionIndex) -> Result<()> {
    let rows: Vec<ReportRow> = index
        .values()
        .map(|entry| ReportRow {
            file_name: &entry.file_name,
            username: &entry.group,
            assessment_instance_id: entry.instance.as_deref(),
        })
        .collect();
    let body = serde_json::to_string(&rows)?;
    std::fs::write(path, body).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_below_threshold_are_dropped() {
        let items = BTreeMap::from([
            ("a".to_string(), "1_10.zip".to_string()),
            ("b".to_string(), "11_20.zip".to_string()),
            ("c".to_string(), "21_30.zip".to_string()),
            ("d".to_string(), "README.txt".to_string()),
        ]);
        let kept = filter_archives(11, items);
        let names: Vec<_> = kept.values().cloned().collect();
        assert_eq!(names, vec!["11_20.zip", "21_30.zip"]);
    }

    #[test]
    fn spreadsheet_index_takes_first_submission_per_group() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sec1.csv"),
            "Usernames,Score,submission_id\nalice;bob,10,101\nalice;bob,9,102\ncarol,8,103\n",
        )
        .unwrap();

        let index = index_spreadsheets(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index["101"].group, "alice;bob");
        assert_eq!(index["101"].file_name, "sec1.csv");
        assert_eq!(index["103"].group, "carol");
        assert!(!index.contains_key("102"));
    }

    #[test]
    fn join_assigns_containing_instance() {
        let mut index = SubmissionIndex::from([(
            "101".to_string(),
            SubmissionEntry {
                file_name: "sec1.csv".to_string(),
                group: "alice;bob".to_string(),
                instance: None,
            },
        )]);
        let matches = vec![
            InstanceMatch {
                assessment_instance_id: "7".to_string(),
                submissions: vec![55, 56],
            },
            InstanceMatch {
                assessment_instance_id: "8".to_string(),
                submissions: vec![100, 101],
            },
        ];
        join_matches(&mut index, &matches);
        assert_eq!(index["101"].instance.as_deref(), Some("8"));
    }

    #[test]
    fn later_instance_overwrites_an_earlier_claim() {
        let mut index = SubmissionIndex::from([(
            "101".to_string(),
            SubmissionEntry {
                file_name: "sec1.csv".to_string(),
                group: "alice;bob".to_string(),
                instance: None,
            },
        )]);
        let matches = vec![
            InstanceMatch {
                assessment_instance_id: "7".to_string(),
                submissions: vec![101],
            },
            InstanceMatch {
                assessment_instance_id: "8".to_string(),
                submissions: vec![101],
            },
        ];
        join_matches(&mut index, &matches);
        assert_eq!(index["101"].instance.as_deref(), Some("8"));
    }

    #[test]
    fn instance_id_parses_from_log_file_name() {
        assert_eq!(
            instance_id_from_name("assessment_instance_42_log.json"),
            Some("42")
        );
        assert_eq!(instance_id_from_name("gradebook.json"), None);
    }

    #[test]
    fn archive_scan_skips_known_instances() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(
            scratch.path().join("assessment_instance_1_log.json"),
            r#"[{"event_date":"2023-05-01T09:00:00Z","submission_id":11},
                {"event_date":"2023-05-01T09:01:00Z","submission_id":null}]"#,
        )
        .unwrap();
        std::fs::write(
            scratch.path().join("assessment_instance_2_log.json"),
            r#"[{"event_date":"2023-05-01T09:02:00Z","submission_id":22}]"#,
        )
        .unwrap();

        let data_dir = tempfile::tempdir().unwrap();
        let archive = data_dir.path().join("1_2.zip");
        crate::archive::zip_dir(scratch.path(), &archive).unwrap();

        let keep = BTreeMap::from([("id".to_string(), "1_2.zip".to_string())]);
        let existing = vec![InstanceMatch {
            assessment_instance_id: "1".to_string(),
            submissions: vec![11],
        }];
        let matches = collect_instance_matches(
            data_dir.path(),
            &keep,
            existing,
            &ProgressBar::hidden(),
        )
        .unwrap();

        assert_eq!(matches.len(), 2);
        let two = matches
            .iter()
            .find(|m| m.assessment_instance_id == "2")
            .unwrap();
        assert_eq!(two.submissions, vec![22]);
    }
}
