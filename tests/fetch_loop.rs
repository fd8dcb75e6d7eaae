//! End-to-end tests of the batch fetch loop against synthetic data and an
//! in-memory store.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use indicatif::ProgressBar;
use std::sync::Arc;

use coursedump::api::LogSource;
use coursedump::archive::parse_boundaries;
use coursedump::fetch::{self, CancelFlag};
use coursedump::store::{self, RemoteStore};

/// Dense synthetic collection. Optionally trips a cancel flag when a given
/// identifier is fetched, to simulate an interrupt arriving mid-iteration.
struct SyntheticLog {
    max_id: u64,
    cancel_at: Option<(u64, CancelFlag)>,
}

#[async_trait]
impl LogSource for SyntheticLog {
    async fn get_log(&self, id: u64) -> Result<String> {
        if let Some((trigger, flag)) = &self.cancel_at {
            if id == *trigger {
                flag.cancel();
            }
        }
        Ok(if id <= self.max_id {
            format!(r#"[{{"event_date":"2023-05-01T09:00:00Z","submission_id":{}}}]"#, id)
        } else {
            "[]".to_string()
        })
    }
}

#[derive(Default)]
struct MemStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    /// Stored archive names in identifier order. The map itself sorts keys
    /// lexicographically, which puts "11_20.zip" before "1_10.zip".
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort_by_key(|name| parse_boundaries(name));
        names
    }

    fn bytes(&self, name: &str) -> Vec<u8> {
        self.objects.lock().unwrap()[name].clone()
    }
}

#[async_trait]
impl RemoteStore for MemStore {
    async fn upload(&self, dir: &Path, name: &str) -> Result<String> {
        let bytes = std::fs::read(dir.join(name))?;
        self.objects.lock().unwrap().insert(name.to_string(), bytes);
        Ok(name.to_string())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .map(|k| (k.clone(), k.clone()))
            .collect())
    }

    async fn download(&self, id: &str, dest: &Path) -> Result<()> {
        std::fs::write(dest, self.bytes(id))?;
        Ok(())
    }
}

fn entry_names(zip_bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

#[tokio::test]
async fn batches_produce_disjoint_named_archives() {
    let scratch = tempfile::tempdir().unwrap();
    let archives = tempfile::tempdir().unwrap();
    let source = Arc::new(SyntheticLog { max_id: 20, cancel_at: None });
    let store = Arc::new(MemStore::default());

    // 2 workers x 5 records = 10 per iteration: batches [1,10] and [11,20]
    let summary = fetch::run(
        source,
        store.clone(),
        scratch.path(),
        archives.path(),
        1,
        20,
        5,
        2,
        CancelFlag::new(),
        &ProgressBar::hidden(),
    )
    .await
    .unwrap();

    assert!(!summary.interrupted);
    assert_eq!(summary.saved, 20);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.last_archived, Some(20));
    assert_eq!(summary.archives, vec!["1_10.zip", "11_20.zip"]);
    assert_eq!(store.names(), vec!["1_10.zip", "11_20.zip"]);

    let first = entry_names(&store.bytes("1_10.zip"));
    let second = entry_names(&store.bytes("11_20.zip"));
    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 10);
    for id in 1..=10u64 {
        let name = format!("assessment_instance_{}_log.json", id);
        assert!(first.contains(&name));
        assert!(!second.contains(&name));
    }
    for id in 11..=20u64 {
        let name = format!("assessment_instance_{}_log.json", id);
        assert!(second.contains(&name));
        assert!(!first.contains(&name));
    }

    // raw files and local archives are gone once uploaded
    assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
    assert!(std::fs::read_dir(archives.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn interrupt_mid_iteration_keeps_completed_batches() {
    let scratch = tempfile::tempdir().unwrap();
    let archives = tempfile::tempdir().unwrap();
    let cancel = CancelFlag::new();
    // 5 iterations of [1,50]; the interrupt lands while iteration 3 fetches
    let source = Arc::new(SyntheticLog {
        max_id: 50,
        cancel_at: Some((25, cancel.clone())),
    });
    let store = Arc::new(MemStore::default());

    let summary = fetch::run(
        source,
        store.clone(),
        scratch.path(),
        archives.path(),
        1,
        50,
        5,
        2,
        cancel,
        &ProgressBar::hidden(),
    )
    .await
    .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.last_archived, Some(20));
    assert_eq!(summary.archives, vec!["1_10.zip", "11_20.zip"]);
    // both completed batches made it through the upload slot
    assert_eq!(store.names(), vec!["1_10.zip", "11_20.zip"]);
    // iteration 3's raw files were discarded, not archived
    assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn store_round_trip_probe_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let store = MemStore::default();

    store::check_round_trip(&store, scratch.path()).await.unwrap();

    assert!(store.names().is_empty());
    assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
}
