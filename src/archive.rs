//! In-process zip handling for batch artifacts. Artifacts are named by the
//! inclusive identifier range they cover, `{start}_{end}.zip`, and contain
//! the raw per-identifier JSON files at the archive root.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub fn archive_name(start: u64, end: u64) -> String {
    format!("{}_{}.zip", start, end)
}

/// Inverse of [`archive_name`]: `"17_32.zip"` -> `(17, 32)`.
pub fn parse_boundaries(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".zip")?;
    let (start, end) = stem.split_once('_')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Compress every `.json` file directly under `src` into `dest`. Returns the
/// number of files archived.
pub fn zip_dir(src: &Path, dest: &Path) -> Result<usize> {
    let file = File::create(dest)
        .with_context(|| format!("failed to create archive {}", dest.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    for entry in fs::read_dir(src).with_context(|| format!("unreadable dir {}", src.display()))? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("non-utf8 file name under {}", src.display()))?;
        writer.start_file(name, options)?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut writer)?;
        count += 1;
    }
    writer.finish()?;
    Ok(count)
}

/// Extract all entries of `archive` into `dest`, which must already exist.
pub fn unzip_to(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", archive.display()))?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("archive entry {:?} escapes the extraction dir", entry.name());
        };
        let out_path: PathBuf = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Best-effort removal of the raw `.json` intermediates once a batch has been
/// archived.
pub fn clear_json_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(archive_name(1, 10), "1_10.zip");
        assert_eq!(parse_boundaries("1_10.zip"), Some((1, 10)));
        assert_eq!(parse_boundaries("11_20.zip"), Some((11, 20)));
        assert_eq!(parse_boundaries("notazip.txt"), None);
        assert_eq!(parse_boundaries("x_y.zip"), None);
    }

    #[test]
    fn zip_collects_only_json() {
        let scratch = tempfile::tempdir().unwrap();
        fs::write(scratch.path().join("assessment_instance_1_log.json"), "[]").unwrap();
        fs::write(scratch.path().join("assessment_instance_2_log.json"), "[]").unwrap();
        fs::write(scratch.path().join("leftover.tmp"), "x").unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("1_2.zip");
        assert_eq!(zip_dir(scratch.path(), &dest).unwrap(), 2);

        let extracted = tempfile::tempdir().unwrap();
        unzip_to(&dest, extracted.path()).unwrap();
        assert!(extracted.path().join("assessment_instance_1_log.json").exists());
        assert!(extracted.path().join("assessment_instance_2_log.json").exists());
        assert!(!extracted.path().join("leftover.tmp").exists());
    }

    #[test]
    fn clear_removes_only_json() {
        let scratch = tempfile::tempdir().unwrap();
        fs::write(scratch.path().join("a.json"), "[]").unwrap();
        fs::write(scratch.path().join("keep.zip"), "x").unwrap();
        clear_json_files(scratch.path());
        assert!(!scratch.path().join("a.json").exists());
        assert!(scratch.path().join("keep.zip").exists());
    }
}
