//! Durable staging area for batches that exhausted their retry budget.
//!
//! One JSON file per batch under the staging directory, named by sequence
//! number so replay order is the original send order. Files are written to a
//! temp name and renamed into place so a crash mid-write never leaves a
//! half-batch that replay would reject. Survives process restart.

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::collector::ExportBatch;

pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Opens (creating if needed) the staging directory.
    pub fn open(dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        fs::create_dir_all(dir)?;
        Ok(StagingArea {
            dir: dir.to_path_buf(),
        })
    }

    fn batch_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("batch_{:020}.json", sequence))
    }

    /// Persists one batch. The batch keeps its original sequence number so
    /// the collector's dedup still applies on replay.
    pub fn stage(&self, batch: &ExportBatch) -> Result<(), Box<dyn std::error::Error>> {
        let path = self.batch_path(batch.sequence);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(batch)?;
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;
        debug!("Staged batch {} ({} flows)", batch.sequence, batch.flows.len());
        Ok(())
    }

    /// Loads every staged batch in sequence order. Unreadable or corrupt
    /// files are logged and skipped; one bad file must not wedge replay.
    pub fn replay(&self) -> Result<Vec<ExportBatch>, Box<dyn std::error::Error>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().map(|e| e == "json").unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut batches = Vec::new();
        for path in paths {
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<ExportBatch>(&s).map_err(|e| e.to_string()))
            {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!("Skipping unreadable staged batch {:?}: {}", path, e),
            }
        }
        batches.sort_by_key(|b| b.sequence);
        Ok(batches)
    }

    /// Removes a staged batch after successful re-delivery.
    pub fn remove(&self, sequence: u64) -> Result<(), Box<dyn std::error::Error>> {
        let path = self.batch_path(sequence);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Highest staged sequence number, if any; the live sequence counter
    /// must resume above it.
    pub fn max_sequence(&self) -> Result<Option<u64>, Box<dyn std::error::Error>> {
        Ok(self.replay()?.last().map(|b| b.sequence))
    }

    pub fn count(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(seq: u64) -> ExportBatch {
        ExportBatch::new("dev-1".to_string(), seq, Vec::new())
    }

    #[test]
    fn stage_and_replay_keeps_sequence_order() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::open(dir.path()).unwrap();

        staging.stage(&batch(7)).unwrap();
        staging.stage(&batch(3)).unwrap();
        staging.stage(&batch(12)).unwrap();

        let replayed = staging.replay().unwrap();
        let sequences: Vec<u64> = replayed.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![3, 7, 12]);
    }

    #[test]
    fn remove_drops_the_file() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::open(dir.path()).unwrap();
        staging.stage(&batch(1)).unwrap();
        assert_eq!(staging.count(), 1);

        staging.remove(1).unwrap();
        assert_eq!(staging.count(), 0);
        assert!(staging.replay().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::open(dir.path()).unwrap();
        staging.stage(&batch(2)).unwrap();
        fs::write(dir.path().join("batch_junk.json"), b"not json").unwrap();

        let replayed = staging.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, 2);
    }

    #[test]
    fn max_sequence_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let staging = StagingArea::open(dir.path()).unwrap();
            staging.stage(&batch(41)).unwrap();
        }
        let staging = StagingArea::open(dir.path()).unwrap();
        assert_eq!(staging.max_sequence().unwrap(), Some(41));
    }

    #[test]
    fn empty_area_replays_nothing() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::open(dir.path()).unwrap();
        assert!(staging.replay().unwrap().is_empty());
        assert_eq!(staging.max_sequence().unwrap(), None);
    }
}
