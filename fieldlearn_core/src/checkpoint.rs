//! Durable snapshots of a run.
//!
//! One JSON checkpoint lives in each run directory. Writes go to a temporary file in the same
//! directory which is then renamed over the previous checkpoint, so a crash mid-write leaves the
//! last good snapshot in place.

use crate::checksum::ChecksumRegistry;
use crate::config::{FileFormat, RunContext};
use crate::mutator::{LearnedState, LearningStats};
use crate::value_store::{Blacklists, ValueStore, ValueTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(String),
    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),
    #[error("Checkpoint deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}

/// Per-file outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Files passed over because an earlier session already processed them.
    pub skipped: u64,
}

impl FileCounters {
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Serialized form of everything a run has learned and walked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub format: FileFormat,
    pub source_dir: PathBuf,
    pub max_files: Option<usize>,
    pub started_at: String,
    pub last_updated: String,
    pub processed_files: BTreeSet<PathBuf>,
    pub files_processed_count: usize,
    pub value_store: ValueTree,
    pub blacklist_by_size: BTreeSet<String>,
    pub blacklist_by_count: BTreeSet<String>,
    pub checksum_algorithms: ChecksumRegistry,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub stats: LearningStats,
    #[serde(default)]
    pub counters: FileCounters,
}

impl Checkpoint {
    /// Snapshot of the coordinator's state, stamped with the current time.
    pub fn capture(
        ctx: &RunContext,
        max_files: Option<usize>,
        started_at: &str,
        state: &LearnedState,
        processed: &BTreeSet<PathBuf>,
        counters: FileCounters,
    ) -> Self {
        let blacklists = state.values.blacklists();
        Self {
            run_id: ctx.run_id.clone(),
            format: ctx.format,
            source_dir: ctx.seed_dir.clone(),
            max_files,
            started_at: started_at.to_string(),
            last_updated: chrono::Local::now().to_rfc3339(),
            processed_files: processed.clone(),
            files_processed_count: processed.len(),
            value_store: state.values.tree().clone(),
            blacklist_by_size: blacklists.by_size.clone(),
            blacklist_by_count: blacklists.by_count.clone(),
            checksum_algorithms: state.checksums.clone(),
            log_dir: ctx.run_dir.clone(),
            stats: state.stats,
            counters,
        }
    }

    /// Rebuilds the learned state, re-applying both blacklists to the restored tree.
    pub fn restore_state(&self, max_unique_values: usize) -> LearnedState {
        let blacklists = Blacklists {
            by_size: self.blacklist_by_size.clone(),
            by_count: self.blacklist_by_count.clone(),
        };
        LearnedState {
            values: ValueStore::from_parts(self.value_store.clone(), blacklists, max_unique_values),
            checksums: self.checksum_algorithms.clone(),
            stats: self.stats,
        }
    }
}

/// Reads and atomically writes the checkpoint file of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Writes `checkpoint` via a sibling temporary file and an atomic rename.
    ///
    /// # Errors
    /// On any failure the previous checkpoint file is left untouched.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            CheckpointError::Io(format!("Failed to create temporary checkpoint in {dir:?}: {e}"))
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, checkpoint).map_err(|e| {
                CheckpointError::Serialization(format!(
                    "Failed to serialize checkpoint for run {}: {e}",
                    checkpoint.run_id
                ))
            })?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| {
            CheckpointError::Io(format!(
                "Failed to move checkpoint into place at {:?}: {}",
                self.path, e.error
            ))
        })?;
        tracing::debug!(
            "Checkpoint saved: {} files processed",
            checkpoint.files_processed_count
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let file = File::open(&self.path).map_err(|e| {
            CheckpointError::Io(format!("Failed to open checkpoint {:?}: {e}", self.path))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CheckpointError::Deserialization(format!(
                "Failed to parse checkpoint {:?}: {e}. The file might be corrupted.",
                self.path
            ))
        })
    }
}

/// Newest run directory under `logs_root` for `format` that holds a checkpoint.
///
/// Run ids start with a sortable timestamp, so the lexicographically greatest name is the newest.
pub fn find_latest_run(
    logs_root: &Path,
    format: FileFormat,
) -> Result<Option<String>, CheckpointError> {
    if !logs_root.is_dir() {
        return Ok(None);
    }
    let suffix = format!("_{format}");
    let mut candidates = Vec::new();
    for entry in fs::read_dir(logs_root)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.ends_with(&suffix)
            && entry
                .path()
                .join(RunContext::CHECKPOINT_FILENAME)
                .is_file()
        {
            candidates.push(name);
        }
    }
    Ok(candidates.into_iter().max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearnerConfig, RunConfig};
    use tempfile::tempdir;

    fn context(logs_root: &Path, run_id: &str) -> RunContext {
        let mut config = LearnerConfig::default();
        config.paths.logs_root = logs_root.to_path_buf();
        RunContext::at(&config, &RunConfig::new(FileFormat::Png), run_id.to_string())
    }

    fn sample_state() -> LearnedState {
        let mut state = LearnedState::new(30);
        state.values.record(&["file", "chunk_0", "crc"], "cafebabe");
        state.values.record(&["file", "hdr", "sig"], "89504e47");
        state.values.blacklist_by_size("data");
        state.checksums.record("IHDR", "CRC-32");
        state.checksums.record_compression(8);
        state.stats.valid_overwrites = 5;
        state
    }

    #[test]
    fn round_trip_preserves_learned_state() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "20260101_000000_png");
        fs::create_dir_all(&ctx.run_dir).unwrap();
        let store = CheckpointStore::new(ctx.checkpoint_path());
        let state = sample_state();
        let processed = BTreeSet::from([PathBuf::from("/seeds/a.png")]);
        let counters = FileCounters {
            succeeded: 1,
            ..FileCounters::default()
        };

        let checkpoint = Checkpoint::capture(&ctx, Some(10), "start", &state, &processed, counters);
        store.save(&checkpoint).unwrap();
        assert!(ctx.checkpoint_path().is_file());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.restore_state(30), state);
        assert_eq!(loaded.files_processed_count, 1);
    }

    #[test]
    fn checkpoint_json_uses_documented_keys() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "20260101_000000_png");
        let checkpoint = Checkpoint::capture(
            &ctx,
            None,
            "start",
            &sample_state(),
            &BTreeSet::new(),
            FileCounters::default(),
        );
        let json = serde_json::to_value(&checkpoint).unwrap();
        for key in [
            "run_id",
            "format",
            "source_dir",
            "max_files",
            "started_at",
            "last_updated",
            "processed_files",
            "files_processed_count",
            "value_store",
            "blacklist_by_size",
            "blacklist_by_count",
            "checksum_algorithms",
            "log_dir",
        ] {
            assert!(json.get(key).is_some(), "Missing checkpoint key {key}");
        }
        assert_eq!(json["format"], "png");
        assert_eq!(json["checksum_algorithms"]["by_type"]["IHDR"][0], "CRC-32");
        assert_eq!(json["checksum_algorithms"]["compression_methods"]["8"], "deflate");
        assert_eq!(json["value_store"]["file"]["chunk"]["crc"][0], "cafebabe");
    }

    #[test]
    fn failed_save_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), "20260101_000000_png");
        fs::create_dir_all(&ctx.run_dir).unwrap();
        let store = CheckpointStore::new(ctx.checkpoint_path());
        let first = Checkpoint::capture(
            &ctx,
            None,
            "start",
            &sample_state(),
            &BTreeSet::new(),
            FileCounters::default(),
        );
        store.save(&first).unwrap();

        let broken = CheckpointStore::new(dir.path().join("missing-dir").join("checkpoint.json"));
        assert!(broken.save(&first).is_err());
        assert_eq!(store.load().unwrap(), first);
    }

    #[test]
    fn corrupted_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "{ not json").unwrap();
        let err = CheckpointStore::new(path).load().unwrap_err();
        assert!(matches!(err, CheckpointError::Deserialization(_)));
    }

    #[test]
    fn latest_run_is_newest_with_checkpoint() {
        let dir = tempdir().unwrap();
        for (name, with_checkpoint) in [
            ("20250101_000000_png", true),
            ("20250301_000000_png", true),
            ("20250401_000000_png", false),
            ("20250501_000000_gif", true),
        ] {
            let run_dir = dir.path().join(name);
            fs::create_dir_all(&run_dir).unwrap();
            if with_checkpoint {
                fs::write(run_dir.join(RunContext::CHECKPOINT_FILENAME), "{}").unwrap();
            }
        }
        assert_eq!(
            find_latest_run(dir.path(), FileFormat::Png).unwrap().as_deref(),
            Some("20250301_000000_png")
        );
        assert_eq!(find_latest_run(dir.path(), FileFormat::Zip).unwrap(), None);
        assert_eq!(
            find_latest_run(&dir.path().join("absent"), FileFormat::Png).unwrap(),
            None
        );
    }
}
