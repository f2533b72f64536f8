//! Best-effort JSON persistence.
//!
//! In-memory state is authoritative. Writes go to a temp file that is renamed
//! over the target, and background saves that finish out of order never
//! overwrite a newer snapshot with an older one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ensemble_core::{EnsembleError, EnsembleResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MODEL_PERFORMANCE_FILE: &str = "model_performance.json";
pub const RECALIBRATION_STATE_FILE: &str = "recalibration_state.json";
pub const CALIBRATION_FILE: &str = "calibration_curve.json";
pub const PREDICTION_HISTORY_FILE: &str = "prediction_history.json";
pub const VALIDATION_FILE: &str = "validation_results.json";

#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
    sequence: AtomicU64,
    /// Highest sequence number written per file
    written: Mutex<HashMap<String, u64>>,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU64::new(0),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn ensure_dir(&self) -> EnsembleResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            EnsembleError::Persistence(format!("cannot create {}: {e}", self.dir.display()))
        })
    }

    /// Load `file`. A missing file is a cold start; an unreadable or
    /// unparsable one is logged and treated the same way.
    pub fn load<T: DeserializeOwned>(&self, file: &str) -> Option<T> {
        let path = self.path(file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no persisted state, starting cold");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read persisted state, starting fresh");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                tracing::info!(path = %path.display(), "loaded persisted state");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persisted state is corrupt, starting fresh");
                None
            }
        }
    }

    /// Serialize and write `value` now.
    pub fn save<T: Serialize>(&self, file: &str, value: &T) -> EnsembleResult<()> {
        let seq = self.next_sequence();
        self.write(file, value, seq)
    }

    /// Fire-and-forget save on the blocking pool. Failures are logged.
    ///
    /// Outside a tokio runtime the write happens inline.
    pub fn spawn_save<T>(self: &Arc<Self>, file: &'static str, value: T)
    where
        T: Serialize + Send + 'static,
    {
        let seq = self.next_sequence();
        let store = Arc::clone(self);
        let job = move || {
            if let Err(e) = store.write(file, &value, seq) {
                tracing::warn!(file, error = %e, "failed to persist state");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn write<T: Serialize>(&self, file: &str, value: &T, seq: u64) -> EnsembleResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;

        let mut written = self.written.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if written.get(file).is_some_and(|&last| last > seq) {
            tracing::debug!(file, seq, "skipping stale snapshot");
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let target = self.path(file);
        let temp = self.dir.join(format!(".{file}.{seq}.tmp"));
        fs::write(&temp, &bytes)?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(EnsembleError::Persistence(format!(
                "cannot replace {}: {e}",
                target.display()
            )));
        }
        written.insert(file.to_string(), seq);
        tracing::debug!(file, bytes = bytes.len(), "persisted state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let loaded: Option<BTreeMap<String, f64>> = store.load(MODEL_PERFORMANCE_FILE);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested"));
        let weights: BTreeMap<String, f64> = [("Elo Rating".to_string(), 0.6), ("LSTM".to_string(), 0.4)].into();
        store.save(RECALIBRATION_STATE_FILE, &weights).unwrap();

        let loaded: BTreeMap<String, f64> = store.load(RECALIBRATION_STATE_FILE).unwrap();
        assert_eq!(loaded, weights);
        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        fs::write(store.path(CALIBRATION_FILE), b"{ not json").unwrap();
        let loaded: Option<BTreeMap<String, f64>> = store.load(CALIBRATION_FILE);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_older_snapshot_does_not_overwrite_newer() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.write(VALIDATION_FILE, &2u32, 2).unwrap();
        store.write(VALIDATION_FILE, &1u32, 1).unwrap();
        let loaded: u32 = store.load(VALIDATION_FILE).unwrap();
        assert_eq!(loaded, 2);
    }

    #[test]
    fn test_spawn_save_without_runtime_writes_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path()));
        store.spawn_save(PREDICTION_HISTORY_FILE, vec![1, 2, 3]);
        let loaded: Vec<i32> = store.load(PREDICTION_HISTORY_FILE).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }
}
