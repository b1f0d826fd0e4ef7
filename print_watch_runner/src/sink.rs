// THEORY:
// Print records are appended to a file as one JSON object per line and flushed
// after every write, so a record survives the runner being killed right after
// a session ends.

use print_watch::{PrintRecord, StorageError, StorageSink};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Appends one JSON object per stored record.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl StorageSink for JsonLinesSink {
    fn save(&self, record: &PrintRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(record).map_err(|e| StorageError::Rejected(e.to_string()))?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{line}")?;
        file.flush()?;
        info!(path = %self.path.display(), status = %record.status, "print record written");
        Ok(())
    }
}
