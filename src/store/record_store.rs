use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConsensusError, Result};
use crate::model::{ScanConsensus, ScanConsensusRecord};

/// Scan-indexed consensus document on disk.
///
/// Merges add or overwrite scan entries and never drop existing ones. Every
/// write goes to a sibling temp file that is renamed over the document.
#[derive(Debug, Clone)]
pub struct ConsensusRecordStore {
    path: PathBuf,
}

impl ConsensusRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ScanConsensusRecord> {
        if !self.path.exists() {
            return Ok(ScanConsensusRecord::new());
        }
        let data = fs::read(&self.path).map_err(|err| {
            ConsensusError::persistence(
                format!("failed to read consensus record: {}", self.path.display()),
                err,
            )
        })?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(ScanConsensusRecord::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn merge(&self, entries: &ScanConsensusRecord) -> Result<ScanConsensusRecord> {
        let mut record = self.load()?;
        for (scan_id, consensus) in entries {
            record.insert(scan_id.clone(), consensus.clone());
        }
        self.write_atomic(&record)?;
        debug!(
            path = %self.path.display(),
            merged = entries.len(),
            total = record.len(),
            "merged consensus record"
        );
        Ok(record)
    }

    pub fn scan(&self, scan_id: &str) -> Result<Option<ScanConsensus>> {
        Ok(self.load()?.remove(scan_id))
    }

    pub fn lookup(&self, scan_id: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .scan(scan_id)?
            .and_then(|mut consensus| consensus.remove(field))
            .flatten())
    }

    fn write_atomic(&self, record: &ScanConsensusRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                ConsensusError::persistence(
                    format!("failed to create directory: {}", parent.display()),
                    err,
                )
            })?;
        }

        let mut data = serde_json::to_vec_pretty(record)?;
        data.push(b'\n');

        let tmp_path = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            ConsensusError::persistence(
                format!("failed to write consensus record: {}", self.path.display()),
                err,
            )
        })
    }
}
