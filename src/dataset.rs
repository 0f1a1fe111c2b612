//! The canonical, date-indexed weather dataset on disk.
//!
//! The file only grows: new batches are unioned with what is already there
//! and the result is re-sorted by date. Dates already present are never
//! overwritten.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;
use crate::PipelineError;
use crate::weather::{WeatherRecord, read_records, write_records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub appended: usize,
    pub skipped_duplicates: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct CanonicalDataset {
    path: PathBuf,
}

impl CanonicalDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads every record sorted by date. A missing file is an empty dataset.
    pub fn load(&self) -> Result<Vec<WeatherRecord>, PipelineError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let (mut records, dropped) = read_records(&self.path)?;
        if dropped > 0 {
            return Err(PipelineError::InvalidData(format!(
                "canonical dataset {} has {} unreadable rows",
                self.path.display(),
                dropped
            )));
        }
        records.sort_by_key(|r| r.date);
        Ok(records)
    }

    pub fn append(&self, incoming: &[WeatherRecord]) -> Result<MergeSummary, PipelineError> {
        let mut seen = HashSet::new();
        if let Some(dup) = incoming.iter().find(|r| !seen.insert(r.date)) {
            return Err(PipelineError::InvalidData(format!(
                "incoming batch contains {} more than once",
                dup.date
            )));
        }

        let mut merged: BTreeMap<_, WeatherRecord> = BTreeMap::new();
        for record in self.load()? {
            if merged.insert(record.date, record).is_some() {
                return Err(PipelineError::InvalidData(format!(
                    "canonical dataset {} contains duplicate dates",
                    self.path.display()
                )));
            }
        }

        let mut appended = 0;
        let mut skipped_duplicates = 0;
        for record in incoming {
            if merged.contains_key(&record.date) {
                skipped_duplicates += 1;
            } else {
                merged.insert(record.date, record.clone());
                appended += 1;
            }
        }

        let records: Vec<WeatherRecord> = merged.into_values().collect();
        let tmp = self.path.with_extension("csv.tmp");
        write_records(&tmp, &records)?;
        std::fs::rename(&tmp, &self.path)?;

        let summary = MergeSummary {
            appended,
            skipped_duplicates,
            total: records.len(),
        };
        info!(
            path = %self.path.display(),
            appended, skipped_duplicates, total = summary.total,
            "canonical dataset updated"
        );
        Ok(summary)
    }
}
