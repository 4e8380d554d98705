use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::fs_util::remove_file_if_exists;
use crate::outcome::{DocumentOutcome, OutcomeStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub deleted_count: usize,
    pub failed: usize,
}

pub struct RetentionSweeper<'a, S: OutcomeStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: OutcomeStore + ?Sized> RetentionSweeper<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn purge(&self, now: DateTime<Utc>) -> Result<PurgeReport, SyncError> {
        let expired = self.store.expired(now)?;
        let mut report = PurgeReport::default();
        for outcome in &expired {
            match self.remove(outcome) {
                Ok(()) => report.deleted_count += 1,
                Err(err) => {
                    warn!(outcome = %outcome.id, "failed to purge outcome: {err}");
                    report.failed += 1;
                }
            }
        }
        info!(
            deleted = report.deleted_count,
            failed = report.failed,
            "retention sweep finished"
        );
        Ok(report)
    }

    pub fn remove(&self, outcome: &DocumentOutcome) -> Result<(), SyncError> {
        remove_archived_file(&outcome.file_path)?;
        self.store.delete(outcome.id)?;
        Ok(())
    }

    pub fn remove_by_id(&self, id: Uuid) -> Result<(), SyncError> {
        let outcome = self
            .store
            .get(id)?
            .ok_or_else(|| SyncError::OutcomeNotFound(id.to_string()))?;
        self.remove(&outcome)
    }
}

fn remove_archived_file(file_path: &str) -> Result<(), SyncError> {
    if file_path.is_empty() {
        return Ok(());
    }
    let removed = remove_file_if_exists(Path::new(file_path))
        .map_err(|err| SyncError::Filesystem(format!("remove {file_path}: {err}")))?;
    if !removed {
        debug!(path = file_path, "archived file already gone");
    }
    Ok(())
}
