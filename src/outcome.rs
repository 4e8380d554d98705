use std::collections::HashMap;
use std::fs;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{DocumentCategory, OutcomeStatus, RetrievalMode};
use crate::error::SyncError;
use crate::fs_util::{list_json_files, remove_file_if_exists, write_file_atomic};

pub const FINGERPRINT_KEY: &str = "fingerprint";
pub const REQUEST_KEY: &str = "request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub category: DocumentCategory,
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub retrieved_at: DateTime<Utc>,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
    pub mode: RetrievalMode,
    pub tax_identifier_id: String,
    pub subscriber_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DocumentOutcome {
    pub fn fingerprint(&self) -> Option<&str> {
        self.metadata.get(FINGERPRINT_KEY).and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutcomeFilter {
    pub subscriber_id: Option<String>,
    pub tax_identifier_id: Option<String>,
    pub category: Option<DocumentCategory>,
    pub status: Option<OutcomeStatus>,
    pub retrieved_from: Option<NaiveDate>,
    pub retrieved_to: Option<NaiveDate>,
    pub page: usize,
    pub limit: usize,
}

impl OutcomeFilter {
    fn matches(&self, outcome: &DocumentOutcome) -> bool {
        let day = outcome.retrieved_at.date_naive();
        self.subscriber_id
            .as_ref()
            .is_none_or(|id| *id == outcome.subscriber_id)
            && self
                .tax_identifier_id
                .as_ref()
                .is_none_or(|id| *id == outcome.tax_identifier_id)
            && self.category.is_none_or(|category| category == outcome.category)
            && self.status.is_none_or(|status| status == outcome.status)
            && self.retrieved_from.is_none_or(|from| day >= from)
            && self.retrieved_to.is_none_or(|to| day <= to)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomePage {
    pub items: Vec<DocumentOutcome>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

pub trait OutcomeStore: Send + Sync {
    fn insert(&self, outcome: DocumentOutcome) -> Result<(), SyncError>;

    fn get(&self, id: Uuid) -> Result<Option<DocumentOutcome>, SyncError>;

    fn delete(&self, id: Uuid) -> Result<bool, SyncError>;

    fn has_success_with_number(
        &self,
        tax_identifier_id: &str,
        document_number: &str,
    ) -> Result<bool, SyncError>;

    fn has_success_with_fingerprint(
        &self,
        tax_identifier_id: &str,
        fingerprint: &str,
    ) -> Result<bool, SyncError>;

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<DocumentOutcome>, SyncError>;

    fn query(&self, filter: &OutcomeFilter) -> Result<OutcomePage, SyncError>;
}

fn paginate(mut matching: Vec<DocumentOutcome>, filter: &OutcomeFilter) -> OutcomePage {
    matching.sort_by(|a, b| b.retrieved_at.cmp(&a.retrieved_at).then(a.id.cmp(&b.id)));
    let total = matching.len();
    let limit = if filter.limit == 0 { total.max(1) } else { filter.limit };
    let page = filter.page.max(1);
    let items = matching
        .into_iter()
        .skip((page - 1) * limit)
        .take(limit)
        .collect();
    OutcomePage {
        items,
        total,
        page,
        limit,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryOutcomeStore {
    records: Mutex<HashMap<Uuid, DocumentOutcome>>,
}

impl MemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    pub fn all(&self) -> Vec<DocumentOutcome> {
        lock(&self.records).values().cloned().collect()
    }
}

impl OutcomeStore for MemoryOutcomeStore {
    fn insert(&self, outcome: DocumentOutcome) -> Result<(), SyncError> {
        lock(&self.records).insert(outcome.id, outcome);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<DocumentOutcome>, SyncError> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    fn delete(&self, id: Uuid) -> Result<bool, SyncError> {
        Ok(lock(&self.records).remove(&id).is_some())
    }

    fn has_success_with_number(
        &self,
        tax_identifier_id: &str,
        document_number: &str,
    ) -> Result<bool, SyncError> {
        Ok(lock(&self.records).values().any(|outcome| {
            outcome.is_success()
                && outcome.tax_identifier_id == tax_identifier_id
                && outcome.document_number.as_deref() == Some(document_number)
        }))
    }

    fn has_success_with_fingerprint(
        &self,
        tax_identifier_id: &str,
        fingerprint: &str,
    ) -> Result<bool, SyncError> {
        Ok(lock(&self.records).values().any(|outcome| {
            outcome.is_success()
                && outcome.tax_identifier_id == tax_identifier_id
                && outcome.fingerprint() == Some(fingerprint)
        }))
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<DocumentOutcome>, SyncError> {
        Ok(lock(&self.records)
            .values()
            .filter(|outcome| outcome.is_expired(now))
            .cloned()
            .collect())
    }

    fn query(&self, filter: &OutcomeFilter) -> Result<OutcomePage, SyncError> {
        let matching = lock(&self.records)
            .values()
            .filter(|outcome| filter.matches(outcome))
            .cloned()
            .collect();
        Ok(paginate(matching, filter))
    }
}

#[derive(Debug)]
pub struct FileOutcomeStore {
    root: Utf8PathBuf,
    index: MemoryOutcomeStore,
    skipped: usize,
}

impl FileOutcomeStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, SyncError> {
        let root = root.into();
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("create {root}: {err}")))?;
        let index = MemoryOutcomeStore::new();
        let mut skipped = 0;
        for path in list_json_files(root.as_std_path())? {
            let decoded = fs::read_to_string(&path)
                .map_err(|err| format!("read failed: {err}"))
                .and_then(|content| {
                    serde_json::from_str::<DocumentOutcome>(&content)
                        .map_err(|err| format!("decode failed: {err}"))
                });
            match decoded {
                Ok(outcome) => index.insert(outcome)?,
                Err(reason) => {
                    warn!(path = %path.display(), "unreadable outcome record skipped: {reason}");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(root = %root, skipped, "outcome store opened with unreadable records");
        }
        Ok(Self {
            root,
            index,
            skipped,
        })
    }

    pub fn skipped_records(&self) -> usize {
        self.skipped
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> Utf8PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

impl OutcomeStore for FileOutcomeStore {
    fn insert(&self, outcome: DocumentOutcome) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(&outcome)
            .map_err(|err| SyncError::Store(err.to_string()))?;
        write_file_atomic(&self.record_path(outcome.id), &content)?;
        self.index.insert(outcome)
    }

    fn get(&self, id: Uuid) -> Result<Option<DocumentOutcome>, SyncError> {
        self.index.get(id)
    }

    fn delete(&self, id: Uuid) -> Result<bool, SyncError> {
        let path = self.record_path(id);
        remove_file_if_exists(path.as_std_path())
            .map_err(|err| SyncError::Store(format!("remove {path}: {err}")))?;
        self.index.delete(id)
    }

    fn has_success_with_number(
        &self,
        tax_identifier_id: &str,
        document_number: &str,
    ) -> Result<bool, SyncError> {
        self.index
            .has_success_with_number(tax_identifier_id, document_number)
    }

    fn has_success_with_fingerprint(
        &self,
        tax_identifier_id: &str,
        fingerprint: &str,
    ) -> Result<bool, SyncError> {
        self.index
            .has_success_with_fingerprint(tax_identifier_id, fingerprint)
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<DocumentOutcome>, SyncError> {
        self.index.expired(now)
    }

    fn query(&self, filter: &OutcomeFilter) -> Result<OutcomePage, SyncError> {
        self.index.query(filter)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn outcome(number: Option<&str>, fingerprint: &str, status: OutcomeStatus) -> DocumentOutcome {
        let retrieved_at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let mut metadata = Map::new();
        metadata.insert(FINGERPRINT_KEY.to_string(), json!(fingerprint));
        DocumentOutcome {
            id: Uuid::new_v4(),
            file_name: format!("{}.xml", number.unwrap_or("unknown")),
            file_path: String::new(),
            file_size: 0,
            category: DocumentCategory::Nfe,
            document_number: number.map(str::to_string),
            document_date: None,
            retrieved_at,
            status,
            error_message: None,
            mode: RetrievalMode::Manual,
            tax_identifier_id: "tax-1".to_string(),
            subscriber_id: "sub-1".to_string(),
            expires_at: retrieved_at + Duration::days(7),
            metadata,
        }
    }

    #[test]
    fn failed_records_do_not_count_as_success() {
        let store = MemoryOutcomeStore::new();
        store
            .insert(outcome(Some("10"), "abc", OutcomeStatus::Failed))
            .unwrap();
        assert!(!store.has_success_with_number("tax-1", "10").unwrap());
        assert!(!store.has_success_with_fingerprint("tax-1", "abc").unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("outcomes")).unwrap();
        let record = outcome(Some("10"), "abc", OutcomeStatus::Success);
        let id = record.id;
        {
            let store = FileOutcomeStore::open(root.clone()).unwrap();
            store.insert(record.clone()).unwrap();
        }
        let store = FileOutcomeStore::open(root).unwrap();
        assert_eq!(store.get(id).unwrap(), Some(record));
        assert!(store.has_success_with_fingerprint("tax-1", "abc").unwrap());
        assert!(store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn query_filters_and_paginates() {
        let store = MemoryOutcomeStore::new();
        for number in 0..5 {
            let mut record = outcome(Some(&number.to_string()), "x", OutcomeStatus::Success);
            record.retrieved_at += Duration::minutes(number);
            store.insert(record).unwrap();
        }
        store
            .insert(outcome(Some("99"), "y", OutcomeStatus::Failed))
            .unwrap();

        let page = store
            .query(&OutcomeFilter {
                status: Some(OutcomeStatus::Success),
                page: 1,
                limit: 2,
                ..OutcomeFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].document_number.as_deref(), Some("4"));
    }

    #[test]
    fn corrupt_records_are_skipped_on_open() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("outcomes")).unwrap();
        let record = outcome(Some("10"), "abc", OutcomeStatus::Success);
        {
            let store = FileOutcomeStore::open(root.clone()).unwrap();
            store.insert(record.clone()).unwrap();
        }
        fs::write(root.join("truncated.json"), "{ \"id\": ").unwrap();
        fs::write(root.join("other.json"), "[1, 2, 3]").unwrap();

        let store = FileOutcomeStore::open(root).unwrap();
        assert_eq!(store.skipped_records(), 2);
        assert_eq!(store.get(record.id).unwrap(), Some(record));
    }
}
