use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveSettings, ArchiveWriter, RequestContext};
use crate::clock::{Clock, SystemClock};
use crate::dedup::DuplicateGuard;
use crate::directory::{Subscriber, SubscriberDirectory, TaxIdentifier};
use crate::domain::{DateRange, DocumentCategory, OutcomeStatus, RetrievalMode};
use crate::error::SyncError;
use crate::outcome::{DocumentOutcome, OutcomeFilter, OutcomePage, OutcomeStore};
use crate::pacing::Pacer;
use crate::parser;
use crate::source::{DocumentSource, PAGE_SIZE, PageRequest, RawDocument};
use crate::sweeper::{PurgeReport, RetentionSweeper};

pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub page_delay: Duration,
    pub archive: ArchiveSettings,
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub tax_identifier_id: String,
    pub cnpj: String,
    pub category: DocumentCategory,
    pub date: NaiveDate,
    pub offset: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub tax_identifier_id: String,
    pub cnpj: String,
    pub category: DocumentCategory,
    pub date: NaiveDate,
    pub pages: usize,
    pub documents_seen: usize,
    pub documents_archived: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
    pub write_failures: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub subscriber_id: String,
    pub mode: RetrievalMode,
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub documents_seen: usize,
    pub documents_archived: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
    pub write_failures: usize,
    pub failures: Vec<UnitFailure>,
    pub units: Vec<UnitReport>,
}

impl RunSummary {
    fn absorb(&mut self, unit: UnitReport) {
        self.documents_seen += unit.documents_seen;
        self.documents_archived += unit.documents_archived;
        self.duplicates += unit.duplicates;
        self.parse_failures += unit.parse_failures;
        self.write_failures += unit.write_failures;
        self.units.push(unit);
    }
}

enum DocumentResult {
    Archived,
    Duplicate,
    ParseFailed,
    WriteFailed,
}

struct RunScope<'a> {
    subscriber: &'a Subscriber,
    credential: &'a str,
    mode: RetrievalMode,
    pacer: &'a Pacer,
}

struct RunLock<'a> {
    running: &'a Mutex<HashSet<String>>,
    subscriber_id: String,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.subscriber_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Engine<S: DocumentSource, O: OutcomeStore, D: SubscriberDirectory> {
    source: S,
    store: O,
    directory: D,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    running: Mutex<HashSet<String>>,
}

impl<S: DocumentSource, O: OutcomeStore, D: SubscriberDirectory> Engine<S, O, D> {
    pub fn new(source: S, store: O, directory: D, settings: EngineSettings) -> Self {
        Self::with_clock(source, store, directory, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: S,
        store: O,
        directory: D,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            store,
            directory,
            clock,
            settings,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn run_for_subscriber(
        &self,
        subscriber_id: &str,
        mode: RetrievalMode,
        categories: Option<&[DocumentCategory]>,
        range: Option<DateRange>,
    ) -> Result<RunSummary, SyncError> {
        let subscriber = self.load_subscriber(subscriber_id)?;
        let tax_identifiers = self.directory.active_tax_identifiers(subscriber_id)?;
        self.run(&subscriber, &tax_identifiers, mode, categories, range)
    }

    pub fn run_for_tax_identifier(
        &self,
        subscriber_id: &str,
        tax_identifier_id: &str,
        categories: Option<&[DocumentCategory]>,
        range: Option<DateRange>,
        mode: RetrievalMode,
    ) -> Result<RunSummary, SyncError> {
        self.run_for_tax_identifiers(subscriber_id, &[tax_identifier_id], categories, range, mode)
    }

    // One locked run over several tax identifiers of the same subscriber.
    // Unknown or inactive ids are skipped unless none remain.
    pub fn run_for_tax_identifiers(
        &self,
        subscriber_id: &str,
        tax_identifier_ids: &[&str],
        categories: Option<&[DocumentCategory]>,
        range: Option<DateRange>,
        mode: RetrievalMode,
    ) -> Result<RunSummary, SyncError> {
        let subscriber = self.load_subscriber(subscriber_id)?;
        let active = self.directory.active_tax_identifiers(subscriber_id)?;
        for id in tax_identifier_ids {
            if !active.iter().any(|tax| tax.id == *id) {
                warn!(subscriber = subscriber_id, tax_identifier = *id, "tax identifier not active, skipped");
            }
        }
        let selected = active
            .into_iter()
            .filter(|tax| tax_identifier_ids.contains(&tax.id.as_str()))
            .collect::<Vec<_>>();
        if selected.is_empty() {
            return Err(SyncError::TaxIdentifierNotFound(tax_identifier_ids.join(",")));
        }
        self.run(&subscriber, &selected, mode, categories, range)
    }

    pub fn purge_expired(&self) -> Result<PurgeReport, SyncError> {
        RetentionSweeper::new(&self.store).purge(self.clock.now())
    }

    pub fn delete_outcome(&self, id: Uuid) -> Result<(), SyncError> {
        RetentionSweeper::new(&self.store).remove_by_id(id)
    }

    pub fn outcomes(&self, filter: &OutcomeFilter) -> Result<OutcomePage, SyncError> {
        self.store.query(filter)
    }

    pub fn outcome(&self, id: Uuid) -> Result<Option<DocumentOutcome>, SyncError> {
        self.store.get(id)
    }

    pub fn default_range(&self, subscriber: &Subscriber) -> DateRange {
        let days = self
            .settings
            .window_days
            .unwrap_or_else(|| subscriber.plan.sync_window_days());
        let today = self.clock.now().with_timezone(&Local).date_naive();
        DateRange::trailing(today, days)
    }

    fn load_subscriber(&self, subscriber_id: &str) -> Result<Subscriber, SyncError> {
        let subscriber = self
            .directory
            .subscriber(subscriber_id)?
            .ok_or_else(|| SyncError::SubscriberNotFound(subscriber_id.to_string()))?;
        if subscriber.credential().is_none() {
            return Err(SyncError::MissingCredential(subscriber_id.to_string()));
        }
        Ok(subscriber)
    }

    fn acquire(&self, subscriber_id: &str) -> Result<RunLock<'_>, SyncError> {
        let mut running = lock(&self.running);
        if !running.insert(subscriber_id.to_string()) {
            return Err(SyncError::RunInProgress(subscriber_id.to_string()));
        }
        Ok(RunLock {
            running: &self.running,
            subscriber_id: subscriber_id.to_string(),
        })
    }

    fn run(
        &self,
        subscriber: &Subscriber,
        tax_identifiers: &[TaxIdentifier],
        mode: RetrievalMode,
        categories: Option<&[DocumentCategory]>,
        range: Option<DateRange>,
    ) -> Result<RunSummary, SyncError> {
        let credential = subscriber
            .credential()
            .ok_or_else(|| SyncError::MissingCredential(subscriber.id.clone()))?;
        let _guard = self.acquire(&subscriber.id)?;
        let range = range.unwrap_or_else(|| self.default_range(subscriber));
        let started_at = self.clock.now();
        info!(
            subscriber = %subscriber.id,
            mode = %mode,
            start = %range.start,
            end = %range.end,
            tax_identifiers = tax_identifiers.len(),
            "run started"
        );

        let mut summary = RunSummary {
            subscriber_id: subscriber.id.clone(),
            mode,
            range,
            started_at,
            finished_at: started_at,
            documents_seen: 0,
            documents_archived: 0,
            duplicates: 0,
            parse_failures: 0,
            write_failures: 0,
            failures: Vec::new(),
            units: Vec::new(),
        };

        let pacer = Pacer::new(self.settings.page_delay);
        let scope = RunScope {
            subscriber,
            credential,
            mode,
            pacer: &pacer,
        };
        let selections = tax_identifiers
            .iter()
            .map(|tax| match categories {
                Some(requested) => requested.to_vec(),
                None => tax.categories(subscriber),
            })
            .collect::<Vec<_>>();

        for category in DocumentCategory::ALL {
            if !selections.iter().any(|selected| selected.contains(&category)) {
                continue;
            }
            for date in range.days() {
                for (tax, selected) in tax_identifiers.iter().zip(&selections) {
                    if !selected.contains(&category) {
                        continue;
                    }
                    let unit = self.run_unit(&scope, tax, category, date, &mut summary.failures);
                    summary.absorb(unit);
                }
            }
        }

        summary.finished_at = self.clock.now();
        info!(
            subscriber = %subscriber.id,
            seen = summary.documents_seen,
            archived = summary.documents_archived,
            duplicates = summary.duplicates,
            parse_failures = summary.parse_failures,
            write_failures = summary.write_failures,
            unit_failures = summary.failures.len(),
            "run finished"
        );
        Ok(summary)
    }

    fn run_unit(
        &self,
        scope: &RunScope<'_>,
        tax: &TaxIdentifier,
        category: DocumentCategory,
        date: NaiveDate,
        failures: &mut Vec<UnitFailure>,
    ) -> UnitReport {
        let mut unit = UnitReport {
            tax_identifier_id: tax.id.clone(),
            cnpj: tax.cnpj.as_str().to_string(),
            category,
            date,
            pages: 0,
            documents_seen: 0,
            documents_archived: 0,
            duplicates: 0,
            parse_failures: 0,
            write_failures: 0,
            completed: false,
        };
        let mut offset = 0;
        loop {
            scope.pacer.wait();
            let request = PageRequest {
                credential: scope.credential,
                cnpj: &tax.cnpj,
                date,
                category,
                offset,
            };
            let result = self
                .source
                .fetch(&request)
                .and_then(|page| {
                    unit.pages += 1;
                    debug!(
                        cnpj = %tax.cnpj,
                        category = %category,
                        date = %date,
                        offset,
                        documents = page.documents.len(),
                        "page received"
                    );
                    let context = RequestContext {
                        cnpj: tax.cnpj.clone(),
                        category,
                        date,
                        offset,
                    };
                    for raw in &page.documents {
                        unit.documents_seen += 1;
                        match self.process_document(scope, tax, raw, &context)? {
                            DocumentResult::Archived => unit.documents_archived += 1,
                            DocumentResult::Duplicate => unit.duplicates += 1,
                            DocumentResult::ParseFailed => unit.parse_failures += 1,
                            DocumentResult::WriteFailed => unit.write_failures += 1,
                        }
                    }
                    Ok(page.has_more)
                });
            match result {
                Ok(true) => offset += PAGE_SIZE,
                Ok(false) => {
                    unit.completed = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        cnpj = %tax.cnpj,
                        category = %category,
                        date = %date,
                        offset,
                        "unit ended early: {err}"
                    );
                    failures.push(UnitFailure {
                        tax_identifier_id: tax.id.clone(),
                        cnpj: tax.cnpj.as_str().to_string(),
                        category,
                        date,
                        offset,
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
        unit
    }

    fn process_document(
        &self,
        scope: &RunScope<'_>,
        tax: &TaxIdentifier,
        raw: &RawDocument,
        context: &RequestContext,
    ) -> Result<DocumentResult, SyncError> {
        let parsed = match parser::parse(raw, context.category) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    cnpj = %tax.cnpj,
                    category = %context.category,
                    date = %context.date,
                    "skipping document: {err}"
                );
                return Ok(DocumentResult::ParseFailed);
            }
        };
        if parsed.fields.direction_defaulted {
            warn!(
                cnpj = %tax.cnpj,
                number = parsed.fields.document_number.as_deref().unwrap_or("unknown"),
                "direction code missing or unknown, filed as outbound"
            );
        }

        let guard = DuplicateGuard::new(&self.store);
        if let Some(found) = guard.find_match(
            &tax.id,
            parsed.fields.document_number.as_deref(),
            &parsed.fingerprint,
        )? {
            debug!(
                cnpj = %tax.cnpj,
                number = parsed.fields.document_number.as_deref().unwrap_or("unknown"),
                matched = ?found,
                "duplicate skipped"
            );
            return Ok(DocumentResult::Duplicate);
        }

        let writer = ArchiveWriter::new(&self.store, self.clock.as_ref(), &self.settings.archive);
        match writer.archive(&parsed, scope.subscriber, tax, scope.mode, context) {
            Ok(outcome) if outcome.status == OutcomeStatus::Success => Ok(DocumentResult::Archived),
            Ok(_) => Ok(DocumentResult::WriteFailed),
            Err(err) => {
                error!(cnpj = %tax.cnpj, "failed to record outcome: {err}");
                Ok(DocumentResult::WriteFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use chrono::TimeZone;

    use super::*;
    use crate::archive::DEFAULT_RETENTION_DAYS;
    use crate::clock::ManualClock;
    use crate::directory::StaticDirectory;
    use crate::domain::{Locale, PlanTier};
    use crate::outcome::MemoryOutcomeStore;
    use crate::source::DocumentPage;

    struct EmptySource {
        calls: AtomicUsize,
    }

    impl DocumentSource for EmptySource {
        fn fetch(&self, _request: &PageRequest<'_>) -> Result<DocumentPage, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DocumentPage::empty())
        }
    }

    fn subscriber(plan: PlanTier) -> Subscriber {
        Subscriber {
            id: "sub-1".to_string(),
            credential: Some("secret-key".to_string()),
            document_types: vec![DocumentCategory::Nfe, DocumentCategory::Cte],
            storage_root: None,
            retention_days: None,
            notifications: Default::default(),
            schedule: None,
            plan,
            locale: Locale::PtBr,
        }
    }

    fn tax(id: &str, types: Option<Vec<DocumentCategory>>) -> TaxIdentifier {
        TaxIdentifier {
            id: id.to_string(),
            cnpj: "11222333000181".parse().unwrap(),
            active: true,
            subscriber_id: "sub-1".to_string(),
            document_types: types,
            storage_root: None,
            schedule: None,
        }
    }

    fn engine(
        directory: StaticDirectory,
        clock: Arc<ManualClock>,
    ) -> Engine<EmptySource, MemoryOutcomeStore, StaticDirectory> {
        let settings = EngineSettings {
            page_delay: Duration::ZERO,
            archive: ArchiveSettings {
                default_root: Utf8PathBuf::from("/tmp/xml-sync-unused"),
                default_retention_days: DEFAULT_RETENTION_DAYS,
            },
            window_days: None,
        };
        Engine::with_clock(
            EmptySource {
                calls: AtomicUsize::new(0),
            },
            MemoryOutcomeStore::new(),
            directory,
            settings,
            clock,
        )
    }

    #[test]
    fn default_range_follows_plan_tier() {
        let evening = Local.with_ymd_and_hms(2024, 3, 10, 22, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(evening.with_timezone(&Utc)));
        let engine = engine(StaticDirectory::default(), clock);
        let range = engine.default_range(&subscriber(PlanTier::Starter));
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }

    #[test]
    fn units_follow_category_then_date_then_tax_identifier() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory = StaticDirectory::new(
            vec![subscriber(PlanTier::Free)],
            vec![
                tax("tax-a", None),
                tax("tax-b", Some(vec![DocumentCategory::Nfe])),
            ],
        );
        let engine = engine(directory, clock);
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        )
        .unwrap();
        let summary = engine
            .run_for_subscriber("sub-1", RetrievalMode::Manual, None, Some(range))
            .unwrap();
        let order = summary
            .units
            .iter()
            .map(|unit| (unit.category, unit.date.to_string(), unit.tax_identifier_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                (DocumentCategory::Nfe, "2024-03-01".to_string(), "tax-a"),
                (DocumentCategory::Nfe, "2024-03-01".to_string(), "tax-b"),
                (DocumentCategory::Nfe, "2024-03-02".to_string(), "tax-a"),
                (DocumentCategory::Nfe, "2024-03-02".to_string(), "tax-b"),
                (DocumentCategory::Cte, "2024-03-01".to_string(), "tax-a"),
                (DocumentCategory::Cte, "2024-03-02".to_string(), "tax-a"),
            ]
        );
        assert_eq!(engine.source.calls.load(Ordering::SeqCst), 6);
        assert!(summary.units.iter().all(|unit| unit.completed));
    }

    #[test]
    fn overlapping_run_is_rejected() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory = StaticDirectory::new(vec![subscriber(PlanTier::Free)], vec![]);
        let engine = engine(directory, clock);
        let held = engine.acquire("sub-1").unwrap();
        assert_matches!(
            engine.run_for_subscriber("sub-1", RetrievalMode::Scheduled, None, None),
            Err(SyncError::RunInProgress(id)) if id == "sub-1"
        );
        drop(held);
        assert!(
            engine
                .run_for_subscriber("sub-1", RetrievalMode::Scheduled, None, None)
                .is_ok()
        );
    }

    #[test]
    fn unknown_tax_identifier_is_a_configuration_error() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory =
            StaticDirectory::new(vec![subscriber(PlanTier::Free)], vec![tax("tax-a", None)]);
        let engine = engine(directory, clock);
        let err = engine
            .run_for_tax_identifier("sub-1", "tax-z", None, None, RetrievalMode::Manual)
            .unwrap_err();
        assert_matches!(&err, SyncError::TaxIdentifierNotFound(_));
        assert!(err.is_configuration());
    }

    #[test]
    fn several_tax_identifiers_share_one_run() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory = StaticDirectory::new(
            vec![subscriber(PlanTier::Free)],
            vec![
                tax("tax-a", Some(vec![DocumentCategory::Nfe])),
                tax("tax-b", Some(vec![DocumentCategory::Nfe])),
                tax("tax-c", Some(vec![DocumentCategory::Nfe])),
            ],
        );
        let engine = engine(directory, clock);
        let summary = engine
            .run_for_tax_identifiers(
                "sub-1",
                &["tax-c", "tax-a", "tax-gone"],
                None,
                Some(DateRange::single(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())),
                RetrievalMode::Scheduled,
            )
            .unwrap();
        let ids = summary
            .units
            .iter()
            .map(|unit| unit.tax_identifier_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["tax-a", "tax-c"]);
        assert_matches!(
            engine.run_for_tax_identifiers("sub-1", &["tax-gone"], None, None, RetrievalMode::Scheduled),
            Err(SyncError::TaxIdentifierNotFound(_))
        );
    }
}
