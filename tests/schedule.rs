use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use fiscal_xml_sync::archive::ArchiveSettings;
use fiscal_xml_sync::directory::{SchedulePreference, StaticDirectory, Subscriber, TaxIdentifier};
use fiscal_xml_sync::domain::{DocumentCategory, Locale, PlanTier};
use fiscal_xml_sync::engine::{Engine, EngineSettings};
use fiscal_xml_sync::error::SyncError;
use fiscal_xml_sync::outcome::MemoryOutcomeStore;
use fiscal_xml_sync::schedule::{ScheduleManager, TriggerTarget};
use fiscal_xml_sync::source::{DocumentPage, DocumentSource, PageRequest};

struct NoDocuments;

impl DocumentSource for NoDocuments {
    fn fetch(&self, _request: &PageRequest<'_>) -> Result<DocumentPage, SyncError> {
        Ok(DocumentPage::empty())
    }
}

fn engine() -> Engine<NoDocuments, MemoryOutcomeStore, StaticDirectory> {
    let subscriber = Subscriber {
        id: "sub-1".to_string(),
        credential: Some("key".to_string()),
        document_types: vec![DocumentCategory::Nfe],
        storage_root: None,
        retention_days: None,
        notifications: Default::default(),
        schedule: Some(SchedulePreference {
            frequency: "2x ao dia".to_string(),
            times: vec!["08:30".parse().unwrap()],
        }),
        plan: PlanTier::Free,
        locale: Locale::PtBr,
    };
    let tax = TaxIdentifier {
        id: "tax-1".to_string(),
        cnpj: "11222333000181".parse().unwrap(),
        active: true,
        subscriber_id: "sub-1".to_string(),
        document_types: None,
        storage_root: None,
        schedule: None,
    };
    Engine::new(
        NoDocuments,
        MemoryOutcomeStore::new(),
        StaticDirectory::new(vec![subscriber], vec![tax]),
        EngineSettings {
            page_delay: Duration::ZERO,
            archive: ArchiveSettings {
                default_root: Utf8PathBuf::from("/tmp/xml-sync-schedule-test"),
                default_retention_days: 30,
            },
            window_days: None,
        },
    )
}

#[test]
fn plan_reflects_preferences() {
    let manager = ScheduleManager::new(Arc::new(engine()), 2);
    let plan = manager.plan().unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].target, TriggerTarget::Subscriber);
    assert_eq!(plan[0].expression, "0 30 8,20 * * *");
}

#[test]
fn scheduler_starts_and_stops() {
    let manager = ScheduleManager::new(Arc::new(engine()), 2);
    let handle = manager.start().unwrap();
    handle.shutdown();
}
