use serde::{Deserialize, Serialize};

use crate::domain::{Cnpj, DocumentCategory, Locale, PlanTier, TimeOfDay};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePreference {
    pub frequency: String,
    #[serde(default)]
    pub times: Vec<TimeOfDay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub download_complete: bool,
    #[serde(default)]
    pub download_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub document_types: Vec<DocumentCategory>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub schedule: Option<SchedulePreference>,
    #[serde(default)]
    pub plan: PlanTier,
    #[serde(default)]
    pub locale: Locale,
}

impl Subscriber {
    pub fn credential(&self) -> Option<&str> {
        self.credential
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn categories(&self) -> Vec<DocumentCategory> {
        if self.document_types.is_empty() {
            vec![DocumentCategory::Nfe]
        } else {
            self.document_types.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxIdentifier {
    pub id: String,
    pub cnpj: Cnpj,
    pub active: bool,
    pub subscriber_id: String,
    #[serde(default)]
    pub document_types: Option<Vec<DocumentCategory>>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub schedule: Option<SchedulePreference>,
}

impl TaxIdentifier {
    pub fn categories(&self, subscriber: &Subscriber) -> Vec<DocumentCategory> {
        match &self.document_types {
            Some(types) if !types.is_empty() => types.clone(),
            _ => subscriber.categories(),
        }
    }
}

pub trait SubscriberDirectory: Send + Sync {
    fn subscriber(&self, id: &str) -> Result<Option<Subscriber>, SyncError>;

    fn subscribers(&self) -> Result<Vec<Subscriber>, SyncError>;

    fn active_tax_identifiers(&self, subscriber_id: &str) -> Result<Vec<TaxIdentifier>, SyncError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    subscribers: Vec<Subscriber>,
    tax_identifiers: Vec<TaxIdentifier>,
}

impl StaticDirectory {
    pub fn new(subscribers: Vec<Subscriber>, tax_identifiers: Vec<TaxIdentifier>) -> Self {
        Self {
            subscribers,
            tax_identifiers,
        }
    }
}

impl SubscriberDirectory for StaticDirectory {
    fn subscriber(&self, id: &str) -> Result<Option<Subscriber>, SyncError> {
        Ok(self.subscribers.iter().find(|sub| sub.id == id).cloned())
    }

    fn subscribers(&self) -> Result<Vec<Subscriber>, SyncError> {
        Ok(self.subscribers.clone())
    }

    fn active_tax_identifiers(&self, subscriber_id: &str) -> Result<Vec<TaxIdentifier>, SyncError> {
        Ok(self
            .tax_identifiers
            .iter()
            .filter(|tax| tax.active && tax.subscriber_id == subscriber_id)
            .cloned()
            .collect())
    }
}
