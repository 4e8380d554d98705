use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Duration, NaiveDate};
use serde_json::{Map, Value, json};
use tracing::{debug, error};
use uuid::Uuid;

use crate::clock::Clock;
use crate::directory::{Subscriber, TaxIdentifier};
use crate::domain::{Cnpj, DocumentCategory, Locale, OutcomeStatus, RetrievalMode};
use crate::error::SyncError;
use crate::fs_util::write_file_atomic;
use crate::outcome::{DocumentOutcome, FINGERPRINT_KEY, OutcomeStore, REQUEST_KEY};
use crate::parser::{ExtractedFields, Fingerprint, ParsedDocument};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub default_root: Utf8PathBuf,
    pub default_retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub cnpj: Cnpj,
    pub category: DocumentCategory,
    pub date: NaiveDate,
    pub offset: usize,
}

impl RequestContext {
    fn to_value(&self, mode: RetrievalMode) -> Value {
        json!({
            "cnpj": self.cnpj.as_str(),
            "category": self.category,
            "date": self.date.format("%Y-%m-%d").to_string(),
            "offset": self.offset,
            "mode": mode,
        })
    }
}

pub struct ArchiveWriter<'a, S: OutcomeStore + ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
    settings: &'a ArchiveSettings,
}

impl<'a, S: OutcomeStore + ?Sized> ArchiveWriter<'a, S> {
    pub fn new(store: &'a S, clock: &'a dyn Clock, settings: &'a ArchiveSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn archive(
        &self,
        parsed: &ParsedDocument,
        subscriber: &Subscriber,
        tax_identifier: &TaxIdentifier,
        mode: RetrievalMode,
        request: &RequestContext,
    ) -> Result<DocumentOutcome, SyncError> {
        let fields = &parsed.fields;
        let retrieved_at = self.clock.now();
        let retention = subscriber
            .retention_days
            .unwrap_or(self.settings.default_retention_days);
        let expires_at = retrieved_at + Duration::days(i64::from(retention));

        let root = self.resolve_root(subscriber, tax_identifier);
        let path = canonical_path(&root, fields, subscriber.locale);
        let file_name = path.file_name().unwrap_or("unknown.xml").to_string();

        let mut metadata = Map::new();
        metadata.insert(
            FINGERPRINT_KEY.to_string(),
            Value::String(parsed.fingerprint.to_string()),
        );
        metadata.insert("issuer".to_string(), Value::String(fields.issuer.clone()));
        metadata.insert("direction".to_string(), json!(fields.direction));
        metadata.insert(
            "direction_defaulted".to_string(),
            Value::Bool(fields.direction_defaulted),
        );
        metadata.insert("year".to_string(), json!(fields.year));
        metadata.insert("month".to_string(), json!(fields.month));
        metadata.insert(REQUEST_KEY.to_string(), request.to_value(mode));

        let mut outcome = DocumentOutcome {
            id: Uuid::new_v4(),
            file_name,
            file_path: String::new(),
            file_size: 0,
            category: fields.category,
            document_number: fields.document_number.clone(),
            document_date: fields.emission_date,
            retrieved_at,
            status: OutcomeStatus::Success,
            error_message: None,
            mode,
            tax_identifier_id: tax_identifier.id.clone(),
            subscriber_id: subscriber.id.clone(),
            expires_at,
            metadata,
        };

        let written = match occupied_by_other(&path, &parsed.fingerprint) {
            Some(existing) => Err(format!(
                "{path} already holds a different document ({existing})"
            )),
            None => write_file_atomic(&path, &parsed.content).map_err(|err| err.to_string()),
        };
        match written {
            Ok(size) => {
                debug!(path = %path, size, "document archived");
                outcome.file_path = path.to_string();
                outcome.file_size = size;
            }
            Err(reason) => {
                error!(path = %path, "failed to archive document: {reason}");
                outcome.status = OutcomeStatus::Failed;
                outcome.error_message = Some(format!("error saving file: {reason}"));
            }
        }

        self.store.insert(outcome.clone())?;
        Ok(outcome)
    }

    pub fn resolve_root(&self, subscriber: &Subscriber, tax_identifier: &TaxIdentifier) -> Utf8PathBuf {
        tax_identifier
            .storage_root
            .as_deref()
            .or(subscriber.storage_root.as_deref())
            .map(str::trim)
            .filter(|root| !root.is_empty())
            .map(|template| expand_root(template, &subscriber.id, &tax_identifier.cnpj))
            .unwrap_or_else(|| self.settings.default_root.clone())
    }
}

// Unnumbered documents of one issuer and month share a path; never replace
// a file holding other content.
fn occupied_by_other(path: &Utf8Path, fingerprint: &Fingerprint) -> Option<Fingerprint> {
    let existing = fs::read(path.as_std_path()).ok()?;
    let existing = Fingerprint::of(&existing);
    (existing != *fingerprint).then_some(existing)
}

pub fn expand_root(template: &str, subscriber_id: &str, cnpj: &Cnpj) -> Utf8PathBuf {
    Utf8PathBuf::from(
        template
            .replace("{subscriber}", subscriber_id)
            .replace("{cnpj}", cnpj.as_str()),
    )
}

pub fn canonical_path(root: &Utf8Path, fields: &ExtractedFields, locale: Locale) -> Utf8PathBuf {
    let year = fields
        .year
        .map(|year| format!("{year:04}"))
        .unwrap_or_else(|| "0000".to_string());
    let month = match fields.month {
        Some(month) => locale
            .month_name(month)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{month:02}")),
        None => "00".to_string(),
    };
    let number = fields
        .document_number
        .as_deref()
        .map(path_segment)
        .unwrap_or_else(|| "unknown".to_string());
    root.join(fields.category.folder())
        .join(fields.direction.label())
        .join(year)
        .join(month)
        .join(path_segment(&fields.issuer))
        .join(format!("{number}.xml"))
}

// Values come from remote payloads and must stay a single path component.
fn path_segment(value: &str) -> String {
    let cleaned = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
