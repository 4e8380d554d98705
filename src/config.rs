use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveSettings, DEFAULT_RETENTION_DAYS};
use crate::directory::{NotificationSettings, SchedulePreference, StaticDirectory, Subscriber, TaxIdentifier};
use crate::domain::{Cnpj, DocumentCategory, Locale, PlanTier, TimeOfDay};
use crate::engine::{DEFAULT_PAGE_DELAY, EngineSettings};
use crate::error::SyncError;
use crate::schedule::DEFAULT_WORKERS;
use crate::source::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "xml-sync.json";
pub const DEFAULT_API_BASE_URL: &str = "https://api.sieg.com";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub subscribers: Vec<SubscriberEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub page_delay_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_storage_root: Option<String>,
    #[serde(default)]
    pub default_retention_days: Option<u32>,
    #[serde(default)]
    pub window_days: Option<u32>,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubscriberEntry {
    pub id: String,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub document_types: Vec<String>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub schedule: Option<ScheduleEntry>,
    #[serde(default)]
    pub plan: PlanTier,
    #[serde(default)]
    pub locale: Locale,
    #[serde(default)]
    pub tax_identifiers: Vec<TaxIdentifierEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScheduleEntry {
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default)]
    pub times: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TaxIdentifierEntry {
    Shorthand(String),
    Detailed(TaxIdentifierObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TaxIdentifierObject {
    #[serde(default)]
    pub id: Option<String>,
    pub cnpj: String,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub document_types: Option<Vec<String>>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleEntry>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub api_base_url: String,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub engine: EngineSettings,
    pub state_dir: Utf8PathBuf,
    pub workers: usize,
}

impl RuntimeSettings {
    pub fn outcomes_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("outcomes")
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub settings: RuntimeSettings,
    pub directory: StaticDirectory,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let settings = resolve_settings(config.engine)?;

        let mut subscribers = Vec::new();
        let mut tax_identifiers = Vec::new();
        for entry in config.subscribers {
            let document_types = parse_categories(&entry.document_types)?;
            for tax in entry.tax_identifiers {
                tax_identifiers.push(resolve_tax_identifier(tax, &entry.id)?);
            }
            subscribers.push(Subscriber {
                id: entry.id,
                credential: entry.credential,
                document_types,
                storage_root: entry.storage_root,
                retention_days: entry.retention_days,
                notifications: entry.notifications,
                schedule: entry.schedule.map(resolve_schedule).transpose()?,
                plan: entry.plan,
                locale: entry.locale,
            });
        }

        Ok(ResolvedConfig {
            schema_version,
            settings,
            directory: StaticDirectory::new(subscribers, tax_identifiers),
        })
    }
}

fn resolve_settings(section: EngineSection) -> Result<RuntimeSettings, SyncError> {
    let default_retry = RetryPolicy::default();
    let state_dir = match section.state_dir {
        Some(dir) => Utf8PathBuf::from(dir),
        None => default_state_dir()?,
    };
    let default_root = match section.default_storage_root {
        Some(root) => Utf8PathBuf::from(root),
        None => default_storage_root()?,
    };
    Ok(RuntimeSettings {
        api_base_url: section
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        retry: RetryPolicy {
            attempts: section.retry_attempts.unwrap_or(default_retry.attempts).max(1),
            delay: section
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(default_retry.delay),
        },
        request_timeout: Duration::from_secs(
            section
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
        engine: EngineSettings {
            page_delay: section
                .page_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PAGE_DELAY),
            archive: ArchiveSettings {
                default_root,
                default_retention_days: section
                    .default_retention_days
                    .unwrap_or(DEFAULT_RETENTION_DAYS),
            },
            window_days: section.window_days,
        },
        state_dir,
        workers: section.workers.unwrap_or(DEFAULT_WORKERS).max(1),
    })
}

fn resolve_tax_identifier(entry: TaxIdentifierEntry, subscriber_id: &str) -> Result<TaxIdentifier, SyncError> {
    match entry {
        TaxIdentifierEntry::Shorthand(value) => {
            let cnpj: Cnpj = value.parse()?;
            Ok(TaxIdentifier {
                id: cnpj.as_str().to_string(),
                cnpj,
                active: true,
                subscriber_id: subscriber_id.to_string(),
                document_types: None,
                storage_root: None,
                schedule: None,
            })
        }
        TaxIdentifierEntry::Detailed(obj) => {
            let cnpj: Cnpj = obj.cnpj.parse()?;
            let document_types = obj
                .document_types
                .map(|types| parse_categories(&types))
                .transpose()?;
            Ok(TaxIdentifier {
                id: obj.id.unwrap_or_else(|| cnpj.as_str().to_string()),
                cnpj,
                active: obj.active.unwrap_or(true),
                subscriber_id: subscriber_id.to_string(),
                document_types,
                storage_root: obj.storage_root,
                schedule: obj.schedule.map(resolve_schedule).transpose()?,
            })
        }
    }
}

fn resolve_schedule(entry: ScheduleEntry) -> Result<SchedulePreference, SyncError> {
    let times = entry
        .times
        .iter()
        .map(|time| time.parse::<TimeOfDay>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SchedulePreference {
        frequency: entry.frequency,
        times,
    })
}

fn parse_categories(values: &[String]) -> Result<Vec<DocumentCategory>, SyncError> {
    let mut categories = Vec::new();
    for value in values {
        let category: DocumentCategory = value.parse()?;
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    Ok(categories)
}

fn default_frequency() -> String {
    "daily".to_string()
}

pub fn default_state_dir() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("xml-sync")).ok())
        .ok_or_else(|| SyncError::Filesystem("unable to resolve state directory".to_string()))
}

pub fn default_storage_root() -> Result<Utf8PathBuf, SyncError> {
    let cwd = std::env::current_dir().map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Utf8PathBuf::from_path_buf(cwd.join("downloads"))
        .map_err(|_| SyncError::Filesystem("invalid storage root path".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::directory::SubscriberDirectory;

    #[test]
    fn parse_config_shorthand() {
        let config: Config = serde_json::from_str(
            r#"{
                "engine": { "state_dir": "/tmp/xml-sync-state", "default_storage_root": "/srv/xml" },
                "subscribers": [
                    {
                        "id": "sub-1",
                        "credential": "key",
                        "document_types": ["nfe", "CTE"],
                        "tax_identifiers": ["11.222.333/0001-81"]
                    }
                ]
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.settings.workers, DEFAULT_WORKERS);
        assert_eq!(resolved.settings.retry.attempts, 5);
        assert_eq!(resolved.settings.engine.page_delay, DEFAULT_PAGE_DELAY);
        assert_eq!(
            resolved.settings.engine.archive.default_retention_days,
            DEFAULT_RETENTION_DAYS
        );
        assert_eq!(
            resolved.settings.outcomes_dir(),
            Utf8PathBuf::from("/tmp/xml-sync-state/outcomes")
        );

        let subscriber = resolved.directory.subscriber("sub-1").unwrap().unwrap();
        assert_eq!(
            subscriber.document_types,
            vec![DocumentCategory::Nfe, DocumentCategory::Cte]
        );
        let taxes = resolved.directory.active_tax_identifiers("sub-1").unwrap();
        assert_eq!(taxes.len(), 1);
        assert_eq!(taxes[0].id, "11222333000181");
        assert!(taxes[0].active);
    }

    #[test]
    fn detailed_tax_identifier_and_schedule() {
        let config: Config = serde_json::from_str(
            r#"{
                "engine": { "state_dir": "/tmp/s", "default_storage_root": "/tmp/d" },
                "subscribers": [
                    {
                        "id": "sub-1",
                        "credential": "key",
                        "schedule": { "frequency": "2x ao dia", "times": ["08:30"] },
                        "tax_identifiers": [
                            { "id": "t-1", "cnpj": "11222333000181", "active": false },
                            { "cnpj": "11222333000181", "document_types": ["nfse"] }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let subscriber = resolved.directory.subscriber("sub-1").unwrap().unwrap();
        let schedule = subscriber.schedule.unwrap();
        assert_eq!(schedule.times, vec![TimeOfDay::new(8, 30).unwrap()]);
        let taxes = resolved.directory.active_tax_identifiers("sub-1").unwrap();
        assert_eq!(taxes.len(), 1);
        assert_eq!(taxes[0].document_types, Some(vec![DocumentCategory::Nfse]));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        let bad_cnpj: Config = serde_json::from_str(
            r#"{
                "engine": { "state_dir": "/tmp/s", "default_storage_root": "/tmp/d" },
                "subscribers": [ { "id": "s", "tax_identifiers": ["11222333000182"] } ]
            }"#,
        )
        .unwrap();
        assert_matches!(
            ConfigLoader::resolve_config(bad_cnpj),
            Err(SyncError::InvalidCnpj(_))
        );

        let bad_category: Config = serde_json::from_str(
            r#"{
                "engine": { "state_dir": "/tmp/s", "default_storage_root": "/tmp/d" },
                "subscribers": [ { "id": "s", "document_types": ["nfx"] } ]
            }"#,
        )
        .unwrap();
        assert_matches!(
            ConfigLoader::resolve_config(bad_category),
            Err(SyncError::InvalidCategory(_))
        );
    }
}
