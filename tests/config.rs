use std::time::Duration;

use assert_matches::assert_matches;

use fiscal_xml_sync::config::ConfigLoader;
use fiscal_xml_sync::directory::SubscriberDirectory;
use fiscal_xml_sync::domain::{Locale, PlanTier};
use fiscal_xml_sync::error::SyncError;

#[test]
fn resolve_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("xml-sync.json");
    std::fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "engine": {
                "api_base_url": "http://localhost:9999",
                "retry_attempts": 2,
                "retry_delay_secs": 0,
                "page_delay_secs": 0,
                "default_storage_root": "/srv/fiscal",
                "default_retention_days": 14,
                "state_dir": "/var/lib/xml-sync",
                "workers": 8
            },
            "subscribers": [
                {
                    "id": "acme",
                    "credential": "abc%2Fdef",
                    "document_types": ["nfe", "nfce"],
                    "storage_root": "/srv/fiscal/{subscriber}/{cnpj}",
                    "retention_days": 7,
                    "plan": "professional",
                    "locale": "en",
                    "notifications": { "email": true, "download_failed": true },
                    "schedule": { "frequency": "4x/day", "times": ["06:00"] },
                    "tax_identifiers": [
                        "11222333000181",
                        { "id": "branch", "cnpj": "11.222.333/0001-81", "active": true }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    let settings = &resolved.settings;
    assert_eq!(settings.api_base_url, "http://localhost:9999");
    assert_eq!(settings.retry.attempts, 2);
    assert_eq!(settings.retry.delay, Duration::ZERO);
    assert_eq!(settings.engine.page_delay, Duration::ZERO);
    assert_eq!(settings.engine.archive.default_retention_days, 14);
    assert_eq!(settings.engine.archive.default_root.as_str(), "/srv/fiscal");
    assert_eq!(settings.outcomes_dir().as_str(), "/var/lib/xml-sync/outcomes");
    assert_eq!(settings.workers, 8);

    let subscriber = resolved.directory.subscriber("acme").unwrap().unwrap();
    assert_eq!(subscriber.credential(), Some("abc%2Fdef"));
    assert_eq!(subscriber.plan, PlanTier::Professional);
    assert_eq!(subscriber.locale, Locale::En);
    assert!(subscriber.notifications.download_failed);
    assert!(!subscriber.notifications.download_complete);

    let taxes = resolved.directory.active_tax_identifiers("acme").unwrap();
    let ids = taxes.iter().map(|tax| tax.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["11222333000181", "branch"]);
}

#[test]
fn unreadable_and_malformed_files() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(SyncError::ConfigRead(_))
    );

    let broken = temp.path().join("broken.json");
    std::fs::write(&broken, "{ \"subscribers\": [ ").unwrap();
    let err = ConfigLoader::resolve(broken.to_str()).unwrap_err();
    assert_matches!(err, SyncError::ConfigParse(_));
    assert!(err.is_configuration());
}
