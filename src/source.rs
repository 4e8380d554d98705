use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Cnpj, DocumentCategory};
use crate::error::SyncError;

pub const PAGE_SIZE: usize = 50;

const NOT_FOUND_MARKER: &str = "Nenhum arquivo XML localizado";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub encoded: String,
}

impl RawDocument {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<RawDocument>,
    pub has_more: bool,
}

impl DocumentPage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: Vec<RawDocument>) -> Self {
        let has_more = documents.len() == PAGE_SIZE;
        Self {
            documents,
            has_more,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub credential: &'a str,
    pub cnpj: &'a Cnpj,
    pub date: NaiveDate,
    pub category: DocumentCategory,
    pub offset: usize,
}

pub trait DocumentSource: Send + Sync {
    fn fetch(&self, request: &PageRequest<'_>) -> Result<DocumentPage, SyncError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DownloadPayload<'a> {
    xml_type: u8,
    take: usize,
    skip: usize,
    data_emissao_inicio: String,
    data_emissao_fim: String,
    cnpj_emit: &'a str,
    #[serde(rename = "Downloadevent")]
    download_event: bool,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    #[serde(default)]
    xmls: Vec<String>,
}

enum Attempt {
    Page(DocumentPage),
    Retry(String),
}

#[derive(Clone)]
pub struct SiegHttpClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl SiegHttpClient {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xml-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::SourceHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::SourceHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    // Keys are issued already URL-encoded and must be appended verbatim.
    fn endpoint(&self, credential: &str) -> String {
        format!("{}/BaixarXmlsV2?api_key={credential}", self.base_url)
    }

    fn attempt(&self, request: &PageRequest<'_>, credential: &str) -> Attempt {
        let date = request.date.format("%Y-%m-%d").to_string();
        let payload = DownloadPayload {
            xml_type: request.category.api_code(),
            take: PAGE_SIZE,
            skip: request.offset,
            data_emissao_inicio: date.clone(),
            data_emissao_fim: date,
            cnpj_emit: request.cnpj.as_str(),
            download_event: false,
        };
        let response = match self
            .client
            .post(self.endpoint(credential))
            .json(&payload)
            .send()
        {
            Ok(response) => response,
            Err(err) => return Attempt::Retry(err.to_string()),
        };

        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();

        if status == 404 && is_not_found_body(&body) {
            return Attempt::Page(DocumentPage::empty());
        }
        if !(200..300).contains(&status) {
            let err = SyncError::SourceStatus {
                status,
                message: truncate(&body, 200),
            };
            return Attempt::Retry(err.to_string());
        }
        match serde_json::from_str::<DownloadResponse>(&body) {
            Ok(parsed) => Attempt::Page(DocumentPage::from_documents(
                parsed.xmls.into_iter().map(RawDocument::new).collect(),
            )),
            Err(err) => Attempt::Retry(format!("malformed response: {err}")),
        }
    }
}

impl DocumentSource for SiegHttpClient {
    fn fetch(&self, request: &PageRequest<'_>) -> Result<DocumentPage, SyncError> {
        let credential = request.credential.trim();
        if credential.is_empty() {
            return Err(SyncError::MissingCredential(request.cnpj.to_string()));
        }

        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            debug!(
                cnpj = %request.cnpj,
                category = %request.category,
                date = %request.date,
                offset = request.offset,
                attempt,
                key = %mask_credential(credential),
                "custody API request"
            );
            match self.attempt(request, credential) {
                Attempt::Page(page) => return Ok(page),
                Attempt::Retry(reason) => {
                    warn!(
                        cnpj = %request.cnpj,
                        date = %request.date,
                        attempt,
                        attempts,
                        "custody API attempt failed: {reason}"
                    );
                    last_error = reason;
                }
            }
            if attempt < attempts {
                thread::sleep(self.retry.delay);
            }
        }
        Err(SyncError::SourceExhausted {
            attempts,
            last_error,
        })
    }
}

pub fn is_not_found_body(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|item| item.contains(NOT_FOUND_MARKER)),
        Ok(Value::String(message)) => message.contains(NOT_FOUND_MARKER),
        _ => body.contains(NOT_FOUND_MARKER),
    }
}

pub fn mask_credential(credential: &str) -> String {
    let chars = credential.chars().collect::<Vec<_>>();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head = chars[..3].iter().collect::<String>();
    let tail = chars[chars.len() - 3..].iter().collect::<String>();
    format!("{head}...{tail}")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn not_found_body_is_recognized() {
        assert!(is_not_found_body(
            r#"["Nenhum arquivo XML localizado para os filtros informados"]"#
        ));
        assert!(!is_not_found_body(r#"["Chave de API invalida"]"#));
    }

    #[test]
    fn full_page_signals_more() {
        let docs = (0..PAGE_SIZE).map(|i| RawDocument::new(i.to_string())).collect();
        assert!(DocumentPage::from_documents(docs).has_more);
        let docs = (0..12).map(|i| RawDocument::new(i.to_string())).collect();
        assert!(!DocumentPage::from_documents(docs).has_more);
    }

    #[test]
    fn credential_is_masked() {
        assert_eq!(mask_credential("abcdef123456"), "abc...456");
        assert_eq!(mask_credential("short"), "***");
    }

    #[test]
    fn blank_credential_fails_before_network() {
        let client = SiegHttpClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(10),
            RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
        )
        .unwrap();
        let cnpj: Cnpj = "11222333000181".parse().unwrap();
        let request = PageRequest {
            credential: "   ",
            cnpj: &cnpj,
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            category: DocumentCategory::Nfe,
            offset: 0,
        };
        assert_matches!(client.fetch(&request), Err(SyncError::MissingCredential(_)));
    }
}
