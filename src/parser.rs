use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{Datelike, NaiveDate};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::domain::{Direction, DocumentCategory};
use crate::error::SyncError;
use crate::source::RawDocument;

pub const UNKNOWN_ISSUER: &str = "00000000000000";

#[derive(Debug)]
pub struct CategoryProfile {
    pub roots: &'static [&'static [&'static str]],
    pub header: Option<&'static str>,
    pub date_tags: &'static [&'static str],
    pub number_tag: &'static str,
    pub direction_tag: Option<&'static str>,
    pub direction_codes: &'static [(&'static str, Direction)],
    pub issuer_paths: &'static [&'static [&'static str]],
}

const DIRECTION_CODES: &[(&str, Direction)] =
    &[("0", Direction::Inbound), ("1", Direction::Outbound)];

const NFE_PROFILE: CategoryProfile = CategoryProfile {
    roots: &[&["nfeProc", "NFe", "infNFe"], &["NFe", "infNFe"]],
    header: Some("ide"),
    date_tags: &["dhEmi", "dEmi"],
    number_tag: "nNF",
    direction_tag: Some("tpNF"),
    direction_codes: DIRECTION_CODES,
    issuer_paths: &[&["emit", "CNPJ"]],
};

const CTE_PROFILE: CategoryProfile = CategoryProfile {
    roots: &[&["cteProc", "CTe", "infCte"], &["CTe", "infCte"]],
    header: Some("ide"),
    date_tags: &["dhEmi", "dEmi"],
    number_tag: "nCT",
    direction_tag: Some("tpCTe"),
    direction_codes: DIRECTION_CODES,
    issuer_paths: &[&["emit", "CNPJ"]],
};

const NFSE_PROFILE: CategoryProfile = CategoryProfile {
    roots: &[&["CompNfse", "Nfse", "InfNfse"], &["Nfse", "InfNfse"]],
    header: None,
    date_tags: &["DataEmissao"],
    number_tag: "Numero",
    direction_tag: None,
    direction_codes: DIRECTION_CODES,
    issuer_paths: &[
        &["PrestadorServico", "IdentificacaoPrestador", "Cnpj"],
        &["PrestadorServico", "IdentificacaoPrestador", "CpfCnpj", "Cnpj"],
        &["Prestador", "Cnpj"],
    ],
};

const CFE_PROFILE: CategoryProfile = CategoryProfile {
    roots: &[&["CFe", "infCFe"]],
    header: Some("ide"),
    date_tags: &["dEmi"],
    number_tag: "nCFe",
    direction_tag: None,
    direction_codes: DIRECTION_CODES,
    issuer_paths: &[&["emit", "CNPJ"]],
};

pub fn profile(category: DocumentCategory) -> &'static CategoryProfile {
    match category {
        DocumentCategory::Nfe | DocumentCategory::Nfce => &NFE_PROFILE,
        DocumentCategory::Cte => &CTE_PROFILE,
        DocumentCategory::Nfse => &NFSE_PROFILE,
        DocumentCategory::Cfe => &CFE_PROFILE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(content)))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedFields {
    pub category: DocumentCategory,
    pub emission_date: Option<NaiveDate>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub issuer: String,
    pub document_number: Option<String>,
    pub direction: Direction,
    pub direction_defaulted: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub fields: ExtractedFields,
    pub fingerprint: Fingerprint,
    pub content: Vec<u8>,
}

pub fn parse(raw: &RawDocument, category: DocumentCategory) -> Result<ParsedDocument, SyncError> {
    let content = BASE64_STANDARD
        .decode(raw.encoded.trim())
        .map_err(|err| SyncError::Parse(format!("invalid base64 payload: {err}")))?;
    let fields = extract_fields(&content, category)?;
    let fingerprint = Fingerprint::of(&content);
    Ok(ParsedDocument {
        fields,
        fingerprint,
        content,
    })
}

pub fn extract_fields(content: &[u8], category: DocumentCategory) -> Result<ExtractedFields, SyncError> {
    let text = std::str::from_utf8(content)
        .map_err(|err| SyncError::Parse(format!("payload is not UTF-8: {err}")))?;
    let text = text.trim_start_matches('\u{feff}');
    let doc = Document::parse(text).map_err(|err| SyncError::Parse(err.to_string()))?;
    let profile = profile(category);

    let info = profile
        .roots
        .iter()
        .find_map(|path| descend_from_root(&doc, path))
        .ok_or_else(|| {
            SyncError::Parse(format!(
                "unable to find {} root element (found <{}>)",
                category.folder(),
                doc.root_element().tag_name().name()
            ))
        })?;
    let header = match profile.header {
        Some(name) => child(info, name)
            .ok_or_else(|| SyncError::Parse(format!("missing <{name}> element")))?,
        None => info,
    };

    let emission_date = profile
        .date_tags
        .iter()
        .find_map(|tag| child_text(header, tag))
        .and_then(|value| parse_emission_date(&value));

    let issuer = profile
        .issuer_paths
        .iter()
        .find_map(|path| descend(info, path).and_then(node_text))
        .unwrap_or_else(|| UNKNOWN_ISSUER.to_string());

    let document_number = child_text(header, profile.number_tag);

    let code = profile
        .direction_tag
        .and_then(|tag| child_text(header, tag));
    let mapped = code.as_deref().and_then(|code| {
        profile
            .direction_codes
            .iter()
            .find(|(candidate, _)| *candidate == code)
            .map(|(_, direction)| *direction)
    });

    Ok(ExtractedFields {
        category,
        emission_date,
        year: emission_date.map(|date| date.year()),
        month: emission_date.map(|date| date.month()),
        issuer,
        document_number,
        direction: mapped.unwrap_or(Direction::Outbound),
        direction_defaulted: mapped.is_none(),
    })
}

pub fn parse_emission_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Some(day) = value.get(..10)
        && let Ok(date) = NaiveDate::parse_from_str(day, "%Y-%m-%d")
    {
        return Some(date);
    }
    if let Some(day) = value.get(..8)
        && day.chars().all(|ch| ch.is_ascii_digit())
    {
        return NaiveDate::parse_from_str(day, "%Y%m%d").ok();
    }
    None
}

fn descend_from_root<'a, 'input>(
    doc: &'a Document<'input>,
    path: &[&str],
) -> Option<Node<'a, 'input>> {
    let (first, rest) = path.split_first()?;
    let root = doc.root_element();
    if root.tag_name().name() != *first {
        return None;
    }
    descend(root, rest)
}

fn descend<'a, 'input>(node: Node<'a, 'input>, path: &[&str]) -> Option<Node<'a, 'input>> {
    path.iter().try_fold(node, |current, name| child(current, name))
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|candidate| candidate.is_element() && candidate.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).and_then(node_text)
}

fn node_text(node: Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
