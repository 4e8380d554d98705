use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Days, NaiveDate};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DocumentCategory {
    Nfe,
    Cte,
    Nfse,
    Nfce,
    Cfe,
}

impl DocumentCategory {
    pub const ALL: [DocumentCategory; 5] = [
        DocumentCategory::Nfe,
        DocumentCategory::Cte,
        DocumentCategory::Nfse,
        DocumentCategory::Nfce,
        DocumentCategory::Cfe,
    ];

    pub fn api_code(self) -> u8 {
        match self {
            DocumentCategory::Nfe => 1,
            DocumentCategory::Cte => 2,
            DocumentCategory::Nfse => 3,
            DocumentCategory::Nfce => 4,
            DocumentCategory::Cfe => 5,
        }
    }

    pub fn folder(self) -> &'static str {
        match self {
            DocumentCategory::Nfe => "NFE",
            DocumentCategory::Cte => "CTE",
            DocumentCategory::Nfse => "NFSE",
            DocumentCategory::Nfce => "NFCE",
            DocumentCategory::Cfe => "CFE",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentCategory::Nfe => "nfe",
            DocumentCategory::Cte => "cte",
            DocumentCategory::Nfse => "nfse",
            DocumentCategory::Nfce => "nfce",
            DocumentCategory::Cfe => "cfe",
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DocumentCategory {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        DocumentCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| SyncError::InvalidCategory(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "entrada",
            Direction::Outbound => "saida",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Scheduled,
    Manual,
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMode::Scheduled => write!(f, "scheduled"),
            RetrievalMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Processing,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::Processing => write!(f, "processing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cnpj(String);

impl Cnpj {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn formatted(&self) -> String {
        let s = &self.0;
        format!(
            "{}.{}.{}/{}-{}",
            &s[0..2],
            &s[2..5],
            &s[5..8],
            &s[8..12],
            &s[12..14]
        )
    }
}

impl fmt::Display for Cnpj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cnpj {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value
            .chars()
            .filter(|ch| ch.is_ascii_digit())
            .collect::<String>();
        let stray = value
            .chars()
            .any(|ch| !ch.is_ascii_digit() && !matches!(ch, '.' | '/' | '-' | ' '));
        if stray || digits.len() != 14 {
            return Err(SyncError::InvalidCnpj(value.to_string()));
        }
        let bytes = digits.as_bytes();
        if bytes.iter().all(|b| *b == bytes[0]) {
            return Err(SyncError::InvalidCnpj(value.to_string()));
        }
        let numbers = bytes.iter().map(|b| u32::from(b - b'0')).collect::<Vec<_>>();
        if check_digit(&numbers[..12]) != numbers[12] || check_digit(&numbers[..13]) != numbers[13]
        {
            return Err(SyncError::InvalidCnpj(value.to_string()));
        }
        Ok(Self(digits))
    }
}

impl TryFrom<String> for Cnpj {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cnpj> for String {
    fn from(value: Cnpj) -> Self {
        value.0
    }
}

fn check_digit(numbers: &[u32]) -> u32 {
    let mut weight = numbers.len() as u32 - 7;
    let mut sum = 0;
    for number in numbers {
        sum += number * weight;
        weight = if weight == 2 { 9 } else { weight - 1 };
    }
    let rest = sum % 11;
    if rest < 2 { 0 } else { 11 - rest }
}

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("valid time regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, SyncError> {
        if hour > 23 || minute > 59 {
            return Err(SyncError::InvalidTime(format!("{hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = TIME_RE
            .captures(value.trim())
            .ok_or_else(|| SyncError::InvalidTime(value.to_string()))?;
        let hour = caps[1]
            .parse()
            .map_err(|_| SyncError::InvalidTime(value.to_string()))?;
        let minute = caps[2]
            .parse()
            .map_err(|_| SyncError::InvalidTime(value.to_string()))?;
        Ok(Self { hour, minute })
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    TwiceDaily,
    FourTimesDaily,
    Weekly,
}

impl Frequency {
    pub fn from_tag(tag: &str) -> (Self, bool) {
        match tag.trim().to_lowercase().as_str() {
            "daily" | "1x/day" | "1x ao dia" => (Frequency::Daily, true),
            "2x/day" | "2x ao dia" | "twice-daily" => (Frequency::TwiceDaily, true),
            "4x/day" | "4x ao dia" | "four-times-daily" => (Frequency::FourTimesDaily, true),
            "weekly" | "semanal" => (Frequency::Weekly, true),
            _ => (Frequency::Daily, false),
        }
    }

    pub fn offsets(self) -> &'static [u32] {
        match self {
            Frequency::Daily | Frequency::Weekly => &[0],
            Frequency::TwiceDaily => &[0, 12],
            Frequency::FourTimesDaily => &[0, 6, 12, 18],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub fn sync_window_days(self) -> u32 {
        match self {
            PlanTier::Free => 5,
            PlanTier::Starter => 7,
            PlanTier::Professional => 30,
            PlanTier::Enterprise => 90,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locale {
    #[default]
    #[serde(rename = "pt-BR")]
    PtBr,
    #[serde(rename = "en")]
    En,
}

const MONTHS_PT_BR: [&str; 12] = [
    "Janeiro", "Fevereiro", "Marco", "Abril", "Maio", "Junho", "Julho", "Agosto", "Setembro",
    "Outubro", "Novembro", "Dezembro",
];

const MONTHS_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

impl Locale {
    pub fn month_name(self, month: u32) -> Option<&'static str> {
        let names = match self {
            Locale::PtBr => &MONTHS_PT_BR,
            Locale::En => &MONTHS_EN,
        };
        month
            .checked_sub(1)
            .and_then(|index| names.get(index as usize))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidDateRange(format!("{start} is after {end}")));
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn trailing(end: NaiveDate, days: u32) -> Self {
        let back = u64::from(days.max(1) - 1);
        let start = end.checked_sub_days(Days::new(back)).unwrap_or(end);
        Self { start, end }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |day| *day <= self.end)
    }
}
