use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::HarvestError;

pub const FAILURE_REASON_FIELD: &str = "_failure_reason";
pub const ORIGIN_FIELD: &str = "_original_input_json";
pub const RETRY_REASON_FIELD: &str = "_retry_attempt_failed_reason";
pub const RETRY_TIMESTAMP_FIELD: &str = "_last_retry_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourcePolicy {
    /// The record's own `pdf_url`, falling back to the mirror.
    Primary,
    /// Always the deterministic mirror URL.
    Export,
    /// Probe both and take the quicker one.
    Fastest,
}

impl fmt::Display for SourcePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourcePolicy::Primary => write!(f, "primary"),
            SourcePolicy::Export => write!(f, "export"),
            SourcePolicy::Fastest => write!(f, "fastest"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub entry_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub pdf_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: Some(entry_id.into()),
            ..Self::default()
        }
    }

    pub fn with_pdf_url(mut self, url: impl Into<String>) -> Self {
        self.pdf_url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn identity(&self) -> Option<&str> {
        non_empty(self.entry_id.as_deref())
    }

    pub fn primary_url(&self) -> Option<&str> {
        non_empty(self.pdf_url.as_deref())
    }

    pub fn display_title(&self) -> &str {
        non_empty(self.title.as_deref()).unwrap_or("UnknownTitle")
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        non_empty(self.extra.get(key).and_then(Value::as_str))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.extra_str(FAILURE_REASON_FIELD)
    }

    pub fn origin(&self) -> Option<&str> {
        self.extra_str(ORIGIN_FIELD)
    }

    pub fn to_failure(&self, reason: &str, origin: &str) -> Record {
        let mut failure = self.clone();
        failure
            .extra
            .insert(FAILURE_REASON_FIELD.to_string(), Value::from(reason));
        failure
            .extra
            .insert(ORIGIN_FIELD.to_string(), Value::from(origin));
        failure
    }

    pub fn mark_retry_failed(&mut self, reason: &str, timestamp: &str) {
        self.extra
            .insert(RETRY_REASON_FIELD.to_string(), Value::from(reason));
        self.extra
            .insert(RETRY_TIMESTAMP_FIELD.to_string(), Value::from(timestamp));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDetails {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub keyword: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryDetails {
    pub fn keyword(&self) -> Option<&str> {
        non_empty(self.keyword.as_deref())
    }

    pub fn category(&self) -> Option<&str> {
        non_empty(self.category.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFile {
    #[serde(default)]
    pub query_details: QueryDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_count: Option<usize>,
    #[serde(default)]
    pub papers: Vec<Record>,
}

impl QueryFile {
    pub fn load(path: &Utf8Path) -> Result<Self, HarvestError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            HarvestError::InputRead {
                path: path.to_string(),
                message: err.to_string(),
            }
        })?;
        serde_json::from_str(&content).map_err(|err| HarvestError::InputParse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Downloaded(Utf8PathBuf),
    ExistedSubdir(Utf8PathBuf),
    ExistedGlobal(Utf8PathBuf),
    Failed(String),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Downloaded(_) => OutcomeKind::Downloaded,
            Outcome::ExistedSubdir(_) => OutcomeKind::ExistedSubdir,
            Outcome::ExistedGlobal(_) => OutcomeKind::ExistedGlobal,
            Outcome::Failed(_) => OutcomeKind::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Outcome::Downloaded(path) | Outcome::ExistedSubdir(path) | Outcome::ExistedGlobal(path) => {
                path.as_str()
            }
            Outcome::Failed(reason) => reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Downloaded,
    ExistedSubdir,
    ExistedGlobal,
    Failed,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Downloaded => write!(f, "DOWNLOADED"),
            OutcomeKind::ExistedSubdir => write!(f, "EXISTED_SUBDIR"),
            OutcomeKind::ExistedGlobal => write!(f, "EXISTED_GLOBAL"),
            OutcomeKind::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub entry_id: Option<String>,
    pub outcome: Outcome,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

// Search output occasionally carries numeric ids; keep them as strings.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}
