use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub user_agent: String,
}

/// Lifecycle state reported by the analysis service.
///
/// Anything the service sends that isn't one of the named states is kept verbatim in
/// `Other` and treated as still in progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnalysisStatus {
    Queued,
    Validating,
    Extracting,
    Processing,
    Completed,
    Failed,
    Other(String),
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Validating => "validating",
            AnalysisStatus::Extracting => "extracting",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Other(s) => s.as_str(),
        }
    }

    /// Only `completed` and `failed` end an analysis.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }

    /// Named in-progress states. Unknown strings are non-terminal but not "known" in progress.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Queued
                | AnalysisStatus::Validating
                | AnalysisStatus::Extracting
                | AnalysisStatus::Processing
        )
    }

    /// Title-cased label for tables and badges.
    pub fn label(&self) -> String {
        let s = self.as_str();
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => "Unknown".to_string(),
        }
    }

    /// One-line description of what the service is doing.
    pub fn message(&self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "Analysis queued. Waiting to start...",
            AnalysisStatus::Validating => "Validating file format and content...",
            AnalysisStatus::Extracting => "Extracting review content...",
            AnalysisStatus::Processing => "Analyzing reviews. This may take several minutes...",
            AnalysisStatus::Completed => "Analysis completed.",
            AnalysisStatus::Failed => "Analysis failed.",
            AnalysisStatus::Other(_) => "Processing...",
        }
    }
}

impl From<String> for AnalysisStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => AnalysisStatus::Queued,
            "validating" => AnalysisStatus::Validating,
            "extracting" => AnalysisStatus::Extracting,
            "processing" => AnalysisStatus::Processing,
            "completed" => AnalysisStatus::Completed,
            "failed" => AnalysisStatus::Failed,
            _ => AnalysisStatus::Other(s),
        }
    }
}

impl From<&str> for AnalysisStatus {
    fn from(s: &str) -> Self {
        AnalysisStatus::from(s.to_string())
    }
}

impl From<AnalysisStatus> for String {
    fn from(s: AnalysisStatus) -> Self {
        match s {
            AnalysisStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One analysis as returned by `GET /analysis/{id}` and `GET /analyses`.
///
/// Only `id` and `status` are interpreted; everything else rides along in `payload`
/// and is serialised back out untouched.
///
/// The id is read from `analysis_id`, falling back to a plain `id` key. A plain `id`
/// stays in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAnalysisRecord")]
pub struct AnalysisRecord {
    #[serde(rename = "analysis_id")]
    pub id: String,
    pub status: AnalysisStatus,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawAnalysisRecord {
    #[serde(default)]
    analysis_id: Option<String>,
    status: AnalysisStatus,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawAnalysisRecord> for AnalysisRecord {
    type Error = String;

    fn try_from(raw: RawAnalysisRecord) -> Result<Self, Self::Error> {
        let id = match raw.analysis_id {
            Some(id) => id,
            None => match raw.payload.get("id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => return Err("missing field `analysis_id`".to_string()),
            },
        };
        Ok(Self {
            id,
            status: raw.status,
            payload: raw.payload,
        })
    }
}

#[cfg(test)]
impl AnalysisRecord {
    pub fn new(id: impl Into<String>, status: impl Into<AnalysisStatus>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

impl AnalysisRecord {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn file_name(&self) -> Option<&str> {
        self.str_field("file_name")
    }

    pub fn file_type(&self) -> Option<&str> {
        self.str_field("file_type")
    }

    pub fn analysis_type(&self) -> Option<&str> {
        self.str_field("analysis_type")
    }

    pub fn created_at(&self) -> Option<&str> {
        self.str_field("created_at")
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.str_field("updated_at")
    }

    pub fn error_message(&self) -> Option<&str> {
        self.str_field("error_message")
    }

    /// Server-supplied progress percentage, if the service sent one.
    pub fn progress(&self) -> Option<f64> {
        self.payload.get("progress").and_then(|v| v.as_f64())
    }

    pub fn total_reviews(&self) -> Option<u64> {
        self.payload.get("total_reviews").and_then(|v| v.as_u64())
    }

    pub fn flagged_reviews(&self) -> Option<u64> {
        self.payload.get("flagged_reviews").and_then(|v| v.as_u64())
    }
}

/// Response of `POST /uploads/review-file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub upload_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Response of `POST /analysis/process-file/{upload_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub analysis_id: String,
    #[serde(default)]
    pub status: Option<AnalysisStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /predict`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    pub review_content: String,
    pub useful_count: u32,
    pub review_count: u32,
    pub friend_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResult {
    pub flagged: bool,
    pub confidence: f64,
    #[serde(default)]
    pub process_time: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    Pdf,
    Csv,
}

impl DownloadFormat {
    pub fn as_query_str(self) -> &'static str {
        match self {
            DownloadFormat::Pdf => "pdf",
            DownloadFormat::Csv => "csv",
        }
    }
}

/// Events emitted by a watch session and consumed by the CLI layer.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Update(AnalysisRecord),
    Terminal(AnalysisRecord),
    Error(String),
}

/// Where a finished download landed.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub analysis_id: String,
    pub format: DownloadFormat,
    pub path: PathBuf,
    pub bytes: u64,
}
