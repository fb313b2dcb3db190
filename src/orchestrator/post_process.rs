//! Post-watch processing utilities.
//!
//! Handles what happens once an analysis settles: report download and user-facing messages.

use crate::client::ApiClient;
use crate::model::{AnalysisRecord, AnalysisStatus, DownloadFormat, DownloadOutcome};
use std::path::{Path, PathBuf};

/// Result of post-watch processing, ready for presentation layers.
pub(crate) struct ProcessedWatch {
    pub record: AnalysisRecord,
    pub download: Option<DownloadOutcome>,
    pub messages: Vec<String>,
}

/// Pick where a report should be written.
///
/// An existing directory gets the default file name inside it, any other explicit path is
/// used as is, and without one the user's download directory (or the current one) is used.
pub(crate) fn resolve_download_path(
    analysis_id: &str,
    format: DownloadFormat,
    output: Option<&Path>,
) -> PathBuf {
    let file_name = format!("analysis-{}.{}", analysis_id, format.as_query_str());
    match output {
        Some(p) if p.is_dir() => p.join(file_name),
        Some(p) => p.to_path_buf(),
        None => dirs::download_dir()
            .filter(|d| d.is_dir())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default()
            .join(file_name),
    }
}

/// Process a settled analysis: fetch its report when asked to and the analysis completed.
pub(crate) async fn process_terminal(
    client: &ApiClient,
    record: AnalysisRecord,
    download: Option<DownloadFormat>,
    output: Option<&Path>,
) -> ProcessedWatch {
    let mut messages = Vec::new();
    let mut outcome = None;

    match (&record.status, download) {
        (AnalysisStatus::Completed, Some(format)) => {
            let path = resolve_download_path(&record.id, format, output);
            match client.download_results(&record.id, format, &path).await {
                Ok(bytes) => {
                    messages.push(format!("Downloaded {}: {}", format.as_query_str(), path.display()));
                    outcome = Some(DownloadOutcome {
                        analysis_id: record.id.clone(),
                        format,
                        path,
                        bytes,
                    });
                }
                Err(e) => messages.push(format!("Download failed: {e:#}")),
            }
        }
        (AnalysisStatus::Failed, Some(_)) => {
            messages.push("Analysis failed; no report to download".to_string());
        }
        _ => {}
    }

    ProcessedWatch {
        record,
        download: outcome,
        messages,
    }
}
