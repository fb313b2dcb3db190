//! Text summary builder for CLI output.
//!
//! This module formats human-readable lines for text mode.

use crate::model::{AnalysisRecord, AnalysisStatus, PredictResult};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Format a service timestamp for display in `offset`.
///
/// Accepts RFC 3339 and offset-less ISO timestamps (read as UTC). Anything else is
/// returned unchanged.
fn format_timestamp_in(raw: &str, offset: UtcOffset) -> String {
    let naive =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .or_else(|| {
            PrimitiveDateTime::parse(raw, naive)
                .ok()
                .map(|dt| dt.assume_utc())
        });
    let display = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    parsed
        .and_then(|dt| dt.to_offset(offset).format(display).ok())
        .unwrap_or_else(|| raw.to_string())
}

pub(crate) fn format_timestamp(raw: &str) -> String {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    format_timestamp_in(raw, offset)
}

/// Where a history entry leads, following the dashboard's rules.
pub(crate) fn next_action(record: &AnalysisRecord) -> Option<String> {
    match &record.status {
        AnalysisStatus::Completed => Some(format!("reviewscope download {} --format csv", record.id)),
        s if s.is_in_progress() => Some(format!("reviewscope watch {}", record.id)),
        _ => None,
    }
}

/// One-line progress note for a live update.
pub(crate) fn update_line(record: &AnalysisRecord) -> String {
    let mut line = format!("[{}] {}", record.status.label(), record.status.message());
    if let Some(progress) = record.progress() {
        line.push_str(&format!(" ({:.0}%)", progress.clamp(0.0, 100.0)));
    }
    line
}

/// Full description of one analysis.
pub(crate) fn build_record_summary(record: &AnalysisRecord) -> TextSummary {
    let mut lines = vec![
        format!("Analysis: {}", record.id),
        format!("Status:   {} - {}", record.status.label(), record.status.message()),
    ];
    if let Some(name) = record.file_name() {
        lines.push(format!("File:     {name}"));
    }
    if let Some(file_type) = record.file_type() {
        lines.push(format!("Type:     {}", file_type.to_uppercase()));
    }
    if let Some(kind) = record.analysis_type() {
        lines.push(format!("Analysis type: {kind}"));
    }
    if let Some(created) = record.created_at() {
        lines.push(format!("Created:  {}", format_timestamp(created)));
    }
    if let Some(updated) = record.updated_at() {
        lines.push(format!("Updated:  {}", format_timestamp(updated)));
    }
    if let Some(progress) = record.progress().filter(|_| !record.status.is_terminal()) {
        lines.push(format!("Progress: {:.0}%", progress.clamp(0.0, 100.0)));
    }
    if let Some(total) = record.total_reviews() {
        lines.push(format!("Total reviews:   {total}"));
        if let Some(flagged) = record.flagged_reviews() {
            let pct = if total == 0 {
                0.0
            } else {
                flagged as f64 * 100.0 / total as f64
            };
            lines.push(format!("Flagged reviews: {flagged} ({pct:.1}%)"));
        }
    }
    if record.status == AnalysisStatus::Failed {
        if let Some(msg) = record.error_message() {
            lines.push(format!("Error:    {msg}"));
        }
    }
    TextSummary { lines }
}

/// History table, newest first as returned by the service.
pub(crate) fn build_history_summary(records: &[AnalysisRecord]) -> TextSummary {
    if records.is_empty() {
        return TextSummary {
            lines: vec!["No analyses yet. Submit a file with `reviewscope submit <file>`.".into()],
        };
    }
    let id_width = records
        .iter()
        .map(|r| r.id.chars().count())
        .max()
        .unwrap_or(2)
        .max(2);
    let mut lines = vec![format!(
        "{:<id_width$}  {:<24}  {:<19}  {:<10}  {:<12}  {}",
        "ID", "FILE", "CREATED", "STATUS", "TYPE", "NEXT"
    )];
    for r in records {
        let file: String = r.file_name().unwrap_or("-").chars().take(24).collect();
        let created = r.created_at().map(format_timestamp).unwrap_or_else(|| "-".into());
        lines.push(
            format!(
                "{:<id_width$}  {:<24}  {:<19}  {:<10}  {:<12}  {}",
                r.id,
                file,
                created,
                r.status.label(),
                r.analysis_type().unwrap_or("-"),
                next_action(r).unwrap_or_else(|| "-".into()),
            )
            .trim_end()
            .to_string(),
        );
    }
    TextSummary { lines }
}

pub(crate) fn build_predict_summary(result: &PredictResult) -> TextSummary {
    let mut lines = vec![
        format!(
            "Verdict:    {}",
            if result.flagged { "Flagged" } else { "Authentic" }
        ),
        format!("Confidence: {:.1}%", result.confidence * 100.0),
    ];
    if let Some(t) = result.process_time {
        lines.push(format!("Processed in {t:.3} seconds"));
    }
    TextSummary { lines }
}
