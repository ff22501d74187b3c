//! Execution history recording.
//!
//! Every operation produces one execution record. The full record is
//! emitted to the log stream as minified JSON; that stream is the system
//! of record. A human-readable summary block is appended to the runbook's
//! History section as a best-effort convenience; a failed append downgrades
//! to a warning and never changes the operation's outcome.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Breadcrumb, ConfigItem};

/// The operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Structural validation only
    Validate,
    /// Full script execution
    Execute,
}

impl Operation {
    /// The operation name as it appears in records and messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Execute => "execute",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical audit object produced by every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Operation start, ISO-8601 UTC with millisecond precision
    pub start_timestamp: String,

    /// Operation finish, same format
    pub finish_timestamp: String,

    /// Exit code: 0 success, 403 authorization denial, 124 timeout,
    /// 1 validation/recursion/internal failures
    pub return_code: i32,

    /// The operation performed
    pub operation: Operation,

    /// Runbook filename the operation targeted
    pub runbook: String,

    /// Request metadata snapshot
    pub breadcrumb: Breadcrumb,

    /// Configuration in effect when the operation ran
    pub config_items: Vec<ConfigItem>,

    /// Captured stdout (empty for non-executing operations)
    pub stdout: String,

    /// Captured stderr, including executor annotations
    pub stderr: String,

    /// Errors that decided the outcome
    pub errors: Vec<String>,

    /// Non-blocking observations
    pub warnings: Vec<String>,
}

impl ExecutionRecord {
    /// Start a record now; finish fields are filled by [`Self::finish`].
    pub fn begin(
        operation: Operation,
        runbook: impl Into<String>,
        breadcrumb: Breadcrumb,
        config_items: Vec<ConfigItem>,
    ) -> Self {
        let now = format_timestamp(Utc::now());
        Self {
            start_timestamp: now.clone(),
            finish_timestamp: now,
            return_code: 0,
            operation,
            runbook: runbook.into(),
            breadcrumb,
            config_items,
            stdout: String::new(),
            stderr: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Stamp the finish time and the outcome.
    pub fn finish(&mut self, return_code: i32) {
        self.finish_timestamp = format_timestamp(Utc::now());
        self.return_code = return_code;
    }

    /// Whether the operation succeeded.
    pub fn success(&self) -> bool {
        self.return_code == 0 && self.errors.is_empty()
    }
}

/// Format a timestamp as ISO-8601 UTC with millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Records execution history to the log stream and the runbook file.
#[derive(Debug, Default)]
pub struct HistoryRecorder;

impl HistoryRecorder {
    /// Create a recorder.
    pub fn new() -> Self {
        Self
    }

    /// Record an execution: emit the canonical log event, then append the
    /// summary block to the runbook file.
    ///
    /// The log emission always happens. An append failure adds a warning to
    /// the record and logs an error, but the return code is untouched.
    pub fn record(&self, runbook_path: &Path, record: &mut ExecutionRecord) {
        self.emit_log(record);

        if let Err(e) = append_entry(runbook_path, record) {
            tracing::error!(
                runbook = %runbook_path.display(),
                error = %e,
                "Failed to append history entry"
            );
            record
                .warnings
                .push(format!("Failed to append history entry to runbook file: {e}"));
        }
    }

    /// Emit the full record as one structured INFO event.
    fn emit_log(&self, record: &ExecutionRecord) {
        let minified = serde_json::to_string(record)
            .unwrap_or_else(|e| format!("{{\"serialization_error\":\"{e}\"}}"));
        tracing::info!(
            target: "runbookd::audit",
            correlation_id = %record.breadcrumb.correlation_id,
            operation = %record.operation,
            runbook = %record.runbook,
            return_code = record.return_code,
            record = %minified,
            "execution record"
        );
    }
}

/// Append one history block beneath the History section.
///
/// The History heading is the final H1, so appending to the end of the file
/// lands inside the append zone. The block is self-delimiting: it opens
/// with a `### <finish> | Exit Code: <n>` heading, so the latest entry can
/// be recovered by scanning headings from the end.
fn append_entry(runbook_path: &Path, record: &ExecutionRecord) -> std::io::Result<()> {
    let block = format_entry(record);
    let mut file = OpenOptions::new().append(true).open(runbook_path)?;
    file.write_all(block.as_bytes())
}

/// Render the markdown block for one record.
fn format_entry(record: &ExecutionRecord) -> String {
    let mut block = format!(
        "\n### {} | Exit Code: {}\n\n",
        record.finish_timestamp, record.return_code
    );

    if !record.stdout.is_empty() {
        block.push_str(&format!("**Stdout:**\n```\n{}\n```\n\n", escape_fences(&record.stdout)));
    }
    if !record.stderr.is_empty() {
        block.push_str(&format!("**Stderr:**\n```\n{}\n```\n\n", escape_fences(&record.stderr)));
    }
    if !record.errors.is_empty() {
        let joined = record.errors.join("\n");
        block.push_str(&format!("**Error:**\n```\n{}\n```\n", escape_fences(&joined)));
    }
    block
}

/// Escape code fence delimiters in captured output so a script that prints
/// backticks cannot break the entry out of its block.
fn escape_fences(text: &str) -> String {
    text.replace("```", "\\`\\`\\`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TokenContext;
    use crate::runbook::parser::last_history_entry;

    fn record_for(runbook: &str) -> ExecutionRecord {
        let token = TokenContext::new("alice").with_correlation_id("corr-1");
        ExecutionRecord::begin(
            Operation::Execute,
            runbook,
            Breadcrumb::for_token(&token),
            Vec::new(),
        )
    }

    #[test]
    fn test_timestamp_format() {
        let formatted = format_timestamp(Utc::now());
        // 2024-05-01T10:00:00.000Z: millisecond precision, Z suffix
        assert!(formatted.ends_with('Z'));
        assert_eq!(formatted.len(), "2024-05-01T10:00:00.000Z".len());
    }

    #[test]
    fn test_success_requires_zero_code_and_no_errors() {
        let mut record = record_for("Test.md");
        assert!(record.success());

        record.finish(0);
        record.errors.push("boom".to_string());
        assert!(!record.success());

        let mut record = record_for("Test.md");
        record.finish(1);
        assert!(!record.success());
    }

    #[test]
    fn test_append_and_reverse_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.md");
        std::fs::write(&path, "# Test\n\n# History\n").unwrap();

        let mut record = record_for("Test.md");
        record.stdout = "ok\n".to_string();
        record.finish(0);
        HistoryRecorder::new().record(&path, &mut record);

        let mut second = record_for("Test.md");
        second.stderr = "broke\n".to_string();
        second.finish(1);
        HistoryRecorder::new().record(&path, &mut second);

        let content = std::fs::read_to_string(&path).unwrap();
        let latest = last_history_entry(&content).unwrap();
        assert_eq!(latest.return_code, 1);
        assert_eq!(latest.stderr.trim(), "broke");
        assert_eq!(latest.finished, second.finish_timestamp);
    }

    #[test]
    fn test_fences_in_output_escaped() {
        let mut record = record_for("Test.md");
        record.stdout = "before\n```\nafter\n".to_string();
        let block = format_entry(&record);
        assert!(!block.contains("\n```\nafter"));
        assert!(block.contains("\\`\\`\\`"));
    }

    #[test]
    fn test_denial_entry_uses_error_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.md");
        std::fs::write(&path, "# Test\n\n# History\n").unwrap();

        let mut record = record_for("Test.md");
        record.errors.push("RBAC check failed for execute".to_string());
        record.finish(403);
        HistoryRecorder::new().record(&path, &mut record);

        let content = std::fs::read_to_string(&path).unwrap();
        let latest = last_history_entry(&content).unwrap();
        assert_eq!(latest.return_code, 403);
        assert!(latest.error.contains("RBAC check failed"));
    }

    #[test]
    fn test_append_failure_adds_warning_keeps_code() {
        let mut record = record_for("Test.md");
        record.finish(0);
        HistoryRecorder::new().record(Path::new("/nonexistent/dir/Test.md"), &mut record);

        assert_eq!(record.return_code, 0);
        assert!(record.warnings.iter().any(|w| w.contains("Failed to append history")));
    }

    #[test]
    fn test_record_serializes_to_single_json_line() {
        let mut record = record_for("Test.md");
        record.finish(0);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains('\n'));
        assert!(json.contains("\"operation\":\"execute\""));
        assert!(json.contains("\"correlation_id\":\"corr-1\""));
    }
}
