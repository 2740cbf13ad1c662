//! Summary returned by every indexing run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithErrors,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Aborted => "aborted",
        }
    }
}

/// A file that did not make it into the index this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Statistics about an indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    pub status: RunOutcome,
    pub run_id: String,
    /// Files whose updates reached the store
    pub files_processed: usize,
    /// Files left out: unreadable, excluded, or already processed before a resume
    pub files_skipped: usize,
    /// Files whose extraction or embedding failed
    pub files_failed: usize,
    pub entities_added: usize,
    pub entities_removed: usize,
    pub entities_renamed: usize,
    pub entities_unchanged: usize,
    /// Number of embedding API calls
    pub embedding_calls: usize,
    pub batches: u64,
    /// Whether this run picked up an interrupted one
    pub resumed: bool,
    pub last_indexed_commit: Option<String>,
    /// Total time in milliseconds
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<FileFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl IndexResult {
    pub fn new(run_id: String) -> Self {
        Self {
            status: RunOutcome::Completed,
            run_id,
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            entities_added: 0,
            entities_removed: 0,
            entities_renamed: 0,
            entities_unchanged: 0,
            embedding_calls: 0,
            batches: 0,
            resumed: false,
            last_indexed_commit: None,
            duration_ms: 0,
            errors: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn record_failure(&mut self, path: &str, error: impl ToString) {
        self.files_failed += 1;
        self.errors.push(FileFailure {
            path: path.to_string(),
            error: error.to_string(),
        });
    }

    pub fn abort(&mut self, reason: impl ToString) {
        self.status = RunOutcome::Aborted;
        self.abort_reason = Some(reason.to_string());
    }

    /// Settle the final status of a run that was not aborted.
    pub fn finish(&mut self) {
        if self.status != RunOutcome::Aborted {
            self.status = if self.files_failed > 0 {
                RunOutcome::CompletedWithErrors
            } else {
                RunOutcome::Completed
            };
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} processed, {} skipped, {} failed; entities +{} -{} ~{} ={}; {} embedding calls in {} batches ({} ms)",
            self.status.as_str(),
            self.files_processed,
            self.files_skipped,
            self.files_failed,
            self.entities_added,
            self.entities_removed,
            self.entities_renamed,
            self.entities_unchanged,
            self.embedding_calls,
            self.batches,
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_status() {
        let mut result = IndexResult::new("run".into());
        result.finish();
        assert_eq!(result.status, RunOutcome::Completed);

        result.record_failure("a.py", "provider down");
        result.finish();
        assert_eq!(result.status, RunOutcome::CompletedWithErrors);
        assert_eq!(result.errors[0].path, "a.py");
    }

    #[test]
    fn test_abort_is_final() {
        let mut result = IndexResult::new("run".into());
        result.abort("store unavailable");
        result.finish();
        assert_eq!(result.status, RunOutcome::Aborted);
        assert_eq!(result.abort_reason.as_deref(), Some("store unavailable"));
    }

    #[test]
    fn test_serializes_snake_case() {
        let mut result = IndexResult::new("run".into());
        result.record_failure("a.py", "x");
        result.finish();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "completed_with_errors");
        assert!(json.get("abort_reason").is_none());
        assert!(result.summary().starts_with("completed_with_errors:"));
    }
}
