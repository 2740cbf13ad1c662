//! Staleness assessment from the persisted checkpoint.
//!
//! An index is stale when either signal fires: the repository moved past the
//! last indexed commit, or the last run is older than the allowed age.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    NeverIndexed,
    RunIncomplete,
    CommitBehind,
    TimeExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    pub stale: bool,
    #[serde(default)]
    pub reasons: Vec<StaleReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
}

#[must_use]
pub fn assess_freshness(
    checkpoint: Option<&Checkpoint>,
    current_head: Option<&str>,
    now: DateTime<Utc>,
    max_age: Option<Duration>,
) -> Freshness {
    let mut reasons = Vec::new();

    let Some(checkpoint) = checkpoint else {
        return Freshness {
            stale: true,
            reasons: vec![StaleReason::NeverIndexed],
            last_indexed_commit: None,
            current_head: current_head.map(String::from),
            age_secs: None,
        };
    };

    let never_completed =
        checkpoint.status != RunStatus::Completed && checkpoint.last_indexed_commit.is_none();
    if never_completed {
        reasons.push(StaleReason::NeverIndexed);
    }
    if checkpoint.status.is_resumable() {
        reasons.push(StaleReason::RunIncomplete);
    }

    if let Some(head) = current_head {
        if checkpoint.last_indexed_commit.as_deref() != Some(head) && !never_completed {
            reasons.push(StaleReason::CommitBehind);
        }
    }

    let age = now
        .signed_duration_since(checkpoint.timestamp)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if let Some(max_age) = max_age {
        if age > max_age {
            reasons.push(StaleReason::TimeExpired);
        }
    }

    Freshness {
        stale: !reasons.is_empty(),
        reasons,
        last_indexed_commit: checkpoint.last_indexed_commit.clone(),
        current_head: current_head.map(String::from),
        age_secs: Some(age.as_secs()),
    }
}
