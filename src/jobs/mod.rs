pub mod classifier;
pub mod registry;
pub mod resolver;

pub use classifier::{classify, extract_counters, LineCounters, LineSignals};
pub use registry::JobRegistry;
pub use resolver::resolve_status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Lifecycle states of one worker process invocation. Everything past
/// `Running` is terminal and written exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithParsingErrors,
    Failed,
    FailedWithParsingErrors,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// One worker process invocation scraping a single configured source.
///
/// The three signal flags OR-accumulate from the classifier for the lifetime
/// of the job; once set they never reset, even if later log lines look clean.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stop_requested: bool,
    pub has_parsing_errors: bool,
    pub has_network_errors: bool,
    pub has_success_signal: bool,
    /// Summary counters parsed from the worker's output; last value wins.
    pub new_ads: i64,
    pub items_scraped: i64,
    pub log_tail: VecDeque<String>,
}

/// Read-only view handed to status queries and the control surface. The log
/// tail is queried separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub source: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stop_requested: bool,
    pub has_parsing_errors: bool,
    pub has_network_errors: bool,
    pub has_success_signal: bool,
    pub new_ads: i64,
    pub items_scraped: i64,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            source: job.source.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            exit_code: job.exit_code,
            stop_requested: job.stop_requested,
            has_parsing_errors: job.has_parsing_errors,
            has_network_errors: job.has_network_errors,
            has_success_signal: job.has_success_signal,
            new_ads: job.new_ads,
            items_scraped: job.items_scraped,
        }
    }
}
