pub mod collaborators;
pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::Orchestrator;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The pipeline phases, in their fixed run order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scraping,
    PhotoProcessing,
    DuplicateProcessing,
    RealtorDetection,
    ElasticsearchReindex,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Scraping,
        Stage::PhotoProcessing,
        Stage::DuplicateProcessing,
        Stage::RealtorDetection,
        Stage::ElasticsearchReindex,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Stage::Scraping => "scraping",
            Stage::PhotoProcessing => "photo_processing",
            Stage::DuplicateProcessing => "duplicate_processing",
            Stage::RealtorDetection => "realtor_detection",
            Stage::ElasticsearchReindex => "elasticsearch_reindex",
        }
    }

    pub fn from_key(key: &str) -> Option<Stage> {
        Stage::ORDER.iter().copied().find(|s| s.key() == key)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Opaque reference to work started at a collaborator.
#[derive(Debug, Clone)]
pub struct StageHandle(pub String);

/// What a collaborator reports on each poll tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollReport {
    pub done: bool,
    #[serde(default)]
    pub progress: HashMap<String, i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Boundary to every excluded subsystem. The orchestrator decides when work
/// starts and whether it finished; the collaborator owns how it is done.
#[async_trait::async_trait]
pub trait StageCollaborator: Send + Sync {
    async fn start(&self) -> Result<StageHandle>;
    async fn poll(&self, handle: &StageHandle) -> Result<PollReport>;
    /// Best-effort cancellation.
    async fn stop(&self, handle: &StageHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDetail {
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: HashMap<String, i64>,
    pub error: Option<String>,
}

/// Counters aggregated across a run from the stage progress maps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub new_ads: i64,
    pub processed_ads: i64,
    pub duplicates_found: i64,
    pub realtors_found: i64,
    pub indexed: i64,
}

/// Complete externally visible pipeline state. Always cloned out whole, so an
/// observer never sees a partially updated stage entry.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub status: PipelineStatus,
    pub current_stage: Option<Stage>,
    pub stage_details: BTreeMap<Stage, StageDetail>,
    pub stats: RunStats,
    pub enabled_stages: Vec<Stage>,
    pub interval_minutes: u64,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub next_run_scheduled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReply {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReply {
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_keys_round_trip() {
        for stage in Stage::ORDER {
            assert_eq!(Stage::from_key(stage.key()), Some(stage));
        }
        assert_eq!(Stage::from_key("photo"), None);
    }
}
