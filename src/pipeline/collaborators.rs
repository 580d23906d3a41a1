//! Concrete stage collaborators.
//!
//! The scraping stage runs in-process against the [`JobRegistry`]; every
//! other stage lives in the processing backend and is driven over HTTP with
//! the same start/poll shape.

use super::{PollReport, Stage, StageCollaborator, StageHandle};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::jobs::{JobRegistry, JobStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Drives the scraping stage by submitting one job per configured source and
/// polling the registry until every job is terminal. Individual job failures
/// count into the progress map but never fail the stage.
pub struct ScrapingStage {
    registry: Arc<JobRegistry>,
    sources: Vec<String>,
    active: Mutex<HashMap<String, Vec<String>>>,
}

impl ScrapingStage {
    pub fn new(registry: Arc<JobRegistry>, sources: Vec<String>) -> Self {
        Self {
            registry,
            sources,
            active: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StageCollaborator for ScrapingStage {
    async fn start(&self) -> Result<StageHandle> {
        let mut job_ids = Vec::new();
        for source in &self.sources {
            match self.registry.submit(source) {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) => {
                    error!(source = %source, "failed to start scraping job: {e}");
                }
            }
        }
        if job_ids.is_empty() {
            return Err(PipelineError::Stage {
                stage: Stage::Scraping.key().to_string(),
                message: "no scraping job could be started".to_string(),
            });
        }

        let handle = StageHandle(Uuid::new_v4().to_string());
        self.active
            .lock()
            .unwrap()
            .insert(handle.0.clone(), job_ids);
        Ok(handle)
    }

    async fn poll(&self, handle: &StageHandle) -> Result<PollReport> {
        let job_ids = self
            .active
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .unwrap_or_default();

        let mut terminal = 0i64;
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut new_ads = 0i64;
        let mut processed_ads = 0i64;
        for job_id in &job_ids {
            let Some(job) = self.registry.get(job_id) else {
                continue;
            };
            new_ads += job.new_ads;
            processed_ads += job.items_scraped;
            if !job.status.is_terminal() {
                continue;
            }
            terminal += 1;
            match job.status {
                JobStatus::Completed | JobStatus::CompletedWithParsingErrors => completed += 1,
                _ => failed += 1,
            }
        }

        let total = job_ids.len() as i64;
        let mut progress = HashMap::new();
        progress.insert("total".to_string(), total);
        progress.insert("sources_active".to_string(), total - terminal);
        progress.insert("sources_completed".to_string(), terminal);
        progress.insert("completed".to_string(), completed);
        progress.insert("failed".to_string(), failed);
        progress.insert("new_ads".to_string(), new_ads);
        progress.insert("processed_ads".to_string(), processed_ads);

        // Done means all jobs terminal, successfully or not.
        Ok(PollReport {
            done: terminal == total,
            progress,
            error: None,
        })
    }

    async fn stop(&self, handle: &StageHandle) {
        let job_ids = self
            .active
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .unwrap_or_default();
        for job_id in &job_ids {
            if let Err(e) = self.registry.stop(job_id) {
                warn!(job_id = %job_id, "failed to stop scraping job: {e}");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: Option<HashMap<String, i64>>,
    #[serde(default)]
    error: Option<String>,
}

/// Batch stage living in the processing backend: `POST` to start, `GET` a
/// status document until it reports completion.
pub struct HttpStage {
    stage: Stage,
    client: reqwest::Client,
    start_url: String,
    status_url: String,
    /// Some collaborators expose only a health endpoint; any successful
    /// response then counts as done (the reindex backend works this way).
    done_when_reachable: bool,
}

impl HttpStage {
    pub fn new(
        stage: Stage,
        client: reqwest::Client,
        start_url: String,
        status_url: String,
        done_when_reachable: bool,
    ) -> Self {
        Self {
            stage,
            client,
            start_url,
            status_url,
            done_when_reachable,
        }
    }
}

#[async_trait]
impl StageCollaborator for HttpStage {
    async fn start(&self) -> Result<StageHandle> {
        let response = self.client.post(&self.start_url).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Stage {
                stage: self.stage.key().to_string(),
                message: format!("start returned HTTP {}", response.status()),
            });
        }
        Ok(StageHandle(self.stage.key().to_string()))
    }

    async fn poll(&self, _handle: &StageHandle) -> Result<PollReport> {
        let response = self.client.get(&self.status_url).send().await?;
        if self.done_when_reachable {
            return Ok(PollReport {
                done: response.status().is_success(),
                ..PollReport::default()
            });
        }
        if !response.status().is_success() {
            // Treated as a transient tick; the orchestrator's timeout is the
            // backstop.
            debug!(stage = %self.stage, "status endpoint returned HTTP {}", response.status());
            return Ok(PollReport::default());
        }

        let body: StatusBody = response.json().await?;
        let progress = body.progress.unwrap_or_default();
        let report = match body.status.as_str() {
            // An idle status document means the backend finished and reset.
            "completed" | "idle" => PollReport {
                done: true,
                progress,
                error: None,
            },
            "error" => PollReport {
                done: false,
                progress,
                error: Some(
                    body.error
                        .unwrap_or_else(|| "stage reported an error".to_string()),
                ),
            },
            _ => PollReport {
                done: false,
                progress,
                error: None,
            },
        };
        Ok(report)
    }

    async fn stop(&self, _handle: &StageHandle) {
        // The processing backend has no cancel endpoint; its work simply runs
        // out. Best-effort means acknowledging that.
        debug!(stage = %self.stage, "stop requested; collaborator has no cancel endpoint");
    }
}

/// Per-request cap so a hung collaborator connection surfaces as a failed
/// poll tick instead of pinning the stage loop.
const HTTP_TIMEOUT_SECS: u64 = 30;

/// The production collaborator wiring: in-process scraping plus the
/// processing backend's HTTP endpoints for the batch stages.
pub fn default_collaborators(
    config: &Config,
    registry: Arc<JobRegistry>,
) -> Result<HashMap<Stage, Arc<dyn StageCollaborator>>> {
    let base = config.collaborators.base_url.trim_end_matches('/').to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()?;

    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(
        Stage::Scraping,
        Arc::new(ScrapingStage::new(registry, config.scraping.sources.clone())),
    );
    collaborators.insert(
        Stage::PhotoProcessing,
        Arc::new(HttpStage::new(
            Stage::PhotoProcessing,
            client.clone(),
            format!("{base}/api/process/photos"),
            format!("{base}/api/process/photos/status"),
            false,
        )),
    );
    collaborators.insert(
        Stage::DuplicateProcessing,
        Arc::new(HttpStage::new(
            Stage::DuplicateProcessing,
            client.clone(),
            format!("{base}/api/process/duplicates"),
            format!("{base}/api/process/duplicates/status"),
            false,
        )),
    );
    collaborators.insert(
        Stage::RealtorDetection,
        Arc::new(HttpStage::new(
            Stage::RealtorDetection,
            client.clone(),
            format!("{base}/api/process/realtors/detect"),
            format!("{base}/api/process/realtors/status"),
            false,
        )),
    );
    collaborators.insert(
        Stage::ElasticsearchReindex,
        Arc::new(HttpStage::new(
            Stage::ElasticsearchReindex,
            client,
            format!("{base}/api/elasticsearch/reindex"),
            format!("{base}/api/elasticsearch/health"),
            true,
        )),
    );
    Ok(collaborators)
}
