//! Pipeline orchestrator: the single run-level state machine.
//!
//! One pipeline run at a time, stages in fixed order, each stage driven
//! through its collaborator's start/poll/stop interface. Job-level failures
//! inside the scraping stage never abort the run; only an explicit stage
//! error or the stage timeout does.

use super::{
    PipelineSnapshot, PipelineStatus, PollReport, RunStats, Stage, StageCollaborator,
    StageDetail, StageStatus, StartReply, StopReply,
};
use crate::config::Config;
use crate::error::PipelineError;
use crate::events::{EventPublisher, EventType};
use crate::jobs::JobRegistry;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

struct RunState {
    status: PipelineStatus,
    current_stage: Option<Stage>,
    stage_details: BTreeMap<Stage, StageDetail>,
    stats: RunStats,
    last_run_start: Option<DateTime<Utc>>,
    last_run_end: Option<DateTime<Utc>>,
    next_run_scheduled: Option<DateTime<Utc>>,
    stop_tx: Option<watch::Sender<bool>>,
}

enum StageOutcome {
    Completed,
    Error,
    Stopped,
}

enum RunOutcome {
    Completed,
    Error,
    Stopped,
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<JobRegistry>,
    publisher: Arc<EventPublisher>,
    collaborators: HashMap<Stage, Arc<dyn StageCollaborator>>,
    enabled_stages: Vec<Stage>,
    run: Mutex<RunState>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<JobRegistry>,
        publisher: Arc<EventPublisher>,
        collaborators: HashMap<Stage, Arc<dyn StageCollaborator>>,
    ) -> Arc<Self> {
        let mut enabled_stages = Vec::new();
        for key in &config.pipeline.enabled_stages {
            match Stage::from_key(key) {
                Some(stage) => enabled_stages.push(stage),
                None => warn!("ignoring unknown stage key '{}' in config", key),
            }
        }

        Arc::new(Self {
            config,
            registry,
            publisher,
            collaborators,
            enabled_stages,
            run: Mutex::new(RunState {
                status: PipelineStatus::Idle,
                current_stage: None,
                stage_details: BTreeMap::new(),
                stats: RunStats::default(),
                last_run_start: None,
                last_run_end: None,
                next_run_scheduled: None,
                stop_tx: None,
            }),
        })
    }

    /// Starts a run on a background task. Single-flight: a second start while
    /// one is running is rejected without mutating anything.
    pub fn start_pipeline(self: &Arc<Self>) -> StartReply {
        let Some(stop_rx) = self.begin_run() else {
            counter!("estate_pipeline_start_rejected_total").increment(1);
            return StartReply {
                accepted: false,
                reason: Some("already running".to_string()),
            };
        };
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_pipeline(stop_rx).await;
        });
        StartReply {
            accepted: true,
            reason: None,
        }
    }

    /// Runs one pipeline pass inline; `true` if every enabled stage
    /// completed. Used by the one-shot CLI mode.
    pub async fn run_blocking(self: &Arc<Self>) -> bool {
        let Some(stop_rx) = self.begin_run() else {
            return false;
        };
        self.run_pipeline(stop_rx).await;
        self.snapshot().status == PipelineStatus::Completed
    }

    /// Requests cancellation of the running pipeline. The poll loop wakes
    /// immediately rather than waiting out its tick, active scraping jobs are
    /// stopped, and the run lands back in `idle` — distinct from the `error`
    /// a timeout produces.
    pub fn stop_pipeline(&self) -> StopReply {
        let scraping_active = {
            let run = self.run.lock().unwrap();
            if run.status != PipelineStatus::Running {
                return StopReply { accepted: false };
            }
            if let Some(stop_tx) = &run.stop_tx {
                let _ = stop_tx.send(true);
            }
            run.current_stage == Some(Stage::Scraping)
        };
        // Registry-wide sweep only while scraping is the active stage;
        // manually started jobs are otherwise not part of this run.
        if scraping_active {
            let stopped = self.registry.stop_all();
            if stopped > 0 {
                info!("stop requested for {} active scraping jobs", stopped);
            }
        }
        info!("pipeline stop requested");
        StopReply { accepted: true }
    }

    /// Best currently-known state; never blocks on in-flight work.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let run = self.run.lock().unwrap();
        PipelineSnapshot {
            status: run.status,
            current_stage: run.current_stage,
            stage_details: run.stage_details.clone(),
            stats: run.stats,
            enabled_stages: self.enabled_stages.clone(),
            interval_minutes: self.config.pipeline.interval_minutes,
            last_run_start: run.last_run_start,
            last_run_end: run.last_run_end,
            next_run_scheduled: run.next_run_scheduled,
        }
    }

    /// Plans the next auto-mode slot if the pipeline is at rest and nothing
    /// is scheduled yet.
    pub fn plan_next_run(&self) {
        let mut run = self.run.lock().unwrap();
        if matches!(
            run.status,
            PipelineStatus::Idle | PipelineStatus::Completed
        ) && run.next_run_scheduled.is_none()
        {
            let due =
                Utc::now() + chrono::Duration::minutes(self.config.pipeline.interval_minutes as i64);
            run.next_run_scheduled = Some(due);
            info!("next pipeline run scheduled for {}", due);
        }
    }

    /// Claims the single running slot; `None` when a run is already active.
    fn begin_run(&self) -> Option<watch::Receiver<bool>> {
        let stop_rx = {
            let mut run = self.run.lock().unwrap();
            if run.status == PipelineStatus::Running {
                return None;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            run.status = PipelineStatus::Running;
            // current_stage is non-null exactly while running; the first
            // enabled stage is about to start.
            run.current_stage = self.enabled_stages.first().copied();
            run.stage_details.clear();
            run.stats = RunStats::default();
            run.last_run_start = Some(Utc::now());
            run.last_run_end = None;
            run.next_run_scheduled = None;
            run.stop_tx = Some(stop_tx);
            stop_rx
        };
        self.publisher
            .publish(EventType::PipelineStarted, "pipeline", json!({}), None);
        Some(stop_rx)
    }

    async fn run_pipeline(&self, mut stop_rx: watch::Receiver<bool>) {
        info!("pipeline run started");
        counter!("estate_pipeline_runs_total").increment(1);
        let run_started = Instant::now();

        let mut outcome = RunOutcome::Completed;
        for stage in Stage::ORDER {
            if !self.enabled_stages.contains(&stage) {
                continue;
            }
            if *stop_rx.borrow() {
                outcome = RunOutcome::Stopped;
                break;
            }
            match self.execute_stage(stage, &mut stop_rx).await {
                StageOutcome::Completed => {}
                StageOutcome::Error => {
                    outcome = RunOutcome::Error;
                    break;
                }
                StageOutcome::Stopped => {
                    outcome = RunOutcome::Stopped;
                    break;
                }
            }
        }

        histogram!("estate_pipeline_run_duration_seconds")
            .record(run_started.elapsed().as_secs_f64());
        self.finalize_run(outcome);
    }

    fn finalize_run(&self, outcome: RunOutcome) {
        let auto_mode = self.config.pipeline.auto_mode;
        let interval = chrono::Duration::minutes(self.config.pipeline.interval_minutes as i64);

        let (event_type, message, stats) = {
            let mut run = self.run.lock().unwrap();
            run.current_stage = None;
            run.stop_tx = None;
            match outcome {
                RunOutcome::Completed => {
                    run.status = PipelineStatus::Completed;
                    let now = Utc::now();
                    run.last_run_end = Some(now);
                    if auto_mode {
                        run.next_run_scheduled = Some(now + interval);
                    }
                    (EventType::PipelineCompleted, None, run.stats)
                }
                RunOutcome::Error => {
                    run.status = PipelineStatus::Error;
                    run.last_run_end = Some(Utc::now());
                    (
                        EventType::PipelineError,
                        Some("pipeline run finished with errors".to_string()),
                        run.stats,
                    )
                }
                RunOutcome::Stopped => {
                    // A stopped run goes back to idle and leaves no half-open
                    // stage entries behind; untouched stages were never run.
                    run.status = PipelineStatus::Idle;
                    run.stage_details
                        .retain(|_, d| d.status != StageStatus::Running);
                    if auto_mode {
                        run.next_run_scheduled = Some(Utc::now() + interval);
                    }
                    (EventType::PipelineStopped, None, run.stats)
                }
            }
        };

        info!(?event_type, "pipeline run finished");
        self.publisher.publish(
            event_type,
            "pipeline",
            json!({ "stats": stats }),
            message,
        );
    }

    async fn execute_stage(
        &self,
        stage: Stage,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> StageOutcome {
        info!(stage = %stage, "stage started");
        {
            let mut run = self.run.lock().unwrap();
            run.current_stage = Some(stage);
            run.stage_details.insert(
                stage,
                StageDetail {
                    status: StageStatus::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                    progress: HashMap::new(),
                    error: None,
                },
            );
        }
        self.publisher
            .publish(EventType::StageStarted, stage.key(), json!({}), None);

        let Some(collaborator) = self.collaborators.get(&stage).map(Arc::clone) else {
            return self.fail_stage(stage, format!("no collaborator configured for '{stage}'"));
        };

        let handle = match collaborator.start().await {
            Ok(handle) => handle,
            Err(e) => return self.fail_stage(stage, e.to_string()),
        };

        let tick = self.poll_interval(stage);
        let max_wait = Duration::from_secs(self.config.pipeline.max_stage_wait_secs);
        let stage_started = Instant::now();

        loop {
            // Timeout counts from stage start, not from last observed
            // progress.
            let Some(remaining) = max_wait.checked_sub(stage_started.elapsed()) else {
                collaborator.stop(&handle).await;
                counter!("estate_stage_timeouts_total", "stage" => stage.key()).increment(1);
                let timeout = PipelineError::StageTimeout {
                    stage: stage.key().to_string(),
                    waited_secs: max_wait.as_secs(),
                };
                return self.fail_stage(stage, timeout.to_string());
            };

            // The poll itself is raced against the deadline and the stop
            // signal, so a hung collaborator cannot pin the stage past
            // either.
            let polled = tokio::select! {
                result = collaborator.poll(&handle) => Some(result),
                _ = tokio::time::sleep(remaining) => None,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        collaborator.stop(&handle).await;
                        info!(stage = %stage, "stage interrupted by stop request");
                        return StageOutcome::Stopped;
                    }
                    continue;
                }
            };

            match polled {
                // Deadline hit mid-poll; the top of the loop fails the stage.
                None => continue,
                Some(Ok(report)) => {
                    self.merge_progress(stage, &report.progress);
                    if let Some(stage_error) = report.error {
                        collaborator.stop(&handle).await;
                        return self.fail_stage(stage, stage_error);
                    }
                    if report.done {
                        self.complete_stage(stage, &report);
                        return StageOutcome::Completed;
                    }
                }
                Some(Err(e)) => {
                    // A failed poll tick is retried on the next one. Only an
                    // explicit collaborator error or the timeout fails the
                    // stage.
                    warn!(stage = %stage, "poll failed, will retry: {e}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        collaborator.stop(&handle).await;
                        info!(stage = %stage, "stage interrupted by stop request");
                        return StageOutcome::Stopped;
                    }
                }
            }
        }
    }

    fn poll_interval(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Scraping => self.config.pipeline.scrape_poll_secs,
            _ => self.config.pipeline.batch_poll_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    fn merge_progress(&self, stage: Stage, progress: &HashMap<String, i64>) {
        if progress.is_empty() {
            return;
        }
        {
            let mut run = self.run.lock().unwrap();
            if let Some(detail) = run.stage_details.get_mut(&stage) {
                for (key, value) in progress {
                    detail.progress.insert(key.clone(), *value);
                }
            }
        }
        // The message doubles as the debounce discriminator: identical
        // progress ticks collapse, real movement gets through.
        let mut entries: Vec<(&String, &i64)> = progress.iter().collect();
        entries.sort();
        let message = entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.publisher.publish(
            EventType::StageProgress,
            stage.key(),
            json!({ "progress": progress }),
            Some(message),
        );
    }

    fn complete_stage(&self, stage: Stage, report: &PollReport) {
        {
            let mut run = self.run.lock().unwrap();
            if let Some(detail) = run.stage_details.get_mut(&stage) {
                detail.status = StageStatus::Completed;
                detail.finished_at = Some(Utc::now());
            }
            fold_stats(stage, &report.progress, &mut run.stats);
        }
        info!(stage = %stage, "stage completed");
        self.publisher.publish(
            EventType::StageCompleted,
            stage.key(),
            json!({ "progress": report.progress }),
            None,
        );
    }

    fn fail_stage(&self, stage: Stage, message: String) -> StageOutcome {
        {
            let mut run = self.run.lock().unwrap();
            if let Some(detail) = run.stage_details.get_mut(&stage) {
                detail.status = StageStatus::Error;
                detail.finished_at = Some(Utc::now());
                detail.error = Some(message.clone());
            }
        }
        error!(stage = %stage, "stage failed: {message}");
        self.publisher.publish(
            EventType::StageError,
            stage.key(),
            json!({}),
            Some(message),
        );
        StageOutcome::Error
    }
}

/// Folds a completed stage's contribution into the run-level counters.
fn fold_stats(stage: Stage, progress: &HashMap<String, i64>, stats: &mut RunStats) {
    let get = |key: &str| progress.get(key).copied().unwrap_or(0);
    match stage {
        Stage::Scraping => {
            stats.new_ads += get("new_ads");
            stats.processed_ads += get("processed_ads");
        }
        Stage::PhotoProcessing => {}
        Stage::DuplicateProcessing => stats.duplicates_found += get("duplicates_found"),
        Stage::RealtorDetection => stats.realtors_found += get("detected"),
        Stage::ElasticsearchReindex => stats.indexed += get("indexed"),
    }
}
