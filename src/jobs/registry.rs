//! Job registry and worker process launcher.
//!
//! One job per source-scrape invocation. The registry is the single writer of
//! every job record: reader tasks feed classified log lines back through it,
//! and a waiter task writes the terminal status exactly once at process exit.
//! Observers only ever receive whole cloned snapshots.

use super::{classify, extract_counters, resolve_status, Job, JobSnapshot, JobStatus};
use crate::config::ScrapingConfig;
use crate::error::{PipelineError, Result};
use crate::events::{EventPublisher, EventType};
use chrono::Utc;
use metrics::counter;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Synthetic exit code recorded when the worker could not be spawned at all.
const LAUNCH_FAILED_EXIT_CODE: i32 = -1;

pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
    kill_switches: Mutex<HashMap<String, watch::Sender<bool>>>,
    config: ScrapingConfig,
    publisher: Arc<EventPublisher>,
}

impl JobRegistry {
    pub fn new(config: ScrapingConfig, publisher: Arc<EventPublisher>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            kill_switches: Mutex::new(HashMap::new()),
            config,
            publisher,
        })
    }

    /// Spawns the worker for `source` and begins consuming its output.
    ///
    /// A spawn failure still creates the job, directly in a terminal `failed`
    /// state with a synthetic exit code and no log tail, so operators see the
    /// attempt in status queries.
    pub fn submit(self: &Arc<Self>, source: &str) -> Result<String> {
        if !self.config.sources.iter().any(|s| s == source) {
            return Err(PipelineError::UnknownSource(source.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let mut job = Job {
            id: id.clone(),
            source: source.to_string(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            stop_requested: false,
            has_parsing_errors: false,
            has_network_errors: false,
            has_success_signal: false,
            new_ads: 0,
            items_scraped: 0,
            log_tail: VecDeque::new(),
        };

        let args: Vec<String> = self
            .config
            .worker_args
            .iter()
            .map(|a| a.replace("{source}", source))
            .collect();
        let mut command = Command::new(&self.config.worker_command);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                job.status = JobStatus::Failed;
                job.exit_code = Some(LAUNCH_FAILED_EXIT_CODE);
                job.finished_at = Some(Utc::now());
                self.jobs.lock().unwrap().insert(id.clone(), job);
                counter!("estate_job_launch_failures_total").increment(1);
                self.publisher.publish(
                    EventType::JobError,
                    &id,
                    json!({ "source": source }),
                    Some(format!("failed to launch worker: {e}")),
                );
                return Err(PipelineError::JobLaunch {
                    source_name: source.to_string(),
                    message: e.to_string(),
                });
            }
        };

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.jobs.lock().unwrap().insert(id.clone(), job);
        counter!("estate_jobs_submitted_total", "source" => source.to_string()).increment(1);
        info!(job_id = %id, source = %source, "scraping job started");
        self.publisher.publish(
            EventType::JobStarted,
            &id,
            json!({ "source": source }),
            None,
        );

        let (kill_tx, mut kill_rx) = watch::channel(false);
        self.kill_switches.lock().unwrap().insert(id.clone(), kill_tx);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(id.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(id.clone(), stderr);
        }

        let registry = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.changed() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit_code = match exit {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(job_id = %job_id, "failed waiting on worker process: {e}");
                    None
                }
            };
            registry.finish(&job_id, exit_code);
        });

        Ok(id)
    }

    /// Marks the job for stopping and signals the process to terminate. The
    /// terminal status is still written only by the exit handler, so the
    /// stop-precedence rule sees the flag no matter how the process dies.
    pub fn stop(&self, job_id: &str) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(());
            }
            job.stop_requested = true;
        }
        if let Some(kill_tx) = self.kill_switches.lock().unwrap().get(job_id) {
            let _ = kill_tx.send(true);
        }
        info!(job_id = %job_id, "stop requested");
        Ok(())
    }

    /// Stops every pending/running job; returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let active: Vec<String> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.values()
                .filter(|j| !j.status.is_terminal())
                .map(|j| j.id.clone())
                .collect()
        };
        for id in &active {
            let _ = self.stop(id);
        }
        active.len()
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.lock().unwrap().get(job_id).map(JobSnapshot::from)
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(JobSnapshot::from).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Last `limit` retained log lines, oldest first.
    pub fn tail(&self, job_id: &str, limit: usize) -> Result<Vec<String>> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
        let skip = job.log_tail.len().saturating_sub(limit);
        Ok(job.log_tail.iter().skip(skip).cloned().collect())
    }

    /// Each output stream gets its own reader task so a blocked stream on one
    /// job never stalls classification for the others.
    fn spawn_reader<R>(self: &Arc<Self>, job_id: String, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                registry.record_line(&job_id, &line);
            }
        });
    }

    fn record_line(&self, job_id: &str, line: &str) {
        let signals = classify(line);
        let counters = extract_counters(line);
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(job_id) {
            job.has_parsing_errors |= signals.parsing;
            job.has_network_errors |= signals.network;
            job.has_success_signal |= signals.success;
            if let Some(n) = counters.new_ads {
                job.new_ads = n;
            }
            if let Some(n) = counters.items_scraped {
                job.items_scraped = n;
            }
            if job.log_tail.len() == self.config.log_tail_lines {
                job.log_tail.pop_front();
            }
            job.log_tail.push_back(line.to_string());
        }
    }

    /// Completion handler: resolves and writes the terminal status once.
    fn finish(&self, job_id: &str, exit_code: Option<i32>) {
        let (status, source) = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            let status = resolve_status(job.stop_requested, exit_code, job.has_parsing_errors);
            job.status = status;
            job.exit_code = exit_code;
            job.finished_at = Some(Utc::now());
            (status, job.source.clone())
        };
        self.kill_switches.lock().unwrap().remove(job_id);

        counter!("estate_jobs_finished_total", "status" => format!("{status:?}")).increment(1);
        info!(job_id = %job_id, source = %source, ?exit_code, ?status, "scraping job finished");

        let payload = json!({ "source": source, "exit_code": exit_code, "status": status });
        match status {
            JobStatus::Completed => {
                self.publisher
                    .publish(EventType::JobCompleted, job_id, payload, None);
            }
            JobStatus::CompletedWithParsingErrors => {
                self.publisher.publish(
                    EventType::JobError,
                    job_id,
                    payload,
                    Some(format!("scraping {source} finished with parsing errors")),
                );
            }
            JobStatus::Stopped => {
                self.publisher.publish(
                    EventType::JobError,
                    job_id,
                    payload,
                    Some(format!("scraping {source} stopped by request")),
                );
            }
            _ => {
                self.publisher.publish(
                    EventType::JobError,
                    job_id,
                    payload,
                    Some(format!("scraping {source} failed")),
                );
            }
        }
    }
}
