use async_trait::async_trait;
use estate_pipeline::config::Config;
use estate_pipeline::events::EventPublisher;
use estate_pipeline::jobs::{JobRegistry, JobStatus};
use estate_pipeline::pipeline::collaborators::ScrapingStage;
use estate_pipeline::pipeline::{
    Orchestrator, PipelineStatus, PollReport, Stage, StageCollaborator, StageHandle, StageStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted collaborator: hands out queued poll reports, then keeps
/// reporting "not done".
struct FakeStage {
    reports: Mutex<VecDeque<PollReport>>,
    starts: AtomicUsize,
}

impl FakeStage {
    fn with_reports(reports: Vec<PollReport>) -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(reports.into()),
            starts: AtomicUsize::new(0),
        })
    }

    fn completing(progress: &[(&str, i64)]) -> Arc<Self> {
        Self::with_reports(vec![PollReport {
            done: true,
            progress: progress
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            error: None,
        }])
    }

    fn erroring(message: &str) -> Arc<Self> {
        Self::with_reports(vec![PollReport {
            done: false,
            progress: HashMap::new(),
            error: Some(message.to_string()),
        }])
    }

    fn never_done() -> Arc<Self> {
        Self::with_reports(Vec::new())
    }

    fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageCollaborator for FakeStage {
    async fn start(&self) -> estate_pipeline::error::Result<StageHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(StageHandle("fake".to_string()))
    }

    async fn poll(&self, _handle: &StageHandle) -> estate_pipeline::error::Result<PollReport> {
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn stop(&self, _handle: &StageHandle) {}
}

fn test_config(enabled: &[&str]) -> Config {
    let mut config = Config::default();
    config.pipeline.enabled_stages = enabled.iter().map(|s| s.to_string()).collect();
    config.pipeline.scrape_poll_secs = 1;
    config.pipeline.batch_poll_secs = 1;
    config.pipeline.max_stage_wait_secs = 30;
    config
}

fn build(
    config: Config,
    collaborators: HashMap<Stage, Arc<dyn StageCollaborator>>,
) -> (Arc<Orchestrator>, Arc<JobRegistry>) {
    let config = Arc::new(config);
    let publisher = Arc::new(EventPublisher::new(Duration::from_secs(5)));
    let registry = JobRegistry::new(config.scraping.clone(), publisher.clone());
    let orchestrator = Orchestrator::new(config, registry.clone(), publisher, collaborators);
    (orchestrator, registry)
}

async fn wait_for_status(orchestrator: &Arc<Orchestrator>, expected: PipelineStatus) {
    for _ in 0..100 {
        if orchestrator.snapshot().status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for pipeline status {expected:?}");
}

#[tokio::test]
async fn run_completes_enabled_stages_and_folds_stats() {
    let duplicate = FakeStage::completing(&[("duplicates_found", 3)]);
    let realtor = FakeStage::completing(&[("detected", 2)]);
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::DuplicateProcessing, duplicate.clone());
    collaborators.insert(Stage::RealtorDetection, realtor.clone());

    let (orchestrator, _) = build(
        test_config(&["duplicate_processing", "realtor_detection"]),
        collaborators,
    );

    assert!(orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Completed);
    assert_eq!(snapshot.current_stage, None);
    assert_eq!(snapshot.stats.duplicates_found, 3);
    assert_eq!(snapshot.stats.realtors_found, 2);
    assert!(snapshot.last_run_end.is_some());
    for stage in [Stage::DuplicateProcessing, Stage::RealtorDetection] {
        assert_eq!(
            snapshot.stage_details.get(&stage).unwrap().status,
            StageStatus::Completed
        );
    }
}

#[tokio::test]
async fn disabled_stage_is_skipped_entirely() {
    let photo = FakeStage::completing(&[]);
    let duplicate = FakeStage::completing(&[]);
    let realtor = FakeStage::completing(&[]);
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, photo.clone());
    collaborators.insert(Stage::DuplicateProcessing, duplicate.clone());
    collaborators.insert(Stage::RealtorDetection, realtor.clone());

    let (orchestrator, _) = build(
        test_config(&["photo_processing", "realtor_detection"]),
        collaborators,
    );

    assert!(orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Completed);
    assert!(!snapshot
        .stage_details
        .contains_key(&Stage::DuplicateProcessing));
    assert_eq!(duplicate.start_count(), 0);
    assert_eq!(photo.start_count(), 1);
    assert_eq!(realtor.start_count(), 1);
}

#[tokio::test]
async fn start_while_running_is_rejected_without_mutation() {
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, FakeStage::never_done());

    let (orchestrator, _) = build(test_config(&["photo_processing"]), collaborators);

    let first = orchestrator.start_pipeline();
    assert!(first.accepted);
    wait_for_status(&orchestrator, PipelineStatus::Running).await;

    let run_start = orchestrator.snapshot().last_run_start;
    let second = orchestrator.start_pipeline();
    assert!(!second.accepted);
    assert_eq!(second.reason.as_deref(), Some("already running"));
    assert_eq!(orchestrator.snapshot().last_run_start, run_start);

    let stop = orchestrator.stop_pipeline();
    assert!(stop.accepted);
    wait_for_status(&orchestrator, PipelineStatus::Idle).await;
}

#[tokio::test]
async fn stage_error_aborts_remaining_stages() {
    let photo = FakeStage::erroring("photo backend exploded");
    let duplicate = FakeStage::completing(&[]);
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, photo);
    collaborators.insert(Stage::DuplicateProcessing, duplicate.clone());

    let (orchestrator, _) = build(
        test_config(&["photo_processing", "duplicate_processing"]),
        collaborators,
    );

    assert!(!orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Error);
    let detail = snapshot.stage_details.get(&Stage::PhotoProcessing).unwrap();
    assert_eq!(detail.status, StageStatus::Error);
    assert_eq!(detail.error.as_deref(), Some("photo backend exploded"));
    assert!(!snapshot
        .stage_details
        .contains_key(&Stage::DuplicateProcessing));
    assert_eq!(duplicate.start_count(), 0);
}

/// Collaborator whose poll never returns, like a wedged HTTP connection.
struct HangingStage;

#[async_trait]
impl StageCollaborator for HangingStage {
    async fn start(&self) -> estate_pipeline::error::Result<StageHandle> {
        Ok(StageHandle("hung".to_string()))
    }

    async fn poll(&self, _handle: &StageHandle) -> estate_pipeline::error::Result<PollReport> {
        std::future::pending().await
    }

    async fn stop(&self, _handle: &StageHandle) {}
}

#[tokio::test]
async fn stop_interrupts_a_poll_that_never_returns() {
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, Arc::new(HangingStage));

    let (orchestrator, _) = build(test_config(&["photo_processing"]), collaborators);

    assert!(orchestrator.start_pipeline().accepted);
    wait_for_status(&orchestrator, PipelineStatus::Running).await;
    // Give the stage loop time to enter the poll before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(orchestrator.stop_pipeline().accepted);
    wait_for_status(&orchestrator, PipelineStatus::Idle).await;
}

#[tokio::test]
async fn timeout_fires_even_while_a_poll_is_in_flight() {
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, Arc::new(HangingStage));

    let mut config = test_config(&["photo_processing"]);
    config.pipeline.max_stage_wait_secs = 1;

    let (orchestrator, _) = build(config, collaborators);

    assert!(!orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Error);
    let detail = snapshot.stage_details.get(&Stage::PhotoProcessing).unwrap();
    assert!(detail.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn stop_outside_scraping_leaves_manual_jobs_alone() {
    let mut config = test_config(&["photo_processing"]);
    config.scraping.sources = vec!["lalafo".to_string()];
    config.scraping.worker_command = "/bin/sh".to_string();
    config.scraping.worker_args = vec!["-c".to_string(), "sleep 5".to_string()];

    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, FakeStage::never_done());

    let (orchestrator, registry) = build(config, collaborators);

    let job_id = registry.submit("lalafo").unwrap();
    assert!(orchestrator.start_pipeline().accepted);
    wait_for_status(&orchestrator, PipelineStatus::Running).await;

    assert!(orchestrator.stop_pipeline().accepted);
    wait_for_status(&orchestrator, PipelineStatus::Idle).await;

    let job = registry.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(!job.stop_requested);

    registry.stop_all();
}

#[tokio::test]
async fn stage_that_never_finishes_times_out() {
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(Stage::PhotoProcessing, FakeStage::never_done());
    collaborators.insert(Stage::DuplicateProcessing, FakeStage::completing(&[]));

    let mut config = test_config(&["photo_processing", "duplicate_processing"]);
    config.pipeline.max_stage_wait_secs = 1;

    let (orchestrator, _) = build(config, collaborators);

    assert!(!orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Error);
    let detail = snapshot.stage_details.get(&Stage::PhotoProcessing).unwrap();
    assert_eq!(detail.status, StageStatus::Error);
    assert!(detail.error.as_deref().unwrap().contains("timed out"));
    assert!(!snapshot
        .stage_details
        .contains_key(&Stage::DuplicateProcessing));
}

fn scraping_config(script: &str) -> Config {
    let mut config = test_config(&["scraping"]);
    config.scraping.sources = vec!["lalafo".to_string()];
    config.scraping.worker_command = "/bin/sh".to_string();
    config.scraping.worker_args = vec!["-c".to_string(), script.to_string()];
    config
}

fn scraping_orchestrator(config: Config) -> (Arc<Orchestrator>, Arc<JobRegistry>) {
    let config = Arc::new(config);
    let publisher = Arc::new(EventPublisher::new(Duration::from_secs(5)));
    let registry = JobRegistry::new(config.scraping.clone(), publisher.clone());
    let mut collaborators: HashMap<Stage, Arc<dyn StageCollaborator>> = HashMap::new();
    collaborators.insert(
        Stage::Scraping,
        Arc::new(ScrapingStage::new(
            registry.clone(),
            config.scraping.sources.clone(),
        )),
    );
    let orchestrator = Orchestrator::new(config, registry.clone(), publisher, collaborators);
    (orchestrator, registry)
}

#[tokio::test]
async fn clean_scrape_completes_job_stage_and_run() {
    let (orchestrator, registry) = scraping_orchestrator(scraping_config(
        "echo 'New ads: 4'; echo 'Items scraped: 12'",
    ));

    assert!(orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Completed);
    assert_eq!(
        snapshot.stage_details.get(&Stage::Scraping).unwrap().status,
        StageStatus::Completed
    );
    // Worker summary counters flow through the stage progress into the
    // run-level stats.
    assert_eq!(snapshot.stats.new_ads, 4);
    assert_eq!(snapshot.stats.processed_ads, 12);

    let jobs = registry.list();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].exit_code, Some(0));
    assert_eq!(jobs[0].items_scraped, 12);
    assert!(jobs[0].has_success_signal);
    assert!(!jobs[0].has_parsing_errors);
}

#[tokio::test]
async fn parsing_error_line_degrades_job_but_not_the_run() {
    let (orchestrator, registry) = scraping_orchestrator(scraping_config(
        "echo 'Error extracting photos'; echo 'Items scraped: 12'",
    ));

    assert!(orchestrator.run_blocking().await);

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, PipelineStatus::Completed);
    assert_eq!(
        snapshot.stage_details.get(&Stage::Scraping).unwrap().status,
        StageStatus::Completed
    );

    let jobs = registry.list();
    assert_eq!(jobs.len(), 1);
    // Partial failure stays visible on the job while the stage and the run
    // still complete.
    assert_eq!(jobs[0].status, JobStatus::CompletedWithParsingErrors);
    assert!(jobs[0].has_parsing_errors);
    assert!(jobs[0].has_success_signal);
}
