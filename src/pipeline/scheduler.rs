//! Auto-mode scheduler: re-runs the pipeline on the configured interval.

use super::{Orchestrator, PipelineStatus};
use crate::config::Config;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TICK: Duration = Duration::from_secs(30);
const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Spawns the background loop. When nothing is scheduled it plans the next
/// slot; when the slot comes due and the pipeline is at rest it starts a run.
pub fn spawn(orchestrator: Arc<Orchestrator>, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if config.pipeline.auto_mode && config.pipeline.run_immediately_on_start {
            // Give the collaborators a moment to come up before the first run.
            tokio::time::sleep(STARTUP_DELAY).await;
            info!("starting pipeline immediately (run_immediately_on_start)");
            let reply = orchestrator.start_pipeline();
            if !reply.accepted {
                warn!("startup pipeline run rejected: already running");
            }
        }

        loop {
            if config.pipeline.auto_mode {
                let snapshot = orchestrator.snapshot();
                let at_rest = matches!(
                    snapshot.status,
                    PipelineStatus::Idle | PipelineStatus::Completed
                );
                match snapshot.next_run_scheduled {
                    Some(due) if at_rest && Utc::now() >= due => {
                        info!("starting scheduled pipeline run");
                        orchestrator.start_pipeline();
                    }
                    None if at_rest => orchestrator.plan_next_run(),
                    _ => {}
                }
            }
            tokio::time::sleep(TICK).await;
        }
    })
}
