// Settlement Scheduler - drives every settlement family on its own fixed interval
//
// - One tokio task per enabled family
// - Each tick runs in a spawned task so a panic only costs that tick
// - Missed ticks are skipped, a slow tick never causes a burst

use crate::config::JobSchedule;
use crate::settlement::{JobReport, SettlementJob};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of a job's most recent tick
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub last_run: DateTime<Utc>,
    pub report: Option<JobReport>,
    pub error: Option<String>,
}

pub type JobStatuses = Arc<RwLock<HashMap<&'static str, JobStatus>>>;

/// Settlement scheduler - runs each registered job on its configured interval
pub struct SettlementScheduler {
    jobs: Vec<(Arc<dyn SettlementJob>, JobSchedule)>,
    statuses: JobStatuses,
}

impl SettlementScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_job(mut self, job: Arc<dyn SettlementJob>, schedule: JobSchedule) -> Self {
        self.jobs.push((job, schedule));
        self
    }

    /// Shared view of the last tick per job, for the ops surface
    pub fn statuses(&self) -> JobStatuses {
        self.statuses.clone()
    }

    /// Start the scheduler (one background task per enabled job)
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for (job, schedule) in &self.jobs {
            if !schedule.enabled {
                info!("⏸️ Settlement job {} disabled", job.name());
                continue;
            }

            info!(
                "⏰ Settlement job {} every {}s",
                job.name(),
                schedule.interval().as_secs()
            );

            let job = job.clone();
            let statuses = self.statuses.clone();
            let period = schedule.interval();

            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    ticker.tick().await;
                    Self::tick(job.clone(), &statuses).await;
                }
            }));
        }

        handles
    }

    /// Runs one tick of `job` and records its outcome
    pub async fn tick(job: Arc<dyn SettlementJob>, statuses: &JobStatuses) {
        let name = job.name();
        let now = Utc::now();

        let outcome = tokio::spawn(async move { job.run_once(now).await }).await;

        let status = match outcome {
            Ok(Ok(report)) => {
                if report.is_idle() {
                    debug!("💤 {} idle", name);
                } else {
                    info!("✓ {} tick: {:?}", name, report);
                }
                JobStatus {
                    last_run: now,
                    report: Some(report),
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!("⚠️ {} tick failed: {}", name, e);
                JobStatus {
                    last_run: now,
                    report: None,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    "tick panicked".to_string()
                } else {
                    e.to_string()
                };
                error!("❌ {} {}", name, reason);
                JobStatus {
                    last_run: now,
                    report: None,
                    error: Some(reason),
                }
            }
        };

        statuses.write().insert(name, status);
    }
}

impl Default for SettlementScheduler {
    fn default() -> Self {
        Self::new()
    }
}
