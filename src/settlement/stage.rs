use super::JobReport;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{SettlementRecord, TxMeta};
use crate::ledger::repository::SettlementStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Status wiring of one stage on one axis
#[derive(Debug, Clone)]
pub struct Stage<R: SettlementRecord> {
    pub name: &'static str,
    pub axis: R::Axis,
    /// Statuses `advance` starts from; empty for stages the engine only watches
    pub ready: Vec<R::Status>,
    pub pending: R::Status,
    pub confirmed: R::Status,
    /// `None` for stages that never time out into an error
    pub error: Option<R::Status>,
    pub retry: Option<R::Status>,
}

/// Outcome of a stage's submit step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Transaction accepted by the ledger; stage moves to pending
    Sent(TxMeta),
    /// Post-condition already holds on chain; stage moves straight to confirmed
    AlreadySatisfied(String),
    /// Record mutated in preparation, no transaction yet; saved without a transition
    Prepared,
    /// Sender-side guard failed; nothing changes until the next tick
    Deferred(String),
    /// Sender ran out of gas and the driver moved the record back to an
    /// earlier status so it is funded again; saved without this stage's transition
    Restaged(String),
    /// Ledger refused the transaction; stage moves to error
    Rejected(String),
}

/// Family-specific behaviour behind one stage
#[async_trait]
pub trait StageDriver<R: SettlementRecord>: Send + Sync {
    fn stage(&self) -> &Stage<R>;

    /// Records of the queried status that belong to this driver
    fn owns(&self, _record: &R) -> bool {
        true
    }

    /// Cross-axis precondition for starting the stage
    fn ready(&self, _record: &R) -> bool {
        true
    }

    /// Whether the pending transaction's post-condition holds on chain
    async fn is_confirmed(&self, record: &R) -> AppResult<bool>;

    async fn submit(&self, record: &mut R, now: DateTime<Utc>) -> AppResult<Submission>;
}

/// Follow-on bookkeeping that must succeed before a completed record is deleted
#[async_trait]
pub trait PurgeHook<R: SettlementRecord>: Send + Sync {
    async fn on_complete(&self, record: &R) -> AppResult<()>;
}

pub struct NoopHook;

#[async_trait]
impl<R: SettlementRecord> PurgeHook<R> for NoopHook {
    async fn on_complete(&self, _record: &R) -> AppResult<()> {
        Ok(())
    }
}

/// Generic stage controller: moves batches of one family along one stage
pub struct StageController<R: SettlementRecord> {
    store: Arc<dyn SettlementStore<R>>,
    concurrency: usize,
}

impl<R: SettlementRecord> StageController<R> {
    pub fn new(store: Arc<dyn SettlementStore<R>>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore<R>> {
        &self.store
    }

    async fn transition(
        &self,
        record: &mut R,
        axis: R::Axis,
        to: R::Status,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let from = record.status(axis);
        record.set_status(axis, to, now);
        self.store.save(record).await?;

        info!(
            "{} {} {}: {:?} -> {:?}",
            R::FAMILY,
            record.id(),
            axis,
            from,
            to
        );
        Ok(())
    }

    /// Confirms pending records whose post-condition now holds.
    ///
    /// Ledger checks run with bounded concurrency; a failed check leaves the
    /// record untouched.
    pub async fn check_pending(
        &self,
        driver: &dyn StageDriver<R>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let stage = driver.stage();
        let mut report = JobReport::default();

        let pending: Vec<R> = self
            .store
            .find_by_status(stage.axis, &[stage.pending])
            .await?
            .into_iter()
            .filter(|record| driver.owns(record))
            .collect();

        if pending.is_empty() {
            return Ok(report);
        }
        debug!("🔍 Checking {} pending {} records", pending.len(), stage.name);

        let checked: Vec<(R, AppResult<bool>)> = stream::iter(pending)
            .map(|record| async move {
                let confirmed = driver.is_confirmed(&record).await;
                (record, confirmed)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (mut record, confirmed) in checked {
            match confirmed {
                Ok(true) => match self.transition(&mut record, stage.axis, stage.confirmed, now).await {
                    Ok(()) => report.confirmed += 1,
                    Err(e) => {
                        error!("❌ Failed to save confirmed {} {}: {}", stage.name, record.id(), e);
                        report.failed += 1;
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    warn!("⚠️ Could not check {} {}: {}", stage.name, record.id(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Moves pending records last touched at or before `threshold` to error
    pub async fn expire_stale(
        &self,
        driver: &dyn StageDriver<R>,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let stage = driver.stage();
        let mut report = JobReport::default();

        let Some(error_status) = stage.error else {
            return Ok(report);
        };

        let stale = self
            .store
            .find_by_status_and_staleness(stage.axis, &[stage.pending], threshold)
            .await?;

        for mut record in stale.into_iter().filter(|record| driver.owns(record)) {
            warn!("⏱️ {} {} timed out", stage.name, record.id());
            match self.transition(&mut record, stage.axis, error_status, now).await {
                Ok(()) => report.expired += 1,
                Err(e) => {
                    error!("❌ Failed to expire {} {}: {}", stage.name, record.id(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sends errored records back to the stage's entry point
    pub async fn stage_for_retry(
        &self,
        driver: &dyn StageDriver<R>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let stage = driver.stage();
        let mut report = JobReport::default();

        let (Some(error_status), Some(retry_status)) = (stage.error, stage.retry) else {
            return Ok(report);
        };

        let errored = self
            .store
            .find_by_status(stage.axis, &[error_status])
            .await?;

        for mut record in errored.into_iter().filter(|record| driver.owns(record)) {
            match self.transition(&mut record, stage.axis, retry_status, now).await {
                Ok(()) => report.retried += 1,
                Err(e) => {
                    error!("❌ Failed to stage {} {} for retry: {}", stage.name, record.id(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Starts the stage for every ready record.
    ///
    /// Records already pending are never selected, so repeated calls without a
    /// ledger change submit nothing new.
    pub async fn advance(
        &self,
        driver: &dyn StageDriver<R>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let stage = driver.stage();
        let mut report = JobReport::default();

        if stage.ready.is_empty() {
            return Ok(report);
        }

        let ready = self.store.find_by_status(stage.axis, &stage.ready).await?;

        for mut record in ready {
            if !driver.owns(&record) || !driver.ready(&record) {
                continue;
            }

            let submission = match driver.submit(&mut record, now).await {
                Ok(submission) => submission,
                Err(AppError::Gateway(e)) if e.is_rejection() => Submission::Rejected(e.to_string()),
                Err(e) => {
                    warn!("⚠️ {} {} not submitted: {}", stage.name, record.id(), e);
                    report.failed += 1;
                    continue;
                }
            };

            let saved = match submission {
                Submission::Sent(meta) => {
                    info!(
                        "📤 {} {} submitted (tx: {:?})",
                        stage.name,
                        record.id(),
                        meta.tx_hash
                    );
                    record.record_transaction(stage.axis, meta);
                    report.submitted += 1;
                    self.transition(&mut record, stage.axis, stage.pending, now).await
                }
                Submission::AlreadySatisfied(reason) => {
                    info!("⏭️ {} {} already satisfied: {}", stage.name, record.id(), reason);
                    report.short_circuited += 1;
                    self.transition(&mut record, stage.axis, stage.confirmed, now).await
                }
                Submission::Prepared => self.store.save(&record).await,
                Submission::Deferred(reason) => {
                    info!("⏸️ {} {} deferred: {}", stage.name, record.id(), reason);
                    report.deferred += 1;
                    Ok(())
                }
                Submission::Restaged(reason) => {
                    info!("↩️ {} {} restaged: {}", stage.name, record.id(), reason);
                    report.retried += 1;
                    self.store.save(&record).await
                }
                Submission::Rejected(reason) => {
                    error!("❌ {} {} rejected: {}", stage.name, record.id(), reason);
                    report.rejected += 1;
                    match stage.error {
                        Some(error_status) => {
                            self.transition(&mut record, stage.axis, error_status, now).await
                        }
                        None => Ok(()),
                    }
                }
            };

            if let Err(e) = saved {
                error!("❌ Failed to save {} {}: {}", stage.name, record.id(), e);
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Deletes completed records whose completion hook succeeds
    pub async fn purge(
        &self,
        axis: R::Axis,
        terminal: R::Status,
        hook: &dyn PurgeHook<R>,
    ) -> AppResult<JobReport> {
        let mut report = JobReport::default();

        let finished = self.store.find_by_status(axis, &[terminal]).await?;

        for record in finished.into_iter().filter(|record| record.is_complete()) {
            if let Err(e) = hook.on_complete(&record).await {
                warn!("⚠️ Completion hook failed for {} {}: {}", R::FAMILY, record.id(), e);
                report.failed += 1;
                continue;
            }

            match self.store.delete(&record).await {
                Ok(()) => {
                    info!("🗑️ Purged completed {} {}", R::FAMILY, record.id());
                    report.purged += 1;
                }
                Err(e) => {
                    error!("❌ Failed to purge {} {}: {}", R::FAMILY, record.id(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
