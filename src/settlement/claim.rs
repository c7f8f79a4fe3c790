use super::stage::{NoopHook, Stage, StageController, StageDriver, Submission};
use super::{JobReport, SettlementContext, SettlementJob};
use crate::error::AppResult;
use crate::ledger::models::{ClaimAxis, ClaimRecord, StageStatus, TxMeta};
use crate::ledger::repository::SettlementStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};

fn claim_stage<R: ClaimRecord>(name: &'static str, axis: ClaimAxis) -> Stage<R> {
    Stage {
        name,
        axis,
        ready: vec![StageStatus::NotStarted],
        pending: StageStatus::Pending,
        confirmed: StageStatus::Confirmed,
        error: Some(StageStatus::Error),
        retry: Some(StageStatus::NotStarted),
    }
}

/// Main wallet funds the treasure address with gas for the claim call.
///
/// An empty treasure that was never claimed has nothing to redeem: the claim
/// is closed out so the row can be reclaimed and purged.
struct ClaimGasStage<R: ClaimRecord> {
    context: Arc<SettlementContext>,
    stage: Stage<R>,
}

#[async_trait]
impl<R: ClaimRecord> StageDriver<R> for ClaimGasStage<R> {
    fn stage(&self) -> &Stage<R> {
        &self.stage
    }

    async fn is_confirmed(&self, record: &R) -> AppResult<bool> {
        self.context
            .gas_funded(record.treasure_address(), record.transaction(ClaimAxis::Gas))
            .await
    }

    async fn submit(&self, record: &mut R, now: DateTime<Utc>) -> AppResult<Submission> {
        let treasure = record.treasure_address().to_string();

        if record.starting_claim_clock().is_none() {
            let prl = self.context.gateway.check_asset_balance(&treasure).await?;
            if prl == Decimal::ZERO {
                warn!("⚠️ Treasure {} holds nothing to claim", treasure);
                record.set_status(ClaimAxis::Claim, StageStatus::Confirmed, now);
                return Ok(Submission::AlreadySatisfied(format!(
                    "treasure {} is empty",
                    treasure
                )));
            }
        }

        let needed = self
            .context
            .gateway
            .calculate_gas_to_send(self.context.gas_limits.claim)
            .await?;
        self.context.fund_gas(&treasure, needed, now).await
    }
}

/// Treasure address redeems its buried PRL to the receiver.
///
/// The claim clock is snapshotted in its own step first; a change from the
/// snapshot is what proves the claim executed.
struct ClaimStage<R: ClaimRecord> {
    context: Arc<SettlementContext>,
    stage: Stage<R>,
}

#[async_trait]
impl<R: ClaimRecord> StageDriver<R> for ClaimStage<R> {
    fn stage(&self) -> &Stage<R> {
        &self.stage
    }

    fn ready(&self, record: &R) -> bool {
        record.status(ClaimAxis::Gas) == StageStatus::Confirmed
    }

    async fn is_confirmed(&self, record: &R) -> AppResult<bool> {
        let Some(starting) = record.starting_claim_clock() else {
            return Ok(false);
        };
        let clock = self
            .context
            .gateway
            .check_claim_clock(record.treasure_address())
            .await?;
        Ok(clock != starting)
    }

    async fn submit(&self, record: &mut R, now: DateTime<Utc>) -> AppResult<Submission> {
        let gateway = &self.context.gateway;
        let treasure = record.treasure_address().to_string();

        let Some(starting) = record.starting_claim_clock() else {
            let clock = gateway.check_claim_clock(&treasure).await?;
            record.set_starting_claim_clock(clock);
            info!("🕰️ Claim clock for {} starts at {}", treasure, clock);
            return Ok(Submission::Prepared);
        };

        let clock = gateway.check_claim_clock(&treasure).await?;
        if clock != starting {
            return Ok(Submission::AlreadySatisfied(format!(
                "claim clock moved {} -> {}",
                starting, clock
            )));
        }

        let claim_cost = gateway
            .calculate_gas_to_send(self.context.gas_limits.claim)
            .await?;
        let gas = gateway.check_gas_balance(&treasure).await?;
        if gas < claim_cost {
            record.set_status(ClaimAxis::Gas, StageStatus::NotStarted, now);
            return Ok(Submission::Restaged(format!(
                "treasure gas {} below claim cost {}",
                gas, claim_cost
            )));
        }

        let receiver = record
            .receiver_address()
            .unwrap_or(self.context.wallet.address())
            .to_string();
        let key = self.context.decrypt(record.treasure_encrypted_key())?;
        let receipt = gateway.invoke_claim(&receiver, &treasure, &key).await?;

        info!("🏴‍☠️ Claiming treasure {} to {}", treasure, receiver);
        Ok(Submission::Sent(TxMeta::new(receipt.tx_hash, receipt.nonce, None, now)))
    }
}

/// Leftover treasure gas goes back to the main wallet
struct ClaimReclaimStage<R: ClaimRecord> {
    context: Arc<SettlementContext>,
    stage: Stage<R>,
}

#[async_trait]
impl<R: ClaimRecord> StageDriver<R> for ClaimReclaimStage<R> {
    fn stage(&self) -> &Stage<R> {
        &self.stage
    }

    fn ready(&self, record: &R) -> bool {
        record.status(ClaimAxis::Claim) == StageStatus::Confirmed
    }

    async fn is_confirmed(&self, record: &R) -> AppResult<bool> {
        self.context
            .gas_swept(record.treasure_address(), record.transaction(ClaimAxis::Reclaim))
            .await
    }

    async fn submit(&self, record: &mut R, now: DateTime<Utc>) -> AppResult<Submission> {
        self.context
            .sweep_gas(record.treasure_address(), record.treasure_encrypted_key(), now)
            .await
    }
}

/// Claim pipeline shared by webnode treasure claims and legacy PRL reclaims
pub struct ClaimSettlement<R: ClaimRecord> {
    name: &'static str,
    controller: StageController<R>,
    tx_timeout: Duration,
    gas: ClaimGasStage<R>,
    claim: ClaimStage<R>,
    reclaim: ClaimReclaimStage<R>,
}

impl<R: ClaimRecord> ClaimSettlement<R> {
    pub fn new(
        name: &'static str,
        store: Arc<dyn SettlementStore<R>>,
        context: Arc<SettlementContext>,
        tx_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            name,
            controller: StageController::new(store, concurrency),
            tx_timeout,
            gas: ClaimGasStage {
                context: context.clone(),
                stage: claim_stage("claim gas", ClaimAxis::Gas),
            },
            claim: ClaimStage {
                context: context.clone(),
                stage: claim_stage("claim", ClaimAxis::Claim),
            },
            reclaim: ClaimReclaimStage {
                context,
                stage: claim_stage("claim gas reclaim", ClaimAxis::Reclaim),
            },
        }
    }

    fn stages(&self) -> [&dyn StageDriver<R>; 3] {
        [&self.gas, &self.claim, &self.reclaim]
    }

    pub async fn check_pending_transactions(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.stages() {
            report += self.controller.check_pending(driver, now).await?;
        }
        Ok(report)
    }

    pub async fn set_timed_out_transactions_to_error(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.stages() {
            report += self.controller.expire_stale(driver, threshold, now).await?;
        }
        Ok(report)
    }

    pub async fn stage_transactions_with_errors_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.stages() {
            report += self.controller.stage_for_retry(driver, now).await?;
        }
        Ok(report)
    }

    pub async fn advance(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.stages() {
            report += self.controller.advance(driver, now).await?;
        }
        Ok(report)
    }

    pub async fn purge_completed(&self) -> AppResult<JobReport> {
        self.controller
            .purge(ClaimAxis::Reclaim, StageStatus::Confirmed, &NoopHook)
            .await
    }
}

#[async_trait]
impl<R: ClaimRecord> SettlementJob for ClaimSettlement<R> {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip(self), name = "claims", fields(job = self.name))]
    async fn run_once(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = self.check_pending_transactions(now).await?;
        report += self
            .set_timed_out_transactions_to_error(now - self.tx_timeout, now)
            .await?;
        report += self.stage_transactions_with_errors_for_retry(now).await?;
        report += self.advance(now).await?;
        report += self.purge_completed().await?;
        Ok(report)
    }
}
