use super::stage::{PurgeHook, Stage, StageController, StageDriver, Submission};
use super::{JobReport, SettlementContext, SettlementJob};
use crate::error::AppResult;
use crate::ledger::models::{BurialAxis, SettlementRecord, StageStatus, TreasuryBurial, TxMeta};
use crate::ledger::repository::{SettlementStore, TreasureMarker};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

fn burial_stage(name: &'static str, axis: BurialAxis) -> Stage<TreasuryBurial> {
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

/// Main wallet seeds the treasure address with its PRL
struct PrlStage {
    context: Arc<SettlementContext>,
    stage: Stage<TreasuryBurial>,
}

#[async_trait]
impl StageDriver<TreasuryBurial> for PrlStage {
    fn stage(&self) -> &Stage<TreasuryBurial> {
        &self.stage
    }

    async fn is_confirmed(&self, record: &TreasuryBurial) -> AppResult<bool> {
        let expected = record
            .transaction(BurialAxis::Prl)
            .and_then(|meta| meta.expected)
            .unwrap_or(record.prl_amount);
        let balance = self.context.gateway.check_asset_balance(&record.eth_addr).await?;
        Ok(balance >= expected)
    }

    async fn submit(&self, record: &mut TreasuryBurial, now: DateTime<Utc>) -> AppResult<Submission> {
        let gateway = &self.context.gateway;
        let wallet = &self.context.wallet;

        let held = gateway.check_asset_balance(&record.eth_addr).await?;
        if held >= record.prl_amount {
            return Ok(Submission::AlreadySatisfied(format!(
                "treasure {} already holds {} PRL",
                record.eth_addr, held
            )));
        }

        let send_cost = gateway
            .calculate_gas_to_send(self.context.gas_limits.prl_transfer)
            .await?;

        let _spend = wallet.lock_spend().await;
        let prl = gateway.check_asset_balance(wallet.address()).await?;
        let gas = gateway.check_gas_balance(wallet.address()).await?;
        if prl < record.prl_amount || gas < send_cost {
            return Ok(Submission::Deferred(format!(
                "main wallet holds {} PRL / {} gas, needs {} PRL / {} gas",
                prl, gas, record.prl_amount, send_cost
            )));
        }

        let key = wallet.signing_key(&self.context.vault)?;
        let receipt = gateway
            .send_asset(wallet.address(), &key, &record.eth_addr, record.prl_amount)
            .await?;

        info!("💰 Seeded treasure {} with {} PRL", record.eth_addr, record.prl_amount);
        Ok(Submission::Sent(TxMeta::new(
            receipt.tx_hash,
            receipt.nonce,
            Some(record.prl_amount),
            now,
        )))
    }
}

/// Main wallet funds the treasure address with gas for the bury call
struct GasStage {
    context: Arc<SettlementContext>,
    stage: Stage<TreasuryBurial>,
}

#[async_trait]
impl StageDriver<TreasuryBurial> for GasStage {
    fn stage(&self) -> &Stage<TreasuryBurial> {
        &self.stage
    }

    fn ready(&self, record: &TreasuryBurial) -> bool {
        record.prl_status == StageStatus::Confirmed
    }

    async fn is_confirmed(&self, record: &TreasuryBurial) -> AppResult<bool> {
        self.context
            .gas_funded(&record.eth_addr, record.transaction(BurialAxis::Gas))
            .await
    }

    async fn submit(&self, record: &mut TreasuryBurial, now: DateTime<Utc>) -> AppResult<Submission> {
        let needed = self
            .context
            .gateway
            .calculate_gas_to_send(self.context.gas_limits.bury)
            .await?;
        self.context.fund_gas(&record.eth_addr, needed, now).await
    }
}

/// Treasure address buries its own PRL
struct BuryStage {
    context: Arc<SettlementContext>,
    stage: Stage<TreasuryBurial>,
}

#[async_trait]
impl StageDriver<TreasuryBurial> for BuryStage {
    fn stage(&self) -> &Stage<TreasuryBurial> {
        &self.stage
    }

    fn ready(&self, record: &TreasuryBurial) -> bool {
        record.prl_status == StageStatus::Confirmed && record.gas_status == StageStatus::Confirmed
    }

    async fn is_confirmed(&self, record: &TreasuryBurial) -> AppResult<bool> {
        Ok(self.context.gateway.check_buried_state(&record.eth_addr).await?)
    }

    async fn submit(&self, record: &mut TreasuryBurial, now: DateTime<Utc>) -> AppResult<Submission> {
        let gateway = &self.context.gateway;

        if gateway.check_buried_state(&record.eth_addr).await? {
            return Ok(Submission::AlreadySatisfied(format!(
                "treasure {} already buried",
                record.eth_addr
            )));
        }

        let bury_cost = gateway
            .calculate_gas_to_send(self.context.gas_limits.bury)
            .await?;
        let gas = gateway.check_gas_balance(&record.eth_addr).await?;
        if gas < bury_cost {
            // A spent or timed-out bury leaves the treasure short; fund it again
            record.set_status(BurialAxis::Gas, StageStatus::NotStarted, now);
            return Ok(Submission::Restaged(format!(
                "treasure gas {} below bury cost {}",
                gas, bury_cost
            )));
        }

        let key = self.context.decrypt(&record.encrypted_key)?;
        let receipt = gateway.invoke_bury(&record.eth_addr, &key).await?;

        info!("⚱️ Burying treasure {} for {}", record.eth_addr, record.genesis_hash);
        Ok(Submission::Sent(TxMeta::new(receipt.tx_hash, receipt.nonce, None, now)))
    }
}

/// Completed burials flag their upload so webnodes can find the treasure
struct MarkBuried {
    marker: Arc<dyn TreasureMarker>,
}

#[async_trait]
impl PurgeHook<TreasuryBurial> for MarkBuried {
    async fn on_complete(&self, record: &TreasuryBurial) -> AppResult<()> {
        self.marker.mark_genesis_hash_buried(&record.genesis_hash).await
    }
}

/// Treasure burial: PRL, then gas, then the on-chain bury call
pub struct BurialSettlement {
    controller: StageController<TreasuryBurial>,
    tx_timeout: Duration,
    prl: PrlStage,
    gas: GasStage,
    bury: BuryStage,
    mark_buried: MarkBuried,
}

impl BurialSettlement {
    pub fn new(
        store: Arc<dyn SettlementStore<TreasuryBurial>>,
        marker: Arc<dyn TreasureMarker>,
        context: Arc<SettlementContext>,
        tx_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            controller: StageController::new(store, concurrency),
            tx_timeout,
            prl: PrlStage {
                context: context.clone(),
                stage: burial_stage("treasure prl", BurialAxis::Prl),
            },
            gas: GasStage {
                context: context.clone(),
                stage: burial_stage("treasure gas", BurialAxis::Gas),
            },
            bury: BuryStage {
                context,
                stage: burial_stage("treasure bury", BurialAxis::Bury),
            },
            mark_buried: MarkBuried { marker },
        }
    }

    fn stages(&self) -> [&dyn StageDriver<TreasuryBurial>; 3] {
        [&self.prl, &self.gas, &self.bury]
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
            .purge(BurialAxis::Bury, StageStatus::Confirmed, &self.mark_buried)
            .await
    }
}

#[async_trait]
impl SettlementJob for BurialSettlement {
    fn name(&self) -> &'static str {
        "treasury_burials"
    }

    #[instrument(skip(self), name = "treasury_burials")]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::mock::{MockLedgerGateway, Submitted};
    use crate::ledger::memory::{MemoryStore, MemoryTreasureMarker};
    use crate::settlement::testing::{funded_context, seal, MAIN};
    use rust_decimal_macros::dec;

    const TREASURE: &str = "0xtreasure";

    struct Harness {
        gateway: Arc<MockLedgerGateway>,
        context: Arc<SettlementContext>,
        store: Arc<MemoryStore<TreasuryBurial>>,
        marker: Arc<MemoryTreasureMarker>,
        settlement: BurialSettlement,
    }

    fn harness() -> Harness {
        let (gateway, context) = funded_context();
        let store = Arc::new(MemoryStore::new());
        let marker = Arc::new(MemoryTreasureMarker::new());
        let settlement = BurialSettlement::new(
            store.clone(),
            marker.clone(),
            context.clone(),
            Duration::hours(1),
            4,
        );
        Harness {
            gateway,
            context,
            store,
            marker,
            settlement,
        }
    }

    impl Harness {
        async fn treasure(&self, updated_at: DateTime<Utc>) -> TreasuryBurial {
            let key = seal(&self.context, "treasure-key");
            let record = TreasuryBurial::new("gh-t", TREASURE, key, dec!(1000), updated_at);
            self.store.save(&record).await.unwrap();
            record
        }

        async fn reload(&self, record: &TreasuryBurial) -> TreasuryBurial {
            self.store.get(record.id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_stale_prl_errors_then_returns_to_waiting() {
        let h = harness();
        let now = Utc::now();
        let mut record = h.treasure(now).await;
        record.set_status(BurialAxis::Prl, StageStatus::Pending, now - Duration::hours(24));
        h.store.save(&record).await.unwrap();

        h.settlement
            .set_timed_out_transactions_to_error(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(h.reload(&record).await.prl_status, StageStatus::Error);

        h.settlement
            .stage_transactions_with_errors_for_retry(now)
            .await
            .unwrap();
        assert_eq!(h.reload(&record).await.prl_status, StageStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_main_wallet_guard_blocks_prl_send() {
        let h = harness();
        let now = Utc::now();
        h.gateway.set_asset_balance(MAIN, dec!(999));
        let record = h.treasure(now).await;

        let report = h.settlement.advance(now).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert!(h.gateway.submissions().is_empty());
        let saved = h.reload(&record).await;
        assert_eq!(saved.prl_status, StageStatus::NotStarted);
        assert_eq!(saved.updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_main_wallet_gas_guard_blocks_prl_send() {
        let h = harness();
        let now = Utc::now();
        h.gateway.set_gas_balance(MAIN, dec!(59999));
        h.treasure(now).await;

        h.settlement.advance(now).await.unwrap();

        assert!(h.gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_funded_treasure_short_circuits_prl() {
        let h = harness();
        let now = Utc::now();
        h.gateway.set_asset_balance(TREASURE, dec!(1000));
        let record = h.treasure(now).await;

        h.settlement.advance(now).await.unwrap();

        let saved = h.reload(&record).await;
        assert_eq!(saved.prl_status, StageStatus::Confirmed);
        // Gas goes out in the same pass, but no PRL does
        assert!(h
            .gateway
            .submissions()
            .iter()
            .all(|s| !matches!(s, Submitted::Asset { .. })));
    }

    #[tokio::test]
    async fn test_later_axes_never_start_early() {
        let h = harness();
        h.gateway.settle_transfers(true);
        let now = Utc::now();
        let record = h.treasure(now).await;

        for _ in 0..4 {
            h.settlement.run_once(now).await.unwrap();
            let saved = h.reload(&record).await;
            if saved.bury_status != StageStatus::NotStarted {
                assert_eq!(saved.gas_status, StageStatus::Confirmed);
            }
            if saved.gas_status != StageStatus::NotStarted {
                assert_eq!(saved.prl_status, StageStatus::Confirmed);
            }
        }
    }

    #[tokio::test]
    async fn test_burial_runs_to_completion_and_marks_upload() {
        let h = harness();
        h.gateway.settle_transfers(true);
        let record = h.treasure(Utc::now()).await;

        for _ in 0..6 {
            h.settlement.run_once(Utc::now()).await.unwrap();
        }

        assert!(h.store.get(record.id).await.is_none());
        assert!(h.marker.is_buried("gh-t").await);
        assert_eq!(h.gateway.asset_balance(TREASURE), dec!(1000));
        assert!(h
            .gateway
            .submissions()
            .contains(&Submitted::Bury { address: TREASURE.to_string() }));
        assert!(h.gateway.keys_used().contains(&"treasure-key".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_bury_is_retried() {
        let h = harness();
        let now = Utc::now();
        let mut record = h.treasure(now).await;
        record.prl_status = StageStatus::Confirmed;
        record.gas_status = StageStatus::Confirmed;
        h.store.save(&record).await.unwrap();
        h.gateway.set_gas_balance(TREASURE, dec!(70000));
        h.gateway.reject_submissions(true);

        let report = h.settlement.advance(now).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(h.reload(&record).await.bury_status, StageStatus::Error);

        h.gateway.reject_submissions(false);
        h.settlement.stage_transactions_with_errors_for_retry(now).await.unwrap();
        h.settlement.advance(now).await.unwrap();
        assert_eq!(h.reload(&record).await.bury_status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_bury_that_burned_treasure_gas_is_funded_again() {
        let h = harness();
        h.gateway.settle_transfers(true);
        let now = Utc::now();
        let stale = now - Duration::hours(3);
        let mut record = h.treasure(stale).await;
        record.set_status(BurialAxis::Prl, StageStatus::Confirmed, stale);
        record.set_status(BurialAxis::Gas, StageStatus::Confirmed, stale);
        record.set_status(BurialAxis::Bury, StageStatus::Pending, stale);
        h.store.save(&record).await.unwrap();

        h.settlement.run_once(now).await.unwrap();
        let saved = h.reload(&record).await;
        assert_eq!(saved.gas_status, StageStatus::NotStarted);
        assert_eq!(saved.bury_status, StageStatus::NotStarted);
        assert!(h.gateway.submissions().is_empty());

        for _ in 0..3 {
            h.settlement.run_once(now).await.unwrap();
        }

        assert!(h.store.get(record.id).await.is_none());
        assert!(h.marker.is_buried("gh-t").await);
        assert_eq!(
            h.gateway.submissions(),
            vec![
                Submitted::Gas {
                    from: MAIN.to_string(),
                    to: TREASURE.to_string(),
                    amount: dec!(70000),
                },
                Submitted::Bury { address: TREASURE.to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn test_already_buried_treasure_short_circuits_bury() {
        let h = harness();
        let now = Utc::now();
        let mut record = h.treasure(now).await;
        record.prl_status = StageStatus::Confirmed;
        record.gas_status = StageStatus::Confirmed;
        h.store.save(&record).await.unwrap();
        h.gateway.set_buried(TREASURE);

        let report = h.settlement.advance(now).await.unwrap();

        assert_eq!(report.short_circuited, 1);
        assert_eq!(h.reload(&record).await.bury_status, StageStatus::Confirmed);
        assert!(h.gateway.submissions().is_empty());
    }
}
