use super::stage::{NoopHook, PurgeHook, Stage, StageController, StageDriver, Submission};
use super::{JobReport, SettlementContext, SettlementJob};
use crate::config::DEFAULT_BETA_TIMEOUT_MULTIPLIER;
use crate::error::{AppResult, CustodyError};
use crate::ledger::models::{BrokerPayment, BrokerType, PaymentAxis, PaymentStatus, SettlementRecord, TxMeta};
use crate::ledger::repository::SettlementStore;
use crate::reputation::ReputationReporter;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use PaymentStatus::*;

const AXIS: PaymentAxis = PaymentAxis::Lifecycle;

/// Client payment landing at the alpha address.
///
/// Alpha-side records move on to gas funding; beta-side records start
/// waiting for their half.
struct AlphaPaymentCheck {
    context: Arc<SettlementContext>,
    owner: BrokerType,
    stage: Stage<BrokerPayment>,
}

impl AlphaPaymentCheck {
    fn new(context: Arc<SettlementContext>, owner: BrokerType) -> Self {
        let confirmed = match owner {
            BrokerType::Alpha => AlphaPaymentConfirmed,
            BrokerType::Beta => BetaPaymentPending,
        };
        Self {
            context,
            owner,
            stage: Stage {
                name: "alpha payment",
                axis: AXIS,
                ready: Vec::new(),
                pending: AlphaPaymentPending,
                confirmed,
                error: None,
                retry: None,
            },
        }
    }
}

#[async_trait]
impl StageDriver<BrokerPayment> for AlphaPaymentCheck {
    fn stage(&self) -> &Stage<BrokerPayment> {
        &self.stage
    }

    fn owns(&self, record: &BrokerPayment) -> bool {
        record.broker_type == self.owner
    }

    async fn is_confirmed(&self, record: &BrokerPayment) -> AppResult<bool> {
        let balance = self
            .context
            .gateway
            .check_asset_balance(&record.eth_addr_alpha)
            .await?;
        Ok(balance >= record.total_cost)
    }

    async fn submit(&self, _record: &mut BrokerPayment, _now: DateTime<Utc>) -> AppResult<Submission> {
        Ok(Submission::Deferred("the client pays alpha directly".to_string()))
    }
}

/// Main wallet funds the alpha address with enough gas to pay beta
struct GasPaymentStage {
    context: Arc<SettlementContext>,
    stage: Stage<BrokerPayment>,
}

#[async_trait]
impl StageDriver<BrokerPayment> for GasPaymentStage {
    fn stage(&self) -> &Stage<BrokerPayment> {
        &self.stage
    }

    fn owns(&self, record: &BrokerPayment) -> bool {
        record.is_alpha()
    }

    async fn is_confirmed(&self, record: &BrokerPayment) -> AppResult<bool> {
        self.context
            .gas_funded(&record.eth_addr_alpha, record.transaction(AXIS))
            .await
    }

    async fn submit(&self, record: &mut BrokerPayment, now: DateTime<Utc>) -> AppResult<Submission> {
        let needed = self
            .context
            .gateway
            .calculate_gas_to_send(self.context.gas_limits.prl_transfer)
            .await?;
        self.context.fund_gas(&record.eth_addr_alpha, needed, now).await
    }
}

/// Alpha forwards half of what it received to beta
struct BetaPaymentStage {
    context: Arc<SettlementContext>,
    stage: Stage<BrokerPayment>,
}

#[async_trait]
impl StageDriver<BrokerPayment> for BetaPaymentStage {
    fn stage(&self) -> &Stage<BrokerPayment> {
        &self.stage
    }

    fn owns(&self, record: &BrokerPayment) -> bool {
        record.is_alpha()
    }

    async fn is_confirmed(&self, record: &BrokerPayment) -> AppResult<bool> {
        let balance = self
            .context
            .gateway
            .check_asset_balance(&record.eth_addr_beta)
            .await?;
        let expected = record
            .transaction(AXIS)
            .and_then(|meta| meta.expected)
            .unwrap_or(Decimal::ONE);
        Ok(balance >= expected)
    }

    async fn submit(&self, record: &mut BrokerPayment, now: DateTime<Utc>) -> AppResult<Submission> {
        let gateway = &self.context.gateway;

        let beta_balance = gateway.check_asset_balance(&record.eth_addr_beta).await?;
        if beta_balance > Decimal::ZERO {
            return Ok(Submission::AlreadySatisfied(format!(
                "beta {} already holds {} PRL",
                record.eth_addr_beta, beta_balance
            )));
        }

        let alpha_balance = gateway.check_asset_balance(&record.eth_addr_alpha).await?;
        let half = (alpha_balance / Decimal::TWO).floor();
        if half <= Decimal::ZERO {
            return Ok(Submission::Deferred(format!(
                "alpha {} holds nothing to split",
                record.eth_addr_alpha
            )));
        }

        let send_cost = gateway
            .calculate_gas_to_send(self.context.gas_limits.prl_transfer)
            .await?;
        let alpha_gas = gateway.check_gas_balance(&record.eth_addr_alpha).await?;
        if alpha_gas < send_cost {
            // Back to the gas stage so the main wallet tops alpha up again
            record.set_status(AXIS, AlphaPaymentConfirmed, now);
            return Ok(Submission::Restaged(format!(
                "alpha gas {} below transfer cost {}",
                alpha_gas, send_cost
            )));
        }

        let sealed = record
            .alpha_encrypted_key
            .as_deref()
            .ok_or_else(|| CustodyError::MissingSecret(record.eth_addr_alpha.clone()))?;
        let key = self.context.decrypt(sealed)?;

        let receipt = gateway
            .send_asset(&record.eth_addr_alpha, &key, &record.eth_addr_beta, half)
            .await?;

        info!("💸 Alpha {} paid beta {} {} PRL", record.eth_addr_alpha, record.eth_addr_beta, half);
        Ok(Submission::Sent(TxMeta::new(
            receipt.tx_hash,
            receipt.nonce,
            Some(half),
            now,
        )))
    }
}

/// Beta-side records wait for alpha's half to show up
struct IncomingBetaPayment {
    context: Arc<SettlementContext>,
    stage: Stage<BrokerPayment>,
}

#[async_trait]
impl StageDriver<BrokerPayment> for IncomingBetaPayment {
    fn stage(&self) -> &Stage<BrokerPayment> {
        &self.stage
    }

    fn owns(&self, record: &BrokerPayment) -> bool {
        !record.is_alpha()
    }

    async fn is_confirmed(&self, record: &BrokerPayment) -> AppResult<bool> {
        let balance = self
            .context
            .gateway
            .check_asset_balance(&record.eth_addr_beta)
            .await?;
        Ok(balance > Decimal::ZERO)
    }

    async fn submit(&self, _record: &mut BrokerPayment, _now: DateTime<Utc>) -> AppResult<Submission> {
        Ok(Submission::Deferred("alpha pays beta".to_string()))
    }
}

/// Leftover alpha gas goes back to the main wallet
struct GasReclaimStage {
    context: Arc<SettlementContext>,
    stage: Stage<BrokerPayment>,
}

#[async_trait]
impl StageDriver<BrokerPayment> for GasReclaimStage {
    fn stage(&self) -> &Stage<BrokerPayment> {
        &self.stage
    }

    fn owns(&self, record: &BrokerPayment) -> bool {
        record.is_alpha()
    }

    async fn is_confirmed(&self, record: &BrokerPayment) -> AppResult<bool> {
        self.context
            .gas_swept(&record.eth_addr_alpha, record.transaction(AXIS))
            .await
    }

    async fn submit(&self, record: &mut BrokerPayment, now: DateTime<Utc>) -> AppResult<Submission> {
        let sealed = record
            .alpha_encrypted_key
            .as_deref()
            .ok_or_else(|| CustodyError::MissingSecret(record.eth_addr_alpha.clone()))?;
        self.context.sweep_gas(&record.eth_addr_alpha, sealed, now).await
    }
}

/// Beta-side completion tells the reputation service alpha behaved
struct ReportGoodAlpha {
    reporter: Arc<dyn ReputationReporter>,
}

#[async_trait]
impl PurgeHook<BrokerPayment> for ReportGoodAlpha {
    async fn on_complete(&self, record: &BrokerPayment) -> AppResult<()> {
        self.reporter.report_good_alpha(record).await
    }
}

/// Engine-side stage of the payment lifecycle, with its status wiring
fn payment_stage(
    name: &'static str,
    ready: PaymentStatus,
    pending: PaymentStatus,
    confirmed: PaymentStatus,
) -> Stage<BrokerPayment> {
    Stage {
        name,
        axis: AXIS,
        ready: vec![ready],
        pending,
        confirmed,
        error: pending.error_of(),
        retry: pending.error_of().and_then(PaymentStatus::retry_of),
    }
}

/// Alpha/beta broker payment reconciliation
pub struct PaymentSettlement {
    controller: StageController<BrokerPayment>,
    reporter: Arc<dyn ReputationReporter>,
    tx_timeout: Duration,
    beta_timeout_multiplier: i32,
    alpha_check: AlphaPaymentCheck,
    beta_side_alpha_check: AlphaPaymentCheck,
    gas: GasPaymentStage,
    beta: BetaPaymentStage,
    incoming_beta: IncomingBetaPayment,
    reclaim: GasReclaimStage,
}

impl PaymentSettlement {
    pub fn new(
        store: Arc<dyn SettlementStore<BrokerPayment>>,
        context: Arc<SettlementContext>,
        reporter: Arc<dyn ReputationReporter>,
        tx_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            controller: StageController::new(store, concurrency),
            reporter,
            tx_timeout,
            beta_timeout_multiplier: DEFAULT_BETA_TIMEOUT_MULTIPLIER,
            alpha_check: AlphaPaymentCheck::new(context.clone(), BrokerType::Alpha),
            beta_side_alpha_check: AlphaPaymentCheck::new(context.clone(), BrokerType::Beta),
            gas: GasPaymentStage {
                context: context.clone(),
                stage: payment_stage("gas payment", AlphaPaymentConfirmed, GasPaymentPending, GasPaymentConfirmed),
            },
            beta: BetaPaymentStage {
                context: context.clone(),
                stage: payment_stage("beta payment", GasPaymentConfirmed, BetaPaymentPending, BetaPaymentConfirmed),
            },
            incoming_beta: IncomingBetaPayment {
                context: context.clone(),
                stage: Stage {
                    name: "incoming beta payment",
                    axis: AXIS,
                    ready: Vec::new(),
                    pending: BetaPaymentPending,
                    confirmed: BetaPaymentConfirmed,
                    error: None,
                    retry: None,
                },
            },
            reclaim: GasReclaimStage {
                context,
                stage: payment_stage("gas reclaim", BetaPaymentConfirmed, GasReclaimPending, GasReclaimConfirmed),
            },
        }
    }

    pub fn with_beta_timeout_multiplier(mut self, multiplier: i32) -> Self {
        self.beta_timeout_multiplier = multiplier.max(1);
        self
    }

    fn engine_stages(&self) -> [&dyn StageDriver<BrokerPayment>; 3] {
        [&self.gas, &self.beta, &self.reclaim]
    }

    /// Confirms client payments that have landed at the alpha address
    pub async fn check_payment_to_alpha(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = self.controller.check_pending(&self.alpha_check, now).await?;
        report += self
            .controller
            .check_pending(&self.beta_side_alpha_check, now)
            .await?;
        Ok(report)
    }

    pub async fn check_pending_transactions(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.engine_stages() {
            report += self.controller.check_pending(driver, now).await?;
        }
        report += self.controller.check_pending(&self.incoming_beta, now).await?;
        Ok(report)
    }

    /// Alpha-side stages stale since `threshold` move to their error twin.
    ///
    /// Beta-side records get `beta_timeout_multiplier` times the window; when
    /// that runs out alpha is reported and the record dropped.
    pub async fn set_timed_out_transactions_to_error(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.engine_stages() {
            report += self.controller.expire_stale(driver, threshold, now).await?;
        }

        let window = now - threshold;
        let beta_threshold = now - window * self.beta_timeout_multiplier;
        report += self.drop_unpaid_beta_sessions(beta_threshold).await?;

        Ok(report)
    }

    async fn drop_unpaid_beta_sessions(&self, threshold: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        let store = self.controller.store();

        let unpaid = store
            .find_by_status_and_staleness(AXIS, &[BetaPaymentPending], threshold)
            .await?;

        for record in unpaid.into_iter().filter(|record| !record.is_alpha()) {
            warn!(
                "⏱️ Alpha {} never paid beta for session {}",
                record.eth_addr_alpha, record.genesis_hash
            );

            if let Err(e) = self.reporter.report_bad_alpha(&record).await {
                error!("❌ Failed to report alpha for {}: {}", record.id, e);
                report.failed += 1;
                continue;
            }

            match store.delete(&record).await {
                Ok(()) => report.expired += 1,
                Err(e) => {
                    error!("❌ Failed to drop unpaid session {}: {}", record.id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn stage_transactions_with_errors_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.engine_stages() {
            report += self.controller.stage_for_retry(driver, now).await?;
        }
        Ok(report)
    }

    pub async fn advance(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = JobReport::default();
        for driver in self.engine_stages() {
            report += self.controller.advance(driver, now).await?;
        }
        Ok(report)
    }

    pub async fn purge_completed(&self) -> AppResult<JobReport> {
        let mut report = self
            .controller
            .purge(AXIS, GasReclaimConfirmed, &NoopHook)
            .await?;

        let good_alpha = ReportGoodAlpha {
            reporter: self.reporter.clone(),
        };
        report += self
            .controller
            .purge(AXIS, BetaPaymentConfirmed, &good_alpha)
            .await?;

        Ok(report)
    }
}

#[async_trait]
impl SettlementJob for PaymentSettlement {
    fn name(&self) -> &'static str {
        "broker_payments"
    }

    #[instrument(skip(self), name = "broker_payments")]
    async fn run_once(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let mut report = self.check_payment_to_alpha(now).await?;
        report += self.check_pending_transactions(now).await?;
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
    use crate::ledger::memory::MemoryStore;
    use crate::reputation::recording::RecordingReporter;
    use crate::settlement::testing::{funded_context, seal, MAIN};
    use rust_decimal_macros::dec;

    const ALPHA: &str = "0xalpha";
    const BETA: &str = "0xbeta";

    struct Harness {
        gateway: Arc<MockLedgerGateway>,
        context: Arc<SettlementContext>,
        store: Arc<MemoryStore<BrokerPayment>>,
        reporter: Arc<RecordingReporter>,
        settlement: PaymentSettlement,
    }

    fn harness() -> Harness {
        let (gateway, context) = funded_context();
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let settlement = PaymentSettlement::new(
            store.clone(),
            context.clone(),
            reporter.clone(),
            Duration::hours(1),
            4,
        );
        Harness {
            gateway,
            context,
            store,
            reporter,
            settlement,
        }
    }

    impl Harness {
        async fn alpha_record(&self, status: PaymentStatus, updated_at: DateTime<Utc>) -> BrokerPayment {
            let key = seal(&self.context, "alpha-key");
            let mut record = BrokerPayment::new_alpha("gh-a", ALPHA, BETA, key, dec!(1000), updated_at);
            record.set_status(AXIS, status, updated_at);
            self.store.save(&record).await.unwrap();
            record
        }

        async fn beta_record(&self, status: PaymentStatus, updated_at: DateTime<Utc>) -> BrokerPayment {
            let mut record = BrokerPayment::new_beta("gh-b", ALPHA, BETA, dec!(1000), updated_at);
            record.set_status(AXIS, status, updated_at);
            self.store.save(&record).await.unwrap();
            record
        }

        async fn status(&self, record: &BrokerPayment) -> PaymentStatus {
            self.store.get(record.id).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_unpaid_alpha_stays_pending() {
        let h = harness();
        let now = Utc::now();
        let record = h.alpha_record(AlphaPaymentPending, now).await;

        h.settlement.check_payment_to_alpha(now).await.unwrap();

        assert_eq!(h.status(&record).await, AlphaPaymentPending);
    }

    #[tokio::test]
    async fn test_paid_alpha_confirms_per_broker_type() {
        let h = harness();
        let now = Utc::now();
        let alpha = h.alpha_record(AlphaPaymentPending, now).await;
        let beta = h.beta_record(AlphaPaymentPending, now).await;
        h.gateway.set_asset_balance(ALPHA, dec!(1000));

        let report = h.settlement.check_payment_to_alpha(now).await.unwrap();

        assert_eq!(report.confirmed, 2);
        assert_eq!(h.status(&alpha).await, AlphaPaymentConfirmed);
        assert_eq!(h.status(&beta).await, BetaPaymentPending);
    }

    #[tokio::test]
    async fn test_gas_payment_skipped_when_alpha_has_gas() {
        let h = harness();
        let now = Utc::now();
        let record = h.alpha_record(AlphaPaymentConfirmed, now).await;
        h.gateway.set_gas_balance(ALPHA, dec!(60000));

        h.settlement.advance(now).await.unwrap();

        assert_eq!(h.status(&record).await, GasPaymentConfirmed);
        assert!(h.gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_beta_payment_sends_half() {
        let h = harness();
        let now = Utc::now();
        let record = h.alpha_record(GasPaymentConfirmed, now).await;
        h.gateway.set_asset_balance(ALPHA, dec!(1001));
        h.gateway.set_gas_balance(ALPHA, dec!(60000));

        h.settlement.advance(now).await.unwrap();

        assert_eq!(h.status(&record).await, BetaPaymentPending);
        assert_eq!(
            h.gateway.submissions(),
            vec![Submitted::Asset {
                from: ALPHA.to_string(),
                to: BETA.to_string(),
                amount: dec!(500),
            }]
        );
        assert_eq!(h.gateway.keys_used(), vec!["alpha-key".to_string()]);
    }

    #[tokio::test]
    async fn test_beta_payment_skipped_when_beta_already_paid() {
        let h = harness();
        let now = Utc::now();
        let record = h.alpha_record(GasPaymentConfirmed, now).await;
        h.gateway.set_asset_balance(ALPHA, dec!(1000));
        h.gateway.set_asset_balance(BETA, dec!(500));

        let report = h
            .settlement
            .controller
            .advance(&h.settlement.beta, now)
            .await
            .unwrap();

        assert_eq!(report.short_circuited, 1);
        assert_eq!(h.status(&record).await, BetaPaymentConfirmed);
        assert!(h.gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_retry_to_prior_success() {
        let h = harness();
        let now = Utc::now();
        let stale = now - Duration::hours(2);
        let gas = h.alpha_record(GasPaymentPending, stale).await;

        let report = h
            .settlement
            .set_timed_out_transactions_to_error(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.status(&gas).await, GasPaymentError);

        h.settlement
            .stage_transactions_with_errors_for_retry(now)
            .await
            .unwrap();
        assert_eq!(h.status(&gas).await, AlphaPaymentConfirmed);
    }

    #[tokio::test]
    async fn test_beta_side_gets_longer_window_then_reports_bad_alpha() {
        let h = harness();
        let now = Utc::now();
        let waiting = h.beta_record(BetaPaymentPending, now - Duration::hours(2)).await;

        h.settlement
            .set_timed_out_transactions_to_error(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(h.status(&waiting).await, BetaPaymentPending);

        let report = h
            .settlement
            .set_timed_out_transactions_to_error(now - Duration::minutes(30), now)
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert!(h.store.get(waiting.id).await.is_none());
        assert_eq!(*h.reporter.bad.lock(), vec!["gh-b".to_string()]);
    }

    #[tokio::test]
    async fn test_beta_window_follows_configured_multiplier() {
        let h = harness();
        assert_eq!(h.settlement.beta_timeout_multiplier, DEFAULT_BETA_TIMEOUT_MULTIPLIER);

        let settlement = PaymentSettlement::new(
            h.store.clone(),
            h.context.clone(),
            h.reporter.clone(),
            Duration::hours(1),
            4,
        )
        .with_beta_timeout_multiplier(1);
        let now = Utc::now();
        let waiting = h.beta_record(BetaPaymentPending, now - Duration::hours(2)).await;

        let report = settlement
            .set_timed_out_transactions_to_error(now - Duration::hours(1), now)
            .await
            .unwrap();

        assert_eq!(report.expired, 1);
        assert!(h.store.get(waiting.id).await.is_none());
    }

    #[tokio::test]
    async fn test_beta_side_completion_reports_good_alpha() {
        let h = harness();
        let now = Utc::now();
        let waiting = h.beta_record(BetaPaymentPending, now).await;
        h.gateway.set_asset_balance(BETA, dec!(500));

        let report = h.settlement.run_once(now).await.unwrap();

        assert_eq!(report.confirmed, 1);
        assert_eq!(report.purged, 1);
        assert!(h.store.get(waiting.id).await.is_none());
        assert_eq!(*h.reporter.good.lock(), vec!["gh-b".to_string()]);
    }

    #[tokio::test]
    async fn test_alpha_lifecycle_runs_to_purge() {
        let h = harness();
        h.gateway.settle_transfers(true);
        let record = h.alpha_record(AlphaPaymentPending, Utc::now()).await;
        h.gateway.set_asset_balance(ALPHA, dec!(1000));

        for _ in 0..8 {
            h.settlement.run_once(Utc::now()).await.unwrap();
        }

        assert!(h.store.get(record.id).await.is_none());
        assert_eq!(h.gateway.asset_balance(BETA), dec!(500));
        // Reclaim leaves exactly the sweep's own cost behind
        assert_eq!(h.gateway.gas_balance(ALPHA), dec!(21000));
        assert!(h.gateway.gas_balance(MAIN) < dec!(1000000000));
    }

    #[tokio::test]
    async fn test_beta_payment_that_burned_alpha_gas_is_funded_again() {
        let h = harness();
        h.gateway.settle_transfers(true);
        let now = Utc::now();
        let record = h.alpha_record(BetaPaymentPending, now - Duration::hours(3)).await;
        h.gateway.set_asset_balance(ALPHA, dec!(1000));

        h.settlement.run_once(now).await.unwrap();
        assert_eq!(h.status(&record).await, AlphaPaymentConfirmed);
        assert!(h.gateway.submissions().is_empty());

        for _ in 0..6 {
            h.settlement.run_once(now).await.unwrap();
        }

        assert!(h.store.get(record.id).await.is_none());
        assert_eq!(h.gateway.asset_balance(BETA), dec!(500));
        let submissions = h.gateway.submissions();
        assert_eq!(
            submissions[0],
            Submitted::Gas {
                from: MAIN.to_string(),
                to: ALPHA.to_string(),
                amount: dec!(60000),
            }
        );
        assert_eq!(
            submissions
                .iter()
                .filter(|s| matches!(s, Submitted::Asset { .. }))
                .count(),
            1
        );
    }
}
