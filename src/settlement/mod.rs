// Settlement engine: one job per record family, all driven through the stage controller
pub mod burial;
pub mod claim;
pub mod payment;
pub mod scheduler;
pub mod stage;

use crate::config::GasLimits;
use crate::error::{AppResult, CustodyError};
use crate::execution::gateway::LedgerGateway;
use crate::ledger::models::TxMeta;
use crate::wallet::{KeyVault, MainWallet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use stage::Submission;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Counts of what one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub confirmed: usize,
    pub expired: usize,
    pub retried: usize,
    pub submitted: usize,
    pub short_circuited: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub purged: usize,
    pub failed: usize,
}

impl JobReport {
    pub fn is_idle(&self) -> bool {
        *self == JobReport::default()
    }
}

impl AddAssign for JobReport {
    fn add_assign(&mut self, other: Self) {
        self.confirmed += other.confirmed;
        self.expired += other.expired;
        self.retried += other.retried;
        self.submitted += other.submitted;
        self.short_circuited += other.short_circuited;
        self.deferred += other.deferred;
        self.rejected += other.rejected;
        self.purged += other.purged;
        self.failed += other.failed;
    }
}

/// One settlement family's top-level entry point, run once per scheduler tick
#[async_trait]
pub trait SettlementJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self, now: DateTime<Utc>) -> AppResult<JobReport>;
}

/// Ledger access, signing and the shared funding wallet, handed to every family
pub struct SettlementContext {
    pub gateway: Arc<dyn LedgerGateway>,
    pub vault: Arc<KeyVault>,
    pub wallet: Arc<MainWallet>,
    pub gas_limits: GasLimits,
}

impl SettlementContext {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        vault: Arc<KeyVault>,
        wallet: Arc<MainWallet>,
        gas_limits: GasLimits,
    ) -> Self {
        Self {
            gateway,
            vault,
            wallet,
            gas_limits,
        }
    }

    pub fn decrypt(&self, sealed: &str) -> Result<Zeroizing<String>, CustodyError> {
        self.vault.decrypt(sealed)
    }

    /// Tops `to` up to `needed` gas from the main wallet.
    ///
    /// Already-sufficient addresses short-circuit. The main wallet must cover
    /// the shortfall plus the cost of the transfer itself.
    pub async fn fund_gas(
        &self,
        to: &str,
        needed: Decimal,
        now: DateTime<Utc>,
    ) -> AppResult<Submission> {
        let current = self.gateway.check_gas_balance(to).await?;
        if current >= needed {
            return Ok(Submission::AlreadySatisfied(format!(
                "{} already holds {} gas",
                to, current
            )));
        }

        let shortfall = needed - current;
        let transfer_cost = self
            .gateway
            .calculate_gas_to_send(self.gas_limits.eth_transfer)
            .await?;

        let _spend = self.wallet.lock_spend().await;
        let available = self.gateway.check_gas_balance(self.wallet.address()).await?;
        if available < shortfall + transfer_cost {
            return Ok(Submission::Deferred(format!(
                "main wallet gas {} cannot cover {} + {}",
                available, shortfall, transfer_cost
            )));
        }

        let key = self.wallet.signing_key(&self.vault)?;
        let receipt = self
            .gateway
            .send_gas(self.wallet.address(), &key, to, shortfall)
            .await?;

        info!("⛽ Sent {} gas to {}", shortfall, to);
        Ok(Submission::Sent(TxMeta::new(
            receipt.tx_hash,
            receipt.nonce,
            Some(needed),
            now,
        )))
    }

    /// Sends leftover gas at `from` back to the main wallet.
    ///
    /// Only sweeps when the balance exceeds the sweep's own gas cost; the
    /// recorded expectation is the residual ceiling left behind.
    pub async fn sweep_gas(
        &self,
        from: &str,
        sealed_key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Submission> {
        let sweep_cost = self
            .gateway
            .calculate_gas_to_send(self.gas_limits.eth_transfer)
            .await?;
        let balance = self.gateway.check_gas_balance(from).await?;

        if balance <= sweep_cost {
            return Ok(Submission::AlreadySatisfied(format!(
                "{} gas at {} is not worth sweeping",
                balance, from
            )));
        }

        let key = self.decrypt(sealed_key)?;
        let receipt = self
            .gateway
            .send_gas(from, &key, self.wallet.address(), balance - sweep_cost)
            .await?;

        info!("🧹 Swept {} gas from {} to main wallet", balance - sweep_cost, from);
        Ok(Submission::Sent(TxMeta::new(
            receipt.tx_hash,
            receipt.nonce,
            Some(sweep_cost),
            now,
        )))
    }

    /// A gas top-up landed once the address holds at least what was expected
    pub async fn gas_funded(&self, address: &str, meta: Option<&TxMeta>) -> AppResult<bool> {
        let Some(expected) = meta.and_then(|m| m.expected) else {
            return Ok(false);
        };
        Ok(self.gateway.check_gas_balance(address).await? >= expected)
    }

    /// A sweep landed once the address holds no more than the residual ceiling
    pub async fn gas_swept(&self, address: &str, meta: Option<&TxMeta>) -> AppResult<bool> {
        let Some(ceiling) = meta.and_then(|m| m.expected) else {
            return Ok(false);
        };
        Ok(self.gateway.check_gas_balance(address).await? <= ceiling)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::execution::mock::Submitted;
    use rust_decimal_macros::dec;

    #[test]
    fn test_job_report_accumulates() {
        let mut total = JobReport::default();
        assert!(total.is_idle());

        total += JobReport {
            confirmed: 2,
            failed: 1,
            ..Default::default()
        };
        total += JobReport {
            confirmed: 1,
            purged: 3,
            ..Default::default()
        };

        assert_eq!(total.confirmed, 3);
        assert_eq!(total.purged, 3);
        assert_eq!(total.failed, 1);
        assert!(!total.is_idle());
    }

    #[tokio::test]
    async fn test_fund_gas_sends_only_the_shortfall() {
        let (gateway, context) = funded_context();
        gateway.set_gas_balance("0xalpha", dec!(15000));

        let submission = context.fund_gas("0xalpha", dec!(60000), Utc::now()).await.unwrap();

        assert!(matches!(submission, Submission::Sent(ref meta) if meta.expected == Some(dec!(60000))));
        assert_eq!(
            gateway.submissions(),
            vec![Submitted::Gas {
                from: MAIN.to_string(),
                to: "0xalpha".to_string(),
                amount: dec!(45000),
            }]
        );
        assert_eq!(gateway.keys_used(), vec!["main-key".to_string()]);
    }

    #[tokio::test]
    async fn test_fund_gas_defers_when_main_wallet_is_short() {
        let (gateway, context) = funded_context();
        gateway.set_gas_balance(MAIN, dec!(100));

        let submission = context.fund_gas("0xalpha", dec!(60000), Utc::now()).await.unwrap();

        assert!(matches!(submission, Submission::Deferred(_)));
        assert!(gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_dust() {
        let (gateway, context) = funded_context();
        let sealed = seal(&context, "alpha-key");
        gateway.set_gas_balance("0xalpha", dec!(21000));

        let submission = context.sweep_gas("0xalpha", &sealed, Utc::now()).await.unwrap();

        assert!(matches!(submission, Submission::AlreadySatisfied(_)));
        assert!(gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_its_own_cost_behind() {
        let (gateway, context) = funded_context();
        let sealed = seal(&context, "alpha-key");
        gateway.set_gas_balance("0xalpha", dec!(50000));

        let submission = context.sweep_gas("0xalpha", &sealed, Utc::now()).await.unwrap();

        assert!(matches!(submission, Submission::Sent(ref meta) if meta.expected == Some(dec!(21000))));
        assert_eq!(
            gateway.submissions(),
            vec![Submitted::Gas {
                from: "0xalpha".to_string(),
                to: MAIN.to_string(),
                amount: dec!(29000),
            }]
        );
        assert_eq!(gateway.keys_used(), vec!["alpha-key".to_string()]);
    }
}
