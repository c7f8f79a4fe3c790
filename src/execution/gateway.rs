use crate::error::GatewayError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type GatewayResult<T> = Result<T, GatewayError>;

/// What the ledger hands back for an accepted submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: Option<String>,
    pub nonce: Option<u64>,
}

impl TxReceipt {
    pub fn new(tx_hash: impl Into<String>, nonce: u64) -> Self {
        Self {
            tx_hash: Some(tx_hash.into()),
            nonce: Some(nonce),
        }
    }
}

/// Ledger gateway - every on-chain read and write the settlement engine makes
///
/// Amounts are integer base units (wei). Signing keys are plaintext and only
/// live for the duration of the call.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// PRL balance held by an address
    async fn check_asset_balance(&self, address: &str) -> GatewayResult<Decimal>;

    /// ETH (gas) balance held by an address
    async fn check_gas_balance(&self, address: &str) -> GatewayResult<Decimal>;

    /// Gas cost of a transaction with the given gas limit at current prices
    async fn calculate_gas_to_send(&self, limit: u64) -> GatewayResult<Decimal>;

    async fn send_gas(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt>;

    async fn send_asset(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt>;

    /// Locks the address's PRL balance into a claimable treasure
    async fn invoke_bury(&self, address: &str, key: &str) -> GatewayResult<TxReceipt>;

    /// Redeems a buried treasure to `receiver`
    async fn invoke_claim(
        &self,
        receiver: &str,
        treasure_address: &str,
        treasure_key: &str,
    ) -> GatewayResult<TxReceipt>;

    async fn check_claim_clock(&self, address: &str) -> GatewayResult<i64>;

    async fn check_buried_state(&self, address: &str) -> GatewayResult<bool>;
}
