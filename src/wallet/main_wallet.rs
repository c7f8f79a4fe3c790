use crate::error::{AppResult, CustodyError};
use crate::execution::gateway::LedgerGateway;
use crate::wallet::custody::KeyVault;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

/// The broker's shared funding wallet.
///
/// Every family funds gas and seeds treasure from here. Spend decisions
/// (balance guard followed by submission) are made while holding
/// `lock_spend()` so concurrent jobs in this process never spend the same
/// funds twice.
pub struct MainWallet {
    address: String,
    encrypted_key: String,
    spend_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MainWalletBalances {
    pub address: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub prl: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub eth: Decimal,
}

impl MainWallet {
    pub fn new(address: impl Into<String>, encrypted_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            encrypted_key: encrypted_key.into(),
            spend_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn lock_spend(&self) -> MutexGuard<'_, ()> {
        self.spend_lock.lock().await
    }

    pub fn signing_key(&self, vault: &KeyVault) -> Result<Zeroizing<String>, CustodyError> {
        vault.decrypt(&self.encrypted_key)
    }

    pub async fn balances(&self, gateway: &dyn LedgerGateway) -> AppResult<MainWalletBalances> {
        let prl = gateway.check_asset_balance(&self.address).await?;
        let eth = gateway.check_gas_balance(&self.address).await?;

        Ok(MainWalletBalances {
            address: self.address.clone(),
            prl,
            eth,
        })
    }
}
