use super::gateway::{GatewayResult, LedgerGateway, TxReceipt};
use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// A submission the mock ledger accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Gas { from: String, to: String, amount: Decimal },
    Asset { from: String, to: String, amount: Decimal },
    Bury { address: String },
    Claim { receiver: String, treasure_address: String },
}

#[derive(Default)]
struct LedgerState {
    assets: HashMap<String, Decimal>,
    gas: HashMap<String, Decimal>,
    clocks: HashMap<String, i64>,
    buried: HashSet<String>,
    submissions: Vec<Submitted>,
    keys_used: Vec<String>,
    nonce: u64,
    offline: bool,
    reject_submissions: bool,
    settle: bool,
}

/// In-memory ledger for tests.
///
/// Balances, claim clocks and buried flags are set per address. Submissions
/// are recorded; with `settle_transfers(true)` they also move balances the
/// way the chain would once mined.
pub struct MockLedgerGateway {
    state: Mutex<LedgerState>,
    gas_price: Decimal,
}

impl MockLedgerGateway {
    /// Gas priced at 1 wei per unit, so a 21000 limit costs 21000 wei
    pub fn new() -> Self {
        Self::with_gas_price(Decimal::ONE)
    }

    pub fn with_gas_price(gas_price: Decimal) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            gas_price,
        }
    }

    pub fn set_asset_balance(&self, address: &str, amount: Decimal) {
        self.state.lock().assets.insert(address.to_string(), amount);
    }

    pub fn set_gas_balance(&self, address: &str, amount: Decimal) {
        self.state.lock().gas.insert(address.to_string(), amount);
    }

    pub fn set_claim_clock(&self, address: &str, clock: i64) {
        self.state.lock().clocks.insert(address.to_string(), clock);
    }

    pub fn set_buried(&self, address: &str) {
        self.state.lock().buried.insert(address.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    pub fn settle_transfers(&self, settle: bool) {
        self.state.lock().settle = settle;
    }

    pub fn asset_balance(&self, address: &str) -> Decimal {
        self.state.lock().assets.get(address).copied().unwrap_or_default()
    }

    pub fn gas_balance(&self, address: &str) -> Decimal {
        self.state.lock().gas.get(address).copied().unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<Submitted> {
        self.state.lock().submissions.clone()
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.state.lock().keys_used.clone()
    }

    fn online(state: &LedgerState) -> GatewayResult<()> {
        if state.offline {
            return Err(GatewayError::Unavailable("mock ledger offline".to_string()));
        }
        Ok(())
    }

    fn accept(state: &mut LedgerState, key: &str, submitted: Submitted) -> GatewayResult<TxReceipt> {
        Self::online(state)?;
        if state.reject_submissions {
            return Err(GatewayError::Rejected("mock ledger rejected".to_string()));
        }

        state.nonce += 1;
        state.keys_used.push(key.to_string());
        state.submissions.push(submitted);
        Ok(TxReceipt::new(format!("0xtx{}", state.nonce), state.nonce))
    }

    fn transfer(balances: &mut HashMap<String, Decimal>, from: &str, to: &str, amount: Decimal) {
        *balances.entry(from.to_string()).or_default() -= amount;
        *balances.entry(to.to_string()).or_default() += amount;
    }
}

impl Default for MockLedgerGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerGateway for MockLedgerGateway {
    async fn check_asset_balance(&self, address: &str) -> GatewayResult<Decimal> {
        let state = self.state.lock();
        Self::online(&state)?;
        Ok(state.assets.get(address).copied().unwrap_or_default())
    }

    async fn check_gas_balance(&self, address: &str) -> GatewayResult<Decimal> {
        let state = self.state.lock();
        Self::online(&state)?;
        Ok(state.gas.get(address).copied().unwrap_or_default())
    }

    async fn calculate_gas_to_send(&self, limit: u64) -> GatewayResult<Decimal> {
        let state = self.state.lock();
        Self::online(&state)?;
        Ok(self.gas_price * Decimal::from(limit))
    }

    async fn send_gas(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt> {
        let mut state = self.state.lock();
        let receipt = Self::accept(
            &mut state,
            from_key,
            Submitted::Gas {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            },
        )?;
        if state.settle {
            Self::transfer(&mut state.gas, from, to, amount);
        }
        Ok(receipt)
    }

    async fn send_asset(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt> {
        let mut state = self.state.lock();
        let receipt = Self::accept(
            &mut state,
            from_key,
            Submitted::Asset {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            },
        )?;
        if state.settle {
            Self::transfer(&mut state.assets, from, to, amount);
        }
        Ok(receipt)
    }

    async fn invoke_bury(&self, address: &str, key: &str) -> GatewayResult<TxReceipt> {
        let mut state = self.state.lock();
        let receipt = Self::accept(
            &mut state,
            key,
            Submitted::Bury {
                address: address.to_string(),
            },
        )?;
        if state.settle {
            state.buried.insert(address.to_string());
        }
        Ok(receipt)
    }

    async fn invoke_claim(
        &self,
        receiver: &str,
        treasure_address: &str,
        treasure_key: &str,
    ) -> GatewayResult<TxReceipt> {
        let mut state = self.state.lock();
        let receipt = Self::accept(
            &mut state,
            treasure_key,
            Submitted::Claim {
                receiver: receiver.to_string(),
                treasure_address: treasure_address.to_string(),
            },
        )?;
        if state.settle {
            let amount = state.assets.get(treasure_address).copied().unwrap_or_default();
            Self::transfer(&mut state.assets, treasure_address, receiver, amount);
            *state.clocks.entry(treasure_address.to_string()).or_default() += 1;
        }
        Ok(receipt)
    }

    async fn check_claim_clock(&self, address: &str) -> GatewayResult<i64> {
        let state = self.state.lock();
        Self::online(&state)?;
        Ok(state.clocks.get(address).copied().unwrap_or_default())
    }

    async fn check_buried_state(&self, address: &str) -> GatewayResult<bool> {
        let state = self.state.lock();
        Self::online(&state)?;
        Ok(state.buried.contains(address))
    }
}
