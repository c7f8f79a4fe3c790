use crate::error::AppResult;
use crate::ledger::models::BrokerPayment;
use async_trait::async_trait;
use tracing::{info, warn};

/// Broker reputation service, told how each alpha partner behaved
#[async_trait]
pub trait ReputationReporter: Send + Sync {
    /// Alpha paid this broker its half in time
    async fn report_good_alpha(&self, payment: &BrokerPayment) -> AppResult<()>;

    /// Alpha never paid within the beta timeout window
    async fn report_bad_alpha(&self, payment: &BrokerPayment) -> AppResult<()>;
}

/// Reporter used until a reputation service is wired in; only logs
pub struct LogReputationReporter;

#[async_trait]
impl ReputationReporter for LogReputationReporter {
    async fn report_good_alpha(&self, payment: &BrokerPayment) -> AppResult<()> {
        info!(
            "👍 Alpha {} paid for session {}",
            payment.eth_addr_alpha, payment.genesis_hash
        );
        Ok(())
    }

    async fn report_bad_alpha(&self, payment: &BrokerPayment) -> AppResult<()> {
        warn!(
            "👎 Alpha {} never paid for session {}",
            payment.eth_addr_alpha, payment.genesis_hash
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Remembers the genesis hashes reported on each side
    #[derive(Default)]
    pub struct RecordingReporter {
        pub good: Mutex<Vec<String>>,
        pub bad: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReputationReporter for RecordingReporter {
        async fn report_good_alpha(&self, payment: &BrokerPayment) -> AppResult<()> {
            self.good.lock().push(payment.genesis_hash.clone());
            Ok(())
        }

        async fn report_bad_alpha(&self, payment: &BrokerPayment) -> AppResult<()> {
            self.bad.lock().push(payment.genesis_hash.clone());
            Ok(())
        }
    }
}
