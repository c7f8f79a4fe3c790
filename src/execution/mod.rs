pub mod gateway;
pub mod http;
#[cfg(test)]
pub mod mock;

pub use gateway::{GatewayResult, LedgerGateway, TxReceipt};
pub use http::HttpLedgerGateway;
