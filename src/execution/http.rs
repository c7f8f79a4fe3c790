use super::gateway::{GatewayResult, LedgerGateway, TxReceipt};
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// JSON client for the ledger/signing sidecar
pub struct HttpLedgerGateway {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct GasResponse {
    #[serde(with = "rust_decimal::serde::str")]
    cost: Decimal,
}

#[derive(Debug, Deserialize)]
struct ClaimClockResponse {
    claim_clock: i64,
}

#[derive(Debug, Deserialize)]
struct BuriedResponse {
    buried: bool,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    from: &'a str,
    from_key: &'a str,
    to: &'a str,
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
}

#[derive(Debug, Serialize)]
struct BuryRequest<'a> {
    address: &'a str,
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    receiver: &'a str,
    treasure_address: &'a str,
    treasure_key: &'a str,
}

impl HttpLedgerGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        let response = self.client.get(self.url(path)).send().await?;

        if !response.status().is_success() {
            return Err(GatewayError::Unavailable(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }

        Ok(response.json::<T>().await?)
    }

    async fn submit<B: Serialize + Sync>(&self, path: &str, body: &B) -> GatewayResult<TxReceipt> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let receipt: TxReceipt = Self::submission_result(path, response).await?;

        info!(
            "📤 Ledger accepted {} (tx: {:?}, nonce: {:?})",
            path, receipt.tx_hash, receipt.nonce
        );
        Ok(receipt)
    }

    /// 4xx is the ledger refusing the transaction; anything else unsuccessful is transient
    async fn submission_result(path: &str, response: Response) -> GatewayResult<TxReceipt> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TxReceipt>().await?);
        }

        let error_text = response.text().await.unwrap_or_default();
        debug!("Submission to {} failed with {}: {}", path, status, error_text);

        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(GatewayError::Rejected(format!("{}: {}", status, error_text)))
        } else {
            Err(GatewayError::Unavailable(format!("{}: {}", status, error_text)))
        }
    }
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn check_asset_balance(&self, address: &str) -> GatewayResult<Decimal> {
        let body: BalanceResponse = self.get(&format!("/v1/accounts/{}/prl", address)).await?;
        Ok(body.balance)
    }

    async fn check_gas_balance(&self, address: &str) -> GatewayResult<Decimal> {
        let body: BalanceResponse = self.get(&format!("/v1/accounts/{}/eth", address)).await?;
        Ok(body.balance)
    }

    async fn calculate_gas_to_send(&self, limit: u64) -> GatewayResult<Decimal> {
        let body: GasResponse = self.get(&format!("/v1/gas?limit={}", limit)).await?;
        Ok(body.cost)
    }

    async fn send_gas(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt> {
        let request = TransferRequest {
            from,
            from_key,
            to,
            amount,
        };
        self.submit("/v1/transfers/eth", &request).await
    }

    async fn send_asset(
        &self,
        from: &str,
        from_key: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<TxReceipt> {
        let request = TransferRequest {
            from,
            from_key,
            to,
            amount,
        };
        self.submit("/v1/transfers/prl", &request).await
    }

    async fn invoke_bury(&self, address: &str, key: &str) -> GatewayResult<TxReceipt> {
        self.submit("/v1/treasures/bury", &BuryRequest { address, key })
            .await
    }

    async fn invoke_claim(
        &self,
        receiver: &str,
        treasure_address: &str,
        treasure_key: &str,
    ) -> GatewayResult<TxReceipt> {
        let request = ClaimRequest {
            receiver,
            treasure_address,
            treasure_key,
        };
        self.submit("/v1/treasures/claim", &request).await
    }

    async fn check_claim_clock(&self, address: &str) -> GatewayResult<i64> {
        let body: ClaimClockResponse = self
            .get(&format!("/v1/treasures/{}/claim-clock", address))
            .await?;
        Ok(body.claim_clock)
    }

    async fn check_buried_state(&self, address: &str) -> GatewayResult<bool> {
        let body: BuriedResponse = self.get(&format!("/v1/treasures/{}/buried", address)).await?;
        Ok(body.buried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_base_url_is_normalized() {
        let gateway = HttpLedgerGateway::new("http://ledger:8545/", Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.url("/v1/gas?limit=21000"), "http://ledger:8545/v1/gas?limit=21000");
    }

    #[test]
    fn test_transfer_request_sends_amount_as_string() {
        let request = TransferRequest {
            from: "0xa",
            from_key: "k",
            to: "0xb",
            amount: dec!(1000000000000000000),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["amount"], "1000000000000000000");
    }

    #[test]
    fn test_balance_response_parses_wei_string() {
        let body: BalanceResponse =
            serde_json::from_str(r#"{"balance":"250000000000000000000"}"#).unwrap();
        assert_eq!(body.balance, dec!(250000000000000000000));
    }

    fn ledger_response(status: u16, body: &'static str) -> Response {
        Response::from(::http::Response::builder().status(status).body(body).unwrap())
    }

    #[tokio::test]
    async fn test_client_error_is_a_rejection() {
        let result = HttpLedgerGateway::submission_result(
            "/v1/transfers/eth",
            ledger_response(400, "nonce too low"),
        )
        .await;

        assert!(matches!(result, Err(GatewayError::Rejected(ref msg)) if msg.contains("nonce too low")));
    }

    #[tokio::test]
    async fn test_throttling_and_server_errors_are_transient() {
        for status in [429, 503] {
            let result = HttpLedgerGateway::submission_result(
                "/v1/treasures/bury",
                ledger_response(status, "try later"),
            )
            .await;

            assert!(
                matches!(result, Err(GatewayError::Unavailable(_))),
                "status {} should be transient",
                status
            );
        }
    }

    #[tokio::test]
    async fn test_accepted_submission_parses_receipt() {
        let receipt = HttpLedgerGateway::submission_result(
            "/v1/transfers/prl",
            ledger_response(200, r#"{"tx_hash":"0xabc","nonce":7}"#),
        )
        .await
        .unwrap();

        assert_eq!(receipt, TxReceipt::new("0xabc", 7));
    }
}
