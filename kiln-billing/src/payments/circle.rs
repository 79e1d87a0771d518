//! Circle USDC rail over the transfers API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::payments::{PaymentProvider, PaymentRail, PaymentRequest, PaymentResult, PaymentStatus};
use crate::PaymentError;

const PRODUCTION_API_BASE: &str = "https://api.circle.com";
const SANDBOX_API_BASE: &str = "https://api-sandbox.circle.com";

/// Blockchain networks Circle can settle USDC on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockchainNetwork {
    Ethereum,
    Solana,
    Polygon,
}

impl BlockchainNetwork {
    /// The `chain` identifier Circle's API expects.
    pub fn chain(&self) -> &'static str {
        match self {
            BlockchainNetwork::Ethereum => "ETH",
            BlockchainNetwork::Solana => "SOL",
            BlockchainNetwork::Polygon => "MATIC",
        }
    }
}

/// Shallow format validation of a destination address for a network.
pub fn validate_blockchain_address(address: &str, network: BlockchainNetwork) -> bool {
    match network {
        BlockchainNetwork::Ethereum | BlockchainNetwork::Polygon => {
            address.len() == 42
                && address.starts_with("0x")
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        BlockchainNetwork::Solana => {
            (32..=44).contains(&address.len())
                && address.chars().all(|c| {
                    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
                })
        }
    }
}

fn map_transfer_status(status: &str) -> PaymentStatus {
    match status {
        "complete" => PaymentStatus::Completed,
        "pending" | "running" => PaymentStatus::Processing,
        "failed" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// Circle provider: collects fees as USDC transfers from the platform
/// treasury wallet. API key usually arrives via `KILN_CIRCLE_API_KEY`.
pub struct CircleProvider {
    client: Client,
    api_base: String,
    api_key: String,
    wallet_id: String,
    destination_address: String,
    network: BlockchainNetwork,
}

impl CircleProvider {
    pub fn new(
        api_key: &str,
        wallet_id: &str,
        destination_address: &str,
        network: BlockchainNetwork,
        sandbox: bool,
    ) -> Result<Self, PaymentError> {
        if !validate_blockchain_address(destination_address, network) {
            return Err(PaymentError::with_code(
                format!(
                    "destination address {destination_address:?} is not valid for {}",
                    network.chain()
                ),
                "INVALID_ADDRESS",
            ));
        }
        Ok(Self {
            client: Client::new(),
            api_base: if sandbox { SANDBOX_API_BASE } else { PRODUCTION_API_BASE }.to_string(),
            api_key: api_key.to_string(),
            wallet_id: wallet_id.to_string(),
            destination_address: destination_address.to_string(),
            network,
        })
    }

    /// Test hook: point the provider at a mock server.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, PaymentError> {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| PaymentError::with_code(format!("circle request failed: {err}"), "NETWORK"))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| PaymentError::with_code(format!("circle returned invalid JSON: {err}"), "PROTOCOL"))?;
        if !status.is_success() {
            let message = body["message"]
                .as_str()
                .unwrap_or("unknown Circle error")
                .to_string();
            return Err(PaymentError::with_code(message, "CIRCLE_ERROR"));
        }
        Ok(body)
    }

    fn transfer_result(&self, transfer: &Value) -> PaymentResult {
        let status = map_transfer_status(transfer["status"].as_str().unwrap_or(""));
        PaymentResult {
            success: status != PaymentStatus::Failed,
            payment_id: transfer["id"].as_str().unwrap_or_default().to_string(),
            status,
            amount: transfer["amount"]["amount"]
                .as_str()
                .and_then(|a| a.parse().ok())
                .unwrap_or(0.0),
            currency: transfer["amount"]["currency"]
                .as_str()
                .unwrap_or("USD")
                .to_string(),
            rail: "circle".into(),
            tx_hash: transfer["transactionHash"].as_str().map(str::to_string),
        }
    }
}

#[async_trait]
impl PaymentProvider for CircleProvider {
    fn name(&self) -> &str {
        "circle"
    }

    fn rail(&self) -> PaymentRail {
        PaymentRail::Circle
    }

    fn supported_currencies(&self) -> Vec<String> {
        vec!["USD".into(), "USDC".into()]
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError> {
        let body = json!({
            "idempotencyKey": Uuid::new_v4().to_string(),
            "source": {"type": "wallet", "id": self.wallet_id},
            "destination": {
                "type": "blockchain",
                "address": self.destination_address,
                "chain": self.network.chain(),
            },
            "amount": {"amount": format!("{:.2}", request.amount), "currency": "USD"},
            "metadata": {"job_id": request.job_id},
        });
        let response = self.request(reqwest::Method::POST, "/v1/transfers", Some(body)).await?;
        Ok(self.transfer_result(&response["data"]))
    }

    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/transfers/{payment_id}"),
                None,
            )
            .await?;
        Ok(self.transfer_result(&response["data"]))
    }

    async fn refund_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        // USDC transfers are push payments; a refund is a reverse transfer
        // of the original amount back to the source address.
        let original = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/transfers/{payment_id}"),
                None,
            )
            .await?;
        let data = &original["data"];
        let Some(source_address) = data["source"]["address"].as_str() else {
            return Err(PaymentError::with_code(
                format!("transfer {payment_id} has no refundable source address"),
                "NOT_REFUNDABLE",
            ));
        };
        let amount = data["amount"]["amount"].as_str().unwrap_or("0.00");

        let body = json!({
            "idempotencyKey": Uuid::new_v4().to_string(),
            "source": {"type": "wallet", "id": self.wallet_id},
            "destination": {
                "type": "blockchain",
                "address": source_address,
                "chain": self.network.chain(),
            },
            "amount": {"amount": amount, "currency": "USD"},
            "metadata": {"refund_of": payment_id},
        });
        let response = self.request(reqwest::Method::POST, "/v1/transfers", Some(body)).await?;
        let mut result = self.transfer_result(&response["data"]);
        result.status = PaymentStatus::Refunded;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ETH_ADDR: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn provider(server: &MockServer) -> CircleProvider {
        CircleProvider::new("key", "wallet-1", ETH_ADDR, BlockchainNetwork::Ethereum, true)
            .unwrap()
            .with_api_base(&server.uri())
    }

    #[test]
    fn address_validation_per_network() {
        assert!(validate_blockchain_address(ETH_ADDR, BlockchainNetwork::Ethereum));
        assert!(!validate_blockchain_address("0x123", BlockchainNetwork::Ethereum));
        assert!(!validate_blockchain_address(
            "52908400098527886E0F7030069857D2E4169EE7",
            BlockchainNetwork::Ethereum
        ));
        assert!(validate_blockchain_address(
            "4Nd1mYvHjr8yBv8DkSe2kSGyS1YmnH1tdk8mu1xYkL9F",
            BlockchainNetwork::Solana
        ));
        assert!(!validate_blockchain_address("short", BlockchainNetwork::Solana));
    }

    #[test]
    fn invalid_destination_is_rejected_at_construction() {
        let err = CircleProvider::new("key", "w", "bogus", BlockchainNetwork::Ethereum, true)
            .err()
            .map(|e| e.code);
        assert_eq!(err.flatten().as_deref(), Some("INVALID_ADDRESS"));
    }

    #[tokio::test]
    async fn create_payment_posts_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .and(body_string_contains("idempotencyKey"))
            .and(body_string_contains("\"chain\":\"ETH\""))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "data": {
                    "id": "transfer-1",
                    "status": "pending",
                    "amount": {"amount": "5.00", "currency": "USD"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = PaymentRequest {
            job_id: "job-1".into(),
            amount: 5.0,
            currency: "USD".into(),
            description: "fee".into(),
            metadata: serde_json::Map::new(),
        };
        let result = provider(&server).create_payment(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.payment_id, "transfer-1");
        assert_eq!(result.status, PaymentStatus::Processing);
        assert_eq!(result.amount, 5.0);
    }

    #[tokio::test]
    async fn status_maps_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transfers/transfer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "id": "transfer-1",
                    "status": "complete",
                    "amount": {"amount": "5.00", "currency": "USD"},
                    "transactionHash": "0xabc"
                }
            })))
            .mount(&server)
            .await;

        let result = provider(&server).get_payment_status("transfer-1").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Completed);
        assert_eq!(result.tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn refund_reverses_to_source_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transfers/transfer-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "id": "transfer-1",
                    "status": "complete",
                    "source": {"type": "blockchain", "address": ETH_ADDR},
                    "amount": {"amount": "5.00", "currency": "USD"}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .and(body_string_contains("refund_of"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "data": {
                    "id": "transfer-2",
                    "status": "pending",
                    "amount": {"amount": "5.00", "currency": "USD"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server).refund_payment("transfer-1").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Refunded);
        assert_eq!(result.payment_id, "transfer-2");
    }

    #[tokio::test]
    async fn api_error_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": 400, "message": "insufficient funds"
            })))
            .mount(&server)
            .await;

        let request = PaymentRequest {
            job_id: "job-1".into(),
            amount: 5.0,
            currency: "USD".into(),
            description: "fee".into(),
            metadata: serde_json::Map::new(),
        };
        let err = provider(&server).create_payment(&request).await.unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));
    }
}
