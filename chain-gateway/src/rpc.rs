//! Minimal JSON-RPC client over HTTP.

use crate::error::{GatewayError, Result};
use attestation_core::Address;
use primitive_types::U256;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_POLL_ATTEMPTS: u32 = 60;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// One emitted contract log.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// A mined transaction receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some("0x1") | Some("0x01"))
    }
}

/// JSON-RPC client bound to one node URL.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(GatewayError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        // A missing result (eth_getTransactionReceipt for a pending tx)
        // deserialises as null so Option targets map it to None.
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| GatewayError::Response(format!("{method}: {e}")))
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&raw).map(|v| v.as_u64())
    }

    /// `eth_call` against `to` at the latest block.
    pub async fn call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>> {
        let raw: String = self
            .request(
                "eth_call",
                json!([{ "to": to.to_lower_hex(), "data": hex_data(data) }, "latest"]),
            )
            .await?;
        parse_hex_bytes(&raw)
    }

    pub async fn get_code(&self, address: &Address) -> Result<Vec<u8>> {
        let raw: String = self
            .request("eth_getCode", json!([address.to_lower_hex(), "latest"]))
            .await?;
        parse_hex_bytes(&raw)
    }

    pub async fn transaction_count(&self, address: &Address) -> Result<U256> {
        let raw: String = self
            .request(
                "eth_getTransactionCount",
                json!([address.to_lower_hex(), "pending"]),
            )
            .await?;
        parse_quantity(&raw)
    }

    pub async fn gas_price(&self) -> Result<U256> {
        let raw: String = self.request("eth_gasPrice", json!([])).await?;
        parse_quantity(&raw)
    }

    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<String> {
        self.request("eth_sendRawTransaction", json!([hex_data(raw_tx)]))
            .await
    }

    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    /// Poll until the transaction is mined. A receipt with a failed status
    /// is a revert; exhausting the poll attempts leaves the outcome unknown
    /// to the caller (recovery pass territory).
    pub async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt> {
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            match self.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.succeeded() {
                        return Ok(receipt);
                    }
                    return Err(GatewayError::Reverted(tx_hash.to_string()));
                }
                Ok(None) => {}
                Err(e) => warn!("receipt poll for {} failed: {}", tx_hash, e),
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(GatewayError::ReceiptTimeout(tx_hash.to_string()))
    }

    /// All logs emitted by `address` with the given `topic0`, from genesis.
    pub async fn logs_by_topic(&self, address: &Address, topic0: &[u8; 32]) -> Result<Vec<LogEntry>> {
        self.request(
            "eth_getLogs",
            json!([{
                "address": address.to_lower_hex(),
                "topics": [format!("0x{}", hex::encode(topic0))],
                "fromBlock": "0x0",
                "toBlock": "latest",
            }]),
        )
        .await
    }
}

fn hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

pub(crate) fn parse_quantity(raw: &str) -> Result<U256> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(stripped, 16)
        .map_err(|_| GatewayError::Response(format!("bad quantity {raw}")))
}

pub(crate) fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| GatewayError::Response(format!("bad hex data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), U256::zero());
        assert_eq!(parse_quantity("0x10").unwrap(), U256::from(16));
        assert_eq!(parse_quantity("0x").unwrap(), U256::zero());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_receipt_status() {
        let mined = TxReceipt {
            transaction_hash: "0xabc".into(),
            status: Some("0x1".into()),
            logs: vec![],
        };
        assert!(mined.succeeded());
        let reverted = TxReceipt {
            transaction_hash: "0xabc".into(),
            status: Some("0x0".into()),
            logs: vec![],
        };
        assert!(!reverted.succeeded());
    }
}
