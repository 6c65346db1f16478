//! JSON-RPC client and the chain access interface used by the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::EvmError;
use crate::signer::{LegacyTransaction, LocalSigner};
use crate::types::{Address, Block, Log, LogFilter, Quantity, Receipt, H256, U256};

/// Chain access needed to watch one chain and write to another.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `eth_chainId`.
    async fn chain_id(&self) -> Result<u64, EvmError>;

    /// Current head block number.
    async fn block_number(&self) -> Result<u64, EvmError>;

    /// Block `number` with transaction bodies.
    async fn block(&self, number: u64) -> Result<Block, EvmError>;

    /// Logs matching `filter`.
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, EvmError>;

    /// Signs and submits a call to `to`; returns the transaction hash.
    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<H256, EvmError>;

    /// Waits until `hash` is mined.
    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, EvmError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Plain JSON-RPC 2.0 over HTTP.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, EvmError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue `method` with `params` and decode the `result` member.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, EvmError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(url = %self.url, method, id, "JSON-RPC request");

        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(EvmError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| EvmError::Malformed(format!("{method}: {e}")))
    }
}

/// Receipt polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(120),
        }
    }
}

/// [`ChainClient`] over JSON-RPC with an optional local signer.
pub struct RpcChainClient {
    rpc: RpcClient,
    signer: Option<Arc<LocalSigner>>,
    receipts: ReceiptPolicy,
}

impl RpcChainClient {
    /// Read-only client.
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            signer: None,
            receipts: ReceiptPolicy::default(),
        }
    }

    /// Attach the key used by [`ChainClient::send_transaction`].
    pub fn with_signer(mut self, signer: Arc<LocalSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Override receipt polling.
    pub fn with_receipt_policy(mut self, receipts: ReceiptPolicy) -> Self {
        self.receipts = receipts;
        self
    }

    fn signer(&self) -> Result<&LocalSigner, EvmError> {
        self.signer
            .as_deref()
            .ok_or_else(|| EvmError::Signing("no signer configured".to_string()))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, EvmError> {
        let id: Quantity = self.rpc.request("eth_chainId", json!([])).await?;
        Ok(id.0)
    }

    async fn block_number(&self) -> Result<u64, EvmError> {
        let number: Quantity = self.rpc.request("eth_blockNumber", json!([])).await?;
        Ok(number.0)
    }

    async fn block(&self, number: u64) -> Result<Block, EvmError> {
        let block: Option<Block> = self
            .rpc
            .request("eth_getBlockByNumber", json!([Quantity(number), true]))
            .await?;
        block.ok_or_else(|| EvmError::Malformed(format!("block {number} not found")))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, EvmError> {
        self.rpc.request("eth_getLogs", json!([filter])).await
    }

    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<H256, EvmError> {
        let signer = self.signer()?;
        let from = signer.address();

        let nonce: Quantity = self
            .rpc
            .request("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas_price: U256 = self.rpc.request("eth_gasPrice", json!([])).await?;
        let gas: Quantity = self
            .rpc
            .request(
                "eth_estimateGas",
                json!([{
                    "from": from,
                    "to": to,
                    "data": format!("0x{}", hex::encode(&data)),
                }]),
            )
            .await?;
        let chain_id = self.chain_id().await?;

        let tx = LegacyTransaction {
            nonce: nonce.0,
            gas_price,
            gas: gas.0,
            to,
            value: U256::zero(),
            data,
            chain_id,
        };
        let raw = signer.sign_transaction(&tx)?;

        let hash: H256 = self
            .rpc
            .request(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        debug!(%hash, nonce = tx.nonce, chain_id, "Submitted transaction");
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, EvmError> {
        let poll = async {
            loop {
                let receipt: Option<Receipt> = self
                    .rpc
                    .request("eth_getTransactionReceipt", json!([hash]))
                    .await?;
                if let Some(receipt) = receipt {
                    return Ok(receipt);
                }
                tokio::time::sleep(self.receipts.poll_interval).await;
            }
        };

        tokio::time::timeout(self.receipts.timeout, poll)
            .await
            .map_err(|_| EvmError::ReceiptTimeout(format!("{hash:?}")))?
    }
}
