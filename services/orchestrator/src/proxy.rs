//! JSON-RPC filtering and forwarding to sandboxed nodes.
//!
//! Only methods in the `eth_`, `web3_` and `net_` namespaces reach a node,
//! minus an explicit deny-list. Everything else is rejected before the
//! instance state is even looked at. Allowed requests are forwarded verbatim
//! and the node's response body is returned unmodified.
//!
//! Historical reads go through `cast` pinned to an explicit block so the
//! result does not depend on when the call happens.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chainbox_evm::U256;
use chainbox_id::InstanceKey;
use futures_util::future::try_join_all;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::InstanceRegistry;

const ALLOWED_NAMESPACES: &[&str] = &["eth_", "web3_", "net_"];
const DENIED_METHODS: &[&str] = &["eth_sendUnsignedTransaction"];

/// Reject methods outside the allow-list.
pub fn check_method(method: &str) -> Result<()> {
    let allowed = ALLOWED_NAMESPACES.iter().any(|ns| method.starts_with(ns))
        && !DENIED_METHODS.contains(&method);
    if allowed {
        Ok(())
    } else {
        Err(Error::Forbidden {
            method: method.to_string(),
        })
    }
}

/// Check every call in a single or batched JSON-RPC request.
pub fn check_request(request: &Value) -> Result<()> {
    let calls: Vec<&Value> = match request {
        Value::Array(batch) => batch.iter().collect(),
        single => vec![single],
    };
    if calls.is_empty() {
        return Err(Error::InvalidArgument("empty batch".to_string()));
    }
    for call in calls {
        let method = call
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidArgument("request has no method".to_string()))?;
        check_method(method)?;
    }
    Ok(())
}

/// HTTP transport to nodes on the local host.
#[derive(Clone)]
pub struct NodeTransport {
    http: reqwest::Client,
    host: String,
}

impl NodeTransport {
    pub fn new(host: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            host: host.into(),
        })
    }

    /// RPC endpoint of the node on `port`.
    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}/", self.host, port)
    }

    /// POST `body` to the node and return its JSON response as is.
    pub async fn forward(&self, port: u16, body: &Value) -> Result<Value> {
        let response: Value = self
            .http
            .post(self.url(port))
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        Ok(response)
    }

    /// `web3_clientVersion` of the node on `port`.
    pub async fn client_version(&self, port: u16) -> Result<String> {
        let response = self
            .forward(
                port,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "web3_clientVersion",
                    "params": [],
                }),
            )
            .await?;
        response
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Query(format!("unexpected web3_clientVersion reply: {response}")))
    }
}

/// Filtered access to instance nodes.
pub struct NodeProxy {
    registry: Arc<InstanceRegistry>,
    transport: NodeTransport,
    cast: PathBuf,
}

impl NodeProxy {
    pub fn new(registry: Arc<InstanceRegistry>, transport: NodeTransport, cast: PathBuf) -> Self {
        Self {
            registry,
            transport,
            cast,
        }
    }

    /// Forward a JSON-RPC request to the instance's node.
    pub async fn rpc(&self, instance: &InstanceKey, request: &Value) -> Result<Value> {
        check_request(request)?;

        if self.registry.pid(instance)? == 0 {
            return Err(Error::NotRunning {
                instance: instance.clone(),
            });
        }
        let port = self.running_port(instance)?;

        debug!(%instance, port, "Forwarding RPC");
        self.transport.forward(port, request).await
    }

    /// Read-only `cast call` pinned to `block_number`.
    ///
    /// The block is mandatory; `None` is rejected.
    pub async fn query(
        &self,
        instance: &InstanceKey,
        address: &str,
        signature: &str,
        args: &[String],
        block_number: Option<u64>,
    ) -> Result<String> {
        let block = block_number.ok_or_else(|| {
            Error::InvalidArgument("block number is required for historical queries".to_string())
        })?;
        let url = self.transport.url(self.running_port(instance)?);

        let mut argv = vec![
            "call".to_string(),
            "-b".to_string(),
            block.to_string(),
            "--legacy".to_string(),
            "--rpc-url".to_string(),
            url,
            address.to_string(),
            signature.to_string(),
        ];
        argv.extend(args.iter().cloned());
        self.run_cast(&argv).await
    }

    /// Current block number of the instance's node.
    pub async fn block_number(&self, instance: &InstanceKey) -> Result<u64> {
        let url = self.transport.url(self.running_port(instance)?);
        let out = self
            .run_cast(&["block-number".to_string(), "--rpc-url".to_string(), url])
            .await?;
        out.parse()
            .map_err(|_| Error::Query(format!("cast block-number printed {out:?}")))
    }

    /// Reads `count_sig` then every element `element_sig(i)` at `block`.
    pub async fn query_array(
        &self,
        instance: &InstanceKey,
        block: u64,
        address: &str,
        count_sig: &str,
        element_sig: &str,
    ) -> Result<Vec<String>> {
        let count = parse_uint(
            &self
                .query(instance, address, count_sig, &[], Some(block))
                .await?,
        )?;
        if count > U256::from(u32::MAX) {
            return Err(Error::Query(format!("{count_sig} returned {count}")));
        }

        try_join_all((0..count.low_u64()).map(|i| {
            let index = [i.to_string()];
            async move {
                self.query(instance, address, element_sig, &index, Some(block))
                    .await
            }
        }))
        .await
    }

    /// Address controlled by a hex private key.
    pub async fn address_from_private_key(&self, private_key: &str) -> Result<String> {
        self.run_cast(&[
            "wallet".to_string(),
            "address".to_string(),
            "--private-key".to_string(),
            private_key.to_string(),
        ])
        .await
    }

    fn running_port(&self, instance: &InstanceKey) -> Result<u16> {
        self.registry
            .port(instance)?
            .ok_or_else(|| Error::NotRunning {
                instance: instance.clone(),
            })
    }

    async fn run_cast(&self, args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new(&self.cast)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Query(format!("{}: {e}", self.cast.display())))?;

        if !output.status.success() {
            return Err(Error::Query(format!(
                "cast {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parses the leading integer of `cast` output (`0x..` hex or decimal).
pub fn parse_uint(text: &str) -> Result<U256> {
    let token = text.split_whitespace().next().unwrap_or_default();
    // U256 parses empty digit strings as zero
    let parsed = match token.strip_prefix("0x") {
        Some(digits) if !digits.is_empty() => U256::from_str_radix(digits, 16).ok(),
        None if !token.is_empty() => U256::from_dec_str(token).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::Query(format!("not an integer: {text:?}")))
}
