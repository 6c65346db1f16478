//! Tenant-facing operations.
//!
//! Each operation takes the tenant's opaque token, resolves the instances it
//! touches and never fails: every error becomes an `{"error": ...}` envelope
//! so one tenant's failure cannot take the service down.

use std::sync::Arc;

use async_trait::async_trait;
use chainbox_evm::{Address, U256};
use chainbox_id::{ChainTag, InstanceKey, Kind};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::SolveSettings;
use crate::error::{Error, Result};
use crate::lockfile::try_lock_file;
use crate::proxy::{check_request, parse_uint, NodeProxy};
use crate::supervisor::{Instance, ProcessSupervisor, RelayPeers};

/// Lock file serializing completion checks of one tenant.
const SOLVE_LOCK: &str = "lock";

/// `{"message": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Message(String),
    Error(String),
}

impl Envelope {
    pub fn message(text: impl Into<String>) -> Self {
        Envelope::Message(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Envelope::Error(text.into())
    }

    pub fn not_ready() -> Self {
        Envelope::error("node not ready")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<&Error> for Envelope {
    fn from(err: &Error) -> Self {
        Envelope::Error(err.to_string())
    }
}

/// Completion check run against a ready L1 at a fixed block.
#[async_trait]
pub trait SolveCheck: Send + Sync {
    async fn check(&self, proxy: &NodeProxy, instance: &InstanceKey, block: u64) -> Result<Envelope>;
}

/// Solved once `holder`'s balance of `token` drops below `threshold`.
#[derive(Debug, Clone)]
pub struct BalanceBelowCheck {
    pub token: Option<Address>,
    pub holder: Address,
    pub threshold: U256,
    pub flag: String,
}

impl From<SolveSettings> for BalanceBelowCheck {
    fn from(settings: SolveSettings) -> Self {
        Self {
            token: settings.token,
            holder: settings.holder,
            threshold: settings.threshold,
            flag: settings.flag,
        }
    }
}

#[async_trait]
impl SolveCheck for BalanceBelowCheck {
    async fn check(&self, proxy: &NodeProxy, instance: &InstanceKey, block: u64) -> Result<Envelope> {
        let Some(token) = self.token else {
            return Err(Error::Query("no token contract configured".to_string()));
        };
        let output = proxy
            .query(
                instance,
                &format!("{token:?}"),
                "balanceOf(address)",
                &[format!("{:?}", self.holder)],
                Some(block),
            )
            .await?;
        let balance = parse_uint(&output)?;

        if balance < self.threshold {
            Ok(Envelope::message(format!("flag: {}", self.flag)))
        } else {
            Ok(Envelope::message(format!(
                "balance {balance} is not below {}",
                self.threshold
            )))
        }
    }
}

/// Entry point for the HTTP front.
pub struct Gateway {
    supervisor: Arc<ProcessSupervisor>,
    proxy: Arc<NodeProxy>,
    solve: Arc<dyn SolveCheck>,
}

impl Gateway {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        proxy: Arc<NodeProxy>,
        solve: Arc<dyn SolveCheck>,
    ) -> Self {
        Self {
            supervisor,
            proxy,
            solve,
        }
    }

    fn instance(&self, token: &str, kind: Kind) -> Instance {
        Instance::new(self.supervisor.registry().identity(token, kind), kind)
    }

    /// Kill every instance of the tenant.
    ///
    /// One envelope per kind in `L1, L2, RELAYER` order: `OK1` if the
    /// instance was ready, `OK2` otherwise.
    pub async fn reset(&self, token: &str) -> Vec<Envelope> {
        let mut statuses = Vec::with_capacity(Kind::ALL.len());
        for kind in Kind::ALL {
            let instance = self.instance(token, kind);
            let was_ready = match self.supervisor.ready(&instance, false).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(instance = %instance.key, reason = e.reason_code(), error = %e, "Readiness check failed during reset");
                    false
                }
            };

            match self.supervisor.kill(&instance).await {
                Ok(()) => statuses.push(Envelope::message(if was_ready { "OK1" } else { "OK2" })),
                Err(e) => {
                    warn!(instance = %instance.key, reason = e.reason_code(), error = %e, "Kill failed during reset");
                    statuses.push(Envelope::from(&e));
                }
            }
        }
        info!(instances = statuses.len(), "Reset tenant");
        statuses
    }

    /// Start the tenant's chains and relayer if needed and forward `body`
    /// to the chain named by `chain`.
    pub async fn rpc(&self, token: &str, chain: &str, body: &Value) -> Value {
        match self.try_rpc(token, chain, body).await {
            Ok(response) => response,
            Err(e) => {
                warn!(chain, reason = e.reason_code(), error = %e, "RPC request failed");
                Envelope::from(&e).to_value()
            }
        }
    }

    async fn try_rpc(&self, token: &str, chain: &str, body: &Value) -> Result<Value> {
        let chain: ChainTag = chain.parse()?;
        check_request(body)?;

        let l1 = self.instance(token, Kind::L1);
        let l2 = self.instance(token, Kind::L2);
        self.supervisor.ready(&l1, true).await?;
        self.supervisor.ready(&l2, true).await?;

        let registry = self.supervisor.registry();
        let (Some(l1_port), Some(l2_port)) = (registry.port(&l1.key)?, registry.port(&l2.key)?)
        else {
            return Ok(Envelope::not_ready().to_value());
        };
        let relayer = self
            .instance(token, Kind::Relayer)
            .with_peers(RelayPeers { l1_port, l2_port });
        self.supervisor.ready(&relayer, true).await?;

        let target = match chain {
            ChainTag::L1 => &l1,
            ChainTag::L2 => &l2,
        };
        if !self.supervisor.ready(target, true).await? {
            return Ok(Envelope::not_ready().to_value());
        }
        self.proxy.rpc(&target.key, body).await
    }

    /// Run the completion check if the tenant's L1 is ready.
    pub async fn check_solved(&self, token: &str) -> Envelope {
        match self.try_check_solved(token).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(reason = e.reason_code(), error = %e, "Completion check failed");
                Envelope::from(&e)
            }
        }
    }

    async fn try_check_solved(&self, token: &str) -> Result<Envelope> {
        let l1 = self.instance(token, Kind::L1);
        if !self.supervisor.ready(&l1, false).await? {
            return Ok(Envelope::not_ready());
        }

        let workspace = self.supervisor.registry().workspace(&l1.key);
        let Some(_check_lock) = try_lock_file(&workspace.lock_path(SOLVE_LOCK))? else {
            return Ok(Envelope::error("no race condition"));
        };

        let block = self.proxy.block_number(&l1.key).await?;
        self.solve.check(&self.proxy, &l1.key, block).await
    }
}
