//! Configuration for chainboxd.
//!
//! Everything is read from `CHAINBOX_*` environment variables. The relay
//! worker re-reads the relay section from its own environment, which the
//! supervisor populates from [`RelaySettings::worker_env`].

use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use chainbox_evm::{Address, LocalSigner, U256};
use chainbox_id::IdentitySecret;

/// Bridge contract address used by both chains unless overridden.
pub const DEFAULT_BRIDGE: &str = "0x15c4cA379fce93A279ac49222116A443B972C777";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: String,

    /// Root of all instance workspaces and the port lease directory.
    pub workdir: PathBuf,

    /// Key for instance identity derivation.
    pub secret: IdentitySecret,

    /// Whether the secret came from the environment.
    pub secret_pinned: bool,

    /// Remove every workspace and lease at startup.
    pub wipe_on_start: bool,

    /// Ports handed out to workers.
    pub port_range: Range<u16>,

    /// First sandbox uid/gid; the worker on `port_range.start` gets this one.
    pub uid_base: u32,

    /// Node binary for L1.
    pub l1_node_binary: PathBuf,

    /// Node binary for L2.
    pub l2_node_binary: PathBuf,

    /// Read-only chain state seed for L1.
    pub l1_state_template: PathBuf,

    /// Read-only chain state seed for L2.
    pub l2_state_template: PathBuf,

    /// `cast` binary for historical queries.
    pub cast_binary: PathBuf,

    /// Readiness handshake attempts.
    pub ready_retries: u32,

    /// Spacing between readiness attempts.
    pub ready_interval: Duration,

    /// Relay worker settings.
    pub relay: RelaySettings,

    /// Completion check settings.
    pub solve: SolveSettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("CHAINBOX_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let workdir = env_path("CHAINBOX_WORKDIR", "/tmp/workdir");

        let (secret_text, secret_pinned) = match std::env::var("CHAINBOX_SECRET_KEY") {
            Ok(value) if !value.is_empty() => (value, true),
            _ => (generate_secret(), false),
        };
        let secret = IdentitySecret::new(secret_text.into_bytes())
            .context("CHAINBOX_SECRET_KEY must not be empty")?;

        let wipe_on_start = env_parse("CHAINBOX_WIPE_ON_START", true)?;

        let port_start: u16 = env_parse("CHAINBOX_PORT_START", 1024)?;
        let port_end: u16 = env_parse("CHAINBOX_PORT_END", 31024)?;
        if port_start >= port_end {
            bail!("CHAINBOX_PORT_START ({port_start}) must be below CHAINBOX_PORT_END ({port_end})");
        }

        let l1_node_binary = env_path("CHAINBOX_L1_NODE_BINARY", "/opt/foundry/bin/anvil");
        let l2_node_binary = env_path("CHAINBOX_L2_NODE_BINARY", "/app/anvil");

        let ready_interval_ms: u64 = env_parse("CHAINBOX_READY_INTERVAL_MS", 500)?;

        Ok(Self {
            listen_addr,
            workdir,
            secret,
            secret_pinned,
            wipe_on_start,
            port_range: port_start..port_end,
            uid_base: env_parse("CHAINBOX_UID_BASE", 30000)?,
            l1_node_binary,
            l2_node_binary,
            l1_state_template: env_path("CHAINBOX_L1_STATE_TEMPLATE", "/app/l1-state.json"),
            l2_state_template: env_path("CHAINBOX_L2_STATE_TEMPLATE", "/app/l2-state.json"),
            cast_binary: env_path("CHAINBOX_CAST_BINARY", "/opt/foundry/bin/cast"),
            ready_retries: env_parse("CHAINBOX_READY_RETRIES", 20)?,
            ready_interval: Duration::from_millis(ready_interval_ms),
            relay: RelaySettings::from_env()?,
            solve: SolveSettings::from_env()?,
            log_level: std::env::var("CHAINBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Settings shared by the orchestrator and the relay worker it spawns.
#[derive(Clone)]
pub struct RelaySettings {
    /// Hex private key the relayer signs with.
    pub relayer_key: Option<String>,

    /// Bridge contract address on both chains.
    pub bridge: Address,

    /// Host the sandboxed nodes listen on.
    pub node_host: String,

    /// Sleep between polling cycles.
    pub poll_interval: Duration,

    /// Pause after each dispatched event.
    pub dispatch_pause: Duration,

    /// Upper bound on waiting for a relay transaction receipt.
    pub receipt_timeout: Duration,
}

impl RelaySettings {
    /// Load relay settings from environment variables.
    pub fn from_env() -> Result<Self> {
        let bridge = std::env::var("CHAINBOX_BRIDGE_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_BRIDGE.to_string());
        let bridge = Address::from_str(&bridge)
            .with_context(|| format!("CHAINBOX_BRIDGE_ADDRESS is not an address: {bridge}"))?;

        let poll_ms: u64 = env_parse("CHAINBOX_RELAY_POLL_INTERVAL_MS", 1000)?;
        let pause_ms: u64 = env_parse("CHAINBOX_RELAY_DISPATCH_PAUSE_MS", 1000)?;
        let receipt_secs: u64 = env_parse("CHAINBOX_RELAY_RECEIPT_TIMEOUT_SECS", 120)?;

        Ok(Self {
            relayer_key: std::env::var("CHAINBOX_RELAYER_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            bridge,
            node_host: std::env::var("CHAINBOX_NODE_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            poll_interval: Duration::from_millis(poll_ms),
            dispatch_pause: Duration::from_millis(pause_ms),
            receipt_timeout: Duration::from_secs(receipt_secs),
        })
    }

    /// Loads the relayer signing key.
    pub fn signer(&self) -> Result<LocalSigner> {
        let key = self
            .relayer_key
            .as_deref()
            .context("CHAINBOX_RELAYER_KEY is required to relay")?;
        LocalSigner::from_hex(key).context("CHAINBOX_RELAYER_KEY is not a valid private key")
    }

    /// Environment handed to the relay worker, which starts with an empty one.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("CHAINBOX_BRIDGE_ADDRESS".to_string(), format!("{:?}", self.bridge)),
            ("CHAINBOX_NODE_HOST".to_string(), self.node_host.clone()),
            (
                "CHAINBOX_RELAY_POLL_INTERVAL_MS".to_string(),
                self.poll_interval.as_millis().to_string(),
            ),
            (
                "CHAINBOX_RELAY_DISPATCH_PAUSE_MS".to_string(),
                self.dispatch_pause.as_millis().to_string(),
            ),
            (
                "CHAINBOX_RELAY_RECEIPT_TIMEOUT_SECS".to_string(),
                self.receipt_timeout.as_secs().to_string(),
            ),
        ];
        if let Some(key) = &self.relayer_key {
            env.push(("CHAINBOX_RELAYER_KEY".to_string(), key.clone()));
        }
        env
    }
}

impl std::fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySettings")
            .field("relayer_key", &self.relayer_key.as_ref().map(|_| "<redacted>"))
            .field("bridge", &self.bridge)
            .field("node_host", &self.node_host)
            .field("poll_interval", &self.poll_interval)
            .field("dispatch_pause", &self.dispatch_pause)
            .field("receipt_timeout", &self.receipt_timeout)
            .finish()
    }
}

/// Settings for the default completion check.
#[derive(Debug, Clone)]
pub struct SolveSettings {
    /// Token contract queried on L1. Checks fail while unset.
    pub token: Option<Address>,

    /// Account whose balance is checked.
    pub holder: Address,

    /// Solved once the balance drops below this many base units.
    pub threshold: U256,

    /// Reported on success.
    pub flag: String,
}

impl SolveSettings {
    /// Load completion check settings from environment variables.
    pub fn from_env() -> Result<Self> {
        let token = match std::env::var("CHAINBOX_SOLVE_TOKEN") {
            Ok(value) if !value.is_empty() => Some(
                Address::from_str(&value)
                    .with_context(|| format!("CHAINBOX_SOLVE_TOKEN is not an address: {value}"))?,
            ),
            _ => None,
        };

        let holder = std::env::var("CHAINBOX_SOLVE_HOLDER")
            .or_else(|_| std::env::var("CHAINBOX_BRIDGE_ADDRESS"))
            .unwrap_or_else(|_| DEFAULT_BRIDGE.to_string());
        let holder = Address::from_str(&holder)
            .with_context(|| format!("CHAINBOX_SOLVE_HOLDER is not an address: {holder}"))?;

        let threshold = match std::env::var("CHAINBOX_SOLVE_THRESHOLD") {
            Ok(value) => U256::from_dec_str(&value).map_err(|e| {
                anyhow::anyhow!("CHAINBOX_SOLVE_THRESHOLD must be a decimal integer: {e:?}")
            })?,
            // 90 tokens with 18 decimals
            Err(_) => U256::from(90u64) * U256::exp10(18),
        };

        Ok(Self {
            token,
            holder,
            threshold,
            flag: std::env::var("CHAINBOX_FLAG").unwrap_or_default(),
        })
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(std::env::var(name)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{name} has an invalid value"))?
        .unwrap_or(default))
}

/// 32 random bytes, base64 encoded.
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    BASE64_STANDARD.encode(bytes)
}
