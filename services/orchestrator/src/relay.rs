//! Cross-chain event relay.
//!
//! A [`RelayDirection`] watches one chain's bridge for `SendRemoteMessage`
//! events and replays each one as `relayMessage` on the other chain's bridge.
//! A [`RelayPair`] runs the two directions as independent tasks; they share
//! nothing but the stop signal.
//!
//! The cursor is the last source block taken for processing. It is advanced
//! before a block is processed, so a block whose dispatch fails is not
//! retried (at-most-once delivery).

use std::sync::Arc;
use std::time::Duration;

use chainbox_evm::{Address, ChainClient, EvmError, LogFilter, RemoteMessage};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Failure inside one polling cycle. Never escapes the cycle.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Chain(#[from] EvmError),

    #[error("relay direction used before init")]
    NotInitialized,
}

/// Relay timing and addresses.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bridge contract, same address on both chains.
    pub bridge: Address,

    /// Sleep between cycles and between init attempts.
    pub poll_interval: Duration,

    /// Pause after each dispatched event.
    pub dispatch_pause: Duration,
}

impl RelayConfig {
    pub fn new(bridge: Address) -> Self {
        Self {
            bridge,
            poll_interval: Duration::from_secs(1),
            dispatch_pause: Duration::from_secs(1),
        }
    }
}

/// Phase of a relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Init,
    Polling,
    Processing,
    Stopped,
}

/// One source → destination relay worker.
pub struct RelayDirection {
    name: String,
    source: Arc<dyn ChainClient>,
    destination: Arc<dyn ChainClient>,
    config: RelayConfig,
    source_chain_id: u64,
    destination_chain_id: u64,
    cursor: u64,
    phase: RelayPhase,
}

impl RelayDirection {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ChainClient>,
        destination: Arc<dyn ChainClient>,
        config: RelayConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            destination,
            config,
            source_chain_id: 0,
            destination_chain_id: 0,
            cursor: 0,
            phase: RelayPhase::Init,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    /// Resolve both chain ids and seed the cursor at the source head.
    pub async fn init(&mut self) -> Result<(), RelayError> {
        self.source_chain_id = self.source.chain_id().await?;
        self.destination_chain_id = self.destination.chain_id().await?;
        self.cursor = self.source.block_number().await?;
        self.phase = RelayPhase::Polling;

        info!(
            relay = %self.name,
            source_chain_id = self.source_chain_id,
            destination_chain_id = self.destination_chain_id,
            cursor = self.cursor,
            "Relay initialized"
        );
        Ok(())
    }

    /// Process every block between the cursor and the source head.
    ///
    /// Returns the number of events relayed.
    pub async fn poll_once(&mut self) -> Result<usize, RelayError> {
        if self.phase == RelayPhase::Init {
            return Err(RelayError::NotInitialized);
        }

        let head = self.source.block_number().await?;
        if head < self.cursor {
            warn!(relay = %self.name, cursor = self.cursor, head, "Source head went backwards");
            self.cursor = head;
            return Ok(0);
        }

        let mut relayed = 0;
        while self.cursor < head {
            self.cursor += 1;
            self.phase = RelayPhase::Processing;
            let result = self.process_block(self.cursor).await;
            self.phase = RelayPhase::Polling;
            relayed += result?;
        }
        Ok(relayed)
    }

    async fn process_block(&self, number: u64) -> Result<usize, RelayError> {
        let block = self.source.block(number).await?;
        if !block.has_transaction_to(self.config.bridge) {
            return Ok(0);
        }

        let logs = self
            .source
            .logs(&LogFilter::single_block(self.config.bridge, number))
            .await?;

        let mut relayed = 0;
        for log in logs.iter().filter(|log| log.address == self.config.bridge) {
            let message = match RemoteMessage::from_log(log) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(relay = %self.name, block = number, error = %e, "Undecodable bridge event");
                    continue;
                }
            };
            if !message.targets_chain(self.destination_chain_id) {
                continue;
            }

            match self.dispatch(&message).await {
                Ok(()) => relayed += 1,
                Err(e) => error!(
                    relay = %self.name,
                    block = number,
                    nonce = %message.msg_nonce,
                    error = %e,
                    "Failed to relay message"
                ),
            }
        }
        Ok(relayed)
    }

    async fn dispatch(&self, message: &RemoteMessage) -> Result<(), RelayError> {
        let calldata = message.relay_calldata(self.source_chain_id);
        let hash = self
            .destination
            .send_transaction(self.config.bridge, calldata)
            .await?;
        let receipt = self.destination.wait_for_receipt(hash).await?;
        if !receipt.succeeded() {
            return Err(EvmError::Reverted(format!("{hash:?}")).into());
        }

        debug!(relay = %self.name, tx = ?hash, nonce = %message.msg_nonce, "Relayed message");
        if !self.config.dispatch_pause.is_zero() {
            tokio::time::sleep(self.config.dispatch_pause).await;
        }
        Ok(())
    }

    /// Run until `stop` flips to true. Errors are logged and retried.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            let cycle = async {
                if self.phase == RelayPhase::Init {
                    self.init().await.map(|()| 0)
                } else {
                    self.poll_once().await
                }
            };

            tokio::select! {
                result = cycle => {
                    if let Err(e) = result {
                        warn!(relay = %self.name, error = %e, "Relay cycle failed");
                    }
                }
                _ = stop.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = stop.changed() => break,
            }
        }

        self.phase = RelayPhase::Stopped;
        info!(relay = %self.name, cursor = self.cursor, "Relay stopped");
    }
}

/// The two directions between a pair of chains.
pub struct RelayPair {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RelayPair {
    /// Spawn `l1 -> l2` and `l2 -> l1`.
    pub fn spawn(l1: Arc<dyn ChainClient>, l2: Arc<dyn ChainClient>, config: RelayConfig) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let forward = RelayDirection::new("l1->l2", Arc::clone(&l1), Arc::clone(&l2), config.clone());
        let backward = RelayDirection::new("l2->l1", l2, l1, config);

        let handles = vec![
            tokio::spawn(forward.run(stop_rx.clone())),
            tokio::spawn(backward.run(stop_rx)),
        ];
        Self { stop, handles }
    }

    /// Ask both directions to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for both directions to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Relay task panicked");
            }
        }
    }
}
