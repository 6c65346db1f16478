//! Relay directions against scripted in-memory chains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainbox_evm::types::BlockTransaction;
use chainbox_evm::{
    Address, Block, ChainClient, EvmError, Log, LogFilter, Quantity, Receipt, RemoteMessage, H256,
    U256,
};
use chainbox_orchestrator::relay::{RelayConfig, RelayDirection, RelayError, RelayPair, RelayPhase};

const L1_CHAIN_ID: u64 = 78704;
const L2_CHAIN_ID: u64 = 78705;

fn bridge() -> Address {
    Address::from_low_u64_be(0xb41d6e)
}

fn config() -> RelayConfig {
    RelayConfig {
        bridge: bridge(),
        poll_interval: Duration::from_millis(10),
        dispatch_pause: Duration::ZERO,
    }
}

fn message(target_chain_id: u64, nonce: u64) -> RemoteMessage {
    RemoteMessage {
        target_chain_id: U256::from(target_chain_id),
        target_address: Address::from_low_u64_be(0x7a76),
        source_address: Address::from_low_u64_be(0x5c),
        msg_value: U256::zero(),
        msg_nonce: U256::from(nonce),
        msg_data: vec![0xde, 0xad],
    }
}

/// Chain whose head, blocks and logs are set by the test.
struct ScriptedChain {
    chain_id: u64,
    head: AtomicU64,
    blocks: Mutex<HashMap<u64, Vec<Address>>>,
    logs: Mutex<HashMap<u64, Vec<Log>>>,
    sent: Mutex<Vec<(Address, Vec<u8>)>>,
    failing_sends: AtomicUsize,
}

impl ScriptedChain {
    fn new(chain_id: u64, head: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            head: AtomicU64::new(head),
            blocks: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            failing_sends: AtomicUsize::new(0),
        })
    }

    fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Block `number` with one transaction to `to` emitting `logs`.
    fn add_block(&self, number: u64, to: Address, logs: Vec<Log>) {
        self.blocks.lock().unwrap().insert(number, vec![to]);
        self.logs.lock().unwrap().insert(number, logs);
    }

    fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<(Address, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn chain_id(&self) -> Result<u64, EvmError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, EvmError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Block, EvmError> {
        let targets = self
            .blocks
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default();
        Ok(Block {
            number: Quantity(number),
            transactions: targets
                .into_iter()
                .enumerate()
                .map(|(i, to)| BlockTransaction {
                    hash: H256::from_low_u64_be(number * 100 + i as u64),
                    to: Some(to),
                })
                .collect(),
        })
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, EvmError> {
        let logs = self.logs.lock().unwrap();
        Ok((filter.from_block.0..=filter.to_block.0)
            .flat_map(|n| logs.get(&n).cloned().unwrap_or_default())
            .filter(|log| log.address == filter.address)
            .collect())
    }

    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<H256, EvmError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to, data));
        let remaining = self.failing_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(EvmError::Rpc {
                code: -32000,
                message: "nonce too low".to_string(),
            });
        }
        Ok(H256::from_low_u64_be(sent.len() as u64))
    }

    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, EvmError> {
        Ok(Receipt {
            transaction_hash: hash,
            block_number: Some(Quantity(1)),
            status: Some(Quantity(1)),
        })
    }
}

async fn l1_to_l2(head: u64) -> (Arc<ScriptedChain>, Arc<ScriptedChain>, RelayDirection) {
    let l1 = ScriptedChain::new(L1_CHAIN_ID, head);
    let l2 = ScriptedChain::new(L2_CHAIN_ID, 7);
    let mut direction = RelayDirection::new("l1->l2", l1.clone(), l2.clone(), config());
    direction.init().await.unwrap();
    (l1, l2, direction)
}

#[tokio::test]
async fn init_seeds_cursor_at_head() {
    let (_, _, direction) = l1_to_l2(100).await;
    assert_eq!(direction.cursor(), 100);
    assert_eq!(direction.phase(), RelayPhase::Polling);
}

#[tokio::test]
async fn poll_before_init_is_rejected() {
    let l1 = ScriptedChain::new(L1_CHAIN_ID, 1);
    let l2 = ScriptedChain::new(L2_CHAIN_ID, 1);
    let mut direction = RelayDirection::new("l1->l2", l1, l2, config());
    assert!(matches!(
        direction.poll_once().await,
        Err(RelayError::NotInitialized)
    ));
}

#[tokio::test]
async fn relays_event_from_new_block() {
    let (l1, l2, mut direction) = l1_to_l2(100).await;
    let msg = message(L2_CHAIN_ID, 1);
    l1.add_block(105, bridge(), vec![msg.to_log(bridge(), 105)]);
    l1.set_head(105);

    assert_eq!(direction.poll_once().await.unwrap(), 1);
    assert_eq!(direction.cursor(), 105);

    let sent = l2.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, bridge());
    assert_eq!(sent[0].1, msg.relay_calldata(L1_CHAIN_ID));
    assert!(l1.sent().is_empty());
}

#[tokio::test]
async fn events_at_or_below_cursor_are_not_replayed() {
    let (l1, l2, mut direction) = l1_to_l2(100).await;
    l1.add_block(100, bridge(), vec![message(L2_CHAIN_ID, 1).to_log(bridge(), 100)]);

    assert_eq!(direction.poll_once().await.unwrap(), 0);
    l1.set_head(101);
    assert_eq!(direction.poll_once().await.unwrap(), 0);
    assert!(l2.sent().is_empty());
}

#[tokio::test]
async fn head_regression_moves_cursor_back() {
    let (l1, l2, mut direction) = l1_to_l2(50).await;
    l1.set_head(30);

    assert_eq!(direction.poll_once().await.unwrap(), 0);
    assert_eq!(direction.cursor(), 30);

    // blocks after the rewind are processed again
    l1.add_block(31, bridge(), vec![message(L2_CHAIN_ID, 9).to_log(bridge(), 31)]);
    l1.set_head(31);
    assert_eq!(direction.poll_once().await.unwrap(), 1);
    assert_eq!(l2.sent().len(), 1);
}

#[tokio::test]
async fn messages_for_other_chains_are_skipped() {
    let (l1, l2, mut direction) = l1_to_l2(10).await;
    l1.add_block(
        11,
        bridge(),
        vec![
            message(L1_CHAIN_ID, 1).to_log(bridge(), 11),
            message(424242, 2).to_log(bridge(), 11),
            message(L2_CHAIN_ID, 3).to_log(bridge(), 11),
        ],
    );
    l1.set_head(11);

    assert_eq!(direction.poll_once().await.unwrap(), 1);
    let sent = l2.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, message(L2_CHAIN_ID, 3).relay_calldata(L1_CHAIN_ID));
}

#[tokio::test]
async fn blocks_without_bridge_calls_are_skipped() {
    let (l1, l2, mut direction) = l1_to_l2(10).await;
    let elsewhere = Address::from_low_u64_be(0xe15e);
    l1.add_block(11, elsewhere, vec![message(L2_CHAIN_ID, 1).to_log(bridge(), 11)]);
    l1.set_head(12);

    assert_eq!(direction.poll_once().await.unwrap(), 0);
    assert_eq!(direction.cursor(), 12);
    assert!(l2.sent().is_empty());
}

#[tokio::test]
async fn failed_dispatch_does_not_stop_the_block() {
    let (l1, l2, mut direction) = l1_to_l2(10).await;
    l1.add_block(
        11,
        bridge(),
        vec![
            message(L2_CHAIN_ID, 1).to_log(bridge(), 11),
            message(L2_CHAIN_ID, 2).to_log(bridge(), 11),
        ],
    );
    l1.set_head(11);
    l2.fail_next_sends(1);

    assert_eq!(direction.poll_once().await.unwrap(), 1);
    assert_eq!(l2.sent().len(), 2);

    // the failed message is not retried
    assert_eq!(direction.poll_once().await.unwrap(), 0);
    assert_eq!(l2.sent().len(), 2);
}

#[tokio::test]
async fn undecodable_events_are_ignored() {
    let (l1, l2, mut direction) = l1_to_l2(10).await;
    let mut broken = message(L2_CHAIN_ID, 1).to_log(bridge(), 11);
    broken.data.truncate(40);
    let unrelated = Log {
        topics: vec![H256::from_low_u64_be(1)],
        ..message(L2_CHAIN_ID, 2).to_log(bridge(), 11)
    };
    l1.add_block(11, bridge(), vec![broken, unrelated]);
    l1.set_head(11);

    assert_eq!(direction.poll_once().await.unwrap(), 0);
    assert!(l2.sent().is_empty());
}

#[tokio::test]
async fn pair_relays_both_ways_until_stopped() {
    let l1 = ScriptedChain::new(L1_CHAIN_ID, 5);
    let l2 = ScriptedChain::new(L2_CHAIN_ID, 8);
    let pair = RelayPair::spawn(l1.clone(), l2.clone(), config());

    // let both directions initialize
    tokio::time::sleep(Duration::from_millis(50)).await;
    l1.add_block(6, bridge(), vec![message(L2_CHAIN_ID, 1).to_log(bridge(), 6)]);
    l1.set_head(6);
    l2.add_block(9, bridge(), vec![message(L1_CHAIN_ID, 2).to_log(bridge(), 9)]);
    l2.set_head(9);

    tokio::time::timeout(Duration::from_secs(5), async {
        while l1.sent().is_empty() || l2.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both directions relay");

    assert_eq!(l2.sent()[0].1, message(L2_CHAIN_ID, 1).relay_calldata(L1_CHAIN_ID));
    assert_eq!(l1.sent()[0].1, message(L1_CHAIN_ID, 2).relay_calldata(L2_CHAIN_ID));

    pair.stop();
    pair.stop();
    tokio::time::timeout(Duration::from_secs(5), pair.join())
        .await
        .expect("relay pair stops");
}
