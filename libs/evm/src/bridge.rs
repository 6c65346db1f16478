//! Bridge contract message layout.
//!
//! The bridge emits `SendRemoteMessage` when a user sends a cross-chain
//! message and accepts `relayMessage` from the relayer on the remote side.
//! All event fields are ABI-encoded in the log data (none are indexed).

use crate::abi::{self, ParamType, Token};
use crate::error::EvmError;
use crate::types::{Address, Log, Quantity, H256, U256};

/// Event emitted by the source bridge.
pub const SEND_REMOTE_MESSAGE: &str =
    "SendRemoteMessage(uint256,address,address,uint256,uint256,bytes)";

/// Function called on the destination bridge.
pub const RELAY_MESSAGE: &str = "relayMessage(address,uint256,address,uint256,uint256,bytes)";

const EVENT_FIELDS: [ParamType; 6] = [
    ParamType::Uint,
    ParamType::Address,
    ParamType::Address,
    ParamType::Uint,
    ParamType::Uint,
    ParamType::Bytes,
];

/// Decoded `SendRemoteMessage` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub target_chain_id: U256,
    pub target_address: Address,
    pub source_address: Address,
    pub msg_value: U256,
    pub msg_nonce: U256,
    pub msg_data: Vec<u8>,
}

impl RemoteMessage {
    /// Topic 0 identifying the event.
    pub fn topic() -> H256 {
        abi::event_topic(SEND_REMOTE_MESSAGE)
    }

    /// Decodes the message from a bridge log.
    ///
    /// Returns `Ok(None)` for other events of the same contract.
    pub fn from_log(log: &Log) -> Result<Option<Self>, EvmError> {
        if log.topics.first() != Some(&Self::topic()) {
            return Ok(None);
        }

        let mut tokens = abi::decode(&EVENT_FIELDS, &log.data)?.into_iter();
        let mut next = || {
            tokens
                .next()
                .ok_or_else(|| EvmError::Abi("missing SendRemoteMessage field".to_string()))
        };
        let bad = |field: &str| EvmError::Abi(format!("SendRemoteMessage.{field} has wrong type"));

        Ok(Some(Self {
            target_chain_id: next()?.into_uint().ok_or_else(|| bad("targetChainId"))?,
            target_address: next()?.into_address().ok_or_else(|| bad("targetAddress"))?,
            source_address: next()?.into_address().ok_or_else(|| bad("sourceAddress"))?,
            msg_value: next()?.into_uint().ok_or_else(|| bad("msgValue"))?,
            msg_nonce: next()?.into_uint().ok_or_else(|| bad("msgNonce"))?,
            msg_data: next()?.into_bytes().ok_or_else(|| bad("msgData"))?,
        }))
    }

    /// Builds the log the source bridge would emit for this message.
    pub fn to_log(&self, bridge: Address, block_number: u64) -> Log {
        Log {
            address: bridge,
            topics: vec![Self::topic()],
            data: abi::encode(&[
                Token::Uint(self.target_chain_id),
                Token::Address(self.target_address),
                Token::Address(self.source_address),
                Token::Uint(self.msg_value),
                Token::Uint(self.msg_nonce),
                Token::Bytes(self.msg_data.clone()),
            ]),
            block_number: Some(Quantity(block_number)),
            transaction_hash: None,
        }
    }

    /// Returns true if the message is addressed to `chain_id`.
    pub fn targets_chain(&self, chain_id: u64) -> bool {
        self.target_chain_id == U256::from(chain_id)
    }

    /// Calldata for `relayMessage` on the destination bridge.
    pub fn relay_calldata(&self, source_chain_id: u64) -> Vec<u8> {
        abi::encode_call(
            RELAY_MESSAGE,
            &[
                Token::Address(self.target_address),
                Token::Uint(U256::from(source_chain_id)),
                Token::Address(self.source_address),
                Token::Uint(self.msg_value),
                Token::Uint(self.msg_nonce),
                Token::Bytes(self.msg_data.clone()),
            ],
        )
    }
}
