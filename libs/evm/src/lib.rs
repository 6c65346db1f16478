//! # chainbox-evm
//!
//! The small slice of Ethereum plumbing chainbox needs to relay bridge
//! messages between two sandboxed nodes:
//!
//! - `client`: JSON-RPC transport and the [`ChainClient`] interface
//! - `abi`: contract call payload encoding
//! - `signer`: local secp256k1 key, legacy EIP-155 transactions
//! - `bridge`: `SendRemoteMessage` / `relayMessage` layout

pub mod abi;
pub mod bridge;
pub mod client;
mod error;
pub mod signer;
pub mod types;

pub use bridge::RemoteMessage;
pub use client::{ChainClient, ReceiptPolicy, RpcChainClient, RpcClient};
pub use error::EvmError;
pub use signer::{LegacyTransaction, LocalSigner};
pub use types::{Address, Block, Log, LogFilter, Quantity, Receipt, H256, U256};
