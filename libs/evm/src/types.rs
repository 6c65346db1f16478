//! Wire types for the subset of the Ethereum JSON-RPC API chainbox uses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

pub use primitive_types::{H160 as Address, H256, U256};

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Formats a quantity the way nodes expect it (`0x` + minimal hex).
pub fn format_quantity(value: u64) -> String {
    format!("{:#x}", value)
}

/// A JSON-RPC hex quantity decoded to `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(pub u64);

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_quantity(self.0))
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_quantity(&s)
            .map(Quantity)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid quantity: {s}")))
    }
}

/// `0x`-prefixed hex byte strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(digits).map_err(serde::de::Error::custom)
    }
}

/// Transaction summary inside a block fetched with full transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTransaction {
    pub hash: H256,
    /// `None` for contract creation.
    #[serde(default)]
    pub to: Option<Address>,
}

/// Block fetched with `eth_getBlockByNumber(n, true)`.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub number: Quantity,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
}

impl Block {
    /// Returns true if any transaction in the block calls `address`.
    pub fn has_transaction_to(&self, address: Address) -> bool {
        self.transactions.iter().any(|tx| tx.to == Some(address))
    }
}

/// Event log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub block_number: Option<Quantity>,
    #[serde(default)]
    pub transaction_hash: Option<H256>,
}

/// Filter for `eth_getLogs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub address: Address,
    pub from_block: Quantity,
    pub to_block: Quantity,
}

impl LogFilter {
    /// Filter for a single block.
    pub fn single_block(address: Address, number: u64) -> Self {
        Self {
            address,
            from_block: Quantity(number),
            to_block: Quantity(number),
        }
    }
}

/// Mined transaction receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_number: Option<Quantity>,
    /// `0x1` success, `0x0` revert. Absent on pre-Byzantium chains.
    #[serde(default)]
    pub status: Option<Quantity>,
}

impl Receipt {
    /// Returns false only when the node reports a revert.
    pub fn succeeded(&self) -> bool {
        self.status != Some(Quantity(0))
    }
}
