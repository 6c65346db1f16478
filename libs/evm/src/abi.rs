//! Solidity ABI encoding for the static/dynamic types the bridge uses.
//!
//! Supported: `address`, `uint256`, `bytes`.

use crate::error::EvmError;
use crate::types::{keccak256, Address, H256, U256};

const WORD: usize = 32;

/// A decoded or to-be-encoded ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Bytes(Vec<u8>),
}

impl Token {
    pub fn into_address(self) -> Option<Address> {
        match self {
            Token::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_uint(self) -> Option<U256> {
        match self {
            Token::Uint(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Token::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Expected type of a value when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Uint,
    Bytes,
}

/// First four bytes of the Keccak hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic 0 of an event with the given signature.
pub fn event_topic(signature: &str) -> H256 {
    H256(keccak256(signature.as_bytes()))
}

/// Encodes `tokens` as a tuple (head/tail layout).
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Address(address) => {
                head.extend_from_slice(&[0u8; 12]);
                head.extend_from_slice(address.as_bytes());
            }
            Token::Uint(value) => head.extend_from_slice(&u256_word(value)),
            Token::Bytes(bytes) => {
                head.extend_from_slice(&u256_word(&U256::from((head_len + tail.len()) as u64)));
                tail.extend_from_slice(&u256_word(&U256::from(bytes.len() as u64)));
                tail.extend_from_slice(bytes);
                let padding = (WORD - bytes.len() % WORD) % WORD;
                tail.extend(std::iter::repeat(0u8).take(padding));
            }
        }
    }

    head.extend_from_slice(&tail);
    head
}

/// Encodes a function call: selector followed by the encoded arguments.
pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend_from_slice(&encode(tokens));
    out
}

/// Decodes a tuple of `types` from `data`.
pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, EvmError> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let word = read_word(data, i * WORD)?;
            match ty {
                ParamType::Address => {
                    if word[..12].iter().any(|&b| b != 0) {
                        return Err(EvmError::Abi(format!("dirty address padding at slot {i}")));
                    }
                    Ok(Token::Address(Address::from_slice(&word[12..])))
                }
                ParamType::Uint => Ok(Token::Uint(U256::from_big_endian(word))),
                ParamType::Bytes => {
                    let offset = word_to_usize(word)?;
                    let len = word_to_usize(read_word(data, offset)?)?;
                    let start = offset + WORD;
                    let end = start
                        .checked_add(len)
                        .filter(|end| *end <= data.len())
                        .ok_or_else(|| EvmError::Abi(format!("bytes at slot {i} out of bounds")))?;
                    Ok(Token::Bytes(data[start..end].to_vec()))
                }
            }
        })
        .collect()
}

fn u256_word(value: &U256) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    value.to_big_endian(&mut word);
    word
}

fn read_word(data: &[u8], offset: usize) -> Result<&[u8], EvmError> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| EvmError::Abi(format!("data too short for word at {offset}")))
}

fn word_to_usize(word: &[u8]) -> Result<usize, EvmError> {
    if word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(EvmError::Abi("offset does not fit in usize".to_string()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[WORD - 8..]);
    usize::try_from(u64::from_be_bytes(buf))
        .map_err(|_| EvmError::Abi("offset does not fit in usize".to_string()))
}
