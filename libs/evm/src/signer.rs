//! Local secp256k1 key and legacy (EIP-155) transaction signing.

use std::fmt;

use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;

use rlp::RlpStream;

use crate::error::EvmError;
use crate::types::{keccak256, Address, U256};

/// Pre-EIP-1559 transaction with replay protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn stream_base_fields(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas);
        stream.append(&self.to);
        stream.append(&self.value);
        stream.append(&self.data);
    }

    /// Hash signed over: `keccak(rlp([.., chainId, 0, 0]))`.
    pub fn sighash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.stream_base_fields(&mut stream);
        stream.append(&self.chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak256(&stream.out())
    }

    fn encode_signed(&self, signature: &RecoverableSignature) -> Vec<u8> {
        let v = self.chain_id * 2 + 35 + u64::from(signature.recovery_id);
        let mut stream = RlpStream::new_list(9);
        self.stream_base_fields(&mut stream);
        stream.append(&v);
        // as integers, so leading zero bytes are dropped
        stream.append(&U256::from_big_endian(&signature.r));
        stream.append(&U256::from_big_endian(&signature.s));
        stream.out().to_vec()
    }
}

/// `(r, s)` plus the recovery bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

/// In-memory signing key.
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Loads a key from hex, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, EvmError> {
        let digits = private_key.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits)
            .map_err(|e| EvmError::Signing(format!("private key is not hex: {e}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| EvmError::Signing(format!("invalid private key: {e}")))?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    /// Account address controlled by this key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte prehash.
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<RecoverableSignature, EvmError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash)
            .map_err(|e| EvmError::Signing(e.to_string()))?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RecoverableSignature {
            r,
            s,
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// Signs `tx` and returns the raw bytes for `eth_sendRawTransaction`.
    pub fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>, EvmError> {
        let signature = self.sign_hash(&tx.sighash())?;
        Ok(tx.encode_signed(&signature))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn address_of(key: &SigningKey) -> Address {
    let point = key.verifying_key().to_encoded_point(false);
    // Uncompressed SEC1: 0x04 ‖ X ‖ Y; the address hashes X ‖ Y.
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
