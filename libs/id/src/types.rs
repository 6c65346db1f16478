//! Kind tags and keyed instance identities.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::IdError;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Kinds
// =============================================================================

/// Process role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// First chain node.
    L1,
    /// Second chain node.
    L2,
    /// Bridge relayer running both relay directions.
    Relayer,
}

impl Kind {
    /// All kinds in reset order.
    pub const ALL: [Kind; 3] = [Kind::L1, Kind::L2, Kind::Relayer];

    /// Canonical tag mixed into the identity digest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::L1 => "L1",
            Kind::L2 => "L2",
            Kind::Relayer => "RELAYER",
        }
    }

    /// Chain id the node of this kind is started with.
    ///
    /// `None` for the relayer, which runs no node.
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Kind::L1 => Some(78704),
            Kind::L2 => Some(78705),
            Kind::Relayer => None,
        }
    }

    /// Returns true for kinds backed by a node binary.
    pub fn is_node(&self) -> bool {
        !matches!(self, Kind::Relayer)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain addressed by a gateway RPC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainTag {
    L1,
    L2,
}

impl FromStr for ChainTag {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(IdError::Empty),
            "L1" => Ok(ChainTag::L1),
            "L2" => Ok(ChainTag::L2),
            other => Err(IdError::UnknownChain(other.to_string())),
        }
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Process-wide key for identity derivation.
#[derive(Clone)]
pub struct IdentitySecret(Vec<u8>);

impl IdentitySecret {
    /// Wraps raw key material. Empty secrets are rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, IdError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(IdError::InvalidSecret);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentitySecret(..)")
    }
}

/// Stable opaque identifier of one `(tenant, kind)` instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// The prefix for instance keys.
    pub const PREFIX: &'static str = "inst";

    const DIGEST_HEX_LEN: usize = 64;

    /// Derives the key for `token` and `kind`.
    ///
    /// HMAC-SHA256 over `token ‖ 0x00 ‖ kind-tag`. The separator keeps
    /// `("ab", "L1")` and `("a", "bL1")` apart.
    pub fn derive(secret: &IdentitySecret, token: &str, kind: Kind) -> Self {
        let mut mac =
            HmacSha256::new_from_slice(&secret.0).expect("HMAC accepts keys of any length");
        mac.update(token.as_bytes());
        mac.update(&[0]);
        mac.update(kind.as_str().as_bytes());
        let digest = mac.finalize().into_bytes();
        Self(format!("{}_{}", Self::PREFIX, hex::encode(digest)))
    }

    /// Parses a key from its string form, e.g. a workspace directory name.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((prefix, digest)) = s.split_once('_') else {
            return Err(IdError::InvalidFormat {
                message: "missing underscore separator".to_string(),
            });
        };

        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        if digest.len() != Self::DIGEST_HEX_LEN
            || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(IdError::InvalidFormat {
                message: format!("digest must be {} lowercase hex chars", Self::DIGEST_HEX_LEN),
            });
        }

        Ok(Self(s.to_string()))
    }

    /// The key as a string slice; also the workspace directory name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secret() -> IdentitySecret {
        IdentitySecret::new(b"test-secret".to_vec()).unwrap()
    }

    #[test]
    fn derive_is_deterministic() {
        let a = InstanceKey::derive(&secret(), "alice", Kind::L1);
        let b = InstanceKey::derive(&secret(), "alice", Kind::L1);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("inst_"));
    }

    #[test]
    fn kinds_get_unrelated_keys() {
        let l1 = InstanceKey::derive(&secret(), "alice", Kind::L1);
        let l2 = InstanceKey::derive(&secret(), "alice", Kind::L2);
        let relayer = InstanceKey::derive(&secret(), "alice", Kind::Relayer);
        assert_ne!(l1, l2);
        assert_ne!(l1, relayer);
        // No shared prefix beyond the type tag.
        assert_ne!(&l1.as_str()[5..13], &l2.as_str()[5..13]);
    }

    #[test]
    fn secret_changes_key() {
        let other = IdentitySecret::new(b"other-secret".to_vec()).unwrap();
        assert_ne!(
            InstanceKey::derive(&secret(), "alice", Kind::L1),
            InstanceKey::derive(&other, "alice", Kind::L1)
        );
    }

    #[test]
    fn separator_prevents_concatenation_collisions() {
        let a = InstanceKey::derive(&secret(), "aliceL", Kind::L1);
        let b = InstanceKey::derive(&secret(), "alice", Kind::L1);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_secret_rejected() {
        assert_eq!(IdentitySecret::new(Vec::new()).unwrap_err(), IdError::InvalidSecret);
    }

    #[test]
    fn secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", secret()), "IdentitySecret(..)");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(InstanceKey::parse("").unwrap_err(), IdError::Empty);
        assert!(matches!(
            InstanceKey::parse("app_00"),
            Err(IdError::InvalidPrefix { .. })
        ));
        assert!(matches!(
            InstanceKey::parse("inst_xyz"),
            Err(IdError::InvalidFormat { .. })
        ));
        assert!(matches!(
            InstanceKey::parse("inst"),
            Err(IdError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn kind_properties() {
        assert_eq!(Kind::L1.chain_id(), Some(78704));
        assert_eq!(Kind::L2.chain_id(), Some(78705));
        assert_eq!(Kind::Relayer.chain_id(), None);
        assert!(!Kind::Relayer.is_node());
        assert_eq!(Kind::Relayer.to_string(), "RELAYER");
    }

    #[test]
    fn chain_tags() {
        assert_eq!("L1".parse::<ChainTag>().unwrap(), ChainTag::L1);
        assert_eq!("L2".parse::<ChainTag>().unwrap(), ChainTag::L2);
        assert_eq!("".parse::<ChainTag>().unwrap_err(), IdError::Empty);
        assert!(matches!(
            "RELAYER".parse::<ChainTag>(),
            Err(IdError::UnknownChain(_))
        ));
    }

    proptest! {
        #[test]
        fn derived_keys_always_parse(token in ".*") {
            let key = InstanceKey::derive(&secret(), &token, Kind::L1);
            prop_assert_eq!(InstanceKey::parse(key.as_str()).unwrap(), key);
        }
    }
}
