//! # chainbox-id
//!
//! Instance kinds and stable instance identities for chainbox.
//!
//! ## Design Principles
//!
//! - An instance is addressed by `(tenant token, kind)`; the token never
//!   appears on disk or in logs, only its keyed digest does
//! - Identities are deterministic for a given process secret
//! - Different kinds of the same tenant produce unrelated identities
//!
//! ## ID Format
//!
//! Instance keys use a prefixed format: `inst_{hex(hmac_sha256)}`
//!
//! Example:
//! - `inst_5f0c0d6f0b1b2d5a3c2e17b4a6c4b7a3e9d1c0f2a8b7e6d5c4b3a29180f7e6d5`

mod error;
mod types;

pub use error::IdError;
pub use types::*;
