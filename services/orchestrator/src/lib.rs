//! chainbox orchestrator library.
//!
//! Provisions per-tenant sandboxed chain nodes and a bridge relayer:
//!
//! - **registry**: instance identities, workspaces, snapshots, port leases
//! - **supervisor** / **sandbox**: worker spawn, readiness, kill
//! - **proxy**: filtered JSON-RPC forwarding and historical queries
//! - **relay**: bridge event relay between the two chains
//! - **gateway** / **http**: tenant-facing operations

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lockfile;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod sandbox;
pub mod supervisor;

pub use error::{Error, Result};
