//! # MPC Session
//!
//! Session orchestration for threshold ECDSA/EdDSA operations between
//! parties that only talk through a store-and-forward message relay.
//!
//! This crate provides:
//! - Session establishment and the leader/follower setup exchange
//! - The outbound/inbound message pump driving one engine session
//! - Keygen, keysign, reshare and migrate operations with bounded retries
//! - Keyshare persistence
//!
//! The threshold protocols themselves run inside a crypto engine reached
//! through [`engine::SigningScheme`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use mpc_session::{MpcService, KeygenRequest};
//!
//! let service = MpcService::new(relay, store, ecdsa, eddsa)?;
//! let vault = service.keygen(&request).await?;
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod keygen;
pub mod migrate;
pub mod mpc;
pub mod pump;
pub mod reshare;
pub mod retry;
pub mod service;
pub mod session;
pub mod setup;
pub mod sign;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::{ServiceConfig, Timeouts};
pub use error::{Error, Result};
pub use service::MpcService;
pub use types::{
    KeyType, KeygenRequest, KeysignRequest, KeysignResponse, MigrateRequest, PartyId,
    ReshareRequest, SessionId, VaultRecord,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
