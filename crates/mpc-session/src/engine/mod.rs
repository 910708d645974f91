//! Crypto engine capability interface
//!
//! The threshold protocols themselves live in an external engine that hands
//! out integer handles for sessions and keyshares. One [`SigningScheme`]
//! object exists per key type; operations are written once against the
//! trait and never branch on the key type to pick engine calls.
//!
//! Raw handles never leave this module's wrappers: [`SessionHandle`] and
//! [`KeyshareHandle`] release them exactly once when dropped.

mod handle;
#[cfg(any(test, feature = "local-engine"))]
pub mod local;
#[cfg(test)]
pub(crate) mod testing;

pub use handle::{KeyshareHandle, SessionHandle, SessionOutput};

use crate::types::KeyType;
use crate::Result;

/// Opaque engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub i32);

/// Protocol family a session handle belongs to.
///
/// Migration sessions are driven with the keygen calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFamily {
    Keygen,
    Sign,
    Reshare,
}

/// What a finished session hands back, before it is wrapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutput {
    Keyshare(Handle),
    Signature(Vec<u8>),
}

/// Engine operations for one key type
pub trait SigningScheme: Send + Sync {
    fn key_type(&self) -> KeyType;

    /// Setup for a fresh key, or for a migration when `key_id` is given
    fn keygen_setup(&self, key_id: Option<&[u8]>, threshold: usize, ids: &[u8]) -> Result<Vec<u8>>;

    /// Setup for signing `message_hash` with the key `key_id`
    fn sign_setup(
        &self,
        key_id: &[u8],
        chain_path: Option<&str>,
        message_hash: &[u8],
        ids: &[u8],
    ) -> Result<Vec<u8>>;

    /// Setup for moving `keyshare`'s key from `old_parties` to `new_parties`.
    ///
    /// Party lists are indices into `ids`.
    fn reshare_setup(
        &self,
        keyshare: Handle,
        ids: &[u8],
        old_parties: &[u8],
        new_threshold: usize,
        new_parties: &[u8],
    ) -> Result<Vec<u8>>;

    /// Message hash a signing setup commits to
    fn decode_message_hash(&self, setup: &[u8]) -> Result<Vec<u8>>;

    fn keygen_session(&self, setup: &[u8], party_id: &str) -> Result<Handle>;

    fn sign_session(&self, setup: &[u8], party_id: &str, keyshare: Handle) -> Result<Handle>;

    /// New committee members without a share pass `None`
    fn reshare_session(&self, setup: &[u8], party_id: &str, keyshare: Option<Handle>) -> Result<Handle>;

    fn migrate_session(
        &self,
        setup: &[u8],
        party_id: &str,
        public_key: &[u8],
        chain_code: &[u8],
        secret: &[u8],
    ) -> Result<Handle>;

    /// Next message the session wants delivered, if any
    fn output_message(&self, family: SessionFamily, session: Handle) -> Result<Option<Vec<u8>>>;

    /// Recipient number `index` of an outbound message; `None` once all are listed
    fn message_receiver(
        &self,
        family: SessionFamily,
        session: Handle,
        message: &[u8],
        index: usize,
    ) -> Result<Option<String>>;

    /// Feed an inbound message; returns whether the protocol finished
    fn input_message(&self, family: SessionFamily, session: Handle, message: &[u8]) -> Result<bool>;

    fn finish(&self, family: SessionFamily, session: Handle) -> Result<RawOutput>;

    fn free_session(&self, family: SessionFamily, session: Handle) -> Result<()>;

    fn keyshare_from_bytes(&self, bytes: &[u8]) -> Result<Handle>;

    fn keyshare_to_bytes(&self, keyshare: Handle) -> Result<Vec<u8>>;

    fn keyshare_public_key(&self, keyshare: Handle) -> Result<Vec<u8>>;

    fn keyshare_key_id(&self, keyshare: Handle) -> Result<Vec<u8>>;

    fn keyshare_chain_code(&self, keyshare: Handle) -> Result<Vec<u8>>;

    fn derive_child_public_key(&self, keyshare: Handle, path: &str) -> Result<Vec<u8>>;

    fn free_keyshare(&self, keyshare: Handle) -> Result<()>;
}
