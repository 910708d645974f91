//! Owned engine handles

use super::{Handle, RawOutput, SessionFamily, SigningScheme};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};

/// A live protocol session inside the engine.
///
/// Shared by the two pump tasks through an `Arc`; the engine session is
/// freed when the last reference goes away.
pub struct SessionHandle {
    scheme: Arc<dyn SigningScheme>,
    family: SessionFamily,
    handle: Handle,
}

impl SessionHandle {
    pub fn keygen(scheme: Arc<dyn SigningScheme>, setup: &[u8], party_id: &str) -> Result<Self> {
        let handle = scheme.keygen_session(setup, party_id)?;
        Ok(Self::wrap(scheme, SessionFamily::Keygen, handle))
    }

    pub fn sign(
        scheme: Arc<dyn SigningScheme>,
        setup: &[u8],
        party_id: &str,
        keyshare: &KeyshareHandle,
    ) -> Result<Self> {
        let handle = scheme.sign_session(setup, party_id, keyshare.raw())?;
        Ok(Self::wrap(scheme, SessionFamily::Sign, handle))
    }

    pub fn reshare(
        scheme: Arc<dyn SigningScheme>,
        setup: &[u8],
        party_id: &str,
        keyshare: Option<&KeyshareHandle>,
    ) -> Result<Self> {
        let handle = scheme.reshare_session(setup, party_id, keyshare.map(KeyshareHandle::raw))?;
        Ok(Self::wrap(scheme, SessionFamily::Reshare, handle))
    }

    pub fn migrate(
        scheme: Arc<dyn SigningScheme>,
        setup: &[u8],
        party_id: &str,
        public_key: &[u8],
        chain_code: &[u8],
        secret: &[u8],
    ) -> Result<Self> {
        let handle = scheme.migrate_session(setup, party_id, public_key, chain_code, secret)?;
        Ok(Self::wrap(scheme, SessionFamily::Keygen, handle))
    }

    fn wrap(scheme: Arc<dyn SigningScheme>, family: SessionFamily, handle: Handle) -> Self {
        trace!(?family, handle = handle.0, "Session handle acquired");
        Self {
            scheme,
            family,
            handle,
        }
    }

    pub fn family(&self) -> SessionFamily {
        self.family
    }

    pub fn output_message(&self) -> Result<Option<Vec<u8>>> {
        self.scheme.output_message(self.family, self.handle)
    }

    pub fn message_receiver(&self, message: &[u8], index: usize) -> Result<Option<String>> {
        self.scheme
            .message_receiver(self.family, self.handle, message, index)
    }

    pub fn input_message(&self, message: &[u8]) -> Result<bool> {
        self.scheme.input_message(self.family, self.handle, message)
    }

    /// Extract the protocol result
    pub fn finish(&self) -> Result<SessionOutput> {
        match self.scheme.finish(self.family, self.handle)? {
            RawOutput::Keyshare(handle) => Ok(SessionOutput::Keyshare(KeyshareHandle::wrap(
                self.scheme.clone(),
                handle,
            ))),
            RawOutput::Signature(signature) => Ok(SessionOutput::Signature(signature)),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.scheme.free_session(self.family, self.handle) {
            error!(handle = self.handle.0, error = %e, "Failed to free session handle");
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key_type", &self.scheme.key_type())
            .field("family", &self.family)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Result of a finished session
#[derive(Debug)]
pub enum SessionOutput {
    Keyshare(KeyshareHandle),
    Signature(Vec<u8>),
}

impl SessionOutput {
    pub fn into_keyshare(self) -> Result<KeyshareHandle> {
        match self {
            SessionOutput::Keyshare(keyshare) => Ok(keyshare),
            SessionOutput::Signature(_) => {
                Err(Error::Engine("expected a keyshare, session produced a signature".into()))
            }
        }
    }

    pub fn into_signature(self) -> Result<Vec<u8>> {
        match self {
            SessionOutput::Signature(signature) => Ok(signature),
            SessionOutput::Keyshare(_) => {
                Err(Error::Engine("expected a signature, session produced a keyshare".into()))
            }
        }
    }
}

/// A keyshare loaded into the engine
pub struct KeyshareHandle {
    scheme: Arc<dyn SigningScheme>,
    handle: Handle,
}

impl KeyshareHandle {
    pub fn from_bytes(scheme: Arc<dyn SigningScheme>, bytes: &[u8]) -> Result<Self> {
        let handle = scheme.keyshare_from_bytes(bytes)?;
        Ok(Self::wrap(scheme, handle))
    }

    fn wrap(scheme: Arc<dyn SigningScheme>, handle: Handle) -> Self {
        trace!(handle = handle.0, "Keyshare handle acquired");
        Self { scheme, handle }
    }

    pub(crate) fn raw(&self) -> Handle {
        self.handle
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.scheme.keyshare_to_bytes(self.handle)
    }

    pub fn public_key(&self) -> Result<Vec<u8>> {
        self.scheme.keyshare_public_key(self.handle)
    }

    pub fn key_id(&self) -> Result<Vec<u8>> {
        self.scheme.keyshare_key_id(self.handle)
    }

    pub fn chain_code(&self) -> Result<Vec<u8>> {
        self.scheme.keyshare_chain_code(self.handle)
    }

    pub fn derive_child_public_key(&self, path: &str) -> Result<Vec<u8>> {
        self.scheme.derive_child_public_key(self.handle, path)
    }
}

impl fmt::Debug for KeyshareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyshareHandle")
            .field("key_type", &self.scheme.key_type())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for KeyshareHandle {
    fn drop(&mut self) {
        if let Err(e) = self.scheme.free_keyshare(self.handle) {
            error!(handle = self.handle.0, error = %e, "Failed to free keyshare handle");
        }
    }
}
