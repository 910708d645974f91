//! In-memory relay implementation for testing

use super::{async_trait, Relay};
use crate::{Error, Result};
use msg_relay::{ProtocolMessage, RelayError, RelayStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// In-memory message relay for local testing.
///
/// Backed by a [`RelayStore`]; parties sharing one instance (or clones of
/// the store) see each other's sessions.
#[derive(Default)]
pub struct MemoryRelay {
    store: RelayStore,
    /// Reject message deletes
    fail_deletes: AtomicBool,
    /// Drop outbound messages instead of queueing them
    drop_sends: AtomicBool,
    /// Reject session registration
    fail_registration: AtomicBool,
    sent: AtomicUsize,
    registrations: AtomicUsize,
}

impl MemoryRelay {
    /// Create a new in-memory relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing store
    pub fn with_store(store: RelayStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &RelayStore {
        &self.store
    }

    /// Make every `delete_message` call fail
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make every `send_message` call fail
    pub fn drop_sends(&self, drop: bool) {
        self.drop_sends.store(drop, Ordering::SeqCst);
    }

    /// Make every `register_session` call fail
    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Messages accepted so far
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// `register_session` calls so far, failed ones included
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

fn relay_error(e: RelayError) -> Error {
    Error::Relay(e.to_string())
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(Error::Relay("registration rejected".into()));
        }
        if self.store.is_live(session_id).map_err(relay_error)? {
            debug!(session_id, party_id, "Joining existing session");
        }
        self.store.register(session_id, &[party_id.to_string()]);
        Ok(())
    }

    async fn session_parties(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self.store.parties(session_id))
    }

    async fn start_session(&self, session_id: &str, parties: &[String]) -> Result<()> {
        self.store.start(session_id, parties);
        Ok(())
    }

    async fn started_parties(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self.store.started(session_id))
    }

    async fn upload_setup_message(&self, session_id: &str, tag: &str, payload: &str) -> Result<()> {
        self.store.put_setup(session_id, tag, payload.to_string());
        Ok(())
    }

    async fn get_setup_message(&self, session_id: &str, tag: &str) -> Result<Option<String>> {
        Ok(self.store.get_setup(session_id, tag))
    }

    async fn send_message(&self, message: &ProtocolMessage, tag: &str) -> Result<()> {
        if self.drop_sends.load(Ordering::SeqCst) {
            return Err(Error::Relay("send rejected".into()));
        }
        self.store
            .put_message(message.clone(), tag)
            .map_err(relay_error)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        tag: &str,
    ) -> Result<Vec<ProtocolMessage>> {
        Ok(self.store.messages(session_id, party_id, tag))
    }

    async fn delete_message(&self, session_id: &str, party_id: &str, hash: &str, tag: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Relay("delete rejected".into()));
        }
        self.store
            .delete_message(session_id, party_id, tag, hash)
            .map_err(relay_error)
    }

    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        self.store
            .complete(session_id, &[party_id.to_string()])
            .map_err(relay_error)
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self.store.completed(session_id))
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        if !self.store.end(session_id) {
            return Err(Error::Relay(format!("session {} not found", session_id)));
        }
        Ok(())
    }
}
