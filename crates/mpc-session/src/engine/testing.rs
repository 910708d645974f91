//! Scripted engine for pump tests

use super::{Handle, RawOutput, SessionFamily, SigningScheme};
use crate::types::KeyType;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Emits a fixed list of outbound messages and records every inbound one.
///
/// Inputs starting with `bad` are rejected. The session finishes once
/// `finish_after` inputs were accepted.
pub struct RecordingScheme {
    outbound: Mutex<VecDeque<Vec<u8>>>,
    receivers: Vec<String>,
    inputs: Mutex<Vec<Vec<u8>>>,
    finish_after: usize,
    next_handle: AtomicI32,
    pub created: AtomicUsize,
    pub freed: AtomicUsize,
}

impl RecordingScheme {
    pub fn new(finish_after: usize) -> Self {
        Self {
            outbound: Mutex::new(VecDeque::new()),
            receivers: Vec::new(),
            inputs: Mutex::new(Vec::new()),
            finish_after,
            next_handle: AtomicI32::new(1),
            created: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    pub fn with_outbound(mut self, messages: Vec<Vec<u8>>, receivers: &[&str]) -> Self {
        self.outbound = Mutex::new(messages.into());
        self.receivers = receivers.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    fn unsupported<T>() -> Result<T> {
        Err(Error::Engine("unsupported by recording scheme".into()))
    }
}

impl SigningScheme for RecordingScheme {
    fn key_type(&self) -> KeyType {
        KeyType::Ecdsa
    }

    fn keygen_setup(&self, _: Option<&[u8]>, _: usize, ids: &[u8]) -> Result<Vec<u8>> {
        Ok(ids.to_vec())
    }

    fn sign_setup(&self, _: &[u8], _: Option<&str>, _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn reshare_setup(&self, _: Handle, _: &[u8], _: &[u8], _: usize, _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn decode_message_hash(&self, _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn keygen_session(&self, _: &[u8], _: &str) -> Result<Handle> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Handle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    fn sign_session(&self, _: &[u8], _: &str, _: Handle) -> Result<Handle> {
        Self::unsupported()
    }

    fn reshare_session(&self, _: &[u8], _: &str, _: Option<Handle>) -> Result<Handle> {
        Self::unsupported()
    }

    fn migrate_session(&self, _: &[u8], _: &str, _: &[u8], _: &[u8], _: &[u8]) -> Result<Handle> {
        Self::unsupported()
    }

    fn output_message(&self, _: SessionFamily, _: Handle) -> Result<Option<Vec<u8>>> {
        Ok(self.outbound.lock().unwrap().pop_front())
    }

    fn message_receiver(&self, _: SessionFamily, _: Handle, _: &[u8], index: usize) -> Result<Option<String>> {
        Ok(self.receivers.get(index).cloned())
    }

    fn input_message(&self, _: SessionFamily, _: Handle, message: &[u8]) -> Result<bool> {
        if message.starts_with(b"bad") {
            return Err(Error::Engine("rejected input".into()));
        }
        let mut inputs = self.inputs.lock().unwrap();
        inputs.push(message.to_vec());
        Ok(inputs.len() >= self.finish_after)
    }

    fn finish(&self, _: SessionFamily, _: Handle) -> Result<RawOutput> {
        Ok(RawOutput::Signature(b"signature".to_vec()))
    }

    fn free_session(&self, _: SessionFamily, _: Handle) -> Result<()> {
        self.freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keyshare_from_bytes(&self, _: &[u8]) -> Result<Handle> {
        Self::unsupported()
    }

    fn keyshare_to_bytes(&self, _: Handle) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn keyshare_public_key(&self, _: Handle) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn keyshare_key_id(&self, _: Handle) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn keyshare_chain_code(&self, _: Handle) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn derive_child_public_key(&self, _: Handle, _: &str) -> Result<Vec<u8>> {
        Self::unsupported()
    }

    fn free_keyshare(&self, _: Handle) -> Result<()> {
        Ok(())
    }
}
