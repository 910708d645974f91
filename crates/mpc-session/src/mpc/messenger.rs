//! Outbound message construction

use super::Relay;
use crate::Result;
use msg_relay::ProtocolMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Sends sealed bodies from one party, numbering them in send order
pub struct Messenger<R: Relay + ?Sized> {
    relay: Arc<R>,
    session_id: String,
    from: String,
    tag: String,
    sequence: AtomicU64,
}

impl<R: Relay + ?Sized> Messenger<R> {
    pub fn new(relay: Arc<R>, session_id: &str, from: &str, tag: &str) -> Self {
        Self {
            relay,
            session_id: session_id.to_string(),
            from: from.to_string(),
            tag: tag.to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Send `body` to a single recipient
    pub async fn send(&self, to: &str, body: String) -> Result<()> {
        let sequence_no = self.sequence.fetch_add(1, Ordering::SeqCst);
        let message = ProtocolMessage::new(&self.session_id, &self.from, to, body, sequence_no);
        self.relay.send_message(&message, &self.tag).await?;
        debug!(
            session_id = %self.session_id,
            to,
            sequence_no,
            hash = %message.hash,
            "Message sent"
        );
        Ok(())
    }
}
