//! Inbound message filtering and application

use crate::codec::{content_hash, TransportCodec};
use crate::engine::{SessionHandle, SessionOutput};
use crate::mpc::Relay;
use crate::Result;
use msg_relay::ProtocolMessage;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Per-pump record of applied messages
pub(crate) struct Inbox {
    session_id: String,
    local_party: String,
    tag: String,
    seen: HashSet<String>,
}

impl Inbox {
    pub(crate) fn new(session_id: &str, local_party: &str, tag: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            local_party: local_party.to_string(),
            tag: tag.to_string(),
            seen: HashSet::new(),
        }
    }

    fn dedup_key(&self, hash: &str) -> String {
        if self.tag.is_empty() {
            format!("{}-{}-{}", self.session_id, self.local_party, hash)
        } else {
            format!("{}-{}-{}-{}", self.session_id, self.local_party, self.tag, hash)
        }
    }

    /// Dedup key of a message, from the digest of its body rather than the
    /// sender supplied `hash`
    fn message_key(&self, message: &ProtocolMessage) -> String {
        self.dedup_key(&content_hash(&message.body))
    }

    pub(crate) fn is_seen(&self, message: &ProtocolMessage) -> bool {
        self.seen.contains(&self.message_key(message))
    }

    /// Messages still to apply, in sequence order
    pub(crate) fn pending(&self, mut batch: Vec<ProtocolMessage>) -> Vec<ProtocolMessage> {
        batch.retain(|m| m.from != self.local_party && !self.is_seen(m));
        batch.sort_by_key(|m| m.sequence_no);
        batch
    }

    /// Apply one downloaded batch.
    ///
    /// Returns the session output once the engine reports the protocol
    /// finished. Undecryptable messages are dropped; messages the engine
    /// rejects stay on the relay and are offered again on the next poll.
    pub(crate) async fn apply<R: Relay + ?Sized>(
        &mut self,
        relay: &R,
        codec: &TransportCodec,
        session: &SessionHandle,
        batch: Vec<ProtocolMessage>,
    ) -> Result<Option<SessionOutput>> {
        for message in self.pending(batch) {
            // duplicates inside one batch
            if self.is_seen(&message) {
                continue;
            }
            if content_hash(&message.body) != message.hash {
                warn!(from = %message.from, hash = %message.hash, "Message hash does not match its body");
            }

            let raw = match codec.open(&message.body) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(from = %message.from, hash = %message.hash, error = %e, "Dropping undecryptable message");
                    self.seen.insert(self.message_key(&message));
                    self.acknowledge(relay, &message).await;
                    continue;
                }
            };

            match session.input_message(&raw) {
                Ok(finished) => {
                    self.seen.insert(self.message_key(&message));
                    self.acknowledge(relay, &message).await;
                    debug!(from = %message.from, sequence_no = message.sequence_no, finished, "Message applied");
                    if finished {
                        return session.finish().map(Some);
                    }
                }
                Err(e) => {
                    warn!(from = %message.from, sequence_no = message.sequence_no, error = %e, "Engine rejected message");
                }
            }
        }
        Ok(None)
    }

    async fn acknowledge<R: Relay + ?Sized>(&self, relay: &R, message: &ProtocolMessage) {
        if let Err(e) = relay
            .delete_message(&self.session_id, &self.local_party, &message.hash, &self.tag)
            .await
        {
            warn!(hash = %message.hash, error = %e, "Failed to delete message from relay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::RecordingScheme;
    use crate::mpc::MemoryRelay;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn sealed(codec: &TransportCodec, from: &str, raw: &[u8], sequence_no: u64) -> ProtocolMessage {
        ProtocolMessage::new("s1", from, "b", codec.seal(raw).unwrap(), sequence_no)
    }

    #[test]
    fn test_pending_filters_and_orders() {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let inbox = Inbox::new("s1", "b", "");
        let batch = vec![
            sealed(&codec, "a", b"3", 3),
            sealed(&codec, "b", b"self", 0),
            sealed(&codec, "a", b"1", 1),
            sealed(&codec, "c", b"2", 2),
        ];

        let order: Vec<u64> = inbox.pending(batch).iter().map(|m| m.sequence_no).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_dedup_key_includes_tag() {
        assert_eq!(Inbox::new("s1", "b", "").dedup_key("h"), "s1-b-h");
        assert_eq!(Inbox::new("s1", "b", "eddsa").dedup_key("h"), "s1-b-eddsa-h");
    }

    #[tokio::test]
    async fn test_redelivery_applied_once() {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let relay = MemoryRelay::new();
        relay.fail_deletes(true);
        let scheme = Arc::new(RecordingScheme::new(10));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        let mut inbox = Inbox::new("s1", "b", "");

        let message = sealed(&codec, "a", b"round-1", 0);
        let first = inbox
            .apply(&relay, &codec, &session, vec![message.clone(), message.clone()])
            .await
            .unwrap();
        let second = inbox
            .apply(&relay, &codec, &session, vec![message])
            .await
            .unwrap();

        assert!(first.is_none() && second.is_none());
        assert_eq!(scheme.inputs(), vec![b"round-1".to_vec()]);
    }

    #[tokio::test]
    async fn test_relabelled_copy_applied_once() {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let relay = MemoryRelay::new();
        let scheme = Arc::new(RecordingScheme::new(10));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        let mut inbox = Inbox::new("s1", "b", "");

        let message = sealed(&codec, "a", b"round-1", 0);
        let mut relabelled = message.clone();
        relabelled.hash = "00ff".into();
        relabelled.sequence_no = 1;

        inbox
            .apply(&relay, &codec, &session, vec![message.clone()])
            .await
            .unwrap();
        inbox
            .apply(&relay, &codec, &session, vec![relabelled.clone()])
            .await
            .unwrap();

        assert_eq!(scheme.inputs(), vec![b"round-1".to_vec()]);
        assert!(inbox.is_seen(&relabelled));
    }

    #[tokio::test]
    async fn test_undecryptable_message_dropped() {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let foreign = TransportCodec::from_hex_key("ef01").unwrap();
        let relay = MemoryRelay::new();
        let scheme = Arc::new(RecordingScheme::new(1));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        let mut inbox = Inbox::new("s1", "b", "");

        let bad = sealed(&foreign, "a", b"foreign", 0);
        let good = sealed(&codec, "a", b"ours", 1);
        relay.send_message(&bad, "").await.unwrap();
        relay.send_message(&good, "").await.unwrap();

        let output = inbox
            .apply(&relay, &codec, &session, vec![bad.clone(), good])
            .await
            .unwrap();

        assert!(matches!(output, Some(SessionOutput::Signature(_))));
        assert_eq!(scheme.inputs(), vec![b"ours".to_vec()]);
        assert!(inbox.is_seen(&bad));
        assert!(relay.download_messages("s1", "b", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_message_is_retried() {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let relay = MemoryRelay::new();
        let scheme = Arc::new(RecordingScheme::new(1));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        let mut inbox = Inbox::new("s1", "b", "");

        let rejected = sealed(&codec, "a", b"bad-round", 0);
        relay.send_message(&rejected, "").await.unwrap();

        let output = inbox
            .apply(&relay, &codec, &session, vec![rejected.clone()])
            .await
            .unwrap();

        assert!(output.is_none());
        assert!(!inbox.is_seen(&rejected));
        assert_eq!(relay.download_messages("s1", "b", "").await.unwrap().len(), 1);
        drop(session);
        assert_eq!(scheme.freed.load(Ordering::SeqCst), 1);
    }
}
