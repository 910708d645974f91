//! Setup message exchange
//!
//! The leader builds the round-0 setup through the engine, uploads it sealed
//! under the session key and then announces the committee. Followers fetch
//! and open the same payload. Both sides end up with identical setup bytes.

use crate::codec::TransportCodec;
use crate::mpc::Relay;
use crate::Result;
use std::time::Duration;
use tracing::{debug, instrument};

pub struct SetupExchange<'a, R: Relay + ?Sized> {
    relay: &'a R,
    codec: &'a TransportCodec,
    session_id: &'a str,
    tag: &'a str,
}

impl<'a, R: Relay + ?Sized> SetupExchange<'a, R> {
    pub fn new(relay: &'a R, codec: &'a TransportCodec, session_id: &'a str, tag: &'a str) -> Self {
        Self {
            relay,
            codec,
            session_id,
            tag,
        }
    }

    /// Leader side: upload the setup, then start the session with `committee`
    #[instrument(skip(self, setup, committee), fields(session_id = %self.session_id, tag = %self.tag))]
    pub async fn publish(&self, setup: &[u8], committee: &[String]) -> Result<()> {
        let payload = self.codec.seal(setup)?;
        self.relay
            .upload_setup_message(self.session_id, self.tag, &payload)
            .await?;
        self.relay.start_session(self.session_id, committee).await?;
        debug!(parties = committee.len(), "Setup message published");
        Ok(())
    }

    /// Follower side: wait for the leader's setup and open it
    #[instrument(skip(self), fields(session_id = %self.session_id, tag = %self.tag))]
    pub async fn fetch(&self, deadline: Duration, poll: Duration) -> Result<Vec<u8>> {
        let payload = self
            .relay
            .wait_for_setup_message(self.session_id, self.tag, deadline, poll)
            .await?;
        let setup = self.codec.open(&payload)?;
        debug!(len = setup.len(), "Setup message received");
        Ok(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryRelay;
    use crate::Error;

    #[tokio::test(start_paused = true)]
    async fn test_leader_and_follower_agree() {
        let relay = MemoryRelay::new();
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let committee = vec!["a".to_string(), "b".to_string()];

        let leader = SetupExchange::new(&relay, &codec, "s1", "eddsa");
        leader.publish(b"setup-bytes", &committee).await.unwrap();
        assert_eq!(relay.started_parties("s1").await.unwrap(), committee);

        let follower = SetupExchange::new(&relay, &codec, "s1", "eddsa");
        let setup = follower
            .fetch(Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(setup, b"setup-bytes");

        // payloads are sealed on the relay
        let stored = relay.get_setup_message("s1", "eddsa").await.unwrap().unwrap();
        assert_ne!(stored.as_bytes(), b"setup-bytes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_times_out() {
        let relay = MemoryRelay::new();
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let follower = SetupExchange::new(&relay, &codec, "s1", "");

        let err = follower
            .fetch(Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_key_cannot_open() {
        let relay = MemoryRelay::new();
        let leader_codec = TransportCodec::from_hex_key("abcd").unwrap();
        let other_codec = TransportCodec::from_hex_key("abce").unwrap();

        SetupExchange::new(&relay, &leader_codec, "s1", "")
            .publish(b"setup", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let err = SetupExchange::new(&relay, &other_codec, "s1", "")
            .fetch(Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
