//! Session establishment and operation progress

use crate::codec::TransportCodec;
use crate::mpc::Relay;
use crate::pump::{MessagePump, PumpTimings};
use crate::setup::SetupExchange;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Progress of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    RegisteringSession,
    AwaitingCommittee,
    ExchangingSetup,
    Pumping,
    Finalizing,
    Completed,
    Failed,
}

/// Records state transitions of one operation and traces them.
///
/// Shared by reference across retry attempts.
#[derive(Debug)]
pub struct OperationTracker {
    operation: &'static str,
    session_id: String,
    history: Mutex<Vec<OperationState>>,
}

impl OperationTracker {
    pub fn new(operation: &'static str, session_id: &str) -> Self {
        Self {
            operation,
            session_id: session_id.to_string(),
            history: Mutex::new(vec![OperationState::Idle]),
        }
    }

    pub fn state(&self) -> OperationState {
        self.history()
            .last()
            .copied()
            .unwrap_or(OperationState::Idle)
    }

    /// Every state entered so far, oldest first
    pub fn history(&self) -> Vec<OperationState> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn advance(&self, next: OperationState) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let from = history.last().copied().unwrap_or(OperationState::Idle);
        debug!(
            operation = self.operation,
            session_id = %self.session_id,
            ?from,
            to = ?next,
            "Operation state changed"
        );
        history.push(next);
    }

    /// Record the final state of `result` and pass it through
    pub fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.advance(OperationState::Completed),
            Err(e) => {
                warn!(operation = self.operation, session_id = %self.session_id, error = %e, "Operation failed");
                self.advance(OperationState::Failed);
            }
        }
        result
    }
}

/// One party's view of a relay session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub local_party: String,
    /// Requested committee; replaced by the leader's announcement on followers
    pub committee: Vec<String>,
    pub is_leader: bool,
    codec: TransportCodec,
}

impl SessionContext {
    pub fn new(
        session_id: &str,
        local_party: &str,
        committee: &[String],
        is_leader: bool,
        hex_encryption_key: &str,
    ) -> Result<Self> {
        Ok(Self {
            session_id: session_id.to_string(),
            local_party: local_party.to_string(),
            committee: committee.to_vec(),
            is_leader,
            codec: TransportCodec::from_hex_key(hex_encryption_key)?,
        })
    }

    pub fn codec(&self) -> &TransportCodec {
        &self.codec
    }

    /// Register with the relay and agree on the committee.
    ///
    /// The leader waits until every requested member registered; followers
    /// wait for the leader to start the session and adopt its committee.
    /// Registration failures are fatal.
    #[instrument(skip(self, relay, tracker), fields(session_id = %self.session_id, party = %self.local_party, leader = self.is_leader))]
    pub async fn establish<R: Relay + ?Sized>(
        &mut self,
        relay: &R,
        start_deadline: Duration,
        poll: Duration,
        tracker: &OperationTracker,
    ) -> Result<()> {
        tracker.advance(OperationState::RegisteringSession);
        relay
            .register_session(&self.session_id, &self.local_party)
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;

        tracker.advance(OperationState::AwaitingCommittee);
        let committee = if self.is_leader {
            relay
                .wait_for_parties(&self.session_id, &self.committee, start_deadline, poll)
                .await?
        } else {
            relay
                .wait_for_session_start(&self.session_id, start_deadline, poll)
                .await?
        };

        if !committee.contains(&self.local_party) {
            return Err(Error::InvalidInput(format!(
                "party {} is not in the committee of session {}",
                self.local_party, self.session_id
            )));
        }
        debug!(committee = ?committee, "Committee agreed");
        self.committee = committee;
        Ok(())
    }

    pub fn setup_exchange<'a, R: Relay + ?Sized>(&'a self, relay: &'a R, tag: &'a str) -> SetupExchange<'a, R> {
        SetupExchange::new(relay, &self.codec, &self.session_id, tag)
    }

    pub fn message_pump<R: Relay + ?Sized + 'static>(
        &self,
        relay: Arc<R>,
        tag: &str,
        timings: PumpTimings,
    ) -> MessagePump<R> {
        MessagePump::new(
            relay,
            self.codec.clone(),
            &self.session_id,
            &self.local_party,
            &self.committee,
            tag,
            timings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryRelay;

    fn parties(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tracker_records_transitions() {
        let tracker = OperationTracker::new("keygen", "s1");
        tracker.advance(OperationState::RegisteringSession);
        let result: Result<()> = tracker.finish(Err(Error::Relay("down".into())));

        assert!(result.is_err());
        assert_eq!(tracker.state(), OperationState::Failed);
        assert_eq!(
            tracker.history(),
            vec![
                OperationState::Idle,
                OperationState::RegisteringSession,
                OperationState::Failed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_adopts_leader_committee() {
        let relay = Arc::new(MemoryRelay::new());
        let mut leader = SessionContext::new("s1", "a", &parties(&["a", "b"]), true, "abcd").unwrap();
        let mut follower = SessionContext::new("s1", "b", &parties(&["b"]), false, "abcd").unwrap();

        let leader_relay = relay.clone();
        let leader_task = tokio::spawn(async move {
            let tracker = OperationTracker::new("keygen", "s1");
            leader
                .establish(&*leader_relay, Duration::from_secs(10), Duration::from_secs(1), &tracker)
                .await
                .unwrap();
            leader_relay.start_session("s1", &leader.committee).await.unwrap();
        });

        let tracker = OperationTracker::new("keygen", "s1");
        follower
            .establish(&*relay, Duration::from_secs(10), Duration::from_secs(1), &tracker)
            .await
            .unwrap();
        leader_task.await.unwrap();

        assert_eq!(follower.committee, parties(&["a", "b"]));
        assert_eq!(tracker.state(), OperationState::AwaitingCommittee);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_times_out_without_parties() {
        let relay = MemoryRelay::new();
        let mut leader = SessionContext::new("s1", "a", &parties(&["a", "b"]), true, "abcd").unwrap();
        let tracker = OperationTracker::new("keygen", "s1");

        let err = leader
            .establish(&relay, Duration::from_secs(5), Duration::from_secs(1), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(relay.session_parties("s1").await.unwrap(), parties(&["a"]));
    }

    #[test]
    fn test_rejects_bad_key() {
        let err = SessionContext::new("s1", "a", &parties(&["a"]), true, "not-hex").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
