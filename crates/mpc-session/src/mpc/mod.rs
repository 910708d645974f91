//! MPC coordination utilities
//!
//! [`Relay`] mirrors the relay's HTTP surface one call per endpoint. The
//! provided methods layer the bounded polling waits on top, so every relay
//! implementation shares the same deadline behaviour.

use crate::{Error, Result};
use msg_relay::ProtocolMessage;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub use ::async_trait::async_trait;

/// Store-and-forward relay used for MPC communication
#[async_trait]
pub trait Relay: Send + Sync {
    /// Announce that `party_id` takes part in the session
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()>;

    /// Parties that registered so far
    async fn session_parties(&self, session_id: &str) -> Result<Vec<String>>;

    /// Leader: announce the final committee
    async fn start_session(&self, session_id: &str, parties: &[String]) -> Result<()>;

    /// Committee announced by the leader; empty before the start
    async fn started_parties(&self, session_id: &str) -> Result<Vec<String>>;

    async fn upload_setup_message(&self, session_id: &str, tag: &str, payload: &str) -> Result<()>;

    /// Sealed setup payload, `None` until the leader uploaded it
    async fn get_setup_message(&self, session_id: &str, tag: &str) -> Result<Option<String>>;

    async fn send_message(&self, message: &ProtocolMessage, tag: &str) -> Result<()>;

    /// Messages queued for `party_id`
    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        tag: &str,
    ) -> Result<Vec<ProtocolMessage>>;

    /// Acknowledge a consumed message
    async fn delete_message(&self, session_id: &str, party_id: &str, hash: &str, tag: &str) -> Result<()>;

    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()>;

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<String>>;

    async fn end_session(&self, session_id: &str) -> Result<()>;

    /// Poll until the leader started the session, returning the committee.
    ///
    /// Transport errors abort the wait.
    async fn wait_for_session_start(
        &self,
        session_id: &str,
        deadline: Duration,
        poll: Duration,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        loop {
            let parties = self.started_parties(session_id).await?;
            if parties.len() > 1 {
                info!(session_id, parties = ?parties, "Session started");
                return Ok(parties);
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(format!("session {} to start", session_id)));
            }
            debug!(session_id, "Waiting for session start");
            sleep(poll).await;
        }
    }

    /// Leader: poll until every committee member registered
    async fn wait_for_parties(
        &self,
        session_id: &str,
        committee: &[String],
        deadline: Duration,
        poll: Duration,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        loop {
            let joined = self.session_parties(session_id).await?;
            if committee.iter().all(|p| joined.contains(p)) {
                info!(session_id, parties = ?joined, "All parties joined");
                return Ok(committee.to_vec());
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(format!(
                    "parties to join session {} ({} of {} joined)",
                    session_id,
                    joined.len(),
                    committee.len()
                )));
            }
            debug!(session_id, joined = joined.len(), expected = committee.len(), "Waiting for parties");
            sleep(poll).await;
        }
    }

    /// Follower: poll until the setup payload for `tag` is available
    async fn wait_for_setup_message(
        &self,
        session_id: &str,
        tag: &str,
        deadline: Duration,
        poll: Duration,
    ) -> Result<String> {
        let started = Instant::now();
        loop {
            match self.get_setup_message(session_id, tag).await {
                Ok(Some(payload)) if !payload.is_empty() => return Ok(payload),
                Ok(_) => debug!(session_id, tag, "Setup message not uploaded yet"),
                Err(e) => warn!(session_id, tag, error = %e, "Failed to fetch setup message"),
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(format!("setup message of session {}", session_id)));
            }
            sleep(poll).await;
        }
    }

    /// Poll until every party in `parties` marked the session complete.
    ///
    /// Returns `false` when the deadline passes first.
    async fn check_completed_parties(
        &self,
        session_id: &str,
        parties: &[String],
        deadline: Duration,
        poll: Duration,
    ) -> Result<bool> {
        let started = Instant::now();
        loop {
            match self.completed_parties(session_id).await {
                Ok(completed) if parties.iter().all(|p| completed.contains(p)) => {
                    info!(session_id, "All parties completed");
                    return Ok(true);
                }
                Ok(completed) => debug!(session_id, completed = ?completed, "Waiting for parties to complete"),
                Err(e) => warn!(session_id, error = %e, "Failed to fetch completed parties"),
            }
            if started.elapsed() >= deadline {
                return Ok(false);
            }
            sleep(poll).await;
        }
    }
}

/// In-memory relay for testing
pub mod memory;
mod messenger;

pub use memory::MemoryRelay;
pub use messenger::Messenger;
