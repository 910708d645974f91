//! Operation entry points
//!
//! [`MpcService`] bundles what every operation needs: the relay, the
//! keyshare store, one signing scheme per key type and the deadlines.

use crate::config::Timeouts;
use crate::engine::{KeyshareHandle, SigningScheme};
use crate::mpc::Relay;
use crate::pump::PumpTimings;
use crate::retry::RetryPolicy;
use crate::session::SessionContext;
use crate::store::KeyshareStore;
use crate::types::{
    KeyOutcome, KeyType, KeygenRequest, KeysignRequest, KeysignResponse, MigrateRequest,
    ReshareRequest, VaultRecord,
};
use crate::{keygen, migrate, reshare, sign, Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MpcService<R: Relay + ?Sized> {
    relay: Arc<R>,
    store: Arc<dyn KeyshareStore>,
    ecdsa: Arc<dyn SigningScheme>,
    eddsa: Arc<dyn SigningScheme>,
    timeouts: Timeouts,
}

impl<R: Relay + ?Sized + 'static> MpcService<R> {
    pub fn new(
        relay: Arc<R>,
        store: Arc<dyn KeyshareStore>,
        ecdsa: Arc<dyn SigningScheme>,
        eddsa: Arc<dyn SigningScheme>,
    ) -> Result<Self> {
        if ecdsa.key_type() != KeyType::Ecdsa || eddsa.key_type() != KeyType::Eddsa {
            return Err(Error::InvalidConfig(format!(
                "signing schemes are {}/{}, expected ecdsa/eddsa",
                ecdsa.key_type(),
                eddsa.key_type()
            )));
        }
        Ok(Self {
            relay,
            store,
            ecdsa,
            eddsa,
            timeouts: Timeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Generate a fresh ECDSA and EdDSA key pair for the committee
    pub async fn keygen(&self, request: &KeygenRequest) -> Result<VaultRecord> {
        keygen::run_keygen(self, request).await
    }

    /// Sign every message of the request, keyed by message
    pub async fn keysign(&self, request: &KeysignRequest) -> Result<BTreeMap<String, KeysignResponse>> {
        sign::run_keysign(self, request).await
    }

    /// Move both keys to a new committee
    pub async fn reshare(&self, request: &ReshareRequest) -> Result<VaultRecord> {
        reshare::run_reshare(self, request).await
    }

    /// Turn legacy secret shares into engine keyshares
    pub async fn migrate(&self, request: &MigrateRequest) -> Result<VaultRecord> {
        migrate::run_migrate(self, request).await
    }

    pub(crate) fn relay_handle(&self) -> Arc<R> {
        self.relay.clone()
    }

    pub(crate) fn scheme(&self, key_type: KeyType) -> Arc<dyn SigningScheme> {
        match key_type {
            KeyType::Ecdsa => self.ecdsa.clone(),
            KeyType::Eddsa => self.eddsa.clone(),
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.timeouts)
    }

    pub(crate) fn pump_timings(&self) -> PumpTimings {
        PumpTimings::from(&self.timeouts)
    }

    /// Load the stored keyshare of `public_key` into the engine
    pub(crate) async fn load_keyshare(&self, key_type: KeyType, public_key: &str) -> Result<KeyshareHandle> {
        let encoded = self.store.get_local_state(public_key).await?;
        let bytes = STANDARD.decode(encoded)?;
        KeyshareHandle::from_bytes(self.scheme(key_type), &bytes)
    }

    /// Persist a finished keyshare under its public key
    pub(crate) async fn save_keyshare(&self, key_type: KeyType, keyshare: KeyshareHandle) -> Result<KeyOutcome> {
        let public_key = hex::encode(keyshare.public_key()?);
        let encoded = STANDARD.encode(keyshare.to_bytes()?);
        let chain_code = match key_type {
            KeyType::Ecdsa => Some(hex::encode(keyshare.chain_code()?)),
            KeyType::Eddsa => None,
        };

        self.store.save_local_state(&public_key, &encoded).await?;
        info!(%key_type, public_key = %public_key, "Keyshare saved");

        Ok(KeyOutcome {
            key_type,
            public_key,
            keyshare: encoded,
            chain_code,
        })
    }

    /// Mark the local party done with the session; failures are logged only
    pub(crate) async fn mark_complete(&self, ctx: &SessionContext) {
        if let Err(e) = self
            .relay
            .complete_session(&ctx.session_id, &ctx.local_party)
            .await
        {
            warn!(session_id = %ctx.session_id, error = %e, "Failed to mark session complete");
        }
    }

    /// Mark the session complete and wait for the others; failures are logged only
    pub(crate) async fn complete_session(&self, ctx: &SessionContext) {
        self.mark_complete(ctx).await;

        match self
            .relay
            .check_completed_parties(
                &ctx.session_id,
                &ctx.committee,
                self.timeouts.completion_wait(),
                self.timeouts.relay_poll(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(session_id = %ctx.session_id, "Not every party completed the session"),
            Err(e) => warn!(session_id = %ctx.session_id, error = %e, "Failed to check completed parties"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;
    use crate::engine::local::LocalEngine;
    use crate::mpc::MemoryRelay;
    use crate::store::MemoryKeyshareStore;
    use tokio::time::Instant;

    #[test]
    fn test_rejects_swapped_schemes() {
        let relay = Arc::new(MemoryRelay::new());
        let result = MpcService::new(
            relay,
            Arc::new(MemoryKeyshareStore::new()),
            Arc::new(LocalEngine::new(KeyType::Eddsa)),
            Arc::new(LocalEngine::new(KeyType::Ecdsa)),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_keyshare_store_round_trip() {
        let relay = Arc::new(MemoryRelay::new());
        let party = Party::new("a", &relay);
        let dealt = LocalEngine::deal(KeyType::Ecdsa, &parties(&["a", "b"])).unwrap();

        let keyshare = KeyshareHandle::from_bytes(party.ecdsa.clone(), &dealt[0]).unwrap();
        let outcome = party.service.save_keyshare(KeyType::Ecdsa, keyshare).await.unwrap();
        assert_eq!(outcome.chain_code.as_ref().map(String::len), Some(64));

        let loaded = party
            .service
            .load_keyshare(KeyType::Ecdsa, &outcome.public_key)
            .await
            .unwrap();
        assert_eq!(hex::encode(loaded.public_key().unwrap()), outcome.public_key);
        drop(loaded);
        party.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_is_best_effort() {
        let relay = Arc::new(MemoryRelay::new());
        let party = Party::new("a", &relay);
        let ctx = SessionContext::new("unknown", "a", &parties(&["a", "b"]), true, SESSION_KEY).unwrap();

        // neither call can succeed for a session the relay never saw
        party.service.complete_session(&ctx).await;
        assert!(relay.completed_parties("unknown").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_complete_does_not_wait_for_peers() {
        let relay = Arc::new(MemoryRelay::new());
        let party = Party::new("a", &relay);
        relay.register_session("s1", "a").await.unwrap();
        relay.register_session("s1", "b").await.unwrap();
        let ctx = SessionContext::new("s1", "a", &parties(&["a", "b"]), true, SESSION_KEY).unwrap();

        let started = Instant::now();
        party.service.mark_complete(&ctx).await;
        assert!(started.elapsed() < party.service.timeouts().relay_poll());
        assert_eq!(relay.completed_parties("s1").await.unwrap(), parties(&["a"]));

        // b never completes, so the full completion waits out its deadline
        let started = Instant::now();
        party.service.complete_session(&ctx).await;
        assert!(started.elapsed() >= party.service.timeouts().completion_wait());
    }
}
