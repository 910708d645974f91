//! Keysign operation

use super::{signature_response, verify_signature};
use crate::codec::message_id;
use crate::engine::SessionHandle;
use crate::mpc::Relay;
use crate::retry::with_retry;
use crate::service::MpcService;
use crate::session::{OperationState, OperationTracker, SessionContext};
use crate::types::{committee_bytes, KeyType, KeysignRequest, KeysignResponse};
use crate::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, error, info, instrument};

/// Sign every message of `request`, returning the signatures keyed by message
#[instrument(skip(service, request), fields(session_id = %request.session_id, party = %request.local_party_id, key_type = %request.key_type))]
pub async fn run_keysign<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &KeysignRequest,
) -> Result<BTreeMap<String, KeysignResponse>> {
    request.validate()?;
    let tracker = OperationTracker::new("keysign", &request.session_id);
    let result = keysign(service, request, &tracker).await;
    tracker.finish(result)
}

async fn keysign<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &KeysignRequest,
    tracker: &OperationTracker,
) -> Result<BTreeMap<String, KeysignResponse>> {
    let timeouts = service.timeouts();
    let mut ctx = SessionContext::new(
        &request.session_id,
        &request.local_party_id,
        &request.parties,
        request.is_initiate_device,
        &request.hex_encryption_key,
    )?;
    ctx.establish(service.relay(), timeouts.keysign_start(), timeouts.relay_poll(), tracker)
        .await?;

    info!(messages = request.messages.len(), parties = ctx.committee.len(), "Starting keysign");
    let mut signatures = BTreeMap::new();
    for message in &request.messages {
        let ctx = &ctx;
        let response = with_retry(service.retry_policy(), "keysign", move |attempt| {
            sign_attempt(service, ctx, request, message, tracker, attempt)
        })
        .await?;
        signatures.insert(message.clone(), response);
    }

    service.mark_complete(&ctx).await;
    info!(signatures = signatures.len(), "Keysign complete");
    Ok(signatures)
}

async fn sign_attempt<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    request: &KeysignRequest,
    message: &str,
    tracker: &OperationTracker,
    attempt: u32,
) -> Result<KeysignResponse> {
    let key_type = request.key_type;
    let tag = message_id(message);
    debug!(message, tag = %tag, attempt, "Keysign attempt");

    let scheme = service.scheme(key_type);
    let keyshare = service.load_keyshare(key_type, &request.public_key).await?;
    let message_hash = hex::decode(message)
        .map_err(|e| Error::InvalidInput(format!("message {} is not hex: {}", message, e)))?;
    let chain_path = request.chain_path();
    let timeouts = service.timeouts();

    tracker.advance(OperationState::ExchangingSetup);
    let exchange = ctx.setup_exchange(service.relay(), &tag);
    let setup = if ctx.is_leader {
        let path = match key_type {
            KeyType::Ecdsa => Some(chain_path.as_str()),
            KeyType::Eddsa => None,
        };
        let setup = scheme.sign_setup(
            &keyshare.key_id()?,
            path,
            &message_hash,
            &committee_bytes(&ctx.committee),
        )?;
        exchange.publish(&setup, &ctx.committee).await?;
        setup
    } else {
        exchange.fetch(timeouts.setup_wait(), timeouts.relay_poll()).await?
    };

    let committed = scheme.decode_message_hash(&setup)?;
    if committed != message_hash {
        error!(message, setup_hash = %hex::encode(&committed), "Setup message does not commit to the message");
        return Err(Error::SetupMismatch {
            expected: message.to_string(),
            actual: hex::encode(committed),
        });
    }

    let session = SessionHandle::sign(scheme, &setup, &ctx.local_party, &keyshare)?;
    tracker.advance(OperationState::Pumping);
    let signature = ctx
        .message_pump(service.relay_handle(), &tag, service.pump_timings())
        .run(session)
        .await?
        .into_signature()?;

    tracker.advance(OperationState::Finalizing);
    let response = signature_response(key_type, message, &signature)?;
    verify_signature(key_type, &keyshare, &chain_path, &message_hash, &signature);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TransportCodec;
    use crate::engine::local::LocalEngine;
    use crate::engine::{KeyshareHandle, SigningScheme};
    use crate::mpc::MemoryRelay;
    use crate::service::fixture::*;
    use crate::store::KeyshareStore;
    use crate::types::VaultRecord;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;

    const PATH: &str = "m/44'/60'/0'/0/0";

    fn digest(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn keysign_request(
        party: &Party,
        vault: &VaultRecord,
        key_type: KeyType,
        session_id: &str,
        committee: &[String],
        messages: &[String],
        leader: bool,
    ) -> KeysignRequest {
        KeysignRequest {
            public_key: match key_type {
                KeyType::Ecdsa => vault.public_key_ecdsa.clone(),
                KeyType::Eddsa => vault.public_key_eddsa.clone(),
            },
            messages: messages.to_vec(),
            session_id: session_id.into(),
            hex_encryption_key: SESSION_KEY.into(),
            derive_path: PATH.into(),
            key_type,
            local_party_id: party.id.clone(),
            parties: committee.to_vec(),
            is_initiate_device: leader,
        }
    }

    async fn sign_all(
        members: &[Party],
        vaults: &[VaultRecord],
        key_type: KeyType,
        session_id: &str,
        messages: &[String],
    ) -> Vec<BTreeMap<String, KeysignResponse>> {
        let committee: Vec<String> = members.iter().map(|p| p.id.clone()).collect();
        let requests: Vec<KeysignRequest> = members
            .iter()
            .zip(vaults)
            .enumerate()
            .map(|(i, (p, v))| keysign_request(p, v, key_type, session_id, &committee, messages, i == 0))
            .collect();
        let runs = members
            .iter()
            .zip(&requests)
            .map(|(p, r)| p.service.keysign(r));
        futures_util::future::join_all(runs)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ecdsa_keysign_after_keygen() {
        let relay = Arc::new(MemoryRelay::new());
        let (members, vaults) = keygen_all(&relay, &["a", "b"], "kg").await;
        let messages = vec![digest(b"first"), digest(b"second")];

        let results = sign_all(&members, &vaults, KeyType::Ecdsa, "ks", &messages).await;
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].len(), 2);

        let stored = members[0]
            .store
            .get_local_state(&vaults[0].public_key_ecdsa)
            .await
            .unwrap();
        let keyshare =
            KeyshareHandle::from_bytes(members[0].ecdsa.clone(), &STANDARD.decode(stored).unwrap()).unwrap();
        let child = keyshare.derive_child_public_key("m/44/60/0/0/0").unwrap();
        let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&child).unwrap();

        for message in &messages {
            let response = &results[0][message];
            assert_eq!(&response.msg, message);
            assert_eq!(response.recovery_id.len(), 2);
            let signature =
                k256::ecdsa::Signature::from_der(&hex::decode(&response.der_signature).unwrap()).unwrap();
            verifying_key
                .verify_prehash(&hex::decode(message).unwrap(), &signature)
                .unwrap();
        }
        drop(keyshare);
        members.iter().for_each(Party::assert_released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eddsa_keysign_with_dealt_shares() {
        let relay = Arc::new(MemoryRelay::new());
        let members = vec![Party::new("a", &relay), Party::new("b", &relay)];
        let committee = parties(&["a", "b"]);
        let dealt = LocalEngine::deal(KeyType::Eddsa, &committee).unwrap();

        let mut vaults = Vec::new();
        for (party, bytes) in members.iter().zip(&dealt) {
            let keyshare = KeyshareHandle::from_bytes(party.eddsa.clone(), bytes).unwrap();
            let outcome = party.service.save_keyshare(KeyType::Eddsa, keyshare).await.unwrap();
            vaults.push(VaultRecord::from_outcomes(
                "vault",
                &party.id,
                committee.clone(),
                outcome.clone(),
                outcome,
                "",
            ));
        }

        let message = hex::encode(b"solana transaction");
        let results = sign_all(&members, &vaults, KeyType::Eddsa, "ks-ed", &[message.clone()]).await;
        let response = &results[0][&message];
        assert_eq!(response, &results[1][&message]);
        assert!(response.der_signature.is_empty());

        let public_key: [u8; 32] = hex::decode(&vaults[0].public_key_eddsa).unwrap().try_into().unwrap();
        let signature = hex::decode(format!("{}{}", response.r, response.s)).unwrap();
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key).unwrap();
        verifying_key
            .verify_strict(
                b"solana transaction",
                &ed25519_dalek::Signature::from_slice(&signature).unwrap(),
            )
            .unwrap();
        members.iter().for_each(Party::assert_released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_for_another_message_is_fatal() {
        let relay = Arc::new(MemoryRelay::new());
        let committee = parties(&["a", "b"]);
        let follower = Party::new("b", &relay);
        let dealt = LocalEngine::deal(KeyType::Ecdsa, &committee).unwrap();
        let keyshare = KeyshareHandle::from_bytes(follower.ecdsa.clone(), &dealt[1]).unwrap();
        let outcome = follower
            .service
            .save_keyshare(KeyType::Ecdsa, keyshare)
            .await
            .unwrap();

        // setup committing to a different digest, under the tag of the requested one
        let requested = digest(b"pay alice");
        let forged = {
            let loaded = KeyshareHandle::from_bytes(follower.ecdsa.clone(), &dealt[0]).unwrap();
            follower
                .ecdsa
                .sign_setup(
                    &loaded.key_id().unwrap(),
                    Some("m/44/60/0/0/0"),
                    &hex::decode(digest(b"pay mallory")).unwrap(),
                    &committee_bytes(&committee),
                )
                .unwrap()
        };
        stage_setup(&relay, "ks-forged", &committee, &message_id(&requested), &forged).await;

        let vault = VaultRecord::from_outcomes("vault", "b", committee.clone(), outcome.clone(), outcome, "");
        let request = keysign_request(
            &follower,
            &vault,
            KeyType::Ecdsa,
            "ks-forged",
            &committee,
            &[requested.clone()],
            false,
        );
        let err = follower.service.keysign(&request).await.unwrap_err();

        match err {
            Error::SetupMismatch { expected, actual } => {
                assert_eq!(expected, requested);
                assert_eq!(actual, digest(b"pay mallory"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(follower.ecdsa.session_attempts(), 0);
        assert_eq!(follower.ecdsa.keyshares_created(), follower.ecdsa.keyshares_freed());
        follower.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecryptable_setup_is_retried() {
        let relay = Arc::new(MemoryRelay::new());
        let committee = parties(&["a", "b"]);
        let follower = Party::new("b", &relay);
        let dealt = LocalEngine::deal(KeyType::Ecdsa, &committee).unwrap();
        let keyshare = KeyshareHandle::from_bytes(follower.ecdsa.clone(), &dealt[1]).unwrap();
        let outcome = follower
            .service
            .save_keyshare(KeyType::Ecdsa, keyshare)
            .await
            .unwrap();

        let message = digest(b"pay alice");
        let foreign = TransportCodec::from_hex_key("0badc0de").unwrap();
        relay.register_session("ks-foreign", "a").await.unwrap();
        relay
            .upload_setup_message("ks-foreign", &message_id(&message), &foreign.seal(b"setup").unwrap())
            .await
            .unwrap();
        relay.start_session("ks-foreign", &committee).await.unwrap();

        let vault = VaultRecord::from_outcomes("vault", "b", committee.clone(), outcome.clone(), outcome, "");
        let request = keysign_request(&follower, &vault, KeyType::Ecdsa, "ks-foreign", &committee, &[message], false);
        let err = follower.service.keysign(&request).await.unwrap_err();

        match err {
            Error::AttemptsExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Codec(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        follower.assert_released();
    }

    #[tokio::test]
    async fn test_missing_keyshare_fails_each_attempt() {
        let relay = Arc::new(MemoryRelay::new());
        let committee = parties(&["a", "b"]);
        let leader = Party::new("a", &relay);
        relay.register_session("ks-none", "b").await.unwrap();

        let request = KeysignRequest {
            public_key: "02aa".into(),
            messages: vec![digest(b"x")],
            session_id: "ks-none".into(),
            hex_encryption_key: SESSION_KEY.into(),
            derive_path: PATH.into(),
            key_type: KeyType::Ecdsa,
            local_party_id: "a".into(),
            parties: committee,
            is_initiate_device: true,
        };
        let err = leader.service.keysign(&request).await.unwrap_err();

        match err {
            Error::AttemptsExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Storage(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(relay.get_setup_message("ks-none", &message_id(&digest(b"x"))).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_stops_keysign() {
        let relay = Arc::new(MemoryRelay::new());
        relay.fail_registration(true);
        let follower = Party::new("b", &relay);

        let request = KeysignRequest {
            public_key: "02aa".into(),
            messages: vec![digest(b"x")],
            session_id: "ks-reg".into(),
            hex_encryption_key: SESSION_KEY.into(),
            derive_path: PATH.into(),
            key_type: KeyType::Ecdsa,
            local_party_id: "b".into(),
            parties: parties(&["a", "b"]),
            is_initiate_device: false,
        };
        let err = follower.service.keysign(&request).await.unwrap_err();

        assert!(matches!(err, Error::Registration(_)), "unexpected error: {:?}", err);
        assert_eq!(relay.registrations(), 1);
        assert_eq!(follower.ecdsa.session_attempts(), 0);
        assert_eq!(follower.ecdsa.keyshares_created(), 0);
    }
}
