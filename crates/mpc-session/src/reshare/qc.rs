//! Reshare operation

use crate::engine::{KeyshareHandle, SessionHandle, SigningScheme};
use crate::mpc::Relay;
use crate::retry::with_retry;
use crate::service::MpcService;
use crate::session::{OperationState, OperationTracker, SessionContext};
use crate::types::{
    committee_bytes, old_parties, party_indices, signing_threshold, KeyOutcome, KeyType,
    ReshareRequest, VaultRecord,
};
use crate::{Error, Result};
use tracing::{debug, info, instrument, warn};

/// Reshare both keys of a vault to `request.parties`
#[instrument(skip(service, request), fields(session_id = %request.session_id, party = %request.local_party_id))]
pub async fn run_reshare<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &ReshareRequest,
) -> Result<VaultRecord> {
    request.validate()?;
    if request.is_initiate_device && !request.is_old_signer() {
        return Err(Error::InvalidInput(format!(
            "leader {} does not hold a keyshare of the vault",
            request.local_party_id
        )));
    }
    let tracker = OperationTracker::new("reshare", &request.session_id);
    let result = reshare(service, request, &tracker).await;
    tracker.finish(result)
}

async fn reshare<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &ReshareRequest,
    tracker: &OperationTracker,
) -> Result<VaultRecord> {
    let timeouts = service.timeouts();
    let mut ctx = SessionContext::new(
        &request.session_id,
        &request.local_party_id,
        &request.parties,
        request.is_initiate_device,
        &request.hex_encryption_key,
    )?;
    ctx.establish(service.relay(), timeouts.session_start(), timeouts.relay_poll(), tracker)
        .await?;

    info!(
        old_signers = request.old_parties.len(),
        parties = ctx.committee.len(),
        old_signer = request.is_old_signer(),
        "Starting reshare"
    );
    let ecdsa = reshare_key(service, &ctx, request, KeyType::Ecdsa, tracker).await?;
    let eddsa = reshare_key(service, &ctx, request, KeyType::Eddsa, tracker).await?;

    service.complete_session(&ctx).await;
    info!(
        public_key_ecdsa = %ecdsa.public_key,
        public_key_eddsa = %eddsa.public_key,
        "Reshare complete"
    );
    Ok(VaultRecord::from_outcomes(
        &request.name,
        &request.local_party_id,
        ctx.committee.clone(),
        ecdsa,
        eddsa,
        &request.hex_chain_code,
    ))
}

async fn reshare_key<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    request: &ReshareRequest,
    key_type: KeyType,
    tracker: &OperationTracker,
) -> Result<KeyOutcome> {
    let operation = format!("{} reshare", key_type);
    with_retry(service.retry_policy(), &operation, move |attempt| {
        reshare_attempt(service, ctx, request, key_type, tracker, attempt)
    })
    .await
}

fn public_key(request: &ReshareRequest, key_type: KeyType) -> &str {
    match key_type {
        KeyType::Ecdsa => &request.public_key_ecdsa,
        KeyType::Eddsa => &request.public_key_eddsa,
    }
}

/// Reshare setup: old signers that stay, and the whole new committee, as
/// indices into the committee
fn build_setup(
    scheme: &dyn SigningScheme,
    keyshare: &KeyshareHandle,
    request: &ReshareRequest,
    committee: &[String],
) -> Result<Vec<u8>> {
    let old = old_parties(&request.old_parties, committee);
    if old.len() < request.old_parties.len() {
        warn!(
            old_signers = ?request.old_parties,
            remaining = ?old,
            "Old signers missing from the new committee"
        );
    }
    let old_indices = party_indices(committee, &old)?;
    let new_indices = party_indices(committee, committee)?;
    scheme.reshare_setup(
        keyshare.raw(),
        &committee_bytes(committee),
        &old_indices,
        signing_threshold(committee.len()),
        &new_indices,
    )
}

async fn reshare_attempt<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    request: &ReshareRequest,
    key_type: KeyType,
    tracker: &OperationTracker,
    attempt: u32,
) -> Result<KeyOutcome> {
    debug!(%key_type, attempt, "Reshare attempt");
    let scheme = service.scheme(key_type);
    let tag = key_type.setup_tag();
    let timeouts = service.timeouts();

    let keyshare = if request.is_old_signer() {
        Some(service.load_keyshare(key_type, public_key(request, key_type)).await?)
    } else {
        None
    };

    tracker.advance(OperationState::ExchangingSetup);
    let exchange = ctx.setup_exchange(service.relay(), tag);
    let setup = if ctx.is_leader {
        let keyshare = keyshare.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("leader {} has no keyshare to reshare", ctx.local_party))
        })?;
        let setup = build_setup(scheme.as_ref(), keyshare, request, &ctx.committee)?;
        exchange.publish(&setup, &ctx.committee).await?;
        setup
    } else {
        exchange.fetch(timeouts.setup_wait(), timeouts.relay_poll()).await?
    };

    let session = SessionHandle::reshare(scheme, &setup, &ctx.local_party, keyshare.as_ref())?;
    tracker.advance(OperationState::Pumping);
    let output = ctx
        .message_pump(service.relay_handle(), tag, service.pump_timings())
        .run(session)
        .await?;

    tracker.advance(OperationState::Finalizing);
    let outcome = service.save_keyshare(key_type, output.into_keyshare()?).await?;
    if outcome.public_key != public_key(request, key_type) {
        warn!(
            %key_type,
            expected = %public_key(request, key_type),
            actual = %outcome.public_key,
            "Reshare produced a different public key"
        );
    }
    Ok(outcome)
}
