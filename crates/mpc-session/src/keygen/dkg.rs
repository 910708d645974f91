//! Keygen operation

use crate::engine::SessionHandle;
use crate::mpc::Relay;
use crate::retry::with_retry;
use crate::service::MpcService;
use crate::session::{OperationState, OperationTracker, SessionContext};
use crate::types::{committee_bytes, signing_threshold, KeyOutcome, KeyType, KeygenRequest, VaultRecord};
use crate::Result;
use tracing::{debug, info, instrument};

/// Run distributed key generation for both key types
#[instrument(skip(service, request), fields(session_id = %request.session_id, party = %request.local_party_id))]
pub async fn run_keygen<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &KeygenRequest,
) -> Result<VaultRecord> {
    request.validate()?;
    let tracker = OperationTracker::new("keygen", &request.session_id);
    let result = keygen(service, request, &tracker).await;
    tracker.finish(result)
}

async fn keygen<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &KeygenRequest,
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
        parties = ctx.committee.len(),
        threshold = signing_threshold(ctx.committee.len()),
        "Starting keygen"
    );
    let ecdsa = generate(service, &ctx, KeyType::Ecdsa, tracker).await?;
    let eddsa = generate(service, &ctx, KeyType::Eddsa, tracker).await?;

    service.complete_session(&ctx).await;
    info!(
        public_key_ecdsa = %ecdsa.public_key,
        public_key_eddsa = %eddsa.public_key,
        "Keygen complete"
    );
    Ok(VaultRecord::from_outcomes(
        &request.name,
        &request.local_party_id,
        ctx.committee.clone(),
        ecdsa,
        eddsa,
        "",
    ))
}

async fn generate<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    key_type: KeyType,
    tracker: &OperationTracker,
) -> Result<KeyOutcome> {
    let operation = format!("{} keygen", key_type);
    with_retry(service.retry_policy(), &operation, move |attempt| {
        keygen_attempt(service, ctx, key_type, tracker, attempt)
    })
    .await
}

async fn keygen_attempt<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    key_type: KeyType,
    tracker: &OperationTracker,
    attempt: u32,
) -> Result<KeyOutcome> {
    debug!(%key_type, attempt, "Keygen attempt");
    let scheme = service.scheme(key_type);
    let tag = key_type.setup_tag();
    let timeouts = service.timeouts();

    tracker.advance(OperationState::ExchangingSetup);
    let exchange = ctx.setup_exchange(service.relay(), tag);
    let setup = if ctx.is_leader {
        let threshold = signing_threshold(ctx.committee.len());
        let setup = scheme.keygen_setup(None, threshold, &committee_bytes(&ctx.committee))?;
        exchange.publish(&setup, &ctx.committee).await?;
        setup
    } else {
        exchange.fetch(timeouts.setup_wait(), timeouts.relay_poll()).await?
    };

    let session = SessionHandle::keygen(scheme, &setup, &ctx.local_party)?;
    tracker.advance(OperationState::Pumping);
    let output = ctx
        .message_pump(service.relay_handle(), tag, service.pump_timings())
        .run(session)
        .await?;

    tracker.advance(OperationState::Finalizing);
    service.save_keyshare(key_type, output.into_keyshare()?).await
}
