//! Legacy key migration
//!
//! Converts secret shares held outside the engine into engine keyshares of
//! the same public keys. Each key type runs a keygen-shaped session where
//! every party contributes its legacy share instead of fresh randomness.

use crate::engine::SessionHandle;
use crate::mpc::Relay;
use crate::retry::with_retry;
use crate::service::MpcService;
use crate::session::{OperationState, OperationTracker, SessionContext};
use crate::types::{
    committee_bytes, pad_legacy_share, signing_threshold, KeyOutcome, KeyType, MigrateRequest,
    VaultRecord,
};
use crate::{Error, Result};
use tokio::time::sleep;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

/// Migrate both legacy shares of a vault into engine keyshares
#[instrument(skip(service, request), fields(session_id = %request.session_id, party = %request.local_party_id))]
pub async fn run_migrate<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &MigrateRequest,
) -> Result<VaultRecord> {
    request.validate()?;
    let tracker = OperationTracker::new("migrate", &request.session_id);
    let result = migrate(service, request, &tracker).await;
    tracker.finish(result)
}

async fn migrate<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    request: &MigrateRequest,
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

    info!(parties = ctx.committee.len(), "Starting migration");
    let ecdsa = migrate_key(service, &ctx, request, KeyType::Ecdsa, tracker).await?;
    sleep(timeouts.key_type_pause()).await;
    let eddsa = migrate_key(service, &ctx, request, KeyType::Eddsa, tracker).await?;

    service.complete_session(&ctx).await;
    info!(
        public_key_ecdsa = %ecdsa.public_key,
        public_key_eddsa = %eddsa.public_key,
        "Migration complete"
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

async fn migrate_key<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    request: &MigrateRequest,
    key_type: KeyType,
    tracker: &OperationTracker,
) -> Result<KeyOutcome> {
    let operation = format!("{} migrate", key_type);
    with_retry(service.retry_policy(), &operation, move |attempt| {
        migrate_attempt(service, ctx, request, key_type, tracker, attempt)
    })
    .await
}

async fn migrate_attempt<R: Relay + ?Sized + 'static>(
    service: &MpcService<R>,
    ctx: &SessionContext,
    request: &MigrateRequest,
    key_type: KeyType,
    tracker: &OperationTracker,
    attempt: u32,
) -> Result<KeyOutcome> {
    debug!(%key_type, attempt, "Migrate attempt");
    let scheme = service.scheme(key_type);
    let tag = key_type.setup_tag();
    let timeouts = service.timeouts();

    let (public_key_hex, share) = request.material(key_type);
    let public_key = hex::decode(public_key_hex)
        .map_err(|e| Error::InvalidInput(format!("{} public key is not hex: {}", key_type, e)))?;
    let secret = Zeroizing::new(
        hex::decode(pad_legacy_share(share))
            .map_err(|e| Error::InvalidInput(format!("{} legacy share is not hex: {}", key_type, e)))?,
    );
    let chain_code = match key_type {
        KeyType::Ecdsa => hex::decode(&request.hex_chain_code)
            .map_err(|e| Error::InvalidInput(format!("chain code is not hex: {}", e)))?,
        KeyType::Eddsa => Vec::new(),
    };

    tracker.advance(OperationState::ExchangingSetup);
    let exchange = ctx.setup_exchange(service.relay(), tag);
    let setup = if ctx.is_leader {
        let threshold = signing_threshold(ctx.committee.len());
        let setup = scheme.keygen_setup(Some(&public_key), threshold, &committee_bytes(&ctx.committee))?;
        exchange.publish(&setup, &ctx.committee).await?;
        setup
    } else {
        exchange.fetch(timeouts.setup_wait(), timeouts.relay_poll()).await?
    };

    let session = SessionHandle::migrate(scheme, &setup, &ctx.local_party, &public_key, &chain_code, &secret)?;
    tracker.advance(OperationState::Pumping);
    let output = ctx
        .message_pump(service.relay_handle(), tag, service.pump_timings())
        .run(session)
        .await?;

    tracker.advance(OperationState::Finalizing);
    service.save_keyshare(key_type, output.into_keyshare()?).await
}
