//! Message pump
//!
//! Drives one engine session to completion over the relay with two tasks:
//! the outbound task ships whatever the engine emits to each recipient, the
//! inbound task polls the local mailbox and feeds the engine until it
//! reports the protocol finished. Both observe a shared finished flag; the
//! session handle is released only after both tasks have returned.

mod inbox;

use crate::codec::TransportCodec;
use crate::config::Timeouts;
use crate::engine::{SessionHandle, SessionOutput};
use crate::mpc::{Messenger, Relay};
use crate::{Error, Result};
use futures_util::future::join;
use inbox::Inbox;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

/// Intervals and bounds of one pump run
#[derive(Debug, Clone, Copy)]
pub struct PumpTimings {
    pub inbound_timeout: Duration,
    pub inbound_poll: Duration,
    pub outbound_idle: Duration,
}

impl From<&Timeouts> for PumpTimings {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            inbound_timeout: timeouts.inbound_timeout(),
            inbound_poll: timeouts.inbound_poll(),
            outbound_idle: timeouts.outbound_idle(),
        }
    }
}

struct PumpContext<R: Relay + ?Sized> {
    relay: Arc<R>,
    codec: TransportCodec,
    session_id: String,
    local_party: String,
    committee: Vec<String>,
    tag: String,
    timings: PumpTimings,
}

/// Sets the finished flag when dropped, on every exit path of the inbound task
struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Two-task message exchange for one engine session
pub struct MessagePump<R: Relay + ?Sized> {
    ctx: Arc<PumpContext<R>>,
}

impl<R: Relay + ?Sized + 'static> MessagePump<R> {
    pub fn new(
        relay: Arc<R>,
        codec: TransportCodec,
        session_id: &str,
        local_party: &str,
        committee: &[String],
        tag: &str,
        timings: PumpTimings,
    ) -> Self {
        Self {
            ctx: Arc::new(PumpContext {
                relay,
                codec,
                session_id: session_id.to_string(),
                local_party: local_party.to_string(),
                committee: committee.to_vec(),
                tag: tag.to_string(),
                timings,
            }),
        }
    }

    /// Run the session until the engine finishes or the inbound bound expires
    #[instrument(skip_all, fields(session_id = %self.ctx.session_id, party = %self.ctx.local_party, tag = %self.ctx.tag))]
    pub async fn run(&self, session: SessionHandle) -> Result<SessionOutput> {
        let session = Arc::new(session);
        let finished = Arc::new(AtomicBool::new(false));

        let outbound = tokio::spawn(outbound_loop(self.ctx.clone(), session.clone(), finished.clone()));
        let inbound = tokio::spawn(bounded_inbound(self.ctx.clone(), session.clone(), finished));

        let (inbound, outbound) = join(inbound, outbound).await;
        if let Err(e) = outbound {
            error!(error = %e, "Outbound task failed");
        }
        let output = inbound.map_err(|e| Error::Internal(format!("inbound task failed: {}", e)))?;

        if output.is_ok() {
            info!("Protocol finished");
        }
        output
    }
}

async fn outbound_loop<R: Relay + ?Sized>(
    ctx: Arc<PumpContext<R>>,
    session: Arc<SessionHandle>,
    finished: Arc<AtomicBool>,
) {
    let messenger = Messenger::new(ctx.relay.clone(), &ctx.session_id, &ctx.local_party, &ctx.tag);

    loop {
        let message = match session.output_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to read outbound message");
                None
            }
        };

        let Some(message) = message else {
            if finished.load(Ordering::SeqCst) {
                break;
            }
            sleep(ctx.timings.outbound_idle).await;
            continue;
        };

        let body = match ctx.codec.seal(&message) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to seal outbound message");
                continue;
            }
        };

        for index in 0..ctx.committee.len() {
            let receiver = match session.message_receiver(&message, index) {
                Ok(Some(receiver)) => receiver,
                Ok(None) => break,
                Err(e) => {
                    warn!(index, error = %e, "Failed to resolve message receiver");
                    break;
                }
            };
            if let Err(e) = messenger.send(&receiver, body.clone()).await {
                warn!(to = %receiver, error = %e, "Failed to send message");
            }
        }
    }

    debug!("Outbound task finished");
}

async fn bounded_inbound<R: Relay + ?Sized>(
    ctx: Arc<PumpContext<R>>,
    session: Arc<SessionHandle>,
    finished: Arc<AtomicBool>,
) -> Result<SessionOutput> {
    let limit = ctx.timings.inbound_timeout;
    match timeout(limit, inbound_loop(ctx.clone(), session, finished)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(session_id = %ctx.session_id, ?limit, "Inbound messages timed out");
            Err(Error::ProtocolTimeout {
                session_id: ctx.session_id.clone(),
            })
        }
    }
}

async fn inbound_loop<R: Relay + ?Sized>(
    ctx: Arc<PumpContext<R>>,
    session: Arc<SessionHandle>,
    finished: Arc<AtomicBool>,
) -> Result<SessionOutput> {
    let _guard = FinishGuard(finished);
    let mut inbox = Inbox::new(&ctx.session_id, &ctx.local_party, &ctx.tag);

    loop {
        match ctx
            .relay
            .download_messages(&ctx.session_id, &ctx.local_party, &ctx.tag)
            .await
        {
            Ok(batch) if !batch.is_empty() => {
                if let Some(output) = inbox.apply(&*ctx.relay, &ctx.codec, &session, batch).await? {
                    return Ok(output);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to download messages"),
        }
        sleep(ctx.timings.inbound_poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::RecordingScheme;
    use crate::mpc::MemoryRelay;
    use msg_relay::ProtocolMessage;
    use tokio::time::Instant;

    fn timings() -> PumpTimings {
        PumpTimings::from(&Timeouts::default())
    }

    fn pump(relay: Arc<MemoryRelay>, committee: &[&str]) -> MessagePump<MemoryRelay> {
        let committee: Vec<String> = committee.iter().map(|p| p.to_string()).collect();
        MessagePump::new(
            relay,
            TransportCodec::from_hex_key("abcd").unwrap(),
            "s1",
            "b",
            &committee,
            "",
            timings(),
        )
    }

    async fn deliver(relay: &MemoryRelay, from: &str, raw: &[u8], sequence_no: u64) {
        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let message = ProtocolMessage::new("s1", from, "b", codec.seal(raw).unwrap(), sequence_no);
        relay.send_message(&message, "").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_in_sequence_order() {
        let relay = Arc::new(MemoryRelay::new());
        deliver(&relay, "a", b"third", 3).await;
        deliver(&relay, "a", b"first", 1).await;
        deliver(&relay, "a", b"second", 2).await;

        let scheme = Arc::new(RecordingScheme::new(3));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        let output = pump(relay.clone(), &["a", "b"]).run(session).await.unwrap();

        assert!(matches!(output, SessionOutput::Signature(_)));
        assert_eq!(
            scheme.inputs(),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert!(relay.download_messages("s1", "b", "").await.unwrap().is_empty());
        assert_eq!(scheme.freed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_messages_never_applied() {
        let relay = Arc::new(MemoryRelay::new());
        deliver(&relay, "b", b"echo", 0).await;
        deliver(&relay, "a", b"peer", 5).await;

        let scheme = Arc::new(RecordingScheme::new(1));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();
        pump(relay, &["a", "b"]).run(session).await.unwrap();

        assert_eq!(scheme.inputs(), vec![b"peer".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_fans_out_to_receivers() {
        let relay = Arc::new(MemoryRelay::new());
        let scheme = Arc::new(
            RecordingScheme::new(1).with_outbound(vec![b"r1".to_vec(), b"r2".to_vec()], &["a", "c"]),
        );
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();

        let sender = relay.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            deliver(&sender, "a", b"reply", 0).await;
        });
        pump(relay.clone(), &["a", "b", "c"]).run(session).await.unwrap();

        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let to_a = relay.download_messages("s1", "a", "").await.unwrap();
        let to_c = relay.download_messages("s1", "c", "").await.unwrap();
        assert_eq!(to_a.len(), 2);
        assert_eq!(to_c.len(), 2);
        assert_eq!(codec.open(&to_a[0].body).unwrap(), b"r1");
        assert_eq!(codec.open(&to_c[1].body).unwrap(), b"r2");

        let mut numbers: Vec<u64> = to_a.iter().chain(&to_c).map(|m| m.sequence_no).collect();
        numbers.sort();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(scheme.pending_outbound(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_stop_the_pump() {
        let relay = Arc::new(MemoryRelay::new());
        relay.drop_sends(true);
        let scheme = Arc::new(RecordingScheme::new(1).with_outbound(vec![b"r1".to_vec()], &["a"]));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();

        let codec = TransportCodec::from_hex_key("abcd").unwrap();
        let message = ProtocolMessage::new("s1", "a", "b", codec.seal(b"reply").unwrap(), 0);
        relay.store().put_message(message, "").unwrap();

        let output = pump(relay.clone(), &["a", "b"]).run(session).await;
        assert!(output.is_ok());
        assert_eq!(relay.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_timeout() {
        let relay = Arc::new(MemoryRelay::new());
        let scheme = Arc::new(RecordingScheme::new(1).with_outbound(vec![b"r1".to_vec()], &["a"]));
        let session = SessionHandle::keygen(scheme.clone(), b"", "b").unwrap();

        let started = Instant::now();
        let err = pump(relay.clone(), &["a", "b"]).run(session).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::ProtocolTimeout { .. }));
        assert!(elapsed >= Duration::from_secs(60), "returned early: {:?}", elapsed);
        // outbound notices the flag within one idle interval
        assert!(elapsed <= Duration::from_secs(60) + Duration::from_millis(200), "{:?}", elapsed);
        assert_eq!(relay.sent(), 1);
        assert_eq!(scheme.freed.load(Ordering::SeqCst), 1);
    }
}
