//! Session supervisor (C10): owns the mediator/CSP lifecycle, the two
//! pending-ack tables, readiness waiters, and reconnect backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use crate::errors::{DevlinkError, TimeoutKind};

/// Why a pending acknowledgement was released without actually arriving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClosedReason {
    /// The mediator or CSP session closed unexpectedly.
    SessionClosed,
    /// Host-level shutdown was requested.
    Shutdown,
}

impl std::fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionClosed => write!(f, "session closed before acknowledgement arrived"),
            Self::Shutdown => write!(f, "host shutdown before acknowledgement arrived"),
        }
    }
}

/// Outcome delivered to a pending waiter when its ack resolves or the
/// session tears down first.
pub type AckResult = Result<(), ClosedReason>;

/// The two pending-acknowledgement tables: reflection acks keyed by 32-bit
/// reflect id, and CSP outgoing-message acks keyed by
/// `(recipientIdentity, messageId)`.
#[derive(Default)]
struct PendingAcks {
    reflect: HashMap<u32, oneshot::Sender<AckResult>>,
    outgoing: HashMap<(String, u64), oneshot::Sender<AckResult>>,
}

/// Readiness state tracked for the two supervisor waiters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Readiness {
    is_leader: bool,
    csp_ready: bool,
}

/// Owns the session lifecycle: pending-ack bookkeeping, readiness signaling,
/// and reconnect backoff. Does not itself hold a mediator or CSP state
/// machine — those are driven by the caller's event loop, which reports
/// into this supervisor via [`Supervisor::register_reflect_ack`],
/// [`Supervisor::resolve_reflect_ack`], [`Supervisor::set_leader`],
/// [`Supervisor::set_csp_ready`], and [`Supervisor::teardown`].
pub struct Supervisor {
    pending: Mutex<PendingAcks>,
    readiness_tx: watch::Sender<Readiness>,
    readiness_rx: watch::Receiver<Readiness>,
    reflect_ack_timeout: Duration,
    outgoing_ack_timeout: Duration,
    reconnect_backoff: Duration,
}

impl Supervisor {
    /// Build a supervisor from the timeouts in [`crate::config::ClientConfig`].
    pub fn new(reflect_ack_timeout: Duration, outgoing_ack_timeout: Duration, reconnect_backoff: Duration) -> Self {
        let (tx, rx) = watch::channel(Readiness::default());
        Self {
            pending: Mutex::new(PendingAcks::default()),
            readiness_tx: tx,
            readiness_rx: rx,
            reflect_ack_timeout,
            outgoing_ack_timeout,
            reconnect_backoff,
        }
    }

    /// Register a reflect id as awaiting its ack, immediately. The returned
    /// receiver is armed before this call returns, so an ack racing the
    /// caller's socket write can never be lost.
    pub fn register_reflect_ack(&self, reflect_id: u32) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().reflect.insert(reflect_id, tx);
        rx
    }

    /// Await a previously registered reflect ack under the 15 s timeout.
    pub async fn wait_reflect_ack(&self, rx: oneshot::Receiver<AckResult>) -> Result<(), DevlinkError> {
        await_with_timeout(rx, self.reflect_ack_timeout, TimeoutKind::ReflectAck).await
    }

    /// [`Self::register_reflect_ack`] and [`Self::wait_reflect_ack`] in one
    /// step, for callers that have already sent their frames.
    pub async fn await_reflect_ack(&self, reflect_id: u32) -> Result<(), DevlinkError> {
        let rx = self.register_reflect_ack(reflect_id);
        self.wait_reflect_ack(rx).await
    }

    /// Resolve a previously registered reflect ack.
    pub fn resolve_reflect_ack(&self, reflect_id: u32) {
        if let Some(tx) = self.pending.lock().unwrap().reflect.remove(&reflect_id) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Register a CSP outgoing-message send as awaiting its ack, immediately.
    pub fn register_outgoing_ack(&self, recipient_identity: &str, message_id: u64) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().outgoing.insert((recipient_identity.to_string(), message_id), tx);
        rx
    }

    /// Await a previously registered outgoing ack under the 20 s timeout.
    pub async fn wait_outgoing_ack(&self, rx: oneshot::Receiver<AckResult>) -> Result<(), DevlinkError> {
        await_with_timeout(rx, self.outgoing_ack_timeout, TimeoutKind::OutgoingMessageAck).await
    }

    /// [`Self::register_outgoing_ack`] and [`Self::wait_outgoing_ack`] in
    /// one step.
    pub async fn await_outgoing_ack(&self, recipient_identity: &str, message_id: u64) -> Result<(), DevlinkError> {
        let rx = self.register_outgoing_ack(recipient_identity, message_id);
        self.wait_outgoing_ack(rx).await
    }

    /// Resolve a previously registered outgoing-message ack.
    pub fn resolve_outgoing_ack(&self, recipient_identity: &str, message_id: u64) {
        if let Some(tx) = self.pending.lock().unwrap().outgoing.remove(&(recipient_identity.to_string(), message_id)) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Release every pending ack with `reason` — called on any unexpected
    /// mediator/CSP close or host shutdown. Also clears leader/CSP
    /// readiness so new waiters block until the next successful handshake.
    pub fn teardown(&self, reason: ClosedReason) {
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.reflect.drain() {
            let _ = tx.send(Err(reason.clone()));
        }
        for (_, tx) in pending.outgoing.drain() {
            let _ = tx.send(Err(reason.clone()));
        }
        drop(pending);
        self.readiness_tx.send_modify(|r| *r = Readiness::default());
    }

    /// Update leader-promotion status.
    pub fn set_leader(&self, is_leader: bool) {
        self.readiness_tx.send_modify(|r| r.is_leader = is_leader);
    }

    /// Update CSP-ready status.
    pub fn set_csp_ready(&self, csp_ready: bool) {
        self.readiness_tx.send_modify(|r| r.csp_ready = csp_ready);
    }

    /// Resolve once this device is both mediator leader and has a ready CSP
    /// session, or fail once `timeout_ms` elapses.
    pub async fn wait_for_leader_and_csp(&self, timeout_ms: u64) -> Result<(), DevlinkError> {
        self.wait_for(timeout_ms, |r| r.is_leader && r.csp_ready).await
    }

    /// Resolve once the CSP session alone is ready, or fail once
    /// `timeout_ms` elapses.
    pub async fn wait_for_csp_ready(&self, timeout_ms: u64) -> Result<(), DevlinkError> {
        self.wait_for(timeout_ms, |r| r.csp_ready).await
    }

    async fn wait_for(&self, timeout_ms: u64, pred: impl Fn(&Readiness) -> bool) -> Result<(), DevlinkError> {
        let mut rx = self.readiness_rx.clone();
        if pred(&rx.borrow()) {
            return Ok(());
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if pred(&rx.borrow()) {
                    return;
                }
            }
        };
        timeout(Duration::from_millis(timeout_ms), wait)
            .await
            .map_err(|_| DevlinkError::Timeout(TimeoutKind::Readiness))
    }

    /// The configured reconnect backoff (~5 s by default).
    pub fn reconnect_backoff(&self) -> Duration { self.reconnect_backoff }

    /// Sleep for the configured reconnect backoff before the caller retries
    /// its dial loop.
    pub async fn wait_reconnect_backoff(&self) {
        tokio::time::sleep(self.reconnect_backoff).await;
    }
}

async fn await_with_timeout(
    rx: oneshot::Receiver<AckResult>,
    dur: Duration,
    kind: TimeoutKind,
) -> Result<(), DevlinkError> {
    match timeout(dur, rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(DevlinkError::Transport(reason.to_string())),
        Ok(Err(_canceled)) => Err(DevlinkError::Transport(ClosedReason::SessionClosed.to_string())),
        Err(_elapsed) => Err(DevlinkError::Timeout(kind)),
    }
}
