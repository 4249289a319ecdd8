//! The outbound send flow.
//!
//! Two concerns live here: waiting for both acknowledgement planes of one
//! logical send (the mediator's reflect ack and the chat server's outgoing
//! ack, each under its own timeout), and the evolving-reply dispatcher that
//! serializes agent reply fragments so a later partial never overtakes an
//! in-flight edit.

use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};

use crate::dedupe::{EvolvingReplyKey, EvolvingReplyTable};
use crate::errors::DevlinkError;
use crate::message::{self, ChunkKind, EvolvingAction};
use crate::orchestrator::Outbound;
use crate::supervisor::{AckResult, Supervisor};

// ─── Awaiting both acks ───────────────────────────────────────────────────────

/// Which acknowledgement plane a send failed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendPlane {
    /// The mediator never acknowledged the reflection.
    Reflection,
    /// The chat server never acknowledged an outgoing container.
    ChatServer,
}

/// A failed send, carrying enough context to tell which plane and which
/// recipient went wrong.
#[derive(Debug)]
pub struct SendFailure {
    /// Which plane went unacknowledged.
    pub plane: SendPlane,
    /// The recipient whose ack failed; `None` for the reflection plane.
    pub recipient: Option<String>,
    /// The underlying timeout or teardown error.
    pub error: DevlinkError,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.plane, &self.recipient) {
            (SendPlane::Reflection, _) => write!(f, "reflection not acknowledged: {}", self.error),
            (SendPlane::ChatServer, Some(recipient)) => {
                write!(f, "outgoing message to {recipient} not acknowledged: {}", self.error)
            }
            (SendPlane::ChatServer, None) => write!(f, "outgoing message not acknowledged: {}", self.error),
        }
    }
}

impl std::error::Error for SendFailure {}

/// Armed ack receivers for one outbound send.
pub struct SendTracking {
    reflect: oneshot::Receiver<AckResult>,
    outgoing: Vec<(String, oneshot::Receiver<AckResult>)>,
}

/// Arm the pending-ack tables for `outbound` BEFORE its frames hit the
/// socket, so an ack racing the write can never be lost.
pub fn track_send(supervisor: &Supervisor, outbound: &Outbound) -> SendTracking {
    let reflect = supervisor.register_reflect_ack(outbound.reflect_id);
    let outgoing = outbound
        .recipients
        .iter()
        .map(|recipient| {
            let identity = String::from_utf8_lossy(recipient).trim_end_matches('\0').to_string();
            let rx = supervisor.register_outgoing_ack(&identity, outbound.message_id);
            (identity, rx)
        })
        .collect();
    SendTracking { reflect, outgoing }
}

/// A send is complete once the reflect ack and every recipient's outgoing
/// ack have arrived; otherwise the caller observes exactly which plane and
/// recipient failed.
pub async fn await_send_complete(supervisor: &Supervisor, tracking: SendTracking) -> Result<(), SendFailure> {
    supervisor
        .wait_reflect_ack(tracking.reflect)
        .await
        .map_err(|error| SendFailure { plane: SendPlane::Reflection, recipient: None, error })?;
    for (identity, rx) in tracking.outgoing {
        supervisor.wait_outgoing_ack(rx).await.map_err(|error| SendFailure {
            plane: SendPlane::ChatServer,
            recipient: Some(identity.clone()),
            error,
        })?;
    }
    Ok(())
}

// ─── Evolving-reply dispatcher ────────────────────────────────────────────────

/// One fragment from the agent-dispatch collaborator's reply stream.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyFragment {
    Partial(String),
    Block(String),
    Final(String),
}

impl ReplyFragment {
    fn kind(&self) -> ChunkKind {
        match self {
            Self::Partial(_) => ChunkKind::Partial,
            Self::Block(_) => ChunkKind::Block,
            Self::Final(_) => ChunkKind::Final,
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::Partial(text) | Self::Block(text) | Self::Final(text) => text,
        }
    }
}

/// The send half the dispatcher drives. Implemented by whatever owns the
/// session event loop; the dispatcher never touches a socket itself.
#[allow(async_fn_in_trait)]
pub trait ReplySender {
    /// Send a fresh group text, returning its message id (the anchor).
    async fn send_new_text(&mut self, text: &str) -> Result<u64, DevlinkError>;
    /// Edit the anchor message in place.
    async fn send_edit(&mut self, anchor_message_id: u64, text: &str) -> Result<(), DevlinkError>;
}

/// Serializes one reply stream into anchor/edit sends: fragments are pulled
/// one at a time and each send is awaited before the next fragment is even
/// looked at, so ordering is structural rather than locked.
pub struct ReplyDispatcher {
    key: EvolvingReplyKey,
    min_chars_delta: usize,
    min_interval: Duration,
}

impl ReplyDispatcher {
    /// Build a dispatcher for one `(account, chat, trigger)` stream.
    pub fn new(key: EvolvingReplyKey, min_chars_delta: usize, min_interval: Duration) -> Self {
        Self { key, min_chars_delta, min_interval }
    }

    /// Drain `fragments` to completion. An edit failure falls back to a
    /// fresh group text that becomes the new anchor and the stream
    /// continues; a failed fallback ends the stream with the error.
    pub async fn run<S: ReplySender>(
        self,
        table: &mut EvolvingReplyTable,
        mut fragments: mpsc::Receiver<ReplyFragment>,
        sender: &mut S,
    ) -> Result<(), DevlinkError> {
        while let Some(fragment) = fragments.recv().await {
            let is_final = matches!(fragment, ReplyFragment::Final(_));
            let now = SystemTime::now();
            let action = message::advance_evolving_reply(
                table,
                self.key.clone(),
                fragment.kind(),
                fragment.text(),
                self.min_chars_delta,
                self.min_interval,
                now,
            );
            match action {
                EvolvingAction::NewAnchor(text) => {
                    let anchor = sender.send_new_text(&text).await?;
                    message::record_anchor(table, self.key.clone(), anchor, text, now);
                }
                EvolvingAction::EditAnchor { anchor_message_id, text } => {
                    if let Err(e) = sender.send_edit(anchor_message_id, &text).await {
                        tracing::warn!(error = %e, anchor_message_id, "edit failed, re-anchoring with a fresh text");
                        let anchor = sender.send_new_text(&text).await?;
                        message::reanchor_after_edit_failure(table, self.key.clone(), anchor, text, now);
                    }
                }
                EvolvingAction::Coalesced | EvolvingAction::Skipped => {}
            }
            if is_final {
                table.remove(&self.key);
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(Duration::from_millis(50), Duration::from_millis(50), Duration::from_millis(10))
    }

    fn outbound(reflect_id: u32, message_id: u64, recipients: Vec<[u8; 8]>) -> Outbound {
        Outbound { reflect_id, message_id, recipients, frames: vec![] }
    }

    #[tokio::test]
    async fn send_completes_once_both_planes_ack() {
        let sup = supervisor();
        let out = outbound(7, 42, vec![*b"PEER0000"]);
        let tracking = track_send(&sup, &out);
        sup.resolve_reflect_ack(7);
        sup.resolve_outgoing_ack("PEER0000", 42);
        assert!(await_send_complete(&sup, tracking).await.is_ok());
    }

    #[tokio::test]
    async fn missing_reflect_ack_fails_on_the_reflection_plane() {
        let sup = supervisor();
        let out = outbound(7, 42, vec![]);
        let tracking = track_send(&sup, &out);
        let failure = await_send_complete(&sup, tracking).await.unwrap_err();
        assert_eq!(failure.plane, SendPlane::Reflection);
        assert!(failure.recipient.is_none());
    }

    #[tokio::test]
    async fn missing_outgoing_ack_names_the_recipient() {
        let sup = supervisor();
        let out = outbound(8, 43, vec![*b"PEER0000", *b"OTHER001"]);
        let tracking = track_send(&sup, &out);
        sup.resolve_reflect_ack(8);
        sup.resolve_outgoing_ack("PEER0000", 43);
        let failure = await_send_complete(&sup, tracking).await.unwrap_err();
        assert_eq!(failure.plane, SendPlane::ChatServer);
        assert_eq!(failure.recipient.as_deref(), Some("OTHER001"));
    }

    #[tokio::test]
    async fn group_fan_out_waits_for_every_recipient() {
        let sup = supervisor();
        let out = outbound(9, 44, vec![*b"MEMBER01", *b"MEMBER02"]);
        let tracking = track_send(&sup, &out);
        sup.resolve_reflect_ack(9);
        sup.resolve_outgoing_ack("MEMBER01", 44);
        sup.resolve_outgoing_ack("MEMBER02", 44);
        assert!(await_send_complete(&sup, tracking).await.is_ok());
    }

    // ─── Dispatcher ───────────────────────────────────────────────────────────

    #[derive(Debug, PartialEq, Eq)]
    enum Sent {
        NewText(String),
        Edit(u64, String),
    }

    struct RecordingSender {
        sent: Vec<Sent>,
        next_message_id: u64,
        fail_edits: bool,
    }

    impl RecordingSender {
        fn new() -> Self {
            Self { sent: Vec::new(), next_message_id: 100, fail_edits: false }
        }
    }

    impl ReplySender for RecordingSender {
        async fn send_new_text(&mut self, text: &str) -> Result<u64, DevlinkError> {
            let id = self.next_message_id;
            self.next_message_id += 1;
            self.sent.push(Sent::NewText(text.to_string()));
            Ok(id)
        }

        async fn send_edit(&mut self, anchor_message_id: u64, text: &str) -> Result<(), DevlinkError> {
            if self.fail_edits {
                return Err(DevlinkError::Transport("edit refused".into()));
            }
            self.sent.push(Sent::Edit(anchor_message_id, text.to_string()));
            Ok(())
        }
    }

    fn reply_key() -> EvolvingReplyKey {
        EvolvingReplyKey { account_id: "a".into(), chat_id: "c".into(), trigger_message_id: 1 }
    }

    #[tokio::test]
    async fn stream_produces_anchor_then_edits_in_order() {
        let mut table = EvolvingReplyTable::new();
        let mut sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(ReplyFragment::Partial("A".into())).await.unwrap();
        tx.send(ReplyFragment::Partial("AB".into())).await.unwrap();
        tx.send(ReplyFragment::Final("ABC".into())).await.unwrap();
        drop(tx);

        let dispatcher = ReplyDispatcher::new(reply_key(), 1, Duration::ZERO);
        dispatcher.run(&mut table, rx, &mut sender).await.unwrap();

        assert_eq!(sender.sent, vec![
            Sent::NewText("A".into()),
            Sent::Edit(100, "AB".into()),
            Sent::Edit(100, "ABC".into()),
        ]);
        assert_eq!(table.len(), 0, "final fragment drains the anchor entry");
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_a_fresh_anchor_and_continues() {
        let mut table = EvolvingReplyTable::new();
        let mut sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(ReplyFragment::Partial("A".into())).await.unwrap();
        tx.send(ReplyFragment::Partial("AB".into())).await.unwrap();
        tx.send(ReplyFragment::Final("ABC".into())).await.unwrap();
        drop(tx);

        let dispatcher = ReplyDispatcher::new(reply_key(), 1, Duration::ZERO);
        sender.fail_edits = true;
        dispatcher.run(&mut table, rx, &mut sender).await.unwrap();

        // Every would-be edit became a fresh text that re-anchored.
        assert_eq!(sender.sent, vec![
            Sent::NewText("A".into()),
            Sent::NewText("AB".into()),
            Sent::NewText("ABC".into()),
        ]);
    }

    #[tokio::test]
    async fn prefix_regressions_are_dropped_without_sending() {
        let mut table = EvolvingReplyTable::new();
        let mut sender = RecordingSender::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(ReplyFragment::Partial("ABC".into())).await.unwrap();
        tx.send(ReplyFragment::Partial("AB".into())).await.unwrap();
        tx.send(ReplyFragment::Final("ABCD".into())).await.unwrap();
        drop(tx);

        let dispatcher = ReplyDispatcher::new(reply_key(), 1, Duration::ZERO);
        dispatcher.run(&mut table, rx, &mut sender).await.unwrap();

        assert_eq!(sender.sent, vec![
            Sent::NewText("ABC".into()),
            Sent::Edit(100, "ABCD".into()),
        ]);
    }
}
