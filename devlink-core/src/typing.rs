//! Typing-indicator bookkeeping.
//!
//! A typing indicator is only believable while it is refreshed, so the
//! tracker records when each conversation's indicator was last sent and
//! tells the caller when a refresh is due. On host shutdown the remaining
//! conversations are drained so each can receive a final "stopped typing".
//!
//! Indicator sends carry the no-queueing and no-server-ack flags: a typing
//! signal delivered late is worse than one never delivered.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use devlink_wire::body::{TypingIndicator, message_flags, message_type};

/// How often an active indicator must be re-sent to stay visible.
pub const TYPING_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// The flag byte every typing-indicator send carries.
pub const TYPING_SEND_FLAGS: u8 = message_flags::NO_QUEUEING | message_flags::NO_SERVER_ACK;

/// What the tracker wants sent for one conversation, if anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSend {
    /// Send a fresh `typing` indicator (new conversation or refresh due).
    Start,
    /// Nothing to send; the last indicator is still fresh.
    StillFresh,
}

/// Per-session table of conversations with an active typing indicator.
#[derive(Default)]
pub struct TypingTracker {
    active: HashMap<[u8; 8], SystemTime>,
}

impl TypingTracker {
    /// Construct an empty tracker.
    pub fn new() -> Self { Self::default() }

    /// Record typing activity toward `peer`. Returns whether an indicator
    /// send is due now.
    pub fn typing(&mut self, peer: [u8; 8], now: SystemTime) -> TypingSend {
        match self.active.get(&peer) {
            Some(last) if age(*last, now) < TYPING_REFRESH_INTERVAL => TypingSend::StillFresh,
            _ => {
                self.active.insert(peer, now);
                TypingSend::Start
            }
        }
    }

    /// Record that typing toward `peer` stopped. Returns whether a
    /// "stopped typing" send is needed (it is not if none was ever shown).
    pub fn stopped(&mut self, peer: &[u8; 8]) -> bool {
        self.active.remove(peer).is_some()
    }

    /// Drain every active conversation for the shutdown path: the caller
    /// sends one final "stopped typing" per returned peer.
    pub fn drain_all(&mut self) -> Vec<[u8; 8]> {
        let peers: Vec<_> = self.active.keys().copied().collect();
        self.active.clear();
        peers
    }

    /// Number of conversations currently marked as typing.
    pub fn active_count(&self) -> usize { self.active.len() }
}

fn age(last: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(last).unwrap_or(Duration::ZERO)
}

/// The `(type, flags, body)` triple for a typing-indicator send.
pub fn typing_message(typing: bool) -> (u8, u8, Vec<u8>) {
    (message_type::TYPING, TYPING_SEND_FLAGS, TypingIndicator { typing }.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: [u8; 8] = *b"PEER0000";

    #[test]
    fn first_typing_sends_then_stays_fresh_until_refresh_interval() {
        let mut tracker = TypingTracker::new();
        let t0 = SystemTime::now();
        assert_eq!(tracker.typing(PEER, t0), TypingSend::Start);
        assert_eq!(tracker.typing(PEER, t0 + Duration::from_secs(1)), TypingSend::StillFresh);
        assert_eq!(tracker.typing(PEER, t0 + Duration::from_secs(5)), TypingSend::Start);
    }

    #[test]
    fn stopped_reports_whether_an_indicator_was_showing() {
        let mut tracker = TypingTracker::new();
        assert!(!tracker.stopped(&PEER));
        tracker.typing(PEER, SystemTime::now());
        assert!(tracker.stopped(&PEER));
        assert!(!tracker.stopped(&PEER));
    }

    #[test]
    fn drain_returns_every_active_peer_exactly_once() {
        let mut tracker = TypingTracker::new();
        let now = SystemTime::now();
        tracker.typing(PEER, now);
        tracker.typing(*b"OTHER001", now);
        let mut drained = tracker.drain_all();
        drained.sort();
        assert_eq!(drained.len(), 2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn typing_message_carries_the_no_queue_no_ack_flags() {
        let (kind, flags, body) = typing_message(true);
        assert_eq!(kind, message_type::TYPING);
        assert_eq!(flags, 0x06);
        assert_eq!(body, vec![1]);
        let (_, _, stopped) = typing_message(false);
        assert_eq!(stopped, vec![0]);
    }
}
