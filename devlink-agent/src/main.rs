//! Demo: stream a scripted agent reply through the evolving-reply
//! dispatcher and watch the anchor/edit/coalesce decisions it makes.
//!
//! The agent-dispatch host itself is an external collaborator; this binary
//! plays its part with a fixed script of `partial`/`block`/`final`
//! fragments, and plays the send half with a logger instead of a live
//! session, so the serialization and fallback behaviour can be observed
//! without a mediator anywhere near.

use std::time::Duration;

use clap::Parser;
use devlink_core::dedupe::{EvolvingReplyKey, EvolvingReplyTable};
use devlink_core::sendflow::{ReplyDispatcher, ReplyFragment, ReplySender};
use devlink_core::DevlinkError;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "devlink-agent", about = "Replay a scripted agent reply stream through evolving-reply coalescing")]
struct Args {
    /// Minimum character growth between Partial chunks before a new edit is sent.
    #[arg(long, default_value_t = 8)]
    min_chars_delta: usize,

    /// Minimum wall-clock gap between Partial edits, in milliseconds.
    #[arg(long, default_value_t = 400)]
    min_interval_ms: u64,

    /// Refuse every edit, demonstrating the fresh-anchor fallback path.
    #[arg(long, default_value_t = false)]
    fail_edits: bool,
}

struct ScriptedChunk {
    fragment: fn(String) -> ReplyFragment,
    text: &'static str,
    delay_ms: u64,
}

const SCRIPT: &[ScriptedChunk] = &[
    ScriptedChunk { fragment: ReplyFragment::Partial, text: "Sure,", delay_ms: 0 },
    ScriptedChunk { fragment: ReplyFragment::Partial, text: "Sure, let", delay_ms: 50 },
    ScriptedChunk { fragment: ReplyFragment::Partial, text: "Sure, let me check that for you", delay_ms: 450 },
    ScriptedChunk { fragment: ReplyFragment::Block, text: "Sure, let me check that for you.\n\nHere's what I found:", delay_ms: 400 },
    ScriptedChunk { fragment: ReplyFragment::Final, text: "Sure, let me check that for you.\n\nHere's what I found: it's 42.", delay_ms: 50 },
];

/// Stands in for the live session's send half: logs instead of sending.
struct LoggingSender {
    next_message_id: u64,
    fail_edits: bool,
}

impl ReplySender for LoggingSender {
    async fn send_new_text(&mut self, text: &str) -> Result<u64, DevlinkError> {
        let id = self.next_message_id;
        self.next_message_id += 1;
        tracing::info!(anchor_message_id = id, %text, "send group text");
        Ok(id)
    }

    async fn send_edit(&mut self, anchor_message_id: u64, text: &str) -> Result<(), DevlinkError> {
        if self.fail_edits {
            tracing::warn!(anchor_message_id, "refusing edit as instructed");
            return Err(DevlinkError::Transport("edit refused by --fail-edits".into()));
        }
        tracing::info!(anchor_message_id, %text, "send group edit");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), DevlinkError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let (tx, rx) = mpsc::channel(4);
    let producer = tokio::spawn(async move {
        for chunk in SCRIPT {
            tokio::time::sleep(Duration::from_millis(chunk.delay_ms)).await;
            if tx.send((chunk.fragment)(chunk.text.to_string())).await.is_err() {
                return;
            }
        }
    });

    let key = EvolvingReplyKey {
        account_id: "demo-account".into(),
        chat_id: "demo-chat".into(),
        trigger_message_id: 1,
    };
    let mut table = EvolvingReplyTable::new();
    let mut sender = LoggingSender { next_message_id: 1000, fail_edits: args.fail_edits };

    let dispatcher = ReplyDispatcher::new(key, args.min_chars_delta, Duration::from_millis(args.min_interval_ms));
    dispatcher.run(&mut table, rx, &mut sender).await?;

    producer.await.expect("producer task never panics");
    tracing::info!("reply stream drained");
    Ok(())
}
