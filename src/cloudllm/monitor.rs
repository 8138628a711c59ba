//! Monitor event fan-out.
//!
//! A [`Monitor`] is a subscriber of conversation events — typically a
//! WebSocket or SSE client bridge — invoked by the orchestrator for every
//! state-change: an async trait with a default no-op, registered behind
//! `Arc<dyn Monitor>` so a conversation can fan a single event out to many
//! subscribers concurrently.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// One state-change event, matching the wire shapes of SPEC_FULL.md §6.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    #[serde(rename = "item.appended")]
    ItemAppended { item: Value },

    #[serde(rename = "item.delta")]
    ItemDelta { key: String, delta: String },

    #[serde(rename = "item.arguments.delta")]
    ItemArgumentsDelta { key: String, arguments: String },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: Value },

    #[serde(rename = "tasks.updated")]
    TasksUpdated { count: usize },

    #[serde(rename = "chat.tokens")]
    ChatTokens {
        token_count: u64,
        token_max: Option<u64>,
    },

    #[serde(rename = "update.full")]
    UpdateFull {
        conversation_id: String,
        created_at: String,
        items: Vec<Value>,
    },
}

/// A subscriber notified of every conversation state-change.
///
/// All methods default to no-ops; implementors override only the events they
/// care about. `on_event` is the single required entry point the orchestrator
/// calls; a specialized bridge (e.g. a WebSocket adapter) may instead match on
/// [`MonitorEvent`] variants directly rather than overriding per-kind hooks,
/// so no per-variant method is mandatory.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn on_event(&self, event: &MonitorEvent);
}
