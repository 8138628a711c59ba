//! Conversation data model: tagged content items, exchanges, and conversations.
//!
//! An [`Exchange`] is an append-only sequence of [`ContentItem`]s produced by one
//! model turn (plus the user message that triggered it). A [`Conversation`] owns
//! an ordered list of exchanges, the instructions sent to every provider, the
//! tool set available to the model, and the bookkeeping the orchestrator needs
//! to drive the agentic loop (live tasks, `loop_break`, the sandbox handle).
//!
//! Items are modeled as an exhaustive tagged enum rather than dispatched on a
//! type name, so every call site that needs per-kind behavior is forced through
//! a `match` the compiler checks for completeness.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Status of an [`ContentItem::AssistantText`] or [`ContentItem::AssistantReasoning`] block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextStatus {
    InProgress,
    Completed,
}

/// Status of a [`ContentItem::FunctionCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCallStatus {
    InProgress,
    Completed,
    Executing,
    Finished,
}

/// Assistant-visible text, streamed incrementally.
#[derive(Debug, Clone)]
pub struct AssistantText {
    pub key: String,
    pub content: String,
    pub status: TextStatus,
    /// Always "assistant"; kept as a field (not inferred) to match the wire shape of §6.
    pub role: &'static str,
    /// Locator used by the messages-style (index-keyed) adapter; absent for chat-completions.
    pub index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Hidden "thinking" / reasoning trace, streamed incrementally. Never sent back to providers.
#[derive(Debug, Clone)]
pub struct AssistantReasoning {
    pub key: String,
    pub content: String,
    pub status: TextStatus,
    pub index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A tool/function call requested by the model and (eventually) executed locally.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub key: String,
    pub call_id: String,
    pub name: String,
    /// JSON once complete; may be syntactically invalid while still streaming.
    pub arguments: String,
    pub status: FunctionCallStatus,
    /// Tool output, append-only.
    pub content: String,
    pub error: bool,
    pub index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A message submitted by the user, naming the model that should drive this turn.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub key: String,
    pub role: &'static str,
    pub content: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// A single addressable unit of conversation content.
///
/// Exhaustively matched wherever behavior varies by kind (serialization,
/// finalization, request-body construction) per the data model's design note
/// against class-name dispatch.
#[derive(Debug, Clone)]
pub enum ContentItem {
    UserMessage(UserMessage),
    AssistantText(AssistantText),
    AssistantReasoning(AssistantReasoning),
    FunctionCall(FunctionCall),
}

impl ContentItem {
    pub fn key(&self) -> &str {
        match self {
            ContentItem::UserMessage(m) => &m.key,
            ContentItem::AssistantText(m) => &m.key,
            ContentItem::AssistantReasoning(m) => &m.key,
            ContentItem::FunctionCall(m) => &m.key,
        }
    }

    pub fn index(&self) -> Option<u32> {
        match self {
            ContentItem::UserMessage(_) => None,
            ContentItem::AssistantText(m) => m.index,
            ContentItem::AssistantReasoning(m) => m.index,
            ContentItem::FunctionCall(m) => m.index,
        }
    }

    /// Serialize into the wire shape of SPEC_FULL.md §6's monitor event stream.
    pub fn to_json(&self) -> Value {
        match self {
            ContentItem::UserMessage(m) => serde_json::json!({
                "key": m.key,
                "type": "message",
                "created_at": m.created_at.to_rfc3339(),
                "role": m.role,
                "content": m.content,
                "model": m.model,
            }),
            ContentItem::AssistantText(m) => serde_json::json!({
                "key": m.key,
                "type": "message",
                "created_at": m.created_at.to_rfc3339(),
                "status": text_status_str(m.status),
                "role": m.role,
                "content": m.content,
            }),
            ContentItem::AssistantReasoning(m) => serde_json::json!({
                "key": m.key,
                "type": "reasoning",
                "created_at": m.created_at.to_rfc3339(),
                "content": m.content,
                "status": text_status_str(m.status),
            }),
            ContentItem::FunctionCall(m) => serde_json::json!({
                "key": m.key,
                "type": "function_call",
                "created_at": m.created_at.to_rfc3339(),
                "status": function_call_status_str(m.status),
                "name": m.name,
                "arguments": m.arguments,
                "content": m.content,
                "error": m.error,
            }),
        }
    }
}

fn text_status_str(s: TextStatus) -> &'static str {
    match s {
        TextStatus::InProgress => "in_progress",
        TextStatus::Completed => "completed",
    }
}

fn function_call_status_str(s: FunctionCallStatus) -> &'static str {
    match s {
        FunctionCallStatus::InProgress => "in_progress",
        FunctionCallStatus::Completed => "completed",
        FunctionCallStatus::Executing => "executing",
        FunctionCallStatus::Finished => "finished",
    }
}

impl AssistantText {
    pub fn new_in_progress(index: Option<u32>) -> Self {
        Self {
            key: format!("message-{}", Uuid::new_v4()),
            content: String::new(),
            status: TextStatus::InProgress,
            role: "assistant",
            index,
            created_at: Utc::now(),
        }
    }
}

impl AssistantReasoning {
    pub fn new_in_progress(index: Option<u32>) -> Self {
        Self {
            key: format!("reasoning-{}", Uuid::new_v4()),
            content: String::new(),
            status: TextStatus::InProgress,
            index,
            created_at: Utc::now(),
        }
    }
}

impl FunctionCall {
    pub fn new_in_progress(call_id: String, name: String, arguments: String, index: Option<u32>) -> Self {
        Self {
            key: format!("fc-{}", Uuid::new_v4()),
            call_id,
            name,
            arguments,
            status: FunctionCallStatus::InProgress,
            content: String::new(),
            error: false,
            index,
            created_at: Utc::now(),
        }
    }
}

impl UserMessage {
    pub fn new(content: String, model: String) -> Self {
        Self {
            key: format!("user-message-{}", Uuid::new_v4()),
            role: "user",
            content,
            model,
            created_at: Utc::now(),
        }
    }
}

/// One request/response cycle between a user (or tool continuation) and the model.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub items: Vec<ContentItem>,
    pub completed: bool,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last item of the given kind, optionally filtered by status, in causal order.
    pub fn last_assistant_text(&self, status: Option<TextStatus>) -> Option<&AssistantText> {
        self.items.iter().rev().find_map(|item| match item {
            ContentItem::AssistantText(m) if status.map_or(true, |s| m.status == s) => Some(m),
            _ => None,
        })
    }

    pub fn last_assistant_text_mut(&mut self, status: Option<TextStatus>) -> Option<&mut AssistantText> {
        self.items.iter_mut().rev().find_map(|item| match item {
            ContentItem::AssistantText(m) if status.map_or(true, |s| m.status == s) => Some(m),
            _ => None,
        })
    }

    pub fn last_reasoning(&self, status: Option<TextStatus>) -> Option<&AssistantReasoning> {
        self.items.iter().rev().find_map(|item| match item {
            ContentItem::AssistantReasoning(m) if status.map_or(true, |s| m.status == s) => Some(m),
            _ => None,
        })
    }

    pub fn last_reasoning_mut(&mut self, status: Option<TextStatus>) -> Option<&mut AssistantReasoning> {
        self.items.iter_mut().rev().find_map(|item| match item {
            ContentItem::AssistantReasoning(m) if status.map_or(true, |s| m.status == s) => Some(m),
            _ => None,
        })
    }

    pub fn function_call_by_index(&self, index: u32) -> Option<&FunctionCall> {
        self.items.iter().find_map(|item| match item {
            ContentItem::FunctionCall(m) if m.index == Some(index) => Some(m),
            _ => None,
        })
    }

    pub fn function_call_by_index_mut(&mut self, index: u32) -> Option<&mut FunctionCall> {
        self.items.iter_mut().find_map(|item| match item {
            ContentItem::FunctionCall(m) if m.index == Some(index) => Some(m),
            _ => None,
        })
    }

    pub fn function_call_by_key_mut(&mut self, key: &str) -> Option<&mut FunctionCall> {
        self.items.iter_mut().find_map(|item| match item {
            ContentItem::FunctionCall(m) if m.key == key => Some(m),
            _ => None,
        })
    }

    /// Item at a given messages-adapter content-block index, of any kind.
    pub fn item_by_index_mut(&mut self, index: u32) -> Option<&mut ContentItem> {
        self.items.iter_mut().find(|item| item.index() == Some(index))
    }

    /// Number of FunctionCall items with the given index. Used to assert the
    /// "finding more than one match is a fatal bug" rule of §4.1.1.
    pub fn count_function_calls_by_index(&self, index: u32) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, ContentItem::FunctionCall(m) if m.index == Some(index)))
            .count()
    }
}

/// A JSON-schema-described tool the model may call.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub parameters: Value,
}

/// A live conversation: exchanges, instructions, tools, and agentic-loop bookkeeping.
///
/// Owned behind a single `tokio::sync::Mutex` by the orchestrator's conversation
/// registry (see `orchestrator.rs`): per §5, every mutation is made while
/// holding that lock and released before the next suspension point, which is
/// the Tokio realization of "all conversation mutations happen on the
/// scheduler thread, so item updates need no explicit per-field lock."
pub struct Conversation {
    pub conversation_id: String,
    pub instructions: Vec<String>,
    pub tools: HashMap<String, ToolDescriptor>,
    pub tool_initialized: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub exchanges: Vec<Exchange>,
    /// Abort handles for this conversation's in-flight chat-request / tool-execution tasks.
    /// `AbortHandle` (rather than `JoinHandle`) so a supervising task can independently
    /// await each spawned task's real completion while this list is still only used for
    /// `abort()`/`is_finished()` bookkeeping — see `Orchestrator::schedule_task`.
    pub tasks: Vec<tokio::task::AbortHandle>,
    /// If true, the orchestrator will not auto-continue into a new exchange once tasks drain.
    pub loop_break: bool,
    pub sandbox: Option<Arc<crate::cloudllm::sandbox::Sandbox>>,
    pub monitors: Vec<Arc<dyn crate::cloudllm::monitor::Monitor>>,
}

impl Conversation {
    pub fn new(conversation_id: String, instructions: Vec<String>, tools: HashMap<String, ToolDescriptor>) -> Self {
        Self {
            conversation_id,
            instructions,
            tools,
            tool_initialized: HashSet::new(),
            created_at: Utc::now(),
            exchanges: Vec::new(),
            tasks: Vec::new(),
            loop_break: true,
            sandbox: None,
            monitors: Vec::new(),
        }
    }

    /// Model named by the most recent UserMessage, scanning exchanges newest-first.
    pub fn current_model(&self) -> Option<&str> {
        for exchange in self.exchanges.iter().rev() {
            for item in exchange.items.iter().rev() {
                if let ContentItem::UserMessage(m) = item {
                    return Some(&m.model);
                }
            }
        }
        None
    }

    pub fn instructions_joined(&self) -> String {
        self.instructions.join("\n")
    }
}
