//! Conversation registry and agentic-loop scheduler (§4.2).
//!
//! The [`Orchestrator`] owns every live [`Conversation`](crate::cloudllm::datamodel::Conversation),
//! behind a [`ConversationHandle`], and drives the scheduling rule of §5: a
//! conversation auto-continues into a fresh exchange once its in-flight tasks
//! drain to zero, unless something set `loop_break`. Mutations to a single
//! conversation are serialized through its own `tokio::sync::Mutex`, which is
//! this crate's realization of "conversation mutations happen on the
//! scheduler thread" from a cooperative single-threaded scheduler.
//!
//! Grounded on `examples/original_source/llmulink/llm/svc_router.py`'s
//! `LLMRouterService`.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::cloudllm::datamodel::{Conversation, ContentItem, Exchange, ToolDescriptor, UserMessage};
use crate::cloudllm::library::PromptLibrary;
use crate::cloudllm::models;
use crate::cloudllm::monitor::{Monitor, MonitorEvent};
use crate::cloudllm::provider::ChatProvider;
use crate::cloudllm::tool_registry::ToolRegistry;

/// Shared handle to a single conversation. Every mutation locks briefly and
/// releases before the next suspension point (HTTP read, subprocess read,
/// permit acquisition).
pub type ConversationHandle = Arc<Mutex<Conversation>>;

/// Setup-time / fatal orchestrator errors. Turn-internal failures (a
/// provider's stream erroring mid-response, a tool raising) are recovered
/// locally and folded into item/event state per §7 — they never surface here.
#[derive(Debug)]
pub enum OrchestratorError {
    UnknownConversation(String),
    Configuration(String),
    NoProviderForModel(String),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::UnknownConversation(id) => write!(f, "no such conversation: {}", id),
            OrchestratorError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            OrchestratorError::NoProviderForModel(model) => {
                write!(f, "no configured provider advertises model {}", model)
            }
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// Registry of live conversations plus the collaborators every conversation
/// shares: the configured providers, the prompt/skill library, and the tool
/// registry.
pub struct Orchestrator {
    conversations: RwLock<HashMap<String, ConversationHandle>>,
    providers: Vec<Arc<dyn ChatProvider>>,
    library: Arc<dyn PromptLibrary>,
    tool_registry: Arc<ToolRegistry>,
}

impl Orchestrator {
    pub fn new(
        providers: Vec<Arc<dyn ChatProvider>>,
        library: Arc<dyn PromptLibrary>,
        tool_registry: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversations: RwLock::new(HashMap::new()),
            providers,
            library,
            tool_registry,
        })
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    /// Create a new, empty conversation seeded with the default instructions
    /// and the tool set currently registered. Mirrors `create_conversation`.
    pub async fn create_conversation(
        self: &Arc<Self>,
    ) -> Result<ConversationHandle, OrchestratorError> {
        let conversation_id = format!("conversation-{}", Uuid::new_v4().simple());
        let instructions = self
            .library
            .open("/AI/Prompts/default.md")
            .await
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        let tools: HashMap<String, ToolDescriptor> = self.tool_registry.descriptors().await;

        let conversation = Conversation::new(conversation_id.clone(), vec![instructions], tools);
        let handle: ConversationHandle = Arc::new(Mutex::new(conversation));
        self.conversations
            .write()
            .await
            .insert(conversation_id, Arc::clone(&handle));
        Ok(handle)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Option<ConversationHandle> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    /// Add `monitor` as a subscriber of `conversation`'s events.
    pub async fn add_monitor(&self, conversation: &ConversationHandle, monitor: Arc<dyn Monitor>) {
        conversation.lock().await.monitors.push(monitor);
    }

    /// Replace the conversation's instructions from a library item. A
    /// `/AI/Prompts/...` item is a single Jinja2-rendered instruction; a
    /// `/AI/Skill/...` item is a directory whose `index.yaml` lists
    /// instructions (each `+`-prefixed entry naming a sub-file to inline) and
    /// optionally a fresh tool set. Mirrors `update_instructions`.
    pub async fn update_instructions(
        &self,
        conversation: &ConversationHandle,
        item: &str,
        params: &serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        if let Some(_prompt) = item.strip_prefix("/AI/Prompts/") {
            let raw = self
                .library
                .open(item)
                .await
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
            let rendered = crate::cloudllm::template::render_instructions(&raw, params)
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
            conversation.lock().await.instructions = vec![rendered];
            return Ok(());
        }

        if item.strip_prefix("/AI/Skill/").is_some() {
            let index_raw = self
                .library
                .open(&format!("{}index.yaml", item))
                .await
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
            let definition: crate::cloudllm::library::SkillDefinition = serde_yaml::from_str(&index_raw)
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

            let mut instructions = Vec::with_capacity(definition.instructions.len());
            for instruction in &definition.instructions {
                if let Some(rest) = instruction.strip_prefix('+') {
                    match self.load_skill_instruction(item, rest, params).await? {
                        Some(loaded) => instructions.push(loaded),
                        None => log::warn!("skill sub-instruction not found: {}{}", item, rest),
                    }
                } else {
                    instructions.push(instruction.clone());
                }
            }

            let mut conv = conversation.lock().await;
            conv.instructions = instructions;
            if let Some(tools) = definition.tools {
                conv.tools = tools
                    .into_iter()
                    .map(|(name, def)| {
                        (
                            name.clone(),
                            ToolDescriptor {
                                name,
                                title: Some(def.title),
                                description: def.description,
                                parameters: def.parameters,
                            },
                        )
                    })
                    .collect();
            }
            return Ok(());
        }

        Err(OrchestratorError::Configuration(format!(
            "instruction item must start with /AI/Prompts/ or /AI/Skill/: {}",
            item
        )))
    }

    /// Recursively load a (possibly further `+`-nested) skill sub-instruction
    /// file and render it. Mirrors `load_instruction`.
    async fn load_skill_instruction(
        &self,
        skill_item: &str,
        relative: &str,
        params: &serde_json::Value,
    ) -> Result<Option<String>, OrchestratorError> {
        let path = format!("{}{}", skill_item, relative);
        let raw = match self.library.open(&path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let mut lines = Vec::new();
        for line in raw.split('\n') {
            if let Some(rest) = line.strip_prefix('+') {
                match Box::pin(self.load_skill_instruction(skill_item, rest, params)).await? {
                    Some(loaded) => lines.push(loaded),
                    None => lines.push(line.to_string()),
                }
            } else {
                lines.push(line.to_string());
            }
        }

        let rendered = crate::cloudllm::template::render_instructions(&lines.join("\n"), params)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        Ok(Some(rendered))
    }

    /// Append a user message as a new exchange and schedule the chat request
    /// it implies. Mirrors `create_exchange`.
    pub async fn create_exchange(self: &Arc<Self>, conversation: &ConversationHandle, user_message: UserMessage) {
        let item_json = ContentItem::UserMessage(user_message.clone()).to_json();
        let exchange_index;
        {
            let mut conv = conversation.lock().await;
            let mut exchange = Exchange::new();
            exchange.items.push(ContentItem::UserMessage(user_message));
            conv.exchanges.push(exchange);
            exchange_index = conv.exchanges.len() - 1;
        }
        self.send_update(conversation, MonitorEvent::ItemAppended { item: item_json })
            .await;
        self.schedule_chat_request(conversation.clone(), exchange_index).await;
    }

    /// Begin executing a function call already present in the conversation
    /// (the model requested it, the core accepted it). Mirrors `create_function_call`.
    pub async fn create_function_call(
        self: &Arc<Self>,
        conversation: &ConversationHandle,
        exchange_index: usize,
        function_call_key: String,
    ) {
        self.schedule_task(conversation.clone(), move |orchestrator, conversation| async move {
            orchestrator
                .run_function_call(&conversation, exchange_index, &function_call_key)
                .await;
        })
        .await;
    }

    /// Abort every in-flight task for `conversation`. Mirrors `stop_conversation`.
    pub async fn stop_conversation(&self, conversation: &ConversationHandle) {
        let mut conv = conversation.lock().await;
        for task in conv.tasks.drain(..) {
            task.abort();
        }
        conv.loop_break = true;
    }

    /// Truncate `conversation` back to (and excluding) the exchange whose
    /// first item has the given `key`, discarding everything after it. Per
    /// the confirmed reading of `restart_conversation`, this does not cancel
    /// tasks already scheduled against the discarded exchanges — it only
    /// changes what future scheduling sees. A `key` that matches no exchange
    /// is a no-op, logged as a warning.
    pub async fn restart_conversation(&self, conversation: &ConversationHandle, key: &str) {
        let mut conv = conversation.lock().await;
        let found = conv
            .exchanges
            .iter()
            .position(|exchange| exchange.items.first().map_or(false, |item| item.key() == key));
        match found {
            Some(index) => conv.exchanges.truncate(index),
            None => log::warn!("restart_conversation: no exchange starts with key {}", key),
        }
    }

    /// Every model name advertised by at least one configured provider.
    pub async fn get_models(&self) -> Vec<String> {
        models::collect_models(&self.providers).await
    }

    /// Fan `event` out to every monitor subscribed to `conversation`,
    /// concurrently. A monitor that panics is logged individually and does
    /// not affect its siblings; the number of monitors that panicked is
    /// returned so a caller that cares can treat it as a failure instead of
    /// it being silently swallowed here, approximating the
    /// `asyncio.TaskGroup` fan-out's exception propagation.
    pub async fn send_update(&self, conversation: &ConversationHandle, event: MonitorEvent) -> usize {
        let monitors = conversation.lock().await.monitors.clone();
        if monitors.is_empty() {
            return 0;
        }
        let mut set = tokio::task::JoinSet::new();
        for monitor in monitors {
            let event = event.clone();
            set.spawn(async move { monitor.on_event(&event).await });
        }
        let mut failed = 0;
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                log::error!("monitor task panicked: {}", e);
                failed += 1;
            }
        }
        failed
    }

    async fn send_update_tasks(&self, conversation: &ConversationHandle) {
        let count = {
            let conv = conversation.lock().await;
            conv.tasks.len() + if conv.loop_break { 0 } else { 1 }
        };
        let failed = self.send_update(conversation, MonitorEvent::TasksUpdated { count }).await;
        if failed > 0 {
            log::warn!("{} monitor(s) failed while reporting a task-count update", failed);
        }
    }

    /// Send one monitor a full snapshot of the conversation. Mirrors
    /// `send_full_update`, which — faithfully reproduced here — only
    /// includes `UserMessage` items in the snapshot.
    pub async fn send_full_update(&self, conversation: &ConversationHandle, monitor: &Arc<dyn Monitor>) {
        let (conversation_id, created_at, items) = {
            let conv = conversation.lock().await;
            let items: Vec<serde_json::Value> = conv
                .exchanges
                .iter()
                .flat_map(|exchange| exchange.items.iter())
                .filter(|item| matches!(item, ContentItem::UserMessage(_)))
                .map(|item| item.to_json())
                .collect();
            (conv.conversation_id.clone(), conv.created_at.to_rfc3339(), items)
        };
        monitor
            .on_event(&MonitorEvent::UpdateFull {
                conversation_id,
                created_at,
                items,
            })
            .await;
    }

    /// Spawn `body` as a tracked task of `conversation`, then run the
    /// drain-continuation rule once it completes: if no other tasks remain
    /// and `loop_break` was not set, open a fresh exchange and schedule the
    /// next chat request. Mirrors `schedule_task`/`on_task_done`.
    ///
    /// `body` runs in its own task, whose `AbortHandle` is what gets pushed
    /// onto `conversation.tasks` (for `stop_conversation`'s abort sweep and
    /// `on_task_done`'s drain check). Completion is observed from a second,
    /// untracked supervising task that `.await`s the real `JoinHandle` —
    /// calling `on_task_done` from inside `body`'s own task would mean
    /// `is_finished()` could never see that very task as finished while it is
    /// still running the check, so the conversation would never drain.
    async fn schedule_task<F, Fut>(self: &Arc<Self>, conversation: ConversationHandle, body: F)
    where
        F: FnOnce(Arc<Orchestrator>, ConversationHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let orchestrator = Arc::clone(self);
        let conversation_for_body = Arc::clone(&conversation);

        let handle = tokio::spawn(async move { body(orchestrator, conversation_for_body).await });

        conversation.lock().await.tasks.push(handle.abort_handle());
        self.send_update_tasks(&conversation).await;

        let orchestrator_for_finish = Arc::clone(self);
        let conversation_for_finish = conversation;
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("task panicked: {}", e);
                }
            }
            Orchestrator::on_task_done(&orchestrator_for_finish, &conversation_for_finish).await;
        });
    }

    async fn on_task_done(self: &Arc<Self>, conversation: &ConversationHandle) {
        let should_continue;
        let exchange_index;
        {
            let mut conv = conversation.lock().await;
            conv.tasks.retain(|task| !task.is_finished());
            should_continue = conv.tasks.is_empty() && !conv.loop_break;
            if should_continue {
                conv.exchanges.push(Exchange::new());
                conv.loop_break = true;
                exchange_index = conv.exchanges.len() - 1;
            } else {
                exchange_index = 0;
            }
        }
        self.send_update_tasks(conversation).await;
        if should_continue {
            self.schedule_chat_request(conversation.clone(), exchange_index).await;
        }
    }

    async fn schedule_chat_request(self: &Arc<Self>, conversation: ConversationHandle, exchange_index: usize) {
        self.schedule_task(conversation, move |orchestrator, conversation| async move {
            orchestrator.run_chat_request(&conversation, exchange_index).await;
        })
        .await;
    }

    /// Select a provider advertising the conversation's requested model,
    /// acquire its permit, and run one chat turn. Mirrors `task_chat_request`.
    async fn run_chat_request(self: &Arc<Self>, conversation: &ConversationHandle, exchange_index: usize) {
        let model = match conversation.lock().await.current_model() {
            Some(m) => m.to_string(),
            None => {
                log::error!("chat request scheduled on a conversation with no model set");
                return;
            }
        };

        let mut candidates: Vec<Arc<dyn ChatProvider>> = Vec::new();
        for provider in &self.providers {
            match models::list_models(provider.url(), &provider.prepare_headers()).await {
                Ok(available) if available.iter().any(|m| m == &model) => {
                    candidates.push(Arc::clone(provider));
                }
                Ok(_) => {}
                Err(e) => log::warn!("failed to list models from {}: {}", provider.url(), e),
            }
        }

        let provider = match candidates.choose(&mut rand::thread_rng()) {
            Some(p) => Arc::clone(p),
            None => {
                log::error!("no configured provider advertises model {}", model);
                return;
            }
        };

        let _permit = match provider.semaphore().acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if let Err(e) = provider.chat_request(self, conversation, exchange_index).await {
            log::error!("chat_request against {} failed: {}", provider.url(), e);
        }
    }

    /// Execute a function call end to end: mark it executing, run it through
    /// the tool registry (which emits its own progress deltas), mark it
    /// finished, and clear `loop_break` so the loop continues once every
    /// live task for this exchange has drained. Mirrors `task_function_call`.
    async fn run_function_call(self: &Arc<Self>, conversation: &ConversationHandle, exchange_index: usize, function_call_key: &str) {
        self.set_function_call_executing(conversation, exchange_index, function_call_key)
            .await;
        self.emit_function_call_updated(conversation, exchange_index, function_call_key)
            .await;

        self.tool_registry
            .execute(self, conversation, exchange_index, function_call_key)
            .await;

        {
            let mut conv = conversation.lock().await;
            if let Some(exchange) = conv.exchanges.get_mut(exchange_index) {
                if let Some(fc) = exchange.function_call_by_key_mut(function_call_key) {
                    fc.status = crate::cloudllm::datamodel::FunctionCallStatus::Finished;
                }
            }
            conv.loop_break = false;
        }
        self.emit_function_call_updated(conversation, exchange_index, function_call_key)
            .await;
    }

    async fn set_function_call_executing(&self, conversation: &ConversationHandle, exchange_index: usize, function_call_key: &str) {
        let mut conv = conversation.lock().await;
        if let Some(exchange) = conv.exchanges.get_mut(exchange_index) {
            if let Some(fc) = exchange.function_call_by_key_mut(function_call_key) {
                fc.status = crate::cloudllm::datamodel::FunctionCallStatus::Executing;
            }
        }
    }

    async fn emit_function_call_updated(&self, conversation: &ConversationHandle, exchange_index: usize, function_call_key: &str) {
        let item_json = {
            let conv = conversation.lock().await;
            conv.exchanges
                .get(exchange_index)
                .and_then(|exchange| exchange.items.iter().find(|item| item.key() == function_call_key))
                .map(|item| item.to_json())
        };
        if let Some(item) = item_json {
            self.send_update(conversation, MonitorEvent::ItemUpdated { item }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::monitor::test_support::RecordingMonitor;
    use crate::cloudllm::tool_registry::ToolRegistry;

    fn test_orchestrator() -> Arc<Orchestrator> {
        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "you are helpful")]));
        let tool_registry = Arc::new(ToolRegistry::new());
        Orchestrator::new(Vec::new(), library, tool_registry)
    }

    #[tokio::test]
    async fn create_conversation_seeds_default_instructions() {
        let orchestrator = test_orchestrator();
        let conversation = orchestrator.create_conversation().await.unwrap();
        let conv = conversation.lock().await;
        assert_eq!(conv.instructions, vec!["you are helpful".to_string()]);
        assert!(conv.loop_break);
    }

    #[tokio::test]
    async fn create_exchange_with_no_provider_logs_and_drains_without_panicking() {
        let orchestrator = test_orchestrator();
        let conversation = orchestrator.create_conversation().await.unwrap();
        let monitor = Arc::new(RecordingMonitor::default());
        orchestrator.add_monitor(&conversation, monitor.clone()).await;

        let user_message = UserMessage::new("hello".to_string(), "gpt-test".to_string());
        orchestrator.create_exchange(&conversation, user_message).await;

        // No provider advertises "gpt-test"; run_chat_request should return
        // without scheduling further work or leaving a stuck task handle.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let conv = conversation.lock().await;
        assert_eq!(conv.exchanges.len(), 1);
    }
}
