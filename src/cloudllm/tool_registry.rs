//! Tool discovery and execution (§4.3).
//!
//! Grounded on `examples/original_source/llmulink/tool/svc_tool.py`
//! (`ToolService.get_tools`/`execute`: provider-chain walk, unknown-tool and
//! exception-to-"Tool failed." mapping), `tool/provider/provider_abc.py`
//! (`ToolProviderABC.locate_tool`), and `tool/provider/local.py`
//! (`LocalToolProvider`). Structural naming (`ToolRegistry`, builder-style
//! registration) follows `src/cloudllm/tool_protocol.rs`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::RwLock;

use crate::cloudllm::datamodel::{FunctionCallStatus, ToolDescriptor};
use crate::cloudllm::monitor::MonitorEvent;
use crate::cloudllm::orchestrator::{ConversationHandle, Orchestrator};

/// Handle an executor uses to report progress and outcome. Mirrors the
/// original's async-generator-of-progress-tokens executors
/// (`tool_busybox.py`'s `fuction_call_busybox`), collapsed into push calls
/// against the conversation rather than a yielded stream.
pub struct ToolProgress {
    orchestrator: Arc<Orchestrator>,
    conversation: ConversationHandle,
    exchange_index: usize,
    function_call_key: String,
}

impl ToolProgress {
    /// The conversation this function call belongs to, for executors (like
    /// the shell tool) that need direct access to collaborators such as the
    /// sandbox.
    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    /// Append to the function call's output and notify monitors.
    pub async fn append(&self, text: &str) {
        self.mutate_and_emit(|fc| fc.content.push_str(text)).await;
    }

    /// Replace the function call's output wholesale (used for a single-shot
    /// final result, as opposed to streamed `append`).
    pub async fn set_content(&self, text: String) {
        self.mutate_and_emit(|fc| fc.content = text).await;
    }

    /// Mark the function call as failed with a final error message.
    pub async fn fail(&self, message: &str) {
        self.mutate_and_emit(|fc| {
            fc.content = message.to_string();
            fc.error = true;
        })
        .await;
    }

    /// Raise the function call's `error` flag without touching its content,
    /// for executors that have already written their own diagnostic output.
    pub async fn mark_error(&self) {
        self.mutate_and_emit(|fc| fc.error = true).await;
    }

    async fn mutate_and_emit(&self, mutate: impl FnOnce(&mut crate::cloudllm::datamodel::FunctionCall)) {
        let item_json = {
            let mut conv = self.conversation.lock().await;
            let fc = match conv
                .exchanges
                .get_mut(self.exchange_index)
                .and_then(|exchange| exchange.function_call_by_key_mut(&self.function_call_key))
            {
                Some(fc) => fc,
                None => return,
            };
            mutate(fc);
            fc.clone()
        };
        let json = crate::cloudllm::datamodel::ContentItem::FunctionCall(item_json).to_json();
        self.orchestrator
            .send_update(&self.conversation, MonitorEvent::ItemUpdated { item: json })
            .await;
    }
}

#[derive(Debug)]
pub enum ToolError {
    NotFound(String),
    Failed(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::Failed(msg) => write!(f, "tool execution failed: {}", msg),
        }
    }
}

impl std::error::Error for ToolError {}

/// A runnable tool: its descriptor plus the code that carries it out.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run once per conversation, before the first `execute` call, the first
    /// time this tool is used. Most tools have nothing to do here; the shell
    /// tool uses it to provision the sandbox.
    async fn init(&self, _conversation: &ConversationHandle) {}

    async fn execute(&self, progress: &ToolProgress, arguments: &str);
}

/// Source of tools, chained the way `ToolProviderABC` implementations are
/// walked by `ToolService`.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn descriptors(&self) -> Vec<ToolDescriptor>;
    async fn locate_tool(&self, name: &str) -> Option<Arc<dyn ToolExecutor>>;
}

/// A provider backed by an in-process `HashMap`, the common case (the
/// shell/busybox tool, the parser-builder triplet, statically configured
/// REST tools). Mirrors `LocalToolProvider`.
pub struct LocalToolProvider {
    tools: HashMap<String, (ToolDescriptor, Arc<dyn ToolExecutor>)>,
}

impl LocalToolProvider {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn with_tool(mut self, descriptor: ToolDescriptor, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools.insert(descriptor.name.clone(), (descriptor, executor));
        self
    }
}

impl Default for LocalToolProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for LocalToolProvider {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|(descriptor, _)| descriptor.clone()).collect()
    }

    async fn locate_tool(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).map(|(_, executor)| Arc::clone(executor))
    }
}

/// Aggregates tool providers behind a single lookup surface, used by the
/// orchestrator both to seed a new conversation's tool set and to execute
/// function calls. Mirrors `ToolService`.
pub struct ToolRegistry {
    providers: RwLock<Vec<Arc<dyn ToolProvider>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_provider(&self, provider: Arc<dyn ToolProvider>) {
        self.providers.write().await.push(provider);
    }

    /// Every descriptor across every provider, keyed by tool name. Earlier
    /// providers win on a name collision, matching the chain-walk order
    /// `ToolService.get_tools` uses for lookup.
    pub async fn descriptors(&self) -> HashMap<String, ToolDescriptor> {
        let mut out = HashMap::new();
        for provider in self.providers.read().await.iter() {
            for descriptor in provider.descriptors() {
                out.entry(descriptor.name.clone()).or_insert(descriptor);
            }
        }
        out
    }

    async fn locate_tool(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        for provider in self.providers.read().await.iter() {
            if let Some(executor) = provider.locate_tool(name).await {
                return Some(executor);
            }
        }
        None
    }

    /// Run the function call named `function_call_key` in `exchange_index`.
    /// Ensures the owning tool's one-time `init` has run for this
    /// conversation, then executes it; panics or missing tools are folded
    /// into the function call's `error`/`content` fields rather than
    /// propagated. Mirrors `ToolService.execute`'s blanket
    /// exception-to-"Tool failed." mapping.
    pub async fn execute(
        &self,
        orchestrator: &Arc<Orchestrator>,
        conversation: &ConversationHandle,
        exchange_index: usize,
        function_call_key: &str,
    ) {
        let (tool_name, arguments) = {
            let conv = conversation.lock().await;
            match conv
                .exchanges
                .get(exchange_index)
                .and_then(|exchange| exchange.items.iter().find(|item| item.key() == function_call_key))
            {
                Some(crate::cloudllm::datamodel::ContentItem::FunctionCall(fc)) => {
                    (fc.name.clone(), fc.arguments.clone())
                }
                _ => {
                    log::error!("function call {} vanished before execution", function_call_key);
                    return;
                }
            }
        };

        let progress = ToolProgress {
            orchestrator: Arc::clone(orchestrator),
            conversation: Arc::clone(conversation),
            exchange_index,
            function_call_key: function_call_key.to_string(),
        };

        let executor = match self.locate_tool(&tool_name).await {
            Some(executor) => executor,
            None => {
                progress.fail("Tool not found.").await;
                return;
            }
        };

        self.ensure_initialized(conversation, &tool_name, &executor).await;

        let outcome = AssertUnwindSafe(executor.execute(&progress, &arguments)).catch_unwind().await;
        if outcome.is_err() {
            progress.fail("Tool failed.").await;
            mark_error(conversation, exchange_index, function_call_key).await;
        }
    }

    async fn ensure_initialized(&self, conversation: &ConversationHandle, tool_name: &str, executor: &Arc<dyn ToolExecutor>) {
        let already_initialized = conversation.lock().await.tool_initialized.contains(tool_name);
        if already_initialized {
            return;
        }
        executor.init(conversation).await;
        conversation.lock().await.tool_initialized.insert(tool_name.to_string());
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn mark_error(conversation: &ConversationHandle, exchange_index: usize, function_call_key: &str) {
    let mut conv = conversation.lock().await;
    if let Some(exchange) = conv.exchanges.get_mut(exchange_index) {
        if let Some(fc) = exchange.function_call_by_key_mut(function_call_key) {
            fc.error = true;
            fc.status = FunctionCallStatus::Finished;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::datamodel::{ContentItem, Exchange, FunctionCall};
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::orchestrator::Orchestrator;

    struct RecordingTool;

    #[async_trait]
    impl ToolExecutor for RecordingTool {
        async fn execute(&self, progress: &ToolProgress, arguments: &str) {
            progress.set_content(format!("ran with {}", arguments)).await;
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl ToolExecutor for PanickingTool {
        async fn execute(&self, _progress: &ToolProgress, _arguments: &str) {
            panic!("boom");
        }
    }

    fn test_orchestrator() -> Arc<Orchestrator> {
        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        Orchestrator::new(Vec::new(), library, Arc::new(ToolRegistry::new()))
    }

    async fn seed_function_call(conversation: &ConversationHandle, name: &str, arguments: &str) -> String {
        let mut conv = conversation.lock().await;
        let mut exchange = Exchange::new();
        let fc = FunctionCall::new_in_progress("call_1".to_string(), name.to_string(), arguments.to_string(), None);
        let key = fc.key.clone();
        exchange.items.push(ContentItem::FunctionCall(fc));
        conv.exchanges.push(exchange);
        key
    }

    #[tokio::test]
    async fn execute_runs_located_tool_and_writes_its_content() {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(LocalToolProvider::new().with_tool(
                ToolDescriptor {
                    name: "echo".to_string(),
                    title: None,
                    description: "echo".to_string(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                },
                Arc::new(RecordingTool),
            )))
            .await;

        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = seed_function_call(&conversation, "echo", "{\"x\":1}").await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert_eq!(fc.content, "ran with {\"x\":1}");
        assert!(!fc.error);
    }

    #[tokio::test]
    async fn execute_fails_gracefully_when_tool_is_unknown() {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();

        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = seed_function_call(&conversation, "missing", "{}").await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(fc.error);
        assert_eq!(fc.content, "Tool not found.");
    }

    #[tokio::test]
    async fn execute_catches_a_panicking_tool_and_marks_the_call_finished_with_an_error() {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(LocalToolProvider::new().with_tool(
                ToolDescriptor {
                    name: "boom".to_string(),
                    title: None,
                    description: "boom".to_string(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                },
                Arc::new(PanickingTool),
            )))
            .await;

        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = seed_function_call(&conversation, "boom", "{}").await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(fc.error);
        assert_eq!(fc.status, FunctionCallStatus::Finished);
    }
}
