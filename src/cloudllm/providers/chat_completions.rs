//! Chat-completions (OpenAI-style) provider adapter (§4.1.1).
//!
//! Grounded on `examples/original_source/llmulink/llm/provider/v1chatcompletition.py`
//! (`V1ChatCompletitionProvider`): system-from-instructions message
//! construction, `_on_llm_chunk`'s delta dispatch, and `_ensure_reasoning_completed`/
//! `_finalize_stream`. Incremental SSE decoding follows
//! `examples/austinjan-km/km-tools/src/llm/anthropic.rs`'s
//! `response.bytes_stream().eventsource()` pattern.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::cloudllm::datamodel::{
    AssistantReasoning, AssistantText, ContentItem, FunctionCall, FunctionCallStatus, TextStatus,
};
use crate::cloudllm::monitor::MonitorEvent;
use crate::cloudllm::orchestrator::{ConversationHandle, Orchestrator};
use crate::cloudllm::provider::{measure_tokens, new_semaphore, ChatProvider, SHARED_HTTP_CLIENT};

/// An OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsProvider {
    url: String,
    api_key: Option<String>,
    semaphore: Semaphore,
}

impl ChatCompletionsProvider {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self {
            url,
            api_key,
            semaphore: new_semaphore(),
        }
    }
}

#[async_trait]
impl ChatProvider for ChatCompletionsProvider {
    fn url(&self) -> &str {
        &self.url
    }

    fn prepare_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(key) = &self.api_key {
            headers.insert("Authorization".to_string(), format!("Bearer {}", key));
        }
        headers
    }

    fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    async fn chat_request(
        &self,
        orchestrator: &Arc<Orchestrator>,
        conversation: &ConversationHandle,
        exchange_index: usize,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let headers = self.prepare_headers();
        let body = build_request_body(conversation, exchange_index).await;

        if let Some(token_count) = measure_tokens(&self.url, &headers, &body).await {
            orchestrator
                .send_update(
                    conversation,
                    MonitorEvent::ChatTokens {
                        token_count,
                        token_max: None,
                    },
                )
                .await;
        }

        let mut request = SHARED_HTTP_CLIENT.post(format!("{}chat/completions", self.url)).json(&body);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("chat-completions HTTP {}: {}", status, text).into());
        }

        let mut decoder = ChunkDecoder::new(orchestrator, conversation, exchange_index);
        let mut event_stream = response.bytes_stream().eventsource();
        while let Some(event) = event_stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("chat-completions stream error: {}", e);
                    break;
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let chunk: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("malformed chat-completions chunk, skipping: {} ({:?})", e, data);
                    continue;
                }
            };
            decoder.on_chunk(&chunk).await?;
        }
        decoder.finalize().await;
        Ok(())
    }
}

/// Build the `messages`/`tools` request body from the conversation's history
/// up to and including `exchange_index`. Mirrors `_build_messages`/`_build_tools`.
async fn build_request_body(conversation: &ConversationHandle, exchange_index: usize) -> Value {
    let conv = conversation.lock().await;

    let mut messages = vec![json!({
        "role": "system",
        "content": conv.instructions_joined(),
    })];

    for exchange in conv.exchanges[..=exchange_index].iter() {
        for item in &exchange.items {
            match item {
                ContentItem::UserMessage(m) => {
                    messages.push(json!({"role": "user", "content": m.content}));
                }
                ContentItem::AssistantText(m) => {
                    messages.push(json!({"role": "assistant", "content": m.content}));
                }
                ContentItem::AssistantReasoning(_) => {}
                ContentItem::FunctionCall(fc) => {
                    messages.push(json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": fc.call_id,
                            "type": "function",
                            "function": {"name": fc.name, "arguments": fc.arguments},
                        }],
                    }));
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": fc.call_id,
                        "content": fc.content,
                    }));
                }
            }
        }
    }

    let tools: Vec<Value> = conv
        .tools
        .values()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect();

    let mut body = json!({
        "model": conv.current_model().unwrap_or_default(),
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

/// Per-stream decoding state, driving `exchange.items` as chunks arrive.
/// Mirrors `_on_llm_chunk`/`_ensure_reasoning_completed`/`_finalize_stream`.
struct ChunkDecoder<'a> {
    orchestrator: &'a Arc<Orchestrator>,
    conversation: &'a ConversationHandle,
    exchange_index: usize,
}

impl<'a> ChunkDecoder<'a> {
    fn new(orchestrator: &'a Arc<Orchestrator>, conversation: &'a ConversationHandle, exchange_index: usize) -> Self {
        Self {
            orchestrator,
            conversation,
            exchange_index,
        }
    }

    async fn on_chunk(&mut self, chunk: &Value) -> Result<(), Box<dyn Error + Send + Sync>> {
        let choice = match chunk.get("choices").and_then(|c| c.get(0)) {
            Some(choice) => choice,
            None => return Ok(()),
        };
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).map(str::to_string);

        // A bare `{"delta":{"role":"assistant"}}` chunk is an initialization
        // signal with no content/tool_calls/reasoning fields to act on; it
        // falls through the checks below as a no-op.
        if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
            if !content.is_empty() {
                self.ensure_reasoning_completed().await;
                self.append_assistant_text(content).await;
            }
        }

        if let Some(reasoning) = delta.get("reasoning").and_then(|v| v.as_str()) {
            if !reasoning.is_empty() {
                self.append_reasoning(reasoning).await;
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            self.ensure_reasoning_completed().await;
            for tool_call in tool_calls {
                self.apply_tool_call_delta(tool_call, finish_reason.is_some()).await?;
            }
        }

        match finish_reason.as_deref() {
            Some("stop") => {
                self.ensure_reasoning_completed().await;
                self.close_assistant_text().await;
            }
            Some("tool_calls") => {
                self.ensure_reasoning_completed().await;
                self.close_in_progress_function_calls().await;
            }
            Some(other) => log::debug!("chat-completions: unhandled finish_reason {:?}", other),
            None => {}
        }

        Ok(())
    }

    async fn ensure_reasoning_completed(&self) {
        let item_json = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            exchange.last_reasoning_mut(Some(TextStatus::InProgress)).map(|r| {
                r.status = TextStatus::Completed;
                ContentItem::AssistantReasoning(r.clone()).to_json()
            })
        };
        if let Some(item) = item_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item }).await;
        }
    }

    async fn append_assistant_text(&self, text: &str) {
        let (key, appended_json) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            if let Some(existing) = exchange.last_assistant_text_mut(Some(TextStatus::InProgress)) {
                existing.content.push_str(text);
                (existing.key.clone(), None)
            } else {
                let mut item = AssistantText::new_in_progress(None);
                item.content.push_str(text);
                let key = item.key.clone();
                let json = ContentItem::AssistantText(item.clone()).to_json();
                exchange.items.push(ContentItem::AssistantText(item));
                (key, Some(json))
            }
        };
        if let Some(item) = appended_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemAppended { item }).await;
        }
        self.orchestrator
            .send_update(
                self.conversation,
                MonitorEvent::ItemDelta { key, delta: text.to_string() },
            )
            .await;
    }

    async fn append_reasoning(&self, text: &str) {
        let (key, appended_json) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            if let Some(existing) = exchange.last_reasoning_mut(Some(TextStatus::InProgress)) {
                existing.content.push_str(text);
                (existing.key.clone(), None)
            } else {
                let mut item = AssistantReasoning::new_in_progress(None);
                item.content.push_str(text);
                let key = item.key.clone();
                let json = ContentItem::AssistantReasoning(item.clone()).to_json();
                exchange.items.push(ContentItem::AssistantReasoning(item));
                (key, Some(json))
            }
        };
        if let Some(item) = appended_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemAppended { item }).await;
        }
        self.orchestrator
            .send_update(
                self.conversation,
                MonitorEvent::ItemDelta { key, delta: text.to_string() },
            )
            .await;
    }

    async fn apply_tool_call_delta(&self, tool_call: &Value, finish_present: bool) -> Result<(), Box<dyn Error + Send + Sync>> {
        let index = match tool_call.get("index").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return Ok(()),
        };
        let call_id = tool_call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let function = tool_call.get("function");
        let name = function.and_then(|f| f.get("name")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let arguments_piece = function
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        enum Outcome {
            Created { item_json: Value, key: String, arguments: String },
            Updated { key: String, arguments: String },
        }

        let outcome = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return Ok(()),
            };

            let matches = exchange.count_function_calls_by_index(index);
            if matches > 1 {
                return Err(format!("multiple FunctionCall items matched tool_call index {}", index).into());
            }

            if let Some(existing) = exchange.function_call_by_index_mut(index) {
                if finish_present {
                    existing.arguments = arguments_piece.clone();
                } else {
                    existing.arguments.push_str(&arguments_piece);
                }
                Outcome::Updated {
                    key: existing.key.clone(),
                    arguments: arguments_piece,
                }
            } else {
                let fc = FunctionCall::new_in_progress(call_id, name, arguments_piece.clone(), Some(index));
                let key = fc.key.clone();
                let item_json = ContentItem::FunctionCall(fc.clone()).to_json();
                exchange.items.push(ContentItem::FunctionCall(fc));
                Outcome::Created {
                    item_json,
                    key,
                    arguments: arguments_piece,
                }
            }
        };

        match outcome {
            Outcome::Created { item_json, key, arguments } => {
                self.orchestrator.send_update(self.conversation, MonitorEvent::ItemAppended { item: item_json }).await;
                self.orchestrator
                    .send_update(self.conversation, MonitorEvent::ItemArgumentsDelta { key, arguments })
                    .await;
            }
            Outcome::Updated { key, arguments } => {
                self.orchestrator
                    .send_update(self.conversation, MonitorEvent::ItemArgumentsDelta { key, arguments })
                    .await;
            }
        }
        Ok(())
    }

    async fn close_assistant_text(&self) {
        let item_json = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            exchange.last_assistant_text_mut(Some(TextStatus::InProgress)).map(|m| {
                m.status = TextStatus::Completed;
                ContentItem::AssistantText(m.clone()).to_json()
            })
        };
        if let Some(item) = item_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item }).await;
        }
    }

    /// Close every still-in-progress FunctionCall and hand each to the
    /// orchestrator's function-call execution path.
    async fn close_in_progress_function_calls(&self) {
        let completed_keys: Vec<(String, Value)> = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            exchange
                .items
                .iter_mut()
                .filter_map(|item| match item {
                    ContentItem::FunctionCall(fc) if fc.status == FunctionCallStatus::InProgress => {
                        fc.status = FunctionCallStatus::Completed;
                        Some((fc.key.clone(), ContentItem::FunctionCall(fc.clone()).to_json()))
                    }
                    _ => None,
                })
                .collect()
        };
        for (key, item_json) in completed_keys {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item: item_json }).await;
            self.orchestrator.create_function_call(self.conversation, self.exchange_index, key).await;
        }
    }

    /// Stream ended (`[DONE]` or connection close): close whatever is still
    /// in-progress. Mirrors `_finalize_stream`.
    async fn finalize(&mut self) {
        self.close_assistant_text().await;
        self.close_in_progress_function_calls().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::datamodel::UserMessage;
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::tool_registry::{LocalToolProvider, ToolExecutor, ToolProgress, ToolRegistry};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A tool that just echoes back a fixed result, for driving a tool-call
    /// round trip through the orchestrator without a real sandbox.
    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, progress: &ToolProgress, _arguments: &str) {
            progress.set_content("echoed".to_string()).await;
        }
    }

    async fn mock_provider(server: &MockServer) -> ChatCompletionsProvider {
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "gpt-test"}],
            })))
            .mount(server)
            .await;
        ChatCompletionsProvider::new(format!("{}/v1/", server.uri()), None)
    }

    #[tokio::test]
    async fn plain_completion_produces_one_completed_assistant_text() {
        let server = MockServer::start().await;
        let provider = mock_provider(&server).await;

        let sse_body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let tool_registry = Arc::new(ToolRegistry::new());
        let orchestrator = Orchestrator::new(vec![Arc::new(provider)], library, tool_registry);
        let conversation = orchestrator.create_conversation().await.unwrap();
        orchestrator
            .create_exchange(&conversation, UserMessage::new("hi".to_string(), "gpt-test".to_string()))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let conv = conversation.lock().await;
        let exchange = &conv.exchanges[0];
        let text = exchange
            .items
            .iter()
            .find_map(|item| match item {
                ContentItem::AssistantText(m) => Some(m),
                _ => None,
            })
            .expect("assistant text item");
        assert_eq!(text.content, "Hello");
        assert_eq!(text.status, TextStatus::Completed);
    }

    #[tokio::test]
    async fn partial_stream_without_done_is_finalized_to_completed() {
        let server = MockServer::start().await;
        let provider = mock_provider(&server).await;

        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let tool_registry = Arc::new(ToolRegistry::new());
        let orchestrator = Orchestrator::new(vec![Arc::new(provider)], library, tool_registry);
        let conversation = orchestrator.create_conversation().await.unwrap();
        orchestrator
            .create_exchange(&conversation, UserMessage::new("hi".to_string(), "gpt-test".to_string()))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let conv = conversation.lock().await;
        let text = conv.exchanges[0]
            .items
            .iter()
            .find_map(|item| match item {
                ContentItem::AssistantText(m) => Some(m),
                _ => None,
            })
            .expect("assistant text item");
        assert_eq!(text.content, "Hello");
        assert_eq!(text.status, TextStatus::Completed);
    }

    #[tokio::test]
    async fn tool_call_finish_reopens_a_follow_up_exchange() {
        let server = MockServer::start().await;
        let provider = mock_provider(&server).await;

        let tool_call_body = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\
\"function\":{\"name\":\"echo\",\"arguments\":\"{}\"}}]}}]}\n\n\
data: {\"choices\":[{\"finish_reason\":\"tool_calls\"}]}\n\n\
data: [DONE]\n\n";
        let follow_up_body = "data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\n\
data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(tool_call_body, "text/event-stream"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(follow_up_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let tool_registry = Arc::new(ToolRegistry::new());
        tool_registry
            .add_provider(Arc::new(LocalToolProvider::new().with_tool(
                crate::cloudllm::datamodel::ToolDescriptor {
                    name: "echo".to_string(),
                    title: None,
                    description: "echoes back a fixed result".to_string(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                },
                Arc::new(EchoTool),
            )))
            .await;
        let orchestrator = Orchestrator::new(vec![Arc::new(provider)], library, tool_registry);
        let conversation = orchestrator.create_conversation().await.unwrap();
        orchestrator
            .create_exchange(&conversation, UserMessage::new("hi".to_string(), "gpt-test".to_string()))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let conv = conversation.lock().await;
        assert_eq!(conv.exchanges.len(), 2, "tool call should have reopened a follow-up exchange");

        let fc = conv.exchanges[0]
            .items
            .iter()
            .find_map(|item| match item {
                ContentItem::FunctionCall(m) => Some(m),
                _ => None,
            })
            .expect("function call item");
        assert_eq!(fc.status, FunctionCallStatus::Finished);
        assert!(!fc.error);
        assert_eq!(fc.content, "echoed");

        let text = conv.exchanges[1]
            .items
            .iter()
            .find_map(|item| match item {
                ContentItem::AssistantText(m) => Some(m),
                _ => None,
            })
            .expect("follow-up assistant text item");
        assert_eq!(text.content, "done");
    }
}
