//! Messages (Anthropic-style) provider adapter (§4.1.3).
//!
//! Grounded on `examples/original_source/llmulink/llm/provider/v1messages.py`
//! (`V1MessagesProvider`): request-body shape (`system`, `tool_use`/`tool_result`
//! message pairing, `thinking` budget), and the event-typed SSE dispatch table.
//! Incremental decoding follows `examples/austinjan-km/km-tools/src/llm/anthropic.rs`'s
//! `response.bytes_stream().eventsource()` pattern, including its `event.event`
//! dispatch on named SSE events (as opposed to the other two dialects' bare
//! `data:`-only framing).

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
use crate::cloudllm::provider::{is_anthropic_hosted, measure_tokens, new_semaphore, ChatProvider, SHARED_HTTP_CLIENT};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 40 * 1024;
const THINKING_BUDGET_TOKENS: u32 = 10_000;

/// An Anthropic-compatible `/v1/messages` endpoint (the official host, or a
/// self-hosted gateway speaking the same dialect).
pub struct MessagesProvider {
    url: String,
    api_key: Option<String>,
    semaphore: Semaphore,
}

impl MessagesProvider {
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
impl ChatProvider for MessagesProvider {
    fn url(&self) -> &str {
        &self.url
    }

    fn prepare_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if is_anthropic_hosted(&self.url) {
            headers.insert("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string());
            if let Some(key) = &self.api_key {
                headers.insert("X-Api-Key".to_string(), key.clone());
            }
        } else if let Some(key) = &self.api_key {
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

        let mut request = SHARED_HTTP_CLIENT.post(format!("{}messages", self.url)).json(&body);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("messages HTTP {}: {}", status, text).into());
        }

        let mut decoder = ChunkDecoder::new(orchestrator, conversation, exchange_index);
        let mut event_stream = response.bytes_stream().eventsource();
        while let Some(event) = event_stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("messages stream error: {}", e);
                    break;
                }
            };
            if event.event == "message_stop" {
                break;
            }
            let data = event.data.trim();
            let payload: Value = if data.is_empty() {
                Value::Null
            } else {
                match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("malformed messages chunk, skipping: {} ({:?})", e, data);
                        continue;
                    }
                }
            };
            decoder.on_event(&event.event, &payload).await;
        }
        decoder.finalize().await;
        Ok(())
    }
}

async fn build_request_body(conversation: &ConversationHandle, exchange_index: usize) -> Value {
    let conv = conversation.lock().await;

    let mut messages = Vec::new();
    for exchange in conv.exchanges[..=exchange_index].iter() {
        for item in &exchange.items {
            match item {
                ContentItem::UserMessage(m) => messages.push(json!({"role": "user", "content": m.content})),
                ContentItem::AssistantText(m) => messages.push(json!({"role": "assistant", "content": m.content})),
                ContentItem::AssistantReasoning(_) => {}
                ContentItem::FunctionCall(fc) => {
                    let input: Value = if fc.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&fc.arguments).unwrap_or(json!({}))
                    };
                    messages.push(json!({
                        "role": "assistant",
                        "content": [{"type": "tool_use", "id": fc.call_id, "name": fc.name, "input": input}],
                    }));
                    messages.push(json!({
                        "role": "user",
                        "content": [{"type": "tool_result", "tool_use_id": fc.call_id, "content": fc.content}],
                    }));
                }
            }
        }
    }

    let tools: Vec<Value> = conv
        .tools
        .values()
        .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
        .collect();

    let mut body = json!({
        "model": conv.current_model().unwrap_or_default(),
        "system": conv.instructions_joined(),
        "messages": messages,
        "max_tokens": MAX_TOKENS,
        "stream": true,
        "thinking": {"type": "enabled", "budget_tokens": THINKING_BUDGET_TOKENS},
    });
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

/// Event-typed decoding state, dispatched on the SSE `event:` name rather than
/// a `"type"` field embedded in the JSON payload (unlike the other two dialects).
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

    async fn on_event(&mut self, event_name: &str, data: &Value) {
        match event_name {
            "message_start" => {
                if let Some(input_tokens) = data.pointer("/message/usage/input_tokens").and_then(|v| v.as_u64()) {
                    self.orchestrator
                        .send_update(
                            self.conversation,
                            MonitorEvent::ChatTokens {
                                token_count: input_tokens,
                                token_max: None,
                            },
                        )
                        .await;
                }
            }
            "message_delta" => {
                if let Some(output_tokens) = data.pointer("/usage/output_tokens").and_then(|v| v.as_u64()) {
                    self.orchestrator
                        .send_update(
                            self.conversation,
                            MonitorEvent::ChatTokens {
                                token_count: output_tokens,
                                token_max: None,
                            },
                        )
                        .await;
                }
            }
            "message_stop" => {}
            "content_block_start" => self.on_content_block_start(data).await,
            "content_block_delta" => self.on_content_block_delta(data).await,
            "content_block_stop" => self.on_content_block_stop(data).await,
            "ping" => {}
            "error" => log::warn!("messages stream reported an error event: {}", data),
            other => log::warn!("messages: unhandled SSE event {:?}", other),
        }
    }

    async fn on_content_block_start(&self, data: &Value) {
        let index = match data.get("index").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return,
        };
        let block = match data.get("content_block") {
            Some(b) => b,
            None => return,
        };
        let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or_default();

        let item_json = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            match block_type {
                "text" => {
                    let mut item = AssistantText::new_in_progress(Some(index));
                    item.content = block.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let json = ContentItem::AssistantText(item.clone()).to_json();
                    exchange.items.push(ContentItem::AssistantText(item));
                    Some(json)
                }
                "thinking" => {
                    let mut item = AssistantReasoning::new_in_progress(Some(index));
                    item.content = block.get("thinking").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let json = ContentItem::AssistantReasoning(item.clone()).to_json();
                    exchange.items.push(ContentItem::AssistantReasoning(item));
                    Some(json)
                }
                "tool_use" => {
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments = match block.get("input") {
                        Some(input) if input != &json!({}) => input.to_string(),
                        _ => String::new(),
                    };
                    let item = FunctionCall::new_in_progress(call_id, name, arguments, Some(index));
                    let json = ContentItem::FunctionCall(item.clone()).to_json();
                    exchange.items.push(ContentItem::FunctionCall(item));
                    Some(json)
                }
                other => {
                    log::warn!("messages: unhandled content_block type {:?}", other);
                    None
                }
            }
        };
        if let Some(item) = item_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemAppended { item }).await;
        }
    }

    async fn on_content_block_delta(&self, data: &Value) {
        let index = match data.get("index").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return,
        };
        let delta = match data.get("delta") {
            Some(d) => d,
            None => return,
        };
        let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or_default();

        match delta_type {
            "text_delta" => {
                let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                if let Some(key) = self.append_to_item_at_index(index, text, false).await {
                    self.orchestrator
                        .send_update(self.conversation, MonitorEvent::ItemDelta { key, delta: text.to_string() })
                        .await;
                }
            }
            "thinking_delta" => {
                let text = delta.get("thinking").and_then(|v| v.as_str()).unwrap_or_default();
                if let Some(key) = self.append_to_item_at_index(index, text, false).await {
                    self.orchestrator
                        .send_update(self.conversation, MonitorEvent::ItemDelta { key, delta: text.to_string() })
                        .await;
                }
            }
            "input_json_delta" => {
                let fragment = delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or_default();
                // Arguments deltas are not publicly emitted (§4.1.3).
                self.append_to_item_at_index(index, fragment, true).await;
            }
            other => log::warn!("messages: unhandled content_block_delta type {:?}", other),
        }
    }

    /// Append `text` to whichever item kind lives at `index`; returns the
    /// item's key unless it's a FunctionCall (arguments deltas are silent).
    async fn append_to_item_at_index(&self, index: u32, text: &str, is_arguments: bool) -> Option<String> {
        let mut conv = self.conversation.lock().await;
        let exchange = conv.exchanges.get_mut(self.exchange_index)?;
        match exchange.item_by_index_mut(index)? {
            ContentItem::AssistantText(m) => {
                m.content.push_str(text);
                (!is_arguments).then(|| m.key.clone())
            }
            ContentItem::AssistantReasoning(m) => {
                m.content.push_str(text);
                (!is_arguments).then(|| m.key.clone())
            }
            ContentItem::FunctionCall(m) => {
                m.arguments.push_str(text);
                None
            }
            ContentItem::UserMessage(_) => None,
        }
    }

    async fn on_content_block_stop(&mut self, data: &Value) {
        let index = match data.get("index").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return,
        };
        let (item_json, function_call_key) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            match exchange.item_by_index_mut(index) {
                Some(ContentItem::AssistantText(m)) => {
                    m.status = TextStatus::Completed;
                    (Some(ContentItem::AssistantText(m.clone()).to_json()), None)
                }
                Some(ContentItem::AssistantReasoning(m)) => {
                    m.status = TextStatus::Completed;
                    (Some(ContentItem::AssistantReasoning(m.clone()).to_json()), None)
                }
                Some(ContentItem::FunctionCall(m)) => {
                    m.status = FunctionCallStatus::Completed;
                    (Some(ContentItem::FunctionCall(m.clone()).to_json()), Some(m.key.clone()))
                }
                _ => (None, None),
            }
        };
        if let Some(item) = item_json {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item }).await;
        }
        if let Some(key) = function_call_key {
            self.orchestrator.create_function_call(self.conversation, self.exchange_index, key).await;
        }
    }

    /// Connection closed without `message_stop`: close whatever is still in
    /// progress, same as the other two dialects' finalization rule.
    async fn finalize(&mut self) {
        let (texts, reasonings, function_calls) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            let mut texts = Vec::new();
            let mut reasonings = Vec::new();
            let mut function_calls = Vec::new();
            for item in exchange.items.iter_mut() {
                match item {
                    ContentItem::AssistantText(m) if m.status == TextStatus::InProgress => {
                        m.status = TextStatus::Completed;
                        texts.push(ContentItem::AssistantText(m.clone()).to_json());
                    }
                    ContentItem::AssistantReasoning(m) if m.status == TextStatus::InProgress => {
                        m.status = TextStatus::Completed;
                        reasonings.push(ContentItem::AssistantReasoning(m.clone()).to_json());
                    }
                    ContentItem::FunctionCall(fc) if fc.status == FunctionCallStatus::InProgress => {
                        fc.status = FunctionCallStatus::Completed;
                        function_calls.push((fc.key.clone(), ContentItem::FunctionCall(fc.clone()).to_json()));
                    }
                    _ => {}
                }
            }
            (texts, reasonings, function_calls)
        };
        for item in texts.into_iter().chain(reasonings) {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item }).await;
        }
        for (key, item_json) in function_calls {
            self.orchestrator.send_update(self.conversation, MonitorEvent::ItemUpdated { item: item_json }).await;
            self.orchestrator.create_function_call(self.conversation, self.exchange_index, key).await;
        }
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

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, progress: &ToolProgress, _arguments: &str) {
            progress.set_content("echoed".to_string()).await;
        }
    }

    #[test]
    fn prepare_headers_uses_x_api_key_for_anthropic_hosted_url() {
        let provider = MessagesProvider::new("https://api.anthropic.com/v1/", Some("secret".to_string()));
        let headers = provider.prepare_headers();
        assert_eq!(headers.get("X-Api-Key"), Some(&"secret".to_string()));
        assert_eq!(headers.get("anthropic-version"), Some(&ANTHROPIC_VERSION.to_string()));
        assert!(headers.get("Authorization").is_none());
    }

    #[test]
    fn prepare_headers_uses_bearer_for_self_hosted_url() {
        let provider = MessagesProvider::new("https://gateway.internal/v1/", Some("secret".to_string()));
        let headers = provider.prepare_headers();
        assert_eq!(headers.get("Authorization"), Some(&"Bearer secret".to_string()));
        assert!(headers.get("X-Api-Key").is_none());
    }

    #[tokio::test]
    async fn mid_stream_reasoning_then_text_both_complete_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "claude-test"}],
            })))
            .mount(&server)
            .await;

        let sse_body = "event: content_block_start\n\
data: {\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"abc\"}}\n\n\
event: content_block_delta\n\
data: {\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"def\"}}\n\n\
event: content_block_stop\n\
data: {\"index\":0}\n\n\
event: content_block_start\n\
data: {\"index\":1,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"answer\"}}\n\n\
event: content_block_stop\n\
data: {\"index\":1}\n\n\
event: message_stop\n\
data: {}\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider = MessagesProvider::new(format!("{}/v1/", server.uri()), None);
        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let tool_registry = Arc::new(ToolRegistry::new());
        let orchestrator = Orchestrator::new(vec![Arc::new(provider)], library, tool_registry);
        let conversation = orchestrator.create_conversation().await.unwrap();
        orchestrator
            .create_exchange(&conversation, UserMessage::new("hi".to_string(), "claude-test".to_string()))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let conv = conversation.lock().await;
        let items: Vec<&ContentItem> = conv.exchanges[0]
            .items
            .iter()
            .filter(|item| matches!(item, ContentItem::AssistantReasoning(_) | ContentItem::AssistantText(_)))
            .collect();
        assert_eq!(items.len(), 2);
        match items[0] {
            ContentItem::AssistantReasoning(m) => {
                assert_eq!(m.content, "abcdef");
                assert_eq!(m.status, TextStatus::Completed);
            }
            _ => panic!("expected reasoning first"),
        }
        match items[1] {
            ContentItem::AssistantText(m) => {
                assert_eq!(m.content, "answer");
                assert_eq!(m.status, TextStatus::Completed);
            }
            _ => panic!("expected text second"),
        }
    }

    #[tokio::test]
    async fn tool_use_finish_reopens_a_follow_up_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "claude-test"}],
            })))
            .mount(&server)
            .await;

        let tool_use_body = "event: content_block_start\n\
data: {\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"call_1\",\"name\":\"echo\",\"input\":{}}}\n\n\
event: content_block_stop\n\
data: {\"index\":0}\n\n\
event: message_stop\n\
data: {}\n\n";
        let follow_up_body = "event: content_block_start\n\
data: {\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"done\"}}\n\n\
event: content_block_stop\n\
data: {\"index\":0}\n\n\
event: message_stop\n\
data: {}\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(tool_use_body, "text/event-stream"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(follow_up_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider = MessagesProvider::new(format!("{}/v1/", server.uri()), None);
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
            .create_exchange(&conversation, UserMessage::new("hi".to_string(), "claude-test".to_string()))
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
