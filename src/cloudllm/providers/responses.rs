//! Responses (OpenAI "responses" style) provider adapter (§4.1.2).
//!
//! The source references a `v1response` provider but its body was not part of
//! the retrieval pack; this adapter reconstructs the dialect from the real
//! OpenAI Responses streaming API shape per the resolved open question in
//! SPEC_FULL.md §9: every record is a bare `data: {...}` chunk keyed by
//! `"type"` (standing in for an SSE `event:` line) and `"output_index"`
//! (standing in for the messages adapter's `index`). Structure otherwise
//! follows `chat_completions.rs`'s decoder shape; streaming plumbing follows
//! `examples/austinjan-km/km-tools/src/llm/anthropic.rs`.

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

/// An OpenAI-compatible `/responses` endpoint.
pub struct ResponsesProvider {
    url: String,
    api_key: Option<String>,
    semaphore: Semaphore,
}

impl ResponsesProvider {
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
impl ChatProvider for ResponsesProvider {
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

        let mut request = SHARED_HTTP_CLIENT.post(format!("{}responses", self.url)).json(&body);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("responses HTTP {}: {}", status, text).into());
        }

        let mut decoder = ChunkDecoder::new(orchestrator, conversation, exchange_index);
        let mut event_stream = response.bytes_stream().eventsource();
        while let Some(event) = event_stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("responses stream error: {}", e);
                    break;
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            let chunk: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("malformed responses chunk, skipping: {} ({:?})", e, data);
                    continue;
                }
            };
            let chunk_type = chunk.get("type").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if chunk_type == "response.completed" {
                break;
            }
            decoder.on_chunk(&chunk_type, &chunk).await;
        }
        decoder.finalize().await;
        Ok(())
    }
}

async fn build_request_body(conversation: &ConversationHandle, exchange_index: usize) -> Value {
    let conv = conversation.lock().await;

    let mut input = Vec::new();
    for exchange in conv.exchanges[..=exchange_index].iter() {
        for item in &exchange.items {
            match item {
                ContentItem::UserMessage(m) => input.push(json!({"role": "user", "content": m.content})),
                ContentItem::AssistantText(m) => input.push(json!({"role": "assistant", "content": m.content})),
                ContentItem::AssistantReasoning(_) => {}
                ContentItem::FunctionCall(fc) => {
                    input.push(json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": fc.call_id,
                            "type": "function",
                            "function": {"name": fc.name, "arguments": fc.arguments},
                        }],
                    }));
                    input.push(json!({"role": "tool", "tool_call_id": fc.call_id, "content": fc.content}));
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
                "function": {"name": t.name, "description": t.description, "parameters": t.parameters},
            })
        })
        .collect();

    let mut body = json!({
        "model": conv.current_model().unwrap_or_default(),
        "instructions": conv.instructions_joined(),
        "input": input,
        "stream": true,
    });
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

/// Index-keyed decoding state. Every item kind is located by `output_index`
/// rather than by "is there an in-progress item of this kind" inference, so
/// concurrently streaming text/reasoning/tool-call blocks never collide.
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

    async fn on_chunk(&mut self, chunk_type: &str, chunk: &Value) {
        let output_index = match chunk.get("output_index").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return,
        };
        match chunk_type {
            "response.output_text.delta" => {
                if let Some(delta) = chunk.get("delta").and_then(|v| v.as_str()) {
                    self.append_text(output_index, delta).await;
                }
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(delta) = chunk.get("delta").and_then(|v| v.as_str()) {
                    self.append_reasoning(output_index, delta).await;
                }
            }
            "response.function_call_arguments.delta" => {
                let delta = chunk.get("delta").and_then(|v| v.as_str()).unwrap_or_default();
                let call_id = chunk.get("item_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let name = chunk.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                self.append_function_call_arguments(output_index, call_id, name, delta).await;
            }
            other => log::trace!("responses: unhandled chunk type {:?}", other),
        }
    }

    async fn append_text(&self, index: u32, delta: &str) {
        let (key, appended_json) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            if let Some(ContentItem::AssistantText(existing)) = exchange.item_by_index_mut(index) {
                existing.content.push_str(delta);
                (existing.key.clone(), None)
            } else {
                let mut item = AssistantText::new_in_progress(Some(index));
                item.content.push_str(delta);
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
            .send_update(self.conversation, MonitorEvent::ItemDelta { key, delta: delta.to_string() })
            .await;
    }

    async fn append_reasoning(&self, index: u32, delta: &str) {
        let (key, appended_json) = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            if let Some(ContentItem::AssistantReasoning(existing)) = exchange.item_by_index_mut(index) {
                existing.content.push_str(delta);
                (existing.key.clone(), None)
            } else {
                let mut item = AssistantReasoning::new_in_progress(Some(index));
                item.content.push_str(delta);
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
            .send_update(self.conversation, MonitorEvent::ItemDelta { key, delta: delta.to_string() })
            .await;
    }

    async fn append_function_call_arguments(&self, index: u32, call_id: String, name: String, delta: &str) {
        enum Outcome {
            Created { item_json: Value, key: String },
            Updated { key: String },
        }
        let outcome = {
            let mut conv = self.conversation.lock().await;
            let exchange = match conv.exchanges.get_mut(self.exchange_index) {
                Some(e) => e,
                None => return,
            };
            if let Some(existing) = exchange.function_call_by_index_mut(index) {
                existing.arguments.push_str(delta);
                Outcome::Updated { key: existing.key.clone() }
            } else {
                let fc = FunctionCall::new_in_progress(call_id, name, delta.to_string(), Some(index));
                let key = fc.key.clone();
                let item_json = ContentItem::FunctionCall(fc.clone()).to_json();
                exchange.items.push(ContentItem::FunctionCall(fc));
                Outcome::Created { item_json, key }
            }
        };
        match outcome {
            Outcome::Created { item_json, key } => {
                self.orchestrator.send_update(self.conversation, MonitorEvent::ItemAppended { item: item_json }).await;
                self.orchestrator
                    .send_update(
                        self.conversation,
                        MonitorEvent::ItemArgumentsDelta { key, arguments: delta.to_string() },
                    )
                    .await;
            }
            Outcome::Updated { key } => {
                self.orchestrator
                    .send_update(
                        self.conversation,
                        MonitorEvent::ItemArgumentsDelta { key, arguments: delta.to_string() },
                    )
                    .await;
            }
        }
    }

    /// `response.completed` or connection close: close every still-in-progress
    /// item, handing function calls to the orchestrator.
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
