//! Common contract shared by the three provider adapters (§4.1).
//!
//! Grounded on `examples/original_source/llmulink/llm/provider/provider_abc.py`'s
//! `LLMChatProviderABC` (the `prepare_headers`/`chat_request` split, and the
//! per-provider `asyncio.Semaphore(2)` gating `chat_request` entry).

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::sync::Semaphore;

use crate::cloudllm::orchestrator::{ConversationHandle, Orchestrator};

lazy_static! {
    /// Shared, pooled HTTP client reused by every provider adapter. Mirrors
    /// `src/cloudllm/clients/common.rs`'s `SHARED_HTTP_CLIENT`.
    pub static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(std::time::Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .timeout(std::time::Duration::from_secs(300))
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Default capacity of the counting semaphore gating concurrent requests
/// against a single provider endpoint (§4.1, §5).
pub const DEFAULT_PROVIDER_PERMITS: usize = 2;

/// A provider-specific chat adapter: one of chat-completions, responses, or messages.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Base URL this provider talks to, trailing-slash normalized.
    fn url(&self) -> &str;

    /// HTTP headers for every request, including auth.
    fn prepare_headers(&self) -> HashMap<String, String>;

    /// Counting semaphore gating concurrent `chat_request` calls (§4.1).
    fn semaphore(&self) -> &Semaphore;

    /// Issue one chat request and incrementally mutate `exchange.items` as the
    /// response streams in. Side-effecting only; does not return items.
    async fn chat_request(
        &self,
        orchestrator: &Arc<Orchestrator>,
        conversation: &ConversationHandle,
        exchange_index: usize,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// POST the prepared request body to `<url>tokenize` and, on HTTP 200, return
/// the reported token count. Failure is silent per §4.1 ("some endpoints do
/// not implement it") — callers treat `Ok(None)` and `Err` identically.
pub async fn measure_tokens(
    url: &str,
    headers: &HashMap<String, String>,
    body: &serde_json::Value,
) -> Option<u64> {
    let mut req = SHARED_HTTP_CLIENT.post(format!("{}tokenize", url)).json(body);
    for (k, v) in headers {
        req = req.header(k, v);
    }
    let resp = match req.send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return None,
    };
    let parsed: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(_) => return None,
    };
    parsed
        .get("count")
        .and_then(|v| v.as_u64())
        .or_else(|| parsed.get("token_count").and_then(|v| v.as_u64()))
}

/// Build a fresh, bound semaphore at the default capacity. Each concrete
/// provider struct owns one of these.
pub fn new_semaphore() -> Semaphore {
    Semaphore::new(DEFAULT_PROVIDER_PERMITS)
}

/// `true` for adapter shapes like Anthropic's whose official host requires
/// `X-Api-Key`/`anthropic-version` headers instead of a bearer token.
pub fn is_anthropic_hosted(url: &str) -> bool {
    url.starts_with("https://api.anthropic.com")
}
