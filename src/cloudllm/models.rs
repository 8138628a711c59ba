//! Model discovery: `/v1/models` fan-out across configured providers.
//!
//! Grounded on `examples/original_source/llmulink/llm/svc_router.py`'s
//! `get_models`, which gathers every provider's model list concurrently via
//! `asyncio.TaskGroup`. `tokio::task::JoinSet` is the idiomatic Rust
//! replacement for that fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cloudllm::provider::{ChatProvider, SHARED_HTTP_CLIENT};

#[derive(Debug)]
pub enum ModelsError {
    Request(String),
    Decode(String),
}

impl std::fmt::Display for ModelsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelsError::Request(msg) => write!(f, "model listing request failed: {}", msg),
            ModelsError::Decode(msg) => write!(f, "model listing response malformed: {}", msg),
        }
    }
}

impl std::error::Error for ModelsError {}

/// List every model id `<url>models` reports, in the OpenAI `{"data": [{"id": ...}]}` shape.
pub async fn list_models(url: &str, headers: &HashMap<String, String>) -> Result<Vec<String>, ModelsError> {
    let mut request = SHARED_HTTP_CLIENT.get(format!("{}models", url));
    for (key, value) in headers {
        request = request.header(key, value);
    }
    let response = request
        .send()
        .await
        .map_err(|e| ModelsError::Request(e.to_string()))?
        .error_for_status()
        .map_err(|e| ModelsError::Request(e.to_string()))?;

    let body: serde_json::Value = response.json().await.map_err(|e| ModelsError::Decode(e.to_string()))?;
    let data = body
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ModelsError::Decode("missing \"data\" array".to_string()))?;

    Ok(data
        .iter()
        .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()).map(|s| s.to_string()))
        .collect())
}

/// Concatenate every model advertised by any configured provider, deduplicated.
pub async fn collect_models(providers: &[Arc<dyn ChatProvider>]) -> Vec<String> {
    let mut set = tokio::task::JoinSet::new();
    for provider in providers {
        let url = provider.url().to_string();
        let headers = provider.prepare_headers();
        set.spawn(async move { list_models(&url, &headers).await });
    }

    let mut seen = std::collections::HashSet::new();
    let mut models = Vec::new();
    while let Some(result) = set.join_next().await {
        match result {
            Ok(Ok(provider_models)) => {
                for model in provider_models {
                    if seen.insert(model.clone()) {
                        models.push(model);
                    }
                }
            }
            Ok(Err(e)) => log::warn!("model listing failed: {}", e),
            Err(e) => log::error!("model listing task panicked: {}", e),
        }
    }
    models
}
