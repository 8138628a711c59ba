//! The REST tool: a function call backed by a configured HTTP request.
//!
//! Grounded on `examples/original_source/llmulink/tool/provider/function_call/rest.py`
//! (`FunctionCallRest.__call__`) and `rest_datamodel.py` (`RestRequest`/
//! `RestResponse`). Template evaluation (`$`-prefixed path expressions for
//! the path, headers, query, body, and response content) is
//! `crate::cloudllm::template`'s narrower stand-in for the original's
//! JSONata usage — see that module's doc comment.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::cloudllm::datamodel::ToolDescriptor;
use crate::cloudllm::provider::SHARED_HTTP_CLIENT;
use crate::cloudllm::template::{self, CompiledDict, CompiledValue};
use crate::cloudllm::tool_registry::{ToolExecutor, ToolProgress};

/// A response template selected either by an exact HTTP status code or by
/// the `_` fallback key.
pub struct RestResponseConfig {
    /// Literal text, or a `$`-prefixed path expression evaluated against
    /// `{parameters, arguments, response}`.
    pub content: String,
    pub error: bool,
}

/// Static configuration for one REST-backed tool, analogous to a YAML
/// `function_call: {type: rest, ...}` block.
pub struct RestToolConfig {
    pub name: String,
    pub title: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub base_url: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
    /// Keyed by HTTP status code; `None` (the `_` key) is the fallback.
    pub responses: HashMap<Option<u16>, RestResponseConfig>,
}

pub struct RestTool {
    config: RestToolConfig,
    compiled_headers: CompiledDict,
    compiled_query: CompiledDict,
    compiled_path: CompiledValue,
    compiled_body: Option<CompiledValue>,
}

impl RestTool {
    pub fn new(config: RestToolConfig) -> Self {
        let compiled_headers = CompiledDict::compile(&config.headers);
        let compiled_query = CompiledDict::compile(&config.query);
        let compiled_path = template::compile_value(&config.path);
        let compiled_body = config.body.as_deref().map(template::compile_value);
        Self {
            config,
            compiled_headers,
            compiled_query,
            compiled_path,
            compiled_body,
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.config.name.clone(),
            title: Some(self.config.title.clone()),
            description: self.config.description.clone(),
            parameters: self.config.parameters_schema.clone(),
        }
    }
}

#[async_trait]
impl ToolExecutor for RestTool {
    async fn execute(&self, progress: &ToolProgress, arguments: &str) {
        let parsed_arguments: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(_) => {
                progress.fail("Exception occurred while parsing arguments.").await;
                return;
            }
        };

        let mut params = json!({
            "parameters": parsed_arguments,
            "arguments": parsed_arguments,
        });

        let headers = match self.compiled_headers.evaluate(&params) {
            Ok(headers) => headers,
            Err(e) => {
                progress.fail(&format!("Failed to build request headers: {}", e)).await;
                return;
            }
        };
        let query = match self.compiled_query.evaluate(&params) {
            Ok(query) => query,
            Err(e) => {
                progress.fail(&format!("Failed to build request query: {}", e)).await;
                return;
            }
        };

        let mut path = match resolve_value(&self.compiled_path, &params) {
            Ok(Some(template::Resolved::Text(text))) => text,
            _ => {
                progress.fail("Failed to resolve request path.").await;
                return;
            }
        };
        if !path.starts_with('/') {
            path = format!("/{}", path);
        }

        let body = self
            .compiled_body
            .as_ref()
            .and_then(|compiled| resolve_value(compiled, &params).ok().flatten());

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = SHARED_HTTP_CLIENT.request(
            self.config
                .method
                .parse()
                .unwrap_or(reqwest::Method::GET),
            url,
        );
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        request = request.query(&query);
        request = match body {
            Some(template::Resolved::Json(value)) => request.json(&value),
            Some(template::Resolved::Text(text)) => request.body(text),
            None => request,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("REST tool {} request failed: {}", self.config.name, e);
                progress.fail(&format!("Request failed: {}", e)).await;
                return;
            }
        };

        let status = response.status().as_u16();
        let response_config = self
            .config
            .responses
            .get(&Some(status))
            .or_else(|| self.config.responses.get(&None));
        let response_config = match response_config {
            Some(config) => config,
            None => {
                progress
                    .fail(&format!("Tool execution failed with the status code: {}", status))
                    .await;
                return;
            }
        };

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with("application/json"));
        let response_value = if is_json {
            response.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::String(response.text().await.unwrap_or_default())
        };
        params["response"] = response_value;

        let content = match template::compile_value(&response_config.content) {
            template::CompiledValue::Literal(text) => text,
            template::CompiledValue::Path(expr) => template::evaluate_path(&expr, &params)
                .ok()
                .flatten()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_default(),
        };

        if response_config.error {
            progress.fail(&content).await;
        } else {
            progress.set_content(content).await;
        }
    }
}

/// Resolve a compiled path/body value: literal text stays text; a path
/// expression keeps structured JSON if the result isn't a plain string (for
/// request bodies), matching `rest.py`'s "if isinstance(body, dict):
/// json.dumps(body)" handling.
fn resolve_value(
    value: &CompiledValue,
    params: &serde_json::Value,
) -> Result<Option<template::Resolved>, crate::cloudllm::template::TemplateError> {
    match value {
        CompiledValue::Literal(text) => Ok(Some(template::Resolved::Text(text.clone()))),
        CompiledValue::Path(expr) => Ok(template::evaluate_path(expr, params)?.map(|v| match v {
            serde_json::Value::String(s) => template::Resolved::Text(s),
            other => template::Resolved::Json(other),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cloudllm::datamodel::{ContentItem, Exchange, FunctionCall};
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::orchestrator::Orchestrator;
    use crate::cloudllm::tool_registry::ToolRegistry;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn echo_config(base_url: String) -> RestToolConfig {
        let mut responses = HashMap::new();
        responses.insert(
            Some(200),
            RestResponseConfig {
                content: "$response.greeting".to_string(),
                error: false,
            },
        );
        responses.insert(
            None,
            RestResponseConfig {
                content: "request failed".to_string(),
                error: true,
            },
        );
        RestToolConfig {
            name: "greet".to_string(),
            title: "Greet".to_string(),
            description: "calls a greeting endpoint".to_string(),
            parameters_schema: json!({"type": "object", "properties": {"name": {"type": "string"}}}),
            base_url,
            method: "GET".to_string(),
            path: "/greet/$parameters.name".to_string(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            responses,
        }
    }

    #[tokio::test]
    async fn successful_response_is_extracted_via_its_path_template() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/greet/ada"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"greeting": "hello ada"})))
            .mount(&server)
            .await;

        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let orchestrator = Orchestrator::new(Vec::new(), library, Arc::new(ToolRegistry::new()));
        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = {
            let mut conv = conversation.lock().await;
            let mut exchange = Exchange::new();
            let fc = FunctionCall::new_in_progress(
                "call_1".to_string(),
                "greet".to_string(),
                json!({"name": "ada"}).to_string(),
                None,
            );
            let key = fc.key.clone();
            exchange.items.push(ContentItem::FunctionCall(fc));
            conv.exchanges.push(exchange);
            key
        };

        let tool = RestTool::new(echo_config(server.uri()));
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(crate::cloudllm::tool_registry::LocalToolProvider::new().with_tool(tool.descriptor(), Arc::new(tool))))
            .await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(!fc.error);
        assert_eq!(fc.content, "hello ada");
    }

    #[tokio::test]
    async fn unmapped_status_code_falls_back_to_the_error_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/greet/ada"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        let orchestrator = Orchestrator::new(Vec::new(), library, Arc::new(ToolRegistry::new()));
        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = {
            let mut conv = conversation.lock().await;
            let mut exchange = Exchange::new();
            let fc = FunctionCall::new_in_progress(
                "call_1".to_string(),
                "greet".to_string(),
                json!({"name": "ada"}).to_string(),
                None,
            );
            let key = fc.key.clone();
            exchange.items.push(ContentItem::FunctionCall(fc));
            conv.exchanges.push(exchange);
            key
        };

        let tool = RestTool::new(echo_config(server.uri()));
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(crate::cloudllm::tool_registry::LocalToolProvider::new().with_tool(tool.descriptor(), Arc::new(tool))))
            .await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(fc.error);
        assert_eq!(fc.content, "request failed");
    }
}
