//! ini-style configuration: `[provider:X]` sections describing which
//! [`ChatProvider`](crate::cloudllm::provider::ChatProvider) adapters to build,
//! and a `[sandbox]` section describing where per-conversation sandboxes live.
//!
//! Grounded on `examples/original_source/llmulink/llm/svc_router.py`'s
//! `LLMRouterService.initialize`/`_initialize_vllm` (section-per-provider
//! dispatch, including the `vllm` auto-detection model-id lookup table) and
//! `svc_sandbox.py` (the `[sandbox]` `path` setting). Parsed with the `ini`
//! crate rather than `asab.Config`'s `configparser` wrapper, since this crate
//! has no `asab`-equivalent application framework to own config loading.

use std::path::PathBuf;
use std::sync::Arc;

use ini::Ini;

use crate::cloudllm::models;
use crate::cloudllm::provider::ChatProvider;
use crate::cloudllm::providers::chat_completions::ChatCompletionsProvider;
use crate::cloudllm::providers::messages::MessagesProvider;
use crate::cloudllm::providers::responses::ResponsesProvider;
use crate::cloudllm::sandbox::SandboxConfig;

#[derive(Debug)]
pub enum ConfigError {
    Parse(ini::Error),
    MissingField { section: String, field: &'static str },
    Vllm(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::MissingField { section, field } => {
                write!(f, "[{}] is missing required field '{}'", section, field)
            }
            ConfigError::Vllm(msg) => write!(f, "vLLM auto-detection failed: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which adapter a `[provider:X]` section selects. `AutoFromVllm` defers the
/// choice until `/v1/models` has been probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    ChatCompletionsAdapter,
    MessagesAdapter,
    ResponsesAdapter,
    AutoFromVllm,
}

impl ProviderKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ChatCompletionsAdapter" => Some(ProviderKind::ChatCompletionsAdapter),
            "MessagesAdapter" => Some(ProviderKind::MessagesAdapter),
            "ResponsesAdapter" => Some(ProviderKind::ResponsesAdapter),
            "auto-from-vLLM" => Some(ProviderKind::AutoFromVllm),
            _ => None,
        }
    }
}

/// One parsed `[provider:X]` section.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub url: String,
    pub api_key: Option<String>,
    pub max_model_len: Option<usize>,
}

/// Model-id dispatch table for `auto-from-vLLM` sections, mirroring
/// `_initialize_vllm`'s `match model_id`. An unrecognized model id falls back
/// to the chat-completions dialect, same as the original's default arm.
fn dialect_for_model_id(model_id: &str) -> ProviderKind {
    match model_id {
        "stepfun-ai/Step-3.5-Flash" | "stepfun-ai/Step-3.5-Flash-FP8" => ProviderKind::ResponsesAdapter,
        "openai/gpt-oss-120b" | "openai/gpt-oss-20b" => ProviderKind::ResponsesAdapter,
        "arcee-ai/Trinity-Large-Preview-FP8" => ProviderKind::ChatCompletionsAdapter,
        "mistralai/Devstral-2-123B-Instruct-2512" => ProviderKind::ChatCompletionsAdapter,
        "MiniMaxAI/MiniMax-M2.5" => ProviderKind::ChatCompletionsAdapter,
        other => {
            log::warn!("unknown vLLM model id {:?}, defaulting to the chat-completions dialect", other);
            ProviderKind::ChatCompletionsAdapter
        }
    }
}

fn build_adapter(kind: ProviderKind, url: &str, api_key: Option<String>) -> Arc<dyn ChatProvider> {
    match kind {
        ProviderKind::ChatCompletionsAdapter => Arc::new(ChatCompletionsProvider::new(url, api_key)),
        ProviderKind::MessagesAdapter => Arc::new(MessagesProvider::new(url, api_key)),
        ProviderKind::ResponsesAdapter => Arc::new(ResponsesProvider::new(url, api_key)),
        ProviderKind::AutoFromVllm => unreachable!("auto-from-vLLM is resolved before build_adapter is called"),
    }
}

/// Probe `url`'s `/v1/models`, require exactly one model, and pick a dialect
/// for it via [`dialect_for_model_id`]. Mirrors `_initialize_vllm`.
async fn resolve_vllm(config: &ProviderConfig) -> Result<Arc<dyn ChatProvider>, ConfigError> {
    let headers = std::collections::HashMap::new();
    let discovered = models::list_models(&config.url, &headers)
        .await
        .map_err(|e| ConfigError::Vllm(e.to_string()))?;
    if discovered.len() != 1 {
        return Err(ConfigError::Vllm(format!(
            "vLLM endpoint {:?} advertises {} models, expected exactly one",
            config.url,
            discovered.len()
        )));
    }
    let kind = dialect_for_model_id(&discovered[0]);
    Ok(build_adapter(kind, &config.url, config.api_key.clone()))
}

/// Parse every `[provider:X]` section out of an already-loaded `Ini`.
pub fn parse_providers(ini: &Ini) -> Result<Vec<ProviderConfig>, ConfigError> {
    let mut providers = Vec::new();
    for (section, properties) in ini.iter() {
        let Some(section) = section else { continue };
        let Some(name) = section.strip_prefix("provider:") else { continue };

        let raw_kind = properties
            .get("type")
            .ok_or_else(|| ConfigError::MissingField { section: section.to_string(), field: "type" })?;
        let kind = ProviderKind::parse(raw_kind).unwrap_or_else(|| {
            log::warn!("[{}] has unknown provider type {:?}, skipping", section, raw_kind);
            ProviderKind::AutoFromVllm
        });
        let url = properties
            .get("url")
            .ok_or_else(|| ConfigError::MissingField { section: section.to_string(), field: "url" })?
            .to_string();
        let api_key = properties.get("api_key").map(|s| s.to_string());
        let max_model_len = properties.get("max_model_len").and_then(|s| s.parse().ok());

        providers.push(ProviderConfig { name: name.to_string(), kind, url, api_key, max_model_len });
    }
    Ok(providers)
}

/// Parse the `[sandbox]` section, if present.
pub fn parse_sandbox(ini: &Ini) -> Option<SandboxConfig> {
    let section = ini.section(Some("sandbox"))?;
    let path = PathBuf::from(section.get("path")?);
    let mut config = SandboxConfig { path, ..SandboxConfig::default() };
    if let Some(image) = section.get("image") {
        config.image = image.to_string();
    }
    Some(config)
}

/// Load an ini file from disk and build every configured adapter, resolving
/// `auto-from-vLLM` sections by probing their endpoint. Mirrors
/// `LLMRouterService.initialize`.
pub async fn load_providers_from_file(path: &std::path::Path) -> Result<Vec<Arc<dyn ChatProvider>>, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(ConfigError::Parse)?;
    load_providers(&ini).await
}

/// As [`load_providers_from_file`], but from an already-parsed `Ini`.
pub async fn load_providers(ini: &Ini) -> Result<Vec<Arc<dyn ChatProvider>>, ConfigError> {
    let mut providers = Vec::new();
    for config in parse_providers(ini)? {
        let adapter = if config.kind == ProviderKind::AutoFromVllm {
            resolve_vllm(&config).await?
        } else {
            build_adapter(config.kind, &config.url, config.api_key.clone())
        };
        providers.push(adapter);
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Ini {
        Ini::load_from_str(text).unwrap()
    }

    #[test]
    fn parses_explicit_dialect_sections() {
        let ini = load(
            "[provider:openai]\ntype=ChatCompletionsAdapter\nurl=https://api.openai.com/v1/\napi_key=sk-test\n\n\
             [provider:anthropic]\ntype=MessagesAdapter\nurl=https://api.anthropic.com/v1/\n",
        );
        let providers = parse_providers(&ini).unwrap();
        assert_eq!(providers.len(), 2);
        let openai = providers.iter().find(|p| p.name == "openai").unwrap();
        assert_eq!(openai.kind, ProviderKind::ChatCompletionsAdapter);
        assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
        let anthropic = providers.iter().find(|p| p.name == "anthropic").unwrap();
        assert_eq!(anthropic.kind, ProviderKind::MessagesAdapter);
        assert_eq!(anthropic.api_key, None);
    }

    #[test]
    fn missing_url_is_an_error() {
        let ini = load("[provider:broken]\ntype=ChatCompletionsAdapter\n");
        assert!(parse_providers(&ini).is_err());
    }

    #[test]
    fn sandbox_section_is_optional() {
        let ini = load("[provider:x]\ntype=ChatCompletionsAdapter\nurl=http://localhost/\n");
        assert!(parse_sandbox(&ini).is_none());
    }

    #[test]
    fn sandbox_section_overrides_path_and_image() {
        let ini = load("[sandbox]\npath=/var/cloudllm/sandboxes\nimage=debian:stable\n");
        let sandbox = parse_sandbox(&ini).unwrap();
        assert_eq!(sandbox.path, PathBuf::from("/var/cloudllm/sandboxes"));
        assert_eq!(sandbox.image, "debian:stable");
    }

    #[test]
    fn known_vllm_model_ids_dispatch_to_documented_dialects() {
        assert_eq!(dialect_for_model_id("openai/gpt-oss-120b"), ProviderKind::ResponsesAdapter);
        assert_eq!(dialect_for_model_id("arcee-ai/Trinity-Large-Preview-FP8"), ProviderKind::ChatCompletionsAdapter);
        assert_eq!(dialect_for_model_id("unknown/model"), ProviderKind::ChatCompletionsAdapter);
    }
}
