//! Sandboxed shell command execution: the `busybox` tool.
//!
//! Grounded on `examples/original_source/llmulink/sandbox/tool_busybox.py`
//! (`fuction_call_busybox`/`init_call_busybox`/`busybox_tool`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cloudllm::datamodel::ToolDescriptor;
use crate::cloudllm::orchestrator::ConversationHandle;
use crate::cloudllm::sandbox::{Sandbox, SandboxConfig};
use crate::cloudllm::tool_registry::{ToolExecutor, ToolProgress};

/// Runs `sh -c <command>` inside the conversation's sandbox, provisioning it
/// on first use.
pub struct ShellTool {
    sandbox_config: SandboxConfig,
}

impl ShellTool {
    pub fn new(sandbox_config: SandboxConfig) -> Self {
        Self { sandbox_config }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "busybox".to_string(),
            title: Some("Execute a Shell command using busybox".to_string()),
            description: "Execute a shell command using busybox and return the stdout and stderr \
                of the command. The command is executed in a sandboxed environment with busybox \
                installed. Use this tool to list or read files in the sandbox. The persistent \
                directory is /sandbox; other directories are not persistent."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"},
                    "stdin": {"type": "string", "description": "Optional stdin input to the command"},
                },
                "required": ["command"],
            }),
        }
    }
}

#[async_trait]
impl ToolExecutor for ShellTool {
    async fn init(&self, conversation: &ConversationHandle) {
        let needs_provision = conversation.lock().await.sandbox.is_none();
        if !needs_provision {
            return;
        }
        match Sandbox::provision(&self.sandbox_config).await {
            Ok(sandbox) => conversation.lock().await.sandbox = Some(Arc::new(sandbox)),
            Err(e) => log::error!("failed to provision sandbox: {}", e),
        }
    }

    async fn execute(&self, progress: &ToolProgress, arguments: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => {
                log::error!("failed to parse busybox arguments {:?}: {}", arguments, e);
                progress.fail("Exception occurred while parsing arguments.").await;
                return;
            }
        };

        let command = match parsed.get("command").and_then(|v| v.as_str()) {
            Some(command) if !command.is_empty() => command.to_string(),
            _ => {
                progress.fail("Parameter 'command' is required").await;
                return;
            }
        };
        let stdin = parsed.get("stdin").and_then(|v| v.as_str()).map(|s| s.to_string());

        let sandbox = progress.conversation().lock().await.sandbox.clone();
        let sandbox = match sandbox {
            Some(sandbox) => sandbox,
            None => {
                progress.fail("Sandbox is not available.").await;
                return;
            }
        };

        let outcome = sandbox
            .execute(&["sh".to_string(), "-c".to_string(), command], stdin.as_deref(), |line| async move {
                progress.append(&line).await;
            })
            .await;

        match outcome {
            Ok(outcome) => {
                if outcome.exit_code != 0 {
                    progress.append(&format!("\nBusybox command failed with return code: {}", outcome.exit_code)).await;
                    progress.mark_error().await;
                } else {
                    progress.append("\nTool execution completed successfully.").await;
                }
            }
            Err(e) => {
                log::error!("sandbox execution failed: {}", e);
                progress.fail("Tool execution failed.").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::datamodel::{ContentItem, Exchange, FunctionCall};
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::orchestrator::Orchestrator;
    use crate::cloudllm::tool_registry::{LocalToolProvider, ToolRegistry};

    fn test_orchestrator() -> Arc<Orchestrator> {
        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        Orchestrator::new(Vec::new(), library, Arc::new(ToolRegistry::new()))
    }

    async fn seed_function_call(orchestrator: &Arc<Orchestrator>, arguments: &str) -> (ConversationHandle, String) {
        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = {
            let mut conv = conversation.lock().await;
            let mut exchange = Exchange::new();
            let fc = FunctionCall::new_in_progress("call_1".to_string(), "busybox".to_string(), arguments.to_string(), None);
            let key = fc.key.clone();
            exchange.items.push(ContentItem::FunctionCall(fc));
            conv.exchanges.push(exchange);
            key
        };
        (conversation, key)
    }

    async fn run(arguments: &str) -> crate::cloudllm::datamodel::FunctionCall {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(
                LocalToolProvider::new().with_tool(ShellTool::descriptor(), Arc::new(ShellTool::new(SandboxConfig::default()))),
            ))
            .await;
        let (conversation, key) = seed_function_call(&orchestrator, arguments).await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc.clone(),
            _ => panic!("expected a function call item"),
        }
    }

    #[tokio::test]
    async fn missing_command_parameter_fails() {
        let fc = run("{}").await;
        assert!(fc.error);
        assert_eq!(fc.content, "Parameter 'command' is required");
    }

    #[tokio::test]
    async fn invalid_json_arguments_fail_gracefully() {
        let fc = run("not json").await;
        assert!(fc.error);
        assert_eq!(fc.content, "Exception occurred while parsing arguments.");
    }

    #[tokio::test]
    async fn runs_without_a_provisioned_sandbox_fails() {
        let fc = run(&serde_json::json!({"command": "echo hi"}).to_string()).await;
        assert!(fc.error);
        assert_eq!(fc.content, "Sandbox is not available.");
    }

    #[test]
    fn descriptor_requires_command_parameter() {
        let descriptor = ShellTool::descriptor();
        assert_eq!(descriptor.name, "busybox");
        let required = descriptor.parameters.get("required").and_then(|v| v.as_array()).unwrap();
        assert!(required.iter().any(|v| v == "command"));
    }
}
