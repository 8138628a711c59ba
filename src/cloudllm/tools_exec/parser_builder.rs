//! The parser-builder tool triplet: compile, edit, and test a Go log parser.
//!
//! Grounded on `examples/original_source/llmulink/parser_builder/tool_compile_parser.py`,
//! `tool_edit_parser.py`, and `tool_test_parser.py`. All three run their Go
//! toolchain / test commands directly on the host, against the sandbox's
//! host-side tempdir (not via `docker exec`) — this mirrors the original,
//! which shells out with `cwd=conversation.sandbox.path` rather than routing
//! through the container. `tool_edit_parser.py`'s SEARCH/REPLACE application
//! is never actually implemented upstream (the function returns before doing
//! anything with `edit`); this module implements it for real, following the
//! block format its own tool description documents.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;

use crate::cloudllm::datamodel::ToolDescriptor;
use crate::cloudllm::orchestrator::ConversationHandle;
use crate::cloudllm::sandbox::{Sandbox, SandboxConfig};
use crate::cloudllm::tool_registry::{ToolExecutor, ToolProgress};

const SEARCH_MARKER: &str = "⏪";
const DIVIDER_MARKER: &str = "⏸️";
const REPLACE_MARKER: &str = "⏩";

/// Run `cmd` in `cwd` on the host, streaming stdout/stderr into `progress`
/// as it arrives. Mirrors the `execute()` helper shared by
/// `tool_compile_parser.py`/`tool_test_parser.py`.
async fn run_streaming(progress: &ToolProgress, cmd: &[&str], cwd: &Path) -> std::io::Result<i32> {
    let mut command = TokioCommand::new(cmd[0]);
    command.args(&cmd[1..]).current_dir(cwd).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let mut stdout_lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
    let mut stderr_lines = BufReader::new(child.stderr.take().expect("piped stderr")).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut exit_code = None;

    while exit_code.is_none() || !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line? {
                    Some(text) => progress.append(&format!("{}\n", text)).await,
                    None => stdout_done = true,
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line? {
                    Some(text) => progress.append(&format!("{}\n", text)).await,
                    None => stderr_done = true,
                }
            }
            status = child.wait(), if exit_code.is_none() => {
                exit_code = Some(status?.code().unwrap_or(-1));
            }
        }
    }
    Ok(exit_code.unwrap_or(-1))
}

async fn ensure_sandbox(sandbox_config: &SandboxConfig, conversation: &ConversationHandle) {
    let needs_provision = conversation.lock().await.sandbox.is_none();
    if !needs_provision {
        return;
    }
    match Sandbox::provision(sandbox_config).await {
        Ok(sandbox) => conversation.lock().await.sandbox = Some(std::sync::Arc::new(sandbox)),
        Err(e) => log::error!("failed to provision sandbox for parser builder: {}", e),
    }
}

async fn sandbox_path(conversation: &ConversationHandle) -> Option<PathBuf> {
    conversation.lock().await.sandbox.as_ref().map(|sandbox| sandbox.path().to_path_buf())
}

fn parser_dir(sandbox_path: &Path) -> PathBuf {
    sandbox_path.join("parser")
}

/// Writes Go source into the sandbox and runs `go mod tidy` + `go build`.
pub struct CompileParserTool {
    sandbox_config: SandboxConfig,
}

impl CompileParserTool {
    pub fn new(sandbox_config: SandboxConfig) -> Self {
        Self { sandbox_config }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "compile_parser".to_string(),
            title: Some("Compile a parser in Go language".to_string()),
            description: "Compiles a parser written in Go, returning the compiler's stdout and \
                stderr. The code must define `func Parse(log []byte) map[string]interface{}`; a \
                `main` function is provided by the tool itself."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"code": {"type": "string", "description": "The Go code of the parser"}},
                "required": ["code"],
            }),
        }
    }
}

#[async_trait]
impl ToolExecutor for CompileParserTool {
    async fn init(&self, conversation: &ConversationHandle) {
        ensure_sandbox(&self.sandbox_config, conversation).await;
    }

    async fn execute(&self, progress: &ToolProgress, arguments: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(_) => {
                progress.fail("Exception occurred while parsing arguments.").await;
                return;
            }
        };
        let code = match parsed.get("code").and_then(|v| v.as_str()) {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => {
                progress.fail("Parameter 'code' is required").await;
                return;
            }
        };

        let sandbox_path = match sandbox_path(progress.conversation()).await {
            Some(path) => path,
            None => {
                progress.fail("Sandbox is not initialized").await;
                return;
            }
        };
        let trgdir = parser_dir(&sandbox_path);
        if let Err(e) = write_parser_source(&trgdir, &code).await {
            log::error!("failed to write parser source: {}", e);
            progress.fail("Exception occurred while writing parser code").await;
            return;
        }

        if !tidy_and_build(progress, &trgdir).await {
            return;
        }
        progress.append("\nCompilation successful.").await;
    }
}

async fn write_parser_source(trgdir: &Path, code: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(trgdir).await?;
    tokio::fs::write(trgdir.join("parse.go"), code).await
}

/// Runs `go mod tidy` then `go build -o parse .`, reporting failures through
/// `progress` and returning `false` if either step failed.
async fn tidy_and_build(progress: &ToolProgress, trgdir: &Path) -> bool {
    match run_streaming(progress, &["go", "mod", "tidy"], trgdir).await {
        Ok(0) => {}
        Ok(code) => {
            progress.append(&format!("\nTidying failed with return code: {}", code)).await;
            progress.mark_error().await;
            return false;
        }
        Err(e) => {
            progress.fail("A command 'go compiler' was not found on this system").await;
            log::warn!("go toolchain unavailable: {}", e);
            return false;
        }
    }

    match run_streaming(progress, &["go", "build", "-o", "parse", "."], trgdir).await {
        Ok(0) => true,
        Ok(code) => {
            progress.append(&format!("\nCompilation failed with return code: {}", code)).await;
            progress.mark_error().await;
            false
        }
        Err(e) => {
            log::warn!("go toolchain unavailable: {}", e);
            progress.fail("Exception occurred while executing command 'go compiler'").await;
            false
        }
    }
}

/// Applies SEARCH/REPLACE blocks to `parse.go` and recompiles.
pub struct EditParserTool;

impl EditParserTool {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "edit_parser".to_string(),
            title: Some("Edit a parser in Go language".to_string()),
            description: format!(
                "Edits the parser source file (`parse.go`) using SEARCH/REPLACE blocks and \
                recompiles it, returning the compiler's stdout and stderr. Each block is \
                delimited by {search} / {divider} / {replace}, one per line; the SEARCH section \
                must exactly match existing source text and only its first occurrence is replaced.",
                search = SEARCH_MARKER,
                divider = DIVIDER_MARKER,
                replace = REPLACE_MARKER,
            ),
            parameters: json!({
                "type": "object",
                "properties": {"edit": {"type": "string", "description": "SEARCH/REPLACE blocks, one or more"}},
                "required": ["edit"],
            }),
        }
    }
}

struct EditBlock {
    search: String,
    replace: String,
}

/// Parses one or more SEARCH/REPLACE blocks out of `edit`.
fn parse_edit_blocks(edit: &str) -> Result<Vec<EditBlock>, String> {
    let mut blocks = Vec::new();
    let mut lines = edit.lines().peekable();
    while lines.peek().is_some() {
        while lines.peek().map_or(false, |l| l.trim() != SEARCH_MARKER) {
            lines.next();
        }
        if lines.next().is_none() {
            break;
        }

        let mut search_lines = Vec::new();
        loop {
            match lines.next() {
                Some(line) if line.trim() == DIVIDER_MARKER => break,
                Some(line) => search_lines.push(line.to_string()),
                None => return Err("unterminated SEARCH section".to_string()),
            }
        }

        let mut replace_lines = Vec::new();
        loop {
            match lines.next() {
                Some(line) if line.trim() == REPLACE_MARKER => break,
                Some(line) => replace_lines.push(line.to_string()),
                None => return Err("unterminated REPLACE section".to_string()),
            }
        }

        blocks.push(EditBlock {
            search: search_lines.join("\n"),
            replace: replace_lines.join("\n"),
        });
    }

    if blocks.is_empty() {
        return Err("no SEARCH/REPLACE blocks found".to_string());
    }
    Ok(blocks)
}

fn apply_edit_blocks(source: &str, blocks: &[EditBlock]) -> Result<String, String> {
    let mut current = source.to_string();
    for block in blocks {
        match current.find(&block.search) {
            Some(index) => {
                current.replace_range(index..index + block.search.len(), &block.replace);
            }
            None => return Err(format!("SEARCH section did not match any part of the source:\n{}", block.search)),
        }
    }
    Ok(current)
}

#[async_trait]
impl ToolExecutor for EditParserTool {
    async fn execute(&self, progress: &ToolProgress, arguments: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(_) => {
                progress.fail("Exception occurred while parsing arguments.").await;
                return;
            }
        };
        let edit = match parsed.get("edit").and_then(|v| v.as_str()) {
            Some(edit) => edit.to_string(),
            None => {
                progress.fail("Parameter 'edit' is required").await;
                return;
            }
        };

        let sandbox_path = match sandbox_path(progress.conversation()).await {
            Some(path) => path,
            None => {
                progress.fail("Sandbox is not initialized").await;
                return;
            }
        };
        let trgdir = parser_dir(&sandbox_path);
        let parser_path = trgdir.join("parse.go");

        let source = match tokio::fs::read_to_string(&parser_path).await {
            Ok(source) => source,
            Err(e) => {
                log::error!("failed to read {}: {}", parser_path.display(), e);
                progress.fail("No parser source to edit; compile one first.").await;
                return;
            }
        };

        let blocks = match parse_edit_blocks(&edit) {
            Ok(blocks) => blocks,
            Err(e) => {
                progress.fail(&format!("Failed to parse edit blocks: {}", e)).await;
                return;
            }
        };
        let edited = match apply_edit_blocks(&source, &blocks) {
            Ok(edited) => edited,
            Err(e) => {
                progress.fail(&e).await;
                return;
            }
        };

        if let Err(e) = tokio::fs::write(&parser_path, edited).await {
            log::error!("failed to write edited parser source: {}", e);
            progress.fail("Exception occurred while writing parser code").await;
            return;
        }

        if !tidy_and_build(progress, &trgdir).await {
            return;
        }
        progress.append("\nCompilation successful.").await;
    }
}

/// Runs the compiled `parse` binary against every sample log file via `chroot`.
pub struct TestParserTool;

impl TestParserTool {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "test_parser".to_string(),
            title: Some("Test a parser".to_string()),
            description: "Tests a compiled parser against every sample log file, returning the \
                test run's stdout and stderr."
                .to_string(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }
}

#[async_trait]
impl ToolExecutor for TestParserTool {
    async fn execute(&self, progress: &ToolProgress, _arguments: &str) {
        let sandbox_path = match sandbox_path(progress.conversation()).await {
            Some(path) => path,
            None => {
                progress.fail("Sandbox is not initialized").await;
                return;
            }
        };

        let log_dir = sandbox_path.join("log");
        let mut log_files = match tokio::fs::read_dir(&log_dir).await {
            Ok(mut entries) => {
                let mut names = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Some(name) = entry.file_name().to_str() {
                        if name.ends_with(".log") {
                            names.push(name.to_string());
                        }
                    }
                }
                names
            }
            Err(e) => {
                progress.fail(&format!("No sample logs available: {}", e)).await;
                return;
            }
        };
        log_files.sort();

        for log_file in log_files {
            let cmd = [
                "chroot",
                sandbox_path.to_str().unwrap_or("."),
                "/parser/parse",
                &format!("log/{}", log_file),
                "./ECS.yaml",
            ];
            match run_streaming(progress, &cmd, &sandbox_path).await {
                Ok(0) => {}
                Ok(code) => {
                    progress
                        .append(&format!("\nExecution of the test (parser) failed with return code: {}", code))
                        .await;
                    progress.mark_error().await;
                }
                Err(e) => {
                    log::error!("failed to run test harness: {}", e);
                    progress.mark_error().await;
                }
            }
            progress.append(&format!("\nTest `{}` completed.\n---\n", log_file)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cloudllm::datamodel::{ContentItem, Exchange, FunctionCall, ToolDescriptor as Descriptor};
    use crate::cloudllm::library::InMemoryLibrary;
    use crate::cloudllm::orchestrator::Orchestrator;
    use crate::cloudllm::tool_registry::{LocalToolProvider, ToolRegistry};

    fn block(search: &str, replace: &str) -> String {
        format!("{}\n{}\n{}\n{}\n{}", SEARCH_MARKER, search, DIVIDER_MARKER, replace, REPLACE_MARKER)
    }

    #[test]
    fn parse_edit_blocks_parses_one_block() {
        let edit = block("old text", "new text");
        let blocks = parse_edit_blocks(&edit).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].search, "old text");
        assert_eq!(blocks[0].replace, "new text");
    }

    #[test]
    fn parse_edit_blocks_errors_without_any_marker() {
        assert!(parse_edit_blocks("just plain text").is_err());
    }

    #[test]
    fn apply_edit_blocks_replaces_first_occurrence() {
        let source = "func main() {\n    old text\n    old text\n}\n";
        let blocks = vec![EditBlock {
            search: "old text".to_string(),
            replace: "new text".to_string(),
        }];
        let edited = apply_edit_blocks(source, &blocks).unwrap();
        assert_eq!(edited, "func main() {\n    new text\n    old text\n}\n");
    }

    #[test]
    fn apply_edit_blocks_errors_when_search_not_found() {
        let blocks = vec![EditBlock {
            search: "nonexistent".to_string(),
            replace: "x".to_string(),
        }];
        assert!(apply_edit_blocks("irrelevant source", &blocks).is_err());
    }

    fn test_orchestrator() -> Arc<Orchestrator> {
        let library = Arc::new(InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "be helpful")]));
        Orchestrator::new(Vec::new(), library, Arc::new(ToolRegistry::new()))
    }

    async fn seed_function_call(orchestrator: &Arc<Orchestrator>, name: &str, arguments: &str) -> (ConversationHandle, String) {
        let conversation = orchestrator.create_conversation().await.unwrap();
        let key = {
            let mut conv = conversation.lock().await;
            let mut exchange = Exchange::new();
            let fc = FunctionCall::new_in_progress("call_1".to_string(), name.to_string(), arguments.to_string(), None);
            let key = fc.key.clone();
            exchange.items.push(ContentItem::FunctionCall(fc));
            conv.exchanges.push(exchange);
            key
        };
        (conversation, key)
    }

    #[tokio::test]
    async fn compile_parser_fails_without_code_parameter() {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(
                LocalToolProvider::new()
                    .with_tool(CompileParserTool::descriptor(), Arc::new(CompileParserTool::new(SandboxConfig::default()))),
            ))
            .await;
        let (conversation, key) = seed_function_call(&orchestrator, "compile_parser", "{}").await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(fc.error);
        assert_eq!(fc.content, "Parameter 'code' is required");
    }

    #[tokio::test]
    async fn edit_parser_fails_without_a_prior_compile() {
        let orchestrator = test_orchestrator();
        let registry = ToolRegistry::new();
        registry
            .add_provider(Arc::new(LocalToolProvider::new().with_tool(EditParserTool::descriptor(), Arc::new(EditParserTool))))
            .await;
        let (conversation, key) =
            seed_function_call(&orchestrator, "edit_parser", &serde_json::json!({"edit": block("a", "b")}).to_string()).await;

        registry.execute(&orchestrator, &conversation, 0, &key).await;

        let conv = conversation.lock().await;
        let fc = match &conv.exchanges[0].items[0] {
            ContentItem::FunctionCall(fc) => fc,
            _ => panic!("expected a function call item"),
        };
        assert!(fc.error);
        assert_eq!(fc.content, "Sandbox is not initialized");
    }

    #[test]
    fn descriptors_require_the_documented_parameters() {
        let compile: Descriptor = CompileParserTool::descriptor();
        assert_eq!(compile.name, "compile_parser");
        let edit: Descriptor = EditParserTool::descriptor();
        assert_eq!(edit.name, "edit_parser");
        let test: Descriptor = TestParserTool::descriptor();
        assert_eq!(test.name, "test_parser");
    }
}
