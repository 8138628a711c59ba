//! Prompt/skill library: the collaborator instructions and skills are loaded
//! from (§6, "Library collaborator").
//!
//! Grounded on `examples/original_source/llmulink/llm/svc_router.py`'s use of
//! `self.LibraryService.open(item)` (an async context manager yielding `None`
//! or a readable handle) and the `index.yaml` skill-definition shape read by
//! `update_instructions`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug)]
pub enum LibraryError {
    NotFound(String),
    Io(std::io::Error),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::NotFound(path) => write!(f, "library item not found: {}", path),
            LibraryError::Io(e) => write!(f, "library io error: {}", e),
        }
    }
}

impl std::error::Error for LibraryError {}

/// A `/AI/Skill/<name>/index.yaml` definition.
#[derive(Debug, Deserialize)]
pub struct SkillDefinition {
    pub instructions: Vec<String>,
    pub tools: Option<HashMap<String, SkillToolDefinition>>,
}

#[derive(Debug, Deserialize)]
pub struct SkillToolDefinition {
    pub title: String,
    pub description: String,
    pub parameters: Value,
}

/// Source of instruction and skill text, addressed by absolute library paths
/// like `/AI/Prompts/default.md` or `/AI/Skill/researcher/index.yaml`.
#[async_trait]
pub trait PromptLibrary: Send + Sync {
    async fn open(&self, path: &str) -> Result<String, LibraryError>;
}

/// Reads library items from a directory on disk, with `path` treated as a
/// path relative to `root` (leading slash stripped).
pub struct FilesystemLibrary {
    root: PathBuf,
}

impl FilesystemLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PromptLibrary for FilesystemLibrary {
    async fn open(&self, path: &str) -> Result<String, LibraryError> {
        let relative = path.strip_prefix('/').unwrap_or(path);
        let full_path = self.root.join(relative);
        tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LibraryError::NotFound(path.to_string()),
                _ => LibraryError::Io(e),
            })
    }
}

/// In-memory library used by tests and examples.
pub struct InMemoryLibrary {
    items: HashMap<String, String>,
}

impl InMemoryLibrary {
    pub fn new(items: Vec<(&str, &str)>) -> Self {
        Self {
            items: items.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

#[async_trait]
impl PromptLibrary for InMemoryLibrary {
    async fn open(&self, path: &str) -> Result<String, LibraryError> {
        self.items
            .get(path)
            .cloned()
            .ok_or_else(|| LibraryError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_library_returns_registered_item() {
        let library = InMemoryLibrary::new(vec![("/AI/Prompts/default.md", "hello")]);
        assert_eq!(library.open("/AI/Prompts/default.md").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn in_memory_library_errors_on_missing_item() {
        let library = InMemoryLibrary::new(vec![]);
        assert!(matches!(
            library.open("/AI/Prompts/missing.md").await,
            Err(LibraryError::NotFound(_))
        ));
    }
}
