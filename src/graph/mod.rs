//! Note Graph Access
//!
//! The query surface the context engine reads from. The engine never mutates the
//! graph; hosts supply a `GraphQuery` implementation over whatever store they own.
//! `MemoryGraph` and the Markdown vault indexer are provided for embedding and tests.

pub mod memory;
pub mod refs;
pub mod vault;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub use memory::MemoryGraph;
pub use vault::{index_vault, IndexStats};

/// Result type for graph queries
pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid vault path: {0}")]
    InvalidPath(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Graph query failed: {0}")]
    Query(String),
}

/// A named, top-level node holding a tree of blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Smallest addressable unit of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub content: String,
    /// Title of the page the block lives on
    pub page_title: Option<String>,
    /// Id of the page the block lives on; filled from the title when a graph stores the block
    #[serde(default)]
    pub page_id: Option<String>,
    /// `None` when the block sits directly under its page
    pub parent_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Block {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            page_title: None,
            page_id: None,
            parent_id: None,
            created_at: None,
        }
    }
}

/// Query operations over a hierarchical note graph.
///
/// Children of a page are its top-level blocks, so `get_children` accepts
/// both page ids and block ids. Missing nodes are `Ok(None)` / empty, not errors.
#[async_trait]
pub trait GraphQuery: Send + Sync {
    async fn get_page_by_title(&self, title: &str) -> GraphResult<Option<Page>>;

    async fn get_block_by_id(&self, id: &str) -> GraphResult<Option<Block>>;

    /// Ordered children of a page or block
    async fn get_children(&self, id: &str) -> GraphResult<Vec<Block>>;

    async fn get_parent(&self, id: &str) -> GraphResult<Option<Block>>;

    /// Blocks sharing the same parent, excluding the block itself
    async fn get_siblings(&self, id: &str) -> GraphResult<Vec<Block>>;

    /// Blocks elsewhere in the graph whose text references the page
    async fn get_backlinks(&self, page_title: &str) -> GraphResult<Vec<Block>>;

    fn extract_page_references(&self, text: &str) -> Vec<String> {
        refs::extract_page_references(text)
    }

    fn extract_block_references(&self, text: &str) -> Vec<String> {
        refs::extract_block_references(text)
    }

    /// Flatten a block and its descendants into indented outline text.
    async fn render_subtree(&self, block: &Block, indent_level: usize) -> GraphResult<String> {
        let mut lines = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(block.clone(), indent_level)];

        while let Some((current, depth)) = stack.pop() {
            if !seen.insert(current.id.clone()) {
                continue;
            }
            push_outline_line(&mut lines, &current.content, depth);

            let children = self.get_children(&current.id).await?;
            for child in children.into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }

        Ok(lines.join("\n"))
    }
}

/// Render one block as `- content`, continuation lines aligned under the bullet
fn push_outline_line(lines: &mut Vec<String>, content: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut parts = content.lines();
    let first = parts.next().unwrap_or("");
    lines.push(format!("{}- {}", indent, first));
    for rest in parts {
        lines.push(format!("{}  {}", indent, rest));
    }
}
