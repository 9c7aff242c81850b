//! In-memory note graph
//!
//! A mutable `GraphQuery` implementation. Hosts can keep inserting or removing
//! blocks between context runs; every query reads a consistent snapshot under a lock.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::refs::extract_page_references;
use super::{Block, GraphError, GraphQuery, GraphResult, Page};

#[derive(Debug, Default)]
struct GraphData {
    /// Pages by id
    pages: HashMap<String, Page>,
    /// Lowercased title -> page id
    title_index: HashMap<String, String>,
    /// Blocks by id
    blocks: HashMap<String, Block>,
    /// Insertion order of blocks, used for deterministic backlink order
    block_order: Vec<String>,
    /// Page id or block id -> ordered child block ids
    children: HashMap<String, Vec<String>>,
}

impl GraphData {
    fn page_id_for_title(&self, title: &str) -> Option<&String> {
        self.title_index.get(&title.trim().to_lowercase())
    }

    /// Id of the node a block hangs under: its parent block, or its page
    fn container_id(&self, block: &Block) -> Option<String> {
        match (&block.parent_id, &block.page_id) {
            (Some(parent), _) => Some(parent.clone()),
            (None, Some(page_id)) => self.pages.contains_key(page_id).then(|| page_id.clone()),
            (None, None) => block
                .page_title
                .as_deref()
                .and_then(|t| self.page_id_for_title(t))
                .cloned(),
        }
    }

    fn blocks_for(&self, ids: &[String]) -> Vec<Block> {
        ids.iter().filter_map(|id| self.blocks.get(id).cloned()).collect()
    }
}

/// Note graph held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryGraph {
    data: RwLock<GraphData>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a page. Titles are unique case-insensitively.
    pub fn insert_page(&self, page: Page) {
        let mut data = self.data.write();
        data.title_index.insert(page.title.to_lowercase(), page.id.clone());
        data.children.entry(page.id.clone()).or_default();
        data.pages.insert(page.id.clone(), page);
    }

    /// Convenience for `insert_page` without a creation date
    pub fn add_page(&self, id: impl Into<String>, title: impl Into<String>) {
        self.insert_page(Page {
            id: id.into(),
            title: title.into(),
            created_at: None,
        });
    }

    /// Insert a block as the last child of its parent (or of its page).
    ///
    /// The block's page must already exist; a block with a parent id must name
    /// a block that is already present.
    pub fn insert_block(&self, mut block: Block) -> GraphResult<()> {
        let mut data = self.data.write();

        // Pin the page by id so a later title collision cannot move the block
        if block.page_id.is_none() {
            block.page_id = match &block.parent_id {
                Some(parent) => data.blocks.get(parent).and_then(|p| p.page_id.clone()),
                None => block
                    .page_title
                    .as_deref()
                    .and_then(|t| data.page_id_for_title(t))
                    .cloned(),
            };
        }

        if let Some(parent) = &block.parent_id {
            if !data.blocks.contains_key(parent) {
                return Err(GraphError::NodeNotFound(parent.clone()));
            }
        }
        let container = data.container_id(&block).ok_or_else(|| {
            GraphError::NodeNotFound(block.page_title.clone().unwrap_or_else(|| block.id.clone()))
        })?;

        if let Some(previous) = data.blocks.get(&block.id).cloned() {
            if let Some(old_container) = data.container_id(&previous) {
                if let Some(siblings) = data.children.get_mut(&old_container) {
                    siblings.retain(|id| id != &block.id);
                }
            }
        } else {
            data.block_order.push(block.id.clone());
        }

        data.children.entry(container).or_default().push(block.id.clone());
        data.children.entry(block.id.clone()).or_default();
        data.blocks.insert(block.id.clone(), block);
        Ok(())
    }

    /// Convenience for building outlines: appends a block under `parent` or the page.
    pub fn add_block(
        &self,
        page_title: &str,
        parent: Option<&str>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> GraphResult<()> {
        let mut block = Block::new(id, content);
        block.page_title = Some(page_title.to_string());
        block.parent_id = parent.map(str::to_string);
        self.insert_block(block)
    }

    /// Replace a block's text in place
    pub fn set_block_content(&self, id: &str, content: impl Into<String>) -> GraphResult<()> {
        let mut data = self.data.write();
        let block = data
            .blocks
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        block.content = content.into();
        Ok(())
    }

    /// Remove a block and all of its descendants. Returns how many blocks were removed.
    pub fn remove_block(&self, id: &str) -> usize {
        let mut data = self.data.write();
        let Some(block) = data.blocks.get(id).cloned() else {
            return 0;
        };
        if let Some(container) = data.container_id(&block) {
            if let Some(siblings) = data.children.get_mut(&container) {
                siblings.retain(|child| child != id);
            }
        }

        let mut removed = 0;
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if data.blocks.remove(&current).is_some() {
                removed += 1;
            }
            if let Some(children) = data.children.remove(&current) {
                stack.extend(children);
            }
        }
        let GraphData { blocks, block_order, .. } = &mut *data;
        block_order.retain(|b| blocks.contains_key(b));
        removed
    }

    pub fn page_count(&self) -> usize {
        self.data.read().pages.len()
    }

    pub fn block_count(&self) -> usize {
        self.data.read().blocks.len()
    }
}

#[async_trait]
impl GraphQuery for MemoryGraph {
    async fn get_page_by_title(&self, title: &str) -> GraphResult<Option<Page>> {
        let data = self.data.read();
        Ok(data
            .page_id_for_title(title)
            .and_then(|id| data.pages.get(id))
            .cloned())
    }

    async fn get_block_by_id(&self, id: &str) -> GraphResult<Option<Block>> {
        Ok(self.data.read().blocks.get(id).cloned())
    }

    async fn get_children(&self, id: &str) -> GraphResult<Vec<Block>> {
        let data = self.data.read();
        Ok(data
            .children
            .get(id)
            .map(|ids| data.blocks_for(ids))
            .unwrap_or_default())
    }

    async fn get_parent(&self, id: &str) -> GraphResult<Option<Block>> {
        let data = self.data.read();
        Ok(data
            .blocks
            .get(id)
            .and_then(|b| b.parent_id.as_ref())
            .and_then(|parent| data.blocks.get(parent))
            .cloned())
    }

    async fn get_siblings(&self, id: &str) -> GraphResult<Vec<Block>> {
        let data = self.data.read();
        let Some(block) = data.blocks.get(id) else {
            return Ok(Vec::new());
        };
        let Some(container) = data.container_id(block) else {
            return Ok(Vec::new());
        };
        Ok(data
            .children
            .get(&container)
            .map(|ids| data.blocks_for(ids))
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.id != id)
            .collect())
    }

    async fn get_backlinks(&self, page_title: &str) -> GraphResult<Vec<Block>> {
        let data = self.data.read();
        let wanted = page_title.trim().to_lowercase();
        let own_page = data.page_id_for_title(page_title);

        Ok(data
            .block_order
            .iter()
            .filter_map(|id| data.blocks.get(id))
            .filter(|b| match (&b.page_id, own_page) {
                (Some(id), Some(own)) => id != own,
                _ => b
                    .page_title
                    .as_deref()
                    .map(|t| t.to_lowercase() != wanted)
                    .unwrap_or(true)
            })
            .filter(|b| {
                extract_page_references(&b.content)
                    .iter()
                    .any(|r| r.to_lowercase() == wanted)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        graph.add_page("p-rust", "Rust");
        graph.add_page("p-notes", "Notes");
        graph.add_block("Rust", None, "r1", "Ownership rules").unwrap();
        graph.add_block("Rust", Some("r1"), "r1a", "Borrowing").unwrap();
        graph.add_block("Rust", Some("r1"), "r1b", "Lifetimes").unwrap();
        graph.add_block("Notes", None, "n1", "Learning [[Rust]] this week").unwrap();
        graph.add_block("Rust", None, "r2", "See [[rust]] docs").unwrap();
        graph
    }

    #[tokio::test]
    async fn test_page_lookup_case_insensitive() {
        let graph = sample_graph();
        let page = graph.get_page_by_title("rust").await.unwrap().unwrap();
        assert_eq!(page.id, "p-rust");
        assert!(graph.get_page_by_title("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_children_parent_siblings() {
        let graph = sample_graph();

        let top: Vec<_> = graph.get_children("p-rust").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(top, vec!["r1", "r2"]);

        let parent = graph.get_parent("r1a").await.unwrap().unwrap();
        assert_eq!(parent.id, "r1");
        assert!(graph.get_parent("r1").await.unwrap().is_none());

        let siblings: Vec<_> = graph.get_siblings("r1a").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(siblings, vec!["r1b"]);
    }

    #[tokio::test]
    async fn test_backlinks_exclude_own_page() {
        let graph = sample_graph();
        let backlinks: Vec<_> = graph.get_backlinks("Rust").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(backlinks, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_render_subtree() {
        let graph = sample_graph();
        let root = graph.get_block_by_id("r1").await.unwrap().unwrap();
        let rendered = graph.render_subtree(&root, 0).await.unwrap();
        assert_eq!(rendered, "- Ownership rules\n  - Borrowing\n  - Lifetimes");
    }

    #[test]
    fn test_insert_block_requires_page() {
        let graph = MemoryGraph::new();
        let err = graph.add_block("Nowhere", None, "b1", "text").unwrap_err();
        assert!(matches!(err, GraphError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_blocks_stay_with_page_after_title_reuse() {
        let graph = MemoryGraph::new();
        graph.add_page("a/Note.md", "Note");
        graph.add_block("Note", None, "a1", "first in a").unwrap();
        graph.add_block("Note", None, "a2", "second in a").unwrap();

        graph.add_page("b/Note.md", "Note");
        graph.add_block("Note", None, "b1", "only in b").unwrap();

        let siblings: Vec<_> = graph.get_siblings("a1").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(siblings, vec!["a2"]);
        let top: Vec<_> = graph.get_children("a/Note.md").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(top, vec!["a1", "a2"]);

        let block = graph.get_block_by_id("a2").await.unwrap().unwrap();
        assert_eq!(block.page_id.as_deref(), Some("a/Note.md"));
        assert_eq!(graph.remove_block("a1"), 1);
        let top: Vec<_> = graph.get_children("a/Note.md").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(top, vec!["a2"]);
    }

    #[tokio::test]
    async fn test_remove_block_removes_descendants() {
        let graph = sample_graph();
        assert_eq!(graph.remove_block("r1"), 3);
        assert_eq!(graph.block_count(), 2);
        let top: Vec<_> = graph.get_children("p-rust").await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(top, vec!["r2"]);
    }

    #[tokio::test]
    async fn test_set_block_content_updates_backlinks() {
        let graph = sample_graph();
        graph.set_block_content("n1", "Nothing linked").unwrap();
        assert!(graph.get_backlinks("Rust").await.unwrap().is_empty());
    }
}
