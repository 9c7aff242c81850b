//! Markdown Vault Indexer
//!
//! Scans a directory of Markdown outline notes into a `MemoryGraph`.
//! Read-only: never modifies the user's vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Block, GraphError, GraphResult, MemoryGraph, Page};

/// Index statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub pages_indexed: u32,
    pub blocks_indexed: u32,
    pub errors: Vec<String>,
    /// Notes whose file stem was already taken, titled by their relative path instead
    pub renamed: Vec<String>,
    pub last_indexed: DateTime<Utc>,
}

/// One parsed outline block before it is attached to the graph
#[derive(Debug, Clone, PartialEq)]
struct OutlineBlock {
    id: Option<String>,
    content: String,
    depth: usize,
}

/// Index every `.md` file under `vault_path` into a fresh graph
pub fn index_vault(vault_path: impl AsRef<Path>) -> GraphResult<(MemoryGraph, IndexStats)> {
    let path = vault_path.as_ref();

    if !path.exists() {
        return Err(GraphError::InvalidPath("Path does not exist".to_string()));
    }
    let root = path
        .canonicalize()
        .map_err(|_| GraphError::InvalidPath("Cannot resolve path".to_string()))?;
    if !root.is_dir() {
        return Err(GraphError::InvalidPath("Path is not a directory".to_string()));
    }

    let graph = MemoryGraph::new();
    let mut stats = IndexStats::default();
    let mut files = Vec::new();
    collect_markdown_files(&root, &mut files)?;
    files.sort();

    let mut titles = HashSet::new();
    for file in files {
        let relative = relative_path(&root, &file);
        let title = unique_title(&file, &relative, &mut titles);
        if title != stem_title(&file, &relative) {
            warn!(path = %relative, title = %title, "Note title already taken, using its path");
            stats.renamed.push(relative.clone());
        }

        match index_note(&graph, &file, &relative, &title) {
            Ok(blocks) => {
                stats.pages_indexed += 1;
                stats.blocks_indexed += blocks;
            }
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Failed to index note");
                stats.errors.push(format!("{}: {}", file.display(), e));
            }
        }
    }

    stats.last_indexed = Utc::now();
    info!(
        pages = stats.pages_indexed,
        blocks = stats.blocks_indexed,
        errors = stats.errors.len(),
        "Indexed vault"
    );
    Ok((graph, stats))
}

/// Recursively collect markdown files, skipping hidden entries
fn collect_markdown_files(dir: &Path, files: &mut Vec<PathBuf>) -> GraphResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        if path.is_dir() {
            collect_markdown_files(&path, files)?;
        } else if path.extension().map(|e| e == "md").unwrap_or(false) {
            files.push(path);
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

fn stem_title(path: &Path, relative: &str) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| relative.to_string())
}

/// File stem, or the extension-less relative path when the stem is taken
fn unique_title(path: &Path, relative: &str, taken: &mut HashSet<String>) -> String {
    let stem = stem_title(path, relative);
    if taken.insert(stem.to_lowercase()) {
        return stem;
    }
    let by_path = relative.strip_suffix(".md").unwrap_or(relative).replace('\\', "/");
    let mut title = by_path.clone();
    let mut n = 2;
    while !taken.insert(title.to_lowercase()) {
        title = format!("{} ({})", by_path, n);
        n += 1;
    }
    title
}

/// Index a single note file as one page. Returns the number of blocks added.
fn index_note(graph: &MemoryGraph, path: &Path, relative_path: &str, title: &str) -> GraphResult<u32> {
    let content = fs::read_to_string(path)?;
    let relative_path = relative_path.to_string();
    let title = title.to_string();

    let modified: DateTime<Utc> = fs::metadata(path)?
        .modified()
        .map(|t| t.into())
        .unwrap_or_else(|_| Utc::now());

    graph.insert_page(Page {
        id: relative_path.clone(),
        title: title.clone(),
        created_at: Some(modified),
    });

    // Parent chain by depth: stack[d] is the id of the latest block at depth d
    let mut stack: Vec<String> = Vec::new();
    let mut added = 0u32;

    for (ordinal, outline) in parse_outline(strip_frontmatter(&content)).into_iter().enumerate() {
        let depth = outline.depth.min(stack.len());
        stack.truncate(depth);

        let id = outline
            .id
            .unwrap_or_else(|| format!("{}#{}", relative_path, ordinal));
        let block = Block {
            id: id.clone(),
            content: outline.content,
            page_title: Some(title.clone()),
            page_id: Some(relative_path.clone()),
            parent_id: stack.last().cloned(),
            created_at: Some(modified),
        };

        graph.insert_block(block)?;
        stack.push(id);
        added += 1;
    }

    Ok(added)
}

/// Skip YAML frontmatter if present
fn strip_frontmatter(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let after = &rest[end + 4..];
            return after.strip_prefix('\n').unwrap_or(after);
        }
    }
    content
}

/// Parse outline bullets and loose paragraphs into blocks.
///
/// A tab or two spaces is one level of nesting. Non-bullet lines continue the
/// current block; outside any bullet, blank-line separated paragraphs become
/// top-level blocks. `id:: value` lines set the current block's id.
fn parse_outline(content: &str) -> Vec<OutlineBlock> {
    let mut blocks: Vec<OutlineBlock> = Vec::new();
    let mut current: Option<OutlineBlock> = None;
    let mut in_bullet = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if !in_bullet {
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
            }
            continue;
        }

        if let Some(value) = trimmed.strip_prefix("id::") {
            if let Some(block) = current.as_mut() {
                block.id = Some(value.trim().to_string());
            }
            continue;
        }

        if let Some(text) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(OutlineBlock {
                id: None,
                content: text.trim().to_string(),
                depth: indent_depth(line),
            });
            in_bullet = true;
            continue;
        }

        match current.as_mut() {
            Some(block) => {
                if !block.content.is_empty() {
                    block.content.push('\n');
                }
                block.content.push_str(trimmed);
            }
            None => {
                current = Some(OutlineBlock {
                    id: None,
                    content: trimmed.to_string(),
                    depth: 0,
                });
                in_bullet = false;
            }
        }
    }

    if let Some(done) = current {
        blocks.push(done);
    }
    blocks
}

fn indent_depth(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            '\t' => width += 2,
            ' ' => width += 1,
            _ => break,
        }
    }
    width / 2
}
