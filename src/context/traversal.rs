//! Context Traversal
//!
//! Walks outward from user-selected anchors (pages and blocks) through backlinks,
//! block references, `[[page]]` references and the block hierarchy, producing a
//! ranked, deduplicated and capped list of `ContextItem`s.
//!
//! Every query failure is logged and contributes nothing; the only early exit is
//! the soft wall-clock deadline, which returns whatever was collected so far.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::graph::{Block, GraphQuery, Page};

use super::backlinks::{is_circular, select_backlinks, should_expand, ExpansionSignals, ScoredBacklink};
use super::item::{rank_items, ContextItem, ItemKind, ItemSource};
use super::options::TraversalOptions;
use super::tokens::{HeuristicEstimator, TokenEstimator};
use super::truncate::truncate_chars;

/// Upper bound on parent hops when walking towards the root
const MAX_ANCESTOR_WALK: usize = 256;

/// Builds context for anchors over one graph
pub struct ContextTraversal<'g> {
    graph: &'g dyn GraphQuery,
    options: TraversalOptions,
    estimator: &'g dyn TokenEstimator,
}

impl<'g> ContextTraversal<'g> {
    pub fn new(graph: &'g dyn GraphQuery, options: TraversalOptions) -> Self {
        Self {
            graph,
            options,
            estimator: &HeuristicEstimator,
        }
    }

    pub fn with_estimator(mut self, estimator: &'g dyn TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn options(&self) -> &TraversalOptions {
        &self.options
    }

    /// Traverse from the anchors and return ranked items, at most `max_items`.
    pub async fn build_context(&self, page_titles: &[String], block_ids: &[String]) -> Vec<ContextItem> {
        let mut run = TraversalRun::new(self.graph, &self.options, self.estimator);
        let mut items = Vec::new();

        for title in page_titles {
            if run.deadline_exceeded() {
                break;
            }
            items.extend(run.process_page(title, 0, ItemSource::UserSpecified).await);
        }
        for id in block_ids {
            if run.deadline_exceeded() {
                break;
            }
            items.extend(run.process_block(id, 0, ItemSource::UserSpecified).await);
        }

        let collected = items.len();
        rank_items(&mut items, self.options.max_items);
        debug!(
            anchors = page_titles.len() + block_ids.len(),
            collected,
            kept = items.len(),
            backlinks_processed = run.backlinks_processed,
            deadline_hit = run.deadline_hit,
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "Built context"
        );
        items
    }
}

/// Traverse with the default estimator
pub async fn build_context(
    graph: &dyn GraphQuery,
    page_titles: &[String],
    block_ids: &[String],
    options: &TraversalOptions,
) -> Vec<ContextItem> {
    ContextTraversal::new(graph, options.clone())
        .build_context(page_titles, block_ids)
        .await
}

/// Backlink text allowance for one page
struct BacklinkBudget {
    remaining_tokens: u32,
    expanded: usize,
}

/// State for a single `build_context` call; dropped when the call returns
struct TraversalRun<'a> {
    graph: &'a dyn GraphQuery,
    options: &'a TraversalOptions,
    estimator: &'a dyn TokenEstimator,
    visited_ids: HashSet<String>,
    /// Lowercased page titles
    visited_titles: HashSet<String>,
    started: Instant,
    deadline: Duration,
    deadline_hit: bool,
    backlinks_processed: usize,
}

impl<'a> TraversalRun<'a> {
    fn new(graph: &'a dyn GraphQuery, options: &'a TraversalOptions, estimator: &'a dyn TokenEstimator) -> Self {
        Self {
            graph,
            options,
            estimator,
            visited_ids: HashSet::new(),
            visited_titles: HashSet::new(),
            started: Instant::now(),
            deadline: Duration::from_millis(options.deadline_ms),
            deadline_hit: false,
            backlinks_processed: 0,
        }
    }

    fn deadline_exceeded(&mut self) -> bool {
        if !self.deadline_hit && self.started.elapsed() > self.deadline {
            self.deadline_hit = true;
            info!(
                deadline_ms = self.options.deadline_ms,
                backlinks_processed = self.backlinks_processed,
                "Context traversal deadline exceeded, returning partial results"
            );
        }
        self.deadline_hit
    }

    fn process_page<'s>(
        &'s mut self,
        title: &'s str,
        level: u32,
        source: ItemSource,
    ) -> BoxFuture<'s, Vec<ContextItem>> {
        async move {
            let key = title.trim().to_lowercase();
            if level > self.options.max_depth || self.visited_titles.contains(&key) || self.deadline_exceeded() {
                return Vec::new();
            }
            self.visited_titles.insert(key);

            let page = match self.graph.get_page_by_title(title).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    debug!(title = %title, "Page not found");
                    return Vec::new();
                }
                Err(e) => {
                    warn!(title = %title, error = %e, "Failed to fetch page");
                    return Vec::new();
                }
            };
            if !self.visited_ids.insert(page.id.clone()) {
                return Vec::new();
            }
            self.visited_titles.insert(page.title.to_lowercase());

            let content = self.render_page(&page).await;
            let mut items = vec![ContextItem::page(&page.id, &page.title, &content, level, source)
                .with_created_date(page.created_at)];

            if level < self.options.max_depth {
                if self.options.include_backlinks {
                    items.extend(self.collect_backlinks(&page, level + 1).await);
                }
                if self.options.include_block_references {
                    for id in self.graph.extract_block_references(&content) {
                        items.extend(self.process_block(&id, level + 1, ItemSource::BlockReference).await);
                    }
                }
            }

            items
        }
        .boxed()
    }

    fn process_block<'s>(
        &'s mut self,
        id: &'s str,
        level: u32,
        source: ItemSource,
    ) -> BoxFuture<'s, Vec<ContextItem>> {
        async move {
            if level > self.options.max_depth || self.visited_ids.contains(id) || self.deadline_exceeded() {
                return Vec::new();
            }
            self.visited_ids.insert(id.to_string());

            let block = match self.graph.get_block_by_id(id).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!(block_id = %id, "Block not found");
                    return Vec::new();
                }
                Err(e) => {
                    warn!(block_id = %id, error = %e, "Failed to fetch block");
                    return Vec::new();
                }
            };

            if source == ItemSource::UserSpecified {
                self.process_anchor_block(block, level).await
            } else {
                self.process_related_block(block, level, source).await
            }
        }
        .boxed()
    }

    /// An anchor block contributes its whole top-level subtree as one item
    async fn process_anchor_block(&mut self, block: Block, level: u32) -> Vec<ContextItem> {
        let anchor_id = block.id.clone();
        let root = self.top_level_ancestor(block).await;
        if root.id != anchor_id && !self.visited_ids.insert(root.id.clone()) {
            // Another anchor already brought in this subtree
            return Vec::new();
        }

        let content = match self.graph.render_subtree(&root, 0).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(block_id = %root.id, error = %e, "Failed to render anchor subtree");
                root.content.clone()
            }
        };

        let mut items = vec![block_item(&root, &content, level, ItemSource::UserSpecified)];

        if level < self.options.max_depth && self.options.include_page_references {
            let mut path = HashSet::new();
            items.extend(self.resolve_page_references(content, level + 1, &mut path).await);
        }
        items
    }

    /// Follow `[[page]]` references found in `content`, then the references inside
    /// each page reached, sharing one bounded path set per anchor.
    fn resolve_page_references<'s>(
        &'s mut self,
        content: String,
        level: u32,
        path: &'s mut HashSet<String>,
    ) -> BoxFuture<'s, Vec<ContextItem>> {
        async move {
            let mut items = Vec::new();
            if level > self.options.max_depth {
                return items;
            }

            for title in self.graph.extract_page_references(&content) {
                if path.len() >= self.options.reference_path_limit || self.deadline_exceeded() {
                    break;
                }
                if !path.insert(title.to_lowercase()) {
                    continue;
                }

                let found = self.process_page(&title, level, ItemSource::PageContent).await;
                let nested = found
                    .iter()
                    .find(|item| item.kind == ItemKind::Page)
                    .map(|item| item.content.clone());
                items.extend(found);

                if let Some(nested) = nested {
                    if level < self.options.max_depth {
                        items.extend(self.resolve_page_references(nested, level + 1, &mut *path).await);
                    }
                }
            }
            items
        }
        .boxed()
    }

    /// A block reached through a reference or the hierarchy: its own text, then
    /// its surroundings one level further out
    async fn process_related_block(&mut self, block: Block, level: u32, source: ItemSource) -> Vec<ContextItem> {
        let mut items = vec![block_item(&block, &block.content, level, source)];
        if level >= self.options.max_depth {
            return items;
        }
        let next = level + 1;

        if self.options.include_parent_blocks || self.options.include_ancestors {
            items.extend(self.collect_ancestors(&block, next).await);
        }
        if self.options.include_sibling_blocks {
            items.extend(self.collect_siblings(&block, next).await);
        }
        if self.options.include_page_references {
            for title in self.graph.extract_page_references(&block.content) {
                items.extend(self.process_page(&title, next, ItemSource::PageContent).await);
            }
        }
        if self.options.include_block_references {
            for id in self.graph.extract_block_references(&block.content) {
                items.extend(self.process_block(&id, next, ItemSource::BlockReference).await);
            }
        }

        match self.graph.get_children(&block.id).await {
            Ok(children) => {
                for child in children {
                    items.extend(self.process_block(&child.id, next, ItemSource::PageContent).await);
                }
            }
            Err(e) => warn!(block_id = %block.id, error = %e, "Failed to fetch children"),
        }

        items
    }

    /// Parent (if enabled) plus up to `max_ancestors` further ancestors
    async fn collect_ancestors(&mut self, block: &Block, level: u32) -> Vec<ContextItem> {
        let mut items = Vec::new();
        let mut ancestors_left = if self.options.include_ancestors { self.options.max_ancestors } else { 0 };
        let mut cursor = block.id.clone();

        for hop in 0..MAX_ANCESTOR_WALK {
            if self.deadline_exceeded() {
                break;
            }
            let parent = match self.graph.get_parent(&cursor).await {
                Ok(Some(parent)) => parent,
                Ok(None) => break,
                Err(e) => {
                    warn!(block_id = %cursor, error = %e, "Failed to fetch parent");
                    break;
                }
            };

            if !(hop == 0 && self.options.include_parent_blocks) {
                if ancestors_left == 0 {
                    break;
                }
                ancestors_left -= 1;
            }

            cursor = parent.id.clone();
            if self.visited_ids.insert(parent.id.clone()) {
                items.push(block_item(&parent, &parent.content, level, ItemSource::PageContent));
            }
        }
        items
    }

    async fn collect_siblings(&mut self, block: &Block, level: u32) -> Vec<ContextItem> {
        let siblings = match self.graph.get_siblings(&block.id).await {
            Ok(siblings) => siblings,
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "Failed to fetch siblings");
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        for sibling in siblings {
            if items.len() >= self.options.max_siblings {
                break;
            }
            if self.visited_ids.insert(sibling.id.clone()) {
                items.push(block_item(&sibling, &sibling.content, level, ItemSource::PageContent));
            }
        }
        items
    }

    /// Select, filter and render the backlinks of one page
    async fn collect_backlinks(&mut self, page: &Page, level: u32) -> Vec<ContextItem> {
        if self.deadline_exceeded() {
            return Vec::new();
        }
        let blocks = match self.graph.get_backlinks(&page.title).await {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(title = %page.title, error = %e, "Failed to fetch backlinks");
                return Vec::new();
            }
        };

        let found = blocks.len();
        let candidates: Vec<Block> = blocks
            .into_iter()
            .filter(|b| !self.visited_ids.contains(&b.id))
            .collect();
        let selected = select_backlinks(candidates, &self.options.backlinks, self.options.effective_max_backlinks());
        let selected_total = selected.len();
        let yield_every = self.options.yield_every.max(1);

        let mut budget = BacklinkBudget {
            remaining_tokens: self.options.backlinks.expansion_token_budget,
            expanded: 0,
        };
        let mut items = Vec::new();

        for (index, candidate) in selected.into_iter().enumerate() {
            if index > 0 && index % yield_every == 0 {
                tokio::task::yield_now().await;
            }
            if self.deadline_exceeded() {
                break;
            }
            self.backlinks_processed += 1;
            if self.visited_ids.contains(&candidate.block.id) {
                continue;
            }
            let finalized = self
                .finalize_backlink(&page.title, candidate, selected_total, level, &mut budget)
                .await;
            if let Some(item) = finalized {
                items.push(item);
            }
        }

        debug!(
            title = %page.title,
            found,
            selected = selected_total,
            kept = items.len(),
            expanded = budget.expanded,
            "Collected backlinks"
        );
        items
    }

    /// Apply the circular filter and fit the backlink into the page's token allowance
    async fn finalize_backlink(
        &mut self,
        page_title: &str,
        candidate: ScoredBacklink,
        selected_total: usize,
        level: u32,
        budget: &mut BacklinkBudget,
    ) -> Option<ContextItem> {
        let tuning = &self.options.backlinks;
        let block = candidate.block;

        let children = match self.graph.get_children(&block.id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "Failed to fetch backlink children");
                Vec::new()
            }
        };
        if is_circular(&block.content, page_title, &children, tuning) {
            debug!(block_id = %block.id, title = %page_title, "Skipping circular backlink");
            return None;
        }

        let signals = ExpansionSignals {
            always_expand: self.options.expand_backlink_children,
            has_children: !children.is_empty(),
            substantive_len: candidate.score,
            selected_total,
            expanded_so_far: budget.expanded,
        };

        let mut content = None;
        if should_expand(&signals, tuning) {
            match self.graph.render_subtree(&block, 0).await {
                Ok(rendered) => {
                    let cost = self.estimator.estimate(&rendered);
                    if cost <= budget.remaining_tokens {
                        budget.remaining_tokens -= cost;
                        budget.expanded += 1;
                        content = Some(rendered);
                    }
                }
                Err(e) => warn!(block_id = %block.id, error = %e, "Failed to expand backlink"),
            }
        }

        let content = match content {
            Some(expanded) => expanded,
            None => {
                let cost = self.estimator.estimate(&block.content);
                if cost <= budget.remaining_tokens {
                    budget.remaining_tokens -= cost;
                    block.content.clone()
                } else {
                    let cut = truncate_chars(&block.content, budget.remaining_tokens, tuning.chars_per_token)?;
                    budget.remaining_tokens = budget.remaining_tokens.saturating_sub(self.estimator.estimate(&cut));
                    cut
                }
            }
        };

        self.visited_ids.insert(block.id.clone());
        Some(
            ContextItem::backlink(&block.id, content, level)
                .with_owner_page(block.page_title.clone())
                .with_created_date(block.created_at),
        )
    }

    /// Body of a page: its top-level blocks rendered as an outline
    async fn render_page(&self, page: &Page) -> String {
        let blocks = match self.graph.get_children(&page.id).await {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(title = %page.title, error = %e, "Failed to fetch page blocks");
                return String::new();
            }
        };

        let mut parts = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match self.graph.render_subtree(block, 0).await {
                Ok(rendered) => parts.push(rendered),
                Err(e) => {
                    warn!(block_id = %block.id, error = %e, "Failed to render block subtree");
                    parts.push(format!("- {}", block.content));
                }
            }
        }
        parts.join("\n")
    }

    async fn top_level_ancestor(&self, block: Block) -> Block {
        let mut current = block;
        let mut seen = HashSet::new();

        for _ in 0..MAX_ANCESTOR_WALK {
            if !seen.insert(current.id.clone()) {
                break;
            }
            match self.graph.get_parent(&current.id).await {
                Ok(Some(parent)) => current = parent,
                Ok(None) => break,
                Err(e) => {
                    warn!(block_id = %current.id, error = %e, "Failed to resolve ancestor");
                    break;
                }
            }
        }
        current
    }
}

fn block_item(block: &Block, content: &str, level: u32, source: ItemSource) -> ContextItem {
    ContextItem::block(&block.id, content, level, source)
        .with_owner_page(block.page_title.clone())
        .with_created_date(block.created_at)
}
