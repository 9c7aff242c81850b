//! Context items and their ranking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// What kind of graph node an item was rendered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Page,
    Block,
    BacklinkReference,
}

/// Why an item was included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemSource {
    UserSpecified,
    PageContent,
    Backlink,
    BlockReference,
}

impl ItemSource {
    /// Base ranking score; lower is more important
    pub fn base_score(&self) -> u32 {
        match self {
            ItemSource::UserSpecified => 0,
            ItemSource::PageContent => 10,
            ItemSource::Backlink => 20,
            ItemSource::BlockReference => 30,
        }
    }
}

/// Priority of an item at a traversal level
pub fn priority_for(source: ItemSource, level: u32) -> u32 {
    source.base_score() + level * 10
}

/// One unit of retrieved content.
///
/// `level`, `source` and the derived `priority` are fixed at construction.
/// Deserialization ignores any incoming `priority` and recomputes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ContextItemRecord")]
pub struct ContextItem {
    pub kind: ItemKind,
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    level: u32,
    priority: u32,
    pub owner_page_title: Option<String>,
    source: ItemSource,
    pub created_date: Option<DateTime<Utc>>,
    pub navigation_link: Option<String>,
}

/// Wire form of `ContextItem` without the derived priority
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextItemRecord {
    kind: ItemKind,
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
    level: u32,
    #[serde(default)]
    owner_page_title: Option<String>,
    source: ItemSource,
    #[serde(default)]
    created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    navigation_link: Option<String>,
}

impl From<ContextItemRecord> for ContextItem {
    fn from(record: ContextItemRecord) -> Self {
        Self {
            kind: record.kind,
            id: record.id,
            title: record.title,
            content: record.content,
            level: record.level,
            priority: priority_for(record.source, record.level),
            owner_page_title: record.owner_page_title,
            source: record.source,
            created_date: record.created_date,
            navigation_link: record.navigation_link,
        }
    }
}

impl ContextItem {
    pub fn new(
        kind: ItemKind,
        id: impl Into<String>,
        content: impl Into<String>,
        level: u32,
        source: ItemSource,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            title: None,
            content: content.into(),
            level,
            priority: priority_for(source, level),
            owner_page_title: None,
            source,
            created_date: None,
            navigation_link: None,
        }
    }

    /// A page item, linked as `[[title]]`
    pub fn page(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        level: u32,
        source: ItemSource,
    ) -> Self {
        let title = title.into();
        let mut item = Self::new(ItemKind::Page, id, content, level, source);
        item.navigation_link = Some(format!("[[{}]]", title));
        item.title = Some(title);
        item
    }

    /// A block item, linked as `((id))`
    pub fn block(id: impl Into<String>, content: impl Into<String>, level: u32, source: ItemSource) -> Self {
        let id = id.into();
        let mut item = Self::new(ItemKind::Block, id.clone(), content, level, source);
        item.navigation_link = Some(format!("(({}))", id));
        item
    }

    /// A block that references a page, linked as `((id))`
    pub fn backlink(id: impl Into<String>, content: impl Into<String>, level: u32) -> Self {
        let id = id.into();
        let mut item = Self::new(ItemKind::BacklinkReference, id.clone(), content, level, ItemSource::Backlink);
        item.navigation_link = Some(format!("(({}))", id));
        item
    }

    pub fn with_owner_page(mut self, title: Option<String>) -> Self {
        self.owner_page_title = title;
        self
    }

    pub fn with_created_date(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created_date = created;
        self
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn source(&self) -> ItemSource {
        self.source
    }
}

/// Ascending priority, then ascending level, then longer content first
pub fn compare_items(a: &ContextItem, b: &ContextItem) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.level.cmp(&b.level))
        .then(b.content.chars().count().cmp(&a.content.chars().count()))
}

/// Sort, drop duplicate ids and page titles (first in rank order wins), cap at `max_items`
pub fn rank_items(items: &mut Vec<ContextItem>, max_items: usize) {
    items.sort_by(compare_items);

    let mut seen_ids = HashSet::new();
    let mut seen_titles = HashSet::new();
    items.retain(|item| {
        if !seen_ids.insert(item.id.clone()) {
            return false;
        }
        match (item.kind, &item.title) {
            (ItemKind::Page, Some(title)) => seen_titles.insert(title.to_lowercase()),
            _ => true,
        }
    });

    items.truncate(max_items);
}
