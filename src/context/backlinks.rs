//! Backlink scoring, selection and expansion decisions
//!
//! Pure functions over already-fetched blocks; the traversal does the I/O.

use crate::graph::refs::{strip_page_references, strip_reference_to};
use crate::graph::Block;

use super::options::BacklinkTuning;

/// A backlink paired with its substantiveness score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBacklink {
    pub block: Block,
    /// Characters left once all `[[...]]` markup is stripped
    pub score: usize,
}

/// Character length of the text with every page link removed
pub fn substantiveness(content: &str) -> usize {
    strip_page_references(content).trim().chars().count()
}

/// Score backlinks, take strong ones (highest score first), then weak ones, up to `cap`
pub fn select_backlinks(blocks: Vec<Block>, tuning: &BacklinkTuning, cap: usize) -> Vec<ScoredBacklink> {
    let (mut strong, mut weak): (Vec<_>, Vec<_>) = blocks
        .into_iter()
        .map(|block| {
            let score = substantiveness(&block.content);
            ScoredBacklink { block, score }
        })
        .partition(|b| b.score >= tuning.strong_threshold);

    strong.sort_by(|a, b| b.score.cmp(&a.score));
    weak.sort_by(|a, b| b.score.cmp(&a.score));

    strong.into_iter().chain(weak).take(cap).collect()
}

/// Whether a backlink is a trivial "mentioned on this page" stub.
///
/// Short text (once the link to `page_title` is stripped) is circular unless its
/// children carry enough text of their own.
pub fn is_circular(content: &str, page_title: &str, children: &[Block], tuning: &BacklinkTuning) -> bool {
    let own = strip_reference_to(content, page_title).trim().chars().count();
    if own >= tuning.circular_text_threshold {
        return false;
    }
    let child_text: usize = children.iter().map(|c| c.content.trim().chars().count()).sum();
    children.is_empty() || child_text < tuning.circular_children_threshold
}

/// Everything the expansion decision looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionSignals {
    /// Caller asked for backlink descendants unconditionally
    pub always_expand: bool,
    pub has_children: bool,
    /// Substantiveness score of the backlink's own text
    pub substantive_len: usize,
    /// How many backlinks were selected for this page
    pub selected_total: usize,
    /// How many backlinks on this page were already expanded
    pub expanded_so_far: usize,
}

/// Decide whether a backlink should be rendered with its full subtree.
///
/// Never for childless blocks or once `max_expanded` is reached. Otherwise any of:
/// the explicit flag, text too short to stand alone, or few enough selected
/// backlinks that generous expansion is affordable. Token fit is checked by the caller.
pub fn should_expand(signals: &ExpansionSignals, tuning: &BacklinkTuning) -> bool {
    if !signals.has_children || signals.expanded_so_far >= tuning.max_expanded {
        return false;
    }
    signals.always_expand
        || signals.substantive_len < tuning.short_content_threshold
        || signals.selected_total <= tuning.few_backlinks_threshold
}
