//! Context Assembly Module
//!
//! Builds a ranked, deduplicated, size-bounded bundle of note text for a language
//! model: traversal from user anchors, then budgeted composition into one string.

pub mod backlinks;
pub mod budget;
pub mod compose;
pub mod item;
pub mod options;
pub mod tokens;
pub mod traversal;
pub mod truncate;

// Re-export public types for external use
pub use budget::{context_window_for, effective_budget, rebalance, Allocation};
pub use compose::{
    compose_unified_context, AuxiliarySource, CompositionReport, ContextComposer, SectionOutcome, SectionStatus,
};
pub use item::{ContextItem, ItemKind, ItemSource};
pub use options::{BacklinkTuning, ComposeOptions, ConfigError, EngineConfig, LevelWeights, TraversalOptions};
pub use tokens::{estimate_tokens, Cl100kEstimator, HeuristicEstimator, TokenEstimator};
pub use traversal::{build_context, ContextTraversal};
pub use truncate::{truncate_paragraphs, truncate_preserving_structure, Truncation};
