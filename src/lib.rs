// Note Context Library
// Assembles language-model context from a hierarchical note graph

pub mod context;
pub mod graph;

pub use context::{
    build_context, compose_unified_context, estimate_tokens, truncate_preserving_structure, AuxiliarySource,
    BacklinkTuning, ComposeOptions, CompositionReport, ConfigError, ContextComposer, ContextItem, ContextTraversal,
    EngineConfig, ItemKind, ItemSource, TokenEstimator, TraversalOptions,
};
pub use graph::{index_vault, Block, GraphError, GraphQuery, GraphResult, IndexStats, MemoryGraph, Page};
