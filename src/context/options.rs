//! Engine configuration
//!
//! Plain serde structs with documented defaults; hosts can deserialize partial JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Thresholds governing backlink selection and expansion.
///
/// These are empirically chosen and may need recalibration per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BacklinkTuning {
    /// Substantiveness score at or above which a backlink is "strong"
    pub strong_threshold: usize,
    /// Below this many characters (after stripping the page link) a backlink may be circular
    pub circular_text_threshold: usize,
    /// Combined child text below this keeps a short backlink classified as circular
    pub circular_children_threshold: usize,
    /// Substantive text shorter than this likely needs its children to be meaningful
    pub short_content_threshold: usize,
    /// At or below this many selected backlinks, expand generously
    pub few_backlinks_threshold: usize,
    /// Token sub-budget for backlink text per page
    pub expansion_token_budget: u32,
    /// Maximum expanded backlinks per page
    pub max_expanded: usize,
    /// Character-to-token ratio for hard truncation of backlink text
    pub chars_per_token: usize,
}

impl Default for BacklinkTuning {
    fn default() -> Self {
        Self {
            strong_threshold: 10,
            circular_text_threshold: 10,
            circular_children_threshold: 20,
            short_content_threshold: 30,
            few_backlinks_threshold: 8,
            expansion_token_budget: 1500,
            max_expanded: 15,
            chars_per_token: 4,
        }
    }
}

/// Configuration for one traversal run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TraversalOptions {
    pub max_depth: u32,
    pub max_items: usize,
    pub include_backlinks: bool,
    pub include_block_references: bool,
    pub include_page_references: bool,
    pub include_parent_blocks: bool,
    pub include_sibling_blocks: bool,
    pub include_ancestors: bool,
    /// Always expand backlink descendants instead of relying on heuristics
    pub expand_backlink_children: bool,
    /// Overrides the derived per-page backlink cap
    pub max_backlinks: Option<usize>,
    pub max_siblings: usize,
    pub max_ancestors: usize,
    /// Cap on pages followed along one anchor's `[[reference]]` chain
    pub reference_path_limit: usize,
    /// Wall-clock ceiling for a whole run
    pub deadline_ms: u64,
    /// Yield to the runtime every this many backlinks
    pub yield_every: usize,
    pub backlinks: BacklinkTuning,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_items: 50,
            include_backlinks: true,
            include_block_references: true,
            include_page_references: true,
            include_parent_blocks: true,
            include_sibling_blocks: true,
            include_ancestors: true,
            expand_backlink_children: false,
            max_backlinks: None,
            max_siblings: 3,
            max_ancestors: 3,
            reference_path_limit: 20,
            deadline_ms: 30_000,
            yield_every: 20,
            backlinks: BacklinkTuning::default(),
        }
    }
}

impl TraversalOptions {
    /// Per-page backlink cap: explicit override, else clamp(max_items × 2, 20, 100)
    pub fn effective_max_backlinks(&self) -> usize {
        self.max_backlinks
            .unwrap_or_else(|| self.max_items.saturating_mul(2).clamp(20, 100))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_items == 0 {
            return Err(ConfigError::Invalid("maxItems must be at least 1".to_string()));
        }
        if self.yield_every == 0 {
            return Err(ConfigError::Invalid("yieldEvery must be at least 1".to_string()));
        }
        if self.backlinks.chars_per_token == 0 {
            return Err(ConfigError::Invalid("charsPerToken must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Relative weight of each traversal level when splitting the curated budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelWeights {
    pub level0: f64,
    pub level1: f64,
    pub level2: f64,
    /// Level 3 and deeper
    pub deeper: f64,
}

impl Default for LevelWeights {
    fn default() -> Self {
        Self {
            level0: 0.5,
            level1: 0.3,
            level2: 0.15,
            deeper: 0.05,
        }
    }
}

impl LevelWeights {
    pub fn weight_for(&self, level: u32) -> f64 {
        match level {
            0 => self.level0,
            1 => self.level1,
            2 => self.level2,
            _ => self.deeper,
        }
    }
}

/// Configuration for one composition call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComposeOptions {
    /// Provider/model identifier used to look up the context window
    pub model: Option<String>,
    /// Explicit token cap from the caller
    pub token_cap: Option<u32>,
    /// Share of the model window reserved for assembled context
    pub context_token_share: f64,
    /// Share of the reserved budget given to ranked items rather than auxiliary sources
    pub curated_share: f64,
    pub level_weights: LevelWeights,
    /// Extra or overriding context-window sizes, matched like the built-in table
    pub model_windows: HashMap<String, u32>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            model: None,
            token_cap: None,
            context_token_share: 0.7,
            curated_share: 0.85,
            level_weights: LevelWeights::default(),
            model_windows: HashMap::new(),
        }
    }
}

impl ComposeOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, share) in [
            ("contextTokenShare", self.context_token_share),
            ("curatedShare", self.curated_share),
        ] {
            if !(share > 0.0 && share <= 1.0) {
                return Err(ConfigError::Invalid(format!("{} must be in (0, 1], got {}", name, share)));
            }
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub traversal: TraversalOptions,
    pub compose: ComposeOptions,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.traversal.validate()?;
        self.compose.validate()
    }
}
