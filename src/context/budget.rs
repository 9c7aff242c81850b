//! Token Budget Management
//!
//! Derives the effective token budget from the model window and caller cap, splits
//! the curated share across traversal levels, and rebalances unused allocation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::options::{ComposeOptions, LevelWeights};

/// Context window assumed for unknown or absent models
pub const DEFAULT_CONTEXT_WINDOW: u32 = 6_000;
/// Floor for the effective budget, whatever the cap
pub const MIN_CONTEXT_BUDGET: u32 = 1_000;
/// Minimum tokens worth spending on a truncated section
pub const MIN_SECTION_FLOOR: u32 = 20;
/// Dynamic section floor as a share of the effective budget
pub const SECTION_FLOOR_SHARE: f64 = 0.03;

/// Known context windows, matched by case-insensitive substring
const MODEL_WINDOWS: &[(&str, u32)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("claude", 200_000),
    ("gemini-1.5", 1_000_000),
    ("llama3", 8_192),
    ("mistral", 32_000),
    ("qwen", 32_768),
];

/// Longest key contained in `model` wins
fn longest_match<'k>(model: &str, keys: impl Iterator<Item = (&'k str, u32)>) -> Option<u32> {
    keys.filter(|(key, _)| !key.is_empty() && model.contains(&key.to_lowercase()))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, window)| window)
}

/// Total context window for a model identifier; overrides take precedence
pub fn context_window_for(model: Option<&str>, overrides: &HashMap<String, u32>) -> u32 {
    let Some(model) = model.map(str::to_lowercase) else {
        return DEFAULT_CONTEXT_WINDOW;
    };
    longest_match(&model, overrides.iter().map(|(k, v)| (k.as_str(), *v)))
        .or_else(|| longest_match(&model, MODEL_WINDOWS.iter().copied()))
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Effective budget: the cap (if any) limited to `window × contextTokenShare`, never below 1000
pub fn effective_budget(options: &ComposeOptions) -> u32 {
    let window = context_window_for(options.model.as_deref(), &options.model_windows);
    let model_budget = (window as f64 * options.context_token_share) as u32;
    match options.token_cap {
        Some(cap) => cap.min(model_budget).max(MIN_CONTEXT_BUDGET),
        None => model_budget.max(MIN_CONTEXT_BUDGET),
    }
}

/// Smallest remaining space worth filling with a truncated section
pub fn section_floor(budget: u32) -> u32 {
    MIN_SECTION_FLOOR.max((budget as f64 * SECTION_FLOOR_SHARE) as u32)
}

/// Split the curated budget across the levels present, renormalizing their weights
pub fn level_allocations(curated: u32, levels: &[u32], weights: &LevelWeights) -> Vec<u32> {
    if levels.is_empty() {
        return Vec::new();
    }
    let total: f64 = levels.iter().map(|&l| weights.weight_for(l)).sum();
    if total <= 0.0 {
        let share = curated / levels.len() as u32;
        return vec![share; levels.len()];
    }
    levels
        .iter()
        .map(|&l| (curated as f64 * weights.weight_for(l) / total) as u32)
        .collect()
}

/// One section's budget line before rebalancing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Lower is more important
    pub priority: u32,
    pub allocated: u32,
    pub needed: u32,
}

/// Two-pass rebalancing.
///
/// Pass 1 shrinks every over-provisioned allocation to its need and pools the
/// surplus. Pass 2 hands the pool to sections still short, most important first.
/// Returns the adjusted allocations in input order.
pub fn rebalance(allocations: &[Allocation]) -> Vec<u32> {
    let mut adjusted: Vec<u32> = allocations.iter().map(|a| a.allocated).collect();
    let mut pool: u32 = 0;

    for (slot, a) in adjusted.iter_mut().zip(allocations) {
        if a.needed < a.allocated {
            pool += a.allocated - a.needed;
            *slot = a.needed;
        }
    }

    let mut order: Vec<usize> = (0..allocations.len()).collect();
    order.sort_by_key(|&i| allocations[i].priority);
    for i in order {
        if pool == 0 {
            break;
        }
        let short = allocations[i].needed.saturating_sub(adjusted[i]);
        let grant = short.min(pool);
        adjusted[i] += grant;
        pool -= grant;
    }

    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_window_lookup() {
        let none = HashMap::new();
        assert_eq!(context_window_for(None, &none), DEFAULT_CONTEXT_WINDOW);
        assert_eq!(context_window_for(Some("unknown-model"), &none), DEFAULT_CONTEXT_WINDOW);
        assert_eq!(context_window_for(Some("GPT-4o-mini"), &none), 128_000);
        assert_eq!(context_window_for(Some("gpt-4-0613"), &none), 8_192);
        assert_eq!(context_window_for(Some("anthropic/claude-3-haiku"), &none), 200_000);
    }

    #[test]
    fn test_window_overrides_win() {
        let overrides = HashMap::from([("claude-3-haiku".to_string(), 48_000)]);
        assert_eq!(context_window_for(Some("claude-3-haiku-20240307"), &overrides), 48_000);
        assert_eq!(context_window_for(Some("claude-3-opus"), &overrides), 200_000);
    }

    #[test]
    fn test_effective_budget_clamping() {
        let mut options = ComposeOptions::default();
        assert_eq!(effective_budget(&options), 4_200);

        options.token_cap = Some(1_200);
        assert_eq!(effective_budget(&options), 1_200);

        options.token_cap = Some(200);
        assert_eq!(effective_budget(&options), MIN_CONTEXT_BUDGET);

        options.token_cap = Some(50_000);
        assert_eq!(effective_budget(&options), 4_200);

        options.model = Some("gpt-4o".to_string());
        assert_eq!(effective_budget(&options), 50_000);
    }

    #[test]
    fn test_section_floor() {
        assert_eq!(section_floor(100), 20);
        assert_eq!(section_floor(4_200), 126);
    }

    #[test]
    fn test_level_allocations_renormalize_present_levels() {
        let weights = LevelWeights::default();
        let close = |actual: Vec<u32>, expected: &[u32]| {
            assert_eq!(actual.len(), expected.len());
            for (a, e) in actual.iter().zip(expected) {
                assert!(a.abs_diff(*e) <= 1, "{:?} vs {:?}", actual, expected);
            }
        };
        close(level_allocations(1_000, &[0, 1, 2, 3], &weights), &[500, 300, 150, 50]);
        // 0.5 and 0.15 renormalized to sum to one
        close(level_allocations(1_300, &[0, 2], &weights), &[1_000, 300]);
        assert!(level_allocations(1_000, &[], &weights).is_empty());
    }

    #[test]
    fn test_rebalance_moves_surplus_by_priority() {
        let allocations = [
            Allocation { priority: 0, allocated: 500, needed: 800 },
            Allocation { priority: 1, allocated: 300, needed: 100 },
            Allocation { priority: 2, allocated: 150, needed: 400 },
            Allocation { priority: 3, allocated: 50, needed: 0 },
        ];
        // Pool of 250 goes to priority 0 first, leaving nothing for priority 2
        assert_eq!(rebalance(&allocations), vec![750, 100, 150, 0]);
    }

    #[test]
    fn test_rebalance_all_satisfied() {
        let allocations = [
            Allocation { priority: 1, allocated: 100, needed: 150 },
            Allocation { priority: 0, allocated: 400, needed: 50 },
        ];
        assert_eq!(rebalance(&allocations), vec![150, 50]);
    }

    #[test]
    fn test_rebalance_never_grows_total() {
        let allocations = [
            Allocation { priority: 2, allocated: 10, needed: 1_000 },
            Allocation { priority: 1, allocated: 10, needed: 1_000 },
        ];
        let adjusted = rebalance(&allocations);
        assert_eq!(adjusted, vec![10, 10]);
        assert!(adjusted.iter().sum::<u32>() <= 20);
    }
}
