//! Budget-aware truncation

use super::tokens::TokenEstimator;

/// Share of the budget paragraphs may fill, leaving room for the trailing notice
const PARAGRAPH_FILL_RATIO: f64 = 0.9;

/// Result of paragraph-preserving truncation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub text: String,
    /// Paragraphs kept whole
    pub kept: usize,
    /// Paragraphs left out and counted in the notice
    pub omitted: usize,
}

impl Truncation {
    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }
}

/// Shrink text to a token budget without splitting paragraphs.
///
/// Whole paragraphs (blank-line separated) are kept while the running estimate
/// stays under 90% of the budget. The first paragraph that would cross it ends the
/// scan, and a notice counts the paragraphs left out. A lone paragraph larger
/// than the budget is dropped, never cut.
pub fn truncate_preserving_structure(text: &str, token_budget: u32, estimator: &dyn TokenEstimator) -> String {
    truncate_paragraphs(text, token_budget, estimator).text
}

/// Like `truncate_preserving_structure`, also reporting how many paragraphs were kept and omitted
pub fn truncate_paragraphs(text: &str, token_budget: u32, estimator: &dyn TokenEstimator) -> Truncation {
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();

    if estimator.estimate(text) <= token_budget {
        return Truncation {
            text: text.to_string(),
            kept: paragraphs.len(),
            omitted: 0,
        };
    }

    let limit = (token_budget as f64 * PARAGRAPH_FILL_RATIO) as u32;
    let separator_tokens = estimator.estimate("\n\n");

    let mut kept: Vec<&str> = Vec::new();
    let mut running = 0u32;
    for paragraph in &paragraphs {
        let cost = estimator.estimate(paragraph) + if kept.is_empty() { 0 } else { separator_tokens };
        if running + cost >= limit {
            break;
        }
        running += cost;
        kept.push(paragraph);
    }

    let omitted = paragraphs.len() - kept.len();
    let mut out = kept.join("\n\n");
    if omitted > 0 {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("... ({} more sections truncated for brevity)", omitted));
    }
    Truncation {
        text: out,
        kept: kept.len(),
        omitted,
    }
}

/// Hard-cut text to `max_tokens × chars_per_token` characters with an ellipsis.
///
/// Returns `None` when not even the ellipsis plus one character fits.
pub fn truncate_chars(text: &str, max_tokens: u32, chars_per_token: usize) -> Option<String> {
    let max_chars = (max_tokens as usize).saturating_mul(chars_per_token);
    if text.chars().count() <= max_chars {
        return Some(text.to_string());
    }
    if max_chars <= 3 {
        return None;
    }
    let cut: String = text.chars().take(max_chars - 3).collect();
    Some(format!("{}...", cut.trim_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::{estimate_tokens, HeuristicEstimator};

    fn paragraph(tokens: usize) -> String {
        "word ".repeat(tokens * 4 / 5).trim_end().to_string()
    }

    #[test]
    fn test_fits_unchanged() {
        let text = "one\n\ntwo";
        assert_eq!(truncate_preserving_structure(text, 100, &HeuristicEstimator), text);
    }

    #[test]
    fn test_truncates_at_paragraph_boundary() {
        let paras: Vec<String> = (0..5).map(|_| paragraph(100)).collect();
        let text = paras.join("\n\n");
        let out = truncate_preserving_structure(&text, 250, &HeuristicEstimator);

        assert!(out.starts_with(&paras[0]));
        assert!(out.ends_with("... (3 more sections truncated for brevity)"));
        assert!(estimate_tokens(&out) <= 250);

        let report = truncate_paragraphs(&text, 250, &HeuristicEstimator);
        assert_eq!(report.text, out);
        assert_eq!((report.kept, report.omitted), (2, 3));
        assert!(report.is_truncated());
    }

    #[test]
    fn test_quoted_notice_is_not_truncation() {
        let text = "We saw \"... (2 more sections truncated for brevity)\" in an old export.\n\nSecond note.";
        let result = truncate_paragraphs(text, 100, &HeuristicEstimator);
        assert_eq!(result.text, text);
        assert_eq!((result.kept, result.omitted), (2, 0));
        assert!(!result.is_truncated());
    }

    #[test]
    fn test_oversized_single_paragraph_omitted() {
        let text = format!("{}\n\nsmall", paragraph(500));
        let result = truncate_paragraphs(&text, 100, &HeuristicEstimator);
        assert_eq!(result.text, "... (2 more sections truncated for brevity)");
        assert_eq!(result.kept, 0);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10, 4).as_deref(), Some("short"));
        assert_eq!(truncate_chars("abcdefghij", 2, 4).as_deref(), Some("abcde..."));
        assert_eq!(truncate_chars("abcdefghij", 0, 4), None);
        assert_eq!(truncate_chars("日本語のテキスト", 1, 4).as_deref(), Some("日..."));
    }
}
