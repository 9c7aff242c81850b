//! Context Composition
//!
//! Turns ranked `ContextItem`s (plus optional auxiliary sources) into the single
//! string handed to the language model, within the effective token budget.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::budget::{effective_budget, level_allocations, rebalance, section_floor, Allocation};
use super::item::{ContextItem, ItemKind, ItemSource};
use super::options::ComposeOptions;
use super::tokens::{HeuristicEstimator, TokenEstimator};
use super::truncate::truncate_paragraphs;

/// Returned when there is nothing to compose
pub const NO_CONTENT_MESSAGE: &str = "No relevant content was found in your notes for this request.";

/// Returned when only auxiliary page context exists
pub const AUXILIARY_ONLY_NOTICE: &str =
    "No linked notes were found for the selected pages. Only the surrounding page context is available.";

/// Appended last, when it fits
pub const REFERENCE_FOOTER: &str = "When referring to notes, only use [[page]] and ((block)) references that \
appear verbatim in the context above. Do not invent references that are not listed.";

/// Auxiliary sections rank after every traversal level
const AUX_PRIORITY_BASE: u32 = 1_000;

const SECTION_SEPARATOR: &str = "\n\n";

/// Section title for a traversal level
pub fn level_title(level: u32) -> &'static str {
    match level {
        0 => "Page Content",
        1 => "Directly Related Content",
        2 => "Extended Related Content",
        _ => "Background Information",
    }
}

/// Extra context not reached by traversal, e.g. other open pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliarySource {
    pub label: String,
    pub content: String,
}

impl AuxiliarySource {
    pub fn new(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }
}

/// One named, budgeted slice of the output
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: String,
    pub body: String,
    /// Lower is emitted first
    pub priority: u32,
    pub allocation: u32,
}

impl Section {
    fn header(&self) -> String {
        format!("## {}\n\n", self.title)
    }

    fn render(&self) -> String {
        format!("{}{}", self.header(), self.body)
    }
}

/// How a section made it into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionOutcome {
    Full,
    Truncated,
    Skipped,
}

/// Per-section accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionStatus {
    pub title: String,
    pub priority: u32,
    /// Allocation after rebalancing
    pub allocated: u32,
    pub needed: u32,
    /// Tokens the section added to the output
    pub used: u32,
    pub outcome: SectionOutcome,
}

/// Budget accounting for one composition, for hosts that display it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionReport {
    pub budget: u32,
    pub curated_budget: u32,
    pub used: u32,
    pub footer_included: bool,
    pub sections: Vec<SectionStatus>,
}

/// Render one item as a heading line followed by its content
pub fn render_item(item: &ContextItem) -> String {
    let mut out = match item.kind {
        ItemKind::Page => format!("### [[{}]]", item.title.as_deref().unwrap_or(&item.id)),
        ItemKind::Block => format!("### Block (({}))", item.id),
        ItemKind::BacklinkReference => format!("### Reference (({}))", item.id),
    };
    if item.kind != ItemKind::Page {
        if let Some(owner) = &item.owner_page_title {
            out.push_str(&format!(" on [[{}]]", owner));
        }
    }
    if let Some(created) = item.created_date {
        out.push_str(&format!("\nCreated: {}", created.format("%Y-%m-%d")));
    }
    let content = item.content.trim();
    if !content.is_empty() {
        out.push('\n');
        out.push_str(content);
    }
    out
}

/// `Context Sources: [[A]], [[B]]` for the explicitly anchored pages
fn sources_line(items: &[ContextItem]) -> Option<String> {
    let mut seen = HashSet::new();
    let links: Vec<String> = items
        .iter()
        .filter(|i| i.kind == ItemKind::Page && i.level() == 0 && i.source() == ItemSource::UserSpecified)
        .filter_map(|i| i.title.as_deref())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(|t| format!("[[{}]]", t))
        .collect();

    if links.is_empty() {
        None
    } else {
        Some(format!("Context Sources: {}", links.join(", ")))
    }
}

fn join_blocks(head: &str, tail: &str) -> String {
    if head.is_empty() {
        tail.to_string()
    } else {
        format!("{}{}{}", head, SECTION_SEPARATOR, tail)
    }
}

/// Composes budgeted context strings
pub struct ContextComposer<'e> {
    options: ComposeOptions,
    estimator: &'e dyn TokenEstimator,
}

impl<'e> ContextComposer<'e> {
    pub fn new(options: ComposeOptions) -> Self {
        Self {
            options,
            estimator: &HeuristicEstimator,
        }
    }

    pub fn with_estimator(mut self, estimator: &'e dyn TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn options(&self) -> &ComposeOptions {
        &self.options
    }

    pub fn compose(&self, items: &[ContextItem], auxiliary: &[AuxiliarySource]) -> String {
        self.compose_with_report(items, auxiliary).0
    }

    /// Compose and return the budget accounting alongside the text
    pub fn compose_with_report(
        &self,
        items: &[ContextItem],
        auxiliary: &[AuxiliarySource],
    ) -> (String, CompositionReport) {
        let auxiliary: Vec<&AuxiliarySource> = auxiliary
            .iter()
            .filter(|s| !s.content.trim().is_empty())
            .collect();
        let budget = effective_budget(&self.options);
        let mut report = CompositionReport {
            budget,
            ..Default::default()
        };

        if items.is_empty() {
            let message = if auxiliary.is_empty() {
                NO_CONTENT_MESSAGE
            } else {
                AUXILIARY_ONLY_NOTICE
            };
            return (message.to_string(), report);
        }

        let curated = if auxiliary.is_empty() {
            budget
        } else {
            (budget as f64 * self.options.curated_share) as u32
        };
        report.curated_budget = curated;

        let mut sections = self.level_sections(items, curated);
        sections.extend(auxiliary_sections(&auxiliary, budget.saturating_sub(curated)));
        sections.sort_by_key(|s| s.priority);

        let needs: Vec<u32> = sections
            .iter()
            .map(|s| self.estimator.estimate(&s.render()))
            .collect();
        let allocations: Vec<Allocation> = sections
            .iter()
            .zip(&needs)
            .map(|(s, &needed)| Allocation {
                priority: s.priority,
                allocated: s.allocation,
                needed,
            })
            .collect();
        for (section, allocation) in sections.iter_mut().zip(rebalance(&allocations)) {
            section.allocation = allocation;
        }

        let mut out = sources_line(items)
            .filter(|line| self.estimator.estimate(line) <= budget)
            .unwrap_or_default();
        let floor = section_floor(budget);

        for (section, &needed) in sections.iter().zip(&needs) {
            let (outcome, used) = self.place_section(&mut out, section, needed, budget, floor);
            report.sections.push(SectionStatus {
                title: section.title.clone(),
                priority: section.priority,
                allocated: section.allocation,
                needed,
                used,
                outcome,
            });
        }

        let with_footer = join_blocks(&out, REFERENCE_FOOTER);
        if self.estimator.estimate(&with_footer) <= budget {
            out = with_footer;
            report.footer_included = true;
        }
        report.used = self.estimator.estimate(&out);

        debug!(
            budget,
            curated,
            used = report.used,
            sections = report.sections.len(),
            skipped = report
                .sections
                .iter()
                .filter(|s| s.outcome == SectionOutcome::Skipped)
                .count(),
            "Composed context"
        );
        (out, report)
    }

    /// One section per traversal level present; level 3 and deeper share a section
    fn level_sections(&self, items: &[ContextItem], curated: u32) -> Vec<Section> {
        let mut groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for item in items {
            groups.entry(item.level().min(3)).or_default().push(render_item(item));
        }

        let levels: Vec<u32> = groups.keys().copied().collect();
        let allocations = level_allocations(curated, &levels, &self.options.level_weights);

        groups
            .into_iter()
            .zip(allocations)
            .map(|((level, rendered), allocation)| Section {
                title: level_title(level).to_string(),
                body: rendered.join(SECTION_SEPARATOR),
                priority: level,
                allocation,
            })
            .collect()
    }

    /// Append a section whole, truncated, or not at all.
    ///
    /// Every acceptance is checked against the estimate of the whole output.
    fn place_section(
        &self,
        out: &mut String,
        section: &Section,
        needed: u32,
        budget: u32,
        floor: u32,
    ) -> (SectionOutcome, u32) {
        let before = self.estimator.estimate(out);

        let whole = join_blocks(out, &section.render());
        let whole_cost = self.estimator.estimate(&whole);
        if needed <= section.allocation && whole_cost <= budget {
            *out = whole;
            return (SectionOutcome::Full, whole_cost.saturating_sub(before));
        }

        let remaining = section.allocation.min(budget.saturating_sub(before));
        if remaining <= floor {
            return (SectionOutcome::Skipped, 0);
        }

        let header = section.header();
        let overhead = self.estimator.estimate(&header) + self.estimator.estimate(SECTION_SEPARATOR);
        let body = truncate_paragraphs(&section.body, remaining.saturating_sub(overhead), self.estimator);
        if body.kept == 0 {
            return (SectionOutcome::Skipped, 0);
        }

        let candidate = join_blocks(out, &format!("{}{}", header, body.text));
        let cost = self.estimator.estimate(&candidate);
        if cost > budget {
            return (SectionOutcome::Skipped, 0);
        }
        *out = candidate;
        let outcome = if body.is_truncated() {
            SectionOutcome::Truncated
        } else {
            SectionOutcome::Full
        };
        (outcome, cost.saturating_sub(before))
    }
}

/// Equal shares of the non-curated budget, in the order given
fn auxiliary_sections(sources: &[&AuxiliarySource], aux_budget: u32) -> Vec<Section> {
    if sources.is_empty() {
        return Vec::new();
    }
    let share = aux_budget / sources.len() as u32;
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| Section {
            title: if source.label.trim().is_empty() {
                "Additional Context".to_string()
            } else {
                source.label.trim().to_string()
            },
            body: source.content.trim().to_string(),
            priority: AUX_PRIORITY_BASE + i as u32,
            allocation: share,
        })
        .collect()
}

/// Compose items and optional auxiliary sources with the default estimator
pub fn compose_unified_context(
    items: &[ContextItem],
    auxiliary: Option<&[AuxiliarySource]>,
    options: &ComposeOptions,
) -> String {
    ContextComposer::new(options.clone()).compose(items, auxiliary.unwrap_or(&[]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::{estimate_tokens, Cl100kEstimator};
    use chrono::{TimeZone, Utc};

    fn page(title: &str, content: &str, level: u32, source: ItemSource) -> ContextItem {
        ContextItem::page(format!("p-{}", title.to_lowercase()), title, content, level, source)
    }

    fn capped(cap: u32) -> ComposeOptions {
        ComposeOptions {
            token_cap: Some(cap),
            ..Default::default()
        }
    }

    fn words(tokens: usize) -> String {
        "word ".repeat(tokens * 4 / 5).trim_end().to_string()
    }

    #[test]
    fn test_no_items_no_aux() {
        assert_eq!(compose_unified_context(&[], None, &ComposeOptions::default()), NO_CONTENT_MESSAGE);
        let blank = [AuxiliarySource::new("Open page", "   ")];
        assert_eq!(
            compose_unified_context(&[], Some(&blank), &ComposeOptions::default()),
            NO_CONTENT_MESSAGE
        );
    }

    #[test]
    fn test_no_items_with_aux_returns_notice() {
        let aux = [AuxiliarySource::new("Open page", "Some surrounding text")];
        let out = compose_unified_context(&[], Some(&aux), &ComposeOptions::default());
        assert_eq!(out, AUXILIARY_ONLY_NOTICE);
    }

    #[test]
    fn test_everything_fits() {
        let created = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let items = vec![
            page("Rust", "- Ownership basics", 0, ItemSource::UserSpecified).with_created_date(Some(created)),
            ContextItem::backlink("j1", "Studied [[Rust]] today", 1).with_owner_page(Some("Journal".to_string())),
            ContextItem::block("t1", "Traits define behaviour", 1, ItemSource::BlockReference),
            page("Generics", "- Monomorphization", 2, ItemSource::PageContent),
        ];
        let out = compose_unified_context(&items, None, &ComposeOptions::default());

        assert!(out.starts_with(
            "Context Sources: [[Rust]]\n\n## Page Content\n\n### [[Rust]]\nCreated: 2024-03-09\n- Ownership basics"
        ));
        assert!(out.contains("### Reference ((j1)) on [[Journal]]\nStudied [[Rust]] today"));
        assert!(out.contains("### Block ((t1))\nTraits define behaviour"));

        let level0 = out.find("## Page Content").unwrap();
        let level1 = out.find("## Directly Related Content").unwrap();
        let level2 = out.find("## Extended Related Content").unwrap();
        assert!(level0 < level1 && level1 < level2);
        assert!(!out.contains("Background Information"));
        assert!(out.ends_with(REFERENCE_FOOTER));
    }

    #[test]
    fn test_sources_line_only_lists_anchor_pages() {
        let items = vec![
            page("Rust", "a", 0, ItemSource::UserSpecified),
            page("Traits", "b", 1, ItemSource::PageContent),
            ContextItem::backlink("j1", "c", 1),
        ];
        let out = compose_unified_context(&items, None, &ComposeOptions::default());
        assert!(out.starts_with("Context Sources: [[Rust]]\n\n"));

        let no_anchor_pages = vec![ContextItem::block("b1", "text", 0, ItemSource::UserSpecified)];
        let out = compose_unified_context(&no_anchor_pages, None, &ComposeOptions::default());
        assert!(out.starts_with("## Page Content"));
    }

    #[test]
    fn test_tight_budget_truncates_level_zero() {
        let items: Vec<ContextItem> = (0..5)
            .map(|i| page(&format!("Note {}", i), &"word ".repeat(640), 0, ItemSource::UserSpecified))
            .collect();
        let total: u32 = items.iter().map(|i| estimate_tokens(&i.content)).sum();
        assert!(total >= 4_000);

        let composer = ContextComposer::new(capped(1_200));
        let (out, report) = composer.compose_with_report(&items, &[]);

        assert_eq!(report.budget, 1_200);
        assert!(estimate_tokens(&out) <= 1_200);
        assert!(out.contains("## Page Content"));
        assert!(out.contains("### [[Note 0]]"));
        assert!(out.contains("... (4 more sections truncated for brevity)"));
        assert!(!out.contains("Directly Related Content"));
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].outcome, SectionOutcome::Truncated);
    }

    #[test]
    fn test_budget_respected_across_shapes() {
        let mut items = Vec::new();
        for level in 0..5u32 {
            for n in 0..4usize {
                let body = format!("{}\n\n{}", words(40 + n * 90), words(25 * (level as usize + 1)));
                items.push(ContextItem::block(
                    format!("b{}-{}", level, n),
                    body,
                    level,
                    ItemSource::PageContent,
                ));
            }
        }
        let aux = [
            AuxiliarySource::new("Yesterday", words(600)),
            AuxiliarySource::new("Open page", words(90)),
        ];

        for cap in [Some(200), Some(1_000), Some(1_700), Some(3_000), None] {
            for auxiliary in [None, Some(&aux[..])] {
                let options = ComposeOptions { token_cap: cap, ..Default::default() };
                let budget = effective_budget(&options);
                let out = compose_unified_context(&items, auxiliary, &options);
                assert!(
                    estimate_tokens(&out) <= budget,
                    "cap {:?} aux {} produced {} tokens over {}",
                    cap,
                    auxiliary.is_some(),
                    estimate_tokens(&out),
                    budget
                );
            }
        }
    }

    #[test]
    fn test_budget_respected_with_bpe_estimator() {
        let estimator = Cl100kEstimator::new();
        let items: Vec<ContextItem> = (0..6)
            .map(|i| page(&format!("Topic {}", i), &words(300), i % 3, ItemSource::PageContent))
            .collect();
        let composer = ContextComposer::new(capped(1_000)).with_estimator(&estimator);
        let (out, report) = composer.compose_with_report(&items, &[]);
        assert!(estimator.estimate(&out) <= 1_000);
        assert_eq!(report.used, estimator.estimate(&out));
    }

    #[test]
    fn test_only_present_levels_get_sections() {
        let items = vec![
            page("Rust", "root", 0, ItemSource::UserSpecified),
            ContextItem::block("deep", "far away", 2, ItemSource::PageContent),
            ContextItem::block("deeper", "further", 4, ItemSource::PageContent),
        ];
        let (out, report) = ContextComposer::new(ComposeOptions::default()).compose_with_report(&items, &[]);
        let titles: Vec<_> = report.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Page Content", "Extended Related Content", "Background Information"]);
        assert!(!out.contains("Directly Related Content"));
    }

    #[test]
    fn test_rebalancing_lets_large_level_fit_whole() {
        let items = vec![
            page("A", &words(450), 0, ItemSource::UserSpecified),
            page("B", &words(450), 0, ItemSource::UserSpecified),
            page("C", &words(450), 0, ItemSource::UserSpecified),
            ContextItem::block("small", "tiny related note", 1, ItemSource::PageContent),
        ];
        let (out, report) = ContextComposer::new(capped(2_000)).compose_with_report(&items, &[]);

        let level0 = &report.sections[0];
        // Level 0 starts with 1250 of 2000 but needs more; level 1 gives up its surplus
        assert!(level0.needed > 1_250);
        assert_eq!(level0.allocated, level0.needed);
        assert_eq!(level0.outcome, SectionOutcome::Full);
        assert!(!out.contains("more sections truncated for brevity"));
        assert!(out.contains("### [[C]]"));
        assert!(out.contains("tiny related note"));
    }

    #[test]
    fn test_auxiliary_sections_follow_curated() {
        let items = vec![page("Rust", "root content", 0, ItemSource::UserSpecified)];
        let aux = [
            AuxiliarySource::new("Yesterday's Journal", "Met with the team"),
            AuxiliarySource::new("", "Unlabelled notes"),
        ];
        let (out, report) = ContextComposer::new(ComposeOptions::default()).compose_with_report(&items, &aux);

        let curated = out.find("## Page Content").unwrap();
        let journal = out.find("## Yesterday's Journal\n\nMet with the team").unwrap();
        let extra = out.find("## Additional Context\n\nUnlabelled notes").unwrap();
        assert!(curated < journal && journal < extra);
        assert_eq!(report.curated_budget, (4_200f64 * 0.85) as u32);
    }

    #[test]
    fn test_oversized_aux_is_skipped_when_no_room() {
        let items = vec![page("Rust", &words(900), 0, ItemSource::UserSpecified)];
        let aux = [AuxiliarySource::new("Huge", words(5_000))];
        let (out, report) = ContextComposer::new(capped(1_000)).compose_with_report(&items, &aux);

        assert!(estimate_tokens(&out) <= 1_000);
        let huge = report.sections.iter().find(|s| s.title == "Huge").unwrap();
        // A single oversized paragraph is dropped rather than cut
        assert_eq!(huge.outcome, SectionOutcome::Skipped);
        assert!(!out.contains("## Huge"));
    }

    #[test]
    fn test_quoted_notice_in_content_is_not_truncation() {
        let quoted = "An old export ended with \"... (3 more sections truncated for brevity)\" mid-page.";
        let items = vec![page("Export", quoted, 0, ItemSource::UserSpecified)];
        let (out, report) = ContextComposer::new(ComposeOptions::default()).compose_with_report(&items, &[]);

        assert!(out.contains(quoted));
        assert_eq!(report.sections[0].outcome, SectionOutcome::Full);
    }

    #[test]
    fn test_render_item_headings() {
        let block = ContextItem::block("b1", "  text  ", 1, ItemSource::PageContent)
            .with_owner_page(Some("Owner".to_string()));
        assert_eq!(render_item(&block), "### Block ((b1)) on [[Owner]]\ntext");

        let empty_page = page("Empty", "", 0, ItemSource::UserSpecified);
        assert_eq!(render_item(&empty_page), "### [[Empty]]");
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let items = vec![page("Rust", "root", 0, ItemSource::UserSpecified)];
        let (_, report) = ContextComposer::new(ComposeOptions::default()).compose_with_report(&items, &[]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["footerIncluded"], true);
        assert_eq!(json["sections"][0]["outcome"], "full");
    }
}
