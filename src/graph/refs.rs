//! Reference parsing
//!
//! Scans note text for `[[Page]]` links and `((block))` references.

/// Extract `[[links]]` from content.
///
/// `[[target|alias]]` yields `target`. Duplicates are dropped case-insensitively,
/// first occurrence wins.
pub fn extract_page_references(content: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for (start, end) in delimited_spans(content, "[[", "]]") {
        let inner = &content[start..end];
        let target = inner.split('|').next().unwrap_or(inner).trim();
        if target.is_empty() {
            continue;
        }
        let key = target.to_lowercase();
        if !links.iter().any(|l| l.to_lowercase() == key) {
            links.push(target.to_string());
        }
    }
    links
}

/// Extract `((block-id))` references from content
pub fn extract_block_references(content: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for (start, end) in delimited_spans(content, "((", "))") {
        let id = content[start..end].trim();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            continue;
        }
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Remove every `[[...]]` link from the text, including its target name.
pub fn strip_page_references(content: &str) -> String {
    strip_links(content, |_| true)
}

/// Remove only links pointing at `title` (case-insensitive, alias-aware).
pub fn strip_reference_to(content: &str, title: &str) -> String {
    let wanted = title.trim().to_lowercase();
    strip_links(content, |inner| {
        let target = inner.split('|').next().unwrap_or(inner).trim();
        target.to_lowercase() == wanted
    })
}

fn strip_links(content: &str, mut should_strip: impl FnMut(&str) -> bool) -> String {
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for (start, end) in delimited_spans(content, "[[", "]]") {
        if !should_strip(&content[start..end]) {
            continue;
        }
        // Spans carry inner offsets; the markup sits two bytes outside them.
        out.push_str(&content[cursor..start - 2]);
        cursor = end + 2;
    }
    out.push_str(&content[cursor..]);
    out
}

/// Byte ranges of the text between `open` and `close` markers, non-nested.
fn delimited_spans(content: &str, open: &str, close: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = 0;

    while let Some(rel_start) = content[pos..].find(open) {
        let inner_start = pos + rel_start + open.len();
        match content[inner_start..].find(close) {
            Some(rel_end) => {
                let inner_end = inner_start + rel_end;
                // A second opener before the closer restarts the scan there.
                if let Some(reopen) = content[inner_start..inner_end].rfind(open) {
                    let restart = inner_start + reopen + open.len();
                    spans.push((restart, inner_end));
                } else {
                    spans.push((inner_start, inner_end));
                }
                pos = inner_end + close.len();
            }
            None => break,
        }
    }

    spans
}
