use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use clipper_common::CandidateLink;

const MAX_LINKS_PER_PAGE: usize = 300;

/// Characters of block-level context captured around an anchor.
const SURROUNDING_WINDOW: usize = 200;

static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(?:x([0-9a-fA-F]{1,6})|([0-9]{1,7}));").expect("valid regex"));

/// Decode one layer of HTML entities. Markup attributes arrive entity-encoded,
/// sometimes twice when a CMS re-escapes its own output.
fn decode_entities_once(s: &str) -> String {
    let named = s
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'");

    NUMERIC_ENTITY_RE
        .replace_all(&named, |caps: &regex::Captures| {
            let code = caps
                .get(1)
                .map(|m| u32::from_str_radix(m.as_str(), 16))
                .or_else(|| caps.get(2).map(|m| m.as_str().parse::<u32>()))
                .and_then(|r| r.ok());
            match code.and_then(char::from_u32) {
                Some(c) if !c.is_control() => c.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Decode HTML entities to a fixpoint so double-encoded hrefs settle.
fn decode_entities(s: &str) -> String {
    let mut current = s.to_string();
    for _ in 0..5 {
        let next = decode_entities_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Normalize a raw href into an absolute URL.
///
/// Absolute URLs pass through byte-for-byte apart from entity decoding: a
/// correct URL must never be rewritten. Protocol-relative and relative hrefs
/// resolve against `base_url`. Returns None for unresolvable or non-http
/// targets. Idempotent: normalizing a normalized URL is the identity.
pub fn normalize_candidate_url(raw: &str, base_url: &str) -> Option<String> {
    let decoded = decode_entities(raw.trim());

    if decoded.starts_with("http://") || decoded.starts_with("https://") {
        return Some(decoded);
    }

    if let Some(rest) = decoded.strip_prefix("//") {
        let scheme = if base_url.starts_with("http://") {
            "http"
        } else {
            "https"
        };
        return Some(format!("{scheme}://{rest}"));
    }

    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(&decoded).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    Some(resolved.to_string())
}

/// Extract candidate article links from HTML with anchor and surrounding
/// context for classification.
///
/// - Resolves relative URLs against `base_url` via `normalize_candidate_url`
/// - Filters: no self-links, no fragments, no javascript/mailto/tel/data
/// - Deduplicates by target, preferring the occurrence with more context
/// - Caps at 300 links per page
pub fn extract_candidate_links(html: &str, base_url: &str) -> Vec<CandidateLink> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a[href]").expect("valid selector");

    let base_normalized = base_url.trim_end_matches('/');

    let mut best: HashMap<String, CandidateLink> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for element in document.select(&anchor_selector) {
        let href = match element.value().attr("href") {
            Some(h) => h.trim(),
            None => continue,
        };

        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
            || href.starts_with("blob:")
        {
            continue;
        }

        let target = match normalize_candidate_url(href, base_url) {
            Some(t) => t,
            None => continue,
        };

        if target.trim_end_matches('/') == base_normalized {
            continue;
        }

        let link = CandidateLink {
            href: target.clone(),
            anchor_text: anchor_text(&element),
            surrounding_text: surrounding_text(&element),
        };

        match best.get(&target) {
            Some(existing) => {
                let existing_len = existing.surrounding_text.as_ref().map_or(0, |s| s.len());
                let new_len = link.surrounding_text.as_ref().map_or(0, |s| s.len());
                if new_len > existing_len {
                    best.insert(target, link);
                }
            }
            None => {
                best.insert(target.clone(), link);
                order.push(target);
            }
        }
    }

    order
        .into_iter()
        .take(MAX_LINKS_PER_PAGE)
        .filter_map(|t| best.remove(&t))
        .collect()
}

/// Visible text of an anchor, falling back to child image alt text.
fn anchor_text(element: &ElementRef) -> Option<String> {
    let text: String = element.text().collect::<Vec<_>>().join(" ");
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        let img_selector = Selector::parse("img[alt]").expect("valid selector");
        element
            .select(&img_selector)
            .next()
            .and_then(|img| img.value().attr("alt"))
            .map(|alt| alt.trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        Some(trimmed)
    }
}

/// Text of the nearest block-level ancestor, windowed around the anchor.
fn surrounding_text(element: &ElementRef) -> Option<String> {
    let block_elements = [
        "p",
        "div",
        "li",
        "td",
        "th",
        "dd",
        "dt",
        "blockquote",
        "section",
        "article",
    ];

    let mut current = element.parent();
    let mut block_parent: Option<ElementRef> = None;

    while let Some(node) = current {
        if let Some(el) = ElementRef::wrap(node) {
            if block_elements.contains(&el.value().name()) {
                block_parent = Some(el);
                break;
            }
        }
        current = node.parent();
    }

    let parent = block_parent?;
    let full_text: String = parent.text().collect::<Vec<_>>().join(" ");
    let full_text = full_text.trim();

    if full_text.is_empty() {
        return None;
    }

    if full_text.len() <= SURROUNDING_WINDOW {
        return Some(full_text.to_string());
    }

    let anchor: String = element.text().collect::<Vec<_>>().join(" ");
    let anchor = anchor.trim();

    if let Some(pos) = full_text.find(anchor) {
        let start = floor_boundary(full_text, pos.saturating_sub(SURROUNDING_WINDOW / 2));
        let end = ceil_boundary(
            full_text,
            (pos + anchor.len() + SURROUNDING_WINDOW / 2).min(full_text.len()),
        );
        Some(full_text[start..end].trim().to_string())
    } else {
        let end = ceil_boundary(full_text, SURROUNDING_WINDOW.min(full_text.len()));
        Some(full_text[..end].trim().to_string())
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
