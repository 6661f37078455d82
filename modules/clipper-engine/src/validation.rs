//! Content legitimacy validation.
//!
//! Classifies fetched markup as genuine article content, a protection or
//! error page, or junk. Confidence starts at 1.0 and weighted penalties are
//! subtracted per signal; a single weak signal is never fatal, an
//! accumulation is. The verdict carries a `RecommendedAction` so callers
//! never re-derive retry policy from raw scores.

use std::sync::LazyLock;

use regex::Regex;

use clipper_common::{
    clamp01, CandidateLink, LinkQuality, ProtectionType, RecommendedAction, ValidationVerdict,
};

use crate::corruption::is_corrupted;
use crate::policy::{link_quality, validation as policy};

// ---------------------------------------------------------------------------
// Protection vendors
// ---------------------------------------------------------------------------

/// The anti-bot vendor a fingerprint identifies. Drives the bypass engine's
/// targeted first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionVendor {
    /// Challenge-cookie interstitial that resolves itself given time.
    Cloudflare,
    /// Behavioral-fingerprint vendors. Grouped: the counter is the same
    /// (stealth profile), only the marker differs.
    DataDome,
    PerimeterX,
    Imperva,
    Distil,
    /// Plain request throttling; waiting beats disguise.
    RateLimit,
}

impl std::fmt::Display for ProtectionVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtectionVendor::Cloudflare => "cloudflare",
            ProtectionVendor::DataDome => "datadome",
            ProtectionVendor::PerimeterX => "perimeterx",
            ProtectionVendor::Imperva => "imperva",
            ProtectionVendor::Distil => "distil",
            ProtectionVendor::RateLimit => "rate_limit",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Pattern libraries
// ---------------------------------------------------------------------------

static TITLE_PHRASES: LazyLock<Vec<(Regex, ProtectionType)>> = LazyLock::new(|| {
    [
        (
            r"(?i)just a moment|attention required|checking your browser|cloudflare",
            ProtectionType::Cloudflare,
        ),
        (
            r"(?i)captcha|are you a robot|verify you are (?:a )?human|access denied|request blocked|pardon our interruption",
            ProtectionType::BotProtection,
        ),
        (
            r"(?i)too many requests|rate limit",
            ProtectionType::BotProtection,
        ),
        (
            r"(?i)\b404\b|page not found|not available|under maintenance|service unavailable|something went wrong",
            ProtectionType::ErrorPage,
        ),
    ]
    .into_iter()
    .map(|(p, t)| (Regex::new(p).expect("valid regex"), t))
    .collect()
});

static BODY_PHRASES: LazyLock<Vec<(Regex, ProtectionType)>> = LazyLock::new(|| {
    [
        (
            r"(?i)checking (?:your browser|if the site connection is secure)|enable javascript and cookies to continue|verify you are human",
            ProtectionType::Cloudflare,
        ),
        (
            r"(?i)complete the captcha|unusual traffic from your network|automated access to this (?:page|site) is prohibited|detected unusual activity",
            ProtectionType::BotProtection,
        ),
        (
            r"(?i)you have been rate limited|too many requests from this ip",
            ProtectionType::BotProtection,
        ),
        (
            r"(?i)the page you (?:requested|are looking for) (?:was not found|does not exist|cannot be found)|this content is unavailable|down for maintenance",
            ProtectionType::ErrorPage,
        ),
    ]
    .into_iter()
    .map(|(p, t)| (Regex::new(p).expect("valid regex"), t))
    .collect()
});

/// Anti-bot HTML fingerprints: markup shipped by the protection vendor,
/// independent of the page's visible wording. Also names the vendor for the
/// bypass engine.
static FINGERPRINTS: LazyLock<Vec<(Regex, ProtectionVendor)>> = LazyLock::new(|| {
    [
        (
            r#"(?i)cdn-cgi/challenge-platform|cf[-_]chl|turnstile|__cf_bm"#,
            ProtectionVendor::Cloudflare,
        ),
        (r"(?i)datadome", ProtectionVendor::DataDome),
        (r"(?i)px-captcha|_pxhd|perimeterx|pxchk", ProtectionVendor::PerimeterX),
        (r"(?i)incapsula|_incap_|imperva", ProtectionVendor::Imperva),
        (r"(?i)distil_r_captcha|distilnetworks|distil_referrer", ProtectionVendor::Distil),
    ]
    .into_iter()
    .map(|(p, v)| (Regex::new(p).expect("valid regex"), v))
    .collect()
});

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)too many requests|rate limit(?:ed)?|retry-after").expect("valid regex")
});

/// URL shapes that mark a link as an error/utility page, not an article.
static ERROR_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(?:404|error|not-?found|page-?not-?found)(?:[/.?]|$)").expect("valid regex")
});

/// URL shapes articles tend to have: dated paths, article/story/news
/// sections, or a long hyphenated slug.
static ARTICLE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        /20\d{2}/\d{1,2}/            # dated path
        | /(?:article|articles|story|stories|news|post|posts)/\S
        | /[a-z0-9]+(?:-[a-z0-9]+){2,}(?:\.html?|/)?(?:[?\#]|$)  # hyphenated slug
        ",
    )
    .expect("valid regex")
});

static DATED_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/20\d{2}/\d{1,2}/").expect("valid regex"));

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Find the anti-bot vendor fingerprinted in the markup, if any. Rate-limit
/// wording without vendor markup maps to the rate-limit pseudo-vendor.
pub fn detect_vendor(html: &str) -> Option<ProtectionVendor> {
    for (re, vendor) in FINGERPRINTS.iter() {
        if re.is_match(html) {
            return Some(*vendor);
        }
    }
    if RATE_LIMIT_RE.is_match(html) {
        return Some(ProtectionVendor::RateLimit);
    }
    None
}

/// Validate a fetched page. `title` and `content` are whatever the caller
/// extracted (page `<title>` and readability text for page-level checks,
/// the extracted article fields for post-extraction checks); `links` are the
/// candidates pulled from the same markup, empty when not applicable.
pub fn validate(
    html: &str,
    title: &str,
    content: &str,
    links: &[CandidateLink],
) -> ValidationVerdict {
    let mut confidence = 1.0f32;
    let mut issues: Vec<String> = Vec::new();
    let mut protection = ProtectionType::None;

    for (re, ptype) in TITLE_PHRASES.iter() {
        if re.is_match(title) {
            confidence -= policy::TITLE_PHRASE_PENALTY;
            issues.push(format!("protection/error phrase in title ({ptype})"));
            protection = worst(protection, *ptype);
            break;
        }
    }

    for (re, ptype) in BODY_PHRASES.iter() {
        if re.is_match(content) || re.is_match(html) {
            confidence -= policy::BODY_PHRASE_PENALTY;
            issues.push(format!("protection/error phrase in body ({ptype})"));
            protection = worst(protection, *ptype);
            break;
        }
    }

    if let Some(vendor) = detect_vendor(html) {
        confidence -= policy::FINGERPRINT_PENALTY;
        issues.push(format!("anti-bot fingerprint: {vendor}"));
        let ptype = match vendor {
            ProtectionVendor::Cloudflare => ProtectionType::Cloudflare,
            _ => ProtectionType::BotProtection,
        };
        protection = worst(protection, ptype);
    }

    if content.trim().chars().count() < policy::MIN_CONTENT_CHARS {
        confidence -= policy::SHORT_CONTENT_PENALTY;
        issues.push(format!(
            "content below minimum length ({} chars)",
            content.trim().chars().count()
        ));
        protection = worst(protection, ProtectionType::MinimalContent);
    }

    if !links.is_empty() {
        let quality = assess_link_quality(links);
        if quality.score < link_quality::PROCEED_THRESHOLD {
            confidence -= policy::LOW_LINK_QUALITY_PENALTY;
            issues.push("low article-link ratio among extracted links".to_string());
        }
        if quality
            .issues
            .iter()
            .any(|i| i.contains("error-page"))
        {
            confidence -= policy::ERROR_LINK_PENALTY;
            issues.push("error-page URL patterns among links".to_string());
        }
    }

    let confidence = clamp01(confidence);
    let is_legitimate =
        confidence > policy::LEGITIMACY_THRESHOLD && issues.len() < policy::MAX_ISSUES;

    ValidationVerdict {
        is_legitimate,
        confidence,
        issues,
        protection_type: protection,
        recommended_action: recommended_action(protection, confidence, is_legitimate),
    }
}

/// Deterministic mapping from protection type and confidence band to the
/// action a caller should take.
pub fn recommended_action(
    protection: ProtectionType,
    confidence: f32,
    is_legitimate: bool,
) -> RecommendedAction {
    if is_legitimate {
        return RecommendedAction::Proceed;
    }
    // Protection outranks the confidence band: a blatant challenge page has
    // near-zero confidence precisely because it is bypassable.
    match protection {
        ProtectionType::Cloudflare | ProtectionType::BotProtection => {
            RecommendedAction::RetryDifferentMethod
        }
        ProtectionType::ErrorPage => RecommendedAction::Abort,
        ProtectionType::MinimalContent | ProtectionType::None => {
            if confidence < policy::ABORT_BELOW {
                RecommendedAction::Abort
            } else {
                RecommendedAction::RetryWithDelay
            }
        }
    }
}

/// Score how article-like a set of extracted links is. A listing page worth
/// discovering from has a healthy share of article-shaped URLs and no
/// error-page links.
pub fn assess_link_quality(links: &[CandidateLink]) -> LinkQuality {
    if links.is_empty() {
        return LinkQuality {
            score: 0.0,
            issues: vec!["no links extracted".to_string()],
        };
    }

    let total = links.len() as f32;
    let article_hits = links
        .iter()
        .filter(|l| ARTICLE_PATH_RE.is_match(&l.href))
        .count();
    let error_hits = links
        .iter()
        .filter(|l| ERROR_LINK_RE.is_match(&l.href))
        .count();
    let has_dated = links.iter().any(|l| DATED_PATH_RE.is_match(&l.href));

    let mut score = article_hits as f32 / total;
    let mut issues = Vec::new();

    if has_dated {
        score += link_quality::DATED_PATH_BONUS;
    }
    if error_hits > 0 {
        score -= (error_hits as f32 / total) * link_quality::ERROR_RATIO_PENALTY;
        issues.push(format!("{error_hits} error-page URL(s) among links"));
    }
    if article_hits == 0 {
        issues.push("no links match article-path patterns".to_string());
    }

    LinkQuality {
        score: clamp01(score),
        issues,
    }
}

/// `is_corrupted` re-exported next to the rest of the validation surface.
pub fn validate_corruption(text: &str) -> bool {
    is_corrupted(text)
}

/// Order protection types by severity so mixed signals settle on the one
/// that matters for retry policy.
fn worst(current: ProtectionType, candidate: ProtectionType) -> ProtectionType {
    fn rank(p: ProtectionType) -> u8 {
        match p {
            ProtectionType::None => 0,
            ProtectionType::MinimalContent => 1,
            ProtectionType::ErrorPage => 2,
            ProtectionType::BotProtection => 3,
            ProtectionType::Cloudflare => 4,
        }
    }
    if rank(candidate) > rank(current) {
        candidate
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article_body() -> String {
        "The council approved the measure after months of debate. ".repeat(20)
    }

    fn links_from(hrefs: &[&str]) -> Vec<CandidateLink> {
        hrefs
            .iter()
            .map(|h| CandidateLink {
                href: h.to_string(),
                anchor_text: Some("link".to_string()),
                surrounding_text: None,
            })
            .collect()
    }

    #[test]
    fn genuine_article_is_legitimate() {
        let verdict = validate(
            "<html><body><article>...</article></body></html>",
            "Council approves transit plan",
            &article_body(),
            &[],
        );
        assert!(verdict.is_legitimate);
        assert_eq!(verdict.protection_type, ProtectionType::None);
        assert_eq!(verdict.recommended_action, RecommendedAction::Proceed);
        assert!(verdict.confidence >= 0.0 && verdict.confidence <= 1.0);
    }

    #[test]
    fn cloudflare_interstitial_is_flagged() {
        let html = r#"<html><head><title>Just a moment...</title>
            <script src="/cdn-cgi/challenge-platform/h/b/orchestrate"></script>
            </head><body>Checking your browser before accessing.</body></html>"#;
        let verdict = validate(html, "Just a moment...", "Checking your browser", &[]);
        assert!(!verdict.is_legitimate);
        assert_eq!(verdict.protection_type, ProtectionType::Cloudflare);
        assert_eq!(
            verdict.recommended_action,
            RecommendedAction::RetryDifferentMethod
        );
        assert!(verdict.issues.iter().any(|i| i.contains("cloudflare")));
    }

    #[test]
    fn vendor_detection_names_the_vendor() {
        assert_eq!(
            detect_vendor(r#"<script src="https://ct.datadome.co/c.js"></script>"#),
            Some(ProtectionVendor::DataDome)
        );
        assert_eq!(
            detect_vendor(r#"<div id="px-captcha"></div>"#),
            Some(ProtectionVendor::PerimeterX)
        );
        assert_eq!(detect_vendor("<html><body>plain page</body></html>"), None);
    }

    #[test]
    fn rate_limit_wording_maps_to_rate_limit_vendor() {
        assert_eq!(
            detect_vendor("<h1>429 Too Many Requests</h1>"),
            Some(ProtectionVendor::RateLimit)
        );
    }

    #[test]
    fn single_weak_signal_is_not_fatal() {
        // Plenty of content, one error link among many good ones.
        let mut hrefs = vec![
            "https://site.com/2024/05/big-story-develops-downtown",
            "https://site.com/articles/mayor-announces-budget-plan",
            "https://site.com/2024/06/another-long-article-slug-here",
        ];
        hrefs.push("https://site.com/404");
        let verdict = validate(
            "<html></html>",
            "Front page",
            &article_body(),
            &links_from(&hrefs),
        );
        assert!(verdict.is_legitimate, "issues: {:?}", verdict.issues);
    }

    #[test]
    fn cumulative_weak_signals_are_fatal() {
        // Short content + no article links + error links: no single
        // disqualifier, but together they sink the verdict.
        let verdict = validate(
            "<html></html>",
            "Front page",
            "short",
            &links_from(&["https://site.com/404", "https://site.com/about"]),
        );
        assert!(!verdict.is_legitimate);
        assert!(verdict.issues.len() >= 3);
    }

    #[test]
    fn error_page_recommends_abort() {
        let verdict = validate(
            "<html></html>",
            "404 Page Not Found",
            "The page you requested was not found.",
            &[],
        );
        assert!(!verdict.is_legitimate);
        assert_eq!(verdict.protection_type, ProtectionType::ErrorPage);
        assert_eq!(verdict.recommended_action, RecommendedAction::Abort);
    }

    #[test]
    fn confidence_is_always_clamped() {
        // Stack every penalty; the score must stay in [0, 1].
        let verdict = validate(
            r#"<script src="/cdn-cgi/challenge-platform/x"></script>"#,
            "Just a moment... 404 captcha",
            "x",
            &links_from(&["https://site.com/404", "https://site.com/error"]),
        );
        assert!(verdict.confidence >= 0.0 && verdict.confidence <= 1.0);
    }

    #[test]
    fn link_quality_zero_article_links_scores_below_proceed() {
        let hrefs: Vec<String> = (0..20)
            .map(|i| format!("https://site.com/page{i}"))
            .collect();
        let links: Vec<CandidateLink> = hrefs
            .iter()
            .map(|h| CandidateLink {
                href: h.clone(),
                anchor_text: None,
                surrounding_text: None,
            })
            .collect();
        let quality = assess_link_quality(&links);
        assert!(quality.score < link_quality::PROCEED_THRESHOLD);
        assert!(quality
            .issues
            .iter()
            .any(|i| i.contains("article-path")));
    }

    #[test]
    fn link_quality_article_heavy_set_proceeds() {
        let links = links_from(&[
            "https://site.com/2024/05/city-council-votes-on-transit",
            "https://site.com/2024/05/new-library-branch-opens-soon",
            "https://site.com/articles/school-board-election-results",
            "https://site.com/about",
        ]);
        let quality = assess_link_quality(&links);
        assert!(quality.score >= link_quality::PROCEED_THRESHOLD);
    }

    #[test]
    fn empty_link_set_scores_zero() {
        let quality = assess_link_quality(&[]);
        assert_eq!(quality.score, 0.0);
    }
}
