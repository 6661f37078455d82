//! Decision thresholds for the acquisition pipeline, consolidated per
//! component so tie-break behavior is auditable in one place.
//!
//! Weights are additive toward a confidence score; thresholds partition that
//! score into bands. Every consumer clamps to [0, 1] before comparing.

/// Redirect resolver: signal weights and the two-stage trust band.
pub mod redirect {
    /// URL matches a known shortener/redirector shape.
    pub const SHORTENER_WEIGHT: f32 = 0.4;
    /// Fetched body is below `TINY_BODY_MAX_BYTES`.
    pub const TINY_BODY_WEIGHT: f32 = 0.3;
    /// Body contains a `window.location`-style script redirect.
    pub const SCRIPT_REDIRECT_WEIGHT: f32 = 0.35;
    /// Body contains a `<meta http-equiv="refresh">` tag.
    pub const META_REFRESH_WEIGHT: f32 = 0.45;

    /// Bodies smaller than this are suspicious for a real article page.
    pub const TINY_BODY_MAX_BYTES: usize = 2048;

    /// Stage-1 confidence at or above this is trusted without a browser.
    pub const TRUST_STAGE1: f32 = 0.7;
    /// Stage-1 confidence below this means "probably not a redirect";
    /// the band between the two goes to Stage-2 browser confirmation.
    pub const BROWSER_BAND_MIN: f32 = 0.3;

    /// Confidence when the HTTP fetch itself settled on a different URL.
    pub const HTTP_CHAIN_CONFIDENCE: f32 = 0.9;
    /// Confidence when a browser navigation confirmed the destination.
    pub const CONFIRMED_CONFIDENCE: f32 = 0.95;
    /// Confidence when no redirect signal was found at all.
    pub const DIRECT_CONFIDENCE: f32 = 0.9;
}

/// Content legitimacy validator: penalty weights and verdict bands.
pub mod validation {
    /// Protection/error phrase in the page title.
    pub const TITLE_PHRASE_PENALTY: f32 = 0.4;
    /// Protection/error phrase in the body text.
    pub const BODY_PHRASE_PENALTY: f32 = 0.25;
    /// Anti-bot HTML fingerprint (challenge script, fingerprinting widget).
    pub const FINGERPRINT_PENALTY: f32 = 0.4;
    /// Content below `MIN_CONTENT_CHARS`.
    pub const SHORT_CONTENT_PENALTY: f32 = 0.3;
    /// Link set scored below the link-quality proceed threshold.
    pub const LOW_LINK_QUALITY_PENALTY: f32 = 0.2;
    /// Error-page URL patterns present among extracted links.
    pub const ERROR_LINK_PENALTY: f32 = 0.15;

    /// Minimum plausible character count for genuine article-page content.
    pub const MIN_CONTENT_CHARS: usize = 250;

    /// `is_legitimate` requires confidence above this...
    pub const LEGITIMACY_THRESHOLD: f32 = 0.5;
    /// ...and fewer than this many accumulated issues.
    pub const MAX_ISSUES: usize = 3;

    /// Unprotected pages below this confidence are abandoned rather than
    /// retried. Protection pages are exempt: those go to the bypass engine.
    pub const ABORT_BELOW: f32 = 0.2;
}

/// Link quality assessment.
pub mod link_quality {
    /// Scores below this mean the link set is not worth discovering from.
    pub const PROCEED_THRESHOLD: f32 = 0.5;
    /// Bonus when dated article paths (`/2024/05/...`) are present.
    pub const DATED_PATH_BONUS: f32 = 0.1;
    /// Scaling applied to the error-pattern link ratio penalty.
    pub const ERROR_RATIO_PENALTY: f32 = 0.5;
}

/// Corruption detection ceilings. Tuned so accented or symbol-heavy but
/// legitimate text stays below them.
pub mod corruption {
    /// Maximum tolerated ratio of non-ASCII characters.
    pub const MAX_NON_ASCII_RATIO: f32 = 0.4;
    /// Minimum ratio of alphabetic word tokens to total tokens.
    pub const MIN_WORD_RATIO: f32 = 0.35;
    /// A unit repeated at least this many times is a suspicious run.
    pub const MIN_REPEAT_RUN: usize = 8;
    /// Texts shorter than this are too small to judge.
    pub const MIN_SAMPLE_CHARS: usize = 40;
    /// Literal U+FFFD replacement characters tolerated before the text is
    /// declared mangled.
    pub const MAX_REPLACEMENT_CHARS: usize = 2;
    /// Consecutive control characters (outside \n \r \t) tolerated.
    pub const MAX_CONTROL_RUN: usize = 3;
}

/// Link discovery engine.
pub mod discovery {
    /// Candidates redirect-resolved concurrently per pass.
    pub const RESOLVE_CONCURRENCY: usize = 8;
    /// Pages with fewer anchors than this are checked for lazy-loading
    /// markers and given a browser scroll pass.
    pub const LAZY_ANCHOR_THRESHOLD: usize = 5;
    /// Milliseconds the scroll pass lets partial content settle.
    pub const SCROLL_SETTLE_MS: u64 = 2_500;
}

/// Structure detector: document-validation bounds and confidence downgrades.
pub mod structure {
    /// A content selector matching more elements than this is capturing
    /// layout, not an article.
    pub const BROAD_MATCH_CAP: usize = 50;
    /// Minimum text the title selector must yield.
    pub const MIN_TITLE_CHARS: usize = 3;
    /// Minimum text the content selector must yield across its matches.
    pub const MIN_CONTENT_TEXT_CHARS: usize = 150;

    /// Confidence for a rule straight from the classifier, pre-validation.
    pub const INFERRED_CONFIDENCE: f32 = 0.9;
    /// Subtracted once per field substituted from the fallback table.
    pub const FALLBACK_DOWNGRADE: f32 = 0.15;
    /// Confidence floor: a partially-working rule is never zeroed.
    pub const MIN_CONFIDENCE: f32 = 0.2;
    /// Confidence of the fully hand-authored generic rule.
    pub const GENERIC_CONFIDENCE: f32 = 0.3;

    /// During extraction, alternatives are tried for a failed field only
    /// while the rule's confidence is below this gate.
    pub const ALTERNATIVES_GATE: f32 = 0.8;
}

/// Protection bypass engine: retry budget and mandatory pacing.
pub mod bypass {
    /// Strategy retries after the initial targeted attempt.
    pub const MAX_RETRIES: usize = 3;
    /// Inter-attempt delay bounds, milliseconds. Randomized within the
    /// range; immediate retries are themselves a detection signal.
    pub const PACING_MIN_MS: u64 = 1_500;
    pub const PACING_MAX_MS: u64 = 4_500;
    /// Extra settle time for challenge interstitials that resolve on
    /// their own (Cloudflare-style).
    pub const CHALLENGE_SETTLE_MS: u64 = 6_000;
    /// Delay before retrying a rate-limited target.
    pub const RATE_LIMIT_DELAY_MS: u64 = 8_000;
}

/// Scrape orchestrator: batching and per-source bounds.
pub mod orchestrator {
    /// Sources processed concurrently per batch.
    pub const SOURCE_BATCH_SIZE: usize = 5;
    /// Pause between batches, milliseconds, plus 0-1s jitter.
    pub const BATCH_PAUSE_MS: u64 = 2_000;
    /// Articles fetched concurrently within one source.
    pub const ARTICLE_CONCURRENCY: usize = 4;
    /// New articles accepted per source per pass.
    pub const MAX_ARTICLES_PER_SOURCE: usize = 25;
}

/// Classification queue defaults.
pub mod queue {
    use std::time::Duration;

    /// Bounded worker pool size.
    pub const WORKER_CONCURRENCY: usize = 3;
    /// Attempts before an item is dead-lettered.
    pub const MAX_ATTEMPTS: u32 = 3;
    /// Delay before a failed item is re-enqueued.
    pub const RETRY_DELAY: Duration = Duration::from_secs(30);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_bands_are_ordered() {
        assert!(redirect::BROWSER_BAND_MIN < redirect::TRUST_STAGE1);
        assert!(redirect::TRUST_STAGE1 < redirect::CONFIRMED_CONFIDENCE);
        assert!(redirect::HTTP_CHAIN_CONFIDENCE >= redirect::TRUST_STAGE1);
    }

    #[test]
    fn single_meta_refresh_lands_in_browser_band() {
        // One strong signal alone should trigger confirmation, not blind trust.
        assert!(redirect::META_REFRESH_WEIGHT >= redirect::BROWSER_BAND_MIN);
        assert!(redirect::META_REFRESH_WEIGHT < redirect::TRUST_STAGE1);
    }

    #[test]
    fn shortener_plus_body_signal_is_trusted() {
        let combined = redirect::SHORTENER_WEIGHT + redirect::TINY_BODY_WEIGHT;
        assert!(combined >= redirect::TRUST_STAGE1);
    }

    #[test]
    fn validation_bands_are_ordered() {
        assert!(validation::ABORT_BELOW < validation::LEGITIMACY_THRESHOLD);
        assert!(validation::LEGITIMACY_THRESHOLD < 1.0);
    }

    #[test]
    fn single_weak_validation_signal_is_not_fatal() {
        // A lone error-link hit must leave confidence above the threshold.
        assert!(1.0 - validation::ERROR_LINK_PENALTY > validation::LEGITIMACY_THRESHOLD);
        assert!(1.0 - validation::LOW_LINK_QUALITY_PENALTY > validation::LEGITIMACY_THRESHOLD);
    }

    #[test]
    fn structure_downgrades_never_cross_the_floor() {
        // Even with all four fields substituted, a fresh inference stays at
        // or above the floor, and a partial substitution still beats generic.
        let all_substituted = structure::INFERRED_CONFIDENCE - 4.0 * structure::FALLBACK_DOWNGRADE;
        assert!(all_substituted >= structure::MIN_CONFIDENCE);
        let two_substituted = structure::INFERRED_CONFIDENCE - 2.0 * structure::FALLBACK_DOWNGRADE;
        assert!(two_substituted > structure::GENERIC_CONFIDENCE);
        assert!(structure::MIN_CONFIDENCE < structure::GENERIC_CONFIDENCE);
        assert!(structure::GENERIC_CONFIDENCE < structure::INFERRED_CONFIDENCE);
    }

    #[test]
    fn bypass_pacing_range_is_valid() {
        assert!(bypass::PACING_MIN_MS < bypass::PACING_MAX_MS);
        assert!(bypass::MAX_RETRIES >= 1);
    }
}
