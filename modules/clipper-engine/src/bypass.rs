//! Protection bypass engine.
//!
//! A retry state machine against bot-detection challenges. The initial
//! attempt is targeted at the detected vendor; on failure the engine cycles
//! an ordered strategy list, re-validating the content after every attempt —
//! a navigation that "succeeds" at the browser level but serves a challenge
//! page is a failure with a reason, not a success. Randomized delays between
//! attempts are mandatory pacing, not backoff: immediate retries are a
//! detection signal in themselves.
//!
//! Nothing throws past the engine boundary; every failure is captured into
//! the result and drives the next transition.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use browserless_client::{NavigateOptions, Viewport};
use clipper_common::clamp01;

use crate::links::extract_candidate_links;
use crate::policy::bypass as policy;
use crate::traits::Browser;
use crate::validation::{validate, ProtectionVendor};
use crate::extract::{page_title, readability_text};

/// Chrome-on-Windows profile served to sites that fingerprint headless
/// defaults.
const STEALTH_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

/// Gradual scroll with pauses, returning the settled DOM. Runs inside the
/// page so the timing looks like a reader, not a crawler.
const HUMAN_SCROLL_SCRIPT: &str = r#"
(async () => {
    const pause = (ms) => new Promise((r) => setTimeout(r, ms));
    const steps = 6;
    for (let i = 1; i <= steps; i++) {
        window.scrollTo(0, (document.body.scrollHeight * i) / steps);
        await pause(400 + Math.random() * 600);
    }
    window.scrollTo(0, 0);
    await pause(500);
    return document.documentElement.outerHTML;
})()
"#;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// A concrete bypass technique. Uniform `attempt` surface so the engine
/// walks an ordered list instead of branching per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassStrategy {
    /// Realistic desktop fingerprint: current UA, normal viewport, settle
    /// time for challenge scripts.
    Stealth,
    /// Mobile-device emulation; mobile variants often sit behind lighter
    /// protection.
    MobileEmulation,
    /// Slow human-like interaction pacing: scrolling, pauses.
    HumanPacing,
}

/// Order strategies are cycled in after the targeted attempt.
pub const STRATEGY_ORDER: [BypassStrategy; 3] = [
    BypassStrategy::Stealth,
    BypassStrategy::MobileEmulation,
    BypassStrategy::HumanPacing,
];

impl std::fmt::Display for BypassStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BypassStrategy::Stealth => "stealth",
            BypassStrategy::MobileEmulation => "mobile_emulation",
            BypassStrategy::HumanPacing => "human_pacing",
        };
        write!(f, "{name}")
    }
}

impl BypassStrategy {
    async fn attempt(
        &self,
        browser: &Arc<dyn Browser>,
        url: &str,
    ) -> anyhow::Result<(String, String)> {
        match self {
            BypassStrategy::Stealth => {
                let opts = NavigateOptions::builder()
                    .user_agent(Some(STEALTH_UA.to_string()))
                    .viewport(Some(Viewport::desktop()))
                    .wait_ms(Some(policy::CHALLENGE_SETTLE_MS))
                    .build();
                let nav = browser.navigate(url, &opts).await?;
                Ok((nav.final_url, nav.html))
            }
            BypassStrategy::MobileEmulation => {
                let opts = NavigateOptions::builder()
                    .user_agent(Some(MOBILE_UA.to_string()))
                    .viewport(Some(Viewport::mobile()))
                    .wait_ms(Some(1_000))
                    .build();
                let nav = browser.navigate(url, &opts).await?;
                Ok((nav.final_url, nav.html))
            }
            BypassStrategy::HumanPacing => {
                let opts = NavigateOptions::builder()
                    .user_agent(Some(STEALTH_UA.to_string()))
                    .viewport(Some(Viewport::desktop()))
                    .build();
                let value = browser.evaluate(url, HUMAN_SCROLL_SCRIPT, &opts).await?;
                let html = value
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| anyhow::anyhow!("scroll script returned non-string DOM"))?;
                Ok((url.to_string(), html))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One attempt's record, kept for observability in the terminal result.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub strategy: String,
    pub succeeded: bool,
    pub confidence: f32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum BypassOutcome {
    /// Content validated legitimate.
    Success { html: String, final_url: String },
    /// Retries exhausted.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct BypassResult {
    pub outcome: BypassOutcome,
    pub attempts: Vec<AttemptRecord>,
    /// Issue list accumulated across all attempts.
    pub issues: Vec<String>,
    /// Confidence from the last validation performed.
    pub confidence: f32,
}

impl BypassResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BypassOutcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BypassEngine {
    browser: Arc<dyn Browser>,
}

impl BypassEngine {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self { browser }
    }

    /// Run the state machine: targeted attempt keyed by `vendor`, then the
    /// strategy list up to the retry budget. Success is defined by content
    /// legitimacy, never by HTTP status.
    pub async fn run(&self, url: &str, vendor: Option<ProtectionVendor>) -> BypassResult {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut issues: Vec<String> = Vec::new();
        let mut confidence = 0.0f32;

        // Targeted first attempt.
        let targeted = self.targeted_attempt(url, vendor).await;
        if let Some(success) =
            self.judge(url, "targeted", targeted, &mut attempts, &mut issues, &mut confidence)
        {
            return finish(success, attempts, issues, confidence);
        }

        // Strategy retries.
        for (i, strategy) in STRATEGY_ORDER.iter().cycle().take(policy::MAX_RETRIES).enumerate() {
            pacing_delay().await;
            info!(url, retry = i + 1, strategy = %strategy, "Bypass strategy attempt");

            let result = strategy.attempt(&self.browser, url).await;
            if let Some(success) = self.judge(
                url,
                &strategy.to_string(),
                result,
                &mut attempts,
                &mut issues,
                &mut confidence,
            ) {
                return finish(success, attempts, issues, confidence);
            }
        }

        warn!(url, attempts = attempts.len(), "Bypass aborted, retries exhausted");
        BypassResult {
            outcome: BypassOutcome::Aborted,
            attempts,
            issues,
            confidence: clamp01(confidence),
        }
    }

    async fn targeted_attempt(
        &self,
        url: &str,
        vendor: Option<ProtectionVendor>,
    ) -> anyhow::Result<(String, String)> {
        match vendor {
            // The challenge interstitial resolves itself given time in a
            // real browser; waiting is the whole bypass.
            Some(ProtectionVendor::Cloudflare) => {
                info!(url, "Targeted attempt: Cloudflare challenge settle-wait");
                let opts = NavigateOptions::builder()
                    .user_agent(Some(STEALTH_UA.to_string()))
                    .viewport(Some(Viewport::desktop()))
                    .wait_ms(Some(policy::CHALLENGE_SETTLE_MS))
                    .build();
                let nav = self.browser.navigate(url, &opts).await?;
                Ok((nav.final_url, nav.html))
            }
            // Fingerprint vendors: lead with the stealth profile.
            Some(
                ProtectionVendor::DataDome
                | ProtectionVendor::PerimeterX
                | ProtectionVendor::Imperva
                | ProtectionVendor::Distil,
            ) => {
                info!(url, ?vendor, "Targeted attempt: stealth profile");
                BypassStrategy::Stealth.attempt(&self.browser, url).await
            }
            // Throttling: the counter is patience, not disguise.
            Some(ProtectionVendor::RateLimit) => {
                info!(url, "Targeted attempt: rate-limit delay");
                tokio::time::sleep(Duration::from_millis(policy::RATE_LIMIT_DELAY_MS)).await;
                let nav = self
                    .browser
                    .navigate(url, &NavigateOptions::default())
                    .await?;
                Ok((nav.final_url, nav.html))
            }
            // Unknown vendor: generic real-browser load.
            None => {
                info!(url, "Targeted attempt: generic browser load");
                let nav = self
                    .browser
                    .navigate(url, &NavigateOptions::default())
                    .await?;
                Ok((nav.final_url, nav.html))
            }
        }
    }

    /// Validate an attempt's content and record the outcome. Returns the
    /// successful `(html, final_url)` when the content is legitimate.
    fn judge(
        &self,
        url: &str,
        strategy: &str,
        result: anyhow::Result<(String, String)>,
        attempts: &mut Vec<AttemptRecord>,
        issues: &mut Vec<String>,
        confidence: &mut f32,
    ) -> Option<(String, String)> {
        match result {
            Ok((final_url, html)) => {
                let title = page_title(&html).unwrap_or_default();
                let content = readability_text(&html, url);
                let links = extract_candidate_links(&html, url);
                let verdict = validate(&html, &title, &content, &links);
                *confidence = verdict.confidence;

                attempts.push(AttemptRecord {
                    strategy: strategy.to_string(),
                    succeeded: verdict.is_legitimate,
                    confidence: verdict.confidence,
                    issues: verdict.issues.clone(),
                });

                if verdict.is_legitimate {
                    info!(url, strategy, confidence = verdict.confidence, "Bypass succeeded");
                    Some((html, final_url))
                } else {
                    // Browser-level success with illegitimate content is a
                    // failure with a reason.
                    warn!(
                        url,
                        strategy,
                        confidence = verdict.confidence,
                        issues = ?verdict.issues,
                        "Attempt served non-legitimate content"
                    );
                    issues.extend(verdict.issues);
                    None
                }
            }
            Err(e) => {
                let reason = format!("{strategy}: navigation failed: {e}");
                warn!(url, strategy, error = %e, "Bypass attempt failed at the browser level");
                attempts.push(AttemptRecord {
                    strategy: strategy.to_string(),
                    succeeded: false,
                    confidence: 0.0,
                    issues: vec![reason.clone()],
                });
                issues.push(reason);
                None
            }
        }
    }
}

fn finish(
    success: (String, String),
    attempts: Vec<AttemptRecord>,
    issues: Vec<String>,
    confidence: f32,
) -> BypassResult {
    let (html, final_url) = success;
    BypassResult {
        outcome: BypassOutcome::Success { html, final_url },
        attempts,
        issues,
        confidence: clamp01(confidence),
    }
}

/// Mandatory randomized inter-attempt delay.
async fn pacing_delay() {
    let ms = rand::rng().random_range(policy::PACING_MIN_MS..=policy::PACING_MAX_MS);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{legitimate_article_page, MockBrowser};
    use browserless_client::Navigation;

    fn challenge_page() -> String {
        r#"<html><head><title>Just a moment...</title>
        <script src="/cdn-cgi/challenge-platform/h/b/orchestrate"></script>
        </head><body>Checking your browser before accessing.</body></html>"#
            .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn targeted_attempt_success_needs_no_retries() {
        let browser = Arc::new(MockBrowser::new().on_navigate(
            "https://site.com/a",
            Navigation {
                final_url: "https://site.com/a".to_string(),
                html: legitimate_article_page("Real story", 40),
            },
        ));
        let engine = BypassEngine::new(browser.clone());
        let result = engine
            .run("https://site.com/a", Some(ProtectionVendor::Cloudflare))
            .await;
        assert!(result.succeeded());
        assert_eq!(result.attempts.len(), 1);
        assert!(result.attempts[0].succeeded);
        assert_eq!(browser.navigate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_content_counts_as_failed_attempt() {
        // Navigation succeeds at the browser level on every attempt, but the
        // content never validates: the engine must abort with full records.
        let browser: Arc<dyn Browser> = Arc::new(
            MockBrowser::new()
                .on_navigate(
                    "https://site.com/a",
                    Navigation {
                        final_url: "https://site.com/a".to_string(),
                        html: challenge_page(),
                    },
                )
                .on_evaluate("https://site.com/a", serde_json::json!(challenge_page())),
        );
        let engine = BypassEngine::new(browser);
        let result = engine.run("https://site.com/a", None).await;

        assert!(!result.succeeded());
        // Targeted attempt + full retry budget.
        assert_eq!(result.attempts.len(), 1 + policy::MAX_RETRIES);
        assert!(result.attempts.iter().all(|a| !a.succeeded));
        assert!(!result.issues.is_empty());
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_strategy_can_succeed() {
        // Navigations serve the challenge; the scroll pass (evaluate) gets
        // the real page. The engine must reach HumanPacing and stop there.
        let browser = Arc::new(
            MockBrowser::new()
                .on_navigate(
                    "https://site.com/a",
                    Navigation {
                        final_url: "https://site.com/a".to_string(),
                        html: challenge_page(),
                    },
                )
                .on_evaluate(
                    "https://site.com/a",
                    serde_json::json!(legitimate_article_page("Real story", 40)),
                ),
        );
        let engine = BypassEngine::new(browser.clone());
        let result = engine.run("https://site.com/a", None).await;

        assert!(result.succeeded());
        let last = result.attempts.last().unwrap();
        assert_eq!(last.strategy, "human_pacing");
        assert!(last.succeeded);
        // Targeted + stealth + mobile navigations, one scroll evaluation.
        assert_eq!(browser.navigate_calls(), 3);
        assert_eq!(browser.evaluate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_errors_never_escape() {
        let browser: Arc<dyn Browser> = Arc::new(MockBrowser::new()); // nothing registered
        let engine = BypassEngine::new(browser);
        let result = engine.run("https://site.com/missing", None).await;
        assert!(!result.succeeded());
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("navigation failed")));
    }
}
