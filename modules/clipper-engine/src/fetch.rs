use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::traits::{FetchedPage, PageFetcher};

/// Per-request timeout for plain HTTP fetches. Uncooperative sites stall
/// deliberately; exceeding this is a normal failure, not a crash.
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP-level redirect hops before giving up on a chain.
const MAX_REDIRECTS: usize = 10;

/// Sites serve different markup to obvious bots. A current desktop profile
/// gets the same page a reader would.
const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Plain reqwest-backed fetcher. First line of attack for every source;
/// the browser only comes out when validation says this was not enough.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(DESKTOP_UA)
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let parsed = url::Url::parse(url).context("Invalid URL")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("Only http/https URLs are allowed, got: {}", parsed.scheme());
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Fetch failed for {url}"))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let html = resp
            .text()
            .await
            .with_context(|| format!("Failed to read body for {url}"))?;

        info!(url, status, bytes = html.len(), "Fetched page");

        Ok(FetchedPage {
            final_url,
            status,
            html,
        })
    }
}
