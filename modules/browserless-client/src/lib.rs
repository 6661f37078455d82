pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use typed_builder::TypedBuilder;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Puppeteer function backing `navigate`: applies emulation from the context,
/// loads the page, and reports where the browser settled along with the DOM.
const NAVIGATE_FN: &str = r#"
export default async function ({ page, context }) {
    if (context.userAgent) {
        await page.setUserAgent(context.userAgent);
    }
    if (context.viewport) {
        await page.setViewport(context.viewport);
    }
    await page.goto(context.url, { waitUntil: "networkidle2", timeout: context.timeoutMs });
    if (context.waitForSelector) {
        await page.waitForSelector(context.waitForSelector, { timeout: context.timeoutMs });
    }
    if (context.waitMs) {
        await new Promise((resolve) => setTimeout(resolve, context.waitMs));
    }
    const html = await page.content();
    return { data: { url: page.url(), html }, type: "application/json" };
}
"#;

/// Puppeteer function backing `evaluate`: same navigation as above, then runs
/// the caller's script in the page and returns whatever it evaluates to.
const EVALUATE_FN: &str = r#"
export default async function ({ page, context }) {
    if (context.userAgent) {
        await page.setUserAgent(context.userAgent);
    }
    if (context.viewport) {
        await page.setViewport(context.viewport);
    }
    await page.goto(context.url, { waitUntil: "networkidle2", timeout: context.timeoutMs });
    if (context.waitForSelector) {
        await page.waitForSelector(context.waitForSelector, { timeout: context.timeoutMs });
    }
    if (context.waitMs) {
        await new Promise((resolve) => setTimeout(resolve, context.waitMs));
    }
    const value = await page.evaluate(context.script);
    return { data: { url: page.url(), value }, type: "application/json" };
}
"#;

/// Browser viewport to emulate during navigation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub is_mobile: bool,
    pub has_touch: bool,
}

impl Viewport {
    pub fn desktop() -> Self {
        Self {
            width: 1366,
            height: 900,
            is_mobile: false,
            has_touch: false,
        }
    }

    pub fn mobile() -> Self {
        Self {
            width: 390,
            height: 844,
            is_mobile: true,
            has_touch: true,
        }
    }
}

/// Per-request navigation options. All fields are optional; service defaults
/// apply when unset.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct NavigateOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
    /// CSS selector to wait for after load.
    pub wait_for_selector: Option<String>,
    /// Extra settle time after load, in milliseconds.
    pub wait_ms: Option<u64>,
    /// Navigation timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl NavigateOptions {
    fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Context object handed to the puppeteer function.
    fn to_context(&self, url: &str) -> Value {
        let mut ctx = json!({
            "url": url,
            "timeoutMs": self.timeout_ms(),
        });
        if let Some(ua) = &self.user_agent {
            ctx["userAgent"] = json!(ua);
        }
        if let Some(vp) = &self.viewport {
            ctx["viewport"] = json!(vp);
        }
        if let Some(sel) = &self.wait_for_selector {
            ctx["waitForSelector"] = json!(sel);
        }
        if let Some(ms) = self.wait_ms {
            ctx["waitMs"] = json!(ms);
        }
        ctx
    }
}

/// Outcome of a scripted navigation: where the browser ended up and the
/// rendered DOM it saw there.
#[derive(Debug, Clone, Deserialize)]
pub struct Navigation {
    #[serde(rename = "url")]
    pub final_url: String,
    pub html: String,
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS + 15_000))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// HTTP-level timeout: page timeout plus headroom for browser startup.
    fn request_timeout(opts: &NavigateOptions) -> Duration {
        Duration::from_millis(opts.timeout_ms() + 15_000)
    }

    /// Fetch fully-rendered HTML content for a URL via the /content endpoint.
    pub async fn content(&self, url: &str, opts: &NavigateOptions) -> Result<String> {
        let mut body = json!({
            "url": url,
            "gotoOptions": { "waitUntil": "networkidle2", "timeout": opts.timeout_ms() },
        });
        if let Some(ref ua) = opts.user_agent {
            body["userAgent"] = json!(ua);
        }
        if let Some(ref vp) = opts.viewport {
            body["viewport"] = json!(vp);
        }
        if let Some(ref sel) = opts.wait_for_selector {
            body["waitForSelector"] = json!({ "selector": sel, "timeout": opts.timeout_ms() });
        }

        let resp = self
            .client
            .post(self.endpoint("/content"))
            .header("Content-Type", "application/json")
            .timeout(Self::request_timeout(opts))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }

    /// Navigate to a URL in a real browser and report both the final URL,
    /// after any client-side redirects, and the rendered HTML.
    pub async fn navigate(&self, url: &str, opts: &NavigateOptions) -> Result<Navigation> {
        let data = self.run_function(NAVIGATE_FN, opts.to_context(url), opts).await?;
        serde_json::from_value(data)
            .map_err(|e| BrowserlessError::BadResponse(format!("navigate result: {e}")))
    }

    /// Navigate to a URL and evaluate a JavaScript expression in the page,
    /// returning its JSON-serialized value.
    pub async fn evaluate(&self, url: &str, script: &str, opts: &NavigateOptions) -> Result<Value> {
        let mut context = opts.to_context(url);
        context["script"] = json!(script);
        let data = self.run_function(EVALUATE_FN, context, opts).await?;
        match data {
            Value::Object(mut map) => Ok(map.remove("value").unwrap_or(Value::Null)),
            other => Err(BrowserlessError::BadResponse(format!(
                "evaluate result is not an object: {other}"
            ))),
        }
    }

    async fn run_function(
        &self,
        code: &str,
        context: Value,
        opts: &NavigateOptions,
    ) -> Result<Value> {
        let body = json!({ "code": code, "context": context });

        let resp = self
            .client
            .post(self.endpoint("/function"))
            .header("Content-Type", "application/json")
            .timeout(Self::request_timeout(opts))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| BrowserlessError::BadResponse(format!("function response: {e}")))
    }
}
