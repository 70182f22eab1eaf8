//! Session attached to one page inside one isolated browser context.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::client::Channel;
use super::error::BrowserError;
use super::protocol::{BoxModel, CookieParam, ElementFacts, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};
use super::BrowserSession;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CTRL: i64 = 2;

pub struct CdpSession {
    channel: Channel,
    context_id: String,
    target_id: String,
    session_id: String,
    nav_timeout: Duration,
    op_timeout: Duration,
    closed: AtomicBool,
}

impl CdpSession {
    pub(crate) fn new(
        channel: Channel,
        context_id: String,
        target_id: String,
        session_id: String,
        nav_timeout: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            context_id,
            target_id,
            session_id,
            nav_timeout,
            op_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Command addressed to this page.
    async fn page_call(&self, method: &str, params: Option<Value>) -> Result<Value, BrowserError> {
        self.channel
            .call(method, params, Some(&self.session_id))
            .await
    }

    /// Command addressed to the browser itself (context-scoped calls).
    async fn browser_call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BrowserError> {
        self.channel.call(method, params, None).await
    }

    pub(crate) async fn enable_domains(&self) -> Result<(), BrowserError> {
        self.page_call("Page.enable", None).await?;
        self.page_call("DOM.enable", None).await?;
        self.page_call("Runtime.enable", None).await?;
        self.page_call("Network.enable", None).await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let result = self
            .page_call(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception["text"].as_str().unwrap_or("unknown error");
            return Err(BrowserError::JavaScript(text.to_string()));
        }

        Ok(result["result"]["value"].clone())
    }

    async fn document_node(&self) -> Result<i64, BrowserError> {
        let result = self
            .page_call("DOM.getDocument", Some(json!({"depth": 0})))
            .await?;
        result["root"]["nodeId"]
            .as_i64()
            .ok_or_else(|| BrowserError::InvalidResponse("missing document node".to_string()))
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<i64>, BrowserError> {
        let doc = self.document_node().await?;
        let result = self
            .page_call(
                "DOM.querySelector",
                Some(json!({"nodeId": doc, "selector": selector})),
            )
            .await?;
        match result["nodeId"].as_i64().unwrap_or(0) {
            0 => Ok(None),
            node_id => Ok(Some(node_id)),
        }
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<i64>, BrowserError> {
        let doc = self.document_node().await?;
        let result = self
            .page_call(
                "DOM.querySelectorAll",
                Some(json!({"nodeId": doc, "selector": selector})),
            )
            .await?;
        Ok(result["nodeIds"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default())
    }

    async fn box_model(&self, node_id: i64) -> Result<Option<BoxModel>, BrowserError> {
        let result = self
            .page_call("DOM.getBoxModel", Some(json!({"nodeId": node_id})))
            .await;
        match result {
            Ok(r) => {
                let model: BoxModel = serde_json::from_value(r["model"].clone())?;
                Ok(Some(model))
            }
            // -32000 is Chrome's "could not compute box model" for detached
            // or unrendered nodes.
            Err(BrowserError::Protocol { code: -32000, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn click_node(&self, node_id: i64, label: &str) -> Result<(), BrowserError> {
        let model = self
            .box_model(node_id)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(format!("{} (not visible)", label)))?;
        let (x, y) = quad_center(&model.content);
        self.click_at(x, y).await
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        for event in ["mousePressed", "mouseReleased"] {
            self.page_call(
                "Input.dispatchMouseEvent",
                Some(json!({
                    "type": event,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                })),
            )
            .await?;
        }
        trace!(target: "talos.browser", "clicked at ({}, {})", x, y);
        Ok(())
    }

    async fn select_all(&self) -> Result<(), BrowserError> {
        for event in ["keyDown", "keyUp"] {
            self.page_call(
                "Input.dispatchKeyEvent",
                Some(json!({"type": event, "key": "a", "modifiers": CTRL})),
            )
            .await?;
        }
        Ok(())
    }

    async fn wait_for_load(&self) -> Result<(), BrowserError> {
        let start = std::time::Instant::now();
        loop {
            let result = self.evaluate("document.readyState").await?;
            if let Some(state) = result.as_str()
                && (state == "complete" || state == "interactive")
            {
                return Ok(());
            }
            if start.elapsed() > self.nav_timeout {
                return Err(BrowserError::NavigationTimeout(
                    "page load never finished".to_string(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn apply_profile(&self, user_agent: Option<&str>) -> Result<(), BrowserError> {
        self.page_call(
            "Emulation.setDeviceMetricsOverride",
            Some(json!({
                "width": VIEWPORT_WIDTH,
                "height": VIEWPORT_HEIGHT,
                "deviceScaleFactor": 1,
                "mobile": false,
            })),
        )
        .await?;

        if let Some(ua) = user_agent {
            self.page_call(
                "Network.setUserAgentOverride",
                Some(json!({"userAgent": ua})),
            )
            .await?;
        }
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), BrowserError> {
        self.browser_call(
            "Storage.setCookies",
            Some(json!({
                "cookies": cookies,
                "browserContextId": self.context_id,
            })),
        )
        .await?;
        Ok(())
    }

    async fn cookies_for_url(&self, url: &str) -> Result<Vec<CookieParam>, BrowserError> {
        let result = self
            .page_call("Network.getCookies", Some(json!({"urls": [url]})))
            .await?;
        let cookies: Vec<CookieParam> =
            serde_json::from_value(result["cookies"].clone()).unwrap_or_default();
        Ok(cookies)
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let result = self
            .page_call("Page.navigate", Some(json!({"url": url})))
            .await?;
        if let Some(error) = result.get("errorText")
            && !error.as_str().unwrap_or_default().is_empty()
        {
            return Err(BrowserError::NavigationFailed(
                error.as_str().unwrap_or("unknown error").to_string(),
            ));
        }
        self.wait_for_load().await?;
        debug!(target: "talos.browser", "navigated to {}", url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let result = self.evaluate("window.location.href").await?;
        Ok(result.as_str().unwrap_or("").to_string())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        let result = self.evaluate("document.documentElement.outerHTML").await?;
        Ok(result.as_str().unwrap_or("").to_string())
    }

    async fn inspect(&self, selector: &str) -> Result<Option<ElementFacts>, BrowserError> {
        let value = self.evaluate(&facts_expression(selector)?).await?;
        if value.is_null() {
            return Ok(None);
        }
        let facts: ElementFacts = serde_json::from_value(value)?;
        Ok(Some(facts))
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let literal = serde_json::to_string(selector)?;
        let expr = format!(
            "Array.from(document.querySelectorAll({literal})).map(el => (el.innerText || el.textContent || '').trim())"
        );
        let value = self.evaluate(&expr).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let node_id = self
            .query_selector(selector)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))?;
        self.click_node(node_id, selector).await
    }

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), BrowserError> {
        let nodes = self.query_selector_all(selector).await?;
        let node_id = *nodes.get(index).ok_or_else(|| {
            BrowserError::ElementNotFound(format!("{}[{}]", selector, index))
        })?;

        match self.click_node(node_id, selector).await {
            Ok(()) => Ok(()),
            // Portal-rendered option lists can lack a box model while still
            // being clickable; fall back to a synthetic DOM click.
            Err(BrowserError::ElementNotFound(_)) => {
                let literal = serde_json::to_string(selector)?;
                let expr = format!(
                    "(() => {{ const el = document.querySelectorAll({literal})[{index}]; if (!el) return false; el.click(); return true; }})()"
                );
                match self.evaluate(&expr).await?.as_bool() {
                    Some(true) => Ok(()),
                    _ => Err(BrowserError::ElementNotFound(format!(
                        "{}[{}]",
                        selector, index
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let node_id = self
            .query_selector(selector)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))?;
        self.page_call("DOM.focus", Some(json!({"nodeId": node_id})))
            .await?;
        self.select_all().await?;
        self.page_call("Input.insertText", Some(json!({"text": value})))
            .await?;
        Ok(())
    }

    async fn attach_file(&self, selector: &str, path: &Path) -> Result<(), BrowserError> {
        let node_id = self
            .query_selector(selector)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))?;
        self.page_call(
            "DOM.setFileInputFiles",
            Some(json!({
                "files": [path.to_string_lossy()],
                "nodeId": node_id,
            })),
        )
        .await?;
        Ok(())
    }

    async fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<ElementFacts, BrowserError> {
        let start = std::time::Instant::now();
        loop {
            if let Some(facts) = self.inspect(selector).await? {
                return Ok(facts);
            }
            if start.elapsed() > timeout {
                return Err(BrowserError::Timeout(format!(
                    "waiting for '{}' timed out",
                    selector
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> Result<(), BrowserError> {
        tokio::time::timeout(timeout, async {
            // Give the click a beat to tear the old document down, otherwise
            // the readyState probe answers for the page being left.
            tokio::time::sleep(POLL_INTERVAL).await;
            self.wait_for_load().await
        })
        .await
        .map_err(|_| BrowserError::NavigationTimeout(format!("no load within {:?}", timeout)))?
    }

    fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closed.store(true, Ordering::SeqCst);
        self.browser_call(
            "Target.closeTarget",
            Some(json!({"targetId": self.target_id})),
        )
        .await?;
        self.browser_call(
            "Target.disposeBrowserContext",
            Some(json!({"browserContextId": self.context_id})),
        )
        .await?;
        debug!(target: "talos.browser", context_id = %self.context_id, "disposed browser context");
        Ok(())
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Backstop for paths that never reached close(). Fire and forget;
        // the context also dies with the browser connection.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let target_id = self.target_id.clone();
            let context_id = self.context_id.clone();
            handle.spawn(async move {
                if let Err(e) = channel
                    .call(
                        "Target.closeTarget",
                        Some(json!({"targetId": target_id})),
                        None,
                    )
                    .await
                {
                    warn!(target: "talos.browser", "late target close failed: {}", e);
                }
                let _ = channel
                    .call(
                        "Target.disposeBrowserContext",
                        Some(json!({"browserContextId": context_id})),
                        None,
                    )
                    .await;
            });
        }
    }
}

fn quad_center(quad: &[f64]) -> (f64, f64) {
    if quad.len() >= 8 {
        let x = (quad[0] + quad[2] + quad[4] + quad[6]) / 4.0;
        let y = (quad[1] + quad[3] + quad[5] + quad[7]) / 4.0;
        (x, y)
    } else {
        (0.0, 0.0)
    }
}

/// Build the in-page probe returning an [`ElementFacts`] literal for the
/// first match of `selector`, or null.
fn facts_expression(selector: &str) -> Result<String, BrowserError> {
    let literal = serde_json::to_string(selector)?;
    Ok(format!(
        r#"(() => {{
            const el = document.querySelector({literal});
            if (!el) return null;
            const style = window.getComputedStyle(el);
            const rect = el.getBoundingClientRect();
            const attrs = {{}};
            for (const a of el.attributes) attrs[a.name] = a.value;
            return {{
                visible: style.display !== 'none' && style.visibility !== 'hidden'
                    && rect.width > 0 && rect.height > 0,
                enabled: !el.disabled && attrs['aria-disabled'] !== 'true',
                checked: typeof el.checked === 'boolean' ? el.checked : null,
                text: (el.innerText || el.value || '').trim(),
                class_name: typeof el.className === 'string' ? el.className : '',
                attrs: attrs,
            }};
        }})()"#
    ))
}
