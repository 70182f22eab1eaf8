//! Browser automation over the Chrome DevTools protocol.

mod client;
mod error;
mod page;
mod protocol;
#[cfg(test)]
pub(crate) mod testkit;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

pub use client::Browser;
pub use error::BrowserError;
pub use protocol::{CookieParam, ElementFacts, SameSite, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};

/// Source of per-job browser sessions (to allow swapping in scripted
/// sessions under test).
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Open an isolated browser context with a single blank page.
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// One page in one isolated context. Every job drives exactly one of
/// these; nothing is shared between jobs.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Fixed viewport plus an optional user agent override.
    async fn apply_profile(&self, user_agent: Option<&str>) -> Result<(), BrowserError>;

    /// Inject cookies into this session's context.
    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), BrowserError>;

    /// Cookies the browser would send to `url` right now.
    async fn cookies_for_url(&self, url: &str) -> Result<Vec<CookieParam>, BrowserError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Full document markup, for success heuristics.
    async fn content(&self) -> Result<String, BrowserError>;

    /// Facts about the first element matching `selector`, or None.
    async fn inspect(&self, selector: &str) -> Result<Option<ElementFacts>, BrowserError>;

    /// Trimmed text of every element matching `selector`, in DOM order.
    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), BrowserError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    async fn attach_file(&self, selector: &str, path: &Path) -> Result<(), BrowserError>;

    /// Poll until `selector` exists (visible or not) or `timeout` elapses.
    async fn wait_for(&self, selector: &str, timeout: Duration)
        -> Result<ElementFacts, BrowserError>;

    /// Wait for the load triggered by the last interaction.
    async fn wait_for_navigation(&self, timeout: Duration) -> Result<(), BrowserError>;

    /// Default budget for single-element operations in this session.
    fn op_timeout(&self) -> Duration;

    /// Close the page and dispose its context. Safe to call once on every
    /// exit path; Drop covers whatever never gets here.
    async fn close(&self) -> Result<(), BrowserError>;
}

impl std::fmt::Debug for dyn BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BrowserSession")
    }
}
