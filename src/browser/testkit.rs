//! Scripted in-memory [`BrowserSession`] for tests. State is armed with
//! `put_*`/`on_click` helpers and interactions are recorded for assertions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::BrowserError;
use super::protocol::{CookieParam, ElementFacts};
use super::{BrowserHost, BrowserSession};

struct State {
    facts: HashMap<String, ElementFacts>,
    texts: HashMap<String, Vec<String>>,
    clicks: Vec<String>,
    fills: Vec<(String, String)>,
    files: Vec<(String, PathBuf)>,
    cookies: Vec<CookieParam>,
    navigations: Vec<String>,
    url: String,
    html: String,
    user_agent: Option<String>,
    reveal_on_click: HashMap<String, Vec<(String, ElementFacts)>>,
    retexts_on_click: HashMap<String, Vec<(String, Vec<String>)>>,
    destination_on_click: HashMap<String, (String, String)>,
    navigation_completes: bool,
    page_loads_complete: bool,
    attach_failures_after: Option<usize>,
    closed: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            facts: HashMap::new(),
            texts: HashMap::new(),
            clicks: Vec::new(),
            fills: Vec::new(),
            files: Vec::new(),
            cookies: Vec::new(),
            navigations: Vec::new(),
            url: String::new(),
            html: String::new(),
            user_agent: None,
            reveal_on_click: HashMap::new(),
            retexts_on_click: HashMap::new(),
            destination_on_click: HashMap::new(),
            navigation_completes: true,
            page_loads_complete: true,
            attach_failures_after: None,
            closed: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeSession {
    state: Arc<Mutex<State>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_facts(&self, selector: &str, facts: ElementFacts) {
        self.state.lock().facts.insert(selector.to_string(), facts);
    }

    pub fn put_texts(&self, selector: &str, texts: Vec<String>) {
        self.state.lock().texts.insert(selector.to_string(), texts);
    }

    /// After `trigger` is clicked, `selector` starts existing with `facts`.
    pub fn reveal_on_click(&self, trigger: &str, selector: &str, facts: ElementFacts) {
        self.state
            .lock()
            .reveal_on_click
            .entry(trigger.to_string())
            .or_default()
            .push((selector.to_string(), facts));
    }

    /// After `trigger` is clicked, `texts(selector)` starts returning
    /// `texts`. Indexed clicks use the `selector[index]` label as trigger.
    pub fn retexts_on_click(&self, trigger: &str, selector: &str, texts: Vec<String>) {
        self.state
            .lock()
            .retexts_on_click
            .entry(trigger.to_string())
            .or_default()
            .push((selector.to_string(), texts));
    }

    /// After `trigger` is clicked, the page reports `url` and `html`.
    pub fn destination_on_click(&self, trigger: &str, url: &str, html: &str) {
        self.state
            .lock()
            .destination_on_click
            .insert(trigger.to_string(), (url.to_string(), html.to_string()));
    }

    pub fn set_location(&self, url: &str, html: &str) {
        let mut state = self.state.lock();
        state.url = url.to_string();
        state.html = html.to_string();
    }

    /// Make `wait_for_navigation` burn its full timeout and fail.
    pub fn stall_navigation(&self) {
        self.state.lock().navigation_completes = false;
    }

    /// Make `navigate` fail as if the page never finished loading.
    pub fn stall_page_loads(&self) {
        self.state.lock().page_loads_complete = false;
    }

    /// Make `attach_file` fail once `count` files have been accepted.
    pub fn fail_attach_after(&self, count: usize) {
        self.state.lock().attach_failures_after = Some(count);
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.state.lock().fills.clone()
    }

    pub fn files(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().files.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    pub fn injected_cookies(&self) -> Vec<CookieParam> {
        self.state.lock().cookies.clone()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.state.lock().user_agent.clone()
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().closed
    }

    fn apply_click_effects(&self, selector: &str) {
        let mut state = self.state.lock();
        if let Some(revealed) = state.reveal_on_click.remove(selector) {
            for (sel, facts) in revealed {
                state.facts.insert(sel, facts);
            }
        }
        if let Some(retexted) = state.retexts_on_click.remove(selector) {
            for (sel, texts) in retexted {
                state.texts.insert(sel, texts);
            }
        }
        if let Some((url, html)) = state.destination_on_click.remove(selector) {
            state.url = url;
            state.html = html;
        }
    }
}

fn cookie_applies(cookie: &CookieParam, host: &str) -> bool {
    if let Some(domain) = &cookie.domain {
        let bare = domain.trim_start_matches('.');
        return host == bare || host.ends_with(&format!(".{}", bare));
    }
    if let Some(cookie_url) = &cookie.url
        && let Ok(parsed) = url::Url::parse(cookie_url)
    {
        return parsed.host_str() == Some(host);
    }
    false
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn apply_profile(&self, user_agent: Option<&str>) -> Result<(), BrowserError> {
        self.state.lock().user_agent = user_agent.map(str::to_string);
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), BrowserError> {
        self.state.lock().cookies.extend(cookies.iter().cloned());
        Ok(())
    }

    async fn cookies_for_url(&self, url: &str) -> Result<Vec<CookieParam>, BrowserError> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        Ok(self
            .state
            .lock()
            .cookies
            .iter()
            .filter(|cookie| cookie_applies(cookie, &host))
            .cloned()
            .collect())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        state.navigations.push(url.to_string());
        if !state.page_loads_complete {
            return Err(BrowserError::NavigationTimeout(
                "page load never finished".to_string(),
            ));
        }
        state.url = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().url.clone())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().html.clone())
    }

    async fn inspect(&self, selector: &str) -> Result<Option<ElementFacts>, BrowserError> {
        Ok(self.state.lock().facts.get(selector).cloned())
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        Ok(self
            .state
            .lock()
            .texts
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let visible = {
            let state = self.state.lock();
            state.facts.get(selector).map(|f| f.visible)
        };
        match visible {
            Some(true) => {}
            Some(false) => {
                return Err(BrowserError::ElementNotFound(format!(
                    "{} (not visible)",
                    selector
                )));
            }
            None => return Err(BrowserError::ElementNotFound(selector.to_string())),
        }
        self.state.lock().clicks.push(selector.to_string());
        self.apply_click_effects(selector);
        Ok(())
    }

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), BrowserError> {
        let known = {
            let state = self.state.lock();
            state
                .texts
                .get(selector)
                .map(|texts| index < texts.len())
                .unwrap_or(false)
        };
        if !known {
            return Err(BrowserError::ElementNotFound(format!(
                "{}[{}]",
                selector, index
            )));
        }
        let label = format!("{}[{}]", selector, index);
        self.state.lock().clicks.push(label.clone());
        self.apply_click_effects(&label);
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        if !self.state.lock().facts.contains_key(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.state
            .lock()
            .fills
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn attach_file(&self, selector: &str, path: &Path) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        if !state.facts.contains_key(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        if let Some(limit) = state.attach_failures_after
            && state.files.len() >= limit
        {
            return Err(BrowserError::JavaScript(
                "file input rejected the file".to_string(),
            ));
        }
        state.files.push((selector.to_string(), path.to_path_buf()));
        Ok(())
    }

    async fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<ElementFacts, BrowserError> {
        let start = std::time::Instant::now();
        loop {
            if let Some(facts) = self.state.lock().facts.get(selector).cloned() {
                return Ok(facts);
            }
            if start.elapsed() > timeout {
                return Err(BrowserError::Timeout(format!(
                    "waiting for '{}' timed out",
                    selector
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> Result<(), BrowserError> {
        if self.state.lock().navigation_completes {
            return Ok(());
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(50))).await;
        Err(BrowserError::NavigationTimeout("navigation stalled".to_string()))
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(200)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

/// Hands out pre-armed sessions in order.
#[derive(Clone, Default)]
pub struct FakeHost {
    sessions: Arc<Mutex<Vec<FakeSession>>>,
}

impl FakeHost {
    pub fn new(sessions: Vec<FakeSession>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions)),
        }
    }
}

#[async_trait]
impl BrowserHost for FakeHost {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut sessions = self.sessions.lock();
        if sessions.is_empty() {
            return Err(BrowserError::SessionClosed);
        }
        Ok(Box::new(sessions.remove(0)))
    }
}
