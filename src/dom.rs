//! Selector fallback chains and widget helpers shared by the marketplace
//! processors. The decision logic is kept in plain functions over
//! [`ElementFacts`] so it can be exercised without a live page.

use std::time::Duration;

use tracing::debug;

use crate::browser::{BrowserError, BrowserSession, ElementFacts};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type FactsPredicate = fn(&ElementFacts) -> bool;

pub fn any(_facts: &ElementFacts) -> bool {
    true
}

pub fn visible(facts: &ElementFacts) -> bool {
    facts.visible
}

pub fn visible_and_enabled(facts: &ElementFacts) -> bool {
    facts.visible && facts.enabled
}

/// One candidate selector plus the condition its match must satisfy.
#[derive(Clone, Copy)]
pub struct SelectorProbe {
    pub selector: &'static str,
    pub predicate: FactsPredicate,
}

impl SelectorProbe {
    pub const fn new(selector: &'static str, predicate: FactsPredicate) -> Self {
        Self {
            selector,
            predicate,
        }
    }
}

/// Ordered list of probes, tried first-match-wins. Marketplace markup
/// churns; the chains put current test ids first and older structural
/// selectors behind them.
#[derive(Clone, Copy)]
pub struct SelectorChain {
    pub name: &'static str,
    pub probes: &'static [SelectorProbe],
}

impl SelectorChain {
    pub const fn new(name: &'static str, probes: &'static [SelectorProbe]) -> Self {
        Self { name, probes }
    }

    /// Walk the probes against a fact source. This is the whole matching
    /// rule; `resolve` only supplies the live lookup.
    pub fn first_match<F>(&self, lookup: F) -> Option<(&'static str, ElementFacts)>
    where
        F: Fn(&str) -> Option<ElementFacts>,
    {
        for probe in self.probes {
            if let Some(facts) = lookup(probe.selector)
                && (probe.predicate)(&facts)
            {
                return Some((probe.selector, facts));
            }
        }
        None
    }

    /// Single pass over the live page.
    pub async fn resolve(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<Option<(&'static str, ElementFacts)>, BrowserError> {
        for probe in self.probes {
            if let Some(facts) = session.inspect(probe.selector).await?
                && (probe.predicate)(&facts)
            {
                debug!(
                    target: "talos.dom",
                    chain = self.name,
                    selector = probe.selector,
                    "probe matched"
                );
                return Ok(Some((probe.selector, facts)));
            }
        }
        Ok(None)
    }

    /// Poll the chain until something matches or `timeout` elapses.
    pub async fn resolve_within(
        &self,
        session: &dyn BrowserSession,
        timeout: Duration,
    ) -> Result<Option<(&'static str, ElementFacts)>, BrowserError> {
        let start = std::time::Instant::now();
        loop {
            if let Some(hit) = self.resolve(session).await? {
                return Ok(Some(hit));
            }
            if start.elapsed() > timeout {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Index of the option matching `wanted`. Exact mode compares the whole
/// trimmed text case-insensitively, so "Good" never lands on "Very Good".
/// Partial mode takes the first case-insensitive substring hit instead.
pub fn match_option_text(options: &[String], wanted: &str, partial: bool) -> Option<usize> {
    let needle = wanted.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    if partial {
        options
            .iter()
            .position(|option| option.trim().to_lowercase().contains(&needle))
    } else {
        options
            .iter()
            .position(|option| option.trim().to_lowercase() == needle)
    }
}

/// Open a dropdown and click the option whose text matches `wanted`.
/// Returns whether an option was selected; a missing trigger or option is
/// reported, not raised, so callers can treat the field as optional.
pub async fn select_dropdown_option(
    session: &dyn BrowserSession,
    trigger: &str,
    option_selector: &str,
    wanted: &str,
    partial: bool,
    wait: Duration,
) -> Result<bool, BrowserError> {
    match session.click(trigger).await {
        Ok(()) => {}
        Err(BrowserError::ElementNotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    }

    if let Err(BrowserError::Timeout(_)) = session.wait_for(option_selector, wait).await {
        debug!(target: "talos.dom", trigger, "dropdown opened but no options appeared");
        return Ok(false);
    }

    let options = session.texts(option_selector).await?;
    let Some(index) = match_option_text(&options, wanted, partial) else {
        debug!(
            target: "talos.dom",
            trigger,
            wanted,
            options = options.len(),
            "no option matched"
        );
        return Ok(false);
    };

    session.click_nth(option_selector, index).await?;
    Ok(true)
}

/// Current on/off state of a toggle, normalized across the widget styles
/// the marketplaces use. The first representation the element actually
/// carries wins: the native checked property, then aria-checked, then a
/// "checked" class, then aria-pressed, then data-state.
pub fn toggle_state(facts: &ElementFacts) -> bool {
    if let Some(checked) = facts.checked {
        return checked;
    }
    if let Some(value) = facts.attr("aria-checked") {
        return value == "true";
    }
    if facts.has_class("checked") {
        return true;
    }
    if let Some(value) = facts.attr("aria-pressed") {
        return value == "true";
    }
    facts.attr("data-state") == Some("checked")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    Missing,
    AlreadySet,
    Clicked,
}

/// Read a toggle and click it only when its state differs from `desired`.
pub async fn ensure_toggle(
    session: &dyn BrowserSession,
    selector: &str,
    desired: bool,
) -> Result<ToggleAction, BrowserError> {
    let Some(facts) = session.inspect(selector).await? else {
        return Ok(ToggleAction::Missing);
    };
    if toggle_state(&facts) == desired {
        return Ok(ToggleAction::AlreadySet);
    }
    session.click(selector).await?;
    Ok(ToggleAction::Clicked)
}

/// Find a usable file input. Inputs are routinely mounted lazily, so when
/// the chain misses we click an upload affordance once and re-poll.
pub async fn wait_for_file_input(
    session: &dyn BrowserSession,
    inputs: &SelectorChain,
    affordances: &SelectorChain,
    wait: Duration,
) -> Result<Option<&'static str>, BrowserError> {
    if let Some((selector, _)) = inputs.resolve(session).await? {
        return Ok(Some(selector));
    }

    if let Some((affordance, _)) = affordances.resolve(session).await? {
        debug!(
            target: "talos.dom",
            affordance,
            "file input absent, clicking upload affordance"
        );
        if let Err(e) = session.click(affordance).await {
            debug!(target: "talos.dom", affordance, "affordance click failed: {}", e);
        }
    }

    Ok(inputs
        .resolve_within(session, wait)
        .await?
        .map(|(selector, _)| selector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testkit::FakeSession;
    use std::collections::HashMap;

    fn facts(visible: bool) -> ElementFacts {
        ElementFacts {
            visible,
            enabled: true,
            ..ElementFacts::default()
        }
    }

    #[test]
    fn first_match_walks_probes_in_order() {
        const CHAIN: SelectorChain = SelectorChain::new(
            "title",
            &[
                SelectorProbe::new("[data-testid=\"Title\"]", visible),
                SelectorProbe::new("input[name=\"title\"]", visible),
            ],
        );

        let mut dom = HashMap::new();
        dom.insert("input[name=\"title\"]".to_string(), facts(true));

        let (selector, _) = CHAIN
            .first_match(|sel| dom.get(sel).cloned())
            .expect("fallback probe should match");
        assert_eq!(selector, "input[name=\"title\"]");
    }

    #[test]
    fn first_match_skips_probes_failing_their_predicate() {
        const CHAIN: SelectorChain = SelectorChain::new(
            "submit",
            &[
                SelectorProbe::new("#primary", visible),
                SelectorProbe::new("#secondary", visible),
            ],
        );

        let mut dom = HashMap::new();
        dom.insert("#primary".to_string(), facts(false));
        dom.insert("#secondary".to_string(), facts(true));

        let (selector, _) = CHAIN
            .first_match(|sel| dom.get(sel).cloned())
            .expect("visible probe should match");
        assert_eq!(selector, "#secondary");
    }

    #[test]
    fn exact_match_does_not_cross_options() {
        let options = vec![
            "New".to_string(),
            "Like New".to_string(),
            "Very Good".to_string(),
            "Good".to_string(),
        ];
        assert_eq!(match_option_text(&options, "Good", false), Some(3));
        assert_eq!(match_option_text(&options, "good", false), Some(3));
        assert_eq!(match_option_text(&options, "Mint", false), None);
    }

    #[test]
    fn partial_match_takes_first_substring() {
        let options = vec![
            "Very Good".to_string(),
            "Good".to_string(),
        ];
        assert_eq!(match_option_text(&options, "good", true), Some(0));
        assert_eq!(match_option_text(&options, "", true), None);
    }

    #[test]
    fn toggle_state_reads_each_representation() {
        let mut native = ElementFacts::default();
        native.checked = Some(true);
        assert!(toggle_state(&native));

        let mut aria = ElementFacts::default();
        aria.attrs.insert("aria-checked".to_string(), "true".to_string());
        assert!(toggle_state(&aria));
        aria.attrs.insert("aria-checked".to_string(), "false".to_string());
        assert!(!toggle_state(&aria));

        let mut classed = ElementFacts::default();
        classed.class_name = "switch checked on".to_string();
        assert!(toggle_state(&classed));

        let mut pressed = ElementFacts::default();
        pressed.attrs.insert("aria-pressed".to_string(), "true".to_string());
        assert!(toggle_state(&pressed));

        let mut stateful = ElementFacts::default();
        stateful.attrs.insert("data-state".to_string(), "checked".to_string());
        assert!(toggle_state(&stateful));
        stateful.attrs.insert("data-state".to_string(), "unchecked".to_string());
        assert!(!toggle_state(&stateful));

        assert!(!toggle_state(&ElementFacts::default()));
    }

    #[test]
    fn native_checked_wins_over_attributes() {
        let mut facts = ElementFacts::default();
        facts.checked = Some(false);
        facts
            .attrs
            .insert("aria-checked".to_string(), "true".to_string());
        assert!(!toggle_state(&facts));
    }

    #[tokio::test]
    async fn ensure_toggle_clicks_only_on_mismatch() {
        let session = FakeSession::new();
        let mut on = facts(true);
        on.attrs
            .insert("aria-checked".to_string(), "true".to_string());
        session.put_facts("#smart-pricing", on);

        let action = ensure_toggle(&session, "#smart-pricing", true)
            .await
            .expect("toggle read");
        assert_eq!(action, ToggleAction::AlreadySet);
        assert!(session.clicks().is_empty());

        let action = ensure_toggle(&session, "#smart-pricing", false)
            .await
            .expect("toggle read");
        assert_eq!(action, ToggleAction::Clicked);
        assert_eq!(session.clicks(), vec!["#smart-pricing".to_string()]);
    }

    #[tokio::test]
    async fn ensure_toggle_reports_missing_element() {
        let session = FakeSession::new();
        let action = ensure_toggle(&session, "#absent", true)
            .await
            .expect("toggle read");
        assert_eq!(action, ToggleAction::Missing);
        assert!(session.clicks().is_empty());
    }

    #[tokio::test]
    async fn dropdown_selects_exact_option() {
        let session = FakeSession::new();
        session.put_facts("[data-testid=\"Condition\"]", facts(true));
        let mut option = facts(true);
        option.text = "Good".to_string();
        session.put_facts("[role=\"option\"]", option);
        session.put_texts(
            "[role=\"option\"]",
            vec!["Very Good".to_string(), "Good".to_string()],
        );

        let found = select_dropdown_option(
            &session,
            "[data-testid=\"Condition\"]",
            "[role=\"option\"]",
            "Good",
            false,
            Duration::from_millis(200),
        )
        .await
        .expect("dropdown interaction");
        assert!(found);
        assert_eq!(
            session.clicks(),
            vec![
                "[data-testid=\"Condition\"]".to_string(),
                "[role=\"option\"][1]".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn dropdown_reports_missing_trigger() {
        let session = FakeSession::new();
        let found = select_dropdown_option(
            &session,
            "#absent",
            "[role=\"option\"]",
            "Good",
            false,
            Duration::from_millis(50),
        )
        .await
        .expect("dropdown interaction");
        assert!(!found);
        assert!(session.clicks().is_empty());
    }

    #[tokio::test]
    async fn file_input_found_after_affordance_click() {
        let session = FakeSession::new();
        const INPUTS: SelectorChain = SelectorChain::new(
            "photo-input",
            &[SelectorProbe::new("input[type=\"file\"]", any)],
        );
        const AFFORDANCES: SelectorChain = SelectorChain::new(
            "photo-affordance",
            &[SelectorProbe::new("#add-photos", visible)],
        );

        session.put_facts("#add-photos", facts(true));
        session.reveal_on_click("#add-photos", "input[type=\"file\"]", ElementFacts::default());

        let selector = wait_for_file_input(&session, &INPUTS, &AFFORDANCES, Duration::from_millis(300))
            .await
            .expect("file input discovery");
        assert_eq!(selector, Some("input[type=\"file\"]"));
        assert_eq!(session.clicks(), vec!["#add-photos".to_string()]);
    }
}
