//! Marketplace processors: the upload/fill/submit/extract contract each
//! supported marketplace implements, plus the registry that resolves a
//! job's marketplace to its processor.

mod facebook;
mod mercari;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::browser::{BrowserError, BrowserSession};
use crate::dom::{
    SelectorChain, ToggleAction, ensure_toggle, match_option_text, select_dropdown_option,
    wait_for_file_input,
};
use crate::models::{ListingPayload, Marketplace};
use crate::photos::ResolvedPhoto;

pub use facebook::FacebookProcessor;
pub use mercari::MercariProcessor;

/// How long a clicked submit control gets to move the page before we stop
/// waiting and read the outcome off the current document instead.
const SUBMIT_NAV_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("required element missing: {0}")]
    MissingElement(String),
    #[error("image {index} failed to upload: {message}")]
    ImageUpload { index: usize, message: String },
    #[error("listing not accepted: {0}")]
    Rejected(String),
    #[error("browser call failed: {0}")]
    Browser(#[from] BrowserError),
}

/// What happened after the submit click. A timed-out navigation is not a
/// failure; plenty of listing forms confirm in place.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    pub navigated: bool,
}

/// The published listing as read back from the post-submit page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRecord {
    pub listing_id: Option<String>,
    pub listing_url: String,
}

/// Success heuristics for one marketplace: URL path markers whose next
/// segment is the listing id, and confirmation keywords for forms that
/// never leave the page.
pub struct SuccessRules {
    pub url_markers: &'static [&'static str],
    pub keywords: &'static [&'static str],
}

/// One marketplace's listing flow. The worker drives the methods in
/// order; each one assumes its predecessors ran on the same session.
#[async_trait]
pub trait MarketplaceProcessor: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    /// Listing-creation surface this processor works against.
    fn create_url(&self) -> &'static str;

    /// Attach every resolved photo to the form's file input. Fails on the
    /// first photo that does not take, naming its index.
    async fn upload_images(
        &self,
        session: &dyn BrowserSession,
        photos: &[ResolvedPhoto],
    ) -> Result<(), ProcessorError>;

    /// Fill the listing form. Fields whose elements are missing are
    /// skipped; the marketplace enforces its own required set at submit.
    async fn fill_form(
        &self,
        session: &dyn BrowserSession,
        payload: &ListingPayload,
    ) -> Result<(), ProcessorError>;

    /// Click the submit control and wait out the navigation race.
    async fn submit(&self, session: &dyn BrowserSession) -> Result<SubmitOutcome, ProcessorError>;

    /// Decide success from the page the submit left behind and pull the
    /// listing id/url out of it.
    async fn extract_listing(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<ListingRecord, ProcessorError>;
}

static MERCARI: MercariProcessor = MercariProcessor;
static FACEBOOK: FacebookProcessor = FacebookProcessor;

pub fn resolve_processor(marketplace: Marketplace) -> &'static dyn MarketplaceProcessor {
    match marketplace {
        Marketplace::Mercari => &MERCARI,
        Marketplace::Facebook => &FACEBOOK,
    }
}

/// Pure decision over the post-submit `(url, html)` pair. URL markers are
/// checked first since they also carry the listing id; keyword hits
/// confirm success without one.
pub fn detect_listing_success(url: &str, html: &str, rules: &SuccessRules) -> Option<ListingRecord> {
    for marker in rules.url_markers {
        if let Some(id) = segment_after(url, marker) {
            return Some(ListingRecord {
                listing_id: Some(id.to_string()),
                listing_url: url.to_string(),
            });
        }
    }
    let haystack = html.to_lowercase();
    if rules.keywords.iter().any(|keyword| haystack.contains(keyword)) {
        return Some(ListingRecord {
            listing_id: None,
            listing_url: url.to_string(),
        });
    }
    None
}

fn segment_after<'a>(url: &'a str, marker: &str) -> Option<&'a str> {
    let start = url.find(marker)? + marker.len();
    let rest = &url[start..];
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let segment = &rest[..end];
    (!segment.is_empty()).then_some(segment)
}

pub(crate) async fn ensure_on_page(
    session: &dyn BrowserSession,
    url: &str,
) -> Result<(), BrowserError> {
    let current = session.current_url().await?;
    if !current.starts_with(url) {
        session.navigate(url).await?;
    }
    Ok(())
}

/// Fill the first element a chain resolves, or skip the field entirely.
pub(crate) async fn fill_optional(
    session: &dyn BrowserSession,
    chain: &SelectorChain,
    value: &str,
) -> Result<bool, BrowserError> {
    let Some((selector, _)) = chain.resolve(session).await? else {
        debug!(target: "talos.dom", field = chain.name, "field absent, skipping");
        return Ok(false);
    };
    session.fill(selector, value).await?;
    Ok(true)
}

/// Dropdown selection with the session's per-operation wait applied to
/// the option-list render.
pub(crate) async fn select_dropdown(
    session: &dyn BrowserSession,
    trigger: &str,
    option_selector: &str,
    wanted: &str,
    partial: bool,
) -> Result<bool, BrowserError> {
    let wait = session.op_timeout();
    select_dropdown_option(session, trigger, option_selector, wanted, partial, wait).await
}

/// Resolve a toggle through its chain and flip it only on state mismatch.
pub(crate) async fn set_toggle(
    session: &dyn BrowserSession,
    chain: &SelectorChain,
    desired: bool,
) -> Result<ToggleAction, BrowserError> {
    let Some((selector, _)) = chain.resolve(session).await? else {
        debug!(target: "talos.dom", field = chain.name, "toggle absent, skipping");
        return Ok(ToggleAction::Missing);
    };
    ensure_toggle(session, selector, desired).await
}

/// Walk a hierarchical category picker. The trigger opens the panel once;
/// each path level is then matched exactly against the rendered options
/// and clicked, and the walk stops at the first level that fails to match.
/// Returns how many levels were selected.
pub(crate) async fn walk_category_levels(
    session: &dyn BrowserSession,
    trigger: &str,
    option_selector: &str,
    levels: &[String],
    wait: Duration,
) -> Result<usize, BrowserError> {
    if levels.is_empty() {
        return Ok(0);
    }
    match session.click(trigger).await {
        Ok(()) => {}
        Err(BrowserError::ElementNotFound(_)) => {
            debug!(target: "talos.dom", trigger, "category picker absent, skipping");
            return Ok(0);
        }
        Err(err) => return Err(err),
    }

    let mut selected = 0;
    for level in levels {
        if session.wait_for(option_selector, wait).await.is_err() {
            debug!(
                target: "talos.dom",
                level, depth = selected, "category options never rendered"
            );
            break;
        }
        let options = session.texts(option_selector).await?;
        let Some(index) = match_option_text(&options, level, false) else {
            debug!(
                target: "talos.dom",
                level,
                depth = selected,
                options = options.len(),
                "category level not offered"
            );
            break;
        };
        session.click_nth(option_selector, index).await?;
        selected += 1;
    }
    Ok(selected)
}

/// Shared submit flow: resolve the control (its chain predicates require
/// visible and enabled, so a disabled button reads as absent), click, then
/// race the navigation wait against the fixed timeout.
pub(crate) async fn click_submit_and_settle(
    session: &dyn BrowserSession,
    chain: &SelectorChain,
) -> Result<SubmitOutcome, ProcessorError> {
    let Some((selector, _)) = chain.resolve_within(session, session.op_timeout()).await? else {
        return Err(ProcessorError::MissingElement(
            "enabled submit control".to_string(),
        ));
    };
    session.click(selector).await?;

    let navigated = match session.wait_for_navigation(SUBMIT_NAV_TIMEOUT).await {
        Ok(()) => true,
        Err(BrowserError::NavigationTimeout(_)) => {
            debug!(
                target: "talos.dom",
                selector, "no navigation after submit, reading outcome in place"
            );
            false
        }
        Err(err) => return Err(err.into()),
    };
    Ok(SubmitOutcome { navigated })
}

/// Shared upload flow over a marketplace's input/affordance chains.
pub(crate) async fn attach_photos(
    session: &dyn BrowserSession,
    inputs: &SelectorChain,
    affordances: &SelectorChain,
    thumbnail_selector: &str,
    photos: &[ResolvedPhoto],
) -> Result<(), ProcessorError> {
    let wait = session.op_timeout();
    let Some(input) = wait_for_file_input(session, inputs, affordances, wait).await? else {
        return Err(ProcessorError::MissingElement(
            "photo file input".to_string(),
        ));
    };

    for photo in photos {
        session
            .attach_file(input, &photo.path)
            .await
            .map_err(|err| ProcessorError::ImageUpload {
                index: photo.index,
                message: err.to_string(),
            })?;
        // Settle interval per image; a slow thumbnail is not a failure.
        match session.wait_for(thumbnail_selector, wait).await {
            Ok(_) => {}
            Err(BrowserError::Timeout(_)) => {
                debug!(
                    target: "talos.dom",
                    index = photo.index, "thumbnail not confirmed within settle window"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
