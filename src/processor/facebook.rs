//! Facebook Marketplace create-form automation. The form carries no
//! stable test ids, so the chains key off aria-labels with role-based
//! fallbacks.

use async_trait::async_trait;
use tracing::debug;

use crate::browser::BrowserSession;
use crate::dom::{SelectorChain, SelectorProbe, any, visible, visible_and_enabled};
use crate::models::{ListingPayload, Marketplace};
use crate::photos::ResolvedPhoto;

use super::{
    ListingRecord, MarketplaceProcessor, ProcessorError, SubmitOutcome, SuccessRules,
    attach_photos, click_submit_and_settle, detect_listing_success, ensure_on_page, fill_optional,
    select_dropdown, set_toggle, walk_category_levels,
};

const CREATE_URL: &str = "https://www.facebook.com/marketplace/create/item";

const PHOTO_INPUTS: SelectorChain = SelectorChain::new(
    "facebook-photo-input",
    &[
        SelectorProbe::new("input[type=\"file\"][accept*=\"image\"]", any),
        SelectorProbe::new("input[type=\"file\"]", any),
    ],
);

const PHOTO_AFFORDANCES: SelectorChain = SelectorChain::new(
    "facebook-photo-affordance",
    &[
        SelectorProbe::new("[aria-label=\"Add photos\"]", visible),
        SelectorProbe::new("[aria-label=\"Add Photos\"]", visible),
    ],
);

// Each rendered thumbnail carries its own remove control.
const PHOTO_THUMBNAILS: &str = "[aria-label=\"Remove photo\"]";

const TITLE: SelectorChain = SelectorChain::new(
    "facebook-title",
    &[
        SelectorProbe::new("input[aria-label=\"Title\"]", visible),
        SelectorProbe::new("label[aria-label=\"Title\"] input", visible),
    ],
);

const PRICE: SelectorChain = SelectorChain::new(
    "facebook-price",
    &[
        SelectorProbe::new("input[aria-label=\"Price\"]", visible),
        SelectorProbe::new("label[aria-label=\"Price\"] input", visible),
    ],
);

const DESCRIPTION: SelectorChain = SelectorChain::new(
    "facebook-description",
    &[
        SelectorProbe::new("textarea[aria-label=\"Description\"]", visible),
        SelectorProbe::new("label[aria-label=\"Description\"] textarea", visible),
    ],
);

const TAGS: SelectorChain = SelectorChain::new(
    "facebook-tags",
    &[SelectorProbe::new("input[aria-label=\"Product tags\"]", visible)],
);

const CATEGORY_TRIGGER: &str = "[aria-label=\"Category\"]";
const CONDITION_TRIGGER: &str = "[aria-label=\"Condition\"]";
// Dropdown panels render into a shared portal; options are only
// distinguishable by when they appear.
const OPTION_ROWS: &str = "[role=\"option\"]";

const HIDE_FROM_FRIENDS: SelectorChain = SelectorChain::new(
    "facebook-hide-from-friends",
    &[
        SelectorProbe::new("input[aria-label=\"Hide from friends\"]", any),
        SelectorProbe::new("[role=\"switch\"][aria-label=\"Hide from friends\"]", visible),
    ],
);

const SUBMIT: SelectorChain = SelectorChain::new(
    "facebook-submit",
    &[
        SelectorProbe::new("[aria-label=\"Publish\"][role=\"button\"]", visible_and_enabled),
        SelectorProbe::new("button[type=\"submit\"]", visible_and_enabled),
    ],
);

const SUCCESS: SuccessRules = SuccessRules {
    url_markers: &["/marketplace/item/"],
    keywords: &["your listing is now published", "listing published"],
};

pub struct FacebookProcessor;

#[async_trait]
impl MarketplaceProcessor for FacebookProcessor {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Facebook
    }

    fn create_url(&self) -> &'static str {
        CREATE_URL
    }

    async fn upload_images(
        &self,
        session: &dyn BrowserSession,
        photos: &[ResolvedPhoto],
    ) -> Result<(), ProcessorError> {
        ensure_on_page(session, CREATE_URL).await?;
        attach_photos(
            session,
            &PHOTO_INPUTS,
            &PHOTO_AFFORDANCES,
            PHOTO_THUMBNAILS,
            photos,
        )
        .await
    }

    async fn fill_form(
        &self,
        session: &dyn BrowserSession,
        payload: &ListingPayload,
    ) -> Result<(), ProcessorError> {
        fill_optional(session, &TITLE, &payload.title).await?;
        fill_optional(session, &PRICE, &payload.price).await?;

        let levels = walk_category_levels(
            session,
            CATEGORY_TRIGGER,
            OPTION_ROWS,
            &payload.category_path,
            session.op_timeout(),
        )
        .await?;
        if levels < payload.category_path.len() {
            debug!(
                target: "talos.dom",
                selected = levels,
                wanted = payload.category_path.len(),
                "category walk ended early"
            );
        }

        // Facebook prefixes used conditions ("Used - Good"), so a payload
        // condition of "Good" only lands via substring matching.
        if let Some(condition) = &payload.condition {
            select_dropdown(session, CONDITION_TRIGGER, OPTION_ROWS, condition, true).await?;
        }

        if let Some(description) = &payload.description {
            fill_optional(session, &DESCRIPTION, description).await?;
        }
        if !payload.tags.is_empty() {
            fill_optional(session, &TAGS, &payload.tags.join(", ")).await?;
        }

        if let Some(desired) = payload.options.hide_from_friends {
            set_toggle(session, &HIDE_FROM_FRIENDS, desired).await?;
        }
        Ok(())
    }

    async fn submit(&self, session: &dyn BrowserSession) -> Result<SubmitOutcome, ProcessorError> {
        click_submit_and_settle(session, &SUBMIT).await
    }

    async fn extract_listing(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<ListingRecord, ProcessorError> {
        let url = session.current_url().await?;
        let html = session.content().await?;
        detect_listing_success(&url, &html, &SUCCESS).ok_or_else(|| {
            ProcessorError::Rejected(format!("no success signal on {} after submit", url))
        })
    }
}
