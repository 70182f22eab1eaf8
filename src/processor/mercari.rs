//! Mercari sell-form automation. The sell surface is rich in stable
//! test ids, so every chain leads with one and falls back to structural
//! selectors observed on older page revisions.

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

const CREATE_URL: &str = "https://www.mercari.com/sell/";

const PHOTO_INPUTS: SelectorChain = SelectorChain::new(
    "mercari-photo-input",
    &[
        SelectorProbe::new("input[data-testid=\"PhotoUpload\"]", any),
        SelectorProbe::new("input[type=\"file\"][accept*=\"image\"]", any),
        SelectorProbe::new("input[type=\"file\"]", any),
    ],
);

const PHOTO_AFFORDANCES: SelectorChain = SelectorChain::new(
    "mercari-photo-affordance",
    &[
        SelectorProbe::new("[data-testid=\"PhotoUploadButton\"]", visible),
        SelectorProbe::new("button[aria-label=\"Add photos\"]", visible),
    ],
);

const PHOTO_THUMBNAILS: &str = "[data-testid=\"PhotoThumbnail\"]";

const TITLE: SelectorChain = SelectorChain::new(
    "mercari-title",
    &[
        SelectorProbe::new("input[data-testid=\"Title\"]", visible),
        SelectorProbe::new("input[name=\"title\"]", visible),
    ],
);

const DESCRIPTION: SelectorChain = SelectorChain::new(
    "mercari-description",
    &[
        SelectorProbe::new("textarea[data-testid=\"Description\"]", visible),
        SelectorProbe::new("textarea[name=\"description\"]", visible),
    ],
);

const PRICE: SelectorChain = SelectorChain::new(
    "mercari-price",
    &[
        SelectorProbe::new("input[data-testid=\"Price\"]", visible),
        SelectorProbe::new("input[name=\"price\"]", visible),
    ],
);

const BRAND: SelectorChain = SelectorChain::new(
    "mercari-brand",
    &[
        SelectorProbe::new("input[data-testid=\"Brand\"]", visible),
        SelectorProbe::new("input[name=\"brandName\"]", visible),
    ],
);

const HASHTAGS: SelectorChain = SelectorChain::new(
    "mercari-hashtags",
    &[SelectorProbe::new("input[data-testid=\"Hashtag\"]", visible)],
);

const CATEGORY_TRIGGER: &str = "[data-testid=\"Category\"]";
const CATEGORY_OPTIONS: &str = "[data-testid=\"CategoryOption\"]";

const CONDITION_TRIGGER: &str = "[data-testid=\"Condition\"]";
const CONDITION_OPTIONS: &str = "[data-testid=\"ConditionOption\"]";

const SMART_PRICING: SelectorChain = SelectorChain::new(
    "mercari-smart-pricing",
    &[
        SelectorProbe::new("[data-testid=\"SmartPricingToggle\"]", visible),
        SelectorProbe::new("input[name=\"smartPricing\"]", any),
    ],
);

const SUBMIT: SelectorChain = SelectorChain::new(
    "mercari-submit",
    &[
        SelectorProbe::new("button[data-testid=\"ListButton\"]", visible_and_enabled),
        SelectorProbe::new("button[type=\"submit\"]", visible_and_enabled),
    ],
);

const SUCCESS: SuccessRules = SuccessRules {
    url_markers: &["/items/", "/item/"],
    keywords: &["listing posted", "your item is now listed"],
};

pub struct MercariProcessor;

#[async_trait]
impl MarketplaceProcessor for MercariProcessor {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Mercari
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
        if let Some(description) = &payload.description {
            fill_optional(session, &DESCRIPTION, description).await?;
        }

        let levels = walk_category_levels(
            session,
            CATEGORY_TRIGGER,
            CATEGORY_OPTIONS,
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

        // Mercari's condition list has both "Good" and "Very Good"; only
        // a whole-text match picks the right one.
        if let Some(condition) = &payload.condition {
            select_dropdown(
                session,
                CONDITION_TRIGGER,
                CONDITION_OPTIONS,
                condition,
                false,
            )
            .await?;
        }

        if let Some(brand) = &payload.brand {
            fill_optional(session, &BRAND, brand).await?;
        }
        fill_optional(session, &PRICE, &payload.price).await?;
        if !payload.tags.is_empty() {
            fill_optional(session, &HASHTAGS, &payload.tags.join(" ")).await?;
        }

        if let Some(desired) = payload.options.smart_pricing {
            set_toggle(session, &SMART_PRICING, desired).await?;
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
