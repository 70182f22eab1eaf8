use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Row from the jobs table. `payload` stays raw here; parsing it into a
/// [`ListingPayload`] happens after the claim so a malformed payload fails
/// the job instead of wedging it in `queued`.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub payload: Value,
    #[serde(default)]
    #[allow(dead_code)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    #[allow(dead_code)]
    pub result: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Marketplaces this worker can post to. Older enqueuers send
/// `facebook_marketplace`, hence the alias.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    Mercari,
    #[serde(alias = "facebook_marketplace")]
    Facebook,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Mercari => "mercari",
            Marketplace::Facebook => "facebook",
        }
    }
}

/// Listing details carried inside the job row's `payload` column. Every
/// field beyond the marketplace routing keys is optional so that older
/// enqueuers keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPayload {
    pub marketplace: Marketplace,
    pub platform_account_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category_path: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub options: ListingOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingOptions {
    #[serde(default)]
    pub smart_pricing: Option<bool>,
    #[serde(default)]
    pub hide_from_friends: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformAccount {
    pub id: Uuid,
    pub marketplace: Marketplace,
    #[serde(alias = "session_payload")]
    pub session_payload_encrypted: SessionPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPayload {
    #[serde(default)]
    pub cookies: Vec<RawCookie>,
    #[serde(default, alias = "userAgent")]
    pub user_agent: Option<String>,
}

/// Cookie as captured by the session extension. Shapes drift between
/// capture versions, so every field tolerates absence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCookie {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, alias = "httpOnly")]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default, alias = "sameSite")]
    pub same_site: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default, alias = "expirationDate")]
    pub expiration_date: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingResult {
    pub success: bool,
    #[serde(rename = "listingId", skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(rename = "listingUrl", skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}
