use crate::http::build_client;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use thiserror::Error;

/// Thin Supabase client over the PostgREST and Storage HTTP surfaces.
/// Constructed once and injected into whatever needs it; nothing in this
/// crate reaches for a global instance.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("{table} write rejected: HTTP {status}: {body}")]
    Rejected {
        table: String,
        status: u16,
        body: String,
    },
}

impl SupabaseError {
    /// True when PostgREST rejected a write because the row mentioned a
    /// column the table does not have (PGRST204 from the schema cache,
    /// 42703 straight from Postgres). Used to walk the event-insert
    /// fallback shapes without masking real failures.
    pub fn is_unknown_column(&self) -> bool {
        match self {
            SupabaseError::Rejected { body, .. } => {
                body.contains("PGRST204") || body.contains("42703")
            }
            _ => false,
        }
    }
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, &service_key))
    }

    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client(),
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    /// GET rows from a table. `query` is the raw PostgREST filter string,
    /// e.g. `status=eq.queued&order=created_at.asc&limit=1`.
    pub async fn select(&self, table: &str, query: &str) -> Result<Vec<Value>, SupabaseError> {
        let url = format!("{}/rest/v1/{}?{}", self.base_url, table, query);
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    /// PATCH rows matched by `filter`, returning the updated representation
    /// so callers can tell how many rows the filter actually hit.
    pub async fn update(
        &self,
        table: &str,
        filter: &str,
        patch: &Value,
    ) -> Result<Vec<Value>, SupabaseError> {
        let url = format!("{}/rest/v1/{}?{}", self.base_url, table, filter);
        let response = self
            .authed(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Rejected {
                table: table.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    pub async fn insert(&self, table: &str, row: &Value) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let response = self
            .authed(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Rejected {
                table: table.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Download an object through the authenticated Storage endpoint. The
    /// service key reads private buckets as well as public ones, so photo
    /// references that arrive as public URLs are re-fetched through here.
    pub async fn download_object(&self, bucket: &str, path: &str) -> Result<Vec<u8>, SupabaseError> {
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            bucket,
            encoded.join("/")
        );
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {} for {}/{}",
                response.status(),
                bucket,
                path
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
