//! Resolves job photo references into local files a file input can accept.
//!
//! References arrive in four shapes: a path already on disk, an inline
//! base64 data URL, a plain http(s) URL, or a Supabase storage object URL.
//! Everything that is not already local lands in the job's scratch
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::supabase::SupabaseClient;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("photo fetch failed: {0}")]
    Fetch(String),
    #[error("{url} returned `{content_type}`, not an image")]
    NotAnImage { url: String, content_type: String },
    #[error("empty photo body from {0}")]
    Empty(String),
    #[error("invalid base64 photo payload: {0}")]
    Base64(String),
    #[error("photo fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage download failed: {0}")]
    Storage(String),
    #[error("local photo missing: {0}")]
    Missing(PathBuf),
    #[error("scratch io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoSource {
    Local(PathBuf),
    DataUrl { subtype: String, data: String },
    Http(String),
    StorageObject { bucket: String, path: String },
}

impl PhotoSource {
    pub fn parse(reference: &str) -> PhotoSource {
        let trimmed = reference.trim();
        if let Some(rest) = trimmed.strip_prefix("data:image/")
            && let Some((subtype, data)) = rest.split_once(";base64,")
        {
            return PhotoSource::DataUrl {
                subtype: subtype.to_string(),
                data: data.to_string(),
            };
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            if let Some((bucket, path)) = parse_storage_url(trimmed) {
                return PhotoSource::StorageObject { bucket, path };
            }
            return PhotoSource::Http(trimmed.to_string());
        }
        PhotoSource::Local(PathBuf::from(trimmed))
    }
}

/// Bucket and object path from a Supabase public-object URL, so the worker
/// can re-fetch it through the authenticated Storage API instead of
/// trusting the bucket to stay public.
fn parse_storage_url(url: &str) -> Option<(String, String)> {
    let (_, tail) = url.split_once("/storage/v1/object/public/")?;
    let tail = tail.split('?').next().unwrap_or(tail);
    let (bucket, path) = tail.split_once('/')?;
    if bucket.is_empty() || path.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(path)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| path.to_string());
    Some((bucket.to_string(), decoded))
}

/// Per-job directory for downloaded photos. Removed explicitly at the end
/// of the job; Drop sweeps whatever an early exit left behind.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub async fn create(job_id: Uuid) -> Result<Self, PhotoError> {
        let root = std::env::temp_dir().join(format!("talos-job-{}", job_id));
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub async fn cleanup(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.root).await {
            debug!(target: "talos.photos", "scratch cleanup: {}", err);
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPhoto {
    pub index: usize,
    pub path: PathBuf,
}

pub struct PhotoIngestion {
    http: Client,
    supabase: Option<SupabaseClient>,
    fetch_timeout: Duration,
}

impl PhotoIngestion {
    pub fn new(http: Client, supabase: Option<SupabaseClient>) -> Self {
        let secs = std::env::var("PHOTO_FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20);
        Self {
            http,
            supabase,
            fetch_timeout: Duration::from_secs(secs),
        }
    }

    #[cfg(test)]
    fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Resolve every reference in order. A failing photo is logged and
    /// skipped; deciding whether an empty result is fatal belongs to the
    /// caller.
    pub async fn resolve_all(
        &self,
        references: &[String],
        scratch: &ScratchDir,
    ) -> Vec<ResolvedPhoto> {
        let mut resolved = Vec::new();
        for (index, reference) in references.iter().enumerate() {
            match self.resolve(index, reference, scratch).await {
                Ok(path) => resolved.push(ResolvedPhoto { index, path }),
                Err(err) => {
                    warn!(target: "talos.photos", index, "skipping photo: {}", err);
                }
            }
        }
        resolved
    }

    pub async fn resolve(
        &self,
        index: usize,
        reference: &str,
        scratch: &ScratchDir,
    ) -> Result<PathBuf, PhotoError> {
        match PhotoSource::parse(reference) {
            PhotoSource::Local(path) => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Ok(path)
                } else {
                    Err(PhotoError::Missing(path))
                }
            }
            PhotoSource::DataUrl { subtype, data } => {
                self.write_data_url(index, &subtype, &data, scratch).await
            }
            PhotoSource::Http(url) => self.fetch_http(index, &url, scratch).await,
            PhotoSource::StorageObject { bucket, path } => {
                self.fetch_storage(index, &bucket, &path, scratch).await
            }
        }
    }

    async fn write_data_url(
        &self,
        index: usize,
        subtype: &str,
        data: &str,
        scratch: &ScratchDir,
    ) -> Result<PathBuf, PhotoError> {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|err| PhotoError::Base64(err.to_string()))?;
        if bytes.is_empty() {
            return Err(PhotoError::Empty("data url".to_string()));
        }
        let path = scratch.file(&format!("photo-{}.{}", index, subtype_extension(subtype)));
        tokio::fs::write(&path, &bytes).await?;
        debug!(target: "talos.photos", index, bytes = bytes.len(), "decoded inline photo");
        Ok(path)
    }

    async fn fetch_http(
        &self,
        index: usize,
        url: &str,
        scratch: &ScratchDir,
    ) -> Result<PathBuf, PhotoError> {
        let staging = scratch.file(&format!("photo-{}.part", index));
        match tokio::time::timeout(self.fetch_timeout, self.stream_to_file(url, &staging)).await {
            Ok(Ok(content_type)) => {
                let ext = content_type
                    .split('/')
                    .nth(1)
                    .map(subtype_extension)
                    .unwrap_or("img");
                let path = scratch.file(&format!("photo-{}.{}", index, ext));
                tokio::fs::rename(&staging, &path).await?;
                debug!(target: "talos.photos", index, url, "downloaded photo");
                Ok(path)
            }
            Ok(Err(err)) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(err)
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(PhotoError::Timeout(self.fetch_timeout))
            }
        }
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> Result<String, PhotoError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| PhotoError::Fetch(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PhotoError::Fetch(format!("HTTP {} from {}", status, url)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(PhotoError::NotAnImage {
                url: url.to_string(),
                content_type,
            });
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| PhotoError::Fetch(err.to_string()))?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(PhotoError::Empty(url.to_string()));
        }
        Ok(content_type)
    }

    async fn fetch_storage(
        &self,
        index: usize,
        bucket: &str,
        object_path: &str,
        scratch: &ScratchDir,
    ) -> Result<PathBuf, PhotoError> {
        let supabase = self
            .supabase
            .as_ref()
            .ok_or_else(|| PhotoError::Storage("no storage client configured".to_string()))?;

        let fetch = supabase.download_object(bucket, object_path);
        let bytes = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => return Err(PhotoError::Storage(err.to_string())),
            Err(_) => return Err(PhotoError::Timeout(self.fetch_timeout)),
        };
        if bytes.is_empty() {
            return Err(PhotoError::Empty(format!("{}/{}", bucket, object_path)));
        }

        let ext = Path::new(object_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let path = scratch.file(&format!("photo-{}.{}", index, ext));
        tokio::fs::write(&path, &bytes).await?;
        debug!(target: "talos.photos", index, bucket, "downloaded storage object");
        Ok(path)
    }
}

fn subtype_extension(subtype: &str) -> &str {
    match subtype {
        "jpeg" => "jpg",
        "svg+xml" => "svg",
        "" => "img",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;
    use tempfile::TempDir;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    async fn scratch() -> ScratchDir {
        ScratchDir::create(Uuid::new_v4()).await.expect("scratch dir")
    }

    fn ingestion() -> PhotoIngestion {
        PhotoIngestion::new(crate::http::build_download_client(), None)
    }

    #[test]
    fn parse_classifies_reference_shapes() {
        assert_eq!(
            PhotoSource::parse("data:image/png;base64,aGVsbG8="),
            PhotoSource::DataUrl {
                subtype: "png".to_string(),
                data: "aGVsbG8=".to_string(),
            }
        );
        assert_eq!(
            PhotoSource::parse("https://cdn.example.com/a.jpg"),
            PhotoSource::Http("https://cdn.example.com/a.jpg".to_string())
        );
        assert_eq!(
            PhotoSource::parse(
                "https://proj.supabase.co/storage/v1/object/public/photos/user%201/lamp.jpg?download=1"
            ),
            PhotoSource::StorageObject {
                bucket: "photos".to_string(),
                path: "user 1/lamp.jpg".to_string(),
            }
        );
        assert_eq!(
            PhotoSource::parse("/tmp/lamp.jpg"),
            PhotoSource::Local(PathBuf::from("/tmp/lamp.jpg"))
        );
    }

    #[test]
    fn storage_url_requires_bucket_and_path() {
        assert_eq!(
            parse_storage_url("https://proj.supabase.co/storage/v1/object/public/photos"),
            None
        );
        assert_eq!(
            parse_storage_url("https://proj.supabase.co/rest/v1/listing_jobs"),
            None
        );
    }

    #[tokio::test]
    async fn data_url_round_trips_exact_bytes() {
        let payload = b"lampy!";
        let reference = format!("data:image/jpeg;base64,{}", BASE64.encode(payload));
        let scratch = scratch().await;

        let path = ingestion()
            .resolve(0, &reference, &scratch)
            .await
            .expect("data url resolution");
        assert!(path.to_string_lossy().ends_with("photo-0.jpg"));

        let written = tokio::fs::read(&path).await.expect("read scratch file");
        assert_eq!(written, payload);
    }

    #[tokio::test]
    async fn local_paths_resolve_in_place() {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("lamp.jpg");
        tokio::fs::write(&source, b"already local")
            .await
            .expect("write source");
        let scratch = scratch().await;

        let path = ingestion()
            .resolve(0, source.to_str().expect("utf-8 path"), &scratch)
            .await
            .expect("local resolution");
        assert_eq!(path, source);

        let gone = dir.path().join("gone.jpg");
        let err = ingestion()
            .resolve(1, gone.to_str().expect("utf-8 path"), &scratch)
            .await
            .expect_err("missing file must not resolve");
        assert!(matches!(err, PhotoError::Missing(_)));
    }

    #[tokio::test]
    async fn http_download_writes_body() {
        let body: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x01, 0x02];
        let router = Router::new().route(
            "/lamp.jpg",
            get(move || async move { ([(header::CONTENT_TYPE, "image/jpeg")], body.to_vec()) }),
        );
        let base = serve(router).await;
        let scratch = scratch().await;

        let path = ingestion()
            .resolve(2, &format!("{}/lamp.jpg", base), &scratch)
            .await
            .expect("http resolution");
        let written = tokio::fs::read(&path).await.expect("read scratch file");
        assert_eq!(written, body);
    }

    #[tokio::test]
    async fn html_response_is_rejected_without_a_file() {
        let router = Router::new().route(
            "/photo",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html>nope</html>") }),
        );
        let base = serve(router).await;
        let scratch = scratch().await;

        let err = ingestion()
            .resolve(0, &format!("{}/photo", base), &scratch)
            .await
            .expect_err("html must be rejected");
        assert!(matches!(err, PhotoError::NotAnImage { .. }));

        let mut entries = tokio::fs::read_dir(scratch.path()).await.expect("read dir");
        assert!(entries.next_entry().await.expect("next entry").is_none());
    }

    #[tokio::test]
    async fn zero_byte_body_is_deleted() {
        let router = Router::new().route(
            "/empty.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], Vec::<u8>::new()) }),
        );
        let base = serve(router).await;
        let scratch = scratch().await;

        let err = ingestion()
            .resolve(0, &format!("{}/empty.png", base), &scratch)
            .await
            .expect_err("empty body must fail");
        assert!(matches!(err, PhotoError::Empty(_)));

        let mut entries = tokio::fs::read_dir(scratch.path()).await.expect("read dir");
        assert!(entries.next_entry().await.expect("next entry").is_none());
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let router = Router::new().route(
            "/slow.jpg",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                ([(header::CONTENT_TYPE, "image/jpeg")], vec![1u8])
            }),
        );
        let base = serve(router).await;
        let scratch = scratch().await;

        let err = ingestion()
            .with_fetch_timeout(Duration::from_millis(50))
            .resolve(0, &format!("{}/slow.jpg", base), &scratch)
            .await
            .expect_err("slow fetch must time out");
        assert!(matches!(err, PhotoError::Timeout(_)));
    }

    #[tokio::test]
    async fn one_bad_photo_does_not_sink_the_rest() {
        let scratch = scratch().await;
        let references = vec![
            "data:image/png;base64,!!!not-base64!!!".to_string(),
            format!("data:image/png;base64,{}", BASE64.encode(b"ok")),
        ];

        let resolved = ingestion().resolve_all(&references, &scratch).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].index, 1);
    }
}
