//! Asset resolver: external image URLs to displayable asset ids.
//!
//! Already-remote references pass through untouched. External URLs are
//! registered with the presence service's external-asset endpoint
//! (retrying transient failures), falling back to a proxy mapping when
//! registration is unavailable. Every resolution goes through the
//! [`ArtworkCache`] keyed by the original reference.

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::{ArtworkCache, ResolvedAsset};

const DEFAULT_BASE_URL: &str = "https://discord.com/api/v9";

/// Intermediary endpoint used when external-asset registration is not
/// available (no application id) or keeps failing.
const ASSET_PROXY_URL: &str = "https://images.weserv.nl/";

/// How many times an external-asset registration is attempted.
const REGISTER_ATTEMPTS: u32 = 3;

/// Linear backoff step between registration attempts.
const REGISTER_BACKOFF_STEP: Duration = Duration::from_millis(200);

/// Errors from asset registration.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("empty registration response")]
    EmptyResponse,

    #[error("invalid bearer token")]
    InvalidToken,
}

#[derive(Debug, Deserialize)]
struct ExternalAsset {
    external_asset_path: String,
}

/// Resolves image references to displayable asset ids.
pub struct AssetResolver {
    http: reqwest::Client,
    application_id: Option<String>,
    cache: Arc<ArtworkCache>,
    base_url: String,
}

impl AssetResolver {
    /// Creates a resolver authenticated with the given bearer token.
    pub fn new(
        token: &str,
        application_id: Option<String>,
        cache: Arc<ArtworkCache>,
    ) -> Result<Self, ResolveError> {
        let mut headers = HeaderMap::new();
        let mut auth =
            HeaderValue::from_str(token).map_err(|_| ResolveError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            application_id,
            cache,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Overrides the API base URL (for tests).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Resolves an image reference to a displayable asset id.
    ///
    /// Non-URL references are assumed to already be remote-native and
    /// pass through unchanged.
    pub async fn resolve(&self, reference: &str) -> Option<String> {
        if !is_external_url(reference) {
            return Some(reference.to_string());
        }
        self.cache
            .get_or_fetch(reference, || self.fetch_asset(reference))
            .await
    }

    /// Registers an external URL, with retries and the proxy fallback.
    async fn fetch_asset(&self, url: &str) -> Option<ResolvedAsset> {
        if let Some(app_id) = self.application_id.clone() {
            for attempt in 1..=REGISTER_ATTEMPTS {
                match self.register_external(&app_id, url).await {
                    Ok(asset) => {
                        let size_bytes = self.probe_size(url).await;
                        return Some(ResolvedAsset { asset, size_bytes });
                    }
                    Err(e) => {
                        warn!(url, attempt, error = %e, "external asset registration failed");
                        if attempt < REGISTER_ATTEMPTS {
                            tokio::time::sleep(REGISTER_BACKOFF_STEP * attempt).await;
                        }
                    }
                }
            }
        }

        debug!(url, "falling back to proxy resolution");
        Some(ResolvedAsset {
            asset: proxy_reference(url),
            size_bytes: self.probe_size(url).await,
        })
    }

    /// One registration round-trip against the external-asset endpoint.
    async fn register_external(&self, app_id: &str, url: &str) -> Result<String, ResolveError> {
        let endpoint = format!("{}/applications/{app_id}/external-assets", self.base_url);
        let body = serde_json::json!({ "urls": [url] });

        let resp = self.http.post(&endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolveError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let assets: Vec<ExternalAsset> = resp.json().await?;
        let first = assets.into_iter().next().ok_or(ResolveError::EmptyResponse)?;
        Ok(format!("mp:{}", first.external_asset_path))
    }

    /// Best-effort Content-Length probe of the source image for cache
    /// budgeting. Unknown sizes count as 0.
    async fn probe_size(&self, url: &str) -> u64 {
        match self.http.head(url).send().await {
            Ok(resp) => resp.content_length().unwrap_or(0),
            Err(_) => 0,
        }
    }
}

/// Whether a reference is an external URL needing registration.
fn is_external_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Maps a URL through the intermediary proxy endpoint.
fn proxy_reference(url: &str) -> String {
    let encoded = utf8_percent_encode(url, NON_ALPHANUMERIC);
    format!("{ASSET_PROXY_URL}?url={encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Starts a mock HTTP server that serves the given (status, body)
    /// responses in order, one connection each.
    async fn mock_server(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");

        let handle = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;

                let resp = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, handle)
    }

    fn test_resolver(app_id: Option<&str>, base_url: &str) -> (tempfile::TempDir, AssetResolver) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtworkCache::new(tmp.path().join("artwork.json")));
        let resolver = AssetResolver::new("test-token", app_id.map(String::from), cache)
            .unwrap()
            .with_base_url(base_url.to_string());
        (tmp, resolver)
    }

    #[test]
    fn non_url_reference_detection() {
        assert!(is_external_url("https://cdn.example/cover.png"));
        assert!(is_external_url("http://cdn.example/cover.png"));
        assert!(!is_external_url("mp:external/abc"));
        assert!(!is_external_url("builtin_logo"));
    }

    #[test]
    fn proxy_reference_encodes_url() {
        let mapped = proxy_reference("https://cdn.example/a b.png");
        assert!(mapped.starts_with(ASSET_PROXY_URL));
        assert!(!mapped.contains(' '));
        assert!(mapped.contains("url=https%3A%2F%2Fcdn%2Eexample%2Fa%20b%2Epng"));
    }

    #[tokio::test]
    async fn remote_native_reference_passes_through() {
        let (_tmp, resolver) = test_resolver(Some("123"), "http://127.0.0.1:1");
        let got = resolver.resolve("mp:external/already-there").await;
        assert_eq!(got, Some("mp:external/already-there".into()));
    }

    #[tokio::test]
    async fn registration_success_returns_media_proxy_id() {
        let body = r#"[{"url":"https://cdn.example/c.png","external_asset_path":"external/abc/def"}]"#;
        let (url, _handle) = mock_server(vec![(200, body.to_string())]).await;

        let (_tmp, resolver) = test_resolver(Some("123"), &url);
        // probe_size HEAD hits a dead connection and degrades to 0 — fine.
        let got = resolver.resolve("https://cdn.example/c.png").await;
        assert_eq!(got, Some("mp:external/abc/def".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn registration_retries_then_succeeds() {
        let body = r#"[{"url":"u","external_asset_path":"external/xyz"}]"#;
        let (url, _handle) = mock_server(vec![
            (500, "{}".into()),
            (500, "{}".into()),
            (200, body.to_string()),
        ])
        .await;

        let (_tmp, resolver) = test_resolver(Some("123"), &url);
        let got = resolver.resolve("https://cdn.example/c.png").await;
        assert_eq!(got, Some("mp:external/xyz".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn registration_exhausted_falls_back_to_proxy() {
        let (url, _handle) = mock_server(vec![
            (500, "{}".into()),
            (500, "{}".into()),
            (500, "{}".into()),
        ])
        .await;

        let (_tmp, resolver) = test_resolver(Some("123"), &url);
        let got = resolver.resolve("https://cdn.example/c.png").await.unwrap();
        assert!(got.starts_with(ASSET_PROXY_URL), "got: {got}");
    }

    #[tokio::test]
    async fn no_application_id_goes_straight_to_proxy() {
        // Base URL points nowhere; without an app id it is never dialed.
        let (_tmp, resolver) = test_resolver(None, "http://127.0.0.1:1");
        let got = resolver.resolve("https://cdn.example/c.png").await.unwrap();
        assert!(got.starts_with(ASSET_PROXY_URL));
    }

    #[tokio::test]
    async fn repeated_resolution_served_from_cache() {
        let body = r#"[{"url":"u","external_asset_path":"external/once"}]"#;
        // Exactly one registration response; a second round-trip would hang
        // on a closed listener.
        let (url, _handle) = mock_server(vec![(200, body.to_string())]).await;

        let (_tmp, resolver) = test_resolver(Some("123"), &url);
        let first = resolver.resolve("https://cdn.example/c.png").await;
        assert_eq!(first, Some("mp:external/once".into()));

        let second = resolver.resolve("https://cdn.example/c.png").await;
        assert_eq!(second, Some("mp:external/once".into()));
    }

    #[tokio::test]
    async fn empty_registration_response_falls_back() {
        let (url, _handle) = mock_server(vec![
            (200, "[]".into()),
            (200, "[]".into()),
            (200, "[]".into()),
        ])
        .await;

        let (_tmp, resolver) = test_resolver(Some("123"), &url);
        let got = resolver.resolve("https://cdn.example/c.png").await.unwrap();
        assert!(got.starts_with(ASSET_PROXY_URL));
    }
}
