//! Delivery of single samples to the collection endpoint.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trackline_core::{HttpUploader, StaticToken, Uploader, UploaderOptions};
//! use trackline_types::Sample;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = HttpUploader::new(
//!     "https://collector.example.com",
//!     Arc::new(StaticToken::new("secret")),
//!     UploaderOptions::default(),
//! )?;
//!
//! let result = uploader.send(&Sample::now(52.52, 13.405)?).await;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use trackline_types::{Sample, TrackPoint, UploadResult};

use crate::credentials::CredentialProvider;
use crate::error::{Error, Result};

/// A single delivery attempt for one sample.
///
/// Implementations never return errors: every failure is classified into an
/// [`UploadResult`] so callers can decide whether the sample stays queued.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn send(&self, sample: &Sample) -> UploadResult;
}

/// Options for [`HttpUploader`].
#[derive(Debug, Clone)]
pub struct UploaderOptions {
    /// Per-request timeout, connection included.
    pub timeout: Duration,
    /// Path of the ingest endpoint, relative to the base URL.
    pub track_path: String,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            track_path: "/track".to_string(),
        }
    }
}

impl UploaderOptions {
    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("upload timeout must be > 0".to_string()));
        }
        if !self.track_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "track path must start with '/', got: {}",
                self.track_path
            )));
        }
        Ok(())
    }
}

/// Uploader posting JSON to `POST {base}/track` with a bearer token.
///
/// | Response | Result |
/// |----------|--------|
/// | 201 Created | `Delivered` |
/// | 408, 429, 5xx | `TransportFailed` |
/// | any other status | `Rejected` |
/// | connect error / timeout | `TransportFailed` |
/// | no token | `Unauthenticated`, no request made |
#[derive(Clone)]
pub struct HttpUploader {
    client: Client,
    track_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUploader")
            .field("track_url", &self.track_url)
            .finish()
    }
}

impl HttpUploader {
    /// Create an uploader for the endpoint at `base_url`.
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        options: UploaderOptions,
    ) -> Result<Self> {
        options.validate()?;
        let base_url = normalize_base_url(base_url)?;

        let client = Client::builder().timeout(options.timeout).build()?;

        Ok(Self {
            client,
            track_url: format!("{}{}", base_url, options.track_path),
            credentials,
        })
    }

    /// Full URL samples are posted to.
    pub fn track_url(&self) -> &str {
        &self.track_url
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn send(&self, sample: &Sample) -> UploadResult {
        let Some(token) = self.credentials.token().await else {
            return UploadResult::Unauthenticated;
        };

        let body = TrackPoint::from(sample);
        let response = self
            .client
            .post(&self.track_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return UploadResult::TransportFailed("request timed out".to_string());
            }
            Err(e) => return UploadResult::TransportFailed(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::CREATED {
            debug!("Delivered {}", sample);
            return UploadResult::Delivered;
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from));

        classify_status(status, message)
    }
}

/// Map a non-201 response to a result.
pub(crate) fn classify_status(status: StatusCode, message: Option<String>) -> UploadResult {
    if status == StatusCode::CREATED {
        return UploadResult::Delivered;
    }

    let detail = match message {
        Some(message) => format!("{}: {}", status, message),
        None => status.to_string(),
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        UploadResult::TransportFailed(detail)
    } else {
        UploadResult::Rejected(detail)
    }
}

/// Trim trailing slashes and require an http(s) scheme.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<String> {
    let base_url = base_url.trim_end_matches('/').to_string();

    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::InvalidUrl(format!(
            "URL must start with http:// or https://, got: {}",
            base_url
        )));
    }

    Ok(base_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{NoCredentials, StaticToken};

    #[test]
    fn test_uploader_creation() {
        let uploader = HttpUploader::new(
            "http://localhost:8080/",
            Arc::new(StaticToken::new("t")),
            UploaderOptions::default(),
        )
        .unwrap();
        assert_eq!(uploader.track_url(), "http://localhost:8080/track");
    }

    #[test]
    fn test_uploader_invalid_url() {
        let result = HttpUploader::new(
            "localhost:8080",
            Arc::new(NoCredentials),
            UploaderOptions::default(),
        );
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_options_validation() {
        assert!(UploaderOptions::default().validate().is_ok());
        assert!(
            UploaderOptions::default()
                .timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        let options = UploaderOptions {
            track_path: "track".into(),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::CREATED, None),
            UploadResult::Delivered
        );
        assert!(classify_status(StatusCode::BAD_REQUEST, None).is_rejected());
        assert!(classify_status(StatusCode::UNAUTHORIZED, None).is_rejected());
        assert!(classify_status(StatusCode::OK, None).is_rejected());
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None),
            UploadResult::TransportFailed(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None),
            UploadResult::TransportFailed(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None),
            UploadResult::TransportFailed(_)
        ));
    }

    #[test]
    fn test_classify_includes_server_message() {
        let result = classify_status(StatusCode::UNPROCESSABLE_ENTITY, Some("bad latitude".into()));
        assert_eq!(
            result,
            UploadResult::Rejected("422 Unprocessable Entity: bad latitude".into())
        );
    }

    #[tokio::test]
    async fn test_no_token_fails_fast() {
        // Port 9 is discard; no request may be made without a token anyway
        let uploader = HttpUploader::new(
            "http://127.0.0.1:9",
            Arc::new(NoCredentials),
            UploaderOptions::default(),
        )
        .unwrap();
        let sample = Sample::now(1.0, 2.0).unwrap();
        assert_eq!(uploader.send(&sample).await, UploadResult::Unauthenticated);
    }
}
