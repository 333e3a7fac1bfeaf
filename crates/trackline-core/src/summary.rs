//! Read-only query of the locations the endpoint recorded for a day.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use time::Date;
use time::macros::format_description;
use tracing::warn;

use trackline_types::TrackPoint;

use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::uploader::normalize_base_url;

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    locations: Vec<TrackPoint>,
}

/// Client for `GET {base}/track/summary?date=YYYY-MM-DD`.
///
/// Failures never propagate: a missing token, a transport error, a non-2xx
/// status or an undecodable body all log a warning and yield no data.
#[derive(Clone)]
pub struct SummaryClient {
    client: Client,
    summary_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for SummaryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryClient")
            .field("summary_url", &self.summary_url)
            .finish()
    }
}

impl SummaryClient {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            summary_url: format!("{}/track/summary", base_url),
            credentials,
        })
    }

    /// Locations recorded on `date`, or an empty list if they cannot be fetched.
    pub async fn locations_on(&self, date: Date) -> Vec<TrackPoint> {
        let Some(token) = self.credentials.token().await else {
            warn!("No credential available for summary query");
            return Vec::new();
        };

        let format = format_description!("[year]-[month]-[day]");
        let date = match date.format(format) {
            Ok(date) => date,
            Err(e) => {
                warn!("Cannot format summary date: {}", e);
                return Vec::new();
            }
        };

        let response = match self
            .client
            .get(&self.summary_url)
            .query(&[("date", date.as_str())])
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Summary request for {} failed: {}", date, e);
                return Vec::new();
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Summary request for {} returned {}", date, status);
            return Vec::new();
        }

        match response.json::<SummaryResponse>().await {
            Ok(body) => body.locations,
            Err(e) => {
                warn!("Summary response for {} could not be decoded: {}", date, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::NoCredentials;
    use time::macros::date;

    #[test]
    fn test_summary_url() {
        let client = SummaryClient::new(
            "https://collector.example.com/",
            Arc::new(NoCredentials),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.summary_url,
            "https://collector.example.com/track/summary"
        );
    }

    #[tokio::test]
    async fn test_without_token_returns_nothing() {
        let client = SummaryClient::new(
            "http://127.0.0.1:9",
            Arc::new(NoCredentials),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(client.locations_on(date!(2024 - 05 - 01)).await.is_empty());
    }

    #[test]
    fn test_response_without_locations_is_empty() {
        let body: SummaryResponse = serde_json::from_str("{}").unwrap();
        assert!(body.locations.is_empty());
    }
}
