//! HttpUploader and SummaryClient against a local collection endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use time::macros::{date, datetime};

use trackline_core::{
    CredentialProvider, HttpUploader, NoCredentials, StaticToken, SummaryClient, Uploader,
    UploaderOptions,
};
use trackline_types::{Sample, UploadResult};

const TOKEN: &str = "secret-token";

#[derive(Clone, Default)]
struct Collector {
    received: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN))
}

/// Latitude selects the response: 0 accepts, 1 rejects, 2 is unavailable,
/// 3 hangs.
async fn track(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        );
    }

    let latitude = body["latitude"].as_f64().unwrap_or_default();
    collector.received.lock().unwrap().push(body);

    match latitude as i64 {
        0 => (StatusCode::CREATED, Json(json!({}))),
        1 => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "implausible position"})),
        ),
        2 => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))),
        _ => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            (StatusCode::CREATED, Json(json!({})))
        }
    }
}

async fn summary(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    match params.get("date").map(String::as_str) {
        Some("2024-05-01") => (
            StatusCode::OK,
            Json(json!({
                "locations": [
                    {"latitude": 52.52, "longitude": 13.405, "timestamp": "2024-05-01T08:00:00Z"},
                    {"latitude": 52.53, "longitude": 13.41, "timestamp": "2024-05-01T08:05:00+02:00"}
                ]
            })),
        ),
        Some("2024-05-02") => (StatusCode::OK, Json(json!({"unexpected": true}))),
        Some("2024-05-03") => (StatusCode::OK, Json(json!({"locations": "nope"}))),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
    }
}

async fn spawn_server(collector: Collector) -> String {
    let app = Router::new()
        .route("/track", post(track))
        .route("/track/summary", get(summary))
        .with_state(collector);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn uploader(base: &str, credentials: Arc<dyn CredentialProvider>) -> HttpUploader {
    HttpUploader::new(
        base,
        credentials,
        UploaderOptions::default().timeout(Duration::from_millis(500)),
    )
    .unwrap()
}

fn sample(latitude: f64) -> Sample {
    Sample::new(latitude, 20.0, datetime!(2024-05-01 12:00:00.25 +02:00)).unwrap()
}

#[tokio::test]
async fn test_created_is_delivered_with_expected_body() {
    let collector = Collector::default();
    let base = spawn_server(collector.clone()).await;
    let uploader = uploader(&base, Arc::new(StaticToken::new(TOKEN)));

    assert_eq!(uploader.send(&sample(0.0)).await, UploadResult::Delivered);

    let received = collector.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["latitude"], json!(0.0));
    assert_eq!(received[0]["longitude"], json!(20.0));
    assert_eq!(received[0]["timestamp"], json!("2024-05-01T12:00:00.25+02:00"));
}

#[tokio::test]
async fn test_bad_request_is_rejected_with_server_message() {
    let base = spawn_server(Collector::default()).await;
    let uploader = uploader(&base, Arc::new(StaticToken::new(TOKEN)));

    assert_eq!(
        uploader.send(&sample(1.0)).await,
        UploadResult::Rejected("400 Bad Request: implausible position".into())
    );
}

#[tokio::test]
async fn test_unavailable_is_transport_failure() {
    let base = spawn_server(Collector::default()).await;
    let uploader = uploader(&base, Arc::new(StaticToken::new(TOKEN)));

    assert!(matches!(
        uploader.send(&sample(2.0)).await,
        UploadResult::TransportFailed(_)
    ));
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let base = spawn_server(Collector::default()).await;
    let uploader = uploader(&base, Arc::new(StaticToken::new("stale")));

    assert!(uploader.send(&sample(0.0)).await.is_rejected());
}

#[tokio::test]
async fn test_missing_token_makes_no_request() {
    let collector = Collector::default();
    let base = spawn_server(collector.clone()).await;
    let uploader = uploader(&base, Arc::new(NoCredentials));

    assert_eq!(
        uploader.send(&sample(0.0)).await,
        UploadResult::Unauthenticated
    );
    assert!(collector.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_hanging_endpoint_times_out() {
    let base = spawn_server(Collector::default()).await;
    let uploader = uploader(&base, Arc::new(StaticToken::new(TOKEN)));

    assert!(matches!(
        uploader.send(&sample(3.0)).await,
        UploadResult::TransportFailed(_)
    ));
}

#[tokio::test]
async fn test_connection_refused_is_transport_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let uploader = uploader(&format!("http://{}", addr), Arc::new(StaticToken::new(TOKEN)));

    assert!(matches!(
        uploader.send(&sample(0.0)).await,
        UploadResult::TransportFailed(_)
    ));
}

#[tokio::test]
async fn test_summary_returns_locations() {
    let base = spawn_server(Collector::default()).await;
    let client =
        SummaryClient::new(&base, Arc::new(StaticToken::new(TOKEN)), Duration::from_secs(2))
            .unwrap();

    let locations = client.locations_on(date!(2024 - 05 - 01)).await;

    assert_eq!(locations.len(), 2);
    assert_eq!(locations[0].latitude, 52.52);
    assert_eq!(locations[1].timestamp, datetime!(2024-05-01 08:05 +02:00));
}

#[tokio::test]
async fn test_summary_failures_yield_no_data() {
    let base = spawn_server(Collector::default()).await;
    let client =
        SummaryClient::new(&base, Arc::new(StaticToken::new(TOKEN)), Duration::from_secs(2))
            .unwrap();

    // Missing field, malformed field, server error
    assert!(client.locations_on(date!(2024 - 05 - 02)).await.is_empty());
    assert!(client.locations_on(date!(2024 - 05 - 03)).await.is_empty());
    assert!(client.locations_on(date!(2024 - 05 - 04)).await.is_empty());

    let unauthorized =
        SummaryClient::new(&base, Arc::new(StaticToken::new("stale")), Duration::from_secs(2))
            .unwrap();
    assert!(unauthorized.locations_on(date!(2024 - 05 - 01)).await.is_empty());
}
