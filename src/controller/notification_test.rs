#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use chrono::TimeZone;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorder {
    hits: Arc<AtomicU32>,
    fail_first: u32,
    bodies: Arc<Mutex<Vec<WebhookData>>>,
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
}

async fn receive(
    State(rec): State<Recorder>,
    headers: HeaderMap,
    Json(body): Json<WebhookData>,
) -> StatusCode {
    let hit = rec.hits.fetch_add(1, Ordering::SeqCst) + 1;
    rec.auth_headers.lock().unwrap().push(
        headers
            .get("authorization")
            .map(|v| v.to_str().unwrap().to_string()),
    );
    if hit <= rec.fail_first {
        return StatusCode::BAD_GATEWAY;
    }
    rec.bodies.lock().unwrap().push(body);
    StatusCode::OK
}

/// Start a webhook receiver on an ephemeral port, returning its URL
async fn start_receiver(rec: Recorder) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/hook", post(receive)).with_state(rec);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), handle)
}

fn sample() -> WebhookData {
    let apply = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    WebhookData::new(
        Subject::Platform,
        "v1.31.0",
        &BTreeMap::from([("kubernetes".to_string(), "1.29".to_string())]),
        Some("https://example.com/changelog/v1.31.0"),
        apply,
    )
}

#[test]
fn test_payload_serializes_camel_case() {
    let json = serde_json::to_value(sample()).unwrap();

    assert_eq!(json["subject"], "Platform");
    assert_eq!(json["version"], "v1.31.0");
    assert_eq!(json["applyTime"], "2026-03-02T12:00:00Z");
    assert_eq!(json["changelogLink"], "https://example.com/changelog/v1.31.0");
    assert_eq!(json["requirements"]["kubernetes"], "1.29");
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("Platform release v1.31.0"));
}

#[test]
fn test_authorization_header() {
    assert_eq!(authorization_header(None), None);
    assert_eq!(
        authorization_header(Some(&NotificationAuth::Basic {
            user: "admin".into(),
            password: "pw".into()
        })),
        Some("Basic YWRtaW46cHc=".to_string())
    );
    assert_eq!(
        authorization_header(Some(&NotificationAuth::Bearer {
            token: "tok".into()
        })),
        Some("Bearer tok".to_string())
    );
}

#[test]
fn test_from_config_requires_url() {
    assert!(HttpNotificationSink::from_config(&NotificationConfig::default()).is_none());

    let config = NotificationConfig {
        webhook_url: Some("http://127.0.0.1:1/hook".to_string()),
        ..Default::default()
    };
    assert!(HttpNotificationSink::from_config(&config).is_some());
}

#[tokio::test]
async fn test_http_sink_delivers_with_bearer_auth() {
    let rec = Recorder::default();
    let (url, handle) = start_receiver(rec.clone()).await;

    let sink = HttpNotificationSink::new(
        url,
        Some(NotificationAuth::Bearer {
            token: "s3cr3t".into(),
        }),
    );
    sink.notify(&sample()).await.expect("delivery should succeed");

    assert_eq!(rec.hits.load(Ordering::SeqCst), 1);
    assert_eq!(rec.bodies.lock().unwrap()[0], sample());
    assert_eq!(
        rec.auth_headers.lock().unwrap()[0].as_deref(),
        Some("Bearer s3cr3t")
    );

    handle.abort();
}

#[tokio::test]
async fn test_http_sink_retries_until_success() {
    let rec = Recorder {
        fail_first: 2,
        ..Default::default()
    };
    let (url, handle) = start_receiver(rec.clone()).await;

    let sink = HttpNotificationSink::new(url, None).with_retry(5, Duration::from_millis(5));
    sink.notify(&sample()).await.expect("third attempt should succeed");

    assert_eq!(rec.hits.load(Ordering::SeqCst), 3);
    assert_eq!(rec.bodies.lock().unwrap().len(), 1);

    handle.abort();
}

#[tokio::test]
async fn test_http_sink_gives_up_after_attempts() {
    let rec = Recorder {
        fail_first: u32::MAX,
        ..Default::default()
    };
    let (url, handle) = start_receiver(rec.clone()).await;

    let sink = HttpNotificationSink::new(url, None).with_retry(3, Duration::from_millis(5));
    let err = sink.notify(&sample()).await.unwrap_err();

    assert!(matches!(err, NotificationError::Exhausted { attempts: 3, .. }));
    assert!(err.to_string().contains("502"));
    assert_eq!(rec.hits.load(Ordering::SeqCst), 3);

    handle.abort();
}

#[tokio::test]
async fn test_mock_sink_records_and_fails() {
    let sink = MockNotificationSink::new();
    sink.notify(&sample()).await.unwrap();
    assert_eq!(sink.sent().len(), 1);

    sink.set_failing(true);
    assert!(sink.notify(&sample()).await.is_err());
    assert_eq!(sink.sent().len(), 1);
}
