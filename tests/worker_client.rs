use axum::{
    http::StatusCode as AxumStatus,
    routing::{get, post},
    Json, Router,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use scribeq::client::{Liveness, Transcriber, WorkerClient};
use scribeq::error::WorkerError;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base_url: &str, timeout: Duration) -> WorkerClient {
    WorkerClient::new(base_url, "secret", timeout, Duration::from_millis(500), CancellationToken::new()).unwrap()
}

fn respond(status: AxumStatus, body: &'static str) -> Router {
    Router::new().route("/transcribe", post(move || async move { (status, body) }))
}

#[tokio::test]
async fn decodes_transcript_and_sends_request_body() {
    let app = Router::new().route(
        "/transcribe",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body, json!({ "mediaId": "abc", "language": "de" }));
            Json(json!({
                "text": " hallo welt ",
                "segments": [{ "text": "hallo", "timestamp": [0.0, 0.4] }, { "text": "welt", "start": 0.4, "end": 0.9 }],
                "language": "de",
                "processingDuration": 2.5,
            }))
        }),
    );
    let url = spawn(app).await;

    let body = client(&url, Duration::from_secs(5)).transcribe("abc", Some("de")).await.unwrap();

    assert_eq!(body.language.as_deref(), Some("de"));
    assert_eq!(body.segments.len(), 2);
    assert_eq!(body.segments[0].end, Some(0.4));
    assert_eq!(body.segments[1].start, Some(0.4));
    assert_eq!(body.word_count(), 2);
}

#[tokio::test]
async fn not_found_carries_detail_message() {
    let url = spawn(respond(AxumStatus::NOT_FOUND, r#"{"detail":"Media not found"}"#)).await;

    let err = client(&url, Duration::from_secs(5)).transcribe("abc", None).await.unwrap_err();

    match err {
        WorkerError::Http { status, message } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(message, "Media not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_error_falls_back_to_status_line() {
    let url = spawn(respond(AxumStatus::BAD_GATEWAY, "<html>upstream down</html>")).await;

    let err = client(&url, Duration::from_secs(5)).transcribe("abc", None).await.unwrap_err();

    assert!(matches!(err, WorkerError::Http { ref message, .. } if message == "502 Bad Gateway"));
}

#[tokio::test]
async fn malformed_success_body_is_a_decode_error() {
    let url = spawn(respond(AxumStatus::OK, "not json")).await;

    let err = client(&url, Duration::from_secs(5)).transcribe("abc", None).await.unwrap_err();

    assert!(matches!(err, WorkerError::Decode(_)));
}

#[tokio::test]
async fn slow_worker_times_out() {
    let app = Router::new().route(
        "/transcribe",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            "late"
        }),
    );
    let url = spawn(app).await;

    let err = client(&url, Duration::from_millis(100)).transcribe("abc", None).await.unwrap_err();

    assert!(matches!(err, WorkerError::Timeout(_)));
}

#[tokio::test]
async fn cancellation_interrupts_dispatch() {
    let app = Router::new().route(
        "/transcribe",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            "late"
        }),
    );
    let url = spawn(app).await;
    let token = CancellationToken::new();
    let client = WorkerClient::new(&url, "secret", Duration::from_secs(5), Duration::from_secs(1), token.clone()).unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let err = client.transcribe("abc", None).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, WorkerError::Cancelled));
}

#[tokio::test]
async fn health_reports_model_when_up() {
    let app = Router::new().route(
        "/",
        get(|| async { Json(json!({ "status": "ok", "model": "whisper-base", "device": "cuda" })) }),
    );
    let url = spawn(app).await;

    let health = client(&url, Duration::from_secs(5)).health().await;

    assert_eq!(health.status, Liveness::Healthy);
    assert_eq!(health.model.as_deref(), Some("whisper-base"));
    assert_eq!(health.error, None);
}

#[tokio::test]
async fn health_reports_unreachable_worker() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let health = client(&format!("http://{addr}"), Duration::from_secs(5)).health().await;

    assert_eq!(health.status, Liveness::Unreachable);
    assert!(health.error.is_some());
}
