//! Axum HTTP surface: snapshot ingestion and digest reads.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gwd_core::{DigestError, GameweekKind};
use gwd_sync::{DigestRuntime, DigestService, IngestPipeline};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "gwd-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub digests: DigestService,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, digests: DigestService) -> Self {
        Self { pipeline, digests }
    }

    pub fn from_runtime(runtime: &DigestRuntime) -> Self {
        Self::new(runtime.pipeline.clone(), runtime.digests.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DigestQuery {
    pub gameweek: Option<i32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ingest/classic", post(ingest_classic_handler))
        .route("/ingest/h2h", post(ingest_h2h_handler))
        .route("/events", post(event_handler))
        .route("/digest/{league_id}", get(digest_text_handler))
        .route("/digest/{league_id}/structured", get(digest_structured_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(runtime: &DigestRuntime) -> anyhow::Result<()> {
    let addr = runtime.config.web_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app(AppState::from_runtime(runtime))).await?;
    Ok(())
}

/// Maps domain failures onto status codes. Unexpected errors keep their
/// chain in the log and expose only the top-level message.
pub struct ApiError(DigestError);

impl From<DigestError> for ApiError {
    fn from(err: DigestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            DigestError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            DigestError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            DigestError::Unexpected(err) => {
                error!(error = ?err, "unexpected failure");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
            other => {
                error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
            }
        }
    }
}

fn json_body(body: &Bytes) -> Result<JsonValue, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| DigestError::validation(format!("malformed JSON body: {err}")).into())
}

async fn ingest(state: &AppState, mode: GameweekKind, body: Bytes) -> Result<Response, ApiError> {
    let raw = json_body(&body)?;
    let summary = state.pipeline.ingest_raw(mode, &raw).await?;
    Ok(Json(summary).into_response())
}

async fn ingest_classic_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    ingest(&state, GameweekKind::Classic, body).await
}

async fn ingest_h2h_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    ingest(&state, GameweekKind::HeadToHead, body).await
}

async fn event_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let summary = state.pipeline.ingest_event(&body).await?;
    Ok(Json(summary).into_response())
}

async fn digest_text_handler(
    State(state): State<Arc<AppState>>,
    Path(league_id): Path<i64>,
    Query(query): Query<DigestQuery>,
) -> Result<Response, ApiError> {
    let text = state.digests.text(league_id, query.gameweek).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn digest_structured_handler(
    State(state): State<Arc<AppState>>,
    Path(league_id): Path<i64>,
    Query(query): Query<DigestQuery>,
) -> Result<Response, ApiError> {
    let envelope = state.digests.envelope(league_id, query.gameweek).await?;
    Ok(Json(envelope).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::Request;
    use gwd_storage::MemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_bytes(name: &str) -> Vec<u8> {
        std::fs::read(workspace_root().join("fixtures").join(name)).unwrap()
    }

    fn test_app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(IngestPipeline::new(store.clone()));
        app(AppState::new(pipeline, DigestService::new(store)))
    }

    fn post_json(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn classic_ingest_then_text_digest() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json("/ingest/classic", fixture_bytes("classic_gw1.json")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(summary["teams"], 2);
        assert_eq!(summary["kind"], "classic");

        let resp = app.oneshot(get("/digest/1?gameweek=1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/plain; charset=utf-8"
        );
        let text = body_text(resp).await;
        assert!(text.starts_with("Team A (Ivan) 62 pts"));
        assert!(text.contains("TOP PRF (performance)"));
    }

    #[tokio::test]
    async fn missing_gameweek_is_404_with_message() {
        let resp = test_app().oneshot(get("/digest/42")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("league_id=42"));
    }

    #[tokio::test]
    async fn invalid_payload_is_400() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json("/ingest/classic", br#"{"league_id": 1}"#.to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post_json("/ingest/h2h", b"not json".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_envelope_routes_by_type_header() {
        let app = test_app();
        let payload: JsonValue = serde_json::from_slice(&fixture_bytes("h2h_gw1.json")).unwrap();
        let event = serde_json::json!({"payload": payload, "headers": {"type": "h2h"}});
        let resp = app
            .clone()
            .oneshot(post_json("/events", serde_json::to_vec(&event).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/digest/2/structured")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let envelope: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(envelope["type"], "h2h");
        assert_eq!(envelope["gw"], 5);
        assert!(envelope["top_points"].as_str().unwrap().starts_with("TOP PTS"));
    }

    #[tokio::test]
    async fn event_without_type_header_is_400() {
        let event = serde_json::json!({"payload": {"league_id": 1}, "headers": {}});
        let resp = test_app()
            .oneshot(post_json("/events", serde_json::to_vec(&event).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
