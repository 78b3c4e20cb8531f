//! # HTTP Admin Surface
//!
//! The axum router every peer serves on the shared gossip/admin port.
//! All handlers go through the controller handle; nothing here holds state
//! of its own.
//!
//! ## Endpoints
//!
//! | Method | Path               | Description                              |
//! |--------|--------------------|------------------------------------------|
//! | GET    | `/health`          | Liveness probe                           |
//! | GET    | `/info`            | Neighborhood: liveness, phi, status      |
//! | GET    | `/status`          | Effective status, `up` or `down`         |
//! | POST   | `/status`          | Set administrative status (text body)    |
//! | GET    | `/resource`        | All resources with their assignees       |
//! | POST   | `/resource`        | Create a resource (`IFNAME:IPV4` body)   |
//! | DELETE | `/resource/{rid}`  | Tombstone a resource                     |
//! | GET    | `/metrics`         | Prometheus text format                   |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use hover_protocol::controller::ControllerHandle;
use hover_protocol::gossip::Gossiper;
use hover_protocol::platform::Platform;
use hover_protocol::store::KeyStore;
use hover_protocol::value::Status;

use crate::cli::validate_resource;
use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all request handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub gossiper: Arc<Gossiper>,
    pub store: Arc<KeyStore>,
    pub platform: Arc<Platform>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One neighbor in the `GET /info` response.
#[derive(Debug, Serialize)]
pub struct NeighborInfo {
    /// Whether the failure detector currently considers the peer alive.
    pub alive: bool,
    /// The raw phi score; crosses `--dead-at` when the peer goes quiet.
    pub phi: f64,
    /// The peer's gossiped effective status, if it published one yet.
    pub status: Option<&'static str>,
}

/// Response payload for `GET /info`.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub neighborhood: BTreeMap<String, NeighborInfo>,
    pub connectivity: &'static str,
}

/// JSON error body for 4xx responses.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_body(message: impl Into<String>) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: message.into(),
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Builds the admin router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/status", get(get_status_handler).post(post_status_handler))
        .route("/resource", get(list_resources_handler).post(add_resource_handler))
        .route("/resource/{resource_id}", delete(delete_resource_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness only; subsystem state belongs to `/info`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /info` — the whole neighborhood, dead peers included, plus this
/// peer's own connectivity verdict.
async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Instant::now();
    let neighborhood: BTreeMap<String, NeighborInfo> = state
        .gossiper
        .neighborhood(now)
        .into_iter()
        .map(|peer| {
            (
                peer.name,
                NeighborInfo {
                    alive: peer.alive,
                    phi: peer.phi,
                    status: peer.status.map(|s| s.as_str()),
                },
            )
        })
        .collect();

    Json(InfoResponse {
        neighborhood,
        connectivity: state.controller.connectivity().as_str(),
    })
}

/// `GET /status` — the effective status as plain text.
async fn get_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.effective_status().as_str().to_string()
}

/// `POST /status` — set the administrative status. Body is `up` or `down`.
async fn post_status_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match Status::parse(body.trim()) {
        Some(status) => {
            state.controller.set_administrative_status(status);
            StatusCode::OK.into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            error_body(format!("invalid status {:?}: expected \"up\" or \"down\"", body.trim())),
        )
            .into_response(),
    }
}

/// `GET /resource` — every assignable resource, with `assigned_to` present
/// only once the leader has placed it.
async fn list_resources_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.list_resources())
}

/// `POST /resource` — create a resource from an `IFNAME:IPV4` body. The
/// minted id comes back in the body so the caller can delete it later.
async fn add_resource_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let resource = body.trim();
    if let Err(reason) = validate_resource(resource) {
        return (StatusCode::BAD_REQUEST, error_body(reason)).into_response();
    }
    let resource_id = state.controller.add_resource(resource);
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "resource_id": resource_id })),
    )
        .into_response()
}

/// `DELETE /resource/{rid}` — tombstone a resource.
async fn delete_resource_handler(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
) -> impl IntoResponse {
    if state.controller.delete_resource(&resource_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_body(format!("no such resource: {}", resource_id)),
        )
            .into_response()
    }
}

/// `GET /metrics` — refreshes the gauges from live state, then renders.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.metrics;
    metrics.peers_alive.set(state.gossiper.live_peers().len() as i64);
    metrics.peers_dead.set(state.gossiper.dead_peers().len() as i64);
    metrics.resources.set(state.controller.list_resources().len() as i64);
    metrics
        .resources_installed
        .set(state.platform.installed().len() as i64);
    metrics.keystore_writes.set(state.store.write_count() as i64);
    metrics
        .is_leader
        .set(if state.controller.is_leader() == Some(true) { 1 } else { 0 });
    metrics
        .connectivity_up
        .set(if state.controller.connectivity() == Status::Up { 1 } else { 0 });

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NodeMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use hover_protocol::controller::{Controller, ControllerConfig};
    use hover_protocol::gossip::GossipConfig;
    use hover_protocol::platform::NullAddressOps;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let gossiper = Gossiper::new(GossipConfig::new("a:1"), tx);
        let store = KeyStore::new(gossiper.clone(), None);
        let platform = Platform::new(Arc::new(NullAddressOps::new()));
        let controller = ControllerHandle::new(Controller::new(
            gossiper.clone(),
            store.clone(),
            platform.clone(),
            ControllerConfig::default(),
        ));
        // The event pump keeps self-echoes flowing for handlers that write.
        tokio::spawn(controller.clone().run(rx));
        AppState {
            controller,
            gossiper,
            store,
            platform,
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_roundtrip() {
        let app = create_router(test_state());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Administrative and connectivity both start down.
        assert_eq!(body_text(response).await, "down");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/status")
                    .body(Body::from("up"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Still down effectively: connectivity has not come up.
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "down");
    }

    #[tokio::test]
    async fn bad_status_is_rejected() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/status")
                    .body(Body::from("sideways"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("sideways"));
    }

    #[tokio::test]
    async fn resource_lifecycle_over_http() {
        let app = create_router(test_state());

        // Create.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/resource")
                    .body(Body::from("eth0:192.168.1.100"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let resource_id = body["resource_id"].as_str().expect("minted id").to_string();

        // List.
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/resource").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing[resource_id.as_str()]["resource"], "eth0:192.168.1.100");
        // Unassigned: the field is omitted entirely.
        assert!(listing[resource_id.as_str()].get("assigned_to").is_none());

        // Delete.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/resource/{}", resource_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Deleting again is a 404.
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/resource/{}", resource_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_resource_is_rejected() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/resource")
                    .body(Body::from("not-a-resource"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn info_reports_connectivity_and_neighborhood() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["connectivity"], "down");
        assert!(body["neighborhood"].is_object());
    }

    #[tokio::test]
    async fn metrics_render() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("hover_peers_alive"));
        assert!(text.contains("hover_is_leader"));
    }
}
