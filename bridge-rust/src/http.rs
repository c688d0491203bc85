//! HTTP status surface over the latest pipeline view.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use marker_types::{Quat, Vec3};

use crate::aligner::{Axis, OffsetTuner, ReferenceFrame, ReferenceTuner};
use crate::error::BindError;
use crate::pipeline::PipelineView;
use crate::rolling_log::RollingLog;
use crate::ticker::wait_for_shutdown;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: true, bind_addr: "0.0.0.0".to_string(), port: 8090 }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub view: watch::Receiver<PipelineView>,
    pub log: Option<RollingLog>,
    pub offsets: OffsetTuner,
    pub reference: ReferenceTuner,
}

/// Partial offset update; absent axes are left alone.
#[derive(Debug, Default, Deserialize)]
pub struct OffsetUpdate {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
}

/// Partial camera frame update; an absent part keeps its current value.
#[derive(Debug, Default, Deserialize)]
pub struct ReferenceUpdate {
    pub position: Option<Vec3>,
    pub orientation: Option<Quat>,
}

async fn health() -> &'static str {
    "marker-bridge ok"
}

async fn markers(State(s): State<AppState>) -> Json<Value> {
    let view = s.view.borrow();
    Json(json!({ "tick": view.tick, "transport": view.transport, "markers": view.markers }))
}

async fn relay(State(s): State<AppState>) -> Json<Value> {
    let view = s.view.borrow();
    Json(json!({ "link": view.relay_link, "markers": view.relay }))
}

async fn calibration(State(s): State<AppState>) -> Json<Value> {
    let view = s.view.borrow();
    Json(json!({ "stream": view.stream_relative, "relay": view.relay_relative }))
}

async fn aligned(State(s): State<AppState>) -> Json<Value> {
    let view = s.view.borrow();
    Json(json!({ "tick": view.tick, "stream": view.aligned.stream, "relay": view.aligned.relay }))
}

async fn log_lines(State(s): State<AppState>) -> Json<Vec<String>> {
    match &s.log {
        Some(log) => Json(log.lines().await),
        None => Json(Vec::new()),
    }
}

async fn set_offsets(State(s): State<AppState>, Json(update): Json<OffsetUpdate>) -> (StatusCode, Json<Value>) {
    let mut changed = false;
    for (axis, value) in [(Axis::X, update.x), (Axis::Y, update.y), (Axis::Z, update.z)] {
        if let Some(v) = value {
            if !v.is_finite() {
                return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": "offsets must be finite" })));
            }
            changed |= s.offsets.set_axis(axis, v);
        }
    }
    (StatusCode::OK, Json(json!({ "offsets": s.offsets.get(), "changed": changed })))
}

async fn set_reference(
    State(s): State<AppState>,
    Json(update): Json<ReferenceUpdate>,
) -> (StatusCode, Json<Value>) {
    let current = s.reference.get();
    let position = update.position.unwrap_or(current.position);
    let orientation = update.orientation.unwrap_or(current.orientation);
    let finite = [position.x, position.y, position.z, orientation.x, orientation.y, orientation.z, orientation.w]
        .iter()
        .all(|c| c.is_finite());
    if !finite {
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": "reference frame must be finite" })));
    }
    let changed = s.reference.set(ReferenceFrame { position, orientation });
    if changed {
        info!("Reference frame moved to ({:.3}, {:.3}, {:.3})", position.x, position.y, position.z);
    }
    (StatusCode::OK, Json(json!({ "reference": s.reference.get(), "changed": changed })))
}

pub fn router(state: AppState) -> Router {
    // CORS — allow all origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/markers", get(markers))
        .route("/relay", get(relay))
        .route("/calibration", get(calibration))
        .route("/aligned", get(aligned))
        .route("/log", get(log_lines))
        .route("/offsets", post(set_offsets))
        .route("/reference", post(set_reference))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(
    config: &HttpConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), crate::error::Error> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BindError { addr: addr.clone(), source })?;
    info!("🚀 Status API listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> (watch::Sender<PipelineView>, AppState) {
        let (tx, view) = watch::channel(PipelineView::default());
        let state = AppState {
            view,
            log: Some(RollingLog::new(3)),
            offsets: OffsetTuner::new(Vec3::ZERO),
            reference: ReferenceTuner::new(ReferenceFrame::default()),
        };
        (tx, state)
    }

    async fn body_json(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_responds() {
        let (_tx, state) = state();
        let res = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn markers_reflect_latest_view() {
        let (tx, state) = state();
        let mut view = PipelineView { tick: 7, ..PipelineView::default() };
        view.markers.insert(3, Vec3::new(1.0, 2.0, 3.0));
        tx.send_replace(view);

        let res = router(state)
            .oneshot(Request::get("/markers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = body_json(res).await;
        assert_eq!(v["tick"], 7);
        assert_eq!(v["markers"]["3"]["y"], 2.0);
    }

    #[tokio::test]
    async fn post_offsets_updates_only_given_axes() {
        let (_tx, state) = state();
        let tuner = state.offsets.clone();
        let mut rx = tuner.subscribe();
        let req = Request::post("/offsets")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"z": 0.5}"#))
            .unwrap();
        let res = router(state).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let v = body_json(res).await;
        assert_eq!(v["changed"], true);
        assert_eq!(tuner.get(), Vec3::new(0.0, 0.0, 0.5));
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn post_reference_moves_the_frame() {
        let (_tx, state) = state();
        let reference = state.reference.clone();
        let mut rx = reference.subscribe();
        let req = Request::post("/reference")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"position": {"x": 0.0, "y": 1.5, "z": -2.0}}"#))
            .unwrap();
        let res = router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["changed"], true);
        assert_eq!(reference.get().position, Vec3::new(0.0, 1.5, -2.0));
        assert_eq!(reference.get().orientation, Quat::IDENTITY);
        assert!(rx.has_changed().unwrap());

        // Orientation arrives normalized
        let req = Request::post("/reference")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"orientation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 2.0}}"#))
            .unwrap();
        let res = router(state).oneshot(req).await.unwrap();
        let v = body_json(res).await;
        assert_eq!(v["changed"], false);
        assert_eq!(v["reference"]["orientation"]["w"], 1.0);
    }

    #[tokio::test]
    async fn post_reference_rejects_malformed_frame() {
        let (_tx, state) = state();
        let req = Request::post("/reference")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"position": {"x": "up"}}"#))
            .unwrap();
        let res = router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.reference.get(), ReferenceFrame::default());
    }

    #[tokio::test]
    async fn log_lines_are_served() {
        let (_tx, state) = state();
        if let Some(log) = &state.log {
            log.push("Connected as test").await;
        }
        let res = router(state)
            .oneshot(Request::get("/log").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(res).await, json!(["Connected as test"]));
    }
}
