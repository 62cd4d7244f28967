//! Streamer passthrough: state, snapshot and restart. The streamer
//! itself is an external process.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};

use super::Ctx;

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(Method::GET, "/streamer", EndpointMeta::default());
    meta.register(Method::GET, "/streamer/snapshot", EndpointMeta::default());
    meta.register(Method::POST, "/streamer/reset", EndpointMeta::default());
    Router::new()
        .route("/streamer", get(state))
        .route("/streamer/snapshot", get(snapshot))
        .route("/streamer/reset", post(reset))
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    Ok(json_response(&state.streamer.get_state().await))
}

async fn snapshot(State(state): State<Ctx>) -> ApiResult {
    let frame = state.streamer.snapshot().await?;
    let mut response = Response::new(Body::from(frame));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    Ok(response)
}

async fn reset(State(state): State<Ctx>) -> ApiResult {
    state.streamer.request_restart().await;
    Ok(json_response(&json!({})))
}
