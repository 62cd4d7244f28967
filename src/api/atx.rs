//! ATX power control over the GPIO driver.

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{valid_atx_button, valid_atx_power_action, valid_bool};

use super::{Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(Method::GET, "/atx", EndpointMeta::default());
    meta.register(Method::POST, "/atx/power", EndpointMeta::default());
    meta.register(Method::POST, "/atx/click", EndpointMeta::default());
    Router::new()
        .route("/atx", get(state))
        .route("/atx/power", post(power))
        .route("/atx/click", post(click))
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    Ok(json_response(&state.atx.get_state()))
}

async fn power(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let action = valid_atx_power_action(params.get("action").map(String::as_str).unwrap_or(""))?;
    let wait = match params.get("wait") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    state.atx.power(action, wait).await?;
    Ok(json_response(&json!({})))
}

async fn click(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let button = valid_atx_button(params.get("button").map(String::as_str).unwrap_or(""))?;
    let wait = match params.get("wait") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    state.atx.click(button, wait).await?;
    Ok(json_response(&json!({})))
}
