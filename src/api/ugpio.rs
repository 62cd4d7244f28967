//! User GPIO: model/state plus switch and pulse verbs.

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{valid_bool, valid_float, valid_stripped_string_not_empty};

use super::{Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(Method::GET, "/gpio", EndpointMeta::default());
    meta.register(Method::POST, "/gpio/switch", EndpointMeta::default());
    meta.register(Method::POST, "/gpio/pulse", EndpointMeta::default());
    Router::new()
        .route("/gpio", get(state))
        .route("/gpio/switch", post(switch))
        .route("/gpio/pulse", post(pulse))
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    Ok(json_response(&json!({
        "model": state.ugpio.get_model(),
        "state": state.ugpio.get_state().await,
    })))
}

async fn switch(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let channel = valid_stripped_string_not_empty(
        params.get("channel").map(String::as_str).unwrap_or(""),
        "GPIO channel",
    )?;
    let wanted = valid_bool(params.get("state").map(String::as_str).unwrap_or(""))?;
    let wait = match params.get("wait") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    state.ugpio.switch(&channel, wanted, wait).await?;
    Ok(json_response(&json!({})))
}

async fn pulse(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let channel = valid_stripped_string_not_empty(
        params.get("channel").map(String::as_str).unwrap_or(""),
        "GPIO channel",
    )?;
    let delay = match params.get("delay") {
        Some(raw) => Some(valid_float(raw, Some(0.0), Some(60.0), "pulse delay")?),
        None => None,
    };
    let wait = match params.get("wait") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    state.ugpio.pulse(&channel, delay, wait).await?;
    Ok(json_response(&json!({})))
}
