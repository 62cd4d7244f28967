//! Multi-port switch API: active port, beacons, per-port params, colors,
//! EDID management, unit reboot and ATX forwarding.

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use kvmd_core::ApiError;
use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_switch::types::Color;
use kvmd_validators::{
    valid_atx_button, valid_atx_power_action, valid_bool, valid_int, valid_stripped_string_not_empty,
    valid_switch_atx_click_delay, valid_switch_color, valid_switch_edid_data, valid_switch_edid_id,
    valid_switch_port_name, AtxButton, AtxPowerAction,
};

use super::{require_switch, Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    for (method, path) in [
        (Method::GET, "/switch"),
        (Method::POST, "/switch/set_active"),
        (Method::POST, "/switch/set_active_prev"),
        (Method::POST, "/switch/set_active_next"),
        (Method::POST, "/switch/set_beacon"),
        (Method::POST, "/switch/set_port_params"),
        (Method::POST, "/switch/set_colors"),
        (Method::POST, "/switch/reset"),
        (Method::POST, "/switch/edids/create"),
        (Method::POST, "/switch/edids/change"),
        (Method::POST, "/switch/edids/remove"),
        (Method::POST, "/switch/atx/power"),
        (Method::POST, "/switch/atx/click"),
    ] {
        meta.register(method, path, EndpointMeta::default());
    }
    Router::new()
        .route("/switch", get(state))
        .route("/switch/set_active", post(set_active))
        .route("/switch/set_active_prev", post(set_active_prev))
        .route("/switch/set_active_next", post(set_active_next))
        .route("/switch/set_beacon", post(set_beacon))
        .route("/switch/set_port_params", post(set_port_params))
        .route("/switch/set_colors", post(set_colors))
        .route("/switch/reset", post(reset))
        .route("/switch/edids/create", post(edids_create))
        .route("/switch/edids/change", post(edids_change))
        .route("/switch/edids/remove", post(edids_remove))
        .route("/switch/atx/power", post(atx_power))
        .route("/switch/atx/click", post(atx_click))
}

fn parse_port(params: &std::collections::HashMap<String, String>) -> Result<u32, ApiError> {
    Ok(valid_int(
        params.get("port").map(String::as_str).unwrap_or(""),
        Some(0),
        Some(255),
        "switch port",
    )? as u32)
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    let switch = require_switch(&state)?;
    Ok(json_response(&switch.get_state().await))
}

async fn set_active(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    switch.set_active_port(parse_port(&params)?).await;
    Ok(json_response(&json!({})))
}

async fn set_active_prev(State(state): State<Ctx>) -> ApiResult {
    let switch = require_switch(&state)?;
    switch.set_active_prev().await;
    Ok(json_response(&json!({})))
}

async fn set_active_next(State(state): State<Ctx>) -> ApiResult {
    let switch = require_switch(&state)?;
    switch.set_active_next().await;
    Ok(json_response(&json!({})))
}

async fn set_beacon(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let on = valid_bool(params.get("state").map(String::as_str).unwrap_or(""))?;
    if params.contains_key("port") {
        switch.set_port_beacon(parse_port(&params)?, on).await;
    } else if let Some(raw) = params.get("uplink") {
        let unit = valid_int(raw, Some(0), Some(255), "switch unit")? as u8;
        switch.set_uplink_beacon(unit, on).await;
    } else if let Some(raw) = params.get("downlink") {
        let unit = valid_int(raw, Some(0), Some(255), "switch unit")? as u8;
        switch.set_downlink_beacon(unit, on).await;
    } else {
        return Err(ApiError::Validator("no beacon target given".to_owned()).into());
    }
    Ok(json_response(&json!({})))
}

async fn set_port_params(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let port = parse_port(&params)?;
    let edid_id = match params.get("edid_id") {
        Some(raw) => Some(valid_switch_edid_id(raw, true)?),
        None => None,
    };
    let name = match params.get("name") {
        Some(raw) => Some(valid_switch_port_name(raw)?),
        None => None,
    };
    let parse_delay = |key: &str| -> Result<Option<f64>, ApiError> {
        match params.get(key) {
            Some(raw) => Ok(Some(valid_switch_atx_click_delay(raw)?)),
            None => Ok(None),
        }
    };
    switch
        .set_port_params(
            port,
            edid_id.as_deref(),
            name.as_deref(),
            parse_delay("atx_click_power_delay")?,
            parse_delay("atx_click_power_long_delay")?,
            parse_delay("atx_click_reset_delay")?,
        )
        .await?;
    Ok(json_response(&json!({})))
}

async fn set_colors(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let mut changes: Vec<(&str, Option<Color>)> = Vec::new();
    for role in kvmd_switch::types::Colors::roles() {
        if let Some(raw) = params.get(role) {
            let parsed = valid_switch_color(raw)?
                .map(|(red, green, blue, brightness, blink_ms)| {
                    Color::new(red, green, blue, brightness, blink_ms)
                });
            changes.push((role, parsed));
        }
    }
    switch.set_colors(&changes).await;
    Ok(json_response(&json!({})))
}

async fn reset(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let unit = valid_int(
        params.get("unit").map(String::as_str).unwrap_or(""),
        Some(0),
        Some(255),
        "switch unit",
    )? as u8;
    let bootloader = match params.get("bootloader") {
        Some(raw) => valid_bool(raw)?,
        None => false,
    };
    switch.reboot_unit(unit, bootloader).await;
    Ok(json_response(&json!({})))
}

async fn edids_create(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let name = valid_stripped_string_not_empty(
        params.get("name").map(String::as_str).unwrap_or(""),
        "EDID name",
    )?;
    let data = valid_switch_edid_data(params.get("data").map(String::as_str).unwrap_or(""))?;
    let id = switch.create_edid(&name, &data).await?;
    Ok(json_response(&json!({"id": id})))
}

async fn edids_change(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let id = valid_switch_edid_id(params.get("id").map(String::as_str).unwrap_or(""), false)?;
    let name = match params.get("name") {
        Some(raw) => Some(valid_stripped_string_not_empty(raw, "EDID name")?),
        None => None,
    };
    let data = match params.get("data") {
        Some(raw) => Some(valid_switch_edid_data(raw)?),
        None => None,
    };
    if name.is_some() || data.is_some() {
        switch.change_edid(&id, name.as_deref(), data.as_deref()).await?;
    }
    Ok(json_response(&json!({})))
}

async fn edids_remove(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let id = valid_switch_edid_id(params.get("id").map(String::as_str).unwrap_or(""), false)?;
    switch.remove_edid(&id).await?;
    Ok(json_response(&json!({})))
}

async fn atx_power(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let port = parse_port(&params)?;
    let action = valid_atx_power_action(params.get("action").map(String::as_str).unwrap_or(""))?;
    match action {
        AtxPowerAction::On => switch.atx_power_on(port).await,
        AtxPowerAction::Off => switch.atx_power_off(port).await,
        AtxPowerAction::OffHard => switch.atx_power_off_hard(port).await,
        AtxPowerAction::ResetHard => switch.atx_power_reset_hard(port).await,
    }
    Ok(json_response(&json!({})))
}

async fn atx_click(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let switch = require_switch(&state)?;
    let port = parse_port(&params)?;
    let button = valid_atx_button(params.get("button").map(String::as_str).unwrap_or(""))?;
    match button {
        AtxButton::Power => switch.atx_click_power(port).await,
        AtxButton::PowerLong => switch.atx_click_power_long(port).await,
        AtxButton::Reset => switch.atx_click_reset(port).await,
    }
    Ok(json_response(&json!({})))
}
