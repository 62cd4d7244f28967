//! HID control: state, params, reset, per-event HTTP injectors, keymaps,
//! the text printer, and the WS event handlers (text and binary).

use std::sync::Arc;

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta, WsDispatcher, WsSession};
use kvmd_validators::{
    valid_bool, valid_hid_key, valid_hid_keyboard_output, valid_hid_mouse_button,
    valid_hid_mouse_delta, valid_hid_mouse_move, valid_hid_mouse_output, valid_int,
};

use super::{Ctx, Params};
use crate::printer::text_to_key_events;

pub const KEYMAP_NAME: &str = "en-us";

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    for (method, path) in [
        (Method::GET, "/hid"),
        (Method::POST, "/hid/set_params"),
        (Method::POST, "/hid/set_connected"),
        (Method::POST, "/hid/reset"),
        (Method::GET, "/hid/keymaps"),
        (Method::POST, "/hid/print"),
        (Method::POST, "/hid/events/send_key"),
        (Method::POST, "/hid/events/send_mouse_button"),
        (Method::POST, "/hid/events/send_mouse_move"),
        (Method::POST, "/hid/events/send_mouse_relative"),
        (Method::POST, "/hid/events/send_mouse_wheel"),
    ] {
        meta.register(method, path, EndpointMeta::default());
    }
    Router::new()
        .route("/hid", get(state))
        .route("/hid/set_params", post(set_params))
        .route("/hid/set_connected", post(set_connected))
        .route("/hid/reset", post(reset))
        .route("/hid/keymaps", get(keymaps))
        .route("/hid/print", post(print))
        .route("/hid/events/send_key", post(send_key))
        .route("/hid/events/send_mouse_button", post(send_mouse_button))
        .route("/hid/events/send_mouse_move", post(send_mouse_move))
        .route("/hid/events/send_mouse_relative", post(send_mouse_relative))
        .route("/hid/events/send_mouse_wheel", post(send_mouse_wheel))
}

async fn state(State(state): State<Ctx>) -> ApiResult {
    Ok(json_response(&state.hid.get_state()))
}

async fn set_params(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let keyboard_output = match params.get("keyboard_output") {
        Some(raw) => Some(valid_hid_keyboard_output(raw)?),
        None => None,
    };
    let mouse_output = match params.get("mouse_output") {
        Some(raw) => Some(valid_hid_mouse_output(raw)?),
        None => None,
    };
    let jiggler = match params.get("jiggler") {
        Some(raw) => Some(valid_bool(raw)?),
        None => None,
    };
    state
        .hid
        .set_params(keyboard_output.as_deref(), mouse_output.as_deref(), jiggler);
    Ok(json_response(&json!({})))
}

async fn set_connected(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let connected = valid_bool(params.get("connected").map(String::as_str).unwrap_or(""))?;
    state.hid.set_connected(connected);
    Ok(json_response(&json!({})))
}

async fn reset(State(state): State<Ctx>) -> ApiResult {
    state.hid.reset().await;
    Ok(json_response(&json!({})))
}

async fn keymaps(State(_state): State<Ctx>) -> ApiResult {
    Ok(json_response(&json!({
        "keymaps": {
            "default": KEYMAP_NAME,
            "available": [KEYMAP_NAME],
        },
    })))
}

async fn print(State(state): State<Ctx>, Params(params): Params, body: String) -> ApiResult {
    let limit = match params.get("limit") {
        Some(raw) => valid_int(raw, Some(0), None, "limit")? as usize,
        None => 1024,
    };
    if let Some(keymap) = params.get("keymap") {
        if keymap != KEYMAP_NAME {
            return Err(kvmd_core::ApiError::Validator(format!(
                "unknown keymap {keymap:?}"
            ))
            .into());
        }
    }
    let text: String = if limit > 0 {
        body.chars().take(limit).collect()
    } else {
        body
    };
    state.hid.send_key_events_slow(text_to_key_events(&text)).await;
    Ok(json_response(&json!({})))
}

async fn send_key(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let key = valid_hid_key(params.get("key").map(String::as_str).unwrap_or(""))?;
    match params.get("state") {
        Some(raw) => {
            let pressed = valid_bool(raw)?;
            state.hid.send_key_events([(key, pressed)]);
        }
        None => state.hid.send_key_click(key),
    }
    Ok(json_response(&json!({})))
}

async fn send_mouse_button(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let button = valid_hid_mouse_button(params.get("button").map(String::as_str).unwrap_or(""))?;
    match params.get("state") {
        Some(raw) => {
            let pressed = valid_bool(raw)?;
            state.hid.send_mouse_button_event(button, pressed);
        }
        None => {
            state.hid.send_mouse_button_event(button, true);
            state.hid.send_mouse_button_event(button, false);
        }
    }
    Ok(json_response(&json!({})))
}

async fn send_mouse_move(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let to_x = valid_hid_mouse_move(params.get("to_x").map(String::as_str).unwrap_or(""))?;
    let to_y = valid_hid_mouse_move(params.get("to_y").map(String::as_str).unwrap_or(""))?;
    state.hid.send_mouse_move_event(to_x, to_y);
    Ok(json_response(&json!({})))
}

async fn send_mouse_relative(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let (dx, dy) = parse_delta(&params)?;
    state.hid.send_mouse_relative_event(dx, dy);
    Ok(json_response(&json!({})))
}

async fn send_mouse_wheel(State(state): State<Ctx>, Params(params): Params) -> ApiResult {
    let (dx, dy) = parse_delta(&params)?;
    state.hid.send_mouse_wheel_event(dx, dy);
    Ok(json_response(&json!({})))
}

fn parse_delta(
    params: &std::collections::HashMap<String, String>,
) -> Result<(i8, i8), kvmd_validators::ValidatorError> {
    let dx = valid_hid_mouse_delta(params.get("delta_x").map(String::as_str).unwrap_or(""))?;
    let dy = valid_hid_mouse_delta(params.get("delta_y").map(String::as_str).unwrap_or(""))?;
    Ok((dx, dy))
}

// ===== WS handlers. Bad frames are dropped silently: the event stream is
// too hot to answer each mistake individually.

pub fn register_ws(dispatcher: &mut WsDispatcher, state: Ctx) {
    // Binary opcode 1: key — `state:u8 | web name`.
    {
        let state = state.clone();
        dispatcher.on_binary(1, move |_ws: Arc<WsSession>, payload: Vec<u8>| {
            let state = state.clone();
            async move {
                let Some((&pressed, name)) = payload.split_first() else {
                    return;
                };
                let Ok(name) = std::str::from_utf8(name) else {
                    return;
                };
                if let Ok(key) = valid_hid_key(name) {
                    state.hid.send_key_events([(key, pressed != 0)]);
                }
            }
        });
    }
    // Opcode 2: mouse button — `state:u8 | button name`.
    {
        let state = state.clone();
        dispatcher.on_binary(2, move |_ws, payload| {
            let state = state.clone();
            async move {
                let Some((&pressed, name)) = payload.split_first() else {
                    return;
                };
                let Ok(name) = std::str::from_utf8(name) else {
                    return;
                };
                if let Ok(button) = valid_hid_mouse_button(name) {
                    state.hid.send_mouse_button_event(button, pressed != 0);
                }
            }
        });
    }
    // Opcode 3: absolute move — `x:i16be | y:i16be`.
    {
        let state = state.clone();
        dispatcher.on_binary(3, move |_ws, payload| {
            let state = state.clone();
            async move {
                if payload.len() != 4 {
                    return;
                }
                let to_x = i16::from_be_bytes([payload[0], payload[1]]);
                let to_y = i16::from_be_bytes([payload[2], payload[3]]);
                state.hid.send_mouse_move_event(to_x, to_y);
            }
        });
    }
    // Opcodes 4/5: relative and wheel — `squash:u8 | (dx:i8 dy:i8)...`.
    for (opcode, wheel) in [(4u8, false), (5u8, true)] {
        let state = state.clone();
        dispatcher.on_binary(opcode, move |_ws, payload| {
            let state = state.clone();
            async move {
                let Some((&squash, raw)) = payload.split_first() else {
                    return;
                };
                if raw.len() % 2 != 0 {
                    return;
                }
                let deltas: Vec<(i8, i8)> = raw
                    .chunks(2)
                    .map(|pair| {
                        (
                            (pair[0] as i8).clamp(-127, 127),
                            (pair[1] as i8).clamp(-127, 127),
                        )
                    })
                    .collect();
                state.hid.send_mouse_delta_events(&deltas, squash != 0, |hid, dx, dy| {
                    if wheel {
                        hid.send_mouse_wheel_event(dx, dy);
                    } else {
                        hid.send_mouse_relative_event(dx, dy);
                    }
                });
            }
        });
    }

    // Text twins of the binary opcodes.
    {
        let state = state.clone();
        dispatcher.on_text("key", move |_ws, event| {
            let state = state.clone();
            async move {
                let (Some(name), Some(pressed)) =
                    (event["key"].as_str(), event["state"].as_bool())
                else {
                    return;
                };
                if let Ok(key) = valid_hid_key(name) {
                    state.hid.send_key_events([(key, pressed)]);
                }
            }
        });
    }
    {
        let state = state.clone();
        dispatcher.on_text("mouse_button", move |_ws, event| {
            let state = state.clone();
            async move {
                let (Some(name), Some(pressed)) =
                    (event["button"].as_str(), event["state"].as_bool())
                else {
                    return;
                };
                if let Ok(button) = valid_hid_mouse_button(name) {
                    state.hid.send_mouse_button_event(button, pressed);
                }
            }
        });
    }
    {
        let state = state.clone();
        dispatcher.on_text("mouse_move", move |_ws, event| {
            let state = state.clone();
            async move {
                let (Some(to_x), Some(to_y)) =
                    (event["to"]["x"].as_i64(), event["to"]["y"].as_i64())
                else {
                    return;
                };
                let to_x = to_x.clamp(-32768, 32767) as i16;
                let to_y = to_y.clamp(-32768, 32767) as i16;
                state.hid.send_mouse_move_event(to_x, to_y);
            }
        });
    }
    for (event_type, wheel) in [("mouse_relative", false), ("mouse_wheel", true)] {
        let state = state.clone();
        dispatcher.on_text(event_type, move |_ws, event| {
            let state = state.clone();
            async move {
                let squash = event["squash"].as_bool().unwrap_or(false);
                let deltas = match parse_text_deltas(&event["delta"]) {
                    Some(deltas) => deltas,
                    None => return,
                };
                state.hid.send_mouse_delta_events(&deltas, squash, |hid, dx, dy| {
                    if wheel {
                        hid.send_mouse_wheel_event(dx, dy);
                    } else {
                        hid.send_mouse_relative_event(dx, dy);
                    }
                });
            }
        });
    }
}

fn parse_text_deltas(raw: &Value) -> Option<Vec<(i8, i8)>> {
    let items: Vec<&Value> = match raw {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![raw],
        _ => return None,
    };
    let mut deltas = Vec::with_capacity(items.len());
    for item in items {
        let dx = item["x"].as_i64()?.clamp(-127, 127) as i8;
        let dy = item["y"].as_i64()?.clamp(-127, 127) as i8;
        deltas.push((dx, dy));
    }
    Some(deltas)
}
