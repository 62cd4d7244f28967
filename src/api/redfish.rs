//! Minimal Redfish power adapter: enough of the Systems tree for BMC
//! tooling to flip power through the ATX component.

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use kvmd_core::ApiError;
use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{AtxButton, AtxPowerAction};

use super::Ctx;

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    for (method, path) in [
        (Method::GET, "/redfish/v1"),
        (Method::GET, "/redfish/v1/Systems"),
        (Method::GET, "/redfish/v1/Systems/0"),
        (Method::POST, "/redfish/v1/Systems/0/Actions/ComputerSystem.Reset"),
    ] {
        meta.register(method, path, EndpointMeta::default());
    }
    Router::new()
        .route("/redfish/v1", get(service_root))
        .route("/redfish/v1/Systems", get(systems))
        .route("/redfish/v1/Systems/0", get(system))
        .route(
            "/redfish/v1/Systems/0/Actions/ComputerSystem.Reset",
            post(system_reset),
        )
}

async fn service_root() -> axum::response::Response {
    raw_json(&json!({
        "@odata.id": "/redfish/v1",
        "@odata.type": "#ServiceRoot.v1_6_0.ServiceRoot",
        "Id": "RootService",
        "Name": "KVMD",
        "RedfishVersion": "1.6.0",
        "Systems": {"@odata.id": "/redfish/v1/Systems"},
    }))
}

async fn systems() -> axum::response::Response {
    raw_json(&json!({
        "@odata.id": "/redfish/v1/Systems",
        "@odata.type": "#ComputerSystemCollection.ComputerSystemCollection",
        "Members": [{"@odata.id": "/redfish/v1/Systems/0"}],
        "Members@odata.count": 1,
        "Name": "Computer System Collection",
    }))
}

async fn system(State(state): State<Ctx>) -> axum::response::Response {
    let powered = state.atx.get_state().leds.power;
    raw_json(&json!({
        "@odata.id": "/redfish/v1/Systems/0",
        "@odata.type": "#ComputerSystem.v1_10_0.ComputerSystem",
        "Id": "0",
        "Name": "Managed Host",
        "PowerState": if powered { "On" } else { "Off" },
        "Actions": {
            "#ComputerSystem.Reset": {
                "target": "/redfish/v1/Systems/0/Actions/ComputerSystem.Reset",
                "ResetType@Redfish.AllowableValues": [
                    "On", "ForceOff", "GracefulShutdown", "ForceRestart", "PushPowerButton",
                ],
            },
        },
    }))
}

async fn system_reset(State(state): State<Ctx>, body: String) -> ApiResult {
    let payload: Value = serde_json::from_str(&body)
        .map_err(|_| ApiError::Validator("bad Redfish payload".to_owned()))?;
    let reset_type = payload["ResetType"].as_str().unwrap_or("");
    match reset_type {
        "On" => state.atx.power(AtxPowerAction::On, false).await?,
        "ForceOff" => state.atx.power(AtxPowerAction::OffHard, false).await?,
        "GracefulShutdown" => state.atx.power(AtxPowerAction::Off, false).await?,
        "ForceRestart" => state.atx.power(AtxPowerAction::ResetHard, false).await?,
        "PushPowerButton" => state.atx.click(AtxButton::Power, false).await?,
        other => {
            return Err(ApiError::Validator(format!("unknown ResetType {other:?}")).into());
        }
    }
    Ok(json_response(&json!({})))
}

fn raw_json(payload: &Value) -> axum::response::Response {
    use axum::response::IntoResponse;
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        payload.to_string(),
    )
        .into_response()
}
