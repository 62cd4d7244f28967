//! `GET /info?fields=...` — selected subtrees of daemon metadata.

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use kvmd_server::{json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::valid_info_fields;

use super::{Ctx, Params};

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(Method::GET, "/info", EndpointMeta::default());
    Router::new().route("/info", get(info))
}

async fn info(axum::extract::State(state): axum::extract::State<Ctx>, Params(params): Params) -> ApiResult {
    let fields = match params.get("fields") {
        Some(raw) => valid_info_fields(raw, &state.info_fields)?,
        None => state.info_fields.iter().map(|&field| field.to_owned()).collect(),
    };

    let mut result = serde_json::Map::new();
    for field in fields {
        let value = match field.as_str() {
            "auth" => json!({"enabled": state.auth.is_auth_enabled()}),
            "kvm" => json!({
                "streamer": state.streamer.get_state().await,
                "switch": state.switch.is_some(),
            }),
            "system" => json!({
                "app": "kvmd",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": std::env::consts::OS,
            }),
            _ => continue,
        };
        result.insert(field, value);
    }
    Ok(json_response(&result))
}
