//! Login/logout/check. Login is the only public endpoint; `/auth/check`
//! deliberately never accepts unix peer credentials because frontends use
//! it for access control decisions.

use std::collections::HashMap;

use axum::extract::{Form, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use kvmd_core::ApiError;
use kvmd_server::{auth::COOKIE_AUTH_TOKEN, json_response, ApiMeta, ApiResult, EndpointMeta};
use kvmd_validators::{valid_auth_token, valid_expire, valid_passwd, valid_user};

use super::Ctx;

pub fn router(meta: &mut ApiMeta) -> Router<Ctx> {
    meta.register(
        Method::POST,
        "/auth/login",
        EndpointMeta {
            auth_required: false,
            allow_usc: false,
        },
    );
    meta.register(
        Method::POST,
        "/auth/logout",
        EndpointMeta {
            auth_required: true,
            allow_usc: false,
        },
    );
    meta.register(
        Method::GET,
        "/auth/check",
        EndpointMeta {
            auth_required: true,
            allow_usc: false,
        },
    );
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/check", get(check))
}

async fn login(
    State(state): State<Ctx>,
    Form(credentials): Form<HashMap<String, String>>,
) -> ApiResult {
    if !state.auth.is_auth_enabled() {
        return Ok(json_response(&json!({})));
    }
    let user = valid_user(credentials.get("user").map(String::as_str).unwrap_or(""))?;
    let passwd = valid_passwd(credentials.get("passwd").map(String::as_str).unwrap_or(""))?;
    let expire = valid_expire(credentials.get("expire").map(String::as_str).unwrap_or("0"))?;

    match state.auth.login(&user, &passwd, expire).await? {
        Some(token) => {
            let mut response = json_response(&json!({}));
            let cookie = format!("{COOKIE_AUTH_TOKEN}={token}; HttpOnly; SameSite=Strict; Path=/");
            response.headers_mut().insert(
                header::SET_COOKIE,
                HeaderValue::from_str(&cookie).expect("cookie header"),
            );
            Ok(response)
        }
        None => Err(ApiError::Forbidden.into()),
    }
}

async fn logout(State(state): State<Ctx>, request: Request) -> ApiResult {
    if state.auth.is_auth_enabled() {
        let token = kvmd_server::auth::cookie_value(&request, COOKIE_AUTH_TOKEN).unwrap_or_default();
        let token = valid_auth_token(&token)?;
        state.auth.logout(&token);
    }
    Ok(json_response(&json!({})))
}

async fn check() -> Response {
    json_response(&json!({}))
}
