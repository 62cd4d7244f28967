//! Request authentication pipeline. Four checkers run in declaration
//! order; "indeterminate" falls through, an explicit denial stops the
//! request with 403, and running out of checkers yields 401.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;

use kvmd_auth::AuthManager;
use kvmd_core::ApiError;
use kvmd_validators::{valid_auth_token, valid_passwd, valid_user};

use crate::response::json_error;

pub const COOKIE_AUTH_TOKEN: &str = "auth_token";
pub const HEADER_USER: &str = "X-KVMD-User";
pub const HEADER_PASSWD: &str = "X-KVMD-Passwd";

/// Peer credentials captured at accept time from the unix socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerCreds {
    pub uid: u32,
}

/// Authenticated identity, stored in request extensions for handlers and
/// the access log.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub user: String,
    pub method: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointMeta {
    pub auth_required: bool,
    pub allow_usc: bool,
}

impl Default for EndpointMeta {
    fn default() -> Self {
        Self {
            auth_required: true,
            allow_usc: true,
        }
    }
}

/// Exact-match endpoint metadata table; every path in this API is static.
#[derive(Default)]
pub struct ApiMeta {
    map: HashMap<(Method, String), EndpointMeta>,
}

impl ApiMeta {
    pub fn register(&mut self, method: Method, path: &str, meta: EndpointMeta) {
        self.map.insert((method, path.to_owned()), meta);
    }

    pub fn lookup(&self, method: &Method, path: &str) -> EndpointMeta {
        self.map
            .get(&(method.clone(), path.to_owned()))
            .copied()
            .unwrap_or_default()
    }
}

pub struct AuthGate {
    pub manager: Arc<AuthManager>,
    pub meta: ApiMeta,
}

enum Checked {
    /// This checker does not apply to the request.
    Indeterminate,
    Authenticated(AuthInfo),
    Denied,
}

pub async fn auth_middleware(
    axum::extract::State(gate): axum::extract::State<Arc<AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let meta = gate.meta.lookup(request.method(), request.uri().path());
    if !meta.auth_required || !gate.manager.is_auth_enabled() {
        return next.run(request).await;
    }

    match run_checkers(&gate, &meta, &request).await {
        Ok(Checked::Authenticated(info)) => {
            request.extensions_mut().insert(info);
            next.run(request).await
        }
        Ok(Checked::Denied) => json_error(&ApiError::Forbidden),
        Ok(Checked::Indeterminate) => json_error(&ApiError::Unauthorized),
        Err(err) => json_error(&err),
    }
}

async fn run_checkers(
    gate: &AuthGate,
    meta: &EndpointMeta,
    request: &Request,
) -> Result<Checked, ApiError> {
    match check_xhdr(gate, meta, request).await? {
        Checked::Indeterminate => {}
        decided => return Ok(decided),
    }
    match check_token(gate, meta, request).await? {
        Checked::Indeterminate => {}
        decided => return Ok(decided),
    }
    match check_basic(gate, meta, request).await? {
        Checked::Indeterminate => {}
        decided => return Ok(decided),
    }
    match check_usc(gate, meta, request).await? {
        Checked::Indeterminate => {}
        decided => return Ok(decided),
    }
    Ok(Checked::Indeterminate)
}

async fn check_xhdr(gate: &AuthGate, _meta: &EndpointMeta, request: &Request) -> Result<Checked, ApiError> {
    let Some(user) = header_str(request, HEADER_USER) else {
        return Ok(Checked::Indeterminate);
    };
    if user.is_empty() {
        return Ok(Checked::Indeterminate);
    }
    let user = valid_user(user)?;
    let passwd = valid_passwd(header_str(request, HEADER_PASSWD).unwrap_or(""))?;
    if gate.manager.authorize(&user, &passwd).await? {
        Ok(Checked::Authenticated(AuthInfo { user, method: "xhdr" }))
    } else {
        Ok(Checked::Denied)
    }
}

async fn check_token(gate: &AuthGate, _meta: &EndpointMeta, request: &Request) -> Result<Checked, ApiError> {
    let Some(token) = cookie_value(request, COOKIE_AUTH_TOKEN) else {
        return Ok(Checked::Indeterminate);
    };
    let token = valid_auth_token(&token)?;
    match gate.manager.check_token(&token) {
        Some(user) => Ok(Checked::Authenticated(AuthInfo { user, method: "token" })),
        // A dead token is treated like no token at all: the request may
        // still carry other usable credentials, and a logged-out client
        // should land on 401, not 403.
        None => Ok(Checked::Indeterminate),
    }
}

async fn check_basic(gate: &AuthGate, _meta: &EndpointMeta, request: &Request) -> Result<Checked, ApiError> {
    let Some(raw) = header_str(request, "Authorization") else {
        return Ok(Checked::Indeterminate);
    };
    let Some(encoded) = raw.strip_prefix("Basic ").or_else(|| raw.strip_prefix("basic ")) else {
        return Ok(Checked::Indeterminate);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;
    let (user, passwd) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;
    let user = valid_user(user)?;
    let passwd = valid_passwd(passwd)?;
    if gate.manager.authorize(&user, &passwd).await? {
        Ok(Checked::Authenticated(AuthInfo { user, method: "basic" }))
    } else {
        Ok(Checked::Denied)
    }
}

async fn check_usc(gate: &AuthGate, meta: &EndpointMeta, request: &Request) -> Result<Checked, ApiError> {
    if !meta.allow_usc {
        return Ok(Checked::Indeterminate);
    }
    let Some(creds) = request.extensions().get::<PeerCreds>() else {
        return Ok(Checked::Indeterminate);
    };
    match gate.manager.check_unix_credentials(creds.uid) {
        Some(user) => Ok(Checked::Authenticated(AuthInfo { user, method: "unix" })),
        None => Ok(Checked::Indeterminate),
    }
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|value| value.to_str().ok())
}

pub fn cookie_value(request: &Request, name: &str) -> Option<String> {
    let header = request.headers().get("Cookie")?.to_str().ok()?;
    for pair in header.split(';') {
        if let Some((key, value)) = pair.trim().split_once('=') {
            if key == name {
                return Some(value.to_owned());
            }
        }
    }
    None
}
