//! Auth pipeline behavior over a minimal router: checker ordering,
//! status codes, and the usc opt-out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use tower::ServiceExt;

use kvmd_auth::{AuthBackend, AuthError, AuthManager};
use kvmd_server::{auth_middleware, ApiMeta, AuthGate, EndpointMeta, PeerCreds};

struct StaticBackend;

#[async_trait::async_trait]
impl AuthBackend for StaticBackend {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        Ok(user == "admin" && passwd == "pass")
    }
}

fn make_router(allow_usc: bool) -> Router {
    let manager = Arc::new(AuthManager::new(
        true,
        Arc::new(StaticBackend),
        None,
        Vec::new(),
        HashMap::from([(1000, "peer".to_owned())]),
    ));
    let mut meta = ApiMeta::default();
    meta.register(
        Method::GET,
        "/protected",
        EndpointMeta {
            auth_required: true,
            allow_usc,
        },
    );
    meta.register(
        Method::GET,
        "/public",
        EndpointMeta {
            auth_required: false,
            allow_usc: false,
        },
    );
    let gate = Arc::new(AuthGate { manager, meta });
    Router::new()
        .route("/protected", get(|| async { "ok" }))
        .route("/public", get(|| async { "ok" }))
        .layer(axum::middleware::from_fn_with_state(gate, auth_middleware))
}

#[tokio::test]
async fn public_endpoint_skips_the_pipeline() {
    let router = make_router(false);
    let response = router
        .oneshot(Request::get("/public").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn no_credentials_is_401() {
    let router = make_router(false);
    let response = router
        .oneshot(Request::get("/protected").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn header_credentials_authenticate() {
    let router = make_router(false);
    let response = router
        .oneshot(
            Request::get("/protected")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "pass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_header_credentials_are_403() {
    let router = make_router(false);
    let response = router
        .oneshot(
            Request::get("/protected")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn basic_auth_authenticates() {
    let router = make_router(false);
    let token = base64::engine::general_purpose::STANDARD.encode("admin:pass");
    let response = router
        .oneshot(
            Request::get("/protected")
                .header("Authorization", format!("Basic {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn peer_credentials_respect_endpoint_opt_out() {
    // With usc allowed, the mapped uid passes.
    let router = make_router(true);
    let mut request = Request::get("/protected").body(Body::empty()).unwrap();
    request.extensions_mut().insert(PeerCreds { uid: 1000 });
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // With usc refused, the same identity is not even consulted.
    let router = make_router(false);
    let mut request = Request::get("/protected").body(Body::empty()).unwrap();
    request.extensions_mut().insert(PeerCreds { uid: 1000 });
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // An unmapped uid falls through to 401 either way.
    let router = make_router(true);
    let mut request = Request::get("/protected").body(Body::empty()).unwrap();
    request.extensions_mut().insert(PeerCreds { uid: 666 });
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
