//! API surface tests over the real router with an htpasswd-backed auth
//! manager. Hardware-owning workers are constructed but never started.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use kvmd::api::AppState;
use kvmd::config::StreamerSection;
use kvmd::logring::LogRing;
use kvmd::server::build_router;
use kvmd::streamer::Streamer;
use kvmd_auth::{AuthManager, HtpasswdBackend};
use kvmd_core::Notifier;
use kvmd_server::{WsDispatcher, WsRegistry};

struct Fixture {
    _dir: tempfile::TempDir,
    router: Router,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let htpasswd = dir.path().join("htpasswd");
    std::fs::write(&htpasswd, "admin:adminpass\n").unwrap();

    let storage = dir.path().join("storage");
    std::fs::create_dir_all(&storage).unwrap();

    let auth = Arc::new(AuthManager::new(
        true,
        Arc::new(HtpasswdBackend::new(htpasswd)),
        None,
        vec!["admin".to_owned()],
        HashMap::new(),
    ));

    let hid_notifier = Arc::new(Notifier::new());
    let hid = Arc::new(kvmd_hid::Hid::new(
        kvmd_hid::FrontConfig::default(),
        Arc::new(kvmd_hid::otg::OtgHid::new(
            kvmd_hid::otg::OtgConfig {
                udc_state_path: dir.path().join("udc-state"),
                keyboard: kvmd_hid::otg::EndpointConfig::default(),
                mouse: kvmd_hid::otg::EndpointConfig::default(),
                mouse_absolute: true,
                mouse_win98_fix: false,
                mouse_horizontal_wheel: true,
                mouse_alt: None,
                mouse_alt_horizontal_wheel: true,
            },
            hid_notifier.clone(),
        )),
        hid_notifier,
    ));

    let msd = Arc::new(kvmd_msd::Msd::new(
        kvmd_msd::MsdConfig {
            storage_root: storage,
            gadget_path: dir.path().join("gadget"),
            remount_cmd: Vec::new(),
            ..Default::default()
        },
        Arc::new(Notifier::new()),
    ));

    let atx = Arc::new(
        kvmd_gpio::Atx::new(kvmd_gpio::AtxConfig::default(), Arc::new(Notifier::new())).unwrap(),
    );
    let ugpio = Arc::new(
        kvmd_gpio::UserGpio::new(BTreeMap::new(), Vec::new(), Arc::new(Notifier::new())).unwrap(),
    );
    let streamer = Streamer::new(
        StreamerSection {
            cmd: Vec::new(),
            unix_path: dir.path().join("streamer.sock"),
            shutdown_delay: Duration::from_secs(1),
        },
        Arc::new(Notifier::new()),
    );

    let state = Arc::new(AppState {
        auth,
        hid,
        msd,
        switch: None,
        atx,
        ugpio,
        streamer,
        logring: LogRing::new(),
        ws: Arc::new(WsRegistry::new(Duration::from_secs(15))),
        info_fields: vec!["auth", "kvm", "system"],
    });

    let mut dispatcher = WsDispatcher::default();
    kvmd::api::hid::register_ws(&mut dispatcher, state.clone());
    Fixture {
        _dir: dir,
        router: build_router(state, Arc::new(dispatcher)),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn login_round_trip() {
    let fx = fixture();

    // Wrong password: 403.
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::post("/auth/login")
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(Body::from("user=admin&passwd=wrong"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Correct: 200 + a 64-hex auth_token cookie.
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::post("/auth/login")
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(Body::from("user=admin&passwd=adminpass"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(cookie.starts_with("auth_token="));
    let token: String = cookie
        .trim_start_matches("auth_token=")
        .chars()
        .take_while(|ch| ch.is_ascii_hexdigit())
        .collect();
    assert_eq!(token.len(), 64);

    // The cookie authenticates /auth/check.
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("/auth/check")
                .header("Cookie", format!("auth_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Logout kills the token; the next check with the dead cookie is 401.
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::post("/auth/logout")
                .header("Cookie", format!("auth_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("/auth/check")
                .header("Cookie", format!("auth_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // And with no cookie at all: 401.
    let response = fx
        .router
        .clone()
        .oneshot(Request::get("/auth/check").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn validator_errors_are_400_with_envelope() {
    let fx = fixture();
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::post("/hid/events/send_key?key=NoSuchKey")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "adminpass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = body_json(response).await;
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["result"]["error"], "Validator");
}

#[tokio::test]
async fn hid_state_is_served() {
    let fx = fixture();
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("/hid")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "adminpass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["result"]["enabled"], true);
    assert!(payload["result"]["keyboard"].is_object());
    assert!(payload["result"]["jiggler"].is_object());
}

#[tokio::test]
async fn paths_are_normalized() {
    let fx = fixture();
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("//hid/")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "adminpass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_switch_is_an_operation_error() {
    let fx = fixture();
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("/switch")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "adminpass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = body_json(response).await;
    assert_eq!(payload["result"]["error"], "Operation");
}

#[tokio::test]
async fn redfish_root_is_reachable() {
    let fx = fixture();
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::get("/redfish/v1")
                .header("X-KVMD-User", "admin")
                .header("X-KVMD-Passwd", "adminpass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["RedfishVersion"], "1.6.0");
}
