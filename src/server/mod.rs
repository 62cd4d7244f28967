//! Daemon assembly: component construction, the WS event fan-out, the
//! supervised system tasks and shutdown ordering.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::Method;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use kvmd_auth::{AuthManager, HtpasswdBackend};
use kvmd_core::Notifier;
use kvmd_gpio::{Atx, GpioChardevDriver, UserGpio};
use kvmd_hid::{Hid, HidBackend};
use kvmd_msd::Msd;
use kvmd_server::{
    auth_middleware, ApiMeta, AuthGate, EndpointMeta, ServerConfig, WsDispatcher, WsRegistry,
};
use kvmd_switch::storage::{NullPersistentStorage, PersistentStorage};
use kvmd_switch::Switch;

use crate::api::{self, AppState};
use crate::config::{HidBackendKind, KvmdConfig};
use crate::logring::LogRing;
use crate::pststore::PstStore;
use crate::streamer::Streamer;

pub async fn run(config: KvmdConfig, logring: Arc<LogRing>) -> anyhow::Result<()> {
    // ===== Components.

    let hid_notifier = Arc::new(Notifier::new());
    let backend: Arc<dyn HidBackend> = match config.hid.kind {
        HidBackendKind::Otg => Arc::new(kvmd_hid::otg::OtgHid::new(
            config.hid.otg.clone(),
            hid_notifier.clone(),
        )),
        HidBackendKind::McuSerial => Arc::new(kvmd_hid::mcu::McuHid::new(
            config.hid.mcu.clone(),
            Box::new(kvmd_hid::mcu::SerialPhy::new(config.hid.mcu_serial.clone())),
            hid_notifier.clone(),
        )),
        HidBackendKind::McuSpi => Arc::new(kvmd_hid::mcu::McuHid::new(
            config.hid.mcu.clone(),
            Box::new(kvmd_hid::mcu::SpiPhy::new(config.hid.mcu_spi.clone())),
            hid_notifier.clone(),
        )),
        HidBackendKind::Bt => Arc::new(kvmd_hid::bt::BtHid::new(
            config.hid.bt.clone(),
            hid_notifier.clone(),
        )),
        HidBackendKind::Ch9329 => Arc::new(kvmd_hid::ch9329::Ch9329Hid::new(
            config.hid.ch9329.clone(),
            hid_notifier.clone(),
        )),
    };
    let hid = Arc::new(Hid::new(config.hid.front.clone(), backend, hid_notifier));

    let msd = Arc::new(Msd::new(config.msd.config.clone(), Arc::new(Notifier::new())));

    let switch = config.switch.as_ref().map(|section| {
        let storage: Arc<dyn PersistentStorage> = match &section.pst_unix {
            Some(unix_path) => PstStore::new(unix_path.clone()),
            None => Arc::new(NullPersistentStorage),
        };
        Arc::new(Switch::new(section.config.clone(), storage))
    });

    let atx = Arc::new(Atx::new(config.atx.config.clone(), Arc::new(Notifier::new()))?);

    let gpio_notifier = Arc::new(Notifier::new());
    let mut gpio_drivers: BTreeMap<String, Arc<dyn kvmd_gpio::drivers::UserGpioDriver>> =
        BTreeMap::new();
    gpio_drivers.insert(
        "gpio".to_owned(),
        Arc::new(GpioChardevDriver::new(
            config.gpio.device_path.clone(),
            gpio_notifier.clone(),
        )),
    );
    let ugpio = Arc::new(UserGpio::new(
        gpio_drivers,
        config.gpio.channels.clone(),
        gpio_notifier,
    )?);

    let streamer = Streamer::new(config.streamer.clone(), Arc::new(Notifier::new()));

    let external: Option<Arc<dyn kvmd_auth::AuthBackend>> = match &config.auth.external {
        Some(crate::config::ExternalAuth::Ldap(ldap)) => {
            Some(Arc::new(kvmd_auth::LdapBackend::new(ldap.clone())))
        }
        Some(crate::config::ExternalAuth::Radius(radius)) => {
            Some(Arc::new(kvmd_auth::RadiusBackend::new(radius.clone())))
        }
        Some(crate::config::ExternalAuth::Http(http)) => {
            Some(Arc::new(kvmd_auth::HttpBackend::new(http.clone())))
        }
        None => None,
    };
    let auth = Arc::new(AuthManager::new(
        config.auth.enabled,
        Arc::new(HtpasswdBackend::new(config.auth.htpasswd_path.clone())),
        external,
        config.auth.force_internal_users.clone(),
        config.auth.unix_uid_map.clone(),
    ));

    // ===== Hardware claim.

    hid.sysprep();
    atx.sysprep()?;
    ugpio.sysprep()?;
    if let Some(switch) = &switch {
        switch.trigger_state().await;
    }

    // ===== HTTP surface.

    let ws = Arc::new(WsRegistry::new(config.server.heartbeat));
    let state = Arc::new(AppState {
        auth: auth.clone(),
        hid: hid.clone(),
        msd: msd.clone(),
        switch: switch.clone(),
        atx: atx.clone(),
        ugpio: ugpio.clone(),
        streamer: streamer.clone(),
        logring,
        ws: ws.clone(),
        info_fields: config.info.fields.clone(),
    });

    let mut dispatcher = WsDispatcher::default();
    api::hid::register_ws(&mut dispatcher, state.clone());
    dispatcher.on_text("ping", |session, _event| async move {
        let _ = session.send_event("pong", &json!({})).await;
    });
    let dispatcher = Arc::new(dispatcher);

    let router = build_router(state.clone(), dispatcher.clone());

    // ===== System tasks.

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(supervised("hid-jiggler", {
        let hid = hid.clone();
        move || Box::pin(hid.clone().systask())
    }));
    tasks.push(supervised("msd-watcher", {
        let msd = msd.clone();
        move || Box::pin(msd.clone().systask())
    }));
    if let Some(switch) = switch.clone() {
        tasks.push(supervised("switch", move || Box::pin(switch.clone().systask())));
    }
    tasks.push(supervised("gpio", {
        let ugpio = ugpio.clone();
        move || Box::pin(ugpio.clone().systask())
    }));
    tasks.push(supervised("streamer", {
        let streamer = streamer.clone();
        let ws = ws.clone();
        move || {
            let ws = ws.clone();
            Box::pin(streamer.clone().systask(move || ws.count_sync()))
        }
    }));

    // ===== State fan-out to WS subscribers.

    tasks.push(spawn_stream_broadcast(ws.clone(), "hid_state", {
        let hid = hid.clone();
        Box::pin(hid.poll_state().map(|state| serde_json::to_value(state).unwrap_or_default()))
    }));
    tasks.push(spawn_stream_broadcast(ws.clone(), "msd_state", {
        let msd = msd.clone();
        Box::pin(msd.poll_state().map(|state| serde_json::to_value(state).unwrap_or_default()))
    }));
    if let Some(switch) = switch.clone() {
        tasks.push(spawn_stream_broadcast(
            ws.clone(),
            "switch_state",
            Box::pin(switch.poll_state()),
        ));
    }
    tasks.push(spawn_diff_broadcast(ws.clone(), "atx_state", atx.notifier(), {
        let atx = atx.clone();
        move || {
            let atx = atx.clone();
            async move { serde_json::to_value(atx.get_state()).unwrap_or_default() }
        }
    }));
    tasks.push(spawn_diff_broadcast(ws.clone(), "gpio_state", ugpio.notifier(), {
        let ugpio = ugpio.clone();
        move || {
            let ugpio = ugpio.clone();
            async move { ugpio.get_state().await }
        }
    }));

    // ===== Serve until a signal arrives.

    let server_config = ServerConfig {
        unix_path: config.server.unix_path.clone(),
        unix_rm: true,
        unix_mode: Some(config.server.unix_mode),
    };
    let shutdown = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    };
    let served = kvmd_server::serve(server_config, router, shutdown).await;

    // ===== Shutdown ordering: stop intake, drop clients, then release
    // hardware.

    info!("disconnecting clients");
    ws.close_all().await;
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("cleaning up components");
    hid.cleanup().await;
    msd.cleanup().await;
    if let Some(switch) = &switch {
        switch.cleanup().await;
    }
    atx.cleanup().await;
    ugpio.cleanup().await;
    streamer.cleanup().await;

    served.map_err(Into::into)
}

/// The full routed surface with auth and path normalization applied.
pub fn build_router(state: Arc<AppState>, dispatcher: Arc<WsDispatcher>) -> Router {
    let mut meta = ApiMeta::default();
    meta.register(Method::GET, "/ws", EndpointMeta::default());
    let router = Router::new()
        .merge(api::auth::router(&mut meta))
        .merge(api::info::router(&mut meta))
        .merge(api::log::router(&mut meta))
        .merge(api::hid::router(&mut meta))
        .merge(api::atx::router(&mut meta))
        .merge(api::msd::router(&mut meta))
        .merge(api::switch::router(&mut meta))
        .merge(api::ugpio::router(&mut meta))
        .merge(api::streamer::router(&mut meta))
        .merge(api::redfish::router(&mut meta))
        .route("/ws", get(ws_handler))
        .layer(axum::Extension(dispatcher));

    let gate = Arc::new(AuthGate {
        manager: state.auth.clone(),
        meta,
    });
    // Outermost first: canonicalize the path, then authenticate against
    // the canonical form, then route.
    router
        .layer(axum::middleware::from_fn_with_state(gate, auth_middleware))
        .layer(axum::middleware::map_request(normalize_path))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(dispatcher): axum::Extension<Arc<WsDispatcher>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let registry = state.ws.clone();
        let open_state = state.clone();
        registry
            .run_session(
                socket,
                json!({}),
                dispatcher,
                move |session| async move {
                    // Push the full picture before the event stream starts.
                    let mut initial: Vec<(&str, Value)> = vec![
                        (
                            "hid_state",
                            serde_json::to_value(open_state.hid.get_state()).unwrap_or_default(),
                        ),
                        (
                            "atx_state",
                            serde_json::to_value(open_state.atx.get_state()).unwrap_or_default(),
                        ),
                        (
                            "msd_state",
                            serde_json::to_value(open_state.msd.get_state().await)
                                .unwrap_or_default(),
                        ),
                        ("gpio_state", open_state.ugpio.get_state().await),
                    ];
                    if let Some(switch) = &open_state.switch {
                        initial.push(("switch_state", switch.get_state().await));
                    }
                    initial.push(("loop", json!({})));
                    for (event_type, event) in initial {
                        if !session.send_event(event_type, &event).await {
                            return;
                        }
                    }
                },
                || {},
            )
            .await;
    })
}

/// Strips trailing slashes and merges duplicate ones so the exact-match
/// routing (and the auth metadata table) see canonical paths.
async fn normalize_path(mut request: axum::extract::Request) -> axum::extract::Request {
    let uri = request.uri();
    let path = uri.path();
    let mut normalized = String::with_capacity(path.len());
    let mut last_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if !last_slash {
                normalized.push('/');
            }
            last_slash = true;
        } else {
            normalized.push(ch);
            last_slash = false;
        }
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized != path {
        let mut parts = uri.clone().into_parts();
        let new_path_and_query = match uri.query() {
            Some(query) => format!("{normalized}?{query}"),
            None => normalized,
        };
        if let Ok(path_and_query) = new_path_and_query.parse() {
            parts.path_and_query = Some(path_and_query);
            if let Ok(new_uri) = axum::http::Uri::from_parts(parts) {
                *request.uri_mut() = new_uri;
            }
        }
    }
    request
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Restarts a system task with a 1-second backoff whenever it exits or
/// panics; these loops are supposed to be immortal.
fn supervised(
    name: &'static str,
    factory: impl Fn() -> BoxedTask + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::spawn(factory()).await {
                Ok(()) => warn!(task = name, "system task exited, restarting"),
                Err(err) if err.is_cancelled() => return,
                Err(err) => error!(task = name, %err, "system task panicked, restarting"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    })
}

fn spawn_stream_broadcast(
    ws: Arc<WsRegistry>,
    event_type: &'static str,
    mut stream: Pin<Box<dyn futures_util::Stream<Item = Value> + Send>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(state) = stream.next().await {
            ws.broadcast(event_type, &state).await;
        }
    })
}

fn spawn_diff_broadcast<F, Fut>(
    ws: Arc<WsRegistry>,
    event_type: &'static str,
    notifier: Arc<Notifier>,
    get_state: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Value> + Send,
{
    tokio::spawn(async move {
        let mut prev: Option<Value> = None;
        loop {
            let state = get_state().await;
            if prev.as_ref() != Some(&state) {
                prev = Some(state.clone());
                ws.broadcast(event_type, &state).await;
            }
            if notifier.wait().await > 0 {
                prev = None;
            }
        }
    })
}
