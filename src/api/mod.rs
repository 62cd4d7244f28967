//! REST/WS surface: one module per subsystem, all sharing [`AppState`].

pub mod atx;
pub mod auth;
pub mod hid;
pub mod info;
pub mod log;
pub mod msd;
pub mod redfish;
pub mod streamer;
pub mod switch;
pub mod ugpio;

use std::collections::HashMap;
use std::sync::Arc;

use kvmd_auth::AuthManager;
use kvmd_core::ApiError;
use kvmd_gpio::{Atx, UserGpio};
use kvmd_hid::Hid;
use kvmd_msd::Msd;
use kvmd_server::WsRegistry;
use kvmd_switch::Switch;

use crate::logring::LogRing;
use crate::streamer::Streamer;

pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub hid: Arc<Hid>,
    pub msd: Arc<Msd>,
    pub switch: Option<Arc<Switch>>,
    pub atx: Arc<Atx>,
    pub ugpio: Arc<UserGpio>,
    pub streamer: Arc<Streamer>,
    pub logring: Arc<LogRing>,
    pub ws: Arc<WsRegistry>,
    pub info_fields: Vec<&'static str>,
}

pub type Ctx = Arc<AppState>;
pub type Params = axum::extract::Query<HashMap<String, String>>;

/// The switch subsystem is optional; absent means 400 rather than 404 so
/// clients get a diagnosable envelope.
pub fn require_switch(state: &AppState) -> Result<Arc<Switch>, ApiError> {
    state
        .switch
        .clone()
        .ok_or_else(|| ApiError::Operation("the switch subsystem is not configured".to_owned()))
}
