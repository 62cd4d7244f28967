//! Daisy-chained KVM switch driver: a serial chain worker, a state cache
//! feeding the API, and persistence of the operator-tuned entities.

pub mod chain;
mod device;
pub mod proto;
pub mod state;
pub mod storage;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use kvmd_core::{ApiError, Notifier};

use chain::{Chain, ChainEvent};
use state::StateCache;
use storage::{PersistentStorage, StorageContext};
use types::{Color, Colors, Edid, Edids};

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("{0}")]
    Operation(String),
    #[error("no specified EDID ID found")]
    UnknownEdid,
    #[error("{0}")]
    Device(String),
    #[error("{0}")]
    Storage(String),
}

impl From<SwitchError> for ApiError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Operation(msg) => ApiError::Operation(msg),
            SwitchError::UnknownEdid => ApiError::Operation(err.to_string()),
            SwitchError::Device(msg) | SwitchError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub device_path: PathBuf,
    pub default_edid_path: PathBuf,
    pub ignore_hpd_on_top: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/kvmd-switch"),
            default_edid_path: PathBuf::from("/etc/kvmd/switch-edid.hex"),
            ignore_hpd_on_top: false,
        }
    }
}

enum AtxDelayKind {
    Power,
    PowerLong,
}

pub struct Switch {
    chain: Chain,
    cache: Mutex<StateCache>,
    mask_rx: SyncMutex<Option<UnboundedReceiver<u16>>>,
    storage: Arc<dyn PersistentStorage>,
    default_edid_path: PathBuf,
    save_notifier: Notifier,
}

impl Switch {
    pub fn new(config: SwitchConfig, storage: Arc<dyn PersistentStorage>) -> Self {
        let chain = Chain::new(config.device_path.clone(), config.ignore_hpd_on_top);
        let (cache, mask_rx) = StateCache::new();
        Self {
            chain,
            cache: Mutex::new(cache),
            mask_rx: SyncMutex::new(Some(mask_rx)),
            storage,
            default_edid_path: config.default_edid_path,
            save_notifier: Notifier::new(),
        }
    }

    // ===== State.

    pub async fn get_state(&self) -> Value {
        self.cache.lock().await.full_state()
    }

    pub async fn trigger_state(&self) {
        self.cache.lock().await.trigger();
    }

    /// Masked state stream; ATX-only deltas are held back 200 ms so LED
    /// bursts from several units collapse into one event.
    pub fn poll_state(self: &Arc<Self>) -> impl Stream<Item = Value> + Send {
        let this = self.clone();
        let mut mask_rx = self.mask_rx.lock().take().expect("switch state already polled");
        async_stream::stream! {
            let mut atx_deadline: Option<Instant> = None;
            loop {
                let received =
                    tokio::time::timeout(Duration::from_millis(100), mask_rx.recv()).await;
                let mut mask = match received {
                    Ok(Some(mask)) => mask,
                    Ok(None) => return,
                    Err(_) => 0,
                };

                if mask == state::MASK_ATX {
                    match atx_deadline {
                        None => {
                            atx_deadline = Some(Instant::now() + Duration::from_millis(200));
                            continue;
                        }
                        Some(deadline) if deadline >= Instant::now() => continue,
                        Some(_) => atx_deadline = None,
                    }
                } else if mask == 0 {
                    if atx_deadline.is_some() {
                        // Quiet period: flush the deferred ATX delta.
                        mask = state::MASK_ATX;
                        atx_deadline = None;
                    } else {
                        continue;
                    }
                } else if mask & state::MASK_ATX != 0 {
                    atx_deadline = None;
                }

                yield this.cache.lock().await.masked_state(mask);
            }
        }
    }

    // ===== Switching and beacons.

    pub async fn set_active_port(&self, port: u32) {
        self.chain.set_active_port(port);
    }

    pub async fn set_active_prev(&self) {
        self.cycle_active(-1).await;
    }

    pub async fn set_active_next(&self) {
        self.cycle_active(1).await;
    }

    async fn cycle_active(&self, step: i64) {
        let cache = self.cache.lock().await;
        let ports = i64::from(cache.ports());
        if ports == 0 {
            return;
        }
        let current = cache.active_port().map(i64::from).unwrap_or(0);
        drop(cache);
        let target = (current + step).rem_euclid(ports) as u32;
        self.chain.set_active_port(target);
    }

    pub async fn set_port_beacon(&self, port: u32, on: bool) {
        self.chain.set_port_beacon(port, on);
    }

    pub async fn set_uplink_beacon(&self, unit: u8, on: bool) {
        self.chain.set_uplink_beacon(unit, on);
    }

    pub async fn set_downlink_beacon(&self, unit: u8, on: bool) {
        self.chain.set_downlink_beacon(unit, on);
    }

    pub async fn reboot_unit(&self, unit: u8, bootloader: bool) {
        self.chain.reboot_unit(unit, bootloader);
    }

    // ===== ATX.

    pub async fn atx_power_on(&self, port: u32) {
        self.atx_click_power_inner(port, Some(false), AtxDelayKind::Power).await;
    }

    pub async fn atx_power_off(&self, port: u32) {
        self.atx_click_power_inner(port, Some(true), AtxDelayKind::Power).await;
    }

    pub async fn atx_power_off_hard(&self, port: u32) {
        self.atx_click_power_inner(port, Some(true), AtxDelayKind::PowerLong).await;
    }

    pub async fn atx_power_reset_hard(&self, port: u32) {
        self.atx_click_reset_inner(port, Some(true)).await;
    }

    pub async fn atx_click_power(&self, port: u32) {
        self.atx_click_power_inner(port, None, AtxDelayKind::Power).await;
    }

    pub async fn atx_click_power_long(&self, port: u32) {
        self.atx_click_power_inner(port, None, AtxDelayKind::PowerLong).await;
    }

    pub async fn atx_click_reset(&self, port: u32) {
        self.atx_click_reset_inner(port, None).await;
    }

    async fn atx_click_power_inner(&self, port: u32, if_powered: Option<bool>, kind: AtxDelayKind) {
        let cache = self.cache.lock().await;
        let delay = match kind {
            AtxDelayKind::Power => cache.atx_cp_delays().get(port),
            AtxDelayKind::PowerLong => cache.atx_cpl_delays().get(port),
        };
        drop(cache);
        self.chain.click_power(port, delay, if_powered);
    }

    async fn atx_click_reset_inner(&self, port: u32, if_powered: Option<bool>) {
        let delay = self.cache.lock().await.atx_cr_delays().get(port);
        self.chain.click_reset(port, delay, if_powered);
    }

    // ===== EDIDs.

    pub async fn create_edid(&self, name: &str, data_hex: &str) -> Result<String, SwitchError> {
        let edid = Edid::from_hex(name, data_hex)?;
        let mut cache = self.cache.lock().await;
        let mut edids = cache.edids();
        let id = edids.add(edid);
        self.apply_edids(&mut cache, edids, true);
        Ok(id)
    }

    pub async fn change_edid(
        &self,
        id: &str,
        name: Option<&str>,
        data_hex: Option<&str>,
    ) -> Result<(), SwitchError> {
        debug_assert_ne!(id, types::DEFAULT_EDID_ID);
        let mut cache = self.cache.lock().await;
        let mut edids = cache.edids();
        let old = edids.get(id).ok_or(SwitchError::UnknownEdid)?;
        let name = name.unwrap_or(&old.name).to_owned();
        let data_hex = data_hex.map(str::to_owned).unwrap_or_else(|| old.as_text());
        edids.set(id, Edid::from_hex(&name, &data_hex)?)?;
        self.apply_edids(&mut cache, edids, true);
        Ok(())
    }

    pub async fn remove_edid(&self, id: &str) -> Result<(), SwitchError> {
        debug_assert_ne!(id, types::DEFAULT_EDID_ID);
        let mut cache = self.cache.lock().await;
        let mut edids = cache.edids();
        edids.remove(id)?;
        self.apply_edids(&mut cache, edids, true);
        Ok(())
    }

    // ===== Colors and port attributes.

    /// `None` in a pair resets the role to its default.
    pub async fn set_colors(&self, changes: &[(&str, Option<Color>)]) {
        let mut cache = self.cache.lock().await;
        let mut colors = cache.colors();
        for (role, color) in changes {
            colors = colors.with_role(role, *color);
        }
        self.apply_colors(&mut cache, colors, true);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn set_port_params(
        &self,
        port: u32,
        edid_id: Option<&str>,
        name: Option<&str>,
        atx_click_power_delay: Option<f64>,
        atx_click_power_long_delay: Option<f64>,
        atx_click_reset_delay: Option<f64>,
    ) -> Result<(), SwitchError> {
        let mut cache = self.cache.lock().await;

        if let Some(id) = edid_id {
            let mut edids = cache.edids();
            edids.assign(port, id)?;
            self.apply_edids(&mut cache, edids, true);
        }
        if let Some(name) = name {
            let mut names = cache.port_names();
            names.set(port, (!name.is_empty()).then(|| name.to_owned()));
            cache.set_port_names(names);
            self.save_notifier.notify(0);
        }
        // Zero resets a delay to its default.
        let delay_value = |delay: f64| (delay != 0.0).then_some(delay);
        if let Some(delay) = atx_click_power_delay {
            let mut delays = cache.atx_cp_delays();
            delays.set(port, delay_value(delay));
            cache.set_atx_cp_delays(delays);
            self.save_notifier.notify(0);
        }
        if let Some(delay) = atx_click_power_long_delay {
            let mut delays = cache.atx_cpl_delays();
            delays.set(port, delay_value(delay));
            cache.set_atx_cpl_delays(delays);
            self.save_notifier.notify(0);
        }
        if let Some(delay) = atx_click_reset_delay {
            let mut delays = cache.atx_cr_delays();
            delays.set(port, delay_value(delay));
            cache.set_atx_cr_delays(delays);
            self.save_notifier.notify(0);
        }
        Ok(())
    }

    fn apply_edids(&self, cache: &mut StateCache, edids: Edids, save: bool) {
        self.chain.set_edids(edids.clone());
        cache.set_edids(edids);
        if save {
            self.save_notifier.notify(0);
        }
    }

    fn apply_colors(&self, cache: &mut StateCache, colors: Colors, save: bool) {
        self.chain.set_colors(colors);
        cache.set_colors(colors);
        if save {
            self.save_notifier.notify(0);
        }
    }

    // ===== System tasks.

    pub async fn systask(self: Arc<Self>) {
        let events = self.chain.take_events();
        tokio::join!(
            self.clone().systask_events(events),
            self.clone().systask_default_edid(),
            self.clone().systask_storage(),
        );
    }

    pub async fn cleanup(&self) {
        self.chain.stop().await;
    }

    async fn systask_events(self: Arc<Self>, mut events: UnboundedReceiver<ChainEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChainEvent::DeviceFound => self.load_configs().await,
                ChainEvent::ChainTruncated(units) => {
                    self.cache.lock().await.truncate(units);
                }
                ChainEvent::PortActivated(port) => {
                    self.cache.lock().await.update_active_port(port);
                }
                ChainEvent::UnitState(unit, state) => {
                    self.cache.lock().await.update_unit_state(unit, *state);
                }
                ChainEvent::UnitAtxLeds(unit, leds) => {
                    self.cache.lock().await.update_unit_atx_leds(unit, leds);
                }
            }
        }
    }

    /// Loads every persisted entity after the chain (re)appears, then
    /// allows the worker to converge EDIDs and colors.
    async fn load_configs(&self) {
        let path = match self.storage.readable().await {
            Some(path) => Some(path.join(storage::SUBDIR)),
            None => None,
        };
        let mut cache = self.cache.lock().await;

        let loaded = async {
            let (mut edids, colors, names, cp, cpl, cr) = match &path {
                Some(path) => {
                    let ctx = StorageContext::new(path);
                    (
                        ctx.read_edids().await?,
                        ctx.read_colors().await?,
                        ctx.read_port_names().await?,
                        ctx.read_atx_cp_delays().await?,
                        ctx.read_atx_cpl_delays().await?,
                        ctx.read_atx_cr_delays().await?,
                    )
                }
                None => (
                    Edids::default(),
                    Colors::default(),
                    types::default_port_names(),
                    types::default_atx_cp_delays(),
                    types::default_atx_cpl_delays(),
                    types::default_atx_cr_delays(),
                ),
            };
            if let Some(edid) = self.read_default_edid().await {
                edids.set_default(edid);
            }
            Ok::<_, SwitchError>((edids, colors, names, cp, cpl, cr))
        }
        .await;

        match loaded {
            Ok((edids, colors, names, cp, cpl, cr)) => {
                self.apply_edids(&mut cache, edids, false);
                self.apply_colors(&mut cache, colors, false);
                cache.set_port_names(names);
                cache.set_atx_cp_delays(cp);
                cache.set_atx_cpl_delays(cpl);
                cache.set_atx_cr_delays(cr);
                self.chain.set_actual(true);
            }
            Err(err) => {
                error!(%err, "can't load switch configs");
            }
        }
    }

    async fn read_default_edid(&self) -> Option<Edid> {
        let raw = tokio::fs::read_to_string(&self.default_edid_path).await.ok()?;
        match Edid::from_hex(types::DEFAULT_EDID_NAME, &raw) {
            Ok(edid) => Some(edid),
            Err(err) => {
                warn!(%err, "can't parse default switch EDID, ignoring");
                None
            }
        }
    }

    async fn systask_default_edid(self: Arc<Self>) {
        loop {
            while !self.default_edid_path.exists() {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let mut watcher = match kvmd_core::inotify::Watcher::new() {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!(%err, "can't init default EDID watcher");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let watched = watcher.watch(&self.default_edid_path).and_then(|()| {
                // Symlinked EDIDs change through their target.
                match std::fs::canonicalize(&self.default_edid_path) {
                    Ok(real) if real != self.default_edid_path => watcher.watch(&real),
                    _ => Ok(()),
                }
            });
            if let Err(err) = watched {
                error!(%err, "can't watch default EDID");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            self.reload_default_edid().await;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let drained = watcher.drain();
                if drained.restart {
                    warn!("default EDID watch invalidated, reinitializing");
                    break;
                }
                if drained.changed {
                    self.reload_default_edid().await;
                }
            }
        }
    }

    async fn reload_default_edid(&self) {
        if let Some(edid) = self.read_default_edid().await {
            let mut cache = self.cache.lock().await;
            let mut edids = cache.edids();
            edids.set_default(edid);
            self.apply_edids(&mut cache, edids, false);
        }
    }

    /// Writes changed entities after a 5-second quiescence window.
    async fn systask_storage(self: Arc<Self>) {
        let mut prev_edids: Option<Edids> = None;
        let mut prev_colors: Option<Colors> = None;
        let mut prev_names: Option<types::PortNames> = None;
        let mut prev_cp: Option<types::AtxClickPowerDelays> = None;
        let mut prev_cpl: Option<types::AtxClickPowerLongDelays> = None;
        let mut prev_cr: Option<types::AtxClickResetDelays> = None;

        loop {
            self.save_notifier.wait().await;
            while self.save_notifier.wait_timeout(Duration::from_secs(5)).await.is_some() {}

            loop {
                let result = async {
                    let cache = self.cache.lock().await;
                    let edids = cache.edids();
                    let colors = cache.colors();
                    let names = cache.port_names();
                    let cp = cache.atx_cp_delays();
                    let cpl = cache.atx_cpl_delays();
                    let cr = cache.atx_cr_delays();
                    drop(cache);

                    let dirty = prev_edids.as_ref() != Some(&edids)
                        || prev_colors.as_ref() != Some(&colors)
                        || prev_names.as_ref() != Some(&names)
                        || prev_cp.as_ref() != Some(&cp)
                        || prev_cpl.as_ref() != Some(&cpl)
                        || prev_cr.as_ref() != Some(&cr);
                    if !dirty {
                        return Ok(());
                    }
                    let Some((path, _session)) = self.storage.writable().await else {
                        return Ok(());
                    };
                    let path = path.join(storage::SUBDIR);
                    let ctx = StorageContext::new(&path);
                    ctx.write_edids(&edids).await?;
                    ctx.write_colors(&colors).await?;
                    ctx.write_port_names(&names).await?;
                    ctx.write_atx_cp_delays(&cp).await?;
                    ctx.write_atx_cpl_delays(&cpl).await?;
                    ctx.write_atx_cr_delays(&cr).await?;
                    prev_edids = Some(edids);
                    prev_colors = Some(colors);
                    prev_names = Some(names);
                    prev_cp = Some(cp);
                    prev_cpl = Some(cpl);
                    prev_cr = Some(cr);
                    info!("switch entities persisted");
                    Ok::<(), SwitchError>(())
                }
                .await;

                match result {
                    Ok(()) => break,
                    Err(err) => {
                        error!(%err, "switch storage error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}
