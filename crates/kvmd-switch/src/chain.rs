//! The chain worker: a dedicated thread owning the serial port,
//! reconciling every online unit against the wanted configuration and
//! streaming observed changes back to the async side.

use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info, warn};

use crate::device::Device;
use crate::proto::{NakReason, Response, ResponseBody, UnitAtxLeds, UnitState};
use crate::types::{Colors, Edids};
use crate::SwitchError;

pub const UNIT_CHANNELS: u32 = 4;
const CHANGING_TIMEOUT: Duration = Duration::from_secs(5);
/// Firmware revision that understands SET_QUIRKS.
const QUIRKS_VERSION: u16 = 7;

/// Maps the operator's flat port number to a physical unit and channel.
pub fn real_unit_channel(port: u32) -> (u8, u8) {
    ((port / UNIT_CHANNELS) as u8, (port % UNIT_CHANNELS) as u8)
}

/// The channel a given unit must select for the wanted port: its own
/// channel when the port lives there, the downlink (4) otherwise.
pub fn unit_target_channel(unit: u8, port: u32) -> u8 {
    let (t_unit, t_ch) = real_unit_channel(port);
    if unit == t_unit {
        t_ch
    } else {
        4
    }
}

pub fn virtual_port(unit: u8, ch: u8) -> u32 {
    u32::from(unit) * UNIT_CHANNELS + u32::from(ch)
}

#[derive(Debug, Clone)]
pub enum ChainEvent {
    DeviceFound,
    ChainTruncated(usize),
    PortActivated(u32),
    UnitState(usize, Box<UnitState>),
    UnitAtxLeds(usize, UnitAtxLeds),
}

#[derive(Debug, Clone)]
enum Cmd {
    SetActual(bool),
    SetActivePort(u32),
    SetPortBeacon { port: u32, on: bool },
    SetUnitBeacon { unit: u8, on: bool, downlink: bool },
    SetEdids(Edids),
    SetColors(Colors),
    AtxClick { port: u32, delay: f64, reset: bool, if_powered: Option<bool> },
    RebootUnit { unit: u8, bootloader: bool },
}

struct UnitContext {
    state: Option<UnitState>,
    atx_leds: Option<UnitAtxLeds>,
    changing_rid: Option<(u16, Instant)>,
}

impl UnitContext {
    fn new() -> Self {
        Self {
            state: None,
            atx_leds: None,
            changing_rid: None,
        }
    }

    fn changing_rid(&mut self) -> Option<u16> {
        if let Some((_, deadline)) = self.changing_rid {
            if Instant::now() >= deadline {
                self.changing_rid = None;
            }
        }
        self.changing_rid.map(|(rid, _)| rid)
    }

    fn set_changing_rid(&mut self, rid: u16) {
        self.changing_rid = Some((rid, Instant::now() + CHANGING_TIMEOUT));
    }

    fn can_be_changed(&mut self) -> bool {
        let no_rid = self.changing_rid().is_none();
        matches!(&self.state, Some(state) if !state.flags.changing_busy) && no_rid
    }

    /// (allowed, power LED lit)
    fn is_atx_allowed(&self, ch: usize) -> (bool, bool) {
        match (&self.state, &self.atx_leds) {
            (Some(state), Some(leds)) => (!state.atx_busy[ch], leds.power[ch]),
            _ => (false, false),
        }
    }
}

/// Async-side handle; all methods enqueue for the worker.
pub struct Chain {
    cmd_tx: mpsc::Sender<Cmd>,
    events_rx: parking_lot::Mutex<Option<tokio_mpsc::UnboundedReceiver<ChainEvent>>>,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl Chain {
    pub fn new(device_path: PathBuf, ignore_hpd_on_top: bool) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (events_tx, events_rx) = tokio_mpsc::unbounded_channel();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let worker = Worker {
            device: Device::new(&device_path),
            ignore_hpd_on_top,
            actual: false,
            edids: Edids::default(),
            colors: Colors::default(),
            units: Vec::new(),
            active_port: None,
            cmd_rx,
            events_tx,
            stop: stop.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("switch-chain".to_owned())
            .spawn(move || worker.run())
            .expect("failed to spawn switch chain worker");

        Self {
            cmd_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            worker: parking_lot::Mutex::new(Some(handle)),
            stop,
        }
    }

    /// Takes the event stream; single consumer.
    pub fn take_events(&self) -> tokio_mpsc::UnboundedReceiver<ChainEvent> {
        self.events_rx.lock().take().expect("chain events already taken")
    }

    pub async fn stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::Release);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    /// Enables EDID/color convergence once the wanted entities are loaded.
    pub fn set_actual(&self, actual: bool) {
        self.send(Cmd::SetActual(actual));
    }

    pub fn set_active_port(&self, port: u32) {
        self.send(Cmd::SetActivePort(port));
    }

    pub fn set_port_beacon(&self, port: u32, on: bool) {
        self.send(Cmd::SetPortBeacon { port, on });
    }

    pub fn set_uplink_beacon(&self, unit: u8, on: bool) {
        self.send(Cmd::SetUnitBeacon { unit, on, downlink: false });
    }

    pub fn set_downlink_beacon(&self, unit: u8, on: bool) {
        self.send(Cmd::SetUnitBeacon { unit, on, downlink: true });
    }

    pub fn set_edids(&self, edids: Edids) {
        self.send(Cmd::SetEdids(edids));
    }

    pub fn set_colors(&self, colors: Colors) {
        self.send(Cmd::SetColors(colors));
    }

    pub fn click_power(&self, port: u32, delay: f64, if_powered: Option<bool>) {
        self.send(Cmd::AtxClick { port, delay, reset: false, if_powered });
    }

    pub fn click_reset(&self, port: u32, delay: f64, if_powered: Option<bool>) {
        self.send(Cmd::AtxClick { port, delay, reset: true, if_powered });
    }

    pub fn reboot_unit(&self, unit: u8, bootloader: bool) {
        self.send(Cmd::RebootUnit { unit, bootloader });
    }

    fn send(&self, cmd: Cmd) {
        let _ = self.cmd_tx.send(cmd);
    }
}

struct Worker {
    device: Device,
    ignore_hpd_on_top: bool,
    actual: bool,
    edids: Edids,
    colors: Colors,
    units: Vec<UnitContext>,
    active_port: Option<u32>,
    cmd_rx: mpsc::Receiver<Cmd>,
    events_tx: tokio_mpsc::UnboundedSender<ChainEvent>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl Worker {
    fn run(mut self) {
        let mut no_device_reported = false;
        while !self.stopped() {
            if self.device.has_device() {
                no_device_reported = false;
                match self.device.open() {
                    Ok(()) => {
                        info!("switch found");
                        self.emit(ChainEvent::DeviceFound);
                        if let Err(err) = self.main_loop() {
                            error!(%err, "switch loop error");
                        }
                        self.device.close();
                    }
                    Err(err) => error!(%err, "can't open switch"),
                }
            } else if !no_device_reported {
                self.emit(ChainEvent::ChainTruncated(0));
                info!("switch is missing");
                no_device_reported = true;
            }
            self.drain_commands();
            if !self.stopped() {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(std::sync::atomic::Ordering::Acquire)
    }

    fn emit(&self, event: ChainEvent) {
        let _ = self.events_tx.send(event);
    }

    fn drain_commands(&mut self) {
        while self.cmd_rx.try_recv().is_ok() {}
    }

    fn main_loop(&mut self) -> Result<(), SwitchError> {
        self.units.clear();
        self.active_port = None;
        self.device.request_state()?;
        self.device.request_atx_leds()?;
        while !self.stopped() {
            // The read itself is the wait: it blocks up to the port
            // timeout and returns whatever frames arrived.
            for response in self.device.read_all()? {
                self.update_units(&response);
                self.adjust_quirks()?;
                self.adjust_start_port();
                self.finish_changing_request(&response);
            }
            self.consume_commands()?;
            self.ensure_config()?;
        }
        Ok(())
    }

    fn consume_commands(&mut self) -> Result<(), SwitchError> {
        loop {
            let cmd = match self.cmd_rx.try_recv() {
                Ok(cmd) => cmd,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Ok(()),
            };
            match cmd {
                Cmd::SetActual(actual) => self.actual = actual,
                Cmd::SetActivePort(port) => {
                    // Also reached from inside on auto-activation.
                    self.active_port = Some(port);
                    self.emit(ChainEvent::PortActivated(port));
                }
                Cmd::SetPortBeacon { port, on } => {
                    let (unit, ch) = real_unit_channel(port);
                    self.device.request_beacon(unit, ch, on)?;
                }
                Cmd::SetUnitBeacon { unit, on, downlink } => {
                    let ch = if downlink { 4 } else { 5 };
                    self.device.request_beacon(unit, ch, on)?;
                }
                Cmd::AtxClick { port, delay, reset, if_powered } => {
                    let (unit, ch) = real_unit_channel(port);
                    if let Some(ctx) = self.units.get(unit as usize) {
                        let (allowed, powered) = ctx.is_atx_allowed(ch as usize);
                        if allowed && if_powered.map_or(true, |want| want == powered) {
                            let delay_ms = ((delay * 1000.0) as u64).clamp(1, 0xFFFF) as u16;
                            if reset {
                                self.device.request_atx_click_reset(unit, ch, delay_ms)?;
                            } else {
                                self.device.request_atx_click_power(unit, ch, delay_ms)?;
                            }
                        }
                    }
                }
                Cmd::SetEdids(edids) => self.edids = edids,
                Cmd::SetColors(colors) => self.colors = colors,
                Cmd::RebootUnit { unit, bootloader } => {
                    self.device.request_reboot(unit, bootloader)?;
                }
            }
        }
    }

    fn update_units(&mut self, response: &Response) {
        let unit = response.header.unit as usize;
        while self.units.len() <= unit {
            self.units.push(UnitContext::new());
        }
        match &response.body {
            ResponseBody::State(state) => {
                if !state.flags.has_downlink && self.units.len() > unit + 1 {
                    self.units.truncate(unit + 1);
                    self.emit(ChainEvent::ChainTruncated(unit + 1));
                }
                self.units[unit].state = Some(**state);
                self.emit(ChainEvent::UnitState(unit, state.clone()));
            }
            ResponseBody::AtxLeds(leds) => {
                self.units[unit].atx_leds = Some(*leds);
                self.emit(ChainEvent::UnitAtxLeds(unit, *leds));
            }
            ResponseBody::Nak(reason) => {
                warn!(unit, ?reason, "switch NAK");
            }
        }
    }

    fn adjust_quirks(&mut self) -> Result<(), SwitchError> {
        for unit in 0..self.units.len() {
            let Some(state) = &self.units[unit].state else {
                continue;
            };
            if !state.version.is_fresh(QUIRKS_VERSION) {
                continue;
            }
            let ignore_hpd = unit == 0 && self.ignore_hpd_on_top;
            if state.ignore_hpd != ignore_hpd {
                info!(ignore_hpd, unit, "applying quirk ignore_hpd");
                self.device.request_set_quirks(unit as u8, ignore_hpd)?;
            }
        }
        Ok(())
    }

    /// First complete state after startup wins: adopt whichever unit
    /// already points at a host-facing channel.
    fn adjust_start_port(&mut self) {
        if self.active_port.is_some() {
            return;
        }
        for (unit, ctx) in self.units.iter().enumerate() {
            if let Some(state) = &ctx.state {
                if state.ch < 4 {
                    let port = virtual_port(unit as u8, state.ch);
                    info!(port, unit, ch = state.ch, "found an active port, syncing");
                    self.active_port = Some(port);
                    self.emit(ChainEvent::PortActivated(port));
                    break;
                }
            }
        }
    }

    fn finish_changing_request(&mut self, response: &Response) {
        let unit = response.header.unit as usize;
        if let Some(ctx) = self.units.get_mut(unit) {
            if ctx.changing_rid() == Some(response.header.rid) {
                ctx.changing_rid = None;
            }
        }
    }

    fn ensure_config(&mut self) -> Result<(), SwitchError> {
        for unit in 0..self.units.len() {
            if self.units[unit].state.is_none() {
                continue;
            }
            self.ensure_config_port(unit)?;
            if self.actual {
                self.ensure_config_edids(unit)?;
                self.ensure_config_colors(unit)?;
            }
        }
        Ok(())
    }

    fn ensure_config_port(&mut self, unit: usize) -> Result<(), SwitchError> {
        let Some(port) = self.active_port else {
            return Ok(());
        };
        if !self.units[unit].can_be_changed() {
            return Ok(());
        }
        let current = self.units[unit].state.as_ref().expect("state checked").ch;
        let target = unit_target_channel(unit as u8, port);
        if current != target {
            info!(port, unit, from = current, to = target, "switching for active port");
            let rid = self.device.request_switch(unit as u8, target)?;
            self.units[unit].set_changing_rid(rid);
        }
        Ok(())
    }

    fn ensure_config_edids(&mut self, unit: usize) -> Result<(), SwitchError> {
        if !self.units[unit].can_be_changed() {
            return Ok(());
        }
        for ch in 0..4u8 {
            let port = virtual_port(unit as u8, ch);
            let edid = self.edids.for_port(port).clone();
            let mismatch = {
                let state = self.units[unit].state.as_ref().expect("state checked");
                !state.compare_edid(ch as usize, &edid)
            };
            if mismatch {
                info!(port, unit, ch, crc = edid.crc, valid = edid.valid, name = %edid.name,
                      "changing EDID");
                let rid = self.device.request_set_edid(unit as u8, ch, &edid)?;
                self.units[unit].set_changing_rid(rid);
                break; // The unit is globally busy until it replies.
            }
        }
        Ok(())
    }

    fn ensure_config_colors(&mut self, unit: usize) -> Result<(), SwitchError> {
        for np in 0..6u8 {
            let drifted = {
                let state = self.units[unit].state.as_ref().expect("state checked");
                state.np_crc[np as usize] != self.colors.crc
            };
            if drifted {
                self.device.request_set_colors(unit as u8, np, &self.colors)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_to_unit_channel_mapping() {
        assert_eq!(real_unit_channel(0), (0, 0));
        assert_eq!(real_unit_channel(5), (1, 1));
        assert_eq!(real_unit_channel(11), (2, 3));
    }

    #[test]
    fn non_owning_units_select_downlink() {
        // Port 5 lives on unit 1 channel 1; unit 0 must route downstream.
        assert_eq!(unit_target_channel(0, 5), 4);
        assert_eq!(unit_target_channel(1, 5), 1);
        assert_eq!(unit_target_channel(2, 5), 4);
    }

    #[test]
    fn virtual_port_round_trip() {
        for port in 0..16 {
            let (unit, ch) = real_unit_channel(port);
            assert_eq!(virtual_port(unit, ch), port);
        }
    }

    #[test]
    fn changing_rid_expires() {
        let mut ctx = UnitContext::new();
        ctx.changing_rid = Some((7, Instant::now() - Duration::from_secs(1)));
        assert_eq!(ctx.changing_rid(), None);
        ctx.set_changing_rid(9);
        assert_eq!(ctx.changing_rid(), Some(9));
    }
}
