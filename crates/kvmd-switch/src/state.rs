//! Coarse-grained state aggregation for the API. A bitmask tracks which
//! subtrees changed so the poll stream sends only what moved; ATX LED
//! bursts are additionally coalesced by the poller.

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::chain::{unit_target_channel, virtual_port};
use crate::proto::{UnitAtxLeds, UnitState};
use crate::types::{
    AtxClickPowerDelays, AtxClickPowerLongDelays, AtxClickResetDelays, Colors, Edids, PortNames,
};

pub const MASK_FULL: u16 = 0xFFFF;
pub const MASK_SUMMARY: u16 = 0x01;
pub const MASK_EDIDS: u16 = 0x02;
pub const MASK_COLORS: u16 = 0x04;
pub const MASK_VIDEO: u16 = 0x08;
pub const MASK_USB: u16 = 0x10;
pub const MASK_BEACONS: u16 = 0x20;
pub const MASK_ATX: u16 = 0x40;

const API_VERSION: u16 = 5;

#[derive(Default)]
struct UnitInfo {
    state: Option<UnitState>,
    atx_leds: Option<UnitAtxLeds>,
}

pub struct StateCache {
    edids: Edids,
    colors: Colors,
    port_names: PortNames,
    atx_cp_delays: AtxClickPowerDelays,
    atx_cpl_delays: AtxClickPowerLongDelays,
    atx_cr_delays: AtxClickResetDelays,
    units: Vec<UnitInfo>,
    active_port: Option<u32>,
    synced: bool,
    mask_tx: UnboundedSender<u16>,
}

impl StateCache {
    pub fn new() -> (Self, UnboundedReceiver<u16>) {
        let (mask_tx, mask_rx) = unbounded_channel();
        (
            Self {
                edids: Edids::default(),
                colors: Colors::default(),
                port_names: crate::types::default_port_names(),
                atx_cp_delays: crate::types::default_atx_cp_delays(),
                atx_cpl_delays: crate::types::default_atx_cpl_delays(),
                atx_cr_delays: crate::types::default_atx_cr_delays(),
                units: Vec::new(),
                active_port: None,
                synced: true,
                mask_tx,
            },
            mask_rx,
        )
    }

    // ===== Entity accessors (copies, mutations go through set_*).

    pub fn edids(&self) -> Edids {
        self.edids.clone()
    }

    pub fn colors(&self) -> Colors {
        self.colors
    }

    pub fn port_names(&self) -> PortNames {
        self.port_names.clone()
    }

    pub fn atx_cp_delays(&self) -> AtxClickPowerDelays {
        self.atx_cp_delays.clone()
    }

    pub fn atx_cpl_delays(&self) -> AtxClickPowerLongDelays {
        self.atx_cpl_delays.clone()
    }

    pub fn atx_cr_delays(&self) -> AtxClickResetDelays {
        self.atx_cr_delays.clone()
    }

    pub fn active_port(&self) -> Option<u32> {
        self.active_port
    }

    pub fn ports(&self) -> u32 {
        self.units.len() as u32 * 4
    }

    pub fn trigger(&self) {
        self.bump(MASK_FULL);
    }

    fn bump(&self, mask: u16) {
        debug_assert!(mask != 0);
        let _ = self.mask_tx.send(mask);
    }

    // ===== Hardware-side updates.

    pub fn truncate(&mut self, units: usize) {
        if self.units.len() > units {
            self.units.truncate(units);
            self.bump(MASK_FULL);
        }
    }

    pub fn update_active_port(&mut self, port: u32) {
        let mut changed = self.active_port != Some(port);
        self.active_port = Some(port);
        changed |= self.recache_synced();
        if changed {
            self.bump(MASK_SUMMARY);
        }
    }

    pub fn update_unit_state(&mut self, unit: usize, new: UnitState) {
        self.ensure_unit(unit);
        let prev = self.units[unit].state.replace(new);
        if !self.units_ready() {
            return;
        }
        let mut mask = 0;
        match prev {
            None => mask = MASK_FULL,
            Some(prev) => {
                if self.recache_synced() {
                    mask |= MASK_SUMMARY;
                }
                if prev.video_5v_sens != new.video_5v_sens {
                    mask |= MASK_VIDEO;
                }
                if prev.usb_5v_sens != new.usb_5v_sens {
                    mask |= MASK_USB;
                }
                if prev.beacons != new.beacons {
                    mask |= MASK_BEACONS;
                }
                if prev.atx_busy != new.atx_busy {
                    mask |= MASK_ATX;
                }
            }
        }
        if mask != 0 {
            self.bump(mask);
        }
    }

    pub fn update_unit_atx_leds(&mut self, unit: usize, new: UnitAtxLeds) {
        self.ensure_unit(unit);
        let prev = self.units[unit].atx_leds.replace(new);
        if !self.units_ready() {
            return;
        }
        match prev {
            None => self.bump(MASK_FULL),
            Some(prev) if prev != new => self.bump(MASK_ATX),
            _ => {}
        }
    }

    fn ensure_unit(&mut self, unit: usize) {
        while self.units.len() <= unit {
            self.units.push(UnitInfo::default());
        }
    }

    fn units_ready(&self) -> bool {
        !self.units.is_empty()
            && self
                .units
                .iter()
                .all(|unit| unit.state.is_some() && unit.atx_leds.is_some())
    }

    // ===== Wanted-entity updates.

    pub fn set_edids(&mut self, edids: Edids) {
        let changed =
            self.edids.all != edids.all || !self.edids.compare_on_ports(&edids, self.ports());
        self.edids = edids;
        if changed {
            self.bump(MASK_EDIDS);
        }
    }

    pub fn set_colors(&mut self, colors: Colors) {
        let changed = self.colors != colors;
        self.colors = colors;
        if changed {
            self.bump(MASK_COLORS);
        }
    }

    pub fn set_port_names(&mut self, port_names: PortNames) {
        let changed = !self.port_names.compare_on_ports(&port_names, self.ports());
        self.port_names = port_names;
        if changed {
            self.bump(MASK_FULL);
        }
    }

    pub fn set_atx_cp_delays(&mut self, delays: AtxClickPowerDelays) {
        let changed = !self.atx_cp_delays.compare_on_ports(&delays, self.ports());
        self.atx_cp_delays = delays;
        if changed {
            self.bump(MASK_FULL);
        }
    }

    pub fn set_atx_cpl_delays(&mut self, delays: AtxClickPowerLongDelays) {
        let changed = !self.atx_cpl_delays.compare_on_ports(&delays, self.ports());
        self.atx_cpl_delays = delays;
        if changed {
            self.bump(MASK_FULL);
        }
    }

    pub fn set_atx_cr_delays(&mut self, delays: AtxClickResetDelays) {
        let changed = !self.atx_cr_delays.compare_on_ports(&delays, self.ports());
        self.atx_cr_delays = delays;
        if changed {
            self.bump(MASK_FULL);
        }
    }

    fn check_synced(&self) -> bool {
        for (unit, info) in self.units.iter().enumerate() {
            let Some(state) = &info.state else {
                return false;
            };
            if state.flags.changing_busy {
                return false;
            }
            if let Some(port) = self.active_port {
                if state.ch != unit_target_channel(unit as u8, port) {
                    return false;
                }
            }
            for ch in 0..4u8 {
                let port = virtual_port(unit as u8, ch);
                if !state.compare_edid(ch as usize, self.edids.for_port(port)) {
                    return false;
                }
            }
            if state.np_crc.iter().any(|&crc| crc != self.colors.crc) {
                return false;
            }
        }
        true
    }

    fn recache_synced(&mut self) -> bool {
        let synced = self.check_synced();
        if self.synced != synced {
            self.synced = synced;
            true
        } else {
            false
        }
    }

    // ===== Rendering.

    pub fn full_state(&self) -> Value {
        self.masked_state(MASK_FULL)
    }

    pub fn masked_state(&self, mask: u16) -> Value {
        debug_assert!(mask != 0);
        let full = mask == MASK_FULL;
        let mut state = serde_json::Map::new();

        if full {
            state.insert(
                "model".to_owned(),
                json!({
                    "firmware": {"version": API_VERSION},
                    "units": [],
                    "ports": [],
                    "limits": {
                        "atx": {
                            "click_delays": {
                                "power": {"default": self.atx_cp_delays.default, "min": 0, "max": 10},
                                "power_long": {"default": self.atx_cpl_delays.default, "min": 0, "max": 10},
                                "reset": {"default": self.atx_cr_delays.default, "min": 0, "max": 10},
                            },
                        },
                    },
                }),
            );
        }
        if mask & MASK_SUMMARY != 0 {
            state.insert(
                "summary".to_owned(),
                json!({
                    "active_port": self.active_port.map(i64::from).unwrap_or(-1),
                    "synced": self.synced,
                }),
            );
        }
        if mask & MASK_EDIDS != 0 {
            let all: serde_json::Map<String, Value> = self
                .edids
                .all
                .iter()
                .map(|(id, edid)| {
                    (
                        id.clone(),
                        json!({
                            "name": edid.name,
                            "data": edid.as_text(),
                            "parsed": edid.info.as_ref().map(|info| json!({
                                "mfc_id": info.mfc_id,
                                "product_id": info.product_id,
                                "serial": info.serial,
                                "monitor_name": info.monitor_name,
                                "monitor_serial": info.monitor_serial,
                                "audio": info.audio,
                            })),
                        }),
                    )
                })
                .collect();
            state.insert("edids".to_owned(), json!({"all": all, "used": []}));
        }
        if mask & MASK_COLORS != 0 {
            let render = |color: &crate::types::Color| {
                json!({
                    "red": color.red,
                    "green": color.green,
                    "blue": color.blue,
                    "brightness": color.brightness,
                    "blink_ms": color.blink_ms,
                })
            };
            state.insert(
                "colors".to_owned(),
                json!({
                    "inactive": render(&self.colors.inactive),
                    "active": render(&self.colors.active),
                    "flashing": render(&self.colors.flashing),
                    "beacon": render(&self.colors.beacon),
                    "bootloader": render(&self.colors.bootloader),
                }),
            );
        }
        if mask & MASK_VIDEO != 0 {
            state.insert("video".to_owned(), json!({"links": []}));
        }
        if mask & MASK_USB != 0 {
            state.insert("usb".to_owned(), json!({"links": []}));
        }
        if mask & MASK_BEACONS != 0 {
            state.insert(
                "beacons".to_owned(),
                json!({"uplinks": [], "downlinks": [], "ports": []}),
            );
        }
        if mask & MASK_ATX != 0 {
            state.insert(
                "atx".to_owned(),
                json!({"busy": [], "leds": {"power": [], "hdd": []}}),
            );
        }

        if !self.units_ready() {
            return Value::Object(state);
        }

        for (unit, info) in self.units.iter().enumerate() {
            let unit_state = info.state.as_ref().expect("units ready");
            let atx_leds = info.atx_leds.as_ref().expect("units ready");
            if full {
                push(&mut state, &["model", "units"], json!({
                    "firmware": {"version": unit_state.version.sw},
                }));
            }
            if mask & MASK_VIDEO != 0 {
                for sens in &unit_state.video_5v_sens[..4] {
                    push(&mut state, &["video", "links"], json!(sens));
                }
            }
            if mask & MASK_USB != 0 {
                for sens in &unit_state.usb_5v_sens {
                    push(&mut state, &["usb", "links"], json!(sens));
                }
            }
            if mask & MASK_BEACONS != 0 {
                push(&mut state, &["beacons", "uplinks"], json!(unit_state.beacons[5]));
                push(&mut state, &["beacons", "downlinks"], json!(unit_state.beacons[4]));
                for beacon in &unit_state.beacons[..4] {
                    push(&mut state, &["beacons", "ports"], json!(beacon));
                }
            }
            if mask & MASK_ATX != 0 {
                for (index, busy) in unit_state.atx_busy.iter().enumerate() {
                    push(&mut state, &["atx", "busy"], json!(busy));
                    push(&mut state, &["atx", "leds", "power"], json!(atx_leds.power[index]));
                    push(&mut state, &["atx", "leds", "hdd"], json!(atx_leds.hdd[index]));
                }
            }
            if full || mask & MASK_EDIDS != 0 {
                for ch in 0..4u8 {
                    let port = virtual_port(unit as u8, ch);
                    if full {
                        push(&mut state, &["model", "ports"], json!({
                            "unit": unit,
                            "channel": ch,
                            "name": self.port_names.get(port),
                            "atx": {
                                "click_delays": {
                                    "power": self.atx_cp_delays.get(port),
                                    "power_long": self.atx_cpl_delays.get(port),
                                    "reset": self.atx_cr_delays.get(port),
                                },
                            },
                        }));
                    }
                    if mask & MASK_EDIDS != 0 {
                        push(&mut state, &["edids", "used"], json!(self.edids.id_for_port(port)));
                    }
                }
            }
        }
        Value::Object(state)
    }
}

fn push(state: &mut serde_json::Map<String, Value>, path: &[&str], value: Value) {
    let mut cursor: &mut Value = state.get_mut(path[0]).expect("subtree present");
    for key in &path[1..] {
        cursor = cursor.get_mut(key).expect("subtree present");
    }
    cursor.as_array_mut().expect("array leaf").push(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{UnitFlags, UnitVersion};

    fn fake_state(ch: u8) -> UnitState {
        UnitState {
            version: UnitVersion { hw: 1, sw: 7, sw_dev: false },
            flags: UnitFlags {
                changing_busy: false,
                flashing_busy: false,
                has_downlink: false,
                has_hpd: true,
            },
            ch,
            beacons: [false; 6],
            np_crc: [Colors::default().crc; 6],
            video_5v_sens: [true, false, false, false, false],
            video_hpd: [false; 5],
            video_edid: [false; 4],
            video_crc: [0; 4],
            video_dummies: [false; 4],
            usb_5v_sens: [true, true, false, false],
            atx_busy: [false; 4],
            ignore_hpd: false,
        }
    }

    fn fake_leds() -> UnitAtxLeds {
        UnitAtxLeds {
            power: [true, false, false, false],
            hdd: [false; 4],
        }
    }

    #[test]
    fn full_state_has_all_subtrees() {
        let (mut cache, _rx) = StateCache::new();
        cache.update_unit_state(0, fake_state(0));
        cache.update_unit_atx_leds(0, fake_leds());
        cache.update_active_port(0);
        let state = cache.full_state();
        for key in ["model", "summary", "edids", "colors", "video", "usb", "beacons", "atx"] {
            assert!(state.get(key).is_some(), "missing {key}");
        }
        assert_eq!(state["model"]["ports"].as_array().unwrap().len(), 4);
        assert_eq!(state["summary"]["active_port"], 0);
        assert_eq!(state["atx"]["leds"]["power"][0], true);
    }

    #[test]
    fn masked_state_yields_only_changed_subtrees() {
        let (mut cache, _rx) = StateCache::new();
        cache.update_unit_state(0, fake_state(0));
        cache.update_unit_atx_leds(0, fake_leds());
        let state = cache.masked_state(MASK_ATX);
        assert!(state.get("atx").is_some());
        assert!(state.get("model").is_none());
        assert!(state.get("summary").is_none());
    }

    #[test]
    fn synced_tracks_active_port() {
        let (mut cache, mut rx) = StateCache::new();
        cache.update_unit_state(0, fake_state(0));
        cache.update_unit_atx_leds(0, fake_leds());
        cache.update_active_port(0);
        assert_eq!(cache.full_state()["summary"]["synced"], true);

        // Wanting port 1 while the unit sits on channel 0 desyncs.
        cache.update_active_port(1);
        assert_eq!(cache.full_state()["summary"]["synced"], false);
        cache.update_unit_state(0, fake_state(1));
        assert_eq!(cache.full_state()["summary"]["synced"], true);
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn first_complete_report_bumps_full() {
        let (mut cache, mut rx) = StateCache::new();
        cache.update_unit_state(0, fake_state(0));
        assert!(rx.try_recv().is_err());
        cache.update_unit_atx_leds(0, fake_leds());
        assert_eq!(rx.try_recv().unwrap(), MASK_FULL);
    }
}
