//! Persistent switch entities: EDID set, neopixel colors and the
//! per-port attribute dictionaries. Every packable entity carries its
//! CRC16 so the chain worker can compare against what units report.

use std::collections::{BTreeMap, HashMap};

use kvmd_core::crc16;
use kvmd_edid::MonitorInfo;

use crate::SwitchError;

pub const DEFAULT_EDID_ID: &str = "default";
pub const DEFAULT_EDID_NAME: &str = "Default";

#[derive(Debug, Clone, PartialEq)]
pub struct Edid {
    pub name: String,
    data: Vec<u8>,
    packed: [u8; 256],
    pub crc: u16,
    pub valid: bool,
    pub info: Option<MonitorInfo>,
}

impl Edid {
    /// Builds from raw bytes (128 or 256 of them, or empty = invalid).
    pub fn from_bytes(name: &str, data: &[u8]) -> Result<Self, SwitchError> {
        let data = if data.is_empty() { vec![0u8; 256] } else { data.to_vec() };
        if data.len() != 128 && data.len() != 256 {
            return Err(SwitchError::Operation(format!(
                "EDID must be 128 or 256 bytes, got {}",
                data.len()
            )));
        }
        let mut packed = [0u8; 256];
        packed[..data.len()].copy_from_slice(&data);
        let crc = crc16(&packed);
        let valid = kvmd_edid::is_header_valid(&data);
        let info = MonitorInfo::parse(&data);
        Ok(Self {
            name: name.to_owned(),
            data,
            packed,
            crc,
            valid,
            info,
        })
    }

    /// Accepts the validated 256/512-hex textual form.
    pub fn from_hex(name: &str, hex: &str) -> Result<Self, SwitchError> {
        let mut data = Vec::with_capacity(hex.len() / 2);
        let compact: Vec<char> = hex.chars().filter(|ch| !ch.is_whitespace()).collect();
        if compact.len() % 2 != 0 {
            return Err(SwitchError::Operation("odd hex length in EDID".to_owned()));
        }
        for pair in compact.chunks(2) {
            let high = pair[0].to_digit(16);
            let low = pair[1].to_digit(16);
            match (high, low) {
                (Some(high), Some(low)) => data.push(((high << 4) | low) as u8),
                _ => return Err(SwitchError::Operation("bad hex digit in EDID".to_owned())),
            }
        }
        Self::from_bytes(name, &data)
    }

    pub fn empty(name: &str) -> Self {
        Self::from_bytes(name, &[]).expect("empty EDID is always valid to build")
    }

    pub fn as_text(&self) -> String {
        self.data.iter().map(|byte| format!("{byte:02X}")).collect()
    }

    pub fn pack(&self) -> &[u8; 256] {
        &self.packed
    }
}

/// EDID id → blob plus port assignments (absence means default).
#[derive(Debug, Clone, PartialEq)]
pub struct Edids {
    pub all: HashMap<String, Edid>,
    pub port: BTreeMap<u32, String>,
}

impl Default for Edids {
    fn default() -> Self {
        let mut all = HashMap::new();
        all.insert(DEFAULT_EDID_ID.to_owned(), Edid::empty(DEFAULT_EDID_NAME));
        Self {
            all,
            port: BTreeMap::new(),
        }
    }
}

impl Edids {
    pub fn set_default(&mut self, edid: Edid) {
        self.all.insert(DEFAULT_EDID_ID.to_owned(), edid);
    }

    pub fn add(&mut self, edid: Edid) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.all.insert(id.clone(), edid);
        id
    }

    pub fn set(&mut self, id: &str, edid: Edid) -> Result<(), SwitchError> {
        if !self.all.contains_key(id) {
            return Err(SwitchError::UnknownEdid);
        }
        self.all.insert(id.to_owned(), edid);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Edid> {
        self.all.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.all.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<(), SwitchError> {
        if id == DEFAULT_EDID_ID || self.all.remove(id).is_none() {
            return Err(SwitchError::UnknownEdid);
        }
        self.port.retain(|_, assigned| assigned != id);
        Ok(())
    }

    pub fn assign(&mut self, port: u32, id: &str) -> Result<(), SwitchError> {
        if !self.all.contains_key(id) {
            return Err(SwitchError::UnknownEdid);
        }
        if id == DEFAULT_EDID_ID {
            self.port.remove(&port);
        } else {
            self.port.insert(port, id.to_owned());
        }
        Ok(())
    }

    pub fn id_for_port(&self, port: u32) -> &str {
        self.port.get(&port).map(String::as_str).unwrap_or(DEFAULT_EDID_ID)
    }

    pub fn for_port(&self, port: u32) -> &Edid {
        self.all
            .get(self.id_for_port(port))
            .unwrap_or_else(|| &self.all[DEFAULT_EDID_ID])
    }

    pub fn compare_on_ports(&self, other: &Edids, ports: u32) -> bool {
        (0..ports).all(|port| self.id_for_port(port) == other.id_for_port(port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: u8,
    pub blink_ms: u16,
    pub crc: u16,
}

impl Color {
    pub fn new(red: u8, green: u8, blue: u8, brightness: u8, blink_ms: u16) -> Self {
        let mut color = Self {
            red,
            green,
            blue,
            brightness,
            blink_ms,
            crc: 0,
        };
        color.crc = crc16(&color.pack());
        color
    }

    pub fn pack(&self) -> [u8; 6] {
        let blink = self.blink_ms.to_le_bytes();
        [self.red, self.green, self.blue, self.brightness, blink[0], blink[1]]
    }
}

/// The five neopixel roles with their factory defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colors {
    pub inactive: Color,
    pub active: Color,
    pub flashing: Color,
    pub beacon: Color,
    pub bootloader: Color,
    pub crc: u16,
}

impl Default for Colors {
    fn default() -> Self {
        Self::new(
            Color::new(255, 0, 0, 64, 0),
            Color::new(0, 255, 0, 128, 0),
            Color::new(0, 170, 255, 128, 0),
            Color::new(228, 44, 156, 255, 250),
            Color::new(255, 170, 0, 128, 0),
        )
    }
}

impl Colors {
    pub fn new(inactive: Color, active: Color, flashing: Color, beacon: Color, bootloader: Color) -> Self {
        let mut crcs = Vec::with_capacity(10);
        for color in [&inactive, &active, &flashing, &beacon, &bootloader] {
            crcs.extend_from_slice(&color.crc.to_le_bytes());
        }
        Self {
            inactive,
            active,
            flashing,
            beacon,
            bootloader,
            crc: crc16(&crcs),
        }
    }

    pub fn pack(&self) -> [u8; 30] {
        let mut out = [0u8; 30];
        for (index, color) in [
            &self.inactive,
            &self.active,
            &self.flashing,
            &self.beacon,
            &self.bootloader,
        ]
        .iter()
        .enumerate()
        {
            out[index * 6..(index + 1) * 6].copy_from_slice(&color.pack());
        }
        out
    }

    pub fn roles() -> [&'static str; 5] {
        ["inactive", "active", "flashing", "beacon", "bootloader"]
    }

    pub fn role(&self, name: &str) -> Option<&Color> {
        match name {
            "inactive" => Some(&self.inactive),
            "active" => Some(&self.active),
            "flashing" => Some(&self.flashing),
            "beacon" => Some(&self.beacon),
            "bootloader" => Some(&self.bootloader),
            _ => None,
        }
    }

    /// Returns a copy with one role replaced; `None` resets that role to
    /// its factory default.
    pub fn with_role(&self, name: &str, color: Option<Color>) -> Self {
        let defaults = Self::default();
        let mut next = *self;
        match name {
            "inactive" => next.inactive = color.unwrap_or(defaults.inactive),
            "active" => next.active = color.unwrap_or(defaults.active),
            "flashing" => next.flashing = color.unwrap_or(defaults.flashing),
            "beacon" => next.beacon = color.unwrap_or(defaults.beacon),
            "bootloader" => next.bootloader = color.unwrap_or(defaults.bootloader),
            _ => {}
        }
        Self::new(next.inactive, next.active, next.flashing, next.beacon, next.bootloader)
    }
}

/// Sparse per-port attribute map storing only non-default entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PortsDict<T: Clone + PartialEq> {
    pub default: T,
    pub kvs: BTreeMap<u32, T>,
}

impl<T: Clone + PartialEq> PortsDict<T> {
    pub fn new(default: T) -> Self {
        Self {
            default,
            kvs: BTreeMap::new(),
        }
    }

    pub fn get(&self, port: u32) -> T {
        self.kvs.get(&port).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// `None` resets the port to the default.
    pub fn set(&mut self, port: u32, value: Option<T>) {
        match value {
            Some(value) if value != self.default => {
                self.kvs.insert(port, value);
            }
            _ => {
                self.kvs.remove(&port);
            }
        }
    }

    pub fn compare_on_ports(&self, other: &Self, ports: u32) -> bool {
        (0..ports).all(|port| self.get(port) == other.get(port))
    }
}

pub type PortNames = PortsDict<String>;
pub type AtxClickPowerDelays = PortsDict<f64>;
pub type AtxClickPowerLongDelays = PortsDict<f64>;
pub type AtxClickResetDelays = PortsDict<f64>;

pub fn default_port_names() -> PortNames {
    PortsDict::new(String::new())
}

pub fn default_atx_cp_delays() -> AtxClickPowerDelays {
    PortsDict::new(0.5)
}

pub fn default_atx_cpl_delays() -> AtxClickPowerLongDelays {
    PortsDict::new(5.5)
}

pub fn default_atx_cr_delays() -> AtxClickResetDelays {
    PortsDict::new(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edid_padding_and_crc() {
        let edid_128 = Edid::from_hex("test", &"00FFFFFFFFFFFF00".repeat(16)).unwrap();
        assert_eq!(edid_128.pack().len(), 256);
        assert_eq!(&edid_128.pack()[128..], &[0u8; 128][..]);
        assert!(edid_128.valid);

        let empty = Edid::empty("Default");
        assert!(!empty.valid);
        assert_ne!(edid_128.crc, empty.crc);
    }

    #[test]
    fn edids_assignment_and_removal() {
        let mut edids = Edids::default();
        let id = edids.add(Edid::empty("one"));
        edids.assign(3, &id).unwrap();
        assert_eq!(edids.id_for_port(3), id);
        assert_eq!(edids.id_for_port(0), DEFAULT_EDID_ID);

        edids.remove(&id).unwrap();
        assert_eq!(edids.id_for_port(3), DEFAULT_EDID_ID);
        assert!(edids.remove(DEFAULT_EDID_ID).is_err());
    }

    #[test]
    fn default_assignment_clears_entry() {
        let mut edids = Edids::default();
        let id = edids.add(Edid::empty("one"));
        edids.assign(1, &id).unwrap();
        edids.assign(1, DEFAULT_EDID_ID).unwrap();
        assert!(edids.port.is_empty());
    }

    #[test]
    fn colors_crc_tracks_components() {
        let defaults = Colors::default();
        let changed = defaults.with_role("beacon", Some(Color::new(1, 2, 3, 4, 5)));
        assert_ne!(defaults.crc, changed.crc);
        let reset = changed.with_role("beacon", None);
        assert_eq!(defaults.crc, reset.crc);
    }

    #[test]
    fn ports_dict_drops_defaults() {
        let mut delays = default_atx_cp_delays();
        delays.set(1, Some(2.0));
        delays.set(2, Some(0.5));
        assert_eq!(delays.kvs.len(), 1);
        assert_eq!(delays.get(1), 2.0);
        assert_eq!(delays.get(2), 0.5);
        delays.set(1, None);
        assert!(delays.kvs.is_empty());
    }
}
