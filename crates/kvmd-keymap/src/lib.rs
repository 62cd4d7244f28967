//! Compile-time keyboard table.
//!
//! Each key carries three co-indexed encodings: the web name from
//! `KeyboardEvent.code`, the Linux evdev code, and the USB HID usage.
//! Modifier keys store their report bitmask bit instead of a usage id and
//! are flagged as such. The table is generated from `keymap.csv` at build
//! time; nothing is parsed at runtime.

/// One keymap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub web: &'static str,
    pub evdev: u16,
    /// USB usage id, or the modifier bitmask bit when `modifier` is set.
    pub usb: u8,
    pub modifier: bool,
    /// Code understood by the MCU firmware dialect.
    pub mcu: u8,
    /// Character produced without shift, if the key prints one (US layout).
    pub plain: Option<char>,
    /// Character produced with shift held.
    pub shifted: Option<char>,
}

include!(concat!(env!("OUT_DIR"), "/keymap_table.rs"));

/// Looks a key up by its web name (`"KeyA"`, `"ShiftLeft"`, ...).
pub fn by_web(name: &str) -> Option<&'static Key> {
    BY_WEB
        .binary_search_by(|&i| KEYS[i as usize].web.cmp(name))
        .ok()
        .map(|pos| &KEYS[BY_WEB[pos] as usize])
}

/// Looks a key up by its evdev code.
pub fn by_evdev(code: u16) -> Option<&'static Key> {
    BY_EVDEV
        .binary_search_by(|&i| KEYS[i as usize].evdev.cmp(&code))
        .ok()
        .map(|pos| &KEYS[BY_EVDEV[pos] as usize])
}

/// Maps a printable character to `(key, needs_shift)` for the text
/// printer. Only the US layout is encoded in the table.
pub fn by_char(ch: char) -> Option<(&'static Key, bool)> {
    // 126 entries; a scan is cheaper than maintaining a third index.
    for key in &KEYS {
        if key.plain == Some(ch) {
            return Some((key, false));
        }
        if key.shifted == Some(ch) {
            return Some((key, true));
        }
    }
    None
}

/// All web names, in table order. Used by the validators' error messages.
pub fn web_names() -> impl Iterator<Item = &'static str> {
    KEYS.iter().map(|key| key.web)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_is_a_bijection() {
        let mut webs = HashSet::new();
        let mut evdevs = HashSet::new();
        let mut mcus = HashSet::new();
        let mut usb_regular = HashSet::new();
        let mut usb_modifiers = HashSet::new();
        for key in &KEYS {
            assert!(webs.insert(key.web), "duplicate web name {}", key.web);
            assert!(evdevs.insert(key.evdev), "duplicate evdev code {}", key.evdev);
            assert!(mcus.insert(key.mcu), "duplicate mcu code {}", key.mcu);
            if key.modifier {
                assert_eq!(key.usb.count_ones(), 1, "{} mask is not one bit", key.web);
                assert!(usb_modifiers.insert(key.usb), "duplicate modifier bit {}", key.web);
            } else {
                assert!(usb_regular.insert(key.usb), "duplicate usb usage {}", key.web);
            }
        }
    }

    #[test]
    fn lookups_agree() {
        for key in &KEYS {
            assert_eq!(by_web(key.web), Some(key));
            assert_eq!(by_evdev(key.evdev), Some(key));
        }
        assert!(by_web("NoSuchKey").is_none());
        assert!(by_evdev(9999).is_none());
    }

    #[test]
    fn modifiers_cover_the_whole_mask() {
        let mask: u8 = KEYS.iter().filter(|k| k.modifier).map(|k| k.usb).fold(0, |a, b| a | b);
        assert_eq!(mask, 0xFF);
        assert_eq!(KEYS.iter().filter(|k| k.modifier).count(), 8);
    }

    #[test]
    fn char_lookup_handles_shift() {
        let (key, shift) = by_char('a').unwrap();
        assert_eq!(key.web, "KeyA");
        assert!(!shift);
        let (key, shift) = by_char('A').unwrap();
        assert_eq!(key.web, "KeyA");
        assert!(shift);
        let (key, shift) = by_char('!').unwrap();
        assert_eq!(key.web, "Digit1");
        assert!(shift);
        assert!(by_char('\u{3bb}').is_none());
    }

    #[test]
    fn well_known_codes() {
        let enter = by_web("Enter").unwrap();
        assert_eq!(enter.usb, 0x28);
        assert_eq!(enter.evdev, 28);
        let shift = by_web("ShiftLeft").unwrap();
        assert!(shift.modifier);
        assert_eq!(shift.usb, 0x02);
    }
}
