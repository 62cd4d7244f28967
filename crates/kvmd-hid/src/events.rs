//! Keyboard/mouse event ADT shared by every backend, plus HID report
//! packing and the absolute-coordinate remapping rules.

use kvmd_validators::MouseButton;

pub const MOUSE_MIN: i32 = -32768;
pub const MOUSE_MAX: i32 = 32767;

/// Maps a value from the configured input range onto the full
/// [-32768, 32767] hardware range: `lo` → -32768, `hi` → 32767, monotonic
/// in between. Inputs outside [lo, hi] clamp.
pub fn remap_to_full(value: i16, lo: i16, hi: i16) -> i16 {
    debug_assert!(lo < hi);
    let value = i32::from(value).clamp(i32::from(lo), i32::from(hi));
    let span_in = i64::from(hi) - i64::from(lo);
    let span_out = i64::from(MOUSE_MAX) - i64::from(MOUSE_MIN);
    let scaled = (i64::from(value) - i64::from(lo)) * span_out / span_in + i64::from(MOUSE_MIN);
    scaled as i16
}

/// Maps a full-range coordinate onto [0, 32767] for absolute reports.
pub fn remap_to_report(value: i16) -> u16 {
    let span_out = i64::from(MOUSE_MAX);
    let span_in = i64::from(MOUSE_MAX) - i64::from(MOUSE_MIN);
    ((i64::from(value) - i64::from(MOUSE_MIN)) * span_out / span_in) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardEvent {
    Clear,
    Reset,
    /// Non-modifier key by USB usage id.
    Key { usb: u8, state: bool },
    /// Modifier by its report bitmask bit.
    Modifier { mask: u8, state: bool },
}

impl KeyboardEvent {
    pub fn from_key(key: &kvmd_keymap::Key, state: bool) -> Self {
        if key.modifier {
            Self::Modifier { mask: key.usb, state }
        } else {
            Self::Key { usb: key.usb, state }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEvent {
    Clear,
    Reset,
    Button { button: MouseButton, state: bool },
    /// Absolute position in the full hardware range.
    Move { to_x: i16, to_y: i16 },
    Relative { dx: i8, dy: i8 },
    Wheel { dx: i8, dy: i8 },
}

/// Keyboard LED bits as reported by the host.
pub fn led_num(flags: u8) -> bool {
    flags & 0x01 != 0
}

pub fn led_caps(flags: u8) -> bool {
    flags & 0x02 != 0
}

pub fn led_scroll(flags: u8) -> bool {
    flags & 0x04 != 0
}

/// Six-slot keyboard model: a modifier bitmap plus up to six concurrently
/// pressed regular keys. Every mutation that changes the report yields it,
/// so one input event can produce several reports (release-then-press).
#[derive(Debug, Default)]
pub struct KeyboardState {
    modifiers: u8,
    slots: [Option<u8>; 6],
}

impl KeyboardState {
    pub fn process(&mut self, event: KeyboardEvent) -> Vec<[u8; 8]> {
        let mut reports = Vec::new();
        match event {
            KeyboardEvent::Clear | KeyboardEvent::Reset => {
                self.clear();
                reports.push(self.report());
            }
            KeyboardEvent::Modifier { mask, state } => {
                if self.modifiers & mask != 0 {
                    // A modifier that is already down gets released first.
                    self.modifiers &= !mask;
                    reports.push(self.report());
                }
                if state {
                    self.modifiers |= mask;
                    reports.push(self.report());
                }
            }
            KeyboardEvent::Key { usb, state } => {
                if let Some(slot) = self.slots.iter().position(|&k| k == Some(usb)) {
                    self.slots[slot] = None;
                    reports.push(self.report());
                } else if state && self.slots.iter().all(Option::is_some) {
                    // No free slot: release everything, then press.
                    self.slots = [None; 6];
                    reports.push(self.report());
                }
                if state {
                    let free = self.slots.iter().position(Option::is_none).expect("free slot");
                    self.slots[free] = Some(usb);
                    reports.push(self.report());
                }
            }
        }
        reports
    }

    pub fn clear(&mut self) {
        self.modifiers = 0;
        self.slots = [None; 6];
    }

    pub fn report(&self) -> [u8; 8] {
        let mut report = [0u8; 8];
        report[0] = self.modifiers;
        for (index, slot) in self.slots.iter().enumerate() {
            report[2 + index] = slot.unwrap_or(0);
        }
        report
    }
}

/// Mouse report builder: button bitmap plus the last absolute position.
#[derive(Debug)]
pub struct MouseState {
    pub absolute: bool,
    pub horizontal_wheel: bool,
    pub win98_fix: bool,
    buttons: u8,
    x: u16,
    y: u16,
}

impl MouseState {
    pub fn new(absolute: bool, horizontal_wheel: bool) -> Self {
        Self {
            absolute,
            horizontal_wheel,
            win98_fix: false,
            buttons: 0,
            x: 0,
            y: 0,
        }
    }

    pub fn process(&mut self, event: MouseEvent) -> Vec<Vec<u8>> {
        let mut reports = Vec::new();
        match event {
            MouseEvent::Clear | MouseEvent::Reset => {
                self.buttons = 0;
                self.x = 0;
                self.y = 0;
                reports.push(self.report(0, 0, 0, 0));
            }
            MouseEvent::Button { button, state } => {
                let mask = button.mask();
                if self.buttons & mask != 0 {
                    self.buttons &= !mask;
                    reports.push(self.report(0, 0, 0, 0));
                }
                if state {
                    self.buttons |= mask;
                    reports.push(self.report(0, 0, 0, 0));
                }
            }
            MouseEvent::Move { to_x, to_y } => {
                if self.absolute {
                    let mut x = remap_to_report(to_x);
                    let mut y = remap_to_report(to_y);
                    if self.win98_fix {
                        // Some hosts interpret the absolute range as 15-bit;
                        // shifting left by one compensates.
                        x <<= 1;
                        y <<= 1;
                    }
                    self.x = x;
                    self.y = y;
                    reports.push(self.report(0, 0, 0, 0));
                }
            }
            MouseEvent::Relative { dx, dy } => {
                if !self.absolute {
                    reports.push(self.report(dx, dy, 0, 0));
                }
            }
            MouseEvent::Wheel { dx, dy } => {
                reports.push(self.report(0, 0, dx, dy));
            }
        }
        reports
    }

    /// The all-released report written on cleanup: zero buttons and wheel,
    /// last absolute position retained.
    pub fn release_report(&self) -> Vec<u8> {
        self.pack(0, 0, 0, 0, 0)
    }

    fn report(&self, dx: i8, dy: i8, wheel_x: i8, wheel_y: i8) -> Vec<u8> {
        self.pack(self.buttons, dx, dy, wheel_x, wheel_y)
    }

    // Wheel Y precedes X in the report layout.
    fn pack(&self, buttons: u8, dx: i8, dy: i8, wheel_x: i8, wheel_y: i8) -> Vec<u8> {
        let mut report = Vec::with_capacity(8);
        report.push(buttons);
        if self.absolute {
            report.extend_from_slice(&self.x.to_le_bytes());
            report.extend_from_slice(&self.y.to_le_bytes());
        } else {
            report.push(dx as u8);
            report.push(dy as u8);
        }
        report.push(wheel_y as u8);
        if self.horizontal_wheel {
            report.push(wheel_x as u8);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_endpoints_and_monotonic() {
        assert_eq!(remap_to_full(-1000, -1000, 1000), -32768);
        assert_eq!(remap_to_full(1000, -1000, 1000), 32767);
        let mut prev = i16::MIN;
        for v in (-1000..=1000).step_by(10) {
            let mapped = remap_to_full(v, -1000, 1000);
            assert!(mapped >= prev);
            prev = mapped;
        }
        // Out-of-range inputs clamp.
        assert_eq!(remap_to_full(-32768, -1000, 1000), -32768);
        assert_eq!(remap_to_full(32767, -1000, 1000), 32767);
    }

    #[test]
    fn report_range_covers_zero_to_max() {
        assert_eq!(remap_to_report(-32768), 0);
        assert_eq!(remap_to_report(32767), 32767);
    }

    #[test]
    fn six_slot_overflow_releases_all() {
        let mut kb = KeyboardState::default();
        for usb in 4..10u8 {
            let reports = kb.process(KeyboardEvent::Key { usb, state: true });
            assert_eq!(reports.len(), 1);
        }
        // Seventh press: release-all report, then the new key alone.
        let reports = kb.process(KeyboardEvent::Key { usb: 10, state: true });
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reports[1], [0, 0, 10, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn repress_releases_first() {
        let mut kb = KeyboardState::default();
        kb.process(KeyboardEvent::Key { usb: 4, state: true });
        let reports = kb.process(KeyboardEvent::Key { usb: 4, state: true });
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reports[1], [0, 0, 4, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn modifier_bitmap() {
        let mut kb = KeyboardState::default();
        let reports = kb.process(KeyboardEvent::Modifier { mask: 0x02, state: true });
        assert_eq!(reports, vec![[0x02, 0, 0, 0, 0, 0, 0, 0]]);
        let reports = kb.process(KeyboardEvent::Modifier { mask: 0x02, state: false });
        assert_eq!(reports, vec![[0x00, 0, 0, 0, 0, 0, 0, 0]]);
    }

    #[test]
    fn absolute_move_report_layout() {
        let mut mouse = MouseState::new(true, true);
        let reports = mouse.process(MouseEvent::Move { to_x: 0, to_y: 0 });
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.len(), 6 + 2);
        assert_eq!(report[0], 0);
        let x = u16::from_le_bytes([report[1], report[2]]);
        let y = u16::from_le_bytes([report[3], report[4]]);
        assert_eq!(x, remap_to_report(0));
        assert_eq!(y, remap_to_report(0));
    }

    #[test]
    fn win98_doubles_report_coordinates() {
        let mut plain = MouseState::new(true, false);
        let mut fixed = MouseState::new(true, false);
        fixed.win98_fix = true;
        let a = plain.process(MouseEvent::Move { to_x: 1234, to_y: -1234 });
        let b = fixed.process(MouseEvent::Move { to_x: 1234, to_y: -1234 });
        let ax = u16::from_le_bytes([a[0][1], a[0][2]]);
        let bx = u16::from_le_bytes([b[0][1], b[0][2]]);
        assert_eq!(bx, ax << 1);
    }

    #[test]
    fn wheel_y_precedes_x() {
        let mut mouse = MouseState::new(false, true);
        let reports = mouse.process(MouseEvent::Wheel { dx: 3, dy: -2 });
        let report = &reports[0];
        // buttons, dx, dy, wheelY, wheelX
        assert_eq!(report[3] as i8, -2);
        assert_eq!(report[4] as i8, 3);
    }

    #[test]
    fn relative_event_ignored_in_absolute_mode() {
        let mut mouse = MouseState::new(true, false);
        assert!(mouse.process(MouseEvent::Relative { dx: 1, dy: 1 }).is_empty());
    }
}
