use crate::{basic, raise, Result};

pub fn valid_hid_keyboard_output(arg: &str) -> Result<String> {
    basic::valid_string_in_list(arg, "keyboard output", &["usb", "ps2", "disabled"])
}

pub fn valid_hid_mouse_output(arg: &str) -> Result<String> {
    basic::valid_string_in_list(
        arg,
        "mouse output",
        &["usb", "usb_win98", "usb_rel", "ps2", "disabled"],
    )
}

/// Validates a web key name against the keymap.
pub fn valid_hid_key(arg: &str) -> Result<&'static kvmd_keymap::Key> {
    match kvmd_keymap::by_web(arg.trim()) {
        Some(key) => Ok(key),
        None => raise(arg, "keyboard key"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    /// "Back" on most mice.
    Up,
    /// "Forward".
    Down,
}

impl MouseButton {
    /// Bit in the HID buttons byte.
    pub fn mask(self) -> u8 {
        match self {
            Self::Left => 0x01,
            Self::Right => 0x02,
            Self::Middle => 0x04,
            Self::Up => 0x08,
            Self::Down => 0x10,
        }
    }
}

pub fn valid_hid_mouse_button(arg: &str) -> Result<MouseButton> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "left" => Ok(MouseButton::Left),
        "right" => Ok(MouseButton::Right),
        "middle" => Ok(MouseButton::Middle),
        "up" => Ok(MouseButton::Up),
        "down" => Ok(MouseButton::Down),
        _ => raise(arg, "mouse button"),
    }
}

/// Absolute coordinate, clamped into [-32768, 32767].
pub fn valid_hid_mouse_move(arg: &str) -> Result<i16> {
    let value = basic::valid_int(arg, None, None, "mouse move")?;
    Ok(value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16)
}

/// Relative/wheel delta, clamped into [-127, 127].
pub fn valid_hid_mouse_delta(arg: &str) -> Result<i8> {
    let value = basic::valid_int(arg, None, None, "mouse delta")?;
    Ok(value.clamp(-127, 127) as i8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        assert_eq!(valid_hid_key("KeyA").unwrap().web, "KeyA");
        assert!(valid_hid_key("KeyÄ").is_err());
    }

    #[test]
    fn moves_clamp() {
        assert_eq!(valid_hid_mouse_move("40000"), Ok(32767));
        assert_eq!(valid_hid_mouse_move("-40000"), Ok(-32768));
        assert_eq!(valid_hid_mouse_move("15"), Ok(15));
        assert!(valid_hid_mouse_move("abc").is_err());
    }

    #[test]
    fn deltas_clamp() {
        assert_eq!(valid_hid_mouse_delta("-1000"), Ok(-127));
        assert_eq!(valid_hid_mouse_delta("127"), Ok(127));
    }

    #[test]
    fn buttons() {
        assert_eq!(valid_hid_mouse_button("left"), Ok(MouseButton::Left));
        assert_eq!(MouseButton::Down.mask(), 0x10);
        assert!(valid_hid_mouse_button("side").is_err());
    }
}
