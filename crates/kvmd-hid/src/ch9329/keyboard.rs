//! CH9329 keyboard command builder. The chip accepts a raw 8-byte USB
//! report in a CMD_SEND_KB_GENERAL_DATA (0x02) frame, so the six-slot
//! model is emulated here.

pub struct Keyboard {
    modifiers: u8,
    active: Vec<u8>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            modifiers: 0,
            active: Vec::with_capacity(6),
        }
    }

    /// Applies a key transition and returns the command payload to queue.
    pub fn key(&mut self, usb: u8, modifier: bool, state: bool) -> Vec<u8> {
        if state {
            if modifier {
                self.modifiers |= usb;
            } else if self.active.len() < 6 && !self.active.contains(&usb) {
                self.active.push(usb);
            }
        } else if modifier {
            self.modifiers &= !usb;
        } else {
            self.active.retain(|&code| code != usb);
        }
        self.command()
    }

    pub fn clear(&mut self) -> Vec<u8> {
        self.modifiers = 0;
        self.active.clear();
        self.command()
    }

    fn command(&self) -> Vec<u8> {
        let mut cmd = vec![0x00, 0x02, 0x08, self.modifiers, 0x00, 0, 0, 0, 0, 0, 0];
        for (index, &code) in self.active.iter().enumerate() {
            cmd[5 + index] = code;
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_release_cycle() {
        let mut kb = Keyboard::new();
        let cmd = kb.key(0x04, false, true);
        assert_eq!(&cmd[3..], &[0x00, 0x00, 0x04, 0, 0, 0, 0, 0]);
        let cmd = kb.key(0xE0 & 0x01, true, true); // ControlLeft mask
        assert_eq!(cmd[3], 0x01);
        let cmd = kb.key(0x04, false, false);
        assert_eq!(&cmd[5..], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn slot_limit_is_six() {
        let mut kb = Keyboard::new();
        for usb in 4..=10u8 {
            kb.key(usb, false, true);
        }
        let cmd = kb.key(11, false, true);
        // Slots stay at the first six pressed keys.
        assert_eq!(&cmd[5..], &[4, 5, 6, 7, 8, 9]);
    }
}
