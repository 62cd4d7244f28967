//! Serial transport to the first unit of the chain. Owned exclusively by
//! the chain worker thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serialport::SerialPort;

use crate::proto::{self, Response};
use crate::types::{Colors, Edid};
use crate::SwitchError;

const SPEED: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Device {
    path: PathBuf,
    rid: u16,
    port: Option<Box<dyn SerialPort>>,
    buf: Vec<u8>,
}

impl Device {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            rid: rand::thread_rng().gen_range(1..=0xFFFF),
            port: None,
            buf: Vec::new(),
        }
    }

    pub fn has_device(&self) -> bool {
        self.path.exists()
    }

    pub fn open(&mut self) -> Result<(), SwitchError> {
        let port = serialport::new(self.path.to_string_lossy(), SPEED)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| SwitchError::Device(format!("can't open switch tty: {err}")))?;
        self.port = Some(port);
        self.buf.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        self.port = None;
        self.buf.clear();
    }

    /// Blocks up to the read timeout, then parses every complete frame
    /// received so far. An empty result just means a quiet line.
    pub fn read_all(&mut self) -> Result<Vec<Response>, SwitchError> {
        let port = self.port.as_mut().expect("device open");
        let mut chunk = [0u8; 4096];
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(SwitchError::Device(format!("switch read failed: {err}"))),
        }
        Ok(proto::extract_frames(&mut self.buf)
            .iter()
            .filter_map(|payload| Response::unpack(payload))
            .collect())
    }

    // ===== Requests. Each returns the request id for completion
    // tracking.

    pub fn request_state(&mut self) -> Result<u16, SwitchError> {
        self.send(proto::OP_STATE, proto::BROADCAST_UNIT, &[])
    }

    pub fn request_atx_leds(&mut self) -> Result<u16, SwitchError> {
        self.send(proto::OP_ATX_LEDS, proto::BROADCAST_UNIT, &[])
    }

    pub fn request_reboot(&mut self, unit: u8, bootloader: bool) -> Result<u16, SwitchError> {
        let op = if bootloader {
            proto::OP_BOOTLOADER
        } else {
            proto::OP_REBOOT
        };
        self.send(op, unit, &[])
    }

    pub fn request_switch(&mut self, unit: u8, ch: u8) -> Result<u16, SwitchError> {
        self.send(proto::OP_SWITCH, unit, &proto::body_switch(ch))
    }

    pub fn request_beacon(&mut self, unit: u8, ch: u8, on: bool) -> Result<u16, SwitchError> {
        self.send(proto::OP_BEACON, unit, &proto::body_set_beacon(ch, on))
    }

    pub fn request_atx_click_power(&mut self, unit: u8, ch: u8, delay_ms: u16) -> Result<u16, SwitchError> {
        self.send(
            proto::OP_ATX_CLICK,
            unit,
            &proto::body_atx_click(ch, proto::ATX_CLICK_POWER, delay_ms),
        )
    }

    pub fn request_atx_click_reset(&mut self, unit: u8, ch: u8, delay_ms: u16) -> Result<u16, SwitchError> {
        self.send(
            proto::OP_ATX_CLICK,
            unit,
            &proto::body_atx_click(ch, proto::ATX_CLICK_RESET, delay_ms),
        )
    }

    /// Invalid EDIDs translate to CLEAR_EDID.
    pub fn request_set_edid(&mut self, unit: u8, ch: u8, edid: &Edid) -> Result<u16, SwitchError> {
        if edid.valid {
            self.send(proto::OP_SET_EDID, unit, &proto::body_set_edid(ch, edid))
        } else {
            self.send(proto::OP_CLEAR_EDID, unit, &proto::body_clear_edid(ch))
        }
    }

    pub fn request_set_colors(&mut self, unit: u8, np: u8, colors: &Colors) -> Result<u16, SwitchError> {
        self.send(proto::OP_SET_COLORS, unit, &proto::body_set_colors(np, colors))
    }

    pub fn request_set_quirks(&mut self, unit: u8, ignore_hpd: bool) -> Result<u16, SwitchError> {
        self.send(proto::OP_SET_QUIRKS, unit, &proto::body_set_quirks(ignore_hpd))
    }

    fn send(&mut self, op: u8, unit: u8, body: &[u8]) -> Result<u16, SwitchError> {
        let rid = self.next_rid();
        let payload = proto::pack_request(rid, op, unit, body);
        let frame = proto::escape_frame(&payload);
        let port = self.port.as_mut().expect("device open");
        port.write_all(&frame)
            .and_then(|()| port.flush())
            .map_err(|err| SwitchError::Device(format!("switch write failed: {err}")))?;
        Ok(rid)
    }

    fn next_rid(&mut self) -> u16 {
        let rid = self.rid;
        self.rid = if self.rid == 0xFFFF { 1 } else { self.rid + 1 };
        rid
    }
}
