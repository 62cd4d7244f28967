//! Serial physical layer: classic UART or a Pico HID bridge showing up as
//! USB CDC (which genuinely disappears from /dev while rebooting).

use std::path::PathBuf;
use std::time::Duration;

use serialport::SerialPort;

use super::{McuConnection, McuPhy};
use crate::HidError;

#[derive(Debug, Clone)]
pub struct SerialPhyConfig {
    pub device_path: PathBuf,
    pub speed: u32,
    pub read_timeout: Duration,
}

impl Default for SerialPhyConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/kvmd-hid"),
            speed: 115_200,
            read_timeout: Duration::from_secs(2),
        }
    }
}

pub struct SerialPhy {
    config: SerialPhyConfig,
}

impl SerialPhy {
    pub fn new(config: SerialPhyConfig) -> Self {
        Self { config }
    }
}

impl McuPhy for SerialPhy {
    fn has_device(&self) -> bool {
        self.config.device_path.exists()
    }

    fn connect(&mut self) -> Result<Box<dyn McuConnection + '_>, HidError> {
        let port = serialport::new(
            self.config.device_path.to_string_lossy(),
            self.config.speed,
        )
        .timeout(self.config.read_timeout)
        .open()
        .map_err(|err| HidError::Io(format!("can't open serial HID: {err}")))?;
        Ok(Box::new(SerialConnection { port }))
    }

    fn describe(&self) -> String {
        format!("Serial(path={})", self.config.device_path.display())
    }
}

struct SerialConnection {
    port: Box<dyn SerialPort>,
}

impl McuConnection for SerialConnection {
    fn send(&mut self, request: &[u8; 8]) -> Result<Vec<u8>, HidError> {
        debug_assert_eq!(request[0], 0x33);
        let _ = self.port.clear(serialport::ClearBuffer::Input);
        self.port
            .write_all(request)
            .and_then(|()| self.port.flush())
            .map_err(|err| HidError::Io(format!("serial write failed: {err}")))?;

        let mut response = read_upto(&mut *self.port, 4)?;
        // First byte 0x34 announces the extended 8-byte response protocol.
        if response.len() == 4 && response[0] == 0x34 {
            let tail = read_upto(&mut *self.port, 4)?;
            if tail.len() != 4 {
                return Ok(Vec::new());
            }
            response.extend_from_slice(&tail);
        }
        Ok(response)
    }
}

fn read_upto(port: &mut dyn SerialPort, want: usize) -> Result<Vec<u8>, HidError> {
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
            Err(err) => return Err(HidError::Io(format!("serial read failed: {err}"))),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
