//! CH9329 serial framing: `0x57 0xAB | payload | checksum`, where the
//! checksum is the low byte of the sum of everything before it.

use std::path::PathBuf;
use std::time::Duration;

use serialport::SerialPort;

use crate::HidError;

pub const GET_INFO: [u8; 3] = [0x00, 0x01, 0x00];

#[derive(Debug, Clone)]
pub struct ChipConfig {
    pub device_path: PathBuf,
    pub speed: u32,
    pub read_timeout: Duration,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/kvmd-hid"),
            speed: 9600,
            read_timeout: Duration::from_millis(300),
        }
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

pub fn frame(cmd: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.len() + 3);
    out.extend_from_slice(&[0x57, 0xAB]);
    out.extend_from_slice(cmd);
    out.push(checksum(&out));
    out
}

pub struct Chip {
    config: ChipConfig,
}

pub struct ChipConnection {
    port: Box<dyn SerialPort>,
}

impl Chip {
    pub fn new(config: ChipConfig) -> Self {
        Self { config }
    }

    pub fn connect(&self) -> Result<ChipConnection, HidError> {
        let port = serialport::new(self.config.device_path.to_string_lossy(), self.config.speed)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|err| HidError::Io(format!("can't open CH9329: {err}")))?;
        Ok(ChipConnection { port })
    }
}

impl ChipConnection {
    /// One command exchange. An empty command polls GET_INFO. Returns the
    /// LED byte when the response carries one.
    pub fn xfer(&mut self, cmd: &[u8]) -> Result<Option<u8>, HidError> {
        let cmd = if cmd.is_empty() { &GET_INFO[..] } else { cmd };
        let request = frame(cmd);
        self.port
            .write_all(&request)
            .and_then(|()| self.port.flush())
            .map_err(|err| HidError::Io(format!("CH9329 write failed: {err}")))?;

        let mut head = [0u8; 5];
        self.read_exact(&mut head)?;
        let payload_len = head[4] as usize;
        let mut rest = vec![0u8; payload_len + 1];
        self.read_exact(&mut rest)?;

        let mut full = head.to_vec();
        full.extend_from_slice(&rest);
        let (body, check) = full.split_at(full.len() - 1);
        if checksum(body) != check[0] {
            return Err(HidError::Io("invalid CH9329 response checksum".to_owned()));
        }
        if payload_len == 1 && full[5] != 0 {
            return Err(HidError::Io(format!("CH9329 error code {:#04x}", full[5])));
        }
        // GET_INFO reply (cmd | 0x80): byte 7 is the LED bitmap.
        if head[3] == 0x81 && full.len() > 7 {
            return Ok(Some(full[7]));
        }
        Ok(None)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), HidError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(HidError::Io(
                        "short CH9329 response, chip might be disconnected".to_owned(),
                    ))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(HidError::Io(
                        "CH9329 response timeout, chip might be disconnected".to_owned(),
                    ))
                }
                Err(err) => return Err(HidError::Io(format!("CH9329 read failed: {err}"))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_byte_sum() {
        assert_eq!(checksum(&[0x57, 0xAB, 0x00, 0x01, 0x00]), 0x03);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn frame_appends_header_and_checksum() {
        let framed = frame(&GET_INFO);
        assert_eq!(&framed[..2], &[0x57, 0xAB]);
        assert_eq!(framed.len(), 6);
        assert_eq!(*framed.last().unwrap(), checksum(&framed[..5]));
    }
}
