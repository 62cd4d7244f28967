//! SPI physical layer. The MCU has no flow control here, so the exchange
//! is: drain garbage until an all-zero dummy round-trips, send the
//! request, then clock zeros until the first non-zero byte of the reply
//! shows up and collect eight bytes total.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use tracing::error;

use super::{McuConnection, McuPhy};
use crate::HidError;

#[derive(Debug, Clone)]
pub struct SpiPhyConfig {
    pub bus: u32,
    pub chip: u32,
    pub hw_cs: bool,
    /// Software chip-select line, toggled around transfers.
    pub sw_cs_pin: Option<u32>,
    /// RP2040-class targets need CS raised between individual bytes.
    pub sw_cs_per_byte: bool,
    pub max_freq: u32,
    pub read_timeout: Duration,
    pub gpio_device_path: PathBuf,
}

impl Default for SpiPhyConfig {
    fn default() -> Self {
        Self {
            bus: 0,
            chip: 0,
            hw_cs: false,
            sw_cs_pin: None,
            sw_cs_per_byte: false,
            max_freq: 100_000,
            read_timeout: Duration::from_millis(500),
            gpio_device_path: PathBuf::from("/dev/gpiochip0"),
        }
    }
}

pub struct SpiPhy {
    config: SpiPhyConfig,
}

impl SpiPhy {
    pub fn new(config: SpiPhyConfig) -> Self {
        Self { config }
    }

    fn dev_path(&self) -> String {
        format!("/dev/spidev{}.{}", self.config.bus, self.config.chip)
    }
}

impl McuPhy for SpiPhy {
    fn has_device(&self) -> bool {
        std::path::Path::new(&self.dev_path()).exists()
    }

    fn connect(&mut self) -> Result<Box<dyn McuConnection + '_>, HidError> {
        let mut spi = Spidev::open(self.dev_path())
            .map_err(|err| HidError::Io(format!("can't open SPI HID: {err}")))?;
        let mut mode = SpiModeFlags::SPI_MODE_0;
        if !self.config.hw_cs {
            mode |= SpiModeFlags::SPI_NO_CS;
        }
        spi.configure(
            &SpidevOptions::new()
                .max_speed_hz(self.config.max_freq)
                .mode(mode)
                .build(),
        )
        .map_err(|err| HidError::Io(format!("can't configure SPI HID: {err}")))?;

        let cs = match self.config.sw_cs_pin {
            Some(pin) => {
                let chip = gpiod::Chip::new(&self.config.gpio_device_path)
                    .map_err(|err| HidError::Io(format!("can't open gpio chip: {err}")))?;
                Some(
                    chip.request_lines(gpiod::Options::output([pin]).values([true]).consumer("kvmd-hid"))
                        .map_err(|err| HidError::Io(format!("can't request SPI CS pin: {err}")))?,
                )
            }
            None => None,
        };

        Ok(Box::new(SpiConnection {
            spi,
            cs,
            per_byte_cs: self.config.sw_cs_per_byte,
            read_timeout: self.config.read_timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("SPI(bus={}, chip={})", self.config.bus, self.config.chip)
    }
}

struct SpiConnection {
    spi: Spidev,
    cs: Option<gpiod::Lines<gpiod::Output>>,
    per_byte_cs: bool,
    read_timeout: Duration,
}

impl SpiConnection {
    fn xfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        if self.per_byte_cs {
            let mut out = Vec::with_capacity(tx.len());
            for &byte in tx {
                out.extend_from_slice(&self.xfer_block(&[byte])?);
            }
            Ok(out)
        } else {
            self.xfer_block(tx)
        }
    }

    fn xfer_block(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        if let Some(cs) = &self.cs {
            let _ = cs.set_values([false]);
        }
        let result = {
            let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
            self.spi.transfer(&mut transfer)
        };
        if let Some(cs) = &self.cs {
            let _ = cs.set_values([true]);
        }
        result?;
        Ok(rx)
    }
}

impl McuConnection for SpiConnection {
    fn send(&mut self, request: &[u8; 8]) -> Result<Vec<u8>, HidError> {
        debug_assert_eq!(request[0], 0x33);

        // Drain whatever the MCU still has clocked out.
        let dummy = [0u8; 10];
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let echoed = self
                .xfer(&dummy)
                .map_err(|err| HidError::Io(format!("SPI transfer failed: {err}")))?;
            if echoed.iter().all(|&byte| byte == 0) {
                break;
            }
            if Instant::now() >= deadline {
                error!("SPI timeout reached while garbage reading");
                return Ok(Vec::new());
            }
        }

        self.xfer(request)
            .map_err(|err| HidError::Io(format!("SPI transfer failed: {err}")))?;

        let mut response: Vec<u8> = Vec::with_capacity(8);
        let mut found = false;
        let deadline = Instant::now() + self.read_timeout;
        while response.len() < 8 {
            let chunk = self
                .xfer(&vec![0u8; 9 - response.len()])
                .map_err(|err| HidError::Io(format!("SPI transfer failed: {err}")))?;
            for byte in chunk {
                if !found {
                    if byte == 0 {
                        continue;
                    }
                    found = true;
                }
                response.push(byte);
                if response.len() == 8 {
                    break;
                }
            }
            if response.len() < 8 && Instant::now() >= deadline {
                error!("SPI timeout reached while waiting for response");
                return Ok(Vec::new());
            }
        }
        Ok(response)
    }
}
