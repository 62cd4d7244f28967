//! Reset and power-detect pins of the MCU board.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::HidError;

#[derive(Debug, Clone)]
pub struct GpioConfig {
    pub device_path: PathBuf,
    pub power_detect_pin: Option<u32>,
    pub power_detect_pull_down: bool,
    pub reset_pin: Option<u32>,
    pub reset_inverted: bool,
    pub reset_delay: Duration,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/gpiochip0"),
            power_detect_pin: None,
            power_detect_pull_down: false,
            reset_pin: Some(4),
            reset_inverted: false,
            reset_delay: Duration::from_millis(100),
        }
    }
}

pub struct Gpio {
    config: GpioConfig,
    power: Option<gpiod::Lines<gpiod::Input>>,
    reset: Option<gpiod::Lines<gpiod::Output>>,
    last_power: Option<bool>,
}

impl Gpio {
    pub fn open(config: GpioConfig) -> Result<Self, HidError> {
        let mut power = None;
        let mut reset = None;
        if config.power_detect_pin.is_some() || config.reset_pin.is_some() {
            let chip = gpiod::Chip::new(&config.device_path)
                .map_err(|err| HidError::Io(format!("can't open gpio chip: {err}")))?;
            if let Some(pin) = config.power_detect_pin {
                let mut opts = gpiod::Options::input([pin]);
                if config.power_detect_pull_down {
                    opts = opts.bias(gpiod::Bias::PullDown);
                }
                power = Some(
                    chip.request_lines(opts.consumer("kvmd-hid"))
                        .map_err(|err| HidError::Io(format!("can't request power pin: {err}")))?,
                );
            }
            if let Some(pin) = config.reset_pin {
                let opts = gpiod::Options::output([pin])
                    .values([config.reset_inverted])
                    .consumer("kvmd-hid");
                reset = Some(
                    chip.request_lines(opts)
                        .map_err(|err| HidError::Io(format!("can't request reset pin: {err}")))?,
                );
            }
        }
        Ok(Self {
            config,
            power,
            reset,
            last_power: None,
        })
    }

    /// True when the detect pin says the MCU has power, or unconditionally
    /// when no pin is configured.
    pub fn is_powered(&mut self) -> bool {
        let Some(lines) = &self.power else {
            return true;
        };
        let powered = lines
            .get_values([false; 1])
            .map(|values| values[0])
            .unwrap_or(false);
        if self.last_power != Some(powered) {
            info!(powered, "HID power state changed");
            self.last_power = Some(powered);
        }
        powered
    }

    /// Pulses the reset line. Blocking; runs on the worker thread.
    pub fn reset(&mut self) {
        let Some(lines) = &self.reset else {
            return;
        };
        let inverted = self.config.reset_inverted;
        let _ = lines.set_values([!inverted]);
        std::thread::sleep(self.config.reset_delay);
        let _ = lines.set_values([inverted]);
        std::thread::sleep(Duration::from_secs(1));
        info!("HID reset performed");
    }
}
