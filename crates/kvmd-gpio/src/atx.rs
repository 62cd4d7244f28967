//! ATX power control over GPIO: power/HDD LED inputs plus pulsed
//! power/reset button outputs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use kvmd_core::{ApiError, ExclusiveRegion, Notifier, NOTIFY_CHANGED, NOTIFY_FULL};
use kvmd_validators::{AtxButton, AtxPowerAction};

use crate::drivers::{GpioChardevDriver, UserGpioDriver};
use crate::reader::{LineReader, PinParams};
use crate::GpioError;

#[derive(Debug, Clone)]
pub struct AtxConfig {
    pub device_path: PathBuf,
    pub power_led_pin: u32,
    pub power_led_inverted: bool,
    pub hdd_led_pin: u32,
    pub hdd_led_inverted: bool,
    pub power_switch_pin: u32,
    pub reset_switch_pin: u32,
    pub click_delay: Duration,
    pub long_click_delay: Duration,
}

impl Default for AtxConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/gpiochip0"),
            power_led_pin: 24,
            power_led_inverted: true,
            hdd_led_pin: 22,
            hdd_led_inverted: true,
            power_switch_pin: 23,
            reset_switch_pin: 27,
            click_delay: Duration::from_millis(100),
            long_click_delay: Duration::from_millis(5500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtxState {
    pub enabled: bool,
    pub busy: bool,
    pub leds: AtxLeds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtxLeds {
    pub power: bool,
    pub hdd: bool,
}

pub struct Atx {
    config: AtxConfig,
    driver: Arc<GpioChardevDriver>,
    reader: parking_lot::Mutex<Option<Arc<LineReader>>>,
    region: ExclusiveRegion,
    notifier: Arc<Notifier>,
}

impl Atx {
    pub fn new(config: AtxConfig, notifier: Arc<Notifier>) -> Result<Self, GpioError> {
        let driver = Arc::new(GpioChardevDriver::new(config.device_path.clone(), notifier.clone()));
        driver.register_output(&config.power_switch_pin.to_string(), false, Some(false))?;
        driver.register_output(&config.reset_switch_pin.to_string(), false, Some(false))?;
        Ok(Self {
            config,
            driver,
            reader: parking_lot::Mutex::new(None),
            region: ExclusiveRegion::new(),
            notifier,
        })
    }

    pub fn sysprep(&self) -> Result<(), GpioError> {
        self.driver.prepare()?;
        let mut pins = HashMap::new();
        pins.insert(
            self.config.power_led_pin,
            PinParams {
                inverted: self.config.power_led_inverted,
                debounce: Duration::from_millis(100),
            },
        );
        pins.insert(
            self.config.hdd_led_pin,
            PinParams {
                inverted: self.config.hdd_led_inverted,
                debounce: Duration::from_millis(100),
            },
        );
        *self.reader.lock() = Some(Arc::new(LineReader::spawn(
            self.config.device_path.clone(),
            "kvmd-atx-leds",
            pins,
            self.notifier.clone(),
        )));
        Ok(())
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn get_state(&self) -> AtxState {
        let reader = self.reader.lock().clone();
        let (power, hdd) = reader
            .map(|reader| {
                (
                    reader.get(self.config.power_led_pin),
                    reader.get(self.config.hdd_led_pin),
                )
            })
            .unwrap_or((false, false));
        AtxState {
            enabled: true,
            busy: self.region.is_busy(),
            leds: AtxLeds { power, hdd },
        }
    }

    pub fn trigger_state(&self) {
        self.notifier.notify(NOTIFY_FULL);
    }

    pub async fn cleanup(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.stop().await;
        }
        self.driver.cleanup().await;
    }

    /// Level-aware power actions: no-ops when the host is already in the
    /// requested state.
    pub async fn power(&self, action: AtxPowerAction, wait: bool) -> Result<(), ApiError> {
        let powered = self.get_state().leds.power;
        let click = match action {
            AtxPowerAction::On if !powered => Some((AtxButton::Power, self.config.click_delay)),
            AtxPowerAction::Off if powered => Some((AtxButton::Power, self.config.click_delay)),
            AtxPowerAction::OffHard if powered => {
                Some((AtxButton::Power, self.config.long_click_delay))
            }
            AtxPowerAction::ResetHard if powered => {
                Some((AtxButton::Reset, self.config.click_delay))
            }
            _ => None,
        };
        match click {
            Some((button, delay)) => self.click_inner(button, delay, wait).await,
            None => Ok(()),
        }
    }

    pub async fn click(&self, button: AtxButton, wait: bool) -> Result<(), ApiError> {
        let delay = match button {
            AtxButton::Power => self.config.click_delay,
            AtxButton::PowerLong => self.config.long_click_delay,
            AtxButton::Reset => self.config.click_delay,
        };
        self.click_inner(button, delay, wait).await
    }

    async fn click_inner(&self, button: AtxButton, delay: Duration, wait: bool) -> Result<(), ApiError> {
        let guard = self
            .region
            .try_enter()
            .ok_or_else(|| ApiError::Busy("performing another ATX operation".to_owned()))?;
        self.notifier.notify(NOTIFY_CHANGED);
        let pin = match button {
            AtxButton::Power | AtxButton::PowerLong => self.config.power_switch_pin,
            AtxButton::Reset => self.config.reset_switch_pin,
        };
        info!(?button, ?delay, "ATX click");

        let driver = self.driver.clone();
        let notifier = self.notifier.clone();
        let pulse = async move {
            let pin = pin.to_string();
            let result = async {
                driver.write(&pin, true).await?;
                tokio::time::sleep(delay).await;
                driver.write(&pin, false).await?;
                // Let the motherboard register the release.
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<(), GpioError>(())
            }
            .await;
            drop(guard);
            notifier.notify(NOTIFY_CHANGED);
            result
        };

        if wait {
            pulse.await.map_err(ApiError::from)
        } else {
            tokio::spawn(async move {
                if let Err(err) = pulse.await {
                    tracing::error!(%err, "ATX click failed");
                }
            });
            Ok(())
        }
    }
}
