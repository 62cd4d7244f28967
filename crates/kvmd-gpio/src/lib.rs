//! User-facing GPIO: named channels mapped onto pluggable drivers, plus
//! the ATX power-control component built from the same parts.

pub mod atx;
pub mod drivers;
pub mod reader;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use kvmd_core::{ApiError, ExclusiveRegion, Notifier, NOTIFY_CHANGED};

use drivers::UserGpioDriver;

pub use atx::{Atx, AtxConfig, AtxLeds, AtxState};
pub use drivers::{GpioChardevDriver, HttpOutletDriver};

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Hardware(String),
}

impl From<GpioError> for ApiError {
    fn from(err: GpioError) -> Self {
        match err {
            GpioError::Config(msg) => ApiError::Operation(msg),
            GpioError::Hardware(msg) => ApiError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChannelMode {
    Input {
        debounce: Duration,
    },
    Output {
        initial: Option<bool>,
        /// Default pulse length; zero means latching-only.
        pulse_delay: Duration,
        max_pulse_delay: Duration,
        switchable: bool,
        pulsable: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub id: String,
    pub driver: String,
    pub pin: String,
    pub inverted: bool,
    pub mode: ChannelMode,
}

struct Channel {
    config: ChannelConfig,
    driver: Arc<dyn UserGpioDriver>,
    region: ExclusiveRegion,
}

pub struct UserGpio {
    channels: BTreeMap<String, Channel>,
    drivers: BTreeMap<String, Arc<dyn UserGpioDriver>>,
    notifier: Arc<Notifier>,
}

impl UserGpio {
    pub fn new(
        drivers: BTreeMap<String, Arc<dyn UserGpioDriver>>,
        channels: Vec<ChannelConfig>,
        notifier: Arc<Notifier>,
    ) -> Result<Self, GpioError> {
        let mut map = BTreeMap::new();
        for config in channels {
            let driver = drivers
                .get(&config.driver)
                .cloned()
                .ok_or_else(|| GpioError::Config(format!("unknown GPIO driver {:?}", config.driver)))?;
            match &config.mode {
                ChannelMode::Input { debounce } => {
                    driver.register_input(&config.pin, config.inverted, *debounce)?;
                }
                ChannelMode::Output { initial, .. } => {
                    driver.register_output(&config.pin, config.inverted, *initial)?;
                }
            }
            map.insert(
                config.id.clone(),
                Channel {
                    config,
                    driver,
                    region: ExclusiveRegion::new(),
                },
            );
        }
        Ok(Self {
            channels: map,
            drivers,
            notifier,
        })
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn sysprep(&self) -> Result<(), GpioError> {
        for driver in self.drivers.values() {
            driver.prepare()?;
        }
        Ok(())
    }

    /// Spawns every driver's poll loop; resolves only on shutdown.
    pub async fn systask(self: Arc<Self>) {
        let tasks: Vec<_> = self
            .drivers
            .values()
            .cloned()
            .map(|driver| tokio::spawn(driver.run()))
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub async fn cleanup(&self) {
        for driver in self.drivers.values() {
            driver.cleanup().await;
        }
    }

    /// Static channel layout for UIs.
    pub fn get_model(&self) -> Value {
        let mut inputs = serde_json::Map::new();
        let mut outputs = serde_json::Map::new();
        for (id, channel) in &self.channels {
            match &channel.config.mode {
                ChannelMode::Input { .. } => {
                    inputs.insert(id.clone(), json!({"hw": {"driver": channel.config.driver, "pin": channel.config.pin}}));
                }
                ChannelMode::Output {
                    pulse_delay,
                    max_pulse_delay,
                    switchable,
                    pulsable,
                    ..
                } => {
                    outputs.insert(
                        id.clone(),
                        json!({
                            "hw": {"driver": channel.config.driver, "pin": channel.config.pin},
                            "switch": switchable,
                            "pulse": {
                                "delay": pulse_delay.as_secs_f64(),
                                "min_delay": 0,
                                "max_delay": max_pulse_delay.as_secs_f64(),
                                "available": pulsable,
                            },
                        }),
                    );
                }
            }
        }
        json!({"scheme": {"inputs": inputs, "outputs": outputs}})
    }

    pub async fn get_state(&self) -> Value {
        let mut inputs = serde_json::Map::new();
        let mut outputs = serde_json::Map::new();
        for (id, channel) in &self.channels {
            let read = channel.driver.read(&channel.config.pin).await;
            let (online, state) = match read {
                Ok(state) => (true, state),
                Err(_) => (false, false),
            };
            match &channel.config.mode {
                ChannelMode::Input { .. } => {
                    inputs.insert(id.clone(), json!({"online": online, "state": state}));
                }
                ChannelMode::Output { .. } => {
                    outputs.insert(
                        id.clone(),
                        json!({"online": online, "state": state, "busy": channel.region.is_busy()}),
                    );
                }
            }
        }
        json!({"inputs": inputs, "outputs": outputs})
    }

    pub async fn switch(&self, channel_id: &str, state: bool, wait: bool) -> Result<(), ApiError> {
        let channel = self.output_channel(channel_id)?;
        match &channel.config.mode {
            ChannelMode::Output { switchable: true, .. } => {}
            _ => {
                return Err(ApiError::Operation(format!(
                    "channel {channel_id:?} is not switchable"
                )))
            }
        }
        let _guard = channel
            .region
            .try_enter()
            .ok_or_else(|| ApiError::Busy(format!("channel {channel_id:?} is busy")))?;
        let result = channel.driver.write(&channel.config.pin, state).await;
        self.notifier.notify(NOTIFY_CHANGED);
        let _ = wait; // A plain switch has nothing further to wait for.
        result.map_err(ApiError::from)
    }

    pub async fn pulse(&self, channel_id: &str, delay: Option<f64>, wait: bool) -> Result<(), ApiError> {
        let channel = self.output_channel(channel_id)?;
        let (default_delay, max_delay) = match &channel.config.mode {
            ChannelMode::Output {
                pulsable: true,
                pulse_delay,
                max_pulse_delay,
                ..
            } => (*pulse_delay, *max_pulse_delay),
            _ => {
                return Err(ApiError::Operation(format!(
                    "channel {channel_id:?} is not pulsable"
                )))
            }
        };
        let delay = match delay {
            Some(seconds) if seconds > 0.0 => Duration::from_secs_f64(seconds).min(max_delay),
            _ => default_delay,
        };

        let guard = channel
            .region
            .try_enter()
            .ok_or_else(|| ApiError::Busy(format!("channel {channel_id:?} is busy")))?;
        self.notifier.notify(NOTIFY_CHANGED);

        let driver = channel.driver.clone();
        let pin = channel.config.pin.clone();
        let notifier = self.notifier.clone();
        let pulse = async move {
            let result = async {
                driver.write(&pin, true).await?;
                tokio::time::sleep(delay).await;
                driver.write(&pin, false).await
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
                    error!(%err, "gpio pulse failed");
                }
            });
            Ok(())
        }
    }

    fn output_channel(&self, channel_id: &str) -> Result<&Channel, ApiError> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| ApiError::Validator(format!("unknown GPIO channel {channel_id:?}")))?;
        match channel.config.mode {
            ChannelMode::Output { .. } => Ok(channel),
            ChannelMode::Input { .. } => Err(ApiError::Operation(format!(
                "channel {channel_id:?} is not an output"
            ))),
        }
    }
}
