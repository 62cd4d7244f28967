//! User-GPIO driver family: the direct chardev driver plus an HTTP
//! adapter for web-controlled power outlets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info};

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::reader::{LineReader, PinParams};
use crate::GpioError;

#[async_trait]
pub trait UserGpioDriver: Send + Sync {
    /// Claims hardware after all pins are registered.
    fn prepare(&self) -> Result<(), GpioError>;

    /// Long-running poll loop, if the driver needs one.
    async fn run(self: Arc<Self>);

    async fn cleanup(&self);

    fn register_input(&self, pin: &str, inverted: bool, debounce: Duration) -> Result<(), GpioError>;

    fn register_output(&self, pin: &str, inverted: bool, initial: Option<bool>) -> Result<(), GpioError>;

    async fn read(&self, pin: &str) -> Result<bool, GpioError>;

    async fn write(&self, pin: &str, state: bool) -> Result<(), GpioError>;
}

// ===== Direct chardev driver.

pub struct GpioChardevDriver {
    device_path: PathBuf,
    notifier: Arc<Notifier>,
    inputs: Mutex<HashMap<u32, PinParams>>,
    outputs: Mutex<HashMap<u32, OutputPin>>,
    reader: Mutex<Option<Arc<LineReader>>>,
}

struct OutputPin {
    inverted: bool,
    initial: Option<bool>,
    lines: Option<gpiod::Lines<gpiod::Output>>,
    state: bool,
}

impl GpioChardevDriver {
    pub fn new(device_path: PathBuf, notifier: Arc<Notifier>) -> Self {
        Self {
            device_path,
            notifier,
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
        }
    }

    fn parse_pin(pin: &str) -> Result<u32, GpioError> {
        pin.trim()
            .parse()
            .map_err(|_| GpioError::Config(format!("bad GPIO pin {pin:?}")))
    }
}

#[async_trait]
impl UserGpioDriver for GpioChardevDriver {
    fn prepare(&self) -> Result<(), GpioError> {
        let inputs = self.inputs.lock().clone();
        if !inputs.is_empty() {
            *self.reader.lock() = Some(Arc::new(LineReader::spawn(
                self.device_path.clone(),
                "kvmd-gpio-inputs",
                inputs,
                self.notifier.clone(),
            )));
        }

        let mut outputs = self.outputs.lock();
        if !outputs.is_empty() {
            let chip = gpiod::Chip::new(&self.device_path)
                .map_err(|err| GpioError::Hardware(format!("can't open gpio chip: {err}")))?;
            for (&pin, output) in outputs.iter_mut() {
                let initial = output.initial.unwrap_or(false) ^ output.inverted;
                let lines = chip
                    .request_lines(
                        gpiod::Options::output([pin])
                            .values([initial])
                            .consumer("kvmd-gpio-outputs"),
                    )
                    .map_err(|err| {
                        GpioError::Hardware(format!("can't request output pin {pin}: {err}"))
                    })?;
                output.lines = Some(lines);
                output.state = output.initial.unwrap_or(false);
            }
        }
        info!(device = %self.device_path.display(), "gpio driver prepared");
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        // The reader thread does the watching; nothing to poll here.
        std::future::pending::<()>().await;
    }

    async fn cleanup(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.stop().await;
        }
        self.outputs.lock().values_mut().for_each(|output| output.lines = None);
    }

    fn register_input(&self, pin: &str, inverted: bool, debounce: Duration) -> Result<(), GpioError> {
        let pin = Self::parse_pin(pin)?;
        self.inputs.lock().insert(pin, PinParams { inverted, debounce });
        Ok(())
    }

    fn register_output(&self, pin: &str, inverted: bool, initial: Option<bool>) -> Result<(), GpioError> {
        let pin = Self::parse_pin(pin)?;
        self.outputs.lock().insert(
            pin,
            OutputPin {
                inverted,
                initial,
                lines: None,
                state: initial.unwrap_or(false),
            },
        );
        Ok(())
    }

    async fn read(&self, pin: &str) -> Result<bool, GpioError> {
        let pin = Self::parse_pin(pin)?;
        if self.inputs.lock().contains_key(&pin) {
            let reader = self.reader.lock().clone();
            return Ok(reader.map(|reader| reader.get(pin)).unwrap_or(false));
        }
        Ok(self.outputs.lock().get(&pin).map(|output| output.state).unwrap_or(false))
    }

    async fn write(&self, pin: &str, state: bool) -> Result<(), GpioError> {
        let pin = Self::parse_pin(pin)?;
        let mut outputs = self.outputs.lock();
        let output = outputs
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Config(format!("pin {pin} is not an output")))?;
        let lines = output
            .lines
            .as_ref()
            .ok_or_else(|| GpioError::Hardware("output pins are not prepared".to_owned()))?;
        lines
            .set_values([state ^ output.inverted])
            .map_err(|err| GpioError::Hardware(format!("can't write pin {pin}: {err}")))?;
        output.state = state;
        drop(outputs);
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(())
    }
}

// ===== HTTP power-outlet driver.

pub struct HttpOutletDriver {
    base_url: String,
    user: String,
    passwd: String,
    poll_interval: Duration,
    client: reqwest::Client,
    notifier: Arc<Notifier>,
    states: Mutex<HashMap<String, bool>>,
}

impl HttpOutletDriver {
    pub fn new(
        base_url: String,
        user: String,
        passwd: String,
        poll_interval: Duration,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            base_url,
            user,
            passwd,
            poll_interval,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            notifier,
            states: Mutex::new(HashMap::new()),
        }
    }

    async fn poll_states(&self) -> Result<(), GpioError> {
        let url = format!("{}/state", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.passwd))
            .send()
            .await
            .map_err(|err| GpioError::Hardware(format!("outlet poll failed: {err}")))?;
        let parsed: HashMap<String, bool> = response
            .json()
            .await
            .map_err(|err| GpioError::Hardware(format!("bad outlet state payload: {err}")))?;
        let changed = {
            let mut states = self.states.lock();
            let changed = *states != parsed;
            *states = parsed;
            changed
        };
        if changed {
            self.notifier.notify(NOTIFY_CHANGED);
        }
        Ok(())
    }
}

#[async_trait]
impl UserGpioDriver for HttpOutletDriver {
    fn prepare(&self) -> Result<(), GpioError> {
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.poll_states().await {
                error!(%err, "outlet driver poll error");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cleanup(&self) {}

    fn register_input(&self, pin: &str, _inverted: bool, _debounce: Duration) -> Result<(), GpioError> {
        self.states.lock().insert(pin.to_owned(), false);
        Ok(())
    }

    fn register_output(&self, pin: &str, _inverted: bool, _initial: Option<bool>) -> Result<(), GpioError> {
        self.states.lock().insert(pin.to_owned(), false);
        Ok(())
    }

    async fn read(&self, pin: &str) -> Result<bool, GpioError> {
        Ok(self.states.lock().get(pin).copied().unwrap_or(false))
    }

    async fn write(&self, pin: &str, state: bool) -> Result<(), GpioError> {
        let url = format!(
            "{}/set?channel={}&state={}",
            self.base_url.trim_end_matches('/'),
            pin,
            u8::from(state),
        );
        self.client
            .post(&url)
            .basic_auth(&self.user, Some(&self.passwd))
            .send()
            .await
            .map_err(|err| GpioError::Hardware(format!("outlet switch failed: {err}")))?
            .error_for_status()
            .map_err(|err| GpioError::Hardware(format!("outlet refused switch: {err}")))?;
        self.states.lock().insert(pin.to_owned(), state);
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(())
    }
}
