//! MCU-backed HID: a single worker thread owns the physical link (serial
//! or SPI) and the board's reset/power GPIO lines. All state the async
//! side sees lives in atomics updated by the worker.

mod gpio;
mod proto;
mod serial;
mod spi;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::events::{KeyboardEvent, MouseEvent};
use crate::queue::{event_queue, EventReceiver, EventSender, Recv};
use crate::{BackendState, HidBackend, HidError, KeyboardState, LedsState, MouseState, OutputsState};

pub use gpio::GpioConfig;
pub use proto::{active_keyboard, active_mouse, McuEvent, PongState};
pub use serial::{SerialPhy, SerialPhyConfig};
pub use spi::{SpiPhy, SpiPhyConfig};

/// Physical transport to the MCU.
pub trait McuPhy: Send + 'static {
    fn has_device(&self) -> bool;
    fn connect(&mut self) -> Result<Box<dyn McuConnection + '_>, HidError>;
    fn describe(&self) -> String;
}

pub trait McuConnection {
    /// One request/response exchange. A short or empty reply is not an
    /// error at this layer; the retry discipline above deals with it.
    fn send(&mut self, request: &[u8; 8]) -> Result<Vec<u8>, HidError>;
}

#[derive(Debug, Clone)]
pub struct McuConfig {
    pub gpio: GpioConfig,
    /// The backend resets itself after reporting reset-required (Pico).
    pub reset_self: bool,
    pub read_retries: u32,
    pub common_retries: u32,
    pub retries_delay: Duration,
    /// Errors are buffered until this many accumulate, then logging goes
    /// live. Keeps a flaky cable from flooding the journal.
    pub errors_threshold: usize,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            gpio: GpioConfig::default(),
            reset_self: false,
            read_retries: 5,
            common_retries: 5,
            retries_delay: Duration::from_millis(500),
            errors_threshold: 5,
        }
    }
}

struct Shared {
    online: AtomicBool,
    busy: AtomicBool,
    status: AtomicU32,
}

pub struct McuHid {
    config: McuConfig,
    shared: Arc<Shared>,
    tx: EventSender<McuEvent>,
    reset_required: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
    worker: Mutex<Option<WorkerSeed>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct WorkerSeed {
    phy: Box<dyn McuPhy>,
    rx: EventReceiver<McuEvent>,
}

impl McuHid {
    pub fn new(config: McuConfig, phy: Box<dyn McuPhy>, notifier: Arc<Notifier>) -> Self {
        let (tx, rx) = event_queue();
        Self {
            config,
            shared: Arc::new(Shared {
                online: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                status: AtomicU32::new(0),
            }),
            tx,
            reset_required: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            notifier,
            worker: Mutex::new(Some(WorkerSeed { phy, rx })),
            handle: Mutex::new(None),
        }
    }

    fn queue(&self, event: McuEvent, clear: bool) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        if clear {
            self.tx.clear_and_send(event);
        } else {
            self.tx.send(event);
        }
    }
}

#[async_trait]
impl HidBackend for McuHid {
    fn sysprep(&self) {
        let seed = self.worker.lock().take().expect("MCU worker started twice");
        info!(phy = %seed.phy.describe(), "starting MCU HID worker");
        let worker = Worker {
            config: self.config.clone(),
            phy: seed.phy,
            rx: seed.rx,
            tx: self.tx.clone(),
            shared: self.shared.clone(),
            reset_required: self.reset_required.clone(),
            stop: self.stop.clone(),
            notifier: self.notifier.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("hid-mcu".to_owned())
            .spawn(move || worker.run())
            .expect("failed to spawn MCU HID worker");
        *self.handle.lock() = Some(handle);
    }

    fn state(&self) -> BackendState {
        let online = self.shared.online.load(Ordering::Acquire);
        let pong = PongState::from_status(self.shared.status.load(Ordering::Acquire));

        let active_mouse_name = active_mouse(pong.outputs1);
        let absolute = !(online && matches!(active_mouse_name, "usb_rel" | "ps2"));

        let mut keyboard_outputs = OutputsState::default();
        let mut mouse_outputs = OutputsState::default();
        if pong.dynamic_outputs() {
            if pong.outputs2 & 0b0000_0001 != 0 {
                keyboard_outputs.available.push("usb".to_owned());
                mouse_outputs.available.push("usb".to_owned());
                mouse_outputs.available.push("usb_rel".to_owned());
            }
            if pong.outputs2 & 0b0000_0100 != 0 {
                mouse_outputs.available.push("usb_win98".to_owned());
            }
            if pong.outputs2 & 0b0000_0010 != 0 {
                keyboard_outputs.available.push("ps2".to_owned());
                mouse_outputs.available.push("ps2".to_owned());
            }
            if !keyboard_outputs.available.is_empty() {
                keyboard_outputs.available.push("disabled".to_owned());
            }
            if !mouse_outputs.available.is_empty() {
                mouse_outputs.available.push("disabled".to_owned());
            }
            let active_keyboard_name = active_keyboard(pong.outputs1);
            if keyboard_outputs.available.iter().any(|o| o == active_keyboard_name) {
                keyboard_outputs.active = active_keyboard_name.to_owned();
            }
            if mouse_outputs.available.iter().any(|o| o == active_mouse_name) {
                mouse_outputs.active = active_mouse_name.to_owned();
            }
        }

        BackendState {
            online,
            busy: self.shared.busy.load(Ordering::Acquire),
            connected: pong.connected(),
            keyboard: KeyboardState {
                online: online && !pong.keyboard_offline(),
                leds: LedsState {
                    caps: pong.pong & 0b0000_0001 != 0,
                    scroll: pong.pong & 0b0000_0010 != 0,
                    num: pong.pong & 0b0000_0100 != 0,
                },
                outputs: keyboard_outputs,
            },
            mouse: MouseState {
                online: online && !pong.mouse_offline(),
                absolute,
                outputs: mouse_outputs,
            },
        }
    }

    async fn reset(&self) {
        self.reset_required.store(true, Ordering::Release);
    }

    async fn cleanup(&self) {
        info!("stopping MCU HID worker");
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    fn set_params(&self, keyboard_output: Option<&str>, mouse_output: Option<&str>) {
        let mut events = Vec::new();
        if let Some(output) = keyboard_output {
            events.push(McuEvent::SetKeyboardOutput(output.to_owned()));
        }
        if let Some(output) = mouse_output {
            events.push(McuEvent::SetMouseOutput(output.to_owned()));
        }
        let last = events.len();
        for (index, event) in events.into_iter().enumerate() {
            // Output switching drops everything else on the floor anyway.
            self.queue(event, index + 1 == last);
        }
    }

    fn set_connected(&self, connected: bool) {
        self.queue(McuEvent::SetConnected(connected), true);
    }

    fn send_keyboard_event(&self, event: KeyboardEvent) {
        match event {
            KeyboardEvent::Clear | KeyboardEvent::Reset => self.clear_events(),
            KeyboardEvent::Key { usb, state } => {
                // The MCU dialect wants its own code, resolved via the
                // shared keymap.
                if let Some(key) = kvmd_keymap::KEYS.iter().find(|k| !k.modifier && k.usb == usb) {
                    self.queue(McuEvent::Key { mcu: key.mcu, state }, false);
                }
            }
            KeyboardEvent::Modifier { mask, state } => {
                if let Some(key) = kvmd_keymap::KEYS.iter().find(|k| k.modifier && k.usb == mask) {
                    self.queue(McuEvent::Key { mcu: key.mcu, state }, false);
                }
            }
        }
    }

    fn send_mouse_event(&self, event: MouseEvent) {
        match event {
            MouseEvent::Clear | MouseEvent::Reset => self.clear_events(),
            MouseEvent::Button { button, state } => {
                self.queue(McuEvent::MouseButton { button, state }, false)
            }
            MouseEvent::Move { to_x, to_y } => self.queue(McuEvent::MouseMove { to_x, to_y }, false),
            MouseEvent::Relative { dx, dy } => self.queue(McuEvent::MouseRelative { dx, dy }, false),
            MouseEvent::Wheel { dy, .. } => self.queue(McuEvent::MouseWheel { dy }, false),
        }
    }

    fn clear_events(&self) {
        self.queue(McuEvent::Clear, true);
    }
}

// ===== Worker side.

enum Outcome {
    /// Request acknowledged (or intentionally skipped while unpowered).
    Done,
    /// Retry budget exhausted; caller should drop its queue.
    Failed,
    /// The MCU reboots itself right after this response.
    SelfReset,
    /// Transport error; reconnect.
    ConnectionLost,
}

struct Worker {
    config: McuConfig,
    phy: Box<dyn McuPhy>,
    rx: EventReceiver<McuEvent>,
    tx: EventSender<McuEvent>,
    shared: Arc<Shared>,
    reset_required: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl Worker {
    fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            match gpio::Gpio::open(self.config.gpio.clone()) {
                Ok(mut lines) => {
                    self.hid_loop(&mut lines);
                    if self.stop.load(Ordering::Acquire) && self.phy.has_device() {
                        info!("clearing HID events");
                        if let Ok(mut conn) = self.phy.connect() {
                            let _ = Self::exchange(
                                &mut *conn,
                                &McuEvent::Clear.to_request(),
                                &self.config,
                                &mut lines,
                                &self.shared,
                                &self.reset_required,
                                self.config.reset_self,
                                &self.notifier,
                            );
                        }
                    }
                }
                Err(err) => {
                    error!(%err, "can't open HID GPIO lines");
                }
            }
            if !self.stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn hid_loop(&mut self, lines: &mut gpio::Gpio) {
        let mut reset = true;
        while !self.stop.load(Ordering::Acquire) {
            if !self.wait_device(lines, reset) {
                reset = true;
                continue;
            }
            reset = true;

            let phy = &mut self.phy;
            let mut conn = match phy.connect() {
                Ok(conn) => conn,
                Err(err) => {
                    error!(%err, "can't connect to HID phy");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };

            loop {
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                if self.reset_required.swap(false, Ordering::AcqRel) {
                    self.shared.busy.store(true, Ordering::Release);
                    self.notifier.notify(NOTIFY_CHANGED);
                    // Fall back to wait_device(), which pulses the line.
                    break;
                }
                let request = match self.rx.recv_timeout(Duration::from_millis(100)) {
                    Recv::Event(event) => {
                        if matches!(
                            event,
                            McuEvent::SetKeyboardOutput(_) | McuEvent::SetMouseOutput(_)
                        ) {
                            self.shared.busy.store(true, Ordering::Release);
                            self.notifier.notify(NOTIFY_CHANGED);
                        }
                        event.to_request()
                    }
                    Recv::Timeout => proto::request_ping(),
                    Recv::Disconnected => return,
                };
                match Self::exchange(
                    &mut *conn,
                    &request,
                    &self.config,
                    lines,
                    &self.shared,
                    &self.reset_required,
                    self.config.reset_self,
                    &self.notifier,
                ) {
                    Outcome::Done => {}
                    Outcome::Failed => {
                        warn!("dropping queued HID events after request failure");
                        self.tx.clear_and_send(McuEvent::Clear);
                    }
                    Outcome::SelfReset => {
                        // The MCU restarts on its own shortly after; skip
                        // the reset pulse on re-entry.
                        std::thread::sleep(Duration::from_secs(1));
                        reset = false;
                        break;
                    }
                    Outcome::ConnectionLost => {
                        warn!("dropping queued HID events after transport loss");
                        self.tx.clear_and_send(McuEvent::Clear);
                        std::thread::sleep(Duration::from_secs(1));
                        break;
                    }
                }
            }
        }
    }

    fn wait_device(&mut self, lines: &mut gpio::Gpio, reset: bool) -> bool {
        if reset {
            info!(phy = %self.phy.describe(), "initial HID reset and wait");
            lines.reset();
        }
        for _ in 0..10 {
            if self.phy.has_device() {
                info!(phy = %self.phy.describe(), "physical HID interface found");
                return true;
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        error!(phy = %self.phy.describe(), "missing physical HID interface");
        self.set_online(false);
        false
    }

    fn set_online(&self, online: bool) {
        if self.shared.online.swap(online, Ordering::AcqRel) != online {
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange(
        conn: &mut dyn McuConnection,
        request: &[u8; 8],
        config: &McuConfig,
        lines: &mut gpio::Gpio,
        shared: &Shared,
        reset_required: &AtomicBool,
        reset_self: bool,
        notifier: &Notifier,
    ) -> Outcome {
        let mut request = *request;
        let mut error_messages: Vec<String> = Vec::new();
        let mut live_log = false;
        let mut common_retries = config.common_retries;
        let mut read_retries = config.read_retries;

        while lines.is_powered() && common_retries > 0 && read_retries > 0 {
            let response = match conn.send(&request) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "HID transport error");
                    return Outcome::ConnectionLost;
                }
            };

            let problem: String;
            if response.len() < 4 {
                read_retries -= 1;
                problem = format!("no response from HID: request={request:02X?}");
            } else if !proto::check_response(&response) {
                request = proto::request_repeat();
                problem = "invalid response CRC; requesting response again".to_owned();
            } else {
                match response[1] {
                    proto::RESPONSE_TIMEOUT => {
                        problem = format!("request timeout from HID: request={request:02X?}");
                    }
                    proto::RESPONSE_CRC_ERROR => {
                        problem = format!("HID reported CRC error: request={request:02X?}");
                    }
                    proto::RESPONSE_UNKNOWN_CMD => {
                        error!("HID did not recognize request={request:02X?}");
                        return Outcome::Done;
                    }
                    proto::RESPONSE_REBOOTED => {
                        error!("no previous command state inside HID, it was rebooted");
                        return Outcome::Done;
                    }
                    proto::RESPONSE_LEGACY_OK => {
                        if !shared.online.swap(true, Ordering::AcqRel) {
                            notifier.notify(NOTIFY_CHANGED);
                        }
                        return Outcome::Done;
                    }
                    code if code & 0x80 != 0 => {
                        let pong = PongState {
                            pong: response[1],
                            outputs1: if response.len() > 4 { response[2] } else { 0 },
                            outputs2: if response.len() > 4 { response[3] } else { 0 },
                        };
                        shared.status.store(pong.to_status(), Ordering::Release);
                        shared.online.store(true, Ordering::Release);
                        let reset_needed = pong.reset_required();
                        shared.busy.store(reset_needed, Ordering::Release);
                        notifier.notify(NOTIFY_CHANGED);
                        if reset_needed {
                            if reset_self {
                                return Outcome::SelfReset;
                            }
                            reset_required.store(true, Ordering::Release);
                        }
                        return Outcome::Done;
                    }
                    code => {
                        problem = format!("invalid response from HID: code=0x{code:02X}");
                    }
                }
            }

            common_retries -= 1;
            if live_log {
                error!("{problem}");
            } else {
                error_messages.push(problem);
                if error_messages.len() > config.errors_threshold {
                    for msg in error_messages.drain(..) {
                        error!("{msg}");
                    }
                    live_log = true;
                }
            }

            if shared.online.swap(false, Ordering::AcqRel) {
                notifier.notify(NOTIFY_CHANGED);
            }
            if common_retries > 0 && read_retries > 0 {
                std::thread::sleep(config.retries_delay);
            }
        }

        if !lines.is_powered() {
            // No power, nothing to deliver: report success so callers
            // don't spin.
            if shared.online.swap(false, Ordering::AcqRel) {
                notifier.notify(NOTIFY_CHANGED);
            }
            return Outcome::Done;
        }

        for msg in error_messages {
            error!("{msg}");
        }
        error!("can't process HID request, too many errors: {request:02X?}");
        Outcome::Failed
    }
}
