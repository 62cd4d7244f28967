//! USB-gadget HID backend: one worker thread per `/dev/hidgN` endpoint
//! (keyboard, mouse, optional alternate mouse with the opposite
//! coordinate mode).

mod device;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::events::{led_caps, led_num, led_scroll, KeyboardEvent, MouseEvent};
use crate::queue::{event_queue, EventReceiver, EventSender};
use crate::{BackendState, HidBackend, KeyboardState, LedsState, MouseState, OutputsState};

pub use device::EndpointConfig;

#[derive(Debug, Clone)]
pub struct OtgConfig {
    /// `/sys/class/udc/<name>/state`; "configured" means a host is
    /// enumerated.
    pub udc_state_path: PathBuf,
    pub keyboard: EndpointConfig,
    pub mouse: EndpointConfig,
    pub mouse_absolute: bool,
    pub mouse_win98_fix: bool,
    pub mouse_horizontal_wheel: bool,
    /// Second mouse endpoint with the opposite coordinate mode.
    pub mouse_alt: Option<EndpointConfig>,
    pub mouse_alt_horizontal_wheel: bool,
}

struct KeyboardPort {
    config: EndpointConfig,
    tx: EventSender<KeyboardEvent>,
    rx: Mutex<Option<EventReceiver<KeyboardEvent>>>,
    online: Arc<AtomicBool>,
    leds: Arc<Mutex<LedsState>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct KeyboardProcessor {
    state: crate::events::KeyboardState,
    leds: Arc<Mutex<LedsState>>,
}

impl device::ReportProcessor for KeyboardProcessor {
    type Event = KeyboardEvent;

    fn process_event(&mut self, event: KeyboardEvent) -> Vec<Vec<u8>> {
        self.state
            .process(event)
            .into_iter()
            .map(|report| report.to_vec())
            .collect()
    }

    fn process_read(&mut self, report: &[u8]) {
        if let Some(&flags) = report.first() {
            *self.leds.lock() = LedsState {
                caps: led_caps(flags),
                scroll: led_scroll(flags),
                num: led_num(flags),
            };
        }
    }

    fn read_size(&self) -> usize {
        1
    }
}

struct MousePort {
    config: EndpointConfig,
    absolute: bool,
    tx: EventSender<MouseEvent>,
    rx: Mutex<Option<EventReceiver<MouseEvent>>>,
    online: Arc<AtomicBool>,
    win98: Arc<AtomicBool>,
    horizontal_wheel: bool,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct MouseProcessor {
    state: crate::events::MouseState,
    win98: Arc<AtomicBool>,
}

impl device::ReportProcessor for MouseProcessor {
    type Event = MouseEvent;

    fn process_event(&mut self, event: MouseEvent) -> Vec<Vec<u8>> {
        self.state.win98_fix = self.win98.load(Ordering::Acquire);
        self.state.process(event)
    }

    fn process_read(&mut self, _report: &[u8]) {}

    fn read_size(&self) -> usize {
        0
    }
}

impl MousePort {
    fn new(config: EndpointConfig, absolute: bool, horizontal_wheel: bool) -> Self {
        let (tx, rx) = event_queue();
        Self {
            config,
            absolute,
            tx,
            rx: Mutex::new(Some(rx)),
            online: Arc::new(AtomicBool::new(false)),
            win98: Arc::new(AtomicBool::new(false)),
            horizontal_wheel,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    fn send_event(&self, event: MouseEvent) {
        match event {
            MouseEvent::Move { .. } if !self.absolute => {}
            MouseEvent::Relative { .. } if self.absolute => {}
            MouseEvent::Clear | MouseEvent::Reset => self.tx.clear_and_send(event),
            _ => self.tx.send(event),
        }
    }

    fn start(&self, name: &'static str, udc_state_path: PathBuf, notify: Arc<dyn Fn() + Send + Sync>) {
        let processor = MouseProcessor {
            state: crate::events::MouseState::new(self.absolute, self.horizontal_wheel),
            win98: self.win98.clone(),
        };
        let worker = device::DeviceWorker::new(
            name,
            self.config.clone(),
            udc_state_path,
            processor,
            self.rx.lock().take().expect("mouse worker started twice"),
            self.online.clone(),
            self.stop.clone(),
            notify,
        );
        let handle = std::thread::Builder::new()
            .name(format!("hid-{name}"))
            .spawn(move || worker.run())
            .expect("failed to spawn HID mouse worker");
        *self.handle.lock() = Some(handle);
    }

    async fn stop_and_release(&self, name: &str) {
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        let release = crate::events::MouseState::new(self.absolute, self.horizontal_wheel).release_report();
        let path = self.config.device_path.clone();
        let name = name.to_owned();
        let _ = tokio::task::spawn_blocking(move || {
            device::write_release_report(&name, &path, &release);
        })
        .await;
    }
}

/// OTG gadget backend.
pub struct OtgHid {
    udc_state_path: PathBuf,
    keyboard: KeyboardPort,
    mouse: MousePort,
    mouse_alt: Option<MousePort>,
    win98_available: bool,
    /// "usb", "usb_rel" or "usb_win98"; empty when there is only one
    /// mouse endpoint.
    active_mouse: Mutex<String>,
    notifier: Arc<Notifier>,
}

impl OtgHid {
    pub fn new(config: OtgConfig, notifier: Arc<Notifier>) -> Self {
        let (kb_tx, kb_rx) = event_queue();
        let keyboard = KeyboardPort {
            config: config.keyboard.clone(),
            tx: kb_tx,
            rx: Mutex::new(Some(kb_rx)),
            online: Arc::new(AtomicBool::new(false)),
            leds: Arc::new(Mutex::new(LedsState::default())),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        };

        let mouse = MousePort::new(
            config.mouse.clone(),
            config.mouse_absolute,
            config.mouse_horizontal_wheel,
        );
        let mouse_alt = config.mouse_alt.clone().map(|alt| {
            MousePort::new(alt, !config.mouse_absolute, config.mouse_alt_horizontal_wheel)
        });

        let active_mouse = if mouse_alt.is_some() {
            if config.mouse_absolute { "usb" } else { "usb_rel" }
        } else {
            ""
        };

        Self {
            udc_state_path: config.udc_state_path,
            keyboard,
            mouse,
            mouse_alt,
            win98_available: config.mouse_win98_fix,
            active_mouse: Mutex::new(active_mouse.to_owned()),
            notifier,
        }
    }

    fn notify_fn(&self) -> Arc<dyn Fn() + Send + Sync> {
        let notifier = self.notifier.clone();
        Arc::new(move || notifier.notify(NOTIFY_CHANGED))
    }

    fn mouse_outputs(&self) -> Vec<String> {
        if self.mouse_alt.is_none() {
            return Vec::new();
        }
        let mut outputs = vec!["usb".to_owned(), "usb_rel".to_owned()];
        if self.win98_available {
            outputs.push("usb_win98".to_owned());
        }
        outputs
    }

    fn port_for(&self, output: &str) -> &MousePort {
        let want_absolute = output != "usb_rel";
        if self.mouse.absolute == want_absolute {
            &self.mouse
        } else {
            self.mouse_alt.as_ref().unwrap_or(&self.mouse)
        }
    }

    fn current_port(&self) -> &MousePort {
        let active = self.active_mouse.lock().clone();
        if active.is_empty() {
            &self.mouse
        } else {
            self.port_for(&active)
        }
    }
}

#[async_trait]
impl HidBackend for OtgHid {
    fn sysprep(&self) {
        info!(udc_state = %self.udc_state_path.display(), "starting OTG HID workers");
        let notify = self.notify_fn();

        let processor = KeyboardProcessor {
            state: crate::events::KeyboardState::default(),
            leds: self.keyboard.leds.clone(),
        };
        let worker = device::DeviceWorker::new(
            "keyboard",
            self.keyboard.config.clone(),
            self.udc_state_path.clone(),
            processor,
            self.keyboard.rx.lock().take().expect("keyboard worker started twice"),
            self.keyboard.online.clone(),
            self.keyboard.stop.clone(),
            notify.clone(),
        );
        let handle = std::thread::Builder::new()
            .name("hid-keyboard".to_owned())
            .spawn(move || worker.run())
            .expect("failed to spawn HID keyboard worker");
        *self.keyboard.handle.lock() = Some(handle);

        self.mouse.start("mouse", self.udc_state_path.clone(), notify.clone());
        if let Some(alt) = &self.mouse_alt {
            alt.start("mouse-alt", self.udc_state_path.clone(), notify);
        }
    }

    fn state(&self) -> BackendState {
        let current = self.current_port();
        let active = self.active_mouse.lock().clone();
        BackendState {
            online: true,
            busy: false,
            connected: None,
            keyboard: KeyboardState {
                online: self.keyboard.online.load(Ordering::Acquire),
                leds: self.keyboard.leds.lock().clone(),
                outputs: OutputsState::default(),
            },
            mouse: MouseState {
                online: current.online.load(Ordering::Acquire),
                absolute: current.absolute,
                outputs: OutputsState {
                    available: self.mouse_outputs(),
                    active,
                },
            },
        }
    }

    async fn reset(&self) {
        self.keyboard.tx.clear_and_send(KeyboardEvent::Reset);
        self.mouse.send_event(MouseEvent::Reset);
        if let Some(alt) = &self.mouse_alt {
            alt.send_event(MouseEvent::Reset);
        }
    }

    async fn cleanup(&self) {
        self.keyboard.stop.store(true, Ordering::Release);
        let handle = self.keyboard.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        let path = self.keyboard.config.device_path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            device::write_release_report("keyboard", &path, &[0u8; 8]);
        })
        .await;

        self.mouse.stop_and_release("mouse").await;
        if let Some(alt) = &self.mouse_alt {
            alt.stop_and_release("mouse-alt").await;
        }
    }

    fn set_params(&self, _keyboard_output: Option<&str>, mouse_output: Option<&str>) {
        let Some(output) = mouse_output else {
            return;
        };
        if self.mouse_alt.is_none() || !self.mouse_outputs().iter().any(|o| o == output) {
            return;
        }
        let mut active = self.active_mouse.lock();
        if *active == output {
            return;
        }
        self.current_port_locked(active.as_str()).send_event(MouseEvent::Clear);
        *active = output.to_owned();
        let port = self.port_for(output);
        port.win98.store(output == "usb_win98", Ordering::Release);
        drop(active);
        self.notifier.notify(NOTIFY_CHANGED);
    }

    fn send_keyboard_event(&self, event: KeyboardEvent) {
        match event {
            KeyboardEvent::Clear | KeyboardEvent::Reset => self.keyboard.tx.clear_and_send(event),
            _ => self.keyboard.tx.send(event),
        }
    }

    fn send_mouse_event(&self, event: MouseEvent) {
        self.current_port().send_event(event);
    }

    fn clear_events(&self) {
        self.keyboard.tx.clear_and_send(KeyboardEvent::Clear);
        self.mouse.send_event(MouseEvent::Clear);
        if let Some(alt) = &self.mouse_alt {
            alt.send_event(MouseEvent::Clear);
        }
    }
}

impl OtgHid {
    fn current_port_locked(&self, active: &str) -> &MousePort {
        if active.is_empty() {
            &self.mouse
        } else {
            self.port_for(active)
        }
    }
}
