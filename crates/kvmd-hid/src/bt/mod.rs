//! Bluetooth HID backend: registers a combined keyboard+mouse HID profile
//! with BlueZ and serves the control (PSM 17) and interrupt (PSM 19)
//! L2CAP channels itself. Unlike the other backends this one is fully
//! async; the "worker" is a supervised tokio task owning the sockets.

mod server;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::events::{led_caps, led_num, led_scroll, KeyboardEvent, MouseEvent};
use crate::{BackendState, HidBackend, KeyboardState, LedsState, MouseState, OutputsState};

pub use server::SDP_RECORD;

#[derive(Debug, Clone)]
pub struct BtConfig {
    /// Adapter name, e.g. "hci0".
    pub adapter: String,
    pub alias: String,
    pub pairing_required: bool,
    pub auth_required: bool,
    /// Keep the adapter pairable/discoverable while there is client
    /// capacity.
    pub control_public: bool,
    pub unpair_on_close: bool,
    pub max_clients: usize,
}

impl Default for BtConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_owned(),
            alias: "KVM-D HID".to_owned(),
            pairing_required: true,
            auth_required: false,
            control_public: true,
            unpair_on_close: false,
            max_clients: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) enum BtEvent {
    Keyboard(KeyboardEvent),
    Mouse(MouseEvent),
}

pub(crate) struct BtShared {
    pub online: AtomicBool,
    pub leds: AtomicU8,
}

pub struct BtHid {
    config: BtConfig,
    shared: Arc<BtShared>,
    tx: mpsc::UnboundedSender<(u64, BtEvent)>,
    epoch: Arc<AtomicU64>,
    notifier: Arc<Notifier>,
    seed: Mutex<Option<mpsc::UnboundedReceiver<(u64, BtEvent)>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BtHid {
    pub fn new(config: BtConfig, notifier: Arc<Notifier>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(BtShared {
                online: AtomicBool::new(false),
                leds: AtomicU8::new(0),
            }),
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
            notifier,
            seed: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }

    fn send(&self, event: BtEvent) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let _ = self.tx.send((epoch, event));
    }

    fn clear_and_send(&self, event: BtEvent) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.tx.send((epoch, event));
    }
}

#[async_trait]
impl HidBackend for BtHid {
    fn sysprep(&self) {
        let rx = self.seed.lock().take().expect("BT server started twice");
        info!(adapter = %self.config.adapter, "starting Bluetooth HID server");
        let server = server::BtServer::new(
            self.config.clone(),
            self.shared.clone(),
            rx,
            self.epoch.clone(),
            self.notifier.clone(),
        );
        *self.task.lock() = Some(tokio::spawn(server.run()));
    }

    fn state(&self) -> BackendState {
        let online = self.shared.online.load(Ordering::Acquire);
        let leds = self.shared.leds.load(Ordering::Acquire);
        BackendState {
            online,
            busy: false,
            connected: None,
            keyboard: KeyboardState {
                online,
                leds: LedsState {
                    caps: led_caps(leds),
                    scroll: led_scroll(leds),
                    num: led_num(leds),
                },
                outputs: OutputsState::default(),
            },
            mouse: MouseState {
                online,
                absolute: false,
                outputs: OutputsState::default(),
            },
        }
    }

    async fn reset(&self) {
        // Reset kicks every paired client off; they will reconnect.
        self.clear_and_send(BtEvent::Keyboard(KeyboardEvent::Reset));
    }

    async fn cleanup(&self) {
        self.clear_and_send(BtEvent::Keyboard(KeyboardEvent::Clear));
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.notifier.notify(NOTIFY_CHANGED);
    }

    fn set_params(&self, _keyboard_output: Option<&str>, _mouse_output: Option<&str>) {}

    fn send_keyboard_event(&self, event: KeyboardEvent) {
        match event {
            KeyboardEvent::Clear | KeyboardEvent::Reset => self.clear_and_send(BtEvent::Keyboard(event)),
            _ => self.send(BtEvent::Keyboard(event)),
        }
    }

    fn send_mouse_event(&self, event: MouseEvent) {
        match event {
            // Absolute positioning does not exist in this profile.
            MouseEvent::Move { .. } => {}
            MouseEvent::Clear | MouseEvent::Reset => self.clear_and_send(BtEvent::Mouse(event)),
            _ => self.send(BtEvent::Mouse(event)),
        }
    }

    fn clear_events(&self) {
        self.clear_and_send(BtEvent::Keyboard(KeyboardEvent::Clear));
    }
}
