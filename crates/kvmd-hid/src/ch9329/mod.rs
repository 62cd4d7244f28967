//! CH9329 UART HID bridge backend. The facade builds chip commands at
//! injection time (the chip keeps no state worth mirroring) and a single
//! worker thread owns the serial line, idling on GET_INFO polls that also
//! refresh the keyboard LED state.

mod chip;
mod keyboard;
mod mouse;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info};

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::events::{led_caps, led_num, led_scroll, KeyboardEvent, MouseEvent};
use crate::queue::{event_queue, EventReceiver, EventSender, Recv};
use crate::{BackendState, HidBackend, KeyboardState, LedsState, MouseState, OutputsState};

pub use chip::ChipConfig;

struct Shared {
    online: AtomicBool,
    leds: AtomicU8,
}

pub struct Ch9329Hid {
    shared: Arc<Shared>,
    tx: EventSender<Vec<u8>>,
    keyboard: Mutex<keyboard::Keyboard>,
    mouse: Mutex<mouse::Mouse>,
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
    seed: Mutex<Option<(chip::Chip, EventReceiver<Vec<u8>>)>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ch9329Hid {
    pub fn new(config: ChipConfig, notifier: Arc<Notifier>) -> Self {
        let (tx, rx) = event_queue();
        Self {
            shared: Arc::new(Shared {
                online: AtomicBool::new(false),
                leds: AtomicU8::new(0),
            }),
            tx,
            keyboard: Mutex::new(keyboard::Keyboard::new()),
            mouse: Mutex::new(mouse::Mouse::new()),
            stop: Arc::new(AtomicBool::new(false)),
            notifier,
            seed: Mutex::new(Some((chip::Chip::new(config), rx))),
            handle: Mutex::new(None),
        }
    }

    fn queue(&self, cmd: Vec<u8>) {
        if !self.stop.load(Ordering::Acquire) {
            self.tx.send(cmd);
        }
    }
}

#[async_trait]
impl HidBackend for Ch9329Hid {
    fn sysprep(&self) {
        let (chip, rx) = self.seed.lock().take().expect("CH9329 worker started twice");
        info!("starting CH9329 HID worker");
        let worker = Worker {
            chip,
            rx,
            shared: self.shared.clone(),
            stop: self.stop.clone(),
            notifier: self.notifier.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("hid-ch9329".to_owned())
            .spawn(move || worker.run())
            .expect("failed to spawn CH9329 worker");
        *self.handle.lock() = Some(handle);
    }

    fn state(&self) -> BackendState {
        let online = self.shared.online.load(Ordering::Acquire);
        let leds = self.shared.leds.load(Ordering::Acquire);
        let absolute = self.mouse.lock().is_absolute();
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
                absolute,
                outputs: OutputsState {
                    available: vec!["usb".to_owned(), "usb_rel".to_owned()],
                    active: (if absolute { "usb" } else { "usb_rel" }).to_owned(),
                },
            },
        }
    }

    async fn reset(&self) {
        let cmd = self.keyboard.lock().clear();
        self.tx.clear_and_send(cmd);
        self.queue(self.mouse.lock().clear());
    }

    async fn cleanup(&self) {
        info!("stopping CH9329 HID worker");
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    fn set_params(&self, _keyboard_output: Option<&str>, mouse_output: Option<&str>) {
        if let Some(output) = mouse_output {
            let absolute = output == "usb";
            self.mouse.lock().set_absolute(absolute);
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }

    fn send_keyboard_event(&self, event: KeyboardEvent) {
        match event {
            KeyboardEvent::Clear | KeyboardEvent::Reset => {
                let cmd = self.keyboard.lock().clear();
                self.tx.clear_and_send(cmd);
            }
            KeyboardEvent::Key { usb, state } => {
                self.queue(self.keyboard.lock().key(usb, false, state));
            }
            KeyboardEvent::Modifier { mask, state } => {
                self.queue(self.keyboard.lock().key(mask, true, state));
            }
        }
    }

    fn send_mouse_event(&self, event: MouseEvent) {
        match event {
            MouseEvent::Clear | MouseEvent::Reset => self.queue(self.mouse.lock().clear()),
            MouseEvent::Button { button, state } => {
                self.queue(self.mouse.lock().button(button, state));
            }
            MouseEvent::Move { to_x, to_y } => {
                let mut mouse = self.mouse.lock();
                if mouse.is_absolute() {
                    let cmd = mouse.mouse_move(to_x, to_y);
                    drop(mouse);
                    self.queue(cmd);
                }
            }
            MouseEvent::Relative { dx, dy } => {
                let mut mouse = self.mouse.lock();
                if !mouse.is_absolute() {
                    let cmd = mouse.relative(dx, dy);
                    drop(mouse);
                    self.queue(cmd);
                }
            }
            MouseEvent::Wheel { dy, .. } => self.queue(self.mouse.lock().wheel(dy)),
        }
    }

    fn clear_events(&self) {
        let cmd = self.keyboard.lock().clear();
        self.tx.clear_and_send(cmd);
        self.queue(self.mouse.lock().clear());
    }
}

struct Worker {
    chip: chip::Chip,
    rx: EventReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl Worker {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            let mut conn = match self.chip.connect() {
                Ok(conn) => conn,
                Err(err) => {
                    error!(%err, "can't open CH9329");
                    self.set_online(false);
                    std::thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };
            while !self.stop.load(Ordering::Acquire) {
                let cmd = match self.rx.recv_timeout(Duration::from_millis(100)) {
                    Recv::Event(cmd) => cmd,
                    Recv::Timeout => Vec::new(),
                    Recv::Disconnected => return,
                };
                match conn.xfer(&cmd) {
                    Ok(led_byte) => {
                        if let Some(leds) = led_byte {
                            if self.shared.leds.swap(leds, Ordering::AcqRel) != leds {
                                self.notifier.notify(NOTIFY_CHANGED);
                            }
                        }
                        self.set_online(true);
                    }
                    Err(err) => {
                        error!(%err, "CH9329 exchange failed");
                        self.set_online(false);
                        std::thread::sleep(Duration::from_secs(2));
                        break;
                    }
                }
            }
        }
    }

    fn set_online(&self, online: bool) {
        if self.shared.online.swap(online, Ordering::AcqRel) != online {
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }
}
