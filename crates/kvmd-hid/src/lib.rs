//! HID emulation: a shared keyboard/mouse event pipeline in front of one
//! of four interchangeable backends (USB gadget, MCU link, Bluetooth,
//! CH9329 UART bridge).
//!
//! The front owns everything backend-independent: key filtering, absolute
//! coordinate remapping, delta squashing, the anti-idle jiggler and state
//! polling. Backends own their hardware on a dedicated worker and expose a
//! lock-protected state snapshot plus event injectors.

pub mod bt;
pub mod ch9329;
pub mod events;
mod jiggler;
pub mod mcu;
pub mod otg;
mod queue;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;

use kvmd_core::Notifier;
use kvmd_keymap::Key;
use kvmd_validators::MouseButton;

use events::{remap_to_full, KeyboardEvent, MouseEvent};
use jiggler::Jiggler;

pub use queue::{event_queue, EventReceiver, EventSender, Recv};

#[derive(Debug, Error)]
pub enum HidError {
    #[error("HID is offline: {0}")]
    Offline(String),
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct LedsState {
    pub caps: bool,
    pub scroll: bool,
    pub num: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct OutputsState {
    pub available: Vec<String>,
    pub active: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyboardState {
    pub online: bool,
    pub leds: LedsState,
    pub outputs: OutputsState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MouseState {
    pub online: bool,
    pub absolute: bool,
    pub outputs: OutputsState,
}

/// Backend-independent slice of the published state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendState {
    pub online: bool,
    pub busy: bool,
    pub connected: Option<bool>,
    pub keyboard: KeyboardState,
    pub mouse: MouseState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JigglerState {
    pub enabled: bool,
    pub active: bool,
    pub interval: u64,
}

/// The full state dict published over `/hid` and the WS event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HidState {
    pub enabled: bool,
    #[serde(flatten)]
    pub backend: BackendState,
    pub jiggler: JigglerState,
}

/// Hardware-owning half of a HID pipeline. Implementations run their own
/// worker (thread or task), never block the caller, and deliver events to
/// the managed host in submission order.
#[async_trait]
pub trait HidBackend: Send + Sync {
    /// Spawns the worker. Called once at daemon startup.
    fn sysprep(&self);

    /// Cheap lock-protected snapshot.
    fn state(&self) -> BackendState;

    /// Requests a backend reset; takes effect on the worker's next
    /// iteration.
    async fn reset(&self);

    /// Releases all keys/buttons and frees the hardware. Called once at
    /// shutdown.
    async fn cleanup(&self);

    fn set_params(&self, keyboard_output: Option<&str>, mouse_output: Option<&str>);

    fn set_connected(&self, _connected: bool) {}

    fn send_keyboard_event(&self, event: KeyboardEvent);

    /// Move events arrive pre-remapped into the full hardware range.
    fn send_mouse_event(&self, event: MouseEvent);

    fn clear_events(&self);
}

#[derive(Debug, Clone)]
pub struct FrontConfig {
    /// Web names of keys dropped before injection.
    pub ignore_keys: Vec<String>,
    pub mouse_x_range: (i16, i16),
    pub mouse_y_range: (i16, i16),
    pub jiggler_enabled: bool,
    pub jiggler_active: bool,
    pub jiggler_interval: u64,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            ignore_keys: Vec::new(),
            mouse_x_range: (events::MOUSE_MIN as i16, events::MOUSE_MAX as i16),
            mouse_y_range: (events::MOUSE_MIN as i16, events::MOUSE_MAX as i16),
            jiggler_enabled: true,
            jiggler_active: false,
            jiggler_interval: 60,
        }
    }
}

/// The facade the API layer talks to.
pub struct Hid {
    backend: Arc<dyn HidBackend>,
    notifier: Arc<Notifier>,
    ignore_keys: HashSet<String>,
    x_range: (i16, i16),
    y_range: (i16, i16),
    jiggler: Jiggler,
}

impl Hid {
    pub fn new(config: FrontConfig, backend: Arc<dyn HidBackend>, notifier: Arc<Notifier>) -> Self {
        let jiggler = Jiggler::new(
            config.jiggler_enabled,
            config.jiggler_active,
            config.jiggler_interval,
        );
        Self {
            backend,
            notifier,
            ignore_keys: config.ignore_keys.into_iter().collect(),
            x_range: config.mouse_x_range,
            y_range: config.mouse_y_range,
            jiggler,
        }
    }

    pub fn sysprep(&self) {
        self.backend.sysprep();
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn get_state(&self) -> HidState {
        let backend = self.backend.state();
        self.jiggler.set_absolute(backend.mouse.absolute);
        HidState {
            enabled: true,
            jiggler: self.jiggler.state(),
            backend,
        }
    }

    pub fn trigger_state(&self) {
        self.notifier.notify(kvmd_core::NOTIFY_FULL);
    }

    /// Async sequence of state snapshots; successive items always differ.
    pub fn poll_state(self: &Arc<Self>) -> impl Stream<Item = HidState> + Send {
        let this = self.clone();
        async_stream::stream! {
            let mut prev: Option<HidState> = None;
            loop {
                let state = this.get_state();
                if prev.as_ref() != Some(&state) {
                    prev = Some(state.clone());
                    yield state;
                }
                if this.notifier.wait().await > 0 {
                    prev = None;
                }
            }
        }
    }

    pub async fn reset(&self) {
        self.backend.reset().await;
    }

    pub async fn cleanup(&self) {
        self.backend.cleanup().await;
    }

    pub fn set_params(
        &self,
        keyboard_output: Option<&str>,
        mouse_output: Option<&str>,
        jiggler: Option<bool>,
    ) {
        if keyboard_output.is_some() || mouse_output.is_some() {
            self.backend.set_params(keyboard_output, mouse_output);
        }
        if let Some(active) = jiggler {
            self.jiggler.set_active(active);
        }
        self.notifier.notify(kvmd_core::NOTIFY_CHANGED);
    }

    pub fn set_connected(&self, connected: bool) {
        self.backend.set_connected(connected);
    }

    // ===== Event injectors.

    pub fn send_key_events<'a>(&self, keys: impl IntoIterator<Item = (&'a Key, bool)>) {
        for (key, state) in keys {
            self.send_key_event(key, state);
        }
    }

    /// Like `send_key_events`, but paced for pasted text.
    pub async fn send_key_events_slow<'a>(&self, keys: impl IntoIterator<Item = (&'a Key, bool)>) {
        for (key, state) in keys {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.send_key_event(key, state);
        }
    }

    pub fn send_key_event(&self, key: &Key, state: bool) {
        if self.ignore_keys.contains(key.web) {
            return;
        }
        self.backend.send_keyboard_event(KeyboardEvent::from_key(key, state));
        self.jiggler.bump();
    }

    /// Press-and-release helper. Modifiers and PrintScreen stay down so
    /// they can participate in chords (SysRq sequences).
    pub fn send_key_click(&self, key: &Key) {
        self.send_key_event(key, true);
        if !key.modifier && key.web != "PrintScreen" {
            self.send_key_event(key, false);
        }
    }

    pub fn send_mouse_button_event(&self, button: MouseButton, state: bool) {
        self.backend.send_mouse_event(MouseEvent::Button { button, state });
        self.jiggler.bump();
    }

    pub fn send_mouse_move_event(&self, to_x: i16, to_y: i16) {
        self.jiggler.remember_position(to_x, to_y);
        let full = (
            events::MOUSE_MIN as i16,
            events::MOUSE_MAX as i16,
        );
        let x = if self.x_range != full {
            remap_to_full(to_x, self.x_range.0, self.x_range.1)
        } else {
            to_x
        };
        let y = if self.y_range != full {
            remap_to_full(to_y, self.y_range.0, self.y_range.1)
        } else {
            to_y
        };
        self.backend.send_mouse_event(MouseEvent::Move { to_x: x, to_y: y });
        self.jiggler.bump();
    }

    pub fn send_mouse_relative_event(&self, dx: i8, dy: i8) {
        self.backend.send_mouse_event(MouseEvent::Relative { dx, dy });
        self.jiggler.bump();
    }

    pub fn send_mouse_wheel_event(&self, dx: i8, dy: i8) {
        self.backend.send_mouse_event(MouseEvent::Wheel { dx, dy });
        self.jiggler.bump();
    }

    /// Applies a batch of deltas, optionally squashing adjacent ones while
    /// the running sum stays within the report range.
    pub fn send_mouse_delta_events(
        &self,
        deltas: &[(i8, i8)],
        squash: bool,
        mut emit: impl FnMut(&Self, i8, i8),
    ) {
        if squash {
            let mut acc: (i16, i16) = (0, 0);
            for &(dx, dy) in deltas {
                let next = (acc.0 + i16::from(dx), acc.1 + i16::from(dy));
                if next.0.abs() > 127 || next.1.abs() > 127 {
                    emit(self, acc.0 as i8, acc.1 as i8);
                    acc = (i16::from(dx), i16::from(dy));
                } else {
                    acc = next;
                }
            }
            if acc != (0, 0) {
                emit(self, acc.0 as i8, acc.1 as i8);
            }
        } else {
            for &(dx, dy) in deltas {
                emit(self, dx, dy);
            }
        }
    }

    pub fn clear_events(&self) {
        // Deliberately does not bump the jiggler clock.
        self.backend.clear_events();
    }

    /// Anti-idle loop; run as a supervised task.
    pub async fn systask(self: Arc<Self>) {
        loop {
            if let Some(pattern) = self.jiggler.due_pattern() {
                match pattern {
                    jiggler::Pattern::Absolute { x, y } => {
                        for delta in [100i16, -100, 100, -100, 0] {
                            self.send_mouse_move_event(
                                x.saturating_add(delta),
                                y.saturating_add(delta),
                            );
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                    jiggler::Pattern::Relative => {
                        for delta in [10i8, -10, 10, -10] {
                            self.send_mouse_relative_event(delta, delta);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
