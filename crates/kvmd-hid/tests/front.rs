//! Facade behavior against a recording backend: filtering, remapping,
//! squashing and the anti-idle jiggler.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use kvmd_core::Notifier;
use kvmd_hid::events::{KeyboardEvent, MouseEvent};
use kvmd_hid::{BackendState, FrontConfig, Hid, HidBackend, KeyboardState, LedsState, MouseState, OutputsState};
use kvmd_validators::MouseButton;

#[derive(Default)]
struct Recorded {
    keyboard: Vec<KeyboardEvent>,
    mouse: Vec<MouseEvent>,
}

struct RecordingBackend {
    recorded: Mutex<Recorded>,
    absolute: bool,
}

impl RecordingBackend {
    fn new(absolute: bool) -> Arc<Self> {
        Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
            absolute,
        })
    }
}

#[async_trait]
impl HidBackend for RecordingBackend {
    fn sysprep(&self) {}

    fn state(&self) -> BackendState {
        BackendState {
            online: true,
            busy: false,
            connected: None,
            keyboard: KeyboardState {
                online: true,
                leds: LedsState::default(),
                outputs: OutputsState::default(),
            },
            mouse: MouseState {
                online: true,
                absolute: self.absolute,
                outputs: OutputsState::default(),
            },
        }
    }

    async fn reset(&self) {}

    async fn cleanup(&self) {}

    fn set_params(&self, _keyboard_output: Option<&str>, _mouse_output: Option<&str>) {}

    fn send_keyboard_event(&self, event: KeyboardEvent) {
        self.recorded.lock().keyboard.push(event);
    }

    fn send_mouse_event(&self, event: MouseEvent) {
        self.recorded.lock().mouse.push(event);
    }

    fn clear_events(&self) {
        self.recorded.lock().keyboard.push(KeyboardEvent::Clear);
    }
}

fn front(config: FrontConfig, absolute: bool) -> (Arc<Hid>, Arc<RecordingBackend>) {
    let backend = RecordingBackend::new(absolute);
    let hid = Arc::new(Hid::new(
        config,
        backend.clone(),
        Arc::new(Notifier::new()),
    ));
    (hid, backend)
}

#[test]
fn ignored_keys_are_filtered() {
    let (hid, backend) = front(
        FrontConfig {
            ignore_keys: vec!["MetaLeft".to_owned()],
            ..Default::default()
        },
        true,
    );
    hid.send_key_event(kvmd_keymap::by_web("MetaLeft").unwrap(), true);
    hid.send_key_event(kvmd_keymap::by_web("KeyA").unwrap(), true);
    let recorded = backend.recorded.lock();
    assert_eq!(recorded.keyboard.len(), 1);
    assert_eq!(recorded.keyboard[0], KeyboardEvent::Key { usb: 0x04, state: true });
}

#[test]
fn click_releases_regular_keys_only() {
    let (hid, backend) = front(FrontConfig::default(), true);
    hid.send_key_click(kvmd_keymap::by_web("KeyB").unwrap());
    hid.send_key_click(kvmd_keymap::by_web("ShiftLeft").unwrap());
    hid.send_key_click(kvmd_keymap::by_web("PrintScreen").unwrap());
    let recorded = backend.recorded.lock();
    assert_eq!(
        recorded.keyboard,
        vec![
            KeyboardEvent::Key { usb: 0x05, state: true },
            KeyboardEvent::Key { usb: 0x05, state: false },
            KeyboardEvent::Modifier { mask: 0x02, state: true },
            KeyboardEvent::Key { usb: 0x46, state: true },
        ]
    );
}

#[test]
fn moves_remap_from_configured_range() {
    let (hid, backend) = front(
        FrontConfig {
            mouse_x_range: (0, 1000),
            mouse_y_range: (0, 1000),
            ..Default::default()
        },
        true,
    );
    hid.send_mouse_move_event(0, 1000);
    let recorded = backend.recorded.lock();
    assert_eq!(
        recorded.mouse,
        vec![MouseEvent::Move { to_x: -32768, to_y: 32767 }]
    );
}

#[test]
fn deltas_squash_until_saturation() {
    let (hid, backend) = front(FrontConfig::default(), false);
    let deltas = vec![(100i8, 0i8), (50, 0), (10, 0)];
    hid.send_mouse_delta_events(&deltas, true, |hid, dx, dy| {
        hid.send_mouse_relative_event(dx, dy);
    });
    let recorded = backend.recorded.lock();
    // 100+50 overflows, so 100 flushes, then 50+10 accumulates.
    assert_eq!(
        recorded.mouse,
        vec![
            MouseEvent::Relative { dx: 100, dy: 0 },
            MouseEvent::Relative { dx: 60, dy: 0 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn jiggler_fires_one_pattern_after_idle() {
    let (hid, backend) = front(
        FrontConfig {
            jiggler_enabled: true,
            jiggler_active: true,
            jiggler_interval: 1,
            ..Default::default()
        },
        true,
    );
    // Read absoluteness from the backend once, as the daemon does.
    let _ = hid.get_state();

    let task = tokio::spawn(hid.clone().systask());
    tokio::time::sleep(std::time::Duration::from_millis(3200)).await;
    task.abort();

    let moves = backend.recorded.lock().mouse.len();
    // Exactly one five-move absolute pattern; the pattern itself bumps
    // the activity clock, restarting the idle window.
    assert_eq!(moves, 5, "expected one pattern, got {moves} moves");
}

#[tokio::test(start_paused = true)]
async fn jiggler_disabled_never_moves() {
    let (hid, backend) = front(
        FrontConfig {
            jiggler_enabled: false,
            jiggler_active: true,
            jiggler_interval: 1,
            ..Default::default()
        },
        true,
    );
    let task = tokio::spawn(hid.clone().systask());
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    task.abort();
    assert!(backend.recorded.lock().mouse.is_empty());
}
