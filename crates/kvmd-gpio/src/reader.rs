//! Event-driven GPIO line watching with per-pin debounce.
//!
//! The kernel buffers only 16 edge events per line; a burst can overflow
//! it silently. The reader papers over that by resynchronizing all values
//! whenever a second passes without events.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info};

use kvmd_core::{Debouncer, Notifier, NOTIFY_CHANGED};

#[derive(Debug, Clone, Copy)]
pub struct PinParams {
    pub inverted: bool,
    pub debounce: Duration,
}

pub struct LineReader {
    params: HashMap<u32, PinParams>,
    values: Arc<Mutex<HashMap<u32, bool>>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LineReader {
    /// Spawns the reader thread immediately. Pins are fixed for its
    /// lifetime.
    pub fn spawn(
        device_path: PathBuf,
        consumer: &str,
        pins: HashMap<u32, PinParams>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let values: Arc<Mutex<HashMap<u32, bool>>> = Arc::new(Mutex::new(
            pins.keys().map(|&pin| (pin, false)).collect(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = if pins.is_empty() {
            None
        } else {
            let worker = Worker {
                device_path,
                consumer: consumer.to_owned(),
                pins: pins.clone(),
                values: values.clone(),
                stop: stop.clone(),
                notifier,
            };
            Some(
                std::thread::Builder::new()
                    .name("gpio-reader".to_owned())
                    .spawn(move || worker.run())
                    .expect("failed to spawn gpio reader"),
            )
        };
        Self {
            params: pins,
            values,
            stop,
            handle: Mutex::new(handle),
        }
    }

    /// Debounced, inversion-applied value.
    pub fn get(&self, pin: u32) -> bool {
        let raw = self.values.lock().get(&pin).copied().unwrap_or(false);
        let inverted = self.params.get(&pin).map(|p| p.inverted).unwrap_or(false);
        raw ^ inverted
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

struct Worker {
    device_path: PathBuf,
    consumer: String,
    pins: HashMap<u32, PinParams>,
    values: Arc<Mutex<HashMap<u32, bool>>>,
    stop: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl Worker {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.watch() {
                error!(%err, "gpio reader error");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn watch(&self) -> std::io::Result<()> {
        let mut pins: Vec<u32> = self.pins.keys().copied().collect();
        pins.sort_unstable();

        let chip = gpiod::Chip::new(&self.device_path)?;
        let lines = chip.request_lines(
            gpiod::Options::input(pins.clone())
                .edge(gpiod::EdgeDetect::Both)
                .consumer(&self.consumer),
        )?;

        let initial = lines.get_values(vec![false; pins.len()])?;
        let mut debouncers: HashMap<u32, Debouncer> = HashMap::new();
        {
            let mut values = self.values.lock();
            for (&pin, &value) in pins.iter().zip(initial.iter()) {
                values.insert(pin, value);
                debouncers.insert(
                    pin,
                    Debouncer::new(value, self.pins[&pin].debounce),
                );
            }
        }
        self.notifier.notify(NOTIFY_CHANGED);
        info!(pins = ?pins, "gpio reader online");

        while !self.stop.load(Ordering::Acquire) {
            let readable = poll_readable(lines.as_raw_fd(), Duration::from_secs(1))?;
            let now = Instant::now();
            if readable {
                let event = lines.read_event()?;
                let value = matches!(event.edge, gpiod::Edge::Rising);
                if let Some(debouncer) = debouncers.get_mut(&event.line) {
                    if let Some(accepted) = debouncer.submit(value, now) {
                        self.apply(event.line, accepted);
                    }
                }
            } else {
                // Timeout: resync against reality, the kernel buffer may
                // have overflowed.
                let raw = lines.get_values(vec![false; pins.len()])?;
                for (&pin, &value) in pins.iter().zip(raw.iter()) {
                    if let Some(debouncer) = debouncers.get_mut(&pin) {
                        if let Some(accepted) = debouncer.submit(value, now) {
                            self.apply(pin, accepted);
                        }
                    }
                }
            }
            // Promote candidates whose window elapsed without new edges.
            for (&pin, debouncer) in debouncers.iter_mut() {
                if let Some(accepted) = debouncer.tick(now) {
                    self.apply(pin, accepted);
                }
            }
        }
        Ok(())
    }

    fn apply(&self, pin: u32, value: bool) {
        let changed = {
            let mut values = self.values.lock();
            values.insert(pin, value) != Some(value)
        };
        if changed {
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }
}

fn poll_readable(fd: i32, timeout: Duration) -> std::io::Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    let n = poll(&mut fds, PollTimeout::from(millis)).map_err(std::io::Error::from)?;
    Ok(n > 0)
}
