//! Worker thread for one `/dev/hidgN` gadget endpoint.
//!
//! The gadget answers EAGAIN or ESHUTDOWN when the cable is unplugged or
//! the UDC is being rebound, so the loop keeps its own online flag, checks
//! the UDC state file while idle, and retransmits the last report a
//! bounded number of times after errors so a bounce-unplug does not lose
//! the final key state. See raspberrypi/linux#3870 for the background.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info};

use crate::queue::{EventReceiver, Recv};

const ESHUTDOWN: i32 = 108;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub device_path: PathBuf,
    pub select_timeout: Duration,
    pub queue_timeout: Duration,
    pub write_retries: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::new(),
            select_timeout: Duration::from_millis(100),
            queue_timeout: Duration::from_millis(100),
            write_retries: 150,
        }
    }
}

/// Endpoint-specific half of the worker: turns queued events into wire
/// reports and consumes host-to-device reports (keyboard LEDs).
pub(crate) trait ReportProcessor: Send + 'static {
    type Event: Send + 'static;

    fn process_event(&mut self, event: Self::Event) -> Vec<Vec<u8>>;

    /// Host-to-device report, `read_size()` bytes.
    fn process_read(&mut self, report: &[u8]);

    /// 0 disables reading (mouse endpoints).
    fn read_size(&self) -> usize;
}

pub(crate) struct DeviceWorker<P: ReportProcessor> {
    name: &'static str,
    config: EndpointConfig,
    udc_state_path: PathBuf,
    processor: P,
    events: EventReceiver<P::Event>,
    online: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    notify: Arc<dyn Fn() + Send + Sync>,

    device: Option<File>,
    no_device_reported: bool,
}

impl<P: ReportProcessor> DeviceWorker<P> {
    pub(crate) fn new(
        name: &'static str,
        config: EndpointConfig,
        udc_state_path: PathBuf,
        processor: P,
        events: EventReceiver<P::Event>,
        online: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
        notify: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            name,
            config,
            udc_state_path,
            processor,
            events,
            online,
            stop,
            notify,
            device: None,
            no_device_reported: false,
        }
    }

    pub(crate) fn run(mut self) {
        let mut last_report: Vec<u8> = Vec::new();
        let mut retries: u32 = 0;
        while !self.stop.load(Ordering::Acquire) {
            if self.ensure_device() {
                self.read_all_reports();
            }

            match self.events.recv_timeout(self.config.queue_timeout) {
                Recv::Event(event) => {
                    // Fresh reports take precedence over retrying an old one.
                    for report in self.processor.process_event(event) {
                        last_report = report;
                        retries = self.config.write_retries;
                        if self.ensure_device() && self.write_report(&last_report) {
                            retries = 0;
                        }
                    }
                    continue;
                }
                Recv::Disconnected => break,
                Recv::Timeout => {
                    if !self.is_udc_configured() {
                        self.set_online(false);
                    }
                }
            }

            if retries > 0 && self.ensure_device() {
                if self.write_report(&last_report) {
                    retries = 0;
                } else {
                    retries -= 1;
                }
            }
        }
        self.close_device();
    }

    fn is_udc_configured(&self) -> bool {
        match std::fs::read_to_string(&self.udc_state_path) {
            Ok(state) => state.trim().eq_ignore_ascii_case("configured"),
            Err(_) => false,
        }
    }

    fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::AcqRel) != online {
            (self.notify)();
        }
    }

    fn ensure_device(&mut self) -> bool {
        if !self.config.device_path.exists() {
            // If the UDC is being torn down under us, the device must be
            // closed before it is re-created to avoid racing the kernel.
            self.close_device();
            self.set_online(false);
            if !self.no_device_reported {
                error!(device = %self.config.device_path.display(), "missing HID-{} device", self.name);
                self.no_device_reported = true;
            }
            return false;
        }
        self.no_device_reported = false;

        if self.device.is_none() {
            let read = self.processor.read_size() > 0;
            match OpenOptions::new()
                .read(read)
                .write(true)
                .custom_flags(libc_o_nonblock())
                .open(&self.config.device_path)
            {
                Ok(file) => self.device = Some(file),
                Err(err) => {
                    error!(device = %self.config.device_path.display(), %err, "can't open HID-{} device", self.name);
                }
            }
        }

        if let Some(device) = &self.device {
            match poll_fd(device, PollFlags::POLLOUT, self.config.select_timeout) {
                Ok(true) => return true,
                Ok(false) => {
                    // Write-unready usually means unplugged.
                    debug!("HID-{} is busy/unplugged (write poll)", self.name);
                }
                Err(err) => {
                    error!(%err, "can't poll HID-{} for write", self.name);
                }
            }
        }
        self.set_online(false);
        false
    }

    fn write_report(&mut self, report: &[u8]) -> bool {
        debug_assert!(!report.is_empty());
        let Some(device) = &mut self.device else {
            return false;
        };
        match device.write(report) {
            Ok(written) if written == report.len() => {
                self.set_online(true);
                return true;
            }
            Ok(written) => {
                error!(
                    "HID-{} write: written ({written}) != report length ({})",
                    self.name,
                    report.len()
                );
            }
            Err(err) => {
                let errno = err.raw_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock || errno == Some(ESHUTDOWN) {
                    debug!("HID-{} busy/unplugged (write): {err}", self.name);
                } else {
                    error!(%err, "can't write report to HID-{}", self.name);
                }
            }
        }
        self.set_online(false);
        false
    }

    fn read_all_reports(&mut self) {
        let read_size = self.processor.read_size();
        if read_size == 0 {
            return;
        }
        loop {
            let Some(device) = &mut self.device else {
                return;
            };
            match poll_fd(device, PollFlags::POLLIN, Duration::ZERO) {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    error!(%err, "can't poll HID-{} for read", self.name);
                    return;
                }
            }
            let mut report = vec![0u8; read_size];
            match device.read(&mut report) {
                Ok(0) => return,
                Ok(n) => {
                    self.processor.process_read(&report[..n]);
                    (self.notify)();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!(%err, "can't read report from HID-{}", self.name);
                    return;
                }
            }
        }
    }

    fn close_device(&mut self) {
        self.device = None;
    }
}

fn libc_o_nonblock() -> i32 {
    nix::fcntl::OFlag::O_NONBLOCK.bits()
}

fn poll_fd(file: &File, flags: PollFlags, timeout: Duration) -> std::io::Result<bool> {
    let mut fds = [PollFd::new(file.as_fd(), flags)];
    let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    let n = poll(&mut fds, PollTimeout::from(millis)).map_err(std::io::Error::from)?;
    if n == 0 {
        return Ok(false);
    }
    Ok(fds[0]
        .revents()
        .map(|revents| revents.intersects(flags | PollFlags::POLLERR | PollFlags::POLLHUP))
        .unwrap_or(false))
}

/// One-shot open-and-write used by cleanup after the worker has exited:
/// releases everything the host might still consider pressed.
pub(crate) fn write_release_report(name: &str, device_path: &Path, report: &[u8]) {
    info!("clearing HID-{name} events");
    if !device_path.exists() {
        return;
    }
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc_o_nonblock())
        .open(device_path)
    {
        Ok(mut device) => {
            if matches!(poll_fd(&device, PollFlags::POLLOUT, Duration::from_millis(100)), Ok(true)) {
                if let Err(err) = device.write(report) {
                    debug!(%err, "can't write release report to HID-{name}");
                }
            }
        }
        Err(err) => {
            debug!(%err, "can't open HID-{name} for release report");
        }
    }
}
