//! The Bluetooth HID service itself: adapter configuration, SDP record,
//! the two L2CAP listeners and the per-client socket pairs.
//!
//! Wire format: reports to the host are `0xA1 0x01 <keyboard>` and
//! `0xA1 0x02 <mouse>`; the host sends LED state as `0xA2 0x01 <leds>`
//! on the interrupt channel and `0x71` handshakes on control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bluer::agent::Agent;
use bluer::l2cap::{SeqPacket, SeqPacketListener, SocketAddr};
use bluer::rfcomm::{Profile, Role};
use bluer::{Address, AddressType};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use super::{BtConfig, BtEvent, BtShared};
use crate::events::{KeyboardEvent, KeyboardState, MouseEvent, MouseState};

pub const HID_CTL_PSM: u16 = 17;
pub const HID_INT_PSM: u16 = 19;

/// Combined keyboard+mouse HID SDP record (service class 0x1124).
pub const SDP_RECORD: &str = include_str!("sdp_record.xml");

struct Client {
    ctl: Option<Arc<SeqPacket>>,
    int: Option<Arc<SeqPacket>>,
}

enum Incoming {
    NewCtl(Address, SeqPacket),
    NewInt(Address, SeqPacket),
    CtlData(Address, Vec<u8>),
    IntData(Address, Vec<u8>),
    CtlClosed(Address),
    IntClosed(Address),
}

pub(crate) struct BtServer {
    config: BtConfig,
    shared: Arc<BtShared>,
    events: mpsc::UnboundedReceiver<(u64, BtEvent)>,
    epoch: Arc<AtomicU64>,
    notifier: Arc<Notifier>,

    clients: HashMap<Address, Client>,
    keyboard: KeyboardState,
    mouse: MouseState,
}

impl BtServer {
    pub(crate) fn new(
        config: BtConfig,
        shared: Arc<BtShared>,
        events: mpsc::UnboundedReceiver<(u64, BtEvent)>,
        epoch: Arc<AtomicU64>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            shared,
            events,
            epoch,
            notifier,
            clients: HashMap::new(),
            keyboard: KeyboardState::default(),
            mouse: MouseState::new(false, false),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if let Err(err) = self.serve().await {
                error!(%err, "Bluetooth HID server error");
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    async fn serve(&mut self) -> bluer::Result<()> {
        let session = bluer::Session::new().await?;
        let adapter = session.adapter(&self.config.adapter)?;
        adapter.set_powered(true).await?;
        adapter.set_alias(self.config.alias.clone()).await?;

        let _agent = session.register_agent(Agent::default()).await?;
        // 0x1124 = Human Interface Device service class.
        let hid_uuid = bluer::Uuid::from_u128(0x0000_1124_0000_1000_8000_00805f9b34fb);
        let _profile = session
            .register_profile(Profile {
                uuid: hid_uuid,
                service_record: Some(SDP_RECORD.to_owned()),
                role: Some(Role::Server),
                require_authentication: Some(self.config.auth_required),
                require_authorization: Some(self.config.pairing_required),
                auto_connect: Some(false),
                ..Default::default()
            })
            .await?;

        let addr = adapter.address().await?;
        let ctl_listener =
            SeqPacketListener::bind(SocketAddr::new(addr, AddressType::BrEdr, HID_CTL_PSM)).await?;
        let int_listener =
            SeqPacketListener::bind(SocketAddr::new(addr, AddressType::BrEdr, HID_INT_PSM)).await?;
        info!(%addr, "listening for Bluetooth HID clients");

        self.set_public(&adapter, true).await;

        let (inbox_tx, mut inbox) = mpsc::unbounded_channel::<Incoming>();
        let accept_ctl = Self::accept_loop(ctl_listener, inbox_tx.clone(), true);
        let accept_int = Self::accept_loop(int_listener, inbox_tx.clone(), false);
        tokio::pin!(accept_ctl, accept_int);

        loop {
            tokio::select! {
                _ = &mut accept_ctl => return Ok(()),
                _ = &mut accept_int => return Ok(()),
                incoming = inbox.recv() => {
                    let Some(incoming) = incoming else { return Ok(()) };
                    self.handle_incoming(&adapter, incoming, &inbox_tx).await;
                }
                event = self.events.recv() => {
                    let Some((epoch, event)) = event else { return Ok(()) };
                    if epoch == self.epoch.load(Ordering::Acquire) {
                        self.handle_event(&adapter, event).await;
                    }
                }
            }
        }
    }

    async fn accept_loop(
        listener: SeqPacketListener,
        inbox: mpsc::UnboundedSender<Incoming>,
        ctl: bool,
    ) {
        loop {
            match listener.accept().await {
                Ok((sock, peer)) => {
                    let incoming = if ctl {
                        Incoming::NewCtl(peer.addr, sock)
                    } else {
                        Incoming::NewInt(peer.addr, sock)
                    };
                    if inbox.send(incoming).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error!(%err, "L2CAP accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_incoming(
        &mut self,
        adapter: &bluer::Adapter,
        incoming: Incoming,
        inbox: &mpsc::UnboundedSender<Incoming>,
    ) {
        match incoming {
            Incoming::NewCtl(addr, sock) => self.accept_client(adapter, addr, sock, true, inbox).await,
            Incoming::NewInt(addr, sock) => self.accept_client(adapter, addr, sock, false, inbox).await,
            Incoming::CtlData(addr, data) => {
                if data.as_slice() == [0x71] {
                    if let Some(sock) = self.clients.get(&addr).and_then(|c| c.ctl.clone()) {
                        let _ = sock.send(&[0x00]).await;
                    }
                }
            }
            Incoming::IntData(addr, data) => {
                let _ = addr;
                if data.len() >= 3 && data[0] == 0xA2 && data[1] == 0x01 {
                    self.shared.leds.store(data[2], Ordering::Release);
                    self.notifier.notify(NOTIFY_CHANGED);
                }
            }
            Incoming::CtlClosed(addr) => self.close_client_half(adapter, addr, true).await,
            Incoming::IntClosed(addr) => self.close_client_half(adapter, addr, false).await,
        }
    }

    async fn accept_client(
        &mut self,
        adapter: &bluer::Adapter,
        addr: Address,
        sock: SeqPacket,
        ctl: bool,
        inbox: &mpsc::UnboundedSender<Incoming>,
    ) {
        if !self.clients.contains_key(&addr) && self.clients.len() >= self.config.max_clients {
            info!(%addr, "refused Bluetooth client: max clients reached");
            return;
        }
        let role = if ctl { "CTL" } else { "INT" };
        info!(%addr, role, "accepted Bluetooth client");

        let sock = Arc::new(sock);
        let entry = self.clients.entry(addr).or_insert(Client { ctl: None, int: None });
        if ctl {
            entry.ctl = Some(sock.clone());
        } else {
            entry.int = Some(sock.clone());
        }

        let inbox = inbox.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                match sock.recv(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = inbox.send(if ctl {
                            Incoming::CtlClosed(addr)
                        } else {
                            Incoming::IntClosed(addr)
                        });
                        return;
                    }
                    Ok(n) => {
                        let msg = buf[..n].to_vec();
                        let _ = inbox.send(if ctl {
                            Incoming::CtlData(addr, msg)
                        } else {
                            Incoming::IntData(addr, msg)
                        });
                    }
                }
            }
        });

        self.shared.online.store(true, Ordering::Release);
        self.notifier.notify(NOTIFY_CHANGED);
        self.set_public(adapter, self.clients.len() < self.config.max_clients).await;
    }

    async fn close_client_half(&mut self, adapter: &bluer::Adapter, addr: Address, ctl: bool) {
        let mut gone = false;
        if let Some(client) = self.clients.get_mut(&addr) {
            if ctl {
                client.ctl = None;
            } else {
                client.int = None;
            }
            gone = client.ctl.is_none() && client.int.is_none();
        }
        info!(%addr, role = if ctl { "CTL" } else { "INT" }, "closed Bluetooth client");

        if gone {
            self.clients.remove(&addr);
            if self.config.unpair_on_close {
                info!(%addr, "unpairing Bluetooth client");
                if let Err(err) = adapter.remove_device(addr).await {
                    error!(%addr, %err, "can't unpair Bluetooth client");
                }
            }
        }
        if self.clients.is_empty() {
            self.clear_state();
        }
        self.set_public(adapter, self.clients.len() < self.config.max_clients).await;
    }

    async fn close_all_clients(&mut self, adapter: &bluer::Adapter) {
        let addrs: Vec<Address> = self.clients.keys().copied().collect();
        for addr in addrs {
            self.close_client_half(adapter, addr, true).await;
            self.close_client_half(adapter, addr, false).await;
        }
        self.clear_state();
        self.set_public(adapter, true).await;
    }

    fn clear_state(&mut self) {
        self.shared.online.store(false, Ordering::Release);
        self.shared.leds.store(0, Ordering::Release);
        self.keyboard.clear();
        let _ = self.mouse.process(MouseEvent::Clear);
        self.notifier.notify(NOTIFY_CHANGED);
    }

    async fn handle_event(&mut self, adapter: &bluer::Adapter, event: BtEvent) {
        match event {
            BtEvent::Keyboard(KeyboardEvent::Reset) | BtEvent::Mouse(MouseEvent::Reset) => {
                self.close_all_clients(adapter).await;
            }
            BtEvent::Keyboard(KeyboardEvent::Clear) | BtEvent::Mouse(MouseEvent::Clear) => {
                let kb_report = {
                    self.keyboard.clear();
                    self.keyboard.report()
                };
                let mouse_reports = self.mouse.process(MouseEvent::Clear);
                self.send_keyboard_report(&kb_report).await;
                for report in mouse_reports {
                    self.send_mouse_report(&report).await;
                }
            }
            BtEvent::Keyboard(event) => {
                for report in self.keyboard.process(event) {
                    self.send_keyboard_report(&report).await;
                }
            }
            BtEvent::Mouse(event) => {
                for report in self.mouse.process(event) {
                    self.send_mouse_report(&report).await;
                }
            }
        }
    }

    async fn send_keyboard_report(&mut self, report: &[u8; 8]) {
        let mut frame = Vec::with_capacity(10);
        frame.extend_from_slice(&[0xA1, 0x01]);
        frame.extend_from_slice(report);
        self.broadcast(&frame).await;
    }

    async fn send_mouse_report(&mut self, report: &[u8]) {
        let mut frame = Vec::with_capacity(report.len() + 2);
        frame.extend_from_slice(&[0xA1, 0x02]);
        frame.extend_from_slice(report);
        self.broadcast(&frame).await;
    }

    async fn broadcast(&mut self, frame: &[u8]) {
        let mut dead: Vec<Address> = Vec::new();
        for (addr, client) in &self.clients {
            if let Some(sock) = &client.int {
                if let Err(err) = sock.send(frame).await {
                    debug!(%addr, %err, "can't send report to Bluetooth client");
                    dead.push(*addr);
                }
            }
        }
        for addr in dead {
            if let Some(client) = self.clients.get_mut(&addr) {
                client.int = None;
                client.ctl = None;
            }
            self.clients.remove(&addr);
        }
        if self.clients.is_empty() && self.shared.online.swap(false, Ordering::AcqRel) {
            self.notifier.notify(NOTIFY_CHANGED);
        }
    }

    async fn set_public(&self, adapter: &bluer::Adapter, public: bool) {
        if !self.config.control_public {
            return;
        }
        debug!(public, "changing Bluetooth visibility");
        if let Err(err) = adapter.set_pairable(public).await {
            error!(%err, "can't set pairable");
        }
        if let Err(err) = adapter.set_discoverable(public).await {
            error!(%err, "can't set discoverable");
        }
    }
}
