// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! usbredir redirection bridge.
//!
//! [`RedirectHost`] owns one peer session: it performs the hello/capability
//! exchange, frames outbound messages through a [`Transport`], and turns
//! inbound messages into calls on a [`RedirectTarget`] (the device model).
//! Locally-originated data transfers carry session-scoped ids and stay
//! pending until the peer resolves them; a control packet arriving with an
//! unrecognized id is a peer-originated request and is surfaced to the
//! target as a SETUP stage.
//!
//! The session lock is never held across a target callback, so the target
//! may re-enter the bridge (completing a transfer, priming an endpoint)
//! from within one.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use slog::{o, Logger};
use usbredir_proto::{
    BulkPacket, Capability, Caps, ControlPacket, Decoder, DeviceConnect,
    Encoder, EpInfo, Hello, InterfaceInfo, Message, MessageType,
    TransferStatus,
};

use crate::chardev::Transport;

#[usdt::provider(provider = "udc")]
mod probes {
    fn redirect_frame_rx(mtype: u32, body_len: u32) {}
    fn redirect_frame_tx(mtype: u32, body_len: u32) {}
    fn redirect_poisoned() {}
}

/// Version banner carried in our hello message.
const OUR_VERSION: &str = "usbredir-udc 0.1";

const USB_REQ_GET_DESCRIPTOR: u8 = 6;
const USB_DT_CONFIG: u8 = 2;
const USB_DIR_IN: u8 = 0x80;
const USB_EP_ADDR_MASK: u8 = 0x0f;

/// How much configuration descriptor to solicit after attach completes.
const CONFIG_DESCRIPTOR_REQUEST_LEN: u16 = 512;

/// Capabilities this end advertises in its hello.
pub fn supported_caps() -> Caps {
    Caps::empty()
        .with(Capability::ConnectDeviceVersion)
        .with(Capability::EpInfoMaxPacketSize)
        .with(Capability::Ids64Bit)
        .with(Capability::BulkLength32Bit)
}

/// Device-model half of the bridge, implemented by the controller.
pub trait RedirectTarget: Send + Sync + 'static {
    /// Peer session established; returns the control endpoint address.
    fn on_attach(&self) -> u8;

    /// Peer went away.
    fn on_detach(&self);

    /// Peer requested a bus-level reset.
    fn on_reset(&self);

    /// Peer-originated control request, to be surfaced as a SETUP stage.
    fn on_control_transfer(&self, ctrl: ControlPacket);

    /// Inbound payload bound for an endpoint's receive queue.
    fn on_data_out(&self, ep: u8, data: &[u8]);
}

/// A locally-originated data transfer awaiting the peer's resolution.
#[derive(Clone, Debug)]
pub struct PendingTransfer {
    pub endpoint: u8,
    pub length: u32,
    /// Cancellation was requested locally; the entry stays pending until
    /// the peer resolves it.
    pub cancel_requested: bool,
}

/// Inbound payload held until the guest primes the endpoint's RX buffer.
struct HeldDelivery {
    data: Vec<u8>,
    ack: Option<(u64, BulkPacket)>,
}

#[derive(Default)]
struct EpFlow {
    /// Consumed on delivery, restored when the guest primes the endpoint.
    busy: bool,
    held: VecDeque<HeldDelivery>,
}

/// Target calls produced while the session lock was held, dispatched after
/// it is released.
enum Dispatch {
    Attach,
    Detach,
    Reset,
    ControlRequest(ControlPacket),
    Deliver(u8, Vec<u8>),
}

struct Session {
    enc: Encoder,
    dec: Decoder,
    peer_hello: Option<Hello>,
    poisoned: bool,
    next_id: u64,
    pending: BTreeMap<u64, PendingTransfer>,
    /// Peer-originated control request awaiting the device's response.
    peer_control: Option<(u64, ControlPacket)>,
    /// Peer-originated bulk IN requests awaiting device data, per endpoint.
    peer_bulk_in: BTreeMap<u8, (u64, BulkPacket)>,
    flows: BTreeMap<u8, EpFlow>,
    configuration: u8,
    alt_settings: BTreeMap<u8, u8>,
    control_ep: u8,
    txq: Vec<u8>,
}

impl Session {
    fn new() -> Self {
        Self {
            enc: Encoder::new(),
            dec: Decoder::new(),
            peer_hello: None,
            poisoned: false,
            next_id: 1,
            pending: BTreeMap::new(),
            peer_control: None,
            peer_bulk_in: BTreeMap::new(),
            flows: BTreeMap::new(),
            configuration: 0,
            alt_settings: BTreeMap::new(),
            control_ep: 0,
            txq: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

pub struct RedirectHost {
    transport: Arc<dyn Transport>,
    target: Mutex<Weak<dyn RedirectTarget>>,
    session: Mutex<Session>,
    log: Logger,
}

impl RedirectHost {
    pub fn new(transport: Arc<dyn Transport>, log: Logger) -> Arc<Self> {
        Arc::new(Self {
            transport,
            target: Mutex::new(Weak::<NullTarget>::new()),
            session: Mutex::new(Session::new()),
            log: log.new(o!("component" => "usbredir-host")),
        })
    }

    pub fn set_target(&self, target: Weak<dyn RedirectTarget>) {
        *self.target.lock().unwrap() = target;
    }

    fn target(&self) -> Option<Arc<dyn RedirectTarget>> {
        self.target.lock().unwrap().upgrade()
    }

    /// Begin the session: register for writable notifications and send our
    /// hello. The peer's half of the exchange arrives through [`consume`].
    ///
    /// [`consume`]: Self::consume
    pub fn connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.transport.set_notifier(Some(Box::new(move |_t| {
            if let Some(host) = weak.upgrade() {
                host.flush();
            }
        })));

        let mut session = self.session.lock().unwrap();
        let hello =
            Hello { version: OUR_VERSION.to_string(), caps: supported_caps() };
        self.queue_frame(&mut session, 0, &Message::Hello(hello));
    }

    /// Drain queued output on transport writable readiness.
    pub fn flush(&self) {
        let mut session = self.session.lock().unwrap();
        self.drain(&mut session);
    }

    /// Bytes queued but not yet accepted by the transport.
    pub fn queued_bytes(&self) -> usize {
        self.session.lock().unwrap().txq.len()
    }

    pub fn pending_transfers(&self) -> usize {
        self.session.lock().unwrap().pending.len()
    }

    /// Configuration value most recently selected by the peer.
    pub fn configuration(&self) -> u8 {
        self.session.lock().unwrap().configuration
    }

    /// Feed bytes received from the peer into the session.
    pub fn consume(&self, bytes: &[u8]) {
        {
            let mut session = self.session.lock().unwrap();
            if session.poisoned {
                return;
            }
            session.dec.push(bytes);
        }
        loop {
            let dispatches = {
                let mut session = self.session.lock().unwrap();
                if session.poisoned {
                    return;
                }
                match session.dec.next() {
                    Ok(Some((id, msg))) => {
                        probes::redirect_frame_rx!(|| (
                            msg.message_type() as u32,
                            0
                        ));
                        self.handle_frame(&mut session, id, msg)
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.poison(&mut session, &e);
                        return;
                    }
                }
            };
            for d in dispatches {
                self.dispatch(d);
            }
        }
    }

    /// The guest primed endpoint `ep`'s receive buffer: restore its flow
    /// credit and deliver the next held payload, if any.
    pub fn data_out_complete(&self, ep: u8) {
        let dispatch = {
            let mut session = self.session.lock().unwrap();
            let held = {
                let flow = session.flows.entry(ep).or_default();
                flow.busy = false;
                let held = flow.held.pop_front();
                flow.busy = held.is_some();
                held
            };
            held.map(|held| {
                if let Some((id, hdr)) = held.ack {
                    self.queue_frame(
                        &mut session,
                        id,
                        &Message::BulkPacket { hdr, data: vec![] },
                    );
                }
                Dispatch::Deliver(ep, held.data)
            })
        };
        if let Some(d) = dispatch {
            self.dispatch(d);
        }
    }

    /// Respond to the outstanding peer-originated control request with the
    /// device's data stage. Returns the number of bytes accepted.
    pub fn control_transfer_complete(&self, data: &[u8]) -> usize {
        let mut session = self.session.lock().unwrap();
        match session.peer_control.take() {
            Some((id, req)) => {
                let hdr = ControlPacket {
                    status: TransferStatus::Success as u8,
                    length: data.len() as u16,
                    ..req
                };
                self.queue_frame(
                    &mut session,
                    id,
                    &Message::ControlPacket { hdr, data: data.to_vec() },
                );
                data.len()
            }
            None => {
                slog::warn!(
                    self.log,
                    "control response with no outstanding request"
                );
                0
            }
        }
    }

    /// Send device data for a bulk IN endpoint. Resolves the peer's
    /// outstanding request for that endpoint when one exists. Returns the
    /// number of bytes accepted.
    pub fn data_in_complete(&self, ep: u8, data: &[u8]) -> usize {
        let mut session = self.session.lock().unwrap();
        let (id, hdr) = match session.peer_bulk_in.remove(&ep) {
            Some((id, req)) => (
                id,
                BulkPacket {
                    status: TransferStatus::Success as u8,
                    length: data.len() as u32,
                    ..req
                },
            ),
            None => {
                let id = session.alloc_id();
                (
                    id,
                    BulkPacket {
                        endpoint: ep | USB_DIR_IN,
                        status: TransferStatus::Success as u8,
                        length: data.len() as u32,
                        stream_id: 0,
                    },
                )
            }
        };
        self.queue_frame(
            &mut session,
            id,
            &Message::BulkPacket { hdr, data: data.to_vec() },
        );
        data.len()
    }

    /// The guest acknowledged the port change raised by attach: solicit the
    /// device configuration over the control endpoint.
    pub fn attach_complete(&self) -> Option<u64> {
        self.send_control_transfer(ControlPacket {
            endpoint: USB_DIR_IN,
            request: USB_REQ_GET_DESCRIPTOR,
            requesttype: USB_DIR_IN,
            status: 0,
            value: (USB_DT_CONFIG as u16) << 8,
            index: 0,
            length: CONFIG_DESCRIPTOR_REQUEST_LEN,
        })
    }

    /// Originate a control transfer toward the peer. Returns the pending
    /// transfer's id, or `None` if the session cannot carry it.
    pub fn send_control_transfer(&self, ctrl: ControlPacket) -> Option<u64> {
        let mut session = self.session.lock().unwrap();
        if !self.session_ready(&session, "control transfer") {
            return None;
        }
        let id = session.alloc_id();
        session.pending.insert(
            id,
            PendingTransfer {
                endpoint: ctrl.endpoint,
                length: ctrl.length as u32,
                cancel_requested: false,
            },
        );
        self.queue_frame(
            &mut session,
            id,
            &Message::ControlPacket { hdr: ctrl, data: vec![] },
        );
        Some(id)
    }

    /// Originate a bulk transfer toward the peer, requesting `length` bytes
    /// from endpoint `ep`. Returns the pending transfer's id.
    pub fn send_bulk_transfer(&self, ep: u8, length: u32) -> Option<u64> {
        let mut session = self.session.lock().unwrap();
        if !self.session_ready(&session, "bulk transfer") {
            return None;
        }
        let id = session.alloc_id();
        session.pending.insert(
            id,
            PendingTransfer {
                endpoint: ep,
                length,
                cancel_requested: false,
            },
        );
        self.queue_frame(
            &mut session,
            id,
            &Message::BulkPacket {
                hdr: BulkPacket {
                    endpoint: ep,
                    status: 0,
                    length,
                    stream_id: 0,
                },
                data: vec![],
            },
        );
        Some(id)
    }

    /// Request cancellation of a pending transfer. Fire-and-forget: the
    /// entry remains pending until the peer's resolution arrives.
    pub fn cancel(&self, id: u64) {
        let mut session = self.session.lock().unwrap();
        match session.pending.get_mut(&id) {
            Some(xfer) => {
                xfer.cancel_requested = true;
                self.queue_frame(
                    &mut session,
                    id,
                    &Message::CancelDataPacket,
                );
            }
            None => {
                slog::debug!(self.log, "cancel of unknown transfer";
                    "id" => id);
            }
        }
    }

    pub fn send_device_connect(&self, info: DeviceConnect) {
        let mut session = self.session.lock().unwrap();
        if self.session_ready(&session, "device_connect") {
            self.queue_frame(&mut session, 0, &Message::DeviceConnect(info));
        }
    }

    pub fn send_interface_info(&self, info: &InterfaceInfo) {
        let mut session = self.session.lock().unwrap();
        if self.session_ready(&session, "interface_info") {
            self.queue_frame(
                &mut session,
                0,
                &Message::InterfaceInfo(*info),
            );
        }
    }

    pub fn send_ep_info(&self, info: &EpInfo) {
        let mut session = self.session.lock().unwrap();
        if self.session_ready(&session, "ep_info") {
            self.queue_frame(&mut session, 0, &Message::EpInfo(*info));
        }
    }

    fn session_ready(&self, session: &Session, what: &str) -> bool {
        if session.poisoned {
            slog::warn!(self.log, "{} on poisoned session", what);
            false
        } else if session.peer_hello.is_none() {
            slog::warn!(self.log, "{} before hello exchange", what);
            false
        } else {
            true
        }
    }

    fn poison(&self, session: &mut Session, err: &dyn std::fmt::Display) {
        slog::error!(self.log, "protocol error, discarding session input";
            "error" => %err);
        probes::redirect_poisoned!(|| ());
        session.poisoned = true;
    }

    fn queue_frame(&self, session: &mut Session, id: u64, msg: &Message) {
        let frame = session.enc.encode(id, msg);
        probes::redirect_frame_tx!(|| (
            msg.message_type() as u32,
            frame.len() as u32
        ));
        session.txq.extend_from_slice(&frame);
        self.drain(session);
    }

    fn drain(&self, session: &mut Session) {
        while !session.txq.is_empty() {
            let n = self.transport.write(&session.txq);
            if n == 0 {
                break;
            }
            session.txq.drain(..n);
        }
    }

    /// Route one payload through the endpoint's flow credit: deliver it if
    /// the endpoint is idle, otherwise hold it until the guest primes.
    fn route_delivery(
        &self,
        session: &mut Session,
        ep: u8,
        data: Vec<u8>,
        ack: Option<(u64, BulkPacket)>,
    ) -> Option<Dispatch> {
        let flow = session.flows.entry(ep).or_default();
        if flow.busy {
            flow.held.push_back(HeldDelivery { data, ack });
            return None;
        }
        flow.busy = true;
        if let Some((id, hdr)) = ack {
            self.queue_frame(
                session,
                id,
                &Message::BulkPacket { hdr, data: vec![] },
            );
        }
        Some(Dispatch::Deliver(ep, data))
    }

    /// Resolve one of our pending transfers with the peer's reply.
    fn resolve_pending(
        &self,
        session: &mut Session,
        id: u64,
        status: TransferStatus,
        data: Vec<u8>,
    ) -> Option<Dispatch> {
        let xfer = session.pending.remove(&id)?;
        match status {
            TransferStatus::Success => {
                let ep = xfer.endpoint & USB_EP_ADDR_MASK;
                self.route_delivery(session, ep, data, None)
            }
            TransferStatus::Cancelled => {
                slog::debug!(self.log, "transfer cancelled by peer";
                    "id" => id,
                    "solicited" => xfer.cancel_requested);
                None
            }
            other => {
                slog::warn!(self.log, "transfer failed";
                    "id" => id, "status" => ?other);
                None
            }
        }
    }

    fn handle_frame(
        &self,
        session: &mut Session,
        id: u64,
        msg: Message,
    ) -> Vec<Dispatch> {
        // Nothing but a hello is acceptable until the exchange completes.
        if session.peer_hello.is_none() {
            match msg {
                Message::Hello(hello) => {
                    let negotiated = supported_caps().intersect(&hello.caps);
                    session.enc.set_negotiated(negotiated);
                    session.dec.set_negotiated(negotiated);
                    slog::info!(self.log, "peer hello";
                        "version" => &hello.version);
                    session.peer_hello = Some(hello);
                    return vec![Dispatch::Attach];
                }
                other => {
                    self.poison(
                        session,
                        &usbredir_proto::ProtocolError::HelloExpected(
                            other.message_type(),
                        ),
                    );
                    return vec![];
                }
            }
        }

        match msg {
            Message::Hello(_) => {
                self.poison(
                    session,
                    &usbredir_proto::ProtocolError::HelloExpected(
                        MessageType::Hello,
                    ),
                );
                vec![]
            }
            Message::ControlPacket { hdr, data } => {
                if session.pending.contains_key(&id) {
                    let status = TransferStatus::from_wire(hdr.status);
                    return self
                        .resolve_pending(session, id, status, data)
                        .into_iter()
                        .collect();
                }
                // Peer-originated request. Only the control endpoint can
                // carry one; anything else is answered with a stall.
                if hdr.endpoint & USB_EP_ADDR_MASK != session.control_ep {
                    slog::warn!(self.log,
                        "control request on non-control endpoint";
                        "endpoint" => hdr.endpoint);
                    let reply = ControlPacket {
                        status: TransferStatus::Stall as u8,
                        length: 0,
                        ..hdr
                    };
                    self.queue_frame(
                        session,
                        id,
                        &Message::ControlPacket { hdr: reply, data: vec![] },
                    );
                    return vec![];
                }
                session.peer_control = Some((id, hdr));
                let mut out = vec![Dispatch::ControlRequest(hdr)];
                if !data.is_empty() {
                    let ep = session.control_ep;
                    out.extend(self.route_delivery(session, ep, data, None));
                }
                out
            }
            Message::BulkPacket { hdr, data } => {
                if session.pending.contains_key(&id) {
                    let status = TransferStatus::from_wire(hdr.status);
                    return self
                        .resolve_pending(session, id, status, data)
                        .into_iter()
                        .collect();
                }
                let ep = hdr.endpoint & USB_EP_ADDR_MASK;
                if hdr.endpoint & USB_DIR_IN != 0 {
                    // Bulk IN request: the device answers through
                    // data_in_complete once the guest supplies data.
                    session.peer_bulk_in.insert(ep, (id, hdr));
                    vec![]
                } else {
                    let ack = (id, hdr);
                    self.route_delivery(session, ep, data, Some(ack))
                        .into_iter()
                        .collect()
                }
            }
            Message::CancelDataPacket => {
                // Cancellation of a peer-originated request we still hold.
                if let Some((req_id, req)) = session.peer_control.take() {
                    if req_id == id {
                        let reply = ControlPacket {
                            status: TransferStatus::Cancelled as u8,
                            length: 0,
                            ..req
                        };
                        self.queue_frame(
                            session,
                            id,
                            &Message::ControlPacket {
                                hdr: reply,
                                data: vec![],
                            },
                        );
                        return vec![];
                    }
                    session.peer_control = Some((req_id, req));
                }
                let bulk_hit = session
                    .peer_bulk_in
                    .iter()
                    .find(|(_, (req_id, _))| *req_id == id)
                    .map(|(&ep, &(_, req))| (ep, req));
                if let Some((ep, req)) = bulk_hit {
                    session.peer_bulk_in.remove(&ep);
                    let reply = BulkPacket {
                        status: TransferStatus::Cancelled as u8,
                        length: 0,
                        ..req
                    };
                    self.queue_frame(
                        session,
                        id,
                        &Message::BulkPacket { hdr: reply, data: vec![] },
                    );
                    return vec![];
                }
                slog::debug!(self.log, "cancel for unknown request";
                    "id" => id);
                vec![]
            }
            Message::Reset => vec![Dispatch::Reset],
            Message::DeviceDisconnect => vec![Dispatch::Detach],
            Message::SetConfiguration { configuration } => {
                session.configuration = configuration;
                self.queue_frame(
                    session,
                    id,
                    &Message::ConfigurationStatus {
                        status: TransferStatus::Success as u8,
                        configuration,
                    },
                );
                vec![]
            }
            Message::GetConfiguration => {
                let configuration = session.configuration;
                self.queue_frame(
                    session,
                    id,
                    &Message::ConfigurationStatus {
                        status: TransferStatus::Success as u8,
                        configuration,
                    },
                );
                vec![]
            }
            Message::SetAltSetting { interface, alt } => {
                session.alt_settings.insert(interface, alt);
                self.queue_frame(
                    session,
                    id,
                    &Message::AltSettingStatus {
                        status: TransferStatus::Success as u8,
                        interface,
                        alt,
                    },
                );
                vec![]
            }
            Message::GetAltSetting { interface } => {
                let alt =
                    session.alt_settings.get(&interface).copied().unwrap_or(0);
                self.queue_frame(
                    session,
                    id,
                    &Message::AltSettingStatus {
                        status: TransferStatus::Success as u8,
                        interface,
                        alt,
                    },
                );
                vec![]
            }
            Message::DeviceConnect(_)
            | Message::InterfaceInfo(_)
            | Message::EpInfo(_)
            | Message::ConfigurationStatus { .. }
            | Message::AltSettingStatus { .. } => {
                // Device-role announcements flow outward only.
                slog::warn!(self.log, "ignoring unexpected message";
                    "type" => ?msg.message_type());
                vec![]
            }
        }
    }

    fn dispatch(&self, d: Dispatch) {
        let Some(target) = self.target() else {
            slog::warn!(self.log, "no target attached, dropping event");
            return;
        };
        match d {
            Dispatch::Attach => {
                let control_ep = target.on_attach();
                self.session.lock().unwrap().control_ep = control_ep;
            }
            Dispatch::Detach => target.on_detach(),
            Dispatch::Reset => target.on_reset(),
            Dispatch::ControlRequest(ctrl) => target.on_control_transfer(ctrl),
            Dispatch::Deliver(ep, data) => target.on_data_out(ep, &data),
        }
    }
}

/// Placeholder for an unset target weak reference.
struct NullTarget;
impl RedirectTarget for NullTarget {
    fn on_attach(&self) -> u8 {
        0
    }
    fn on_detach(&self) {}
    fn on_reset(&self) {}
    fn on_control_transfer(&self, _ctrl: ControlPacket) {}
    fn on_data_out(&self, _ep: u8, _data: &[u8]) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chardev::{NotifierCell, TransportNotifier};
    use slog::Discard;
    use usbredir_proto::DeviceSpeed;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Captures written bytes, optionally capping how many it will accept
    /// in total to exercise the output queue.
    struct TestTransport {
        written: Mutex<Vec<u8>>,
        accept_budget: AtomicUsize,
        notifier: NotifierCell,
    }
    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                accept_budget: AtomicUsize::new(usize::MAX),
                notifier: NotifierCell::new(),
            })
        }
        fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.written.lock().unwrap())
        }
        fn set_budget(&self, budget: usize) {
            self.accept_budget.store(budget, Ordering::SeqCst);
        }
        fn notify_writable(&self) {
            self.notifier.notify(self);
        }
    }
    impl Transport for TestTransport {
        fn write(&self, data: &[u8]) -> usize {
            let budget = self.accept_budget.load(Ordering::SeqCst);
            let n = data.len().min(budget);
            if budget != usize::MAX {
                self.accept_budget.store(budget - n, Ordering::SeqCst);
            }
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            n
        }
        fn set_notifier(&self, f: Option<TransportNotifier>) {
            self.notifier.set(f);
        }
    }

    #[derive(Default)]
    struct Calls {
        attach: usize,
        detach: usize,
        reset: usize,
        control: Vec<ControlPacket>,
        data_out: Vec<(u8, Vec<u8>)>,
    }

    struct TestTarget {
        calls: Mutex<Calls>,
    }
    impl TestTarget {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Calls::default()) })
        }
    }
    impl RedirectTarget for TestTarget {
        fn on_attach(&self) -> u8 {
            self.calls.lock().unwrap().attach += 1;
            0
        }
        fn on_detach(&self) {
            self.calls.lock().unwrap().detach += 1;
        }
        fn on_reset(&self) {
            self.calls.lock().unwrap().reset += 1;
        }
        fn on_control_transfer(&self, ctrl: ControlPacket) {
            self.calls.lock().unwrap().control.push(ctrl);
        }
        fn on_data_out(&self, ep: u8, data: &[u8]) {
            self.calls.lock().unwrap().data_out.push((ep, data.to_vec()));
        }
    }

    /// Peer-side codec pair prepared as an unmodified usbredir peer would
    /// be after the hello exchange.
    struct Peer {
        enc: Encoder,
        dec: Decoder,
    }
    impl Peer {
        fn hello_bytes() -> Vec<u8> {
            Encoder::new().encode(
                0,
                &Message::Hello(Hello {
                    version: "test peer".to_string(),
                    caps: supported_caps(),
                }),
            )
        }
        fn negotiated() -> Self {
            let mut enc = Encoder::new();
            let mut dec = Decoder::new();
            enc.set_negotiated(supported_caps());
            dec.set_negotiated(supported_caps());
            Self { enc, dec }
        }
        fn decode_all(&mut self, bytes: &[u8]) -> Vec<(u64, Message)> {
            self.dec.push(bytes);
            let mut out = Vec::new();
            while let Some(frame) = self.dec.next().unwrap() {
                out.push(frame);
            }
            out
        }
    }

    fn connected() -> (Arc<RedirectHost>, Arc<TestTransport>, Arc<TestTarget>)
    {
        let transport = TestTransport::new();
        let target = TestTarget::new();
        let host = RedirectHost::new(
            transport.clone(),
            Logger::root(Discard, o!()),
        );
        host.set_target(Arc::downgrade(
            &(target.clone() as Arc<dyn RedirectTarget>),
        ));
        host.connect();
        host.consume(&Peer::hello_bytes());
        (host, transport, target)
    }

    #[test]
    fn hello_exchange_attaches() {
        let (host, transport, target) = connected();

        // Our hello went out pre-negotiation.
        let mut dec = Decoder::new();
        dec.push(&transport.take_written());
        let (_, msg) = dec.next().unwrap().unwrap();
        match msg {
            Message::Hello(h) => assert_eq!(h.caps, supported_caps()),
            other => panic!("expected hello, got {other:?}"),
        }

        assert_eq!(target.calls.lock().unwrap().attach, 1);
        assert_eq!(host.pending_transfers(), 0);
    }

    #[test]
    fn message_before_hello_poisons() {
        let transport = TestTransport::new();
        let target = TestTarget::new();
        let host = RedirectHost::new(
            transport.clone(),
            Logger::root(Discard, o!()),
        );
        host.set_target(Arc::downgrade(
            &(target.clone() as Arc<dyn RedirectTarget>),
        ));
        host.connect();

        host.consume(&Encoder::new().encode(0, &Message::Reset));
        assert_eq!(target.calls.lock().unwrap().reset, 0);

        // Even a valid hello is discarded now.
        host.consume(&Peer::hello_bytes());
        assert_eq!(target.calls.lock().unwrap().attach, 0);
    }

    #[test]
    fn garbage_poisons_session() {
        let (host, _transport, target) = connected();

        // Unknown message type 0xdead.
        let mut junk = vec![0u8; 16];
        junk[0] = 0xad;
        junk[1] = 0xde;
        host.consume(&junk);

        let mut peer = Peer::negotiated();
        host.consume(&peer.enc.encode(0, &Message::Reset));
        assert_eq!(target.calls.lock().unwrap().reset, 0);
    }

    #[test]
    fn attach_complete_solicits_configuration() {
        let (host, transport, target) = connected();
        transport.take_written();

        let id = host.attach_complete().unwrap();
        assert_eq!(host.pending_transfers(), 1);

        let mut peer = Peer::negotiated();
        let frames = peer.decode_all(&transport.take_written());
        let (got_id, msg) = &frames[0];
        assert_eq!(*got_id, id);
        match msg {
            Message::ControlPacket { hdr, .. } => {
                assert_eq!(hdr.request, USB_REQ_GET_DESCRIPTOR);
                assert_eq!(hdr.value, 0x0200);
                assert_eq!(hdr.length, CONFIG_DESCRIPTOR_REQUEST_LEN);
            }
            other => panic!("expected control packet, got {other:?}"),
        }

        // Peer answers with descriptor data under the same id.
        let payload = vec![9, 2, 32, 0];
        let reply = peer.enc.encode(
            id,
            &Message::ControlPacket {
                hdr: ControlPacket {
                    endpoint: USB_DIR_IN,
                    status: TransferStatus::Success as u8,
                    ..Default::default()
                },
                data: payload.clone(),
            },
        );
        host.consume(&reply);

        assert_eq!(host.pending_transfers(), 0);
        let calls = target.calls.lock().unwrap();
        assert_eq!(calls.data_out, vec![(0, payload)]);
    }

    #[test]
    fn cancelled_resolution_yields_no_data() {
        let (host, transport, target) = connected();
        transport.take_written();

        let id = host.attach_complete().unwrap();
        host.cancel(id);

        let mut peer = Peer::negotiated();
        let frames = peer.decode_all(&transport.take_written());
        assert_eq!(frames[1].0, id);
        assert!(matches!(frames[1].1, Message::CancelDataPacket));
        // Still pending until the peer resolves it.
        assert_eq!(host.pending_transfers(), 1);

        let reply = peer.enc.encode(
            id,
            &Message::ControlPacket {
                hdr: ControlPacket {
                    status: TransferStatus::Cancelled as u8,
                    ..Default::default()
                },
                data: vec![],
            },
        );
        host.consume(&reply);
        assert_eq!(host.pending_transfers(), 0);
        assert!(target.calls.lock().unwrap().data_out.is_empty());
    }

    #[test]
    fn peer_control_request_round_trip() {
        let (host, transport, target) = connected();
        transport.take_written();

        let mut peer = Peer::negotiated();
        let req = ControlPacket {
            endpoint: USB_DIR_IN,
            request: USB_REQ_GET_DESCRIPTOR,
            requesttype: USB_DIR_IN,
            status: 0,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        host.consume(&peer.enc.encode(
            7,
            &Message::ControlPacket { hdr: req, data: vec![] },
        ));

        assert_eq!(target.calls.lock().unwrap().control.len(), 1);

        // Device answers; the reply reuses the peer's id.
        let descriptor = vec![18, 1, 0, 2];
        assert_eq!(host.control_transfer_complete(&descriptor), 4);
        let frames = peer.decode_all(&transport.take_written());
        let (id, msg) = &frames[0];
        assert_eq!(*id, 7);
        match msg {
            Message::ControlPacket { hdr, data } => {
                assert_eq!(hdr.status, TransferStatus::Success as u8);
                assert_eq!(*data, descriptor);
            }
            other => panic!("expected control packet, got {other:?}"),
        }

        // A second response has nothing to answer.
        assert_eq!(host.control_transfer_complete(&descriptor), 0);
    }

    #[test]
    fn non_control_endpoint_request_stalls() {
        let (host, transport, target) = connected();
        transport.take_written();

        let mut peer = Peer::negotiated();
        let req = ControlPacket { endpoint: 0x81, ..Default::default() };
        host.consume(&peer.enc.encode(
            9,
            &Message::ControlPacket { hdr: req, data: vec![] },
        ));

        assert!(target.calls.lock().unwrap().control.is_empty());
        let frames = peer.decode_all(&transport.take_written());
        match &frames[0].1 {
            Message::ControlPacket { hdr, .. } => {
                assert_eq!(hdr.status, TransferStatus::Stall as u8);
            }
            other => panic!("expected stall reply, got {other:?}"),
        }
    }

    #[test]
    fn bulk_out_flow_control_holds_second_packet() {
        let (host, transport, target) = connected();
        transport.take_written();

        let mut peer = Peer::negotiated();
        for (id, byte) in [(11u64, 0xaa), (12u64, 0xbb)] {
            let frame = peer.enc.encode(
                id,
                &Message::BulkPacket {
                    hdr: BulkPacket {
                        endpoint: 1,
                        status: 0,
                        length: 4,
                        stream_id: 0,
                    },
                    data: vec![byte; 4],
                },
            );
            host.consume(&frame);
        }

        // First delivered immediately (with its completion ack), second
        // held until the guest primes the endpoint.
        {
            let calls = target.calls.lock().unwrap();
            assert_eq!(calls.data_out, vec![(1, vec![0xaa; 4])]);
        }
        let frames = peer.decode_all(&transport.take_written());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 11);

        host.data_out_complete(1);
        {
            let calls = target.calls.lock().unwrap();
            assert_eq!(calls.data_out.len(), 2);
            assert_eq!(calls.data_out[1], (1, vec![0xbb; 4]));
        }
        let frames = peer.decode_all(&transport.take_written());
        assert_eq!(frames[0].0, 12);
    }

    #[test]
    fn bulk_in_request_answered_by_device_data() {
        let (host, transport, _target) = connected();
        transport.take_written();

        let mut peer = Peer::negotiated();
        host.consume(&peer.enc.encode(
            21,
            &Message::BulkPacket {
                hdr: BulkPacket {
                    endpoint: 0x82,
                    status: 0,
                    length: 64,
                    stream_id: 0,
                },
                data: vec![],
            },
        ));

        assert_eq!(host.data_in_complete(2, &[1, 2, 3]), 3);
        let frames = peer.decode_all(&transport.take_written());
        let (id, msg) = &frames[0];
        assert_eq!(*id, 21);
        match msg {
            Message::BulkPacket { hdr, data } => {
                assert_eq!(hdr.status, TransferStatus::Success as u8);
                assert_eq!(hdr.length, 3);
                assert_eq!(*data, vec![1, 2, 3]);
            }
            other => panic!("expected bulk packet, got {other:?}"),
        }
    }

    #[test]
    fn peer_configuration_acknowledged() {
        let (host, transport, _target) = connected();
        transport.take_written();

        let mut peer = Peer::negotiated();
        host.consume(
            &peer.enc.encode(0, &Message::SetConfiguration {
                configuration: 2,
            }),
        );
        assert_eq!(host.configuration(), 2);

        host.consume(&peer.enc.encode(0, &Message::GetConfiguration));
        let frames = peer.decode_all(&transport.take_written());
        for (_, msg) in &frames {
            match msg {
                Message::ConfigurationStatus { status, configuration } => {
                    assert_eq!(*status, TransferStatus::Success as u8);
                    assert_eq!(*configuration, 2);
                }
                other => panic!("expected status reply, got {other:?}"),
            }
        }
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn device_identity_messages_reach_peer() {
        let (host, transport, _target) = connected();
        transport.take_written();

        host.send_device_connect(DeviceConnect {
            speed: DeviceSpeed::High as u8,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            vendor_id: 0x1d6b,
            product_id: 0x0104,
            device_version_bcd: 0x0100,
        });
        let mut iface = InterfaceInfo::default();
        iface.interface_count = 1;
        iface.interface_class[0] = 8;
        host.send_interface_info(&iface);
        let mut eps = EpInfo::default();
        eps.ep_type[1] = 2;
        eps.max_packet_size[1] = 512;
        host.send_ep_info(&eps);

        let mut peer = Peer::negotiated();
        let frames = peer.decode_all(&transport.take_written());
        assert_eq!(frames.len(), 3);
        match &frames[0].1 {
            Message::DeviceConnect(dc) => {
                assert_eq!(dc.product_id, 0x0104);
                assert_eq!(dc.device_version_bcd, 0x0100);
            }
            other => panic!("expected device_connect, got {other:?}"),
        }
        assert_eq!(frames[1].1, Message::InterfaceInfo(iface));
        assert_eq!(frames[2].1, Message::EpInfo(eps));
    }

    #[test]
    fn identity_messages_dropped_before_hello() {
        let transport = TestTransport::new();
        let host = RedirectHost::new(
            transport.clone(),
            Logger::root(Discard, o!()),
        );
        host.connect();
        transport.take_written();

        host.send_interface_info(&InterfaceInfo::default());
        host.send_ep_info(&EpInfo::default());
        assert!(transport.take_written().is_empty());
        assert_eq!(host.queued_bytes(), 0);
    }

    #[test]
    fn short_writes_queue_and_flush() {
        let transport = TestTransport::new();
        let target = TestTarget::new();
        let host = RedirectHost::new(
            transport.clone(),
            Logger::root(Discard, o!()),
        );
        host.set_target(Arc::downgrade(
            &(target.clone() as Arc<dyn RedirectTarget>),
        ));

        transport.set_budget(5);
        host.connect();
        assert!(host.queued_bytes() > 0);

        // Readiness notification drains the remainder.
        transport.set_budget(usize::MAX);
        transport.notify_writable();
        assert_eq!(host.queued_bytes(), 0);

        let mut dec = Decoder::new();
        dec.push(&transport.take_written());
        assert!(matches!(
            dec.next().unwrap().unwrap().1,
            Message::Hello(_)
        ));
    }
}
