//! # The Nub
//!
//! The Nub is the process-wide dispatcher. It owns every [`Channel`], the
//! timer registry, the pending-reply registry and the birth/death listener
//! registry, and it runs the single-threaded dispatch loop.
//!
//! ## Dispatch model
//!
//! Everything happens on one task. The loop waits for a datagram, a timer
//! expiry or an interrupt, then runs the matching handler to completion.
//! Handlers receive `&mut Nub` and never block: waiting is expressed by
//! registering a timer or sending a request and returning.
//!
//! Process-level callbacks (timers, replies, announcements, channel failures)
//! go through the [`NubHandler`] trait. Messages go through the
//! [`InterfaceTable`] the process builds at startup.
//!
//! ## Channels
//!
//! Channels are shared through `Rc<RefCell<_>>` between the Nub's map and
//! any [`ChannelOwner`](crate::ChannelOwner)s. The Nub evicts an entry once
//! nobody owns it any more and it has nothing left to deliver, or once it has
//! failed with no owner.

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::channel::{Channel, ChannelKind, ChannelStats, ResendPolicy};
use crate::error::{FailureReason, MercuryError};
use crate::interface::{Incoming, InterfaceElement, InterfaceTable, MACHINE_INTERFACE};
use crate::machine::{
    Announcement, InterfaceQuery, ListenerKind, ListenerRegistry, ListenerTag, BIRTH, DEATH,
    QUERY_INTERFACE, QUERY_INTERFACE_REPLY,
};
use crate::timers::{TimerId, TimerQueue};
use crate::wire::{encode_payload, Packet, ReplyId, ReplyTag, WireMessage, MAX_DATAGRAM_SIZE};

/// Configuration of a Nub.
#[derive(Debug, Clone)]
pub struct NubConfig {
    /// Address to bind; port 0 picks an ephemeral port
    pub bind_address: Address,
    /// Where birth, death and interface queries are sent
    pub announce_addresses: Vec<Address>,
    /// Channel resend behaviour
    pub resend: ResendPolicy,
    /// How often channels are checked for resends
    pub tick_interval: Duration,
    /// Default deadline for request replies
    pub reply_timeout: Duration,
    /// Protocol errors tolerated on one channel before it is condemned
    pub max_protocol_errors: u32,
    /// Unowned, fully acknowledged channels idle this long are evicted
    pub channel_idle_timeout: Duration,
    /// Optional SO_SNDBUF size
    pub send_buffer_size: Option<usize>,
    /// Optional SO_RCVBUF size
    pub recv_buffer_size: Option<usize>,
}

impl Default for NubConfig {
    fn default() -> Self {
        Self {
            bind_address: Address::new(std::net::Ipv4Addr::LOCALHOST, 0),
            announce_addresses: Vec::new(),
            resend: ResendPolicy::default(),
            tick_interval: Duration::from_millis(50),
            reply_timeout: Duration::from_secs(5),
            max_protocol_errors: 10,
            channel_idle_timeout: Duration::from_secs(60),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Process-level callbacks invoked by the dispatch loop.
///
/// Every method has a default so a process only implements what it uses.
/// Tags and timer args are values the process chose when registering; an
/// event whose tag no longer matches anything should simply be ignored.
pub trait NubHandler {
    /// A timer fired. Return `Some(interval)` to re-arm it.
    fn handle_timeout(&mut self, _nub: &mut Nub, _id: TimerId, _arg: u64) -> Option<Duration> {
        None
    }

    /// A request completed, failed or timed out.
    fn handle_reply(&mut self, _nub: &mut Nub, _tag: u64, _reply: Result<Incoming, MercuryError>) {}

    /// A process implementing a listened-to interface announced itself.
    fn handle_birth(&mut self, _nub: &mut Nub, _tag: ListenerTag, _announcement: &Announcement) {}

    /// A process implementing a listened-to interface announced its death.
    fn handle_death(&mut self, _nub: &mut Nub, _tag: ListenerTag, _announcement: &Announcement) {}

    /// A channel's remote end was declared dead. Reported once per failure.
    fn handle_channel_failure(&mut self, _nub: &mut Nub, _addr: Address, _reason: FailureReason) {}

    /// The process was interrupted (e.g. by a signal).
    fn handle_interrupt(&mut self, nub: &mut Nub) {
        nub.break_processing();
    }
}

/// Sends interrupts into a running dispatch loop from outside it.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    sender: mpsc::UnboundedSender<()>,
}

impl InterruptHandle {
    /// Wakes the loop and calls [`NubHandler::handle_interrupt`].
    ///
    /// Returns `false` once the Nub has been dropped.
    pub fn interrupt(&self) -> bool {
        self.sender.send(()).is_ok()
    }
}

/// Counters kept by the Nub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NubStats {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub protocol_errors: u64,
    pub channels_evicted: u64,
    /// Calls to [`Nub::break_processing`], repeated ones included
    pub break_requests: u64,
}

#[derive(Debug)]
struct ChannelEntry {
    channel: Rc<RefCell<Channel>>,
    /// Whether a ChannelOwner ever held this channel
    owned: bool,
}

#[derive(Debug, Clone)]
struct PendingReply {
    addr: Address,
    tag: u64,
    deadline: Instant,
    element: &'static str,
}

#[derive(Debug)]
enum NubEvent {
    ChannelFailed { addr: Address, reason: FailureReason },
    RequestFailed { reply_id: ReplyId, error: MercuryError },
}

/// The process-wide network dispatcher.
pub struct Nub {
    config: NubConfig,
    local_addr: Address,
    socket: Option<UdpSocket>,
    channels: BTreeMap<Address, ChannelEntry>,
    next_version: u32,
    timers: TimerQueue,
    /// Timer currently being fired and whether it was cancelled meanwhile
    firing_timer: Option<(TimerId, bool)>,
    pending_replies: HashMap<ReplyId, PendingReply>,
    next_reply_id: ReplyId,
    listeners: ListenerRegistry,
    advertised: BTreeSet<String>,
    outbox: VecDeque<(Address, Vec<u8>)>,
    events: VecDeque<NubEvent>,
    next_channel_tick: Instant,
    breaking: bool,
    interrupt_tx: mpsc::UnboundedSender<()>,
    interrupt_rx: mpsc::UnboundedReceiver<()>,
    stats: NubStats,
}

impl std::fmt::Debug for Nub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nub")
            .field("local_addr", &self.local_addr)
            .field("bound", &self.socket.is_some())
            .field("channels", &self.channels.len())
            .field("timers", &self.timers.len())
            .field("pending_replies", &self.pending_replies.len())
            .field("breaking", &self.breaking)
            .finish()
    }
}

impl Nub {
    /// Creates a Nub that is not bound to any socket.
    ///
    /// Datagrams accumulate in the outbox and are fed in through
    /// [`Nub::process_datagram`], which is how tests drive processes.
    pub fn new(local_addr: Address, config: NubConfig) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
            .unwrap_or(0);
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        let next_channel_tick = Instant::now() + config.tick_interval;

        Self {
            config,
            local_addr,
            socket: None,
            channels: BTreeMap::new(),
            next_version: seed,
            timers: TimerQueue::new(),
            firing_timer: None,
            pending_replies: HashMap::new(),
            next_reply_id: 0,
            listeners: ListenerRegistry::new(),
            advertised: BTreeSet::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            next_channel_tick,
            breaking: false,
            interrupt_tx,
            interrupt_rx,
            stats: NubStats::default(),
        }
    }

    /// Creates a Nub bound to `config.bind_address`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: NubConfig) -> Result<Self, MercuryError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| MercuryError::Network(format!("Socket creation failed: {e}")))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set SO_REUSEADDR: {}", e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to enable broadcast: {}", e);
        }
        if let Some(size) = config.send_buffer_size {
            if let Err(e) = socket.set_send_buffer_size(size) {
                warn!("Failed to set send buffer size to {}: {}", size, e);
            }
        }
        if let Some(size) = config.recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                warn!("Failed to set receive buffer size to {}: {}", size, e);
            }
        }
        socket
            .bind(&config.bind_address.to_socket_addr().into())
            .map_err(|e| {
                MercuryError::Network(format!("Bind to {} failed: {e}", config.bind_address))
            })?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let udp = UdpSocket::from_std(std_socket)?;
        let local_addr = Address::try_from(udp.local_addr()?)?;

        let mut nub = Nub::new(local_addr, config);
        nub.socket = Some(udp);
        info!("📡 Nub bound to {}", local_addr);
        Ok(nub)
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    pub fn config(&self) -> &NubConfig {
        &self.config
    }

    pub fn stats(&self) -> NubStats {
        self.stats
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    fn allocate_version(&mut self) -> u32 {
        self.next_version = self.next_version.wrapping_add(1);
        self.next_version
    }

    /// Returns the channel to `addr`, creating it if needed.
    pub fn find_or_create_channel(&mut self, addr: Address) -> Rc<RefCell<Channel>> {
        if let Some(entry) = self.channels.get(&addr) {
            return entry.channel.clone();
        }
        let version = self.allocate_version();
        let channel = Rc::new(RefCell::new(Channel::new(
            addr,
            ChannelKind::Regular,
            version,
            self.config.resend.max_reorder_window,
        )));
        debug!("Created channel to {}", addr);
        self.channels.insert(
            addr,
            ChannelEntry {
                channel: channel.clone(),
                owned: false,
            },
        );
        channel
    }

    /// Returns the channel to `addr` for a new owner.
    pub(crate) fn acquire_channel(&mut self, addr: Address) -> Rc<RefCell<Channel>> {
        let channel = self.find_or_create_channel(addr);
        if let Some(entry) = self.channels.get_mut(&addr) {
            entry.owned = true;
        }
        channel
    }

    /// Resets a channel in place with a fresh stream version.
    ///
    /// Requests still waiting on the old stream fail with `Condemned`.
    pub(crate) fn reset_channel(&mut self, channel: &Rc<RefCell<Channel>>) {
        let version = self.allocate_version();
        let addr = channel.borrow().addr();
        channel.borrow_mut().reset(version);
        for reply_id in self.pending_replies_to(addr) {
            self.events.push_back(NubEvent::RequestFailed {
                reply_id,
                error: MercuryError::TransportFailure {
                    addr,
                    reason: FailureReason::Condemned,
                },
            });
        }
    }

    /// Read access to the channel to `addr`, if one exists.
    pub fn channel(&self, addr: Address) -> Option<Ref<'_, Channel>> {
        self.channels.get(&addr).map(|entry| entry.channel.borrow())
    }

    pub fn has_channel(&self, addr: Address) -> bool {
        self.channels.contains_key(&addr)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Statistics of the channel to `addr`.
    pub fn channel_stats(&self, addr: Address) -> Option<ChannelStats> {
        self.channel(addr).map(|c| c.stats())
    }

    /// Declares the remote at `addr` dead.
    ///
    /// Queues the failure callback if this is the channel's first failure.
    pub fn fail_channel(&mut self, addr: Address, reason: FailureReason) {
        let Some(entry) = self.channels.get(&addr) else {
            return;
        };
        if entry.channel.borrow_mut().fail(reason) {
            self.events.push_back(NubEvent::ChannelFailed { addr, reason });
        }
    }

    fn note_protocol_error(&mut self, from: Address, on_channel: bool, error: &MercuryError) {
        self.stats.protocol_errors += 1;
        warn!("Protocol error from {}: {}", from, error);
        if !on_channel {
            return;
        }
        let count = match self.channels.get(&from) {
            Some(entry) => entry.channel.borrow_mut().note_protocol_error(),
            None => return,
        };
        if count >= self.config.max_protocol_errors {
            warn!("Condemning channel to {} after {} protocol errors", from, count);
            self.fail_channel(from, FailureReason::ProtocolViolation);
        }
    }

    /// Removes channels nobody needs any more.
    fn sweep_channels(&mut self, now: Instant) {
        let idle_timeout = self.config.channel_idle_timeout;
        let before = self.channels.len();
        self.channels.retain(|addr, entry| {
            if Rc::strong_count(&entry.channel) > 1 {
                return true;
            }
            let channel = entry.channel.borrow();
            let drained = channel.num_unacked() == 0;
            let evict = if channel.has_remote_failed() {
                true
            } else if entry.owned {
                drained
            } else {
                drained
                    && channel
                        .last_received()
                        .map_or(false, |t| now.saturating_duration_since(t) >= idle_timeout)
            };
            if evict {
                debug!("Evicting channel to {}", addr);
            }
            !evict
        });
        self.stats.channels_evicted += (before - self.channels.len()) as u64;
    }

    fn tick_channels(&mut self, now: Instant) {
        let mut failures = Vec::new();
        for (addr, entry) in &self.channels {
            match entry.channel.borrow_mut().resend_due(now, &self.config.resend) {
                Ok(datagrams) => {
                    for bytes in datagrams {
                        self.outbox.push_back((*addr, bytes));
                    }
                }
                Err(reason) => failures.push((*addr, reason)),
            }
        }
        for (addr, reason) in failures {
            self.events.push_back(NubEvent::ChannelFailed { addr, reason });
        }
        self.sweep_channels(now);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Sends on a specific channel. Returns whether the message was queued.
    pub(crate) fn post(&mut self, channel: &Rc<RefCell<Channel>>, message: WireMessage) -> bool {
        let addr = channel.borrow().addr();
        let datagram = channel.borrow_mut().send(vec![message], Instant::now());
        match datagram {
            Some(bytes) => {
                self.outbox.push_back((addr, bytes));
                true
            }
            None => false,
        }
    }

    fn message<T: Serialize>(
        element: &InterfaceElement,
        reply: ReplyTag,
        args: &T,
    ) -> Result<WireMessage, MercuryError> {
        Ok(WireMessage {
            interface: element.interface,
            method: element.method,
            reply,
            payload: encode_payload(args)?,
        })
    }

    /// Sends a one-way message to `addr` over its channel.
    ///
    /// Never blocks. If the channel has failed the message is dropped; the
    /// failure itself has already been reported through
    /// [`NubHandler::handle_channel_failure`].
    pub fn send<T: Serialize>(
        &mut self,
        addr: Address,
        element: &InterfaceElement,
        args: &T,
    ) -> Result<(), MercuryError> {
        let channel = self.find_or_create_channel(addr);
        self.send_on(&channel, element, args)
    }

    pub(crate) fn send_on<T: Serialize>(
        &mut self,
        channel: &Rc<RefCell<Channel>>,
        element: &InterfaceElement,
        args: &T,
    ) -> Result<(), MercuryError> {
        let message = Self::message(element, ReplyTag::None, args)?;
        if !self.post(channel, message) {
            debug!("{} to {} dropped", element, channel.borrow().addr());
        }
        Ok(())
    }

    /// Sends a request; the outcome arrives at [`NubHandler::handle_reply`]
    /// with `tag`.
    pub fn send_request<T: Serialize>(
        &mut self,
        addr: Address,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
    ) -> Result<ReplyId, MercuryError> {
        let channel = self.find_or_create_channel(addr);
        let timeout = self.config.reply_timeout;
        self.request_on(&channel, element, args, tag, timeout)
    }

    /// Like [`Nub::send_request`] with an explicit reply deadline.
    pub fn send_request_with_timeout<T: Serialize>(
        &mut self,
        addr: Address,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
        timeout: Duration,
    ) -> Result<ReplyId, MercuryError> {
        let channel = self.find_or_create_channel(addr);
        self.request_on(&channel, element, args, tag, timeout)
    }

    pub(crate) fn request_on<T: Serialize>(
        &mut self,
        channel: &Rc<RefCell<Channel>>,
        element: &InterfaceElement,
        args: &T,
        tag: u64,
        timeout: Duration,
    ) -> Result<ReplyId, MercuryError> {
        self.next_reply_id = self.next_reply_id.wrapping_add(1);
        let reply_id = self.next_reply_id;
        let message = Self::message(element, ReplyTag::Request(reply_id), args)?;
        let addr = channel.borrow().addr();

        self.pending_replies.insert(
            reply_id,
            PendingReply {
                addr,
                tag,
                deadline: Instant::now() + timeout,
                element: element.name,
            },
        );

        if !self.post(channel, message) {
            let reason = channel
                .borrow()
                .failure_reason()
                .unwrap_or(FailureReason::Condemned);
            self.events.push_back(NubEvent::RequestFailed {
                reply_id,
                error: MercuryError::TransportFailure { addr, reason },
            });
        }
        Ok(reply_id)
    }

    /// Replies to a request.
    pub fn reply<T: Serialize>(
        &mut self,
        addr: Address,
        reply_id: ReplyId,
        args: &T,
    ) -> Result<(), MercuryError> {
        let payload = encode_payload(args)?;
        self.reply_raw(addr, reply_id, payload);
        Ok(())
    }

    /// Replies with an empty payload.
    pub fn reply_empty(&mut self, addr: Address, reply_id: ReplyId) {
        self.reply_raw(addr, reply_id, Vec::new());
    }

    fn reply_raw(&mut self, addr: Address, reply_id: ReplyId, payload: Vec<u8>) {
        let channel = self.find_or_create_channel(addr);
        let message = WireMessage {
            interface: 0,
            method: 0,
            reply: ReplyTag::Reply(reply_id),
            payload,
        };
        if !self.post(&channel, message) {
            debug!("Reply {} to {} dropped", reply_id, addr);
        }
    }

    /// Sends a single unreliable datagram outside any channel.
    pub fn send_once<T: Serialize>(
        &mut self,
        addr: Address,
        element: &InterfaceElement,
        args: &T,
    ) -> Result<(), MercuryError> {
        let message = Self::message(element, ReplyTag::None, args)?;
        let bytes = Packet {
            seq: None,
            ack: None,
            messages: vec![message],
        }
        .encode();
        self.outbox.push_back((addr, bytes));
        Ok(())
    }

    fn pending_replies_to(&self, addr: Address) -> Vec<ReplyId> {
        let mut ids: Vec<ReplyId> = self
            .pending_replies
            .iter()
            .filter(|(_, pending)| pending.addr == addr)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of requests still waiting for a reply.
    pub fn num_pending_replies(&self) -> usize {
        self.pending_replies.len()
    }

    /// Takes every datagram waiting to be written to the socket.
    pub fn drain_outbox(&mut self) -> Vec<(Address, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Arms a one-shot timer firing after `delay`.
    ///
    /// `arg` is handed back to [`NubHandler::handle_timeout`].
    pub fn register_timer(&mut self, delay: Duration, arg: u64) -> TimerId {
        self.timers.add(Instant::now() + delay, arg)
    }

    /// Cancels a timer, including one whose callback is running.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        if let Some((firing, cancelled)) = self.firing_timer.as_mut() {
            if *firing == id {
                *cancelled = true;
                return true;
            }
        }
        self.timers.cancel(id)
    }

    /// Whether `id` is armed or currently firing.
    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains(id) || matches!(self.firing_timer, Some((firing, false)) if firing == id)
    }

    pub fn num_timers(&self) -> usize {
        self.timers.len()
    }

    // ------------------------------------------------------------------
    // Birth and death
    // ------------------------------------------------------------------

    pub fn register_birth_listener(&mut self, interface: &str, tag: ListenerTag) {
        self.listeners.register(ListenerKind::Birth, interface, tag);
    }

    pub fn register_death_listener(&mut self, interface: &str, tag: ListenerTag) {
        self.listeners.register(ListenerKind::Death, interface, tag);
    }

    pub fn deregister_birth_listener(&mut self, interface: &str, tag: ListenerTag) -> bool {
        self.listeners.deregister(ListenerKind::Birth, interface, tag)
    }

    pub fn deregister_death_listener(&mut self, interface: &str, tag: ListenerTag) -> bool {
        self.listeners.deregister(ListenerKind::Death, interface, tag)
    }

    /// Declares that this process implements `interface` and answers queries for it.
    pub fn advertise(&mut self, interface: &str) {
        self.advertised.insert(interface.to_string());
    }

    fn broadcast<T: Serialize>(&mut self, element: &InterfaceElement, args: &T) -> Result<(), MercuryError> {
        let targets: Vec<Address> = self
            .config
            .announce_addresses
            .iter()
            .copied()
            .filter(|addr| *addr != self.local_addr)
            .collect();
        for addr in targets {
            self.send_once(addr, element, args)?;
        }
        Ok(())
    }

    /// Announces that this process now implements `interface`.
    pub fn announce_birth(&mut self, interface: &str) -> Result<(), MercuryError> {
        self.advertise(interface);
        info!("👶 Announcing birth of {} at {}", interface, self.local_addr);
        let announcement = Announcement {
            name: interface.to_string(),
            addr: self.local_addr,
        };
        self.broadcast(&BIRTH, &announcement)
    }

    /// Announces that this process is going away.
    pub fn announce_death(&mut self, interface: &str) -> Result<(), MercuryError> {
        self.advertised.remove(interface);
        info!("💀 Announcing death of {} at {}", interface, self.local_addr);
        let announcement = Announcement {
            name: interface.to_string(),
            addr: self.local_addr,
        };
        self.broadcast(&DEATH, &announcement)
    }

    /// Asks every announce address who implements `interface`.
    ///
    /// Answers are delivered to the interface's birth listeners.
    pub fn query_interface(&mut self, interface: &str) -> Result<(), MercuryError> {
        debug!("Querying for {}", interface);
        let query = InterfaceQuery {
            name: interface.to_string(),
        };
        self.broadcast(&QUERY_INTERFACE, &query)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Stops the dispatch loop after the current handler returns.
    pub fn break_processing(&mut self) {
        self.stats.break_requests += 1;
        if !self.breaking {
            info!("⏹️ Nub {} breaking out of dispatch loop", self.local_addr);
        }
        self.breaking = true;
    }

    pub fn processing_broken(&self) -> bool {
        self.breaking
    }

    /// Handle for interrupting the loop from another task.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            sender: self.interrupt_tx.clone(),
        }
    }

    /// Processes one received datagram.
    pub fn process_datagram<H: NubHandler>(
        &mut self,
        handler: &mut H,
        table: &InterfaceTable<H>,
        from: Address,
        data: &[u8],
        now: Instant,
    ) {
        self.stats.datagrams_received += 1;

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.note_protocol_error(from, false, &e);
                return;
            }
        };

        if packet.seq.is_none() && packet.ack.is_none() {
            for message in packet.messages {
                self.deliver(handler, table, from, message, false);
            }
        } else {
            let channel = self.find_or_create_channel(from);
            let messages = channel.borrow_mut().receive(packet, now);
            if channel.borrow().needs_restart() {
                let version = self.allocate_version();
                info!("🔄 {} lost our stream, restarting it as version {}", from, version);
                let datagrams = channel.borrow_mut().restart_outgoing(version, now);
                for bytes in datagrams {
                    self.outbox.push_back((from, bytes));
                }
            }
            for message in messages {
                self.deliver(handler, table, from, message, true);
            }
            let ack = channel.borrow_mut().ack_packet();
            if let Some(bytes) = ack {
                self.outbox.push_back((from, bytes));
            }
        }

        self.dispatch_events(handler);
    }

    fn deliver<H: NubHandler>(
        &mut self,
        handler: &mut H,
        table: &InterfaceTable<H>,
        from: Address,
        message: WireMessage,
        on_channel: bool,
    ) {
        let reply_id = match message.reply {
            ReplyTag::Reply(id) => {
                self.complete_reply(handler, from, id, message.payload);
                return;
            }
            ReplyTag::Request(id) => Some(id),
            ReplyTag::None => None,
        };

        let incoming = Incoming {
            source: from,
            interface: message.interface,
            method: message.method,
            reply_id,
            payload: message.payload,
        };

        if incoming.interface == MACHINE_INTERFACE {
            if let Err(e) = self.handle_machine_message(handler, &incoming) {
                self.note_protocol_error(from, on_channel, &e);
            }
            return;
        }

        match table.lookup(incoming.interface, incoming.method) {
            Some((element, handler_fn)) => {
                debug!("Dispatching {} from {}", element, from);
                match handler_fn(handler, self, &incoming) {
                    Ok(()) => {}
                    Err(e @ MercuryError::Protocol(_)) => {
                        self.note_protocol_error(from, on_channel, &e)
                    }
                    Err(e) => warn!("Handler for {} from {} failed: {}", element, from, e),
                }
            }
            None => {
                let e = MercuryError::Protocol(format!(
                    "No handler for message {}.{} in {}",
                    incoming.interface,
                    incoming.method,
                    table.name()
                ));
                self.note_protocol_error(from, on_channel, &e);
            }
        }
    }

    fn complete_reply<H: NubHandler>(
        &mut self,
        handler: &mut H,
        from: Address,
        reply_id: ReplyId,
        payload: Vec<u8>,
    ) {
        let matches = self
            .pending_replies
            .get(&reply_id)
            .map_or(false, |pending| pending.addr == from);
        if !matches {
            debug!("Ignoring unexpected reply {} from {}", reply_id, from);
            return;
        }
        let Some(pending) = self.pending_replies.remove(&reply_id) else {
            return;
        };
        debug!("Reply to {} from {}", pending.element, from);
        let incoming = Incoming {
            source: from,
            interface: 0,
            method: 0,
            reply_id: Some(reply_id),
            payload,
        };
        handler.handle_reply(self, pending.tag, Ok(incoming));
    }

    fn handle_machine_message<H: NubHandler>(
        &mut self,
        handler: &mut H,
        incoming: &Incoming,
    ) -> Result<(), MercuryError> {
        match incoming.method {
            m if m == BIRTH.method || m == QUERY_INTERFACE_REPLY.method => {
                let announcement: Announcement = incoming.args()?;
                debug!("Birth of {} at {}", announcement.name, announcement.addr);
                for tag in self.listeners.listeners(ListenerKind::Birth, &announcement.name) {
                    handler.handle_birth(self, tag, &announcement);
                }
                Ok(())
            }
            m if m == DEATH.method => {
                let announcement: Announcement = incoming.args()?;
                debug!("Death of {} at {}", announcement.name, announcement.addr);
                for tag in self.listeners.listeners(ListenerKind::Death, &announcement.name) {
                    handler.handle_death(self, tag, &announcement);
                }
                Ok(())
            }
            m if m == QUERY_INTERFACE.method => {
                let query: InterfaceQuery = incoming.args()?;
                if self.advertised.contains(&query.name) {
                    let answer = Announcement {
                        name: query.name,
                        addr: self.local_addr,
                    };
                    self.send_once(incoming.source, &QUERY_INTERFACE_REPLY, &answer)?;
                }
                Ok(())
            }
            other => Err(MercuryError::Protocol(format!(
                "Unknown machine message {other}"
            ))),
        }
    }

    /// Fires due timers, resends and reply timeouts.
    pub fn process_timers<H: NubHandler>(&mut self, handler: &mut H, now: Instant) {
        if now >= self.next_channel_tick {
            self.tick_channels(now);
            self.next_channel_tick = now + self.config.tick_interval;
        }

        self.dispatch_events(handler);
        self.expire_replies(handler, now);

        while let Some((id, arg)) = self.timers.pop_expired(now) {
            self.firing_timer = Some((id, false));
            let rearm = handler.handle_timeout(self, id, arg);
            let cancelled = matches!(self.firing_timer.take(), Some((_, true)));
            if let Some(interval) = rearm {
                if !cancelled && !interval.is_zero() {
                    self.timers.rearm(id, now + interval, arg);
                }
            }
        }

        self.dispatch_events(handler);
    }

    fn expire_replies<H: NubHandler>(&mut self, handler: &mut H, now: Instant) {
        let mut expired: Vec<ReplyId> = self
            .pending_replies
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in expired {
            if let Some(pending) = self.pending_replies.remove(&id) {
                warn!("Request {} to {} timed out", pending.element, pending.addr);
                handler.handle_reply(self, pending.tag, Err(MercuryError::Timeout(pending.addr)));
            }
        }
    }

    /// Delivers queued failure notifications.
    pub fn dispatch_events<H: NubHandler>(&mut self, handler: &mut H) {
        while let Some(event) = self.events.pop_front() {
            match event {
                NubEvent::ChannelFailed { addr, reason } => {
                    for id in self.pending_replies_to(addr) {
                        if let Some(pending) = self.pending_replies.remove(&id) {
                            handler.handle_reply(
                                self,
                                pending.tag,
                                Err(MercuryError::TransportFailure { addr, reason }),
                            );
                        }
                    }
                    handler.handle_channel_failure(self, addr, reason);
                }
                NubEvent::RequestFailed { reply_id, error } => {
                    if let Some(pending) = self.pending_replies.remove(&reply_id) {
                        handler.handle_reply(self, pending.tag, Err(error));
                    }
                }
            }
        }
    }

    /// Earliest instant at which the loop has timer work to do.
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_channel_tick;
        if let Some(expiry) = self.timers.next_expiry() {
            deadline = deadline.min(expiry);
        }
        if let Some(reply) = self.pending_replies.values().map(|p| p.deadline).min() {
            deadline = deadline.min(reply);
        }
        deadline
    }

    async fn flush_outbox(&mut self, socket: &UdpSocket) {
        while let Some((addr, bytes)) = self.outbox.pop_front() {
            match socket.send_to(&bytes, addr.to_socket_addr()).await {
                Ok(_) => self.stats.datagrams_sent += 1,
                Err(e) => {
                    warn!("Send to {} failed: {}", addr, e);
                    if e.kind() == std::io::ErrorKind::ConnectionRefused {
                        self.fail_channel(addr, FailureReason::Unreachable);
                    }
                }
            }
        }
    }

    /// Runs the dispatch loop until [`Nub::break_processing`] is called.
    pub async fn run<H: NubHandler>(
        &mut self,
        handler: &mut H,
        table: &InterfaceTable<H>,
    ) -> Result<(), MercuryError> {
        let socket = self.socket.take().ok_or(MercuryError::NotBound)?;
        self.dispatch_loop(&socket, handler, table).await;
        self.socket = Some(socket);
        Ok(())
    }

    async fn dispatch_loop<H: NubHandler>(
        &mut self,
        socket: &UdpSocket,
        handler: &mut H,
        table: &InterfaceTable<H>,
    ) {
        info!("🚀 Nub {} entering dispatch loop ({})", self.local_addr, table.name());
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while !self.breaking {
            self.flush_outbox(socket).await;
            let deadline = self.next_deadline();

            tokio::select! {
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => match Address::try_from(from) {
                        Ok(from) => {
                            self.process_datagram(handler, table, from, &buffer[..len], Instant::now())
                        }
                        Err(e) => warn!("Ignoring datagram: {}", e),
                    },
                    Err(e) => warn!("Socket receive error: {}", e),
                },
                _ = tokio::time::sleep_until(deadline) => {}
                Some(()) = self.interrupt_rx.recv() => {
                    handler.handle_interrupt(self);
                }
            }

            self.process_timers(handler, Instant::now());
        }

        self.flush_outbox(socket).await;
        info!("🛑 Nub {} left dispatch loop", self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_payload;

    const ECHO: InterfaceElement = InterfaceElement::new(5, 0, "echo");
    const NOTE: InterfaceElement = InterfaceElement::new(5, 1, "note");

    #[derive(Default)]
    struct Recorder {
        notes: Vec<String>,
        replies: Vec<(u64, Result<Vec<u8>, MercuryError>)>,
        timeouts: Vec<u64>,
        births: Vec<(ListenerTag, Address)>,
        failures: Vec<(Address, FailureReason)>,
        rearm: Option<Duration>,
        cancel_self: bool,
    }

    impl NubHandler for Recorder {
        fn handle_timeout(&mut self, nub: &mut Nub, id: TimerId, arg: u64) -> Option<Duration> {
            self.timeouts.push(arg);
            if self.cancel_self {
                nub.cancel_timer(id);
            }
            self.rearm
        }

        fn handle_reply(&mut self, _nub: &mut Nub, tag: u64, reply: Result<Incoming, MercuryError>) {
            self.replies.push((tag, reply.map(|m| m.payload)));
        }

        fn handle_birth(&mut self, _nub: &mut Nub, tag: ListenerTag, announcement: &Announcement) {
            self.births.push((tag, announcement.addr));
        }

        fn handle_channel_failure(&mut self, _nub: &mut Nub, addr: Address, reason: FailureReason) {
            self.failures.push((addr, reason));
        }
    }

    fn on_echo(_r: &mut Recorder, nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
        let text: String = msg.args()?;
        if let Some(reply_id) = msg.reply_id {
            nub.reply(msg.source, reply_id, &text.to_uppercase())?;
        }
        Ok(())
    }

    fn on_note(r: &mut Recorder, _nub: &mut Nub, msg: &Incoming) -> Result<(), MercuryError> {
        r.notes.push(msg.args()?);
        Ok(())
    }

    fn table() -> InterfaceTable<Recorder> {
        let mut table = InterfaceTable::new("TestInterface");
        table.register(ECHO, on_echo).register(NOTE, on_note);
        table
    }

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn config(announce: Vec<Address>) -> NubConfig {
        NubConfig {
            announce_addresses: announce,
            ..Default::default()
        }
    }

    /// Moves every queued datagram between two nubs until both are quiet.
    fn pump(
        a: &mut Nub,
        ha: &mut Recorder,
        b: &mut Nub,
        hb: &mut Recorder,
        table: &InterfaceTable<Recorder>,
    ) {
        for _ in 0..16 {
            let from_a = a.drain_outbox();
            let from_b = b.drain_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (to, bytes) in from_a {
                if to == b.local_addr() {
                    b.process_datagram(hb, table, a.local_addr(), &bytes, Instant::now());
                }
            }
            for (to, bytes) in from_b {
                if to == a.local_addr() {
                    a.process_datagram(ha, table, b.local_addr(), &bytes, Instant::now());
                }
            }
        }
    }

    #[test]
    fn test_request_reply_round_trip() {
        let table = table();
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut b = Nub::new(addr(2000), config(vec![]));
        let (mut ha, mut hb) = (Recorder::default(), Recorder::default());

        a.send(b.local_addr(), &NOTE, &"first".to_string()).unwrap();
        a.send_request(b.local_addr(), &ECHO, &"hi".to_string(), 77).unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);

        assert_eq!(hb.notes, vec!["first".to_string()]);
        assert_eq!(ha.replies.len(), 1);
        let (tag, payload) = &ha.replies[0];
        assert_eq!(*tag, 77);
        let text: String = decode_payload(payload.as_ref().unwrap()).unwrap();
        assert_eq!(text, "HI");
        assert_eq!(a.num_pending_replies(), 0);

        // Both sides acknowledged everything
        assert_eq!(a.channel(b.local_addr()).unwrap().num_unacked(), 0);
        assert_eq!(b.channel(a.local_addr()).unwrap().num_unacked(), 0);
    }

    #[test]
    fn test_lost_packet_is_resent_in_order() {
        let table = table();
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut b = Nub::new(addr(2000), config(vec![]));
        let (mut ha, mut hb) = (Recorder::default(), Recorder::default());

        a.send(b.local_addr(), &NOTE, &"one".to_string()).unwrap();
        let lost = a.drain_outbox();
        assert_eq!(lost.len(), 1);
        a.send(b.local_addr(), &NOTE, &"two".to_string()).unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert!(hb.notes.is_empty());

        let later = Instant::now() + Duration::from_secs(1);
        a.process_timers(&mut ha, later);
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert_eq!(hb.notes, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_channel_failure_reported_once_and_fails_requests() {
        let nub_config = NubConfig {
            resend: ResendPolicy {
                max_resends: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut a = Nub::new(addr(1000), nub_config);
        let mut ha = Recorder::default();
        let dead = addr(3000);

        a.send_request(dead, &ECHO, &"anyone?".to_string(), 5).unwrap();
        let mut now = Instant::now();
        for _ in 0..5 {
            now += Duration::from_secs(2);
            a.process_timers(&mut ha, now);
            a.drain_outbox();
        }

        assert_eq!(ha.failures, vec![(dead, FailureReason::NoAck)]);
        assert_eq!(ha.replies.len(), 1);
        assert!(matches!(
            ha.replies[0],
            (5, Err(MercuryError::TransportFailure { .. }))
        ));

        // Unowned failed channel is evicted; a later send starts afresh
        assert!(!a.has_channel(dead));
    }

    #[test]
    fn test_request_on_failed_channel_fails_asynchronously() {
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut ha = Recorder::default();
        let peer = addr(4000);

        let owner = crate::ChannelOwner::new(&mut a, peer);
        a.fail_channel(peer, FailureReason::Unreachable);
        a.fail_channel(peer, FailureReason::NoAck);

        owner.send_request(&mut a, &ECHO, &"x".to_string(), 9).unwrap();
        assert!(ha.replies.is_empty());
        assert!(a.drain_outbox().is_empty());

        a.dispatch_events(&mut ha);
        assert_eq!(ha.failures, vec![(peer, FailureReason::Unreachable)]);
        assert_eq!(ha.replies.len(), 1);
        assert!(owner.has_remote_failed());
    }

    #[test]
    fn test_reply_timeout() {
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut ha = Recorder::default();
        a.send_request_with_timeout(addr(2000), &ECHO, &"x".to_string(), 3, Duration::from_millis(10))
            .unwrap();

        a.process_timers(&mut ha, Instant::now() + Duration::from_millis(20));
        assert!(matches!(ha.replies[0], (3, Err(MercuryError::Timeout(_)))));
    }

    #[test]
    fn test_timers_rearm_and_cancel() {
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut ha = Recorder {
            rearm: Some(Duration::from_millis(10)),
            ..Default::default()
        };

        let id = a.register_timer(Duration::from_millis(5), 42);
        let start = Instant::now();
        a.process_timers(&mut ha, start + Duration::from_millis(5));
        assert_eq!(ha.timeouts, vec![42]);
        assert_eq!(a.num_timers(), 1);

        assert!(a.cancel_timer(id));
        a.process_timers(&mut ha, start + Duration::from_secs(1));
        assert_eq!(ha.timeouts, vec![42]);

        // A handler cancelling its own timer wins over the re-arm value
        ha.cancel_self = true;
        a.register_timer(Duration::ZERO, 1);
        a.process_timers(&mut ha, Instant::now());
        assert_eq!(a.num_timers(), 0);
    }

    #[test]
    fn test_birth_and_query_reach_listeners_in_order() {
        let table = table();
        let a_addr = addr(1000);
        let b_addr = addr(2000);
        let mut a = Nub::new(a_addr, config(vec![a_addr, b_addr]));
        let mut b = Nub::new(b_addr, config(vec![a_addr, b_addr]));
        let (mut ha, mut hb) = (Recorder::default(), Recorder::default());

        a.register_birth_listener("DBMgrInterface", 2);
        a.register_birth_listener("DBMgrInterface", 1);

        b.announce_birth("DBMgrInterface").unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert_eq!(ha.births, vec![(2, b_addr), (1, b_addr)]);

        ha.births.clear();
        a.deregister_birth_listener("DBMgrInterface", 2);
        a.query_interface("DBMgrInterface").unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert_eq!(ha.births, vec![(1, b_addr)]);

        // Channel-less traffic creates no channels
        assert_eq!(a.num_channels(), 0);
        assert_eq!(b.num_channels(), 0);
    }

    #[test]
    fn test_protocol_errors_condemn_channel_after_threshold() {
        let table = table();
        let mut a = Nub::new(
            addr(1000),
            NubConfig {
                max_protocol_errors: 2,
                ..Default::default()
            },
        );
        let mut b = Nub::new(addr(2000), config(vec![]));
        let (mut ha, mut hb) = (Recorder::default(), Recorder::default());
        const BOGUS: InterfaceElement = InterfaceElement::new(9, 9, "bogus");

        b.send(a.local_addr(), &BOGUS, &1u8).unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert!(ha.failures.is_empty());

        b.send(a.local_addr(), &BOGUS, &1u8).unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert_eq!(ha.failures, vec![(b.local_addr(), FailureReason::ProtocolViolation)]);

        // Garbage datagrams are dropped without a channel
        a.process_datagram(&mut ha, &table, addr(5000), &[0xff, 1, 2], Instant::now());
        assert!(!a.has_channel(addr(5000)));
        assert_eq!(a.stats().protocol_errors, 3);
    }

    #[test]
    fn test_break_processing_is_idempotent() {
        let mut a = Nub::new(addr(1000), config(vec![]));
        assert!(!a.processing_broken());
        a.break_processing();
        a.break_processing();
        assert!(a.processing_broken());
        assert_eq!(a.stats().break_requests, 2);
    }

    #[test]
    fn test_restarted_peer_receives_from_survivor() {
        let table = table();
        let mut a = Nub::new(addr(1000), config(vec![]));
        let mut b = Nub::new(addr(2000), config(vec![]));
        let (mut ha, mut hb) = (Recorder::default(), Recorder::default());
        for i in 0..3 {
            a.send(b.local_addr(), &NOTE, &format!("a{i}")).unwrap();
            b.send(a.local_addr(), &NOTE, &format!("b{i}")).unwrap();
        }
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        assert_eq!(hb.notes, vec!["a0", "a1", "a2"]);

        // b comes back on the same address with no memory of a
        let mut b = Nub::new(addr(2000), config(vec![]));
        let mut hb = Recorder::default();
        b.send(a.local_addr(), &NOTE, &"b again".to_string()).unwrap();
        a.send(b.local_addr(), &NOTE, &"a again".to_string()).unwrap();
        pump(&mut a, &mut ha, &mut b, &mut hb, &table);

        let start = Instant::now();
        for step in 1..=30 {
            let now = start + Duration::from_millis(200 * step);
            a.process_timers(&mut ha, now);
            b.process_timers(&mut hb, now);
            pump(&mut a, &mut ha, &mut b, &mut hb, &table);
        }

        assert_eq!(ha.notes, vec!["b0", "b1", "b2", "b again"]);
        assert_eq!(hb.notes, vec!["a again"]);
        assert!(ha.failures.is_empty());
        let channel = a.channel(b.local_addr()).unwrap();
        assert!(!channel.has_remote_failed());
        assert_eq!(channel.num_unacked(), 0);
    }

    #[test]
    fn test_oversized_message_is_an_error_not_a_dead_peer() {
        let mut a = Nub::new(addr(1000), config(vec![]));
        let huge = vec![7u8; MAX_DATAGRAM_SIZE];

        let result = a.send(addr(2000), &NOTE, &huge);
        assert!(matches!(result, Err(MercuryError::PayloadTooLarge { .. })));
        let result = a.send_request(addr(2000), &ECHO, &huge, 1);
        assert!(matches!(result, Err(MercuryError::PayloadTooLarge { .. })));
        assert_eq!(a.num_pending_replies(), 0);

        assert!(a.drain_outbox().is_empty());
        assert!(!a.channel(addr(2000)).unwrap().has_remote_failed());
    }
}
