//! # Channels
//!
//! A [`Channel`] is the reliable, ordered stream between this process and one
//! remote [`Address`]. Outgoing reliable packets are numbered and kept until
//! acknowledged; incoming packets are reordered through a [`SequenceBuffer`]
//! before their messages are handed to the Nub.
//!
//! Liveness is a one-way flag: once a channel has failed it stays failed until
//! [`Channel::reset`] is called on it.
//!
//! When the peer loses its receive state for our stream (it restarted, or
//! reset its end) the channel flags [`Channel::needs_restart`] and the Nub
//! renumbers everything not yet delivered under a fresh version with
//! [`Channel::restart_outgoing`].

use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::FailureReason;
use crate::wire::{seq_after, AckInfo, Packet, SeqNum, Sequenced, WireMessage};

/// Retransmission cadence of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Server-to-server traffic, resent on the regular period.
    Regular,
    /// Infrequent traffic (anonymous clients), resent on the slower period.
    Irregular,
}

/// Resend and buffering limits shared by all channels of a Nub.
#[derive(Debug, Clone, PartialEq)]
pub struct ResendPolicy {
    /// Age after which an unacked packet on a regular channel is resent
    pub resend_period: Duration,
    /// Age after which an unacked packet on an irregular channel is resent
    pub irregular_resend_period: Duration,
    /// Number of resends after which the remote is declared dead
    pub max_resends: u32,
    /// Maximum number of out-of-order packets kept per channel
    pub max_reorder_window: usize,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            resend_period: Duration::from_millis(200),
            irregular_resend_period: Duration::from_millis(1000),
            max_resends: 10,
            max_reorder_window: 256,
        }
    }
}

/// Counters kept per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub duplicates_received: u64,
    pub dropped_sends: u64,
}

/// Reliable packet waiting for its acknowledgement.
#[derive(Debug, Clone)]
struct UnackedPacket {
    messages: Vec<WireMessage>,
    last_sent: Instant,
    resends: u32,
    /// Received out of order; kept until the gap below it closes
    sacked: bool,
}

/// Reorders incoming reliable packets.
#[derive(Debug)]
pub struct SequenceBuffer {
    /// Expected next sequence number
    next_expected: SeqNum,
    /// Out-of-order packets waiting for the gap to close
    buffer: BTreeMap<SeqNum, Vec<WireMessage>>,
    /// Maximum buffer size
    max_buffer_size: usize,
}

impl SequenceBuffer {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            next_expected: 0,
            buffer: BTreeMap::new(),
            max_buffer_size,
        }
    }

    /// Processes a packet and returns the messages now ready for delivery.
    ///
    /// The second value is `true` when the packet had already been seen.
    pub fn process_packet(
        &mut self,
        sequence: SeqNum,
        messages: Vec<WireMessage>,
    ) -> (Vec<WireMessage>, bool) {
        let mut deliverable = Vec::new();

        if sequence == self.next_expected {
            deliverable.extend(messages);
            self.next_expected = self.next_expected.wrapping_add(1);

            while let Some(buffered) = self.buffer.remove(&self.next_expected) {
                deliverable.extend(buffered);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
            (deliverable, false)
        } else if seq_after(sequence, self.next_expected) {
            if self.buffer.contains_key(&sequence) {
                return (deliverable, true);
            }
            if self.buffer.len() < self.max_buffer_size {
                self.buffer.insert(sequence, messages);
            } else {
                warn!("Sequence buffer full, dropping packet {}", sequence);
            }
            (deliverable, false)
        } else {
            (deliverable, true)
        }
    }

    /// Acknowledgement describing what has been received so far.
    pub fn ack_info(&self, version: u32) -> AckInfo {
        let mut bits = 0u32;
        for offset in 1..=32u32 {
            if self.buffer.contains_key(&self.next_expected.wrapping_add(offset)) {
                bits |= 1 << (offset - 1);
            }
        }
        AckInfo {
            version,
            ack: self.next_expected,
            bits,
        }
    }
}

/// Reliable, ordered message stream to one remote address.
#[derive(Debug)]
pub struct Channel {
    addr: Address,
    kind: ChannelKind,
    version: u32,
    next_seq: SeqNum,
    unacked: BTreeMap<SeqNum, UnackedPacket>,
    /// Highest cumulative ack the peer has sent for `version`
    acked_base: SeqNum,
    /// The peer no longer knows our stream
    restart_pending: bool,
    /// Version of the remote stream we are receiving, once known
    remote_version: Option<u32>,
    /// Previous remote version, whose stragglers are ignored
    retired_remote_version: Option<u32>,
    incoming: SequenceBuffer,
    max_reorder_window: usize,
    ack_pending: bool,
    has_remote_failed: bool,
    failure_reason: Option<FailureReason>,
    protocol_errors: u32,
    last_received: Option<Instant>,
    stats: ChannelStats,
}

impl Channel {
    /// Creates a channel to `addr`.
    ///
    /// `version` must differ from any version previously used by this process
    /// for the same address so the peer can tell the streams apart.
    pub fn new(addr: Address, kind: ChannelKind, version: u32, max_reorder_window: usize) -> Self {
        Self {
            addr,
            kind,
            version,
            next_seq: 0,
            unacked: BTreeMap::new(),
            acked_base: 0,
            restart_pending: false,
            remote_version: None,
            retired_remote_version: None,
            incoming: SequenceBuffer::new(max_reorder_window),
            max_reorder_window,
            ack_pending: false,
            has_remote_failed: false,
            failure_reason: None,
            protocol_errors: 0,
            last_received: None,
            stats: ChannelStats::default(),
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: ChannelKind) {
        self.kind = kind;
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the remote end has been declared dead.
    pub fn has_remote_failed(&self) -> bool {
        self.has_remote_failed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    /// Number of reliable packets still waiting for an acknowledgement.
    pub fn num_unacked(&self) -> usize {
        self.unacked.values().filter(|p| !p.sacked).count()
    }

    /// Whether the outgoing stream must be restarted under a new version.
    pub fn needs_restart(&self) -> bool {
        self.restart_pending
    }

    /// Whether a received reliable packet still needs acknowledging.
    pub fn needs_ack(&self) -> bool {
        self.ack_pending
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Clears all state and gives the channel a fresh stream version.
    ///
    /// This is the only way a failed channel becomes usable again.
    pub fn reset(&mut self, version: u32) {
        debug!("Resetting channel to {} (version {})", self.addr, version);
        *self = Channel::new(self.addr, self.kind, version, self.max_reorder_window);
    }

    /// Marks the remote as dead.
    ///
    /// Returns `true` only on the alive to failed transition.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if self.has_remote_failed {
            return false;
        }
        warn!("Channel to {} failed: {}", self.addr, reason);
        self.has_remote_failed = true;
        self.failure_reason = Some(reason);
        self.unacked.clear();
        true
    }

    /// Records a protocol error and returns the running count.
    pub fn note_protocol_error(&mut self) -> u32 {
        self.protocol_errors += 1;
        self.protocol_errors
    }

    fn take_ack(&mut self) -> Option<AckInfo> {
        let version = self.remote_version?;
        self.ack_pending = false;
        Some(self.incoming.ack_info(version))
    }

    /// Queues messages as one reliable packet and returns the datagram.
    ///
    /// A failed channel drops the messages and returns `None`.
    pub fn send(&mut self, messages: Vec<WireMessage>, now: Instant) -> Option<Vec<u8>> {
        if self.has_remote_failed {
            self.stats.dropped_sends += messages.len() as u64;
            warn!(
                "Dropping {} message(s) to {}: remote has failed",
                messages.len(),
                self.addr
            );
            return None;
        }
        Some(self.queue(messages, now))
    }

    fn queue(&mut self, messages: Vec<WireMessage>, now: Instant) -> Vec<u8> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let packet = Packet {
            seq: Some(Sequenced {
                version: self.version,
                seq,
            }),
            ack: self.take_ack(),
            messages,
        };
        let bytes = packet.encode();

        self.unacked.insert(
            seq,
            UnackedPacket {
                messages: packet.messages,
                last_sent: now,
                resends: 0,
                sacked: false,
            },
        );
        self.stats.packets_sent += 1;
        bytes
    }

    /// Restarts the outgoing stream as `version`.
    ///
    /// Every packet the peer has not acknowledged cumulatively is renumbered
    /// from zero, in its original order, and returned ready to send.
    pub fn restart_outgoing(&mut self, version: u32, now: Instant) -> Vec<Vec<u8>> {
        self.restart_pending = false;
        if self.has_remote_failed {
            return Vec::new();
        }

        let base = self.acked_base;
        let mut pending: Vec<(SeqNum, UnackedPacket)> =
            std::mem::take(&mut self.unacked).into_iter().collect();
        pending.sort_by_key(|(seq, _)| seq.wrapping_sub(base));
        debug!(
            "Restarting stream to {} as version {} with {} packet(s)",
            self.addr,
            version,
            pending.len()
        );

        self.version = version;
        self.next_seq = 0;
        self.acked_base = 0;
        pending
            .into_iter()
            .map(|(_, packet)| self.queue(packet.messages, now))
            .collect()
    }

    /// Datagram carrying only an acknowledgement, if one is owed.
    pub fn ack_packet(&mut self) -> Option<Vec<u8>> {
        if !self.ack_pending {
            return None;
        }
        let ack = self.take_ack()?;
        Some(
            Packet {
                seq: None,
                ack: Some(ack),
                messages: Vec::new(),
            }
            .encode(),
        )
    }

    /// Applies an incoming packet and returns the messages to deliver in order.
    pub fn receive(&mut self, packet: Packet, now: Instant) -> Vec<WireMessage> {
        if self.has_remote_failed {
            debug!("Ignoring packet from failed channel {}", self.addr);
            return Vec::new();
        }

        self.last_received = Some(now);
        self.stats.packets_received += 1;

        let acks_current = packet.ack.map_or(false, |ack| ack.version == self.version);
        if let Some(ack) = packet.ack {
            self.process_ack(ack);
        }

        let Some(header) = packet.seq else {
            return packet.messages;
        };

        if self.remote_version != Some(header.version) {
            if self.retired_remote_version == Some(header.version) {
                debug!("Ignoring straggler from retired stream of {}", self.addr);
                return Vec::new();
            }
            if let Some(old) = self.remote_version {
                debug!(
                    "Remote {} started stream version {} (was {})",
                    self.addr, header.version, old
                );
                // A fresh remote stream that knows nothing of ours
                if !acks_current && self.next_seq != 0 {
                    self.restart_pending = true;
                }
            }
            self.retired_remote_version = self.remote_version;
            self.remote_version = Some(header.version);
            self.incoming = SequenceBuffer::new(self.max_reorder_window);
        }

        self.ack_pending = true;
        let (delivered, duplicate) = self.incoming.process_packet(header.seq, packet.messages);
        if duplicate {
            self.stats.duplicates_received += 1;
        }
        delivered
    }

    fn process_ack(&mut self, ack: AckInfo) {
        if ack.version != self.version {
            return;
        }
        if ack.ack == 0 && seq_after(self.acked_base, 0) {
            debug!("{} expects our stream from the start again", self.addr);
            self.restart_pending = true;
            return;
        }
        if seq_after(ack.ack, self.acked_base) {
            self.acked_base = ack.ack;
        }
        self.unacked.retain(|seq, _| !ack.covers_cumulatively(*seq));
        for (seq, pending) in self.unacked.iter_mut() {
            if ack.covers_selectively(*seq) {
                pending.sacked = true;
            }
        }
    }

    /// Resends every packet older than the resend period.
    ///
    /// Fails the channel and returns the reason once a packet exceeds the
    /// resend limit.
    pub fn resend_due(
        &mut self,
        now: Instant,
        policy: &ResendPolicy,
    ) -> Result<Vec<Vec<u8>>, FailureReason> {
        if self.has_remote_failed || self.unacked.is_empty() {
            return Ok(Vec::new());
        }

        let period = match self.kind {
            ChannelKind::Regular => policy.resend_period,
            ChannelKind::Irregular => policy.irregular_resend_period,
        };

        let exhausted = self.unacked.values().any(|p| {
            !p.sacked
                && now.saturating_duration_since(p.last_sent) >= period
                && p.resends >= policy.max_resends
        });
        if exhausted {
            self.fail(FailureReason::NoAck);
            return Err(FailureReason::NoAck);
        }

        let ack = self.take_ack();
        let version = self.version;
        let mut datagrams = Vec::new();
        for (seq, pending) in self.unacked.iter_mut() {
            if pending.sacked || now.saturating_duration_since(pending.last_sent) < period {
                continue;
            }
            pending.resends += 1;
            pending.last_sent = now;
            debug!("Resending packet {} to {} (attempt {})", seq, self.addr, pending.resends);
            datagrams.push(
                Packet {
                    seq: Some(Sequenced { version, seq: *seq }),
                    ack,
                    messages: pending.messages.clone(),
                }
                .encode(),
            );
        }
        self.stats.packets_resent += datagrams.len() as u64;
        Ok(datagrams)
    }
}
