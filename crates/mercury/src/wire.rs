//! # Wire Format
//!
//! A datagram carries an optional sequence number (reliable packets), an
//! optional piggy-backed acknowledgement and a list of messages:
//!
//! ```text
//! datagram := flags:u8 [version:u32 seq:u32] [version:u32 ack:u32 ack_bits:u32]
//!             count:u16 message*
//! message  := interface:u8 method:u8 mflags:u8 [reply_id:u32] len:u32 payload
//! ```
//!
//! `version` identifies one incarnation of the sending channel; a receiver
//! seeing a new version starts a fresh incoming sequence space. All integers
//! are little-endian. Payloads are opaque here; message handlers
//! encode them with [`encode_payload`] and decode them with [`decode_payload`].

use serde::{de::DeserializeOwned, Serialize};

use crate::error::MercuryError;

/// Identifies an interface (a process role) on the wire.
pub type InterfaceId = u8;
/// Identifies a method within an interface.
pub type MethodId = u8;
/// Correlates a reply with the request that asked for it.
pub type ReplyId = u32;
/// Channel sequence number.
pub type SeqNum = u32;

/// Largest datagram the Nub will read or write.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Packet header with both the sequence and the ack block.
const PACKET_OVERHEAD: usize = 1 + 8 + 12 + 2;
/// Message header with a reply id.
const MESSAGE_OVERHEAD: usize = 3 + 4 + 4;

/// Largest payload that still fits in a single datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - PACKET_OVERHEAD - MESSAGE_OVERHEAD;

const FLAG_RELIABLE: u8 = 0x01;
const FLAG_HAS_ACK: u8 = 0x02;

const MSG_HAS_REPLY_ID: u8 = 0x01;
const MSG_IS_REPLY: u8 = 0x02;

/// Sequence header of a reliable packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequenced {
    pub version: u32,
    pub seq: SeqNum,
}

/// Acknowledgement block.
///
/// `ack` is the next sequence number the receiver expects from the stream
/// `version`, so everything below it has arrived. Bit `i` of `bits` marks
/// `ack + 1 + i` as received out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub version: u32,
    pub ack: SeqNum,
    pub bits: u32,
}

impl AckInfo {
    /// Whether this block acknowledges `seq`.
    pub fn covers(&self, seq: SeqNum) -> bool {
        self.covers_cumulatively(seq) || self.covers_selectively(seq)
    }

    /// Whether `seq` lies below the cumulative ack.
    pub fn covers_cumulatively(&self, seq: SeqNum) -> bool {
        seq_after(self.ack, seq)
    }

    /// Whether `seq` was received out of order.
    pub fn covers_selectively(&self, seq: SeqNum) -> bool {
        let offset = seq.wrapping_sub(self.ack);
        (1..=32).contains(&offset) && self.bits & (1 << (offset - 1)) != 0
    }
}

/// Whether `a` comes after `b` in a sequence space that wraps around.
pub fn seq_after(a: SeqNum, b: SeqNum) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Request/reply marking of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTag {
    /// One-way message.
    None,
    /// Request expecting a reply with this id.
    Request(ReplyId),
    /// Reply to the request with this id.
    Reply(ReplyId),
}

/// A single message inside a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub interface: InterfaceId,
    pub method: MethodId,
    pub reply: ReplyTag,
    pub payload: Vec<u8>,
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Present on reliable packets only.
    pub seq: Option<Sequenced>,
    pub ack: Option<AckInfo>,
    pub messages: Vec<WireMessage>,
}

impl Packet {
    /// Whether the packet carries nothing but an acknowledgement.
    pub fn is_ack_only(&self) -> bool {
        self.seq.is_none() && self.messages.is_empty() && self.ack.is_some()
    }

    /// Encodes the packet into datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len: usize = self.messages.iter().map(|m| m.payload.len() + 11).sum();
        let mut buffer = Vec::with_capacity(23 + payload_len);

        let mut flags = 0u8;
        if self.seq.is_some() {
            flags |= FLAG_RELIABLE;
        }
        if self.ack.is_some() {
            flags |= FLAG_HAS_ACK;
        }
        buffer.push(flags);

        if let Some(seq) = self.seq {
            buffer.extend_from_slice(&seq.version.to_le_bytes());
            buffer.extend_from_slice(&seq.seq.to_le_bytes());
        }
        if let Some(ack) = self.ack {
            buffer.extend_from_slice(&ack.version.to_le_bytes());
            buffer.extend_from_slice(&ack.ack.to_le_bytes());
            buffer.extend_from_slice(&ack.bits.to_le_bytes());
        }

        buffer.extend_from_slice(&(self.messages.len() as u16).to_le_bytes());
        for message in &self.messages {
            buffer.push(message.interface);
            buffer.push(message.method);
            match message.reply {
                ReplyTag::None => buffer.push(0),
                ReplyTag::Request(id) => {
                    buffer.push(MSG_HAS_REPLY_ID);
                    buffer.extend_from_slice(&id.to_le_bytes());
                }
                ReplyTag::Reply(id) => {
                    buffer.push(MSG_HAS_REPLY_ID | MSG_IS_REPLY);
                    buffer.extend_from_slice(&id.to_le_bytes());
                }
            }
            buffer.extend_from_slice(&(message.payload.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&message.payload);
        }

        buffer
    }

    /// Decodes datagram bytes.
    ///
    /// Truncated input, trailing garbage and unknown flag bits are all
    /// protocol errors.
    pub fn decode(data: &[u8]) -> Result<Self, MercuryError> {
        let mut reader = Reader::new(data);

        let flags = reader.u8()?;
        if flags & !(FLAG_RELIABLE | FLAG_HAS_ACK) != 0 {
            return Err(MercuryError::Protocol(format!("Unknown packet flags {flags:#04x}")));
        }

        let seq = if flags & FLAG_RELIABLE != 0 {
            Some(Sequenced {
                version: reader.u32()?,
                seq: reader.u32()?,
            })
        } else {
            None
        };
        let ack = if flags & FLAG_HAS_ACK != 0 {
            Some(AckInfo {
                version: reader.u32()?,
                ack: reader.u32()?,
                bits: reader.u32()?,
            })
        } else {
            None
        };

        let count = reader.u16()?;
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let interface = reader.u8()?;
            let method = reader.u8()?;
            let mflags = reader.u8()?;
            let reply = match (mflags & MSG_HAS_REPLY_ID != 0, mflags & MSG_IS_REPLY != 0) {
                (false, false) => ReplyTag::None,
                (true, false) => ReplyTag::Request(reader.u32()?),
                (true, true) => ReplyTag::Reply(reader.u32()?),
                (false, true) => {
                    return Err(MercuryError::Protocol("Reply flag without reply id".to_string()))
                }
            };
            let len = reader.u32()? as usize;
            let payload = reader.bytes(len)?.to_vec();
            messages.push(WireMessage {
                interface,
                method,
                reply,
                payload,
            });
        }

        if !reader.is_empty() {
            return Err(MercuryError::Protocol(format!(
                "{} trailing bytes after last message",
                reader.remaining()
            )));
        }

        Ok(Self { seq, ack, messages })
    }
}

/// Encodes a message payload.
///
/// Fails with [`MercuryError::PayloadTooLarge`] when the result would not fit
/// in one datagram.
pub fn encode_payload<T: Serialize>(args: &T) -> Result<Vec<u8>, MercuryError> {
    let payload = bincode::serialize(args).map_err(|e| MercuryError::Serialization(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(MercuryError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(payload)
}

/// Decodes a message payload.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, MercuryError> {
    bincode::deserialize(data).map_err(|e| MercuryError::Protocol(format!("Bad payload: {e}")))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], MercuryError> {
        if self.remaining() < len {
            return Err(MercuryError::Protocol(format!(
                "Datagram truncated: wanted {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MercuryError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MercuryError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MercuryError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
