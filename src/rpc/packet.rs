//! Packet codec — one protocol message per transport delivery.
//!
//! Wire format: protobuf-compatible tagged fields.
//!
//! ```text
//! ┌───────┬──────────────┬───────────┬─────────────────────────────┐
//! │ Field │ Name         │ Wire type │ Notes                       │
//! ├───────┼──────────────┼───────────┼─────────────────────────────┤
//! │ 1     │ type         │ varint    │ required                    │
//! │ 2     │ channel_id   │ varint    │                             │
//! │ 3     │ service_id   │ fixed32   │                             │
//! │ 4     │ method_id    │ fixed32   │                             │
//! │ 5     │ payload      │ bytes     │ omitted when empty          │
//! │ 6     │ status       │ varint    │ terminal packets only       │
//! │ 7     │ call_id      │ varint    │                             │
//! └───────┴──────────────┴───────────┴─────────────────────────────┘
//! ```
//!
//! Unknown fields are skipped on decode. The decoded payload borrows the
//! input buffer; nothing is copied.

use heapless::Vec;

use crate::error::{Error, Result, Status};

use super::call::CallKey;

/// Size of the stack buffer every outbound packet is encoded into.
pub const PACKET_BUFFER_SIZE: usize = 512;

/// Worst-case size of all non-payload fields.
pub const MAX_HEADER_LEN: usize = 40;

/// Largest payload that always fits in [`PACKET_BUFFER_SIZE`].
pub const MAX_PAYLOAD_LEN: usize = PACKET_BUFFER_SIZE - MAX_HEADER_LEN;

/// Owned, fixed-capacity encoded packet.
pub type PacketBuffer = Vec<u8, PACKET_BUFFER_SIZE>;

const FIELD_TYPE: u32 = 1;
const FIELD_CHANNEL_ID: u32 = 2;
const FIELD_SERVICE_ID: u32 = 3;
const FIELD_METHOD_ID: u32 = 4;
const FIELD_PAYLOAD: u32 = 5;
const FIELD_STATUS: u32 = 6;
const FIELD_CALL_ID: u32 = 7;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Longest legal varint encoding (64-bit value).
const MAX_VARINT_LEN: usize = 10;

// ── Packet type ──────────────────────────────────────────────

/// Message tag. Client-to-server tags are even, server-to-client odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    ClientStream = 2,
    ServerStreamEnd = 3,
    ClientError = 4,
    ServerError = 5,
    Cancel = 6,
    ClientStreamEnd = 8,
}

impl PacketType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::ClientStream),
            3 => Some(Self::ServerStreamEnd),
            4 => Some(Self::ClientError),
            5 => Some(Self::ServerError),
            6 => Some(Self::Cancel),
            8 => Some(Self::ClientStreamEnd),
            _ => None,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    /// True for packets a client sends and a server consumes.
    pub const fn is_client_to_server(self) -> bool {
        (self as u8) % 2 == 0
    }
}

// ── Packet ───────────────────────────────────────────────────

/// A single decoded (or to-be-encoded) protocol message.
///
/// Packets are built fresh for every transmission and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub packet_type: PacketType,
    pub channel_id: u32,
    pub service_id: u32,
    pub method_id: u32,
    pub call_id: u32,
    pub payload: &'a [u8],
    pub status: Option<Status>,
}

impl<'a> Packet<'a> {
    pub fn new(
        packet_type: PacketType,
        key: CallKey,
        payload: &'a [u8],
        status: Option<Status>,
    ) -> Self {
        Self {
            packet_type,
            channel_id: key.channel_id,
            service_id: key.service_id,
            method_id: key.method_id,
            call_id: key.call_id,
            payload,
            status,
        }
    }

    pub fn key(&self) -> CallKey {
        CallKey {
            channel_id: self.channel_id,
            service_id: self.service_id,
            method_id: self.method_id,
            call_id: self.call_id,
        }
    }

    /// Status carried by the packet, `Unknown` if the peer left it out.
    pub fn status_or_unknown(&self) -> Status {
        self.status.unwrap_or(Status::Unknown)
    }

    /// Decode with the default payload ceiling.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        Self::decode_with_limit(bytes, MAX_PAYLOAD_LEN)
    }

    /// Decode, rejecting payloads longer than `max_payload_len`.
    pub fn decode_with_limit(bytes: &'a [u8], max_payload_len: usize) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let mut packet_type = None;
        let mut packet = Self {
            packet_type: PacketType::Request,
            channel_id: 0,
            service_id: 0,
            method_id: 0,
            call_id: 0,
            payload: &[],
            status: None,
        };

        while !reader.is_empty() {
            let key = reader.varint_u32()?;
            let field = key >> 3;
            let wire = (key & 0x7) as u8;

            match (field, wire) {
                (FIELD_TYPE, WIRE_VARINT) => {
                    let code = reader.varint_u32()?;
                    packet_type = Some(PacketType::from_code(code).ok_or(Error::MalformedPacket)?);
                }
                (FIELD_CHANNEL_ID, WIRE_VARINT) => packet.channel_id = reader.varint_u32()?,
                (FIELD_SERVICE_ID, WIRE_FIXED32) => packet.service_id = reader.fixed32()?,
                (FIELD_METHOD_ID, WIRE_FIXED32) => packet.method_id = reader.fixed32()?,
                (FIELD_PAYLOAD, WIRE_LEN) => {
                    let payload = reader.length_delimited()?;
                    if payload.len() > max_payload_len {
                        return Err(Error::MalformedPacket);
                    }
                    packet.payload = payload;
                }
                (FIELD_STATUS, WIRE_VARINT) => {
                    packet.status = Some(Status::from_code(reader.varint_u32()?));
                }
                (FIELD_CALL_ID, WIRE_VARINT) => packet.call_id = reader.varint_u32()?,
                (FIELD_TYPE..=FIELD_CALL_ID, _) => return Err(Error::MalformedPacket),
                (_, _) => reader.skip(wire)?,
            }
        }

        packet.packet_type = packet_type.ok_or(Error::MalformedPacket)?;
        Ok(packet)
    }

    /// Exact number of bytes [`encode`](Self::encode) will write.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + varint_len(self.packet_type.code())
            + 1
            + varint_len(self.channel_id)
            + (1 + 4) * 2
            + 1
            + varint_len(self.call_id);
        if !self.payload.is_empty() {
            len += 1 + varint_len(self.payload.len() as u32) + self.payload.len();
        }
        if let Some(status) = self.status {
            len += 1 + varint_len(status.code());
        }
        len
    }

    /// Encode into `out`, returning the number of bytes written.
    ///
    /// Fails with [`Error::ResourceExhausted`] if `out` is too small.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(out);
        w.field_varint(FIELD_TYPE, self.packet_type.code())?;
        w.field_varint(FIELD_CHANNEL_ID, self.channel_id)?;
        w.field_fixed32(FIELD_SERVICE_ID, self.service_id)?;
        w.field_fixed32(FIELD_METHOD_ID, self.method_id)?;
        if !self.payload.is_empty() {
            w.key(FIELD_PAYLOAD, WIRE_LEN)?;
            w.varint(self.payload.len() as u32)?;
            w.put(self.payload)?;
        }
        if let Some(status) = self.status {
            w.field_varint(FIELD_STATUS, status.code())?;
        }
        w.field_varint(FIELD_CALL_ID, self.call_id)?;
        Ok(w.pos)
    }

    /// Encode into an owned stack buffer of [`PACKET_BUFFER_SIZE`] bytes.
    pub fn encode_to_buffer(&self) -> Result<PacketBuffer> {
        let mut buf = PacketBuffer::new();
        buf.resize_default(PACKET_BUFFER_SIZE)
            .map_err(|()| Error::ResourceExhausted)?;
        let len = self.encode(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }
}

fn varint_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

// ── Encoder ──────────────────────────────────────────────────

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(Error::ResourceExhausted);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn varint(&mut self, mut value: u32) -> Result<()> {
        let mut tmp = [0u8; 5];
        let mut n = 0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                tmp[n] = byte;
                n += 1;
                break;
            }
            tmp[n] = byte | 0x80;
            n += 1;
        }
        self.put(&tmp[..n])
    }

    fn key(&mut self, field: u32, wire: u8) -> Result<()> {
        self.varint((field << 3) | u32::from(wire))
    }

    fn field_varint(&mut self, field: u32, value: u32) -> Result<()> {
        self.key(field, WIRE_VARINT)?;
        self.varint(value)
    }

    fn field_fixed32(&mut self, field: u32, value: u32) -> Result<()> {
        self.key(field, WIRE_FIXED32)?;
        self.put(&value.to_le_bytes())
    }
}

// ── Decoder ──────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::MalformedPacket)?;
        if end > self.buf.len() {
            return Err(Error::MalformedPacket);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = *self.buf.get(self.pos).ok_or(Error::MalformedPacket)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::MalformedPacket)
    }

    fn varint_u32(&mut self) -> Result<u32> {
        u32::try_from(self.varint()?).map_err(|_| Error::MalformedPacket)
    }

    fn fixed32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn length_delimited(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.varint()?).map_err(|_| Error::MalformedPacket)?;
        self.take(len)
    }

    /// Skip an unknown field of the given wire type.
    fn skip(&mut self, wire: u8) -> Result<()> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.take(8).map(|_| ()),
            WIRE_LEN => self.length_delimited().map(|_| ()),
            WIRE_FIXED32 => self.take(4).map(|_| ()),
            _ => Err(Error::MalformedPacket),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
