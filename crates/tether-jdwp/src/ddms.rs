//! DDMS chunk sub-format.
//!
//! DDMS traffic rides inside ordinary JDWP command packets whose cmd-set/cmd
//! equal the reserved values (0xC7 / 0x01). The payload is a sequence of
//! chunks, each a 4-byte ASCII tag, a 4-byte big-endian length, and `length`
//! payload bytes.

use std::fmt;

use crate::packet::{JdwpPacket, PacketKind};
use crate::{JdwpError, Result};

pub const DDMS_COMMAND_SET: u8 = 0xC7;
pub const DDMS_COMMAND: u8 = 0x01;
pub const CHUNK_HEADER_LEN: usize = 8;

/// True when the packet is a DDMS command (device-monitoring traffic rather
/// than debugger traffic). Replies carry no discriminator, so they can only
/// be classified by correlating ids with the command that produced them.
pub fn is_ddms_command(packet: &JdwpPacket) -> bool {
    matches!(
        packet.kind,
        PacketKind::Command {
            command_set: DDMS_COMMAND_SET,
            command: DDMS_COMMAND,
        }
    )
}

/// A 4-character ASCII chunk tag, stored big-endian in a `u32` the way it
/// appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DdmsChunkType(pub u32);

impl DdmsChunkType {
    pub const HELO: Self = Self::from_tag(*b"HELO");
    pub const APNM: Self = Self::from_tag(*b"APNM");
    pub const WAIT: Self = Self::from_tag(*b"WAIT");
    pub const EXIT: Self = Self::from_tag(*b"EXIT");
    pub const FEAT: Self = Self::from_tag(*b"FEAT");
    pub const MPRQ: Self = Self::from_tag(*b"MPRQ");

    pub const fn from_tag(tag: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(tag))
    }

    pub fn tag(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for DdmsChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.tag() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DdmsChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DdmsChunkType({self})")
    }
}

/// Borrowed view of one chunk inside a packet payload.
///
/// The view holds a reference to the payload bytes it was parsed from; its
/// `payload` length always equals the number of bytes actually present, never
/// just the declared length field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdmsChunkView<'a> {
    pub chunk_type: DdmsChunkType,
    pub payload: &'a [u8],
}

impl<'a> DdmsChunkView<'a> {
    /// Parse the first chunk of `buf`. Fails if the header is truncated or
    /// the declared length overruns the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let (view, rest) = Self::parse_prefix(buf)?;
        if !rest.is_empty() {
            tracing::trace!(
                target: "tether.jdwp",
                trailing = rest.len(),
                "ignoring trailing bytes after DDMS chunk"
            );
        }
        Ok(view)
    }

    fn parse_prefix(buf: &'a [u8]) -> Result<(Self, &'a [u8])> {
        if buf.len() < CHUNK_HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "DDMS chunk header truncated: {} byte(s)",
                buf.len()
            )));
        }
        let chunk_type = DdmsChunkType(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let body = &buf[CHUNK_HEADER_LEN..];
        if length > body.len() {
            return Err(JdwpError::Protocol(format!(
                "DDMS chunk {chunk_type} declares {length} byte(s), only {} available",
                body.len()
            )));
        }
        let (payload, rest) = body.split_at(length);
        Ok((
            Self {
                chunk_type,
                payload,
            },
            rest,
        ))
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_owned(&self) -> DdmsChunk {
        DdmsChunk {
            chunk_type: self.chunk_type,
            payload: self.payload.to_vec(),
        }
    }
}

/// Iterate over consecutive chunks in a packet payload.
pub fn chunks(buf: &[u8]) -> ChunkIter<'_> {
    ChunkIter { rest: buf }
}

pub struct ChunkIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<DdmsChunkView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match DdmsChunkView::parse_prefix(self.rest) {
            Ok((view, rest)) => {
                self.rest = rest;
                Some(Ok(view))
            }
            Err(err) => {
                self.rest = &[];
                Some(Err(err))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdmsChunk {
    pub chunk_type: DdmsChunkType,
    pub payload: Vec<u8>,
}

impl DdmsChunk {
    pub fn new(chunk_type: DdmsChunkType, payload: Vec<u8>) -> Self {
        Self {
            chunk_type,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.chunk_type.tag());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Embed the chunk as the payload of a DDMS command packet.
    pub fn into_command_packet(self, id: u32) -> JdwpPacket {
        JdwpPacket::command(id, DDMS_COMMAND_SET, DDMS_COMMAND, self.encode())
    }

    /// Embed the chunk as the payload of a reply packet (how a VM answers a
    /// DDMS query such as `HELO`).
    pub fn into_reply_packet(self, id: u32) -> JdwpPacket {
        JdwpPacket::reply(id, 0, self.encode())
    }
}

/// Process metadata exchanged by the DDMS `HELO` chunk.
///
/// Reply layout (per the on-device DDM server): `u32` protocol version,
/// `u32` pid, `u32` VM identifier length in UTF-16 units, `u32` process name
/// length in UTF-16 units, then both strings as UTF-16BE. Later protocol
/// revisions append extra fields; decoding tolerates trailing bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeloData {
    pub version: u32,
    pub pid: u32,
    pub vm_identifier: String,
    pub process_name: String,
}

impl HeloData {
    pub fn encode_reply_chunk(&self) -> DdmsChunk {
        let vm: Vec<u16> = self.vm_identifier.encode_utf16().collect();
        let name: Vec<u16> = self.process_name.encode_utf16().collect();
        let mut payload = Vec::with_capacity(16 + 2 * (vm.len() + name.len()));
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.extend_from_slice(&self.pid.to_be_bytes());
        payload.extend_from_slice(&(vm.len() as u32).to_be_bytes());
        payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
        for unit in vm.iter().chain(name.iter()) {
            payload.extend_from_slice(&unit.to_be_bytes());
        }
        DdmsChunk::new(DdmsChunkType::HELO, payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 16 {
            return Err(JdwpError::Protocol(format!(
                "HELO payload truncated: {} byte(s)",
                payload.len()
            )));
        }
        let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let pid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let vm_len = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;
        let name_len =
            u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
        let strings = &payload[16..];
        let need = 2 * (vm_len + name_len);
        if strings.len() < need {
            return Err(JdwpError::Protocol(format!(
                "HELO strings truncated: need {need} byte(s), have {}",
                strings.len()
            )));
        }
        let vm_identifier = decode_utf16be(&strings[..2 * vm_len])?;
        let process_name = decode_utf16be(&strings[2 * vm_len..need])?;
        Ok(Self {
            version,
            pid,
            vm_identifier,
            process_name,
        })
    }
}

fn decode_utf16be(bytes: &[u8]) -> Result<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|err| JdwpError::Protocol(format!("invalid UTF-16 string: {err}")))
}
