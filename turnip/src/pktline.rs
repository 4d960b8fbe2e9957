//! Git pkt-line framing.
//!
//! A pkt-line is a length-prefixed frame: four lowercase hex digits giving
//! the total length including the prefix itself, followed by the payload.
//! The length `0000` is the flush-pkt and carries no payload.
use std::fmt;

/// Size of the hex length prefix.
pub const HEADER_LEN: usize = 4;
/// Maximum payload of a data-pkt.
pub const MAX_PAYLOAD: usize = 65520;
/// Wire form of a flush-pkt.
pub const FLUSH: &[u8; 4] = b"0000";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Payload too large for a single data-pkt.
    #[error("data-pkt payload must not exceed {MAX_PAYLOAD} bytes")]
    Oversized,
    /// Length prefix is not hex, or outside the valid range.
    #[error("Invalid pkt-len")]
    InvalidPktLen,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Vec<u8>),
    Flush,
}

impl Packet {
    /// The payload of a data-pkt, or `None` for a flush-pkt.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Packet::Data(data) => Some(data),
            Packet::Flush => None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Data(data) => write!(f, "data-pkt ({} bytes)", data.len()),
            Packet::Flush => write!(f, "flush-pkt"),
        }
    }
}

/// Encode a payload as a data-pkt, or `None` as a flush-pkt.
pub fn encode(payload: Option<&[u8]>) -> Result<Vec<u8>, Error> {
    match payload {
        None => Ok(FLUSH.to_vec()),
        Some(data) => {
            if data.len() > MAX_PAYLOAD {
                return Err(Error::Oversized);
            }
            let mut pkt = format!("{:04x}", data.len() + HEADER_LEN).into_bytes();
            pkt.extend_from_slice(data);
            Ok(pkt)
        }
    }
}

/// Decode one frame from the head of `input`.
///
/// Returns the packet and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode(input: &[u8]) -> Result<Option<(Packet, usize)>, Error> {
    if input.len() < HEADER_LEN {
        return Ok(None);
    }
    if &input[..HEADER_LEN] == FLUSH {
        return Ok(Some((Packet::Flush, HEADER_LEN)));
    }
    let len = std::str::from_utf8(&input[..HEADER_LEN])
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or(Error::InvalidPktLen)?;
    if !(HEADER_LEN..=HEADER_LEN + MAX_PAYLOAD).contains(&len) {
        return Err(Error::InvalidPktLen);
    }
    if input.len() < len {
        return Ok(None);
    }
    Ok(Some((Packet::Data(input[HEADER_LEN..len].to_vec()), len)))
}

/// Pkt-line stream deserializer.
///
/// Buffers raw bytes and yields decoded frames; once a consumer switches to
/// verbatim forwarding, the unparsed tail can be drained.
#[derive(Debug, Default)]
pub struct Pktlines {
    unparsed: Vec<u8>,
}

impl Pktlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next frame. Returns [`None`] if nothing was decoded.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        match decode(&self.unparsed)? {
            Some((packet, consumed)) => {
                self.unparsed.drain(..consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Drain the unparsed buffer.
    pub fn unparsed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.unparsed)
    }

    /// Return whether there are unparsed bytes.
    pub fn is_empty(&self) -> bool {
        self.unparsed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unparsed.len()
    }
}

impl From<Vec<u8>> for Pktlines {
    fn from(unparsed: Vec<u8>) -> Self {
        Self { unparsed }
    }
}

impl Iterator for Pktlines {
    type Item = Result<Packet, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
