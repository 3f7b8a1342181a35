//! Framing: 4 bytes BE length + bincode payload + 4 bytes BE CRC32 of the payload.
//!
//! A frame is always fully buffered before validation: length cap first, then
//! checksum, then schema. A peer can't make us allocate more than
//! [`MAX_PAYLOAD_LEN`] or hand a corrupted payload to bincode.

use crate::protocol::Packet;

const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;
/// Largest payload accepted from a peer. Handshake packets are a few hundred bytes.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a packet into a single frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let payload = bincode::serialize(packet).map_err(EncodeError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError::TooLarge)?;
    if len > MAX_PAYLOAD_LEN {
        return Err(EncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len() + CRC_SIZE);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_be_bytes());
    Ok(out)
}

/// Error encoding a packet into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the packet and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), DecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(DecodeError::Truncated);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::SizeExceeded(len));
    }
    let len = len as usize;
    let total = LEN_SIZE + len + CRC_SIZE;
    if bytes.len() < total {
        return Err(DecodeError::Truncated);
    }
    let payload = &bytes[LEN_SIZE..LEN_SIZE + len];
    let crc_at = LEN_SIZE + len;
    let expected = u32::from_be_bytes([
        bytes[crc_at],
        bytes[crc_at + 1],
        bytes[crc_at + 2],
        bytes[crc_at + 3],
    ]);
    let actual = checksum(payload);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }
    let packet: Packet = bincode::deserialize(payload).map_err(DecodeError::SchemaInvalid)?;
    Ok((packet, total))
}

/// Decode exactly one frame; anything after it is an error.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let (packet, consumed) = decode_frame(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(packet)
}

/// Error decoding a frame. All variants end the current session and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,
    #[error("declared payload length {0} exceeds cap")]
    SizeExceeded(u32),
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("schema invalid: {0}")]
    SchemaInvalid(bincode::Error),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
