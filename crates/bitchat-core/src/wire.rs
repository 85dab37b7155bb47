//! Binary wire codec for [`BitchatPacket`]
//!
//! Layout, all multi-byte integers big-endian:
//!
//! ```text
//! version | type | ttl | timestamp(8) | senderID(8) | hasRecipient(1)
//!   | recipientID(8 if present) | payloadLen(u16) | payload
//!   | hasSignature(1) | signature(64 if present) | [padding]
//! ```
//!
//! Padded frames are filled with random bytes up to the next bucket size and
//! end with a 2-byte trailer recording the pre-padding length. The decoder
//! parses front-to-back and treats everything after the signature flag (and
//! optional signature) as padding, so padded and unpadded frames decode the
//! same way.

use rand::RngCore;

use crate::errors::PacketError;
use crate::packet::{BitchatPacket, MessageType, PROTOCOL_VERSION};
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Padding buckets hiding message sizes from traffic observers
pub const PADDING_BUCKETS: &[usize] = &[256, 512, 1024, 2048, 4096];

/// Bytes of the fixed header before the optional recipient field
const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 8 + 8 + 1;

/// Size of an attached signature
const SIGNATURE_LEN: usize = 64;

/// Size of the original-length trailer on padded frames
const PAD_TRAILER_LEN: usize = 2;

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Encode a packet to the wire, optionally padded to the next bucket
pub fn encode(packet: &BitchatPacket, pad: bool) -> Result<Vec<u8>, PacketError> {
    if packet.payload.len() > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge {
            max: u16::MAX as usize,
            actual: packet.payload.len(),
        });
    }

    let recipient = packet.recipient_id.filter(|id| !id.is_broadcast());

    let mut bytes = Vec::with_capacity(
        FIXED_HEADER_LEN + 8 + 2 + packet.payload.len() + 1 + SIGNATURE_LEN,
    );

    bytes.push(packet.version);
    bytes.push(packet.message_type as u8);
    bytes.push(packet.ttl.value());
    bytes.extend_from_slice(&packet.timestamp.as_millis().to_be_bytes());
    bytes.extend_from_slice(packet.sender_id.as_bytes());

    match recipient {
        Some(id) => {
            bytes.push(1);
            bytes.extend_from_slice(id.as_bytes());
        }
        None => bytes.push(0),
    }

    bytes.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&packet.payload);

    match packet.signature {
        Some(signature) => {
            bytes.push(1);
            bytes.extend_from_slice(&signature);
        }
        None => bytes.push(0),
    }

    if pad {
        bytes = apply_padding(bytes);
    }

    Ok(bytes)
}

/// Pad to the next bucket with random fill and a 2-byte length trailer
///
/// Frames larger than the top bucket (minus trailer) go out unpadded.
fn apply_padding(bytes: Vec<u8>) -> Vec<u8> {
    let original_len = bytes.len();
    let target = match PADDING_BUCKETS
        .iter()
        .find(|&&bucket| original_len + PAD_TRAILER_LEN <= bucket)
    {
        Some(&bucket) => bucket,
        None => return bytes,
    };

    let mut padded = bytes;
    let fill = target - original_len - PAD_TRAILER_LEN;
    let mut random = vec![0u8; fill];
    rand::thread_rng().fill_bytes(&mut random);
    padded.extend_from_slice(&random);
    padded.extend_from_slice(&(original_len as u16).to_be_bytes());
    padded
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Cursor over an inbound frame with bounds-checked reads
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        if self.bytes.len() < self.offset + len {
            return Err(PacketError::TruncatedHeader {
                needed: self.offset + len,
                got: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, PacketError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64_be(&mut self) -> Result<u64, PacketError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn peer_id(&mut self) -> Result<PeerId, PacketError> {
        let bytes = self.take(8)?;
        let mut id = [0u8; 8];
        id.copy_from_slice(bytes);
        Ok(PeerId::new(id))
    }
}

/// Decode a frame into a packet, tolerating trailing padding
pub fn decode(bytes: &[u8]) -> Result<BitchatPacket, PacketError> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnknownVersion { version });
    }

    let message_type = MessageType::from_u8(reader.u8()?)?;
    let ttl = Ttl::new(reader.u8()?);
    let timestamp = Timestamp::from_millis(reader.u64_be()?);
    let sender_id = reader.peer_id()?;

    let recipient_id = match reader.u8()? {
        0 => None,
        _ => Some(reader.peer_id()?),
    };

    let payload_len = reader.u16_be()? as usize;
    let payload = match reader.take(payload_len) {
        Ok(slice) => slice.to_vec(),
        Err(PacketError::TruncatedHeader { needed, got }) => {
            return Err(PacketError::TruncatedPayload { needed, got });
        }
        Err(err) => return Err(err),
    };

    let signature = match reader.u8()? {
        0 => None,
        _ => {
            let bytes = reader.take(SIGNATURE_LEN)?;
            let mut signature = [0u8; 64];
            signature.copy_from_slice(bytes);
            Some(signature)
        }
    };

    // Anything left past this point is bucket padding.

    Ok(BitchatPacket {
        version,
        message_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
