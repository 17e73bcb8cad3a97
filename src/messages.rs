//! Host/RPU message framing.
//!
//! Every message starts with a [`MessageHeader`]. Host-originated messages and
//! events add a 32-bit [`RpuMessageType`] right after it.

use crate::error::Error;

/// Largest command the host can build, header included. Commands longer than
/// the configured fragment size are posted in several fragments.
pub const MAX_CMD_LEN: usize = 2048;

/// `{len, resubmit}` prefix of every message, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageHeader {
    /// Length of the whole message, header included.
    pub len: u32,
    /// Non-zero when the receiver must hand the buffer back for reuse.
    pub resubmit: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let len = read_u32(bytes, 0)?;
        let resubmit = read_u32(bytes, 4)?;
        Some(Self { len, resubmit })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..].copy_from_slice(&self.resubmit.to_le_bytes());
        out
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpuMessageType {
    System = 0,
    Supplicant = 1,
    Data = 2,
    Umac = 3,
}

impl TryFrom<u32> for RpuMessageType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Self::System),
            1 => Ok(Self::Supplicant),
            2 => Ok(Self::Data),
            3 => Ok(Self::Umac),
            other => Err(other),
        }
    }
}

/// Header plus message type.
pub const HOST_RPU_MSG_HDR_SIZE: usize = MessageHeader::SIZE + 4;

/// Type of a reassembled event, if it carries a known one.
pub fn event_message_type(event: &[u8]) -> Option<RpuMessageType> {
    read_u32(event, MessageHeader::SIZE).and_then(|t| RpuMessageType::try_from(t).ok())
}

/// Payload of a reassembled event, past the header and message type.
pub fn event_payload(event: &[u8]) -> &[u8] {
    event.get(HOST_RPU_MSG_HDR_SIZE..).unwrap_or(&[])
}

/// A host command ready to be posted, stored in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    msg_type: RpuMessageType,
    bytes: heapless::Vec<u8, MAX_CMD_LEN>,
}

impl CommandMessage {
    /// Frames `payload` as a message of type `msg_type`.
    ///
    /// Fails with [`Error::ResourceExhaustion`] when the framed message does not
    /// fit in [`MAX_CMD_LEN`].
    pub fn new(msg_type: RpuMessageType, payload: &[u8]) -> Result<Self, Error> {
        let len = HOST_RPU_MSG_HDR_SIZE + payload.len();
        if len > MAX_CMD_LEN {
            return Err(Error::ResourceExhaustion);
        }

        let header = MessageHeader {
            len: len as u32,
            resubmit: 0,
        };
        let mut bytes = heapless::Vec::new();
        bytes.extend_from_slice(&header.to_bytes()).map_err(|_| Error::ResourceExhaustion)?;
        bytes
            .extend_from_slice(&(msg_type as u32).to_le_bytes())
            .map_err(|_| Error::ResourceExhaustion)?;
        bytes.extend_from_slice(payload).map_err(|_| Error::ResourceExhaustion)?;
        Ok(Self { msg_type, bytes })
    }

    pub fn msg_type(&self) -> RpuMessageType {
        self.msg_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HOST_RPU_MSG_HDR_SIZE..]
    }

    /// Length on the wire, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CommandMessage {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "CommandMessage {{ type: {}, len: {} }}", self.msg_type(), self.len())
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
