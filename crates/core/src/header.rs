//! Event header codec
//!
//! Every message payload in a Tributary log is prefixed by a fixed 32-byte
//! header. All fields are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       1     type (1 = data, 2 = heartbeat, 3 = admin)
//! 2       2     subtype (i16)
//! 4       4     source (i32)
//! 8       8     source sequence (i64)
//! 16      8     event time in nanos since epoch (i64)
//! 24      4     user data (i32)
//! 28      4     payload length (i32)
//! ```

use crate::error::{Error, Result};

/// Encoded header size in bytes
pub const HEADER_LENGTH: usize = 32;

/// Current header version
pub const HEADER_VERSION: u8 = 1;

/// Source id reserved for admin events
pub const ADMIN_SOURCE_ID: i32 = i32::MIN;

/// Kind of event carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Application data
    Data,
    /// Liveness signal; the heartbeat sequence travels in `user_data`
    Heartbeat,
    /// Control event from the admin source
    Admin,
}

impl EventType {
    /// Wire code of this type
    pub fn code(self) -> u8 {
        match self {
            EventType::Data => 1,
            EventType::Heartbeat => 2,
            EventType::Admin => 3,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EventType::Data),
            2 => Some(EventType::Heartbeat),
            3 => Some(EventType::Admin),
            _ => None,
        }
    }
}

/// Decoded event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Header version
    pub version: u8,
    /// Event kind
    pub event_type: EventType,
    /// Application-defined subtype
    pub subtype: i16,
    /// Logical producer
    pub source: i32,
    /// Sequence number scoped to `source`
    pub source_seq: i64,
    /// When the event occurred
    pub event_time_nanos: i64,
    /// Free-form user data
    pub user_data: i32,
    /// Bytes of payload following the header
    pub payload_length: i32,
}

impl Header {
    /// Header for an application data event.
    pub fn data(
        source: i32,
        source_seq: i64,
        subtype: i16,
        user_data: i32,
        event_time_nanos: i64,
        payload_length: usize,
    ) -> Result<Self> {
        if source == ADMIN_SOURCE_ID {
            return Err(Error::InvalidHeader(format!(
                "Input source ID {} is reserved",
                source
            )));
        }
        let header = Header {
            version: HEADER_VERSION,
            event_type: EventType::Data,
            subtype,
            source,
            source_seq,
            event_time_nanos,
            user_data,
            payload_length: payload_length_to_i32(payload_length)?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Header for a heartbeat from `source`.
    pub fn heartbeat(
        source: i32,
        source_seq: i64,
        heartbeat_seq: i32,
        event_time_nanos: i64,
    ) -> Result<Self> {
        let header = Header {
            version: HEADER_VERSION,
            event_type: EventType::Heartbeat,
            subtype: 0,
            source,
            source_seq,
            event_time_nanos,
            user_data: heartbeat_seq,
            payload_length: 0,
        };
        header.validate()?;
        Ok(header)
    }

    /// Header for an admin event. Admin events always come from
    /// [`ADMIN_SOURCE_ID`] and carry no payload.
    pub fn admin(source_seq: i64, user_data: i32, event_time_nanos: i64) -> Result<Self> {
        let header = Header {
            version: HEADER_VERSION,
            event_type: EventType::Admin,
            subtype: 0,
            source: ADMIN_SOURCE_ID,
            source_seq,
            event_time_nanos,
            user_data,
            payload_length: 0,
        };
        header.validate()?;
        Ok(header)
    }

    /// Heartbeat sequence, if this is a heartbeat.
    pub fn heartbeat_seq(&self) -> Option<i32> {
        (self.event_type == EventType::Heartbeat).then_some(self.user_data)
    }

    /// Check field constraints shared by all event types.
    pub fn validate(&self) -> Result<()> {
        if self.source_seq < 0 {
            return Err(Error::InvalidHeader(format!(
                "Source sequence number cannot be negative: {}",
                self.source_seq
            )));
        }
        if self.payload_length < 0 {
            return Err(Error::InvalidHeader(format!(
                "Payload length cannot be negative: {}",
                self.payload_length
            )));
        }
        match self.event_type {
            EventType::Data if self.source == ADMIN_SOURCE_ID => Err(Error::InvalidHeader(
                format!("Input source ID {} is reserved", self.source),
            )),
            EventType::Admin if self.source != ADMIN_SOURCE_ID => Err(Error::InvalidHeader(
                format!("Admin event from non-admin source {}", self.source),
            )),
            EventType::Heartbeat | EventType::Admin if self.payload_length != 0 => {
                Err(Error::InvalidHeader(format!(
                    "{:?} event cannot carry a payload",
                    self.event_type
                )))
            }
            _ => Ok(()),
        }
    }

    /// Encode into the fixed 32-byte layout.
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0] = self.version;
        buf[1] = self.event_type.code();
        buf[2..4].copy_from_slice(&self.subtype.to_le_bytes());
        buf[4..8].copy_from_slice(&self.source.to_le_bytes());
        buf[8..16].copy_from_slice(&self.source_seq.to_le_bytes());
        buf[16..24].copy_from_slice(&self.event_time_nanos.to_le_bytes());
        buf[24..28].copy_from_slice(&self.user_data.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// Decode from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(Error::InvalidHeader(format!(
                "need {} bytes, got {}",
                HEADER_LENGTH,
                bytes.len()
            )));
        }
        let version = bytes[0];
        if version != HEADER_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported header version: {}",
                version
            )));
        }
        let event_type = EventType::from_code(bytes[1])
            .ok_or_else(|| Error::InvalidHeader(format!("unknown event type: {}", bytes[1])))?;
        Ok(Header {
            version,
            event_type,
            subtype: i16::from_le_bytes([bytes[2], bytes[3]]),
            source: read_i32(bytes, 4),
            source_seq: read_i64(bytes, 8),
            event_time_nanos: read_i64(bytes, 16),
            user_data: read_i32(bytes, 24),
            payload_length: read_i32(bytes, 28),
        })
    }
}

/// Largest payload that fits a message whose total length is an `i32`.
pub const MAX_PAYLOAD_LENGTH: usize = i32::MAX as usize - HEADER_LENGTH;

fn payload_length_to_i32(len: usize) -> Result<i32> {
    if len > MAX_PAYLOAD_LENGTH {
        return Err(Error::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LENGTH,
        });
    }
    Ok(len as i32)
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(b)
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(b)
}
