use super::frame::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MSG_ID_LENGTH: usize = 16;

/// Timestamp, attempts and id precede the body in a message frame
pub const MESSAGE_HEADER_LEN: usize = 8 + 2 + MSG_ID_LENGTH;

// Custom epoch (2010-11-04) keeps 41 bits of milliseconds usable for decades
const GUID_EPOCH_MS: u64 = 1_288_834_974_657;
const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + NODE_ID_BITS;

/// 16-byte message identifier, the lowercase hex rendering of a 64-bit GUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MSG_ID_LENGTH]);

impl MessageId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; MSG_ID_LENGTH] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }

    fn from_guid(guid: u64) -> Self {
        let mut raw = [0u8; MSG_ID_LENGTH];
        raw.copy_from_slice(hex::encode(guid.to_be_bytes()).as_bytes());
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Generates time-ordered ids unique to this node.
///
/// Layout: 41 bits of milliseconds since [`GUID_EPOCH_MS`], 10 bits of node
/// id, 12 bits of per-millisecond sequence. When the sequence is exhausted or
/// the wall clock steps backwards the generator borrows the next millisecond,
/// so ids stay strictly increasing.
pub struct GuidFactory {
    node_id: u64,
    state: Mutex<GuidState>,
}

#[derive(Default)]
struct GuidState {
    last_ms: u64,
    sequence: u64,
}

impl fmt::Debug for GuidFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidFactory")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl GuidFactory {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & ((1 << NODE_ID_BITS) - 1),
            state: Mutex::new(GuidState::default()),
        }
    }

    pub fn next_id(&self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let now = now.saturating_sub(GUID_EPOCH_MS);

        let mut state = self.state.lock();
        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        }

        let guid = (state.last_ms << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_ID_SHIFT)
            | state.sequence;
        MessageId::from_guid(guid)
    }
}

/// A published message as held by a channel.
///
/// The body is shared between the copies fanned out to each channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    /// Nanoseconds since the Unix epoch at publish time
    pub timestamp: i64,
    /// Number of times the message has been delivered
    pub attempts: u16,
}

impl Message {
    pub fn new(id: MessageId, body: Bytes) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        Self {
            id,
            body,
            timestamp,
            attempts: 0,
        }
    }

    /// Payload of a message frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + self.body.len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Parse a message frame payload
    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() < MESSAGE_HEADER_LEN {
            return Err(FrameError::MalformedFrame(format!(
                "message payload of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let timestamp = payload.get_i64();
        let attempts = payload.get_u16();
        let id_bytes = payload.split_to(MSG_ID_LENGTH);
        let id = MessageId::from_slice(&id_bytes)
            .ok_or_else(|| FrameError::MalformedFrame("bad message id".to_string()))?;
        Ok(Self {
            id,
            body: payload,
            timestamp,
            attempts,
        })
    }
}
