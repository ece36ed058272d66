//! # RillMQ Protocol Module
//!
//! Wire types for the `"  V2"` client protocol.
//!
//! ## Layout
//!
//! - [`frame`] - length-prefixed server frames (response, error, message)
//! - [`command`] - client command line and body decoding
//! - [`message`] - message ids and the message frame payload
//! - [`identify`] - IDENTIFY capability negotiation
//! - [`errors`] - stable error codes and the error frame payload
//!
//! A connection starts with a four byte magic that selects the protocol
//! version. Only V2 exists today; see [`ProtocolVersion`].

pub mod command;
pub mod errors;
pub mod frame;
pub mod identify;
pub mod message;

pub use command::{Command, CommandCodec, CommandError, MAX_LINE_LENGTH};
pub use errors::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameCodec, FrameError, FrameType, FRAME_HEADER_LEN};
pub use identify::{IdentifyRequest, IdentifyResponse, Identity};
pub use message::{GuidFactory, Message, MessageId, MESSAGE_HEADER_LEN, MSG_ID_LENGTH};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Handshake bytes announcing protocol V2
pub const MAGIC_V2: [u8; 4] = *b"  V2";

/// Protocol versions selectable by the handshake magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V2,
}

impl ProtocolVersion {
    pub fn from_magic(magic: &[u8; 4]) -> Option<Self> {
        match magic {
            m if *m == MAGIC_V2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        match self {
            ProtocolVersion::V2 => MAGIC_V2,
        }
    }
}

/// Full-duplex codec used while the connection is still a single stream:
/// decodes client commands, encodes server frames.
#[derive(Debug, Clone)]
pub struct V2Codec {
    commands: CommandCodec,
    frames: FrameCodec,
}

impl V2Codec {
    pub fn new(commands: CommandCodec, frames: FrameCodec) -> Self {
        Self { commands, frames }
    }

    /// Split back into the read and write halves' codecs
    pub fn into_parts(self) -> (CommandCodec, FrameCodec) {
        (self.commands, self.frames)
    }
}

impl Decoder for V2Codec {
    type Item = Command;
    type Error = CommandError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.commands.decode(src)
    }
}

impl Encoder<Frame> for V2Codec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.frames.encode(item, dst)
    }
}
