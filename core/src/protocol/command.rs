//! Client-to-server command decoding.
//!
//! A command is a line of space separated tokens terminated by `\n`. PUB,
//! DPUB, MPUB and IDENTIFY are followed by a `u32` body size and the body.

use super::errors::{ErrorCode, ProtocolError};
use super::message::MessageId;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Longest command line accepted before the body
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, defer_ms: i64, body: Bytes },
    Rdy(i64),
    Fin(MessageId),
    Req { id: MessageId, timeout_ms: i64 },
    Touch(MessageId),
    Nop,
    Cls,
    /// A command whose body was refused and skipped; the stream stays usable
    Rejected(ProtocolError),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Dpub { .. } => "DPUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
            Command::Rejected(_) => "REJECTED",
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
enum PendingBody {
    Identify,
    Pub { topic: String },
    Mpub { topic: String },
    Dpub { topic: String, defer_ms: i64 },
}

impl PendingBody {
    fn name(&self) -> &'static str {
        match self {
            PendingBody::Identify => "IDENTIFY",
            PendingBody::Pub { .. } => "PUB",
            PendingBody::Mpub { .. } => "MPUB",
            PendingBody::Dpub { .. } => "DPUB",
        }
    }
}

#[derive(Debug, Clone)]
enum DecodeState {
    Line,
    Size(PendingBody),
    Body { pending: PendingBody, size: usize },
    Discard { remaining: usize, error: ProtocolError },
}

/// Stateful decoder for the command stream of one connection
#[derive(Debug, Clone)]
pub struct CommandCodec {
    max_msg_size: usize,
    max_body_size: usize,
    state: DecodeState,
}

impl CommandCodec {
    pub fn new(max_msg_size: usize, max_body_size: usize) -> Self {
        Self {
            max_msg_size,
            max_body_size,
            state: DecodeState::Line,
        }
    }
}

fn invalid(description: impl Into<String>) -> ProtocolError {
    ProtocolError::fatal(ErrorCode::Invalid, description)
}

fn bad_body(description: impl Into<String>) -> ProtocolError {
    ProtocolError::fatal(ErrorCode::BadBody, description)
}

fn parse_message_id(command: &str, raw: &str) -> Result<MessageId, ProtocolError> {
    MessageId::from_slice(raw.as_bytes())
        .ok_or_else(|| invalid(format!("{} invalid message id '{}'", command, raw)))
}

fn parse_int(command: &str, what: &str, raw: &str) -> Result<i64, ProtocolError> {
    raw.parse::<i64>()
        .map_err(|_| invalid(format!("{} could not parse {} '{}'", command, what, raw)))
}

fn expect_params(command: &str, params: &[&str], count: usize) -> Result<(), ProtocolError> {
    if params.len() != count {
        return Err(invalid(format!(
            "{} expects {} parameter(s), got {}",
            command,
            count,
            params.len()
        )));
    }
    Ok(())
}

enum LineOutcome {
    Complete(Command),
    NeedsBody(PendingBody),
}

fn parse_line(line: &str) -> Result<LineOutcome, ProtocolError> {
    let mut tokens = line.split(' ');
    let name = tokens.next().unwrap_or_default();
    let params: Vec<&str> = tokens.collect();

    let outcome = match name {
        "IDENTIFY" => {
            expect_params(name, &params, 0)?;
            LineOutcome::NeedsBody(PendingBody::Identify)
        }
        "SUB" => {
            expect_params(name, &params, 2)?;
            LineOutcome::Complete(Command::Sub {
                topic: params[0].to_string(),
                channel: params[1].to_string(),
            })
        }
        "PUB" => {
            expect_params(name, &params, 1)?;
            LineOutcome::NeedsBody(PendingBody::Pub {
                topic: params[0].to_string(),
            })
        }
        "MPUB" => {
            expect_params(name, &params, 1)?;
            LineOutcome::NeedsBody(PendingBody::Mpub {
                topic: params[0].to_string(),
            })
        }
        "DPUB" => {
            expect_params(name, &params, 2)?;
            LineOutcome::NeedsBody(PendingBody::Dpub {
                topic: params[0].to_string(),
                defer_ms: parse_int(name, "defer", params[1])?,
            })
        }
        "RDY" => match params.len() {
            0 => LineOutcome::Complete(Command::Rdy(1)),
            1 => LineOutcome::Complete(Command::Rdy(parse_int(name, "count", params[0])?)),
            n => return Err(invalid(format!("RDY expects at most 1 parameter, got {}", n))),
        },
        "FIN" => {
            expect_params(name, &params, 1)?;
            LineOutcome::Complete(Command::Fin(parse_message_id(name, params[0])?))
        }
        "REQ" => {
            expect_params(name, &params, 2)?;
            LineOutcome::Complete(Command::Req {
                id: parse_message_id(name, params[0])?,
                timeout_ms: parse_int(name, "timeout", params[1])?,
            })
        }
        "TOUCH" => {
            expect_params(name, &params, 1)?;
            LineOutcome::Complete(Command::Touch(parse_message_id(name, params[0])?))
        }
        "NOP" => {
            expect_params(name, &params, 0)?;
            LineOutcome::Complete(Command::Nop)
        }
        "CLS" => {
            expect_params(name, &params, 0)?;
            LineOutcome::Complete(Command::Cls)
        }
        other => return Err(invalid(format!("invalid command {}", other))),
    };
    Ok(outcome)
}

fn parse_mpub_body(mut body: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    if body.len() < 4 {
        return Err(bad_body("MPUB body too short for message count"));
    }
    let count = body.get_u32() as usize;
    if count == 0 {
        return Err(bad_body("MPUB invalid message count 0"));
    }

    let mut bodies = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        if body.len() < 4 {
            return Err(bad_body(format!(
                "MPUB body ended before size of message {}",
                index
            )));
        }
        let size = body.get_u32() as usize;
        if body.len() < size {
            return Err(bad_body(format!(
                "MPUB message {} declares {} bytes but only {} remain",
                index,
                size,
                body.len()
            )));
        }
        bodies.push(body.split_to(size));
    }

    if !body.is_empty() {
        return Err(bad_body(format!(
            "MPUB body has {} trailing bytes after {} messages",
            body.len(),
            count
        )));
    }
    Ok(bodies)
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = CommandError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Line) {
                DecodeState::Line => {
                    let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                        if src.len() > MAX_LINE_LENGTH {
                            return Err(invalid("command line too long").into());
                        }
                        return Ok(None);
                    };
                    if newline > MAX_LINE_LENGTH {
                        return Err(invalid("command line too long").into());
                    }

                    let raw = src.split_to(newline + 1);
                    let mut line = &raw[..newline];
                    if let Some(stripped) = line.strip_suffix(b"\r") {
                        line = stripped;
                    }
                    let line = std::str::from_utf8(line)
                        .map_err(|_| invalid("command line is not valid UTF-8"))?;

                    match parse_line(line)? {
                        LineOutcome::Complete(command) => return Ok(Some(command)),
                        LineOutcome::NeedsBody(pending) => {
                            self.state = DecodeState::Size(pending);
                        }
                    }
                }
                DecodeState::Size(pending) => {
                    if src.len() < 4 {
                        self.state = DecodeState::Size(pending);
                        return Ok(None);
                    }
                    let size = src.get_u32() as usize;
                    let name = pending.name();

                    match &pending {
                        PendingBody::Pub { .. } | PendingBody::Dpub { .. } => {
                            if size == 0 {
                                return Ok(Some(Command::Rejected(ProtocolError::client(
                                    ErrorCode::BadMessage,
                                    format!("{} invalid message body size 0", name),
                                ))));
                            }
                            if size > self.max_msg_size {
                                self.state = DecodeState::Discard {
                                    remaining: size,
                                    error: ProtocolError::client(
                                        ErrorCode::BadMessage,
                                        format!(
                                            "{} message too big {} > {}",
                                            name, size, self.max_msg_size
                                        ),
                                    ),
                                };
                                continue;
                            }
                        }
                        PendingBody::Identify | PendingBody::Mpub { .. } => {
                            if size == 0 || size > self.max_body_size {
                                return Err(bad_body(format!(
                                    "{} invalid body size {}",
                                    name, size
                                ))
                                .into());
                            }
                        }
                    }
                    self.state = DecodeState::Body { pending, size };
                }
                DecodeState::Body { pending, size } => {
                    if src.len() < size {
                        src.reserve(size - src.len());
                        self.state = DecodeState::Body { pending, size };
                        return Ok(None);
                    }
                    let body = src.split_to(size).freeze();

                    let command = match pending {
                        PendingBody::Identify => Command::Identify(body),
                        PendingBody::Pub { topic } => Command::Pub { topic, body },
                        PendingBody::Dpub { topic, defer_ms } => Command::Dpub {
                            topic,
                            defer_ms,
                            body,
                        },
                        PendingBody::Mpub { topic } => Command::Mpub {
                            topic,
                            bodies: parse_mpub_body(body)?,
                        },
                    };
                    return Ok(Some(command));
                }
                DecodeState::Discard { remaining, error } => {
                    let skip = remaining.min(src.len());
                    src.advance(skip);
                    let remaining = remaining - skip;
                    if remaining > 0 {
                        self.state = DecodeState::Discard { remaining, error };
                        return Ok(None);
                    }
                    return Ok(Some(Command::Rejected(error)));
                }
            }
        }
    }
}
