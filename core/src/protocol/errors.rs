use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Stable error codes written at the start of every error frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Invalid,
    BadProtocol,
    BadBody,
    BadMessage,
    BadTopic,
    BadChannel,
    PubFailed,
    MpubFailed,
    DpubFailed,
    FinFailed,
    ReqFailed,
    TouchFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Invalid => "E_INVALID",
            ErrorCode::BadProtocol => "E_BAD_PROTOCOL",
            ErrorCode::BadBody => "E_BAD_BODY",
            ErrorCode::BadMessage => "E_BAD_MESSAGE",
            ErrorCode::BadTopic => "E_BAD_TOPIC",
            ErrorCode::BadChannel => "E_BAD_CHANNEL",
            ErrorCode::PubFailed => "E_PUB_FAILED",
            ErrorCode::MpubFailed => "E_MPUB_FAILED",
            ErrorCode::DpubFailed => "E_DPUB_FAILED",
            ErrorCode::FinFailed => "E_FIN_FAILED",
            ErrorCode::ReqFailed => "E_REQ_FAILED",
            ErrorCode::TouchFailed => "E_TOUCH_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported to the client in an error frame.
///
/// Fatal errors close the connection after the frame is written; the rest
/// leave it open so the client can adapt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {description}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub description: String,
    fatal: bool,
}

impl ProtocolError {
    /// Protocol violation: the connection is closed after reporting it
    pub fn fatal(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            fatal: true,
        }
    }

    /// Command-level failure: the connection stays open
    pub fn client(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            fatal: false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Error frame payload, `"<CODE> <description>"`
    pub fn to_payload(&self) -> Bytes {
        if self.description.is_empty() {
            Bytes::from_static(self.code.as_str().as_bytes())
        } else {
            Bytes::from(self.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_starts_with_code() {
        let err = ProtocolError::client(ErrorCode::FinFailed, "FIN abc failed");
        assert_eq!(err.to_payload(), Bytes::from("E_FIN_FAILED FIN abc failed"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bare_code_payload() {
        let err = ProtocolError::fatal(ErrorCode::BadProtocol, "");
        assert_eq!(err.to_payload(), Bytes::from_static(b"E_BAD_PROTOCOL"));
        assert!(err.is_fatal());
    }
}
