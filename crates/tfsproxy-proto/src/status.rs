//! Status message
//!
//! Any backend may answer with a status packet instead of the typed reply:
//! `code:i32 | error_len:u32 | error\0`. The codec always checks for it
//! before parsing a typed payload.

use bytes::Bytes;
use tfsproxy_common::{Error, Result, StatusCode};

use crate::codec::{Frame, MessageType, PacketBuilder};

/// Decoded status packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub code: StatusCode,
    pub error: String,
}

impl StatusMessage {
    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut r = frame.reader();
        let code = StatusCode::from_wire(r.i32()?);
        let len = r.u32()? as usize;
        let raw = r.bytes(len.min(r.remaining()))?;
        let text = raw.strip_suffix(&[0]).unwrap_or(raw);
        Ok(Self {
            code,
            error: String::from_utf8_lossy(text).into_owned(),
        })
    }

    /// Numeric value carried as text in the error string
    #[must_use]
    pub fn value(&self) -> Option<i64> {
        let digits: String = self
            .error
            .trim()
            .chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
            .map(|(_, c)| c)
            .collect();
        digits.parse().ok()
    }

    /// Turn a failure code into an error
    pub fn into_result(self) -> Result<Self> {
        if self.code.is_ok() {
            Ok(self)
        } else {
            Err(Error::Status {
                code: self.code,
                message: self.error,
            })
        }
    }
}

/// Fail with the backend status if `frame` is a status packet carrying an
/// error.
///
/// Returns the status on success so callers that expect a bare status reply
/// can inspect its text.
pub fn check(frame: &Frame, action: &str) -> Result<Option<StatusMessage>> {
    if !frame.is_status() {
        return Ok(None);
    }
    let status = StatusMessage::parse(frame)?;
    if status.code.is_ok() {
        return Ok(Some(status));
    }
    tracing::debug!(
        "{} failed with status {}: {}",
        action,
        status.code,
        status.error
    );
    Err(Error::Status {
        code: status.code,
        message: format!("{action}: {}", status.error),
    })
}

/// Expect a status reply and fail on anything else
pub fn expect_ok(frame: &Frame, action: &str) -> Result<StatusMessage> {
    check(frame, action)?
        .ok_or_else(|| Error::decode(format!("{action}: expected status, got {:?}", frame.msg_type())))
}

/// Encode a status packet
#[must_use]
pub fn encode(code: StatusCode, error: &str) -> Bytes {
    builder(code, error).finish()
}

/// Build a status packet as a received frame
#[must_use]
pub fn frame(code: StatusCode, error: &str) -> Frame {
    builder(code, error).into_frame()
}

fn builder(code: StatusCode, error: &str) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::STATUS);
    b.put_i32(code.0).put_cstr(error);
    b
}
