//! Binary wire protocol between browser and bridge.
//!
//! Every WebSocket binary message carries exactly one frame:
//!
//! ```text
//! [type: u8][len: u32 BE][payload: len bytes]
//! ```
//!
//! Frame types:
//! - `0x01` Data       - raw terminal bytes in either direction
//! - `0x02` Resize     - rows u16 BE, cols u16 BE (client -> server)
//! - `0x03` Disconnect - UTF-8 reason string
//! - `0x04` Ping       - seq u32 BE, keepalive in either direction
//! - `0x05` Reconnect  - empty, client requests a forced shell reconnect

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame header size: 1 byte type + 4 bytes payload length.
pub const HEADER_LEN: usize = 5;

const TYPE_DATA: u8 = 0x01;
const TYPE_RESIZE: u8 = 0x02;
const TYPE_DISCONNECT: u8 = 0x03;
const TYPE_PING: u8 = 0x04;
const TYPE_RECONNECT: u8 = 0x05;

/// One unit of the browser wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal bytes (keystrokes client->server, output server->client).
    Data(Bytes),
    /// Terminal dimensions changed on the client.
    Resize { rows: u16, cols: u16 },
    /// Session is over; carries a human-readable, credential-free reason.
    Disconnect { reason: String },
    /// Keepalive. Client pings are echoed back with the same sequence.
    Ping { seq: u32 },
    /// Client asks for the shell to be torn down and reopened.
    Reconnect,
}

/// Frame decode failure. Decode errors are data, not panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    Oversized { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("resize to {rows}x{cols} rejected: dimensions must be positive")]
    InvalidDimensions { rows: u16, cols: u16 },
}

/// Stateless encoder/decoder for [`Frame`].
///
/// The only configuration is the payload size cap; identical input always
/// yields identical output.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec enforcing the given payload cap on decode.
    #[must_use]
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Encode a frame into a wire message.
    #[must_use]
    pub fn encode(&self, frame: &Frame) -> Bytes {
        let (ty, payload_len) = match frame {
            Frame::Data(data) => (TYPE_DATA, data.len()),
            Frame::Resize { .. } => (TYPE_RESIZE, 4),
            Frame::Disconnect { reason } => (TYPE_DISCONNECT, reason.len()),
            Frame::Ping { .. } => (TYPE_PING, 4),
            Frame::Reconnect => (TYPE_RECONNECT, 0),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u8(ty);
        buf.put_u32(payload_len as u32);
        match frame {
            Frame::Data(data) => buf.put_slice(data),
            Frame::Resize { rows, cols } => {
                buf.put_u16(*rows);
                buf.put_u16(*cols);
            }
            Frame::Disconnect { reason } => buf.put_slice(reason.as_bytes()),
            Frame::Ping { seq } => buf.put_u32(*seq),
            Frame::Reconnect => {}
        }
        buf.freeze()
    }

    /// Decode one wire message into a frame.
    ///
    /// # Errors
    /// Returns [`DecodeError`] for oversized, structurally invalid, or
    /// zero-dimension resize messages. The caller decides whether to drop
    /// the frame or close the session.
    pub fn decode(&self, raw: &[u8]) -> Result<Frame, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::Malformed("message shorter than frame header"));
        }

        let ty = raw[0];
        let declared = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        if declared > self.max_payload {
            return Err(DecodeError::Oversized {
                len: declared,
                max: self.max_payload,
            });
        }

        let payload = &raw[HEADER_LEN..];
        if payload.len() != declared {
            return Err(DecodeError::Malformed(
                "declared payload length does not match message size",
            ));
        }

        match ty {
            TYPE_DATA => Ok(Frame::Data(Bytes::copy_from_slice(payload))),
            TYPE_RESIZE => {
                if payload.len() != 4 {
                    return Err(DecodeError::Malformed("resize payload must be 4 bytes"));
                }
                let rows = u16::from_be_bytes([payload[0], payload[1]]);
                let cols = u16::from_be_bytes([payload[2], payload[3]]);
                if rows == 0 || cols == 0 {
                    return Err(DecodeError::InvalidDimensions { rows, cols });
                }
                Ok(Frame::Resize { rows, cols })
            }
            TYPE_DISCONNECT => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|_| DecodeError::Malformed("disconnect reason is not UTF-8"))?
                    .to_string();
                Ok(Frame::Disconnect { reason })
            }
            TYPE_PING => {
                if payload.len() != 4 {
                    return Err(DecodeError::Malformed("ping payload must be 4 bytes"));
                }
                let seq = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::Ping { seq })
            }
            TYPE_RECONNECT => {
                if !payload.is_empty() {
                    return Err(DecodeError::Malformed("reconnect frame carries no payload"));
                }
                Ok(Frame::Reconnect)
            }
            _ => Err(DecodeError::Malformed("unknown frame type")),
        }
    }
}

/// Build a Data frame from raw shell output.
#[must_use]
pub fn data_frame(payload: Bytes) -> Frame {
    Frame::Data(payload)
}

/// Build a Disconnect frame with a user-facing reason.
#[must_use]
pub fn disconnect_frame(reason: impl Into<String>) -> Frame {
    Frame::Disconnect {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1024)
    }

    #[test]
    fn roundtrip_all_variants() {
        let frames = [
            Frame::Data(Bytes::from_static(b"ls -la\r")),
            Frame::Data(Bytes::new()),
            Frame::Resize { rows: 24, cols: 80 },
            Frame::Disconnect {
                reason: "authentication failed".to_string(),
            },
            Frame::Ping { seq: 42 },
            Frame::Reconnect,
        ];
        for frame in frames {
            let wire = codec().encode(&frame);
            assert_eq!(codec().decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let codec = FrameCodec::new(8);
        let wire = codec.encode(&Frame::Data(Bytes::from_static(b"0123456789abcdef")));
        assert_eq!(
            codec.decode(&wire),
            Err(DecodeError::Oversized { len: 16, max: 8 })
        );
    }

    #[test]
    fn rejects_short_header() {
        assert!(matches!(
            codec().decode(&[TYPE_DATA, 0, 0]),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(codec().decode(&[]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = [0x7f, 0, 0, 0, 0];
        assert!(matches!(
            codec().decode(&raw),
            Err(DecodeError::Malformed("unknown frame type"))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        // Header claims 10 payload bytes but only 2 follow.
        let raw = [TYPE_DATA, 0, 0, 0, 10, b'h', b'i'];
        assert!(matches!(
            codec().decode(&raw),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_zero_dimensions() {
        let wire = codec().encode(&Frame::Resize { rows: 1, cols: 1 });
        // Patch rows to zero.
        let mut raw = wire.to_vec();
        raw[HEADER_LEN] = 0;
        raw[HEADER_LEN + 1] = 0;
        assert_eq!(
            codec().decode(&raw),
            Err(DecodeError::InvalidDimensions { rows: 0, cols: 1 })
        );
    }

    #[test]
    fn rejects_invalid_disconnect_utf8() {
        let raw = [TYPE_DISCONNECT, 0, 0, 0, 2, 0xff, 0xfe];
        assert!(matches!(
            codec().decode(&raw),
            Err(DecodeError::Malformed("disconnect reason is not UTF-8"))
        ));
    }

    #[test]
    fn decode_is_deterministic() {
        let wire = codec().encode(&Frame::Ping { seq: 7 });
        assert_eq!(codec().decode(&wire), codec().decode(&wire));
    }
}
