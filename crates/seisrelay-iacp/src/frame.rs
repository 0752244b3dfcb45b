//! IACP frame building and parsing.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! "IACP" | frame_seq u32 | payload_type u32 | payload_len u32
//! payload[payload_len]
//! auth_key_id u32 | auth_len u32 | auth[auth_len]
//! ```
//!
//! The auth trailer is carried and surfaced but not verified; every frame
//! ends with at least the eight-byte empty trailer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{IacpError, IacpResult};

/// The four-byte frame signature.
pub const SIGNATURE: [u8; 4] = *b"IACP";
/// Preamble size: signature + sequence + type + length.
pub const PREAMBLE_SIZE: usize = 16;
/// Auth trailer header size: key id + auth length.
pub const AUTH_HEADER_SIZE: usize = 8;
/// Upper bound on a declared payload, guarding the read loop.
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;
/// Upper bound on a declared auth blob.
pub const MAX_AUTH_SIZE: u32 = 4096;

/// First payload type code of the application range.
pub const APP_RANGE_LOW: u32 = 1000;
/// Last payload type code of the application range.
pub const APP_RANGE_HIGH: u32 = 1999;

/// IACP payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// No-op; also kicks off streaming after a request burst.
    Null,
    /// Connection parameter negotiation.
    Handshake,
    /// Fatal or informational condition; carries an [`AlertCode`].
    Alert,
    /// Heartbeat.
    Nop,
    /// The peer does not recognize a requested entity.
    Enosuch,
    /// Application payload, dispatched to the ISI decoder.
    Application(u32),
}

impl PayloadKind {
    /// Maps a raw type code, or reports it unknown.
    pub fn from_raw(raw: u32) -> IacpResult<Self> {
        match raw {
            0 => Ok(Self::Null),
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Alert),
            3 => Ok(Self::Nop),
            4 => Ok(Self::Enosuch),
            APP_RANGE_LOW..=APP_RANGE_HIGH => Ok(Self::Application(raw)),
            other => Err(IacpError::UnknownPayloadType { raw: other }),
        }
    }

    /// The wire type code.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Handshake => 1,
            Self::Alert => 2,
            Self::Nop => 3,
            Self::Enosuch => 4,
            Self::Application(raw) => raw,
        }
    }
}

/// Alert condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AlertCode {
    /// Orderly disconnect.
    Disconnect = 1,
    /// The outstanding request finished.
    RequestComplete = 2,
    /// I/O failure on the peer.
    IoError = 3,
    /// Internal server failure.
    ServerFault = 4,
    /// Server is overloaded.
    ServerBusy = 5,
    /// Authentication failed.
    FailedAuth = 6,
    /// Access denied.
    AccessDenied = 7,
    /// The request was refused.
    RequestDenied = 8,
    /// Server shutting down.
    Shutdown = 9,
    /// Protocol violation detected by the peer.
    ProtocolError = 10,
    /// Malformed data in a request.
    IllegalData = 11,
    /// Unsupported operation.
    Unsupported = 12,
    /// Anything else.
    Other = 13,
}

impl AlertCode {
    /// Maps a raw code; anything undefined collapses to [`AlertCode::Other`].
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Disconnect,
            2 => Self::RequestComplete,
            3 => Self::IoError,
            4 => Self::ServerFault,
            5 => Self::ServerBusy,
            6 => Self::FailedAuth,
            7 => Self::AccessDenied,
            8 => Self::RequestDenied,
            9 => Self::Shutdown,
            10 => Self::ProtocolError,
            11 => Self::IllegalData,
            12 => Self::Unsupported,
            13 => Self::Other,
            other => {
                warn!(raw = other, "undefined alert code, treating as other");
                Self::Other
            }
        }
    }

    /// Codes that end the connection rather than one request.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::RequestComplete)
    }
}

/// One complete IACP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IacpFrame {
    /// Frame sequence number, per-connection monotonic.
    pub seq: u32,
    /// Payload type.
    pub kind: PayloadKind,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Auth key identifier from the trailer.
    pub auth_key_id: u32,
    /// Auth blob from the trailer; read and surfaced, never verified.
    pub auth: Bytes,
}

impl IacpFrame {
    /// Builds a frame with an empty auth trailer.
    pub fn new(seq: u32, kind: PayloadKind, payload: Bytes) -> Self {
        Self {
            seq,
            kind,
            payload,
            auth_key_id: 0,
            auth: Bytes::new(),
        }
    }

    /// Encodes the frame to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            PREAMBLE_SIZE + self.payload.len() + AUTH_HEADER_SIZE + self.auth.len(),
        );
        out.put_slice(&SIGNATURE);
        out.put_u32(self.seq);
        out.put_u32(self.kind.as_raw());
        out.put_u32(self.payload.len() as u32);
        out.put_slice(&self.payload);
        out.put_u32(self.auth_key_id);
        out.put_u32(self.auth.len() as u32);
        out.put_slice(&self.auth);
        out.freeze()
    }

    /// Decodes one complete frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> IacpResult<Self> {
        let (seq, kind, payload_len) = decode_preamble(bytes)?;
        let mut buf = &bytes[PREAMBLE_SIZE..];
        let total = bytes.len();
        if buf.len() < payload_len as usize + AUTH_HEADER_SIZE {
            return Err(IacpError::Truncated {
                needed: PREAMBLE_SIZE + payload_len as usize + AUTH_HEADER_SIZE,
                got: total,
            });
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len as usize]);
        buf.advance(payload_len as usize);
        let auth_key_id = buf.get_u32();
        let auth_len = buf.get_u32();
        if auth_len > MAX_AUTH_SIZE {
            return Err(IacpError::PayloadTooLarge {
                size: auth_len,
                max_size: MAX_AUTH_SIZE,
            });
        }
        if buf.len() < auth_len as usize {
            return Err(IacpError::Truncated {
                needed: total - buf.len() + auth_len as usize,
                got: total,
            });
        }
        let auth = Bytes::copy_from_slice(&buf[..auth_len as usize]);
        Ok(Self {
            seq,
            kind,
            payload,
            auth_key_id,
            auth,
        })
    }
}

/// Parses and validates the 16-byte preamble.
pub fn decode_preamble(bytes: &[u8]) -> IacpResult<(u32, PayloadKind, u32)> {
    let (seq, raw_type, payload_len) = decode_raw_preamble(bytes)?;
    Ok((seq, PayloadKind::from_raw(raw_type)?, payload_len))
}

/// Validates the 16-byte preamble without classifying the payload type, so
/// a socket reader can consume the payload and auth trailer before
/// rejecting an unknown type. Returns the sequence, raw type code and
/// payload length.
pub fn decode_raw_preamble(bytes: &[u8]) -> IacpResult<(u32, u32, u32)> {
    if bytes.len() < PREAMBLE_SIZE {
        return Err(IacpError::Truncated {
            needed: PREAMBLE_SIZE,
            got: bytes.len(),
        });
    }
    let mut sig = [0u8; 4];
    sig.copy_from_slice(&bytes[0..4]);
    if sig != SIGNATURE {
        return Err(IacpError::BadSignature { got: sig });
    }
    let seq = u32::from_be_bytes(bytes[4..8].try_into().unwrap_or_default());
    let raw_type = u32::from_be_bytes(bytes[8..12].try_into().unwrap_or_default());
    let payload_len = u32::from_be_bytes(bytes[12..16].try_into().unwrap_or_default());
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(IacpError::PayloadTooLarge {
            size: payload_len,
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    Ok((seq, raw_type, payload_len))
}

/// Negotiated connection parameters, exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParams {
    /// Client process id, for server-side logging.
    pub pid: u32,
    /// Idle timeout in seconds.
    pub timeout_secs: u32,
    /// Requested socket send-buffer size.
    pub sndbuf: u32,
    /// Requested socket receive-buffer size.
    pub rcvbuf: u32,
}

/// Handshake TLV tags.
const HS_TAG_PID: u32 = 1;
const HS_TAG_TIMEOUT: u32 = 2;
const HS_TAG_SNDBUF: u32 = 3;
const HS_TAG_RCVBUF: u32 = 4;

impl HandshakeParams {
    /// Encodes the parameters as the handshake payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 * 12);
        for (tag, value) in [
            (HS_TAG_PID, self.pid),
            (HS_TAG_TIMEOUT, self.timeout_secs),
            (HS_TAG_SNDBUF, self.sndbuf),
            (HS_TAG_RCVBUF, self.rcvbuf),
        ] {
            out.put_u32(tag);
            out.put_u32(4);
            out.put_u32(value);
        }
        out.freeze()
    }

    /// Decodes a handshake payload. Missing fields keep the values in
    /// `defaults`; unknown tags are skipped by their declared length.
    pub fn decode(payload: &[u8], defaults: HandshakeParams) -> IacpResult<Self> {
        let mut params = defaults;
        let mut buf = payload;
        while buf.len() >= 8 {
            let tag = buf.get_u32();
            let len = buf.get_u32();
            if len as usize > buf.len() {
                return Err(IacpError::TlvOverrun {
                    tag,
                    len,
                    remaining: buf.len(),
                });
            }
            if len != 4 {
                warn!(tag, len, "handshake field with unexpected length, skipping");
                buf.advance(len as usize);
                continue;
            }
            let value = buf.get_u32();
            match tag {
                HS_TAG_PID => params.pid = value,
                HS_TAG_TIMEOUT => params.timeout_secs = value,
                HS_TAG_SNDBUF => params.sndbuf = value,
                HS_TAG_RCVBUF => params.rcvbuf = value,
                other => warn!(tag = other, "unknown handshake field, ignoring"),
            }
        }
        Ok(params)
    }
}

/// Builds an alert payload.
pub fn encode_alert(code: AlertCode) -> Bytes {
    let mut out = BytesMut::with_capacity(4);
    out.put_u32(code as u32);
    out.freeze()
}

/// Parses an alert payload.
pub fn decode_alert(payload: &[u8]) -> IacpResult<AlertCode> {
    if payload.len() < 4 {
        return Err(IacpError::Truncated {
            needed: 4,
            got: payload.len(),
        });
    }
    let raw = u32::from_be_bytes(payload[0..4].try_into().unwrap_or_default());
    Ok(AlertCode::from_raw(raw))
}
