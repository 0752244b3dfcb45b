//! CD1.1 frame building and parsing.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! preamble:  frame_type u32 | payload_len u32            (8 bytes)
//! body:      creator[8] | destination[8] | sequence i64  (24 bytes)
//! typed payload (payload_len - 24 bytes)
//! ```
//!
//! Data payloads hold channel subframes; ACKNACK payloads hold the peer's
//! frame set, acked range and gap pairs; ALERT payloads hold a message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use seisrelay_core::Timestamp;

use crate::error::{Cd11Error, Cd11Result};

/// Preamble size: type + payload length.
pub const PREAMBLE_SIZE: usize = 8;
/// Fixed body header size: creator + destination + sequence.
pub const BODY_HEADER_SIZE: usize = 24;
/// Upper bound on a declared payload, guarding the read loop.
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;
/// Fixed wire width of the ACKNACK frame-set field.
pub const FRAME_SET_SIZE: usize = 20;

const TAG_SIZE: usize = 8;

/// CD1.1 frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// Session open request (carries creator/destination only).
    ConnectionRequest = 1,
    /// Session open response.
    ConnectionResponse = 2,
    /// Channel data frame.
    Data = 5,
    /// Acknowledgement with gap report.
    Acknack = 6,
    /// Fatal notification; the session terminates.
    Alert = 7,
}

impl FrameType {
    /// Maps a raw type code, or reports it unknown.
    pub fn from_raw(raw: u32) -> Cd11Result<Self> {
        match raw {
            1 => Ok(Self::ConnectionRequest),
            2 => Ok(Self::ConnectionResponse),
            5 => Ok(Self::Data),
            6 => Ok(Self::Acknack),
            7 => Ok(Self::Alert),
            other => Err(Cd11Error::UnknownFrameType { raw: other }),
        }
    }
}

/// One channel's contribution to a data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSubframe {
    /// Full channel name after renaming (`NET.STA.LOC.CHA`).
    pub name: String,
    /// Time of the first sample.
    pub start: Timestamp,
    /// Sample rate in Hz.
    pub rate: f64,
    /// The samples covering the frame window.
    pub samples: Vec<i32>,
}

/// ACKNACK payload: the peer's view of received sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBody {
    /// Identifier of the frame set being acknowledged.
    pub frame_set: String,
    /// Lowest acknowledged sequence.
    pub low_acked: i64,
    /// Highest acknowledged sequence.
    pub high_acked: i64,
    /// Missing ranges inside `[low_acked, high_acked]`, inclusive pairs.
    pub gap_pairs: Vec<(i64, i64)>,
}

/// Typed frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Session open request.
    ConnectionRequest,
    /// Session open response.
    ConnectionResponse,
    /// Channel data.
    Data(Vec<ChannelSubframe>),
    /// Acknowledgement with gap report.
    Acknack(AckBody),
    /// Fatal notification.
    Alert {
        /// Alert message text.
        message: String,
    },
}

impl FrameBody {
    /// The wire type code for this payload.
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::ConnectionRequest => FrameType::ConnectionRequest,
            FrameBody::ConnectionResponse => FrameType::ConnectionResponse,
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Acknack(_) => FrameType::Acknack,
            FrameBody::Alert { .. } => FrameType::Alert,
        }
    }
}

/// A complete CD1.1 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Creator tag (at most 8 ASCII bytes).
    pub creator: String,
    /// Destination tag (at most 8 ASCII bytes).
    pub destination: String,
    /// Frame sequence number.
    pub sequence: i64,
    /// Typed payload.
    pub body: FrameBody,
}

impl Frame {
    /// Encodes the frame to wire bytes.
    pub fn encode(&self) -> Cd11Result<Bytes> {
        let mut payload = BytesMut::with_capacity(256);
        put_tag(&mut payload, "creator", &self.creator)?;
        put_tag(&mut payload, "destination", &self.destination)?;
        payload.put_i64(self.sequence);

        match &self.body {
            FrameBody::ConnectionRequest | FrameBody::ConnectionResponse => {}
            FrameBody::Data(subframes) => {
                payload.put_u32(subframes.len() as u32);
                for sub in subframes {
                    if sub.name.len() > u8::MAX as usize {
                        return Err(Cd11Error::FieldTooLong {
                            field: "channel name",
                            len: sub.name.len(),
                            max: u8::MAX as usize,
                        });
                    }
                    payload.put_u8(sub.name.len() as u8);
                    payload.put_slice(sub.name.as_bytes());
                    payload.put_i64(sub.start.as_micros());
                    payload.put_f64(sub.rate);
                    payload.put_u32(sub.samples.len() as u32);
                    for &s in &sub.samples {
                        payload.put_i32(s);
                    }
                }
            }
            FrameBody::Acknack(ack) => {
                if ack.frame_set.len() > FRAME_SET_SIZE {
                    return Err(Cd11Error::FieldTooLong {
                        field: "frame_set",
                        len: ack.frame_set.len(),
                        max: FRAME_SET_SIZE,
                    });
                }
                let mut set = [0u8; FRAME_SET_SIZE];
                set[..ack.frame_set.len()].copy_from_slice(ack.frame_set.as_bytes());
                payload.put_slice(&set);
                payload.put_i64(ack.low_acked);
                payload.put_i64(ack.high_acked);
                payload.put_u32(ack.gap_pairs.len() as u32);
                for &(low, high) in &ack.gap_pairs {
                    payload.put_i64(low);
                    payload.put_i64(high);
                }
            }
            FrameBody::Alert { message } => {
                payload.put_slice(message.as_bytes());
            }
        }

        let mut out = BytesMut::with_capacity(PREAMBLE_SIZE + payload.len());
        out.put_u32(self.body.frame_type() as u32);
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(&payload);
        Ok(out.freeze())
    }

    /// Decodes a complete frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> Cd11Result<Self> {
        let (frame_type, payload_len) = decode_preamble(bytes)?;
        let needed = PREAMBLE_SIZE + payload_len as usize;
        if bytes.len() < needed {
            return Err(Cd11Error::Truncated {
                needed,
                got: bytes.len(),
            });
        }
        Self::decode_body(frame_type, &bytes[PREAMBLE_SIZE..needed])
    }

    /// Decodes the body after the preamble has been read separately.
    pub fn decode_body(frame_type: FrameType, payload: &[u8]) -> Cd11Result<Self> {
        let mut buf = payload;
        need(&buf, BODY_HEADER_SIZE, payload.len())?;
        let creator = get_tag(&mut buf);
        let destination = get_tag(&mut buf);
        let sequence = buf.get_i64();

        let body = match frame_type {
            FrameType::ConnectionRequest => FrameBody::ConnectionRequest,
            FrameType::ConnectionResponse => FrameBody::ConnectionResponse,
            FrameType::Data => {
                need(&buf, 4, payload.len())?;
                let count = buf.get_u32() as usize;
                let mut subframes = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    need(&buf, 1, payload.len())?;
                    let name_len = buf.get_u8() as usize;
                    need(&buf, name_len + 20, payload.len())?;
                    let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
                    buf.advance(name_len);
                    let start = Timestamp::from_micros(buf.get_i64());
                    let rate = buf.get_f64();
                    let sample_count = buf.get_u32() as usize;
                    need(&buf, sample_count * 4, payload.len())?;
                    let mut samples = Vec::with_capacity(sample_count);
                    for _ in 0..sample_count {
                        samples.push(buf.get_i32());
                    }
                    subframes.push(ChannelSubframe {
                        name,
                        start,
                        rate,
                        samples,
                    });
                }
                FrameBody::Data(subframes)
            }
            FrameType::Acknack => {
                need(&buf, FRAME_SET_SIZE + 20, payload.len())?;
                let frame_set = String::from_utf8_lossy(&buf[..FRAME_SET_SIZE])
                    .trim_end_matches('\0')
                    .to_string();
                buf.advance(FRAME_SET_SIZE);
                let low_acked = buf.get_i64();
                let high_acked = buf.get_i64();
                let gap_count = buf.get_u32() as usize;
                need(&buf, gap_count * 16, payload.len())?;
                let mut gap_pairs = Vec::with_capacity(gap_count);
                for _ in 0..gap_count {
                    let low = buf.get_i64();
                    let high = buf.get_i64();
                    gap_pairs.push((low, high));
                }
                FrameBody::Acknack(AckBody {
                    frame_set,
                    low_acked,
                    high_acked,
                    gap_pairs,
                })
            }
            FrameType::Alert => FrameBody::Alert {
                message: String::from_utf8_lossy(buf).into_owned(),
            },
        };

        Ok(Self {
            creator,
            destination,
            sequence,
            body,
        })
    }
}

/// Parses and validates the 8-byte preamble.
pub fn decode_preamble(bytes: &[u8]) -> Cd11Result<(FrameType, u32)> {
    let (raw_type, payload_len) = decode_raw_preamble(bytes)?;
    Ok((FrameType::from_raw(raw_type)?, payload_len))
}

/// Validates the 8-byte preamble without classifying the frame type, so a
/// socket reader can consume the declared payload before rejecting an
/// unknown type. Returns the raw type code and the payload length.
pub fn decode_raw_preamble(bytes: &[u8]) -> Cd11Result<(u32, u32)> {
    if bytes.len() < PREAMBLE_SIZE {
        return Err(Cd11Error::Truncated {
            needed: PREAMBLE_SIZE,
            got: bytes.len(),
        });
    }
    let raw_type = u32::from_be_bytes(bytes[0..4].try_into().unwrap_or_default());
    let payload_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap_or_default());
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Cd11Error::PayloadTooLarge {
            size: payload_len,
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    if (payload_len as usize) < BODY_HEADER_SIZE {
        return Err(Cd11Error::Truncated {
            needed: BODY_HEADER_SIZE,
            got: payload_len as usize,
        });
    }
    Ok((raw_type, payload_len))
}

fn need(buf: &&[u8], bytes: usize, total: usize) -> Cd11Result<()> {
    if buf.len() < bytes {
        Err(Cd11Error::Truncated {
            needed: total - buf.len() + bytes,
            got: total,
        })
    } else {
        Ok(())
    }
}

fn put_tag(payload: &mut BytesMut, field: &'static str, value: &str) -> Cd11Result<()> {
    if value.len() > TAG_SIZE {
        return Err(Cd11Error::FieldTooLong {
            field,
            len: value.len(),
            max: TAG_SIZE,
        });
    }
    let mut tag = [0u8; TAG_SIZE];
    tag[..value.len()].copy_from_slice(value.as_bytes());
    payload.put_slice(&tag);
    Ok(())
}

fn get_tag(buf: &mut &[u8]) -> String {
    let tag = String::from_utf8_lossy(&buf[..TAG_SIZE])
        .trim_end_matches('\0')
        .to_string();
    buf.advance(TAG_SIZE);
    tag
}
