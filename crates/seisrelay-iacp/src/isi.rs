//! ISI payload decoding and request building.
//!
//! ISI rides the IACP application payload range. Each data payload is a
//! sequence of `(tag, len, value)` triples describing one record: site
//! name, sequence number, data description, lengths, then the record
//! bytes. The format is skippable by construction: an unknown tag's
//! declared length locates the next triple.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{IacpError, IacpResult};
use crate::frame::PayloadKind;

/// Terminator tag.
pub const TAG_EOF: u32 = 0;
/// Station/site name, ASCII.
pub const TAG_SITE_NAME: u32 = 1;
/// Sequence number: signature u32 + counter u64.
pub const TAG_SEQNO: u32 = 2;
/// Data description: compression, type, byte order, sample size.
pub const TAG_DATA_DESC: u32 = 3;
/// Bytes of the payload actually used.
pub const TAG_LEN_USED: u32 = 4;
/// Native (uncompressed) length of the payload.
pub const TAG_LEN_NATIVE: u32 = 5;
/// The record bytes themselves.
pub const TAG_PAYLOAD: u32 = 6;
/// Out-of-band status text.
pub const TAG_RAW_STATUS: u32 = 7;

/// Data type code for MiniSEED records.
pub const TYPE_MINISEED: u8 = 18;
/// Data type code for the legacy sub-typed format.
pub const TYPE_LEGACY: u8 = 12;

/// Sequence signature sentinel: start from the oldest record on disk.
pub const SEQ_SIG_OLDEST: u32 = 0xFFFF_FFFE;
/// Sequence signature sentinel: start from the newest record.
pub const SEQ_SIG_NEWEST: u32 = 0xFFFF_FFFD;
/// Sequence signature sentinel: continuous keep-up streaming.
pub const SEQ_SIG_KEEPUP: u32 = 0xFFFF_FFFF;

/// IACP payload type of an ISI data frame.
pub const ISI_DATA: u32 = 1000;
/// IACP payload type of a format request.
pub const ISI_REQ_FORMAT: u32 = 1001;
/// IACP payload type of a compression request.
pub const ISI_REQ_COMPRESS: u32 = 1002;
/// IACP payload type of a sequence-range request.
pub const ISI_REQ_SEQ_RANGE: u32 = 1003;

/// A record's sequence number: 32-bit disk signature plus 64-bit counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqNo {
    /// Disk set signature, or one of the `SEQ_SIG_*` sentinels.
    pub signature: u32,
    /// Record counter within the disk set.
    pub counter: u64,
}

/// Data description accompanying a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDesc {
    /// Compression code.
    pub compression: u8,
    /// Data type code (`TYPE_MINISEED`, `TYPE_LEGACY`, ...).
    pub data_type: u8,
    /// Byte order code.
    pub byte_order: u8,
    /// Bytes per sample.
    pub sample_size: u8,
}

/// One fully assembled ISI record.
#[derive(Debug, Clone, PartialEq)]
pub struct IsiRecord {
    /// Originating site name.
    pub site: String,
    /// Record sequence number.
    pub seqno: SeqNo,
    /// Data description.
    pub desc: DataDesc,
    /// Bytes of the payload in use.
    pub len_used: u32,
    /// Uncompressed length.
    pub len_native: u32,
    /// The record bytes.
    pub payload: Bytes,
}

/// Callbacks for decoded ISI content.
pub trait IsiHandler: Send {
    /// First sequence number seen on this connection, fired exactly once.
    fn on_initial_sequence(&mut self, seqno: SeqNo);
    /// A MiniSEED record (data type 18).
    fn on_miniseed(&mut self, record: IsiRecord);
    /// A legacy-format record (data type 12, itself sub-typed).
    fn on_legacy(&mut self, record: IsiRecord);
    /// Out-of-band status text.
    fn on_raw_status(&mut self, status: &[u8]);
}

/// Accumulates one record's fields as TLVs arrive.
#[derive(Debug, Default)]
struct PartialRecord {
    site: Option<String>,
    seqno: Option<SeqNo>,
    desc: Option<DataDesc>,
    len_used: Option<u32>,
    len_native: Option<u32>,
}

/// Streaming decoder for ISI data payloads.
pub struct IsiDecoder<H: IsiHandler> {
    handler: H,
    partial: PartialRecord,
    initial_fired: bool,
}

impl<H: IsiHandler> IsiDecoder<H> {
    /// Creates a decoder delivering to `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            partial: PartialRecord::default(),
            initial_fired: false,
        }
    }

    /// Gives the handler back, ending the decode.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Decodes one IACP application payload's worth of TLV triples.
    pub fn decode_payload(&mut self, payload: &[u8]) -> IacpResult<()> {
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
            let value = &buf[..len as usize];
            match tag {
                TAG_EOF => return Ok(()),
                TAG_SITE_NAME => {
                    self.partial.site = Some(
                        String::from_utf8_lossy(value)
                            .trim_end_matches('\0')
                            .to_string(),
                    );
                }
                TAG_SEQNO => {
                    let seqno = decode_seqno(tag, value)?;
                    if !self.initial_fired {
                        self.initial_fired = true;
                        debug!(
                            signature = seqno.signature,
                            counter = seqno.counter,
                            "initial sequence"
                        );
                        self.handler.on_initial_sequence(seqno);
                    }
                    self.partial.seqno = Some(seqno);
                }
                TAG_DATA_DESC => {
                    if value.len() < 4 {
                        return Err(IacpError::BadTlvValue {
                            tag,
                            len: value.len(),
                        });
                    }
                    self.partial.desc = Some(DataDesc {
                        compression: value[0],
                        data_type: value[1],
                        byte_order: value[2],
                        sample_size: value[3],
                    });
                }
                TAG_LEN_USED => self.partial.len_used = Some(decode_u32(tag, value)?),
                TAG_LEN_NATIVE => self.partial.len_native = Some(decode_u32(tag, value)?),
                TAG_PAYLOAD => self.dispatch_payload(value),
                TAG_RAW_STATUS => self.handler.on_raw_status(value),
                other => {
                    warn!(tag = other, len, "unknown ISI tag, skipping");
                }
            }
            buf.advance(len as usize);
        }
        Ok(())
    }

    /// Assembles the accumulated fields around the payload bytes and
    /// dispatches by data type.
    fn dispatch_payload(&mut self, value: &[u8]) {
        let desc = self.partial.desc.take().unwrap_or_default();
        let record = IsiRecord {
            site: self.partial.site.take().unwrap_or_default(),
            seqno: self.partial.seqno.take().unwrap_or(SeqNo {
                signature: 0,
                counter: 0,
            }),
            desc,
            len_used: self.partial.len_used.take().unwrap_or(value.len() as u32),
            len_native: self.partial.len_native.take().unwrap_or(value.len() as u32),
            payload: Bytes::copy_from_slice(value),
        };
        match desc.data_type {
            TYPE_MINISEED => self.handler.on_miniseed(record),
            TYPE_LEGACY => self.handler.on_legacy(record),
            other => {
                warn!(data_type = other, "unsupported data type, record dropped");
            }
        }
    }
}

fn decode_seqno(tag: u32, value: &[u8]) -> IacpResult<SeqNo> {
    if value.len() < 12 {
        return Err(IacpError::BadTlvValue {
            tag,
            len: value.len(),
        });
    }
    Ok(SeqNo {
        signature: u32::from_be_bytes(value[0..4].try_into().unwrap_or_default()),
        counter: u64::from_be_bytes(value[4..12].try_into().unwrap_or_default()),
    })
}

fn decode_u32(tag: u32, value: &[u8]) -> IacpResult<u32> {
    if value.len() != 4 {
        return Err(IacpError::BadTlvValue {
            tag,
            len: value.len(),
        });
    }
    Ok(u32::from_be_bytes(value[0..4].try_into().unwrap_or_default()))
}

fn put_tlv(out: &mut BytesMut, tag: u32, value: &[u8]) {
    out.put_u32(tag);
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

/// Encodes a sequence number value.
pub fn encode_seqno(seqno: SeqNo) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&seqno.signature.to_be_bytes());
    out[4..12].copy_from_slice(&seqno.counter.to_be_bytes());
    out
}

/// Encodes one complete record as an ISI data payload, for tests and for
/// a loopback server.
pub fn encode_record(record: &IsiRecord) -> Bytes {
    let mut out = BytesMut::with_capacity(64 + record.payload.len());
    put_tlv(&mut out, TAG_SITE_NAME, record.site.as_bytes());
    put_tlv(&mut out, TAG_SEQNO, &encode_seqno(record.seqno));
    put_tlv(
        &mut out,
        TAG_DATA_DESC,
        &[
            record.desc.compression,
            record.desc.data_type,
            record.desc.byte_order,
            record.desc.sample_size,
        ],
    );
    put_tlv(&mut out, TAG_LEN_USED, &record.len_used.to_be_bytes());
    put_tlv(&mut out, TAG_LEN_NATIVE, &record.len_native.to_be_bytes());
    put_tlv(&mut out, TAG_PAYLOAD, &record.payload);
    put_tlv(&mut out, TAG_EOF, &[]);
    out.freeze()
}

/// The frames of a sequence-range request: format, compression, range,
/// then a `NULL` to kick off streaming. The caller assigns frame
/// sequence numbers and writes them in order.
pub fn seq_request_payloads(
    start: SeqNo,
    end: SeqNo,
    format: u32,
    compression: u32,
) -> Vec<(PayloadKind, Bytes)> {
    let mut range = BytesMut::with_capacity(24);
    range.put_slice(&encode_seqno(start));
    range.put_slice(&encode_seqno(end));
    vec![
        (
            PayloadKind::Application(ISI_REQ_FORMAT),
            Bytes::copy_from_slice(&format.to_be_bytes()),
        ),
        (
            PayloadKind::Application(ISI_REQ_COMPRESS),
            Bytes::copy_from_slice(&compression.to_be_bytes()),
        ),
        (PayloadKind::Application(ISI_REQ_SEQ_RANGE), range.freeze()),
        (PayloadKind::Null, Bytes::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        initial: Vec<SeqNo>,
        miniseed: Vec<IsiRecord>,
        legacy: Vec<IsiRecord>,
        status: Vec<Vec<u8>>,
    }

    impl IsiHandler for Recording {
        fn on_initial_sequence(&mut self, seqno: SeqNo) {
            self.initial.push(seqno);
        }
        fn on_miniseed(&mut self, record: IsiRecord) {
            self.miniseed.push(record);
        }
        fn on_legacy(&mut self, record: IsiRecord) {
            self.legacy.push(record);
        }
        fn on_raw_status(&mut self, status: &[u8]) {
            self.status.push(status.to_vec());
        }
    }

    fn record(counter: u64, data_type: u8) -> IsiRecord {
        IsiRecord {
            site: "anmo".to_string(),
            seqno: SeqNo {
                signature: 0x1234,
                counter,
            },
            desc: DataDesc {
                compression: 0,
                data_type,
                byte_order: 1,
                sample_size: 4,
            },
            len_used: 512,
            len_native: 512,
            payload: Bytes::from(vec![0xAB; 512]),
        }
    }

    #[test]
    fn test_decode_miniseed_record() {
        let mut decoder = IsiDecoder::new(Recording::default());
        let rec = record(41, TYPE_MINISEED);
        decoder.decode_payload(&encode_record(&rec)).unwrap();
        let handler = decoder.into_handler();
        assert_eq!(handler.miniseed, vec![rec]);
        assert!(handler.legacy.is_empty());
    }

    #[test]
    fn test_legacy_record_dispatch() {
        let mut decoder = IsiDecoder::new(Recording::default());
        let rec = record(1, TYPE_LEGACY);
        decoder.decode_payload(&encode_record(&rec)).unwrap();
        let handler = decoder.into_handler();
        assert_eq!(handler.legacy.len(), 1);
        assert!(handler.miniseed.is_empty());
    }

    #[test]
    fn test_initial_sequence_fires_once() {
        let mut decoder = IsiDecoder::new(Recording::default());
        for counter in 10..13 {
            decoder
                .decode_payload(&encode_record(&record(counter, TYPE_MINISEED)))
                .unwrap();
        }
        let handler = decoder.into_handler();
        assert_eq!(handler.initial.len(), 1);
        assert_eq!(handler.initial[0].counter, 10);
        assert_eq!(handler.miniseed.len(), 3);
    }

    #[test]
    fn test_unknown_tag_skipped() {
        let rec = record(5, TYPE_MINISEED);
        let mut payload = BytesMut::new();
        // A vendor tag the decoder has never heard of, before the record.
        put_tlv(&mut payload, 900, b"mystery bytes");
        payload.extend_from_slice(&encode_record(&rec));
        let mut decoder = IsiDecoder::new(Recording::default());
        decoder.decode_payload(&payload).unwrap();
        assert_eq!(decoder.into_handler().miniseed, vec![rec]);
    }

    #[test]
    fn test_overrun_tlv_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u32(TAG_PAYLOAD);
        payload.put_u32(10_000);
        payload.put_slice(b"short");
        let mut decoder = IsiDecoder::new(Recording::default());
        assert!(matches!(
            decoder.decode_payload(&payload),
            Err(IacpError::TlvOverrun { tag: TAG_PAYLOAD, .. })
        ));
    }

    #[test]
    fn test_raw_status() {
        let mut payload = BytesMut::new();
        put_tlv(&mut payload, TAG_RAW_STATUS, b"clock locked");
        put_tlv(&mut payload, TAG_EOF, &[]);
        let mut decoder = IsiDecoder::new(Recording::default());
        decoder.decode_payload(&payload).unwrap();
        assert_eq!(decoder.into_handler().status, vec![b"clock locked".to_vec()]);
    }

    #[test]
    fn test_unsupported_data_type_dropped() {
        let mut decoder = IsiDecoder::new(Recording::default());
        decoder
            .decode_payload(&encode_record(&record(1, 99)))
            .unwrap();
        let handler = decoder.into_handler();
        assert!(handler.miniseed.is_empty());
        assert!(handler.legacy.is_empty());
    }

    #[test]
    fn test_seq_request_payloads() {
        let frames = seq_request_payloads(
            SeqNo {
                signature: SEQ_SIG_OLDEST,
                counter: 0,
            },
            SeqNo {
                signature: SEQ_SIG_KEEPUP,
                counter: u64::MAX,
            },
            1,
            0,
        );
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].0, PayloadKind::Application(ISI_REQ_FORMAT));
        assert_eq!(frames[2].0, PayloadKind::Application(ISI_REQ_SEQ_RANGE));
        assert_eq!(frames[3].0, PayloadKind::Null);
        assert_eq!(frames[2].1.len(), 24);
    }
}
