//! Redo log records.
//!
//! The engine writes an initial log record for the structural actions it
//! performs itself (page reorganize, min-rec mark); page-level operations
//! log themselves as opaque page-op records. Records accumulate in the
//! mini-transaction and are appended to the space log as one segment at
//! commit, each framed with a crc32 of its body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{PageNo, SpaceId};

/// Redo record type: reorganize of an old-format page.
pub const REDO_PAGE_REORGANIZE: u8 = 1;
/// Redo record type: reorganize of a compact-format page.
pub const REDO_COMP_PAGE_REORGANIZE: u8 = 2;
/// Redo record type: min-rec mark on an old-format record.
pub const REDO_REC_MIN_MARK: u8 = 3;
/// Redo record type: min-rec mark on a compact-format record.
pub const REDO_COMP_REC_MIN_MARK: u8 = 4;
/// Redo record type: opaque page-level operation.
pub const REDO_PAGE_OP: u8 = 16;

/// A single redo record, prior to binary framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// Page rebuilt in place; replay re-runs the reorganize primitive.
    PageReorganize {
        /// Tablespace of the page.
        space: SpaceId,
        /// The reorganized page.
        page_no: PageNo,
        /// Whether the page is in compact format (selects the redo type).
        compact: bool,
    },
    /// A record was tagged as the predefined minimum record.
    SetMinRecMark {
        /// Tablespace of the page.
        space: SpaceId,
        /// Page holding the record.
        page_no: PageNo,
        /// Whether the record is in compact format (selects the redo type).
        compact: bool,
        /// Byte offset of the record within the page.
        offset: u16,
    },
    /// Opaque page-level operation logged by the page module.
    PageOp {
        /// Tablespace of the page.
        space: SpaceId,
        /// Mutated page.
        page_no: PageNo,
        /// Operation payload, private to the page module.
        body: Bytes,
    },
}

impl LogRecord {
    /// Redo type byte for this record.
    pub fn type_byte(&self) -> u8 {
        match self {
            LogRecord::PageReorganize { compact: false, .. } => REDO_PAGE_REORGANIZE,
            LogRecord::PageReorganize { compact: true, .. } => REDO_COMP_PAGE_REORGANIZE,
            LogRecord::SetMinRecMark { compact: false, .. } => REDO_REC_MIN_MARK,
            LogRecord::SetMinRecMark { compact: true, .. } => REDO_COMP_REC_MIN_MARK,
            LogRecord::PageOp { .. } => REDO_PAGE_OP,
        }
    }

    fn location(&self) -> (SpaceId, PageNo) {
        match self {
            LogRecord::PageReorganize { space, page_no, .. }
            | LogRecord::SetMinRecMark { space, page_no, .. }
            | LogRecord::PageOp { space, page_no, .. } => (*space, *page_no),
        }
    }

    fn body(&self) -> Bytes {
        match self {
            LogRecord::PageReorganize { .. } => Bytes::new(),
            LogRecord::SetMinRecMark { offset, .. } => {
                Bytes::copy_from_slice(&offset.to_be_bytes())
            }
            LogRecord::PageOp { body, .. } => body.clone(),
        }
    }

    /// Appends the framed record to `out`:
    /// `[type u8][space u32][page u32][len u16][body][crc32 u32]`.
    pub fn encode(&self, out: &mut BytesMut) {
        let (space, page_no) = self.location();
        let body = self.body();
        out.put_u8(self.type_byte());
        out.put_u32(space.0);
        out.put_u32(page_no.0);
        out.put_u16(body.len() as u16);
        out.put_slice(&body);
        out.put_u32(crc32fast::hash(&body));
    }
}

/// Append-only redo stream of one tablespace.
#[derive(Default)]
pub struct RedoLog {
    buf: BytesMut,
    n_records: u64,
}

impl RedoLog {
    /// Appends a committed mini-transaction's records as one segment.
    pub fn append_segment(&mut self, records: &[LogRecord]) {
        for rec in records {
            rec.encode(&mut self.buf);
        }
        self.n_records += records.len() as u64;
    }

    /// Bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of records appended so far.
    pub fn n_records(&self) -> u64 {
        self.n_records
    }
}

/// Decoded frame header of one redo record, as seen by a replay driver.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameHeader<'a> {
    /// Redo type byte.
    pub type_byte: u8,
    /// Tablespace of the mutated page.
    pub space: SpaceId,
    /// The mutated page.
    pub page_no: PageNo,
    /// Record body (past the initial part).
    pub body: &'a [u8],
}

/// Splits one framed record off the front of `buf`. Returns the header
/// and the unconsumed rest, or `None` if the buffer is truncated or the
/// body fails its checksum.
pub fn decode_frame(buf: &[u8]) -> Option<(FrameHeader<'_>, &[u8])> {
    if buf.len() < 11 {
        return None;
    }
    let type_byte = buf[0];
    let space = SpaceId(u32::from_be_bytes(buf[1..5].try_into().unwrap()));
    let page_no = PageNo(u32::from_be_bytes(buf[5..9].try_into().unwrap()));
    let body_len = u16::from_be_bytes(buf[9..11].try_into().unwrap()) as usize;
    let rest = &buf[11..];
    if rest.len() < body_len + 4 {
        return None;
    }
    let body = &rest[..body_len];
    let crc = u32::from_be_bytes(rest[body_len..body_len + 4].try_into().unwrap());
    if crc != crc32fast::hash(body) {
        return None;
    }
    Some((
        FrameHeader {
            type_byte,
            space,
            page_no,
            body,
        },
        &rest[body_len + 4..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let rec = LogRecord::SetMinRecMark {
            space: SpaceId(3),
            page_no: PageNo(11),
            compact: true,
            offset: 0x1234,
        };
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        let (header, rest) = decode_frame(&buf).expect("frame decodes");
        assert_eq!(header.type_byte, REDO_COMP_REC_MIN_MARK);
        assert_eq!(header.space, SpaceId(3));
        assert_eq!(header.page_no, PageNo(11));
        assert_eq!(header.body, &[0x12, 0x34]);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let rec = LogRecord::PageReorganize {
            space: SpaceId(0),
            page_no: PageNo(4),
            compact: false,
        };
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        for cut in 0..buf.len() {
            assert!(decode_frame(&buf[..cut]).is_none());
        }
    }

    #[test]
    fn corrupt_body_fails_checksum() {
        let rec = LogRecord::PageOp {
            space: SpaceId(1),
            page_no: PageNo(2),
            body: Bytes::from_static(b"op"),
        };
        let mut buf = BytesMut::new();
        rec.encode(&mut buf);
        let mut bytes = buf.to_vec();
        bytes[12] ^= 0xff;
        assert!(decode_frame(&bytes).is_none());
    }
}
