//! Record layout.
//!
//! Converts between logical tuples and the physical record bytes stored
//! on index pages, in one of two per-tree formats. The format is a fixed
//! binary choice captured once per index and threaded through every
//! operation; records themselves are not polymorphic.
//!
//! A record is a sequence of fields. On leaf pages the fields are the
//! indexed payload; on non-leaf pages a record is a node pointer: the key
//! prefix of the child's first record plus the child page number in the
//! trailing 4-byte field. A record whose min-rec flag is set sorts below
//! every other record and tags the leftmost subtree of a level.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::error::{BasaltError, Result};
use crate::types::PageNo;

/// Physical record format of a tree.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordFormat {
    /// Compact format: `[info][n_fields][len u16 per field][bytes]`.
    Compact,
    /// Old format: `[n_fields][info][end offset u16 per field][bytes]`.
    Redundant,
}

/// Min-rec bit within the info byte of a compact record.
pub const REC_INFO_MIN_REC_COMPACT: u8 = 0x08;
/// Min-rec bit within the info byte of an old-format record.
pub const REC_INFO_MIN_REC_REDUNDANT: u8 = 0x10;

/// Maximum number of fields a record may carry.
pub const REC_MAX_FIELDS: usize = 255;

/// Width of the child page number field of a node pointer.
pub const REC_NODE_PTR_SIZE: usize = 4;

/// A logical tuple: ordered fields plus the min-rec info flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tuple {
    /// Whether the record acts as the predefined minimum on its level.
    pub min_rec: bool,
    /// How many leading fields participate in comparisons; `None` means
    /// all of them. Node pointers compare on the key prefix only.
    pub n_cmp: Option<usize>,
    /// Field values in index order.
    pub fields: SmallVec<[Vec<u8>; 4]>,
}

impl Tuple {
    /// Builds a tuple from plain fields.
    pub fn from_fields<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Vec<u8>>,
    {
        Self {
            min_rec: false,
            n_cmp: None,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of leading fields this tuple compares on.
    pub fn cmp_fields(&self) -> usize {
        self.n_cmp.unwrap_or(self.fields.len())
    }

    /// Encoded size of this tuple in `format`.
    pub fn converted_size(&self, format: RecordFormat) -> usize {
        let _ = format;
        2 + 2 * self.fields.len() + self.fields.iter().map(Vec::len).sum::<usize>()
    }

    /// Encodes the tuple into record bytes.
    pub fn convert_to_rec(&self, format: RecordFormat) -> Vec<u8> {
        assert!(self.fields.len() <= REC_MAX_FIELDS, "too many fields");
        let mut out = Vec::with_capacity(self.converted_size(format));
        let info = if self.min_rec {
            min_rec_bit(format)
        } else {
            0
        };
        match format {
            RecordFormat::Compact => {
                out.push(info);
                out.push(self.fields.len() as u8);
                for field in &self.fields {
                    out.extend_from_slice(&(field.len() as u16).to_be_bytes());
                }
            }
            RecordFormat::Redundant => {
                out.push(self.fields.len() as u8);
                out.push(info);
                let mut end = 0u16;
                for field in &self.fields {
                    end += field.len() as u16;
                    out.extend_from_slice(&end.to_be_bytes());
                }
            }
        }
        for field in &self.fields {
            out.extend_from_slice(field);
        }
        out
    }
}

/// Min-rec flag bit for `format`.
pub fn min_rec_bit(format: RecordFormat) -> u8 {
    match format {
        RecordFormat::Compact => REC_INFO_MIN_REC_COMPACT,
        RecordFormat::Redundant => REC_INFO_MIN_REC_REDUNDANT,
    }
}

/// Byte offset of the info byte within a record of `format`.
pub fn info_byte_offset(format: RecordFormat) -> usize {
    match format {
        RecordFormat::Compact => 0,
        RecordFormat::Redundant => 1,
    }
}

/// A decoded view over record bytes.
#[derive(Debug)]
pub struct RecView<'a> {
    format: RecordFormat,
    info: u8,
    n_fields: usize,
    /// (start, end) of each field within `bytes`.
    bounds: SmallVec<[(usize, usize); 4]>,
    bytes: &'a [u8],
}

impl<'a> RecView<'a> {
    /// Decodes `bytes` as one record in `format`.
    pub fn decode(bytes: &'a [u8], format: RecordFormat) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(BasaltError::Corruption("record shorter than its header"));
        }
        let (info, n_fields) = match format {
            RecordFormat::Compact => (bytes[0], bytes[1] as usize),
            RecordFormat::Redundant => (bytes[1], bytes[0] as usize),
        };
        let lens_end = 2 + 2 * n_fields;
        if bytes.len() < lens_end {
            return Err(BasaltError::Corruption("record field table truncated"));
        }
        let mut bounds = SmallVec::with_capacity(n_fields);
        let mut start = lens_end;
        let mut prev_end = 0usize;
        for i in 0..n_fields {
            let raw = u16::from_be_bytes(bytes[2 + 2 * i..4 + 2 * i].try_into().unwrap()) as usize;
            let len = match format {
                RecordFormat::Compact => raw,
                RecordFormat::Redundant => {
                    let len = raw
                        .checked_sub(prev_end)
                        .ok_or(BasaltError::Corruption("record end offsets not ascending"))?;
                    prev_end = raw;
                    len
                }
            };
            let end = start + len;
            if end > bytes.len() {
                return Err(BasaltError::Corruption("record field exceeds record"));
            }
            bounds.push((start, end));
            start = end;
        }
        Ok(Self {
            format,
            info,
            n_fields,
            bounds,
            bytes,
        })
    }

    /// Number of fields.
    pub fn n_fields(&self) -> usize {
        self.n_fields
    }

    /// The `i`th field.
    pub fn field(&self, i: usize) -> &'a [u8] {
        let (start, end) = self.bounds[i];
        &self.bytes[start..end]
    }

    /// Byte length of the `i`th field.
    pub fn field_len(&self, i: usize) -> usize {
        let (start, end) = self.bounds[i];
        end - start
    }

    /// Whether the min-rec flag is set.
    pub fn is_min_rec(&self) -> bool {
        self.info & min_rec_bit(self.format) != 0
    }

    /// Total encoded size, including the header.
    pub fn encoded_size(&self) -> usize {
        self.bounds.last().map(|&(_, end)| end).unwrap_or(2)
    }

    /// Child page number stored in the trailing field of a node pointer.
    pub fn node_ptr_child(&self) -> Result<PageNo> {
        let field = self
            .bounds
            .last()
            .map(|&(start, end)| &self.bytes[start..end])
            .ok_or(BasaltError::Corruption("node pointer without fields"))?;
        if field.len() != REC_NODE_PTR_SIZE {
            return Err(BasaltError::Corruption("node pointer child field width"));
        }
        Ok(PageNo(u32::from_be_bytes(field.try_into().unwrap())))
    }

    /// Rebuilds the logical tuple (copies the fields out).
    pub fn to_tuple(&self) -> Tuple {
        Tuple {
            min_rec: self.is_min_rec(),
            n_cmp: None,
            fields: (0..self.n_fields)
                .map(|i| self.field(i).to_vec())
                .collect(),
        }
    }
}

/// Compares a tuple against record bytes over at most `n_cmp` leading
/// fields. A min-rec-flagged side sorts below everything; an exhausted
/// common prefix compares equal (node-pointer prefix semantics).
pub fn cmp_tuple_rec(tuple: &Tuple, rec: &RecView<'_>, n_cmp: usize) -> Ordering {
    match (tuple.min_rec, rec.is_min_rec()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let n = n_cmp.min(tuple.fields.len()).min(rec.n_fields());
    for i in 0..n {
        match tuple.fields[i].as_slice().cmp(rec.field(i)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compares two records over at most `n_cmp` leading fields, with the
/// same min-rec handling as [`cmp_tuple_rec`].
pub fn cmp_rec_rec(a: &RecView<'_>, b: &RecView<'_>, n_cmp: usize) -> Ordering {
    match (a.is_min_rec(), b.is_min_rec()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let n = n_cmp.min(a.n_fields()).min(b.n_fields());
    for i in 0..n {
        match a.field(i).cmp(b.field(i)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Builds the node pointer for `child`: the first `n_uniq` fields of the
/// child's first record plus the child page number as the trailing
/// field. The min-rec flag carries over, so pointers built from the
/// leftmost record of an interior level keep comparing as the minimum.
pub fn build_node_ptr(first_rec: &RecView<'_>, n_uniq: usize, child: PageNo) -> Tuple {
    let n_key = n_uniq.min(first_rec.n_fields());
    let mut fields: SmallVec<[Vec<u8>; 4]> = (0..n_key)
        .map(|i| first_rec.field(i).to_vec())
        .collect();
    fields.push(child.0.to_be_bytes().to_vec());
    Tuple {
        min_rec: first_rec.is_min_rec(),
        n_cmp: Some(n_key),
        fields,
    }
}
