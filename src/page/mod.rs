//! Page-level operations.
//!
//! An index page is a slotted container: a fixed header, a record heap
//! growing upward from [`PAGE_DATA`], and a slot directory growing
//! downward from the page end with one 2-byte entry per user record, in
//! key order. The infimum and supremum pseudo-records that delimit the
//! user records are positional, not materialized.
//!
//! Deletes detach the slot and account the record bytes as garbage; the
//! bytes are reclaimed by a reorganize. Free-space arithmetic therefore
//! distinguishes `max_insert_size` (without reorganize) from
//! `max_insert_size_after_reorganize`.
//!
//! Every mutating operation logs itself through the mini-transaction as
//! an opaque page-op record, unless logging is disabled.

pub mod zip;

use bytes::{BufMut, BytesMut};
use tracing::error;

use crate::buf::{BlockRef, Space};
use crate::log::LogRecord;
use crate::mtr::{LatchMode, Mtr};
use crate::record::{cmp_rec_rec, cmp_tuple_rec, RecView, RecordFormat, Tuple};
use crate::types::{PageNo, FIL_NULL};

/// Byte offsets of the fixed page header fields.
pub mod header {
    use core::ops::Range;

    /// Previous page on the same level.
    pub const PREV: Range<usize> = 0..4;
    /// Next page on the same level.
    pub const NEXT: Range<usize> = 4..8;
    /// Level of the page; 0 is the leaf level.
    pub const LEVEL: Range<usize> = 8..10;
    /// Id of the index the page belongs to.
    pub const INDEX_ID: Range<usize> = 10..18;
    /// Number of user records.
    pub const N_RECS: Range<usize> = 18..20;
    /// Heap offset of the last inserted record; 0 when unknown.
    pub const LAST_INSERT: Range<usize> = 20..22;
    /// First free heap byte.
    pub const HEAP_TOP: Range<usize> = 22..24;
    /// Bytes occupied by deleted records.
    pub const GARBAGE: Range<usize> = 24..26;
    /// Format flags byte.
    pub const FLAGS: usize = 26;
    /// Leaf segment header (8 bytes, root page only).
    pub const SEG_LEAF: usize = 28;
    /// Non-leaf segment header (8 bytes, root or ibuf header page).
    pub const SEG_TOP: usize = 36;
    /// Next page in the ibuf free list (list nodes).
    pub const IBUF_FREE_NEXT: Range<usize> = 44..48;
    /// First page of the ibuf free list (root page only).
    pub const IBUF_FREE_FIRST: Range<usize> = 48..52;
    /// Length of the ibuf free list (root page only).
    pub const IBUF_FREE_LEN: Range<usize> = 52..56;
}

/// First heap byte; everything below is the fixed header.
pub const PAGE_DATA: usize = 64;
/// Size of one slot directory entry.
pub const SLOT_LEN: usize = 2;
/// Flags bit: page stores compact-format records.
pub const FLAG_COMPACT: u8 = 0x01;

const OP_CREATE: u8 = 1;
const OP_SET_PREV: u8 = 2;
const OP_SET_NEXT: u8 = 3;
const OP_SET_LEVEL: u8 = 4;
const OP_SET_INDEX_ID: u8 = 5;
const OP_INSERT: u8 = 6;
const OP_DELETE: u8 = 7;
const OP_DELETE_LIST: u8 = 8;
const OP_COPY_LIST: u8 = 9;
const OP_SEG_HEADER: u8 = 10;
const OP_IBUF_LIST: u8 = 11;
const OP_SET_CHILD: u8 = 12;

/// A position on a page: before all user records, on one of them, or
/// after all of them.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PagePos {
    /// Before the first user record.
    Infimum,
    /// On the user record in the given slot.
    Rec(u16),
    /// After the last user record.
    Supremum,
}

impl PagePos {
    /// Whether this position is on a user record.
    pub fn is_user_rec(self) -> bool {
        matches!(self, PagePos::Rec(_))
    }

    /// Slot index a record inserted after this position lands on.
    pub fn insert_index(self) -> u16 {
        match self {
            PagePos::Infimum => 0,
            PagePos::Rec(i) => i + 1,
            PagePos::Supremum => panic!("insert after supremum"),
        }
    }
}

fn read_u16(data: &[u8], range: core::ops::Range<usize>) -> u16 {
    u16::from_be_bytes(data[range].try_into().unwrap())
}

fn read_u32(data: &[u8], range: core::ops::Range<usize>) -> u32 {
    u32::from_be_bytes(data[range].try_into().unwrap())
}

fn write_u16(data: &mut [u8], range: core::ops::Range<usize>, v: u16) {
    data[range].copy_from_slice(&v.to_be_bytes());
}

fn write_u32(data: &mut [u8], range: core::ops::Range<usize>, v: u32) {
    data[range].copy_from_slice(&v.to_be_bytes());
}

fn slot_off(page_size: usize, idx: u16) -> usize {
    page_size - SLOT_LEN * (idx as usize + 1)
}

fn get_slot(data: &[u8], idx: u16) -> u16 {
    let off = slot_off(data.len(), idx);
    u16::from_be_bytes(data[off..off + SLOT_LEN].try_into().unwrap())
}

fn set_slot(data: &mut [u8], idx: u16, v: u16) {
    let off = slot_off(data.len(), idx);
    data[off..off + SLOT_LEN].copy_from_slice(&v.to_be_bytes());
}

fn insert_slot(data: &mut [u8], n_recs: u16, idx: u16, v: u16) {
    let mut j = n_recs;
    while j > idx {
        let prev = get_slot(data, j - 1);
        set_slot(data, j, prev);
        j -= 1;
    }
    set_slot(data, idx, v);
}

fn remove_slot(data: &mut [u8], n_recs: u16, idx: u16) {
    for j in idx..n_recs - 1 {
        let next = get_slot(data, j + 1);
        set_slot(data, j, next);
    }
}

fn log_op(block: &BlockRef, mtr: &mut Mtr, tag: u8, args: &[u8]) {
    let mut body = BytesMut::with_capacity(1 + args.len());
    body.put_u8(tag);
    body.put_slice(args);
    mtr.log(LogRecord::PageOp {
        space: block.space_id(),
        page_no: block.page_no(),
        body: body.freeze(),
    });
}

/// Initializes the record structure of a page, preserving the global
/// header fields (siblings, level, index id, segment headers, ibuf
/// list). Used both for fresh pages and for rebuilds.
pub fn page_create(block: &BlockRef, compact: bool, mtr: &mut Mtr) {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        write_u16(data, header::N_RECS.clone(), 0);
        write_u16(data, header::LAST_INSERT.clone(), 0);
        write_u16(data, header::HEAP_TOP.clone(), PAGE_DATA as u16);
        write_u16(data, header::GARBAGE.clone(), 0);
        let flags = if compact { FLAG_COMPACT } else { 0 };
        data[header::FLAGS] = flags;
    }
    log_op(block, mtr, OP_CREATE, &[compact as u8]);
}

/// [`page_create`] for a compressed page; the freshly emptied page must
/// always compress.
pub fn page_create_zip(block: &BlockRef, compact: bool, level: u16, mtr: &mut Mtr) {
    page_create(block, compact, mtr);
    page_set_level(block, level, mtr);
    assert!(
        page_zip_compress(block),
        "an empty page must fit its compressed image"
    );
}

/// Previous page on the level.
pub fn page_prev(block: &BlockRef) -> PageNo {
    PageNo(read_u32(&block.frame().read().data, header::PREV.clone()))
}

/// Next page on the level.
pub fn page_next(block: &BlockRef) -> PageNo {
    PageNo(read_u32(&block.frame().read().data, header::NEXT.clone()))
}

/// Level of the page.
pub fn page_level(block: &BlockRef) -> u16 {
    read_u16(&block.frame().read().data, header::LEVEL.clone())
}

/// Whether the page is a leaf.
pub fn page_is_leaf(block: &BlockRef) -> bool {
    page_level(block) == 0
}

/// Index id stamped on the page.
pub fn page_index_id(block: &BlockRef) -> u64 {
    u64::from_be_bytes(
        block.frame().read().data[header::INDEX_ID.clone()]
            .try_into()
            .unwrap(),
    )
}

/// Whether the page stores compact-format records.
pub fn page_is_comp(block: &BlockRef) -> bool {
    block.frame().read().data[header::FLAGS] & FLAG_COMPACT != 0
}

/// Number of user records.
pub fn page_n_recs(block: &BlockRef) -> u16 {
    read_u16(&block.frame().read().data, header::N_RECS.clone())
}

/// Heap offset of the last inserted record, if any insert happened since
/// the last delete.
pub fn page_last_insert(block: &BlockRef) -> Option<u16> {
    match read_u16(&block.frame().read().data, header::LAST_INSERT.clone()) {
        0 => None,
        off => Some(off),
    }
}

/// Sets the previous-page link.
pub fn page_set_prev(block: &BlockRef, prev: PageNo, mtr: &mut Mtr) {
    write_u32(
        &mut block.frame().write().data,
        header::PREV.clone(),
        prev.0,
    );
    log_op(block, mtr, OP_SET_PREV, &prev.0.to_be_bytes());
}

/// Sets the previous-page link without logging. Only used while a
/// compressed right-merge temporarily needs `prev == FIL_NULL`; the
/// caller restores the field within the same mini-transaction.
pub fn page_set_prev_no_log(block: &BlockRef, prev: PageNo) {
    write_u32(
        &mut block.frame().write().data,
        header::PREV.clone(),
        prev.0,
    );
}

/// Sets the next-page link.
pub fn page_set_next(block: &BlockRef, next: PageNo, mtr: &mut Mtr) {
    write_u32(
        &mut block.frame().write().data,
        header::NEXT.clone(),
        next.0,
    );
    log_op(block, mtr, OP_SET_NEXT, &next.0.to_be_bytes());
}

/// Sets the page level.
pub fn page_set_level(block: &BlockRef, level: u16, mtr: &mut Mtr) {
    write_u16(
        &mut block.frame().write().data,
        header::LEVEL.clone(),
        level,
    );
    log_op(block, mtr, OP_SET_LEVEL, &level.to_be_bytes());
}

/// Stamps the index id.
pub fn page_set_index_id(block: &BlockRef, id: u64, mtr: &mut Mtr) {
    block.frame().write().data[header::INDEX_ID.clone()].copy_from_slice(&id.to_be_bytes());
    log_op(block, mtr, OP_SET_INDEX_ID, &id.to_be_bytes());
}

/// Reads a segment header (the segment id) at `offset`.
pub fn read_seg_header(block: &BlockRef, offset: usize) -> u64 {
    u64::from_be_bytes(
        block.frame().read().data[offset..offset + 8]
            .try_into()
            .unwrap(),
    )
}

/// Writes a segment header at `offset`.
pub fn write_seg_header(block: &BlockRef, offset: usize, seg_id: u64, mtr: &mut Mtr) {
    block.frame().write().data[offset..offset + 8].copy_from_slice(&seg_id.to_be_bytes());
    log_op(block, mtr, OP_SEG_HEADER, &seg_id.to_be_bytes());
}

/// Reserved directory space for `n` records.
pub fn dir_reserve(n: usize) -> usize {
    n * SLOT_LEN
}

/// Free space of an empty page (data plus directory capacity).
pub fn free_space_of_empty(page_size: usize) -> usize {
    page_size - PAGE_DATA
}

/// Sum of the live record sizes.
pub fn page_data_size(block: &BlockRef) -> usize {
    let frame = block.frame().read();
    let data = &frame.data;
    let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
    let garbage = read_u16(data, header::GARBAGE.clone()) as usize;
    heap_top - PAGE_DATA - garbage
}

/// Largest combined record size `n_new` inserts can add without a
/// reorganize.
pub fn page_max_insert_size(block: &BlockRef, n_new: usize) -> usize {
    let frame = block.frame().read();
    let data = &frame.data;
    let n_recs = read_u16(data, header::N_RECS.clone()) as usize;
    let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
    let dir_floor = data.len() - dir_reserve(n_recs + n_new);
    dir_floor.saturating_sub(heap_top)
}

/// Largest combined record size `n_new` inserts can add after a
/// reorganize reclaims the garbage.
pub fn page_max_insert_size_after_reorganize(block: &BlockRef, n_new: usize) -> usize {
    let data_size = page_data_size(block);
    let n_recs = page_n_recs(block) as usize;
    let page_size = block.frame().read().data.len();
    free_space_of_empty(page_size)
        .saturating_sub(data_size)
        .saturating_sub(dir_reserve(n_recs + n_new))
}

/// Heap offset of the record in `slot`.
pub fn rec_offset(block: &BlockRef, slot: u16) -> u16 {
    get_slot(&block.frame().read().data, slot)
}

/// Slot currently holding the record that starts at `offset`, if any.
pub fn rec_slot_at_offset(block: &BlockRef, offset: u16) -> Option<u16> {
    let frame = block.frame().read();
    let data = &frame.data;
    let n = read_u16(data, header::N_RECS.clone());
    (0..n).find(|&i| get_slot(data, i) == offset)
}

fn rec_bytes_at(data: &[u8], off: usize, format: RecordFormat) -> Vec<u8> {
    let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
    let view = RecView::decode(&data[off..heap_top], format)
        .unwrap_or_else(|err| panic!("record decode at offset {off}: {err}"));
    data[off..off + view.encoded_size()].to_vec()
}

/// Copies out the encoded bytes of the record in `slot`.
pub fn rec_bytes(block: &BlockRef, format: RecordFormat, slot: u16) -> Vec<u8> {
    let frame = block.frame().read();
    let data = &frame.data;
    let off = get_slot(data, slot) as usize;
    rec_bytes_at(data, off, format)
}

/// Slot of the middle user record (first record of the upper half).
pub fn page_middle_slot(block: &BlockRef) -> u16 {
    page_n_recs(block) / 2
}

/// Positions on the greatest user record that compares `<=` the tuple
/// (`PAGE_CUR_LE`); `Infimum` when every record is greater.
pub fn page_cur_search(block: &BlockRef, format: RecordFormat, tuple: &Tuple) -> PagePos {
    let frame = block.frame().read();
    let data = &frame.data;
    let n = read_u16(data, header::N_RECS.clone());
    let n_cmp = tuple.cmp_fields();
    let mut lo = 0u16;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let off = get_slot(data, mid) as usize;
        let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
        let view = RecView::decode(&data[off..heap_top], format)
            .unwrap_or_else(|err| panic!("record decode in search: {err}"));
        if cmp_tuple_rec(tuple, &view, n_cmp) == core::cmp::Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    if lo == 0 {
        PagePos::Infimum
    } else {
        PagePos::Rec(lo - 1)
    }
}

struct ZipUndo {
    data: Vec<u8>,
}

fn zip_undo_point(block: &BlockRef) -> Option<ZipUndo> {
    let frame = block.frame().read();
    frame.zip.as_ref().map(|_| ZipUndo {
        data: frame.data.clone(),
    })
}

/// Recompresses the record region of the frame into its compressed
/// image. The fixed header stays uncompressed next to the image, so
/// sibling-link and segment-header updates never touch it. `true` when
/// the page has no image or the image was updated.
pub fn page_zip_compress(block: &BlockRef) -> bool {
    let mut frame = block.frame().write();
    let frame = &mut *frame;
    match frame.zip.as_mut() {
        None => true,
        Some(zip) => zip.compress(&frame.data[PAGE_DATA..]),
    }
}

/// Whether the page carries a compressed image.
pub fn page_has_zip(block: &BlockRef) -> bool {
    block.frame().read().zip.is_some()
}

/// Copies the record content of `src` to `dst` byte for byte,
/// compressed image included. `dst` keeps its own position in the tree:
/// sibling links, level, index id, segment headers and ibuf list fields
/// are preserved. Until the caller's follow-up deletes recompress it,
/// the copied image describes the source page; that inconsistency stays
/// inside the mini-transaction.
pub fn page_zip_copy(dst: &BlockRef, src: &BlockRef, mtr: &mut Mtr) {
    {
        let src_frame = src.frame().read();
        let mut dst_frame = dst.frame().write();
        let preserved = dst_frame.data[..PAGE_DATA].to_vec();
        dst_frame.data.copy_from_slice(&src_frame.data);
        // Record bookkeeping travels with the records; the rest of the
        // header belongs to the destination.
        let bookkeeping = [
            header::N_RECS.clone(),
            header::LAST_INSERT.clone(),
            header::HEAP_TOP.clone(),
            header::GARBAGE.clone(),
            header::FLAGS..header::FLAGS + 1,
        ];
        let mut restored = preserved;
        for range in bookkeeping {
            restored[range.clone()].copy_from_slice(&src_frame.data[range]);
        }
        dst_frame.data[..PAGE_DATA].copy_from_slice(&restored);
        match (dst_frame.zip.as_mut(), src_frame.zip.as_ref()) {
            (Some(dst_zip), Some(src_zip)) => dst_zip.copy_from(src_zip),
            (None, None) => {}
            _ => panic!("zip copy between mismatched tablespaces"),
        }
    }
    log_op(dst, mtr, OP_COPY_LIST, &src.page_no().0.to_be_bytes());
}

/// Inserts the tuple immediately after `pos`. Returns the new record's
/// slot, or `None` when the record does not fit or the compressed image
/// cannot absorb it (the page is then unchanged).
pub fn page_cur_insert(
    block: &BlockRef,
    format: RecordFormat,
    pos: PagePos,
    tuple: &Tuple,
    mtr: &mut Mtr,
) -> Option<u16> {
    let rec = tuple.convert_to_rec(format);
    if rec.len() > page_max_insert_size(block, 1) {
        return None;
    }
    let undo = zip_undo_point(block);
    let idx = pos.insert_index();
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let n = read_u16(data, header::N_RECS.clone());
        debug_assert!(idx <= n, "insert position out of range");
        let heap_top = read_u16(data, header::HEAP_TOP.clone());
        data[heap_top as usize..heap_top as usize + rec.len()].copy_from_slice(&rec);
        insert_slot(data, n, idx, heap_top);
        write_u16(data, header::N_RECS.clone(), n + 1);
        write_u16(data, header::HEAP_TOP.clone(), heap_top + rec.len() as u16);
        write_u16(data, header::LAST_INSERT.clone(), heap_top);
    }
    if !page_zip_compress(block) {
        let undo = undo.expect("zip failure implies a zip undo point");
        block.frame().write().data = undo.data;
        return None;
    }
    let mut args = Vec::with_capacity(2 + rec.len());
    args.extend_from_slice(&idx.to_be_bytes());
    args.extend_from_slice(&rec);
    log_op(block, mtr, OP_INSERT, &args);
    Some(idx)
}

fn shrink_recompress(block: &BlockRef, format: RecordFormat) {
    if page_zip_compress(block) {
        return;
    }
    // A shrink is not allowed to fail: compact the heap and retry.
    let ok = page_compact_rebuild(block, format);
    assert!(ok, "page compression failed after a shrink");
}

/// Deletes the record in `slot`. Deletes only shrink the page and are
/// therefore infallible, compressed pages included.
pub fn page_delete_rec(block: &BlockRef, format: RecordFormat, slot: u16, mtr: &mut Mtr) {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let n = read_u16(data, header::N_RECS.clone());
        debug_assert!(slot < n, "delete slot out of range");
        let off = get_slot(data, slot) as usize;
        let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
        let view = RecView::decode(&data[off..heap_top], format)
            .unwrap_or_else(|err| panic!("record decode in delete: {err}"));
        let size = view.encoded_size() as u16;
        remove_slot(data, n, slot);
        write_u16(data, header::N_RECS.clone(), n - 1);
        let garbage = read_u16(data, header::GARBAGE.clone());
        write_u16(data, header::GARBAGE.clone(), garbage + size);
        write_u16(data, header::LAST_INSERT.clone(), 0);
    }
    shrink_recompress(block, format);
    log_op(block, mtr, OP_DELETE, &slot.to_be_bytes());
}

/// Deletes the records in slots `[0, end_slot)`.
pub fn page_delete_rec_list_start(
    block: &BlockRef,
    format: RecordFormat,
    end_slot: u16,
    mtr: &mut Mtr,
) {
    delete_list(block, format, 0, end_slot, mtr)
}

/// Deletes the records in slots `[from_slot, n_recs)`.
pub fn page_delete_rec_list_end(
    block: &BlockRef,
    format: RecordFormat,
    from_slot: u16,
    mtr: &mut Mtr,
) {
    let n = page_n_recs(block);
    delete_list(block, format, from_slot, n, mtr)
}

fn delete_list(block: &BlockRef, format: RecordFormat, from: u16, to: u16, mtr: &mut Mtr) {
    if from >= to {
        return;
    }
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let n = read_u16(data, header::N_RECS.clone());
        debug_assert!(to <= n);
        let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
        let mut freed = 0u16;
        for slot in from..to {
            let off = get_slot(data, slot) as usize;
            let view = RecView::decode(&data[off..heap_top], format)
                .unwrap_or_else(|err| panic!("record decode in list delete: {err}"));
            freed += view.encoded_size() as u16;
        }
        let removed = to - from;
        for j in to..n {
            let v = get_slot(data, j);
            set_slot(data, j - removed, v);
        }
        write_u16(data, header::N_RECS.clone(), n - removed);
        let garbage = read_u16(data, header::GARBAGE.clone());
        write_u16(data, header::GARBAGE.clone(), garbage + freed);
        write_u16(data, header::LAST_INSERT.clone(), 0);
    }
    shrink_recompress(block, format);
    log_op(
        block,
        mtr,
        OP_DELETE_LIST,
        &[from.to_be_bytes(), to.to_be_bytes()].concat(),
    );
}

fn collect_recs(block: &BlockRef, format: RecordFormat, from: u16, to: u16) -> Vec<Vec<u8>> {
    let frame = block.frame().read();
    let data = &frame.data;
    (from..to)
        .map(|slot| {
            let off = get_slot(data, slot) as usize;
            rec_bytes_at(data, off, format)
        })
        .collect()
}

fn copy_records(block: &BlockRef, recs: &[Vec<u8>], prepend: bool, mtr: &mut Mtr) -> bool {
    let undo_data = block.frame().read().data.clone();
    let fits = {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let mut ok = true;
        for (k, rec) in recs.iter().enumerate() {
            let n = read_u16(data, header::N_RECS.clone());
            let heap_top = read_u16(data, header::HEAP_TOP.clone());
            let dir_floor = data.len() - dir_reserve(n as usize + 1);
            if heap_top as usize + rec.len() > dir_floor {
                ok = false;
                break;
            }
            data[heap_top as usize..heap_top as usize + rec.len()].copy_from_slice(rec);
            let idx = if prepend { k as u16 } else { n };
            insert_slot(data, n, idx, heap_top);
            write_u16(data, header::N_RECS.clone(), n + 1);
            write_u16(data, header::HEAP_TOP.clone(), heap_top + rec.len() as u16);
            // Copies go through the page cursor, so the last-insert
            // hint tracks the final copied record.
            write_u16(data, header::LAST_INSERT.clone(), heap_top);
        }
        ok
    };
    if !fits || !page_zip_compress(block) {
        block.frame().write().data = undo_data;
        return false;
    }
    log_op(block, mtr, OP_COPY_LIST, &(recs.len() as u16).to_be_bytes());
    true
}

/// Copies the records in `src` slots `[from_slot, n)` to the start of
/// `dst`, preserving order. Fails (leaving `dst` unchanged) when the
/// records do not fit or the compressed image cannot absorb them.
pub fn page_copy_rec_list_end(
    dst: &BlockRef,
    src: &BlockRef,
    format: RecordFormat,
    from_slot: u16,
    mtr: &mut Mtr,
) -> bool {
    let recs = collect_recs(src, format, from_slot, page_n_recs(src));
    copy_records(dst, &recs, true, mtr)
}

/// Copies the records in `src` slots `[0, end_slot)` to the end of
/// `dst`, preserving order. Same failure contract as
/// [`page_copy_rec_list_end`].
pub fn page_copy_rec_list_start(
    dst: &BlockRef,
    src: &BlockRef,
    format: RecordFormat,
    end_slot: u16,
    mtr: &mut Mtr,
) -> bool {
    let recs = collect_recs(src, format, 0, end_slot);
    copy_records(dst, &recs, false, mtr)
}

/// Moves the records in `src` slots `[from_slot, n)` to the start of
/// `dst`. On failure neither page changes.
pub fn page_move_rec_list_end(
    dst: &BlockRef,
    src: &BlockRef,
    format: RecordFormat,
    from_slot: u16,
    mtr: &mut Mtr,
) -> bool {
    if !page_copy_rec_list_end(dst, src, format, from_slot, mtr) {
        return false;
    }
    page_delete_rec_list_end(src, format, from_slot, mtr);
    true
}

/// Moves the records in `src` slots `[0, end_slot)` to the end of `dst`.
/// On failure neither page changes.
pub fn page_move_rec_list_start(
    dst: &BlockRef,
    src: &BlockRef,
    format: RecordFormat,
    end_slot: u16,
    mtr: &mut Mtr,
) -> bool {
    if !page_copy_rec_list_start(dst, src, format, end_slot, mtr) {
        return false;
    }
    page_delete_rec_list_start(src, format, end_slot, mtr);
    true
}

/// Rewrites the heap compactly in slot order, dropping garbage. Purely
/// mechanical: no logging, no lock or hash maintenance. Returns `false`
/// when the compacted page fails to compress.
pub fn page_compact_rebuild(block: &BlockRef, format: RecordFormat) -> bool {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let n = read_u16(data, header::N_RECS.clone());
        let recs: Vec<Vec<u8>> = (0..n)
            .map(|slot| {
                let off = get_slot(data, slot) as usize;
                rec_bytes_at(data, off, format)
            })
            .collect();
        let mut heap_top = PAGE_DATA as u16;
        for (slot, rec) in recs.iter().enumerate() {
            data[heap_top as usize..heap_top as usize + rec.len()].copy_from_slice(rec);
            set_slot(data, slot as u16, heap_top);
            heap_top += rec.len() as u16;
        }
        write_u16(data, header::HEAP_TOP.clone(), heap_top);
        write_u16(data, header::GARBAGE.clone(), 0);
        write_u16(data, header::LAST_INSERT.clone(), 0);
    }
    page_zip_compress(block)
}

/// Snapshot of the frame (and image) for restore-on-failure paths.
pub fn page_frame_snapshot(block: &BlockRef) -> (Vec<u8>, Option<zip::ZipFrame>) {
    let frame = block.frame().read();
    (frame.data.clone(), frame.zip.clone())
}

/// Restores a snapshot taken by [`page_frame_snapshot`].
pub fn page_frame_restore(block: &BlockRef, snapshot: (Vec<u8>, Option<zip::ZipFrame>)) {
    let mut frame = block.frame().write();
    frame.data = snapshot.0;
    frame.zip = snapshot.1;
}

/// Sets or clears the min-rec info bit of the record in `slot`. The
/// redo record for this mutation is written by the tree layer.
pub fn rec_set_min_rec_flag(block: &BlockRef, format: RecordFormat, slot: u16, set: bool) {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let off = get_slot(data, slot) as usize;
        let info_off = off + crate::record::info_byte_offset(format);
        let bit = crate::record::min_rec_bit(format);
        if set {
            data[info_off] |= bit;
        } else {
            data[info_off] &= !bit;
        }
    }
    shrink_recompress(block, format);
}

/// Applies the min-rec bit at a raw record offset (redo replay).
pub fn rec_set_min_rec_flag_at(block: &BlockRef, format: RecordFormat, offset: u16) {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let info_off = offset as usize + crate::record::info_byte_offset(format);
        data[info_off] |= crate::record::min_rec_bit(format);
    }
    shrink_recompress(block, format);
}

/// Rewrites the child page number in the trailing field of the node
/// pointer in `slot`.
pub fn rec_set_node_ptr_child(
    block: &BlockRef,
    format: RecordFormat,
    slot: u16,
    child: PageNo,
    mtr: &mut Mtr,
) {
    {
        let mut frame = block.frame().write();
        let data = &mut frame.data;
        let off = get_slot(data, slot) as usize;
        let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
        let view = RecView::decode(&data[off..heap_top], format)
            .unwrap_or_else(|err| panic!("record decode in set-child: {err}"));
        let size = view.encoded_size();
        let child_off = off + size - crate::record::REC_NODE_PTR_SIZE;
        data[child_off..child_off + 4].copy_from_slice(&child.0.to_be_bytes());
    }
    shrink_recompress(block, format);
    let mut args = Vec::with_capacity(6);
    args.extend_from_slice(&slot.to_be_bytes());
    args.extend_from_slice(&child.0.to_be_bytes());
    log_op(block, mtr, OP_SET_CHILD, &args);
}

/// Initializes the ibuf free-list fields of a fresh ibuf tree root.
pub fn ibuf_free_list_init(root: &BlockRef, mtr: &mut Mtr) {
    {
        let mut frame = root.frame().write();
        let data = &mut frame.data;
        write_u32(data, header::IBUF_FREE_FIRST.clone(), FIL_NULL.0);
        write_u32(data, header::IBUF_FREE_LEN.clone(), 0);
    }
    log_op(root, mtr, OP_IBUF_LIST, b"init");
}

/// Length of the ibuf free list.
pub fn ibuf_free_list_len(root: &BlockRef) -> u32 {
    read_u32(&root.frame().read().data, header::IBUF_FREE_LEN.clone())
}

/// Pushes `block` onto the front of the root's ibuf free list.
pub fn ibuf_free_list_push_front(root: &BlockRef, block: &BlockRef, mtr: &mut Mtr) {
    {
        let first = read_u32(&root.frame().read().data, header::IBUF_FREE_FIRST.clone());
        let mut frame = block.frame().write();
        write_u32(&mut frame.data, header::IBUF_FREE_NEXT.clone(), first);
    }
    {
        let mut frame = root.frame().write();
        let data = &mut frame.data;
        write_u32(data, header::IBUF_FREE_FIRST.clone(), block.page_no().0);
        let len = read_u32(data, header::IBUF_FREE_LEN.clone());
        write_u32(data, header::IBUF_FREE_LEN.clone(), len + 1);
    }
    log_op(root, mtr, OP_IBUF_LIST, &block.page_no().0.to_be_bytes());
}

/// Pops the first page off the root's ibuf free list, latching it
/// exclusively in `mtr`.
pub fn ibuf_free_list_pop_front(
    space: &Space,
    root: &BlockRef,
    mtr: &mut Mtr,
) -> Option<BlockRef> {
    let first = PageNo(read_u32(
        &root.frame().read().data,
        header::IBUF_FREE_FIRST.clone(),
    ));
    if first.is_null() {
        return None;
    }
    let block = space.page_get(first, LatchMode::XFix, mtr);
    let next = read_u32(&block.frame().read().data, header::IBUF_FREE_NEXT.clone());
    {
        let mut frame = root.frame().write();
        let data = &mut frame.data;
        write_u32(data, header::IBUF_FREE_FIRST.clone(), next);
        let len = read_u32(data, header::IBUF_FREE_LEN.clone());
        write_u32(data, header::IBUF_FREE_LEN.clone(), len - 1);
    }
    log_op(root, mtr, OP_IBUF_LIST, b"pop");
    Some(block)
}

/// Checks the intra-page invariants: slot offsets inside the heap,
/// records in nondecreasing key order, free-space accounting consistent.
pub fn page_validate(block: &BlockRef, format: RecordFormat, n_cmp: usize) -> bool {
    let frame = block.frame().read();
    let data = &frame.data;
    let n = read_u16(data, header::N_RECS.clone());
    let heap_top = read_u16(data, header::HEAP_TOP.clone()) as usize;
    let garbage = read_u16(data, header::GARBAGE.clone()) as usize;
    if dir_reserve(n as usize) > data.len() {
        error!(
            target: "basalt_page::validate",
            page = block.page_no().0,
            n_recs = n,
            "slot directory larger than the page"
        );
        return false;
    }
    if heap_top < PAGE_DATA || heap_top > data.len() - dir_reserve(n as usize) {
        error!(
            target: "basalt_page::validate",
            page = block.page_no().0,
            heap_top,
            "heap top out of bounds"
        );
        return false;
    }
    let mut live = 0usize;
    let mut prev: Option<Vec<u8>> = None;
    for slot in 0..n {
        let off = get_slot(data, slot) as usize;
        if off < PAGE_DATA || off >= heap_top {
            error!(
                target: "basalt_page::validate",
                page = block.page_no().0,
                slot,
                off,
                "slot offset outside the heap"
            );
            return false;
        }
        let view = match RecView::decode(&data[off..heap_top], format) {
            Ok(view) => view,
            Err(err) => {
                error!(
                    target: "basalt_page::validate",
                    page = block.page_no().0,
                    slot,
                    %err,
                    "record decode failed"
                );
                return false;
            }
        };
        live += view.encoded_size();
        if let Some(prev_bytes) = &prev {
            let prev_view = RecView::decode(prev_bytes, format).expect("validated record");
            if cmp_rec_rec(&prev_view, &view, n_cmp) == core::cmp::Ordering::Greater {
                error!(
                    target: "basalt_page::validate",
                    page = block.page_no().0,
                    slot,
                    "records out of order"
                );
                return false;
            }
        }
        prev = Some(data[off..off + view.encoded_size()].to_vec());
    }
    if live + garbage != heap_top - PAGE_DATA {
        error!(
            target: "basalt_page::validate",
            page = block.page_no().0,
            live,
            garbage,
            heap_top,
            "free-space accounting mismatch"
        );
        return false;
    }
    true
}

/// Logs a hex dump of the page header and slot table, for corruption
/// reports.
pub fn page_dump(block: &BlockRef) {
    let frame = block.frame().read();
    let data = &frame.data;
    let n = read_u16(data, header::N_RECS.clone());
    let slots: Vec<u16> = (0..n).map(|i| get_slot(data, i)).collect();
    error!(
        target: "basalt_page::dump",
        space = block.space_id().0,
        page = block.page_no().0,
        prev = %PageNo(read_u32(data, header::PREV.clone())),
        next = %PageNo(read_u32(data, header::NEXT.clone())),
        level = read_u16(data, header::LEVEL.clone()),
        n_recs = n,
        heap_top = read_u16(data, header::HEAP_TOP.clone()),
        garbage = read_u16(data, header::GARBAGE.clone()),
        ?slots,
        header = ?&data[..PAGE_DATA],
        "page dump"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::SpaceConfig;
    use crate::types::{Direction, SpaceId};
    use std::sync::Arc;

    fn setup(zip_cap: Option<usize>) -> (Arc<Space>, BlockRef) {
        let space = Space::new(SpaceConfig {
            id: SpaceId(0),
            page_size: 1024,
            zip_cap,
        });
        let no = space.take_page_no(PageNo(0), Direction::NoDir);
        let block = space.create_block(no);
        (space, block)
    }

    fn tuple(key: &[u8]) -> Tuple {
        Tuple::from_fields([key.to_vec()])
    }

    #[test]
    fn insert_search_delete_round_trip() {
        let (space, block) = setup(None);
        let mut mtr = Mtr::start(&space);
        page_create(&block, true, &mut mtr);
        for key in [b"bb".as_slice(), b"dd", b"aa", b"cc"] {
            let t = tuple(key);
            let pos = page_cur_search(&block, RecordFormat::Compact, &t);
            page_cur_insert(&block, RecordFormat::Compact, pos, &t, &mut mtr).unwrap();
        }
        assert_eq!(page_n_recs(&block), 4);
        assert!(page_validate(&block, RecordFormat::Compact, 1));

        let pos = page_cur_search(&block, RecordFormat::Compact, &tuple(b"cc"));
        let slot = match pos {
            PagePos::Rec(slot) => slot,
            other => panic!("expected record position, got {other:?}"),
        };
        let bytes = rec_bytes(&block, RecordFormat::Compact, slot);
        let view = RecView::decode(&bytes, RecordFormat::Compact).unwrap();
        assert_eq!(view.field(0), b"cc");

        page_delete_rec(&block, RecordFormat::Compact, slot, &mut mtr);
        assert_eq!(page_n_recs(&block), 3);
        assert!(page_garbage_nonzero(&block));
        assert!(page_validate(&block, RecordFormat::Compact, 1));
        mtr.commit();
    }

    fn page_garbage_nonzero(block: &BlockRef) -> bool {
        read_u16(&block.frame().read().data, header::GARBAGE.clone()) > 0
    }

    #[test]
    fn search_before_all_records_is_infimum() {
        let (space, block) = setup(None);
        let mut mtr = Mtr::start(&space);
        page_create(&block, true, &mut mtr);
        let t = tuple(b"mm");
        page_cur_insert(&block, RecordFormat::Compact, PagePos::Infimum, &t, &mut mtr).unwrap();
        assert_eq!(
            page_cur_search(&block, RecordFormat::Compact, &tuple(b"aa")),
            PagePos::Infimum
        );
        assert_eq!(
            page_cur_search(&block, RecordFormat::Compact, &tuple(b"zz")),
            PagePos::Rec(0)
        );
        mtr.commit();
    }

    #[test]
    fn copy_list_end_prepends_and_start_appends() {
        let (space, a) = setup(None);
        let b_no = space.take_page_no(PageNo(0), Direction::NoDir);
        let b = space.create_block(b_no);
        let mut mtr = Mtr::start(&space);
        page_create(&a, true, &mut mtr);
        page_create(&b, true, &mut mtr);
        for key in [b"aa".as_slice(), b"bb"] {
            let t = tuple(key);
            let pos = page_cur_search(&a, RecordFormat::Compact, &t);
            page_cur_insert(&a, RecordFormat::Compact, pos, &t, &mut mtr).unwrap();
        }
        for key in [b"cc".as_slice(), b"dd"] {
            let t = tuple(key);
            let pos = page_cur_search(&b, RecordFormat::Compact, &t);
            page_cur_insert(&b, RecordFormat::Compact, pos, &t, &mut mtr).unwrap();
        }
        // Prepend a's records to b.
        assert!(page_copy_rec_list_end(&b, &a, RecordFormat::Compact, 0, &mut mtr));
        assert_eq!(page_n_recs(&b), 4);
        assert!(page_validate(&b, RecordFormat::Compact, 1));
        let first = rec_bytes(&b, RecordFormat::Compact, 0);
        let view = RecView::decode(&first, RecordFormat::Compact).unwrap();
        assert_eq!(view.field(0), b"aa");
        mtr.commit();
    }

    #[test]
    fn data_size_survives_compact_rebuild() {
        let (space, block) = setup(None);
        let mut mtr = Mtr::start(&space);
        page_create(&block, true, &mut mtr);
        for key in [b"aa".as_slice(), b"bb", b"cc"] {
            let t = tuple(key);
            let pos = page_cur_search(&block, RecordFormat::Compact, &t);
            page_cur_insert(&block, RecordFormat::Compact, pos, &t, &mut mtr).unwrap();
        }
        page_delete_rec(&block, RecordFormat::Compact, 1, &mut mtr);
        let before = page_data_size(&block);
        let max_before = page_max_insert_size_after_reorganize(&block, 1);
        assert!(page_compact_rebuild(&block, RecordFormat::Compact));
        assert_eq!(page_data_size(&block), before);
        assert_eq!(page_max_insert_size_after_reorganize(&block, 1), max_before);
        assert_eq!(page_max_insert_size(&block, 1), max_before);
        mtr.commit();
    }

    #[test]
    fn zip_insert_failure_leaves_the_page_unchanged() {
        let (space, block) = setup(Some(48));
        let mut mtr = Mtr::start(&space);
        page_create(&block, true, &mut mtr);
        assert!(page_zip_compress(&block));
        // Incompressible payload: the image cannot absorb it.
        let noisy: Vec<u8> = (0..200u32).map(|i| (i.wrapping_mul(2654435761)) as u8).collect();
        let t = Tuple::from_fields([noisy]);
        let before = page_frame_snapshot(&block);
        let inserted = page_cur_insert(&block, RecordFormat::Compact, PagePos::Infimum, &t, &mut mtr);
        assert!(inserted.is_none());
        assert_eq!(page_n_recs(&block), 0);
        assert_eq!(before.0, page_frame_snapshot(&block).0);
        mtr.commit();
    }
}
