//! Page reorganization and its redo hook.

use tracing::{error, trace};

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::log::LogRecord;
use crate::mtr::{LogMode, Mtr};
use crate::page;
use crate::record::RecordFormat;

/// Rebuilds a page to reclaim the space of deleted records. One redo
/// record covers the whole rebuild; the byte-level work runs with
/// logging off and is replayed by re-running this primitive.
///
/// In the recovery path record locks are not moved and the hash index
/// is not dropped; neither exists during redo.
pub(crate) fn page_reorganize_low(
    recovery: bool,
    block: &BlockRef,
    index: &IndexDef,
    mtr: &mut Mtr,
) -> bool {
    debug_assert!(mtr.memo_contains_page_x(block));
    assert_eq!(page::page_is_comp(block), index.is_comp());

    let data_size1 = page::page_data_size(block);
    let max_ins_size1 = page::page_max_insert_size_after_reorganize(block, 1);

    mtr.log(LogRecord::PageReorganize {
        space: block.space_id(),
        page_no: block.page_no(),
        compact: index.is_comp(),
    });
    let log_mode = mtr.set_log_mode(LogMode::None);

    let snapshot = page::page_frame_snapshot(block);

    if !recovery {
        index.space.drop_page_hash(block.page_no());
    }

    if !page::page_compact_rebuild(block, index.format) {
        // Compression failed: restore the pre-image and report failure.
        page::page_frame_restore(block, snapshot);
        mtr.set_log_mode(log_mode);
        return false;
    }

    if !recovery {
        index.locks.move_reorganize_page(block.page_no());
    }

    let data_size2 = page::page_data_size(block);
    let max_ins_size2 = page::page_max_insert_size_after_reorganize(block, 1);

    let success = data_size1 == data_size2 && max_ins_size1 == max_ins_size2;
    if !success {
        error!(
            target: "basalt_btree::reorg",
            page = block.page_no().0,
            data_size1,
            data_size2,
            max_ins_size1,
            max_ins_size2,
            "page size accounting changed across reorganize"
        );
        page::page_dump(block);
    } else {
        trace!(
            target: "basalt_btree::reorg",
            index = %index.id,
            page = block.page_no().0,
            recovery,
            "reorganized page"
        );
    }

    mtr.set_log_mode(log_mode);
    success
}

/// Reorganizes an index page.
pub fn page_reorganize(block: &BlockRef, index: &IndexDef, mtr: &mut Mtr) -> bool {
    page_reorganize_low(false, block, index, mtr)
}

/// Parses a page-reorganize redo record. The payload is empty beyond
/// the initial part; when a page is supplied, the reorganize primitive
/// is replayed on it. Returns the unconsumed buffer.
pub fn parse_page_reorganize<'a>(
    buf: &'a [u8],
    index: &IndexDef,
    compact: bool,
    block: Option<&BlockRef>,
    mtr: Option<&mut Mtr>,
) -> Option<&'a [u8]> {
    debug_assert_eq!(compact, index.format == RecordFormat::Compact);
    if let (Some(block), Some(mtr)) = (block, mtr) {
        page_reorganize_low(true, block, index, mtr);
    }
    Some(buf)
}
