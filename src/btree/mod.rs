//! The B-tree index engine.
//!
//! Latching strategy
//! -----------------
//! A tree latch protects all non-leaf nodes of the tree; every page also
//! has a latch of its own. An operation normally takes an S-latch on the
//! tree, descends buffer-fixing the interior pages without latching
//! them, latches the leaf, and releases the tree latch. An operation
//! that may restructure the tree takes an X-latch on the tree before
//! descending; with the tree latch held exclusively, upper-level pages
//! can be latched as needed without inversion. To split a leaf the
//! engine decides the split point, allocates a page, inserts the node
//! pointer on the level above, optionally releases the tree latch, and
//! only then moves records.
//!
//! Node pointers
//! -------------
//! Leaf pages hold the index records; on levels above, each page is
//! referenced by exactly one node pointer: a key prefix long enough to
//! determine a record uniquely, plus the child page number in the
//! trailing field. A child may hold records `>=` the pointer's key and
//! `<` the next pointer's key. If the pointer leads to a non-leaf child,
//! the child's leftmost record carries exactly the pointer's key; a leaf
//! child has no such obligation, so leaf deletes never touch the levels
//! above. The leftmost pointer of each level carries the min-rec flag
//! and compares below every key.
//!
//! Page allocation
//! ---------------
//! The root page holds two file-segment headers: leaf pages come from
//! one segment, non-leaf pages from the other. Insert-buffer trees keep
//! their non-leaf segment on a separate header page and recycle pages
//! through an in-tree free list instead of the segment allocator.

pub mod alloc;
pub mod cursor;
pub mod father;
pub mod lifecycle;
pub mod merge;
pub mod reorg;
pub mod split;
pub mod validate;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::info;

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::log::LogRecord;
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self, PagePos};
use crate::record::RecordFormat;
use crate::types::{PageNo, SizeTarget};

pub use alloc::{get_size, page_alloc, page_free, page_free_low};
pub use cursor::{BtrCursor, LatchIntent};
pub use lifecycle::{bootstrap, create, free_but_not_root, free_root};
pub use merge::{compress, discard_page};
pub use reorg::{page_reorganize, parse_page_reorganize};
pub use split::{root_raise_and_insert, split_and_insert};
pub use validate::validate_index;

/// Record format stored on `block`, from the page flags.
pub(crate) fn page_format(block: &BlockRef) -> RecordFormat {
    if page::page_is_comp(block) {
        RecordFormat::Compact
    } else {
        RecordFormat::Redundant
    }
}

/// Fetches the root page of the tree, X-latched, and checks that its
/// stored format matches the tree.
pub fn root_get(index: &IndexDef, mtr: &mut Mtr) -> BlockRef {
    let root_page_no = index.root_page_no();
    let root = index.space.page_get(root_page_no, LatchMode::XFix, mtr);
    assert_eq!(
        page::page_is_comp(&root),
        index.is_comp(),
        "root page format differs from the tree"
    );
    root
}

/// Logical successor of the position across page boundaries. Crossing
/// into the next page requires that the caller's mtr already latched it.
/// `None` at the right end of the level.
pub fn next_user_rec(
    block: &BlockRef,
    pos: PagePos,
    mtr: &mut Mtr,
) -> Option<(BlockRef, u16)> {
    let n = page::page_n_recs(block);
    let in_page = match pos {
        PagePos::Infimum if n > 0 => Some(0),
        PagePos::Rec(i) if i + 1 < n => Some(i + 1),
        _ => None,
    };
    if let Some(slot) = in_page {
        return Some((Arc::clone(block), slot));
    }
    let next_page_no = page::page_next(block);
    if next_page_no.is_null() {
        return None;
    }
    let space = Arc::clone(mtr.space());
    let next_block = space.page_get_no_latch(next_page_no, mtr);
    assert!(
        mtr.memo_contains_page_latched(&next_block),
        "caller must already hold a latch on the right brother"
    );
    debug_assert_eq!(page::page_is_comp(&next_block), page::page_is_comp(block));
    debug_assert_eq!(page::page_prev(&next_block), block.page_no());
    debug_assert!(page::page_n_recs(&next_block) > 0);
    Some((next_block, 0))
}

/// Logical predecessor of the position across page boundaries; the same
/// latching contract as [`next_user_rec`]. `None` at the left end.
pub fn prev_user_rec(
    block: &BlockRef,
    pos: PagePos,
    mtr: &mut Mtr,
) -> Option<(BlockRef, u16)> {
    let in_page = match pos {
        PagePos::Rec(i) if i > 0 => Some(i - 1),
        PagePos::Supremum if page::page_n_recs(block) > 0 => {
            Some(page::page_n_recs(block) - 1)
        }
        _ => None,
    };
    if let Some(slot) = in_page {
        return Some((Arc::clone(block), slot));
    }
    let prev_page_no = page::page_prev(block);
    if prev_page_no.is_null() {
        return None;
    }
    let space = Arc::clone(mtr.space());
    let prev_block = space.page_get_no_latch(prev_page_no, mtr);
    assert!(
        mtr.memo_contains_page_latched(&prev_block),
        "caller must already hold a latch on the left brother"
    );
    debug_assert_eq!(page::page_is_comp(&prev_block), page::page_is_comp(block));
    debug_assert_eq!(page::page_next(&prev_block), block.page_no());
    let n = page::page_n_recs(&prev_block);
    debug_assert!(n > 0);
    Some((prev_block, n - 1))
}

/// Initializes a freshly allocated index page at `level` and stamps the
/// index id. Not used for the root and not used by reorganization.
pub(crate) fn page_create_block(block: &BlockRef, index: &IndexDef, level: u16, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    if page::page_has_zip(block) {
        page::page_create_zip(block, index.is_comp(), level, mtr);
    } else {
        page::page_create(block, index.is_comp(), mtr);
        page::page_set_level(block, level, mtr);
    }
    page::page_set_index_id(block, index.id.0, mtr);
}

/// Empties an index page in place. Global data on the page (segment
/// headers, sibling links, level, index id) is preserved intact.
pub(crate) fn page_empty(block: &BlockRef, index: &IndexDef, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    index.space.drop_page_hash(block.page_no());
    if page::page_has_zip(block) {
        page::page_create_zip(block, index.is_comp(), page::page_level(block), mtr);
    } else {
        page::page_create(block, index.is_comp(), mtr);
    }
}

/// Child page of the node pointer in `slot`, X-latched.
pub(crate) fn node_ptr_get_child(
    index: &IndexDef,
    block: &BlockRef,
    slot: u16,
    mtr: &mut Mtr,
) -> BlockRef {
    let bytes = page::rec_bytes(block, index.format, slot);
    let view = crate::record::RecView::decode(&bytes, index.format).expect("node pointer decodes");
    let child = view.node_ptr_child().expect("node pointer has a child field");
    index.space.page_get(child, LatchMode::XFix, mtr)
}

/// Unlinks `block` from the doubly linked list of its level.
pub(crate) fn level_list_remove(block: &BlockRef, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    let prev_page_no = page::page_prev(block);
    let next_page_no = page::page_next(block);
    let space = Arc::clone(mtr.space());
    if !prev_page_no.is_null() {
        let prev_block = space.page_get(prev_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_next(&prev_block), block.page_no());
        page::page_set_next(&prev_block, next_page_no, mtr);
    }
    if !next_page_no.is_null() {
        let next_block = space.page_get(next_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_prev(&next_block), block.page_no());
        page::page_set_prev(&next_block, prev_page_no, mtr);
    }
}

/// Tags the record in `slot` as the predefined minimum record and logs
/// the 2-byte offset redo entry.
pub fn set_min_rec_mark(block: &BlockRef, slot: u16, mtr: &mut Mtr) {
    let format = page_format(block);
    let offset = page::rec_offset(block, slot);
    page::rec_set_min_rec_flag(block, format, slot, true);
    mtr.log(LogRecord::SetMinRecMark {
        space: block.space_id(),
        page_no: block.page_no(),
        compact: format == RecordFormat::Compact,
        offset,
    });
}

/// Parses the redo payload of a min-rec mark (a 2-byte record offset)
/// and applies it when a page is supplied. Returns the rest of the
/// buffer, or `None` when it is too short.
pub fn parse_set_min_rec_mark<'a>(
    buf: &'a [u8],
    compact: bool,
    block: Option<&BlockRef>,
    mtr: Option<&mut Mtr>,
) -> Option<&'a [u8]> {
    if buf.len() < 2 {
        return None;
    }
    let offset = u16::from_be_bytes(buf[..2].try_into().unwrap());
    if let Some(block) = block {
        assert_eq!(
            page::page_is_comp(block),
            compact,
            "redo record format differs from the page"
        );
        let format = page_format(block);
        page::rec_set_min_rec_flag_at(block, format, offset);
        if let Some(mtr) = mtr {
            mtr.log(LogRecord::SetMinRecMark {
                space: block.space_id(),
                page_no: block.page_no(),
                compact,
                offset,
            });
        }
    }
    Some(&buf[2..])
}

/// Debug self-check: the father node pointer of `block` matches its
/// first user record. Trivially true for the root.
pub fn check_node_ptr(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) -> bool {
    debug_assert!(mtr.memo_contains_page_x(block));
    if block.page_no() == index.root_page_no() {
        return true;
    }
    let (father_block, father_slot) = father::get_father_node_ptr(index, block, mtr);
    if page::page_is_leaf(block) {
        return true;
    }
    let first = page::rec_bytes(block, index.format, 0);
    let first_view =
        crate::record::RecView::decode(&first, index.format).expect("first record decodes");
    let tuple = crate::record::build_node_ptr(&first_view, index.n_uniq, PageNo(0));
    let father_bytes = page::rec_bytes(&father_block, index.format, father_slot);
    let father_view =
        crate::record::RecView::decode(&father_bytes, index.format).expect("node pointer decodes");
    assert_eq!(
        crate::record::cmp_tuple_rec(&tuple, &father_view, index.n_uniq),
        core::cmp::Ordering::Equal,
        "node pointer key differs from the child's first record"
    );
    true
}

/// Emits segment sizes and per-level page counts through tracing.
pub fn emit_tree_info(index: &IndexDef) {
    let mut mtr = Mtr::start(&index.space);
    mtr.s_lock(&index.latch);
    let root = root_get(index, &mut mtr);
    let leaf = get_size_locked(index, SizeTarget::LeafPages, &root, &mut mtr);
    let total = get_size_locked(index, SizeTarget::Total, &root, &mut mtr);
    let height = page::page_level(&root) + 1;
    info!(
        target: "basalt_btree::info",
        index = %index.id,
        root = root.page_no().0,
        height,
        leaf_pages = leaf,
        total_pages = total,
        "tree info"
    );
    let mut level_leftmost = root.page_no();
    loop {
        let block = index.space.page_get(level_leftmost, LatchMode::SFix, &mut mtr);
        let level = page::page_level(&block);
        let mut count = 1u64;
        let mut next = page::page_next(&block);
        while !next.is_null() {
            let sibling = index.space.page_get(next, LatchMode::SFix, &mut mtr);
            next = page::page_next(&sibling);
            count += 1;
        }
        info!(
            target: "basalt_btree::info",
            index = %index.id,
            level,
            pages = count,
            "level population"
        );
        if level == 0 {
            break;
        }
        let child = {
            let bytes = page::rec_bytes(&block, index.format, 0);
            let view = crate::record::RecView::decode(&bytes, index.format)
                .expect("node pointer decodes");
            view.node_ptr_child().expect("node pointer has a child field")
        };
        level_leftmost = child;
    }
    mtr.commit();
}

fn get_size_locked(index: &IndexDef, target: SizeTarget, root: &BlockRef, mtr: &mut Mtr) -> u64 {
    use crate::fseg::fseg_n_reserved_pages;
    use crate::page::header;
    match target {
        SizeTarget::LeafPages => {
            fseg_n_reserved_pages(&index.space, root, header::SEG_LEAF, mtr).0
        }
        SizeTarget::Total => {
            fseg_n_reserved_pages(&index.space, root, header::SEG_TOP, mtr).0
                + fseg_n_reserved_pages(&index.space, root, header::SEG_LEAF, mtr).0
        }
    }
}
