//! Page allocation and free for index trees.

use tracing::trace;

use crate::buf::BlockRef;
use crate::fseg::{fseg_alloc_free_page_general, fseg_free_page};
use crate::index::IndexDef;
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self, header};
use crate::types::{Direction, PageNo, SizeTarget};

use super::root_get;

/// Takes a page off the ibuf tree's free list. The caller guarantees the
/// list is non-empty; an empty list is a broken precondition, not an
/// out-of-space condition, and fails loudly.
fn page_alloc_for_ibuf(index: &IndexDef, mtr: &mut Mtr) -> BlockRef {
    let root = root_get(index, mtr);
    let block = page::ibuf_free_list_pop_front(&index.space, &root, mtr).unwrap_or_else(|| {
        panic!(
            "ibuf tree {} free list is empty; the caller must keep it stocked",
            index.id
        )
    });
    trace!(
        target: "basalt_btree::alloc",
        index = %index.id,
        page = block.page_no().0,
        "allocated from ibuf free list"
    );
    block
}

/// Allocates a new page for the tree, X-latched, from the segment
/// matching `level`, near `hint_page_no` in `direction`. Returns `None`
/// when out of space; the caller must have reserved free pages, in which
/// case allocation cannot fail.
pub fn page_alloc(
    index: &IndexDef,
    hint_page_no: PageNo,
    direction: Direction,
    level: u16,
    mtr: &mut Mtr,
) -> Option<BlockRef> {
    if index.flags.ibuf {
        return Some(page_alloc_for_ibuf(index, mtr));
    }
    let root = root_get(index, mtr);
    let offset = if level == 0 {
        header::SEG_LEAF
    } else {
        header::SEG_TOP
    };
    let page_no = fseg_alloc_free_page_general(
        &index.space,
        &root,
        offset,
        hint_page_no,
        direction,
        true,
        mtr,
    )?;
    trace!(
        target: "basalt_btree::alloc",
        index = %index.id,
        page = page_no.0,
        level,
        "allocated page"
    );
    Some(index.space.page_get(page_no, LatchMode::XFix, mtr))
}

/// Puts a freed ibuf page onto the tree's free list.
fn page_free_for_ibuf(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    let root = root_get(index, mtr);
    page::ibuf_free_list_push_front(&root, block, mtr);
}

/// Frees an index page given its level explicitly, so that external
/// storage pages, which carry no real level, can be freed too. The frame
/// modify clock is incremented to invalidate optimistic cursors.
pub fn page_free_low(index: &IndexDef, block: &BlockRef, level: u16, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    block.modify_clock_inc();
    if index.flags.ibuf {
        page_free_for_ibuf(index, block, mtr);
        return;
    }
    let root = root_get(index, mtr);
    let offset = if level == 0 {
        header::SEG_LEAF
    } else {
        header::SEG_TOP
    };
    fseg_free_page(&index.space, &root, offset, block.page_no(), mtr);
    trace!(
        target: "basalt_btree::alloc",
        index = %index.id,
        page = block.page_no().0,
        level,
        "freed page"
    );
}

/// Frees an index page, reading the level from the page itself.
pub fn page_free(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) {
    let level = page::page_level(block);
    page_free_low(index, block, level, mtr);
}

/// Number of pages reserved by the tree's segments, by target.
pub fn get_size(index: &IndexDef, target: SizeTarget) -> u64 {
    let mut mtr = Mtr::start(&index.space);
    mtr.s_lock(&index.latch);
    let root = root_get(index, &mut mtr);
    let n = super::get_size_locked(index, target, &root, &mut mtr);
    mtr.commit();
    n
}

fn free_fraction_bits(index: &IndexDef, block: &BlockRef) -> u8 {
    let free = page::page_max_insert_size_after_reorganize(block, 1);
    let page_size = index.space.page_size();
    ((free * 4) / page_size).min(3) as u8
}

/// Publishes insert-buffer free bits for both halves of a split in the
/// same mini-transaction.
pub(crate) fn update_free_bits_for_two_pages(
    index: &IndexDef,
    left: &BlockRef,
    right: &BlockRef,
    mtr: &mut Mtr,
) {
    let _ = mtr;
    index
        .space
        .set_free_bits(left.page_no(), free_fraction_bits(index, left));
    index
        .space
        .set_free_bits(right.page_no(), free_fraction_bits(index, right));
}

/// Publishes insert-buffer free bits for a page that just gained
/// records.
pub(crate) fn update_free_bits_if_full(index: &IndexDef, block: &BlockRef) {
    index
        .space
        .set_free_bits(block.page_no(), free_fraction_bits(index, block));
}
