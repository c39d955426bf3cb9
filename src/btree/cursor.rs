//! Tree cursors, the search path, and the insert/delete entry points.
//!
//! A cursor is positioned by a search and then drives the page-level
//! primitives; when an optimistic operation cannot proceed within one
//! page, it upgrades to the pessimistic path, which restructures the
//! tree under the tree X-latch.

use std::sync::Arc;

use tracing::trace;

use crate::buf::BlockRef;
use crate::error::{BasaltError, Result};
use crate::index::IndexDef;
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self, PagePos};
use crate::record::{cmp_tuple_rec, RecView, Tuple};

use super::{merge, page_format, split};

/// Latching intent of a search.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LatchIntent {
    /// Read path: S-latch the tree, buffer-fix the interior, S-latch the
    /// leaf, then release the tree latch.
    SearchLeaf,
    /// Write path that may restructure: X-latch the tree first; at the
    /// leaf, X-latch the left brother, the leaf, and the right brother.
    ModifyTree,
    /// Continuation under an already-held tree X-latch; the target page
    /// is X-latched.
    ContModifyTree,
}

/// A cursor on one page of the tree.
pub struct BtrCursor {
    /// The page the cursor is on.
    pub block: BlockRef,
    /// Position within the page.
    pub pos: PagePos,
}

impl BtrCursor {
    /// Repositions the cursor.
    pub fn position(&mut self, block: BlockRef, pos: PagePos) {
        self.block = block;
        self.pos = pos;
    }
}

/// Descends from the root to `level` and positions with `PAGE_CUR_LE`
/// on the greatest record `<=` the tuple.
pub fn search_to_nth_level(
    index: &IndexDef,
    level: u16,
    tuple: &Tuple,
    intent: LatchIntent,
    mtr: &mut Mtr,
) -> BtrCursor {
    match intent {
        LatchIntent::SearchLeaf => mtr.s_lock(&index.latch),
        LatchIntent::ModifyTree => mtr.x_lock(&index.latch),
        LatchIntent::ContModifyTree => {
            debug_assert!(mtr.memo_contains_x_lock(&index.latch));
        }
    }
    let mut page_no = index.root_page_no();
    assert!(!page_no.is_null(), "search on a tree without a root");
    loop {
        let block = index.space.page_get_no_latch(page_no, mtr);
        let page_level = page::page_level(&block);
        if page_level == level {
            let block = match intent {
                LatchIntent::SearchLeaf => {
                    let block = index.space.page_get(page_no, LatchMode::SFix, mtr);
                    mtr.memo_release_s_lock(&index.latch);
                    block
                }
                LatchIntent::ModifyTree if level == 0 => {
                    latch_leaf_and_brothers(index, page_no, mtr)
                }
                _ => index.space.page_get(page_no, LatchMode::XFix, mtr),
            };
            let pos = page::page_cur_search(&block, index.format, tuple);
            return BtrCursor { block, pos };
        }
        debug_assert!(page_level > level, "descended past the target level");
        let pos = page::page_cur_search(&block, index.format, tuple);
        let slot = match pos {
            PagePos::Rec(slot) => slot,
            // Tuples below the min-rec-flagged leftmost pointer cannot
            // exist; descend through the first child regardless.
            _ => 0,
        };
        let bytes = page::rec_bytes(&block, index.format, slot);
        let view = RecView::decode(&bytes, index.format).expect("node pointer decodes");
        page_no = view.node_ptr_child().expect("node pointer has a child field");
    }
}

fn latch_leaf_and_brothers(index: &IndexDef, page_no: crate::types::PageNo, mtr: &mut Mtr) -> BlockRef {
    let probe = index.space.page_get_no_latch(page_no, mtr);
    let prev = page::page_prev(&probe);
    let next = page::page_next(&probe);
    if !prev.is_null() {
        index.space.page_get(prev, LatchMode::XFix, mtr);
    }
    let block = index.space.page_get(page_no, LatchMode::XFix, mtr);
    if !next.is_null() {
        index.space.page_get(next, LatchMode::XFix, mtr);
    }
    block
}

/// Inserts within the cursor's page if the record fits as-is. No tree
/// restructuring; `None` means the caller must go pessimistic.
pub fn optimistic_insert(
    cursor: &mut BtrCursor,
    index: &IndexDef,
    tuple: &Tuple,
    mtr: &mut Mtr,
) -> Option<u16> {
    let slot = page::page_cur_insert(&cursor.block, index.format, cursor.pos, tuple, mtr)?;
    if page::page_is_leaf(&cursor.block) && !index.flags.ibuf {
        super::alloc::update_free_bits_if_full(index, &cursor.block);
    }
    cursor.pos = PagePos::Rec(slot);
    Some(slot)
}

/// Inserts by restructuring: root raise when the cursor is on the root,
/// otherwise split. Reserves the two free pages the split machinery
/// needs (ibuf trees draw on their free list instead).
pub fn pessimistic_insert(
    cursor: &mut BtrCursor,
    index: &IndexDef,
    tuple: &Tuple,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    if !index.flags.ibuf {
        index.space.reserve_free_extents(2);
    }
    if cursor.block.page_no() == index.root_page_no() {
        split::root_raise_and_insert(cursor, index, tuple, mtr)
    } else {
        split::split_and_insert(cursor, index, tuple, mtr)
    }
}

/// Whether merging this page into a neighbor is worthwhile: it holds a
/// single record, or its payload is below half of an empty page.
pub fn compress_if_useful(index: &IndexDef, block: &BlockRef) -> bool {
    if block.page_no() == index.root_page_no() {
        return false;
    }
    let n = page::page_n_recs(block);
    n == 1 || page::page_data_size(block) < page::free_space_of_empty(index.space.page_size()) / 2
}

fn rec_was_min_flagged(index: &IndexDef, block: &BlockRef, slot: u16) -> bool {
    let bytes = page::rec_bytes(block, index.format, slot);
    let view = RecView::decode(&bytes, index.format).expect("record decodes");
    view.is_min_rec()
}

/// Deletes the record in `slot`, re-tagging the new leftmost record
/// when the deleted one carried the min-rec flag.
pub(crate) fn delete_rec_with_min_rec_care(
    index: &IndexDef,
    block: &BlockRef,
    slot: u16,
    mtr: &mut Mtr,
) {
    let n = page::page_n_recs(block);
    let was_min = rec_was_min_flagged(index, block, slot);
    page::page_delete_rec(block, index.format, slot, mtr);
    if was_min && n > 1 {
        debug_assert_eq!(slot, 0, "only the leftmost record carries the flag");
        super::set_min_rec_mark(block, 0, mtr);
    }
}

/// Deletes the record under the cursor, removing the whole page when it
/// holds nothing else, and merging when the page becomes nearly empty.
pub fn pessimistic_delete(cursor: &mut BtrCursor, index: &IndexDef, slot: u16, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    let block = Arc::clone(&cursor.block);
    let is_root = block.page_no() == index.root_page_no();
    if page::page_n_recs(&block) == 1 && !is_root {
        merge::discard_page(cursor, index, mtr);
        return;
    }
    delete_rec_with_min_rec_care(index, &block, slot, mtr);
    cursor.pos = PagePos::Infimum;
    if compress_if_useful(index, &block) {
        merge::compress(cursor, index, mtr);
    }
}

fn find_exact(cursor: &BtrCursor, index: &IndexDef, key: &Tuple) -> Option<u16> {
    match cursor.pos {
        PagePos::Rec(slot) => {
            let bytes = page::rec_bytes(&cursor.block, index.format, slot);
            let view = RecView::decode(&bytes, index.format).expect("record decodes");
            (cmp_tuple_rec(key, &view, key.cmp_fields()) == core::cmp::Ordering::Equal)
                .then_some(slot)
        }
        _ => None,
    }
}

/// Inserts a tuple into the tree, splitting as needed. Fails with
/// [`BasaltError::DuplicateKey`] on a unique index when the key exists.
pub fn insert(index: &IndexDef, tuple: &Tuple) -> Result<()> {
    if !index.flags.universal {
        assert_eq!(
            tuple.fields.len(),
            index.n_fields(),
            "tuple shape differs from the index schema"
        );
    }
    if tuple.converted_size(index.format) > crate::types::max_rec_size(index.space.page_size()) {
        return Err(BasaltError::Invalid("record too large for the page size"));
    }
    let mut mtr = Mtr::start(&index.space);
    // A unique index positions by key prefix, so an existing key lands
    // under the cursor whatever its remaining fields hold.
    let mut search_tuple = tuple.clone();
    if index.flags.unique {
        search_tuple.n_cmp = Some(index.n_uniq);
    }
    let mut cursor =
        search_to_nth_level(index, 0, &search_tuple, LatchIntent::ModifyTree, &mut mtr);
    if index.flags.unique && find_exact(&cursor, index, &search_tuple).is_some() {
        return Err(BasaltError::DuplicateKey);
    }
    if optimistic_insert(&mut cursor, index, tuple, &mut mtr).is_none() {
        trace!(
            target: "basalt_btree::insert",
            index = %index.id,
            page = cursor.block.page_no().0,
            "optimistic insert did not fit; going pessimistic"
        );
        pessimistic_insert(&mut cursor, index, tuple, &mut mtr);
    }
    mtr.commit();
    Ok(())
}

/// Deletes the record matching `key` exactly. Returns whether a record
/// was deleted.
pub fn delete(index: &IndexDef, key: &Tuple) -> Result<bool> {
    let mut mtr = Mtr::start(&index.space);
    let mut cursor = search_to_nth_level(index, 0, key, LatchIntent::ModifyTree, &mut mtr);
    let slot = match find_exact(&cursor, index, key) {
        Some(slot) => slot,
        None => {
            mtr.commit();
            return Ok(false);
        }
    };
    pessimistic_delete(&mut cursor, index, slot, &mut mtr);
    mtr.commit();
    Ok(true)
}

/// Looks a key up on the leaf level, read-latched.
pub fn get(index: &IndexDef, key: &Tuple) -> Result<Option<Tuple>> {
    let mut mtr = Mtr::start(&index.space);
    let cursor = search_to_nth_level(index, 0, key, LatchIntent::SearchLeaf, &mut mtr);
    let found = find_exact(&cursor, index, key).map(|slot| {
        let bytes = page::rec_bytes(&cursor.block, index.format, slot);
        let view = RecView::decode(&bytes, index.format).expect("record decodes");
        view.to_tuple()
    });
    mtr.commit();
    Ok(found)
}

/// Scans every user record of the leaf level in key order. Holds the
/// tree latch in shared mode for the duration of the walk.
pub fn scan_all(index: &IndexDef) -> Vec<Tuple> {
    let mut mtr = Mtr::start(&index.space);
    mtr.s_lock(&index.latch);
    let mut page_no = index.root_page_no();
    loop {
        let block = index.space.page_get_no_latch(page_no, &mut mtr);
        if page::page_is_leaf(&block) {
            break;
        }
        let bytes = page::rec_bytes(&block, index.format, 0);
        let view = RecView::decode(&bytes, index.format).expect("node pointer decodes");
        page_no = view.node_ptr_child().expect("node pointer has a child field");
    }
    let mut out = Vec::new();
    loop {
        let block = index.space.page_get(page_no, LatchMode::SFix, &mut mtr);
        let format = page_format(&block);
        for slot in 0..page::page_n_recs(&block) {
            let bytes = page::rec_bytes(&block, format, slot);
            let view = RecView::decode(&bytes, format).expect("record decodes");
            out.push(view.to_tuple());
        }
        let next = page::page_next(&block);
        if next.is_null() {
            break;
        }
        page_no = next;
    }
    mtr.commit();
    out
}
