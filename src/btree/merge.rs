//! Merges, level lifts and page discards: the shrink side of the tree.

use std::sync::Arc;

use tracing::trace;

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self, PagePos};
use crate::types::FIL_NULL;

use super::cursor::{self, delete_rec_with_min_rec_care, BtrCursor};
use super::{alloc, father, level_list_remove, page_empty, reorg, set_min_rec_mark};

/// Deletes the node pointer in `slot` of `father_block`, then merges the
/// father away if it has become nearly empty.
fn delete_node_ptr_at(index: &IndexDef, father_block: &BlockRef, slot: u16, mtr: &mut Mtr) {
    delete_rec_with_min_rec_care(index, father_block, slot, mtr);
    if cursor::compress_if_useful(index, father_block) {
        let mut father_cursor = BtrCursor {
            block: Arc::clone(father_block),
            pos: PagePos::Infimum,
        };
        compress(&mut father_cursor, index, mtr);
    }
}

/// Deletes, on the level above, the node pointer referencing `block`.
pub(crate) fn node_ptr_delete(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) {
    debug_assert!(mtr.memo_contains_page_x(block));
    let (father_block, slot) = father::get_father_node_ptr(index, block, mtr);
    delete_node_ptr_at(index, &father_block, slot, mtr);
}

/// Moves the records of a page that is alone on its level into the
/// root, reducing the tree height. A sole page's father necessarily
/// has it as its only child and is itself alone on its level, so the
/// ancestor chain runs straight to the root; the whole chain collapses
/// in one pass, keeping the level numbering contiguous. The page must
/// not be empty; removing the last record goes through
/// [`discard_page`] instead.
pub(crate) fn lift_page_up(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) {
    debug_assert_ne!(block.page_no(), index.root_page_no());
    debug_assert!(page::page_prev(block).is_null());
    debug_assert!(page::page_next(block).is_null());
    debug_assert!(page::page_n_recs(block) > 0);
    debug_assert!(mtr.memo_contains_page_x(block));

    // Resolve the ancestor chain before any level changes would upset
    // the level-targeted father searches.
    let mut chain = vec![Arc::clone(block)];
    while chain.last().unwrap().page_no() != index.root_page_no() {
        let top = Arc::clone(chain.last().unwrap());
        let (father_block, _slot) = father::get_father_node_ptr(index, &top, mtr);
        debug_assert_eq!(page::page_n_recs(&father_block), 1);
        debug_assert!(page::page_prev(&father_block).is_null());
        debug_assert!(page::page_next(&father_block).is_null());
        chain.push(father_block);
    }
    let root = chain.last().unwrap().clone();
    let page_level = page::page_level(block);

    index.space.drop_page_hash(block.page_no());

    page_empty(&root, index, mtr);
    // Set the level before moving records: the compressor requires the
    // min-rec convention of a non-leaf page to be in place.
    page::page_set_level(&root, page_level, mtr);

    if !page::page_copy_rec_list_end(&root, block, index.format, 0, mtr) {
        page::page_zip_copy(&root, block, mtr);
    }

    index
        .locks
        .update_copy_and_discard(root.page_no(), block.page_no());
    alloc::page_free(index, block, mtr);

    // Trivial single-child ancestors between the page and the root
    // disappear with it.
    for intermediate in &chain[1..chain.len() - 1] {
        index.locks.update_discard(root.page_no(), intermediate.page_no());
        alloc::page_free_low(index, intermediate, page::page_level(intermediate), mtr);
    }

    index.space.reset_free_bits(root.page_no());
    debug_assert!(page::page_validate(&root, index.format, index.n_uniq));
    debug_assert!(super::check_node_ptr(index, &root, mtr));

    trace!(
        target: "basalt_btree::merge",
        index = %index.id,
        lifted = block.page_no().0,
        collapsed = chain.len() - 2,
        root = root.page_no().0,
        level = page_level,
        "lifted page into the root"
    );
}

/// Tries to merge the cursor page into its left brother, then into its
/// right brother; a page alone on its level is lifted into its father
/// instead. Returns `false` when neither brother has room. The page
/// must not be empty: removing the last record uses [`discard_page`].
pub fn compress(cursor: &mut BtrCursor, index: &IndexDef, mtr: &mut Mtr) -> bool {
    let block = Arc::clone(&cursor.block);
    assert_eq!(page::page_is_comp(&block), index.is_comp());
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    debug_assert!(mtr.memo_contains_page_x(&block));

    let format = index.format;
    let left_page_no = page::page_prev(&block);
    let right_page_no = page::page_next(&block);

    let (father_block, father_slot) = father::get_father_node_ptr(index, &block, mtr);

    let is_left = !left_page_no.is_null();
    let merge_block = if is_left {
        let merge_block = index.space.page_get(left_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_next(&merge_block), block.page_no());
        merge_block
    } else if !right_page_no.is_null() {
        let merge_block = index.space.page_get(right_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_prev(&merge_block), block.page_no());
        merge_block
    } else {
        // The page is the only one on the level: lift it.
        lift_page_up(index, &block, mtr);
        return true;
    };

    let n_recs = page::page_n_recs(&block) as usize;
    let data_size = page::page_data_size(&block);
    debug_assert_eq!(page::page_is_comp(&merge_block), page::page_is_comp(&block));

    let max_ins_size_reorg = page::page_max_insert_size_after_reorganize(&merge_block, n_recs);
    if data_size > max_ins_size_reorg {
        return false;
    }
    debug_assert!(page::page_validate(&merge_block, format, index.n_uniq));

    let mut max_ins_size = page::page_max_insert_size(&merge_block, n_recs);
    if data_size > max_ins_size {
        if !reorg::page_reorganize(&merge_block, index, mtr) {
            return false;
        }
        max_ins_size = page::page_max_insert_size(&merge_block, n_recs);
        debug_assert_eq!(max_ins_size, max_ins_size_reorg);
        if data_size > max_ins_size {
            // Fault tolerance; this cannot happen.
            return false;
        }
    }

    if is_left {
        if !page::page_copy_rec_list_start(&merge_block, &block, format, n_recs as u16, mtr) {
            return false;
        }
        index.space.drop_page_hash(block.page_no());
        level_list_remove(&block, mtr);
        delete_node_ptr_at(index, &father_block, father_slot, mtr);
        index
            .locks
            .update_merge_left(merge_block.page_no(), block.page_no());
    } else {
        // The father entry of the merge page, located before the copy
        // prepends the records; this is the pointer that goes away.
        let (merge_father_block, merge_father_slot) =
            father::get_father_node_ptr(index, &merge_block, mtr);

        let saved_prev = page::page_prev(&merge_block);
        if page::page_has_zip(&merge_block) {
            // The compressor insists on FIL_PAGE_PREV == FIL_NULL while
            // a min-rec-flagged record is prepended; restore afterwards.
            page::page_set_prev_no_log(&merge_block, FIL_NULL);
        }
        let copied = page::page_copy_rec_list_end(&merge_block, &block, format, 0, mtr);
        if page::page_has_zip(&merge_block) {
            page::page_set_prev_no_log(&merge_block, saved_prev);
        }
        if !copied {
            return false;
        }
        index.space.drop_page_hash(block.page_no());
        level_list_remove(&block, mtr);

        // Keep the disappearing page's pointer, retargeted at the merge
        // page: it carries the correct lower bound (and possibly the
        // min-rec flag). The merge page's own pointer goes away.
        page::rec_set_node_ptr_child(&father_block, format, father_slot, right_page_no, mtr);
        delete_node_ptr_at(index, &merge_father_block, merge_father_slot, mtr);

        index
            .locks
            .update_merge_right(merge_block.page_no(), block.page_no());
    }

    alloc::update_free_bits_if_full(index, &merge_block);
    debug_assert!(page::page_validate(&merge_block, format, index.n_uniq));

    alloc::page_free(index, &block, mtr);
    debug_assert!(super::check_node_ptr(index, &merge_block, mtr));
    trace!(
        target: "basalt_btree::merge",
        index = %index.id,
        merged = block.page_no().0,
        into = merge_block.page_no().0,
        left = is_left,
        "merged page"
    );
    true
}

/// Discards a page whose last record is being removed; the whole page
/// goes away at once. Not for the root, which may legally become empty.
pub fn discard_page(cursor: &mut BtrCursor, index: &IndexDef, mtr: &mut Mtr) {
    let block = Arc::clone(&cursor.block);
    assert_ne!(block.page_no(), index.root_page_no());
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    debug_assert!(mtr.memo_contains_page_x(&block));

    let left_page_no = page::page_prev(&block);
    let right_page_no = page::page_next(&block);

    let merge_block = if !left_page_no.is_null() {
        let merge_block = index.space.page_get(left_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_next(&merge_block), block.page_no());
        merge_block
    } else if !right_page_no.is_null() {
        let merge_block = index.space.page_get(right_page_no, LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_prev(&merge_block), block.page_no());
        merge_block
    } else {
        discard_only_page_on_level(index, &block, mtr);
        return;
    };

    debug_assert_eq!(page::page_is_comp(&merge_block), page::page_is_comp(&block));
    index.space.drop_page_hash(block.page_no());

    if left_page_no.is_null() && !page::page_is_leaf(&block) {
        // The leftmost page of a non-leaf level disappears: the first
        // pointer of the right brother becomes the minimum of the
        // level. Transiently both the dying page's pointer and this one
        // carry the flag; the mini-transaction commits them together.
        set_min_rec_mark(&merge_block, 0, mtr);
    }

    node_ptr_delete(index, &block, mtr);
    level_list_remove(&block, mtr);

    index
        .locks
        .update_discard(merge_block.page_no(), block.page_no());

    alloc::page_free(index, &block, mtr);
    debug_assert!(super::check_node_ptr(index, &merge_block, mtr));
    trace!(
        target: "basalt_btree::merge",
        index = %index.id,
        discarded = block.page_no().0,
        heir = merge_block.page_no().0,
        "discarded page"
    );
}

/// Discards a page that is alone on its level, walking the chain of
/// single-child ancestors up to the root, which is emptied rather than
/// freed and takes over the discarded page's level.
pub(crate) fn discard_only_page_on_level(index: &IndexDef, block: &BlockRef, mtr: &mut Mtr) {
    let mut block = Arc::clone(block);
    let page_level = page::page_level(&block);
    loop {
        debug_assert!(page::page_prev(&block).is_null());
        debug_assert!(page::page_next(&block).is_null());
        debug_assert!(mtr.memo_contains_page_x(&block));
        index.space.drop_page_hash(block.page_no());
        if block.page_no() == index.root_page_no() {
            break;
        }
        let (father_block, _slot) = father::get_father_node_ptr(index, &block, mtr);
        index
            .locks
            .update_discard(father_block.page_no(), block.page_no());
        alloc::page_free(index, &block, mtr);
        debug_assert_eq!(page::page_n_recs(&father_block), 1);
        block = father_block;
    }
    page_empty(&block, index, mtr);
    page::page_set_level(&block, page_level, mtr);
    index.space.reset_free_bits(block.page_no());
    trace!(
        target: "basalt_btree::merge",
        index = %index.id,
        root = block.page_no().0,
        level = page_level,
        "collapsed level chain into an empty root"
    );
}
