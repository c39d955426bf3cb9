//! Page splits, their upward propagation, and root raise.

use std::sync::Arc;

use tracing::trace;

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::mtr::Mtr;
use crate::page::{self, PagePos};
use crate::record::{build_node_ptr, cmp_tuple_rec, RecView, Tuple};
use crate::types::{Direction, PageNo, FIL_NULL};

use super::cursor::{self, search_to_nth_level, BtrCursor, LatchIntent};
use super::{alloc, father, page_create_block, reorg};

/// Split point on the cursor page: at an existing record, or at the
/// record about to be inserted (which becomes the first record of the
/// upper half).
type SplitPoint = Option<u16>;

/// Detects inserts converging to the left of the cursor: the previous
/// insert went to the record right after the insert point. Returns the
/// split slot when the pattern holds.
fn split_rec_to_left(block: &BlockRef, pos: PagePos) -> Option<u16> {
    let last_insert = page::page_last_insert(block)?;
    let next_slot = pos.insert_index();
    if next_slot >= page::page_n_recs(block)
        || page::rec_offset(block, next_slot) != last_insert
    {
        return None;
    }
    // If the convergence point is in the middle of the page, keep the
    // insert point itself on the upper half; otherwise records smaller
    // than the convergence point would be shuffled page to page on
    // every split.
    match pos {
        PagePos::Rec(slot) if slot >= 1 => Some(slot),
        _ => Some(next_slot),
    }
}

/// Detects sequential inserts converging to the right: the previous
/// insert went exactly to the insert point. Returns the split point;
/// one record is left on the lower half so the adaptive hash keeps
/// serving position checks for the ascending pattern.
fn split_rec_to_right(block: &BlockRef, pos: PagePos) -> Option<SplitPoint> {
    let last_insert = page::page_last_insert(block)?;
    let slot = match pos {
        PagePos::Rec(slot) if page::rec_offset(block, slot) == last_insert => slot,
        _ => return None,
    };
    let n = page::page_n_recs(block);
    if slot + 2 >= n {
        // Fewer than two records above the insert point: split at the
        // record to insert.
        Some(None)
    } else {
        Some(Some(slot + 2))
    }
}

/// Calculates a split record such that the tuple certainly fits on its
/// half-page. Walks the records (with the tuple spliced in at the
/// cursor) accumulating reserved space until half of the total is
/// covered. Assumes the page has at least one user record.
fn get_sure_split_rec(
    block: &BlockRef,
    index: &IndexDef,
    tuple: &Tuple,
    ins_index: u16,
) -> SplitPoint {
    let format = index.format;
    let page_size = index.space.page_size();
    let n = page::page_n_recs(block) as usize;
    let ins_index = ins_index as usize;

    let insert_size = tuple.converted_size(format);
    let free_space = page::free_space_of_empty(page_size);
    let total_data = page::page_data_size(block) + insert_size;
    let total_n = n + 1;
    debug_assert!(total_n >= 2);
    let total_space = total_data + page::dir_reserve(total_n);

    let entry_size = |k: usize| -> usize {
        if k == ins_index {
            insert_size
        } else {
            let slot = if k < ins_index { k } else { k - 1 };
            page::rec_bytes(block, format, slot as u16).len()
        }
    };

    let mut incl_data = 0usize;
    let mut k = 0usize;
    loop {
        incl_data += entry_size(k);
        if incl_data + page::dir_reserve(k + 1) >= total_space / 2 {
            break;
        }
        k += 1;
        debug_assert!(k < total_n);
    }

    let fits_left = incl_data + page::dir_reserve(k + 1) <= free_space;
    let pick = if fits_left && k + 1 < total_n { k + 1 } else { k };
    if pick == ins_index {
        None
    } else {
        let slot = if pick < ins_index { pick } else { pick - 1 };
        Some(slot as u16)
    }
}

/// Conservative check that, once the records beyond the split point
/// have moved away, the half receiving the tuple has room for it.
fn insert_fits(
    block: &BlockRef,
    index: &IndexDef,
    split: SplitPoint,
    ins_index: u16,
    tuple: &Tuple,
) -> bool {
    let format = index.format;
    let free_space = page::free_space_of_empty(index.space.page_size());
    let n = page::page_n_recs(block);
    let mut total_data = page::page_data_size(block) + tuple.converted_size(format);
    let mut total_n = n as usize + 1;

    // Records in [range_start, range_end) end up on the other half.
    let (range_start, range_end) = match split {
        None => (0, ins_index),
        Some(split_slot) => {
            let bytes = page::rec_bytes(block, format, split_slot);
            let view = RecView::decode(&bytes, format).expect("split record decodes");
            if cmp_tuple_rec(tuple, &view, tuple.cmp_fields()) != core::cmp::Ordering::Less {
                (0, split_slot)
            } else {
                (split_slot, n)
            }
        }
    };

    if total_data + page::dir_reserve(total_n) <= free_space {
        return true;
    }
    for slot in range_start..range_end {
        total_data -= page::rec_bytes(block, format, slot).len();
        total_n -= 1;
        if total_data + page::dir_reserve(total_n) <= free_space {
            return true;
        }
    }
    false
}

/// Inserts a node pointer on a non-leaf level, splitting upward as
/// needed. The tree must be X-latched; a failure to insert means the
/// caller did not reserve enough pages, which is a bug.
pub(crate) fn insert_on_non_leaf_level(
    index: &IndexDef,
    level: u16,
    tuple: &Tuple,
    mtr: &mut Mtr,
) {
    debug_assert!(level > 0);
    let mut cursor = search_to_nth_level(index, level, tuple, LatchIntent::ContModifyTree, mtr);
    if page::page_cur_insert(&cursor.block, index.format, cursor.pos, tuple, mtr).is_some() {
        return;
    }
    if reorg::page_reorganize(&cursor.block, index, mtr) {
        cursor.pos = page::page_cur_search(&cursor.block, index.format, tuple);
        if page::page_cur_insert(&cursor.block, index.format, cursor.pos, tuple, mtr).is_some() {
            return;
        }
    }
    cursor::pessimistic_insert(&mut cursor, index, tuple, mtr);
}

/// Attaches the two halves of a split to the tree: fixes the parent
/// node pointers, inserts the upper half's pointer one level up (which
/// may split recursively), and links the halves into the level list.
fn attach_half_pages(
    index: &IndexDef,
    block: &BlockRef,
    upper_first: &Tuple,
    new_block: &BlockRef,
    direction: Direction,
    mtr: &mut Mtr,
) {
    debug_assert!(mtr.memo_contains_page_x(block));
    debug_assert!(mtr.memo_contains_page_x(new_block));
    debug_assert_eq!(page::page_is_comp(block), page::page_is_comp(new_block));

    let (lower_no, upper_no) = if direction == Direction::Down {
        // The new page becomes the lower half: the existing parent
        // pointer must lead to it.
        let (father_block, father_slot) = father::get_father_node_ptr(index, block, mtr);
        page::rec_set_node_ptr_child(
            &father_block,
            index.format,
            father_slot,
            new_block.page_no(),
            mtr,
        );
        (new_block.page_no(), block.page_no())
    } else {
        (block.page_no(), new_block.page_no())
    };
    let (lower, upper) = if direction == Direction::Down {
        (new_block, block)
    } else {
        (block, new_block)
    };

    let level = page::page_level(block);

    // Node pointer for the upper half; inserting it may split the
    // parent, recursing up to the root.
    let mut node_ptr_upper = Tuple {
        min_rec: false,
        n_cmp: Some(index.n_uniq),
        fields: upper_first.fields.iter().take(index.n_uniq).cloned().collect(),
    };
    node_ptr_upper
        .fields
        .push(upper_no.0.to_be_bytes().to_vec());
    insert_on_non_leaf_level(index, level + 1, &node_ptr_upper, mtr);

    let prev_page_no = page::page_prev(block);
    let next_page_no = page::page_next(block);
    let space = Arc::clone(mtr.space());

    if !prev_page_no.is_null() {
        let prev_block = space.page_get(prev_page_no, crate::mtr::LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_next(&prev_block), block.page_no());
        page::page_set_next(&prev_block, lower_no, mtr);
    }
    if !next_page_no.is_null() {
        let next_block = space.page_get(next_page_no, crate::mtr::LatchMode::XFix, mtr);
        debug_assert_eq!(page::page_prev(&next_block), block.page_no());
        page::page_set_prev(&next_block, upper_no, mtr);
    }

    page::page_set_prev(lower, prev_page_no, mtr);
    page::page_set_next(lower, upper_no, mtr);
    page::page_set_level(lower, level, mtr);

    page::page_set_prev(upper, lower_no, mtr);
    page::page_set_next(upper, next_page_no, mtr);
    page::page_set_level(upper, level, mtr);
}

/// Splits the cursor page and inserts the tuple. The tree must be
/// X-latched and two free pages reserved; under those preconditions the
/// operation always succeeds. The tree latch may be released before the
/// records are moved when the insert provably fits an uncompressed
/// leaf half.
pub fn split_and_insert(
    cursor: &mut BtrCursor,
    index: &IndexDef,
    tuple: &Tuple,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    let mut n_iterations = 0u32;
    loop {
        debug_assert!(mtr.memo_contains_x_lock(&index.latch));
        let block = Arc::clone(&cursor.block);
        debug_assert!(mtr.memo_contains_page_x(&block));
        assert!(page::page_n_recs(&block) >= 1);
        let page_no = block.page_no();
        let level = page::page_level(&block);
        let format = index.format;

        // 1. Decide the split record; `None` means the tuple to insert
        // becomes the first record on the upper half-page.
        let (direction, hint_page_no, split): (Direction, PageNo, SplitPoint) =
            if n_iterations > 0 {
                let split = get_sure_split_rec(&block, index, tuple, cursor.pos.insert_index());
                (Direction::Up, PageNo(page_no.0 + 1), split)
            } else if let Some(split) = split_rec_to_right(&block, cursor.pos) {
                (Direction::Up, PageNo(page_no.0 + 1), split)
            } else if let Some(slot) = split_rec_to_left(&block, cursor.pos) {
                (Direction::Down, PageNo(page_no.0.saturating_sub(1)), Some(slot))
            } else {
                let middle = page::page_middle_slot(&block);
                // A single-record page cannot seed both halves from its
                // own records; the side of the new record decides.
                let split = if middle == 0 && cursor.pos != PagePos::Infimum {
                    None
                } else {
                    Some(middle)
                };
                (Direction::Up, PageNo(page_no.0 + 1), split)
            };

        // 2. Allocate the sibling.
        let new_block = alloc::page_alloc(index, hint_page_no, direction, level, mtr)
            .expect("two free pages were reserved before the split");
        page_create_block(&new_block, index, level, mtr);

        // 3. First record on the upper half, and the limit from which
        // records move off the cursor page.
        let (upper_first, move_limit) = match split {
            Some(slot) => {
                let bytes = page::rec_bytes(&block, format, slot);
                let view = RecView::decode(&bytes, format).expect("split record decodes");
                (view.to_tuple(), slot)
            }
            None => (tuple.clone(), cursor.pos.insert_index()),
        };

        // 4. Modify the tree structure first.
        attach_half_pages(index, &block, &upper_first, &new_block, direction, mtr);

        let insert_left = match split {
            Some(slot) => {
                let bytes = page::rec_bytes(&block, format, slot);
                let view = RecView::decode(&bytes, format).expect("split record decodes");
                cmp_tuple_rec(tuple, &view, tuple.cmp_fields()) == core::cmp::Ordering::Less
            }
            None => false,
        };
        let insert_will_fit =
            insert_fits(&block, index, split, cursor.pos.insert_index(), tuple);

        // With the new structure committed to the redo stream, moving
        // records no longer needs the tree latch, provided the insert
        // cannot fail afterwards. Compressed pages keep the latch: the
        // fit check cannot be trusted through a fallible compressor.
        if insert_will_fit && page::page_is_leaf(&block) && !page::page_has_zip(&block) {
            mtr.memo_release_x_lock(&index.latch);
        }

        // 5. Move the records.
        let (left_block, right_block) = if direction == Direction::Down {
            let limit = split.expect("a down split always has a split record");
            if !page::page_move_rec_list_start(&new_block, &block, format, limit, mtr) {
                // Compressing the partial page failed: copy the page
                // byte for byte, then delete the opposite sides. The
                // deletes only shrink pages and cannot fail.
                page::page_zip_copy(&new_block, &block, mtr);
                page::page_delete_rec_list_end(&new_block, format, limit, mtr);
                page::page_delete_rec_list_start(&block, format, limit, mtr);
            }
            index
                .locks
                .update_split_left(block.page_no(), new_block.page_no());
            (Arc::clone(&new_block), Arc::clone(&block))
        } else {
            let limit = split.unwrap_or_else(|| cursor.pos.insert_index());
            if !page::page_move_rec_list_end(&new_block, &block, format, limit, mtr) {
                page::page_zip_copy(&new_block, &block, mtr);
                page::page_delete_rec_list_start(&new_block, format, limit, mtr);
                page::page_delete_rec_list_end(&block, format, limit, mtr);
            }
            index
                .locks
                .update_split_right(new_block.page_no(), block.page_no());
            (Arc::clone(&block), Arc::clone(&new_block))
        };

        // 6. Insert on the half the tuple belongs to.
        let insert_block = if insert_left {
            Arc::clone(&left_block)
        } else {
            Arc::clone(&right_block)
        };
        let mut pos = page::page_cur_search(&insert_block, format, tuple);
        if let Some(slot) = page::page_cur_insert(&insert_block, format, pos, tuple, mtr) {
            alloc::update_free_bits_for_two_pages(index, &left_block, &right_block, mtr);
            trace!(
                target: "basalt_btree::split",
                index = %index.id,
                left = left_block.page_no().0,
                right = right_block.page_no().0,
                ?direction,
                "split and insert done"
            );
            cursor.position(insert_block, PagePos::Rec(slot));
            return (Arc::clone(&cursor.block), slot);
        }

        // 7. The insert did not fit: reorganize the target and retry.
        if reorg::page_reorganize(&insert_block, index, mtr) {
            pos = page::page_cur_search(&insert_block, format, tuple);
            if let Some(slot) = page::page_cur_insert(&insert_block, format, pos, tuple, mtr) {
                alloc::update_free_bits_for_two_pages(index, &left_block, &right_block, mtr);
                debug_assert!(page::page_validate(&left_block, format, index.n_uniq));
                debug_assert!(page::page_validate(&right_block, format, index.n_uniq));
                cursor.position(insert_block, PagePos::Rec(slot));
                return (Arc::clone(&cursor.block), slot);
            }
        }

        // Still no fit: loop back for a new split round with the
        // guaranteed-fit computation. Two iterations suffice unless the
        // page is compressed.
        index.space.reset_free_bits(new_block.page_no());
        n_iterations += 1;
        debug_assert!(n_iterations < 2 || page::page_has_zip(&insert_block));
        debug_assert!(!insert_will_fit || page::page_has_zip(&insert_block));
        let pos = page::page_cur_search(&insert_block, format, tuple);
        cursor.position(insert_block, pos);
        trace!(
            target: "basalt_btree::split",
            index = %index.id,
            page = cursor.block.page_no().0,
            n_iterations,
            "split second round"
        );
    }
}

/// Makes the tree one level higher by moving the root's records to a
/// fresh page, re-creating the root one level up with a single
/// min-rec-flagged node pointer, and then splitting the new page to
/// place the tuple. The operation must always succeed; the caller
/// guarantees the free pages.
pub fn root_raise_and_insert(
    cursor: &mut BtrCursor,
    index: &IndexDef,
    tuple: &Tuple,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    let root = Arc::clone(&cursor.block);
    debug_assert_eq!(root.page_no(), index.root_page_no());
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    debug_assert!(mtr.memo_contains_page_x(&root));
    index.space.drop_page_hash(root.page_no());

    let level = page::page_level(&root);
    let format = index.format;

    let new_block = alloc::page_alloc(index, PageNo(0), Direction::NoDir, level, mtr)
        .expect("free pages were reserved before the root raise");
    debug_assert_eq!(page::page_has_zip(&new_block), page::page_has_zip(&root));
    page_create_block(&new_block, index, level, mtr);
    page::page_set_next(&new_block, FIL_NULL, mtr);
    page::page_set_prev(&new_block, FIL_NULL, mtr);

    if !page::page_copy_rec_list_end(&new_block, &root, format, 0, mtr) {
        // Compression failed although the content is identical: copy
        // the page byte for byte instead.
        page::page_zip_copy(&new_block, &root, mtr);
    }

    // A pessimistic update may have parked lock information on the root
    // infimum; the lock manager keeps it alive across the raise.
    index
        .locks
        .update_root_raise(new_block.page_no(), root.page_no());

    let first = page::rec_bytes(&new_block, format, 0);
    let first_view = RecView::decode(&first, format).expect("first record decodes");
    let mut node_ptr = build_node_ptr(&first_view, index.n_uniq, new_block.page_no());
    // The node pointer of a leftmost subtree is the predefined minimum
    // record of its level.
    node_ptr.min_rec = true;

    // Rebuild the root one level up. The prev pointer must stay
    // FIL_NULL: the min-rec flag of the first record is tied to being
    // leftmost of the level.
    if page::page_has_zip(&root) {
        page::page_create_zip(&root, index.is_comp(), level + 1, mtr);
    } else {
        page::page_create(&root, index.is_comp(), mtr);
        page::page_set_level(&root, level + 1, mtr);
    }
    page::page_set_next(&root, FIL_NULL, mtr);
    page::page_set_prev(&root, FIL_NULL, mtr);

    let inserted = page::page_cur_insert(&root, format, PagePos::Infimum, &node_ptr, mtr);
    assert!(
        inserted.is_some(),
        "the emptied root holds a single node pointer"
    );

    index.space.reset_free_bits(new_block.page_no());

    trace!(
        target: "basalt_btree::split",
        index = %index.id,
        root = root.page_no().0,
        new_page = new_block.page_no().0,
        new_level = level + 1,
        "root raise"
    );

    let pos = page::page_cur_search(&new_block, format, tuple);
    cursor.position(new_block, pos);
    split_and_insert(cursor, index, tuple, mtr)
}
