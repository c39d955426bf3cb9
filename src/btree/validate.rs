//! Tree-wide consistency checking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self};
use crate::record::{build_node_ptr, cmp_rec_rec, cmp_tuple_rec, RecView};
use crate::types::PageNo;

use super::{father, node_ptr_get_child, root_get};

fn is_interrupted(interrupt: Option<&AtomicBool>) -> bool {
    interrupt.map_or(false, |flag| flag.load(Ordering::Relaxed))
}

fn report_page(index: &IndexDef, level: u16, block: &BlockRef, what: &str) {
    error!(
        target: "basalt_btree::validate",
        table = %index.table_name,
        index_name = %index.name,
        level,
        page = block.page_no().0,
        what,
        "validation error"
    );
    page::page_dump(block);
}

fn report_pages(index: &IndexDef, level: u16, a: &BlockRef, b: &BlockRef, what: &str) {
    error!(
        target: "basalt_btree::validate",
        table = %index.table_name,
        index_name = %index.name,
        level,
        page_a = a.page_no().0,
        page_b = b.page_no().0,
        what,
        "validation error"
    );
    page::page_dump(a);
    page::page_dump(b);
}

/// Checks the field count and per-field lengths of one record against
/// the index schema. Universal trees accept records from any index and
/// skip the check.
pub fn index_rec_validate(
    block: &BlockRef,
    index: &IndexDef,
    slot: u16,
    dump_on_error: bool,
) -> bool {
    if index.flags.universal {
        return true;
    }
    if page::page_is_comp(block) != index.is_comp() {
        if dump_on_error {
            report_page(index, 0, block, "compact flag differs from the index");
        }
        return false;
    }
    let bytes = page::rec_bytes(block, index.format, slot);
    let view = match RecView::decode(&bytes, index.format) {
        Ok(view) => view,
        Err(_) => {
            if dump_on_error {
                report_page(index, 0, block, "record does not decode");
            }
            return false;
        }
    };
    if view.n_fields() != index.n_fields() {
        if dump_on_error {
            report_page(index, 0, block, "wrong number of fields");
        }
        return false;
    }
    for (i, col) in index.cols.iter().enumerate() {
        let len = view.field_len(i) as u16;
        // Prefix columns are never fixed-size, whatever the base type.
        let bad = match (col.prefix_len, col.fixed_len) {
            (Some(prefix), _) => len > prefix,
            (None, Some(fixed)) => len != fixed,
            (None, None) => false,
        };
        if bad {
            if dump_on_error {
                report_page(index, 0, block, "field length violates the schema");
            }
            return false;
        }
    }
    true
}

fn index_page_validate(block: &BlockRef, index: &IndexDef) -> bool {
    for slot in 0..page::page_n_recs(block) {
        if !index_rec_validate(block, index, slot, true) {
            return false;
        }
    }
    true
}

fn first_rec_view_min_flagged(block: &BlockRef, index: &IndexDef) -> bool {
    let bytes = page::rec_bytes(block, index.format, 0);
    RecView::decode(&bytes, index.format)
        .map(|view| view.is_min_rec())
        .unwrap_or(false)
}

fn validate_level(index: &IndexDef, interrupt: Option<&AtomicBool>, level: u16) -> bool {
    let mut ret = true;

    let mut mtr = Mtr::start(&index.space);
    mtr.x_lock(&index.latch);
    let mut block = root_get(index, &mut mtr);
    while page::page_level(&block) != level {
        debug_assert!(!page::page_is_leaf(&block));
        block = node_ptr_get_child(index, &block, 0, &mut mtr);
    }

    loop {
        if is_interrupted(interrupt) {
            mtr.commit();
            return ret;
        }

        if !page::page_validate(&block, index.format, index.n_uniq) {
            report_page(index, level, &block, "page self-check failed");
            ret = false;
        } else if level == 0 && !index_page_validate(&block, index) {
            ret = false;
        }

        assert_eq!(page::page_level(&block), level);

        let right_page_no = page::page_next(&block);
        let left_page_no = page::page_prev(&block);

        assert!(
            page::page_n_recs(&block) > 0
                || (level == 0 && block.page_no() == index.root_page_no())
        );

        let mut right_block = None;
        let mut comp_mismatch = false;
        if !right_page_no.is_null() {
            let right = index.space.page_get(right_page_no, LatchMode::XFix, &mut mtr);
            if page::page_prev(&right) != block.page_no() {
                report_pages(index, level, &block, &right, "broken level list links");
                ret = false;
            }
            if page::page_is_comp(&right) != page::page_is_comp(&block) {
                report_pages(index, level, &block, &right, "compact flag mismatch");
                ret = false;
                comp_mismatch = true;
            } else {
                let last = page::rec_bytes(&block, index.format, page::page_n_recs(&block) - 1);
                let first = page::rec_bytes(&right, index.format, 0);
                let last_view = RecView::decode(&last, index.format).expect("record decodes");
                let first_view = RecView::decode(&first, index.format).expect("record decodes");
                if cmp_rec_rec(&last_view, &first_view, index.n_uniq)
                    == core::cmp::Ordering::Greater
                {
                    report_pages(
                        index,
                        level,
                        &block,
                        &right,
                        "records in wrong order on adjacent pages",
                    );
                    ret = false;
                }
            }
            right_block = Some(right);
        }

        if level > 0 && left_page_no.is_null() && !first_rec_view_min_flagged(&block, index) {
            report_page(
                index,
                level,
                &block,
                "leftmost page of the level lacks the min-rec flag",
            );
            ret = false;
        }

        if block.page_no() != index.root_page_no() && !comp_mismatch {
            ret &= validate_father(
                index,
                level,
                &block,
                left_page_no,
                right_page_no,
                right_block.as_ref(),
                &mut mtr,
            );
        }

        // Commit to release the latches; the right page becomes the
        // current page of the next round under a fresh mtr.
        mtr.commit();
        if right_page_no.is_null() {
            break;
        }
        mtr = Mtr::start(&index.space);
        mtr.x_lock(&index.latch);
        block = index.space.page_get(right_page_no, LatchMode::XFix, &mut mtr);
    }
    ret
}

fn validate_father(
    index: &IndexDef,
    level: u16,
    block: &BlockRef,
    left_page_no: PageNo,
    right_page_no: PageNo,
    right_block: Option<&BlockRef>,
    mtr: &mut Mtr,
) -> bool {
    let mut ret = true;
    let (father_block, father_slot) = father::father_cursor(index, block, 0, mtr);

    let father_bytes = page::rec_bytes(&father_block, index.format, father_slot);
    let father_view = RecView::decode(&father_bytes, index.format).expect("node pointer decodes");
    let child_ok = father_view
        .node_ptr_child()
        .map(|child| child == block.page_no())
        .unwrap_or(false);

    let last_slot = page::page_n_recs(block) - 1;
    let (father_block2, father_slot2) = father::father_cursor(index, block, last_slot, mtr);
    let same_through_last =
        Arc::ptr_eq(&father_block, &father_block2) && father_slot == father_slot2;

    if !child_ok || !same_through_last {
        report_pages(
            index,
            level,
            &father_block,
            block,
            "node pointer to the page is wrong",
        );
        return false;
    }

    if !page::page_is_leaf(block) {
        let first = page::rec_bytes(block, index.format, 0);
        let first_view = RecView::decode(&first, index.format).expect("record decodes");
        let tuple = build_node_ptr(&first_view, index.n_uniq, PageNo(0));
        if cmp_tuple_rec(&tuple, &father_view, index.n_uniq) != core::cmp::Ordering::Equal {
            report_pages(
                index,
                level,
                &father_block,
                block,
                "node pointer key differs from the first record",
            );
            ret = false;
        }
    }

    if left_page_no.is_null() {
        if father_slot != 0 || !page::page_prev(&father_block).is_null() {
            report_page(
                index,
                level,
                &father_block,
                "leftmost page's father is not leftmost",
            );
            ret = false;
        }
    }
    if right_page_no.is_null() {
        if father_slot + 1 != page::page_n_recs(&father_block)
            || !page::page_next(&father_block).is_null()
        {
            report_page(
                index,
                level,
                &father_block,
                "rightmost page's father is not rightmost",
            );
            ret = false;
        }
    } else if let Some(right_block) = right_block {
        let (right_father_block, right_father_slot) =
            father::father_cursor(index, right_block, 0, mtr);
        if father_slot + 1 < page::page_n_recs(&father_block) {
            if !Arc::ptr_eq(&right_father_block, &father_block)
                || right_father_slot != father_slot + 1
            {
                report_pages(
                    index,
                    level,
                    &father_block,
                    right_block,
                    "node pointer to the right page is wrong",
                );
                ret = false;
            }
        } else {
            if right_father_slot != 0 {
                report_pages(
                    index,
                    level,
                    &right_father_block,
                    right_block,
                    "right page's father position is wrong",
                );
                ret = false;
            }
            if right_father_block.page_no() != page::page_next(&father_block) {
                report_pages(
                    index,
                    level,
                    &father_block,
                    &right_father_block,
                    "father pages are not linked",
                );
                ret = false;
            }
        }
    }
    ret
}

/// Walks every level of the tree, root down, verifying the page,
/// level-list, ordering, min-rec and father-pointer invariants.
/// Honors the interrupt flag between pages and returns the partial
/// result when stopped.
pub fn validate_index(index: &IndexDef, interrupt: Option<&AtomicBool>) -> bool {
    let mut mtr = Mtr::start(&index.space);
    mtr.x_lock(&index.latch);
    let root = root_get(index, &mut mtr);
    let height = page::page_level(&root);
    mtr.commit();

    for i in 0..=height {
        if is_interrupted(interrupt) {
            break;
        }
        if !validate_level(index, interrupt, height - i) {
            return false;
        }
    }
    true
}
