//! Parent lookup: locating the node pointer that references a page.

use tracing::error;

use crate::buf::BlockRef;
use crate::index::IndexDef;
use crate::mtr::Mtr;
use crate::page::{self, PagePos};
use crate::record::{build_node_ptr, RecView};
use crate::types::PageNo;

use super::cursor::{search_to_nth_level, LatchIntent};

/// Positions on the node pointer the level above chooses for the record
/// in `user_slot` of `block`. No verification; the tree must be
/// X-latched by the mtr.
pub(crate) fn father_cursor(
    index: &IndexDef,
    block: &BlockRef,
    user_slot: u16,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    debug_assert!(mtr.memo_contains_x_lock(&index.latch));
    debug_assert!(page::page_n_recs(block) > 0);
    debug_assert_ne!(block.page_no(), index.root_page_no());

    let level = page::page_level(block);
    let bytes = page::rec_bytes(block, index.format, user_slot);
    let view = RecView::decode(&bytes, index.format).expect("user record decodes");
    let tuple = build_node_ptr(&view, index.n_uniq, PageNo(0));

    let cursor = search_to_nth_level(index, level + 1, &tuple, LatchIntent::ContModifyTree, mtr);
    match cursor.pos {
        PagePos::Rec(slot) => (cursor.block, slot),
        // The leftmost pointer of a level is min-rec flagged and sorts
        // below every search tuple, so an LE search cannot land before
        // the first record of a consistent page.
        other => panic!(
            "father search for page {} landed on {:?}",
            block.page_no(),
            other
        ),
    }
}

/// Returns the node pointer on the level above referencing `block`,
/// located through the record in `user_slot`. A child page number
/// mismatch means the tree is corrupted: both pages are dumped and the
/// process aborts.
pub fn get_father_for_rec(
    index: &IndexDef,
    block: &BlockRef,
    user_slot: u16,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    let (father_block, father_slot) = father_cursor(index, block, user_slot, mtr);
    let bytes = page::rec_bytes(&father_block, index.format, father_slot);
    let view = RecView::decode(&bytes, index.format).expect("node pointer decodes");
    let child = view.node_ptr_child().expect("node pointer has a child field");
    if child != block.page_no() {
        error!(
            target: "basalt_btree::father",
            table = %index.table_name,
            index_name = %index.name,
            father_ptr_child = %child,
            child_page = %block.page_no(),
            "corruption of an index tree: the father node pointer does not reference the child"
        );
        page::page_dump(block);
        page::page_dump(&father_block);
        panic!(
            "corrupted index tree: table {}, index {}: father points to {}, child is {}",
            index.table_name,
            index.name,
            child,
            block.page_no()
        );
    }
    (father_block, father_slot)
}

/// Returns the node pointer referencing `block`, located through its
/// first user record.
pub fn get_father_node_ptr(
    index: &IndexDef,
    block: &BlockRef,
    mtr: &mut Mtr,
) -> (BlockRef, u16) {
    get_father_for_rec(index, block, 0, mtr)
}
