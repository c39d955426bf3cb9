//! Tree creation and teardown.

use std::sync::Arc;

use tracing::debug;

use crate::buf::Space;
use crate::fseg::{fseg_alloc_free_page, fseg_create, fseg_free_step, fseg_free_step_not_header};
use crate::index::{IndexDef, IndexFlags};
use crate::mtr::{LatchMode, Mtr};
use crate::page::{self, header};
use crate::types::{
    max_rec_size, Direction, IndexId, PageNo, FIL_NULL, IBUF_HEADER_PAGE_NO,
    IBUF_TREE_ROOT_PAGE_NO,
};

/// Creates the root of a new index tree and returns its page number, or
/// `None` when no page could be allocated.
///
/// For an ibuf tree the non-leaf segment lives on a separate header
/// page, the first page allocated from it must be the fixed ibuf root,
/// and the in-tree free list is initialized. Other trees anchor both
/// segment headers on the root page itself.
pub fn create(
    flags: IndexFlags,
    space: &Arc<Space>,
    index_id: IndexId,
    index: &IndexDef,
    mtr: &mut Mtr,
) -> Option<PageNo> {
    let block = if flags.ibuf {
        let ibuf_hdr_block = fseg_create(space, None, header::SEG_TOP, mtr)?;
        assert_eq!(
            ibuf_hdr_block.page_no(),
            IBUF_HEADER_PAGE_NO,
            "ibuf header page must be the first page of the space"
        );
        let page_no = fseg_alloc_free_page(
            space,
            &ibuf_hdr_block,
            header::SEG_TOP,
            IBUF_TREE_ROOT_PAGE_NO,
            Direction::Up,
            mtr,
        )?;
        assert_eq!(
            page_no, IBUF_TREE_ROOT_PAGE_NO,
            "first page of the ibuf segment must be the ibuf tree root"
        );
        space.page_get(page_no, LatchMode::XFix, mtr)
    } else {
        let block = fseg_create(space, None, header::SEG_TOP, mtr)?;
        fseg_create(space, Some(block.page_no()), header::SEG_LEAF, mtr)?;
        block
    };
    let page_no = block.page_no();

    if page::page_has_zip(&block) {
        page::page_create_zip(&block, index.is_comp(), 0, mtr);
    } else {
        page::page_create(&block, index.is_comp(), mtr);
        page::page_set_level(&block, 0, mtr);
    }
    page::page_set_index_id(&block, index_id.0, mtr);
    page::page_set_next(&block, FIL_NULL, mtr);
    page::page_set_prev(&block, FIL_NULL, mtr);

    if flags.ibuf {
        page::ibuf_free_list_init(&block, mtr);
    }

    // Reset the free bits here so several trees can be created in one
    // mtr without meeting the bitmap latch twice.
    space.reset_free_bits(page_no);

    // Two records of maximum allowed size must fit on the empty root;
    // the split algorithms depend on it.
    assert!(page::page_max_insert_size(&block, 2) > 2 * max_rec_size(space.page_size()));

    debug!(
        target: "basalt_btree::lifecycle",
        index = %index_id,
        root = page_no.0,
        ibuf = flags.ibuf,
        "created tree"
    );
    Some(page_no)
}

/// Creates the tree in its own mini-transaction and installs the root
/// on the descriptor.
pub fn bootstrap(index: &IndexDef) -> Option<PageNo> {
    let mut mtr = Mtr::start(&index.space);
    let root = create(index.flags, &index.space, index.id, index, &mut mtr)?;
    index.set_root_page_no(root);
    mtr.commit();
    Some(root)
}

/// Frees every page of the tree except the root. Each free step runs in
/// its own mini-transaction so log-space pressure stays bounded; the
/// root must be freed afterwards with [`free_root`].
pub fn free_but_not_root(space: &Arc<Space>, root_page_no: PageNo) {
    loop {
        let mut mtr = Mtr::start(space);
        let root = space.page_get(root_page_no, LatchMode::XFix, &mut mtr);
        // Page hash entries are dropped when a page is freed inside the
        // segment allocator.
        let finished = fseg_free_step(space, &root, header::SEG_LEAF, &mut mtr);
        mtr.commit();
        if finished {
            break;
        }
    }
    loop {
        let mut mtr = Mtr::start(space);
        let root = space.page_get(root_page_no, LatchMode::XFix, &mut mtr);
        let finished = fseg_free_step_not_header(space, &root, header::SEG_TOP, &mut mtr);
        mtr.commit();
        if finished {
            break;
        }
    }
}

/// Frees the root page within the caller's mini-transaction. The rest
/// of the tree must already have been freed.
pub fn free_root(space: &Arc<Space>, root_page_no: PageNo, mtr: &mut Mtr) {
    let block = space.page_get(root_page_no, LatchMode::XFix, mtr);
    space.drop_page_hash(root_page_no);
    while !fseg_free_step(space, &block, header::SEG_TOP, mtr) {}
}
