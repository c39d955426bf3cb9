//! File-segment allocator.
//!
//! Every tree owns two segments (leaf and non-leaf); an ibuf tree owns a
//! single one anchored on its header page. The on-page segment header
//! stores only the segment id; the inode (the list of pages the segment
//! owns) lives in the space's segment table. Pages are handed out near a
//! hint with a direction preference and return to the space free pool
//! when released.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::buf::{BlockRef, Space};
use crate::mtr::{LatchMode, Mtr};
use crate::page;
use crate::types::{Direction, PageNo};

#[derive(Default)]
struct SegInode {
    pages: Vec<u32>,
}

/// Inode table of one space, keyed by segment id.
#[derive(Default)]
pub struct SegTable {
    inodes: HashMap<u64, SegInode>,
    next_seg_id: u64,
}

impl SegTable {
    fn create(&mut self) -> u64 {
        self.next_seg_id += 1;
        self.next_seg_id
    }
}

/// Creates a new segment. With `page == None` the header page itself is
/// allocated to the segment and returned; otherwise the header is placed
/// at `offset` on the existing page and the segment starts empty.
/// Returns `None` when the space cannot provide a header page.
pub fn fseg_create(
    space: &Arc<Space>,
    page: Option<PageNo>,
    offset: usize,
    mtr: &mut Mtr,
) -> Option<BlockRef> {
    let seg_id = space.segs().create();
    let block = match page {
        Some(page_no) => space.page_get(page_no, LatchMode::XFix, mtr),
        None => {
            let page_no = space.take_page_no(PageNo(0), Direction::NoDir);
            space.create_block(page_no);
            space.segs().inodes.insert(
                seg_id,
                SegInode {
                    pages: vec![page_no.0],
                },
            );
            space.page_get(page_no, LatchMode::XFix, mtr)
        }
    };
    space.segs().inodes.entry(seg_id).or_default();
    page::write_seg_header(&block, offset, seg_id, mtr);
    trace!(
        target: "basalt_fseg",
        seg = seg_id,
        header_page = block.page_no().0,
        "created segment"
    );
    Some(block)
}

/// Allocates a page from the segment whose header lives at
/// `(header_block, offset)`, near `hint` in `direction`. The returned
/// page exists but is not latched; callers fetch it through the page
/// store. Returns `None` only when the space is exhausted, which cannot
/// happen when the caller has reserved free pages.
pub fn fseg_alloc_free_page_general(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    hint: PageNo,
    direction: Direction,
    reserved: bool,
    mtr: &mut Mtr,
) -> Option<PageNo> {
    let _ = mtr;
    let seg_id = page::read_seg_header(header_block, offset);
    if reserved {
        debug_assert!(
            space.reserved_pages() > 0,
            "reserved allocation without a prior reservation"
        );
    }
    let page_no = space.take_page_no(hint, direction);
    space.create_block(page_no);
    let mut segs = space.segs();
    let inode = segs
        .inodes
        .get_mut(&seg_id)
        .expect("segment header names a live inode");
    inode.pages.push(page_no.0);
    trace!(
        target: "basalt_fseg",
        seg = seg_id,
        page = page_no.0,
        hint = hint.0,
        "allocated page"
    );
    Some(page_no)
}

/// [`fseg_alloc_free_page_general`] without a prior reservation.
pub fn fseg_alloc_free_page(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    hint: PageNo,
    direction: Direction,
    mtr: &mut Mtr,
) -> Option<PageNo> {
    fseg_alloc_free_page_general(space, header_block, offset, hint, direction, false, mtr)
}

/// Returns `page_no` to the space. Adaptive-hash entries for the page are
/// dropped here, not by the callers.
pub fn fseg_free_page(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    page_no: PageNo,
    mtr: &mut Mtr,
) {
    let _ = mtr;
    let seg_id = page::read_seg_header(header_block, offset);
    let mut segs = space.segs();
    let inode = segs
        .inodes
        .get_mut(&seg_id)
        .expect("segment header names a live inode");
    let idx = inode
        .pages
        .iter()
        .position(|&p| p == page_no.0)
        .expect("freed page belongs to the segment");
    inode.pages.remove(idx);
    drop(segs);
    space.drop_page_hash(page_no);
    space.return_page_no(page_no);
    trace!(target: "basalt_fseg", seg = seg_id, page = page_no.0, "freed page");
}

/// Frees one page of the segment per call; the header page goes last.
/// Returns `true` once the segment is fully freed and its inode dropped.
pub fn fseg_free_step(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    mtr: &mut Mtr,
) -> bool {
    let _ = mtr;
    let seg_id = page::read_seg_header(header_block, offset);
    let mut segs = space.segs();
    let inode = match segs.inodes.get_mut(&seg_id) {
        Some(inode) => inode,
        None => return true,
    };
    match inode.pages.pop() {
        None => {
            segs.inodes.remove(&seg_id);
            true
        }
        Some(freed) => {
            let done = inode.pages.is_empty();
            if done {
                segs.inodes.remove(&seg_id);
            }
            drop(segs);
            space.drop_page_hash(PageNo(freed));
            space.return_page_no(PageNo(freed));
            done
        }
    }
}

/// Like [`fseg_free_step`] but never frees the page the header resides
/// on. Returns `true` when only the header page (or nothing) remains.
pub fn fseg_free_step_not_header(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    mtr: &mut Mtr,
) -> bool {
    let _ = mtr;
    let seg_id = page::read_seg_header(header_block, offset);
    let header_page = header_block.page_no().0;
    let mut segs = space.segs();
    let inode = match segs.inodes.get_mut(&seg_id) {
        Some(inode) => inode,
        None => return true,
    };
    let victim = inode.pages.iter().rposition(|&p| p != header_page);
    match victim {
        None => true,
        Some(idx) => {
            let freed = inode.pages.remove(idx);
            let done = inode.pages.iter().all(|&p| p == header_page);
            drop(segs);
            space.drop_page_hash(PageNo(freed));
            space.return_page_no(PageNo(freed));
            done
        }
    }
}

/// Number of pages reserved by the segment; the second element counts
/// the pages currently in use (identical here, since the in-memory
/// allocator hands out whole pages only).
pub fn fseg_n_reserved_pages(
    space: &Arc<Space>,
    header_block: &BlockRef,
    offset: usize,
    mtr: &mut Mtr,
) -> (u64, u64) {
    let _ = mtr;
    let seg_id = page::read_seg_header(header_block, offset);
    let segs = space.segs();
    let n = segs
        .inodes
        .get(&seg_id)
        .map(|inode| inode.pages.len() as u64)
        .unwrap_or(0);
    (n, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::SpaceConfig;
    use crate::types::SpaceId;

    fn space() -> Arc<Space> {
        Space::new(SpaceConfig {
            id: SpaceId(0),
            page_size: 1024,
            zip_cap: None,
        })
    }

    #[test]
    fn create_allocates_the_header_page_when_unanchored() {
        let space = space();
        let mut mtr = Mtr::start(&space);
        let block = fseg_create(&space, None, 28, &mut mtr).unwrap();
        let (total, _) = fseg_n_reserved_pages(&space, &block, 28, &mut mtr);
        assert_eq!(total, 1);
        mtr.commit();
    }

    #[test]
    fn free_steps_drain_the_segment() {
        let space = space();
        let mut mtr = Mtr::start(&space);
        let block = fseg_create(&space, None, 28, &mut mtr).unwrap();
        for _ in 0..3 {
            fseg_alloc_free_page(&space, &block, 28, PageNo(0), Direction::Up, &mut mtr)
                .unwrap();
        }
        let mut steps = 0;
        while !fseg_free_step(&space, &block, 28, &mut mtr) {
            steps += 1;
            assert!(steps < 10);
        }
        let (total, _) = fseg_n_reserved_pages(&space, &block, 28, &mut mtr);
        assert_eq!(total, 0);
        mtr.commit();
    }

    #[test]
    fn not_header_variant_spares_the_header_page() {
        let space = space();
        let mut mtr = Mtr::start(&space);
        let block = fseg_create(&space, None, 28, &mut mtr).unwrap();
        fseg_alloc_free_page(&space, &block, 28, PageNo(0), Direction::Up, &mut mtr).unwrap();
        while !fseg_free_step_not_header(&space, &block, 28, &mut mtr) {}
        let (total, _) = fseg_n_reserved_pages(&space, &block, 28, &mut mtr);
        assert_eq!(total, 1);
        mtr.commit();
    }
}
