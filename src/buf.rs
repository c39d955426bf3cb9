//! In-memory page store.
//!
//! A [`Space`] owns every page frame of one tablespace and hands them out
//! as pinned, latched blocks scoped to a mini-transaction. It also hosts
//! the per-space collaborators the tree engine touches through narrow
//! hooks: the redo sink, the adaptive-hash drop hook, the insert-buffer
//! free-bits bitmap and the segment allocator's inode table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::fseg::SegTable;
use crate::latch::Latch;
use crate::log::RedoLog;
use crate::mtr::{LatchMode, Mtr};
use crate::page::zip::ZipFrame;
use crate::types::{PageNo, SpaceId};

/// Page bytes plus the optional compressed image and the modify clock.
pub struct Frame {
    /// Uncompressed page bytes.
    pub data: Vec<u8>,
    /// Compressed image, present on compressed tablespaces.
    pub zip: Option<ZipFrame>,
    /// Incremented whenever the frame is invalidated for optimistic
    /// observers (page free, reuse).
    pub modify_clock: u64,
}

/// A page frame pinned in the buffer pool.
pub struct Block {
    space_id: SpaceId,
    page_no: PageNo,
    latch: Latch,
    frame: RwLock<Frame>,
}

/// Shared handle to a block.
pub type BlockRef = Arc<Block>;

impl Block {
    /// Tablespace of this block.
    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    /// Page number of this block.
    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    /// The frame latch.
    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// The frame contents. Byte access is short-lived; the frame latch
    /// carries the long-term protocol.
    pub fn frame(&self) -> &RwLock<Frame> {
        &self.frame
    }

    /// Invalidates optimistic observers of this frame.
    pub fn modify_clock_inc(&self) {
        self.frame.write().modify_clock += 1;
    }

    /// Current modify clock value.
    pub fn modify_clock(&self) -> u64 {
        self.frame.read().modify_clock
    }
}

/// Construction parameters for a [`Space`].
pub struct SpaceConfig {
    /// Tablespace id.
    pub id: SpaceId,
    /// Page size in bytes.
    pub page_size: usize,
    /// Compressed-image capacity; `Some` makes every page carry a
    /// compressed image of at most this many bytes.
    pub zip_cap: Option<usize>,
}

struct SpaceInner {
    blocks: HashMap<u32, BlockRef>,
    next_page_no: u32,
    free_pool: Vec<u32>,
    reserved_pages: usize,
}

/// One tablespace: page frames, redo sink and per-space hooks.
pub struct Space {
    id: SpaceId,
    page_size: usize,
    zip_cap: Option<usize>,
    inner: Mutex<SpaceInner>,
    redo: Mutex<RedoLog>,
    segs: Mutex<SegTable>,
    free_bits: Mutex<HashMap<u32, u8>>,
    hash_entries: Mutex<HashSet<u32>>,
}

impl Space {
    /// Creates an empty space.
    pub fn new(config: SpaceConfig) -> Arc<Self> {
        Arc::new(Self {
            id: config.id,
            page_size: config.page_size,
            zip_cap: config.zip_cap,
            inner: Mutex::new(SpaceInner {
                blocks: HashMap::new(),
                next_page_no: 0,
                free_pool: Vec::new(),
                reserved_pages: 0,
            }),
            redo: Mutex::new(RedoLog::default()),
            segs: Mutex::new(SegTable::default()),
            free_bits: Mutex::new(HashMap::new()),
            hash_entries: Mutex::new(HashSet::new()),
        })
    }

    /// Tablespace id.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Page size of this space.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether pages of this space carry compressed images.
    pub fn is_compressed(&self) -> bool {
        self.zip_cap.is_some()
    }

    /// The redo stream of this space.
    pub fn redo(&self) -> MutexGuard<'_, RedoLog> {
        self.redo.lock()
    }

    /// The segment allocator's inode table.
    pub(crate) fn segs(&self) -> MutexGuard<'_, SegTable> {
        self.segs.lock()
    }

    /// Fetches a page, latching it in `mode` and pinning it in `mtr`.
    /// A block the mtr has already latched at least as strongly is
    /// re-pinned without re-latching.
    ///
    /// Panics if the page does not exist: the engine only asks for pages
    /// reachable from a tree, so a miss is corruption.
    pub fn page_get(&self, page_no: PageNo, mode: LatchMode, mtr: &mut Mtr) -> BlockRef {
        let block = self.block(page_no);
        let held = mtr.page_fix_mode(&block);
        let effective = match (held, mode) {
            (Some(LatchMode::XFix), _) => LatchMode::BufFix,
            (Some(LatchMode::SFix), LatchMode::SFix | LatchMode::BufFix) => LatchMode::BufFix,
            (Some(LatchMode::SFix), LatchMode::XFix) => {
                debug_assert!(false, "s-fix to x-fix upgrade inside one mtr");
                LatchMode::BufFix
            }
            _ => mode,
        };
        match effective {
            LatchMode::SFix => block.latch.s_lock(),
            LatchMode::XFix => block.latch.x_lock(),
            LatchMode::BufFix => {}
        }
        mtr.memo_push_page(Arc::clone(&block), effective);
        block
    }

    /// Fetches a page with no latch at all; the caller must already hold
    /// a covering latch (neighbor reads).
    pub fn page_get_no_latch(&self, page_no: PageNo, mtr: &mut Mtr) -> BlockRef {
        let block = self.block(page_no);
        mtr.memo_push_page(Arc::clone(&block), LatchMode::BufFix);
        block
    }

    fn block(&self, page_no: PageNo) -> BlockRef {
        assert!(!page_no.is_null(), "page_get on the null page");
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&page_no.0)
            .cloned()
            .unwrap_or_else(|| panic!("space {}: page {} does not exist", self.id, page_no))
    }

    /// Materializes a fresh zeroed frame for `page_no`. Used by the
    /// segment allocator when it extends the space.
    pub(crate) fn create_block(&self, page_no: PageNo) -> BlockRef {
        let block = Arc::new(Block {
            space_id: self.id,
            page_no,
            latch: Latch::new(),
            frame: RwLock::new(Frame {
                data: vec![0u8; self.page_size],
                zip: self.zip_cap.map(ZipFrame::new),
                modify_clock: 0,
            }),
        });
        let mut inner = self.inner.lock();
        let prior = inner.blocks.insert(page_no.0, Arc::clone(&block));
        debug_assert!(prior.is_none(), "page created twice");
        block
    }

    /// Hands out an unused page number, preferring the free pool, and
    /// honoring `hint`/`direction` the way the underlying allocator
    /// would: a freed page equal to the hint wins, otherwise the pool is
    /// scanned in the hinted direction.
    pub(crate) fn take_page_no(
        &self,
        hint: PageNo,
        direction: crate::types::Direction,
    ) -> PageNo {
        let mut inner = self.inner.lock();
        if inner.reserved_pages > 0 {
            inner.reserved_pages -= 1;
        }
        if !inner.free_pool.is_empty() {
            let pick = if let Some(idx) = inner.free_pool.iter().position(|&p| p == hint.0) {
                idx
            } else {
                match direction {
                    crate::types::Direction::Down => {
                        let mut best: Option<usize> = None;
                        for (idx, &p) in inner.free_pool.iter().enumerate() {
                            if p < hint.0 && best.map_or(true, |b| p > inner.free_pool[b]) {
                                best = Some(idx);
                            }
                        }
                        best.unwrap_or(inner.free_pool.len() - 1)
                    }
                    _ => inner.free_pool.len() - 1,
                }
            };
            return PageNo(inner.free_pool.swap_remove(pick));
        }
        let no = inner.next_page_no;
        inner.next_page_no += 1;
        PageNo(no)
    }

    /// Returns a page number to the free pool.
    pub(crate) fn return_page_no(&self, page_no: PageNo) {
        let mut inner = self.inner.lock();
        inner.blocks.remove(&page_no.0);
        inner.free_pool.push(page_no.0);
    }

    /// Reserves `n` free pages ahead of a pessimistic operation. The
    /// in-memory space cannot run out, so this always succeeds, but the
    /// reservation is tracked so allocation preconditions can be checked.
    pub fn reserve_free_extents(&self, n: usize) -> bool {
        self.inner.lock().reserved_pages += n;
        true
    }

    /// Pages currently reserved and not yet consumed.
    pub fn reserved_pages(&self) -> usize {
        self.inner.lock().reserved_pages
    }

    /// Drops adaptive-hash entries pointing into `page_no`. Must run
    /// before any mutation that relocates records on the page.
    pub fn drop_page_hash(&self, page_no: PageNo) {
        self.hash_entries.lock().remove(&page_no.0);
    }

    /// Notes that the adaptive hash holds entries for `page_no`
    /// (test/diagnostic hook).
    pub fn note_page_hash(&self, page_no: PageNo) {
        self.hash_entries.lock().insert(page_no.0);
    }

    /// Whether the adaptive hash holds entries for `page_no`.
    pub fn has_page_hash(&self, page_no: PageNo) -> bool {
        self.hash_entries.lock().contains(&page_no.0)
    }

    /// Resets the insert-buffer free bits of `page_no` to "unknown/full".
    pub fn reset_free_bits(&self, page_no: PageNo) {
        self.free_bits.lock().remove(&page_no.0);
    }

    /// Publishes insert-buffer free bits for `page_no`.
    pub fn set_free_bits(&self, page_no: PageNo, bits: u8) {
        self.free_bits.lock().insert(page_no.0, bits);
    }

    /// Current free bits of `page_no`, if published.
    pub fn free_bits(&self, page_no: PageNo) -> Option<u8> {
        self.free_bits.lock().get(&page_no.0).copied()
    }

    /// Number of pages currently materialized (diagnostics).
    pub fn n_pages(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn space() -> Arc<Space> {
        Space::new(SpaceConfig {
            id: SpaceId(9),
            page_size: 512,
            zip_cap: None,
        })
    }

    #[test]
    fn page_get_is_idempotent_within_one_mtr() {
        let space = space();
        let no = space.take_page_no(PageNo(0), Direction::NoDir);
        space.create_block(no);
        let mut mtr = Mtr::start(&space);
        let a = space.page_get(no, LatchMode::XFix, &mut mtr);
        let b = space.page_get(no, LatchMode::XFix, &mut mtr);
        assert!(Arc::ptr_eq(&a, &b));
        mtr.commit();
        assert!(!a.latch().is_x_locked());
    }

    #[test]
    fn freed_page_numbers_are_reused() {
        let space = space();
        let a = space.take_page_no(PageNo(0), Direction::NoDir);
        space.create_block(a);
        space.return_page_no(a);
        let b = space.take_page_no(a, Direction::Up);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_drop_hook() {
        let space = space();
        space.note_page_hash(PageNo(3));
        assert!(space.has_page_hash(PageNo(3)));
        space.drop_page_hash(PageNo(3));
        assert!(!space.has_page_hash(PageNo(3)));
    }
}
