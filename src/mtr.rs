//! Mini-transactions.
//!
//! A mini-transaction (mtr) is the unit of latching and redo: it records
//! every latch it takes in a memo, accumulates the redo records of the
//! page mutations made under those latches, and on commit appends the
//! redo segment to the space log before releasing the latches in reverse
//! acquisition order. Dropping an uncommitted mtr releases the latches
//! and discards the log.

use std::sync::Arc;

use crate::buf::{BlockRef, Space};
use crate::latch::Latch;
use crate::log::LogRecord;

/// Latch mode requested from the page store.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LatchMode {
    /// Shared page latch.
    SFix,
    /// Exclusive page latch.
    XFix,
    /// Pin only; the caller relies on another latch for protection.
    BufFix,
}

/// Redo logging mode of a mini-transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogMode {
    /// Mutations are logged.
    Normal,
    /// Mutations are not logged (recovery replay, scratch rebuilds).
    None,
}

enum MemoSlot {
    PageFix(BlockRef, LatchMode),
    SLock(Arc<Latch>),
    XLock(Arc<Latch>),
}

/// A mini-transaction. See the module docs.
pub struct Mtr {
    space: Arc<Space>,
    memo: Vec<MemoSlot>,
    log: Vec<LogRecord>,
    log_mode: LogMode,
    committed: bool,
}

impl Mtr {
    /// Starts a mini-transaction against `space`.
    pub fn start(space: &Arc<Space>) -> Self {
        Self {
            space: Arc::clone(space),
            memo: Vec::new(),
            log: Vec::new(),
            log_mode: LogMode::Normal,
            committed: false,
        }
    }

    /// The space this mtr logs to.
    pub fn space(&self) -> &Arc<Space> {
        &self.space
    }

    /// Takes the tree latch in shared mode. A latch already present in
    /// the memo is not re-acquired.
    pub fn s_lock(&mut self, latch: &Arc<Latch>) {
        if self.lock_slot(latch).is_some() {
            return;
        }
        latch.s_lock();
        self.memo.push(MemoSlot::SLock(Arc::clone(latch)));
    }

    /// Takes the tree latch in exclusive mode. A latch already held
    /// exclusively by this mtr is not re-acquired; upgrading a shared
    /// hold is a caller bug.
    pub fn x_lock(&mut self, latch: &Arc<Latch>) {
        match self.lock_slot(latch) {
            Some(MemoSlot::XLock(_)) => return,
            Some(MemoSlot::SLock(_)) => {
                debug_assert!(false, "s-latch to x-latch upgrade inside one mtr");
            }
            _ => {}
        }
        latch.x_lock();
        self.memo.push(MemoSlot::XLock(Arc::clone(latch)));
    }

    fn lock_slot(&self, latch: &Arc<Latch>) -> Option<&MemoSlot> {
        self.memo.iter().find(|slot| match slot {
            MemoSlot::SLock(held) | MemoSlot::XLock(held) => Arc::ptr_eq(held, latch),
            _ => false,
        })
    }

    /// Whether the memo holds `latch` in exclusive mode.
    pub fn memo_contains_x_lock(&self, latch: &Arc<Latch>) -> bool {
        matches!(self.lock_slot(latch), Some(MemoSlot::XLock(_)))
    }

    /// Whether the memo holds `latch` in any mode.
    pub fn memo_contains_lock(&self, latch: &Arc<Latch>) -> bool {
        self.lock_slot(latch).is_some()
    }

    /// Releases an exclusively held latch before commit. Used by the
    /// split path to shorten tree-latch hold times once the new page
    /// structure is safely logged.
    pub fn memo_release_x_lock(&mut self, latch: &Arc<Latch>) {
        if let Some(idx) = self.memo.iter().position(
            |slot| matches!(slot, MemoSlot::XLock(held) if Arc::ptr_eq(held, latch)),
        ) {
            self.memo.remove(idx);
            latch.x_unlock();
        }
    }

    /// Releases a shared-held latch before commit. The read path drops
    /// the tree latch once it holds the leaf latch.
    pub fn memo_release_s_lock(&mut self, latch: &Arc<Latch>) {
        if let Some(idx) = self.memo.iter().position(
            |slot| matches!(slot, MemoSlot::SLock(held) if Arc::ptr_eq(held, latch)),
        ) {
            self.memo.remove(idx);
            latch.s_unlock();
        }
    }

    /// Records a page fix in the memo. Called by the page store.
    pub(crate) fn memo_push_page(&mut self, block: BlockRef, mode: LatchMode) {
        self.memo.push(MemoSlot::PageFix(block, mode));
    }

    /// Strongest fix mode the memo holds on `block`, if any.
    pub fn page_fix_mode(&self, block: &BlockRef) -> Option<LatchMode> {
        let mut strongest = None;
        for slot in &self.memo {
            if let MemoSlot::PageFix(held, mode) = slot {
                if Arc::ptr_eq(held, block) {
                    strongest = match (strongest, *mode) {
                        (_, LatchMode::XFix) | (Some(LatchMode::XFix), _) => {
                            Some(LatchMode::XFix)
                        }
                        (_, LatchMode::SFix) | (Some(LatchMode::SFix), _) => {
                            Some(LatchMode::SFix)
                        }
                        _ => Some(LatchMode::BufFix),
                    };
                }
            }
        }
        strongest
    }

    /// Whether the memo holds `block` with at least a shared latch.
    pub fn memo_contains_page_latched(&self, block: &BlockRef) -> bool {
        matches!(
            self.page_fix_mode(block),
            Some(LatchMode::SFix) | Some(LatchMode::XFix)
        )
    }

    /// Whether the memo holds `block` exclusively latched.
    pub fn memo_contains_page_x(&self, block: &BlockRef) -> bool {
        self.page_fix_mode(block) == Some(LatchMode::XFix)
    }

    /// Appends a redo record, subject to the current log mode.
    pub fn log(&mut self, rec: LogRecord) {
        if self.log_mode == LogMode::Normal {
            self.log.push(rec);
        }
    }

    /// Swaps the log mode, returning the previous one.
    pub fn set_log_mode(&mut self, mode: LogMode) -> LogMode {
        std::mem::replace(&mut self.log_mode, mode)
    }

    /// Commits: appends the redo segment to the space log, then releases
    /// all memoized latches in reverse acquisition order.
    pub fn commit(mut self) {
        if !self.log.is_empty() {
            self.space.redo().append_segment(&self.log);
        }
        self.release_all();
        self.committed = true;
    }

    fn release_all(&mut self) {
        while let Some(slot) = self.memo.pop() {
            match slot {
                MemoSlot::PageFix(block, LatchMode::SFix) => block.latch().s_unlock(),
                MemoSlot::PageFix(block, LatchMode::XFix) => block.latch().x_unlock(),
                MemoSlot::PageFix(_, LatchMode::BufFix) => {}
                MemoSlot::SLock(latch) => latch.s_unlock(),
                MemoSlot::XLock(latch) => latch.x_unlock(),
            }
        }
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        if !self.committed {
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::SpaceConfig;
    use crate::types::SpaceId;

    fn test_space() -> Arc<Space> {
        Space::new(SpaceConfig {
            id: SpaceId(0),
            page_size: 1024,
            zip_cap: None,
        })
    }

    #[test]
    fn tree_latch_is_not_reacquired() {
        let space = test_space();
        let latch = Arc::new(Latch::new());
        let mut mtr = Mtr::start(&space);
        mtr.x_lock(&latch);
        mtr.x_lock(&latch);
        assert!(mtr.memo_contains_x_lock(&latch));
        mtr.commit();
        assert!(!latch.is_x_locked());
    }

    #[test]
    fn early_release_removes_the_memo_slot() {
        let space = test_space();
        let latch = Arc::new(Latch::new());
        let mut mtr = Mtr::start(&space);
        mtr.x_lock(&latch);
        mtr.memo_release_x_lock(&latch);
        assert!(!mtr.memo_contains_x_lock(&latch));
        assert!(!latch.is_x_locked());
        mtr.commit();
    }

    #[test]
    fn drop_without_commit_releases_latches() {
        let space = test_space();
        let latch = Arc::new(Latch::new());
        {
            let mut mtr = Mtr::start(&space);
            mtr.x_lock(&latch);
        }
        assert!(!latch.is_x_locked());
    }

    #[test]
    fn log_mode_none_suppresses_records() {
        let space = test_space();
        let mut mtr = Mtr::start(&space);
        let old = mtr.set_log_mode(LogMode::None);
        assert_eq!(old, LogMode::Normal);
        mtr.log(LogRecord::PageReorganize {
            space: SpaceId(0),
            page_no: crate::types::PageNo(1),
            compact: true,
        });
        mtr.commit();
        assert_eq!(space.redo().n_records(), 0);
    }
}
