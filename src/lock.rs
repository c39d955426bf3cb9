//! Lock-manager notifications.
//!
//! The tree engine does not manage record locks, but it must tell the
//! lock manager about every structural event so lock bits can follow the
//! records they cover. [`LockSystem`] is that notification surface; the
//! recorded events are observable, which is what the tests use.

use parking_lot::Mutex;

use crate::types::PageNo;

/// A structural event the lock manager was notified of.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LockEvent {
    /// A page split moved records to a new left half.
    SplitLeft {
        /// Page that kept the upper records.
        right: PageNo,
        /// New page holding the lower records.
        left: PageNo,
    },
    /// A page split moved records to a new right half.
    SplitRight {
        /// New page holding the upper records.
        right: PageNo,
        /// Page that kept the lower records.
        left: PageNo,
    },
    /// Records merged into the left sibling.
    MergeLeft {
        /// Surviving merge target.
        target: PageNo,
        /// Page that disappeared.
        discarded: PageNo,
    },
    /// Records merged into the right sibling.
    MergeRight {
        /// Surviving merge target.
        target: PageNo,
        /// Page that disappeared.
        discarded: PageNo,
    },
    /// The root's records moved to a new page one level down.
    RootRaise {
        /// New page now holding the old root records.
        new_page: PageNo,
        /// The root.
        root: PageNo,
    },
    /// A sole-on-level page's records were copied to its father.
    CopyAndDiscard {
        /// The father page.
        target: PageNo,
        /// The lifted page.
        discarded: PageNo,
    },
    /// A page was discarded; its locks moved to a neighbor.
    Discard {
        /// Page inheriting the locks.
        heir: PageNo,
        /// The discarded page.
        discarded: PageNo,
    },
    /// A page was reorganized in place.
    Reorganize {
        /// The reorganized page.
        page: PageNo,
    },
}

/// Records the structural notifications of one index.
#[derive(Default)]
pub struct LockSystem {
    events: Mutex<Vec<LockEvent>>,
}

impl LockSystem {
    /// Creates an empty notification log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: LockEvent) {
        self.events.lock().push(event);
    }

    /// See [`LockEvent::SplitLeft`].
    pub fn update_split_left(&self, right: PageNo, left: PageNo) {
        self.push(LockEvent::SplitLeft { right, left });
    }

    /// See [`LockEvent::SplitRight`].
    pub fn update_split_right(&self, right: PageNo, left: PageNo) {
        self.push(LockEvent::SplitRight { right, left });
    }

    /// See [`LockEvent::MergeLeft`].
    pub fn update_merge_left(&self, target: PageNo, discarded: PageNo) {
        self.push(LockEvent::MergeLeft { target, discarded });
    }

    /// See [`LockEvent::MergeRight`].
    pub fn update_merge_right(&self, target: PageNo, discarded: PageNo) {
        self.push(LockEvent::MergeRight { target, discarded });
    }

    /// See [`LockEvent::RootRaise`].
    pub fn update_root_raise(&self, new_page: PageNo, root: PageNo) {
        self.push(LockEvent::RootRaise { new_page, root });
    }

    /// See [`LockEvent::CopyAndDiscard`].
    pub fn update_copy_and_discard(&self, target: PageNo, discarded: PageNo) {
        self.push(LockEvent::CopyAndDiscard { target, discarded });
    }

    /// See [`LockEvent::Discard`].
    pub fn update_discard(&self, heir: PageNo, discarded: PageNo) {
        self.push(LockEvent::Discard { heir, discarded });
    }

    /// See [`LockEvent::Reorganize`].
    pub fn move_reorganize_page(&self, page: PageNo) {
        self.push(LockEvent::Reorganize { page });
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<LockEvent> {
        self.events.lock().clone()
    }
}
