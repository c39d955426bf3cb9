//! Identifiers, sentinels and size constants shared by the engine.

use std::fmt;

/// Tablespace identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Page number within a tablespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Index tree identifier, stamped on every page of the tree.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u64);

/// Null page sentinel terminating level lists and signalling allocation
/// failure.
pub const FIL_NULL: PageNo = PageNo(u32::MAX);

impl PageNo {
    /// Whether this is the null sentinel.
    pub fn is_null(self) -> bool {
        self == FIL_NULL
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "FIL_NULL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction hint for page allocation around a split point.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    /// Allocate upwards of the hint (ascending inserts).
    Up,
    /// Allocate downwards of the hint (descending inserts).
    Down,
    /// No preference.
    NoDir,
}

/// Which reserved-page count `btree::get_size` should report.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SizeTarget {
    /// Pages reserved by the leaf segment.
    LeafPages,
    /// Pages reserved by both segments.
    Total,
}

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Page number of the insert-buffer header page in an ibuf space.
pub const IBUF_HEADER_PAGE_NO: PageNo = PageNo(0);

/// Page number the root of an ibuf tree must land on.
pub const IBUF_TREE_ROOT_PAGE_NO: PageNo = PageNo(1);

/// Upper bound for a single record, chosen so that two maximum-size
/// records always fit on an empty root page. Splits rely on this.
pub fn max_rec_size(page_size: usize) -> usize {
    page_size / 2 - 200
}
