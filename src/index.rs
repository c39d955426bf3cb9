//! Index descriptors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buf::Space;
use crate::latch::Latch;
use crate::lock::LockSystem;
use crate::record::RecordFormat;
use crate::types::{IndexId, PageNo};

/// Kind and shape flags of an index tree.
#[derive(Copy, Clone, Default, Debug)]
pub struct IndexFlags {
    /// Clustered (primary-key) index.
    pub clustered: bool,
    /// Keys are unique.
    pub unique: bool,
    /// Insert-buffer tree: pages recycle through the in-tree free list.
    pub ibuf: bool,
    /// Accepts records of any shape; per-record validation is skipped.
    pub universal: bool,
}

/// Schema of one indexed column, as needed by record validation.
#[derive(Copy, Clone, Debug)]
pub struct ColumnDef {
    /// Exact stored length of the column, if fixed-size.
    pub fixed_len: Option<u16>,
    /// Maximum stored length for a prefix column; prefix columns are
    /// never fixed-size.
    pub prefix_len: Option<u16>,
}

/// Descriptor of one index tree.
pub struct IndexDef {
    /// Index id, stamped on every page.
    pub id: IndexId,
    /// Index name, for corruption reports.
    pub name: String,
    /// Table name, for corruption reports.
    pub table_name: String,
    /// The tablespace holding the tree.
    pub space: Arc<Space>,
    root: AtomicU32,
    /// Kind flags.
    pub flags: IndexFlags,
    /// Physical record format of every page of the tree.
    pub format: RecordFormat,
    /// Column schema; one entry per field of a leaf record.
    pub cols: Vec<ColumnDef>,
    /// Number of fields that determine a record uniquely (node-pointer
    /// prefix length).
    pub n_uniq: usize,
    /// The tree latch.
    pub latch: Arc<Latch>,
    /// Lock-manager notification surface.
    pub locks: Arc<LockSystem>,
}

impl IndexDef {
    /// Builds a descriptor with no root yet; `btree::create` assigns one.
    pub fn new(
        id: IndexId,
        name: impl Into<String>,
        table_name: impl Into<String>,
        space: Arc<Space>,
        flags: IndexFlags,
        format: RecordFormat,
        cols: Vec<ColumnDef>,
        n_uniq: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            table_name: table_name.into(),
            space,
            root: AtomicU32::new(crate::types::FIL_NULL.0),
            flags,
            format,
            cols,
            n_uniq,
            latch: Arc::new(Latch::new()),
            locks: Arc::new(LockSystem::new()),
        })
    }

    /// Root page of the tree.
    pub fn root_page_no(&self) -> PageNo {
        PageNo(self.root.load(Ordering::SeqCst))
    }

    /// Installs the root page, once, at create time.
    pub fn set_root_page_no(&self, page_no: PageNo) {
        self.root.store(page_no.0, Ordering::SeqCst);
    }

    /// Whether the tree stores compact-format records.
    pub fn is_comp(&self) -> bool {
        self.format == RecordFormat::Compact
    }

    /// Number of fields a leaf record must carry.
    pub fn n_fields(&self) -> usize {
        self.cols.len()
    }
}
