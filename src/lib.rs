//! # Basalt - B-tree Index Engine
//!
//! Basalt is the B-tree engine of a transactional storage subsystem:
//! ordered, page-resident index trees serving point lookups, range
//! scans and modifications under concurrent access, with
//! mini-transaction-scoped latching and redo logging.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use basalt::buf::{Space, SpaceConfig};
//! use basalt::index::{ColumnDef, IndexDef, IndexFlags};
//! use basalt::record::{RecordFormat, Tuple};
//! use basalt::types::{IndexId, SpaceId, DEFAULT_PAGE_SIZE};
//!
//! let space = Space::new(SpaceConfig {
//!     id: SpaceId(0),
//!     page_size: DEFAULT_PAGE_SIZE,
//!     zip_cap: None,
//! });
//! let index = IndexDef::new(
//!     IndexId(1),
//!     "PRIMARY",
//!     "t",
//!     Arc::clone(&space),
//!     IndexFlags { clustered: true, unique: true, ..Default::default() },
//!     RecordFormat::Compact,
//!     vec![
//!         ColumnDef { fixed_len: Some(8), prefix_len: None },
//!         ColumnDef { fixed_len: None, prefix_len: None },
//!     ],
//!     1,
//! );
//! basalt::btree::bootstrap(&index).expect("root allocated");
//!
//! let row = Tuple::from_fields([b"00000001".to_vec(), b"payload".to_vec()]);
//! basalt::btree::cursor::insert(&index, &row)?;
//! assert_eq!(basalt::btree::cursor::scan_all(&index).len(), 1);
//! assert!(basalt::btree::validate_index(&index, None));
//! # Ok::<(), basalt::BasaltError>(())
//! ```
//!
//! ## Architecture
//!
//! The engine core lives in [`btree`]: navigation, per-tree segment
//! allocation, splits with recursive upward propagation and root raise,
//! merges with level lifting, page reorganization, the min-rec redo
//! hooks, and tree validation. The collaborating layers it drives are
//! each a module of their own: the page store ([`buf`]), the segment
//! allocator ([`fseg`]), record layout ([`record`]), page-level
//! operations ([`page`]), lock-manager notifications ([`lock`]) and
//! mini-transactions ([`mtr`]).

pub mod btree;
pub mod buf;
pub mod error;
pub mod fseg;
pub mod index;
pub mod latch;
pub mod lock;
pub mod log;
pub mod logging;
pub mod mtr;
pub mod page;
pub mod record;
pub mod types;

pub use crate::error::{BasaltError, Result};
pub use crate::types::{IndexId, PageNo, SpaceId, FIL_NULL};
