//! PackFS Core Library
//!
//! Storage kernel for a versioned filesystem including:
//! - Immutable revision files with logical-to-physical and
//!   physical-to-logical paged indices
//! - Representation storage: deltification, zstd compression and
//!   digest-based rep-sharing (SQLite index)
//! - Transactions with proto-revision staging and atomic commit
//! - Shard packing and packed revision properties
//! - Multi-layer caching with an optional shared remote backend
//! - Cross-process advisory file locks and ordered in-process locks

pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod fs;
pub mod id;
pub mod index;
pub mod layout;
pub mod lock;
pub mod node;
pub mod pack;
pub mod rep;
pub mod revprop;
pub mod txn;

pub use cache::{Cache, CacheSet, MemoryCacheBackend, RemoteCacheBackend};
pub use config::{FsConfig, FORMAT_NUMBER};
pub use error::{FsError, Result};
pub use fs::{Filesystem, OpenFs, ITEM_INDEX_CHANGES, ITEM_INDEX_ROOT};
pub use id::{ItemId, TXN_REVISION};
pub use node::{Change, ChangeInfo, ChangeKind, ChangeList, DirEntry, NodeKind, NodeRevision};
pub use rep::{RepIndex, Representation, SqliteRepIndex};
pub use revprop::{get_revprops, set_revprop, RevProps};
pub use txn::Transaction;
