//! Item identifiers
//!
//! Every stored object (representation, node revision, change list) is
//! addressed by the revision that contains it plus an item index within
//! that revision. The same coordinate type doubles as the node-revision
//! id, so a node id directly locates its record on disk.

use serde::{Deserialize, Serialize};

/// Sentinel revision used for items staged inside an uncommitted
/// transaction. Patched to the final revision number at commit.
pub const TXN_REVISION: u64 = u64::MAX;

/// (revision, item) coordinates of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    /// Revision (change set) containing the item
    pub revision: u64,
    /// Index of the item within that revision
    pub item_index: u64,
}

impl ItemId {
    pub fn new(revision: u64, item_index: u64) -> Self {
        Self {
            revision,
            item_index,
        }
    }

    /// Does this id refer to an item of a not-yet-committed transaction?
    pub fn is_txn(&self) -> bool {
        self.revision == TXN_REVISION
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_txn() {
            write!(f, "txn/{}", self.item_index)
        } else {
            write!(f, "r{}/{}", self.revision, self.item_index)
        }
    }
}
