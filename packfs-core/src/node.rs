//! Node-revision and change model
//!
//! A write never mutates an existing node revision; it appends a new one
//! whose `predecessor_id` references the prior revision of the same
//! conceptual node. Copy tracking lets history queries tell "modified in
//! place" from "copied from elsewhere" without walking the whole tree.

use crate::id::ItemId;
use crate::rep::Representation;
use serde::{Deserialize, Serialize};

/// Kind of a versioned node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

/// (path, revision) pair for copy tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRev {
    pub path: String,
    pub revision: u64,
}

/// One immutable revision of a node
///
/// Identified by `id`, which encodes the (change-set, item) coordinates
/// of the record on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub kind: NodeKind,

    pub id: ItemId,

    /// Prior revision of the same node, if any. Chains must terminate at
    /// a node with no predecessor.
    pub predecessor_id: Option<ItemId>,

    /// Number of predecessors this node revision has, recursively
    pub predecessor_count: u64,

    /// If this node revision is a copy, where it was copied from
    pub copy_source: Option<PathRev>,

    /// Root of the parent tree from whence this node was copied
    pub copy_root: PathRev,

    /// Representation holding this node's properties, if any
    pub prop_rep: Option<Representation>,

    /// Representation holding this node's data, if any
    pub data_rep: Option<Representation>,

    /// Path at which this node first came into existence
    pub created_path: String,

    /// Is this the unmodified root of a transaction?
    pub is_fresh_txn_root: bool,

    /// Number of merge-info-bearing nodes in this subtree, itself included
    pub mergeinfo_count: u64,

    /// Does this node itself carry merge info?
    pub has_mergeinfo: bool,
}

impl NodeRevision {
    /// Serialize to the on-disk record format
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// One entry of an immutable directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: ItemId,
    pub kind: NodeKind,
}

/// How a path was changed in a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Replace,
}

/// Description of one path change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub node_id: ItemId,
    pub kind: ChangeKind,
    pub node_kind: NodeKind,
    pub text_modified: bool,
    pub props_modified: bool,
    pub copy_source: Option<PathRev>,
}

/// One entry of a revision's change list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub info: ChangeInfo,
}

/// Ordered change list of a revision. Order follows the sequence in
/// which paths were modified during the transaction; significant for
/// presentation, not for correctness of the stored state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeList {
    pub changes: Vec<Change>,
}

impl ChangeList {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_noderev() -> NodeRevision {
        NodeRevision {
            kind: NodeKind::File,
            id: ItemId::new(3, 1),
            predecessor_id: Some(ItemId::new(2, 4)),
            predecessor_count: 1,
            copy_source: None,
            copy_root: PathRev {
                path: "/".to_string(),
                revision: 3,
            },
            prop_rep: None,
            data_rep: None,
            created_path: "/trunk/a.txt".to_string(),
            is_fresh_txn_root: false,
            mergeinfo_count: 0,
            has_mergeinfo: false,
        }
    }

    #[test]
    fn test_noderev_round_trip() {
        let nr = sample_noderev();
        let bytes = nr.to_bytes().unwrap();
        let back = NodeRevision::from_bytes(&bytes).unwrap();
        assert_eq!(back, nr);
    }

    #[test]
    fn test_change_list_preserves_order() {
        let mk = |path: &str| Change {
            path: path.to_string(),
            info: ChangeInfo {
                node_id: ItemId::new(1, 0),
                kind: ChangeKind::Add,
                node_kind: NodeKind::File,
                text_modified: true,
                props_modified: false,
                copy_source: None,
            },
        };
        let list = ChangeList {
            changes: vec![mk("/b"), mk("/a"), mk("/c")],
        };
        let back = ChangeList::from_bytes(&list.to_bytes().unwrap()).unwrap();
        let paths: Vec<_> = back.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/a", "/c"]);
    }
}
