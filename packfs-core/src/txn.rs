//! Transactions and commit
//!
//! A transaction stages representations into its proto-revision file
//! and node revisions / changes in memory, all under the transaction's
//! non-recursive write lock. Commit takes the repository write lock,
//! assigns the final revision number, materializes the revision file
//! with its indices, moves the properties to revprops and bumps
//! `current`. Until the `current` bump nothing of the new revision is
//! observable.

use crate::cache::{Cache, PairKey};
use crate::error::{FsError, Result};
use crate::fs::{Filesystem, ITEM_INDEX_CHANGES, ITEM_INDEX_FIRST_FREE, ITEM_INDEX_ROOT};
use crate::id::{ItemId, TXN_REVISION};
use crate::index::{ItemKind, L2pBuilder, P2lBuilder, P2lEntry};
use crate::lock::lock_file_exclusive;
use crate::node::{Change, ChangeList, DirEntry, NodeKind, NodeRevision, PathRev};
use crate::rep::{
    choose_delta_base, encode_rep_block, strong_digest, weak_digest, RepHeader, RepIndex,
    Representation,
};
use crate::revprop::{write_revprops, RevProps};
use crate::{delta, pack};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use tracing::{debug, info};

/// Accumulates the physical contents of one revision file
struct RevisionFile {
    buf: Vec<u8>,
    items: Vec<(u64, u64, u64, ItemKind)>,
}

impl RevisionFile {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            items: Vec::new(),
        }
    }

    fn add_item(&mut self, item_index: u64, kind: ItemKind, bytes: &[u8]) {
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        self.items.push((item_index, offset, bytes.len() as u64, kind));
    }

    /// Write the revision file and its sidecar indices. The data file
    /// goes through a temporary name; nothing is observable until
    /// `current` advances anyway.
    fn write(self, fs: &Filesystem, revision: u64) -> Result<()> {
        let layout = fs.layout();
        fs::create_dir_all(layout.shard_dir(layout.shard_of(revision)))?;

        let path = layout.rev_file(revision);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let mut l2p = L2pBuilder::new(revision, fs.config().l2p_page_size);
        let mut p2l = P2lBuilder::new(revision, fs.config().p2l_page_size);
        for (item_index, offset, size, kind) in &self.items {
            l2p.add(revision, *item_index, *offset);
            p2l.add(P2lEntry {
                offset: *offset,
                size: *size,
                item: ItemId::new(revision, *item_index),
                kind: *kind,
            });
        }
        l2p.write(&layout.rev_l2p_file(revision))?;
        p2l.write(&layout.rev_p2l_file(revision), self.buf.len() as u64)?;
        Ok(())
    }
}

/// A representation staged in the proto-revision file
#[derive(Serialize, Deserialize)]
struct StagedRep {
    item_index: u64,
    offset: u64,
    size: u64,
    kind: ItemKind,
}

/// Mutable, pre-commit state. Converted into an immutable revision at
/// commit, or discarded on abort.
pub struct Transaction<'a> {
    fs: &'a Filesystem,
    id: u64,
    base_rev: u64,
    props: RevProps,
    root_id: ItemId,
    base_id: ItemId,
    copies: Vec<String>,
    next_item: u64,
    proto_offset: u64,
    staged_reps: Vec<StagedRep>,
    staged_nodes: Vec<NodeRevision>,
    changes: ChangeList,
    rep_dedupe: HashMap<[u8; 32], Representation>,
}

fn allocate_txn_id(fs: &Filesystem) -> Result<u64> {
    let shared = fs.shared();
    let _intra = shared.txn_current_lock.lock();
    let _cross = lock_file_exclusive(&fs.layout().txn_current_lock_file())?;

    let path = fs.layout().txn_current_file();
    let id: u64 = fs::read_to_string(&path)?
        .trim()
        .parse()
        .map_err(|_| FsError::Corrupt("unparsable txn-current".into()))?;
    crate::layout::atomic_write(&path, (id + 1).to_string().as_bytes())?;
    Ok(id)
}

impl<'a> Transaction<'a> {
    /// Begin a transaction based on the current youngest revision.
    pub fn begin(fs: &'a Filesystem) -> Result<Self> {
        let id = allocate_txn_id(fs)?;
        let base_rev = fs.youngest()?;
        let base_id = fs.rev_root_id(base_rev)?;

        let layout = fs.layout();
        fs::create_dir_all(layout.txn_dir(id))?;
        fs::write(layout.txn_props_file(id), b"{}")?;
        fs::write(
            layout.txn_next_ids_file(id),
            ITEM_INDEX_FIRST_FREE.to_string(),
        )?;
        fs::write(layout.proto_rev_file(id), b"")?;
        fs::write(layout.proto_rev_lock_file(id), b"")?;

        debug!(txn_id = id, base_rev, "transaction started");
        Ok(Self {
            fs,
            id,
            base_rev,
            props: RevProps::new(),
            root_id: ItemId::new(TXN_REVISION, ITEM_INDEX_ROOT),
            base_id,
            copies: Vec::new(),
            next_item: ITEM_INDEX_FIRST_FREE,
            proto_offset: 0,
            staged_reps: Vec::new(),
            staged_nodes: Vec::new(),
            changes: ChangeList::default(),
            rep_dedupe: HashMap::new(),
        })
    }

    /// Reopen an in-progress transaction by id, e.g. from another
    /// handle on the same repository. Staged representations stay in
    /// the proto-revision file; properties, changes, copies and staged
    /// nodes are restored from the transaction directory.
    pub fn open(fs: &'a Filesystem, id: u64) -> Result<Self> {
        let layout = fs.layout();
        if !layout.txn_dir(id).exists() {
            return Err(FsError::TxnNotFound(id.to_string()));
        }

        let props: RevProps = serde_json::from_slice(&fs::read(layout.txn_props_file(id))?)?;
        let next_item: u64 = fs::read_to_string(layout.txn_next_ids_file(id))?
            .trim()
            .parse()
            .map_err(|_| FsError::Corrupt(format!("unparsable next-ids of transaction {id}")))?;
        let changes = match fs::read(layout.txn_changes_file(id)) {
            Ok(raw) => ChangeList::from_bytes(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChangeList::default(),
            Err(e) => return Err(e.into()),
        };

        let mut staged_nodes = Vec::new();
        for item in ITEM_INDEX_ROOT..next_item {
            let node_path = layout.txn_node_file(id, item);
            if node_path.exists() {
                staged_nodes.push(NodeRevision::from_bytes(&fs::read(node_path)?)?);
            }
        }

        let staged_reps: Vec<StagedRep> = match fs::read(layout.txn_reps_file(id)) {
            Ok(raw) => bincode::deserialize(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let copies: Vec<String> = match fs::read(layout.txn_copies_file(id)) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let proto_offset = fs::metadata(layout.proto_rev_file(id))?.len();
        let base_rev = fs.youngest()?;
        let base_id = fs.rev_root_id(base_rev)?;

        Ok(Self {
            fs,
            id,
            base_rev,
            props,
            root_id: ItemId::new(TXN_REVISION, ITEM_INDEX_ROOT),
            base_id,
            copies,
            next_item,
            proto_offset,
            staged_reps,
            staged_nodes,
            changes,
            rep_dedupe: HashMap::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn base_revision(&self) -> u64 {
        self.base_rev
    }

    pub fn base_root_id(&self) -> ItemId {
        self.base_id
    }

    pub fn root_id(&self) -> ItemId {
        self.root_id
    }

    /// Set a transaction property (author, log message).
    pub fn set_prop(&mut self, name: &str, value: &str) -> Result<()> {
        self.props.insert(name.to_string(), value.to_string());
        fs::write(
            self.fs.layout().txn_props_file(self.id),
            serde_json::to_vec_pretty(&self.props)?,
        )?;
        Ok(())
    }

    /// Record a copy made within this transaction. The list survives a
    /// reopen and is consumed when the transaction ends.
    pub fn add_copy(&mut self, copy_id: String) -> Result<()> {
        self.copies.push(copy_id);
        fs::write(
            self.fs.layout().txn_copies_file(self.id),
            serde_json::to_vec_pretty(&self.copies)?,
        )?;
        Ok(())
    }

    /// Copies recorded so far, in call order.
    pub fn copies(&self) -> &[String] {
        &self.copies
    }

    /// Store file or property content, consulting rep-sharing first.
    /// With a shared hit, no new bytes are written and the existing
    /// location is returned.
    pub fn store_content(
        &mut self,
        data: &[u8],
        is_property: bool,
        predecessor: Option<&NodeRevision>,
    ) -> Result<Representation> {
        let kind = if is_property {
            ItemKind::PropRep
        } else {
            ItemKind::FileRep
        };
        self.store_rep(data, kind, is_property, predecessor)
    }

    /// Store a directory listing representation.
    pub fn store_directory(
        &mut self,
        entries: &[DirEntry],
        predecessor: Option<&NodeRevision>,
    ) -> Result<Representation> {
        let data = bincode::serialize(entries)?;
        self.store_rep(&data, ItemKind::DirRep, false, predecessor)
    }

    fn store_rep(
        &mut self,
        data: &[u8],
        kind: ItemKind,
        is_property: bool,
        predecessor: Option<&NodeRevision>,
    ) -> Result<Representation> {
        let strong = strong_digest(data);
        let weak = weak_digest(data);

        if let Some(hit) = self.rep_dedupe.get(&strong) {
            return Ok(hit.clone());
        }

        if self.fs.config().enable_rep_sharing {
            let index = self.fs.rep_index()?;
            if let Some(existing) = index.lookup(&strong)? {
                // Trust policy: digest and size must both agree before
                // the existing location is reused.
                if existing.matches_strong(&strong) && existing.expanded_size == data.len() as u64 {
                    debug!(rep = %existing.id, "representation shared, no new bytes stored");
                    self.rep_dedupe.insert(strong, existing.clone());
                    return Ok(existing);
                }
            }
        }

        let config = self.fs.config();
        let base = choose_delta_base(predecessor, is_property, config, |id| {
            self.fs.node_revision(id).map(|n| (*n).clone())
        })?;

        let (header, payload) = match base {
            Some(base_rep) if !base_rep.id.is_txn() => {
                let base_header = self.fs.rep_header(&base_rep.id)?;
                if base_header.chain_len + 1 >= config.max_deltification_walk {
                    self.fulltext_header(data)
                } else {
                    let base_text = self.fs.contents(&base_rep)?;
                    let ops = delta::encode(&base_text, data);
                    let immediate = predecessor
                        .and_then(|p| {
                            if is_property {
                                p.prop_rep.as_ref()
                            } else {
                                p.data_rep.as_ref()
                            }
                        })
                        .map(|r| r.id == base_rep.id)
                        .unwrap_or(false);
                    (
                        RepHeader {
                            base: Some(base_rep.id),
                            chain_len: base_header.chain_len + 1,
                            linear_len: if immediate {
                                base_header.linear_len + 1
                            } else {
                                1
                            },
                            compression_level: config.compression_level,
                            expanded_size: data.len() as u64,
                        },
                        ops.to_bytes()?,
                    )
                }
            }
            _ => self.fulltext_header(data),
        };

        let block = encode_rep_block(header, &payload)?;

        // Append to the proto-revision file under the transaction's
        // non-recursive write lock plus the cross-process rev-lock.
        let _guard = self.fs.shared().begin_txn_write(self.id)?;
        let _cross = lock_file_exclusive(&self.fs.layout().proto_rev_lock_file(self.id))?;
        let mut proto = fs::OpenOptions::new()
            .append(true)
            .open(self.fs.layout().proto_rev_file(self.id))?;
        proto.write_all(&block)?;
        proto.sync_data()?;

        let item_index = self.next_item;
        self.next_item += 1;
        fs::write(
            self.fs.layout().txn_next_ids_file(self.id),
            self.next_item.to_string(),
        )?;
        self.staged_reps.push(StagedRep {
            item_index,
            offset: self.proto_offset,
            size: block.len() as u64,
            kind,
        });
        fs::write(
            self.fs.layout().txn_reps_file(self.id),
            bincode::serialize(&self.staged_reps)?,
        )?;
        self.proto_offset += block.len() as u64;

        let rep = Representation {
            strong_digest: Some(strong),
            weak_digest: weak,
            id: ItemId::new(TXN_REVISION, item_index),
            stored_size: block.len() as u64,
            expanded_size: data.len() as u64,
        };
        self.rep_dedupe.insert(strong, rep.clone());
        Ok(rep)
    }

    fn fulltext_header(&self, data: &[u8]) -> (RepHeader, Vec<u8>) {
        (
            RepHeader {
                base: None,
                chain_len: 0,
                linear_len: 0,
                compression_level: self.fs.config().compression_level,
                expanded_size: data.len() as u64,
            },
            data.to_vec(),
        )
    }

    /// Stage a non-root node revision; returns its transaction-local id.
    pub fn add_node_revision(&mut self, mut node: NodeRevision) -> Result<ItemId> {
        let id = ItemId::new(TXN_REVISION, self.next_item);
        self.next_item += 1;
        node.id = id;
        fs::write(
            self.fs.layout().txn_node_file(self.id, id.item_index),
            node.to_bytes()?,
        )?;
        self.staged_nodes.push(node);
        Ok(id)
    }

    /// Stage the revision root node.
    pub fn set_root(&mut self, mut node: NodeRevision) -> Result<ItemId> {
        node.id = self.root_id;
        fs::write(
            self.fs.layout().txn_node_file(self.id, ITEM_INDEX_ROOT),
            node.to_bytes()?,
        )?;
        self.staged_nodes.retain(|n| n.id != self.root_id);
        self.staged_nodes.push(node);
        Ok(self.root_id)
    }

    /// Append a change record. Order of calls is the order of the
    /// stored change list.
    pub fn add_change(&mut self, change: Change) -> Result<()> {
        self.changes.changes.push(change);
        fs::write(
            self.fs.layout().txn_changes_file(self.id),
            self.changes.to_bytes()?,
        )?;
        Ok(())
    }

    /// Commit: convert this transaction into the next revision.
    pub fn commit(mut self) -> Result<u64> {
        if !self.staged_nodes.iter().any(|n| n.id == self.root_id) {
            return Err(FsError::Corrupt(
                "transaction has no root node revision".into(),
            ));
        }

        let fs_handle = self.fs;
        let new_rev;
        {
            let shared = fs_handle.shared();
            let _intra = shared.write_lock.lock();
            let _cross = lock_file_exclusive(&fs_handle.layout().write_lock_file())?;
            let _txn_guard = shared.begin_txn_write(self.id)?;

            new_rev = fs_handle.youngest()? + 1;

            // Patch transaction-local ids to their final coordinates.
            let patch = |id: &mut ItemId| {
                if id.revision == TXN_REVISION {
                    id.revision = new_rev;
                }
            };
            for node in &mut self.staged_nodes {
                patch(&mut node.id);
                if let Some(rep) = &mut node.data_rep {
                    patch(&mut rep.id);
                }
                if let Some(rep) = &mut node.prop_rep {
                    patch(&mut rep.id);
                }
            }
            for change in &mut self.changes.changes {
                patch(&mut change.info.node_id);
            }
            patch(&mut self.root_id);

            // Materialize the revision file: staged reps keep their
            // proto-revision offsets, node revisions and the change
            // list are appended behind them.
            let mut revision_file = RevisionFile::new();
            let proto = fs::read(fs_handle.layout().proto_rev_file(self.id))?;
            revision_file.buf = proto;
            for staged in &self.staged_reps {
                revision_file
                    .items
                    .push((staged.item_index, staged.offset, staged.size, staged.kind));
            }
            for node in &self.staged_nodes {
                revision_file.add_item(node.id.item_index, ItemKind::NodeRev, &node.to_bytes()?);
            }
            revision_file.add_item(
                ITEM_INDEX_CHANGES,
                ItemKind::Changes,
                &self.changes.to_bytes()?,
            );
            revision_file.write(fs_handle, new_rev)?;

            // Final revision properties, then the commit point.
            self.props
                .insert("date".to_string(), chrono::Utc::now().to_rfc3339());
            write_revprops(fs_handle, new_rev, &self.props)?;
            fs_handle.write_current(new_rev)?;

            // Post-commit bookkeeping: rep-sharing index and node
            // origins reference the final locations.
            if fs_handle.config().enable_rep_sharing {
                let index = fs_handle.rep_index()?;
                for node in &self.staged_nodes {
                    for rep in [&node.data_rep, &node.prop_rep].into_iter().flatten() {
                        if rep.id.revision == new_rev && rep.strong_digest.is_some() {
                            index.insert(rep)?;
                        }
                    }
                }
            }
            for node in &self.staged_nodes {
                if node.predecessor_id.is_none() {
                    fs_handle.record_node_origin(node.id.item_index, node.id)?;
                }
            }

            // Warm the caches with what was just written.
            fs_handle.caches().rev_root_id.set(new_rev, self.root_id);
            for node in &self.staged_nodes {
                fs_handle.caches().node_rev.set(
                    PairKey {
                        revision: new_rev,
                        second: node.id.item_index,
                    },
                    std::sync::Arc::new(node.clone()),
                );
            }
            fs_handle
                .caches()
                .changes
                .set(new_rev, std::sync::Arc::new(self.changes.clone()));
        }

        self.cleanup()?;
        fs_handle.shared().release_txn(self.id);
        info!(txn_id = self.id, revision = new_rev, "transaction committed");

        if fs_handle.config().pack_after_commit {
            pack::pack_all(fs_handle)?;
        }
        Ok(new_rev)
    }

    /// Abort: discard all staged state.
    pub fn abort(self) -> Result<()> {
        self.cleanup()?;
        self.fs.shared().release_txn(self.id);
        debug!(txn_id = self.id, "transaction aborted");
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let layout = self.fs.layout();
        if layout.txn_dir(self.id).exists() {
            fs::remove_dir_all(layout.txn_dir(self.id))?;
        }
        for path in [
            layout.proto_rev_file(self.id),
            layout.proto_rev_lock_file(self.id),
        ] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Write revision 0: an empty root directory with an empty change list.
pub(crate) fn write_revision_zero(fs_handle: &Filesystem) -> Result<()> {
    let empty_dir: Vec<DirEntry> = Vec::new();
    let dir_bytes = bincode::serialize(&empty_dir)?;
    let header = RepHeader {
        base: None,
        chain_len: 0,
        linear_len: 0,
        compression_level: fs_handle.config().compression_level,
        expanded_size: dir_bytes.len() as u64,
    };
    let block = encode_rep_block(header, &dir_bytes)?;

    let dir_rep = Representation {
        strong_digest: Some(strong_digest(&dir_bytes)),
        weak_digest: weak_digest(&dir_bytes),
        id: ItemId::new(0, ITEM_INDEX_FIRST_FREE),
        stored_size: block.len() as u64,
        expanded_size: dir_bytes.len() as u64,
    };
    let root = NodeRevision {
        kind: NodeKind::Dir,
        id: ItemId::new(0, ITEM_INDEX_ROOT),
        predecessor_id: None,
        predecessor_count: 0,
        copy_source: None,
        copy_root: PathRev {
            path: "/".to_string(),
            revision: 0,
        },
        prop_rep: None,
        data_rep: Some(dir_rep),
        created_path: "/".to_string(),
        is_fresh_txn_root: false,
        mergeinfo_count: 0,
        has_mergeinfo: false,
    };

    let mut revision_file = RevisionFile::new();
    revision_file.add_item(ITEM_INDEX_CHANGES, ItemKind::Changes, &ChangeList::default().to_bytes()?);
    revision_file.add_item(ITEM_INDEX_ROOT, ItemKind::NodeRev, &root.to_bytes()?);
    revision_file.add_item(ITEM_INDEX_FIRST_FREE, ItemKind::DirRep, &block);
    revision_file.write(fs_handle, 0)?;

    let mut props = RevProps::new();
    props.insert("date".to_string(), chrono::Utc::now().to_rfc3339());
    write_revprops(fs_handle, 0, &props)?;
    fs_handle.write_current(0)?;
    Ok(())
}
