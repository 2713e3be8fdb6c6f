//! On-disk layout of a repository instance
//!
//! ```text
//! {root}/
//!   format                  - format version (integer)
//!   uuid                    - repository identity
//!   current                 - youngest committed revision number
//!   write-lock, pack-lock   - cross-process advisory lock files
//!   min-unpacked-rev        - packing boundary
//!   revprop-generation      - monotonic revprop cache invalidation counter
//!   revs/<shard>/<rev>      - loose revision files (+ .l2p / .p2l indices)
//!   revs/<shard>.pack/      - packed shard: pack, manifest, pack.l2p, pack.p2l
//!   revprops/<shard>/<rev>  - revision properties
//!   transactions/<txn>.txn/ - in-progress transaction state
//!   txn-protorevs/          - proto-revision files + their locks
//!   txn-current(-lock)      - next transaction id allocator
//!   node-origins/           - lazy node-origin lookup cache
//!   locks/                  - path lock storage
//!   fsx.conf                - tunables
//! ```

use std::path::{Path, PathBuf};

/// Path helper for one repository root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    shard_size: u64,
}

impl Layout {
    pub fn new(root: &Path, shard_size: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            shard_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard number containing a revision
    pub fn shard_of(&self, revision: u64) -> u64 {
        revision / self.shard_size
    }

    /// First revision of the shard after `shard`
    pub fn shard_end(&self, shard: u64) -> u64 {
        (shard + 1) * self.shard_size
    }

    pub fn format_file(&self) -> PathBuf {
        self.root.join("format")
    }

    pub fn uuid_file(&self) -> PathBuf {
        self.root.join("uuid")
    }

    pub fn current_file(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn write_lock_file(&self) -> PathBuf {
        self.root.join("write-lock")
    }

    pub fn pack_lock_file(&self) -> PathBuf {
        self.root.join("pack-lock")
    }

    pub fn min_unpacked_rev_file(&self) -> PathBuf {
        self.root.join("min-unpacked-rev")
    }

    pub fn revprop_generation_file(&self) -> PathBuf {
        self.root.join("revprop-generation")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("fsx.conf")
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.root.join("revs")
    }

    pub fn shard_dir(&self, shard: u64) -> PathBuf {
        self.revs_dir().join(shard.to_string())
    }

    pub fn rev_file(&self, revision: u64) -> PathBuf {
        self.shard_dir(self.shard_of(revision))
            .join(revision.to_string())
    }

    pub fn rev_l2p_file(&self, revision: u64) -> PathBuf {
        self.shard_dir(self.shard_of(revision))
            .join(format!("{revision}.l2p"))
    }

    pub fn rev_p2l_file(&self, revision: u64) -> PathBuf {
        self.shard_dir(self.shard_of(revision))
            .join(format!("{revision}.p2l"))
    }

    pub fn packed_shard_dir(&self, shard: u64) -> PathBuf {
        self.revs_dir().join(format!("{shard}.pack"))
    }

    pub fn pack_file(&self, shard: u64) -> PathBuf {
        self.packed_shard_dir(shard).join("pack")
    }

    pub fn manifest_file(&self, shard: u64) -> PathBuf {
        self.packed_shard_dir(shard).join("manifest")
    }

    pub fn pack_l2p_file(&self, shard: u64) -> PathBuf {
        self.packed_shard_dir(shard).join("pack.l2p")
    }

    pub fn pack_p2l_file(&self, shard: u64) -> PathBuf {
        self.packed_shard_dir(shard).join("pack.p2l")
    }

    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join("revprops")
    }

    pub fn revprop_shard_dir(&self, shard: u64) -> PathBuf {
        self.revprops_dir().join(shard.to_string())
    }

    pub fn revprop_file(&self, revision: u64) -> PathBuf {
        self.revprop_shard_dir(self.shard_of(revision))
            .join(revision.to_string())
    }

    pub fn txns_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn txn_dir(&self, txn_id: u64) -> PathBuf {
        self.txns_dir().join(format!("{txn_id}.txn"))
    }

    pub fn txn_props_file(&self, txn_id: u64) -> PathBuf {
        self.txn_dir(txn_id).join("props")
    }

    pub fn txn_changes_file(&self, txn_id: u64) -> PathBuf {
        self.txn_dir(txn_id).join("changes")
    }

    pub fn txn_next_ids_file(&self, txn_id: u64) -> PathBuf {
        self.txn_dir(txn_id).join("next-ids")
    }

    pub fn txn_reps_file(&self, txn_id: u64) -> PathBuf {
        self.txn_dir(txn_id).join("reps")
    }

    pub fn txn_copies_file(&self, txn_id: u64) -> PathBuf {
        self.txn_dir(txn_id).join("copies")
    }

    pub fn txn_node_file(&self, txn_id: u64, item_index: u64) -> PathBuf {
        self.txn_dir(txn_id).join(format!("node.{item_index}"))
    }

    pub fn proto_revs_dir(&self) -> PathBuf {
        self.root.join("txn-protorevs")
    }

    pub fn proto_rev_file(&self, txn_id: u64) -> PathBuf {
        self.proto_revs_dir().join(format!("{txn_id}.rev"))
    }

    pub fn proto_rev_lock_file(&self, txn_id: u64) -> PathBuf {
        self.proto_revs_dir().join(format!("{txn_id}.rev-lock"))
    }

    pub fn txn_current_file(&self) -> PathBuf {
        self.root.join("txn-current")
    }

    pub fn txn_current_lock_file(&self) -> PathBuf {
        self.root.join("txn-current-lock")
    }

    pub fn node_origins_dir(&self) -> PathBuf {
        self.root.join("node-origins")
    }

    pub fn node_origin_file(&self, item_index: u64) -> PathBuf {
        self.node_origins_dir().join(item_index.to_string())
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
}

/// Write `data` to `path` atomically: write a temporary sibling, sync it,
/// rename into place. Readers never observe a partial file.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shard_paths() {
        let layout = Layout::new(Path::new("/repo"), 1000);
        assert_eq!(layout.shard_of(0), 0);
        assert_eq!(layout.shard_of(999), 0);
        assert_eq!(layout.shard_of(1000), 1);
        assert_eq!(layout.rev_file(1500), PathBuf::from("/repo/revs/1/1500"));
        assert_eq!(
            layout.pack_file(2),
            PathBuf::from("/repo/revs/2.pack/pack")
        );
    }

    #[test]
    fn test_atomic_write_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current");
        atomic_write(&path, b"1").unwrap();
        atomic_write(&path, b"2").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"2");
        assert!(!path.with_extension("tmp").exists());
    }
}
