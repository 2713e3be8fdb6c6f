//! Repository integration tests: commit, deltification, rep-sharing,
//! packing and revision properties, through the public API only.

use packfs_core::node::{
    Change, ChangeInfo, ChangeKind, DirEntry, NodeKind, NodeRevision, PathRev,
};
use packfs_core::{
    get_revprops, set_revprop, Filesystem, FsConfig, FsError, ItemId, Transaction,
};
use std::sync::Arc;
use tempfile::TempDir;

fn small_repo(config: FsConfig) -> (TempDir, Filesystem) {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create(&dir.path().join("repo"), config).unwrap();
    (dir, fs)
}

/// Commit one revision changing a single file under the root. Returns
/// the new revision and the committed file node.
fn commit_file(
    fs: &Filesystem,
    name: &str,
    content: &[u8],
    predecessor: Option<&NodeRevision>,
) -> (u64, Arc<NodeRevision>) {
    let mut txn = Transaction::begin(fs).unwrap();
    let base_rev = txn.base_revision();

    let data_rep = txn.store_content(content, false, predecessor).unwrap();
    let file_node = NodeRevision {
        kind: NodeKind::File,
        id: ItemId::new(0, 0), // assigned on staging
        predecessor_id: predecessor.map(|p| p.id),
        predecessor_count: predecessor.map(|p| p.predecessor_count + 1).unwrap_or(0),
        copy_source: None,
        copy_root: PathRev {
            path: "/".to_string(),
            revision: base_rev,
        },
        prop_rep: None,
        data_rep: Some(data_rep),
        created_path: format!("/{name}"),
        is_fresh_txn_root: false,
        mergeinfo_count: 0,
        has_mergeinfo: false,
    };
    let file_id = txn.add_node_revision(file_node).unwrap();

    // New root listing: the base listing with this entry replaced.
    let base_root = fs.node_revision(&txn.base_root_id()).unwrap();
    let mut entries: Vec<DirEntry> = match &base_root.data_rep {
        Some(rep) => (*fs.dir_entries(rep).unwrap()).clone(),
        None => Vec::new(),
    };
    entries.retain(|e| e.name != name);
    entries.push(DirEntry {
        name: name.to_string(),
        id: file_id,
        kind: NodeKind::File,
    });
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let dir_rep = txn.store_directory(&entries, None).unwrap();

    let root_node = NodeRevision {
        kind: NodeKind::Dir,
        id: ItemId::new(0, 0),
        predecessor_id: Some(base_root.id),
        predecessor_count: base_root.predecessor_count + 1,
        copy_source: None,
        copy_root: PathRev {
            path: "/".to_string(),
            revision: base_rev,
        },
        prop_rep: None,
        data_rep: Some(dir_rep),
        created_path: "/".to_string(),
        is_fresh_txn_root: false,
        mergeinfo_count: 0,
        has_mergeinfo: false,
    };
    txn.set_root(root_node).unwrap();

    txn.add_change(Change {
        path: format!("/{name}"),
        info: ChangeInfo {
            node_id: file_id,
            kind: if predecessor.is_some() {
                ChangeKind::Modify
            } else {
                ChangeKind::Add
            },
            node_kind: NodeKind::File,
            text_modified: true,
            props_modified: false,
            copy_source: None,
        },
    })
    .unwrap();

    let rev = txn.commit().unwrap();
    let node = fs
        .node_revision(&ItemId::new(rev, file_id.item_index))
        .unwrap();
    (rev, node)
}

fn file_contents(fs: &Filesystem, rev: u64) -> Vec<u8> {
    let change = &fs.changes(rev).unwrap().changes[0];
    let node = fs.node_revision(&change.info.node_id).unwrap();
    fs.contents(node.data_rep.as_ref().unwrap()).unwrap().to_vec()
}

#[test]
fn test_create_repository() {
    let (_dir, fs) = small_repo(FsConfig::default());
    assert_eq!(fs.uuid().len(), 36);
    assert_eq!(fs.youngest().unwrap(), 0);
    assert_eq!(fs.read_min_unpacked_rev().unwrap(), 0);

    // Revision 0 is an empty root directory with an empty change list.
    let root = fs.node_revision(&fs.rev_root_id(0).unwrap()).unwrap();
    assert_eq!(root.kind, NodeKind::Dir);
    let entries = fs.dir_entries(root.data_rep.as_ref().unwrap()).unwrap();
    assert!(entries.is_empty());
    assert!(fs.changes(0).unwrap().changes.is_empty());
    assert_eq!(fs.verify(0, 0).unwrap(), 1);
}

#[test]
fn test_reopen_preserves_identity() {
    let (dir, fs) = small_repo(FsConfig::default());
    let uuid = fs.uuid().to_string();
    let instance = fs.instance_id().to_string();
    drop(fs);

    let fs = Filesystem::open(&dir.path().join("repo")).unwrap();
    assert_eq!(fs.uuid(), uuid);
    // Instance ids distinguish handles, uuids persist.
    assert_ne!(fs.instance_id(), instance);
}

#[test]
fn test_commit_and_read_back() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (rev, node) = commit_file(&fs, "greeting", b"hello world", None);
    assert_eq!(rev, 1);
    assert_eq!(fs.youngest().unwrap(), 1);

    assert_eq!(file_contents(&fs, 1), b"hello world");
    assert_eq!(node.created_path, "/greeting");

    let root = fs.node_revision(&fs.rev_root_id(1).unwrap()).unwrap();
    let entries = fs.dir_entries(root.data_rep.as_ref().unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "greeting");
    assert_eq!(entries[0].id, node.id);

    // Revision properties carry at least the commit date.
    let props = get_revprops(&fs, 1).unwrap();
    assert!(props.contains_key("date"));

    assert_eq!(fs.verify(0, 1).unwrap(), 2);
}

#[test]
fn test_change_list_preserves_order() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let mut txn = Transaction::begin(&fs).unwrap();

    let mut ids = Vec::new();
    let mut entries = Vec::new();
    for name in ["zebra", "apple", "mango"] {
        let rep = txn
            .store_content(format!("content of {name}").as_bytes(), false, None)
            .unwrap();
        let id = txn
            .add_node_revision(NodeRevision {
                kind: NodeKind::File,
                id: ItemId::new(0, 0),
                predecessor_id: None,
                predecessor_count: 0,
                copy_source: None,
                copy_root: PathRev {
                    path: "/".to_string(),
                    revision: 0,
                },
                prop_rep: None,
                data_rep: Some(rep),
                created_path: format!("/{name}"),
                is_fresh_txn_root: false,
                mergeinfo_count: 0,
                has_mergeinfo: false,
            })
            .unwrap();
        ids.push(id);
        entries.push(DirEntry {
            name: name.to_string(),
            id,
            kind: NodeKind::File,
        });
        txn.add_change(Change {
            path: format!("/{name}"),
            info: ChangeInfo {
                node_id: id,
                kind: ChangeKind::Add,
                node_kind: NodeKind::File,
                text_modified: true,
                props_modified: false,
                copy_source: None,
            },
        })
        .unwrap();
    }

    let dir_rep = txn.store_directory(&entries, None).unwrap();
    let base_root = fs.node_revision(&txn.base_root_id()).unwrap();
    txn.set_root(NodeRevision {
        kind: NodeKind::Dir,
        id: ItemId::new(0, 0),
        predecessor_id: Some(base_root.id),
        predecessor_count: 1,
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
    })
    .unwrap();

    let rev = txn.commit().unwrap();

    // Change order is modification order, not path order.
    let changes = fs.changes(rev).unwrap();
    let paths: Vec<&str> = changes.changes.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["/zebra", "/apple", "/mango"]);
}

#[test]
fn test_rep_sharing_reuses_existing_location() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (rev_a, node_a) = commit_file(&fs, "a", b"shared payload", None);
    let (rev_b, node_b) = commit_file(&fs, "b", b"shared payload", None);
    assert_eq!((rev_a, rev_b), (1, 2));

    // The second write stored no new bytes: its representation points
    // at the first one's location.
    let rep_a = node_a.data_rep.as_ref().unwrap();
    let rep_b = node_b.data_rep.as_ref().unwrap();
    assert_eq!(rep_b.id, rep_a.id);
    assert_eq!(rep_b.id.revision, 1);

    assert_eq!(file_contents(&fs, 2), b"shared payload");
    assert_eq!(fs.verify(0, 2).unwrap(), 3);
}

#[test]
fn test_rep_sharing_disabled_stores_new_bytes() {
    let mut config = FsConfig::default();
    config.enable_rep_sharing = false;
    let (_dir, fs) = small_repo(config);

    let (_, node_a) = commit_file(&fs, "a", b"shared payload", None);
    let (_, node_b) = commit_file(&fs, "b", b"shared payload", None);
    let rep_a = node_a.data_rep.as_ref().unwrap();
    let rep_b = node_b.data_rep.as_ref().unwrap();
    assert_ne!(rep_a.id, rep_b.id);
    assert_eq!(rep_b.id.revision, 2);
}

#[test]
fn test_delta_chain_reconstructs() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let v1 = vec![b'a'; 300];
    let mut v2 = v1.clone();
    v2.extend_from_slice(b"tail added in v2");
    let mut v3 = v2.clone();
    v3[0..5].copy_from_slice(b"edits");

    let (r1, n1) = commit_file(&fs, "f", &v1, None);
    let (r2, n2) = commit_file(&fs, "f", &v2, Some(&n1));
    let (r3, n3) = commit_file(&fs, "f", &v3, Some(&n2));

    // First version is a fulltext, the successors are deltas against
    // their predecessor.
    assert!(fs
        .rep_header(&n1.data_rep.as_ref().unwrap().id)
        .unwrap()
        .is_fulltext());
    let h2 = fs.rep_header(&n2.data_rep.as_ref().unwrap().id).unwrap();
    assert_eq!(h2.base, Some(n1.data_rep.as_ref().unwrap().id));
    assert_eq!(h2.chain_len, 1);
    let h3 = fs.rep_header(&n3.data_rep.as_ref().unwrap().id).unwrap();
    assert_eq!(h3.chain_len, 2);

    assert_eq!(file_contents(&fs, r1), v1);
    assert_eq!(file_contents(&fs, r2), v2);
    assert_eq!(file_contents(&fs, r3), v3);
    assert_eq!(fs.verify(0, 3).unwrap(), 4);
}

#[test]
fn test_lowered_walk_bound_keeps_old_chains_readable() {
    let (dir, fs) = small_repo(FsConfig::default());
    let v1 = vec![b'a'; 300];
    let mut v2 = v1.clone();
    v2.extend_from_slice(b"tail added in v2");
    let mut v3 = v2.clone();
    v3[0..5].copy_from_slice(b"edits");

    let (_, n1) = commit_file(&fs, "f", &v1, None);
    let (_, n2) = commit_file(&fs, "f", &v2, Some(&n1));
    let (r3, _) = commit_file(&fs, "f", &v3, Some(&n2));
    drop(fs);

    // Tighten the deltification walk below the length of the existing
    // chain. Reading is bounded by the recorded chain length, so the
    // committed history stays reconstructible.
    let conf_path = dir.path().join("repo").join("fsx.conf");
    let mut config = FsConfig::load(&conf_path).unwrap();
    config.max_deltification_walk = 1;
    config.save(&conf_path).unwrap();

    let fs = Filesystem::open(&dir.path().join("repo")).unwrap();
    assert_eq!(file_contents(&fs, r3), v3);
    assert_eq!(fs.verify(0, r3).unwrap(), r3 + 1);
}

#[test]
fn test_deltification_walk_restart_forces_fulltext() {
    let mut config = FsConfig::default();
    config.max_deltification_walk = 4;
    config.max_linear_deltification = 16;
    let (_dir, fs) = small_repo(config);

    let mut node = None;
    let mut headers = Vec::new();
    for i in 0..6 {
        let content = format!("version {i} of the file, padded {}", "x".repeat(100));
        let (_, n) = commit_file(&fs, "f", content.as_bytes(), node.as_deref());
        headers.push(fs.rep_header(&n.data_rep.as_ref().unwrap().id).unwrap());
        node = Some(n);
    }

    // History counts run 0..=5; the count divisible by the walk bound
    // restarts with a fulltext, its successor deltifies again.
    assert!(headers[0].is_fulltext());
    assert!(!headers[1].is_fulltext());
    assert!(!headers[3].is_fulltext());
    assert!(headers[4].is_fulltext());
    assert!(!headers[5].is_fulltext());
}

#[test]
fn test_pack_preserves_contents_and_is_idempotent() {
    let mut config = FsConfig::default();
    config.shard_size = 4;
    let (dir, fs) = small_repo(config);

    let mut node = None;
    for i in 1..=4 {
        let content = format!("file body at revision {i}");
        let (_, n) = commit_file(&fs, "f", content.as_bytes(), node.as_deref());
        node = Some(n);
    }
    let before: Vec<Vec<u8>> = (1..=4).map(|r| file_contents(&fs, r)).collect();
    let loose_offsets: Vec<u64> = (0..4).map(|r| fs.item_offset(r, 1).unwrap()).collect();

    // Shard 0 (revisions 0..=3) is complete and gets packed; shard 1
    // still holds the youngest revision and must stay loose.
    assert_eq!(packfs_core::pack::pack_all(&fs).unwrap(), 1);
    assert_eq!(fs.read_min_unpacked_rev().unwrap(), 4);
    assert!(fs.is_packed(3).unwrap());
    assert!(!fs.is_packed(4).unwrap());
    assert!(!fs.layout().shard_dir(0).exists());
    assert!(fs.layout().pack_file(0).exists());

    // Nothing left to pack; a second run is a no-op.
    assert_eq!(packfs_core::pack::pack_all(&fs).unwrap(), 0);
    assert_eq!(fs.read_min_unpacked_rev().unwrap(), 4);

    // A fresh handle reads identical contents through the pack.
    let fresh = Filesystem::open(&dir.path().join("repo")).unwrap();
    let after: Vec<Vec<u8>> = (1..=4).map(|r| file_contents(&fresh, r)).collect();
    assert_eq!(before, after);
    assert_eq!(fresh.verify(0, 4).unwrap(), 5);

    // Packed offsets are the loose offsets shifted by each member's
    // position in the pack file.
    let manifest = packfs_core::pack::read_manifest(&fresh, 0).unwrap();
    for r in 0..4u64 {
        assert_eq!(
            fresh.item_offset(r, 1).unwrap(),
            loose_offsets[r as usize] + manifest[r as usize]
        );
    }
}

#[test]
fn test_packed_reads_served_from_container_bundles() {
    let mut config = FsConfig::default();
    config.shard_size = 4;
    let (_dir, fs) = small_repo(config);

    let mut node = None;
    for i in 1..=4 {
        let (_, n) = commit_file(&fs, "f", format!("body {i}").as_bytes(), node.as_deref());
        node = Some(n);
    }
    assert_eq!(packfs_core::pack::pack_all(&fs).unwrap(), 1);

    // First reads pull the covering bundle into the container cache.
    let root_1 = fs.read_item(1, 1).unwrap();
    let root_2 = fs.read_item(2, 1).unwrap();

    // Clobber the pack file on disk. Repeat reads are still served
    // from the cached bundle; a fresh handle sees the garbage.
    let pack_path = fs.layout().pack_file(0);
    let len = std::fs::metadata(&pack_path).unwrap().len() as usize;
    std::fs::write(&pack_path, vec![0xaa; len]).unwrap();

    assert_eq!(fs.read_item(1, 1).unwrap(), root_1);
    assert_eq!(fs.read_item(2, 1).unwrap(), root_2);

    let fresh = fs.reopen().unwrap();
    assert_ne!(fresh.read_item(1, 1).unwrap(), root_1);
}

#[test]
fn test_dag_and_mergeinfo_caches() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (rev, node) = commit_file(&fs, "f", b"data", None);

    assert!(fs.cached_dag_node(rev, "/f").is_none());
    fs.cache_dag_node(rev, "/f", Arc::clone(&node));
    assert_eq!(fs.cached_dag_node(rev, "/f").unwrap().id, node.id);

    assert!(fs.mergeinfo_presence(rev, "/f").is_none());
    fs.cache_mergeinfo(rev, "/f", None);
    assert_eq!(fs.mergeinfo_presence(rev, "/f"), Some(false));
    fs.cache_mergeinfo(rev, "/f", Some(Arc::new("/branches/x:1-4".to_string())));
    assert_eq!(fs.mergeinfo_presence(rev, "/f"), Some(true));
    assert_eq!(
        fs.cached_mergeinfo(rev, "/f").unwrap().as_str(),
        "/branches/x:1-4"
    );
}

#[test]
fn test_packed_revprops_remain_readable_and_writable() {
    let mut config = FsConfig::default();
    config.shard_size = 4;
    let (_dir, fs) = small_repo(config);

    let mut node = None;
    for i in 1..=4 {
        let (rev, n) = commit_file(&fs, "f", format!("v{i}").as_bytes(), node.as_deref());
        set_revprop(&fs, rev, "log", Some(format!("commit {rev}"))).unwrap();
        node = Some(n);
    }
    assert_eq!(packfs_core::pack::pack_all(&fs).unwrap(), 1);

    // Reads go through the packed shard now.
    let props = get_revprops(&fs, 2).unwrap();
    assert_eq!(props.get("log").map(String::as_str), Some("commit 2"));

    // Writing into a packed shard rewrites it in place.
    set_revprop(&fs, 2, "log", Some("amended".to_string())).unwrap();
    assert_eq!(
        get_revprops(&fs, 2).unwrap().get("log").map(String::as_str),
        Some("amended")
    );
    // Neighbors are untouched by the rewrite.
    assert_eq!(
        get_revprops(&fs, 3).unwrap().get("log").map(String::as_str),
        Some("commit 3")
    );
}

#[test]
fn test_revprop_generation_invalidates_sibling_handle() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (rev, _) = commit_file(&fs, "f", b"data", None);

    let sibling = fs.reopen().unwrap();
    set_revprop(&sibling, rev, "log", Some("first".to_string())).unwrap();

    // Populate the first handle's cache, then change the value through
    // the sibling. The generation bump forces the first handle to
    // re-read.
    assert_eq!(
        get_revprops(&fs, rev).unwrap().get("log").map(String::as_str),
        Some("first")
    );
    set_revprop(&sibling, rev, "log", Some("second".to_string())).unwrap();
    assert_eq!(
        get_revprops(&fs, rev).unwrap().get("log").map(String::as_str),
        Some("second")
    );
}

#[test]
fn test_set_revprop_rejects_unknown_revision() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let err = set_revprop(&fs, 99, "log", Some("x".to_string())).unwrap_err();
    assert!(matches!(err, FsError::RevisionNotFound(99)));
}

#[test]
fn test_format_mismatch_refuses_open() {
    let (dir, fs) = small_repo(FsConfig::default());
    let root = dir.path().join("repo");
    drop(fs);

    std::fs::write(root.join("format"), "99\n").unwrap();
    let err = Filesystem::open(&root).unwrap_err();
    assert!(matches!(
        err,
        FsError::Format {
            expected: _,
            found: 99
        }
    ));
}

#[test]
fn test_open_missing_repository_fails() {
    let dir = TempDir::new().unwrap();
    assert!(Filesystem::open(&dir.path().join("nope")).is_err());
}

#[test]
fn test_abort_discards_staged_state() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let mut txn = Transaction::begin(&fs).unwrap();
    let txn_id = txn.id();
    txn.store_content(b"never committed", false, None).unwrap();
    assert!(fs.layout().txn_dir(txn_id).exists());
    assert!(fs.layout().proto_rev_file(txn_id).exists());
    txn.abort().unwrap();

    assert!(!fs.layout().txn_dir(txn_id).exists());
    assert!(!fs.layout().proto_rev_file(txn_id).exists());
    assert_eq!(fs.youngest().unwrap(), 0);
}

#[test]
fn test_reopened_transaction_commits() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let txn_id;
    {
        let mut txn = Transaction::begin(&fs).unwrap();
        txn_id = txn.id();
        txn.set_prop("log", "staged before reopen").unwrap();

        let rep = txn.store_content(b"reopened payload", false, None).unwrap();
        let file_id = txn
            .add_node_revision(NodeRevision {
                kind: NodeKind::File,
                id: ItemId::new(0, 0),
                predecessor_id: None,
                predecessor_count: 0,
                copy_source: None,
                copy_root: PathRev {
                    path: "/".to_string(),
                    revision: 0,
                },
                prop_rep: None,
                data_rep: Some(rep),
                created_path: "/f".to_string(),
                is_fresh_txn_root: false,
                mergeinfo_count: 0,
                has_mergeinfo: false,
            })
            .unwrap();

        let dir_rep = txn
            .store_directory(
                &[DirEntry {
                    name: "f".to_string(),
                    id: file_id,
                    kind: NodeKind::File,
                }],
                None,
            )
            .unwrap();
        let base_root = fs.node_revision(&txn.base_root_id()).unwrap();
        txn.set_root(NodeRevision {
            kind: NodeKind::Dir,
            id: ItemId::new(0, 0),
            predecessor_id: Some(base_root.id),
            predecessor_count: 1,
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
        })
        .unwrap();
        txn.add_change(Change {
            path: "/f".to_string(),
            info: ChangeInfo {
                node_id: file_id,
                kind: ChangeKind::Add,
                node_kind: NodeKind::File,
                text_modified: true,
                props_modified: false,
                copy_source: None,
            },
        })
        .unwrap();
        // Handle goes away without committing or aborting; the staged
        // state stays on disk.
    }

    let reopened = Transaction::open(&fs, txn_id).unwrap();
    let rev = reopened.commit().unwrap();
    assert_eq!(file_contents(&fs, rev), b"reopened payload");
    assert_eq!(
        get_revprops(&fs, rev).unwrap().get("log").map(String::as_str),
        Some("staged before reopen")
    );
    assert_eq!(fs.verify(0, rev).unwrap(), rev + 1);
}

#[test]
fn test_copies_survive_transaction_reopen() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let txn_id;
    {
        let mut txn = Transaction::begin(&fs).unwrap();
        txn_id = txn.id();
        txn.add_copy("0.0".to_string()).unwrap();
        txn.add_copy("0.1".to_string()).unwrap();
        assert_eq!(txn.copies(), ["0.0", "0.1"]);
    }

    let reopened = Transaction::open(&fs, txn_id).unwrap();
    assert_eq!(reopened.copies(), ["0.0", "0.1"]);
    reopened.abort().unwrap();
}

#[test]
fn test_open_unknown_transaction_fails() {
    let (_dir, fs) = small_repo(FsConfig::default());
    assert!(matches!(
        Transaction::open(&fs, 999),
        Err(FsError::TxnNotFound(_))
    ));
}

#[test]
fn test_commit_without_root_is_rejected() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let mut txn = Transaction::begin(&fs).unwrap();
    txn.store_content(b"orphan", false, None).unwrap();
    assert!(txn.commit().is_err());
    assert_eq!(fs.youngest().unwrap(), 0);
}

#[test]
fn test_node_origin_recorded_on_first_appearance() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (_, n1) = commit_file(&fs, "f", b"v1", None);
    let (_, n2) = commit_file(&fs, "f", b"v2", Some(&n1));

    let origin = fs.node_origin(n1.id.item_index).unwrap().unwrap();
    assert_eq!(origin, n1.id);
    // A successor of an existing node records no new origin.
    assert_eq!(n2.predecessor_id, Some(n1.id));
}

#[test]
fn test_corrupted_item_fails_verification() {
    let (_dir, fs) = small_repo(FsConfig::default());
    let (rev, node) = commit_file(&fs, "f", b"pristine content", None);

    // Flip bytes inside the stored representation.
    let path = fs.layout().rev_file(rev);
    let mut data = std::fs::read(&path).unwrap();
    let offset = fs
        .item_offset(rev, node.data_rep.as_ref().unwrap().id.item_index)
        .unwrap() as usize;
    for b in &mut data[offset..offset + 8] {
        *b ^= 0xff;
    }
    std::fs::write(&path, data).unwrap();

    let fresh = fs.reopen().unwrap();
    assert!(fresh.verify(rev, rev).is_err());
}
