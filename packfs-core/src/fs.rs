//! Filesystem instance: open/create and the hot read path
//!
//! One `Filesystem` exists per open handle. Handles on the same
//! repository identity share one `FsSharedState` through the process-
//! wide registry, so intra-process locking works across handles. All
//! reads resolve through the cache layer and fall back to the loose or
//! packed revision files via the paged indices.

use crate::cache::{Cache, CacheSet, PageKey, PairKey, RemoteCacheBackend, RepCacheKey, WindowKey};
use crate::config::{FsConfig, FORMAT_NUMBER};
use crate::delta;
use crate::error::{FsError, Result};
use crate::id::ItemId;
use crate::index::{
    read_l2p_header, read_l2p_page, read_p2l_header, read_p2l_page, L2pHeader, P2lEntry,
};
use crate::layout::{atomic_write, Layout};
use crate::lock::{shared_state_for, FsSharedState};
use crate::node::{ChangeList, DirEntry, NodeRevision};
use crate::rep::{
    decode_rep_block, strong_digest, weak_digest, RepHeader, Representation, SqliteRepIndex,
};
use bytes::Bytes;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Item index of the change list within every revision file
pub const ITEM_INDEX_CHANGES: u64 = 0;
/// Item index of the root node revision within every revision file
pub const ITEM_INDEX_ROOT: u64 = 1;
/// First item index available for ordinary items
pub const ITEM_INDEX_FIRST_FREE: u64 = 2;

/// Capability for opening a filesystem by path. Passed at construction
/// where a sibling handle is needed, never stored as a hidden callback.
pub trait OpenFs: Send + Sync {
    fn open_fs(&self, path: &Path) -> Result<Filesystem>;
}

/// Default opener backed by [`Filesystem::open`]
pub struct DefaultOpener;

impl OpenFs for DefaultOpener {
    fn open_fs(&self, path: &Path) -> Result<Filesystem> {
        Filesystem::open(path)
    }
}

/// One open handle on a repository
pub struct Filesystem {
    layout: Layout,
    config: FsConfig,
    format: u32,
    uuid: String,
    /// Distinguishes instances that share a uuid (backups, copies)
    instance_id: String,
    shared: Arc<FsSharedState>,
    caches: CacheSet,
    opener: Arc<dyn OpenFs>,
    /// Lazily opened digest index; may be opened concurrently
    rep_index: parking_lot::Mutex<Option<Arc<SqliteRepIndex>>>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("format", &self.format)
            .field("uuid", &self.uuid)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Create a new repository at `path` and open it.
    pub fn create(path: &Path, config: FsConfig) -> Result<Filesystem> {
        let layout = Layout::new(path, config.shard_size);
        fs::create_dir_all(path)?;
        if layout.format_file().exists() {
            return Err(FsError::Corrupt(format!(
                "repository already exists at {}",
                path.display()
            )));
        }

        fs::create_dir_all(layout.revs_dir())?;
        fs::create_dir_all(layout.revprops_dir())?;
        fs::create_dir_all(layout.txns_dir())?;
        fs::create_dir_all(layout.proto_revs_dir())?;
        fs::create_dir_all(layout.node_origins_dir())?;
        fs::create_dir_all(layout.locks_dir())?;

        let uuid = uuid::Uuid::new_v4().to_string();
        fs::write(layout.uuid_file(), &uuid)?;
        fs::write(layout.format_file(), format!("{FORMAT_NUMBER}\n"))?;
        fs::write(layout.write_lock_file(), b"")?;
        fs::write(layout.pack_lock_file(), b"")?;
        fs::write(layout.txn_current_lock_file(), b"")?;
        atomic_write(&layout.txn_current_file(), b"0")?;
        atomic_write(&layout.min_unpacked_rev_file(), b"0")?;
        atomic_write(&layout.revprop_generation_file(), b"0")?;
        config.save(&layout.config_file())?;

        // Revision 0: an empty root directory and an empty change list.
        let fs_handle = Self::open(path)?;
        crate::txn::write_revision_zero(&fs_handle)?;
        info!(uuid = %fs_handle.uuid, path = %path.display(), "repository created");
        Ok(fs_handle)
    }

    /// Open an existing repository.
    pub fn open(path: &Path) -> Result<Filesystem> {
        Self::open_ext(path, None, Arc::new(DefaultOpener))
    }

    /// Open with an optional shared remote cache backend and an explicit
    /// opener capability.
    pub fn open_ext(
        path: &Path,
        remote_cache: Option<Arc<dyn RemoteCacheBackend>>,
        opener: Arc<dyn OpenFs>,
    ) -> Result<Filesystem> {
        let format_text = fs::read_to_string(path.join("format"))
            .map_err(|_| FsError::Corrupt(format!("no repository at {}", path.display())))?;
        let format: u32 = format_text
            .trim()
            .parse()
            .map_err(|_| FsError::Corrupt("unparsable format file".into()))?;
        if format != FORMAT_NUMBER {
            return Err(FsError::Format {
                expected: FORMAT_NUMBER,
                found: format,
            });
        }

        let config = FsConfig::load(&path.join("fsx.conf"))?;
        let layout = Layout::new(path, config.shard_size);
        let uuid = fs::read_to_string(layout.uuid_file())?.trim().to_string();
        let shared = shared_state_for(&uuid);
        let paged_indices = format >= 1;
        let caches = CacheSet::new(paged_indices, remote_cache, config.fail_stop);

        debug!(uuid = %uuid, format, "filesystem opened");
        Ok(Filesystem {
            layout,
            config,
            format,
            uuid,
            instance_id: uuid::Uuid::new_v4().to_string(),
            shared,
            caches,
            opener,
            rep_index: parking_lot::Mutex::new(None),
        })
    }

    /// Open a sibling handle on the same repository through the opener
    /// capability.
    pub fn reopen(&self) -> Result<Filesystem> {
        self.opener.open_fs(self.layout.root())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn shared(&self) -> &Arc<FsSharedState> {
        &self.shared
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    /// The digest index, opened on first use.
    pub fn rep_index(&self) -> Result<Arc<SqliteRepIndex>> {
        let mut guard = self.rep_index.lock();
        if guard.is_none() {
            let index = SqliteRepIndex::open(&self.layout.root().join("rep-cache.db"))?;
            *guard = Some(Arc::new(index));
        }
        Ok(Arc::clone(guard.as_ref().expect("just initialized")))
    }

    /// Youngest committed revision.
    pub fn youngest(&self) -> Result<u64> {
        let text = fs::read_to_string(self.layout.current_file())?;
        text.trim()
            .parse()
            .map_err(|_| FsError::Corrupt("unparsable current file".into()))
    }

    pub(crate) fn write_current(&self, revision: u64) -> Result<()> {
        atomic_write(&self.layout.current_file(), revision.to_string().as_bytes())?;
        Ok(())
    }

    /// Packing boundary: revisions below live in packed shards.
    pub fn read_min_unpacked_rev(&self) -> Result<u64> {
        let text = fs::read_to_string(self.layout.min_unpacked_rev_file())?;
        text.trim()
            .parse()
            .map_err(|_| FsError::Corrupt("unparsable min-unpacked-rev".into()))
    }

    pub(crate) fn write_min_unpacked_rev(&self, revision: u64) -> Result<()> {
        atomic_write(
            &self.layout.min_unpacked_rev_file(),
            revision.to_string().as_bytes(),
        )?;
        Ok(())
    }

    pub fn is_packed(&self, revision: u64) -> Result<bool> {
        Ok(revision < self.read_min_unpacked_rev()?)
    }

    /// Data file, index files and covered first revision for a revision.
    fn file_of(&self, revision: u64) -> Result<(PathBuf, PathBuf, PathBuf, u64, bool)> {
        if self.is_packed(revision)? {
            let shard = self.layout.shard_of(revision);
            Ok((
                self.layout.pack_file(shard),
                self.layout.pack_l2p_file(shard),
                self.layout.pack_p2l_file(shard),
                shard * self.config.shard_size,
                true,
            ))
        } else {
            Ok((
                self.layout.rev_file(revision),
                self.layout.rev_l2p_file(revision),
                self.layout.rev_p2l_file(revision),
                revision,
                false,
            ))
        }
    }

    fn l2p_header_cached(&self, path: &Path, first_rev: u64, packed: bool) -> Result<Arc<L2pHeader>> {
        let key = PairKey {
            revision: first_rev,
            second: packed as u64,
        };
        if let Some(cache) = &self.caches.l2p_header {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }
        let header = Arc::new(read_l2p_header(path)?);
        if let Some(cache) = &self.caches.l2p_header {
            cache.set(key, Arc::clone(&header));
        }
        Ok(header)
    }

    /// Physical byte offset of (revision, item) inside its data file.
    pub fn item_offset(&self, revision: u64, item_index: u64) -> Result<u64> {
        let (_, l2p_path, _, first_rev, packed) = self.file_of(revision)?;
        let header = self.l2p_header_cached(&l2p_path, first_rev, packed)?;
        let (page, idx) = header
            .page_of(revision, item_index)
            .ok_or(FsError::NotFound(ItemId::new(revision, item_index)))?;

        let page_key = PageKey {
            revision: first_rev,
            is_packed: packed,
            page,
        };
        let offsets = if let Some(cache) = &self.caches.l2p_page {
            match cache.get(&page_key) {
                Some(hit) => hit,
                None => {
                    let loaded = Arc::new(read_l2p_page(&l2p_path, &header, page)?);
                    cache.set(page_key, Arc::clone(&loaded));
                    loaded
                }
            }
        } else {
            Arc::new(read_l2p_page(&l2p_path, &header, page)?)
        };

        match offsets.offsets.get(idx) {
            Some(&off) if off != u64::MAX => Ok(off),
            _ => Err(FsError::NotFound(ItemId::new(revision, item_index))),
        }
    }

    /// Phys-to-log entry covering `offset` in the file holding
    /// `revision`. Used by verification and packing.
    pub fn p2l_entry(&self, revision: u64, offset: u64) -> Result<P2lEntry> {
        let (_, _, p2l_path, first_rev, packed) = self.file_of(revision)?;
        let header = {
            let key = PairKey {
                revision: first_rev,
                second: packed as u64,
            };
            if let Some(cache) = &self.caches.p2l_header {
                match cache.get(&key) {
                    Some(hit) => hit,
                    None => {
                        let loaded = Arc::new(read_p2l_header(&p2l_path)?);
                        cache.set(key, Arc::clone(&loaded));
                        loaded
                    }
                }
            } else {
                Arc::new(read_p2l_header(&p2l_path)?)
            }
        };

        let mut page = header.page_of_offset(offset);
        loop {
            let page_key = PageKey {
                revision: first_rev,
                is_packed: packed,
                page,
            };
            let entries = if let Some(cache) = &self.caches.p2l_page {
                match cache.get(&page_key) {
                    Some(hit) => hit,
                    None => {
                        let loaded = Arc::new(read_p2l_page(&p2l_path, &header, page)?);
                        cache.set(page_key, Arc::clone(&loaded));
                        loaded
                    }
                }
            } else {
                Arc::new(read_p2l_page(&p2l_path, &header, page)?)
            };
            if let Some(entry) = entries.find(offset) {
                return Ok(*entry);
            }
            // An entry may start in the previous page and span into this
            // one.
            if page == 0 {
                return Err(FsError::Corrupt(format!(
                    "no p2l entry covers offset {offset} of revision {revision}"
                )));
            }
            page -= 1;
        }
    }

    /// All p2l entries of one revision, in physical order.
    pub fn p2l_entries_of(&self, revision: u64) -> Result<Vec<P2lEntry>> {
        let (_, _, p2l_path, _, _) = self.file_of(revision)?;
        let header = read_p2l_header(&p2l_path)?;
        let mut entries = Vec::new();
        for page in 0..header.page_count() {
            for entry in read_p2l_page(&p2l_path, &header, page)?.entries {
                if entry.item.revision == revision {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|e| e.offset);
        Ok(entries)
    }

    /// Raw bytes of one item, located via l2p and sized via p2l. Items
    /// in pack files are assembled from container bundles so that
    /// records grouped in one byte region cost a single read.
    pub fn read_item(&self, revision: u64, item_index: u64) -> Result<Vec<u8>> {
        let offset = self.item_offset(revision, item_index)?;
        let entry = self.p2l_entry(revision, offset)?;
        let (data_path, _, _, first_rev, packed) = self.file_of(revision)?;

        if packed {
            return self.read_container_region(&data_path, first_rev, offset, entry.size);
        }

        let mut file = fs::File::open(&data_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; entry.size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Assemble one byte region of a pack file from `block_size`-aligned
    /// container bundles. Pack files are written once, so a bundle is
    /// valid for the life of the cache; `first_rev` is the shard's first
    /// revision and keys the bundle together with the block offset.
    fn read_container_region(
        &self,
        data_path: &Path,
        first_rev: u64,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let block_size = self.config.block_size.max(1);
        let mut out = Vec::with_capacity(size as usize);
        let mut block_start = offset - offset % block_size;

        while (out.len() as u64) < size {
            let key = PairKey {
                revision: first_rev,
                second: block_start,
            };
            let block = match self.caches.containers.get(&key)? {
                Some(hit) => hit,
                None => {
                    let mut file = fs::File::open(data_path)?;
                    file.seek(SeekFrom::Start(block_start))?;
                    let mut buf = Vec::with_capacity(block_size as usize);
                    file.take(block_size).read_to_end(&mut buf)?;
                    let bytes = Bytes::from(buf);
                    self.caches.containers.set(key, bytes.clone())?;
                    bytes
                }
            };

            let pos = offset + out.len() as u64;
            if pos < block_start || (pos - block_start) as usize >= block.len() {
                return Err(FsError::Corrupt(format!(
                    "pack file {} ends inside the region at offset {offset}",
                    data_path.display()
                )));
            }
            let skip = (pos - block_start) as usize;
            let want = (size as usize) - out.len();
            let avail = &block[skip..];
            out.extend_from_slice(&avail[..want.min(avail.len())]);
            block_start += block_size;
        }
        Ok(out)
    }

    /// Node revision by id, through the node-revision cache.
    pub fn node_revision(&self, id: &ItemId) -> Result<Arc<NodeRevision>> {
        if id.revision > self.youngest()? {
            return Err(FsError::RevisionNotFound(id.revision));
        }
        let key = PairKey {
            revision: id.revision,
            second: id.item_index,
        };
        if let Some(hit) = self.caches.node_rev.get(&key) {
            return Ok(hit);
        }
        let raw = self.read_item(id.revision, id.item_index)?;
        let node = Arc::new(NodeRevision::from_bytes(&raw)?);
        self.caches.node_rev.set(key, Arc::clone(&node));
        Ok(node)
    }

    /// Id of the root node of a revision.
    pub fn rev_root_id(&self, revision: u64) -> Result<ItemId> {
        if let Some(hit) = self.caches.rev_root_id.get(&revision) {
            return Ok(hit);
        }
        if revision > self.youngest()? {
            return Err(FsError::RevisionNotFound(revision));
        }
        let id = ItemId::new(revision, ITEM_INDEX_ROOT);
        self.caches.rev_root_id.set(revision, id);
        Ok(id)
    }

    /// Ordered change list of a revision.
    pub fn changes(&self, revision: u64) -> Result<Arc<ChangeList>> {
        if let Some(hit) = self.caches.changes.get(&revision) {
            return Ok(hit);
        }
        let raw = self.read_item(revision, ITEM_INDEX_CHANGES)?;
        let list = Arc::new(ChangeList::from_bytes(&raw)?);
        self.caches.changes.set(revision, Arc::clone(&list));
        Ok(list)
    }

    /// Representation header by location, cached.
    pub fn rep_header(&self, id: &ItemId) -> Result<RepHeader> {
        let key = RepCacheKey {
            revision: id.revision,
            is_packed: self.is_packed(id.revision)?,
            item_index: id.item_index,
        };
        if let Some(hit) = self.caches.rep_header.get(&key) {
            return Ok(hit);
        }
        let raw = self.read_item(id.revision, id.item_index)?;
        let (header, _) = decode_rep_block(&raw)?;
        self.caches.rep_header.set(key, header);
        Ok(header)
    }

    /// Expand a representation chain to its fulltext, without digest
    /// verification. Delta windows and combined intermediates are
    /// cached.
    fn expand_rep(&self, id: &ItemId) -> Result<Vec<u8>> {
        // Walk to the nearest fulltext or cached intermediate. The walk
        // is bounded by the chain length recorded in the first header;
        // a chain that runs past it is structurally broken.
        let mut chain = Vec::new();
        let mut chain_limit: Option<u64> = None;
        let mut cur = *id;
        let mut text: Vec<u8>;
        loop {
            let combined_key = WindowKey {
                revision: cur.revision,
                chunk_index: 0,
                item_index: cur.item_index,
            };
            if let Some(hit) = self.caches.combined_window.get(&combined_key) {
                text = hit.to_vec();
                break;
            }

            let raw = self.read_item(cur.revision, cur.item_index)?;
            let (header, payload) = decode_rep_block(&raw)?;
            match header.base {
                Some(base) => {
                    chain.push((cur, payload));
                    let limit = *chain_limit.get_or_insert(header.chain_len);
                    if chain.len() as u64 > limit {
                        return Err(FsError::Corrupt(format!(
                            "delta chain of {id} runs past its recorded length {limit}"
                        )));
                    }
                    cur = base;
                }
                None => {
                    text = payload;
                    break;
                }
            }
        }

        // Apply the deltas youngest-base first.
        while let Some((step, payload)) = chain.pop() {
            let window_key = WindowKey {
                revision: step.revision,
                chunk_index: 0,
                item_index: step.item_index,
            };
            let window = match self.caches.window.get(&window_key) {
                Some(hit) => hit,
                None => {
                    let parsed = Arc::new(delta::Delta::from_bytes(&payload)?);
                    self.caches.window.set(window_key, Arc::clone(&parsed));
                    parsed
                }
            };
            text = delta::apply(&text, window.as_ref())?;
            self.caches.combined_window.set(
                WindowKey {
                    revision: step.revision,
                    chunk_index: 0,
                    item_index: step.item_index,
                },
                Bytes::from(text.clone()),
            );
        }
        Ok(text)
    }

    /// Fulltext of a representation, digest verified, through the
    /// fulltext cache.
    pub fn contents(&self, rep: &Representation) -> Result<Bytes> {
        let key = PairKey {
            revision: rep.id.revision,
            second: rep.id.item_index,
        };
        if let Some(hit) = self.caches.fulltext.get(&key)? {
            return Ok(hit);
        }

        let text = self.expand_rep(&rep.id)?;

        if weak_digest(&text) != rep.weak_digest {
            return Err(FsError::Integrity(format!(
                "weak digest mismatch for representation {}",
                rep.id
            )));
        }
        if !rep.matches_strong(&strong_digest(&text)) {
            return Err(FsError::Integrity(format!(
                "strong digest mismatch for representation {}",
                rep.id
            )));
        }
        if text.len() as u64 != rep.expanded_size {
            return Err(FsError::Integrity(format!(
                "expanded size mismatch for representation {}",
                rep.id
            )));
        }

        let bytes = Bytes::from(text);
        self.caches.fulltext.set(key, bytes.clone())?;
        Ok(bytes)
    }

    /// Directory listing stored in a directory representation.
    pub fn dir_entries(&self, rep: &Representation) -> Result<Arc<Vec<DirEntry>>> {
        if let Some(hit) = self.caches.dir.get(&rep.id) {
            return Ok(hit);
        }
        let raw = self.contents(rep)?;
        let entries: Vec<DirEntry> = bincode::deserialize(&raw)?;
        let entries = Arc::new(entries);
        self.caches.dir.set(rep.id, Arc::clone(&entries));
        Ok(entries)
    }

    /// Tier-1/tier-2 dag-node lookup by (revision, path). Population is
    /// the tree layer's job; a hit on tier 2 back-fills tier 1.
    pub fn cached_dag_node(&self, revision: u64, path: &str) -> Option<Arc<NodeRevision>> {
        self.caches.dag.get(revision, path)
    }

    pub fn cache_dag_node(&self, revision: u64, path: &str, node: Arc<NodeRevision>) {
        self.caches.dag.set(revision, path, node);
    }

    /// Cached mergeinfo by (revision, path). Interpretation of the
    /// mergeinfo property belongs to the layer above; this only
    /// remembers lookups, including negative ones.
    pub fn cached_mergeinfo(&self, revision: u64, path: &str) -> Option<Arc<String>> {
        self.caches.mergeinfo.get(&(revision, path.to_string()))
    }

    pub fn cache_mergeinfo(&self, revision: u64, path: &str, info: Option<Arc<String>>) {
        let key = (revision, path.to_string());
        self.caches.mergeinfo_existence.set(key.clone(), info.is_some());
        if let Some(info) = info {
            self.caches.mergeinfo.set(key, info);
        }
    }

    /// Three-valued presence: `Some(false)` is a remembered "has none".
    pub fn mergeinfo_presence(&self, revision: u64, path: &str) -> Option<bool> {
        self.caches
            .mergeinfo_existence
            .get(&(revision, path.to_string()))
    }

    /// Lazy node-origin map: first (revision, item) a conceptual node
    /// appeared at, keyed by its origin item index.
    pub fn node_origin(&self, item_index: u64) -> Result<Option<ItemId>> {
        let path = self.layout.node_origin_file(item_index);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(bincode::deserialize(&fs::read(path)?)?))
    }

    pub(crate) fn record_node_origin(&self, item_index: u64, id: ItemId) -> Result<()> {
        let path = self.layout.node_origin_file(item_index);
        if path.exists() {
            return Ok(());
        }
        atomic_write(&path, &bincode::serialize(&id)?)?;
        Ok(())
    }

    /// Verify a range of revisions: every p2l entry must agree with the
    /// l2p index, every record must parse, every representation
    /// reachable from a node revision must reproduce its digests.
    pub fn verify(&self, start: u64, end: u64) -> Result<u64> {
        let youngest = self.youngest()?;
        let end = end.min(youngest);
        let mut checked = 0;

        for rev in start..=end {
            for entry in self.p2l_entries_of(rev)? {
                let offset = self.item_offset(entry.item.revision, entry.item.item_index)?;
                if offset != entry.offset {
                    return Err(FsError::Integrity(format!(
                        "l2p/p2l disagree for {}: {} vs {}",
                        entry.item, offset, entry.offset
                    )));
                }
                self.read_item(entry.item.revision, entry.item.item_index)?;
            }

            let root = self.node_revision(&self.rev_root_id(rev)?)?;
            if let Some(rep) = &root.data_rep {
                self.contents(rep)?;
            }
            for change in &self.changes(rev)?.changes {
                let node = self.node_revision(&change.info.node_id)?;
                if let Some(rep) = &node.data_rep {
                    self.contents(rep)?;
                }
                if let Some(rep) = &node.prop_rep {
                    self.contents(rep)?;
                }
            }
            checked += 1;
            debug!(revision = rev, "revision verified");
        }
        Ok(checked)
    }
}
