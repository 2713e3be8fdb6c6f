//! Multi-layer object cache
//!
//! Every cache is an independent key-value store behind the same small
//! contract: `get` returns a clone of the cached value or nothing, `set`
//! inserts unconditionally. Eviction is the backend's concern; callers
//! never evict. Strict caches hold immutable data keyed by revision and
//! so are valid forever. Remote-capable caches may be backed by a shared
//! best-effort service and are wrapped in the `fail_stop` policy.

use crate::delta::Delta;
use crate::index::{L2pHeader, L2pPage, P2lHeader, P2lPage};
use crate::node::{ChangeList, DirEntry, NodeRevision};
use crate::rep::RepHeader;
use crate::error::{FsError, Result};
use crate::id::ItemId;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

/// Key for caches addressed by revision plus one secondary coordinate
/// (item index, shard number, revprop generation). Fixed width, exact
/// field equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PairKey {
    pub revision: u64,
    pub second: u64,
}

/// Key identifying a representation or rep header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RepCacheKey {
    pub revision: u64,
    pub is_packed: bool,
    pub item_index: u64,
}

/// Key identifying one delta window of a representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowKey {
    pub revision: u64,
    pub chunk_index: u64,
    pub item_index: u64,
}

/// Key for paged index lookups: one page of one (possibly packed) file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PageKey {
    pub revision: u64,
    pub is_packed: bool,
    pub page: u64,
}

/// Uniform cache contract. No eviction API; policy belongs to the
/// implementation.
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn set(&self, key: K, value: V);
}

/// In-process LRU-bounded cache
pub struct LruObjectCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> LruObjectCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl<K, V> Cache<K, V> for LruObjectCache<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn set(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }
}

/// Backend capability for a shared, best-effort remote cache. Keys and
/// values cross the wire as opaque bytes.
pub trait RemoteCacheBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// In-memory stand-in backend, used in tests and single-process setups.
pub struct MemoryCacheBackend {
    map: Mutex<std::collections::HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteCacheBackend for MemoryCacheBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// Remote cache with the `fail_stop` policy applied to every call.
///
/// With `fail_stop` set, a backend error propagates: the deployment has
/// declared the cache load-bearing. Otherwise errors degrade to a miss
/// and the caller falls through to authoritative storage.
pub struct RemoteCache {
    backend: Arc<dyn RemoteCacheBackend>,
    fail_stop: bool,
    namespace: &'static str,
}

impl RemoteCache {
    pub fn new(backend: Arc<dyn RemoteCacheBackend>, fail_stop: bool, namespace: &'static str) -> Self {
        Self {
            backend,
            fail_stop,
            namespace,
        }
    }

    fn key_bytes<K: Serialize>(&self, key: &K) -> Result<Vec<u8>> {
        let mut bytes = self.namespace.as_bytes().to_vec();
        bytes.push(b':');
        bytes.extend(bincode::serialize(key)?);
        Ok(bytes)
    }

    pub fn get<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        let key = self.key_bytes(key)?;
        match self.backend.get(&key) {
            Ok(Some(raw)) => Ok(Some(bincode::deserialize(&raw)?)),
            Ok(None) => Ok(None),
            Err(e) if self.fail_stop => Err(FsError::CacheBackend(e.to_string())),
            Err(e) => {
                warn!(cache = self.namespace, error = %e, "remote cache get failed, treating as miss");
                Ok(None)
            }
        }
    }

    pub fn set<K: Serialize, V: Serialize>(&self, key: &K, value: &V) -> Result<()> {
        let key = self.key_bytes(key)?;
        let raw = bincode::serialize(value)?;
        match self.backend.put(&key, &raw) {
            Ok(()) => Ok(()),
            Err(e) if self.fail_stop => Err(FsError::CacheBackend(e.to_string())),
            Err(e) => {
                warn!(cache = self.namespace, error = %e, "remote cache put failed, ignoring");
                Ok(())
            }
        }
    }
}

/// Fulltext cache: local LRU with an optional remote layer behind it.
pub struct FulltextCache {
    local: LruObjectCache<PairKey, Bytes>,
    remote: Option<RemoteCache>,
}

impl FulltextCache {
    pub fn new(capacity: usize, remote: Option<RemoteCache>) -> Self {
        Self {
            local: LruObjectCache::new(capacity),
            remote,
        }
    }

    pub fn get(&self, key: &PairKey) -> Result<Option<Bytes>> {
        if let Some(hit) = self.local.get(key) {
            return Ok(Some(hit));
        }
        if let Some(remote) = &self.remote {
            if let Some(raw) = remote.get::<_, Vec<u8>>(key)? {
                let bytes = Bytes::from(raw);
                self.local.set(*key, bytes.clone());
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    pub fn set(&self, key: PairKey, value: Bytes) -> Result<()> {
        self.local.set(key, value.clone());
        if let Some(remote) = &self.remote {
            remote.set(&key, &value.to_vec())?;
        }
        Ok(())
    }
}

/// Tier-1 dag-node cache: fixed-capacity, hash-slotted, simple
/// replacement. Collisions overwrite; correctness comes from the tiers
/// below, this tier only has to be fast.
struct DagSlots {
    slots: Vec<Option<((u64, String), Arc<NodeRevision>)>>,
}

/// Two-tier dag-node cache addressed by (revision, path).
///
/// Tier 2 is the general-purpose rev-node cache; a tier-2 hit back-fills
/// tier 1.
pub struct TwoTierDagCache {
    tier1: Mutex<DagSlots>,
    tier2: LruObjectCache<(u64, String), Arc<NodeRevision>>,
}

impl TwoTierDagCache {
    pub fn new(tier1_slots: usize, tier2_capacity: usize) -> Self {
        Self {
            tier1: Mutex::new(DagSlots {
                slots: (0..tier1_slots.max(1)).map(|_| None).collect(),
            }),
            tier2: LruObjectCache::new(tier2_capacity),
        }
    }

    fn slot_of(&self, revision: u64, path: &str, len: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        revision.hash(&mut hasher);
        path.hash(&mut hasher);
        (hasher.finish() as usize) % len
    }

    pub fn get(&self, revision: u64, path: &str) -> Option<Arc<NodeRevision>> {
        {
            let tier1 = self.tier1.lock();
            let idx = self.slot_of(revision, path, tier1.slots.len());
            if let Some(((rev, p), node)) = &tier1.slots[idx] {
                if *rev == revision && p == path {
                    return Some(Arc::clone(node));
                }
            }
        }
        let key = (revision, path.to_string());
        if let Some(node) = self.tier2.get(&key) {
            self.fill_tier1(revision, path, Arc::clone(&node));
            return Some(node);
        }
        None
    }

    pub fn set(&self, revision: u64, path: &str, node: Arc<NodeRevision>) {
        self.tier2
            .set((revision, path.to_string()), Arc::clone(&node));
        self.fill_tier1(revision, path, node);
    }

    fn fill_tier1(&self, revision: u64, path: &str, node: Arc<NodeRevision>) {
        let mut tier1 = self.tier1.lock();
        let len = tier1.slots.len();
        let idx = self.slot_of(revision, path, len);
        tier1.slots[idx] = Some(((revision, path.to_string()), node));
    }
}

/// A revprop set tagged with the generation observed at fetch time.
#[derive(Clone)]
pub struct TaggedRevProps {
    pub generation: u64,
    pub props: Arc<std::collections::HashMap<String, String>>,
}

/// The full cache set owned by one filesystem instance.
///
/// Paged-index caches are `None` on formats that predate paged indices;
/// cache-aware code treats that as "feature unavailable", not an error.
pub struct CacheSet {
    /// Revision number -> root node id
    pub rev_root_id: LruObjectCache<u64, ItemId>,
    /// Two-tier dag node cache, (revision, path) addressed
    pub dag: TwoTierDagCache,
    /// Immutable directory listings by directory rep location
    pub dir: LruObjectCache<ItemId, Arc<Vec<DirEntry>>>,
    /// Node revision records by (revision, item)
    pub node_rev: LruObjectCache<PairKey, Arc<NodeRevision>>,
    /// Representation headers
    pub rep_header: LruObjectCache<RepCacheKey, RepHeader>,
    /// Reconstructed fulltexts; remote-capable
    pub fulltext: FulltextCache,
    /// Decoded delta windows
    pub window: LruObjectCache<WindowKey, Arc<Delta>>,
    /// Combined (already applied) windows
    pub combined_window: LruObjectCache<WindowKey, Bytes>,
    /// Ordered change lists by revision
    pub changes: LruObjectCache<u64, Arc<ChangeList>>,
    /// Container bundles: `block_size`-aligned regions of pack files,
    /// keyed by (shard first revision, block offset). Records grouped
    /// in one region are served from a single bundle. Remote-capable.
    pub containers: FulltextCache,
    /// Mergeinfo by (revision, path)
    pub mergeinfo: LruObjectCache<(u64, String), Arc<String>>,
    /// Mergeinfo presence by (revision, path)
    pub mergeinfo_existence: LruObjectCache<(u64, String), bool>,
    /// Shard number -> packed manifest offsets
    pub packed_offsets: LruObjectCache<u64, Arc<Vec<u64>>>,
    /// Generation-tagged revision property sets
    pub revprops: LruObjectCache<u64, TaggedRevProps>,
    /// Paged index caches; None when the format has no paged indices
    pub l2p_header: Option<LruObjectCache<PairKey, Arc<L2pHeader>>>,
    pub l2p_page: Option<LruObjectCache<PageKey, Arc<L2pPage>>>,
    pub p2l_header: Option<LruObjectCache<PairKey, Arc<P2lHeader>>>,
    pub p2l_page: Option<LruObjectCache<PageKey, Arc<P2lPage>>>,
}

impl CacheSet {
    /// Build the cache set for one instance. `paged_indices` reflects the
    /// format gate; `remote` is the optional shared backend, wrapped in
    /// the `fail_stop` policy for the remote-capable caches only.
    pub fn new(
        paged_indices: bool,
        remote: Option<Arc<dyn RemoteCacheBackend>>,
        fail_stop: bool,
    ) -> Self {
        let fulltext_remote = remote
            .as_ref()
            .map(|b| RemoteCache::new(Arc::clone(b), fail_stop, "fulltext"));
        let container_remote = remote
            .as_ref()
            .map(|b| RemoteCache::new(Arc::clone(b), fail_stop, "containers"));

        fn paged_cache<K: std::hash::Hash + Eq, V: Clone>(
            paged_indices: bool,
            cap: usize,
        ) -> Option<LruObjectCache<K, V>> {
            paged_indices.then(|| LruObjectCache::new(cap))
        }

        Self {
            rev_root_id: LruObjectCache::new(1024),
            dag: TwoTierDagCache::new(256, 1024),
            dir: LruObjectCache::new(512),
            node_rev: LruObjectCache::new(2048),
            rep_header: LruObjectCache::new(2048),
            fulltext: FulltextCache::new(64, fulltext_remote),
            window: LruObjectCache::new(1024),
            combined_window: LruObjectCache::new(256),
            changes: LruObjectCache::new(256),
            containers: FulltextCache::new(64, container_remote),
            mergeinfo: LruObjectCache::new(512),
            mergeinfo_existence: LruObjectCache::new(2048),
            packed_offsets: LruObjectCache::new(64),
            revprops: LruObjectCache::new(256),
            l2p_header: paged_cache(paged_indices, 64),
            l2p_page: paged_cache(paged_indices, 1024),
            p2l_header: paged_cache(paged_indices, 64),
            p2l_page: paged_cache(paged_indices, 1024),
        }
    }
}
