//! Representations and rep-sharing
//!
//! A representation is the stored form of one node's data or property
//! content: fulltext or a delta against an ancestor representation,
//! optionally zstd-compressed. Content is immutable once committed.
//!
//! Rep-sharing deduplicates by strong content digest through an external
//! digest index (SQLite): before new bytes are written, the index is
//! consulted and a hit returns the existing representation's location
//! instead of storing anything.

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::id::ItemId;
use crate::node::NodeRevision;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Location and digests of stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    /// Strong content digest, computed on write for rep-sharing. Absent
    /// on records produced by older stores; absence means "assume it
    /// matches whatever is expected".
    pub strong_digest: Option<[u8; 32]>,

    /// Weak digest, always present, verified on every fulltext fetch
    pub weak_digest: [u8; 20],

    /// Change set and item number where the representation lives
    pub id: ItemId,

    /// Size of the representation as stored in the revision file
    pub stored_size: u64,

    /// Size of the fulltext this representation expands to
    pub expanded_size: u64,
}

impl Representation {
    /// Digest equality under the trust policy: a missing strong digest
    /// matches anything (backward compatibility with older stores).
    pub fn matches_strong(&self, digest: &[u8; 32]) -> bool {
        match &self.strong_digest {
            Some(d) => d == digest,
            None => true,
        }
    }
}

/// Per-representation header stored in front of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepHeader {
    /// Delta base, or None for a fulltext
    pub base: Option<ItemId>,

    /// Reconstruction steps back to the nearest fulltext
    pub chain_len: u64,

    /// Length of the linear (immediate-predecessor) run ending here
    pub linear_len: u64,

    /// zstd level the payload was written with; 0 means raw
    pub compression_level: i32,

    /// Fulltext size this representation expands to
    pub expanded_size: u64,
}

impl RepHeader {
    pub fn is_fulltext(&self) -> bool {
        self.base.is_none()
    }
}

/// On-disk block: header plus (possibly compressed) payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepBlock {
    header: RepHeader,
    payload: Vec<u8>,
}

/// Strong content digest (sha256)
pub fn strong_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Weak content digest (sha1)
pub fn weak_digest(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Serialize a representation block, compressing the payload at the
/// given level (0 stores raw bytes).
pub fn encode_rep_block(mut header: RepHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let payload = if header.compression_level > 0 {
        zstd::encode_all(payload, header.compression_level)
            .map_err(|e| FsError::Io(e))?
    } else {
        payload.to_vec()
    };
    header.compression_level = header.compression_level.max(0);
    Ok(bincode::serialize(&RepBlock { header, payload })?)
}

/// Parse a representation block and decompress its payload.
pub fn decode_rep_block(data: &[u8]) -> Result<(RepHeader, Vec<u8>)> {
    let block: RepBlock = bincode::deserialize(data)?;
    let payload = if block.header.compression_level > 0 {
        zstd::decode_all(&block.payload[..]).map_err(FsError::Io)?
    } else {
        block.payload
    };
    Ok((block.header, payload))
}

/// External digest index used for rep-sharing: a lookup/insert service
/// mapping strong digest to an existing representation.
pub trait RepIndex: Send + Sync {
    fn lookup(&self, digest: &[u8; 32]) -> Result<Option<Representation>>;
    fn insert(&self, rep: &Representation) -> Result<()>;
}

/// SQLite-backed digest index (`rep-cache.db` in the repository root)
pub struct SqliteRepIndex {
    conn: Mutex<Connection>,
}

impl SqliteRepIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rep_cache (
                hash TEXT PRIMARY KEY,
                weak_hash TEXT NOT NULL,
                revision INTEGER NOT NULL,
                item_index INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                expanded_size INTEGER NOT NULL
            ) WITHOUT ROWID;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RepIndex for SqliteRepIndex {
    fn lookup(&self, digest: &[u8; 32]) -> Result<Option<Representation>> {
        let conn = self.conn.lock().expect("rep index mutex poisoned");
        let row = conn
            .query_row(
                "SELECT weak_hash, revision, item_index, stored_size, expanded_size
                 FROM rep_cache WHERE hash = ?1",
                params![hex::encode(digest)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((weak_hex, revision, item_index, stored_size, expanded_size)) => {
                let weak = hex::decode(&weak_hex)
                    .map_err(|e| FsError::Corrupt(format!("bad weak digest in rep index: {e}")))?;
                let weak: [u8; 20] = weak
                    .try_into()
                    .map_err(|_| FsError::Corrupt("weak digest length in rep index".into()))?;
                Ok(Some(Representation {
                    strong_digest: Some(*digest),
                    weak_digest: weak,
                    id: ItemId::new(revision as u64, item_index as u64),
                    stored_size: stored_size as u64,
                    expanded_size: expanded_size as u64,
                }))
            }
        }
    }

    fn insert(&self, rep: &Representation) -> Result<()> {
        let digest = rep.strong_digest.ok_or_else(|| {
            FsError::Corrupt("cannot index a representation without a strong digest".into())
        })?;
        let conn = self.conn.lock().expect("rep index mutex poisoned");
        // First writer wins; a concurrent duplicate insert is not an error.
        conn.execute(
            "INSERT OR IGNORE INTO rep_cache
             (hash, weak_hash, revision, item_index, stored_size, expanded_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                hex::encode(digest),
                hex::encode(rep.weak_digest),
                rep.id.revision as i64,
                rep.id.item_index as i64,
                rep.stored_size as i64,
                rep.expanded_size as i64,
            ],
        )?;
        Ok(())
    }
}

/// Pick the delta base for a new representation of a node whose
/// immediate predecessor is `predecessor`.
///
/// Returns `None` for a fulltext. The policy bounds reconstruction cost:
/// every `max_deltification_walk` steps the chain restarts with a
/// fulltext, and once the history is longer than
/// `max_linear_deltification` the base recedes exponentially (skip
/// delta) instead of being the immediate predecessor.
pub fn choose_delta_base(
    predecessor: Option<&NodeRevision>,
    is_property: bool,
    config: &FsConfig,
    mut noderev_of: impl FnMut(&ItemId) -> Result<NodeRevision>,
) -> Result<Option<Representation>> {
    let pred = match predecessor {
        Some(p) => p,
        None => return Ok(None),
    };

    let count = pred.predecessor_count + 1;
    if config.max_deltification_walk == 0 || count % config.max_deltification_walk == 0 {
        debug!(count, "forcing fulltext, deltification walk restart");
        return Ok(None);
    }

    let rep_of = |n: &NodeRevision| {
        if is_property {
            n.prop_rep.clone()
        } else {
            n.data_rep.clone()
        }
    };

    if count <= config.max_linear_deltification {
        return Ok(rep_of(pred));
    }

    // Skip delta: walk back to the ancestor whose predecessor count has
    // the lowest set bit of ours cleared.
    let target = (count - 1) & (count - 2);
    let mut base = pred.clone();
    while base.predecessor_count > target {
        match &base.predecessor_id {
            Some(id) => base = noderev_of(id)?,
            None => break,
        }
    }
    debug!(
        count,
        base_count = base.predecessor_count,
        "skip delta base selected"
    );
    Ok(rep_of(&base))
}
