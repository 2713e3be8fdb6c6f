//! Revision properties
//!
//! Revprops are the only mutable per-revision state, so their cache
//! entries cannot be trusted forever. Every write bumps a file-backed
//! monotonic generation counter; cached sets are tagged with the
//! generation observed at fetch time and a mismatch on read forces a
//! refetch. That counter is the cross-process invalidation mechanism
//! and must not be weakened.

use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::layout::atomic_write;
use crate::lock::lock_file_exclusive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Property set of one revision
pub type RevProps = HashMap<String, String>;

/// Entry of a packed revprop shard manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevpropPackEntry {
    revision: u64,
    file_index: u32,
    offset: u64,
    len: u64,
}

/// Manifest of a packed revprop shard
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevpropManifest {
    compressed: bool,
    entries: Vec<RevpropPackEntry>,
}

fn packed_revprop_dir(fs: &Filesystem, shard: u64) -> std::path::PathBuf {
    fs.layout().revprops_dir().join(format!("{shard}.pack"))
}

/// Read the current revprop generation. Zero when the counter file has
/// not been created yet.
pub fn read_generation(path: &Path) -> Result<u64> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| FsError::Corrupt("unparsable revprop-generation".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn bump_generation(fs: &Filesystem) -> Result<u64> {
    let path = fs.layout().revprop_generation_file();
    let next = read_generation(&path)? + 1;
    atomic_write(&path, next.to_string().as_bytes())?;
    Ok(next)
}

fn read_props_from_disk(fs: &Filesystem, revision: u64) -> Result<RevProps> {
    let loose = fs.layout().revprop_file(revision);
    if loose.exists() {
        let data = fs::read(loose)?;
        return Ok(serde_json::from_slice(&data)?);
    }

    // Packed location.
    let shard = fs.layout().shard_of(revision);
    let dir = packed_revprop_dir(fs, shard);
    let manifest_path = dir.join("manifest");
    if !manifest_path.exists() {
        return Err(FsError::RevisionNotFound(revision));
    }
    let manifest: RevpropManifest = serde_json::from_slice(&fs::read(manifest_path)?)?;
    let entry = manifest
        .entries
        .iter()
        .find(|e| e.revision == revision)
        .ok_or(FsError::RevisionNotFound(revision))?;

    let blob = fs::read(dir.join(entry.file_index.to_string()))?;
    let blob = if manifest.compressed {
        zstd::decode_all(&blob[..]).map_err(FsError::Io)?
    } else {
        blob
    };
    let start = entry.offset as usize;
    let end = start + entry.len as usize;
    if end > blob.len() {
        return Err(FsError::Corrupt(format!(
            "revprop pack entry for r{revision} exceeds blob"
        )));
    }
    Ok(serde_json::from_slice(&blob[start..end])?)
}

/// Fetch the property set of a revision through the generation-tagged
/// cache.
pub fn get_revprops(fs: &Filesystem, revision: u64) -> Result<Arc<RevProps>> {
    use crate::cache::Cache;

    let generation = read_generation(&fs.layout().revprop_generation_file())?;
    if let Some(tagged) = fs.caches().revprops.get(&revision) {
        if tagged.generation == generation {
            return Ok(tagged.props);
        }
        debug!(
            revision,
            cached = tagged.generation,
            current = generation,
            "revprop cache entry outdated, forcing miss"
        );
    }

    let props = Arc::new(read_props_from_disk(fs, revision)?);
    fs.caches().revprops.set(
        revision,
        crate::cache::TaggedRevProps {
            generation,
            props: Arc::clone(&props),
        },
    );
    Ok(props)
}

/// Write the full property set of a revision. Internal: callers hold
/// the write lock.
pub(crate) fn write_revprops(fs: &Filesystem, revision: u64, props: &RevProps) -> Result<()> {
    let path = fs.layout().revprop_file(revision);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(&path, &serde_json::to_vec_pretty(props)?)?;
    Ok(())
}

/// Change one revision property. Takes the write lock, rewrites the
/// stored set and bumps the generation so every cache (in this process
/// and others) observes the change.
pub fn set_revprop(
    fs: &Filesystem,
    revision: u64,
    name: &str,
    value: Option<String>,
) -> Result<()> {
    let shared = fs.shared();
    let _intra = shared.write_lock.lock();
    let _cross = lock_file_exclusive(&fs.layout().write_lock_file())?;

    if revision > fs.youngest()? {
        return Err(FsError::RevisionNotFound(revision));
    }

    let mut props = read_props_from_disk(fs, revision)?;
    match value {
        Some(v) => {
            props.insert(name.to_string(), v);
        }
        None => {
            props.remove(name);
        }
    }

    let loose = fs.layout().revprop_file(revision);
    if loose.exists() || !packed_revprop_dir(fs, fs.layout().shard_of(revision)).exists() {
        write_revprops(fs, revision, &props)?;
    } else {
        // Packed revision: rewrite the shard pack with the new value.
        rewrite_packed_revprop(fs, revision, &props)?;
    }

    bump_generation(fs)?;
    Ok(())
}

fn rewrite_packed_revprop(fs: &Filesystem, revision: u64, props: &RevProps) -> Result<()> {
    let shard = fs.layout().shard_of(revision);
    let shard_start = fs.layout().shard_end(shard) - fs.config().shard_size;
    let shard_end = fs.layout().shard_end(shard);

    let mut sets = Vec::new();
    for rev in shard_start..shard_end {
        if rev == revision {
            sets.push(serde_json::to_vec(props)?);
        } else {
            sets.push(serde_json::to_vec(&read_props_from_disk(fs, rev)?)?);
        }
    }
    write_packed_shard(fs, shard, shard_start, &sets)
}

fn write_packed_shard(
    fs: &Filesystem,
    shard: u64,
    shard_start: u64,
    sets: &[Vec<u8>],
) -> Result<()> {
    let config = fs.config();
    let dir = packed_revprop_dir(fs, shard);
    let tmp = fs
        .layout()
        .revprops_dir()
        .join(format!("{shard}.pack.tmp"));
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    let mut entries = Vec::new();
    let mut file_index = 0u32;
    let mut blob: Vec<u8> = Vec::new();

    let flush = |idx: u32, blob: &[u8], tmp: &Path| -> Result<()> {
        let data = if config.compress_packed_revprops {
            zstd::encode_all(blob, config.compression_level.max(1)).map_err(FsError::Io)?
        } else {
            blob.to_vec()
        };
        fs::write(tmp.join(idx.to_string()), data)?;
        Ok(())
    };

    for (i, set) in sets.iter().enumerate() {
        if !blob.is_empty() && blob.len() + set.len() > config.revprop_pack_size as usize {
            flush(file_index, &blob, &tmp)?;
            blob.clear();
            file_index += 1;
        }
        entries.push(RevpropPackEntry {
            revision: shard_start + i as u64,
            file_index,
            offset: blob.len() as u64,
            len: set.len() as u64,
        });
        blob.extend_from_slice(set);
    }
    if !blob.is_empty() {
        flush(file_index, &blob, &tmp)?;
    }

    let manifest = RevpropManifest {
        compressed: config.compress_packed_revprops,
        entries,
    };
    atomic_write(&tmp.join("manifest"), &serde_json::to_vec_pretty(&manifest)?)?;

    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::rename(&tmp, &dir)?;
    Ok(())
}

/// Pack the revprops of a shard, mirroring revision packing. Loose
/// files are read in order, grouped into blobs bounded by
/// `revprop_pack_size` and replaced by the packed form.
pub(crate) fn pack_revprop_shard(fs: &Filesystem, shard: u64) -> Result<()> {
    let shard_start = fs.layout().shard_end(shard) - fs.config().shard_size;
    let shard_end = fs.layout().shard_end(shard);

    let mut sets = Vec::new();
    for rev in shard_start..shard_end {
        sets.push(serde_json::to_vec(&read_props_from_disk(fs, rev)?)?);
    }
    write_packed_shard(fs, shard, shard_start, &sets)?;

    let loose_dir = fs.layout().revprop_shard_dir(shard);
    if loose_dir.exists() {
        fs::remove_dir_all(&loose_dir)?;
    }
    Ok(())
}
