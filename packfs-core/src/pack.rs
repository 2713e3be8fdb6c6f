//! Shard packing
//!
//! Revisions start loose, one file per revision. Once a shard is
//! complete and no longer being written, packing concatenates its
//! member revision files into a single pack file with a manifest
//! (revision -> byte offset) and rebuilt l2p/p2l indices. Everything is
//! staged under a temporary directory and renamed into place, then
//! `min-unpacked-rev` is advanced atomically; readers never observe a
//! revision in neither location or a half-written pack as current.

use crate::error::{FsError, Result};
use crate::index::{read_l2p_header, read_l2p_page, read_p2l_header, read_p2l_page};
use crate::index::{L2pBuilder, P2lBuilder};
use crate::layout::atomic_write;
use crate::fs::Filesystem;
use crate::lock::lock_file_exclusive;
use std::fs;
use std::io::Write;
use tracing::{debug, info};

/// Read the manifest of a packed shard: byte offset of each member
/// revision inside the pack file, in revision order.
pub fn read_manifest(fs: &Filesystem, shard: u64) -> Result<std::sync::Arc<Vec<u64>>> {
    use crate::cache::Cache;
    if let Some(hit) = fs.caches().packed_offsets.get(&shard) {
        return Ok(hit);
    }
    let data = fs::read(fs.layout().manifest_file(shard))?;
    let offsets: Vec<u64> = bincode::deserialize(&data)?;
    let offsets = std::sync::Arc::new(offsets);
    fs.caches()
        .packed_offsets
        .set(shard, std::sync::Arc::clone(&offsets));
    Ok(offsets)
}

/// Pack the lowest unpacked shard if it is complete. Returns true when a
/// shard was packed, false when there was nothing to do (idempotent).
pub fn pack_shard(fs: &Filesystem) -> Result<bool> {
    let shared = fs.shared();
    let _intra = shared.pack_lock.lock();
    let _cross = lock_file_exclusive(&fs.layout().pack_lock_file())?;

    // Re-read the boundary under the lock; another process may have
    // packed in the meantime.
    let min_unpacked = fs.read_min_unpacked_rev()?;
    let shard = fs.layout().shard_of(min_unpacked);
    let shard_end = fs.layout().shard_end(shard);
    let youngest = fs.youngest()?;

    // Only shards no longer being written to may be packed.
    if youngest + 1 < shard_end {
        debug!(shard, youngest, "shard incomplete, nothing to pack");
        return Ok(false);
    }

    let layout = fs.layout();
    let first_rev = min_unpacked;
    let tmp_dir = layout
        .revs_dir()
        .join(format!("{shard}.pack.tmp"));
    if tmp_dir.exists() {
        // Leftover of an interrupted pack; it was never current.
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;

    let mut pack = fs::File::create(tmp_dir.join("pack"))?;
    let mut offsets = Vec::new();
    let mut l2p = L2pBuilder::new(first_rev, fs.config().l2p_page_size);
    let mut p2l = P2lBuilder::new(first_rev, fs.config().p2l_page_size);
    let mut pack_offset = 0u64;

    for rev in first_rev..shard_end {
        offsets.push(pack_offset);
        let data = fs::read(layout.rev_file(rev))?;

        // Shift the loose indices by the revision's position in the pack.
        let l2p_path = layout.rev_l2p_file(rev);
        let header = read_l2p_header(&l2p_path)?;
        let mut item = 0u64;
        for page in 0..header.rev_page_counts[0] {
            let offsets_page = read_l2p_page(&l2p_path, &header, page)?;
            for off in offsets_page.offsets {
                if off != u64::MAX {
                    l2p.add(rev, item, pack_offset + off);
                }
                item += 1;
            }
        }

        let p2l_path = layout.rev_p2l_file(rev);
        let p2l_header = read_p2l_header(&p2l_path)?;
        for page in 0..p2l_header.page_count() {
            for mut entry in read_p2l_page(&p2l_path, &p2l_header, page)?.entries {
                entry.offset += pack_offset;
                p2l.add(entry);
            }
        }

        pack.write_all(&data)?;
        pack_offset += data.len() as u64;
    }
    pack.sync_all()?;

    let manifest = bincode::serialize(&offsets)?;
    atomic_write(&tmp_dir.join("manifest"), &manifest)?;
    l2p.write(&tmp_dir.join("pack.l2p"))?;
    p2l.write(&tmp_dir.join("pack.p2l"), pack_offset)?;

    // Manifest and indices are durable; make the pack current.
    let final_dir = layout.packed_shard_dir(shard);
    fs::rename(&tmp_dir, &final_dir)?;

    // Advance the packing boundary; below it, readers use the pack.
    fs.write_min_unpacked_rev(shard_end)?;

    crate::revprop::pack_revprop_shard(fs, shard)?;

    // Loose files are now shadowed by the pack and can go away.
    let loose_dir = layout.shard_dir(shard);
    if loose_dir.exists() {
        fs::remove_dir_all(&loose_dir)?;
    }

    info!(shard, first_rev, end = shard_end - 1, "shard packed");
    Ok(true)
}

/// Pack every complete shard above the current boundary.
pub fn pack_all(fs: &Filesystem) -> Result<u64> {
    let mut packed = 0;
    loop {
        match pack_shard(fs) {
            Ok(true) => packed += 1,
            Ok(false) => return Ok(packed),
            Err(e @ FsError::Busy(_)) => return if packed > 0 { Ok(packed) } else { Err(e) },
            Err(e) => return Err(e),
        }
    }
}
