//! Paged log-to-phys and phys-to-log indices
//!
//! l2p maps (revision, item_index) to a physical byte offset inside a
//! revision or pack file; p2l is the inverse, mapping a byte range back
//! to its logical item. Both are written once and read often, so the
//! on-disk form is a small header (page table) followed by individually
//! serialized pages: a lookup deserializes one page, not the whole
//! index. Header and page caches sit in front of this module.
//!
//! File format: magic, u32 header length, bincode header, concatenated
//! bincode page blobs.

use crate::error::{FsError, Result};
use crate::id::ItemId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const L2P_MAGIC: &[u8; 4] = b"L2P1";
const P2L_MAGIC: &[u8; 4] = b"P2L1";

/// Logical kind of an item inside a revision file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    FileRep,
    PropRep,
    DirRep,
    NodeRev,
    Changes,
}

/// Page table of a log-to-phys index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2pHeader {
    /// First revision covered by this file
    pub first_revision: u64,
    /// Entries per page
    pub page_size: u64,
    /// Number of pages for each covered revision, in order
    pub rev_page_counts: Vec<u64>,
    /// Serialized byte size of each page, in global page order
    pub page_byte_sizes: Vec<u64>,
}

impl L2pHeader {
    /// Translate (revision, item) to (global page number, index in page).
    /// Returns None when the revision is not covered.
    pub fn page_of(&self, revision: u64, item_index: u64) -> Option<(u64, usize)> {
        let rev_offset = revision.checked_sub(self.first_revision)? as usize;
        if rev_offset >= self.rev_page_counts.len() {
            return None;
        }
        let page_in_rev = item_index / self.page_size;
        if page_in_rev >= self.rev_page_counts[rev_offset] {
            return None;
        }
        let base: u64 = self.rev_page_counts[..rev_offset].iter().sum();
        Some((
            base + page_in_rev,
            (item_index % self.page_size) as usize,
        ))
    }
}

/// One l2p page: byte offsets for a run of consecutive item indices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2pPage {
    pub offsets: Vec<u64>,
}

/// One phys-to-log entry: a byte range and the item occupying it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2lEntry {
    pub offset: u64,
    pub size: u64,
    pub item: ItemId,
    pub kind: ItemKind,
}

/// Page table of a phys-to-log index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2lHeader {
    pub first_revision: u64,
    /// Byte range covered by one page
    pub page_size: u64,
    /// Total data file size covered by this index
    pub file_size: u64,
    pub page_byte_sizes: Vec<u64>,
}

impl P2lHeader {
    pub fn page_count(&self) -> u64 {
        self.page_byte_sizes.len() as u64
    }

    pub fn page_of_offset(&self, offset: u64) -> u64 {
        offset / self.page_size
    }
}

/// One p2l page: entries whose start offset falls into the page's byte
/// range, sorted by offset. An entry may extend past the page boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2lPage {
    pub entries: Vec<P2lEntry>,
}

impl P2lPage {
    /// Entry whose byte range contains `offset`, if present in this page
    pub fn find(&self, offset: u64) -> Option<&P2lEntry> {
        self.entries
            .iter()
            .find(|e| e.offset <= offset && offset < e.offset + e.size)
    }
}

fn write_index_file(path: &Path, magic: &[u8; 4], header: &[u8], pages: &[Vec<u8>]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(magic)?;
    file.write_all(&(header.len() as u32).to_le_bytes())?;
    file.write_all(header)?;
    for page in pages {
        file.write_all(page)?;
    }
    file.sync_all()?;
    Ok(())
}

fn read_index_header(path: &Path, magic: &[u8; 4]) -> Result<(File, Vec<u8>)> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 8];
    file.read_exact(&mut head)?;
    if &head[0..4] != magic {
        return Err(FsError::Corrupt(format!(
            "bad index magic in {}",
            path.display()
        )));
    }
    let header_len = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    Ok((file, header))
}

fn read_index_page(
    path: &Path,
    magic: &[u8; 4],
    header_len: usize,
    page_byte_sizes: &[u64],
    page: u64,
) -> Result<Vec<u8>> {
    let idx = page as usize;
    if idx >= page_byte_sizes.len() {
        return Err(FsError::Corrupt(format!(
            "index page {page} out of range in {}",
            path.display()
        )));
    }
    let mut file = File::open(path)?;
    let mut head = [0u8; 8];
    file.read_exact(&mut head)?;
    if &head[0..4] != magic {
        return Err(FsError::Corrupt(format!(
            "bad index magic in {}",
            path.display()
        )));
    }
    let offset = 8 + header_len as u64 + page_byte_sizes[..idx].iter().sum::<u64>();
    file.seek(SeekFrom::Start(offset))?;
    let mut blob = vec![0u8; page_byte_sizes[idx] as usize];
    file.read_exact(&mut blob)?;
    Ok(blob)
}

/// Builder collecting l2p entries for one revision or pack file
pub struct L2pBuilder {
    first_revision: u64,
    page_size: u64,
    /// Offsets per revision, indexed by item_index
    revisions: Vec<Vec<u64>>,
}

impl L2pBuilder {
    pub fn new(first_revision: u64, page_size: u64) -> Self {
        Self {
            first_revision,
            page_size: page_size.max(1),
            revisions: Vec::new(),
        }
    }

    pub fn add(&mut self, revision: u64, item_index: u64, offset: u64) {
        let rev_offset = (revision - self.first_revision) as usize;
        while self.revisions.len() <= rev_offset {
            self.revisions.push(Vec::new());
        }
        let items = &mut self.revisions[rev_offset];
        let idx = item_index as usize;
        if items.len() <= idx {
            items.resize(idx + 1, u64::MAX);
        }
        items[idx] = offset;
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut pages = Vec::new();
        let mut page_byte_sizes = Vec::new();
        let mut rev_page_counts = Vec::new();

        for items in &self.revisions {
            let mut count = 0;
            for chunk in items.chunks(self.page_size as usize) {
                let blob = bincode::serialize(&L2pPage {
                    offsets: chunk.to_vec(),
                })?;
                page_byte_sizes.push(blob.len() as u64);
                pages.push(blob);
                count += 1;
            }
            rev_page_counts.push(count);
        }

        let header = bincode::serialize(&L2pHeader {
            first_revision: self.first_revision,
            page_size: self.page_size,
            rev_page_counts,
            page_byte_sizes,
        })?;
        write_index_file(path, L2P_MAGIC, &header, &pages)
    }
}

/// Builder collecting p2l entries for one revision or pack file
pub struct P2lBuilder {
    first_revision: u64,
    page_size: u64,
    entries: Vec<P2lEntry>,
}

impl P2lBuilder {
    pub fn new(first_revision: u64, page_size: u64) -> Self {
        Self {
            first_revision,
            page_size: page_size.max(1),
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: P2lEntry) {
        self.entries.push(entry);
    }

    pub fn write(&self, path: &Path, file_size: u64) -> Result<()> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.offset);

        let page_count = file_size / self.page_size + 1;
        let mut pages: Vec<P2lPage> = (0..page_count)
            .map(|_| P2lPage {
                entries: Vec::new(),
            })
            .collect();
        for entry in entries {
            let page = (entry.offset / self.page_size) as usize;
            pages[page].entries.push(entry);
        }

        let mut blobs = Vec::new();
        let mut page_byte_sizes = Vec::new();
        for page in &pages {
            let blob = bincode::serialize(page)?;
            page_byte_sizes.push(blob.len() as u64);
            blobs.push(blob);
        }

        let header = bincode::serialize(&P2lHeader {
            first_revision: self.first_revision,
            page_size: self.page_size,
            file_size,
            page_byte_sizes,
        })?;
        write_index_file(path, P2L_MAGIC, &header, &blobs)
    }
}

/// Read the page table of an l2p index file.
pub fn read_l2p_header(path: &Path) -> Result<L2pHeader> {
    let (_, header) = read_index_header(path, L2P_MAGIC)?;
    Ok(bincode::deserialize(&header)?)
}

/// Read one l2p page. `page` is the global page number from
/// [`L2pHeader::page_of`].
pub fn read_l2p_page(path: &Path, header: &L2pHeader, page: u64) -> Result<L2pPage> {
    let header_len = bincode::serialized_size(header)? as usize;
    let blob = read_index_page(path, L2P_MAGIC, header_len, &header.page_byte_sizes, page)?;
    Ok(bincode::deserialize(&blob)?)
}

/// Read the page table of a p2l index file.
pub fn read_p2l_header(path: &Path) -> Result<P2lHeader> {
    let (_, header) = read_index_header(path, P2L_MAGIC)?;
    Ok(bincode::deserialize(&header)?)
}

/// Read one p2l page by page number.
pub fn read_p2l_page(path: &Path, header: &P2lHeader, page: u64) -> Result<P2lPage> {
    let header_len = bincode::serialized_size(header)? as usize;
    let blob = read_index_page(path, P2L_MAGIC, header_len, &header.page_byte_sizes, page)?;
    Ok(bincode::deserialize(&blob)?)
}
