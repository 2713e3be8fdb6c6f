//! Binary delta encoding for representations
//!
//! Block-match delta: the source is indexed in fixed-size blocks and the
//! target is encoded as a sequence of copy-from-source and insert
//! instructions. Applying the instructions to the source reproduces the
//! target exactly.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Source block granularity for match detection
const BLOCK_SIZE: usize = 64;

/// One delta instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `len` bytes from `offset` in the source
    Copy { offset: u64, len: u64 },
    /// Insert literal bytes
    Insert(Vec<u8>),
}

/// A complete delta from one byte string to another
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Compute a delta that transforms `source` into `target`.
pub fn encode(source: &[u8], target: &[u8]) -> Delta {
    let mut blocks: HashMap<&[u8], u64> = HashMap::new();
    let mut off = 0;
    while off + BLOCK_SIZE <= source.len() {
        // First occurrence wins; duplicates add nothing.
        blocks.entry(&source[off..off + BLOCK_SIZE]).or_insert(off as u64);
        off += BLOCK_SIZE;
    }

    let mut ops = Vec::new();
    let mut insert = Vec::new();
    let mut pos = 0;

    while pos < target.len() {
        let matched = if pos + BLOCK_SIZE <= target.len() {
            blocks.get(&target[pos..pos + BLOCK_SIZE]).copied()
        } else {
            None
        };

        match matched {
            Some(src_off) => {
                if !insert.is_empty() {
                    ops.push(DeltaOp::Insert(std::mem::take(&mut insert)));
                }
                // Extend the match beyond the block boundary.
                let mut len = BLOCK_SIZE;
                while pos + len < target.len()
                    && (src_off as usize) + len < source.len()
                    && target[pos + len] == source[src_off as usize + len]
                {
                    len += 1;
                }
                ops.push(DeltaOp::Copy {
                    offset: src_off,
                    len: len as u64,
                });
                pos += len;
            }
            None => {
                insert.push(target[pos]);
                pos += 1;
            }
        }
    }

    if !insert.is_empty() {
        ops.push(DeltaOp::Insert(insert));
    }

    Delta { ops }
}

/// Apply a delta to `source`, reproducing the original target.
pub fn apply(source: &[u8], delta: &Delta) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                let start = *offset as usize;
                let end = start
                    .checked_add(*len as usize)
                    .ok_or_else(|| FsError::Corrupt("delta copy range overflow".into()))?;
                if end > source.len() {
                    return Err(FsError::Corrupt(format!(
                        "delta copy [{start}, {end}) exceeds source length {}",
                        source.len()
                    )));
                }
                out.extend_from_slice(&source[start..end]);
            }
            DeltaOp::Insert(bytes) => out.extend_from_slice(bytes),
        }
    }
    Ok(out)
}
