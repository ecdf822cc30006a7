//! Wire types carried alongside the shadow-fd protocol's own messages: the
//! out-of-band `Transfer` records that ship buffer contents (or diffs)
//! between proxy instances.
//!
//! Encoding is manual little-endian, matching the teacher's ring-buffer
//! header style (`transport/shm/ring.rs`) rather than reaching for `serde`
//! or `bincode`: the wire format is small, fixed-shape, and the
//! compression payload that follows each block has to be sliced out by hand
//! regardless.
//!
//! `special` is one word on the wire (`spec.md` §6) reinterpreted per
//! category: for FILE/DMABUF it is the uncompressed total diff (or
//! first-send) size; for PIPE it packs the close flag together with the
//! direction the sender observed, so a receiver creating a shadow fd from
//! an unseen remote id (`planner::apply_update`'s create-from-update path)
//! knows which end to flip.

use crate::compress::CompressionMode;
use crate::error::{Result, SfdError};
use crate::shadow_fd::PipeKind;

/// What kind of shadow fd a `Transfer` describes. Determines how `special`
/// and the block payloads are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    File,
    Pipe,
    Dmabuf,
}

impl Category {
    fn to_u8(self) -> u8 {
        match self {
            Category::File => 0,
            Category::Pipe => 1,
            Category::Dmabuf => 2,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Category::File),
            1 => Ok(Category::Pipe),
            2 => Ok(Category::Dmabuf),
            other => Err(SfdError::invariant(format!("transfer: unknown category tag {other}"))),
        }
    }
}

/// The category-dependent meaning of the wire's single `special: u32` word
/// (`spec.md` §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// FILE: uncompressed size — the whole file on a first transfer, or the
    /// sum of uncompressed diff-slice sizes on later ones.
    FileActualSize(u32),
    /// DMABUF: uncompressed size, same disambiguation as FILE.
    DmabufActualSize(u32),
    /// PIPE: whether this is a local-close notification, plus the pipe
    /// direction the sender observed (carried so a peer creating a shadow
    /// fd from this transfer knows which end to flip, `spec.md` §4.7).
    Pipe { pipeclose: bool, kind: PipeKind },
}

impl Special {
    fn to_u32(self) -> u32 {
        match self {
            Special::FileActualSize(n) | Special::DmabufActualSize(n) => n,
            Special::Pipe { pipeclose, kind } => (pipeclose as u32) | (kind.to_u8() as u32) << 1,
        }
    }

    fn from_u32(category: Category, raw: u32) -> Self {
        match category {
            Category::File => Special::FileActualSize(raw),
            Category::Dmabuf => Special::DmabufActualSize(raw),
            Category::Pipe => Special::Pipe {
                pipeclose: raw & 1 != 0,
                kind: PipeKind::from_u8(((raw >> 1) & 0b11) as u8),
            },
        }
    }
}

/// One compressed payload, as it appears on the wire between the header and
/// the next block (or the next `Transfer`). Several of these concatenate,
/// in worker-index order, to form one multi-block `Transfer` (`spec.md`
/// §4.6/§6: parallel diff dispatch produces one block per nonempty worker
/// slice).
#[derive(Debug, Clone)]
pub struct Block {
    pub compression: CompressionMode,
    /// Size of the payload once decompressed.
    pub decompressed_len: u32,
    pub data: Vec<u8>,
}

/// One logical update for a single shadow fd: a header plus `nblocks`
/// blocks (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct Transfer {
    pub remote_id: i32,
    pub category: Category,
    pub special: Special,
    pub blocks: Vec<Block>,
}

const HEADER_LEN: usize = 4 + 1 + 4 + 4; // remote_id + category + special + nblocks
const BLOCK_HEADER_LEN: usize = 1 + 4 + 4; // comp_tag + decompressed_len + size

impl Transfer {
    /// Encode the header and every block into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.remote_id.to_le_bytes());
        out.push(self.category.to_u8());
        out.extend_from_slice(&self.special.to_u32().to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            out.push(comp_tag(block.compression));
            out.extend_from_slice(&block.decompressed_len.to_le_bytes());
            out.extend_from_slice(&(block.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&block.data);
        }
    }

    /// Decode one `Transfer` (header plus all its blocks) from the front of
    /// `buf`. Returns the value and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(SfdError::invariant("transfer: buffer shorter than header"));
        }
        let remote_id = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let category = Category::from_u8(buf[4])?;
        let special_raw = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let nblocks = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
        let special = Special::from_u32(category, special_raw);

        let mut pos = HEADER_LEN;
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            if pos + BLOCK_HEADER_LEN > buf.len() {
                return Err(SfdError::invariant("transfer: truncated block header"));
            }
            let comp_tag_byte = buf[pos];
            let decompressed_len = u32::from_le_bytes(buf[pos + 1..pos + 5].try_into().unwrap());
            let data_len = u32::from_le_bytes(buf[pos + 5..pos + 9].try_into().unwrap()) as usize;
            pos += BLOCK_HEADER_LEN;
            if pos + data_len > buf.len() {
                return Err(SfdError::invariant("transfer: declared block size exceeds buffer"));
            }
            blocks.push(Block {
                compression: comp_from_tag(comp_tag_byte)?,
                decompressed_len,
                data: buf[pos..pos + data_len].to_vec(),
            });
            pos += data_len;
        }

        Ok((Transfer { remote_id, category, special, blocks }, pos))
    }
}

fn comp_tag(mode: CompressionMode) -> u8 {
    match mode {
        CompressionMode::None => 0,
        #[cfg(feature = "lz4")]
        CompressionMode::Lz4 => 1,
        #[cfg(feature = "zstd")]
        CompressionMode::Zstd => 2,
    }
}

fn comp_from_tag(tag: u8) -> Result<CompressionMode> {
    match tag {
        0 => Ok(CompressionMode::None),
        #[cfg(feature = "lz4")]
        1 => Ok(CompressionMode::Lz4),
        #[cfg(feature = "zstd")]
        2 => Ok(CompressionMode::Zstd),
        other => Err(SfdError::invariant(format!("transfer: unknown compression tag {other}"))),
    }
}
