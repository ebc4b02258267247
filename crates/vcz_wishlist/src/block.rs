//! Types that describe how the data of a torrent is divided into pieces and
//! blocks.
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The default length of a block, 16 KiB. This is the unit that is actually
/// requested from peers.
pub const BLOCK_LEN: u32 = 16384;

/// Zero-based index of a piece in the torrent.
pub type PieceIndex = usize;

/// Zero-based index of a block in the torrent, counted from the first block
/// of the first piece.
pub type BlockIndex = usize;

/// A half-open range of blocks, `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockSpan {
    pub begin: BlockIndex,
    pub end: BlockIndex,
}

impl BlockSpan {
    pub fn new(begin: BlockIndex, end: BlockIndex) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, block: BlockIndex) -> bool {
        block >= self.begin && block < self.end
    }

    pub fn iter(&self) -> Range<BlockIndex> {
        self.begin..self.end
    }
}

impl IntoIterator for BlockSpan {
    type Item = BlockIndex;
    type IntoIter = Range<BlockIndex>;

    fn into_iter(self) -> Self::IntoIter {
        self.begin..self.end
    }
}

/// The download priority of a piece, usually inherited from the priority of
/// the file(s) that the piece belongs to.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// The location of a block inside a piece, this is what goes on the wire in
/// the Request, Piece and Cancel messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's length in bytes. <= 16 KiB
    pub len: usize,
}

/// How the bytes of a torrent map into pieces and blocks.
///
/// The piece size must be a multiple of the block size, so a block never
/// overlaps two pieces. Only the last piece and the last block may be
/// shorter than the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    total_size: u64,
    piece_size: u32,
    block_size: u32,
    piece_count: usize,
    block_count: usize,
    blocks_per_piece: usize,
}

impl BlockLayout {
    /// Create a layout with the default block length, or the piece size if
    /// the pieces are smaller than a default block.
    pub fn new(total_size: u64, piece_size: u32) -> Result<Self, Error> {
        Self::with_block_size(total_size, piece_size, BLOCK_LEN.min(piece_size))
    }

    pub fn with_block_size(
        total_size: u64,
        piece_size: u32,
        block_size: u32,
    ) -> Result<Self, Error> {
        if total_size == 0 {
            return Err(Error::LayoutEmpty);
        }
        if piece_size == 0 || block_size == 0 {
            return Err(Error::LayoutZeroSize);
        }
        if piece_size % block_size != 0 {
            return Err(Error::LayoutMisaligned { piece_size, block_size });
        }

        let piece_count = total_size.div_ceil(piece_size as u64) as usize;
        let block_count = total_size.div_ceil(block_size as u64) as usize;

        Ok(Self {
            total_size,
            piece_size,
            block_size,
            piece_count,
            block_count,
            blocks_per_piece: (piece_size / block_size) as usize,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn blocks_per_piece(&self) -> usize {
        self.blocks_per_piece
    }

    /// The blocks of `piece`. Out of range pieces have an empty span.
    pub fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        if piece >= self.piece_count {
            return BlockSpan::new(self.block_count, self.block_count);
        }
        let begin = piece * self.blocks_per_piece;
        let end = (begin + self.blocks_per_piece).min(self.block_count);
        BlockSpan::new(begin, end)
    }

    pub fn piece_of(&self, block: BlockIndex) -> PieceIndex {
        block / self.blocks_per_piece
    }

    /// Length of `piece` in bytes, zero if out of range.
    pub fn piece_len(&self, piece: PieceIndex) -> u32 {
        if piece >= self.piece_count {
            return 0;
        }
        if piece + 1 == self.piece_count {
            return (self.total_size - piece as u64 * self.piece_size as u64)
                as u32;
        }
        self.piece_size
    }

    /// Length of `block` in bytes, zero if out of range.
    pub fn block_len(&self, block: BlockIndex) -> u32 {
        if block >= self.block_count {
            return 0;
        }
        if block + 1 == self.block_count {
            return (self.total_size - block as u64 * self.block_size as u64)
                as u32;
        }
        self.block_size
    }

    /// Where `block` lives inside its piece.
    pub fn block_info(&self, block: BlockIndex) -> BlockInfo {
        let index = self.piece_of(block);
        let offset = block - index * self.blocks_per_piece;
        BlockInfo {
            index,
            begin: offset * self.block_size as usize,
            len: self.block_len(block) as usize,
        }
    }

    /// The reverse of [`Self::block_info`]. Returns `None` if the info is
    /// not aligned to a block boundary or is out of range.
    pub fn block_of(&self, info: &BlockInfo) -> Option<BlockIndex> {
        let block_size = self.block_size as usize;
        if info.begin % block_size != 0 || info.index >= self.piece_count {
            return None;
        }
        let block =
            info.index * self.blocks_per_piece + info.begin / block_size;
        self.block_span(info.index).contains(block).then_some(block)
    }
}
