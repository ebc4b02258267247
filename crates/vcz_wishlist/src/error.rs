use thiserror::Error;

use crate::block::{BlockIndex, PieceIndex};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Could not allocate {0} bytes for the bitfield")]
    AllocationFailed(usize),

    #[error("The torrent must have a size larger than zero")]
    LayoutEmpty,

    #[error("The piece and block sizes must be larger than zero")]
    LayoutZeroSize,

    #[error(
        "The piece size `{piece_size}` is not a multiple of the block size \
         `{block_size}`"
    )]
    LayoutMisaligned { piece_size: u32, block_size: u32 },

    #[error("Piece `{0}` is out of range, the torrent has `{1}` pieces")]
    PieceOutOfRange(PieceIndex, usize),

    #[error("Block `{0}` is out of range, the torrent has `{1}` blocks")]
    BlockOutOfRange(BlockIndex, usize),

    #[error("Expected a bitfield of `{expected}` bits but got `{len}`")]
    BitfieldLen { expected: usize, len: usize },

    #[error("The given peer is not part of this swarm")]
    PeerNotFound,
}
