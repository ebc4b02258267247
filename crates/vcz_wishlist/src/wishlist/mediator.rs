//! What the [`Wishlist`](super::Wishlist) needs to know about the torrent,
//! and the events it listens to.
use crate::{
    bitfield::Bitfield,
    block::{BlockIndex, BlockSpan, PieceIndex, Priority},
    observable::{Observable, Observer, Subscription},
};

/// Payload of the peer disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDisconnect {
    /// The pieces the peer had.
    pub have: Bitfield,
    /// The blocks that were requested from the peer and never arrived.
    pub requested: Bitfield,
}

/// One [`Observable`] per event a [`Mediator`] announces. Implementors keep
/// one of these around and forward the `observe_*` methods to it.
#[derive(Debug, Default)]
pub struct MediatorEvents {
    pub piece_completed: Observable<PieceIndex>,
    pub got_block: Observable<BlockIndex>,
    pub got_bitfield: Observable<Bitfield>,
    pub got_have: Observable<PieceIndex>,
    pub got_have_all: Observable<()>,
    pub peer_disconnect: Observable<PeerDisconnect>,
    pub got_reject: Observable<BlockIndex>,
    pub sent_cancel: Observable<BlockIndex>,
    pub priority_changed: Observable<PieceIndex>,
    pub sequential_download_changed: Observable<bool>,
}

/// The torrent state the block selector reads but does not own.
///
/// Every query is cheap enough to be called once per piece or per block
/// during [`Wishlist::next`](super::Wishlist::next).
pub trait Mediator {
    fn client_has_block(&self, block: BlockIndex) -> bool;
    fn client_has_piece(&self, piece: PieceIndex) -> bool;
    fn client_wants_piece(&self, piece: PieceIndex) -> bool;

    fn is_sequential_download(&self) -> bool;
    fn download_first_last_pieces_first(&self) -> bool;
    fn sequential_download_from_piece(&self) -> PieceIndex;

    /// How many connected peers have `piece`.
    fn count_piece_replication(&self, piece: PieceIndex) -> usize;
    fn count_missing_blocks(&self, piece: PieceIndex) -> usize;
    /// How many peers are being asked for `block` right now.
    fn count_active_requests(&self, block: BlockIndex) -> usize;

    fn block_span(&self, piece: PieceIndex) -> BlockSpan;
    fn piece_count(&self) -> usize;
    fn priority(&self, piece: PieceIndex) -> Priority;

    fn is_endgame(&self) -> bool;

    fn observe_piece_completed(
        &self,
        observer: Observer<PieceIndex>,
    ) -> Subscription;

    fn observe_got_block(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription;

    /// A full bitfield arrived, either from a peer or from resume data.
    fn observe_got_bitfield(
        &self,
        observer: Observer<Bitfield>,
    ) -> Subscription;

    fn observe_got_have(&self, observer: Observer<PieceIndex>) -> Subscription;

    fn observe_got_have_all(&self, observer: Observer<()>) -> Subscription;

    fn observe_peer_disconnect(
        &self,
        observer: Observer<PeerDisconnect>,
    ) -> Subscription;

    fn observe_got_reject(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription;

    fn observe_sent_cancel(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription;

    /// The priority or the wanted flag of a piece changed.
    fn observe_priority_changed(
        &self,
        observer: Observer<PieceIndex>,
    ) -> Subscription;

    /// Any of the sequential download settings changed.
    fn observe_sequential_download_changed(
        &self,
        observer: Observer<bool>,
    ) -> Subscription;
}
