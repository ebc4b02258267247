//! The torrent side state of a download: what we have, what we want, what
//! the peers have and what was requested from them.
//!
//! [`Swarm`] is what a peer manager feeds with the messages it receives,
//! and it is the [`Mediator`] that the [`Wishlist`](crate::Wishlist) reads.
use std::{cell::Cell, fmt::Debug, hash::Hash, time::Duration};

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::{
    active_requests::ActiveRequests,
    bitfield::Bitfield,
    block::{BlockIndex, BlockLayout, BlockSpan, PieceIndex, Priority},
    error::Error,
    observable::{Observer, Subscription},
    wishlist::{Mediator, MediatorEvents, PeerDisconnect},
};

/// How long a request may go unanswered before it is cancelled.
pub const REQUEST_TTL: Duration = Duration::from_secs(90);

#[derive(Debug)]
pub struct Swarm<P> {
    layout: BlockLayout,

    /// Blocks that we have.
    blocks: Bitfield,

    /// Pieces that we have, all their blocks are in `blocks`.
    pieces: Bitfield,

    wanted: Bitfield,
    priorities: Vec<Priority>,

    /// How many connected peers have each piece.
    replication: Vec<usize>,

    /// The pieces of each connected peer.
    peers: HashMap<P, Bitfield>,

    requests: ActiveRequests<P>,

    sequential: bool,
    sequential_from: PieceIndex,
    first_last: bool,

    /// Was the swarm in endgame the last time it was asked.
    endgame: Cell<bool>,

    events: MediatorEvents,
}

impl<P> Swarm<P>
where
    P: Eq + Hash + Clone + Debug,
{
    /// A swarm where we want every piece and have none, and no peers.
    pub fn new(layout: BlockLayout) -> Self {
        let piece_count = layout.piece_count();
        Self {
            blocks: Bitfield::new(layout.block_count()),
            pieces: Bitfield::new(piece_count),
            wanted: Bitfield::new_all(piece_count),
            priorities: vec![Priority::default(); piece_count],
            replication: vec![0; piece_count],
            peers: HashMap::new(),
            requests: ActiveRequests::new(),
            sequential: false,
            sequential_from: 0,
            first_last: false,
            endgame: Default::default(),
            events: MediatorEvents::default(),
            layout,
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// The blocks that we have.
    pub fn blocks(&self) -> &Bitfield {
        &self.blocks
    }

    /// The pieces that we have.
    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn requests(&self) -> &ActiveRequests<P> {
        &self.requests
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_pieces(&self, peer: &P) -> Option<&Bitfield> {
        self.peers.get(peer)
    }

    pub fn peer_has_piece(&self, peer: &P, piece: PieceIndex) -> bool {
        self.peers.get(peer).is_some_and(|b| b.test(piece))
    }

    /// Add a peer that has nothing. Returns false if it was already here.
    pub fn add_peer(&mut self, peer: P) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        debug!(?peer, "peer connected");
        self.peers.insert(peer, Bitfield::new(self.layout.piece_count()));
        true
    }

    /// Replace the pieces of `peer` with `bitfield`.
    pub fn peer_bitfield(
        &mut self,
        peer: &P,
        bitfield: Bitfield,
    ) -> Result<(), Error> {
        let expected = self.layout.piece_count();
        if bitfield.len() != expected {
            return Err(Error::BitfieldLen { expected, len: bitfield.len() });
        }

        let old = self.peers.get_mut(peer).ok_or(Error::PeerNotFound)?;
        for piece in old.iter_ones() {
            self.replication[piece] -= 1;
        }
        for piece in bitfield.iter_ones() {
            self.replication[piece] += 1;
        }
        *old = bitfield;

        trace!(?peer, pieces = old.count(), "got bitfield");
        self.events.got_bitfield.emit(old);

        Ok(())
    }

    pub fn peer_have(
        &mut self,
        peer: &P,
        piece: PieceIndex,
    ) -> Result<(), Error> {
        self.check_piece(piece)?;
        let have = self.peers.get_mut(peer).ok_or(Error::PeerNotFound)?;

        if !have.test(piece) {
            have.set(piece, true);
            self.replication[piece] += 1;
        }

        self.events.got_have.emit(&piece);
        Ok(())
    }

    pub fn peer_have_all(&mut self, peer: &P) -> Result<(), Error> {
        let have = self.peers.get_mut(peer).ok_or(Error::PeerNotFound)?;

        if !have.has_all() {
            for (piece, replication) in self.replication.iter_mut().enumerate()
            {
                if !have.test(piece) {
                    *replication += 1;
                }
            }
            have.set_has_all();
        }

        self.events.got_have_all.emit(&());
        Ok(())
    }

    /// Forget `peer`, returning the blocks that were requested from it and
    /// must now be requested from someone else.
    pub fn remove_peer(&mut self, peer: &P) -> Result<Vec<BlockIndex>, Error> {
        let have = self.peers.remove(peer).ok_or(Error::PeerNotFound)?;
        for piece in have.iter_ones() {
            self.replication[piece] -= 1;
        }

        let blocks = self.requests.remove_peer(peer);
        let mut requested = Bitfield::new(self.layout.block_count());
        for block in &blocks {
            requested.set(*block, true);
        }

        debug!(?peer, requests = blocks.len(), "peer disconnected");
        self.events.peer_disconnect.emit(&PeerDisconnect { have, requested });

        Ok(blocks)
    }

    /// Record the requests of `span` sent to `peer` at `now`. Returns how
    /// many of them were new.
    pub fn request_sent(
        &mut self,
        peer: &P,
        span: BlockSpan,
        now: Instant,
    ) -> Result<usize, Error> {
        if !self.peers.contains_key(peer) {
            return Err(Error::PeerNotFound);
        }
        if span.end > self.layout.block_count() {
            return Err(Error::BlockOutOfRange(
                span.end - 1,
                self.layout.block_count(),
            ));
        }

        let added = span
            .iter()
            .filter(|b| self.requests.add(*b, peer.clone(), now))
            .count();

        trace!(?peer, ?span, added, "requests sent");
        Ok(added)
    }

    /// `peer` sent us `block`.
    ///
    /// Returns the other peers that were also asked for it, the caller
    /// must send them a cancel. Nothing happens if we already had the
    /// block, other than forgetting the request.
    pub fn block_received(
        &mut self,
        peer: &P,
        block: BlockIndex,
    ) -> Result<Vec<P>, Error> {
        self.check_block(block)?;
        if !self.peers.contains_key(peer) {
            return Err(Error::PeerNotFound);
        }

        if self.blocks.test(block) {
            self.requests.remove(block, peer);
            trace!(?peer, block, "duplicate block");
            return Ok(Vec::new());
        }

        self.blocks.set(block, true);

        let cancels: Vec<P> = self
            .requests
            .remove_block(block)
            .into_iter()
            .filter(|p| p != peer)
            .collect();

        self.events.got_block.emit(&block);
        for _ in &cancels {
            self.events.sent_cancel.emit(&block);
        }

        let piece = self.layout.piece_of(block);
        let span = self.layout.block_span(piece);
        if self.blocks.count_range(span.begin, span.end) == span.len() {
            self.pieces.set(piece, true);
            debug!(piece, have = self.pieces.count(), "piece completed");
            self.events.piece_completed.emit(&piece);

            if self.is_done() {
                info!("download complete");
            }
        }

        Ok(cancels)
    }

    /// `peer` refused to send `block`. Returns true if the request existed.
    pub fn reject_received(
        &mut self,
        peer: &P,
        block: BlockIndex,
    ) -> Result<bool, Error> {
        self.check_block(block)?;
        let removed = self.requests.remove(block, peer);
        self.events.got_reject.emit(&block);
        Ok(removed)
    }

    /// Cancel the requests sent before `cutoff`, returning them so that
    /// the caller can send the cancel messages.
    pub fn cancel_stale(&mut self, cutoff: Instant) -> Vec<(BlockIndex, P)> {
        let stale = self.requests.sent_before(cutoff);

        for (block, peer) in &stale {
            self.requests.remove(*block, peer);
            self.events.sent_cancel.emit(block);
        }

        if !stale.is_empty() {
            debug!(stale = stale.len(), "cancelled timed out requests");
        }

        stale
    }

    /// Cancel the requests that went unanswered for [`REQUEST_TTL`].
    pub fn cancel_timed_out(&mut self, now: Instant) -> Vec<(BlockIndex, P)> {
        match now.checked_sub(REQUEST_TTL) {
            Some(cutoff) => self.cancel_stale(cutoff),
            None => Vec::new(),
        }
    }

    pub fn set_piece_priority(
        &mut self,
        piece: PieceIndex,
        priority: Priority,
    ) -> Result<(), Error> {
        self.check_piece(piece)?;
        if self.priorities[piece] != priority {
            self.priorities[piece] = priority;
            self.events.priority_changed.emit(&piece);
        }
        Ok(())
    }

    /// Select or deselect a piece for download.
    pub fn set_piece_wanted(
        &mut self,
        piece: PieceIndex,
        wanted: bool,
    ) -> Result<(), Error> {
        self.check_piece(piece)?;
        if self.wanted.test(piece) != wanted {
            self.wanted.set(piece, wanted);
            self.events.priority_changed.emit(&piece);
        }
        Ok(())
    }

    pub fn set_sequential_download(&mut self, sequential: bool) {
        if self.sequential != sequential {
            self.sequential = sequential;
            self.events.sequential_download_changed.emit(&sequential);
        }
    }

    pub fn set_sequential_download_from_piece(
        &mut self,
        piece: PieceIndex,
    ) -> Result<(), Error> {
        self.check_piece(piece)?;
        if self.sequential_from != piece {
            self.sequential_from = piece;
            self.events.sequential_download_changed.emit(&self.sequential);
        }
        Ok(())
    }

    pub fn set_download_first_last_pieces_first(&mut self, first_last: bool) {
        if self.first_last != first_last {
            self.first_last = first_last;
            self.events.sequential_download_changed.emit(&self.sequential);
        }
    }

    /// Load the blocks that we have from resume data.
    pub fn load_blocks(&mut self, raw: &[u8]) -> Result<(), Error> {
        self.blocks.set_raw(raw)?;

        let mut pieces = Bitfield::new(self.layout.piece_count());
        for piece in 0..self.layout.piece_count() {
            let span = self.layout.block_span(piece);
            if self.blocks.count_range(span.begin, span.end) == span.len() {
                pieces.set(piece, true);
            }
        }
        self.pieces = pieces;

        info!(
            blocks = self.blocks.count(),
            pieces = self.pieces.count(),
            "loaded blocks"
        );
        self.events.got_bitfield.emit(&self.blocks);

        Ok(())
    }

    /// Bytes of the wanted pieces that we do not have yet.
    pub fn left_until_done(&self) -> u64 {
        self.wanted
            .iter_ones()
            .filter(|piece| !self.pieces.test(*piece))
            .map(|piece| {
                let span = self.layout.block_span(piece);
                if self.blocks.count_range(span.begin, span.end) == 0 {
                    return self.layout.piece_len(piece) as u64;
                }
                span.iter()
                    .filter(|b| !self.blocks.test(*b))
                    .map(|b| self.layout.block_len(b) as u64)
                    .sum()
            })
            .sum()
    }

    /// True when every wanted piece is complete.
    pub fn is_done(&self) -> bool {
        self.wanted.iter_ones().all(|piece| self.pieces.test(piece))
    }

    fn check_piece(&self, piece: PieceIndex) -> Result<(), Error> {
        let piece_count = self.layout.piece_count();
        if piece >= piece_count {
            return Err(Error::PieceOutOfRange(piece, piece_count));
        }
        Ok(())
    }

    fn check_block(&self, block: BlockIndex) -> Result<(), Error> {
        let block_count = self.layout.block_count();
        if block >= block_count {
            return Err(Error::BlockOutOfRange(block, block_count));
        }
        Ok(())
    }
}

impl<P> Mediator for Swarm<P>
where
    P: Eq + Hash + Clone + Debug,
{
    fn client_has_block(&self, block: BlockIndex) -> bool {
        self.blocks.test(block)
    }

    fn client_has_piece(&self, piece: PieceIndex) -> bool {
        self.pieces.test(piece)
    }

    fn client_wants_piece(&self, piece: PieceIndex) -> bool {
        self.wanted.test(piece)
    }

    fn is_sequential_download(&self) -> bool {
        self.sequential
    }

    fn download_first_last_pieces_first(&self) -> bool {
        self.first_last
    }

    fn sequential_download_from_piece(&self) -> PieceIndex {
        self.sequential_from
    }

    fn count_piece_replication(&self, piece: PieceIndex) -> usize {
        self.replication.get(piece).copied().unwrap_or(0)
    }

    fn count_missing_blocks(&self, piece: PieceIndex) -> usize {
        let span = self.layout.block_span(piece);
        span.len() - self.blocks.count_range(span.begin, span.end)
    }

    fn count_active_requests(&self, block: BlockIndex) -> usize {
        self.requests.count_block(block)
    }

    fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        self.layout.block_span(piece)
    }

    fn piece_count(&self) -> usize {
        self.layout.piece_count()
    }

    fn priority(&self, piece: PieceIndex) -> Priority {
        self.priorities.get(piece).copied().unwrap_or_default()
    }

    /// Endgame starts when the requests in flight cover everything that is
    /// left to download.
    fn is_endgame(&self) -> bool {
        let in_flight =
            self.requests.size() as u64 * self.layout.block_size() as u64;
        let endgame = in_flight >= self.left_until_done();

        if endgame != self.endgame.replace(endgame) {
            debug!(endgame, in_flight, "endgame changed");
        }

        endgame
    }

    fn observe_piece_completed(
        &self,
        observer: Observer<PieceIndex>,
    ) -> Subscription {
        self.events.piece_completed.observe(observer)
    }

    fn observe_got_block(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription {
        self.events.got_block.observe(observer)
    }

    fn observe_got_bitfield(
        &self,
        observer: Observer<Bitfield>,
    ) -> Subscription {
        self.events.got_bitfield.observe(observer)
    }

    fn observe_got_have(&self, observer: Observer<PieceIndex>) -> Subscription {
        self.events.got_have.observe(observer)
    }

    fn observe_got_have_all(&self, observer: Observer<()>) -> Subscription {
        self.events.got_have_all.observe(observer)
    }

    fn observe_peer_disconnect(
        &self,
        observer: Observer<PeerDisconnect>,
    ) -> Subscription {
        self.events.peer_disconnect.observe(observer)
    }

    fn observe_got_reject(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription {
        self.events.got_reject.observe(observer)
    }

    fn observe_sent_cancel(
        &self,
        observer: Observer<BlockIndex>,
    ) -> Subscription {
        self.events.sent_cancel.observe(observer)
    }

    fn observe_priority_changed(
        &self,
        observer: Observer<PieceIndex>,
    ) -> Subscription {
        self.events.priority_changed.observe(observer)
    }

    fn observe_sequential_download_changed(
        &self,
        observer: Observer<bool>,
    ) -> Subscription {
        self.events.sequential_download_changed.observe(observer)
    }
}
