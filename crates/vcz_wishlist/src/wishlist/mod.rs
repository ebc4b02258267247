//! Decides which blocks to request next from a peer.
//!
//! Pieces are ranked by how close they are to completion, then by
//! priority, then by how rare they are in the swarm and lastly by a salt
//! that is either the sequential position of the piece or a random value.
//! Blocks are taken from the best ranked pieces first, skipping the ones we
//! have, the ones with enough requesters and the ones this peer was already
//! asked for.
mod candidate;
mod mediator;

use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use tracing::{debug, trace};

use crate::{
    bitfield::Bitfield,
    block::{BlockIndex, BlockSpan, PieceIndex},
    observable::Subscription,
};
use candidate::{Candidate, SaltShaker};

pub use mediator::{Mediator, MediatorEvents, PeerDisconnect};

/// How many candidates are sorted up front. The rest are only sorted if
/// the first ones were not enough to fill the quota.
pub const MAX_SORTED_PIECES: usize = 30;

/// How many peers may be asked for the same block during endgame.
pub const ENDGAME_MAX_REQUESTERS: usize = 2;

type WantedPieces = Rc<RefCell<Option<Vec<PieceIndex>>>>;

/// The block selector of one torrent.
///
/// It remembers which pieces are wanted and not complete, and keeps that
/// list up to date by listening to the events of its [`Mediator`]. Nothing
/// else is cached, so everything else is read from the mediator on each
/// call to [`Wishlist::next`].
#[derive(Debug)]
pub struct Wishlist {
    /// Ascending piece indices, `None` when it must be rebuilt.
    wanted: WantedPieces,
    _subscriptions: Vec<Subscription>,
}

impl Wishlist {
    pub fn new<M: Mediator + ?Sized>(mediator: &M) -> Self {
        let wanted: WantedPieces = Rc::default();

        let invalidate = |wanted: &WantedPieces| {
            let wanted = Rc::downgrade(wanted);
            move || {
                if let Some(wanted) = wanted.upgrade() {
                    wanted.borrow_mut().take();
                }
            }
        };

        let on_priority = invalidate(&wanted);
        let on_bitfield = invalidate(&wanted);
        let on_sequential = invalidate(&wanted);
        let completed = Rc::downgrade(&wanted);

        let subscriptions = vec![
            mediator.observe_priority_changed(Box::new(move |_: &PieceIndex| {
                on_priority()
            })),
            mediator.observe_got_bitfield(Box::new(move |_: &Bitfield| {
                on_bitfield()
            })),
            mediator.observe_sequential_download_changed(Box::new(
                move |_: &bool| on_sequential(),
            )),
            mediator.observe_piece_completed(Box::new(
                move |piece: &PieceIndex| {
                    let Some(wanted) = completed.upgrade() else { return };
                    let mut wanted = wanted.borrow_mut();
                    if let Some(pieces) = wanted.as_mut() {
                        if let Ok(i) = pieces.binary_search(piece) {
                            pieces.remove(i);
                        }
                    }
                },
            )),
        ];

        Self { wanted, _subscriptions: subscriptions }
    }

    /// Up to `n_wanted_blocks` blocks to request from a peer, as sorted,
    /// non overlapping spans.
    ///
    /// `peer_has_piece` tells if the peer can serve a piece, and
    /// `peer_already_requested` if the block is already requested from this
    /// same peer.
    pub fn next<M, H, A>(
        &self,
        mediator: &M,
        n_wanted_blocks: usize,
        peer_has_piece: H,
        peer_already_requested: A,
    ) -> Vec<BlockSpan>
    where
        M: Mediator + ?Sized,
        H: Fn(PieceIndex) -> bool,
        A: Fn(BlockIndex) -> bool,
    {
        self.next_with_rng(
            mediator,
            n_wanted_blocks,
            peer_has_piece,
            peer_already_requested,
            &mut rand::thread_rng(),
        )
    }

    /// Same as [`Self::next`], drawing the random salts from `rng`.
    #[tracing::instrument(skip_all, fields(n_wanted_blocks = n_wanted_blocks))]
    pub fn next_with_rng<M, H, A, R>(
        &self,
        mediator: &M,
        n_wanted_blocks: usize,
        peer_has_piece: H,
        peer_already_requested: A,
        rng: &mut R,
    ) -> Vec<BlockSpan>
    where
        M: Mediator + ?Sized,
        H: Fn(PieceIndex) -> bool,
        A: Fn(BlockIndex) -> bool,
        R: Rng + ?Sized,
    {
        if n_wanted_blocks == 0 {
            return Vec::new();
        }

        let mut candidates = self.candidates(mediator, rng);

        let middle = candidates.len().min(MAX_SORTED_PIECES);
        if middle > 0 && middle < candidates.len() {
            candidates.select_nth_unstable(middle - 1);
        }
        candidates[..middle].sort_unstable();

        let max_requesters =
            if mediator.is_endgame() { ENDGAME_MAX_REQUESTERS } else { 1 };

        let mut blocks: Vec<BlockIndex> = Vec::new();

        for i in 0..candidates.len() {
            if blocks.len() >= n_wanted_blocks {
                break;
            }
            if i == middle {
                candidates[middle..].sort_unstable();
            }

            let piece = candidates[i].piece;
            if !peer_has_piece(piece) {
                continue;
            }

            for block in mediator.block_span(piece) {
                if blocks.len() >= n_wanted_blocks {
                    break;
                }
                if mediator.client_has_block(block)
                    || mediator.count_active_requests(block) >= max_requesters
                    || peer_already_requested(block)
                {
                    continue;
                }
                blocks.push(block);
            }
        }

        blocks.sort_unstable();
        let spans = make_spans(&blocks);

        debug!(
            candidates = candidates.len(),
            blocks = blocks.len(),
            spans = spans.len(),
            endgame = max_requesters > 1,
            "selected blocks"
        );

        spans
    }

    /// Score every piece that we want and do not have yet.
    fn candidates<M, R>(&self, mediator: &M, rng: &mut R) -> Vec<Candidate>
    where
        M: Mediator + ?Sized,
        R: Rng + ?Sized,
    {
        let mut wanted = self.wanted.borrow_mut();
        let pieces = wanted.get_or_insert_with(|| {
            let pieces: Vec<PieceIndex> = (0..mediator.piece_count())
                .filter(|p| {
                    mediator.client_wants_piece(*p)
                        && !mediator.client_has_piece(*p)
                })
                .collect();
            trace!(wanted = pieces.len(), "rebuilt wanted pieces");
            pieces
        });

        let piece_count = mediator.piece_count();
        let sequential = mediator.is_sequential_download();
        let first_last = mediator.download_first_last_pieces_first();

        let salts = if sequential {
            SaltShaker::sequential(
                mediator.sequential_download_from_piece(),
                piece_count,
                first_last,
            )
        } else {
            SaltShaker::random(pieces.len(), piece_count, first_last, rng)
        };

        pieces
            .iter()
            .enumerate()
            .filter_map(|(nth, &piece)| {
                let missing = mediator.count_missing_blocks(piece);
                if missing == 0 {
                    return None;
                }
                let replication = if sequential {
                    0
                } else {
                    mediator.count_piece_replication(piece)
                };
                Some(Candidate {
                    piece,
                    missing,
                    priority: mediator.priority(piece),
                    replication,
                    salt: salts.salt(nth, piece),
                })
            })
            .collect()
    }
}

/// Compress sorted block indices into maximal contiguous spans.
pub fn make_spans(sorted_blocks: &[BlockIndex]) -> Vec<BlockSpan> {
    let mut spans: Vec<BlockSpan> = Vec::new();

    for &block in sorted_blocks {
        match spans.last_mut() {
            Some(span) if span.end == block => span.end += 1,
            Some(span) if span.contains(block) => {}
            _ => spans.push(BlockSpan::new(block, block + 1)),
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::Priority, observable::Observer};
    use hashbrown::{HashMap, HashSet};
    use rand::{rngs::StdRng, SeedableRng};

    #[derive(Default)]
    struct MockMediator {
        spans: Vec<BlockSpan>,
        client_blocks: HashSet<BlockIndex>,
        wanted: HashSet<PieceIndex>,
        priority: HashMap<PieceIndex, Priority>,
        replication: HashMap<PieceIndex, usize>,
        active: HashMap<BlockIndex, usize>,
        endgame: bool,
        sequential: bool,
        sequential_from: PieceIndex,
        first_last: bool,
        events: MediatorEvents,
    }

    impl MockMediator {
        /// Consecutive pieces of the given sizes in blocks, all wanted.
        fn with_pieces(sizes: &[usize]) -> Self {
            let mut spans = Vec::new();
            let mut begin = 0;
            for size in sizes {
                spans.push(BlockSpan::new(begin, begin + size));
                begin += size;
            }
            Self {
                wanted: (0..sizes.len()).collect(),
                spans,
                ..Default::default()
            }
        }
    }

    impl Mediator for MockMediator {
        fn client_has_block(&self, block: BlockIndex) -> bool {
            self.client_blocks.contains(&block)
        }
        fn client_has_piece(&self, piece: PieceIndex) -> bool {
            self.count_missing_blocks(piece) == 0
        }
        fn client_wants_piece(&self, piece: PieceIndex) -> bool {
            self.wanted.contains(&piece)
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
            self.replication.get(&piece).copied().unwrap_or(1)
        }
        fn count_missing_blocks(&self, piece: PieceIndex) -> usize {
            self.block_span(piece)
                .iter()
                .filter(|b| !self.client_blocks.contains(b))
                .count()
        }
        fn count_active_requests(&self, block: BlockIndex) -> usize {
            self.active.get(&block).copied().unwrap_or(0)
        }
        fn block_span(&self, piece: PieceIndex) -> BlockSpan {
            self.spans.get(piece).copied().unwrap_or_default()
        }
        fn piece_count(&self) -> usize {
            self.spans.len()
        }
        fn priority(&self, piece: PieceIndex) -> Priority {
            self.priority.get(&piece).copied().unwrap_or_default()
        }
        fn is_endgame(&self) -> bool {
            self.endgame
        }
        fn observe_piece_completed(
            &self,
            o: Observer<PieceIndex>,
        ) -> Subscription {
            self.events.piece_completed.observe(o)
        }
        fn observe_got_block(&self, o: Observer<BlockIndex>) -> Subscription {
            self.events.got_block.observe(o)
        }
        fn observe_got_bitfield(&self, o: Observer<Bitfield>) -> Subscription {
            self.events.got_bitfield.observe(o)
        }
        fn observe_got_have(&self, o: Observer<PieceIndex>) -> Subscription {
            self.events.got_have.observe(o)
        }
        fn observe_got_have_all(&self, o: Observer<()>) -> Subscription {
            self.events.got_have_all.observe(o)
        }
        fn observe_peer_disconnect(
            &self,
            o: Observer<PeerDisconnect>,
        ) -> Subscription {
            self.events.peer_disconnect.observe(o)
        }
        fn observe_got_reject(&self, o: Observer<BlockIndex>) -> Subscription {
            self.events.got_reject.observe(o)
        }
        fn observe_sent_cancel(&self, o: Observer<BlockIndex>) -> Subscription {
            self.events.sent_cancel.observe(o)
        }
        fn observe_priority_changed(
            &self,
            o: Observer<PieceIndex>,
        ) -> Subscription {
            self.events.priority_changed.observe(o)
        }
        fn observe_sequential_download_changed(
            &self,
            o: Observer<bool>,
        ) -> Subscription {
            self.events.sequential_download_changed.observe(o)
        }
    }

    fn count_blocks(spans: &[BlockSpan]) -> usize {
        spans.iter().map(|s| s.len()).sum()
    }

    fn any_peer(_: PieceIndex) -> bool {
        true
    }

    fn never_requested(_: BlockIndex) -> bool {
        false
    }

    #[test]
    fn does_not_request_unwanted_pieces() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 50]);
        mediator.wanted = [0].into_iter().collect();
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 1000, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 100)]);
    }

    #[test]
    fn respects_the_peer_have_set() {
        let mediator = MockMediator::with_pieces(&[100, 100, 50]);
        let wishlist = Wishlist::new(&mediator);

        let spans =
            wishlist.next(&mediator, 1000, |p| p == 1, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(100, 200)]);
    }

    #[test]
    fn does_not_request_blocks_we_have() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 50]);
        mediator.client_blocks = (0..150).collect();
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 1000, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(150, 250)]);
    }

    #[test]
    fn no_duplicate_requests_to_the_same_peer() {
        let mediator = MockMediator::with_pieces(&[100, 100, 50]);
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 1000, any_peer, |b| b < 10);
        assert_eq!(spans, vec![BlockSpan::new(10, 250)]);

        // even in endgame
        let mut mediator = MockMediator::with_pieces(&[100, 100, 50]);
        mediator.endgame = true;
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 1000, any_peer, |b| b < 10);
        assert!(spans.iter().all(|s| s.begin >= 10));
    }

    #[test]
    fn endgame_allows_a_second_requester() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 50]);
        mediator.active.extend((0..5).map(|b| (b, 1)));
        mediator.active.extend((5..10).map(|b| (b, 2)));

        mediator.endgame = true;
        let wishlist = Wishlist::new(&mediator);
        let spans = wishlist.next(&mediator, 1000, any_peer, never_requested);
        assert_eq!(
            spans,
            vec![BlockSpan::new(0, 5), BlockSpan::new(10, 250)]
        );

        mediator.endgame = false;
        let spans = wishlist.next(&mediator, 1000, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(10, 250)]);
    }

    #[test]
    fn quota_is_respected() {
        let mediator = MockMediator::with_pieces(&[100, 100, 50]);
        let wishlist = Wishlist::new(&mediator);

        for n in [1, 10, 99, 101, 249] {
            let spans = wishlist.next(&mediator, n, any_peer, never_requested);
            assert_eq!(count_blocks(&spans), n);
        }

        let spans = wishlist.next(&mediator, 10_000, any_peer, never_requested);
        assert_eq!(count_blocks(&spans), 250);
    }

    #[test]
    fn zero_wanted_blocks() {
        let mediator = MockMediator::with_pieces(&[10]);
        let wishlist = Wishlist::new(&mediator);
        let spans = wishlist.next(&mediator, 0, any_peer, never_requested);
        assert!(spans.is_empty());
    }

    #[test]
    fn high_priority_pieces_first() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 100]);
        mediator.priority.insert(1, Priority::High);
        let wishlist = Wishlist::new(&mediator);

        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let spans = wishlist.next_with_rng(
                &mediator,
                10,
                any_peer,
                never_requested,
                &mut rng,
            );
            assert_eq!(spans, vec![BlockSpan::new(100, 110)]);
        }
    }

    #[test]
    fn pieces_closest_to_completion_first() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 100]);
        // piece 1 only misses 50 blocks
        mediator.client_blocks = (100..150).collect();
        mediator.priority.insert(2, Priority::High);
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 10, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(150, 160)]);
    }

    #[test]
    fn rarest_pieces_first() {
        let mut mediator = MockMediator::with_pieces(&[10, 10, 10]);
        mediator.replication.insert(0, 5);
        mediator.replication.insert(1, 5);
        mediator.replication.insert(2, 1);
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 10, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(20, 30)]);

        // replication does not matter in sequential mode
        mediator.sequential = true;
        let spans = wishlist.next(&mediator, 10, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 10)]);
    }

    #[test]
    fn random_salt_varies_between_calls() {
        let mediator = MockMediator::with_pieces(&[10, 10, 10]);
        let wishlist = Wishlist::new(&mediator);

        let firsts: HashSet<BlockIndex> = (0..50)
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                let spans = wishlist.next_with_rng(
                    &mediator,
                    1,
                    any_peer,
                    never_requested,
                    &mut rng,
                );
                spans[0].begin
            })
            .collect();

        assert!(firsts.len() > 1);
    }

    #[test]
    fn sequential_download() {
        let mut mediator = MockMediator::with_pieces(&[100, 100, 100]);
        mediator.sequential = true;
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 150, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 150)]);

        mediator.sequential_from = 1;
        let spans = wishlist.next(&mediator, 150, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(100, 250)]);

        mediator.sequential_from = 2;
        let spans = wishlist.next(&mediator, 150, any_peer, never_requested);
        assert_eq!(
            spans,
            vec![BlockSpan::new(0, 50), BlockSpan::new(200, 300)]
        );
    }

    #[test]
    fn first_and_last_pieces_first() {
        let mut mediator = MockMediator::with_pieces(&[10, 10, 10, 10]);
        mediator.sequential = true;
        mediator.first_last = true;
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 20, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 10), BlockSpan::new(30, 40)]);

        let spans = wishlist.next(&mediator, 30, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 20), BlockSpan::new(30, 40)]);
    }

    #[test]
    fn walks_past_the_sorted_candidates() {
        // 40 pieces of one block, the 30 best ones are not on the peer
        let mut mediator = MockMediator::with_pieces(&[1; 40]);
        for piece in 0..30 {
            mediator.priority.insert(piece, Priority::High);
        }
        for piece in 35..40 {
            mediator.priority.insert(piece, Priority::Low);
        }
        let wishlist = Wishlist::new(&mediator);

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let spans = wishlist.next_with_rng(
                &mediator,
                5,
                |p| p >= 30,
                never_requested,
                &mut rng,
            );
            assert_eq!(spans, vec![BlockSpan::new(30, 35)]);
        }
    }

    #[test]
    fn wanted_pieces_follow_priority_changes() {
        let mut mediator = MockMediator::with_pieces(&[10, 10, 10]);
        mediator.wanted = [0].into_iter().collect();
        let wishlist = Wishlist::new(&mediator);

        let spans = wishlist.next(&mediator, 100, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 10)]);

        // the list of wanted pieces is kept until an event says otherwise
        mediator.wanted.insert(2);
        let spans = wishlist.next(&mediator, 100, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 10)]);

        mediator.events.priority_changed.emit(&2);
        let spans = wishlist.next(&mediator, 100, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(0, 10), BlockSpan::new(20, 30)]);

        mediator.wanted.remove(&0);
        mediator.events.sequential_download_changed.emit(&false);
        let spans = wishlist.next(&mediator, 100, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(20, 30)]);
    }

    #[test]
    fn completed_pieces_are_pruned() {
        let mut mediator = MockMediator::with_pieces(&[10, 10]);
        let wishlist = Wishlist::new(&mediator);
        wishlist.next(&mediator, 1, any_peer, never_requested);

        mediator.client_blocks = (0..10).collect();
        mediator.events.piece_completed.emit(&0);

        let wanted = wishlist.wanted.borrow().clone();
        assert_eq!(wanted, Some(vec![1]));

        let spans = wishlist.next(&mediator, 100, any_peer, never_requested);
        assert_eq!(spans, vec![BlockSpan::new(10, 20)]);
    }

    #[test]
    fn dropping_the_wishlist_unsubscribes() {
        let mediator = MockMediator::with_pieces(&[10]);
        let wishlist = Wishlist::new(&mediator);
        assert_eq!(mediator.events.priority_changed.len(), 1);
        assert_eq!(mediator.events.piece_completed.len(), 1);

        drop(wishlist);
        assert!(mediator.events.priority_changed.is_empty());
        assert!(mediator.events.piece_completed.is_empty());
        mediator.events.piece_completed.emit(&0);
    }

    #[test]
    fn spans_are_maximal() {
        assert!(make_spans(&[]).is_empty());
        assert_eq!(make_spans(&[4]), vec![BlockSpan::new(4, 5)]);
        assert_eq!(
            make_spans(&[1, 2, 3, 7, 8, 10]),
            vec![
                BlockSpan::new(1, 4),
                BlockSpan::new(7, 9),
                BlockSpan::new(10, 11)
            ]
        );
    }
}
