//! Ranking of the pieces that can be requested.
use std::cmp::{Ordering, Reverse};

use rand::{seq::SliceRandom, Rng};

use crate::block::{PieceIndex, Priority};

/// A piece that we still want, scored for one call of
/// [`Wishlist::next`](super::Wishlist::next).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub piece: PieceIndex,
    pub missing: usize,
    pub priority: Priority,
    /// Always zero in sequential mode.
    pub replication: usize,
    pub salt: usize,
}

impl Candidate {
    fn key(&self) -> (usize, Reverse<Priority>, usize, usize, PieceIndex) {
        (
            self.missing,
            Reverse(self.priority),
            self.replication,
            self.salt,
            self.piece,
        )
    }
}

impl Ord for Candidate {
    /// Closest to completion first, then highest priority, then the rarest,
    /// then the salt.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Hands out the tie-break salts of one selection.
#[derive(Debug)]
pub(crate) enum SaltShaker {
    /// The distance from the piece where the sequential download starts,
    /// wrapping around at the end of the torrent.
    Sequential { from: PieceIndex, piece_count: usize, first_last: bool },

    /// A shuffle of `[0, n)`, one value per candidate.
    Random { salts: Vec<usize>, piece_count: usize, first_last: bool },
}

impl SaltShaker {
    pub fn sequential(
        from: PieceIndex,
        piece_count: usize,
        first_last: bool,
    ) -> Self {
        Self::Sequential { from, piece_count, first_last }
    }

    pub fn random<R: Rng + ?Sized>(
        n: usize,
        piece_count: usize,
        first_last: bool,
        rng: &mut R,
    ) -> Self {
        let mut salts: Vec<usize> = (0..n).collect();
        salts.shuffle(rng);
        Self::Random { salts, piece_count, first_last }
    }

    /// The salt of the `nth` candidate, which is `piece`.
    pub fn salt(&self, nth: usize, piece: PieceIndex) -> usize {
        let (base, piece_count, first_last) = match self {
            Self::Sequential { from, piece_count, first_last } => {
                let n = (*piece_count).max(1);
                ((piece + n - from % n) % n, *piece_count, *first_last)
            }
            Self::Random { salts, piece_count, first_last } => {
                let salt = salts.get(nth).copied().unwrap_or(nth);
                (salt, *piece_count, *first_last)
            }
        };

        if !first_last {
            return base;
        }
        if piece == 0 {
            0
        } else if piece + 1 == piece_count {
            1
        } else {
            base + 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn candidate(missing: usize, priority: Priority, salt: usize) -> Candidate {
        Candidate { piece: salt, missing, priority, replication: 0, salt }
    }

    #[test]
    fn fewer_missing_blocks_first() {
        let a = candidate(1, Priority::Low, 9);
        let b = candidate(2, Priority::High, 0);
        assert!(a < b);
    }

    #[test]
    fn higher_priority_first() {
        let a = candidate(5, Priority::High, 9);
        let b = candidate(5, Priority::Normal, 0);
        assert!(a < b);
    }

    #[test]
    fn rarer_pieces_before_salt() {
        let mut a = candidate(5, Priority::Normal, 9);
        let mut b = candidate(5, Priority::Normal, 0);
        a.replication = 1;
        b.replication = 3;
        assert!(a < b);

        b.replication = 1;
        assert!(b < a);
    }

    #[test]
    fn sequential_salts_wrap_around() {
        let shaker = SaltShaker::sequential(0, 5, false);
        let salts: Vec<_> = (0..5).map(|p| shaker.salt(p, p)).collect();
        assert_eq!(salts, vec![0, 1, 2, 3, 4]);

        let shaker = SaltShaker::sequential(3, 5, false);
        let salts: Vec<_> = (0..5).map(|p| shaker.salt(p, p)).collect();
        assert_eq!(salts, vec![2, 3, 4, 0, 1]);
    }

    #[test]
    fn first_and_last_pieces_get_lowest_salts() {
        let shaker = SaltShaker::sequential(2, 5, true);
        let salts: Vec<_> = (0..5).map(|p| shaker.salt(p, p)).collect();
        assert_eq!(salts, vec![0, 6, 2, 3, 1]);
    }

    #[test]
    fn random_salts_are_unique() {
        let mut rng = StdRng::seed_from_u64(1);
        let shaker = SaltShaker::random(100, 100, false, &mut rng);

        let mut salts: Vec<_> = (0..100).map(|i| shaker.salt(i, i)).collect();
        salts.sort();
        assert_eq!(salts, (0..100).collect::<Vec<_>>());
    }
}
