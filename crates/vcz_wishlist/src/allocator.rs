//! Spread a number of block requests among the peers.
//!
//! The peer with the fewest pending requests gets new ones until it has as
//! many as the second fewest, then both get them evenly until they reach
//! the third, and so on. Fast peers answer quickly and so tend to have few
//! pending requests, which means they are rewarded without having to
//! measure their speed. A peer never gets more requests than any of its
//! bandwidth pools allows.
use std::hash::Hash;

use hashbrown::HashMap;

/// What the allocator needs to know about the peers.
pub trait AllocatorMediator {
    type Peer: Clone;
    type Pool: Eq + Hash + Clone;

    /// The peers that we want to download from.
    fn peers(&self) -> Vec<Self::Peer>;

    /// How many requests are waiting for an answer from `peer`.
    fn pending_req_count(&self, peer: &Self::Peer) -> usize;

    /// The bandwidth pools that limit `peer`, there is always at least one.
    fn pools(&self, peer: &Self::Peer) -> Vec<Self::Pool>;

    /// How many blocks `pool` allows right now.
    fn pool_block_limit(&self, pool: &Self::Pool) -> usize;
}

struct Candidate<Peer, Pool> {
    peer: Peer,
    pending: usize,
    allocated: usize,
    pools: Vec<Pool>,
}

/// How many more blocks each pool allows.
struct PoolLimits<Pool> {
    left: HashMap<Pool, usize>,
}

impl<Pool: Eq + Hash + Clone> PoolLimits<Pool> {
    fn new<M>(mediator: &M, candidates: &[Candidate<M::Peer, Pool>]) -> Self
    where
        M: AllocatorMediator<Pool = Pool> + ?Sized,
    {
        let mut left: HashMap<Pool, usize> = HashMap::new();

        for candidate in candidates {
            for pool in &candidate.pools {
                left.entry(pool.clone())
                    .or_insert_with(|| mediator.pool_block_limit(pool));
            }
        }

        // the pending requests already use part of the budget
        for candidate in candidates {
            for pool in &candidate.pools {
                if let Some(left) = left.get_mut(pool) {
                    *left = left.saturating_sub(candidate.pending);
                }
            }
        }

        Self { left }
    }

    fn has_open_slot(&self, pools: &[Pool]) -> bool {
        pools.iter().all(|p| self.left.get(p).is_some_and(|left| *left > 0))
    }

    fn decrement(&mut self, pools: &[Pool]) {
        for pool in pools {
            if let Some(left) = self.left.get_mut(pool) {
                *left = left.saturating_sub(1);
            }
        }
    }
}

/// Distribute `n_reqs` block requests among the peers of `mediator`.
///
/// Returns how many requests each peer gets, fewest pending first. Peers
/// that get nothing are left out.
pub fn allocate_block_requests<M>(
    mediator: &M,
    mut n_reqs: usize,
) -> Vec<(M::Peer, usize)>
where
    M: AllocatorMediator + ?Sized,
{
    let mut candidates: Vec<Candidate<M::Peer, M::Pool>> = mediator
        .peers()
        .into_iter()
        .map(|peer| Candidate {
            pending: mediator.pending_req_count(&peer),
            pools: mediator.pools(&peer),
            allocated: 0,
            peer,
        })
        .collect();

    candidates.sort_by_key(|c| c.pending);

    let mut limits = PoolLimits::new(mediator, &candidates);

    // give one request at a time to every candidate before `pivot` that
    // has less than `target`, until none of them can take more.
    let mut increase_before = |candidates: &mut [Candidate<M::Peer, M::Pool>],
                               pivot: usize,
                               target: usize,
                               n_reqs: &mut usize| {
        loop {
            let mut increased = false;

            for candidate in candidates[..pivot].iter_mut() {
                if *n_reqs > 0
                    && candidate.pending + candidate.allocated < target
                    && limits.has_open_slot(&candidate.pools)
                {
                    *n_reqs -= 1;
                    candidate.allocated += 1;
                    limits.decrement(&candidate.pools);
                    increased = true;
                }
            }

            if !increased {
                return;
            }
        }
    };

    for pivot in 0..candidates.len() {
        let target = candidates[pivot].pending;
        increase_before(candidates.as_mut_slice(), pivot, target, &mut n_reqs);
    }
    let len = candidates.len();
    increase_before(candidates.as_mut_slice(), len, usize::MAX, &mut n_reqs);

    candidates
        .into_iter()
        .filter(|c| c.allocated > 0)
        .map(|c| (c.peer, c.allocated))
        .collect()
}
