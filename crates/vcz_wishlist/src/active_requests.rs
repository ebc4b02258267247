//! Bookkeeping of the block requests that are waiting for an answer.
use std::hash::Hash;

use hashbrown::{HashMap, HashSet};
use tokio::time::Instant;

use crate::block::BlockIndex;

/// Which blocks we have asked which peers for, and when.
///
/// A `(block, peer)` pair is stored at most once. The peer is only used as
/// a key, the tracker does not own the peers.
#[derive(Debug, Clone)]
pub struct ActiveRequests<P> {
    /// `block → (peer → sent at)`
    blocks: HashMap<BlockIndex, HashMap<P, Instant>>,

    // reverse index for requests
    // `peer → blocks`
    peers: HashMap<P, HashSet<BlockIndex>>,

    size: usize,
}

impl<P> Default for ActiveRequests<P> {
    fn default() -> Self {
        Self { blocks: HashMap::new(), peers: HashMap::new(), size: 0 }
    }
}

impl<P: Eq + Hash + Clone> ActiveRequests<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `block` was requested from `peer` at `when`.
    /// Returns false if the pair was already recorded.
    pub fn add(&mut self, block: BlockIndex, peer: P, when: Instant) -> bool {
        let requested = self.blocks.entry(block).or_default();
        if requested.contains_key(&peer) {
            return false;
        }

        requested.insert(peer.clone(), when);
        self.peers.entry(peer).or_default().insert(block);
        self.size += 1;

        true
    }

    /// Remove one request. Returns true if the request existed.
    pub fn remove(&mut self, block: BlockIndex, peer: &P) -> bool {
        let Some(requested) = self.blocks.get_mut(&block) else {
            return false;
        };
        if requested.remove(peer).is_none() {
            return false;
        }
        if requested.is_empty() {
            self.blocks.remove(&block);
        }

        if let Some(blocks) = self.peers.get_mut(peer) {
            blocks.remove(&block);
            if blocks.is_empty() {
                self.peers.remove(peer);
            }
        }

        self.size -= 1;
        true
    }

    /// Remove all the requests sent to `peer`, returning the blocks that
    /// were requested from it, in ascending order.
    pub fn remove_peer(&mut self, peer: &P) -> Vec<BlockIndex> {
        let Some(blocks) = self.peers.remove(peer) else {
            return Vec::new();
        };

        let mut blocks: Vec<BlockIndex> = blocks.into_iter().collect();
        blocks.sort_unstable();

        for block in &blocks {
            if let Some(requested) = self.blocks.get_mut(block) {
                requested.remove(peer);
                if requested.is_empty() {
                    self.blocks.remove(block);
                }
            }
        }

        self.size -= blocks.len();
        blocks
    }

    /// Remove all the requests of `block`, returning the peers that had it
    /// requested.
    pub fn remove_block(&mut self, block: BlockIndex) -> Vec<P> {
        let Some(requested) = self.blocks.remove(&block) else {
            return Vec::new();
        };

        let peers: Vec<P> = requested.into_keys().collect();

        for peer in &peers {
            if let Some(blocks) = self.peers.get_mut(peer) {
                blocks.remove(&block);
                if blocks.is_empty() {
                    self.peers.remove(peer);
                }
            }
        }

        self.size -= peers.len();
        peers
    }

    pub fn has(&self, block: BlockIndex, peer: &P) -> bool {
        self.blocks.get(&block).is_some_and(|v| v.contains_key(peer))
    }

    /// When `block` was requested from `peer`, if it was.
    pub fn sent_at(&self, block: BlockIndex, peer: &P) -> Option<Instant> {
        self.blocks.get(&block).and_then(|v| v.get(peer)).copied()
    }

    /// How many peers are being asked for `block`.
    pub fn count_block(&self, block: BlockIndex) -> usize {
        self.blocks.get(&block).map_or(0, |v| v.len())
    }

    /// How many requests `peer` has not answered yet.
    pub fn count_peer(&self, peer: &P) -> usize {
        self.peers.get(peer).map_or(0, |v| v.len())
    }

    /// The blocks requested from `peer`, in no particular order.
    pub fn blocks_of(&self, peer: &P) -> impl Iterator<Item = BlockIndex> + '_ {
        self.peers.get(peer).into_iter().flat_map(|v| v.iter().copied())
    }

    /// Total number of outstanding requests.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// All the requests sent before `cutoff`, ordered by block.
    pub fn sent_before(&self, cutoff: Instant) -> Vec<(BlockIndex, P)> {
        let mut timed_out: Vec<(BlockIndex, P)> = self
            .blocks
            .iter()
            .flat_map(|(block, requested)| {
                requested
                    .iter()
                    .filter(|(_, sent_at)| **sent_at < cutoff)
                    .map(|(peer, _)| (*block, peer.clone()))
            })
            .collect();

        timed_out.sort_by_key(|(block, _)| *block);
        timed_out
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.peers.clear();
        self.size = 0;
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let by_block: usize = self.blocks.values().map(|v| v.len()).sum();
        let by_peer: usize = self.peers.values().map(|v| v.len()).sum();
        let no_empty = self.blocks.values().all(|v| !v.is_empty())
            && self.peers.values().all(|v| !v.is_empty());
        by_block == self.size && by_peer == self.size && no_empty
    }
}
