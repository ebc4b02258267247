//! A swarm of simulated peers downloading one torrent.
//!
//! Every tick the simulator delivers the blocks whose latency elapsed,
//! cancels the requests that timed out, spreads the free request slots
//! among the peers with [`allocate_block_requests`] and asks the
//! [`Wishlist`] which blocks to request from each of them.
use std::{cell::Cell, fmt, rc::Rc, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vcz_wishlist::{
    allocate_block_requests, AllocatorMediator, Bitfield, BlockIndex,
    Mediator, PieceIndex, Subscription, Swarm, Wishlist,
};

use crate::{config::Config, error::Error, peer::PeerId};

/// Log the progress every this many ticks.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone)]
struct SimPeer {
    id: PeerId,
    seeder: bool,
}

/// A block on its way to us.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: PeerId,
    block: BlockIndex,
    arrives_at: Instant,
}

/// What happened during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub ticks: u64,
    pub elapsed: Duration,
    pub done: bool,
    pub requests_sent: usize,
    pub blocks_received: usize,
    pub duplicates: usize,
    pub cancels: usize,
    pub timeouts: usize,
    pub pieces_completed: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} after {} ticks ({:.2?})",
            if self.done { "Download complete" } else { "Download incomplete" },
            self.ticks,
            self.elapsed,
        )?;
        writeln!(f, "pieces completed: {}", self.pieces_completed)?;
        writeln!(f, "requests sent:    {}", self.requests_sent)?;
        writeln!(f, "blocks received:  {}", self.blocks_received)?;
        writeln!(f, "duplicates:       {}", self.duplicates)?;
        writeln!(f, "cancels:          {}", self.cancels)?;
        write!(f, "timeouts:         {}", self.timeouts)
    }
}

/// The request slots of the peers, as seen by the allocator.
struct RequestSlots<'a> {
    swarm: &'a Swarm<PeerId>,
    peers: &'a [SimPeer],
    queue_len: usize,
}

impl AllocatorMediator for RequestSlots<'_> {
    /// Index in the peer list.
    type Peer = usize;
    /// Each peer has its own queue.
    type Pool = usize;

    fn peers(&self) -> Vec<usize> {
        (0..self.peers.len())
            .filter(|i| {
                self.swarm
                    .peer_pieces(&self.peers[*i].id)
                    .is_some_and(|pieces| !pieces.has_none())
            })
            .collect()
    }

    fn pending_req_count(&self, peer: &usize) -> usize {
        self.swarm.requests().count_peer(&self.peers[*peer].id)
    }

    fn pools(&self, peer: &usize) -> Vec<usize> {
        vec![*peer]
    }

    fn pool_block_limit(&self, _pool: &usize) -> usize {
        self.queue_len
    }
}

pub struct Simulation {
    config: Config,
    swarm: Swarm<PeerId>,
    wishlist: Wishlist,
    peers: Vec<SimPeer>,
    in_flight: Vec<InFlight>,
    rng: StdRng,
    stats: Stats,
    pieces_completed: Rc<Cell<usize>>,
    _subscriptions: Vec<Subscription>,
}

impl Simulation {
    pub fn new(config: Config) -> Result<Self, Error> {
        let layout = config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut swarm = Swarm::new(layout);
        let wishlist = Wishlist::new(&swarm);

        swarm.set_sequential_download(config.sequential);
        swarm.set_sequential_download_from_piece(config.sequential_from)?;
        swarm.set_download_first_last_pieces_first(config.first_last);

        let pieces_completed: Rc<Cell<usize>> = Rc::default();
        let completed = pieces_completed.clone();
        let subscriptions = vec![swarm.observe_piece_completed(Box::new(
            move |_: &PieceIndex| completed.set(completed.get() + 1),
        ))];

        let seeders = ((config.peers as f64 * config.seeder_ratio).round()
            as usize)
            .clamp(1, config.peers);

        let mut peers = Vec::with_capacity(config.peers);
        for i in 0..config.peers {
            let peer = SimPeer {
                id: PeerId::generate(&mut rng),
                seeder: i < seeders,
            };
            swarm.add_peer(peer.id);

            if peer.seeder {
                swarm.peer_have_all(&peer.id)?;
            } else {
                let mut pieces = Bitfield::new(layout.piece_count());
                for piece in 0..layout.piece_count() {
                    if rng.gen_bool(0.5) {
                        pieces.set(piece, true);
                    }
                }
                swarm.peer_bitfield(&peer.id, pieces)?;
            }

            debug!(peer = %peer.id, seeder = peer.seeder, "peer joined");
            peers.push(peer);
        }

        info!(
            pieces = layout.piece_count(),
            blocks = layout.block_count(),
            peers = peers.len(),
            seeders,
            "starting simulation"
        );

        Ok(Self {
            config,
            swarm,
            wishlist,
            peers,
            in_flight: Vec::new(),
            rng,
            stats: Stats::default(),
            pieces_completed,
            _subscriptions: subscriptions,
        })
    }

    pub fn swarm(&self) -> &Swarm<PeerId> {
        &self.swarm
    }

    /// Run until the download is complete or `max_ticks` is reached.
    pub async fn run(&mut self) -> Result<Stats, Error> {
        let started = Instant::now();
        let mut ticker = interval(Duration::from_millis(self.config.tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.swarm.is_done() && self.stats.ticks < self.config.max_ticks
        {
            ticker.tick().await;
            self.tick(Instant::now())?;

            if self.stats.ticks % PROGRESS_EVERY == 0 {
                info!(
                    ticks = self.stats.ticks,
                    pieces = self.swarm.pieces().count(),
                    in_flight = self.in_flight.len(),
                    endgame = self.swarm.is_endgame(),
                    "progress"
                );
            }
        }

        if !self.swarm.is_done() {
            warn!(
                ticks = self.stats.ticks,
                "gave up before the download completed"
            );
        }

        self.stats.elapsed = started.elapsed();
        self.stats.done = self.swarm.is_done();
        self.stats.pieces_completed = self.pieces_completed.get();
        Ok(self.stats.clone())
    }

    /// One scheduling round at `now`.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        self.stats.ticks += 1;
        self.deliver(now)?;
        self.cancel_timed_out(now);
        self.send_requests(now)
    }

    fn deliver(&mut self, now: Instant) -> Result<(), Error> {
        let (mut arrived, waiting): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(&mut self.in_flight)
                .into_iter()
                .partition(|f| f.arrives_at <= now);
        self.in_flight = waiting;
        arrived.sort_by_key(|f| (f.arrives_at, f.block));

        for f in arrived {
            if self.swarm.client_has_block(f.block) {
                self.stats.duplicates += 1;
            } else {
                self.stats.blocks_received += 1;
            }

            let cancels = self.swarm.block_received(&f.peer, f.block)?;
            if !cancels.is_empty() {
                self.stats.cancels += cancels.len();
                // a cancelled request is never answered
                self.in_flight.retain(|g| {
                    g.block != f.block || !cancels.contains(&g.peer)
                });
            }
        }

        Ok(())
    }

    /// Cancel what went unanswered for too long. The peer may still answer,
    /// the block then counts as received or duplicate.
    fn cancel_timed_out(&mut self, now: Instant) {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        if let Some(cutoff) = now.checked_sub(timeout) {
            let stale = self.swarm.cancel_stale(cutoff);
            self.stats.timeouts += stale.len();
        }
    }

    fn send_requests(&mut self, now: Instant) -> Result<(), Error> {
        let slots = RequestSlots {
            swarm: &self.swarm,
            peers: &self.peers,
            queue_len: self.config.request_queue_len,
        };
        let free: usize = slots
            .peers()
            .iter()
            .map(|p| slots.queue_len.saturating_sub(slots.pending_req_count(p)))
            .sum();
        let allocation = allocate_block_requests(&slots, free);

        for (i, n) in allocation {
            let id = self.peers[i].id;
            let spans = self.wishlist.next_with_rng(
                &self.swarm,
                n,
                |piece| self.swarm.peer_has_piece(&id, piece),
                |block| self.swarm.requests().has(block, &id),
                &mut self.rng,
            );

            for span in spans {
                self.stats.requests_sent +=
                    self.swarm.request_sent(&id, span, now)?;
                for block in span {
                    let arrives_at = now + self.latency();
                    self.in_flight.push(InFlight {
                        peer: id,
                        block,
                        arrives_at,
                    });
                }
            }
        }

        Ok(())
    }

    fn latency(&mut self) -> Duration {
        let ms = self
            .rng
            .gen_range(self.config.latency_min_ms..=self.config.latency_max_ms);
        Duration::from_millis(ms)
    }
}
