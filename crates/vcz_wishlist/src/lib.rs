//! Piece and block selection for BitTorrent downloads.
//!
//! This is the scheduler of the Vincenzo client, the part that decides
//! which block to request next from which peer. It is made of a few
//! building blocks that can be used on their own:
//!
//! * [`Bitfield`]: a bit vector that does not allocate when it is full or
//!   empty, used for "pieces a peer has" or "blocks we have".
//! * [`ActiveRequests`]: which blocks were requested from which peers, and
//!   when.
//! * [`Wishlist`]: the block selector, it reads the torrent state through
//!   a [`Mediator`].
//! * [`Swarm`]: a [`Mediator`] that holds the state of one torrent and is
//!   updated with the messages of the peers.
//! * [`allocate_block_requests`]: how many requests to send to each peer.
//!
//! Everything here is synchronous and meant to be owned by the task that
//! manages the torrent.
//!
//! [`Swarm`] and [`Wishlist`] share their event callbacks through `Rc`, so
//! they are not `Send`. Keep them on one thread, for example in a task
//! started with `tokio::task::spawn_local` on a `LocalSet`, and talk to
//! that task through channels.
//!
//! # Example
//!
//! ```
//! use tokio::time::Instant;
//! use vcz_wishlist::{BlockLayout, Swarm, Wishlist};
//!
//! // 16 pieces of 64 KiB, 64 blocks
//! let layout = BlockLayout::new(1 << 20, 1 << 16)?;
//! let mut swarm = Swarm::new(layout);
//! let wishlist = Wishlist::new(&swarm);
//!
//! swarm.add_peer("seeder");
//! swarm.peer_have_all(&"seeder")?;
//!
//! let spans = wishlist.next(
//!     &swarm,
//!     16,
//!     |piece| swarm.peer_has_piece(&"seeder", piece),
//!     |block| swarm.requests().has(block, &"seeder"),
//! );
//!
//! for span in spans {
//!     swarm.request_sent(&"seeder", span, Instant::now())?;
//! }
//! assert_eq!(swarm.requests().size(), 16);
//! # Ok::<(), vcz_wishlist::Error>(())
//! ```

pub mod active_requests;
pub mod allocator;
pub mod bitfield;
pub mod block;
pub mod error;
pub mod observable;
pub mod swarm;
pub mod wishlist;

pub use active_requests::ActiveRequests;
pub use allocator::{allocate_block_requests, AllocatorMediator};
pub use bitfield::Bitfield;
pub use block::{
    BlockIndex, BlockInfo, BlockLayout, BlockSpan, PieceIndex, Priority,
    BLOCK_LEN,
};
pub use error::Error;
pub use observable::{Observable, Observer, Subscription};
pub use swarm::{Swarm, REQUEST_TTL};
pub use wishlist::{
    make_spans, Mediator, MediatorEvents, PeerDisconnect, Wishlist,
    ENDGAME_MAX_REQUESTERS, MAX_SORTED_PIECES,
};
