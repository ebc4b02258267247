use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Default)]
#[clap(name = "Vincenzo Swarm Simulator", author = "Gabriel Lombardo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Read the configuration from this file instead of the one in the
    /// user's config folder.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Log more, -v for debug and -vv for trace.
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// How many pieces the simulated torrent has
    #[clap(long)]
    pub pieces: Option<usize>,

    /// Size of a piece in bytes, a multiple of the block size
    #[clap(long)]
    pub piece_size: Option<u32>,

    /// Size of a block in bytes
    #[clap(long)]
    pub block_size: Option<u32>,

    /// How many peers are in the swarm
    #[clap(short, long)]
    pub peers: Option<usize>,

    /// Max requests waiting for an answer, per peer
    #[clap(short, long)]
    pub queue_len: Option<usize>,

    /// Seconds before an unanswered request is cancelled
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Fastest answer of a peer, in milliseconds
    #[clap(long)]
    pub latency_min: Option<u64>,

    /// Slowest answer of a peer, in milliseconds
    #[clap(long)]
    pub latency_max: Option<u64>,

    /// Milliseconds between two scheduling rounds
    #[clap(long)]
    pub tick: Option<u64>,

    /// Fraction of the peers that have the whole torrent
    #[clap(long)]
    pub seeders: Option<f64>,

    /// Download the pieces in order
    #[clap(short, long)]
    pub sequential: bool,

    /// Piece where the sequential download starts
    #[clap(long)]
    pub from_piece: Option<usize>,

    /// Download the first and last pieces before the others
    #[clap(long)]
    pub first_last: bool,

    /// Give up after this many rounds
    #[clap(long)]
    pub max_ticks: Option<u64>,

    /// Seed of the random generator, for reproducible runs
    #[clap(long)]
    pub seed: Option<u64>,
}
