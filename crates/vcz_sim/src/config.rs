//! Configuration file and CLI flags.
//!
//! The flags override the file, which is created with the default values
//! the first time the simulator runs.
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::warn;
use vcz_wishlist::{BlockLayout, BLOCK_LEN};

use crate::{args::Args, error::Error};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub piece_count: usize,
    pub piece_size: u32,
    pub block_size: u32,

    pub peers: usize,
    /// Fraction of the peers that have every piece, there is always at
    /// least one seeder.
    pub seeder_ratio: f64,
    pub request_queue_len: usize,
    pub request_timeout_secs: u64,
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,

    pub tick_ms: u64,
    pub max_ticks: u64,

    pub sequential: bool,
    pub sequential_from: usize,
    pub first_last: bool,

    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            piece_count: 256,
            piece_size: 16 * BLOCK_LEN,
            block_size: BLOCK_LEN,
            peers: 20,
            seeder_ratio: 0.1,
            request_queue_len: 16,
            request_timeout_secs: 10,
            latency_min_ms: 20,
            latency_max_ms: 400,
            tick_ms: 50,
            max_ticks: 100_000,
            sequential: false,
            sequential_from: 0,
            first_last: false,
            seed: None,
        }
    }
}

impl Config {
    /// Path of the config file in the user's config folder.
    pub async fn default_path() -> Result<PathBuf, Error> {
        // errors if the user does not have a home folder
        let dotfile =
            ProjectDirs::from("", "", "Vincenzo").ok_or(Error::HomeInvalid)?;
        let config_dir = dotfile.config_dir().to_path_buf();

        if !config_dir.exists() {
            create_dir_all(&config_dir).await.map_err(|_| {
                Error::FolderOpenError(config_dir.display().to_string())
            })?;
        }

        Ok(config_dir.join("vczsim.toml"))
    }

    /// Load the configuration at `path`, or at [`Self::default_path`].
    ///
    /// If the file does not exist, is empty, or is not a valid config, it
    /// is overwritten with the default configuration.
    pub async fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path().await?,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match toml::from_str::<Config>(&dst) {
            Ok(config) if !dst.trim().is_empty() => Ok(config),
            r => {
                if let Err(e) = r {
                    warn!(?path, "invalid config file, writing defaults: {e}");
                }
                let config = Config::default();
                let config_str = toml::to_string(&config)?;

                file.set_len(0).await?;
                file.rewind().await?;
                file.write_all(config_str.as_bytes()).await?;
                file.flush().await?;

                Ok(config)
            }
        }
    }

    /// Apply the CLI flags on top of the file.
    pub fn merge(mut self, args: &Args) -> Self {
        if let Some(v) = args.pieces {
            self.piece_count = v;
        }
        if let Some(v) = args.piece_size {
            self.piece_size = v;
        }
        if let Some(v) = args.block_size {
            self.block_size = v;
        }
        if let Some(v) = args.peers {
            self.peers = v;
        }
        if let Some(v) = args.queue_len {
            self.request_queue_len = v;
        }
        if let Some(v) = args.timeout {
            self.request_timeout_secs = v;
        }
        if let Some(v) = args.latency_min {
            self.latency_min_ms = v;
        }
        if let Some(v) = args.latency_max {
            self.latency_max_ms = v;
        }
        if let Some(v) = args.tick {
            self.tick_ms = v;
        }
        if let Some(v) = args.seeders {
            self.seeder_ratio = v;
        }
        if let Some(v) = args.from_piece {
            self.sequential_from = v;
        }
        if let Some(v) = args.max_ticks {
            self.max_ticks = v;
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        self.sequential |= args.sequential;
        self.first_last |= args.first_last;
        self
    }

    /// Check the values that the layout does not, and build the layout of
    /// the simulated torrent.
    pub fn validate(&self) -> Result<BlockLayout, Error> {
        if self.peers == 0 {
            return Err(Error::ConfigError(
                "there must be at least 1 peer".into(),
            ));
        }
        if self.request_queue_len == 0 {
            return Err(Error::ConfigError(
                "request_queue_len must be larger than zero".into(),
            ));
        }
        if self.tick_ms == 0 {
            return Err(Error::ConfigError(
                "tick_ms must be larger than zero".into(),
            ));
        }
        if self.latency_min_ms > self.latency_max_ms {
            return Err(Error::ConfigError(format!(
                "latency_min_ms `{}` is larger than latency_max_ms `{}`",
                self.latency_min_ms, self.latency_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.seeder_ratio) {
            return Err(Error::ConfigError(format!(
                "seeder_ratio `{}` is not between 0 and 1",
                self.seeder_ratio
            )));
        }
        if self.sequential_from >= self.piece_count.max(1) {
            return Err(Error::ConfigError(format!(
                "sequential_from `{}` is not a piece of the torrent",
                self.sequential_from
            )));
        }

        let total_size = self.piece_count as u64 * self.piece_size as u64;
        Ok(BlockLayout::with_block_size(
            total_size,
            self.piece_size,
            self.block_size,
        )?)
    }
}
