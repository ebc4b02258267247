//! Simulates a swarm of peers to exercise the block selection of
//! `vcz_wishlist` without touching the network.
pub mod args;
pub mod config;
pub mod error;
pub mod peer;
pub mod sim;
