//! Chunked file distribution across a swarm of peers coordinated by a
//! central tracker.
//!
//! The tracker ([`directory::DirectoryService`]) records which peers hold
//! which chunks of which files. Peers ([`node::PeerNode`]) split and publish
//! local files, serve stored chunks, and rebuild files by pulling chunks from
//! whichever peers hold them.

pub mod client;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod models;
pub mod network;
pub mod node;
pub mod routers;

pub use error::{Result, SwarmError};
