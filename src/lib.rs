#![doc = include_str!("../README.md")]

// Public modules
mod common;

mod dht;
mod error;
pub mod persistence;
pub mod rpc;

pub use crate::common::{
    bucket_index, distance, messages, Id, KBucket, Node, RoutingTable, DEFAULT_BUCKET_COUNT,
    MAX_BUCKET_SIZE_K, NODE_GOOD_WINDOW,
};
pub use dht::{Dht, GetPeersResponse, MAX_BOOTSTRAP_WORKERS};
pub use error::Error;
pub use persistence::Snapshot;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
