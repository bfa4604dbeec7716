use std::{net::SocketAddrV4, time::Duration};

use crate::common::{Id, DEFAULT_BUCKET_COUNT};

use super::{DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TRANSACTIONS_CAPACITY};

#[derive(Debug, Clone)]
/// Rpc configurations
pub struct Config {
    /// Explicit address to listen on.
    ///
    /// Defaults to None, where we try `0.0.0.0:6881` and fall back to a random port.
    pub address: Option<SocketAddrV4>,
    /// Node id, usually restored from a [crate::persistence::Snapshot].
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Timeout used by requests that don't take an explicit deadline.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Number of transaction slots for inflight requests, at most `65536`.
    ///
    /// Once more requests than this are inflight, the oldest one sharing a slot
    /// is cancelled.
    ///
    /// Defaults to [DEFAULT_TRANSACTIONS_CAPACITY]
    pub transactions_capacity: usize,
    /// Number of routing table buckets.
    ///
    /// Defaults to [DEFAULT_BUCKET_COUNT]
    pub bucket_count: usize,
    /// How long the receive loop blocks on the socket before checking for shutdown.
    ///
    /// Defaults to [DEFAULT_POLL_INTERVAL]
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transactions_capacity: DEFAULT_TRANSACTIONS_CAPACITY,
            bucket_count: DEFAULT_BUCKET_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Default config bound to `address`.
    pub fn with_address(address: SocketAddrV4) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }
}
