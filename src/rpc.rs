//! K-RPC engine: one UDP socket, one receive loop, many concurrent callers.

mod config;
pub mod server;
mod socket;
mod transactions;

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::common::{
    transaction_id, Arguments, Id, Message, MessageType, RequestSpecific, RoutingTable,
};
use crate::Result;

pub use config::Config;
pub use server::Tokens;
pub use socket::{KrpcSocket, SendMessageError, DEFAULT_PORT};
pub use transactions::{PendingQuery, Transactions, MAX_TRANSACTIONS_CAPACITY};

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default number of transaction slots.
pub const DEFAULT_TRANSACTIONS_CAPACITY: usize = 1024;
/// Default socket read timeout of the receive loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
/// Outcome of a request that didn't get a response.
pub enum QueryError {
    /// The deadline passed before a response arrived.
    #[error("Request timed out")]
    Timeout,

    /// The request was cancelled: its transaction slot was reused, or the node stopped.
    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    /// Failed to send the request.
    Send(#[from] SendMessageError),

    /// The response arrived but doesn't have the expected fields.
    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),
}

/// Handle to the K-RPC engine. Cheap to clone and share between threads.
#[derive(Debug, Clone)]
pub struct Rpc {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: Id,
    socket: KrpcSocket,
    transactions: Arc<Mutex<Transactions>>,
    routing_table: Mutex<RoutingTable>,
    tokens: Tokens,
    request_timeout: Duration,

    running: AtomicBool,
    /// Handle to the receive loop thread.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Rpc {
    /// Bind the socket. Nothing is received until [Self::start] is called.
    pub fn new(config: Config) -> Result<Self> {
        let id = config.id.unwrap_or_else(Id::random);
        let socket = KrpcSocket::new(&config)?;

        info!(?id, address = ?socket.local_addr(), "Rpc socket bound");

        Ok(Rpc {
            inner: Arc::new(Inner {
                id,
                socket,
                transactions: Arc::new(Mutex::new(Transactions::new(
                    config.transactions_capacity,
                ))),
                routing_table: Mutex::new(RoutingTable::with_bucket_count(
                    id,
                    config.bucket_count,
                )),
                tokens: Tokens::new(),
                request_timeout: config.request_timeout,
                running: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        })
    }

    // === Getters ===

    /// Returns the [Id] of this node.
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// Returns the address the server is listening to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.socket.local_addr()
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Returns a clone of the routing_table.
    pub fn routing_table(&self) -> RoutingTable {
        self.inner.routing_table.lock().clone()
    }

    /// Returns `true` while the receive loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of transaction slots, the most requests that can be inflight at once.
    pub fn transactions_capacity(&self) -> usize {
        self.inner.transactions.lock().capacity()
    }

    /// Number of requests waiting for a response.
    pub fn inflight(&self) -> usize {
        self.inner.transactions.lock().pending()
    }

    // === Public Methods ===

    /// Add addresses with unknown ids to the routing table, returns how many were new.
    pub fn add_candidates(&self, addresses: &[SocketAddrV4]) -> usize {
        let mut routing_table = self.inner.routing_table.lock();

        addresses
            .iter()
            .filter(|address| routing_table.add_candidate(**address))
            .count()
    }

    /// Spawn the receive loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let inner = self.inner.clone();

        let handle = thread::Builder::new()
            .name("mainline-node-rpc".to_string())
            .spawn(move || inner.run())
            .map_err(|error| {
                self.inner.running.store(false, Ordering::Release);
                error
            })?;

        *self.inner.handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop the receive loop and cancel every inflight request.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        self.inner.transactions.lock().clear();

        debug!(address = ?self.local_addr(), "Rpc stopped");
    }

    /// Send a request and return a handle to wait for its response.
    ///
    /// Our id is added to the `id` field of the arguments.
    pub fn request(
        &self,
        address: SocketAddrV4,
        method: &str,
        mut arguments: Arguments,
    ) -> std::result::Result<PendingQuery, QueryError> {
        let (tid, seq, receiver) = self.inner.transactions.lock().allocate(address);
        let pending = PendingQuery::new(tid, seq, receiver, self.inner.transactions.clone());

        arguments.insert_bytes("id", self.inner.id.to_vec());

        let message = Message {
            transaction_id: tid.to_be_bytes().to_vec(),
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                method: method.to_string(),
                arguments,
            }),
        };

        // Dropping `pending` on failure frees the slot.
        self.inner.socket.send(address, message)?;

        Ok(pending)
    }

    /// Send a request and block until its response, cancellation, or `deadline`.
    ///
    /// No retries, a lost packet is a [QueryError::Timeout].
    pub fn query(
        &self,
        address: SocketAddrV4,
        method: &str,
        arguments: Arguments,
        deadline: Instant,
    ) -> std::result::Result<Arguments, QueryError> {
        self.request(address, method, arguments)?.wait(deadline)
    }
}

impl Inner {
    fn run(&self) {
        debug!(address = ?self.socket.local_addr(), "Receive loop started");

        while self.running.load(Ordering::Acquire) {
            if let Some((message, from)) = self.socket.recv_from() {
                self.handle_message(message, from);
            }
        }
    }

    /// Answer queries and deliver responses to their waiting requests.
    ///
    /// The routing table is updated for queries carrying an id, and for responses
    /// that matched a waiting request from the queried address. Unmatched responses
    /// and error messages never touch the table.
    fn handle_message(&self, message: Message, from: SocketAddrV4) {
        let author_id = message.get_author_id();

        match message.message_type {
            MessageType::Request(request) => {
                if let Some(id) = author_id {
                    self.routing_table.lock().update(id, from, true);
                }

                let Some(reply) =
                    server::handle_request(&self.routing_table, &self.tokens, from, &request)
                else {
                    return;
                };

                let reply = match reply {
                    MessageType::Response(mut result) => {
                        result.insert_bytes("id", self.id.to_vec());
                        MessageType::Response(result)
                    }
                    other => other,
                };

                let _ = self
                    .socket
                    .send(
                        from,
                        Message {
                            transaction_id: message.transaction_id,
                            version: None,
                            message_type: reply,
                        },
                    )
                    .map_err(|e| {
                        debug!(?e, "Error sending response message");
                    });
            }
            MessageType::Response(result) => {
                let tid = match transaction_id(&message.transaction_id) {
                    Ok(tid) => tid,
                    Err(error) => {
                        trace!(context = "socket_validation", ?error, ?from);
                        return;
                    }
                };

                let delivered = {
                    let mut transactions = self.transactions.lock();

                    if !transactions.in_range(tid) {
                        trace!(
                            context = "socket_validation",
                            tid,
                            ?from,
                            "Transaction id out of range"
                        );
                        return;
                    }

                    transactions.resolve(tid, from, result)
                };

                if !delivered {
                    trace!(
                        context = "socket_validation",
                        tid,
                        ?from,
                        message = "Unexpected response id"
                    );
                    return;
                }

                if let Some(id) = author_id {
                    self.routing_table.lock().update(id, from, false);
                }
            }
            MessageType::Error(error) => {
                trace!(context = "socket_validation", ?error, ?from, "Ignoring error message");
            }
        }
    }
}
