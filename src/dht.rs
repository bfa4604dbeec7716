//! Dht node.

use std::net::SocketAddrV4;
use std::path::Path;
use std::thread;
use std::time::Instant;

use serde_bencode::value::Value;
use tracing::{debug, info};

use crate::{
    common::{bytes_to_nodes, bytes_to_peer, Arguments, Id, Node, RoutingTable},
    persistence::Snapshot,
    rpc::{Config, PendingQuery, QueryError, Rpc},
    Result,
};

/// Most threads [Dht::bootstrap] pings candidates from.
pub const MAX_BOOTSTRAP_WORKERS: usize = 16;

/// A Mainline DHT node: the [Rpc] engine plus typed single hop queries.
///
/// Clones share the same socket and routing table. The receive loop keeps
/// running until [Dht::stop] is called.
#[derive(Debug, Clone)]
pub struct Dht {
    rpc: Rpc,
}

impl Dht {
    /// Bind a node with the given [Config], call [Dht::start] to start serving.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Dht {
            rpc: Rpc::new(config)?,
        })
    }

    /// Bind a node with the id from `snapshot`, and its nodes as candidates.
    pub fn with_snapshot(mut config: Config, snapshot: &Snapshot) -> Result<Self> {
        config.id = Some(snapshot.id);

        let dht = Dht::new(config)?;
        let added = dht.rpc.add_candidates(&snapshot.nodes);

        info!(
            context = "persistence",
            id = ?snapshot.id,
            candidates = added,
            "Restored snapshot"
        );

        Ok(dht)
    }

    /// Bind a node restored from the snapshot at `path`, see [Snapshot::load].
    pub fn load<P: AsRef<Path>>(config: Config, path: P) -> Result<Self> {
        Dht::with_snapshot(config, &Snapshot::load(path))
    }

    // === Getters ===

    /// Returns the [Id] of this node.
    pub fn id(&self) -> &Id {
        self.rpc.id()
    }

    /// Returns the address the server is listening to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.rpc.local_addr()
    }

    /// Returns a clone of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.rpc.routing_table()
    }

    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    // === Public Methods ===

    pub fn start(&self) -> Result<()> {
        self.rpc.start()
    }

    /// Stop the receive loop, inflight queries resolve with [QueryError::Cancelled].
    pub fn stop(&self) {
        self.rpc.stop()
    }

    /// Write our id and known addresses to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Snapshot::from_routing_table(&self.rpc.routing_table()).save(path)
    }

    /// See [Rpc::request].
    pub fn request(
        &self,
        address: SocketAddrV4,
        method: &str,
        arguments: Arguments,
    ) -> Result<PendingQuery, QueryError> {
        self.rpc.request(address, method, arguments)
    }

    /// See [Rpc::query].
    pub fn query(
        &self,
        address: SocketAddrV4,
        method: &str,
        arguments: Arguments,
        deadline: Instant,
    ) -> Result<Arguments, QueryError> {
        self.rpc.query(address, method, arguments, deadline)
    }

    /// Ping a node and return its id.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Id, QueryError> {
        let result = self.query_with_timeout(address, "ping", Arguments::new())?;

        responder_id(&result)
    }

    /// Ask a node for the nodes it knows closest to `target`.
    pub fn find_node(&self, address: SocketAddrV4, target: Id) -> Result<Vec<Node>, QueryError> {
        let result = self.query_with_timeout(
            address,
            "find_node",
            Arguments::new().with_bytes("target", target.to_vec()),
        )?;

        compact_nodes(&result)
    }

    /// Ask a node for peers of `info_hash`, and a token to announce to it.
    pub fn get_peers(
        &self,
        address: SocketAddrV4,
        info_hash: Id,
    ) -> Result<GetPeersResponse, QueryError> {
        let result = self.query_with_timeout(
            address,
            "get_peers",
            Arguments::new().with_bytes("info_hash", info_hash.to_vec()),
        )?;

        let values = match result.get("values") {
            None => Vec::new(),
            Some(Value::List(values)) => values
                .iter()
                .filter_map(|value| match value {
                    Value::Bytes(bytes) => bytes_to_peer(bytes).ok(),
                    _ => None,
                })
                .collect(),
            Some(_) => return Err(QueryError::InvalidResponse("values is not a list")),
        };

        Ok(GetPeersResponse {
            responder_id: responder_id(&result)?,
            token: result
                .get_bytes("token")
                .ok_or(QueryError::InvalidResponse("missing token"))?
                .to_vec(),
            nodes: compact_nodes(&result)?,
            values,
        })
    }

    /// Announce that we have peers for `info_hash` on `port`, using a token
    /// from a previous [Dht::get_peers] to the same node.
    pub fn announce_peer(
        &self,
        address: SocketAddrV4,
        info_hash: Id,
        port: u16,
        token: &[u8],
    ) -> Result<(), QueryError> {
        let result = self.query_with_timeout(
            address,
            "announce_peer",
            Arguments::new()
                .with_bytes("info_hash", info_hash.to_vec())
                .with_int("port", port as i64)
                .with_bytes("token", token),
        )?;

        responder_id(&result).map(|_| ())
    }

    /// Ping every address restored without an id, so the ones that answer
    /// get a place in the routing table.
    ///
    /// At most [MAX_BOOTSTRAP_WORKERS] pings are inflight at once, and never more
    /// than the transaction slots, so they don't cancel each other.
    ///
    /// Returns the number of nodes that answered.
    pub fn bootstrap(&self) -> usize {
        let (sender, receiver) = flume::unbounded::<SocketAddrV4>();

        for node in self.rpc.routing_table().candidates() {
            let _ = sender.send(node.address);
        }
        drop(sender);

        let candidates = receiver.len();
        let workers = candidates
            .min(self.rpc.transactions_capacity())
            .min(MAX_BOOTSTRAP_WORKERS);

        let responded = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let receiver = receiver.clone();
                    scope.spawn(move || {
                        receiver
                            .iter()
                            .filter(|address| self.ping(*address).is_ok())
                            .count()
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(0))
                .sum::<usize>()
        });

        debug!(candidates, workers, responded, "Bootstrap finished");

        responded
    }

    // === Private Methods ===

    fn query_with_timeout(
        &self,
        address: SocketAddrV4,
        method: &str,
        arguments: Arguments,
    ) -> Result<Arguments, QueryError> {
        let deadline = Instant::now() + self.rpc.request_timeout();

        self.rpc.query(address, method, arguments, deadline)
    }
}

/// Response to a `get_peers` query.
#[derive(Debug, Clone, PartialEq)]
pub struct GetPeersResponse {
    pub responder_id: Id,
    /// Token to present in a following `announce_peer` to the same node.
    pub token: Vec<u8>,
    /// Closer nodes to the info hash.
    pub nodes: Vec<Node>,
    /// Peers announced for the info hash.
    pub values: Vec<SocketAddrV4>,
}

fn responder_id(result: &Arguments) -> Result<Id, QueryError> {
    result
        .get_id("id")
        .ok_or(QueryError::InvalidResponse("missing or invalid id"))
}

fn compact_nodes(result: &Arguments) -> Result<Vec<Node>, QueryError> {
    match result.get_bytes("nodes") {
        None => Ok(Vec::new()),
        Some(bytes) => {
            bytes_to_nodes(bytes).map_err(|_| QueryError::InvalidResponse("invalid compact nodes"))
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::*;

    fn local() -> Dht {
        let dht = Dht::new(Config::with_address("127.0.0.1:0".parse().unwrap())).unwrap();
        dht.start().unwrap();
        dht
    }

    #[test]
    fn ping() {
        let a = local();
        let b = local();

        assert_eq!(a.ping(b.local_addr()).unwrap(), *b.id());

        a.stop();
        b.stop();
    }

    #[test]
    fn find_node() {
        let server = local();
        let client = local();

        let others: Vec<Dht> = (0..3).map(|_| local()).collect();
        for other in &others {
            other.ping(server.local_addr()).unwrap();
        }

        let nodes = client.find_node(server.local_addr(), Id::random()).unwrap();

        // The find_node query itself placed the client.
        assert_eq!(nodes.len(), 4);
        for node in &nodes {
            assert!(others
                .iter()
                .chain([&client])
                .any(|other| Some(other.id()) == node.id()));
        }

        for dht in others.iter().chain([&server, &client]) {
            dht.stop();
        }
    }

    #[test]
    fn get_peers_then_announce() {
        let server = local();
        let client = local();
        let info_hash = Id::random();

        let response = client.get_peers(server.local_addr(), info_hash).unwrap();

        assert_eq!(response.responder_id, *server.id());
        assert!(response.values.is_empty());

        client
            .announce_peer(server.local_addr(), info_hash, 6882, &response.token)
            .unwrap();

        server.stop();
        client.stop();
    }

    #[test]
    fn bootstrap_places_candidates() {
        let alive = local();
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let silent_address = match silent.local_addr().unwrap() {
            std::net::SocketAddr::V4(address) => address,
            _ => unreachable!(),
        };

        let mut config = Config::with_address("127.0.0.1:0".parse().unwrap());
        config.request_timeout = Duration::from_millis(200);

        let snapshot = Snapshot {
            id: Id::random(),
            nodes: vec![alive.local_addr(), silent_address],
        };

        let dht = Dht::with_snapshot(config, &snapshot).unwrap();
        dht.start().unwrap();

        assert_eq!(dht.id(), &snapshot.id);
        assert_eq!(dht.routing_table().candidates().len(), 2);

        assert_eq!(dht.bootstrap(), 1);

        let table = dht.routing_table();
        assert_eq!(table.size(), 1);
        assert_eq!(table.nodes().next().unwrap().id, Some(*alive.id()));
        assert_eq!(table.candidates().len(), 1);
        assert_eq!(table.candidates()[0].address, silent_address);

        dht.stop();
        alive.stop();
    }

    #[test]
    fn bootstrap_within_transactions_capacity() {
        let alive: Vec<Dht> = (0..6).map(|_| local()).collect();

        let mut config = Config::with_address("127.0.0.1:0".parse().unwrap());
        config.transactions_capacity = 2;

        let snapshot = Snapshot {
            id: Id::random(),
            nodes: alive.iter().map(|dht| dht.local_addr()).collect(),
        };

        let dht = Dht::with_snapshot(config, &snapshot).unwrap();
        dht.start().unwrap();

        assert_eq!(dht.bootstrap(), 6);
        assert_eq!(dht.routing_table().size(), 6);
        assert!(dht.routing_table().candidates().is_empty());

        dht.stop();
        for dht in alive {
            dht.stop();
        }
    }
}
