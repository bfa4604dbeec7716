//! Snapshot of our id and known addresses, saved between runs.

use std::fs::{self, File};
use std::io::Write;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use crate::common::{bytes_to_peer, peer_to_bytes, Id, RoutingTable};
use crate::Result;

/// Our id and the addresses of the nodes we knew about.
///
/// Node ids, timestamps and health are not saved, restored addresses are
/// [candidates](RoutingTable::candidates) until they are contacted again.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: Id,
    pub nodes: Vec<SocketAddrV4>,
}

const NODE_ID_KEY: &[u8] = b"node-id";
const NODES_KEY: &[u8] = b"nodes";

/// Distinguishes temporary files of concurrent saves within this process.
static SAVE_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default, Serialize)]
struct SnapshotFile {
    #[serde(
        rename = "node-id",
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    id: Option<Vec<u8>>,
    nodes: Vec<ByteBuf>,
}

impl Snapshot {
    /// A fresh random id and no nodes.
    pub fn random() -> Self {
        Self {
            id: Id::random(),
            nodes: Vec::new(),
        }
    }

    /// Our id and every address in the routing table, bucket nodes first.
    pub fn from_routing_table(routing_table: &RoutingTable) -> Self {
        Self {
            id: *routing_table.id(),
            nodes: routing_table.addresses(),
        }
    }

    /// Read a snapshot from `path`.
    ///
    /// Never fails: a missing or unreadable file gives a [random](Self::random) snapshot.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(error) => {
                debug!(
                    context = "persistence",
                    ?path,
                    ?error,
                    "Could not read snapshot, starting fresh"
                );
                Self::random()
            }
        }
    }

    /// Decode a snapshot.
    ///
    /// Each field is read on its own: a missing `node-id`, or one that is not
    /// 20 bytes, is replaced by a random id, and `nodes` entries that are not
    /// 6 bytes compact addresses are skipped. Input that is not a bencode
    /// dictionary gives a [random](Self::random) snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let dict = match serde_bencode::from_bytes::<Value>(bytes) {
            Ok(Value::Dict(dict)) => dict,
            Ok(_) => {
                warn!(
                    context = "persistence",
                    "Snapshot is not a dictionary, starting fresh"
                );
                return Self::random();
            }
            Err(error) => {
                warn!(
                    context = "persistence",
                    ?error,
                    "Corrupt snapshot, starting fresh"
                );
                return Self::random();
            }
        };

        let id = match dict.get(NODE_ID_KEY) {
            Some(Value::Bytes(bytes)) => match Id::from_bytes(bytes) {
                Ok(id) => id,
                Err(error) => {
                    warn!(context = "persistence", ?error, "Invalid node-id, generating a new one");
                    Id::random()
                }
            },
            Some(_) => {
                warn!(context = "persistence", "node-id is not a string, generating a new one");
                Id::random()
            }
            None => {
                debug!(context = "persistence", "Missing node-id, generating a new one");
                Id::random()
            }
        };

        let nodes = match dict.get(NODES_KEY) {
            Some(Value::List(entries)) => entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::Bytes(bytes) => match bytes_to_peer(bytes) {
                        Ok(address) => Some(address),
                        Err(error) => {
                            debug!(context = "persistence", ?error, "Skipping invalid node entry");
                            None
                        }
                    },
                    _ => {
                        debug!(context = "persistence", "Skipping node entry that is not a string");
                        None
                    }
                })
                .collect(),
            Some(_) => {
                warn!(context = "persistence", "nodes is not a list, ignoring it");
                Vec::new()
            }
            None => Vec::new(),
        };

        Self { id, nodes }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = SnapshotFile {
            id: Some(self.id.to_vec()),
            nodes: self
                .nodes
                .iter()
                .map(|address| ByteBuf::from(peer_to_bytes(address).to_vec()))
                .collect(),
        };

        Ok(serde_bencode::to_bytes(&file)?)
    }

    /// Write the snapshot to `path`.
    ///
    /// The bytes go to a temporary file next to `path` that is renamed over it
    /// once fully written, so a failure leaves the previous snapshot intact.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let tmp = temporary_path(path);

        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });

        if let Err(error) = written.and_then(|_| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(error.into());
        }

        debug!(
            context = "persistence",
            ?path,
            nodes = self.nodes.len(),
            "Saved snapshot"
        );

        Ok(())
    }
}

/// A sibling of `path` unique to this call, `<name>.<pid>.<n>.tmp`.
fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(
        ".{}.{}.tmp",
        process::id(),
        SAVE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    fn address(i: u8) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, i].into(), 6881 + i as u16)
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.snapshot");

        let snapshot = Snapshot {
            id: Id::random(),
            nodes: (1..=5).map(address).collect(),
        };

        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path);

        assert_eq!(loaded.id, snapshot.id);
        assert_eq!(
            loaded.nodes.iter().collect::<HashSet<_>>(),
            snapshot.nodes.iter().collect::<HashSet<_>>()
        );
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1, "no temporary file left");
    }

    #[test]
    fn save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.snapshot");

        Snapshot::random().save(&path).unwrap();

        let second = Snapshot {
            id: Id::random(),
            nodes: vec![address(9)],
        };
        second.save(&path).unwrap();

        assert_eq!(Snapshot::load(&path), second);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let snapshot = Snapshot::load(dir.path().join("missing"));

        assert_eq!(snapshot.id.as_bytes().len(), 20);
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.snapshot");
        fs::write(&path, b"d7:node-id20:abc").unwrap();

        let snapshot = Snapshot::load(&path);

        assert_eq!(snapshot.id.as_bytes().len(), 20);
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn wire_format() {
        let snapshot = Snapshot {
            id: Id::from_bytes(b"abcdefghij0123456789").unwrap(),
            nodes: vec![SocketAddrV4::new([127, 0, 0, 1].into(), 6881)],
        };

        assert_eq!(
            snapshot.to_bytes().unwrap(),
            b"d7:node-id20:abcdefghij01234567895:nodesl6:\x7f\x00\x00\x01\x1a\xe1ee".to_vec()
        );
    }

    #[test]
    fn invalid_id_is_replaced() {
        let snapshot = Snapshot::from_bytes(b"d7:node-id3:abc5:nodesl6:\x7f\x00\x00\x01\x1a\xe1ee");

        assert_ne!(snapshot.id.as_bytes(), &[0; 20]);
        assert_eq!(
            snapshot.nodes,
            vec![SocketAddrV4::new([127, 0, 0, 1].into(), 6881)]
        );
    }

    #[test]
    fn missing_id_and_bad_entries() {
        let snapshot = Snapshot::from_bytes(b"d5:nodesl3:abc6:\x0a\x00\x00\x02\x1a\xe3ee");

        assert_eq!(snapshot.id.as_bytes().len(), 20);
        assert_eq!(snapshot.nodes, vec![address(2)]);
    }

    #[test]
    fn from_routing_table() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        table.update(Id::random(), address(1), false);
        table.add_candidate(address(2));

        let snapshot = Snapshot::from_routing_table(&table);

        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.nodes, vec![address(1), address(2)]);
    }

    #[test]
    fn bad_node_entry_keeps_the_id() {
        let snapshot = Snapshot::from_bytes(
            b"d7:node-id20:abcdefghij01234567895:nodesl6:\x7f\x00\x00\x01\x1a\xe1i5e3:abcee",
        );

        assert_eq!(snapshot.id, Id::from_bytes(b"abcdefghij0123456789").unwrap());
        assert_eq!(
            snapshot.nodes,
            vec![SocketAddrV4::new([127, 0, 0, 1].into(), 6881)]
        );
    }

    #[test]
    fn id_of_wrong_type_keeps_the_nodes() {
        let snapshot =
            Snapshot::from_bytes(b"d7:node-idi5e5:nodesl6:\x7f\x00\x00\x01\x1a\xe1ee");

        assert_eq!(snapshot.id.as_bytes().len(), 20);
        assert_eq!(
            snapshot.nodes,
            vec![SocketAddrV4::new([127, 0, 0, 1].into(), 6881)]
        );
    }

    #[test]
    fn nodes_of_wrong_type_keeps_the_id() {
        let snapshot = Snapshot::from_bytes(b"d7:node-id20:abcdefghij01234567895:nodesi3ee");

        assert_eq!(snapshot.id, Id::from_bytes(b"abcdefghij0123456789").unwrap());
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn not_a_dictionary() {
        let snapshot = Snapshot::from_bytes(b"l7:node-ide");

        assert_eq!(snapshot.id.as_bytes().len(), 20);
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn concurrent_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.snapshot");

        let snapshots: Vec<Snapshot> = (1..=8)
            .map(|i| Snapshot {
                id: Id::random(),
                nodes: vec![address(i)],
            })
            .collect();

        std::thread::scope(|scope| {
            for snapshot in &snapshots {
                let path = &path;
                scope.spawn(move || snapshot.save(path).unwrap());
            }
        });

        assert!(snapshots.contains(&Snapshot::load(&path)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1, "no temporary file left");
    }
}
