use std::collections::HashSet;
use std::fs;

use mainline_node::rpc::Config;
use mainline_node::{Dht, Snapshot};

fn local_config() -> Config {
    Config::with_address("127.0.0.1:0".parse().unwrap())
}

#[test]
fn restart_with_same_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.snapshot");

    let peers: Vec<Dht> = (0..3)
        .map(|_| {
            let dht = Dht::new(local_config()).unwrap();
            dht.start().unwrap();
            dht
        })
        .collect();

    let dht = Dht::load(local_config(), &path).unwrap();
    dht.start().unwrap();

    for peer in &peers {
        dht.ping(peer.local_addr()).unwrap();
    }

    dht.save(&path).unwrap();
    dht.stop();

    let restored = Dht::load(local_config(), &path).unwrap();

    assert_eq!(restored.id(), dht.id());

    let table = restored.routing_table();
    assert!(table.is_empty());
    assert_eq!(
        table
            .candidates()
            .iter()
            .map(|node| node.address)
            .collect::<HashSet<_>>(),
        peers
            .iter()
            .map(|peer| peer.local_addr())
            .collect::<HashSet<_>>()
    );

    restored.start().unwrap();
    assert_eq!(restored.bootstrap(), 3);
    assert_eq!(restored.routing_table().size(), 3);
    assert!(restored.routing_table().candidates().is_empty());

    restored.stop();
    for peer in peers {
        peer.stop();
    }
}

#[test]
fn corrupt_snapshot_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.snapshot");
    fs::write(&path, b"this is not bencode").unwrap();

    let dht = Dht::load(local_config(), &path).unwrap();

    assert_eq!(dht.id().as_bytes().len(), 20);
    assert!(dht.routing_table().is_empty());
    assert!(dht.routing_table().candidates().is_empty());

    // Saving replaces the corrupt file.
    dht.save(&path).unwrap();
    assert_eq!(Snapshot::load(&path).id, *dht.id());
}
