//! Two cores exchanging datagrams directly: discovery, then a complete file transfer
//! with acknowledgments, out-of-order chunks, loss and rejection.

use std::net::SocketAddr;
use std::path::PathBuf;

use tempfile::TempDir;

use lsnp_core::{
    decode_envelope, encode_envelope, field, CoreConfig, CoreEvent, Destination, Disposition,
    LocalProfile, LsnpCore, MessageKind, OutboundAction, UserId,
};

struct Node {
    core: LsnpCore,
    addr: SocketAddr,
    downloads: PathBuf,
    _dir: TempDir,
}

fn node(name: &str, ip: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let downloads = dir.path().join("downloads");
    let config = CoreConfig {
        chunk_size: 5,
        download_dir: downloads.clone(),
        ..CoreConfig::default()
    };
    Node {
        core: LsnpCore::new(LocalProfile::new(UserId::new(name, ip), name), config),
        addr: format!("{ip}:50999").parse().unwrap(),
        downloads,
        _dir: dir,
    }
}

/// Feed every `Send` in `actions` to `to` as if it came from `from`.
fn deliver(to: &mut Node, from: &Node, actions: Vec<OutboundAction>) -> Vec<OutboundAction> {
    let mut out = Vec::new();
    for action in actions {
        if let OutboundAction::Send { bytes, .. } = action {
            out.extend(to.core.on_datagram(&bytes, from.addr));
        }
    }
    out
}

fn events(actions: &[OutboundAction]) -> Vec<&CoreEvent> {
    actions
        .iter()
        .filter_map(|a| match a {
            OutboundAction::Event(e) => Some(e),
            _ => None,
        })
        .collect()
}

fn datagrams(actions: &[OutboundAction]) -> Vec<(Destination, lsnp_core::Envelope)> {
    actions
        .iter()
        .filter_map(|a| match a {
            OutboundAction::Send { to, bytes } => Some((*to, decode_envelope(bytes).unwrap())),
            _ => None,
        })
        .collect()
}

/// Alice and Bob, each knowing the other.
fn discovered_pair() -> (Node, Node) {
    let mut alice = node("alice", "10.0.0.1");
    let mut bob = node("bob", "10.0.0.2");
    let announce = alice.core.announce();
    let replies = deliver(&mut bob, &alice, announce);
    assert!(events(&replies)
        .iter()
        .any(|e| matches!(e, CoreEvent::PeerDiscovered { .. })));
    deliver(&mut alice, &bob, replies);
    assert_eq!(alice.core.peers().resolve_address("bob"), Some(bob.addr));
    assert_eq!(bob.core.peers().resolve_address("alice@10.0.0.1"), Some(alice.addr));
    (alice, bob)
}

fn source_file(contents: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn file_offer_accept_chunks_and_receipt() {
    let (mut alice, mut bob) = discovered_pair();
    let (_src, path) = source_file(b"0123456789");

    let (file_id, offer) = alice.core.offer_file(&path, "bob", "meeting notes").unwrap();
    let at_bob = deliver(&mut bob, &alice, offer);
    match events(&at_bob)[..] {
        [CoreEvent::FileOffered { file_id: id, filename, size, description, .. }] => {
            assert_eq!(id, &file_id);
            assert_eq!(filename, "note.txt");
            assert_eq!(*size, 10);
            assert_eq!(description, "meeting notes");
        }
        ref other => panic!("expected one FileOffered, got {other:?}"),
    }
    let delivered = deliver(&mut alice, &bob, at_bob);
    assert!(matches!(
        events(&delivered)[..],
        [CoreEvent::Delivered { kind: MessageKind::FileOffer, .. }]
    ));

    let accept = bob.core.accept_file(&file_id).unwrap();
    let at_alice = deliver(&mut alice, &bob, accept);
    assert!(at_alice.iter().any(
        |a| matches!(a, OutboundAction::StartChunkStream { file_id: id } if *id == file_id)
    ));
    deliver(&mut bob, &alice, at_alice);

    let first = alice.core.next_chunk(&file_id);
    let second = alice.core.next_chunk(&file_id);
    assert!(alice.core.next_chunk(&file_id).is_empty());

    let chunk = &datagrams(&second)[0].1;
    assert_eq!(chunk.kind(), &MessageKind::FileChunk);
    assert_eq!(chunk.get(field::CHUNK_INDEX), Some("1"));
    assert_eq!(chunk.get(field::TOTAL_CHUNKS), Some("2"));
    assert_eq!(chunk.get(field::CHUNK_SIZE), Some("5"));
    assert!(chunk.message_id().is_none());

    // Second chunk first: nothing happens until the gap is filled.
    assert!(deliver(&mut bob, &alice, second).is_empty());
    let done = deliver(&mut bob, &alice, first);

    let saved = match events(&done)[..] {
        [CoreEvent::FileSaved(saved)] => saved.clone(),
        ref other => panic!("expected FileSaved, got {other:?}"),
    };
    assert_eq!(saved.size, 10);
    assert_eq!(saved.path, bob.downloads.join("note.txt"));
    assert_eq!(std::fs::read(&saved.path).unwrap(), b"0123456789");

    let receipt = datagrams(&done);
    assert_eq!(receipt.len(), 1);
    assert_eq!(receipt[0].0, Destination::Unicast(alice.addr));
    assert_eq!(receipt[0].1.kind(), &MessageKind::FileReceived);
    assert_eq!(receipt[0].1.get(field::STATUS), Some("COMPLETE"));
    assert_eq!(receipt[0].1.get(field::FILEID), Some(file_id.as_str()));

    let at_alice = deliver(&mut alice, &bob, done);
    assert!(events(&at_alice)
        .iter()
        .any(|e| matches!(e, CoreEvent::FileDelivered { file_id: id } if *id == file_id)));
    deliver(&mut bob, &alice, at_alice);

    assert_eq!(alice.core.pending_deliveries(), 0);
    assert_eq!(bob.core.pending_deliveries(), 0);
    assert_eq!(alice.core.transfers().outgoing().count(), 0);
    assert_eq!(bob.core.transfers().incoming().count(), 0);
}

#[test]
fn lost_offer_is_retransmitted() {
    let (mut alice, mut bob) = discovered_pair();
    let (_src, path) = source_file(b"abc");

    let (file_id, offer) = alice.core.offer_file(&path, "bob", "").unwrap();
    let original = datagrams(&offer)[0].1.clone();
    drop(offer);

    let mut retry = Vec::new();
    for _ in 0..4 {
        retry = alice.core.tick();
    }
    assert_eq!(datagrams(&retry)[0].1, original);

    let at_bob = deliver(&mut bob, &alice, retry);
    assert!(bob.core.transfers().incoming_session(&file_id).is_some());
    deliver(&mut alice, &bob, at_bob);
    for _ in 0..20 {
        assert!(alice.core.tick().is_empty());
    }
}

#[test]
fn rejected_offer_stops_sender() {
    let (mut alice, mut bob) = discovered_pair();
    let (_src, path) = source_file(b"0123456789");

    let (file_id, offer) = alice.core.offer_file(&path, "bob", "").unwrap();
    deliver(&mut bob, &alice, offer);
    let reject = bob.core.reject_file(&file_id).unwrap();
    assert_eq!(datagrams(&reject)[0].1.get(field::STATUS), Some("REJECTED"));

    let at_alice = deliver(&mut alice, &bob, reject);
    assert!(events(&at_alice)
        .iter()
        .any(|e| matches!(e, CoreEvent::FileRejected { .. })));
    assert!(alice.core.next_chunk(&file_id).is_empty());
    assert_eq!(alice.core.transfers().outgoing().count(), 0);
}

#[test]
fn tampered_chunk_length_is_dropped() {
    let (mut alice, mut bob) = discovered_pair();
    let (_src, path) = source_file(b"0123456789");

    let (file_id, offer) = alice.core.offer_file(&path, "bob", "").unwrap();
    deliver(&mut bob, &alice, offer);
    let accept = bob.core.accept_file(&file_id).unwrap();
    deliver(&mut alice, &bob, accept);

    let mut chunk = datagrams(&alice.core.next_chunk(&file_id))[0].1.clone();
    chunk.set(field::CHUNK_SIZE, 4);
    let (disposition, actions) = bob
        .core
        .dispatch(&encode_envelope(&chunk).unwrap(), alice.addr);
    assert_eq!(disposition, Disposition::Malformed);
    assert!(actions.is_empty());
    assert_eq!(
        bob.core
            .transfers()
            .incoming_session(&file_id)
            .map(|s| s.received_chunks()),
        Some(0)
    );
}

#[test]
fn accept_settles_offer_whose_acks_were_lost() {
    let (mut alice, mut bob) = discovered_pair();
    let contents: Vec<u8> = (0..100u8).collect();
    let (_src, path) = source_file(&contents);

    let (file_id, offer) = alice.core.offer_file(&path, "bob", "").unwrap();
    // Bob's ACK of the offer never reaches Alice.
    drop(deliver(&mut bob, &alice, offer));
    let accept = bob.core.accept_file(&file_id).unwrap();
    let at_alice = deliver(&mut alice, &bob, accept);
    assert_eq!(alice.core.pending_deliveries(), 0);
    deliver(&mut bob, &alice, at_alice);

    let mut sent = 0;
    let mut saved = None;
    loop {
        let chunk = alice.core.next_chunk(&file_id);
        if chunk.is_empty() {
            break;
        }
        sent += 1;
        assert!(alice.core.tick().is_empty());
        for event in deliver(&mut bob, &alice, chunk) {
            if let OutboundAction::Event(CoreEvent::FileSaved(s)) = event {
                saved = Some(s);
            }
        }
    }
    assert_eq!(sent, 20);
    let saved = saved.expect("file saved");
    assert_eq!(std::fs::read(&saved.path).unwrap(), contents);
}
