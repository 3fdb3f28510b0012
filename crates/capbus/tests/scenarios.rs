//! End-to-end scenarios against the public bus surface.
//!
//! These walk the full request path: flag decoding, transaction staging and
//! commit across skewed clocks, the receive pre-flight, reset, and the
//! idempotent disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use capbus::{
    Bus, BusError, PeerId, SendFlags, SendRequest, Timestamp, Transaction, CONNECT_FLAG_CLIENT,
    CONNECT_FLAG_QUERY, CONNECT_FLAG_RESET, OFFSET_INVALID, RECV_FLAG_PEEK,
};

fn connected_pair(bus: &Bus) -> (PeerId, PeerId) {
    let a = bus.create_peer();
    let b = bus.create_peer();
    bus.connect(a, CONNECT_FLAG_CLIENT, 4096).unwrap();
    bus.connect(b, CONNECT_FLAG_CLIENT, 4096).unwrap();
    (a, b)
}

fn send_bytes(bus: &Bus, from: PeerId, to: PeerId, bytes: &[u8]) {
    let report = bus
        .send(
            from,
            &SendRequest {
                destinations: &[to],
                flags: 0,
                vecs: &[bytes],
                handles: &[],
                descriptors: &[],
            },
        )
        .unwrap();
    assert!(report.all_ok(), "send failed: {report:?}");
}

#[test]
fn simple_unicast_delivery() {
    // One 8-byte vector from A to B: offset 0, size 8, no descriptors,
    // and the queue is dry afterwards.
    let bus = Bus::new();
    let (a, b) = connected_pair(&bus);

    send_bytes(&bus, a, b, b"payload!");

    let msg = bus.recv(b, 0).unwrap();
    assert_eq!(msg.offset, 0);
    assert_eq!(msg.size, 8);
    assert_eq!(msg.n_fds, 0);
    assert_eq!(msg.n_handles, 0);
    assert!(!msg.dropped);
    assert_eq!(msg.sender, a);
    assert_eq!(bus.read_slice(b, msg.offset, msg.size).unwrap(), b"payload!");

    assert_eq!(bus.recv(b, 0), Err(BusError::WouldBlock));

    bus.slice_release(b, msg.offset).unwrap();
    assert!(matches!(
        bus.slice_release(b, msg.offset),
        Err(BusError::InvalidArgument { .. })
    ));
}

#[test]
fn multicast_orders_above_every_destination_clock() {
    // Destination clocks at 10, 20 and 4; one multicast must commit at 22
    // everywhere and tick every clock to at least that, and a later solo
    // send lands at 24 or above.
    let bus = Bus::new();
    let sender = bus.create_peer();
    bus.connect(sender, CONNECT_FLAG_CLIENT, 4096).unwrap();

    let dests: Vec<PeerId> = (0..3)
        .map(|_| {
            let id = bus.create_peer();
            bus.connect(id, CONNECT_FLAG_CLIENT, 4096).unwrap();
            id
        })
        .collect();
    for (id, clock) in dests.iter().zip([10_u64, 20, 4]) {
        let peer = bus.peer(*id).unwrap();
        let peer_ref = peer.acquire().unwrap();
        peer_ref
            .info()
            .queue()
            .sync_clock(Timestamp::new(clock).unwrap())
            .unwrap();
    }

    let report = bus
        .send(
            sender,
            &SendRequest {
                destinations: &dests,
                flags: 0,
                vecs: &[b"fanout"],
                handles: &[],
                descriptors: &[],
            },
        )
        .unwrap();
    assert!(report.all_ok());

    for id in &dests {
        let msg = bus.recv(*id, 0).unwrap();
        assert_eq!(msg.size, 6);
        let peer = bus.peer(*id).unwrap();
        let peer_ref = peer.acquire().unwrap();
        assert!(
            peer_ref.info().queue().current_clock().get() >= 22,
            "every destination clock reaches the shared commit timestamp"
        );
    }

    send_bytes(&bus, sender, dests[0], b"solo");
    let peer = bus.peer(dests[0]).unwrap();
    let peer_ref = peer.acquire().unwrap();
    assert!(peer_ref.info().queue().current_clock().get() >= 24);
}

#[test]
fn stager_blocks_the_front_until_it_commits() {
    // A staged entry with the smallest stamp hides a later committed entry;
    // once its transaction commits, delivery order is commit-stamp order.
    let bus = Bus::new();
    let (sender, a) = connected_pair(&bus);
    let a_peer = bus.peer(a).unwrap();

    let mut pending = Transaction::new(sender, SendFlags::default());
    pending
        .instantiate(&a_peer, &[b"late"], &[], &[], true)
        .unwrap();

    // An unstaged commit from another transaction lands at stamp 2, but
    // the stager at stamp 1 keeps the queue unreadable.
    send_bytes(&bus, sender, a, b"early");
    assert_eq!(bus.recv(a, 0), Err(BusError::WouldBlock));

    let results = pending.commit();
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let first = bus.recv(a, 0).unwrap();
    let second = bus.recv(a, 0).unwrap();
    assert_eq!(first.size, 5, "unstaged commit at 2 delivers first");
    assert_eq!(second.size, 4, "staged entry commits at 4 and follows");
    assert_eq!(bus.recv(a, 0), Err(BusError::WouldBlock));
}

#[test]
fn teardown_flush_invalidates_live_stagers() {
    // Peer A holds a committed entry and a staged entry, then disconnects.
    // The committed entry goes to cleanup, the staged entry is unlinked in
    // place, and the straggling transaction delivers nothing.
    let bus = Bus::new();
    let (sender, a) = connected_pair(&bus);
    let a_peer = bus.peer(a).unwrap();

    send_bytes(&bus, sender, a, b"committed");

    let mut straggler = Transaction::new(sender, SendFlags::default());
    straggler
        .instantiate(&a_peer, &[b"staged"], &[], &[], true)
        .unwrap();

    bus.disconnect(a).unwrap();

    let results = straggler.commit();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, Err(BusError::Shutdown));

    assert_eq!(bus.recv(a, 0), Err(BusError::Shutdown));
}

#[test]
fn reset_flush_invalidates_live_stagers() {
    // Same flush split driven through connect(RESET): the peer keeps its
    // identity, the stager is cancelled.
    let bus = Bus::new();
    let (sender, a) = connected_pair(&bus);
    let a_peer = bus.peer(a).unwrap();

    send_bytes(&bus, sender, a, b"committed");

    let mut straggler = Transaction::new(sender, SendFlags::default());
    straggler
        .instantiate(&a_peer, &[b"staged"], &[], &[], true)
        .unwrap();

    assert_eq!(bus.connect(a, CONNECT_FLAG_RESET, 0), Ok(4096));

    let results = straggler.commit();
    assert_eq!(results[0].1, Err(BusError::Shutdown));
    assert_eq!(bus.recv(a, 0), Err(BusError::WouldBlock));

    // The peer is fully usable afterwards.
    send_bytes(&bus, sender, a, b"fresh");
    let msg = bus.recv(a, 0).unwrap();
    assert_eq!(msg.offset, 0, "reset pool hands out offset 0 again");
}

#[test]
fn reset_preserves_identity_and_pool_size() {
    // Connect with 8192, receive two messages, reset: queue and pool are
    // empty, query still reports 8192, and fresh slices start at offset 0.
    let bus = Bus::new();
    let sender = bus.create_peer();
    let p = bus.create_peer();
    bus.connect(sender, CONNECT_FLAG_CLIENT, 4096).unwrap();
    bus.connect(p, CONNECT_FLAG_CLIENT, 8192).unwrap();

    send_bytes(&bus, sender, p, b"one");
    send_bytes(&bus, sender, p, b"two");
    let first = bus.recv(p, 0).unwrap();
    let second = bus.recv(p, 0).unwrap();
    assert_ne!(first.offset, second.offset);

    assert_eq!(bus.connect(p, CONNECT_FLAG_RESET, 0), Ok(8192));
    assert_eq!(bus.connect(p, CONNECT_FLAG_QUERY, 0), Ok(8192));
    assert_eq!(bus.recv(p, 0), Err(BusError::WouldBlock));

    send_bytes(&bus, sender, p, b"three");
    let fresh = bus.recv(p, 0).unwrap();
    assert_eq!(fresh.offset, 0);
}

#[test]
fn peek_returns_the_same_slice_until_dequeued() {
    let bus = Bus::new();
    let (a, b) = connected_pair(&bus);
    send_bytes(&bus, a, b, b"peekable");

    let peek1 = bus.recv(b, RECV_FLAG_PEEK).unwrap();
    let peek2 = bus.recv(b, RECV_FLAG_PEEK).unwrap();
    assert_eq!(peek1, peek2);
    assert_eq!(peek1.size, 8);

    let taken = bus.recv(b, 0).unwrap();
    assert_eq!(taken.offset, peek1.offset);
    assert_eq!(bus.recv(b, RECV_FLAG_PEEK), Err(BusError::WouldBlock));
}

#[test]
fn descriptors_survive_the_reservation_retry_loop() {
    // Two receivers race for messages with different descriptor counts, so
    // some recv observes a stale pre-flight hint and has to re-reserve
    // under the lock. Every delivered tail must still resolve.
    let bus = Arc::new(Bus::new());
    let (sender, dest) = connected_pair(&bus);

    const ROUNDS: usize = 50;
    for round in 0..ROUNDS {
        let n_fds = if round % 2 == 0 { 3 } else { 5 };
        let fds: Vec<u32> = (0..n_fds as u32).map(|i| 100 + i).collect();
        let report = bus
            .send(
                sender,
                &SendRequest {
                    destinations: &[dest],
                    flags: 0,
                    vecs: &[b"fd"],
                    handles: &[],
                    descriptors: &fds,
                },
            )
            .unwrap();
        assert!(report.all_ok());
    }

    let received = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for _ in 0..2 {
        let bus = Arc::clone(&bus);
        let received = Arc::clone(&received);
        readers.push(thread::spawn(move || {
            loop {
                match bus.recv(dest, 0) {
                    Ok(msg) => {
                        assert!(msg.n_fds == 3 || msg.n_fds == 5);
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(BusError::WouldBlock) => {
                        if received.load(Ordering::SeqCst) >= ROUNDS {
                            break;
                        }
                        thread::yield_now();
                    }
                    Err(other) => panic!("unexpected recv error: {other}"),
                }
            }
        }));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(received.load(Ordering::SeqCst), ROUNDS);
}

#[test]
fn blocking_reader_wakes_on_delivery() {
    let bus = Arc::new(Bus::new());
    let (a, b) = connected_pair(&bus);

    let reader = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || {
            bus.wait_readable(b, Duration::from_secs(5)).unwrap();
            bus.recv(b, 0).unwrap()
        })
    };

    thread::sleep(Duration::from_millis(10));
    send_bytes(&bus, a, b, b"wakeup");
    let msg = reader.join().unwrap();
    assert_eq!(msg.size, 6);
}

#[test]
fn concurrent_disconnect_has_one_winner() {
    let bus = Arc::new(Bus::new());
    let (_, target) = connected_pair(&bus);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let bus = Arc::clone(&bus);
        workers.push(thread::spawn(move || bus.disconnect(target)));
    }
    let outcomes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .filter(|o| o.is_err())
            .all(|o| *o == Err(BusError::Shutdown))
    );
    // All callers returned only after teardown.
    assert_eq!(bus.recv(target, 0), Err(BusError::Shutdown));
}

#[test]
fn multicast_with_duplicate_destination_delivers_both_parts() {
    // The same destination named twice in one send produces two entries
    // committed at one timestamp on one queue, the multi-part case the
    // continuation marker describes.
    let bus = Bus::new();
    let (sender, dest) = connected_pair(&bus);

    let report = bus
        .send(
            sender,
            &SendRequest {
                destinations: &[dest, dest],
                flags: 0,
                vecs: &[b"part"],
                handles: &[],
                descriptors: &[],
            },
        )
        .unwrap();
    assert!(report.all_ok());

    let dest_peer = bus.peer(dest).unwrap();
    let peer_ref = dest_peer.acquire().unwrap();
    let (_, continuation) = peer_ref.info().queue().peek().unwrap();
    assert!(continuation, "first part announces the second");

    let first = bus.recv(dest, 0).unwrap();
    let second = bus.recv(dest, 0).unwrap();
    assert_eq!(first.size, 4);
    assert_eq!(second.size, 4);
    assert_ne!(first.offset, second.offset);
    assert_eq!(bus.recv(dest, 0), Err(BusError::WouldBlock));
}

#[test]
fn sends_race_receivers_without_losing_messages() {
    // Stress: four senders multicast to two receivers while both drain
    // their queues. Every sent message arrives exactly once per receiver.
    let bus = Arc::new(Bus::new());
    let sender_ids: Vec<PeerId> = (0..4)
        .map(|_| {
            let id = bus.create_peer();
            bus.connect(id, CONNECT_FLAG_CLIENT, 4096).unwrap();
            id
        })
        .collect();
    let recv_ids: Vec<PeerId> = (0..2)
        .map(|_| {
            let id = bus.create_peer();
            bus.connect(id, CONNECT_FLAG_CLIENT, 1 << 20).unwrap();
            id
        })
        .collect();

    const PER_SENDER: usize = 25;
    let mut senders = Vec::new();
    for id in &sender_ids {
        let bus = Arc::clone(&bus);
        let id = *id;
        let dests = recv_ids.clone();
        senders.push(thread::spawn(move || {
            for _ in 0..PER_SENDER {
                let report = bus
                    .send(
                        id,
                        &SendRequest {
                            destinations: &dests,
                            flags: 0,
                            vecs: &[b"stress"],
                            handles: &[],
                            descriptors: &[],
                        },
                    )
                    .unwrap();
                assert!(report.all_ok());
            }
        }));
    }

    let expected = sender_ids.len() * PER_SENDER;
    let mut readers = Vec::new();
    for id in &recv_ids {
        let bus = Arc::clone(&bus);
        let id = *id;
        readers.push(thread::spawn(move || {
            let mut got = 0_usize;
            while got < expected {
                match bus.recv(id, 0) {
                    Ok(msg) => {
                        assert_eq!(msg.size, 6);
                        bus.slice_release(id, msg.offset).unwrap();
                        got += 1;
                    }
                    Err(BusError::WouldBlock) => {
                        let _ = bus.wait_readable(id, Duration::from_millis(50));
                    }
                    Err(other) => panic!("unexpected recv error: {other}"),
                }
            }
            assert_eq!(bus.recv(id, 0), Err(BusError::WouldBlock));
        }));
    }

    for worker in senders {
        worker.join().unwrap();
    }
    for worker in readers {
        worker.join().unwrap();
    }
}

#[test]
fn notice_reports_sender_after_drop() {
    // With a one-slot descriptor table, the first delivery fills the table
    // and the second message's reservation fails: it is dropped, never
    // re-queued, and a notice naming the original sender replaces it.
    let bus = Bus::with_config(capbus::BusConfig {
        quota: capbus::QuotaLimits {
            max_descriptors: 1,
            ..capbus::QuotaLimits::default()
        },
    });
    let (sender, dest) = connected_pair(&bus);

    let send_with_fd = |fd: u32| {
        let report = bus
            .send(
                sender,
                &SendRequest {
                    destinations: &[dest],
                    flags: 0,
                    vecs: &[b"fds"],
                    handles: &[],
                    descriptors: &[fd],
                },
            )
            .unwrap();
        assert!(report.all_ok());
    };

    send_with_fd(41);
    let first = bus.recv(dest, 0).unwrap();
    assert_eq!(first.n_fds, 1);
    // The installed descriptor resolves to the transferred value and keeps
    // its table slot occupied.
    let tail = bus.read_slice(dest, first.offset, first.size).unwrap();
    let number = u32::from_le_bytes(tail[tail.len() - 4..].try_into().unwrap());
    assert_eq!(bus.descriptor_value(dest, number).unwrap(), Some(41));

    send_with_fd(42);
    assert_eq!(bus.recv(dest, 0), Err(BusError::OutOfMemory));
    let notice = bus.recv(dest, 0).unwrap();
    assert!(notice.dropped);
    assert_eq!(notice.sender, sender);
    assert_eq!(notice.offset, OFFSET_INVALID);
    assert_eq!(bus.recv(dest, 0), Err(BusError::WouldBlock));
}

#[test]
fn silent_flag_reaches_the_receiver() {
    let bus = Bus::new();
    let (a, b) = connected_pair(&bus);
    let report = bus
        .send(
            a,
            &SendRequest {
                destinations: &[b],
                flags: capbus::SEND_FLAG_SILENT,
                vecs: &[b"sh"],
                handles: &[],
                descriptors: &[],
            },
        )
        .unwrap();
    assert!(report.all_ok());
    let msg = bus.recv(b, 0).unwrap();
    assert!(msg.silent);
}

#[test]
fn recv_flag_validation() {
    let bus = Bus::new();
    let (_, b) = connected_pair(&bus);
    assert!(matches!(
        bus.recv(b, 1 << 7),
        Err(BusError::InvalidFlags { .. })
    ));
    assert_eq!(
        bus.recv(b, RECV_FLAG_PEEK),
        Err(BusError::WouldBlock),
        "peek on an empty queue would block"
    );
}
