// Wait semantics: ordering, validation, timeouts and wakeups.
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use shmstore::api::{Client, ErrorKind, MAX_WAIT_TIMEOUT_MS, ObjectId, Store, StoreOptions};

fn init_store() -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    Store::create(&dir, StoreOptions::new(1 << 20)).expect("create store");
    (temp, dir)
}

fn id(tag: u8) -> ObjectId {
    ObjectId::new([tag; 20])
}

#[test]
fn zero_returns_is_immediate() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    let ids = [id(1), id(2)];

    let started = Instant::now();
    let result = client.wait(&ids, 0, -1).expect("wait");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(result.ready.is_empty());
    assert_eq!(result.remaining, ids.to_vec());
}

#[test]
fn invalid_arguments_are_rejected_before_touching_the_store() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");

    let err = client.wait(&[id(1)], 2, 0).expect_err("k > len");
    assert_eq!(err.kind(), ErrorKind::Usage);
    let err = client
        .wait(&[id(1)], 1, MAX_WAIT_TIMEOUT_MS + 1)
        .expect_err("timeout too large");
    assert_eq!(err.kind(), ErrorKind::Usage);

    // Validation wins even on a closed connection.
    client.disconnect().expect("disconnect");
    let err = client.wait(&[id(1)], 2, 0).expect_err("k > len");
    assert_eq!(err.kind(), ErrorKind::Usage);
    let err = client.wait(&[id(1)], 1, 0).expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Connectivity);
}

#[test]
fn ready_ids_keep_input_order() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    let ids = [id(3), id(1), id(2)];
    for object_id in &ids {
        client.put(object_id, b"x", b"").expect("put");
    }

    let result = client.wait(&ids, 2, 0).expect("wait");
    assert_eq!(result.ready, vec![id(3), id(1)]);
    assert_eq!(result.remaining, vec![id(2)]);
}

#[test]
fn partial_readiness_returns_after_timeout() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    let (a, b, c) = (id(0xa), id(0xb), id(0xc));
    client.put(&b, b"only b", b"").expect("put");

    let started = Instant::now();
    let result = client.wait(&[a, b, c], 2, 100).expect("wait");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(result.ready, vec![b]);
    assert_eq!(result.remaining, vec![a, c]);
}

#[test]
fn duplicate_ids_collapse() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    client.put(&id(4), b"x", b"").expect("put");

    let result = client.wait(&[id(4), id(4), id(5)], 1, 0).expect("wait");
    assert_eq!(result.ready, vec![id(4)]);
    assert_eq!(result.remaining, vec![id(5)]);
}

#[test]
fn duplicates_do_not_satisfy_num_returns() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    let (a, b) = (id(0x1a), id(0x1b));
    client.put(&a, b"a", b"").expect("put");

    let started = Instant::now();
    let result = client.wait(&[a, a, b], 2, 150).expect("wait");
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(result.ready, vec![a]);
    assert_eq!(result.remaining, vec![b]);

    // Fewer distinct ids than num_returns: done once all of them are ready.
    let started = Instant::now();
    let result = client.wait(&[a, a], 2, -1).expect("wait");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.ready, vec![a]);
}

#[test]
fn seal_from_another_connection_wakes_waiter() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");
    let target = id(6);

    let writer_dir = dir.clone();
    let handle = thread::spawn(move || {
        let writer = Client::connect_dir(&writer_dir).expect("writer");
        thread::sleep(Duration::from_millis(50));
        writer.put(&target, b"done", b"").expect("put");
    });

    let started = Instant::now();
    let result = client.wait(&[target], 1, 10_000).expect("wait");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.ready, vec![target]);
    assert!(result.remaining.is_empty());
    handle.join().expect("join");
}

#[test]
fn disconnect_unblocks_waiter() {
    let (_temp, dir) = init_store();
    let client = Client::connect_dir(&dir).expect("connect");

    let closer = client.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        closer.disconnect().expect("disconnect");
    });

    let err = client.wait(&[id(7)], 1, -1).expect_err("disconnected");
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    handle.join().expect("join");
}
