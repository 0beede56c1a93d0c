// Eviction only reclaims unreferenced sealed objects.
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use shmstore::api::{Client, ConnectOptions, ErrorKind, ObjectId, Store, StoreOptions};

fn init_store(capacity: u64) -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    Store::create(&dir, StoreOptions::new(capacity)).expect("create store");
    (temp, dir)
}

fn id(tag: u8) -> ObjectId {
    ObjectId::new([tag; 20])
}

#[test]
fn referenced_objects_survive_eviction() {
    let (_temp, dir) = init_store(4096);
    let owner = Client::connect_dir(&dir).expect("owner");
    let reader = Client::connect_dir(&dir).expect("reader");
    owner.put(&id(1), &[1; 100], b"").expect("put");
    owner.put(&id(2), &[2; 100], b"").expect("put");

    let held = reader.get(&[id(1)], 0).expect("get");
    assert!(held[0].is_some());

    let freed = owner.evict(1_000).expect("evict");
    assert_eq!(freed, 100);
    assert!(owner.contains(&id(1)).expect("contains"));
    assert!(!owner.contains(&id(2)).expect("contains"));

    reader.release(&id(1)).expect("release");
    assert_eq!(owner.evict(1_000).expect("evict"), 100);
    assert!(!owner.contains(&id(1)).expect("contains"));
}

#[test]
fn creator_reference_pins_until_released() {
    let (_temp, dir) = init_store(4096);
    let client = Client::connect_dir(&dir).expect("connect");
    let mut writer = client.create(&id(3), 10, b"").expect("create");
    writer.write_all(&[3; 10]).expect("write");
    writer.seal().expect("seal");

    assert_eq!(client.evict(10).expect("evict"), 0);
    client.release(&id(3)).expect("release");
    assert_eq!(client.evict(10).expect("evict"), 10);
}

#[test]
fn oldest_sealed_objects_go_first() {
    let (_temp, dir) = init_store(4096);
    let client = Client::connect_dir(&dir).expect("connect");
    client.put(&id(9), &[0; 50], b"").expect("put older");
    thread::sleep(Duration::from_millis(5));
    client.put(&id(1), &[0; 50], b"").expect("put newer");

    assert_eq!(client.evict(1).expect("evict"), 50);
    assert!(!client.contains(&id(9)).expect("contains"));
    assert!(client.contains(&id(1)).expect("contains"));
}

#[test]
fn create_evicts_to_make_room() {
    let (_temp, dir) = init_store(256);
    let client = Client::connect_dir(&dir).expect("connect");
    client.put(&id(1), &[1; 200], b"").expect("put");

    client.put(&id(2), &[2; 100], b"").expect("put after eviction");
    assert!(!client.contains(&id(1)).expect("contains"));
    assert_eq!(client.info().expect("info").used_bytes, 100);
}

#[test]
fn store_full_when_everything_is_referenced() {
    let (_temp, dir) = init_store(256);
    let owner = Client::connect_dir(&dir).expect("owner");
    let reader = Client::connect_dir(&dir).expect("reader");
    owner.put(&id(1), &[1; 200], b"").expect("put");
    let _held = reader.get(&[id(1)], 0).expect("get");

    let err = owner.create(&id(2), 100, b"").expect_err("full");
    assert_eq!(err.kind(), ErrorKind::StoreFull);
    assert_eq!(err.object(), Some(&id(2)));

    let err = owner.create(&id(3), 300, b"").expect_err("larger than capacity");
    assert_eq!(err.kind(), ErrorKind::StoreFull);
}

#[test]
fn parked_releases_do_not_pin_objects() {
    let (_temp, dir) = init_store(4096);
    let options = ConnectOptions::new(&dir).with_release_delay(4);
    let client = Client::connect(options).expect("connect");
    client.put(&id(5), &[5; 64], b"").expect("put");
    let buffers = client.get(&[id(5)], 0).expect("get");
    drop(buffers);
    client.release(&id(5)).expect("release");

    assert_eq!(client.evict(64).expect("evict"), 64);
    assert!(client.get(&[id(5)], 0).expect("get")[0].is_none());
}

#[test]
fn evict_zero_is_a_no_op() {
    let (_temp, dir) = init_store(4096);
    let client = Client::connect_dir(&dir).expect("connect");
    client.put(&id(6), b"keep", b"").expect("put");
    assert_eq!(client.evict(0).expect("evict"), 0);
    assert!(client.contains(&id(6)).expect("contains"));
}
