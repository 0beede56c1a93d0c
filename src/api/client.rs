//! Purpose: Connection handle and per-connection object lifecycle bookkeeping.
//! Exports: `Client`, `ConnectOptions`, `ConnectionState`, `StoreInfo`, `ObjectDigest`.
//! Role: Every store round trip goes through here: create, seal, get, release, delete, evict.
//! Invariants: Operations on a `Closed` connection fail fast with `Connectivity`.
//! Invariants: Reference counts are per connection; every acquisition holds a segment flock.
//! Invariants: Lock order is store lock, then the reference table; never the reverse.
#![allow(clippy::result_large_err)]

use super::buffer::{ObjectBuffer, ObjectWriter};
use super::peer::PeerClient;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::events::{self, EventKind};
use crate::core::evict::{EvictionCandidate, plan_eviction};
use crate::core::notify::Notifier;
use crate::core::object_id::ObjectId;
use crate::core::segment::{self, SegmentHeader};
use crate::core::store::{Store, StoreLock, now_ns};
use crate::store_paths::default_store_dir;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub type ApiResult<T> = Result<T, Error>;

/// SHA-256 over an object's data followed by its metadata.
pub type ObjectDigest = [u8; 32];

pub(crate) const POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Open,
    Closed,
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    store_dir: PathBuf,
    peer_endpoint: Option<String>,
    release_delay: usize,
}

impl ConnectOptions {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            peer_endpoint: None,
            release_delay: 0,
        }
    }

    /// Base URL of the peer manager used by `fetch`, `transfer` and remote wait lookups.
    pub fn with_peer_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.peer_endpoint = Some(endpoint.into());
        self
    }

    /// Keeps up to `count` fully released objects mapped for cheap re-acquisition.
    pub fn with_release_delay(mut self, count: usize) -> Self {
        self.release_delay = count;
        self
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn peer_endpoint(&self) -> Option<&str> {
        self.peer_endpoint.as_deref()
    }

    pub fn release_delay(&self) -> usize {
        self.release_delay
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(default_store_dir())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreInfo {
    pub capacity: u64,
    pub used_bytes: u64,
    pub objects: usize,
    pub sealed: usize,
}

/// Connection to one store. Clones share the connection and its references.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: Store,
    notifier: Notifier,
    peer: Option<PeerClient>,
    state: Mutex<ConnectionState>,
    refs: Mutex<RefTable>,
}

struct Held {
    count: usize,
    file: File,
    map: Option<Arc<Mmap>>,
    header: SegmentHeader,
}

impl Held {
    fn buffer(&mut self, object_id: ObjectId, path: &Path) -> ApiResult<ObjectBuffer> {
        let map = match &self.map {
            Some(map) => Arc::clone(map),
            None => {
                // SAFETY: sealed segments are never written again and our flock blocks eviction.
                let map = unsafe { Mmap::map(&self.file) }.map_err(|err| io_error(path, err))?;
                let map = Arc::new(map);
                self.map = Some(Arc::clone(&map));
                map
            }
        };
        Ok(ObjectBuffer::new(object_id, map, self.header))
    }
}

struct Creation {
    file: File,
    header: SegmentHeader,
    writer: Arc<()>,
}

struct RefTable {
    held: HashMap<ObjectId, Held>,
    created: HashMap<ObjectId, Creation>,
    released: VecDeque<(ObjectId, Held)>,
    release_delay: usize,
}

impl RefTable {
    fn new(release_delay: usize) -> Self {
        Self {
            held: HashMap::new(),
            created: HashMap::new(),
            released: VecDeque::new(),
            release_delay,
        }
    }

    fn take_released(&mut self, object_id: &ObjectId) -> Option<Held> {
        let index = self.released.iter().position(|(id, _)| id == object_id)?;
        self.released.remove(index).map(|(_, held)| held)
    }

    fn park(&mut self, object_id: ObjectId, held: Held) {
        if self.release_delay == 0 {
            return;
        }
        self.released.push_back((object_id, held));
        while self.released.len() > self.release_delay {
            self.released.pop_front();
        }
    }

    fn forget_released(&mut self, object_id: &ObjectId) {
        self.released.retain(|(id, _)| id != object_id);
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn refs(&self) -> MutexGuard<'_, RefTable> {
        self.refs.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Drops every reference and discards objects this connection left unsealed.
    fn release_all(&self) {
        let created: Vec<ObjectId> = {
            let mut refs = self.refs();
            refs.held.clear();
            refs.released.clear();
            refs.created.drain().map(|(id, _)| id).collect()
        };
        if created.is_empty() {
            return;
        }
        let _lock = match self.store.lock() {
            Ok(lock) => lock,
            Err(err) => {
                tracing::warn!(%err, "failed to lock store while aborting unsealed objects");
                return;
            }
        };
        for object_id in created {
            match segment::remove(&self.store.object_path(&object_id)) {
                Ok(()) => tracing::debug!(object = %object_id, "aborted unsealed object"),
                Err(err) => tracing::warn!(object = %object_id, %err, "failed to abort unsealed object"),
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let open = *self.state() == ConnectionState::Open;
        if open {
            self.release_all();
        }
    }
}

/// Poll deadline for blocking calls; negative timeouts never expire.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Deadline {
    Never,
    At(Instant),
}

impl Deadline {
    pub(crate) fn after_ms(timeout_ms: i64) -> Self {
        if timeout_ms < 0 {
            Deadline::Never
        } else {
            Deadline::At(Instant::now() + Duration::from_millis(timeout_ms as u64))
        }
    }

    pub(crate) fn after(timeout: Duration) -> Self {
        Deadline::At(Instant::now() + timeout)
    }

    /// Length of the next sleep, or `None` once the deadline has passed.
    pub(crate) fn next_tick(&self) -> Option<Duration> {
        match self {
            Deadline::Never => Some(POLL_TICK),
            Deadline::At(at) => {
                let now = Instant::now();
                if now >= *at {
                    None
                } else {
                    Some(POLL_TICK.min(*at - now))
                }
            }
        }
    }
}

impl Client {
    pub fn connect(options: ConnectOptions) -> ApiResult<Self> {
        let store = Store::open(&options.store_dir)?;
        let peer = options.peer_endpoint.map(PeerClient::new).transpose()?;
        let notifier = Notifier::for_store(store.root());
        tracing::debug!(
            store = %store.root().display(),
            peer = peer.as_ref().map(|peer| peer.base_url().as_str()),
            release_delay = options.release_delay,
            "connected to store"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                store,
                notifier,
                peer,
                state: Mutex::new(ConnectionState::Open),
                refs: Mutex::new(RefTable::new(options.release_delay)),
            }),
        })
    }

    pub fn connect_dir(store_dir: impl Into<PathBuf>) -> ApiResult<Self> {
        Self::connect(ConnectOptions::new(store_dir))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state()
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn peer(&self) -> Option<&PeerClient> {
        self.inner.peer.as_ref()
    }

    /// Closes the connection: references drop and unsealed creations are discarded.
    pub fn disconnect(&self) -> ApiResult<()> {
        {
            let mut state = self.inner.state();
            if *state == ConnectionState::Closed {
                return Err(closed_error());
            }
            *state = ConnectionState::Closed;
        }
        self.inner.release_all();
        // Wake blocked calls on other threads so they notice the closed state.
        self.inner.notifier.post();
        tracing::debug!(store = %self.inner.store.root().display(), "disconnected from store");
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> ApiResult<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(closed_error()),
        }
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn info(&self) -> ApiResult<StoreInfo> {
        self.ensure_open()?;
        let segments = self.inner.store.segments()?;
        Ok(StoreInfo {
            capacity: self.inner.store.capacity(),
            used_bytes: segments.iter().map(|entry| entry.header.payload_len()).sum(),
            objects: segments.len(),
            sealed: segments.iter().filter(|entry| entry.header.is_sealed()).count(),
        })
    }

    /// Allocates an unsealed object and returns its writable data region.
    ///
    /// Evicts unreferenced sealed objects when space is short; fails with
    /// `StoreFull` if that still does not make room.
    pub fn create(
        &self,
        object_id: &ObjectId,
        data_size: u64,
        metadata: &[u8],
    ) -> ApiResult<ObjectWriter> {
        self.ensure_open()?;
        let id = *object_id;
        let metadata_size = metadata.len() as u64;
        let payload = data_size.checked_add(metadata_size).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("object size overflows")
                .with_object(id)
        })?;
        let path = self.inner.store.object_path(&id);

        let (file, header, map) = {
            let lock = self.inner.store.lock()?;
            if path.exists() {
                return Err(Error::new(ErrorKind::AlreadyExists)
                    .with_message("an object with this id already exists in the store")
                    .with_object(id));
            }
            let capacity = self.inner.store.capacity();
            if payload > capacity {
                return Err(Error::new(ErrorKind::StoreFull)
                    .with_message(format!(
                        "object needs {payload} bytes but the store capacity is {capacity}"
                    ))
                    .with_object(id)
                    .with_hint("Re-initialize the store with a larger capacity."));
            }
            let free = capacity.saturating_sub(self.inner.store.used_bytes()?);
            if payload > free {
                let needed = payload - free;
                let freed = self.evict_locked(&lock, needed)?;
                if freed < needed {
                    return Err(Error::new(ErrorKind::StoreFull)
                        .with_message(format!(
                            "store is full: needed {needed} more bytes, eviction freed {freed}"
                        ))
                        .with_object(id)
                        .with_hint("Release or delete objects to make them evictable."));
                }
            }
            let (file, header) = segment::create(&path, data_size, metadata, now_ns())
                .map_err(|err| err.with_object(id))?;
            let map = match segment::map_writable(&file, &path) {
                Ok(map) => map,
                Err(err) => {
                    drop(file);
                    let _ = segment::remove(&path);
                    return Err(err.with_object(id));
                }
            };
            (file, header, map)
        };

        let live = Arc::new(());
        self.inner.refs().created.insert(
            id,
            Creation {
                file,
                header,
                writer: Arc::clone(&live),
            },
        );
        tracing::debug!(object = %id, data_size, metadata_size, "created object");
        Ok(ObjectWriter::new(self.clone(), id, map, header, live))
    }

    /// Seals an object created on this connection. The creator keeps one reference.
    pub fn seal(&self, object_id: &ObjectId) -> ApiResult<()> {
        self.ensure_open()?;
        let id = *object_id;
        let path = self.inner.store.object_path(&id);

        let creation = {
            let mut refs = self.inner.refs();
            let Some(creation) = refs.created.remove(&id) else {
                drop(refs);
                let sealed = segment::read_header(&path)?.is_some_and(|header| header.is_sealed());
                let message = if sealed {
                    "object is already sealed"
                } else {
                    "object was not created by this connection"
                };
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(message)
                    .with_object(id));
            };
            if Arc::strong_count(&creation.writer) > 1 {
                refs.created.insert(id, creation);
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("object writer is still open")
                    .with_object(id)
                    .with_hint("Seal through ObjectWriter::seal, or drop the writer first."));
            }
            creation
        };

        let header = creation.header.sealed(now_ns());
        let lock = match self.inner.store.lock() {
            Ok(lock) => lock,
            Err(err) => {
                self.inner.refs().created.insert(id, creation);
                return Err(err.with_object(id));
            }
        };
        if let Err(err) = segment::write_header(&creation.file, &path, &header) {
            drop(lock);
            self.inner.refs().created.insert(id, creation);
            return Err(err.with_object(id));
        }
        let appended = events::append(
            &lock,
            &self.inner.store.events_path(),
            id,
            EventKind::Created {
                data_size: header.data_size,
                metadata_size: header.metadata_size,
            },
        );
        drop(lock);

        self.inner.refs().held.insert(
            id,
            Held {
                count: 1,
                file: creation.file,
                map: None,
                header,
            },
        );
        self.inner.notifier.post();
        appended.map_err(|err| err.with_object(id))?;
        tracing::debug!(object = %id, "sealed object");
        Ok(())
    }

    /// Creates, fills, seals and releases an object in one call.
    pub fn put(&self, object_id: &ObjectId, data: &[u8], metadata: &[u8]) -> ApiResult<()> {
        let mut writer = self.create(object_id, data.len() as u64, metadata)?;
        writer.data_mut().copy_from_slice(data);
        writer.seal()?;
        self.release(object_id)
    }

    /// Returns one slot per requested id, in order; `None` means not sealed in time.
    ///
    /// A negative `timeout_ms` waits forever and zero polls once. Every returned
    /// buffer adds one reference that must be matched by `release`.
    pub fn get(
        &self,
        object_ids: &[ObjectId],
        timeout_ms: i64,
    ) -> ApiResult<Vec<Option<ObjectBuffer>>> {
        self.ensure_open()?;
        let deadline = Deadline::after_ms(timeout_ms);
        let mut found: Vec<Option<ObjectBuffer>> = vec![None; object_ids.len()];
        loop {
            for index in 0..object_ids.len() {
                if found[index].is_some() {
                    continue;
                }
                match self.acquire(&object_ids[index]) {
                    Ok(buffer) => found[index] = buffer,
                    Err(err) => {
                        self.release_found(object_ids, found);
                        return Err(err);
                    }
                }
            }
            if found.iter().all(Option::is_some) {
                break;
            }
            let Some(tick) = deadline.next_tick() else {
                break;
            };
            self.inner.notifier.wait_tick(tick);
            self.ensure_open()?;
        }
        Ok(found)
    }

    /// Gives back the references a failed `get` had already taken.
    fn release_found(&self, object_ids: &[ObjectId], found: Vec<Option<ObjectBuffer>>) {
        for (object_id, slot) in object_ids.iter().zip(found) {
            if slot.is_some() {
                drop(slot);
                if let Err(err) = self.release(object_id) {
                    tracing::warn!(object = %object_id, %err, "failed to release after get error");
                }
            }
        }
    }

    fn acquire(&self, object_id: &ObjectId) -> ApiResult<Option<ObjectBuffer>> {
        let id = *object_id;
        let path = self.inner.store.object_path(&id);
        {
            let mut refs = self.inner.refs();
            if let Some(held) = refs.held.get_mut(&id) {
                if segment::is_linked(&held.file, &path)? {
                    let buffer = held.buffer(id, &path)?;
                    held.count += 1;
                    return Ok(Some(buffer));
                }
            } else if let Some(mut held) = refs.take_released(&id) {
                if segment::is_linked(&held.file, &path)? {
                    let buffer = held.buffer(id, &path)?;
                    held.count = 1;
                    refs.held.insert(id, held);
                    return Ok(Some(buffer));
                }
            }
        }

        let Some(sealed) = segment::open_sealed(&path)? else {
            return Ok(None);
        };
        let buffer = ObjectBuffer::new(id, Arc::clone(&sealed.map), sealed.header);
        let mut refs = self.inner.refs();
        let count = match refs.held.get_mut(&id) {
            Some(held) if segment::is_linked(&held.file, &path)? => {
                held.count += 1;
                return Ok(Some(buffer));
            }
            // Deleted and recreated under the same id: carry outstanding references over.
            Some(held) => held.count + 1,
            None => 1,
        };
        refs.held.insert(
            id,
            Held {
                count,
                file: sealed.file,
                map: Some(sealed.map),
                header: sealed.header,
            },
        );
        Ok(Some(buffer))
    }

    /// Drops one reference taken by `get` (or the creator's reference after `seal`).
    pub fn release(&self, object_id: &ObjectId) -> ApiResult<()> {
        self.ensure_open()?;
        let mut refs = self.inner.refs();
        let remaining = match refs.held.get_mut(object_id) {
            Some(held) => {
                held.count -= 1;
                held.count
            }
            None => {
                let message = if refs.created.contains_key(object_id) {
                    "object must be sealed before it can be released"
                } else {
                    "release without a matching get"
                };
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(message)
                    .with_object(*object_id));
            }
        };
        if remaining == 0 {
            if let Some(held) = refs.held.remove(object_id) {
                refs.park(*object_id, held);
            }
        }
        Ok(())
    }

    pub fn contains(&self, object_id: &ObjectId) -> ApiResult<bool> {
        self.ensure_open()?;
        self.contains_in_store(object_id)
    }

    pub(crate) fn contains_in_store(&self, object_id: &ObjectId) -> ApiResult<bool> {
        let path = self.inner.store.object_path(object_id);
        Ok(segment::read_header(&path)?.is_some_and(|header| header.is_sealed()))
    }

    /// Removes a sealed object from the store. Existing mappings stay readable.
    pub fn delete(&self, object_id: &ObjectId) -> ApiResult<()> {
        self.ensure_open()?;
        let id = *object_id;
        let path = self.inner.store.object_path(&id);
        {
            let lock = self.inner.store.lock()?;
            match segment::read_header(&path)? {
                None => {
                    return Err(Error::new(ErrorKind::NotFound)
                        .with_message("object is not in the store")
                        .with_object(id));
                }
                Some(header) if !header.is_sealed() => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("only sealed objects can be deleted")
                        .with_object(id));
                }
                Some(_) => {}
            }
            segment::remove(&path)?;
            events::append(&lock, &self.inner.store.events_path(), id, EventKind::Deleted)?;
        }
        self.inner.refs().forget_released(&id);
        self.inner.notifier.post();
        tracing::debug!(object = %id, "deleted object");
        Ok(())
    }

    /// Digest of a sealed object, or `None` when it is not sealed locally.
    pub fn hash(&self, object_id: &ObjectId) -> ApiResult<Option<ObjectDigest>> {
        let Some(buffer) = self
            .get(std::slice::from_ref(object_id), 0)?
            .pop()
            .flatten()
        else {
            return Ok(None);
        };
        let digest = object_digest(buffer.data(), buffer.metadata());
        drop(buffer);
        self.release(object_id)?;
        Ok(Some(digest))
    }

    /// Evicts unreferenced sealed objects until `target_bytes` are freed or none remain.
    pub fn evict(&self, target_bytes: u64) -> ApiResult<u64> {
        self.ensure_open()?;
        let freed = {
            let lock = self.inner.store.lock()?;
            self.evict_locked(&lock, target_bytes)?
        };
        if freed > 0 {
            self.inner.notifier.post();
        }
        tracing::debug!(target_bytes, freed, "eviction finished");
        Ok(freed)
    }

    fn evict_locked(&self, lock: &StoreLock<'_>, target_bytes: u64) -> ApiResult<u64> {
        if target_bytes == 0 {
            return Ok(0);
        }
        // Parked releases still hold flocks that would pin their segments.
        self.inner.refs().released.clear();

        let mut candidates = Vec::new();
        let mut probes = Vec::new();
        for entry in self.inner.store.segments()? {
            if !entry.header.is_sealed() {
                continue;
            }
            let path = self.inner.store.object_path(&entry.object_id);
            if let Some(probe) = segment::try_lock_unreferenced(&path)? {
                candidates.push(EvictionCandidate {
                    object_id: entry.object_id,
                    bytes: entry.header.payload_len(),
                    sealed_ns: entry.header.sealed_ns,
                });
                probes.push(probe);
            }
        }

        let plan = plan_eviction(&candidates, target_bytes);
        let events_path = self.inner.store.events_path();
        for victim in &plan.victims {
            segment::remove(&self.inner.store.object_path(&victim.object_id))?;
            events::append(lock, &events_path, victim.object_id, EventKind::Deleted)?;
            tracing::debug!(object = %victim.object_id, bytes = victim.bytes, "evicted object");
        }
        drop(probes);
        Ok(plan.bytes)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("store", &self.inner.store.root())
            .field("state", &self.state())
            .field("peer", &self.inner.peer.as_ref().map(|peer| peer.base_url().as_str()))
            .finish()
    }
}

pub fn object_digest(data: &[u8], metadata: &[u8]) -> ObjectDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(metadata);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Connectivity)
        .with_message("connection is closed")
        .with_hint("Open a new connection with Client::connect.")
}

#[cfg(test)]
mod tests {
    use super::{Client, ConnectOptions, ConnectionState, Deadline, object_digest};
    use crate::core::error::ErrorKind;
    use crate::core::object_id::ObjectId;
    use crate::core::store::{Store, StoreOptions};
    use std::time::Duration;

    fn store(capacity: u64) -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().expect("tempdir");
        Store::create(dir.path(), StoreOptions::new(capacity)).expect("store");
        let client = Client::connect_dir(dir.path()).expect("connect");
        (dir, client)
    }

    #[test]
    fn deadline_zero_expires_immediately() {
        assert!(Deadline::after_ms(0).next_tick().is_none());
        assert!(Deadline::after_ms(-1).next_tick().is_some());
        let tick = Deadline::after(Duration::from_secs(5)).next_tick().expect("tick");
        assert!(tick <= super::POLL_TICK);
    }

    #[test]
    fn digest_covers_metadata() {
        assert_ne!(object_digest(b"abc", b""), object_digest(b"abc", b"m"));
        assert_eq!(object_digest(b"ab", b"c"), object_digest(b"ab", b"c"));
    }

    #[test]
    fn creator_reference_survives_seal() {
        let (_dir, client) = store(4096);
        let id = ObjectId::new([3; 20]);
        let mut writer = client.create(&id, 3, b"m").expect("create");
        writer.data_mut().copy_from_slice(b"abc");
        writer.seal().expect("seal");

        client.release(&id).expect("creator release");
        let err = client.release(&id).expect_err("no reference left");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn seal_refuses_while_writer_is_live() {
        let (_dir, client) = store(4096);
        let id = ObjectId::new([4; 20]);
        let writer = client.create(&id, 1, b"").expect("create");
        let err = client.seal(&id).expect_err("writer live");
        assert_eq!(err.kind(), ErrorKind::Usage);
        drop(writer);
        client.seal(&id).expect("seal after drop");
        let err = client.seal(&id).expect_err("twice");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn release_delay_keeps_recent_objects_parked() {
        let dir = tempfile::tempdir().expect("tempdir");
        Store::create(dir.path(), StoreOptions::new(4096)).expect("store");
        let client =
            Client::connect(ConnectOptions::new(dir.path()).with_release_delay(1)).expect("connect");
        let first = ObjectId::new([1; 20]);
        let second = ObjectId::new([2; 20]);
        client.put(&first, b"one", b"").expect("put");
        client.put(&second, b"two", b"").expect("put");
        {
            let refs = client.inner.refs();
            assert_eq!(refs.released.len(), 1);
            assert_eq!(refs.released[0].0, second);
        }
        let got = client.get(&[second], 0).expect("get");
        assert_eq!(got[0].as_ref().expect("present").data(), b"two");
        assert!(client.inner.refs().released.is_empty());
    }

    #[test]
    fn closed_connection_fails_fast() {
        let (_dir, client) = store(4096);
        client.disconnect().expect("disconnect");
        assert_eq!(client.state(), ConnectionState::Closed);
        let err = client.contains(&ObjectId::new([0; 20])).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        let err = client.disconnect().expect_err("twice");
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }
}
