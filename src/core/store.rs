// Store directory creation/opening with header validation and the bookkeeping lock.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::object_id::ObjectId;
use crate::core::segment::{self, SegmentHeader};

const MAGIC: [u8; 4] = *b"SHMS";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 4096;

const META_FILE: &str = "store.meta";
const LOCK_FILE: &str = "store.lock";
const EVENTS_FILE: &str = "events.log";
const OBJECTS_DIR: &str = "objects";
const SEGMENT_EXT: &str = "obj";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreHeader {
    pub capacity: u64,
    pub created_ns: u64,
    pub flags: u64,
}

impl StoreHeader {
    fn new(capacity: u64) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("store capacity must be non-zero"));
        }
        Ok(Self {
            capacity,
            created_ns: now_ns(),
            flags: 0,
        })
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.capacity);
        write_u64(&mut buf, 24, self.created_ns);
        write_u64(&mut buf, 32, self.flags);

        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("store header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad store magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported store version {version}")));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            capacity: read_u64(buf, 16),
            created_ns: read_u64(buf, 24),
            flags: read_u64(buf, 32),
        })
    }

    fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("store capacity is zero"));
        }
        Ok(())
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    pub capacity: u64,
}

impl StoreOptions {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }
}

/// A sealed or unsealed segment found while scanning the store.
#[derive(Clone, Copy, Debug)]
pub struct SegmentEntry {
    pub object_id: ObjectId,
    pub header: SegmentHeader,
}

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    header: StoreHeader,
    lock_file: File,
    local: Mutex<()>,
}

impl Store {
    pub fn create(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        let header = StoreHeader::new(options.capacity)?;
        fs::create_dir_all(root.join(OBJECTS_DIR)).map_err(|err| io_error(&root, err))?;

        let meta_path = root.join(META_FILE);
        let mut meta = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&meta_path)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    Error::new(ErrorKind::AlreadyExists)
                        .with_message("store already initialized")
                        .with_path(&root)
                } else {
                    io_error(&meta_path, err)
                }
            })?;
        write_header(&mut meta, &header, &meta_path)?;

        let events_path = root.join(EVENTS_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .map_err(|err| io_error(&events_path, err))?;

        let lock_file = open_lock_file(&root)?;
        tracing::debug!(root = %root.display(), capacity = options.capacity, "created store");
        Ok(Self {
            root,
            header,
            lock_file,
            local: Mutex::new(()),
        })
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        let meta_path = root.join(META_FILE);
        let mut meta = File::open(&meta_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::new(ErrorKind::Connectivity)
                    .with_message("no store at this location")
                    .with_path(&root)
                    .with_hint("Initialize it with `shmstore store init`.")
            } else {
                io_error(&meta_path, err)
            }
        })?;
        let header = read_header(&mut meta, &meta_path)?;
        header.validate()?;
        let lock_file = open_lock_file(&root)?;

        Ok(Self {
            root,
            header,
            lock_file,
            local: Mutex::new(()),
        })
    }

    pub fn open_or_create(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let root = root.as_ref();
        match Self::create(root, options) {
            Ok(store) => Ok(store),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::open(root),
            Err(err) => Err(err),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn header(&self) -> StoreHeader {
        self.header
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(format!("{}.{SEGMENT_EXT}", id.to_hex()))
    }

    /// Serializes bookkeeping across threads of this process and across processes.
    pub fn lock(&self) -> Result<StoreLock<'_>, Error> {
        let guard = self.local.lock().unwrap_or_else(|poison| poison.into_inner());
        self.lock_file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("failed to lock store")
                .with_path(&self.root)
                .with_source(err)
        })?;
        Ok(StoreLock {
            file: &self.lock_file,
            _guard: guard,
        })
    }

    pub fn segments(&self) -> Result<Vec<SegmentEntry>, Error> {
        let dir = self.root.join(OBJECTS_DIR);
        let entries = fs::read_dir(&dir).map_err(|err| io_error(&dir, err))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(object_id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| ObjectId::from_hex(stem).ok())
            else {
                continue;
            };
            // Segments may disappear between listing and reading.
            if let Some(header) = segment::read_header(&path)? {
                out.push(SegmentEntry { object_id, header });
            }
        }
        Ok(out)
    }

    /// Bytes charged against capacity: data plus metadata of every segment.
    pub fn used_bytes(&self) -> Result<u64, Error> {
        Ok(self
            .segments()?
            .iter()
            .map(|entry| entry.header.payload_len())
            .sum())
    }
}

pub struct StoreLock<'a> {
    file: &'a File,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(root: &Path) -> Result<File, Error> {
    let path = root.join(LOCK_FILE);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| io_error(&path, err))
}

pub(crate) fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<StoreHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| io_error(path, err))?;
    file.read_exact(&mut buf).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("store header truncated")
            .with_path(path)
            .with_source(err)
    })?;
    StoreHeader::decode(&buf)
}

fn write_header(file: &mut File, header: &StoreHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0))
        .map_err(|err| io_error(path, err))?;
    file.write_all(&buf).map_err(|err| io_error(path, err))?;
    file.flush().map_err(|err| io_error(path, err))?;
    Ok(())
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreOptions};
    use crate::core::error::ErrorKind;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn create_and_open_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("store");
        let store = Store::create(&root, StoreOptions::new(1024 * 1024)).expect("create");
        assert_eq!(store.capacity(), 1024 * 1024);
        assert_eq!(store.used_bytes().expect("used"), 0);

        let reopened = Store::open(&root).expect("open");
        assert_eq!(reopened.header(), store.header());
    }

    #[test]
    fn second_create_reports_already_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        Store::create(dir.path(), StoreOptions::new(4096)).expect("create");
        let err = Store::create(dir.path(), StoreOptions::new(4096)).expect_err("exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        Store::open_or_create(dir.path(), StoreOptions::new(4096)).expect("reopen");
    }

    #[test]
    fn missing_store_is_a_connectivity_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Store::open(dir.path().join("nope")).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        Store::create(dir.path(), StoreOptions::new(4096)).expect("create");
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("store.meta"))
            .expect("open meta");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.write_all(b"NOPE").expect("write");
        file.flush().expect("flush");

        let err = Store::open(dir.path()).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn zero_capacity_is_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Store::create(dir.path(), StoreOptions::new(0)).expect_err("zero");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn lock_is_reentrant_across_sequential_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::create(dir.path(), StoreOptions::new(4096)).expect("create");
        drop(store.lock().expect("first"));
        drop(store.lock().expect("second"));
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
