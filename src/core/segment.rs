//! Purpose: One memory-mapped segment file per object: header, data region, metadata region.
//! Exports: `SegmentHeader`, `SegmentState`, `SealedSegment`, segment file primitives.
//! Role: Storage layer under the lifecycle manager; no refcount or policy decisions here.
//! Invariants: Header state moves `Created -> Sealed` only; sealed bytes are never rewritten.
//! Invariants: Every live reference holds a shared flock on the segment file.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use memmap2::{Mmap, MmapMut};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::store::lock_error_kind;

pub const SEGMENT_MAGIC: [u8; 4] = *b"SOB1";
pub const SEGMENT_HEADER_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentState {
    Created = 1,
    Sealed = 2,
}

impl SegmentState {
    fn from_u32(value: u32) -> Result<Self, Error> {
        match value {
            1 => Ok(SegmentState::Created),
            2 => Ok(SegmentState::Sealed),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid segment state")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub state: SegmentState,
    pub header_len: u32,
    pub data_size: u64,
    pub metadata_size: u64,
    pub created_ns: u64,
    pub sealed_ns: u64,
    pub size_xor: u64,
}

impl SegmentHeader {
    pub fn created(data_size: u64, metadata_size: u64, created_ns: u64) -> Self {
        Self {
            state: SegmentState::Created,
            header_len: SEGMENT_HEADER_LEN as u32,
            data_size,
            metadata_size,
            created_ns,
            sealed_ns: 0,
            size_xor: data_size ^ metadata_size ^ u64::MAX,
        }
    }

    pub fn sealed(self, sealed_ns: u64) -> Self {
        Self {
            state: SegmentState::Sealed,
            sealed_ns,
            ..self
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.state == SegmentState::Sealed
    }

    pub fn payload_len(&self) -> u64 {
        self.data_size + self.metadata_size
    }

    pub fn file_len(&self) -> u64 {
        SEGMENT_HEADER_LEN as u64 + self.payload_len()
    }

    pub fn data_range(&self) -> Range<usize> {
        let start = SEGMENT_HEADER_LEN;
        start..start + self.data_size as usize
    }

    pub fn metadata_range(&self) -> Range<usize> {
        let start = SEGMENT_HEADER_LEN + self.data_size as usize;
        start..start + self.metadata_size as usize
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        write_u32(&mut buf, 4, self.state as u32);
        write_u32(&mut buf, 8, self.header_len);
        write_u64(&mut buf, 16, self.data_size);
        write_u64(&mut buf, 24, self.metadata_size);
        write_u64(&mut buf, 32, self.created_ns);
        write_u64(&mut buf, 40, self.sealed_ns);
        write_u64(&mut buf, 48, self.size_xor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SEGMENT_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("segment header too small"));
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad segment magic"));
        }
        Ok(Self {
            state: SegmentState::from_u32(read_u32(buf, 4))?,
            header_len: read_u32(buf, 8),
            data_size: read_u64(buf, 16),
            metadata_size: read_u64(buf, 24),
            created_ns: read_u64(buf, 32),
            sealed_ns: read_u64(buf, 40),
            size_xor: read_u64(buf, 48),
        })
    }

    pub fn validate(&self, file_len: u64) -> Result<(), Error> {
        if self.header_len as usize != SEGMENT_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected segment header length"));
        }
        if self.data_size ^ self.metadata_size ^ self.size_xor != u64::MAX {
            return Err(Error::new(ErrorKind::Corrupt).with_message("segment size xor mismatch"));
        }
        let expected = self
            .data_size
            .checked_add(self.metadata_size)
            .and_then(|len| len.checked_add(SEGMENT_HEADER_LEN as u64))
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("segment length overflow"))?;
        if expected > file_len {
            return Err(Error::new(ErrorKind::Corrupt).with_message("segment shorter than header claims"));
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// A sealed segment opened for reading; the file keeps the shared reference lock.
#[derive(Debug)]
pub struct SealedSegment {
    pub file: File,
    pub map: Arc<Mmap>,
    pub header: SegmentHeader,
}

/// Creates a new segment in `Created` state and takes the creator's reference.
///
/// Fails with `AlreadyExists` when a segment for the same id exists in any state.
pub fn create(
    path: &Path,
    data_size: u64,
    metadata: &[u8],
    created_ns: u64,
) -> Result<(File, SegmentHeader), Error> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                Error::new(ErrorKind::AlreadyExists)
                    .with_message("an object with this id already exists in the store")
            } else {
                io_error(path, err)
            }
        })?;

    let header = SegmentHeader::created(data_size, metadata.len() as u64, created_ns);
    let init = (|| -> io::Result<()> {
        file.lock_shared()?;
        file.set_len(header.file_len())?;
        file.seek(SeekFrom::Start(header.metadata_range().start as u64))?;
        file.write_all(metadata)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.flush()
    })();
    if let Err(err) = init {
        let _ = fs::remove_file(path);
        return Err(io_error(path, err));
    }
    Ok((file, header))
}

pub fn map_writable(file: &File, path: &Path) -> Result<MmapMut, Error> {
    // SAFETY: the segment is in `Created` state and only its creator maps it writable.
    unsafe { MmapMut::map_mut(file).map_err(|err| io_error(path, err)) }
}

pub fn write_header(mut file: &File, path: &Path, header: &SegmentHeader) -> Result<(), Error> {
    file.seek(SeekFrom::Start(0))
        .map_err(|err| io_error(path, err))?;
    file.write_all(&header.encode())
        .map_err(|err| io_error(path, err))?;
    file.flush().map_err(|err| io_error(path, err))
}

/// Reads the header without taking a reference. Missing or half-created segments read as `None`.
pub fn read_header(path: &Path) -> Result<Option<SegmentHeader>, Error> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    let mut buf = [0u8; SEGMENT_HEADER_LEN];
    match file.read_exact(&mut buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    }
    if buf[0..4] == [0u8; 4] {
        return Ok(None);
    }
    SegmentHeader::decode(&buf)
        .map(Some)
        .map_err(|err| err.with_path(path))
}

/// Opens a sealed segment and takes a shared reference lock on it.
pub fn open_sealed(path: &Path) -> Result<Option<SealedSegment>, Error> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    file.lock_shared().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("failed to reference segment")
            .with_path(path)
            .with_source(err)
    })?;
    // Evicted or deleted between open and lock.
    if !is_linked(&file, path)? {
        return Ok(None);
    }

    // SAFETY: sealed segments are never written again; the shared lock keeps eviction away.
    let map = unsafe { Mmap::map(&file).map_err(|err| io_error(path, err))? };
    if map.len() < SEGMENT_HEADER_LEN || map[0..4] != SEGMENT_MAGIC {
        return Ok(None);
    }
    let header = SegmentHeader::decode(&map[..SEGMENT_HEADER_LEN]).map_err(|err| err.with_path(path))?;
    if !header.is_sealed() {
        return Ok(None);
    }
    header
        .validate(map.len() as u64)
        .map_err(|err| err.with_path(path))?;
    Ok(Some(SealedSegment {
        file,
        map: Arc::new(map),
        header,
    }))
}

/// Takes an exclusive lock if no connection anywhere holds a reference.
pub fn try_lock_unreferenced(path: &Path) -> Result<Option<File>, Error> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if lock_error_kind(&err) == ErrorKind::Busy => Ok(None),
        Err(err) => Err(Error::new(lock_error_kind(&err))
            .with_message("failed to probe segment references")
            .with_path(path)
            .with_source(err)),
    }
}

pub fn remove(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(path, err)),
    }
}

#[cfg(unix)]
pub(crate) fn is_linked(file: &File, path: &Path) -> Result<bool, Error> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata().map_err(|err| io_error(path, err))?;
    Ok(meta.nlink() > 0)
}

#[cfg(not(unix))]
pub(crate) fn is_linked(_file: &File, path: &Path) -> Result<bool, Error> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::{SEGMENT_HEADER_LEN, SegmentHeader, SegmentState};
    use crate::core::error::ErrorKind;

    #[test]
    fn header_round_trip_keeps_state() {
        let header = SegmentHeader::created(10, 3, 42).sealed(99);
        let decoded = SegmentHeader::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.state, SegmentState::Sealed);
        decoded.validate(header.file_len()).expect("valid");
    }

    #[test]
    fn ranges_follow_header() {
        let header = SegmentHeader::created(10, 3, 0);
        assert_eq!(header.data_range(), SEGMENT_HEADER_LEN..SEGMENT_HEADER_LEN + 10);
        assert_eq!(header.metadata_range(), SEGMENT_HEADER_LEN + 10..SEGMENT_HEADER_LEN + 13);
        assert_eq!(header.file_len(), SEGMENT_HEADER_LEN as u64 + 13);
    }

    #[test]
    fn torn_sizes_are_rejected() {
        let mut header = SegmentHeader::created(10, 3, 0);
        header.size_xor = 0;
        let err = header.validate(header.file_len()).expect_err("xor");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn short_file_is_rejected() {
        let header = SegmentHeader::created(10, 3, 0);
        let err = header.validate(20).expect_err("short");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn unknown_state_is_corrupt() {
        let mut buf = SegmentHeader::created(1, 1, 0).encode();
        buf[4] = 7;
        let err = SegmentHeader::decode(&buf).expect_err("state");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn created_segment_is_not_opened_as_sealed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.obj");
        let (_file, header) = super::create(&path, 4, b"mm", 1).expect("create");
        assert_eq!(header.state, SegmentState::Created);
        assert!(super::open_sealed(&path).expect("open").is_none());
        let read = super::read_header(&path).expect("read").expect("present");
        assert_eq!(read, header);

        let err = super::create(&path, 4, b"", 1).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn referenced_segment_cannot_be_locked_exclusively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("b.obj");
        let (file, header) = super::create(&path, 2, b"", 1).expect("create");
        super::write_header(&file, &path, &header.sealed(2)).expect("seal");

        assert!(super::try_lock_unreferenced(&path).expect("probe").is_none());
        drop(file);
        assert!(super::try_lock_unreferenced(&path).expect("probe").is_some());
    }
}
