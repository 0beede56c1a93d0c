//! Purpose: Typed views over object segments handed to callers.
//! Exports: `ObjectWriter` (exclusive, pre-seal) and `ObjectBuffer` (shared, read-only).
//! Role: Encode buffer ownership in types: writes end when the writer is sealed or dropped.
//! Invariants: An `ObjectWriter` is the only writable mapping of its segment.
//! Invariants: `ObjectBuffer` mappings stay valid after release, delete or eviction.

use super::client::{ApiResult, Client};
use crate::core::error::{Error, ErrorKind};
use crate::core::object_id::ObjectId;
use crate::core::segment::SegmentHeader;
use memmap2::{Mmap, MmapMut};
use std::fmt;
use std::sync::Arc;

/// Writable data region of an object in `Created` state.
///
/// Dropping the writer without sealing leaves the object unsealed; it can still be
/// sealed with [`Client::seal`], and is discarded when the connection closes.
pub struct ObjectWriter {
    client: Client,
    object_id: ObjectId,
    map: MmapMut,
    header: SegmentHeader,
    _live: Arc<()>,
}

impl ObjectWriter {
    pub(crate) fn new(
        client: Client,
        object_id: ObjectId,
        map: MmapMut,
        header: SegmentHeader,
        live: Arc<()>,
    ) -> Self {
        Self {
            client,
            object_id,
            map,
            header,
            _live: live,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn len(&self) -> usize {
        self.header.data_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.map[self.header.data_range()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let range = self.header.data_range();
        &mut self.map[range]
    }

    pub fn metadata(&self) -> &[u8] {
        &self.map[self.header.metadata_range()]
    }

    /// Copies `bytes` to the start of the data region.
    pub fn write_all(&mut self, bytes: &[u8]) -> ApiResult<()> {
        if bytes.len() > self.len() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "write of {} bytes exceeds object size {}",
                    bytes.len(),
                    self.len()
                ))
                .with_object(self.object_id));
        }
        self.data_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Seals the object, making it immutable and visible to every client.
    pub fn seal(self) -> ApiResult<()> {
        let ObjectWriter {
            client,
            object_id,
            map,
            header: _,
            _live,
        } = self;
        drop(map);
        drop(_live);
        client.seal(&object_id)
    }
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("object_id", &self.object_id)
            .field("data_size", &self.header.data_size)
            .field("metadata_size", &self.header.metadata_size)
            .finish()
    }
}

/// Read-only view of a sealed object's data and metadata.
#[derive(Clone)]
pub struct ObjectBuffer {
    object_id: ObjectId,
    map: Arc<Mmap>,
    header: SegmentHeader,
}

impl ObjectBuffer {
    pub(crate) fn new(object_id: ObjectId, map: Arc<Mmap>, header: SegmentHeader) -> Self {
        Self {
            object_id,
            map,
            header,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn data(&self) -> &[u8] {
        &self.map[self.header.data_range()]
    }

    pub fn metadata(&self) -> &[u8] {
        &self.map[self.header.metadata_range()]
    }

    pub fn data_size(&self) -> u64 {
        self.header.data_size
    }

    pub fn metadata_size(&self) -> u64 {
        self.header.metadata_size
    }

    pub fn sealed_ns(&self) -> u64 {
        self.header.sealed_ns
    }
}

impl fmt::Debug for ObjectBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("object_id", &self.object_id)
            .field("data_size", &self.header.data_size)
            .field("metadata_size", &self.header.metadata_size)
            .finish()
    }
}
