// Append-only notification log plus a cursor that reads frames in arrival order.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::frame::{EVENT_FRAME_LEN, EventFrame};
use crate::core::object_id::ObjectId;
use crate::core::store::{StoreLock, now_ns};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Created { data_size: u64, metadata_size: u64 },
    Deleted,
}

/// Appends one frame per seal/delete. Callers hold the store lock, which orders seqs.
pub fn append(
    _lock: &StoreLock<'_>,
    path: &Path,
    object_id: ObjectId,
    kind: EventKind,
) -> Result<EventFrame, Error> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| io_error(path, err))?;
    let len = file.metadata().map_err(|err| io_error(path, err))?.len();
    if len % EVENT_FRAME_LEN as u64 != 0 {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("event log length is not a whole number of frames")
            .with_path(path));
    }
    let seq = len / EVENT_FRAME_LEN as u64 + 1;
    let timestamp_ns = now_ns();
    let frame = match kind {
        EventKind::Created {
            data_size,
            metadata_size,
        } => EventFrame::creation(seq, timestamp_ns, object_id, data_size, metadata_size),
        EventKind::Deleted => EventFrame::deletion(seq, timestamp_ns, object_id),
    };
    file.write_all(&frame.encode())
        .map_err(|err| io_error(path, err))?;
    Ok(frame)
}

#[derive(Debug, PartialEq)]
pub enum CursorResult {
    Event(EventFrame),
    WouldBlock,
}

#[derive(Debug)]
pub struct EventCursor {
    path: PathBuf,
    file: File,
    next_off: u64,
}

impl EventCursor {
    /// Opens a cursor positioned after every frame already in the log.
    pub fn at_end(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| io_error(&path, err))?;
        let len = file.metadata().map_err(|err| io_error(&path, err))?.len();
        let next_off = len - len % EVENT_FRAME_LEN as u64;
        Ok(Self {
            path,
            file,
            next_off,
        })
    }

    pub fn from_start(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| io_error(&path, err))?;
        Ok(Self {
            path,
            file,
            next_off: 0,
        })
    }

    pub fn next(&mut self) -> Result<CursorResult, Error> {
        let len = self
            .file
            .metadata()
            .map_err(|err| io_error(&self.path, err))?
            .len();
        if len < self.next_off + EVENT_FRAME_LEN as u64 {
            return Ok(CursorResult::WouldBlock);
        }

        let mut buf = [0u8; EVENT_FRAME_LEN];
        self.file
            .seek(SeekFrom::Start(self.next_off))
            .map_err(|err| io_error(&self.path, err))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|err| io_error(&self.path, err))?;
        // Length grew but the bytes have not landed yet.
        if buf.iter().all(|byte| *byte == 0) {
            return Ok(CursorResult::WouldBlock);
        }

        let frame = EventFrame::decode(&buf).map_err(|err| err.with_path(&self.path))?;
        self.next_off += EVENT_FRAME_LEN as u64;
        Ok(CursorResult::Event(frame))
    }
}
