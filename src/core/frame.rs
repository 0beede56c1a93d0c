// Notification frame layout: one fixed-size frame per seal or delete event.
use crate::core::error::{Error, ErrorKind};
use crate::core::object_id::{OBJECT_ID_LEN, ObjectId};

pub const EVENT_MAGIC: [u8; 4] = *b"EVT1";
pub const EVENT_FRAME_LEN: usize = 64;
pub const DELETION_SIZE: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventFrame {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
}

impl EventFrame {
    pub fn creation(
        seq: u64,
        timestamp_ns: u64,
        object_id: ObjectId,
        data_size: u64,
        metadata_size: u64,
    ) -> Self {
        Self {
            seq,
            timestamp_ns,
            object_id,
            data_size: data_size as i64,
            metadata_size: metadata_size as i64,
        }
    }

    pub fn deletion(seq: u64, timestamp_ns: u64, object_id: ObjectId) -> Self {
        Self {
            seq,
            timestamp_ns,
            object_id,
            data_size: DELETION_SIZE,
            metadata_size: DELETION_SIZE,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.data_size == DELETION_SIZE && self.metadata_size == DELETION_SIZE
    }

    pub fn encode(&self) -> [u8; EVENT_FRAME_LEN] {
        let mut buf = [0u8; EVENT_FRAME_LEN];
        buf[0..4].copy_from_slice(&EVENT_MAGIC);
        write_u32(&mut buf, 4, EVENT_FRAME_LEN as u32);
        write_u64(&mut buf, 8, self.seq);
        write_u64(&mut buf, 16, self.timestamp_ns);
        buf[24..24 + OBJECT_ID_LEN].copy_from_slice(self.object_id.as_bytes());
        write_u64(&mut buf, 44, self.data_size as u64);
        write_u64(&mut buf, 52, self.metadata_size as u64);
        write_u32(&mut buf, 60, size_check(self.data_size, self.metadata_size));
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < EVENT_FRAME_LEN {
            return Err(Error::new(ErrorKind::Protocol).with_message("event frame too small"));
        }
        if buf[0..4] != EVENT_MAGIC {
            return Err(Error::new(ErrorKind::Protocol).with_message("bad event frame magic"));
        }
        if read_u32(buf, 4) as usize != EVENT_FRAME_LEN {
            return Err(Error::new(ErrorKind::Protocol).with_message("unexpected event frame length"));
        }
        let seq = read_u64(buf, 8);
        let timestamp_ns = read_u64(buf, 16);
        let object_id = ObjectId::from_bytes(&buf[24..24 + OBJECT_ID_LEN])?;
        let data_size = read_u64(buf, 44) as i64;
        let metadata_size = read_u64(buf, 52) as i64;
        if read_u32(buf, 60) != size_check(data_size, metadata_size) {
            return Err(Error::new(ErrorKind::Protocol).with_message("event frame size check mismatch"));
        }

        let frame = Self {
            seq,
            timestamp_ns,
            object_id,
            data_size,
            metadata_size,
        };
        frame.validate()?;
        Ok(frame)
    }

    // Either both sizes are the deletion sentinel or both are non-negative.
    pub fn validate(&self) -> Result<(), Error> {
        if self.is_deletion() {
            return Ok(());
        }
        if self.data_size < 0 || self.metadata_size < 0 {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("event frame sizes are neither a creation nor a deletion")
                .with_object(self.object_id));
        }
        Ok(())
    }
}

fn size_check(data_size: i64, metadata_size: i64) -> u32 {
    (data_size as u64 as u32) ^ (metadata_size as u64 as u32).rotate_left(16) ^ 0xFFFF_FFFF
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
