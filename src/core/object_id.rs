//! Purpose: Fixed-width opaque object identifier used as the key everywhere.
//! Exports: `ObjectId`, `OBJECT_ID_LEN`.
//! Role: Leaf value type; hex text form for file names, logs, CLI and HTTP.
//! Invariants: Always exactly `OBJECT_ID_LEN` bytes; immutable once built.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const OBJECT_ID_LEN: usize = 20;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub const fn new(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; OBJECT_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "object id must be {OBJECT_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn from_hex(text: &str) -> Result<Self, Error> {
        if text.len() != OBJECT_ID_LEN * 2 {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "object id must be {} hex characters",
                OBJECT_ID_LEN * 2
            )));
        }
        let mut out = [0u8; OBJECT_ID_LEN];
        let bytes = text.as_bytes();
        for (index, slot) in out.iter_mut().enumerate() {
            let high = hex_value(bytes[index * 2])?;
            let low = hex_value(bytes[index * 2 + 1])?;
            *slot = (high << 4) | low;
        }
        Ok(Self(out))
    }

    /// Random id drawn from the OS entropy source.
    pub fn random() -> Result<Self, Error> {
        let mut out = [0u8; OBJECT_ID_LEN];
        getrandom::fill(&mut out).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to generate object id: {err}"))
        })?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(OBJECT_ID_LEN * 2);
        for byte in self.0 {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

fn hex_value(byte: u8) -> Result<u8, Error> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(Error::new(ErrorKind::Usage).with_message("object id contains non-hex characters")),
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_hex(value)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ObjectId> for String {
    fn from(value: ObjectId) -> Self {
        value.to_hex()
    }
}
