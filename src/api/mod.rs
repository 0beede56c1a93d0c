//! Purpose: Define the stable public Rust API boundary for the object store.
//! Exports: Connection, buffer, wait, transfer and notification types plus core value types.
//! Role: Public surface used by the CLI, the peer manager and library callers.
//! Invariants: Callers reach storage primitives only through `Client`.
//! Invariants: Internal modules remain private and are not directly exposed.

mod buffer;
mod client;
mod notification;
mod peer;
mod transfer;
mod wait;

pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::object_id::{OBJECT_ID_LEN, ObjectId};
pub use crate::core::store::{Store, StoreOptions};
pub use buffer::{ObjectBuffer, ObjectWriter};
pub use client::{
    ApiResult, Client, ConnectOptions, ConnectionState, ObjectDigest, StoreInfo, object_digest,
};
pub use notification::{NotificationEvent, Subscription};
pub use peer::{DATA_SIZE_HEADER, LocateResult, METADATA_SIZE_HEADER, PeerClient, RemoteObject};
pub use wait::{
    MAX_WAIT_TIMEOUT_MS, ObjectRequest, ObjectStatus, QueryScope, WaitResult, select_ready,
    validate_wait_args,
};
