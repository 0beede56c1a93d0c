//! Purpose: Ask the peer manager to move objects between stores.
//! Exports: `Client::fetch`, `Client::transfer`.
//! Role: Thin request layer; copying is done asynchronously by the managers.
//! Invariants: Without a configured peer both calls fail with `Connectivity`.
#![allow(clippy::result_large_err)]

use super::client::{ApiResult, Client};
use super::peer::PeerClient;
use crate::core::error::{Error, ErrorKind};
use crate::core::object_id::ObjectId;

impl Client {
    /// Requests that `object_ids` be pulled into this store from wherever they live.
    ///
    /// Returns once the manager has accepted the request; use `wait` or `get`
    /// to observe arrival.
    pub fn fetch(&self, object_ids: &[ObjectId]) -> ApiResult<()> {
        self.ensure_open()?;
        let peer = self.require_peer()?;
        if object_ids.is_empty() {
            return Ok(());
        }
        let accepted = peer.fetch(object_ids)?;
        tracing::debug!(requested = object_ids.len(), accepted, "fetch requested");
        Ok(())
    }

    /// Requests that a locally sealed object be pushed to the manager at `address:port`.
    pub fn transfer(&self, address: &str, port: u16, object_id: &ObjectId) -> ApiResult<()> {
        self.ensure_open()?;
        let peer = self.require_peer()?;
        if address.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("transfer address is empty"));
        }
        if port == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("transfer port must be non-zero"));
        }
        if !self.contains_in_store(object_id)? {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("object is not sealed in the local store")
                .with_object(*object_id));
        }
        peer.transfer(object_id, address, port)?;
        tracing::debug!(object = %object_id, address, port, "transfer requested");
        Ok(())
    }

    fn require_peer(&self) -> ApiResult<&PeerClient> {
        self.peer().ok_or_else(|| {
            Error::new(ErrorKind::Connectivity)
                .with_message("no peer manager is configured for this connection")
                .with_hint("Connect with ConnectOptions::with_peer_endpoint.")
        })
    }
}
