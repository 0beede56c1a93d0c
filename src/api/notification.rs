//! Purpose: Subscribe to seal and delete notifications for a store.
//! Exports: `Subscription`, `NotificationEvent`.
//! Role: Tails the store event log from the moment of subscription.
//! Invariants: Events arrive in seal/delete order with increasing `seq`.
//! Invariants: Deletions carry `data_size == metadata_size == -1`.
#![allow(clippy::result_large_err)]

use super::client::{ApiResult, Client, ConnectionState, Deadline};
use crate::core::error::{Error, ErrorKind};
use crate::core::events::{CursorResult, EventCursor};
use crate::core::frame::EventFrame;
use crate::core::object_id::ObjectId;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotificationEvent {
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
    pub seq: u64,
    pub timestamp_ns: u64,
}

impl NotificationEvent {
    pub fn is_deletion(&self) -> bool {
        self.data_size < 0 && self.metadata_size < 0
    }
}

impl From<EventFrame> for NotificationEvent {
    fn from(frame: EventFrame) -> Self {
        Self {
            object_id: frame.object_id,
            data_size: frame.data_size,
            metadata_size: frame.metadata_size,
            seq: frame.seq,
            timestamp_ns: frame.timestamp_ns,
        }
    }
}

pub struct Subscription {
    client: Client,
    cursor: EventCursor,
}

impl Client {
    /// Starts a subscription that sees every seal and delete after this call.
    pub fn subscribe(&self) -> ApiResult<Subscription> {
        self.ensure_open()?;
        let cursor = EventCursor::at_end(self.store().events_path())?;
        Ok(Subscription {
            client: self.clone(),
            cursor,
        })
    }

    /// Blocks for the next event on `subscription`.
    pub fn receive_next(&self, subscription: &mut Subscription) -> ApiResult<NotificationEvent> {
        subscription.receive_next()
    }
}

impl Subscription {
    pub fn receive_next(&mut self) -> ApiResult<NotificationEvent> {
        loop {
            if let Some(event) = self.try_next()? {
                return Ok(event);
            }
            self.client.notifier().wait_tick(super::client::POLL_TICK);
        }
    }

    /// Next event if one is already available.
    pub fn try_next(&mut self) -> ApiResult<Option<NotificationEvent>> {
        if self.client.state() == ConnectionState::Closed {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("notification channel is closed"));
        }
        match self.cursor.next().map_err(into_protocol)? {
            CursorResult::Event(frame) => Ok(Some(frame.into())),
            CursorResult::WouldBlock => Ok(None),
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> ApiResult<Option<NotificationEvent>> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(event) = self.try_next()? {
                return Ok(Some(event));
            }
            let Some(tick) = deadline.next_tick() else {
                return Ok(None);
            };
            self.client.notifier().wait_tick(tick);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("client", &self.client)
            .finish()
    }
}

fn into_protocol(err: Error) -> Error {
    if err.kind() == ErrorKind::Protocol {
        return err;
    }
    Error::new(ErrorKind::Protocol)
        .with_message("failed to read notification channel")
        .with_source(err)
}
