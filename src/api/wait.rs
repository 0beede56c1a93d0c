//! Purpose: Block until some number of objects become available locally or at a peer.
//! Exports: `WaitResult`, `ObjectRequest`, `ObjectStatus`, `QueryScope`, `MAX_WAIT_TIMEOUT_MS`.
//! Role: Readiness queries over the store (and the peer manager when one is configured).
//! Invariants: Argument errors are raised before the store is touched.
//! Invariants: `ready` keeps input order; `ready` and `remaining` partition the distinct ids.
#![allow(clippy::result_large_err)]

use super::client::{ApiResult, Client, Deadline};
use crate::core::error::{Error, ErrorKind};
use crate::core::object_id::ObjectId;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Largest accepted wait timeout, in milliseconds.
pub const MAX_WAIT_TIMEOUT_MS: i64 = 1 << 30;

const REMOTE_QUERY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryScope {
    Local,
    Anywhere,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectStatus {
    Local,
    Remote,
    Nonexistent,
}

impl ObjectStatus {
    pub fn is_ready_for(self, scope: QueryScope) -> bool {
        match (self, scope) {
            (ObjectStatus::Local, _) => true,
            (ObjectStatus::Remote, QueryScope::Anywhere) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjectRequest {
    pub object_id: ObjectId,
    pub scope: QueryScope,
    pub status: ObjectStatus,
}

impl ObjectRequest {
    pub fn new(object_id: ObjectId, scope: QueryScope) -> Self {
        Self {
            object_id,
            scope,
            status: ObjectStatus::Nonexistent,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready_for(self.scope)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WaitResult {
    pub ready: Vec<ObjectId>,
    pub remaining: Vec<ObjectId>,
}

pub fn validate_wait_args(len: usize, num_returns: usize, timeout_ms: i64) -> ApiResult<()> {
    if num_returns > len {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "num_returns ({num_returns}) exceeds the number of object ids ({len})"
        )));
    }
    if timeout_ms > MAX_WAIT_TIMEOUT_MS {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "timeout_ms ({timeout_ms}) exceeds the maximum of {MAX_WAIT_TIMEOUT_MS}"
        )));
    }
    Ok(())
}

/// First `num_returns` ready ids in request order; everything else is remaining.
///
/// Duplicate ids collapse to their first occurrence in both lists.
pub fn select_ready(requests: &[ObjectRequest], num_returns: usize) -> WaitResult {
    let mut seen = HashSet::new();
    let mut result = WaitResult::default();
    for request in requests {
        if !seen.insert(request.object_id) {
            continue;
        }
        if request.is_ready() && result.ready.len() < num_returns {
            result.ready.push(request.object_id);
        } else {
            result.remaining.push(request.object_id);
        }
    }
    result
}

impl Client {
    /// Waits until `num_returns` of `object_ids` are sealed locally or at a peer.
    ///
    /// Returns early when enough are ready, otherwise once `timeout_ms` elapses
    /// (negative waits forever). Ids that never showed up are simply remaining.
    pub fn wait(
        &self,
        object_ids: &[ObjectId],
        num_returns: usize,
        timeout_ms: i64,
    ) -> ApiResult<WaitResult> {
        validate_wait_args(object_ids.len(), num_returns, timeout_ms)?;
        self.ensure_open()?;
        let mut requests: Vec<ObjectRequest> = object_ids
            .iter()
            .map(|object_id| ObjectRequest::new(*object_id, QueryScope::Anywhere))
            .collect();
        if num_returns > 0 {
            self.wait_requests(&mut requests, num_returns, timeout_ms)?;
        }
        Ok(select_ready(&requests, num_returns))
    }

    /// Fills in each request's status, returning how many distinct ids are ready for their scope.
    ///
    /// Duplicate ids count once, so a request list with fewer distinct ids than
    /// `num_returns` returns as soon as all of them are ready.
    pub fn wait_requests(
        &self,
        requests: &mut [ObjectRequest],
        num_returns: usize,
        timeout_ms: i64,
    ) -> ApiResult<usize> {
        validate_wait_args(requests.len(), num_returns, timeout_ms)?;
        self.ensure_open()?;
        let deadline = Deadline::after_ms(timeout_ms);
        let mut remote = HashSet::new();
        let mut last_remote_query: Option<Instant> = None;
        let distinct: HashSet<ObjectId> =
            requests.iter().map(|request| request.object_id).collect();
        let target = num_returns.min(distinct.len());

        loop {
            let mut ready = HashSet::new();
            for request in requests.iter_mut() {
                request.status = if self.contains_in_store(&request.object_id)? {
                    ObjectStatus::Local
                } else if remote.contains(&request.object_id) {
                    ObjectStatus::Remote
                } else {
                    ObjectStatus::Nonexistent
                };
                if request.is_ready() {
                    ready.insert(request.object_id);
                }
            }

            if ready.len() < target {
                let due = last_remote_query
                    .is_none_or(|at| at.elapsed() >= REMOTE_QUERY_INTERVAL);
                if due {
                    if let Some(found) = self.query_remote(requests)? {
                        last_remote_query = Some(Instant::now());
                        remote = found;
                        for request in requests.iter_mut() {
                            if request.status == ObjectStatus::Nonexistent
                                && remote.contains(&request.object_id)
                            {
                                request.status = ObjectStatus::Remote;
                                if request.is_ready() {
                                    ready.insert(request.object_id);
                                }
                            }
                        }
                    }
                }
            }

            if ready.len() >= target {
                return Ok(ready.len());
            }
            let Some(tick) = deadline.next_tick() else {
                return Ok(ready.len());
            };
            self.notifier().wait_tick(tick);
            self.ensure_open()?;
        }
    }

    /// Ids the peer manager reports as sealed anywhere, or `None` without a peer.
    fn query_remote(&self, requests: &[ObjectRequest]) -> ApiResult<Option<HashSet<ObjectId>>> {
        let Some(peer) = self.peer() else {
            return Ok(None);
        };
        let pending: Vec<ObjectId> = requests
            .iter()
            .filter(|request| {
                request.scope == QueryScope::Anywhere && request.status != ObjectStatus::Local
            })
            .map(|request| request.object_id)
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        let located = peer.locate(&pending)?;
        Ok(Some(
            located
                .local
                .into_iter()
                .chain(located.remote)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_WAIT_TIMEOUT_MS, ObjectRequest, ObjectStatus, QueryScope, select_ready,
        validate_wait_args,
    };
    use crate::core::error::ErrorKind;
    use crate::core::object_id::ObjectId;

    fn id(tag: u8) -> ObjectId {
        ObjectId::new([tag; 20])
    }

    fn request(tag: u8, status: ObjectStatus) -> ObjectRequest {
        ObjectRequest {
            object_id: id(tag),
            scope: QueryScope::Anywhere,
            status,
        }
    }

    #[test]
    fn argument_limits() {
        validate_wait_args(2, 2, MAX_WAIT_TIMEOUT_MS).expect("at limit");
        let err = validate_wait_args(2, 3, 0).expect_err("too many");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = validate_wait_args(2, 1, MAX_WAIT_TIMEOUT_MS + 1).expect_err("too long");
        assert_eq!(err.kind(), ErrorKind::Usage);
        validate_wait_args(0, 0, -1).expect("infinite");
    }

    #[test]
    fn ready_keeps_input_order_and_caps_at_k() {
        let requests = [
            request(1, ObjectStatus::Nonexistent),
            request(2, ObjectStatus::Local),
            request(3, ObjectStatus::Remote),
            request(4, ObjectStatus::Local),
        ];
        let result = select_ready(&requests, 2);
        assert_eq!(result.ready, vec![id(2), id(3)]);
        assert_eq!(result.remaining, vec![id(1), id(4)]);
    }

    #[test]
    fn duplicates_collapse() {
        let requests = [
            request(1, ObjectStatus::Local),
            request(1, ObjectStatus::Local),
            request(2, ObjectStatus::Nonexistent),
            request(2, ObjectStatus::Nonexistent),
        ];
        let result = select_ready(&requests, 2);
        assert_eq!(result.ready, vec![id(1)]);
        assert_eq!(result.remaining, vec![id(2)]);
    }

    #[test]
    fn local_scope_ignores_remote_copies() {
        let mut remote = request(5, ObjectStatus::Remote);
        remote.scope = QueryScope::Local;
        assert!(!remote.is_ready());
        let result = select_ready(&[remote], 1);
        assert!(result.ready.is_empty());
        assert_eq!(result.remaining, vec![id(5)]);
    }
}
