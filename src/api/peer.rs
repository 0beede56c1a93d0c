//! Purpose: Blocking HTTP client for the peer manager protocol (`/v0/...`, JSON + raw bytes).
//! Exports: `PeerClient`, `LocateResult`, `RemoteObject`.
//! Role: Carries fetch/transfer requests to the local manager and object bytes between managers.
//! Invariants: Transport failures surface as `Connectivity`; error envelopes keep their kind.
//! Invariants: Base URLs are origin-only (`http(s)://host:port/`).
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use crate::core::object_id::ObjectId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

type ApiResult<T> = Result<T, Error>;

pub const DATA_SIZE_HEADER: &str = "shmstore-data-size";
pub const METADATA_SIZE_HEADER: &str = "shmstore-metadata-size";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<PeerClientInner>,
}

struct PeerClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

/// Which of the asked-about objects a manager can see.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocateResult {
    /// Sealed in the manager's own store.
    pub local: Vec<ObjectId>,
    /// Sealed in one of the manager's peers.
    pub remote: Vec<ObjectId>,
}

/// A sealed object's bytes as served by a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteObject {
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

#[derive(Serialize)]
struct ObjectIdsRequest {
    object_ids: Vec<ObjectId>,
}

#[derive(Serialize)]
struct TransferRequest {
    object_id: ObjectId,
    address: String,
    port: u16,
}

#[derive(Deserialize)]
struct AcceptedEnvelope {
    accepted: usize,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    sealed: bool,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    object: Option<String>,
}

impl PeerClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Ok(Self {
            inner: Arc::new(PeerClientInner { base_url, agent }),
        })
    }

    /// Client for the manager listening at `address:port`.
    pub fn for_address(address: &str, port: u16) -> ApiResult<Self> {
        if address.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("peer address is empty"));
        }
        if port == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("peer port must be non-zero"));
        }
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{address}]")
        } else {
            address.to_string()
        };
        Self::new(format!("http://{host}:{port}"))
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn health(&self) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["healthz"])?;
        let _: serde_json::Value = self.request_json::<(), _>("GET", &url, &())?;
        Ok(())
    }

    /// Asks the manager to pull `object_ids` from its peers into its store.
    pub fn fetch(&self, object_ids: &[ObjectId]) -> ApiResult<usize> {
        let url = build_url(&self.inner.base_url, &["v0", "fetch"])?;
        let body = ObjectIdsRequest {
            object_ids: object_ids.to_vec(),
        };
        let envelope: AcceptedEnvelope = self.request_json("POST", &url, &body)?;
        Ok(envelope.accepted)
    }

    /// Asks the manager to push `object_id` to the manager at `address:port`.
    pub fn transfer(&self, object_id: &ObjectId, address: &str, port: u16) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["v0", "transfer"])?;
        let body = TransferRequest {
            object_id: *object_id,
            address: address.to_string(),
            port,
        };
        let _: AcceptedEnvelope = self
            .request_json("POST", &url, &body)
            .map_err(|err| err.with_object(*object_id))?;
        Ok(())
    }

    pub fn locate(&self, object_ids: &[ObjectId]) -> ApiResult<LocateResult> {
        let url = build_url(&self.inner.base_url, &["v0", "locate"])?;
        let body = ObjectIdsRequest {
            object_ids: object_ids.to_vec(),
        };
        self.request_json("POST", &url, &body)
    }

    /// Whether the manager's own store holds `object_id` sealed.
    pub fn status(&self, object_id: &ObjectId) -> ApiResult<bool> {
        let hex = object_id.to_hex();
        let url = build_url(&self.inner.base_url, &["v0", "objects", &hex, "status"])?;
        let envelope: StatusEnvelope = self
            .request_json::<(), _>("GET", &url, &())
            .map_err(|err| err.with_object(*object_id))?;
        Ok(envelope.sealed)
    }

    /// Downloads a sealed object, or `None` when the peer does not have it.
    pub fn download(&self, object_id: &ObjectId) -> ApiResult<Option<RemoteObject>> {
        let hex = object_id.to_hex();
        let url = build_url(&self.inner.base_url, &["v0", "objects", &hex])?;
        let response = match self
            .inner
            .agent
            .request("GET", url.as_str())
            .set("Accept", "application/octet-stream")
            .call()
        {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, resp)) => {
                return Err(parse_error_response(code, resp).with_object(*object_id));
            }
            Err(ureq::Error::Transport(err)) => return Err(transport_error(err)),
        };

        let data_size = size_header(&response, DATA_SIZE_HEADER)?;
        let metadata_size = size_header(&response, METADATA_SIZE_HEADER)?;
        let expected = announced_len(data_size, metadata_size)
            .map_err(|err| err.with_object(*object_id))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|err| {
                Error::new(ErrorKind::Connectivity)
                    .with_message("failed to read object body")
                    .with_object(*object_id)
                    .with_source(err)
            })?;
        if body.len() as u64 != expected {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message(format!(
                    "object body is {} bytes, headers announced {expected}",
                    body.len()
                ))
                .with_object(*object_id));
        }
        let metadata = body.split_off(data_size as usize);
        Ok(Some(RemoteObject {
            data: body,
            metadata,
        }))
    }

    /// Uploads a sealed object. `AlreadyExists` means the peer already has it.
    pub fn upload(&self, object_id: &ObjectId, data: &[u8], metadata: &[u8]) -> ApiResult<()> {
        let hex = object_id.to_hex();
        let url = build_url(&self.inner.base_url, &["v0", "objects", &hex])?;
        let mut body = Vec::with_capacity(data.len() + metadata.len());
        body.extend_from_slice(data);
        body.extend_from_slice(metadata);
        let response = self
            .inner
            .agent
            .request("PUT", url.as_str())
            .set("Content-Type", "application/octet-stream")
            .set(DATA_SIZE_HEADER, &data.len().to_string())
            .set(METADATA_SIZE_HEADER, &metadata.len().to_string())
            .send_bytes(&body);
        match response {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                Err(parse_error_response(code, resp).with_object(*object_id))
            }
            Err(ureq::Error::Transport(err)) => Err(transport_error(err)),
        }
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        let response = if method == "GET" {
            request.call()
        } else {
            let payload = serde_json::to_string(body).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode request json")
                    .with_source(err)
            })?;
            request
                .set("Content-Type", "application/json")
                .send_string(&payload)
        };

        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(transport_error(err)),
        }
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("base_url", &self.inner.base_url.as_str())
            .finish()
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid peer base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("peer base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("peer base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("peer base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn size_header(response: &ureq::Response, name: &str) -> ApiResult<u64> {
    response
        .header(name)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            Error::new(ErrorKind::Protocol).with_message(format!("missing or invalid {name} header"))
        })
}

fn announced_len(data_size: u64, metadata_size: u64) -> ApiResult<u64> {
    data_size.checked_add(metadata_size).ok_or_else(|| {
        Error::new(ErrorKind::Protocol).with_message(format!(
            "size headers overflow: {data_size} + {metadata_size}"
        ))
    })
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Connectivity)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn transport_error(err: ureq::Transport) -> Error {
    Error::new(ErrorKind::Connectivity)
        .with_message("peer request failed")
        .with_source(err)
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("peer error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let kind = ErrorKind::parse(&remote.kind).unwrap_or(ErrorKind::Internal);
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(object) = remote.object.and_then(|hex| ObjectId::from_hex(&hex).ok()) {
        err = err.with_object(object);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        423 => ErrorKind::Busy,
        507 => ErrorKind::StoreFull,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Protocol,
    }
}
