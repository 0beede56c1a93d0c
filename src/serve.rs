//! Purpose: Peer manager: HTTP/JSON server that moves objects between stores.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum server over one local store plus a list of peer managers.
//! Invariants: Error envelopes carry the `ErrorKind` name; statuses map from kinds.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Store calls are blocking and run on the blocking pool.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;

use shmstore::api::{
    Client, ConnectOptions, DATA_SIZE_HEADER, Error, ErrorKind, LocateResult,
    METADATA_SIZE_HEADER, ObjectId, PeerClient, Store, StoreOptions,
};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub store_dir: PathBuf,
    pub peers: Vec<String>,
    pub max_body_bytes: u64,
    pub allow_non_loopback: bool,
    /// Initializes the store with this capacity when it does not exist yet.
    pub init_capacity: Option<u64>,
}

struct AppState {
    client: Client,
    peers: Vec<PeerClient>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    if let Some(capacity) = config.init_capacity {
        Store::open_or_create(&config.store_dir, StoreOptions::new(capacity))?;
    }
    let client = Client::connect(ConnectOptions::new(&config.store_dir))?;
    let peers = config
        .peers
        .iter()
        .map(|peer| PeerClient::new(peer.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let state = Arc::new(AppState { client, peers });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/objects/:id", get(get_object).put(put_object))
        .route("/v0/objects/:id/status", get(object_status))
        .route("/v0/locate", post(locate_objects))
        .route("/v0/fetch", post(fetch_objects))
        .route("/v0/transfer", post(transfer_object))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        store = %config.store_dir.display(),
        peers = config.peers.len(),
        "peer manager listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 64M."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn run_blocking<T, F>(task: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("blocking task failed")
            .with_source(err)
    })?
}

#[derive(Debug, Deserialize)]
struct ObjectIdsRequest {
    object_ids: Vec<ObjectId>,
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    object_id: ObjectId,
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    object: Option<String>,
}

async fn healthz() -> Response {
    json_response(StatusCode::OK, json!({ "ok": true }))
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let object_id = match ObjectId::from_hex(&id) {
        Ok(object_id) => object_id,
        Err(err) => return error_response(err),
    };
    let client = state.client.clone();
    let result = run_blocking(move || read_object(&client, &object_id)).await;
    match result {
        Ok(Some((body, data_size, metadata_size))) => {
            let mut response = Body::from(body).into_response();
            let headers = response.headers_mut();
            headers.insert(
                "content-type",
                HeaderValue::from_static("application/octet-stream"),
            );
            headers.insert(DATA_SIZE_HEADER, HeaderValue::from(data_size));
            headers.insert(METADATA_SIZE_HEADER, HeaderValue::from(metadata_size));
            response
        }
        Ok(None) => error_response(
            Error::new(ErrorKind::NotFound)
                .with_message("object is not sealed in this store")
                .with_object(object_id),
        ),
        Err(err) => error_response(err),
    }
}

async fn object_status(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let object_id = match ObjectId::from_hex(&id) {
        Ok(object_id) => object_id,
        Err(err) => return error_response(err),
    };
    let client = state.client.clone();
    match run_blocking(move || client.contains(&object_id)).await {
        Ok(sealed) => json_response(StatusCode::OK, json!({ "sealed": sealed })),
        Err(err) => error_response(err),
    }
}

async fn put_object(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let object_id = match ObjectId::from_hex(&id) {
        Ok(object_id) => object_id,
        Err(err) => return error_response(err),
    };
    let (data_size, metadata_size) = match body_sizes(&headers, body.len()) {
        Ok(sizes) => sizes,
        Err(err) => return error_response(err.with_object(object_id)),
    };
    let client = state.client.clone();
    let result = run_blocking(move || {
        let (data, metadata) = body.split_at(data_size);
        client.put(&object_id, data, metadata)
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(object = %object_id, data_size, metadata_size, "received object");
            json_response(
                StatusCode::CREATED,
                json!({
                    "object_id": object_id,
                    "data_size": data_size,
                    "metadata_size": metadata_size,
                }),
            )
        }
        Err(err) => error_response(err),
    }
}

async fn locate_objects(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ObjectIdsRequest>,
) -> Response {
    let state = Arc::clone(&state);
    match run_blocking(move || locate(&state, &payload.object_ids)).await {
        Ok(located) => json_response(StatusCode::OK, json!(located)),
        Err(err) => error_response(err),
    }
}

async fn fetch_objects(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ObjectIdsRequest>,
) -> Response {
    let accepted = payload.object_ids.len();
    let state = Arc::clone(&state);
    tokio::task::spawn_blocking(move || {
        for object_id in payload.object_ids {
            if let Err(err) = pull_object(&state, &object_id) {
                tracing::warn!(object = %object_id, %err, "fetch failed");
            }
        }
    });
    json_response(StatusCode::ACCEPTED, json!({ "accepted": accepted }))
}

async fn transfer_object(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TransferRequest>,
) -> Response {
    let destination = match PeerClient::for_address(&payload.address, payload.port) {
        Ok(destination) => destination,
        Err(err) => return error_response(err),
    };
    let object_id = payload.object_id;
    let client = state.client.clone();
    match run_blocking(move || client.contains(&object_id)).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                Error::new(ErrorKind::NotFound)
                    .with_message("object is not sealed in this store")
                    .with_object(object_id),
            );
        }
        Err(err) => return error_response(err),
    }

    let client = state.client.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = push_object(&client, &destination, &object_id) {
            tracing::warn!(object = %object_id, peer = %destination.base_url(), %err, "transfer failed");
        }
    });
    json_response(StatusCode::ACCEPTED, json!({ "accepted": 1 }))
}

/// Copies a sealed object out of the store, releasing the reference before returning.
fn read_object(client: &Client, object_id: &ObjectId) -> Result<Option<(Vec<u8>, u64, u64)>, Error> {
    let Some(buffer) = client.get(std::slice::from_ref(object_id), 0)?.pop().flatten() else {
        return Ok(None);
    };
    let mut body = Vec::with_capacity(buffer.data().len() + buffer.metadata().len());
    body.extend_from_slice(buffer.data());
    body.extend_from_slice(buffer.metadata());
    let sizes = (buffer.data_size(), buffer.metadata_size());
    drop(buffer);
    client.release(object_id)?;
    Ok(Some((body, sizes.0, sizes.1)))
}

fn locate(state: &AppState, object_ids: &[ObjectId]) -> Result<LocateResult, Error> {
    let mut located = LocateResult::default();
    for object_id in object_ids {
        if state.client.contains(object_id)? {
            located.local.push(*object_id);
            continue;
        }
        let remote = state.peers.iter().any(|peer| match peer.status(object_id) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::warn!(peer = %peer.base_url(), %err, "peer status query failed");
                false
            }
        });
        if remote {
            located.remote.push(*object_id);
        }
    }
    Ok(located)
}

fn pull_object(state: &AppState, object_id: &ObjectId) -> Result<(), Error> {
    if state.client.contains(object_id)? {
        return Ok(());
    }
    for peer in &state.peers {
        let object = match peer.download(object_id) {
            Ok(Some(object)) => object,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(peer = %peer.base_url(), %err, "peer download failed");
                continue;
            }
        };
        return match state.client.put(object_id, &object.data, &object.metadata) {
            Ok(()) => {
                tracing::info!(object = %object_id, peer = %peer.base_url(), "fetched object");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        };
    }
    Err(Error::new(ErrorKind::NotFound)
        .with_message("no peer has this object")
        .with_object(*object_id))
}

fn push_object(client: &Client, destination: &PeerClient, object_id: &ObjectId) -> Result<(), Error> {
    let Some(buffer) = client.get(std::slice::from_ref(object_id), 0)?.pop().flatten() else {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("object is no longer in this store")
            .with_object(*object_id));
    };
    let uploaded = destination.upload(object_id, buffer.data(), buffer.metadata());
    drop(buffer);
    client.release(object_id)?;
    match uploaded {
        Ok(()) => {
            tracing::info!(object = %object_id, peer = %destination.base_url(), "transferred object");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

fn body_sizes(headers: &HeaderMap, body_len: usize) -> Result<(usize, usize), Error> {
    let data_size = size_header(headers, DATA_SIZE_HEADER)?;
    let metadata_size = size_header(headers, METADATA_SIZE_HEADER)?;
    if data_size.checked_add(metadata_size) != Some(body_len) {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "body is {body_len} bytes but size headers announce {data_size} + {metadata_size}"
        )));
    }
    Ok((data_size, metadata_size))
}

fn size_header(headers: &HeaderMap, name: &str) -> Result<usize, Error> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!("missing or invalid {name} header"))
        })
}

fn json_response(status: StatusCode, payload: serde_json::Value) -> Response {
    (status, Json(payload)).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::StoreFull => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::Connectivity | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str(),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            object: err.object().map(ObjectId::to_hex),
        },
    };
    (status, Json(body)).into_response()
}
