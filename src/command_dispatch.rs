//! Purpose: Hold top-level CLI command dispatch for `shmstore`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command opens at most one `Client` and releases what it gets.
//! Invariants: Helpers in `main.rs` own parsing and output formatting.

use super::*;
use shmstore::api::{Store, StoreOptions, object_digest};
use std::net::SocketAddr;

pub(super) fn dispatch_command(
    command: Command,
    context: CliContext,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "shmstore", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Store { command } => match command {
            StoreCommand::Init { capacity } => {
                let capacity = parse_size(&capacity)?;
                let store = Store::create(&context.store_dir, StoreOptions::new(capacity))
                    .map_err(|err| {
                        if err.kind() == ErrorKind::AlreadyExists && err.hint().is_none() {
                            err.with_hint("The store already exists; use `shmstore store info`.")
                        } else {
                            err
                        }
                    })?;
                emit_json(json!({
                    "store": {
                        "path": store.root().display().to_string(),
                        "capacity": store.capacity(),
                    }
                }));
                Ok(RunOutcome::ok())
            }
            StoreCommand::Info => {
                let client = context.connect()?;
                let info = client.info()?;
                emit_json(json!({
                    "store": {
                        "path": client.store().root().display().to_string(),
                        "capacity": info.capacity,
                        "used_bytes": info.used_bytes,
                        "free_bytes": info.capacity.saturating_sub(info.used_bytes),
                        "objects": info.objects,
                        "sealed": info.sealed,
                    }
                }));
                Ok(RunOutcome::ok())
            }
        },
        Command::Put {
            id,
            random,
            data,
            file,
            metadata,
        } => {
            let object_id = match id {
                Some(id) if !random => parse_object_id(&id)?,
                _ => ObjectId::random()?,
            };
            let payload = read_payload(data, file)?;
            let client = context.connect()?;
            client.put(&object_id, &payload, metadata.as_bytes())?;
            emit_json(json!({
                "object_id": object_id,
                "data_size": payload.len(),
                "metadata_size": metadata.len(),
                "digest": hex_bytes(&object_digest(&payload, metadata.as_bytes())),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Get {
            id,
            timeout_ms,
            metadata,
            out,
        } => {
            let object_id = parse_object_id(&id)?;
            let client = context.connect()?;
            let buffer = client
                .get(&[object_id], timeout_ms)?
                .into_iter()
                .next()
                .flatten()
                .ok_or_else(|| {
                    Error::new(ErrorKind::NotFound)
                        .with_message("object is not available")
                        .with_object(object_id)
                        .with_hint("Pass --timeout-ms to wait for the object to be sealed.")
                })?;
            let bytes = if metadata {
                buffer.metadata()
            } else {
                buffer.data()
            };
            let written = write_bytes(bytes, out);
            drop(buffer);
            client.release(&object_id)?;
            written?;
            Ok(RunOutcome::ok())
        }
        Command::Contains { id } => {
            let object_id = parse_object_id(&id)?;
            let client = context.connect()?;
            let contains = client.contains(&object_id)?;
            emit_json(json!({ "object_id": object_id, "contains": contains }));
            Ok(RunOutcome::ok())
        }
        Command::Hash { id } => {
            let object_id = parse_object_id(&id)?;
            let client = context.connect()?;
            let digest = client.hash(&object_id)?.map(|digest| hex_bytes(&digest));
            emit_json(json!({ "object_id": object_id, "digest": digest }));
            Ok(RunOutcome::ok())
        }
        Command::Delete { ids } => {
            let object_ids = parse_object_ids(&ids)?;
            let client = context.connect()?;
            for object_id in &object_ids {
                client.delete(object_id)?;
            }
            emit_json(json!({ "deleted": object_ids }));
            Ok(RunOutcome::ok())
        }
        Command::Evict { bytes } => {
            let requested = parse_size(&bytes)?;
            let client = context.connect()?;
            let evicted = client.evict(requested)?;
            emit_json(json!({ "requested": requested, "evicted": evicted }));
            Ok(RunOutcome::ok())
        }
        Command::Wait {
            ids,
            num_returns,
            timeout_ms,
        } => {
            let object_ids = parse_object_ids(&ids)?;
            let num_returns = num_returns.unwrap_or(object_ids.len());
            let client = context.connect()?;
            let result = client.wait(&object_ids, num_returns, timeout_ms)?;
            emit_json(json!({
                "ready": result.ready,
                "remaining": result.remaining,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Fetch { ids } => {
            let object_ids = parse_object_ids(&ids)?;
            let client = context.connect()?;
            client.fetch(&object_ids)?;
            emit_json(json!({ "requested": object_ids }));
            Ok(RunOutcome::ok())
        }
        Command::Transfer { id, address, port } => {
            let object_id = parse_object_id(&id)?;
            let client = context.connect()?;
            client.transfer(&address, port, &object_id)?;
            emit_json(json!({
                "object_id": object_id,
                "address": address,
                "port": port,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Subscribe { count, timeout } => {
            let idle = timeout.as_deref().map(parse_duration).transpose()?;
            let client = context.connect()?;
            let mut subscription = client.subscribe()?;
            let mut seen = 0u64;
            while count.is_none_or(|limit| seen < limit) {
                let event = match idle {
                    Some(idle) => match subscription.next_timeout(idle)? {
                        Some(event) => event,
                        None => break,
                    },
                    None => subscription.receive_next()?,
                };
                emit_json_line(&event_json(&event)?)?;
                seen += 1;
            }
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let bind: SocketAddr = args.bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:7710.")
            })?;
            let config = serve::ServeConfig {
                bind,
                store_dir: context.store_dir,
                peers: args.remotes,
                max_body_bytes: parse_size(&args.max_body_bytes)?,
                allow_non_loopback: args.allow_non_loopback,
                init_capacity: args.capacity.as_deref().map(parse_size).transpose()?,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}
