//! Purpose: `shmstore` CLI entry point: argument parsing, output and error rendering.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable JSON on stdout (`get` writes raw object bytes).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All store access goes through `api::Client`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod serve;

use shmstore::api::{
    Client, ConnectOptions, Error, ErrorKind, NotificationEvent, ObjectId, to_exit_code,
};
use shmstore::store_paths::default_store_dir;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    init_tracing(if matches!(cli.command, Command::Serve(_)) {
        "info"
    } else {
        "warn"
    });
    let context = CliContext {
        store_dir: cli.dir.unwrap_or_else(default_store_dir),
        peer: cli.peer,
    };

    command_dispatch::dispatch_command(cli.command, context)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

/// Global options every command sees.
struct CliContext {
    store_dir: PathBuf,
    peer: Option<String>,
}

impl CliContext {
    fn connect(&self) -> Result<Client, Error> {
        let mut options = ConnectOptions::new(&self.store_dir);
        if let Some(peer) = &self.peer {
            options = options.with_peer_endpoint(peer.clone());
        }
        Client::connect(options)
    }
}

#[derive(Parser)]
#[command(
    name = "shmstore",
    version,
    about = "Shared-memory object store for local IPC",
    long_about = None,
    before_help = r#"Processes share immutable objects through memory-mapped segments.

Mental model:
  - `put` creates, fills and seals an object (write once)
  - `get` reads a sealed object, waiting for it if asked to
  - `subscribe` follows seal and delete events
"#,
    after_help = r#"EXAMPLES
  $ shmstore store init --capacity 256M
  $ shmstore put 0123456789abcdef0123456789abcdef01234567 --data hello
  $ shmstore get 0123456789abcdef0123456789abcdef01234567 --timeout-ms 1000
  $ shmstore subscribe --count 1

LEARN MORE
  $ shmstore <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Store directory (default: $SHMSTORE_DIR, else /dev/shm/shmstore)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Peer manager base URL used by wait, fetch and transfer"
    )]
    peer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Initialize or inspect the store",
        after_help = r#"EXAMPLES
  $ shmstore store init --capacity 1G
  $ shmstore store info"#
    )]
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    #[command(
        about = "Create, fill and seal one object",
        long_about = r#"Create an object, copy the payload into it, seal it and drop the reference.

The payload comes from --data, --file, or stdin (in that order)."#,
        after_help = r#"EXAMPLES
  $ shmstore put --random --data hello
  $ shmstore put 0123456789abcdef0123456789abcdef01234567 --file frame.bin --metadata png
  $ printf 'bytes' | shmstore put --random"#
    )]
    Put {
        #[arg(help = "Object id (40 hex chars)", required_unless_present = "random")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id", help = "Use a random object id")]
        random: bool,
        #[arg(long, help = "Inline payload", conflicts_with = "file")]
        data: Option<String>,
        #[arg(long, help = "Read payload from a file", value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "", help = "Metadata bytes stored after the data")]
        metadata: String,
    },
    #[command(
        about = "Write a sealed object's data to stdout",
        after_help = r#"EXAMPLES
  $ shmstore get 0123456789abcdef0123456789abcdef01234567
  $ shmstore get 0123456789abcdef0123456789abcdef01234567 --timeout-ms -1 --out frame.bin"#
    )]
    Get {
        #[arg(help = "Object id (40 hex chars)")]
        id: String,
        #[arg(
            long,
            default_value_t = 0,
            allow_negative_numbers = true,
            help = "How long to wait for the object to be sealed (-1 waits forever)"
        )]
        timeout_ms: i64,
        #[arg(long, help = "Write metadata instead of data")]
        metadata: bool,
        #[arg(long, help = "Write to a file instead of stdout", value_hint = ValueHint::FilePath)]
        out: Option<PathBuf>,
    },
    #[command(about = "Report whether an object is sealed in the store")]
    Contains {
        #[arg(help = "Object id (40 hex chars)")]
        id: String,
    },
    #[command(about = "SHA-256 digest of an object's data and metadata")]
    Hash {
        #[arg(help = "Object id (40 hex chars)")]
        id: String,
    },
    #[command(arg_required_else_help = true, about = "Delete sealed objects")]
    Delete {
        #[arg(required = true, help = "Object ids (40 hex chars)")]
        ids: Vec<String>,
    },
    #[command(
        about = "Evict unreferenced sealed objects, oldest first",
        after_help = r#"EXAMPLES
  $ shmstore evict 64M"#
    )]
    Evict {
        #[arg(help = "Bytes to free (bytes or K/M/G)")]
        bytes: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Wait until some objects are available",
        after_help = r#"EXAMPLES
  $ shmstore wait <id1> <id2> <id3> --num-returns 2 --timeout-ms 5000"#
    )]
    Wait {
        #[arg(required = true, help = "Object ids (40 hex chars)")]
        ids: Vec<String>,
        #[arg(long, short = 'k', help = "How many must be ready (default: all)")]
        num_returns: Option<usize>,
        #[arg(
            long,
            default_value_t = -1,
            allow_negative_numbers = true,
            help = "Maximum wait in milliseconds (-1 waits forever)"
        )]
        timeout_ms: i64,
    },
    #[command(arg_required_else_help = true, about = "Ask the peer manager to pull objects here")]
    Fetch {
        #[arg(required = true, help = "Object ids (40 hex chars)")]
        ids: Vec<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Ask the peer manager to push an object to another manager"
    )]
    Transfer {
        #[arg(help = "Object id (40 hex chars)")]
        id: String,
        #[arg(long, help = "Destination manager host")]
        address: String,
        #[arg(long, help = "Destination manager port")]
        port: u16,
    },
    #[command(
        about = "Print seal and delete events as JSON lines",
        after_help = r#"EXAMPLES
  $ shmstore subscribe
  $ shmstore subscribe --count 10 --timeout 30s"#
    )]
    Subscribe {
        #[arg(long, help = "Exit after this many events")]
        count: Option<u64>,
        #[arg(long, help = "Exit after this long without events (e.g. 500ms, 10s)")]
        timeout: Option<String>,
    },
    #[command(about = "Run the peer manager HTTP server")]
    Serve(ServeArgs),
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum StoreCommand {
    #[command(about = "Create the store directory")]
    Init {
        #[arg(long, default_value = "64M", help = "Store capacity (bytes or K/M/G)")]
        capacity: String,
    },
    #[command(about = "Show capacity and usage")]
    Info,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7710", help = "Address to listen on")]
    bind: String,
    #[arg(
        long = "remote",
        value_name = "URL",
        help = "Peer manager to pull from and locate objects at (repeatable)"
    )]
    remotes: Vec<String>,
    #[arg(long, help = "Initialize the store with this capacity if it is missing")]
    capacity: Option<String>,
    #[arg(long, default_value = "64M", help = "Largest accepted request body")]
    max_body_bytes: String,
    #[arg(long, help = "Allow binding a non-loopback address")]
    allow_non_loopback: bool,
}

fn init_tracing(default_directive: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn parse_object_id(input: &str) -> Result<ObjectId, Error> {
    ObjectId::from_hex(input.trim()).map_err(|err| {
        err.with_hint("Object ids are 40 hex characters, e.g. 0123456789abcdef0123456789abcdef01234567.")
    })
}

fn parse_object_ids(inputs: &[String]) -> Result<Vec<ObjectId>, Error> {
    inputs.iter().map(|input| parse_object_id(input)).collect()
}

/// Splits `64M` or `250ms` into the leading integer and its unit suffix.
fn split_quantity(input: &str) -> Option<(u64, &str)> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let value = trimmed[..digits_end].parse().ok()?;
    Some((value, trimmed[digits_end..].trim()))
}

fn parse_size(input: &str) -> Result<u64, Error> {
    let invalid = |message: &str| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{message}: {input}"))
            .with_hint("Use bytes or K/M/G (e.g. 64M).")
    };
    let (value, unit) = split_quantity(input).ok_or_else(|| invalid("invalid size"))?;
    let shift = match unit.to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        _ => return Err(invalid("invalid size suffix")),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| invalid("size overflow"))
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid duration: {input}"))
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let (value, unit) = split_quantity(input).ok_or_else(invalid)?;
    let millis_per_unit = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(value.saturating_mul(millis_per_unit)))
}

fn read_payload(data: Option<String>, file: Option<PathBuf>) -> Result<Vec<u8>, Error> {
    if let Some(data) = data {
        return Ok(data.into_bytes());
    }
    if let Some(path) = file {
        return std::fs::read(&path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read payload file")
                .with_path(path)
                .with_source(err)
        });
    }
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("no payload provided")
            .with_hint("Pass --data, --file, or pipe bytes on stdin."));
    }
    let mut buf = Vec::new();
    stdin.read_to_end(&mut buf).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read stdin")
            .with_source(err)
    })?;
    Ok(buf)
}

fn write_bytes(bytes: &[u8], out: Option<PathBuf>) -> Result<(), Error> {
    match out {
        Some(path) => std::fs::write(&path, bytes).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write output file")
                .with_path(path)
                .with_source(err)
        }),
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(bytes)
                .and_then(|()| stdout.flush())
                .map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write stdout")
                        .with_source(err)
                })
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn format_ts(timestamp_ns: u64) -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    let ts =
        time::OffsetDateTime::from_unix_timestamp_nanos(timestamp_ns as i128).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid timestamp")
                .with_source(err)
        })?;
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

fn event_json(event: &NotificationEvent) -> Result<Value, Error> {
    let kind = if event.is_deletion() {
        "deleted"
    } else {
        "created"
    };
    Ok(json!({
        "seq": event.seq,
        "time": format_ts(event.timestamp_ns)?,
        "event": kind,
        "object_id": event.object_id,
        "data_size": event.data_size,
        "metadata_size": event.metadata_size,
    }))
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_json_line(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")
        .and_then(|()| stdout.flush())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write stdout")
                .with_source(err)
        })
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => err.with_hint("Store is busy (another process holds the lock). Retry."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and free space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Store appears corrupt. Remove the store directory and run `shmstore store init`.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    match err.message() {
        Some(message) => message.to_string(),
        None => err.kind().as_str().to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut body = Map::new();
    body.insert("kind".to_string(), json!(err.kind().as_str()));
    body.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        body.insert("hint".to_string(), json!(hint));
    }
    if let Some(object) = err.object() {
        body.insert("object_id".to_string(), json!(object));
    }
    if let Some(path) = err.path() {
        body.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        body.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": body })
}

fn error_text(err: &Error) -> String {
    let details = [
        ("hint", err.hint().map(str::to_string)),
        ("object", err.object().map(ObjectId::to_hex)),
        ("path", err.path().map(|path| path.display().to_string())),
        ("caused by", error_causes(err).into_iter().next()),
    ];
    let mut text = format!("error: {}", error_message(err));
    for (label, value) in details {
        if let Some(value) = value {
            text.push_str(&format!("\n  {label}: {value}"));
        }
    }
    text
}

fn clap_error_summary(err: &clap::Error) -> String {
    err.to_string()
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("error:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

/// Points at the `--help` of the deepest subcommand named in clap's usage line.
fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let subcommands: Vec<&str> = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(|usage| {
            usage
                .split_whitespace()
                .skip_while(|token| *token != "shmstore")
                .skip(1)
                .take_while(|token| token.starts_with(|ch: char| ch.is_ascii_alphanumeric()))
                .collect()
        })
        .unwrap_or_default();
    if subcommands.is_empty() {
        "Try `shmstore --help`.".to_string()
    } else {
        format!("Try `shmstore {} --help`.", subcommands.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Cli, Command, ErrorKind, StoreCommand, clap_error_hint, error_json, error_text, hex_bytes,
        parse_duration, parse_size,
    };
    use clap::Parser;
    use shmstore::api::{Error, ObjectId};
    use std::time::Duration;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("512").expect("bytes"), 512);
        assert_eq!(parse_size("4K").expect("k"), 4096);
        assert_eq!(parse_size("64M").expect("m"), 64 * 1024 * 1024);
        assert_eq!(parse_size("x").expect_err("bad").kind(), ErrorKind::Usage);
        assert_eq!(parse_size("1T").expect_err("suffix").kind(), ErrorKind::Usage);
    }

    #[test]
    fn durations_need_units() {
        assert_eq!(parse_duration("250ms").expect("ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").expect("s"), Duration::from_secs(2));
        assert_eq!(parse_duration("10").expect_err("unit").kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_json_names_kind_and_object() {
        let err = Error::new(ErrorKind::StoreFull)
            .with_message("store is full")
            .with_object(ObjectId::new([0xab; 20]));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "StoreFull");
        assert_eq!(value["error"]["object_id"], "ab".repeat(20));
    }

    #[test]
    fn error_text_lists_details_under_the_message() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("object is not available")
            .with_hint("Pass --timeout-ms.");
        assert_eq!(
            error_text(&err),
            "error: object is not available\n  hint: Pass --timeout-ms."
        );
    }

    #[test]
    fn clap_hint_names_the_subcommand() {
        let id = "00".repeat(20);
        let Err(err) = Cli::try_parse_from(["shmstore", "put", &id, "--bogus"]) else {
            panic!("expected a parse error");
        };
        assert_eq!(clap_error_hint(&err), "Try `shmstore put --help`.");
    }

    #[test]
    fn hex_bytes_is_lowercase() {
        assert_eq!(hex_bytes(&[0x00, 0xff, 0x1a]), "00ff1a");
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["shmstore", "store", "init", "--dir", "/tmp/x"])
            .expect("parse");
        assert_eq!(cli.dir.as_deref(), Some(std::path::Path::new("/tmp/x")));
        assert!(matches!(
            cli.command,
            Command::Store {
                command: StoreCommand::Init { .. }
            }
        ));
    }

    #[test]
    fn get_accepts_negative_timeout() {
        let id = "00".repeat(20);
        let cli = Cli::try_parse_from(["shmstore", "get", &id, "--timeout-ms", "-1"])
            .expect("parse");
        match cli.command {
            Command::Get { timeout_ms, .. } => assert_eq!(timeout_ms, -1),
            _ => panic!("expected get"),
        }
    }
}
