// CLI integration tests for store, object and wait flows.
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;

fn cmd(dir: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_shmstore");
    let mut command = Command::new(exe);
    command.arg("--dir").arg(dir);
    command
}

fn parse_json(output: &[u8]) -> Value {
    let text = std::str::from_utf8(output).expect("utf8");
    serde_json::from_str(text.trim()).expect("valid json")
}

fn run(dir: &Path, args: &[&str]) -> Output {
    cmd(dir).args(args).output().expect("run shmstore")
}

fn init(dir: &Path) {
    let output = run(dir, &["store", "init", "--capacity", "1M"]);
    assert!(output.status.success(), "init failed: {output:?}");
}

const ID_A: &str = "a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0";
const ID_B: &str = "b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0";

#[test]
fn store_init_and_info() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");

    let output = run(&dir, &["store", "init", "--capacity", "64K"]);
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["store"]["capacity"], 65_536);

    let output = run(&dir, &["store", "info"]);
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["store"]["used_bytes"], 0);
    assert_eq!(value["store"]["free_bytes"], 65_536);
    assert_eq!(value["store"]["objects"], 0);

    let output = run(&dir, &["store", "init"]);
    assert_eq!(output.status.code(), Some(4));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "AlreadyExists");
}

#[test]
fn put_get_hash_delete_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    init(&dir);

    let output = run(&dir, &["put", ID_A, "--data", "hello", "--metadata", "txt"]);
    assert!(output.status.success(), "put failed: {output:?}");
    let put = parse_json(&output.stdout);
    assert_eq!(put["object_id"], ID_A);
    assert_eq!(put["data_size"], 5);
    assert_eq!(put["metadata_size"], 3);

    let output = run(&dir, &["get", ID_A]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"hello");

    let output = run(&dir, &["get", ID_A, "--metadata"]);
    assert_eq!(output.stdout, b"txt");

    let output = run(&dir, &["hash", ID_A]);
    let hash = parse_json(&output.stdout);
    assert_eq!(hash["digest"], put["digest"]);

    let output = run(&dir, &["contains", ID_A]);
    assert_eq!(parse_json(&output.stdout)["contains"], true);

    let output = run(&dir, &["delete", ID_A]);
    assert!(output.status.success());
    assert_eq!(parse_json(&output.stdout)["deleted"][0], ID_A);

    let output = run(&dir, &["contains", ID_A]);
    assert_eq!(parse_json(&output.stdout)["contains"], false);

    let output = run(&dir, &["get", ID_A]);
    assert_eq!(output.status.code(), Some(3));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "NotFound");
    assert_eq!(err["error"]["object_id"], ID_A);

    let output = run(&dir, &["hash", ID_A]);
    assert!(output.status.success());
    assert!(parse_json(&output.stdout)["digest"].is_null());
}

#[test]
fn put_reads_stdin_with_random_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    init(&dir);

    let mut child = cmd(&dir)
        .args(["put", "--random"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"piped bytes")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success(), "put failed: {output:?}");
    let put = parse_json(&output.stdout);
    let object_id = put["object_id"].as_str().expect("id").to_string();
    assert_eq!(object_id.len(), 40);

    let output = run(&dir, &["get", &object_id]);
    assert_eq!(output.stdout, b"piped bytes");
}

#[test]
fn wait_reports_ready_and_remaining() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    init(&dir);
    assert!(run(&dir, &["put", ID_B, "--data", "b"]).status.success());

    let output = run(
        &dir,
        &["wait", ID_A, ID_B, "--num-returns", "1", "--timeout-ms", "50"],
    );
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["ready"], serde_json::json!([ID_B]));
    assert_eq!(value["remaining"], serde_json::json!([ID_A]));

    let output = run(&dir, &["wait", ID_A, "--num-returns", "2"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn evict_reports_freed_bytes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    init(&dir);
    assert!(run(&dir, &["put", ID_A, "--data", "0123456789"]).status.success());

    let output = run(&dir, &["evict", "1K"]);
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["requested"], 1024);
    assert_eq!(value["evicted"], 10);
}

#[test]
fn subscribe_exits_after_idle_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");
    init(&dir);

    let output = run(&dir, &["subscribe", "--timeout", "100ms"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn usage_and_connectivity_errors_have_stable_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("store");

    let output = run(&dir, &["contains", ID_A]);
    assert_eq!(output.status.code(), Some(10));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Connectivity");
    assert!(err["error"]["hint"].is_string());

    init(&dir);
    let output = run(&dir, &["get", "not-hex"]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(parse_json(&output.stderr)["error"]["kind"], "Usage");

    let output = run(&dir, &["fetch", ID_A]);
    assert_eq!(output.status.code(), Some(10));

    let output = run(&dir, &["put", ID_A, "--data", "x", "--bogus"]);
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(err["error"]["hint"].as_str().expect("hint").contains("shmstore put"));
}

#[test]
fn completion_generates_script() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run(temp.path(), &["completion", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("shmstore"));
}
