use crate::common::{Bridge, Mode};
use serde_json::json;
use std::io::Write;
use std::process::{Command, Stdio};

#[test]
fn test_line_mode_ping() {
    let mut bridge = Bridge::start(Mode::Line);
    let reply = bridge.request(json!({"command": "ping", "id": 7}));
    assert_eq!(reply, json!({"status": "ok", "id": 7}));

    let (rest, status) = bridge.finish();
    assert_eq!(rest, vec![json!({"status": "ok", "message": "EOF"})]);
    assert!(status.success());
}

#[test]
fn test_binary_mode_ping() {
    let mut bridge = Bridge::start(Mode::Binary);
    for i in 0..3 {
        let reply = bridge.request(json!({"command": "ping", "id": format!("req-{i}")}));
        assert_eq!(reply, json!({"status": "ok", "id": format!("req-{i}")}));
    }
    let (rest, status) = bridge.finish();
    assert_eq!(rest, vec![json!({"status": "ok", "message": "EOF"})]);
    assert!(status.success());
}

#[test]
fn test_bad_requests_keep_server_alive() {
    let mut bridge = Bridge::start(Mode::Binary);

    bridge.send_raw(b"{not json");
    let reply = bridge.reply();
    assert_eq!(reply["status"], "error");
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("cannot decode JSON"));

    let reply = bridge.request(json!({"id": 1}));
    assert_eq!(
        reply,
        json!({"status": "error", "message": "bad request: missing command field", "id": 1})
    );

    let reply = bridge.request(json!({"command": "fly"}));
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "unknown command 'fly'");

    let reply = bridge.request(json!({"command": "readMemory"}));
    assert_eq!(reply["status"], "error");
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("bad request: readMemory"));

    let reply = bridge.request(json!({"command": "ping"}));
    assert_eq!(reply, json!({"status": "ok"}));
}

#[test]
fn test_lifecycle_errors_without_process() {
    let mut bridge = Bridge::start(Mode::Line);

    let reply = bridge.request(json!({"command": "hasProcess"}));
    assert_eq!(reply, json!({"status": "error", "message": "no process"}));

    let reply = bridge.request(json!({"command": "stepInstruction"}));
    assert_eq!(reply, json!({"status": "error", "message": "no process"}));

    let reply = bridge.request(json!({"command": "launch"}));
    assert_eq!(
        reply,
        json!({"status": "error", "message": "no executable prepared"})
    );

    let reply = bridge.request(json!({"command": "setBreakpointAtVirtualAddress", "address": "0x1000"}));
    assert_eq!(reply, json!({"status": "error", "message": "no target"}));
}

#[test]
fn test_prepare_missing_executable() {
    let mut bridge = Bridge::start(Mode::Line);

    let reply = bridge.request(json!({
        "command": "prepareExecutable",
        "path": "/no/such/program",
        "args": "--flag 'two words'",
    }));
    assert_eq!(reply, json!({"status": "ok"}));

    // breakpoints are pending until a process exists
    let reply = bridge.request(json!({"command": "setBreakpointAtVirtualAddress", "address": 4096}));
    assert_eq!(reply["bkpt_id"], 1);
    assert_eq!(reply["pending"], true);

    let reply = bridge.request(json!({"command": "launch"}));
    assert_eq!(reply["status"], "error");
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("cannot build target"));

    let reply = bridge.request(json!({"command": "hasProcess"}));
    assert_eq!(reply, json!({"status": "error", "message": "no process"}));
}

#[test]
fn test_remote_connection_unsupported() {
    let mut bridge = Bridge::start(Mode::Binary);
    let reply = bridge.request(json!({
        "command": "connectRemote",
        "url": "connect://localhost:1234",
        "plugin": "gdb-remote",
    }));
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "remote connection is not supported");
}

#[test]
fn test_single_descriptor_is_usage_error() {
    let status = Command::new(env!("CARGO_BIN_EXE_bs-bridge"))
        .arg("0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn test_explicit_config() {
    let mut broken = tempfile::NamedTempFile::new().unwrap();
    writeln!(broken, "[launch]\nunknown_key = 1").unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_bs-bridge"))
        .arg("--config")
        .arg(broken.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());

    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[notifier]\npoll_interval_ms = 20\n\n[step]\nmax_polls = 5").unwrap();
    let path = config.path().to_str().unwrap().to_string();
    let mut bridge = Bridge::start_with_args(Mode::Line, &["--config", &path]);
    let reply = bridge.request(json!({"command": "ping"}));
    assert_eq!(reply, json!({"status": "ok"}));
}

#[test]
fn test_wire_trace_written_to_log_file() {
    let log = tempfile::NamedTempFile::new().unwrap();
    let path = log.path().to_str().unwrap().to_string();
    let mut bridge = Bridge::start_with_args(Mode::Line, &["--log-file", &path, "--trace-wire"]);
    let reply = bridge.request(json!({"command": "ping", "id": "traced"}));
    assert_eq!(reply["id"], "traced");
    let (_, status) = bridge.finish();
    assert!(status.success());

    let trace = std::fs::read_to_string(log.path()).unwrap();
    assert!(trace.contains("\"traced\""));
}
