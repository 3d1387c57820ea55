use crate::common::{state_is, stopped_with, Bridge, Mode};
use serde_json::{json, Value};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const ECHO_APP: &str = "/bin/echo";
const SLEEP_APP: &str = "/bin/sleep";

const STATE_STOPPED: u64 = 5;
const STATE_EXITED: u64 = 10;

fn launch(bridge: &mut Bridge, path: &str, args: &str) -> Value {
    let reply = bridge.request(json!({
        "command": "prepareExecutable",
        "path": path,
        "args": args,
    }));
    assert_eq!(reply, json!({"status": "ok"}));
    let reply = bridge.request(json!({"command": "launch"}));
    assert_eq!(reply["status"], "ok", "{reply}");
    bridge.wait_notification(stopped_with("Exec"));
    reply
}

const LOAD_ADDR: u64 = 0x400000;
const ELF_HEADERS_LEN: u64 = 64 + 56;

/// Write a static x86_64 executable whose first instruction stores to address 0.
fn write_null_store_program(dir: &Path) -> PathBuf {
    let code: &[u8] = &[
        0xc7, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, // mov dword [0], 1
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
    ];
    let file_len = ELF_HEADERS_LEN + code.len() as u64;

    let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    elf.extend(2u16.to_le_bytes()); // ET_EXEC
    elf.extend(0x3eu16.to_le_bytes()); // x86_64
    elf.extend(1u32.to_le_bytes());
    elf.extend((LOAD_ADDR + ELF_HEADERS_LEN).to_le_bytes()); // entry
    elf.extend(64u64.to_le_bytes()); // program headers offset
    elf.extend(0u64.to_le_bytes()); // no sections
    elf.extend(0u32.to_le_bytes());
    elf.extend(64u16.to_le_bytes());
    elf.extend(56u16.to_le_bytes());
    elf.extend(1u16.to_le_bytes());
    elf.extend([0u8; 6]);
    // PT_LOAD, R+X, whole file
    elf.extend(1u32.to_le_bytes());
    elf.extend(5u32.to_le_bytes());
    elf.extend(0u64.to_le_bytes());
    elf.extend(LOAD_ADDR.to_le_bytes());
    elf.extend(LOAD_ADDR.to_le_bytes());
    elf.extend(file_len.to_le_bytes());
    elf.extend(file_len.to_le_bytes());
    elf.extend(0x1000u64.to_le_bytes());
    elf.extend(code);
    assert_eq!(elf.len() as u64, file_len);

    let path = dir.join("null_store");
    fs::write(&path, elf).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[test]
#[serial]
fn test_launch_and_run_to_exit() {
    let mut bridge = Bridge::start(Mode::Binary);
    let reply = launch(&mut bridge, ECHO_APP, "hello bridge");
    assert!(reply["pid"].as_u64().unwrap() > 0);

    let reply = bridge.request(json!({"command": "getProcessState"}));
    assert_eq!(reply["state"], STATE_STOPPED);
    assert_eq!(reply["state-string"], "eStateStopped");

    let reply = bridge.request(json!({"command": "continueExecution"}));
    assert_eq!(reply, json!({"status": "ok"}));

    let exited = bridge.wait_notification(state_is(STATE_EXITED));
    assert_eq!(exited["payload"]["exit_status"], 0);
    let output = bridge.wait_notification(|doc| doc["type"] == "stdout");
    assert_eq!(output["payload"]["output"], hex(b"hello bridge\n"));

    let reply = bridge.request(json!({"command": "deleteProcess"}));
    assert_eq!(reply, json!({"status": "ok"}));
}

#[test]
#[serial]
fn test_breakpoint_at_entry_point() {
    let mut bridge = Bridge::start(Mode::Line);
    launch(&mut bridge, ECHO_APP, "");

    let reply = bridge.request(json!({"command": "getMainExecutableDisassembly", "count": 4}));
    assert_eq!(reply["type"], "disassembly", "{reply}");
    let entry = reply["payload"]["entryPoint"].as_u64().unwrap();
    let lines = reply["payload"]["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["address"], entry);

    let reply = bridge.request(json!({"command": "setBreakpointAtVirtualAddress", "address": entry}));
    assert_eq!(reply["bkpt_id"], 1, "{reply}");

    // inserted int3 is invisible for memory readers
    let reply = bridge.request(json!({"command": "disassembly", "address": entry, "count": 1}));
    assert_eq!(reply["payload"]["lines"][0], lines[0]);

    bridge.request(json!({"command": "continueExecution"}));
    let stop = bridge.wait_notification(stopped_with("Breakpoint"));
    assert_eq!(stop["payload"]["pc"], entry);

    let reply = bridge.request(json!({"command": "getRegisters"}));
    assert_eq!(reply["type"], "registers");
    assert_eq!(
        reply["payload"]["registers"]["rip"],
        format!("0x{entry:016x}")
    );

    let reply = bridge.request(json!({"command": "getCallstack"}));
    let callstack = reply["callstack"].as_array().unwrap();
    assert_eq!(callstack[0]["pc"], entry);

    let reply = bridge.request(json!({"command": "removeAllBreakpoints"}));
    assert_eq!(reply, json!({"status": "ok"}));
    bridge.request(json!({"command": "continueExecution"}));
    bridge.wait_notification(state_is(STATE_EXITED));
}

#[test]
#[serial]
fn test_step_instruction() {
    let mut bridge = Bridge::start(Mode::Binary);
    launch(&mut bridge, ECHO_APP, "");

    let reply = bridge.request(json!({"command": "getThreadIDList"}));
    let threads = reply["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);

    let before = bridge.request(json!({"command": "getRegisters"}));
    let reply = bridge.request(json!({"command": "stepInstruction"}));
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["completed"], true);
    let after = bridge.request(json!({"command": "getRegisters"}));
    assert_ne!(
        before["payload"]["registers"]["rip"],
        after["payload"]["registers"]["rip"]
    );
    assert_eq!(
        after["payload"]["registers"]["rip"],
        format!("0x{:016x}", reply["pc"].as_u64().unwrap())
    );

    let reply = bridge.request(json!({"command": "moduleCount"}));
    assert!(reply["count"].as_u64().unwrap() >= 2);
    let reply = bridge.request(json!({"command": "moduleForFile", "file": "echo"}));
    assert_eq!(reply["status"], "ok", "{reply}");

    let reply = bridge.request(json!({"command": "executeCommand", "cli": "registers"}));
    assert_eq!(reply["succeeded"], true);
    assert!(reply["output"].as_str().unwrap().contains("rip"));

    let reply = bridge.request(json!({"command": "stopExecution"}));
    assert_eq!(reply, json!({"status": "ok"}));
    bridge.wait_notification(state_is(STATE_EXITED));
}

#[test]
#[serial]
fn test_attach_and_detach() {
    let mut sleeper = Command::new(SLEEP_APP)
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    let mut bridge = Bridge::start(Mode::Line);
    let reply = bridge.request(json!({"command": "attachToProcess", "pid": sleeper.id()}));
    assert_eq!(reply["status"], "ok", "{reply}");
    assert_eq!(reply["pid"], sleeper.id());

    let reply = bridge.request(json!({"command": "getProcessState"}));
    assert_eq!(reply["state"], STATE_STOPPED);

    let reply = bridge.request(json!({"command": "detach"}));
    assert_eq!(reply, json!({"status": "ok"}));
    let reply = bridge.request(json!({"command": "hasProcess"}));
    assert_eq!(reply["status"], "error");

    // detached process keeps running
    assert!(sleeper.try_wait().unwrap().is_none());
    sleeper.kill().unwrap();
    sleeper.wait().unwrap();
}

#[test]
#[serial]
fn test_step_on_faulting_instruction() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_null_store_program(dir.path());

    let mut bridge = Bridge::start(Mode::Binary);
    launch(&mut bridge, program.to_str().unwrap(), "");

    bridge.request(json!({"command": "continueExecution"}));
    let stop = bridge.wait_notification(stopped_with("Exception"));
    assert_eq!(stop["payload"]["pc"], LOAD_ADDR + ELF_HEADERS_LEN);

    // pending SIGSEGV goes with the step and terminates the process
    let reply = bridge.request(json!({"command": "stepInstruction"}));
    assert_eq!(reply["status"], "ok", "{reply}");
    let exited = bridge.wait_notification(state_is(STATE_EXITED));
    assert_eq!(exited["payload"]["exit_status"], 11);

    let reply = bridge.request(json!({"command": "ping"}));
    assert_eq!(reply, json!({"status": "ok"}));
}
