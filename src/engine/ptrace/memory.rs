use nix::libc::{c_long, c_void};
use nix::sys;
use nix::unistd::Pid;
use std::mem;

const WORD: usize = mem::size_of::<c_long>();

/// Read `read_n` bytes of tracee memory word by word.
pub fn read_memory_by_pid(pid: Pid, addr: u64, read_n: usize) -> nix::Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut addr = addr;
    while result.len() < read_n {
        let value = sys::ptrace::read(pid, addr as *mut c_void)?;
        let remain = read_n - result.len();
        result.extend(value.to_ne_bytes().into_iter().take(remain));
        addr = addr.wrapping_add(WORD as u64);
    }
    Ok(result)
}

/// Read as many bytes as possible, up to `read_n`. Stops at the first unreadable word.
pub fn read_available(pid: Pid, addr: u64, read_n: usize) -> Vec<u8> {
    let mut result = Vec::new();
    let mut addr = addr;
    while result.len() < read_n {
        let Ok(value) = sys::ptrace::read(pid, addr as *mut c_void) else {
            break;
        };
        let remain = read_n - result.len();
        result.extend(value.to_ne_bytes().into_iter().take(remain));
        addr = addr.wrapping_add(WORD as u64);
    }
    result
}

/// Write bytes into tracee memory, partially written words are merged with existing data.
pub fn write_memory_by_pid(pid: Pid, addr: u64, data: &[u8]) -> nix::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        let at = addr.wrapping_add(written as u64);
        let chunk = &data[written..(written + WORD).min(data.len())];

        let mut word = if chunk.len() == WORD {
            [0; WORD]
        } else {
            sys::ptrace::read(pid, at as *mut c_void)?.to_ne_bytes()
        };
        word[..chunk.len()].copy_from_slice(chunk);

        unsafe {
            sys::ptrace::write(
                pid,
                at as *mut c_void,
                c_long::from_ne_bytes(word) as *mut c_void,
            )?;
        }
        written += chunk.len();
    }
    Ok(written)
}
