use crate::engine::ptrace::memory;
use crate::engine::BreakpointInfo;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::collections::BTreeMap;

const INT3: u64 = 0xCC;

/// Software breakpoint (int3 patch).
pub struct Breakpoint {
    pub addr: u64,
    saved_data: u8,
    enabled: bool,
    /// User visible id, `None` for breakpoints of internal step plans.
    user_id: Option<u32>,
    /// Used by a step plan.
    internal: bool,
}

impl Breakpoint {
    fn new(addr: u64) -> Self {
        Self {
            addr,
            saved_data: 0,
            enabled: false,
            user_id: None,
            internal: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_user(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn enable(&mut self, pid: Pid) -> nix::Result<()> {
        if self.enabled {
            return Ok(());
        }
        let data = sys::ptrace::read(pid, self.addr as *mut c_void)?;
        self.saved_data = (data & 0xff) as u8;
        let data_with_bp = (data as u64 & !0xff) | INT3;
        unsafe {
            sys::ptrace::write(pid, self.addr as *mut c_void, data_with_bp as *mut c_void)?;
        }
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self, pid: Pid) -> nix::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let data = sys::ptrace::read(pid, self.addr as *mut c_void)? as u64;
        let restored: u64 = (data & !0xff) | self.saved_data as u64;
        unsafe {
            sys::ptrace::write(pid, self.addr as *mut c_void, restored as *mut c_void)?;
        }
        self.enabled = false;
        Ok(())
    }
}

/// Breakpoints of a single process, one patch per address.
#[derive(Default)]
pub struct BreakpointRegistry {
    by_addr: BTreeMap<u64, Breakpoint>,
    last_id: u32,
}

impl BreakpointRegistry {
    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.by_addr.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut Breakpoint> {
        self.by_addr.get_mut(&addr)
    }

    /// Add a user breakpoint, ids are sequential from 1.
    pub fn add_user(&mut self, pid: Pid, addr: u64) -> nix::Result<BreakpointInfo> {
        let brkpt = self
            .by_addr
            .entry(addr)
            .or_insert_with(|| Breakpoint::new(addr));
        brkpt.enable(pid)?;

        if let Some(id) = brkpt.user_id {
            return Ok(BreakpointInfo {
                id,
                load_address: addr,
            });
        }
        self.last_id += 1;
        brkpt.user_id = Some(self.last_id);
        Ok(BreakpointInfo {
            id: self.last_id,
            load_address: addr,
        })
    }

    /// Remove user breakpoint, return `false` if there is no breakpoint with such id.
    pub fn remove_user(&mut self, pid: Pid, id: u32) -> nix::Result<bool> {
        let Some(addr) = self
            .by_addr
            .values()
            .find(|b| b.user_id == Some(id))
            .map(|b| b.addr)
        else {
            return Ok(false);
        };
        self.release(pid, addr, |b| b.user_id = None)?;
        Ok(true)
    }

    pub fn remove_all_user(&mut self, pid: Pid) -> nix::Result<()> {
        let addresses: Vec<u64> = self
            .by_addr
            .values()
            .filter(|b| b.is_user())
            .map(|b| b.addr)
            .collect();
        for addr in addresses {
            self.release(pid, addr, |b| b.user_id = None)?;
        }
        Ok(())
    }

    pub fn add_internal(&mut self, pid: Pid, addr: u64) -> nix::Result<()> {
        let brkpt = self
            .by_addr
            .entry(addr)
            .or_insert_with(|| Breakpoint::new(addr));
        brkpt.internal = true;
        brkpt.enable(pid)
    }

    pub fn remove_internal(&mut self, pid: Pid, addr: u64) -> nix::Result<()> {
        self.release(pid, addr, |b| b.internal = false)
    }

    fn release(
        &mut self,
        pid: Pid,
        addr: u64,
        unset: impl FnOnce(&mut Breakpoint),
    ) -> nix::Result<()> {
        let Some(brkpt) = self.by_addr.get_mut(&addr) else {
            return Ok(());
        };
        unset(brkpt);
        if !brkpt.is_user() && !brkpt.internal {
            brkpt.disable(pid)?;
            self.by_addr.remove(&addr);
        }
        Ok(())
    }

    /// Remove every patch from process memory, used before detaching.
    pub fn disable_all(&mut self, pid: Pid) -> nix::Result<()> {
        for brkpt in self.by_addr.values_mut() {
            brkpt.disable(pid)?;
        }
        self.by_addr.clear();
        Ok(())
    }

    /// Replace int3 patches in a memory view with original bytes.
    pub fn mask(&self, addr: u64, data: &mut [u8]) {
        let end = addr.saturating_add(data.len() as u64);
        for brkpt in self.by_addr.range(addr..end).map(|(_, b)| b) {
            if brkpt.enabled {
                data[(brkpt.addr - addr) as usize] = brkpt.saved_data;
            }
        }
    }

    /// Read memory without int3 patches.
    pub fn read_masked(&self, pid: Pid, addr: u64, len: usize) -> nix::Result<Vec<u8>> {
        let mut data = memory::read_memory_by_pid(pid, addr, len)?;
        self.mask(addr, &mut data);
        Ok(data)
    }

    /// Keep saved bytes in sync when memory under a patch is overwritten.
    pub fn rewrite(&mut self, pid: Pid, addr: u64, data: &[u8]) -> nix::Result<usize> {
        let end = addr.saturating_add(data.len() as u64);
        let patched: Vec<u64> = self
            .by_addr
            .range(addr..end)
            .filter(|(_, b)| b.enabled)
            .map(|(a, _)| *a)
            .collect();
        for a in &patched {
            if let Some(b) = self.by_addr.get_mut(a) {
                b.disable(pid)?;
            }
        }
        let written = memory::write_memory_by_pid(pid, addr, data)?;
        for a in &patched {
            if let Some(b) = self.by_addr.get_mut(a) {
                b.enable(pid)?;
            }
        }
        Ok(written)
    }

    pub fn user_breakpoints(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.by_addr
            .values()
            .filter_map(|b| b.user_id.map(|id| (id, b.addr)))
    }
}
