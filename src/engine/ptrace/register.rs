use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// x86_64 general purpose registers, as they are in `user_regs_struct`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl From<user_regs_struct> for RegisterMap {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl From<RegisterMap> for user_regs_struct {
    fn from(reg_map: RegisterMap) -> user_regs_struct {
        reg_map.0
    }
}

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        let regs = sys::ptrace::getregs(pid)?;
        Ok(regs.into())
    }

    pub fn value(&self, register: Register) -> u64 {
        let regs = &self.0;
        match register {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::OrigRax => regs.orig_rax,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        let regs = &mut self.0;
        match register {
            Register::Rax => regs.rax = value,
            Register::Rbx => regs.rbx = value,
            Register::Rcx => regs.rcx = value,
            Register::Rdx => regs.rdx = value,
            Register::Rdi => regs.rdi = value,
            Register::Rsi => regs.rsi = value,
            Register::Rbp => regs.rbp = value,
            Register::Rsp => regs.rsp = value,
            Register::R8 => regs.r8 = value,
            Register::R9 => regs.r9 = value,
            Register::R10 => regs.r10 = value,
            Register::R11 => regs.r11 = value,
            Register::R12 => regs.r12 = value,
            Register::R13 => regs.r13 = value,
            Register::R14 => regs.r14 = value,
            Register::R15 => regs.r15 = value,
            Register::Rip => regs.rip = value,
            Register::Eflags => regs.eflags = value,
            Register::Cs => regs.cs = value,
            Register::OrigRax => regs.orig_rax = value,
            Register::FsBase => regs.fs_base = value,
            Register::GsBase => regs.gs_base = value,
            Register::Fs => regs.fs = value,
            Register::Gs => regs.gs = value,
            Register::Ss => regs.ss = value,
            Register::Ds => regs.ds = value,
            Register::Es => regs.es = value,
        };
    }

    /// All registers in `user_regs_struct` order.
    pub fn iter(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        Register::iter().map(|r| (r, self.value(r)))
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.into())
    }
}
