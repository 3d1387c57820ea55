use crate::engine::{EngineError, Instruction};
use capstone::arch::x86::{X86OperandType, X86Reg};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Insn, RegIdInt};
use lru::LruCache;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Max x86 instruction length.
pub const MAX_INSN_LEN: usize = 15;

/// Instructions that matter for a frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    Call,
    Ret,
    /// `push rbp`, frame is not set up yet.
    PushRbp,
    /// `mov rbp, rsp`, frame pointer is pushed but not updated.
    MovRbpRsp,
    /// `endbr64` or any other instruction.
    Other,
}

/// Disassembler of x86_64 code, Intel syntax.
pub struct Disassembler {
    cs: Capstone,
    references: RefCell<LruCache<(PathBuf, u64, u64), Vec<Instruction>>>,
}

impl Disassembler {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            cs: Capstone::new()
                .x86()
                .mode(arch::x86::ArchMode::Mode64)
                .syntax(arch::x86::ArchSyntax::Intel)
                .detail(true)
                .build()
                .map_err(EngineError::DisAsmInit)?,
            references: RefCell::new(LruCache::new(NonZeroUsize::new(32).expect("infallible"))),
        })
    }

    /// Disassemble up to `count` instructions from `code` placed at `addr`.
    pub fn disassemble(
        &self,
        code: &[u8],
        addr: u64,
        count: usize,
    ) -> Result<Vec<Instruction>, EngineError> {
        if count == 0 || code.is_empty() {
            return Ok(vec![]);
        }
        let instructions = self
            .cs
            .disasm_count(code, addr, count)
            .map_err(EngineError::DisAsm)?;
        Ok(instructions.iter().map(to_instruction).collect())
    }

    /// Classify a first instruction of `code`, return its kind and length.
    pub fn classify(&self, code: &[u8], addr: u64) -> Result<(InsnKind, usize), EngineError> {
        let instructions = self
            .cs
            .disasm_count(code, addr, 1)
            .map_err(EngineError::DisAsm)?;
        let Some(insn) = instructions.iter().next() else {
            return Err(EngineError::MemoryAccess(addr));
        };

        let mnemonic = insn.mnemonic().unwrap_or_default();
        let operands = insn.op_str().unwrap_or_default();
        let kind = match mnemonic {
            "call" => InsnKind::Call,
            "ret" | "retf" => InsnKind::Ret,
            "push" if operands == "rbp" => InsnKind::PushRbp,
            "mov" if operands == "rbp, rsp" => InsnKind::MovRbpRsp,
            _ => InsnKind::Other,
        };
        Ok((kind, insn.len()))
    }

    /// Scan code sections for instructions referencing `target`, either with a
    /// RIP-relative memory operand or with an immediate.
    ///
    /// # Arguments
    ///
    /// * `image`: path to an executable, used as a cache key
    /// * `slide`: image relocation offset, a part of the cache key
    /// * `sections`: code sections as pairs of load address and bytes
    /// * `target`: searched address
    pub fn find_references(
        &self,
        image: PathBuf,
        slide: u64,
        sections: impl FnOnce() -> Result<Vec<(u64, Vec<u8>)>, EngineError>,
        target: u64,
    ) -> Result<Vec<Instruction>, EngineError> {
        let mut cache = self.references.borrow_mut();
        let refs = cache.try_get_or_insert((image, slide, target), || -> Result<_, EngineError> {
            let mut found = vec![];
            for (addr, code) in sections()? {
                let instructions = self
                    .cs
                    .disasm_all(&code, addr)
                    .map_err(EngineError::DisAsm)?;
                for insn in instructions.iter() {
                    if self.references_address(insn, target)? {
                        found.push(to_instruction(insn));
                    }
                }
            }
            Ok(found)
        })?;
        Ok(refs.clone())
    }

    fn references_address(&self, insn: &Insn, target: u64) -> Result<bool, EngineError> {
        let detail = self.cs.insn_detail(insn).map_err(EngineError::DisAsm)?;
        let next_pc = insn.address() + insn.len() as u64;
        let rip = RegId(X86Reg::X86_REG_RIP as RegIdInt);

        let found = detail
            .arch_detail()
            .operands()
            .into_iter()
            .any(|op| match op {
                ArchOperand::X86Operand(op) => match op.op_type {
                    X86OperandType::Mem(mem) if mem.base() == rip => {
                        next_pc.wrapping_add(mem.disp() as u64) == target
                    }
                    X86OperandType::Imm(imm) => imm as u64 == target,
                    _ => false,
                },
                _ => false,
            });
        Ok(found)
    }
}

fn to_instruction(insn: &Insn) -> Instruction {
    Instruction {
        address: insn.address(),
        bytes: insn.bytes().to_vec(),
        mnemonic: insn.mnemonic().unwrap_or_default().to_string(),
        operands: insn.op_str().unwrap_or_default().to_string(),
    }
}
