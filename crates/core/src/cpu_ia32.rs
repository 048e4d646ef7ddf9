//! IA-32 (80386+, flat 32-bit mode) CPU core implementation
//!
//! This module provides an interpreter for a userspace subset of the
//! IA-32 instruction set: it owns a flat [`Memory`], the eight general
//! purpose registers with their 16- and 8-bit aliased views, EFLAGS, a
//! downward-growing stack, and a fetch-decode-dispatch loop. Programs
//! are raw flat binaries; the only way out of the guest is the Linux
//! style `int 0x80` gate (exit/read/write) or the HLT instruction.
//!
//! Segmentation, paging, the FPU and privileged instructions are out of
//! scope. Segment override prefixes are accepted and ignored since the
//! memory model is flat.

use crate::logging::{log, LogCategory, LogLevel};
use crate::memory::{Memory, MemoryError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

// Register indices in canonical ModR/M encoding order (Intel SDM table 2-2)
pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

// Flag bit positions in the EFLAGS register
pub const FLAG_CF: u32 = 0x0001; // Carry Flag
pub const FLAG_PF: u32 = 0x0004; // Parity Flag
pub const FLAG_AF: u32 = 0x0010; // Auxiliary Carry Flag
pub const FLAG_ZF: u32 = 0x0040; // Zero Flag
pub const FLAG_SF: u32 = 0x0080; // Sign Flag
pub const FLAG_TF: u32 = 0x0100; // Trap Flag
pub const FLAG_IF: u32 = 0x0200; // Interrupt Enable Flag
pub const FLAG_DF: u32 = 0x0400; // Direction Flag
pub const FLAG_OF: u32 = 0x0800; // Overflow Flag

// Linux i386 syscall numbers understood by the `int 0x80` gate
const SYS_EXIT: u32 = 1;
const SYS_READ: u32 = 3;
const SYS_WRITE: u32 = 4;

/// Fatal conditions raised by the interpreter
///
/// All of these unwind the run loop to the caller; there is no in-guest
/// recovery path (no exception vector table is modeled).
#[derive(Debug, Error)]
pub enum VmError {
    /// A guest memory access fell outside the buffer
    #[error("at eip {eip:#010x}: {source}")]
    Mem {
        eip: u32,
        #[source]
        source: MemoryError,
    },

    /// No handler for the decoded opcode bytes
    #[error("unknown opcode {bytes:02X?} at eip {eip:#010x}")]
    UnknownOpcode { eip: u32, bytes: Vec<u8> },

    /// `int 0x80` with an EAX selector the gate does not implement
    #[error("unsupported syscall {eax} at eip {eip:#010x}")]
    UnsupportedSyscall { eip: u32, eax: u32 },

    /// A pop would move ESP past the end of memory
    #[error("stack underflow: esp {esp:#010x}")]
    StackUnderflow { esp: u32 },

    /// DIV/IDIV by zero or quotient overflow
    #[error("divide error at eip {eip:#010x}")]
    Divide { eip: u32 },

    /// Host I/O failure outside the syscall surface (program loading)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// REP-family prefix for string instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepPrefix {
    /// 0xF3 (REP/REPE); also what 0xF2 degrades to for MOVS
    Rep,
}

/// Decoded r/m operand: a register slot or a memory address
///
/// Width is carried by the accessor used (`read_rm8`/`read_rm16`/
/// `read_rm32`), matching how the ModR/M byte itself is width-blind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    /// Register direct (mod=11); the index is the 3-bit r/m field
    Reg(u8),
    /// Memory operand at the given effective address
    Mem(u32),
}

/// Serializable snapshot of the architectural state (debug aid)
///
/// Memory contents are deliberately excluded; this mirrors what the
/// debugger front-end wants to show, not a full machine image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuState {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
    pub halted: bool,
    pub exit_code: u8,
    pub cycles: u64,
}

/// IA-32 CPU state and execution engine
///
/// Owns its [`Memory`] and the three host byte streams the syscall gate
/// writes to and reads from. One instance, one thread; nothing here is
/// shared.
pub struct CpuIa32 {
    /// EAX register (accumulator) - low 16 bits: AX (AH:AL)
    pub eax: u32,
    /// ECX register (count) - low 16 bits: CX (CH:CL)
    pub ecx: u32,
    /// EDX register (data) - low 16 bits: DX (DH:DL)
    pub edx: u32,
    /// EBX register (base) - low 16 bits: BX (BH:BL)
    pub ebx: u32,
    /// ESP register (stack pointer)
    pub esp: u32,
    /// EBP register (base pointer)
    pub ebp: u32,
    /// ESI register (source index)
    pub esi: u32,
    /// EDI register (destination index)
    pub edi: u32,

    /// EIP register (instruction pointer)
    pub eip: u32,
    /// EFLAGS register (status flags)
    pub eflags: u32,

    /// Total cycles executed (approximate costs, not cycle-accurate)
    pub cycles: u64,

    /// Guest memory
    pub memory: Memory,

    /// Halt flag; set by the exit syscall or HLT
    halted: bool,

    /// Exit status reported by the exit syscall (low 8 bits of EBX)
    exit_code: u8,

    /// Operand-size override for the current instruction (0x66 prefix)
    operand_size_override: bool,

    /// Address-size override for the current instruction (0x67 prefix)
    address_size_override: bool,

    /// REP prefix for the current instruction (string ops only)
    rep_prefix: Option<RepPrefix>,

    /// EIP of the instruction currently executing
    /// Used in diagnostics so faults point at the offending instruction
    instruction_start_eip: u32,

    /// Per-instruction trace output (VM attribute, not a global switch)
    debug: bool,

    // Host byte streams for the syscall gate (fd 0, 1, 2)
    stdin: Box<dyn Read>,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
}

impl CpuIa32 {
    /// Create a CPU with `mem_size` bytes of zeroed memory and the
    /// process standard streams wired to fds 0/1/2
    pub fn new(mem_size: usize) -> Self {
        Self::with_streams(
            mem_size,
            Box::new(std::io::stdin()),
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        )
    }

    /// Create a CPU with caller-supplied byte streams
    pub fn with_streams(
        mem_size: usize,
        stdin: Box<dyn Read>,
        stdout: Box<dyn Write>,
        stderr: Box<dyn Write>,
    ) -> Self {
        assert!(mem_size > 0, "memory size must be positive");
        let top = mem_size as u32;
        Self {
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: top,
            ebp: top,
            esi: 0,
            edi: 0,
            eip: 0,
            eflags: 0x0002, // Reserved bit 1 is always set
            cycles: 0,
            memory: Memory::new(mem_size),
            halted: false,
            exit_code: 0,
            operand_size_override: false,
            address_size_override: false,
            rep_prefix: None,
            instruction_start_eip: 0,
            debug: false,
            stdin,
            stdout,
            stderr,
        }
    }

    /// Enable or disable per-instruction trace logging for this VM
    pub fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    /// Check if the CPU is halted
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Exit status of the guest (valid once halted)
    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    /// Reset the CPU to power-on state (preserves memory size and streams)
    pub fn reset(&mut self) {
        let top = self.memory.size() as u32;
        self.eax = 0;
        self.ecx = 0;
        self.edx = 0;
        self.ebx = 0;
        self.esp = top;
        self.ebp = top;
        self.esi = 0;
        self.edi = 0;
        self.eip = 0;
        self.eflags = 0x0002;
        self.cycles = 0;
        self.halted = false;
        self.exit_code = 0;
        self.operand_size_override = false;
        self.address_size_override = false;
        self.rep_prefix = None;
        self.instruction_start_eip = 0;
        let size = self.memory.size();
        self.memory = Memory::new(size);
    }

    // ------------------------------------------------------------------
    // Register file
    // ------------------------------------------------------------------

    /// Get 32-bit register by ModR/M index
    #[inline]
    pub fn get_reg32(&self, reg: u8) -> u32 {
        debug_assert!(reg < 8, "invalid 32-bit register index: {}", reg);
        match reg {
            0 => self.eax,
            1 => self.ecx,
            2 => self.edx,
            3 => self.ebx,
            4 => self.esp,
            5 => self.ebp,
            6 => self.esi,
            7 => self.edi,
            _ => unreachable!(),
        }
    }

    /// Set 32-bit register by ModR/M index
    #[inline]
    pub fn set_reg32(&mut self, reg: u8, val: u32) {
        debug_assert!(reg < 8, "invalid 32-bit register index: {}", reg);
        match reg {
            0 => self.eax = val,
            1 => self.ecx = val,
            2 => self.edx = val,
            3 => self.ebx = val,
            4 => self.esp = val,
            5 => self.ebp = val,
            6 => self.esi = val,
            7 => self.edi = val,
            _ => unreachable!(),
        }
    }

    /// Get 16-bit register view (low half of the 32-bit slot)
    #[inline]
    pub fn get_reg16(&self, reg: u8) -> u16 {
        (self.get_reg32(reg) & 0xFFFF) as u16
    }

    /// Set 16-bit register view, preserving the high 16 bits
    #[inline]
    pub fn set_reg16(&mut self, reg: u8, val: u16) {
        let full = self.get_reg32(reg);
        self.set_reg32(reg, (full & 0xFFFF_0000) | (val as u32));
    }

    /// Get 8-bit register view by ModR/M index
    ///
    /// Indexes 0..3 are AL/CL/DL/BL, 4..7 alias AH/CH/DH/BH (the high
    /// bytes of slots 0..3) per Intel SDM table 2-2.
    #[inline]
    pub fn get_reg8(&self, reg: u8) -> u8 {
        debug_assert!(reg < 8, "invalid 8-bit register index: {}", reg);
        if reg < 4 {
            (self.get_reg32(reg) & 0xFF) as u8
        } else {
            ((self.get_reg32(reg - 4) >> 8) & 0xFF) as u8
        }
    }

    /// Set 8-bit register view, preserving all unaliased bits
    #[inline]
    pub fn set_reg8(&mut self, reg: u8, val: u8) {
        debug_assert!(reg < 8, "invalid 8-bit register index: {}", reg);
        if reg < 4 {
            let full = self.get_reg32(reg);
            self.set_reg32(reg, (full & 0xFFFF_FF00) | (val as u32));
        } else {
            let slot = reg - 4;
            let full = self.get_reg32(slot);
            self.set_reg32(slot, (full & 0xFFFF_00FF) | ((val as u32) << 8));
        }
    }

    // ------------------------------------------------------------------
    // EFLAGS
    // ------------------------------------------------------------------

    /// Set flag
    #[inline]
    pub fn set_flag(&mut self, flag: u32, value: bool) {
        if value {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
    }

    /// Get flag
    #[inline]
    pub fn get_flag(&self, flag: u32) -> bool {
        (self.eflags & flag) != 0
    }

    /// Check condition code for Jcc instructions
    /// Condition codes: 0=O, 1=NO, 2=B/C, 3=NB/NC, 4=E/Z, 5=NE/NZ, 6=BE, 7=NBE,
    ///                  8=S, 9=NS, A=P, B=NP, C=L, D=NL, E=LE, F=NLE
    #[inline]
    fn check_condition(&self, condition: u8) -> bool {
        match condition & 0x0F {
            0x0 => self.get_flag(FLAG_OF),
            0x1 => !self.get_flag(FLAG_OF),
            0x2 => self.get_flag(FLAG_CF),
            0x3 => !self.get_flag(FLAG_CF),
            0x4 => self.get_flag(FLAG_ZF),
            0x5 => !self.get_flag(FLAG_ZF),
            0x6 => self.get_flag(FLAG_CF) || self.get_flag(FLAG_ZF),
            0x7 => !self.get_flag(FLAG_CF) && !self.get_flag(FLAG_ZF),
            0x8 => self.get_flag(FLAG_SF),
            0x9 => !self.get_flag(FLAG_SF),
            0xA => self.get_flag(FLAG_PF),
            0xB => !self.get_flag(FLAG_PF),
            0xC => self.get_flag(FLAG_SF) != self.get_flag(FLAG_OF),
            0xD => self.get_flag(FLAG_SF) == self.get_flag(FLAG_OF),
            0xE => self.get_flag(FLAG_ZF) || (self.get_flag(FLAG_SF) != self.get_flag(FLAG_OF)),
            0xF => !self.get_flag(FLAG_ZF) && (self.get_flag(FLAG_SF) == self.get_flag(FLAG_OF)),
            _ => unreachable!(),
        }
    }

    // ------------------------------------------------------------------
    // Flag engine
    //
    // All arithmetic/logical flag computation is centralized in the
    // helpers below, keyed by operation kind and width, so individual
    // opcode handlers cannot drift.
    // ------------------------------------------------------------------

    /// Calculate parity (true if even number of 1 bits in low byte)
    #[inline]
    fn calc_parity(val: u8) -> bool {
        val.count_ones() % 2 == 0
    }

    /// Update SF/ZF/PF after an 8-bit operation
    fn update_flags_szp8(&mut self, result: u8) {
        self.set_flag(FLAG_ZF, result == 0);
        self.set_flag(FLAG_SF, (result & 0x80) != 0);
        self.set_flag(FLAG_PF, Self::calc_parity(result));
    }

    /// Update SF/ZF/PF after a 16-bit operation
    fn update_flags_szp16(&mut self, result: u16) {
        self.set_flag(FLAG_ZF, result == 0);
        self.set_flag(FLAG_SF, (result & 0x8000) != 0);
        self.set_flag(FLAG_PF, Self::calc_parity((result & 0xFF) as u8));
    }

    /// Update SF/ZF/PF after a 32-bit operation
    fn update_flags_szp32(&mut self, result: u32) {
        self.set_flag(FLAG_ZF, result == 0);
        self.set_flag(FLAG_SF, (result & 0x8000_0000) != 0);
        self.set_flag(FLAG_PF, Self::calc_parity((result & 0xFF) as u8));
    }

    /// 8-bit add with carry-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_add8(&mut self, a: u8, b: u8, carry_in: bool) -> u8 {
        let cin = carry_in as u16;
        let wide = (a as u16) + (b as u16) + cin;
        let result = (wide & 0xFF) as u8;
        self.set_flag(FLAG_CF, wide > 0xFF);
        self.set_flag(FLAG_OF, ((a ^ result) & (b ^ result) & 0x80) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) + (b & 0x0F) + cin as u8) > 0x0F);
        self.update_flags_szp8(result);
        result
    }

    /// 16-bit add with carry-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_add16(&mut self, a: u16, b: u16, carry_in: bool) -> u16 {
        let cin = carry_in as u32;
        let wide = (a as u32) + (b as u32) + cin;
        let result = (wide & 0xFFFF) as u16;
        self.set_flag(FLAG_CF, wide > 0xFFFF);
        self.set_flag(FLAG_OF, ((a ^ result) & (b ^ result) & 0x8000) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) + (b & 0x0F) + cin as u16) > 0x0F);
        self.update_flags_szp16(result);
        result
    }

    /// 32-bit add with carry-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_add32(&mut self, a: u32, b: u32, carry_in: bool) -> u32 {
        let cin = carry_in as u64;
        let wide = (a as u64) + (b as u64) + cin;
        let result = (wide & 0xFFFF_FFFF) as u32;
        self.set_flag(FLAG_CF, wide > 0xFFFF_FFFF);
        self.set_flag(FLAG_OF, ((a ^ result) & (b ^ result) & 0x8000_0000) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) + (b & 0x0F) + cin as u32) > 0x0F);
        self.update_flags_szp32(result);
        result
    }

    /// 8-bit subtract with borrow-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_sub8(&mut self, a: u8, b: u8, borrow_in: bool) -> u8 {
        let bin = borrow_in as u16;
        let result = (a as u16).wrapping_sub(b as u16).wrapping_sub(bin) as u8;
        self.set_flag(FLAG_CF, (a as u16) < (b as u16) + bin);
        self.set_flag(FLAG_OF, ((a ^ b) & (a ^ result) & 0x80) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) as u16) < ((b & 0x0F) as u16) + bin);
        self.update_flags_szp8(result);
        result
    }

    /// 16-bit subtract with borrow-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_sub16(&mut self, a: u16, b: u16, borrow_in: bool) -> u16 {
        let bin = borrow_in as u32;
        let result = (a as u32).wrapping_sub(b as u32).wrapping_sub(bin) as u16;
        self.set_flag(FLAG_CF, (a as u32) < (b as u32) + bin);
        self.set_flag(FLAG_OF, ((a ^ b) & (a ^ result) & 0x8000) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) as u32) < (b & 0x0F) as u32 + bin);
        self.update_flags_szp16(result);
        result
    }

    /// 32-bit subtract with borrow-in; sets CF, OF, AF, SF, ZF, PF
    fn alu_sub32(&mut self, a: u32, b: u32, borrow_in: bool) -> u32 {
        let bin = borrow_in as u64;
        let result = (a as u64).wrapping_sub(b as u64).wrapping_sub(bin) as u32;
        self.set_flag(FLAG_CF, (a as u64) < (b as u64) + bin);
        self.set_flag(FLAG_OF, ((a ^ b) & (a ^ result) & 0x8000_0000) != 0);
        self.set_flag(FLAG_AF, ((a & 0x0F) as u64) < (b & 0x0F) as u64 + bin);
        self.update_flags_szp32(result);
        result
    }

    /// Flags for the logic family (AND/OR/XOR/TEST): CF=OF=0, AF unchanged
    fn logic_flags8(&mut self, result: u8) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.update_flags_szp8(result);
    }

    fn logic_flags16(&mut self, result: u16) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.update_flags_szp16(result);
    }

    fn logic_flags32(&mut self, result: u32) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.update_flags_szp32(result);
    }

    // ------------------------------------------------------------------
    // Memory access and instruction fetch
    // ------------------------------------------------------------------

    /// Attach the current instruction's EIP to a memory fault
    #[inline]
    fn mem_fault(&self, source: MemoryError) -> VmError {
        VmError::Mem {
            eip: self.instruction_start_eip,
            source,
        }
    }

    #[inline]
    fn mem_read_u8(&self, addr: u32) -> Result<u8, VmError> {
        self.memory.read_u8(addr).map_err(|e| self.mem_fault(e))
    }

    #[inline]
    fn mem_read_u16(&self, addr: u32) -> Result<u16, VmError> {
        self.memory.read_u16(addr).map_err(|e| self.mem_fault(e))
    }

    #[inline]
    fn mem_read_u32(&self, addr: u32) -> Result<u32, VmError> {
        self.memory.read_u32(addr).map_err(|e| self.mem_fault(e))
    }

    #[inline]
    fn mem_write_u8(&mut self, addr: u32, val: u8) -> Result<(), VmError> {
        let eip = self.instruction_start_eip;
        self.memory
            .write_u8(addr, val)
            .map_err(|source| VmError::Mem { eip, source })
    }

    #[inline]
    fn mem_write_u16(&mut self, addr: u32, val: u16) -> Result<(), VmError> {
        let eip = self.instruction_start_eip;
        self.memory
            .write_u16(addr, val)
            .map_err(|source| VmError::Mem { eip, source })
    }

    #[inline]
    fn mem_write_u32(&mut self, addr: u32, val: u32) -> Result<(), VmError> {
        let eip = self.instruction_start_eip;
        self.memory
            .write_u32(addr, val)
            .map_err(|source| VmError::Mem { eip, source })
    }

    /// Read a byte at EIP and advance it
    #[inline]
    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let val = self.mem_read_u8(self.eip)?;
        self.eip = self.eip.wrapping_add(1);
        Ok(val)
    }

    /// Read a word (16-bit) at EIP and advance it
    #[inline]
    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let val = self.mem_read_u16(self.eip)?;
        self.eip = self.eip.wrapping_add(2);
        Ok(val)
    }

    /// Read a dword (32-bit) at EIP and advance it
    #[inline]
    fn fetch_u32(&mut self) -> Result<u32, VmError> {
        let val = self.mem_read_u32(self.eip)?;
        self.eip = self.eip.wrapping_add(4);
        Ok(val)
    }

    /// Fetch an operand-size immediate, zero-extended to 32 bits
    #[inline]
    fn fetch_imm(&mut self) -> Result<u32, VmError> {
        if self.operand_size_override {
            Ok(self.fetch_u16()? as u32)
        } else {
            self.fetch_u32()
        }
    }

    /// Operand size in bytes for the current instruction (4, or 2 with 0x66)
    #[inline]
    fn op_size(&self) -> usize {
        if self.operand_size_override {
            2
        } else {
            4
        }
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    /// Push a dword; ESP decrements before the write
    #[inline]
    fn push32(&mut self, val: u32) -> Result<(), VmError> {
        let new_esp = self.esp.wrapping_sub(4);
        self.mem_write_u32(new_esp, val)?;
        self.esp = new_esp;
        log(LogCategory::Stack, LogLevel::Trace, || {
            format!("push32 {:08X} -> esp {:08X}", val, new_esp)
        });
        Ok(())
    }

    /// Pop a dword; ESP increments after the read
    #[inline]
    fn pop32(&mut self) -> Result<u32, VmError> {
        if self.esp as u64 + 4 > self.memory.size() as u64 {
            return Err(VmError::StackUnderflow { esp: self.esp });
        }
        let val = self.mem_read_u32(self.esp)?;
        self.esp = self.esp.wrapping_add(4);
        log(LogCategory::Stack, LogLevel::Trace, || {
            format!("pop32 {:08X} -> esp {:08X}", val, self.esp)
        });
        Ok(val)
    }

    /// Push a word (0x66-prefixed stack op)
    #[inline]
    fn push16(&mut self, val: u16) -> Result<(), VmError> {
        let new_esp = self.esp.wrapping_sub(2);
        self.mem_write_u16(new_esp, val)?;
        self.esp = new_esp;
        Ok(())
    }

    /// Pop a word (0x66-prefixed stack op)
    #[inline]
    fn pop16(&mut self) -> Result<u16, VmError> {
        if self.esp as u64 + 2 > self.memory.size() as u64 {
            return Err(VmError::StackUnderflow { esp: self.esp });
        }
        let val = self.mem_read_u16(self.esp)?;
        self.esp = self.esp.wrapping_add(2);
        Ok(val)
    }

    /// Push an operand-size value
    #[inline]
    fn push_op(&mut self, val: u32) -> Result<(), VmError> {
        if self.operand_size_override {
            self.push16(val as u16)
        } else {
            self.push32(val)
        }
    }

    /// Pop an operand-size value, zero-extended
    #[inline]
    fn pop_op(&mut self) -> Result<u32, VmError> {
        if self.operand_size_override {
            Ok(self.pop16()? as u32)
        } else {
            self.pop32()
        }
    }

    // ------------------------------------------------------------------
    // ModR/M and SIB decoding
    // ------------------------------------------------------------------

    /// Split a ModR/M byte into (mod, reg, rm)
    #[inline]
    fn decode_modrm(modrm: u8) -> (u8, u8, u8) {
        (modrm >> 6, (modrm >> 3) & 0x07, modrm & 0x07)
    }

    /// Fetch and decode a ModR/M byte plus any SIB/displacement bytes
    ///
    /// Returns the reg field and the r/m operand. The effective address
    /// follows the 32-bit table, or the 16-bit table under the 0x67
    /// prefix.
    fn modrm(&mut self) -> Result<(u8, RmOperand), VmError> {
        let byte = self.fetch_u8()?;
        let (modbits, reg, rm) = Self::decode_modrm(byte);

        if modbits == 0b11 {
            return Ok((reg, RmOperand::Reg(rm)));
        }

        let addr = if self.address_size_override {
            self.effective_address_16(modbits, rm)?
        } else {
            self.effective_address_32(modbits, rm)?
        };
        Ok((reg, RmOperand::Mem(addr)))
    }

    /// 32-bit effective address computation (Intel SDM table 2-2)
    fn effective_address_32(&mut self, modbits: u8, rm: u8) -> Result<u32, VmError> {
        let base = match (modbits, rm) {
            // disp32 only
            (0b00, 5) => return self.fetch_u32(),
            // SIB byte follows
            (_, 4) => return self.effective_address_sib(modbits),
            _ => self.get_reg32(rm),
        };

        let disp = match modbits {
            0b00 => 0,
            0b01 => self.fetch_u8()? as i8 as i32 as u32,
            0b10 => self.fetch_u32()?,
            _ => unreachable!(),
        };
        Ok(base.wrapping_add(disp))
    }

    /// SIB effective address: base + (index << scale) + disp
    fn effective_address_sib(&mut self, modbits: u8) -> Result<u32, VmError> {
        let sib = self.fetch_u8()?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 0x07;
        let base_reg = sib & 0x07;

        // index=4 means "no index"; ESP cannot be scaled
        let scaled = if index == 4 {
            0
        } else {
            self.get_reg32(index).wrapping_shl(scale as u32)
        };

        // base=5 with mod=00 replaces the base with a disp32
        let base = if base_reg == 5 && modbits == 0b00 {
            self.fetch_u32()?
        } else {
            self.get_reg32(base_reg)
        };

        let disp = match modbits {
            0b00 => 0,
            0b01 => self.fetch_u8()? as i8 as i32 as u32,
            0b10 => self.fetch_u32()?,
            _ => unreachable!(),
        };
        Ok(base.wrapping_add(scaled).wrapping_add(disp))
    }

    /// 16-bit effective address computation (0x67 prefix)
    ///
    /// The classic BX+SI table; arithmetic wraps at 16 bits before being
    /// zero-extended into the flat address space.
    fn effective_address_16(&mut self, modbits: u8, rm: u8) -> Result<u32, VmError> {
        let base: u16 = match rm {
            0 => self.get_reg16(EBX).wrapping_add(self.get_reg16(ESI)),
            1 => self.get_reg16(EBX).wrapping_add(self.get_reg16(EDI)),
            2 => self.get_reg16(EBP).wrapping_add(self.get_reg16(ESI)),
            3 => self.get_reg16(EBP).wrapping_add(self.get_reg16(EDI)),
            4 => self.get_reg16(ESI),
            5 => self.get_reg16(EDI),
            6 => {
                if modbits == 0b00 {
                    // disp16 only
                    return Ok(self.fetch_u16()? as u32);
                }
                self.get_reg16(EBP)
            }
            7 => self.get_reg16(EBX),
            _ => unreachable!(),
        };

        let disp: u16 = match modbits {
            0b00 => 0,
            0b01 => self.fetch_u8()? as i8 as i16 as u16,
            0b10 => self.fetch_u16()?,
            _ => unreachable!(),
        };
        Ok(base.wrapping_add(disp) as u32)
    }

    /// Read the 8-bit value of an r/m operand
    #[inline]
    fn read_rm8(&self, rm: RmOperand) -> Result<u8, VmError> {
        match rm {
            RmOperand::Reg(idx) => Ok(self.get_reg8(idx)),
            RmOperand::Mem(addr) => self.mem_read_u8(addr),
        }
    }

    /// Write the 8-bit value of an r/m operand
    #[inline]
    fn write_rm8(&mut self, rm: RmOperand, val: u8) -> Result<(), VmError> {
        match rm {
            RmOperand::Reg(idx) => {
                self.set_reg8(idx, val);
                Ok(())
            }
            RmOperand::Mem(addr) => self.mem_write_u8(addr, val),
        }
    }

    /// Read the 16-bit value of an r/m operand
    #[inline]
    fn read_rm16(&self, rm: RmOperand) -> Result<u16, VmError> {
        match rm {
            RmOperand::Reg(idx) => Ok(self.get_reg16(idx)),
            RmOperand::Mem(addr) => self.mem_read_u16(addr),
        }
    }

    /// Write the 16-bit value of an r/m operand
    #[inline]
    fn write_rm16(&mut self, rm: RmOperand, val: u16) -> Result<(), VmError> {
        match rm {
            RmOperand::Reg(idx) => {
                self.set_reg16(idx, val);
                Ok(())
            }
            RmOperand::Mem(addr) => self.mem_write_u16(addr, val),
        }
    }

    /// Read the 32-bit value of an r/m operand
    #[inline]
    fn read_rm32(&self, rm: RmOperand) -> Result<u32, VmError> {
        match rm {
            RmOperand::Reg(idx) => Ok(self.get_reg32(idx)),
            RmOperand::Mem(addr) => self.mem_read_u32(addr),
        }
    }

    /// Write the 32-bit value of an r/m operand
    #[inline]
    fn write_rm32(&mut self, rm: RmOperand, val: u32) -> Result<(), VmError> {
        match rm {
            RmOperand::Reg(idx) => {
                self.set_reg32(idx, val);
                Ok(())
            }
            RmOperand::Mem(addr) => self.mem_write_u32(addr, val),
        }
    }

    /// Read an operand-size r/m value, zero-extended to 32 bits
    #[inline]
    fn read_rm_op(&self, rm: RmOperand) -> Result<u32, VmError> {
        if self.operand_size_override {
            Ok(self.read_rm16(rm)? as u32)
        } else {
            self.read_rm32(rm)
        }
    }

    /// Write an operand-size r/m value (truncating under 0x66)
    #[inline]
    fn write_rm_op(&mut self, rm: RmOperand, val: u32) -> Result<(), VmError> {
        if self.operand_size_override {
            self.write_rm16(rm, val as u16)
        } else {
            self.write_rm32(rm, val)
        }
    }

    // ------------------------------------------------------------------
    // Fetch-decode loop
    // ------------------------------------------------------------------

    /// Execute a single instruction
    ///
    /// Returns the approximate cycle cost. Prefix bytes are accumulated
    /// here and cleared once the instruction retires; they never execute
    /// on their own.
    pub fn step(&mut self) -> Result<u32, VmError> {
        if self.halted {
            return Ok(1);
        }

        self.instruction_start_eip = self.eip;

        // Prefix accumulation: 0x66/0x67/REP plus ignored segment overrides
        let opcode = loop {
            let byte = self.fetch_u8()?;
            match byte {
                0x66 => self.operand_size_override = true,
                0x67 => self.address_size_override = true,
                0xF2 | 0xF3 => self.rep_prefix = Some(RepPrefix::Rep),
                // Segment overrides: flat memory model, nothing to do
                0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {
                    log(LogCategory::Stubs, LogLevel::Debug, || {
                        format!("ignoring segment override {:02X}", byte)
                    });
                }
                _ => break byte,
            }
        };

        if self.debug {
            log(LogCategory::Cpu, LogLevel::Trace, || {
                format!(
                    "eip={:08X} op={:02X} eax={:08X} ecx={:08X} edx={:08X} ebx={:08X} esp={:08X} flags={:04X}",
                    self.instruction_start_eip,
                    opcode,
                    self.eax,
                    self.ecx,
                    self.edx,
                    self.ebx,
                    self.esp,
                    self.eflags
                )
            });
        }

        let cycles = self.execute(opcode)?;

        self.operand_size_override = false;
        self.address_size_override = false;
        self.rep_prefix = None;
        self.cycles += cycles as u64;
        Ok(cycles)
    }

    /// Run until the guest halts; returns the exit code
    pub fn run(&mut self) -> Result<u8, VmError> {
        while !self.halted {
            self.step()?;
        }
        Ok(self.exit_code)
    }

    /// Load a flat binary image at `offset` and run it to halt
    ///
    /// EIP is set to `offset`; ESP and EBP start at the top of memory.
    pub fn execute_bytes(&mut self, data: &[u8], offset: u32) -> Result<u8, VmError> {
        self.memory.set(offset, data).map_err(|source| VmError::Mem {
            eip: offset,
            source,
        })?;
        self.eip = offset;
        let top = self.memory.size() as u32;
        self.esp = top;
        self.ebp = top;
        self.halted = false;
        self.run()
    }

    /// Read a flat binary from disk and execute it
    pub fn execute_file(&mut self, path: &std::path::Path, offset: u32) -> Result<u8, VmError> {
        let data = std::fs::read(path)?;
        self.execute_bytes(&data, offset)
    }

    /// Fatal decode failure, reporting the offending bytes
    fn unknown_opcode(&self, bytes: &[u8]) -> VmError {
        VmError::UnknownOpcode {
            eip: self.instruction_start_eip,
            bytes: bytes.to_vec(),
        }
    }

    /// Dispatch one opcode byte
    fn execute(&mut self, opcode: u8) -> Result<u32, VmError> {
        match opcode {
            // ALU column encodings: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP
            0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25 | 0x28..=0x2D
            | 0x30..=0x35 | 0x38..=0x3D => self.exec_alu_column(opcode),

            // Two-byte opcodes
            0x0F => self.exec_two_byte(),

            // INC r32 / DEC r32
            0x40..=0x47 => self.exec_inc_reg(opcode - 0x40),
            0x48..=0x4F => self.exec_dec_reg(opcode - 0x48),

            // PUSH r / POP r
            0x50..=0x57 => {
                let val = self.reg_op(opcode - 0x50);
                self.push_op(val)?;
                Ok(2)
            }
            0x58..=0x5F => {
                let val = self.pop_op()?;
                self.set_reg_op(opcode - 0x58, val);
                Ok(2)
            }

            // PUSH imm
            0x68 => {
                let imm = self.fetch_imm()?;
                self.push_op(imm)?;
                Ok(2)
            }
            0x6A => {
                let imm = self.fetch_u8()? as i8 as i32 as u32;
                self.push_op(imm)?;
                Ok(2)
            }

            // IMUL r, r/m, imm
            0x69 => self.exec_imul_3op(false),
            0x6B => self.exec_imul_3op(true),

            // Jcc rel8
            0x70..=0x7F => {
                let disp = self.fetch_u8()? as i8 as i32;
                if self.check_condition(opcode & 0x0F) {
                    self.eip = self.eip.wrapping_add(disp as u32);
                }
                Ok(3)
            }

            // ALU group 1: r/m, imm selected by /digit
            0x80 | 0x81 | 0x83 => self.exec_alu_group1(opcode),

            // TEST r/m, r
            0x84 => {
                let (reg, rm) = self.modrm()?;
                let a = self.read_rm8(rm)?;
                let b = self.get_reg8(reg);
                self.logic_flags8(a & b);
                Ok(2)
            }
            0x85 => {
                let (reg, rm) = self.modrm()?;
                if self.operand_size_override {
                    let a = self.read_rm16(rm)?;
                    let b = self.get_reg16(reg);
                    self.logic_flags16(a & b);
                } else {
                    let a = self.read_rm32(rm)?;
                    let b = self.get_reg32(reg);
                    self.logic_flags32(a & b);
                }
                Ok(2)
            }

            // XCHG r/m, r
            0x86 => {
                let (reg, rm) = self.modrm()?;
                let a = self.read_rm8(rm)?;
                let b = self.get_reg8(reg);
                self.write_rm8(rm, b)?;
                self.set_reg8(reg, a);
                Ok(3)
            }
            0x87 => {
                let (reg, rm) = self.modrm()?;
                if self.operand_size_override {
                    let a = self.read_rm16(rm)?;
                    let b = self.get_reg16(reg);
                    self.write_rm16(rm, b)?;
                    self.set_reg16(reg, a);
                } else {
                    let a = self.read_rm32(rm)?;
                    let b = self.get_reg32(reg);
                    self.write_rm32(rm, b)?;
                    self.set_reg32(reg, a);
                }
                Ok(3)
            }

            // MOV r/m, r and MOV r, r/m
            0x88 => {
                let (reg, rm) = self.modrm()?;
                let val = self.get_reg8(reg);
                self.write_rm8(rm, val)?;
                Ok(2)
            }
            0x89 => {
                let (reg, rm) = self.modrm()?;
                let val = self.reg_op(reg);
                self.write_rm_op(rm, val)?;
                Ok(2)
            }
            0x8A => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm8(rm)?;
                self.set_reg8(reg, val);
                Ok(2)
            }
            0x8B => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm_op(rm)?;
                self.set_reg_op(reg, val);
                Ok(2)
            }

            // LEA r, m
            0x8D => {
                let (reg, rm) = self.modrm()?;
                match rm {
                    RmOperand::Mem(addr) => {
                        self.set_reg_op(reg, addr);
                        Ok(2)
                    }
                    // Register-direct LEA has no effective address (#UD)
                    RmOperand::Reg(_) => Err(self.unknown_opcode(&[0x8D])),
                }
            }

            // POP r/m
            0x8F => {
                let (digit, rm) = self.modrm()?;
                if digit != 0 {
                    return Err(self.unknown_opcode(&[0x8F, digit]));
                }
                let val = self.pop_op()?;
                self.write_rm_op(rm, val)?;
                Ok(3)
            }

            // NOP (canonically XCHG EAX, EAX)
            0x90 => Ok(1),

            // XCHG eAX, r
            0x91..=0x97 => {
                let reg = opcode - 0x90;
                if self.operand_size_override {
                    let a = self.get_reg16(EAX);
                    let b = self.get_reg16(reg);
                    self.set_reg16(EAX, b);
                    self.set_reg16(reg, a);
                } else {
                    let a = self.eax;
                    let b = self.get_reg32(reg);
                    self.eax = b;
                    self.set_reg32(reg, a);
                }
                Ok(2)
            }

            // CBW / CWDE
            0x98 => {
                if self.operand_size_override {
                    let val = self.get_reg8(0) as i8 as i16 as u16;
                    self.set_reg16(EAX, val);
                } else {
                    let val = self.get_reg16(EAX) as i16 as i32 as u32;
                    self.eax = val;
                }
                Ok(1)
            }

            // CWD / CDQ
            0x99 => {
                if self.operand_size_override {
                    let fill = if (self.get_reg16(EAX) & 0x8000) != 0 {
                        0xFFFF
                    } else {
                        0
                    };
                    self.set_reg16(EDX, fill);
                } else {
                    self.edx = if (self.eax & 0x8000_0000) != 0 {
                        0xFFFF_FFFF
                    } else {
                        0
                    };
                }
                Ok(1)
            }

            // MOV moffs forms
            0xA0..=0xA3 => self.exec_mov_moffs(opcode),

            // MOVSB / MOVSW / MOVSD
            0xA4 => self.exec_movs(1),
            0xA5 => {
                let width = self.op_size();
                self.exec_movs(width)
            }

            // TEST AL/eAX, imm
            0xA8 => {
                let imm = self.fetch_u8()?;
                let result = self.get_reg8(0) & imm;
                self.logic_flags8(result);
                Ok(1)
            }
            0xA9 => {
                let imm = self.fetch_imm()?;
                if self.operand_size_override {
                    self.logic_flags16(self.get_reg16(EAX) & imm as u16);
                } else {
                    self.logic_flags32(self.eax & imm);
                }
                Ok(1)
            }

            // MOV r8, imm8
            0xB0..=0xB7 => {
                let imm = self.fetch_u8()?;
                self.set_reg8(opcode - 0xB0, imm);
                Ok(1)
            }

            // MOV r, imm
            0xB8..=0xBF => {
                let imm = self.fetch_imm()?;
                self.set_reg_op(opcode - 0xB8, imm);
                Ok(1)
            }

            // Shift group 2: r/m, imm8
            0xC0 => {
                let count_src = ShiftCount::Imm8;
                self.exec_shift_group(opcode, true, count_src)
            }
            0xC1 => {
                let count_src = ShiftCount::Imm8;
                self.exec_shift_group(opcode, false, count_src)
            }

            // RET imm16 / RET
            0xC2 => {
                let imm = self.fetch_u16()?;
                self.eip = self.pop_op()?;
                self.esp = self.esp.wrapping_add(imm as u32);
                Ok(4)
            }
            0xC3 => {
                self.eip = self.pop_op()?;
                Ok(4)
            }

            // MOV r/m, imm
            0xC6 => {
                let (digit, rm) = self.modrm()?;
                if digit != 0 {
                    return Err(self.unknown_opcode(&[0xC6, digit]));
                }
                let imm = self.fetch_u8()?;
                self.write_rm8(rm, imm)?;
                Ok(2)
            }
            0xC7 => {
                let (digit, rm) = self.modrm()?;
                if digit != 0 {
                    return Err(self.unknown_opcode(&[0xC7, digit]));
                }
                let imm = self.fetch_imm()?;
                self.write_rm_op(rm, imm)?;
                Ok(2)
            }

            // LEAVE
            0xC9 => {
                self.esp = self.ebp;
                if self.operand_size_override {
                    let bp = self.pop16()?;
                    self.set_reg16(EBP, bp);
                } else {
                    self.ebp = self.pop32()?;
                }
                Ok(3)
            }

            // INT imm8: only the 0x80 syscall gate is wired up
            0xCD => {
                let vector = self.fetch_u8()?;
                if vector != 0x80 {
                    return Err(self.unknown_opcode(&[0xCD, vector]));
                }
                self.exec_syscall()
            }

            // Shift group 2: count 1 / count CL
            0xD0 => self.exec_shift_group(opcode, true, ShiftCount::One),
            0xD1 => self.exec_shift_group(opcode, false, ShiftCount::One),
            0xD2 => self.exec_shift_group(opcode, true, ShiftCount::Cl),
            0xD3 => self.exec_shift_group(opcode, false, ShiftCount::Cl),

            // CALL rel / JMP rel
            0xE8 => {
                let rel = self.fetch_rel()?;
                self.push32(self.eip)?;
                self.eip = self.eip.wrapping_add(rel as u32);
                Ok(4)
            }
            0xE9 => {
                let rel = self.fetch_rel()?;
                self.eip = self.eip.wrapping_add(rel as u32);
                Ok(3)
            }
            0xEB => {
                let rel = self.fetch_u8()? as i8 as i32;
                self.eip = self.eip.wrapping_add(rel as u32);
                Ok(3)
            }

            // HLT: cooperative halt, exit code untouched
            0xF4 => {
                self.halted = true;
                Ok(1)
            }

            // CMC / CLC / STC / CLI / STI / CLD / STD
            0xF5 => {
                let cf = self.get_flag(FLAG_CF);
                self.set_flag(FLAG_CF, !cf);
                Ok(1)
            }
            0xF8 => {
                self.set_flag(FLAG_CF, false);
                Ok(1)
            }
            0xF9 => {
                self.set_flag(FLAG_CF, true);
                Ok(1)
            }
            0xFA => {
                self.set_flag(FLAG_IF, false);
                Ok(1)
            }
            0xFB => {
                self.set_flag(FLAG_IF, true);
                Ok(1)
            }
            0xFC => {
                self.set_flag(FLAG_DF, false);
                Ok(1)
            }
            0xFD => {
                self.set_flag(FLAG_DF, true);
                Ok(1)
            }

            // Unary group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV by /digit
            0xF6 => self.exec_group3_8(),
            0xF7 => self.exec_group3_op(),

            // INC/DEC r/m8
            0xFE => {
                let (digit, rm) = self.modrm()?;
                let val = self.read_rm8(rm)?;
                let cf = self.get_flag(FLAG_CF);
                let result = match digit {
                    0 => self.alu_add8(val, 1, false),
                    1 => self.alu_sub8(val, 1, false),
                    _ => return Err(self.unknown_opcode(&[0xFE, digit])),
                };
                self.set_flag(FLAG_CF, cf); // INC/DEC preserve CF
                self.write_rm8(rm, result)?;
                Ok(2)
            }

            // Group 5: INC/DEC/CALL/JMP/PUSH r/m
            0xFF => self.exec_group5(),

            _ => Err(self.unknown_opcode(&[opcode])),
        }
    }

    /// Fetch an operand-size branch displacement, sign-extended
    #[inline]
    fn fetch_rel(&mut self) -> Result<i32, VmError> {
        if self.operand_size_override {
            Ok(self.fetch_u16()? as i16 as i32)
        } else {
            Ok(self.fetch_u32()? as i32)
        }
    }

    /// Operand-size register read, zero-extended
    #[inline]
    fn reg_op(&self, reg: u8) -> u32 {
        if self.operand_size_override {
            self.get_reg16(reg) as u32
        } else {
            self.get_reg32(reg)
        }
    }

    /// Operand-size register write (truncating under 0x66)
    #[inline]
    fn set_reg_op(&mut self, reg: u8, val: u32) {
        if self.operand_size_override {
            self.set_reg16(reg, val as u16);
        } else {
            self.set_reg32(reg, val);
        }
    }

    // ------------------------------------------------------------------
    // Instruction groups
    // ------------------------------------------------------------------

    /// Apply a binary ALU operation at the current operand size,
    /// computing flags; returns the result to write back (callers skip
    /// the write for CMP)
    fn alu_apply8(&mut self, op: u8, a: u8, b: u8) -> u8 {
        let cf = self.get_flag(FLAG_CF);
        match op {
            0 => self.alu_add8(a, b, false),          // ADD
            1 => {
                let r = a | b;
                self.logic_flags8(r);
                r
            } // OR
            2 => self.alu_add8(a, b, cf),             // ADC
            3 => self.alu_sub8(a, b, cf),             // SBB
            4 => {
                let r = a & b;
                self.logic_flags8(r);
                r
            } // AND
            5 | 7 => self.alu_sub8(a, b, false),      // SUB / CMP
            6 => {
                let r = a ^ b;
                self.logic_flags8(r);
                r
            } // XOR
            _ => unreachable!(),
        }
    }

    fn alu_apply16(&mut self, op: u8, a: u16, b: u16) -> u16 {
        let cf = self.get_flag(FLAG_CF);
        match op {
            0 => self.alu_add16(a, b, false),
            1 => {
                let r = a | b;
                self.logic_flags16(r);
                r
            }
            2 => self.alu_add16(a, b, cf),
            3 => self.alu_sub16(a, b, cf),
            4 => {
                let r = a & b;
                self.logic_flags16(r);
                r
            }
            5 | 7 => self.alu_sub16(a, b, false),
            6 => {
                let r = a ^ b;
                self.logic_flags16(r);
                r
            }
            _ => unreachable!(),
        }
    }

    fn alu_apply32(&mut self, op: u8, a: u32, b: u32) -> u32 {
        let cf = self.get_flag(FLAG_CF);
        match op {
            0 => self.alu_add32(a, b, false),
            1 => {
                let r = a | b;
                self.logic_flags32(r);
                r
            }
            2 => self.alu_add32(a, b, cf),
            3 => self.alu_sub32(a, b, cf),
            4 => {
                let r = a & b;
                self.logic_flags32(r);
                r
            }
            5 | 7 => self.alu_sub32(a, b, false),
            6 => {
                let r = a ^ b;
                self.logic_flags32(r);
                r
            }
            _ => unreachable!(),
        }
    }

    /// The classic ALU column block (opcodes 0x00..0x3D)
    ///
    /// The operation index is bits 3..5 of the opcode, the form is the
    /// low three bits: rm8,r8 / rm,r / r8,rm8 / r,rm / AL,imm8 / eAX,imm.
    fn exec_alu_column(&mut self, opcode: u8) -> Result<u32, VmError> {
        let op = (opcode >> 3) & 0x07;
        let is_cmp = op == 7;
        match opcode & 0x07 {
            // r/m8, r8
            0 => {
                let (reg, rm) = self.modrm()?;
                let a = self.read_rm8(rm)?;
                let b = self.get_reg8(reg);
                let r = self.alu_apply8(op, a, b);
                if !is_cmp {
                    self.write_rm8(rm, r)?;
                }
                Ok(2)
            }
            // r/m, r
            1 => {
                let (reg, rm) = self.modrm()?;
                if self.operand_size_override {
                    let a = self.read_rm16(rm)?;
                    let b = self.get_reg16(reg);
                    let r = self.alu_apply16(op, a, b);
                    if !is_cmp {
                        self.write_rm16(rm, r)?;
                    }
                } else {
                    let a = self.read_rm32(rm)?;
                    let b = self.get_reg32(reg);
                    let r = self.alu_apply32(op, a, b);
                    if !is_cmp {
                        self.write_rm32(rm, r)?;
                    }
                }
                Ok(2)
            }
            // r8, r/m8
            2 => {
                let (reg, rm) = self.modrm()?;
                let a = self.get_reg8(reg);
                let b = self.read_rm8(rm)?;
                let r = self.alu_apply8(op, a, b);
                if !is_cmp {
                    self.set_reg8(reg, r);
                }
                Ok(2)
            }
            // r, r/m
            3 => {
                let (reg, rm) = self.modrm()?;
                if self.operand_size_override {
                    let a = self.get_reg16(reg);
                    let b = self.read_rm16(rm)?;
                    let r = self.alu_apply16(op, a, b);
                    if !is_cmp {
                        self.set_reg16(reg, r);
                    }
                } else {
                    let a = self.get_reg32(reg);
                    let b = self.read_rm32(rm)?;
                    let r = self.alu_apply32(op, a, b);
                    if !is_cmp {
                        self.set_reg32(reg, r);
                    }
                }
                Ok(2)
            }
            // AL, imm8
            4 => {
                let imm = self.fetch_u8()?;
                let a = self.get_reg8(0);
                let r = self.alu_apply8(op, a, imm);
                if !is_cmp {
                    self.set_reg8(0, r);
                }
                Ok(1)
            }
            // eAX, imm
            5 => {
                let imm = self.fetch_imm()?;
                if self.operand_size_override {
                    let a = self.get_reg16(EAX);
                    let r = self.alu_apply16(op, a, imm as u16);
                    if !is_cmp {
                        self.set_reg16(EAX, r);
                    }
                } else {
                    let a = self.eax;
                    let r = self.alu_apply32(op, a, imm);
                    if !is_cmp {
                        self.eax = r;
                    }
                }
                Ok(1)
            }
            _ => Err(self.unknown_opcode(&[opcode])),
        }
    }

    /// ALU group 1 (0x80/0x81/0x83): r/m, imm with /digit operation
    fn exec_alu_group1(&mut self, opcode: u8) -> Result<u32, VmError> {
        let (op, rm) = self.modrm()?;
        let is_cmp = op == 7;
        match opcode {
            // r/m8, imm8
            0x80 => {
                let imm = self.fetch_u8()?;
                let a = self.read_rm8(rm)?;
                let r = self.alu_apply8(op, a, imm);
                if !is_cmp {
                    self.write_rm8(rm, r)?;
                }
            }
            // r/m, imm
            0x81 => {
                let imm = self.fetch_imm()?;
                if self.operand_size_override {
                    let a = self.read_rm16(rm)?;
                    let r = self.alu_apply16(op, a, imm as u16);
                    if !is_cmp {
                        self.write_rm16(rm, r)?;
                    }
                } else {
                    let a = self.read_rm32(rm)?;
                    let r = self.alu_apply32(op, a, imm);
                    if !is_cmp {
                        self.write_rm32(rm, r)?;
                    }
                }
            }
            // r/m, imm8 sign-extended
            0x83 => {
                let imm = self.fetch_u8()? as i8;
                if self.operand_size_override {
                    let a = self.read_rm16(rm)?;
                    let r = self.alu_apply16(op, a, imm as i16 as u16);
                    if !is_cmp {
                        self.write_rm16(rm, r)?;
                    }
                } else {
                    let a = self.read_rm32(rm)?;
                    let r = self.alu_apply32(op, a, imm as i32 as u32);
                    if !is_cmp {
                        self.write_rm32(rm, r)?;
                    }
                }
            }
            _ => unreachable!(),
        }
        Ok(2)
    }

    /// INC r32 (0x40+r); CF is preserved
    fn exec_inc_reg(&mut self, reg: u8) -> Result<u32, VmError> {
        let cf = self.get_flag(FLAG_CF);
        if self.operand_size_override {
            let val = self.get_reg16(reg);
            let result = self.alu_add16(val, 1, false);
            self.set_reg16(reg, result);
        } else {
            let val = self.get_reg32(reg);
            let result = self.alu_add32(val, 1, false);
            self.set_reg32(reg, result);
        }
        self.set_flag(FLAG_CF, cf);
        Ok(1)
    }

    /// DEC r32 (0x48+r); CF is preserved
    fn exec_dec_reg(&mut self, reg: u8) -> Result<u32, VmError> {
        let cf = self.get_flag(FLAG_CF);
        if self.operand_size_override {
            let val = self.get_reg16(reg);
            let result = self.alu_sub16(val, 1, false);
            self.set_reg16(reg, result);
        } else {
            let val = self.get_reg32(reg);
            let result = self.alu_sub32(val, 1, false);
            self.set_reg32(reg, result);
        }
        self.set_flag(FLAG_CF, cf);
        Ok(1)
    }

    /// MOV between AL/eAX and an absolute address (0xA0..0xA3)
    ///
    /// The moffs width follows the address size (0x67 makes it 16-bit).
    fn exec_mov_moffs(&mut self, opcode: u8) -> Result<u32, VmError> {
        let addr = if self.address_size_override {
            self.fetch_u16()? as u32
        } else {
            self.fetch_u32()?
        };
        match opcode {
            0xA0 => {
                let val = self.mem_read_u8(addr)?;
                self.set_reg8(0, val);
            }
            0xA1 => {
                if self.operand_size_override {
                    let val = self.mem_read_u16(addr)?;
                    self.set_reg16(EAX, val);
                } else {
                    self.eax = self.mem_read_u32(addr)?;
                }
            }
            0xA2 => {
                let val = self.get_reg8(0);
                self.mem_write_u8(addr, val)?;
            }
            0xA3 => {
                if self.operand_size_override {
                    let val = self.get_reg16(EAX);
                    self.mem_write_u16(addr, val)?;
                } else {
                    self.mem_write_u32(addr, self.eax)?;
                }
            }
            _ => unreachable!(),
        }
        Ok(2)
    }

    /// MOVS: copy `width` bytes from [ESI] to [EDI], stepping by DF
    ///
    /// With a REP prefix the move repeats ECX times, leaving ECX=0.
    fn exec_movs(&mut self, width: usize) -> Result<u32, VmError> {
        let mut cycles: u32 = 2;
        let reps = if self.rep_prefix.is_some() {
            let n = self.ecx;
            self.ecx = 0;
            n
        } else {
            1
        };

        for _ in 0..reps {
            match width {
                1 => {
                    let val = self.mem_read_u8(self.esi)?;
                    self.mem_write_u8(self.edi, val)?;
                }
                2 => {
                    let val = self.mem_read_u16(self.esi)?;
                    self.mem_write_u16(self.edi, val)?;
                }
                4 => {
                    let val = self.mem_read_u32(self.esi)?;
                    self.mem_write_u32(self.edi, val)?;
                }
                _ => unreachable!(),
            }
            let delta = width as u32;
            if self.get_flag(FLAG_DF) {
                self.esi = self.esi.wrapping_sub(delta);
                self.edi = self.edi.wrapping_sub(delta);
            } else {
                self.esi = self.esi.wrapping_add(delta);
                self.edi = self.edi.wrapping_add(delta);
            }
            cycles += 4;
        }
        Ok(cycles)
    }

    /// IMUL r, r/m[, imm] (0x69 imm, 0x6B imm8)
    fn exec_imul_3op(&mut self, imm8: bool) -> Result<u32, VmError> {
        let (reg, rm) = self.modrm()?;
        if self.operand_size_override {
            let a = self.read_rm16(rm)? as i16 as i32;
            let b = if imm8 {
                self.fetch_u8()? as i8 as i32
            } else {
                self.fetch_u16()? as i16 as i32
            };
            let full = a * b;
            let trunc = full as i16;
            let overflow = full != trunc as i32;
            self.set_flag(FLAG_CF, overflow);
            self.set_flag(FLAG_OF, overflow);
            self.set_reg16(reg, trunc as u16);
        } else {
            let a = self.read_rm32(rm)? as i32 as i64;
            let b = if imm8 {
                self.fetch_u8()? as i8 as i64
            } else {
                self.fetch_u32()? as i32 as i64
            };
            let full = a * b;
            let trunc = full as i32;
            let overflow = full != trunc as i64;
            self.set_flag(FLAG_CF, overflow);
            self.set_flag(FLAG_OF, overflow);
            self.set_reg32(reg, trunc as u32);
        }
        Ok(9)
    }

    /// Unary group 3, 8-bit (0xF6)
    fn exec_group3_8(&mut self) -> Result<u32, VmError> {
        let (digit, rm) = self.modrm()?;
        match digit {
            // TEST r/m8, imm8
            0 => {
                let imm = self.fetch_u8()?;
                let a = self.read_rm8(rm)?;
                self.logic_flags8(a & imm);
                Ok(2)
            }
            // NOT r/m8: no flags affected
            2 => {
                let a = self.read_rm8(rm)?;
                self.write_rm8(rm, !a)?;
                Ok(2)
            }
            // NEG r/m8: CF set iff operand nonzero
            3 => {
                let a = self.read_rm8(rm)?;
                let result = self.alu_sub8(0, a, false);
                self.write_rm8(rm, result)?;
                Ok(2)
            }
            // MUL: AX = AL * r/m8
            4 => {
                let a = self.get_reg8(0) as u16;
                let b = self.read_rm8(rm)? as u16;
                let product = a * b;
                self.set_reg16(EAX, product);
                let upper = (product >> 8) != 0;
                self.set_flag(FLAG_CF, upper);
                self.set_flag(FLAG_OF, upper);
                Ok(9)
            }
            // IMUL: AX = AL * r/m8 (signed)
            5 => {
                let a = self.get_reg8(0) as i8 as i16;
                let b = self.read_rm8(rm)? as i8 as i16;
                let product = a * b;
                self.set_reg16(EAX, product as u16);
                let overflow = product != (product as i8) as i16;
                self.set_flag(FLAG_CF, overflow);
                self.set_flag(FLAG_OF, overflow);
                Ok(9)
            }
            // DIV: AL = AX / r/m8, AH = remainder
            6 => {
                let divisor = self.read_rm8(rm)? as u16;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend = self.get_reg16(EAX);
                let quotient = dividend / divisor;
                if quotient > 0xFF {
                    return Err(self.divide_error());
                }
                let remainder = dividend % divisor;
                self.set_reg8(0, quotient as u8);
                self.set_reg8(4, remainder as u8); // AH
                Ok(14)
            }
            // IDIV: signed
            7 => {
                let divisor = self.read_rm8(rm)? as i8 as i16;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend = self.get_reg16(EAX) as i16;
                let quotient = match dividend.checked_div(divisor) {
                    Some(q) if (-128..=127).contains(&q) => q,
                    _ => return Err(self.divide_error()),
                };
                let remainder = dividend % divisor;
                self.set_reg8(0, quotient as u8);
                self.set_reg8(4, remainder as u8); // AH
                Ok(16)
            }
            _ => Err(self.unknown_opcode(&[0xF6, digit])),
        }
    }

    /// Unary group 3, operand size (0xF7)
    fn exec_group3_op(&mut self) -> Result<u32, VmError> {
        let (digit, rm) = self.modrm()?;
        if self.operand_size_override {
            self.exec_group3_16(digit, rm)
        } else {
            self.exec_group3_32(digit, rm)
        }
    }

    fn exec_group3_16(&mut self, digit: u8, rm: RmOperand) -> Result<u32, VmError> {
        match digit {
            0 => {
                let imm = self.fetch_u16()?;
                let a = self.read_rm16(rm)?;
                self.logic_flags16(a & imm);
                Ok(2)
            }
            2 => {
                let a = self.read_rm16(rm)?;
                self.write_rm16(rm, !a)?;
                Ok(2)
            }
            3 => {
                let a = self.read_rm16(rm)?;
                let result = self.alu_sub16(0, a, false);
                self.write_rm16(rm, result)?;
                Ok(2)
            }
            // MUL: DX:AX = AX * r/m16
            4 => {
                let a = self.get_reg16(EAX) as u32;
                let b = self.read_rm16(rm)? as u32;
                let product = a * b;
                self.set_reg16(EAX, product as u16);
                self.set_reg16(EDX, (product >> 16) as u16);
                let upper = (product >> 16) != 0;
                self.set_flag(FLAG_CF, upper);
                self.set_flag(FLAG_OF, upper);
                Ok(9)
            }
            5 => {
                let a = self.get_reg16(EAX) as i16 as i32;
                let b = self.read_rm16(rm)? as i16 as i32;
                let product = a * b;
                self.set_reg16(EAX, product as u16);
                self.set_reg16(EDX, (product >> 16) as u16);
                let overflow = product != (product as i16) as i32;
                self.set_flag(FLAG_CF, overflow);
                self.set_flag(FLAG_OF, overflow);
                Ok(9)
            }
            // DIV: AX = DX:AX / r/m16, DX = remainder
            6 => {
                let divisor = self.read_rm16(rm)? as u32;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend =
                    ((self.get_reg16(EDX) as u32) << 16) | (self.get_reg16(EAX) as u32);
                let quotient = dividend / divisor;
                if quotient > 0xFFFF {
                    return Err(self.divide_error());
                }
                self.set_reg16(EAX, quotient as u16);
                self.set_reg16(EDX, (dividend % divisor) as u16);
                Ok(22)
            }
            7 => {
                let divisor = self.read_rm16(rm)? as i16 as i32;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend =
                    (((self.get_reg16(EDX) as u32) << 16) | (self.get_reg16(EAX) as u32)) as i32;
                let quotient = match dividend.checked_div(divisor) {
                    Some(q) if (-32768..=32767).contains(&q) => q,
                    _ => return Err(self.divide_error()),
                };
                self.set_reg16(EAX, quotient as u16);
                self.set_reg16(EDX, (dividend % divisor) as u16);
                Ok(25)
            }
            _ => Err(self.unknown_opcode(&[0xF7, digit])),
        }
    }

    fn exec_group3_32(&mut self, digit: u8, rm: RmOperand) -> Result<u32, VmError> {
        match digit {
            0 => {
                let imm = self.fetch_u32()?;
                let a = self.read_rm32(rm)?;
                self.logic_flags32(a & imm);
                Ok(2)
            }
            2 => {
                let a = self.read_rm32(rm)?;
                self.write_rm32(rm, !a)?;
                Ok(2)
            }
            3 => {
                let a = self.read_rm32(rm)?;
                let result = self.alu_sub32(0, a, false);
                self.write_rm32(rm, result)?;
                Ok(2)
            }
            // MUL: EDX:EAX = EAX * r/m32
            4 => {
                let a = self.eax as u64;
                let b = self.read_rm32(rm)? as u64;
                let product = a * b;
                self.eax = product as u32;
                self.edx = (product >> 32) as u32;
                let upper = (product >> 32) != 0;
                self.set_flag(FLAG_CF, upper);
                self.set_flag(FLAG_OF, upper);
                Ok(9)
            }
            5 => {
                let a = self.eax as i32 as i64;
                let b = self.read_rm32(rm)? as i32 as i64;
                let product = a * b;
                self.eax = product as u32;
                self.edx = (product >> 32) as u32;
                let overflow = product != (product as i32) as i64;
                self.set_flag(FLAG_CF, overflow);
                self.set_flag(FLAG_OF, overflow);
                Ok(9)
            }
            // DIV: EAX = EDX:EAX / r/m32, EDX = remainder
            6 => {
                let divisor = self.read_rm32(rm)? as u64;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend = ((self.edx as u64) << 32) | (self.eax as u64);
                let quotient = dividend / divisor;
                if quotient > 0xFFFF_FFFF {
                    return Err(self.divide_error());
                }
                self.eax = quotient as u32;
                self.edx = (dividend % divisor) as u32;
                Ok(38)
            }
            7 => {
                let divisor = self.read_rm32(rm)? as i32 as i64;
                if divisor == 0 {
                    return Err(self.divide_error());
                }
                let dividend = (((self.edx as u64) << 32) | (self.eax as u64)) as i64;
                let quotient = match dividend.checked_div(divisor) {
                    Some(q) if (i32::MIN as i64..=i32::MAX as i64).contains(&q) => q,
                    _ => return Err(self.divide_error()),
                };
                self.eax = quotient as u32;
                self.edx = (dividend % divisor) as u32;
                Ok(42)
            }
            _ => Err(self.unknown_opcode(&[0xF7, digit])),
        }
    }

    #[inline]
    fn divide_error(&self) -> VmError {
        VmError::Divide {
            eip: self.instruction_start_eip,
        }
    }

    /// Group 5 (0xFF): INC/DEC/CALL/JMP/PUSH on r/m
    fn exec_group5(&mut self) -> Result<u32, VmError> {
        let (digit, rm) = self.modrm()?;
        match digit {
            // INC r/m
            0 => {
                let cf = self.get_flag(FLAG_CF);
                if self.operand_size_override {
                    let val = self.read_rm16(rm)?;
                    let result = self.alu_add16(val, 1, false);
                    self.write_rm16(rm, result)?;
                } else {
                    let val = self.read_rm32(rm)?;
                    let result = self.alu_add32(val, 1, false);
                    self.write_rm32(rm, result)?;
                }
                self.set_flag(FLAG_CF, cf);
                Ok(2)
            }
            // DEC r/m
            1 => {
                let cf = self.get_flag(FLAG_CF);
                if self.operand_size_override {
                    let val = self.read_rm16(rm)?;
                    let result = self.alu_sub16(val, 1, false);
                    self.write_rm16(rm, result)?;
                } else {
                    let val = self.read_rm32(rm)?;
                    let result = self.alu_sub32(val, 1, false);
                    self.write_rm32(rm, result)?;
                }
                self.set_flag(FLAG_CF, cf);
                Ok(2)
            }
            // CALL r/m (near absolute)
            2 => {
                let target = self.read_rm_op(rm)?;
                self.push32(self.eip)?;
                self.eip = target;
                Ok(4)
            }
            // JMP r/m (near absolute)
            4 => {
                self.eip = self.read_rm_op(rm)?;
                Ok(3)
            }
            // PUSH r/m
            6 => {
                let val = self.read_rm_op(rm)?;
                self.push_op(val)?;
                Ok(2)
            }
            // Far CALL/JMP (/3, /5) are out of scope
            _ => Err(self.unknown_opcode(&[0xFF, digit])),
        }
    }

    /// Two-byte opcodes (0x0F prefix)
    fn exec_two_byte(&mut self) -> Result<u32, VmError> {
        let secondary = self.fetch_u8()?;
        match secondary {
            // Jcc rel32 (rel16 under 0x66)
            0x80..=0x8F => {
                let rel = self.fetch_rel()?;
                if self.check_condition(secondary & 0x0F) {
                    self.eip = self.eip.wrapping_add(rel as u32);
                }
                Ok(3)
            }

            // IMUL r, r/m
            0xAF => {
                let (reg, rm) = self.modrm()?;
                if self.operand_size_override {
                    let a = self.get_reg16(reg) as i16 as i32;
                    let b = self.read_rm16(rm)? as i16 as i32;
                    let full = a * b;
                    let trunc = full as i16;
                    let overflow = full != trunc as i32;
                    self.set_flag(FLAG_CF, overflow);
                    self.set_flag(FLAG_OF, overflow);
                    self.set_reg16(reg, trunc as u16);
                } else {
                    let a = self.get_reg32(reg) as i32 as i64;
                    let b = self.read_rm32(rm)? as i32 as i64;
                    let full = a * b;
                    let trunc = full as i32;
                    let overflow = full != trunc as i64;
                    self.set_flag(FLAG_CF, overflow);
                    self.set_flag(FLAG_OF, overflow);
                    self.set_reg32(reg, trunc as u32);
                }
                Ok(9)
            }

            // MOVZX r, r/m8
            0xB6 => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm8(rm)? as u32;
                self.set_reg_op(reg, val);
                Ok(2)
            }
            // MOVZX r32, r/m16
            0xB7 => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm16(rm)? as u32;
                self.set_reg_op(reg, val);
                Ok(2)
            }
            // MOVSX r, r/m8
            0xBE => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm8(rm)? as i8;
                if self.operand_size_override {
                    self.set_reg16(reg, val as i16 as u16);
                } else {
                    self.set_reg32(reg, val as i32 as u32);
                }
                Ok(2)
            }
            // MOVSX r32, r/m16
            0xBF => {
                let (reg, rm) = self.modrm()?;
                let val = self.read_rm16(rm)? as i16;
                self.set_reg_op(reg, val as i32 as u32);
                Ok(2)
            }

            _ => Err(self.unknown_opcode(&[0x0F, secondary])),
        }
    }

    /// Shift group 2: SHL/SAL (/4), SHR (/5), SAR (/7)
    ///
    /// The count is masked to 5 bits; a masked count of zero leaves the
    /// operand and every flag untouched. OF is only defined for count 1.
    fn exec_shift_group(&mut self, opcode: u8, byte_op: bool, count_src: ShiftCount) -> Result<u32, VmError> {
        let (digit, rm) = self.modrm()?;
        let count = match count_src {
            ShiftCount::One => 1u8,
            ShiftCount::Cl => self.get_reg8(1), // CL
            ShiftCount::Imm8 => self.fetch_u8()?,
        } & 0x1F;

        let kind = match digit {
            4 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            7 => ShiftOp::Sar,
            // Rotates (/0../3) are not part of this core
            _ => return Err(self.unknown_opcode(&[opcode, digit])),
        };

        if count == 0 {
            return Ok(2);
        }

        if byte_op {
            let val = self.read_rm8(rm)?;
            let result = self.shift8(val, kind, count);
            self.write_rm8(rm, result)?;
        } else if self.operand_size_override {
            let val = self.read_rm16(rm)?;
            let result = self.shift16(val, kind, count);
            self.write_rm16(rm, result)?;
        } else {
            let val = self.read_rm32(rm)?;
            let result = self.shift32(val, kind, count);
            self.write_rm32(rm, result)?;
        }
        Ok(3)
    }

    /// 8-bit shift with flag updates; count is 1..=31
    fn shift8(&mut self, val: u8, op: ShiftOp, count: u8) -> u8 {
        let result;
        match op {
            ShiftOp::Shl => {
                let wide = (val as u32) << count;
                result = (wide & 0xFF) as u8;
                self.set_flag(FLAG_CF, (wide & 0x100) != 0);
                if count == 1 {
                    let cf = self.get_flag(FLAG_CF);
                    self.set_flag(FLAG_OF, ((result & 0x80) != 0) != cf);
                }
            }
            ShiftOp::Shr => {
                result = if count < 8 { val >> count } else { 0 };
                let last = if count <= 8 {
                    (val >> (count - 1)) & 1
                } else {
                    0
                };
                self.set_flag(FLAG_CF, last != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, (val & 0x80) != 0);
                }
            }
            ShiftOp::Sar => {
                let signed = val as i8;
                result = if count < 8 {
                    (signed >> count) as u8
                } else if signed < 0 {
                    0xFF
                } else {
                    0
                };
                let last = if count <= 8 {
                    ((signed as i16) >> (count - 1)) & 1
                } else {
                    (signed < 0) as i16
                };
                self.set_flag(FLAG_CF, last != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, false);
                }
            }
        }
        self.update_flags_szp8(result);
        result
    }

    /// 16-bit shift with flag updates; count is 1..=31
    fn shift16(&mut self, val: u16, op: ShiftOp, count: u8) -> u16 {
        let result;
        match op {
            ShiftOp::Shl => {
                let wide = (val as u32) << count;
                result = (wide & 0xFFFF) as u16;
                self.set_flag(FLAG_CF, (wide & 0x1_0000) != 0);
                if count == 1 {
                    let cf = self.get_flag(FLAG_CF);
                    self.set_flag(FLAG_OF, ((result & 0x8000) != 0) != cf);
                }
            }
            ShiftOp::Shr => {
                result = if count < 16 { val >> count } else { 0 };
                let last = if count <= 16 {
                    (val >> (count - 1)) & 1
                } else {
                    0
                };
                self.set_flag(FLAG_CF, last != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, (val & 0x8000) != 0);
                }
            }
            ShiftOp::Sar => {
                let signed = val as i16;
                result = if count < 16 {
                    (signed >> count) as u16
                } else if signed < 0 {
                    0xFFFF
                } else {
                    0
                };
                let last = if count <= 16 {
                    ((signed as i32) >> (count - 1)) & 1
                } else {
                    (signed < 0) as i32
                };
                self.set_flag(FLAG_CF, last != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, false);
                }
            }
        }
        self.update_flags_szp16(result);
        result
    }

    /// 32-bit shift with flag updates; count is 1..=31
    fn shift32(&mut self, val: u32, op: ShiftOp, count: u8) -> u32 {
        let result;
        match op {
            ShiftOp::Shl => {
                let wide = (val as u64) << count;
                result = (wide & 0xFFFF_FFFF) as u32;
                self.set_flag(FLAG_CF, (wide & 0x1_0000_0000) != 0);
                if count == 1 {
                    let cf = self.get_flag(FLAG_CF);
                    self.set_flag(FLAG_OF, ((result & 0x8000_0000) != 0) != cf);
                }
            }
            ShiftOp::Shr => {
                result = val >> count;
                self.set_flag(FLAG_CF, ((val >> (count - 1)) & 1) != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, (val & 0x8000_0000) != 0);
                }
            }
            ShiftOp::Sar => {
                let signed = val as i32;
                result = (signed >> count) as u32;
                self.set_flag(FLAG_CF, ((signed >> (count - 1)) & 1) != 0);
                if count == 1 {
                    self.set_flag(FLAG_OF, false);
                }
            }
        }
        self.update_flags_szp32(result);
        result
    }

    // ------------------------------------------------------------------
    // Syscall gate
    // ------------------------------------------------------------------

    /// Handle `int 0x80`: the Linux i386 subset {1: exit, 3: read, 4: write}
    ///
    /// Register convention: EAX = selector, EBX/ECX/EDX = arg1/2/3,
    /// return value in EAX. Unknown fds and host I/O failures report -1
    /// in EAX; an unknown selector is fatal.
    fn exec_syscall(&mut self) -> Result<u32, VmError> {
        match self.eax {
            SYS_EXIT => {
                self.exit_code = (self.ebx & 0xFF) as u8;
                self.halted = true;
                log(LogCategory::Syscall, LogLevel::Debug, || {
                    format!("exit({})", self.ebx & 0xFF)
                });
                Ok(2)
            }
            SYS_READ => {
                let fd = self.ebx;
                let buf = self.ecx;
                let count = self.edx as usize;
                log(LogCategory::Syscall, LogLevel::Debug, || {
                    format!("read(fd={}, buf={:#010x}, count={})", fd, buf, count)
                });
                if fd != 0 {
                    self.eax = -1i32 as u32;
                    return Ok(2);
                }
                // The destination must be addressable before anything is
                // sized off the guest-supplied count
                self.memory
                    .get(buf, count)
                    .map_err(|e| self.mem_fault(e))?;
                let mut scratch = vec![0u8; count];
                match self.stdin.read(&mut scratch) {
                    Ok(n) => {
                        let eip = self.instruction_start_eip;
                        self.memory
                            .set(buf, &scratch[..n])
                            .map_err(|source| VmError::Mem { eip, source })?;
                        self.eax = n as u32;
                    }
                    Err(_) => self.eax = -1i32 as u32,
                }
                Ok(2)
            }
            SYS_WRITE => {
                let fd = self.ebx;
                let buf = self.ecx;
                let count = self.edx as usize;
                log(LogCategory::Syscall, LogLevel::Debug, || {
                    format!("write(fd={}, buf={:#010x}, count={})", fd, buf, count)
                });
                let data = self
                    .memory
                    .get(buf, count)
                    .map_err(|e| self.mem_fault(e))?
                    .to_vec();
                let stream: &mut dyn Write = match fd {
                    1 => &mut self.stdout,
                    2 => &mut self.stderr,
                    _ => {
                        self.eax = -1i32 as u32;
                        return Ok(2);
                    }
                };
                match stream.write_all(&data).and_then(|_| stream.flush()) {
                    Ok(()) => self.eax = count as u32,
                    Err(_) => self.eax = -1i32 as u32,
                }
                Ok(2)
            }
            other => Err(VmError::UnsupportedSyscall {
                eip: self.instruction_start_eip,
                eax: other,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Save state
    // ------------------------------------------------------------------

    /// Snapshot the architectural state (registers, EIP, EFLAGS)
    pub fn state(&self) -> CpuState {
        CpuState {
            eax: self.eax,
            ecx: self.ecx,
            edx: self.edx,
            ebx: self.ebx,
            esp: self.esp,
            ebp: self.ebp,
            esi: self.esi,
            edi: self.edi,
            eip: self.eip,
            eflags: self.eflags,
            halted: self.halted,
            exit_code: self.exit_code,
            cycles: self.cycles,
        }
    }

    /// Restore a previously saved architectural state
    pub fn restore(&mut self, state: &CpuState) {
        self.eax = state.eax;
        self.ecx = state.ecx;
        self.edx = state.edx;
        self.ebx = state.ebx;
        self.esp = state.esp;
        self.ebp = state.ebp;
        self.esi = state.esi;
        self.edi = state.edi;
        self.eip = state.eip;
        self.eflags = state.eflags;
        self.halted = state.halted;
        self.exit_code = state.exit_code;
        self.cycles = state.cycles;
    }
}

/// Count source for the shift group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftCount {
    One,
    Cl,
    Imm8,
}

/// Shift operation selected by the ModR/M /digit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl crate::Machine for CpuIa32 {
    type Error = VmError;

    fn reset(&mut self) {
        CpuIa32::reset(self);
    }

    fn run(&mut self) -> Result<u8, VmError> {
        CpuIa32::run(self)
    }

    fn save_state(&self) -> serde_json::Value {
        serde_json::to_value(self.state()).unwrap_or(serde_json::Value::Null)
    }

    fn load_state(&mut self, v: &serde_json::Value) -> Result<(), serde_json::Error> {
        let state: CpuState = serde_json::from_value(v.clone())?;
        self.restore(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
