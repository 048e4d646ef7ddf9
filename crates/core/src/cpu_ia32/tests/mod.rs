//! Tests for the IA-32 CPU implementation
//!
//! Tests are organized by operation size and type:
//! - `tests_8bit`: 8-bit ALU operations and register aliasing
//! - `tests_16bit`: 16-bit operations via the 0x66 prefix
//! - `tests_32bit`: 32-bit ALU operations and data movement
//! - `tests_addressing`: ModR/M, SIB and displacement decoding
//! - `tests_flags`: flag computation and flag instructions
//! - `tests_shifts`: SHL/SHR/SAR behavior
//! - `tests_jumps`: jumps, calls, returns and condition codes
//! - `tests_stack`: push/pop/leave and stack faults
//! - `tests_strings`: MOVS variants and the direction flag
//! - `tests_syscalls`: the `int 0x80` gate
//! - `tests_blackbox`: whole programs run through `execute_bytes`

use super::CpuIa32;
use std::cell::RefCell;
use std::io::{Cursor, Write};
use std::rc::Rc;

mod tests_8bit;
mod tests_16bit;
mod tests_jumps;
mod tests_shifts;
mod tests_syscalls;

/// A CPU with 64 KiB of memory and inert streams, ready for single-step tests
fn test_cpu() -> CpuIa32 {
    CpuIa32::with_streams(
        0x10000,
        Box::new(Cursor::new(Vec::new())),
        Box::new(std::io::sink()),
        Box::new(std::io::sink()),
    )
}

/// Load a program at `addr` and point EIP at it
fn load(cpu: &mut CpuIa32, addr: u32, program: &[u8]) {
    cpu.memory.set(addr, program).expect("program fits in memory");
    cpu.eip = addr;
}

/// Clone-able writer backed by a shared buffer, for capturing guest output
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        Self::default()
    }

    fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A CPU wired to a stdin script and capturing stdout/stderr
fn io_cpu(mem_size: usize, stdin: &[u8]) -> (CpuIa32, SharedBuf, SharedBuf) {
    let out = SharedBuf::new();
    let err = SharedBuf::new();
    let cpu = CpuIa32::with_streams(
        mem_size,
        Box::new(Cursor::new(stdin.to_vec())),
        Box::new(out.clone()),
        Box::new(err.clone()),
    );
    (cpu, out, err)
}
