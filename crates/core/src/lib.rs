//! Core emulator primitives and traits.

pub mod cpu_ia32;
pub mod logging;
pub mod memory;

use serde_json::Value;

/// A CPU-like component that can be stepped; returns cycles consumed.
pub trait Cpu {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Execute one instruction
    fn step(&mut self) -> Result<u32, Self::Error>;
}

impl Cpu for cpu_ia32::CpuIa32 {
    type Error = cpu_ia32::VmError;

    fn reset(&mut self) {
        cpu_ia32::CpuIa32::reset(self);
    }

    fn step(&mut self) -> Result<u32, Self::Error> {
        cpu_ia32::CpuIa32::step(self)
    }
}

/// A high-level machine that runs a guest to completion.
pub trait Machine {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Run until halt and return the guest exit code.
    fn run(&mut self) -> Result<u8, Self::Error>;

    /// Return a JSON-serializable save state for debugging.
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;
}
