//! Centralized logging configuration for the emulator core.
//!
//! # Architecture
//!
//! - **LogConfig**: thread-safe global configuration using atomic operations
//! - **LogLevel**: hierarchical log levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: emulator subsystems (Cpu, Mem, Stack, Syscall, Stubs)
//! - **log()**: common output function with lazy message construction
//!
//! Messages are only formatted when the category/level combination is
//! enabled, so a disabled logger costs one atomic load per call site.
//! All output goes to stderr; guest program output on fd 1 stays clean.
//!
//! # Usage
//!
//! ```rust
//! use vm32_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Cpu, LogLevel::Trace, || {
//!     format!("eip={:08X} opcode={:02X}", 0x1000, 0x90)
//! });
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category for the emulator subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction execution (per-instruction tracing)
    Cpu,
    /// Guest memory access
    Mem,
    /// Stack pushes and pops
    Stack,
    /// `int 0x80` gate activity
    Syscall,
    /// Unimplemented features/stubs
    Stubs,
}

impl LogCategory {
    fn tag(self) -> &'static str {
        match self {
            LogCategory::Cpu => "CPU",
            LogCategory::Mem => "MEM",
            LogCategory::Stack => "STACK",
            LogCategory::Syscall => "SYSCALL",
            LogCategory::Stubs => "STUBS",
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    /// Global log level (applies to all categories unless overridden)
    global_level: AtomicU8,
    /// Category-specific levels; Off means "defer to global"
    cpu_level: AtomicU8,
    mem_level: AtomicU8,
    stack_level: AtomicU8,
    syscall_level: AtomicU8,
    stub_level: AtomicU8,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            cpu_level: AtomicU8::new(LogLevel::Off as u8),
            mem_level: AtomicU8::new(LogLevel::Off as u8),
            stack_level: AtomicU8::new(LogLevel::Off as u8),
            syscall_level: AtomicU8::new(LogLevel::Off as u8),
            stub_level: AtomicU8::new(LogLevel::Off as u8),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    /// Set the global log level (applies to all categories unless overridden)
    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level.to_u8(), Ordering::Relaxed);
    }

    /// Get the global log level
    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    fn slot(&self, category: LogCategory) -> &AtomicU8 {
        match category {
            LogCategory::Cpu => &self.cpu_level,
            LogCategory::Mem => &self.mem_level,
            LogCategory::Stack => &self.stack_level,
            LogCategory::Syscall => &self.syscall_level,
            LogCategory::Stubs => &self.stub_level,
        }
    }

    /// Set log level for a specific category
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.slot(category).store(level.to_u8(), Ordering::Relaxed);
    }

    /// Get log level for a specific category
    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.slot(category).load(Ordering::Relaxed))
    }

    /// Check if a message should be logged for the given category and level
    ///
    /// A category-specific level, when set, takes precedence over the
    /// global level; otherwise the global level decides.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for cat in [
            LogCategory::Cpu,
            LogCategory::Mem,
            LogCategory::Stack,
            LogCategory::Syscall,
            LogCategory::Stubs,
        ] {
            self.set_level(cat, LogLevel::Off);
        }
    }
}

/// Log a message for the given category and level
///
/// The closure is only invoked when the message would actually be
/// emitted, so call sites in hot paths stay cheap when logging is off.
pub fn log<F>(category: LogCategory, level: LogLevel, msg: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }
    eprintln!("[{}] {}", category.tag(), msg());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn category_level_overrides_global() {
        let config = LogConfig::global();
        config.reset();

        config.set_global_level(LogLevel::Error);
        assert!(config.should_log(LogCategory::Cpu, LogLevel::Error));
        assert!(!config.should_log(LogCategory::Cpu, LogLevel::Debug));

        config.set_level(LogCategory::Cpu, LogLevel::Trace);
        assert!(config.should_log(LogCategory::Cpu, LogLevel::Debug));
        // Other categories still follow the global level
        assert!(!config.should_log(LogCategory::Syscall, LogLevel::Debug));

        config.reset();
    }
}
