use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use vm32_core::cpu_ia32::CpuIa32;
use vm32_core::logging::{LogCategory, LogConfig, LogLevel};
use vm32_core::Machine;

#[derive(Parser)]
#[command(name = "vm32", about = "Run a raw IA-32 flat binary to completion")]
struct Args {
    /// Path to a raw flat binary (e.g. produced with `nasm -f bin`)
    binary: PathBuf,

    /// Guest memory size in bytes
    #[arg(long, default_value_t = 1 << 20)]
    mem_size: usize,

    /// Load offset (EIP starts here)
    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// Trace every instruction to stderr
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Global log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "off")]
    log_level: String,

    /// Dump the final machine state to this file as JSON
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level: {}", args.log_level))?;
    LogConfig::global().set_global_level(level);

    let mut cpu = CpuIa32::new(args.mem_size);
    if args.debug {
        cpu.set_debug(true);
        LogConfig::global().set_level(LogCategory::Cpu, LogLevel::Trace);
    }

    let result = cpu.execute_file(&args.binary, args.offset);

    if let Some(path) = args.save.as_ref() {
        let state = cpu.save_state();
        let mut f = File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    let code = result.with_context(|| format!("running {}", args.binary.display()))?;
    std::process::exit(i32::from(code));
}
