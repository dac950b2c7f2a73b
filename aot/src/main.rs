// rv2wasm - RISC-V to WebAssembly AOT Compiler
//
// Compiles statically linked RISC-V ELF binaries to a self-contained
// WebAssembly module.
//
// Usage:
//   rv2wasm input.elf -o output.wasm
//   rv2wasm input.elf --export-memory --ram-size 64M --verbose

use anyhow::{Context, Result};
use clap::Parser;
use rv2wasm::{CompileError, CompileOptions, MemoryMode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rv2wasm")]
#[command(about = "RISC-V to WebAssembly AOT compiler")]
#[command(version)]
struct Args {
    /// Input RISC-V ELF binary
    input: PathBuf,

    /// Output Wasm file
    #[arg(short, long, default_value = "output.wasm")]
    output: PathBuf,

    /// Emit a name section and export every block function
    #[arg(long)]
    debug: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Guest RAM size in bytes (accepts 0x, K and M suffixes)
    #[arg(long, value_parser = parse_size, default_value = "16M")]
    ram_size: u64,

    /// Define and export the linear memory instead of importing env.memory
    #[arg(long)]
    export_memory: bool,

    /// Fail on reachable unsupported instructions instead of trapping at runtime
    #[arg(long)]
    deny_illegal: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rv2wasm: {}", diagnostic(&err));
            ExitCode::FAILURE
        }
    }
}

/// One-line reason for a fatal error. A `CompileError` already names its
/// stage and cause, so its source chain is not repeated.
fn diagnostic(err: &anyhow::Error) -> String {
    match err.downcast_ref::<CompileError>() {
        Some(err) => err.to_string(),
        None => format!("{err:#}"),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("RV2WASM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: &Args) -> Result<()> {
    let elf_data = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let image = rv2wasm::elf::load(&elf_data).map_err(CompileError::from)?;
    info!(
        entry = format_args!("0x{:x}", image.entry),
        segments = image.segments.len(),
        pie = image.is_pie,
        interpreter = image.interpreter.as_deref().unwrap_or("none"),
        swept = rv2wasm::disasm::disassemble(&image).len(),
        "input {}",
        args.input.display()
    );

    let options = CompileOptions {
        debug: args.debug,
        ram_size: args.ram_size,
        memory: if args.export_memory {
            MemoryMode::Export
        } else {
            MemoryMode::Import
        },
        deny_illegal: args.deny_illegal,
    };
    let wasm_bytes = rv2wasm::compile_image(&image, &options)?;

    write_output(&args.output, &wasm_bytes)?;
    info!(bytes = wasm_bytes.len(), "wrote {}", args.output.display());
    Ok(())
}

/// Write the module, leaving nothing behind if the write fails
fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Err(err) = std::fs::write(path, bytes) {
        let _ = std::fs::remove_file(path);
        return Err(err).with_context(|| format!("failed to write {}", path.display()));
    }
    Ok(())
}

fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let (digits, scale) = match text.chars().last() {
        Some('K' | 'k') => (&text[..text.len() - 1], 1u64 << 10),
        Some('M' | 'm') => (&text[..text.len() - 1], 1u64 << 20),
        _ => (text, 1),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|err| format!("invalid size '{text}': {err}"))?;

    value
        .checked_mul(scale)
        .filter(|&size| size > 0)
        .ok_or_else(|| format!("invalid size '{text}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x1000000"), Ok(16 << 20));
        assert_eq!(parse_size("64K"), Ok(64 << 10));
        assert_eq!(parse_size("16M"), Ok(16 << 20));
        assert_eq!(parse_size("0x10M"), Ok(16 << 20));
        assert!(parse_size("0").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_diagnostic_names_reason_once() {
        let err = anyhow::Error::from(CompileError::from(rv2wasm::DecodeError::Unsupported(0x10004)));
        assert_eq!(diagnostic(&err), "decode: unsupported instruction at 0x10004");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = anyhow::Error::from(io).context("failed to read prog.elf");
        assert_eq!(diagnostic(&err), "failed to read prog.elf: not found");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["rv2wasm", "prog.elf"]).unwrap();
        assert_eq!(args.output, PathBuf::from("output.wasm"));
        assert_eq!(args.ram_size, 16 << 20);
        assert!(!args.debug && !args.export_memory && !args.deny_illegal);
    }
}
