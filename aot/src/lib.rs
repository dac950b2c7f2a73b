// rv2wasm - RISC-V to WebAssembly AOT Compiler
//
// This library compiles statically linked RISC-V RV64GC binaries ahead of
// time into a single self-contained WebAssembly module.
//
// # Architecture
//
// The compiler works in several phases, each consuming the previous one's
// output:
//
// 1. **ELF Loading** (`elf.rs`): validate the image, collect loadable segments
// 2. **Decoding** (`disasm.rs`): decode RV64GC instructions on demand
// 3. **CFG Construction** (`cfg.rs`): work-list discovery and splitting of basic blocks
// 4. **Dispatch Table** (`dispatch.rs`): map every code granule to a block id
// 5. **Translation** (`translate.rs`): lower each block to a Wasm function
// 6. **Wasm Generation** (`wasm_builder.rs`): assemble, emit and validate the module
//
// # Memory Model
//
// See `layout.rs`. The register file sits at offset 0, the dispatch table
// right after it, and guest RAM at the next 4 KiB boundary.
//
// # Syscall Handling
//
// When the guest executes ECALL, the block stores its pc and returns the
// syscall status. The dispatch loop passes that pc to the imported
// `env.syscall` and resumes at the address it returns; a negative address
// ends `run` with the EXITED code.

pub mod cfg;
pub mod disasm;
pub mod dispatch;
pub mod elf;
pub mod error;
pub mod layout;
pub mod translate;
pub mod wasm_builder;

#[cfg(test)]
mod testutil;

pub use cfg::{BasicBlock, ControlFlowGraph, Function, Terminator};
pub use disasm::{Decoder, Instruction, Op, OpClass};
pub use dispatch::DispatchTable;
pub use elf::{LoadedImage, Segment};
pub use error::{CfgError, CompileError, DecodeError, EncodeError, LoadError, Stage, TranslateError};
pub use layout::MemoryLayout;
pub use translate::BlockFunction;
pub use wasm_builder::MemoryMode;

use tracing::debug;

/// Options controlling a single compilation
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Emit a name section and export every block function
    pub debug: bool,
    /// Guest RAM window in bytes, rounded up to whole Wasm pages
    pub ram_size: u64,
    pub memory: MemoryMode,
    /// Reject images with reachable unsupported instructions instead of
    /// trapping at runtime
    pub deny_illegal: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            debug: false,
            ram_size: layout::DEFAULT_RAM_SIZE,
            memory: MemoryMode::Import,
            deny_illegal: false,
        }
    }
}

/// Compile a RISC-V ELF binary to WebAssembly
pub fn compile(elf_data: &[u8], options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
    let image = elf::load(elf_data)?;
    compile_image(&image, options)
}

/// Compile an already loaded image
pub fn compile_image(image: &LoadedImage, options: &CompileOptions) -> Result<Vec<u8>, CompileError> {
    image.ensure_static()?;
    let ram_size = layout::align_up(options.ram_size.max(1), layout::WASM_PAGE_SIZE);
    image.ensure_fits(ram_size)?;

    let decoder = Decoder::new(image);
    let cfg = cfg::build(&decoder, image.entry)?;
    debug!(
        blocks = cfg.blocks.len(),
        instructions = cfg.instruction_count(),
        splits = cfg.splits,
        functions = cfg.functions().len(),
        "built control flow graph"
    );

    if options.deny_illegal {
        if let Some(addr) = first_illegal(&cfg) {
            return Err(DecodeError::Unsupported(addr).into());
        }
    }

    // Size the layout first so sparse code cannot force a huge table allocation
    let code_range = image.code_range();
    let layout = MemoryLayout::new(DispatchTable::encoded_len(cfg.blocks.len(), code_range), ram_size)?;
    let table = DispatchTable::build(&cfg, code_range);
    let functions = translate::translate(&cfg, &layout)?;

    let build_options = wasm_builder::BuildOptions {
        debug: options.debug,
        memory: options.memory,
    };
    let bytes = wasm_builder::build(image, &table, &layout, &functions, &build_options)?;
    Ok(bytes)
}

/// Lowest reachable address that decoded to an unsupported instruction
fn first_illegal(cfg: &ControlFlowGraph) -> Option<u64> {
    cfg.blocks
        .values()
        .flat_map(|block| block.instructions.iter())
        .find(|inst| inst.op == Op::Illegal)
        .map(|inst| inst.addr)
}
