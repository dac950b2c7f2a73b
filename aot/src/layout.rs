// layout.rs - Linear memory layout and the module's host ABI
//
// Linear memory, from offset 0:
//
//   0x000  x0..x31          32 x 8 bytes
//   0x100  f0..f31          32 x 8 bytes (single precision NaN-boxed)
//   0x200  pc
//   0x208  fcsr
//   0x210  reservation address (LR/SC)
//   0x218  reservation valid flag
//   0x220  dispatch table   one entry per 2-byte code granule
//   ....   guest RAM        4 KiB aligned, guest address A lives at ram_base + A

use crate::error::EncodeError;

pub const XREG_OFFSET: u32 = 0x000;
pub const FREG_OFFSET: u32 = 0x100;
pub const PC_OFFSET: u32 = 0x200;
pub const FCSR_OFFSET: u32 = 0x208;
pub const RESERVATION_ADDR_OFFSET: u32 = 0x210;
pub const RESERVATION_VALID_OFFSET: u32 = 0x218;
pub const REGISTER_FILE_SIZE: u32 = 0x220;

/// The dispatch table immediately follows the register file
pub const DISPATCH_TABLE_OFFSET: u32 = REGISTER_FILE_SIZE;

pub const RAM_ALIGN: u64 = 0x1000;
pub const WASM_PAGE_SIZE: u64 = 0x10000;

/// Default guest RAM window (16 MiB)
pub const DEFAULT_RAM_SIZE: u64 = 16 << 20;

pub const IMPORT_MODULE: &str = "env";
pub const IMPORT_MEMORY: &str = "memory";
pub const IMPORT_SYSCALL: &str = "syscall";
pub const EXPORT_RUN: &str = "run";
pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_ENTRY: &str = "entry";
pub const EXPORT_RAM_BASE: &str = "ram_base";
pub const EXPORT_RAM_SIZE: &str = "ram_size";

/// Function index of the imported syscall trampoline
pub const SYSCALL_FUNC: u32 = 0;
/// Function index of the dispatch loop
pub const RUN_FUNC: u32 = 1;
/// Function index of the first compiled block
pub const FIRST_BLOCK_FUNC: u32 = 2;

/// Status returned by a compiled block function. The address it refers to
/// (next pc, or the faulting instruction) is left in the pc slot.
pub mod status {
    pub const CONTINUE: i32 = 0;
    pub const SYSCALL: i32 = 1;
    pub const HALT: i32 = 2;
    pub const ILLEGAL_INSTRUCTION: i32 = 3;
    pub const MEMORY_FAULT: i32 = 4;
}

/// Termination code returned by the exported `run` function
pub mod termination {
    /// The syscall trampoline returned a negative resume address
    pub const EXITED: i32 = 0;
    /// `ebreak` reached
    pub const HALTED: i32 = super::status::HALT;
    pub const ILLEGAL_INSTRUCTION: i32 = super::status::ILLEGAL_INSTRUCTION;
    pub const MEMORY_FAULT: i32 = super::status::MEMORY_FAULT;
    /// pc outside the dispatch table, odd, or not the start of a block
    pub const BAD_JUMP: i32 = 5;
}

pub fn xreg(r: u8) -> u64 {
    XREG_OFFSET as u64 + r as u64 * 8
}

pub fn freg(r: u8) -> u64 {
    FREG_OFFSET as u64 + r as u64 * 8
}

pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align).saturating_mul(align)
}

/// Concrete placement of the dispatch table and guest RAM for one module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub table_len: u64,
    pub ram_base: u64,
    pub ram_size: u64,
}

impl MemoryLayout {
    pub fn new(table_len: u64, ram_size: u64) -> Result<Self, EncodeError> {
        let ram_base = align_up((DISPATCH_TABLE_OFFSET as u64).saturating_add(table_len), RAM_ALIGN);
        let total = ram_base.saturating_add(ram_size);
        if total > u32::MAX as u64 + 1 {
            return Err(EncodeError::LayoutOverflow(total));
        }
        Ok(Self {
            table_len,
            ram_base,
            ram_size,
        })
    }

    /// Bytes of linear memory the module needs
    pub fn memory_size(&self) -> u64 {
        self.ram_base + self.ram_size
    }

    /// Minimum memory size in 64 KiB pages
    pub fn memory_pages(&self) -> u64 {
        self.memory_size().div_ceil(WASM_PAGE_SIZE)
    }
}
