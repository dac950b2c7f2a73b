// error.rs - Per-stage error types
//
// Every fatal failure is attributed to the pipeline stage that produced it so
// the CLI can print a single diagnostic line naming the stage and, when known,
// the offending guest address.

use std::fmt;
use thiserror::Error;

/// Pipeline stage a fatal error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Decode,
    Cfg,
    Translate,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Decode => "decode",
            Stage::Cfg => "CFG",
            Stage::Translate => "translate",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// Input image problems, detected before any translation starts
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("invalid ELF: {0}")]
    Malformed(String),

    #[error("only 64-bit RISC-V (RV64) images are supported")]
    Not64Bit,

    #[error("big-endian ELF images are not supported")]
    BigEndian,

    #[error("not a RISC-V binary (e_machine=0x{0:x})")]
    WrongArchitecture(u16),

    #[error("unsupported ELF type {0} (expected ET_EXEC or ET_DYN)")]
    UnsupportedType(u16),

    #[error("dynamically linked executable (interpreter {interpreter}) is not supported")]
    DynamicLinking { interpreter: String },

    #[error("no executable code")]
    NoCode,

    #[error("segment at 0x{vaddr:x} extends past the end of the file")]
    TruncatedSegment { vaddr: u64 },

    #[error("segment at 0x{vaddr:x} wraps past the end of the address space")]
    AddressOverflow { vaddr: u64 },

    #[error("entry point 0x{0:x} is outside executable code")]
    EntryOutsideCode(u64),

    #[error("segment at 0x{vaddr:x} ends at 0x{end:x}, beyond guest RAM size 0x{ram_size:x}")]
    SegmentOutsideRam { vaddr: u64, end: u64, ram_size: u64 },
}

impl From<goblin::error::Error> for LoadError {
    fn from(err: goblin::error::Error) -> Self {
        LoadError::Malformed(err.to_string())
    }
}

/// Failure to fetch an instruction at all. Unknown bit patterns are not
/// errors; they decode to `Op::Illegal`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("misaligned instruction address 0x{0:x}")]
    Misaligned(u64),

    #[error("address 0x{0:x} is outside executable code")]
    OutsideCode(u64),

    #[error("truncated instruction at 0x{0:x}")]
    Truncated(u64),

    #[error("unsupported instruction at 0x{0:x}")]
    Unsupported(u64),
}

impl DecodeError {
    pub fn address(&self) -> u64 {
        match *self {
            DecodeError::Misaligned(addr)
            | DecodeError::OutsideCode(addr)
            | DecodeError::Truncated(addr)
            | DecodeError::Unsupported(addr) => addr,
        }
    }
}

#[derive(Error, Debug)]
pub enum CfgError {
    /// The entry point itself could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{count} basic blocks exceed the limit of {limit}")]
    TooManyBlocks { count: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("basic block at 0x{0:x} has no instructions")]
    EmptyBlock(u64),
}

/// Module assembly failures. `Invalid` always indicates a compiler defect.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("module layout needs 0x{0:x} bytes, beyond the 32-bit address space")]
    LayoutOverflow(u64),

    #[error("emitted module failed validation (compiler defect): {0}")]
    Invalid(String),
}

/// Any fatal compilation error, tagged with its stage
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("load: {0}")]
    Load(#[from] LoadError),

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("CFG: {0}")]
    Cfg(CfgError),

    #[error("translate: {0}")]
    Translate(#[from] TranslateError),

    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
}

impl From<CfgError> for CompileError {
    fn from(err: CfgError) -> Self {
        match err {
            CfgError::Decode(err) => CompileError::Decode(err),
            other => CompileError::Cfg(other),
        }
    }
}

impl CompileError {
    pub fn stage(&self) -> Stage {
        match self {
            CompileError::Load(_) => Stage::Load,
            CompileError::Decode(_) => Stage::Decode,
            CompileError::Cfg(_) => Stage::Cfg,
            CompileError::Translate(_) => Stage::Translate,
            CompileError::Encode(_) => Stage::Encode,
        }
    }

    /// Guest address the error refers to, if any
    pub fn address(&self) -> Option<u64> {
        match self {
            CompileError::Load(LoadError::TruncatedSegment { vaddr })
            | CompileError::Load(LoadError::AddressOverflow { vaddr })
            | CompileError::Load(LoadError::SegmentOutsideRam { vaddr, .. }) => Some(*vaddr),
            CompileError::Load(LoadError::EntryOutsideCode(addr)) => Some(*addr),
            CompileError::Load(_) => None,
            CompileError::Decode(err) => Some(err.address()),
            CompileError::Cfg(CfgError::Decode(err)) => Some(err.address()),
            CompileError::Cfg(_) => None,
            CompileError::Translate(TranslateError::EmptyBlock(addr)) => Some(*addr),
            CompileError::Encode(_) => None,
        }
    }
}
