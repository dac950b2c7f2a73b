// common/mod.rs - Shared helpers for the integration tests
//
// A tiny RV64 assembler, an ELF64 writer, and a wasmtime harness that runs an
// emitted module with a trampoline implementing write, exit and exit_group.

#![allow(dead_code)]

use std::collections::HashMap;
use wasmtime::{Caller, Config, Engine, ExternType, Linker, Memory, MemoryType, Module, Store};

pub const TEXT_BASE: u64 = 0x1_0000;
pub const DATA_BASE: u64 = 0x2_0000;

/// Guest RAM used by the tests, smaller than the default to keep runs fast
pub const TEST_RAM_SIZE: u64 = 1 << 20;

pub const ZERO: u32 = 0;
pub const RA: u32 = 1;
pub const SP: u32 = 2;
pub const T0: u32 = 5;
pub const T1: u32 = 6;
pub const T2: u32 = 7;
pub const S0: u32 = 8;
pub const S1: u32 = 9;
pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const A2: u32 = 12;
pub const A3: u32 = 13;
pub const A7: u32 = 17;
pub const T3: u32 = 28;
pub const T4: u32 = 29;
pub const T5: u32 = 30;
pub const T6: u32 = 31;

// FP rounding modes
pub const RNE: u32 = 0;
pub const RTZ: u32 = 1;
pub const RDN: u32 = 2;
pub const RUP: u32 = 3;
pub const RMM: u32 = 4;
pub const DYN: u32 = 7;

pub const SYS_WRITE: u64 = 64;
pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;

// ===========================================================================
// Assembler
// ===========================================================================

enum Fixup {
    Branch { funct3: u32, rs1: u32, rs2: u32 },
    Jal { rd: u32 },
}

pub struct Asm {
    base: u64,
    code: Vec<u8>,
    labels: HashMap<&'static str, u64>,
    fixups: Vec<(u64, &'static str, Fixup)>,
}

fn r_type(opcode: u32, funct3: u32, funct7: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i_type(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0x1f) << 7)
        | opcode
}

fn b_type(funct3: u32, rs1: u32, rs2: u32, offset: i64) -> u32 {
    let o = offset as u32;
    (((o >> 12) & 1) << 31)
        | (((o >> 5) & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((o >> 1) & 0xf) << 8)
        | (((o >> 11) & 1) << 7)
        | 0x63
}

fn j_type(rd: u32, offset: i64) -> u32 {
    let o = offset as u32;
    (((o >> 20) & 1) << 31)
        | (((o >> 1) & 0x3ff) << 21)
        | (((o >> 11) & 1) << 20)
        | (((o >> 12) & 0xff) << 12)
        | (rd << 7)
        | 0x6f
}

macro_rules! r_ops {
    ($($name:ident => ($opcode:expr, $funct3:expr, $funct7:expr)),* $(,)?) => {
        $(
            pub fn $name(&mut self, rd: u32, rs1: u32, rs2: u32) -> &mut Self {
                self.word(r_type($opcode, $funct3, $funct7, rd, rs1, rs2))
            }
        )*
    };
}

macro_rules! i_ops {
    ($($name:ident => ($opcode:expr, $funct3:expr)),* $(,)?) => {
        $(
            pub fn $name(&mut self, rd: u32, rs1: u32, imm: i32) -> &mut Self {
                self.word(i_type($opcode, $funct3, rd, rs1, imm))
            }
        )*
    };
}

macro_rules! store_ops {
    ($($name:ident => ($opcode:expr, $funct3:expr)),* $(,)?) => {
        $(
            /// `rs2` is stored to `offset(rs1)`
            pub fn $name(&mut self, rs2: u32, rs1: u32, offset: i32) -> &mut Self {
                self.word(s_type($opcode, $funct3, rs1, rs2, offset))
            }
        )*
    };
}

macro_rules! branch_ops {
    ($($name:ident => $funct3:expr),* $(,)?) => {
        $(
            pub fn $name(&mut self, rs1: u32, rs2: u32, label: &'static str) -> &mut Self {
                self.fixup(label, Fixup::Branch { funct3: $funct3, rs1, rs2 })
            }
        )*
    };
}

impl Asm {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            code: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    pub fn here(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        let addr = self.here();
        assert!(self.labels.insert(name, addr).is_none(), "duplicate label {name}");
        self
    }

    pub fn word(&mut self, word: u32) -> &mut Self {
        self.code.extend_from_slice(&word.to_le_bytes());
        self
    }

    pub fn half(&mut self, half: u16) -> &mut Self {
        self.code.extend_from_slice(&half.to_le_bytes());
        self
    }

    fn fixup(&mut self, label: &'static str, fixup: Fixup) -> &mut Self {
        self.fixups.push((self.here(), label, fixup));
        self.word(0)
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut code = self.code.clone();
        for (at, label, fixup) in &self.fixups {
            let target = *self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("undefined label {label}"));
            let offset = target as i64 - *at as i64;
            let word = match *fixup {
                Fixup::Branch { funct3, rs1, rs2 } => b_type(funct3, rs1, rs2, offset),
                Fixup::Jal { rd } => j_type(rd, offset),
            };
            let pos = (*at - self.base) as usize;
            code[pos..pos + 4].copy_from_slice(&word.to_le_bytes());
        }
        code
    }

    r_ops! {
        add => (0x33, 0, 0x00), sub => (0x33, 0, 0x20), sll => (0x33, 1, 0x00),
        slt => (0x33, 2, 0x00), sltu => (0x33, 3, 0x00), xor => (0x33, 4, 0x00),
        srl => (0x33, 5, 0x00), sra => (0x33, 5, 0x20), or => (0x33, 6, 0x00),
        and => (0x33, 7, 0x00),
        addw => (0x3b, 0, 0x00), subw => (0x3b, 0, 0x20), sllw => (0x3b, 1, 0x00),
        srlw => (0x3b, 5, 0x00), sraw => (0x3b, 5, 0x20),
        mul => (0x33, 0, 0x01), mulh => (0x33, 1, 0x01), mulhsu => (0x33, 2, 0x01),
        mulhu => (0x33, 3, 0x01), div => (0x33, 4, 0x01), divu => (0x33, 5, 0x01),
        rem => (0x33, 6, 0x01), remu => (0x33, 7, 0x01),
        mulw => (0x3b, 0, 0x01), divw => (0x3b, 4, 0x01), divuw => (0x3b, 5, 0x01),
        remw => (0x3b, 6, 0x01), remuw => (0x3b, 7, 0x01),
        fadd_d => (0x53, 7, 0x01), fsub_d => (0x53, 7, 0x05), fmul_d => (0x53, 7, 0x09),
        fdiv_d => (0x53, 7, 0x0d), feq_d => (0x53, 2, 0x51), flt_d => (0x53, 1, 0x51),
        fmin_d => (0x53, 0, 0x15), fmax_d => (0x53, 1, 0x15),
        fsgnjn_d => (0x53, 1, 0x11), fadd_s => (0x53, 7, 0x00),
    }

    i_ops! {
        addi => (0x13, 0), slti => (0x13, 2), sltiu => (0x13, 3), xori => (0x13, 4),
        ori => (0x13, 6), andi => (0x13, 7), addiw => (0x1b, 0),
        lb => (0x03, 0), lh => (0x03, 1), lw => (0x03, 2), ld => (0x03, 3),
        lbu => (0x03, 4), lhu => (0x03, 5), lwu => (0x03, 6),
        jalr => (0x67, 0), fld => (0x07, 3), flw => (0x07, 2),
        csrrw => (0x73, 1), csrrs => (0x73, 2), csrrc => (0x73, 3),
        csrrwi => (0x73, 5),
    }

    store_ops! {
        sb => (0x23, 0), sh => (0x23, 1), sw => (0x23, 2), sd => (0x23, 3),
        fsd => (0x27, 3), fsw => (0x27, 2),
    }

    branch_ops! {
        beq => 0, bne => 1, blt => 4, bge => 5, bltu => 6, bgeu => 7,
    }

    pub fn slli(&mut self, rd: u32, rs1: u32, shamt: u32) -> &mut Self {
        self.word(i_type(0x13, 1, rd, rs1, shamt as i32))
    }

    pub fn srli(&mut self, rd: u32, rs1: u32, shamt: u32) -> &mut Self {
        self.word(i_type(0x13, 5, rd, rs1, shamt as i32))
    }

    pub fn srai(&mut self, rd: u32, rs1: u32, shamt: u32) -> &mut Self {
        self.word(i_type(0x13, 5, rd, rs1, (0x400 | shamt) as i32))
    }

    pub fn sraiw(&mut self, rd: u32, rs1: u32, shamt: u32) -> &mut Self {
        self.word(i_type(0x1b, 5, rd, rs1, (0x400 | shamt) as i32))
    }

    pub fn lui(&mut self, rd: u32, imm20: u32) -> &mut Self {
        self.word((imm20 << 12) | (rd << 7) | 0x37)
    }

    pub fn auipc(&mut self, rd: u32, imm20: u32) -> &mut Self {
        self.word((imm20 << 12) | (rd << 7) | 0x17)
    }

    /// Load a 32-bit signed constant, as `lui` + `addiw`
    pub fn li(&mut self, rd: u32, value: i32) -> &mut Self {
        if (-2048..2048).contains(&value) {
            return self.addi(rd, ZERO, value);
        }
        let lo = (value << 20) >> 20;
        let hi = (value.wrapping_sub(lo) as u32) >> 12;
        self.lui(rd, hi);
        if lo != 0 {
            self.addiw(rd, rd, lo);
        }
        self
    }

    pub fn mv(&mut self, rd: u32, rs: u32) -> &mut Self {
        self.addi(rd, rs, 0)
    }

    pub fn jal(&mut self, rd: u32, label: &'static str) -> &mut Self {
        self.fixup(label, Fixup::Jal { rd })
    }

    pub fn j(&mut self, label: &'static str) -> &mut Self {
        self.jal(ZERO, label)
    }

    pub fn call(&mut self, label: &'static str) -> &mut Self {
        self.jal(RA, label)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.jalr(ZERO, RA, 0)
    }

    pub fn ecall(&mut self) -> &mut Self {
        self.word(0x0000_0073)
    }

    pub fn ebreak(&mut self) -> &mut Self {
        self.word(0x0010_0073)
    }

    pub fn fence(&mut self) -> &mut Self {
        self.word(0x0ff0_000f)
    }

    pub fn lr_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x2f, 3, 0x08, rd, rs1, 0))
    }

    pub fn sc_d(&mut self, rd: u32, rs2: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x2f, 3, 0x0c, rd, rs1, rs2))
    }

    pub fn amoadd_w(&mut self, rd: u32, rs2: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x2f, 2, 0x00, rd, rs1, rs2))
    }

    pub fn amomaxu_d(&mut self, rd: u32, rs2: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x2f, 3, 0x70, rd, rs1, rs2))
    }

    pub fn amoswap_d(&mut self, rd: u32, rs2: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x2f, 3, 0x04, rd, rs1, rs2))
    }

    /// fcvt.d.l rd, rs1
    pub fn fcvt_d_l(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 7, 0x69, rd, rs1, 2))
    }

    /// fcvt.l.d rd, rs1, rtz
    pub fn fcvt_l_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.fcvt_l_d_rm(rd, rs1, RTZ)
    }

    pub fn fcvt_l_d_rm(&mut self, rd: u32, rs1: u32, rm: u32) -> &mut Self {
        self.word(r_type(0x53, rm, 0x61, rd, rs1, 2))
    }

    pub fn fcvt_w_d_rm(&mut self, rd: u32, rs1: u32, rm: u32) -> &mut Self {
        self.word(r_type(0x53, rm, 0x61, rd, rs1, 0))
    }

    pub fn fcvt_wu_s_rm(&mut self, rd: u32, rs1: u32, rm: u32) -> &mut Self {
        self.word(r_type(0x53, rm, 0x60, rd, rs1, 1))
    }

    /// fcvt.s.d rd, rs1
    pub fn fcvt_s_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 7, 0x20, rd, rs1, 1))
    }

    pub fn fsqrt_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 7, 0x2d, rd, rs1, 0))
    }

    pub fn fmv_x_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 0, 0x71, rd, rs1, 0))
    }

    pub fn fmv_d_x(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 0, 0x79, rd, rs1, 0))
    }

    pub fn fclass_d(&mut self, rd: u32, rs1: u32) -> &mut Self {
        self.word(r_type(0x53, 1, 0x71, rd, rs1, 0))
    }

    /// fmadd.d rd, rs1, rs2, rs3
    pub fn fmadd_d(&mut self, rd: u32, rs1: u32, rs2: u32, rs3: u32) -> &mut Self {
        self.word((rs3 << 27) | (1 << 25) | (rs2 << 20) | (rs1 << 15) | (7 << 12) | (rd << 7) | 0x43)
    }

    // RV64C

    /// c.li rd, imm
    pub fn c_li(&mut self, rd: u32, imm: i32) -> &mut Self {
        let imm = imm as u32 & 0x3f;
        self.half((0b010 << 13 | ((imm >> 5) << 12) | (rd << 7) | ((imm & 0x1f) << 2) | 0b01) as u16)
    }

    /// c.addi rd, imm
    pub fn c_addi(&mut self, rd: u32, imm: i32) -> &mut Self {
        let imm = imm as u32 & 0x3f;
        self.half((((imm >> 5) << 12) | (rd << 7) | ((imm & 0x1f) << 2) | 0b01) as u16)
    }

    /// c.mv rd, rs2
    pub fn c_mv(&mut self, rd: u32, rs2: u32) -> &mut Self {
        self.half((0b100 << 13 | (rd << 7) | (rs2 << 2) | 0b10) as u16)
    }

    /// c.add rd, rs2
    pub fn c_add(&mut self, rd: u32, rs2: u32) -> &mut Self {
        self.half((0b100 << 13 | (1 << 12) | (rd << 7) | (rs2 << 2) | 0b10) as u16)
    }

    /// c.jr rs1
    pub fn c_jr(&mut self, rs1: u32) -> &mut Self {
        self.half((0b100 << 13 | (rs1 << 7) | 0b10) as u16)
    }

    pub fn c_ebreak(&mut self) -> &mut Self {
        self.half(0x9002)
    }

    /// `exit(code)` through the syscall trampoline
    pub fn exit(&mut self, code: i32) -> &mut Self {
        self.li(A0, code).li(A7, SYS_EXIT as i32).ecall()
    }
}

// ===========================================================================
// ELF64 writer
// ===========================================================================

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub struct SegmentSpec {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
    pub flags: u32,
}

impl SegmentSpec {
    pub fn text(vaddr: u64, data: Vec<u8>) -> Self {
        let memsz = data.len() as u64;
        Self {
            vaddr,
            data,
            memsz,
            flags: PF_R | PF_X,
        }
    }

    pub fn data(vaddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        Self {
            vaddr,
            data,
            memsz,
            flags: PF_R | PF_W,
        }
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Little-endian RISC-V ELF64 executable with one PT_LOAD per segment and an
/// optional PT_INTERP
pub fn elf64(entry: u64, segments: &[SegmentSpec], interpreter: Option<&str>) -> Vec<u8> {
    const EHDR_SIZE: u64 = 64;
    const PHDR_SIZE: u64 = 56;

    let phnum = segments.len() + interpreter.is_some() as usize;
    let interp_bytes = interpreter.map(|path| {
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        bytes
    });
    let interp_offset = EHDR_SIZE + PHDR_SIZE * phnum as u64;

    // Segment payloads start page aligned, after the headers
    let mut offsets = Vec::new();
    let mut cursor = 0x1000u64;
    for seg in segments {
        offsets.push(cursor);
        cursor += (seg.data.len() as u64).div_ceil(0x1000).max(1) * 0x1000;
    }

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    put_u16(&mut out, 2); // ET_EXEC
    put_u16(&mut out, 243); // EM_RISCV
    put_u32(&mut out, 1);
    put_u64(&mut out, entry);
    put_u64(&mut out, EHDR_SIZE);
    put_u64(&mut out, 0);
    put_u32(&mut out, 0x5); // RVC, double-float ABI
    put_u16(&mut out, EHDR_SIZE as u16);
    put_u16(&mut out, PHDR_SIZE as u16);
    put_u16(&mut out, phnum as u16);
    put_u16(&mut out, 64);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);

    if let Some(bytes) = &interp_bytes {
        put_u32(&mut out, 3); // PT_INTERP
        put_u32(&mut out, PF_R);
        put_u64(&mut out, interp_offset);
        put_u64(&mut out, 0);
        put_u64(&mut out, 0);
        put_u64(&mut out, bytes.len() as u64);
        put_u64(&mut out, bytes.len() as u64);
        put_u64(&mut out, 1);
    }
    for (seg, &offset) in segments.iter().zip(&offsets) {
        put_u32(&mut out, 1); // PT_LOAD
        put_u32(&mut out, seg.flags);
        put_u64(&mut out, offset);
        put_u64(&mut out, seg.vaddr);
        put_u64(&mut out, seg.vaddr);
        put_u64(&mut out, seg.data.len() as u64);
        put_u64(&mut out, seg.memsz);
        put_u64(&mut out, 0x1000);
    }
    if let Some(bytes) = &interp_bytes {
        out.extend_from_slice(bytes);
    }

    for (seg, &offset) in segments.iter().zip(&offsets) {
        out.resize(offset as usize, 0);
        out.extend_from_slice(&seg.data);
    }
    out
}

/// Static executable: `asm` as text at TEXT_BASE, `data` plus a page of zeroed
/// space at DATA_BASE
pub fn program(asm: &Asm, data: &[u8]) -> Vec<u8> {
    let segments = [
        SegmentSpec::text(TEXT_BASE, asm.finish()),
        SegmentSpec::data(DATA_BASE, data.to_vec(), data.len() as u64 + 0x1000),
    ];
    elf64(TEXT_BASE, &segments, None)
}

pub fn test_options() -> rv2wasm::CompileOptions {
    rv2wasm::CompileOptions {
        ram_size: TEST_RAM_SIZE,
        ..Default::default()
    }
}

pub fn compile(elf: &[u8]) -> Vec<u8> {
    rv2wasm::compile(elf, &test_options()).expect("compilation failed")
}

// ===========================================================================
// wasmtime harness
// ===========================================================================

const FUEL: u64 = 50_000_000;

#[derive(Default)]
struct Host {
    memory: Option<Memory>,
    ram_base: u64,
    stdout: Vec<u8>,
    exit_code: Option<i64>,
    syscalls: Vec<(u64, u64)>,
}

/// Final state after `run` returns
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub code: i32,
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    /// (pc, syscall number) in call order
    pub syscalls: Vec<(u64, u64)>,
    pub regs: [u64; 32],
    pub fregs: [u64; 32],
    pub pc: u64,
    pub fcsr: u64,
    pub ram_base: u64,
    pub memory: Vec<u8>,
}

impl Outcome {
    pub fn x(&self, r: u32) -> u64 {
        self.regs[r as usize]
    }

    pub fn f64(&self, r: u32) -> f64 {
        f64::from_bits(self.fregs[r as usize])
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let at = (self.ram_base + addr) as usize;
        u64::from_le_bytes(self.memory[at..at + 8].try_into().unwrap())
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn syscall(mut caller: Caller<'_, Host>, pc: i64) -> i64 {
    let memory = caller.data().memory.expect("memory is set before run");
    let ram_base = caller.data().ram_base as usize;
    let (num, a0, a1, a2) = {
        let data = memory.data(&caller);
        (
            read_u64(data, 17 * 8),
            read_u64(data, 10 * 8),
            read_u64(data, 11 * 8),
            read_u64(data, 12 * 8),
        )
    };
    caller.data_mut().syscalls.push((pc as u64, num));

    let ret = match num {
        SYS_WRITE => {
            let start = ram_base + a1 as usize;
            let bytes = memory.data(&caller)[start..start + a2 as usize].to_vec();
            caller.data_mut().stdout.extend_from_slice(&bytes);
            a2 as i64
        }
        SYS_EXIT | SYS_EXIT_GROUP => {
            caller.data_mut().exit_code = Some(a0 as i64);
            return -1;
        }
        _ => -38,
    };
    memory.data_mut(&mut caller)[10 * 8..11 * 8].copy_from_slice(&ret.to_le_bytes());
    pc + 4
}

/// Run a module that imports its memory, starting at the exported entry
pub fn run_wasm(wasm: &[u8]) -> Outcome {
    run_wasm_at(wasm, None)
}

pub fn run_wasm_at(wasm: &[u8], start: Option<u64>) -> Outcome {
    let mut config = Config::new();
    config.consume_fuel(true);
    let engine = Engine::new(&config).unwrap();
    let module = Module::new(&engine, wasm).expect("emitted module must compile");

    let pages = module
        .imports()
        .find_map(|import| match import.ty() {
            ExternType::Memory(memory) => Some(memory.minimum()),
            _ => None,
        })
        .expect("module imports env.memory");

    let mut store = Store::new(&engine, Host::default());
    store.set_fuel(FUEL).unwrap();
    let memory = Memory::new(&mut store, MemoryType::new(pages as u32, None)).unwrap();
    store.data_mut().memory = Some(memory);

    let mut linker = Linker::new(&engine);
    linker.define(&store, "env", "memory", memory).unwrap();
    linker.func_wrap("env", "syscall", syscall).unwrap();
    let instance = linker.instantiate(&mut store, &module).unwrap();

    let entry = instance
        .get_global(&mut store, "entry")
        .unwrap()
        .get(&mut store)
        .unwrap_i64() as u64;
    let ram_base = instance
        .get_global(&mut store, "ram_base")
        .unwrap()
        .get(&mut store)
        .unwrap_i32() as u32 as u64;
    let ram_size = instance
        .get_global(&mut store, "ram_size")
        .unwrap()
        .get(&mut store)
        .unwrap_i64() as u64;
    store.data_mut().ram_base = ram_base;

    // sp at the top of guest RAM
    memory.data_mut(&mut store)[16..24].copy_from_slice(&(ram_size - 16).to_le_bytes());

    let run = instance
        .get_typed_func::<i64, i32>(&mut store, "run")
        .unwrap();
    let code = run
        .call(&mut store, start.unwrap_or(entry) as i64)
        .expect("run trapped");

    let data = memory.data(&store).to_vec();
    let mut regs = [0u64; 32];
    let mut fregs = [0u64; 32];
    for r in 0..32 {
        regs[r] = read_u64(&data, r * 8);
        fregs[r] = read_u64(&data, 0x100 + r * 8);
    }
    let host = store.data();
    Outcome {
        code,
        exit_code: host.exit_code,
        stdout: host.stdout.clone(),
        syscalls: host.syscalls.clone(),
        regs,
        fregs,
        pc: read_u64(&data, 0x200),
        fcsr: read_u64(&data, 0x208),
        ram_base,
        memory: data,
    }
}

/// Assemble, link, compile and run
pub fn run_asm(asm: &Asm) -> Outcome {
    run_wasm(&compile(&program(asm, &[])))
}
