// disasm.rs - RISC-V decoder
//
// Decodes RV64GC instructions on demand. Compressed encodings are expanded to
// the base-ISA operation they stand for, so later stages only ever see one
// form of each operation.

use crate::elf::LoadedImage;
use crate::error::DecodeError;

/// A decoded RISC-V instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Virtual address
    pub addr: u64,
    /// Raw encoding (low 16 bits only for compressed instructions)
    pub raw: u32,
    /// Encoding length in bytes (2 or 4)
    pub len: u8,
    pub op: Op,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub rs3: u8,
    /// Sign-extended immediate. Holds the CSR number for Zicsr operations
    /// and the shift amount for immediate shifts.
    pub imm: i64,
}

impl Instruction {
    fn new(addr: u64, raw: u32, len: u8, op: Op) -> Self {
        Self {
            addr,
            raw,
            len,
            op,
            rd: 0,
            rs1: 0,
            rs2: 0,
            rs3: 0,
            imm: 0,
        }
    }

    fn regs(mut self, rd: u8, rs1: u8, rs2: u8) -> Self {
        self.rd = rd;
        self.rs1 = rs1;
        self.rs2 = rs2;
        self
    }

    fn imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    /// Address of the next instruction in program order
    pub fn next_addr(&self) -> u64 {
        self.addr.wrapping_add(self.len as u64)
    }

    /// Target of a pc-relative branch or jump
    pub fn target(&self) -> u64 {
        self.addr.wrapping_add(self.imm as u64)
    }
}

/// Floating-point format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fmt {
    S,
    D,
}

/// Integer operand of an FP conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntFmt {
    W,
    Wu,
    L,
    Lu,
}

/// Static rounding mode of an FP instruction (`rm`, bits 14:12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    /// Round to nearest, ties to even
    Rne,
    /// Towards zero
    Rtz,
    /// Down, towards -inf
    Rdn,
    /// Up, towards +inf
    Rup,
    /// Round to nearest, ties away from zero
    Rmm,
    /// Use `frm` from fcsr
    Dyn,
}

impl RoundingMode {
    /// Decode an `rm` field. 5 and 6 are reserved.
    pub fn from_bits(rm: u32) -> Option<Self> {
        match rm {
            0 => Some(RoundingMode::Rne),
            1 => Some(RoundingMode::Rtz),
            2 => Some(RoundingMode::Rdn),
            3 => Some(RoundingMode::Rup),
            4 => Some(RoundingMode::Rmm),
            7 => Some(RoundingMode::Dyn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

/// RV64GC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // RV64I
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
    Sb,
    Sh,
    Sw,
    Sd,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Addiw,
    Slliw,
    Srliw,
    Sraiw,
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    Fence,
    FenceI,
    Ecall,
    Ebreak,

    // M
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,

    // A
    LrW,
    ScW,
    LrD,
    ScD,
    AmoW(AmoOp),
    AmoD(AmoOp),

    // F / D
    Flw,
    Fld,
    Fsw,
    Fsd,
    FMadd(Fmt),
    FMsub(Fmt),
    FNmsub(Fmt),
    FNmadd(Fmt),
    FAdd(Fmt),
    FSub(Fmt),
    FMul(Fmt),
    FDiv(Fmt),
    FSqrt(Fmt),
    FSgnj(Fmt),
    FSgnjn(Fmt),
    FSgnjx(Fmt),
    FMin(Fmt),
    FMax(Fmt),
    FEq(Fmt),
    FLt(Fmt),
    FLe(Fmt),
    FClass(Fmt),
    FCvtToInt {
        from: Fmt,
        to: IntFmt,
        rm: RoundingMode,
    },
    FCvtFromInt { from: IntFmt, to: Fmt },
    /// fcvt.s.d
    FCvtSD,
    /// fcvt.d.s
    FCvtDS,
    FMvXW,
    FMvWX,
    FMvXD,
    FMvDX,

    // Zicsr. The immediate forms carry their 5-bit operand in `rs1`.
    Csrrw,
    Csrrs,
    Csrrc,
    Csrrwi,
    Csrrsi,
    Csrrci,

    /// Unknown or reserved encoding
    Illegal,
}

/// Coarse classification used by the CFG builder and for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Alu,
    Load,
    Store,
    Branch,
    Jump,
    IndirectJump,
    Syscall,
    Halt,
    MulDiv,
    Atomic,
    Float,
    Csr,
    Fence,
    Illegal,
}

/// Width and signedness of a guest memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub width: u8,
    pub signed: bool,
}

impl Op {
    pub fn class(&self) -> OpClass {
        use Op::*;
        match self {
            Jal => OpClass::Jump,
            Jalr => OpClass::IndirectJump,
            Beq | Bne | Blt | Bge | Bltu | Bgeu => OpClass::Branch,
            Lb | Lh | Lw | Ld | Lbu | Lhu | Lwu => OpClass::Load,
            Sb | Sh | Sw | Sd => OpClass::Store,
            Ecall => OpClass::Syscall,
            Ebreak => OpClass::Halt,
            Fence | FenceI => OpClass::Fence,
            Mul | Mulh | Mulhsu | Mulhu | Div | Divu | Rem | Remu | Mulw | Divw | Divuw
            | Remw | Remuw => OpClass::MulDiv,
            LrW | ScW | LrD | ScD | AmoW(_) | AmoD(_) => OpClass::Atomic,
            Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => OpClass::Csr,
            Flw | Fld | Fsw | Fsd | FMadd(_) | FMsub(_) | FNmsub(_) | FNmadd(_) | FAdd(_)
            | FSub(_) | FMul(_) | FDiv(_) | FSqrt(_) | FSgnj(_) | FSgnjn(_) | FSgnjx(_)
            | FMin(_) | FMax(_) | FEq(_) | FLt(_) | FLe(_) | FClass(_) | FCvtToInt { .. }
            | FCvtFromInt { .. } | FCvtSD | FCvtDS | FMvXW | FMvWX | FMvXD | FMvDX => {
                OpClass::Float
            }
            Illegal => OpClass::Illegal,
            _ => OpClass::Alu,
        }
    }

    /// Does this operation always end a basic block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.class(),
            OpClass::Branch
                | OpClass::Jump
                | OpClass::IndirectJump
                | OpClass::Syscall
                | OpClass::Halt
                | OpClass::Illegal
        )
    }

    pub fn mem_access(&self) -> Option<MemAccess> {
        use Op::*;
        let (width, signed) = match self {
            Lb => (1, true),
            Lh => (2, true),
            Lw | LrW | ScW | AmoW(_) => (4, true),
            Lbu | Sb => (1, false),
            Lhu | Sh => (2, false),
            Lwu | Sw | Flw | Fsw => (4, false),
            Ld | Sd | Fld | Fsd | LrD | ScD | AmoD(_) => (8, false),
            _ => return None,
        };
        Some(MemAccess { width, signed })
    }
}

/// On-demand decoder over the executable segments of an image
pub struct Decoder<'a> {
    image: &'a LoadedImage,
}

impl<'a> Decoder<'a> {
    pub fn new(image: &'a LoadedImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &'a LoadedImage {
        self.image
    }

    /// Decode the instruction at `addr`. Unknown encodings decode to
    /// `Op::Illegal`; only unfetchable addresses are errors.
    pub fn decode_at(&self, addr: u64) -> Result<Instruction, DecodeError> {
        if addr & 1 != 0 {
            return Err(DecodeError::Misaligned(addr));
        }
        let seg = self
            .image
            .segment_containing(addr)
            .ok_or(DecodeError::OutsideCode(addr))?;
        let off = (addr - seg.vaddr) as usize;
        let bytes = &seg.data[off..];
        if bytes.len() < 2 {
            return Err(DecodeError::Truncated(addr));
        }

        let low = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        if low & 0x3 != 0x3 {
            return Ok(decode_compressed(addr, low));
        }
        if bytes.len() < 4 {
            return Err(DecodeError::Truncated(addr));
        }
        let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(decode_32bit(addr, raw))
    }
}

/// Linear sweep over every executable segment. Stops a segment at the first
/// truncated instruction.
pub fn disassemble(image: &LoadedImage) -> Vec<Instruction> {
    let decoder = Decoder::new(image);
    let mut instructions = Vec::new();

    for seg in image.executable_segments() {
        let mut addr = seg.vaddr;
        while addr < seg.data_end() {
            match decoder.decode_at(addr) {
                Ok(inst) => {
                    addr = inst.next_addr();
                    instructions.push(inst);
                }
                Err(_) => break,
            }
        }
    }

    instructions
}

fn bits(x: u32, hi: u32, lo: u32) -> u32 {
    (x >> lo) & ((1 << (hi - lo + 1)) - 1)
}

/// Sign-extend the low `width` bits of `value`
fn sext(value: u32, width: u32) -> i64 {
    let shift = 32 - width;
    ((value << shift) as i32 >> shift) as i64
}

fn fmt_of(funct7: u32) -> Option<Fmt> {
    match funct7 & 0x3 {
        0 => Some(Fmt::S),
        1 => Some(Fmt::D),
        _ => None,
    }
}

fn int_fmt_of(rs2: u8) -> Option<IntFmt> {
    match rs2 {
        0 => Some(IntFmt::W),
        1 => Some(IntFmt::Wu),
        2 => Some(IntFmt::L),
        3 => Some(IntFmt::Lu),
        _ => None,
    }
}

fn decode_32bit(addr: u64, raw: u32) -> Instruction {
    let rd = bits(raw, 11, 7) as u8;
    let rs1 = bits(raw, 19, 15) as u8;
    let rs2 = bits(raw, 24, 20) as u8;
    let funct3 = bits(raw, 14, 12);
    let funct7 = bits(raw, 31, 25);

    let i_imm = sext(bits(raw, 31, 20), 12);
    let s_imm = sext((bits(raw, 31, 25) << 5) | bits(raw, 11, 7), 12);
    let b_imm = sext(
        (bits(raw, 31, 31) << 12)
            | (bits(raw, 7, 7) << 11)
            | (bits(raw, 30, 25) << 5)
            | (bits(raw, 11, 8) << 1),
        13,
    );
    let u_imm = (raw & 0xffff_f000) as i32 as i64;
    let j_imm = sext(
        (bits(raw, 31, 31) << 20)
            | (bits(raw, 19, 12) << 12)
            | (bits(raw, 20, 20) << 11)
            | (bits(raw, 30, 21) << 1),
        21,
    );

    let inst = |op: Op| Instruction::new(addr, raw, 4, op).regs(rd, rs1, rs2);
    let illegal = || Instruction::new(addr, raw, 4, Op::Illegal);

    match bits(raw, 6, 0) {
        0x37 => inst(Op::Lui).imm(u_imm),
        0x17 => inst(Op::Auipc).imm(u_imm),
        0x6f => inst(Op::Jal).imm(j_imm),
        0x67 if funct3 == 0 => inst(Op::Jalr).imm(i_imm),
        0x63 => {
            let op = match funct3 {
                0 => Op::Beq,
                1 => Op::Bne,
                4 => Op::Blt,
                5 => Op::Bge,
                6 => Op::Bltu,
                7 => Op::Bgeu,
                _ => return illegal(),
            };
            inst(op).imm(b_imm)
        }
        0x03 => {
            let op = match funct3 {
                0 => Op::Lb,
                1 => Op::Lh,
                2 => Op::Lw,
                3 => Op::Ld,
                4 => Op::Lbu,
                5 => Op::Lhu,
                6 => Op::Lwu,
                _ => return illegal(),
            };
            inst(op).imm(i_imm)
        }
        0x07 => match funct3 {
            2 => inst(Op::Flw).imm(i_imm),
            3 => inst(Op::Fld).imm(i_imm),
            _ => illegal(),
        },
        0x23 => {
            let op = match funct3 {
                0 => Op::Sb,
                1 => Op::Sh,
                2 => Op::Sw,
                3 => Op::Sd,
                _ => return illegal(),
            };
            inst(op).imm(s_imm)
        }
        0x27 => match funct3 {
            2 => inst(Op::Fsw).imm(s_imm),
            3 => inst(Op::Fsd).imm(s_imm),
            _ => illegal(),
        },
        0x13 => {
            let shamt = bits(raw, 25, 20) as i64;
            let funct6 = bits(raw, 31, 26);
            match funct3 {
                0 => inst(Op::Addi).imm(i_imm),
                1 if funct6 == 0 => inst(Op::Slli).imm(shamt),
                2 => inst(Op::Slti).imm(i_imm),
                3 => inst(Op::Sltiu).imm(i_imm),
                4 => inst(Op::Xori).imm(i_imm),
                5 if funct6 == 0 => inst(Op::Srli).imm(shamt),
                5 if funct6 == 0x10 => inst(Op::Srai).imm(shamt),
                6 => inst(Op::Ori).imm(i_imm),
                7 => inst(Op::Andi).imm(i_imm),
                _ => illegal(),
            }
        }
        0x1b => {
            let shamt = bits(raw, 24, 20) as i64;
            match (funct3, funct7) {
                (0, _) => inst(Op::Addiw).imm(i_imm),
                (1, 0x00) => inst(Op::Slliw).imm(shamt),
                (5, 0x00) => inst(Op::Srliw).imm(shamt),
                (5, 0x20) => inst(Op::Sraiw).imm(shamt),
                _ => illegal(),
            }
        }
        0x33 => {
            let op = match (funct7, funct3) {
                (0x00, 0) => Op::Add,
                (0x20, 0) => Op::Sub,
                (0x00, 1) => Op::Sll,
                (0x00, 2) => Op::Slt,
                (0x00, 3) => Op::Sltu,
                (0x00, 4) => Op::Xor,
                (0x00, 5) => Op::Srl,
                (0x20, 5) => Op::Sra,
                (0x00, 6) => Op::Or,
                (0x00, 7) => Op::And,
                (0x01, 0) => Op::Mul,
                (0x01, 1) => Op::Mulh,
                (0x01, 2) => Op::Mulhsu,
                (0x01, 3) => Op::Mulhu,
                (0x01, 4) => Op::Div,
                (0x01, 5) => Op::Divu,
                (0x01, 6) => Op::Rem,
                (0x01, 7) => Op::Remu,
                _ => return illegal(),
            };
            inst(op)
        }
        0x3b => {
            let op = match (funct7, funct3) {
                (0x00, 0) => Op::Addw,
                (0x20, 0) => Op::Subw,
                (0x00, 1) => Op::Sllw,
                (0x00, 5) => Op::Srlw,
                (0x20, 5) => Op::Sraw,
                (0x01, 0) => Op::Mulw,
                (0x01, 4) => Op::Divw,
                (0x01, 5) => Op::Divuw,
                (0x01, 6) => Op::Remw,
                (0x01, 7) => Op::Remuw,
                _ => return illegal(),
            };
            inst(op)
        }
        0x0f => match funct3 {
            0 => inst(Op::Fence),
            1 => inst(Op::FenceI),
            _ => illegal(),
        },
        0x73 => {
            let csr = bits(raw, 31, 20) as i64;
            match funct3 {
                0 if raw == 0x0000_0073 => inst(Op::Ecall),
                0 if raw == 0x0010_0073 => inst(Op::Ebreak),
                1 => inst(Op::Csrrw).imm(csr),
                2 => inst(Op::Csrrs).imm(csr),
                3 => inst(Op::Csrrc).imm(csr),
                5 => inst(Op::Csrrwi).imm(csr),
                6 => inst(Op::Csrrsi).imm(csr),
                7 => inst(Op::Csrrci).imm(csr),
                _ => illegal(),
            }
        }
        0x2f => {
            let amo = match bits(raw, 31, 27) {
                0x02 if rs2 == 0 => None,
                0x03 => None,
                0x01 => Some(AmoOp::Swap),
                0x00 => Some(AmoOp::Add),
                0x04 => Some(AmoOp::Xor),
                0x0c => Some(AmoOp::And),
                0x08 => Some(AmoOp::Or),
                0x10 => Some(AmoOp::Min),
                0x14 => Some(AmoOp::Max),
                0x18 => Some(AmoOp::Minu),
                0x1c => Some(AmoOp::Maxu),
                _ => return illegal(),
            };
            let is_lr = bits(raw, 31, 27) == 0x02;
            let op = match (funct3, amo) {
                (2, Some(amo)) => Op::AmoW(amo),
                (3, Some(amo)) => Op::AmoD(amo),
                (2, None) if is_lr => Op::LrW,
                (2, None) => Op::ScW,
                (3, None) if is_lr => Op::LrD,
                (3, None) => Op::ScD,
                _ => return illegal(),
            };
            inst(op)
        }
        opcode @ (0x43 | 0x47 | 0x4b | 0x4f) => {
            let Some(fmt) = fmt_of(funct7) else {
                return illegal();
            };
            let op = match opcode {
                0x43 => Op::FMadd(fmt),
                0x47 => Op::FMsub(fmt),
                0x4b => Op::FNmsub(fmt),
                _ => Op::FNmadd(fmt),
            };
            let mut decoded = inst(op);
            decoded.rs3 = bits(raw, 31, 27) as u8;
            decoded
        }
        0x53 => decode_op_fp(funct7, funct3, rs2)
            .map(inst)
            .unwrap_or_else(illegal),
        _ => illegal(),
    }
}

fn decode_op_fp(funct7: u32, funct3: u32, rs2: u8) -> Option<Op> {
    let fmt = fmt_of(funct7)?;
    let op = match (funct7 >> 2, funct3, rs2) {
        (0x00, _, _) => Op::FAdd(fmt),
        (0x01, _, _) => Op::FSub(fmt),
        (0x02, _, _) => Op::FMul(fmt),
        (0x03, _, _) => Op::FDiv(fmt),
        (0x0b, _, 0) => Op::FSqrt(fmt),
        (0x04, 0, _) => Op::FSgnj(fmt),
        (0x04, 1, _) => Op::FSgnjn(fmt),
        (0x04, 2, _) => Op::FSgnjx(fmt),
        (0x05, 0, _) => Op::FMin(fmt),
        (0x05, 1, _) => Op::FMax(fmt),
        (0x08, _, 1) if fmt == Fmt::S => Op::FCvtSD,
        (0x08, _, 0) if fmt == Fmt::D => Op::FCvtDS,
        (0x14, 0, _) => Op::FLe(fmt),
        (0x14, 1, _) => Op::FLt(fmt),
        (0x14, 2, _) => Op::FEq(fmt),
        (0x18, _, _) => Op::FCvtToInt {
            from: fmt,
            to: int_fmt_of(rs2)?,
            rm: RoundingMode::from_bits(funct3)?,
        },
        (0x1a, _, _) => Op::FCvtFromInt {
            from: int_fmt_of(rs2)?,
            to: fmt,
        },
        (0x1c, 0, 0) if fmt == Fmt::S => Op::FMvXW,
        (0x1c, 0, 0) => Op::FMvXD,
        (0x1c, 1, 0) => Op::FClass(fmt),
        (0x1e, 0, 0) if fmt == Fmt::S => Op::FMvWX,
        (0x1e, 0, 0) => Op::FMvDX,
        _ => return None,
    };
    Some(op)
}

/// Decode a 16-bit compressed instruction into its base-ISA equivalent
fn decode_compressed(addr: u64, raw: u32) -> Instruction {
    let inst = |op: Op| Instruction::new(addr, raw, 2, op);
    let illegal = || inst(Op::Illegal);

    // Full and primed (x8..x15) register fields
    let rd = bits(raw, 11, 7) as u8;
    let rs2 = bits(raw, 6, 2) as u8;
    let rd_p = bits(raw, 4, 2) as u8 + 8;
    let rs1_p = bits(raw, 9, 7) as u8 + 8;

    let ci_imm = sext((bits(raw, 12, 12) << 5) | bits(raw, 6, 2), 6);
    let shamt = ((bits(raw, 12, 12) << 5) | bits(raw, 6, 2)) as i64;
    let lw_imm = ((bits(raw, 12, 10) << 3) | (bits(raw, 6, 6) << 2) | (bits(raw, 5, 5) << 6)) as i64;
    let ld_imm = ((bits(raw, 12, 10) << 3) | (bits(raw, 6, 5) << 6)) as i64;

    match (bits(raw, 1, 0), bits(raw, 15, 13)) {
        (0, 0) => {
            let imm = (bits(raw, 12, 11) << 4)
                | (bits(raw, 10, 7) << 6)
                | (bits(raw, 6, 6) << 2)
                | (bits(raw, 5, 5) << 3);
            if imm == 0 {
                // Covers the all-zero halfword
                return illegal();
            }
            inst(Op::Addi).regs(rd_p, 2, 0).imm(imm as i64)
        }
        (0, 1) => inst(Op::Fld).regs(rd_p, rs1_p, 0).imm(ld_imm),
        (0, 2) => inst(Op::Lw).regs(rd_p, rs1_p, 0).imm(lw_imm),
        (0, 3) => inst(Op::Ld).regs(rd_p, rs1_p, 0).imm(ld_imm),
        (0, 5) => inst(Op::Fsd).regs(0, rs1_p, rd_p).imm(ld_imm),
        (0, 6) => inst(Op::Sw).regs(0, rs1_p, rd_p).imm(lw_imm),
        (0, 7) => inst(Op::Sd).regs(0, rs1_p, rd_p).imm(ld_imm),

        (1, 0) => inst(Op::Addi).regs(rd, rd, 0).imm(ci_imm),
        (1, 1) if rd != 0 => inst(Op::Addiw).regs(rd, rd, 0).imm(ci_imm),
        (1, 2) => inst(Op::Addi).regs(rd, 0, 0).imm(ci_imm),
        (1, 3) if rd == 2 => {
            let imm = sext(
                (bits(raw, 12, 12) << 9)
                    | (bits(raw, 6, 6) << 4)
                    | (bits(raw, 5, 5) << 6)
                    | (bits(raw, 4, 3) << 7)
                    | (bits(raw, 2, 2) << 5),
                10,
            );
            if imm == 0 {
                return illegal();
            }
            inst(Op::Addi).regs(2, 2, 0).imm(imm)
        }
        (1, 3) => {
            let imm = sext((bits(raw, 12, 12) << 17) | (bits(raw, 6, 2) << 12), 18);
            if imm == 0 {
                return illegal();
            }
            inst(Op::Lui).regs(rd, 0, 0).imm(imm)
        }
        (1, 4) => {
            let rd = rs1_p;
            match bits(raw, 11, 10) {
                0 => inst(Op::Srli).regs(rd, rd, 0).imm(shamt),
                1 => inst(Op::Srai).regs(rd, rd, 0).imm(shamt),
                2 => inst(Op::Andi).regs(rd, rd, 0).imm(ci_imm),
                _ => {
                    let op = match (bits(raw, 12, 12), bits(raw, 6, 5)) {
                        (0, 0) => Op::Sub,
                        (0, 1) => Op::Xor,
                        (0, 2) => Op::Or,
                        (0, 3) => Op::And,
                        (1, 0) => Op::Subw,
                        (1, 1) => Op::Addw,
                        _ => return illegal(),
                    };
                    inst(op).regs(rd, rd, rd_p)
                }
            }
        }
        (1, 5) => {
            let imm = sext(
                (bits(raw, 12, 12) << 11)
                    | (bits(raw, 11, 11) << 4)
                    | (bits(raw, 10, 9) << 8)
                    | (bits(raw, 8, 8) << 10)
                    | (bits(raw, 7, 7) << 6)
                    | (bits(raw, 6, 6) << 7)
                    | (bits(raw, 5, 3) << 1)
                    | (bits(raw, 2, 2) << 5),
                12,
            );
            inst(Op::Jal).imm(imm)
        }
        (1, funct3 @ (6 | 7)) => {
            let imm = sext(
                (bits(raw, 12, 12) << 8)
                    | (bits(raw, 11, 10) << 3)
                    | (bits(raw, 6, 5) << 6)
                    | (bits(raw, 4, 3) << 1)
                    | (bits(raw, 2, 2) << 5),
                9,
            );
            let op = if funct3 == 6 { Op::Beq } else { Op::Bne };
            inst(op).regs(0, rs1_p, 0).imm(imm)
        }

        (2, 0) => inst(Op::Slli).regs(rd, rd, 0).imm(shamt),
        (2, 1) => {
            let imm = (bits(raw, 12, 12) << 5) | (bits(raw, 6, 5) << 3) | (bits(raw, 4, 2) << 6);
            inst(Op::Fld).regs(rd, 2, 0).imm(imm as i64)
        }
        (2, 2) if rd != 0 => {
            let imm = (bits(raw, 12, 12) << 5) | (bits(raw, 6, 4) << 2) | (bits(raw, 3, 2) << 6);
            inst(Op::Lw).regs(rd, 2, 0).imm(imm as i64)
        }
        (2, 3) if rd != 0 => {
            let imm = (bits(raw, 12, 12) << 5) | (bits(raw, 6, 5) << 3) | (bits(raw, 4, 2) << 6);
            inst(Op::Ld).regs(rd, 2, 0).imm(imm as i64)
        }
        (2, 4) => match (bits(raw, 12, 12), rd, rs2) {
            (0, 0, 0) => illegal(),
            (0, rs1, 0) => inst(Op::Jalr).regs(0, rs1, 0),
            (0, rd, rs2) => inst(Op::Add).regs(rd, 0, rs2),
            (_, 0, 0) => inst(Op::Ebreak),
            (_, rs1, 0) => inst(Op::Jalr).regs(1, rs1, 0),
            (_, rd, rs2) => inst(Op::Add).regs(rd, rd, rs2),
        },
        (2, 5) => {
            let imm = (bits(raw, 12, 10) << 3) | (bits(raw, 9, 7) << 6);
            inst(Op::Fsd).regs(0, 2, rs2).imm(imm as i64)
        }
        (2, 6) => {
            let imm = (bits(raw, 12, 9) << 2) | (bits(raw, 8, 7) << 6);
            inst(Op::Sw).regs(0, 2, rs2).imm(imm as i64)
        }
        (2, 7) => {
            let imm = (bits(raw, 12, 10) << 3) | (bits(raw, 9, 7) << 6);
            inst(Op::Sd).regs(0, 2, rs2).imm(imm as i64)
        }
        _ => illegal(),
    }
}
