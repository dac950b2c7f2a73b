// translate.rs - RISC-V to WebAssembly translation
//
// Each basic block becomes one function of type (param $m i32) (result i32).
// $m is the base of the register file; guest address A is accessed at
// $m + ram_base + A. A block leaves the pc it refers to in the pc slot and
// returns one of the `layout::status` codes.

use crate::cfg::{BasicBlock, ControlFlowGraph, Terminator};
use crate::disasm::{AmoOp, Fmt, Instruction as Inst, IntFmt, Op, OpClass, RoundingMode};
use crate::error::TranslateError;
use crate::layout::{self, status, MemoryLayout};
use tracing::{debug, trace};
use wasm_encoder::{BlockType, Instruction, MemArg, ValType};

/// A translated block, ready for the module builder
#[derive(Debug, Clone)]
pub struct BlockFunction {
    pub addr: u64,
    pub locals: Vec<(u32, ValType)>,
    pub body: Vec<Instruction<'static>>,
}

impl BlockFunction {
    pub fn name(&self) -> String {
        format!("block_{:x}", self.addr)
    }
}

// Local indices
const M: u32 = 0;
const ADDR: u32 = 1;
const T0: u32 = 2;
const T1: u32 = 3;
const T2: u32 = 4;
const T3: u32 = 5;
const I64_LOCALS: u32 = 5;
// f64 scratch for conversions
const FV: u32 = 6;

const NAN_BOX: i64 = 0xffff_ffff_0000_0000_u64 as i64;
const LOW32: i64 = 0xffff_ffff;

// CSR numbers handled inline
const CSR_FFLAGS: i64 = 0x001;
const CSR_FRM: i64 = 0x002;
const CSR_FCSR: i64 = 0x003;
const CSR_CYCLE: i64 = 0xc00;
const CSR_INSTRET: i64 = 0xc02;

/// Whether control can still reach the next instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Exited,
}

/// Translate every block of the graph, in ascending address order
pub fn translate(
    cfg: &ControlFlowGraph,
    layout: &MemoryLayout,
) -> Result<Vec<BlockFunction>, TranslateError> {
    let functions = cfg
        .blocks
        .values()
        .map(|block| translate_block(block, layout))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        functions = functions.len(),
        instructions = functions.iter().map(|f| f.body.len()).sum::<usize>(),
        "translated blocks"
    );
    Ok(functions)
}

/// Translate a single basic block to a Wasm function body
pub fn translate_block(
    block: &BasicBlock,
    layout: &MemoryLayout,
) -> Result<BlockFunction, TranslateError> {
    if block.instructions.is_empty() {
        return Err(TranslateError::EmptyBlock(block.start));
    }

    let mut emitter = Emitter {
        layout,
        body: Vec::new(),
    };

    let mut flow = Flow::Next;
    for inst in &block.instructions {
        flow = emitter.instruction(inst);
        if flow == Flow::Exited {
            break;
        }
    }

    if flow == Flow::Next {
        match block.terminator {
            Terminator::Fallthrough { next } => emitter.exit(status::CONTINUE, next),
            // Only reachable when the last instruction falls through
            _ => emitter.exit(status::CONTINUE, block.end),
        }
    }
    emitter.push(Instruction::End);

    trace!(
        block = format_args!("0x{:x}", block.start),
        ops = emitter.body.len(),
        "translated block"
    );
    Ok(BlockFunction {
        addr: block.start,
        locals: vec![(I64_LOCALS, ValType::I64), (1, ValType::F64)],
        body: emitter.body,
    })
}

fn memarg(offset: u64, align: u32) -> MemArg {
    MemArg {
        offset,
        align,
        memory_index: 0,
    }
}

struct Emitter<'a> {
    layout: &'a MemoryLayout,
    body: Vec<Instruction<'static>>,
}

impl Emitter<'_> {
    fn push(&mut self, inst: Instruction<'static>) {
        self.body.push(inst);
    }

    fn extend<const N: usize>(&mut self, insts: [Instruction<'static>; N]) {
        self.body.extend(insts);
    }

    // ---------------------------------------------------------------------
    // Register file
    // ---------------------------------------------------------------------

    fn get_x(&mut self, r: u8) {
        if r == 0 {
            self.push(Instruction::I64Const(0));
        } else {
            self.extend([
                Instruction::LocalGet(M),
                Instruction::I64Load(memarg(layout::xreg(r), 3)),
            ]);
        }
    }

    /// x[rd] = value. Writes to x0 are dropped without evaluating `value`,
    /// so `value` must be free of side effects.
    fn set_x(&mut self, rd: u8, value: impl FnOnce(&mut Self)) {
        if rd == 0 {
            return;
        }
        self.push(Instruction::LocalGet(M));
        value(self);
        self.push(Instruction::I64Store(memarg(layout::xreg(rd), 3)));
    }

    fn get_f(&mut self, r: u8, fmt: Fmt) {
        self.push(Instruction::LocalGet(M));
        match fmt {
            Fmt::S => self.push(Instruction::F32Load(memarg(layout::freg(r), 2))),
            Fmt::D => self.push(Instruction::F64Load(memarg(layout::freg(r), 3))),
        }
    }

    /// f[rd] = value, NaN-boxing single-precision results
    fn set_f(&mut self, rd: u8, fmt: Fmt, value: impl FnOnce(&mut Self)) {
        self.push(Instruction::LocalGet(M));
        value(self);
        match fmt {
            Fmt::S => self.extend([
                Instruction::I32ReinterpretF32,
                Instruction::I64ExtendI32U,
                Instruction::I64Const(NAN_BOX),
                Instruction::I64Or,
                Instruction::I64Store(memarg(layout::freg(rd), 3)),
            ]),
            Fmt::D => self.push(Instruction::F64Store(memarg(layout::freg(rd), 3))),
        }
    }

    fn sext32(&mut self) {
        self.extend([Instruction::I32WrapI64, Instruction::I64ExtendI32S]);
    }

    fn bool_to_i64(&mut self) {
        self.push(Instruction::I64ExtendI32U);
    }

    // ---------------------------------------------------------------------
    // Exits
    // ---------------------------------------------------------------------

    /// Store `pc` into the pc slot and return `code`
    fn exit(&mut self, code: i32, pc: u64) {
        self.extend([
            Instruction::LocalGet(M),
            Instruction::I64Const(pc as i64),
            Instruction::I64Store(memarg(layout::PC_OFFSET as u64, 3)),
            Instruction::I32Const(code),
            Instruction::Return,
        ]);
    }

    // ---------------------------------------------------------------------
    // Guest memory
    // ---------------------------------------------------------------------

    /// ADDR = x[rs1] + imm, leaving the block with MEMORY_FAULT if the
    /// access does not fit inside guest RAM
    fn effective_addr(&mut self, inst: &Inst, width: u8) {
        self.get_x(inst.rs1);
        self.extend([
            Instruction::I64Const(inst.imm),
            Instruction::I64Add,
            Instruction::LocalTee(ADDR),
            Instruction::I64Const((self.layout.ram_size - width as u64) as i64),
            Instruction::I64GtU,
            Instruction::If(BlockType::Empty),
        ]);
        self.exit(status::MEMORY_FAULT, inst.addr);
        self.push(Instruction::End);
    }

    /// Host pointer for ADDR; pair with `guest()` as the access offset
    fn guest_ptr(&mut self) {
        self.extend([
            Instruction::LocalGet(ADDR),
            Instruction::I32WrapI64,
            Instruction::LocalGet(M),
            Instruction::I32Add,
        ]);
    }

    fn guest(&self, align: u32) -> MemArg {
        memarg(self.layout.ram_base, align)
    }

    fn load(&mut self, inst: &Inst) {
        let Some(access) = inst.op.mem_access() else {
            return;
        };
        self.effective_addr(inst, access.width);
        let load = match inst.op {
            Op::Lb => Instruction::I64Load8S(self.guest(0)),
            Op::Lbu => Instruction::I64Load8U(self.guest(0)),
            Op::Lh => Instruction::I64Load16S(self.guest(0)),
            Op::Lhu => Instruction::I64Load16U(self.guest(0)),
            Op::Lw => Instruction::I64Load32S(self.guest(0)),
            Op::Lwu => Instruction::I64Load32U(self.guest(0)),
            _ => Instruction::I64Load(self.guest(0)),
        };
        self.set_x(inst.rd, |e| {
            e.guest_ptr();
            e.push(load);
        });
    }

    fn store(&mut self, inst: &Inst) {
        let Some(access) = inst.op.mem_access() else {
            return;
        };
        self.effective_addr(inst, access.width);
        self.guest_ptr();
        self.get_x(inst.rs2);
        let store = match access.width {
            1 => Instruction::I64Store8(self.guest(0)),
            2 => Instruction::I64Store16(self.guest(0)),
            4 => Instruction::I64Store32(self.guest(0)),
            _ => Instruction::I64Store(self.guest(0)),
        };
        self.push(store);
    }

    // ---------------------------------------------------------------------
    // Instructions
    // ---------------------------------------------------------------------

    fn instruction(&mut self, inst: &Inst) -> Flow {
        match inst.op.class() {
            OpClass::Alu => self.alu(inst),
            OpClass::Load => self.load(inst),
            OpClass::Store => self.store(inst),
            OpClass::MulDiv => self.muldiv(inst),
            OpClass::Atomic => self.atomic(inst),
            OpClass::Float => self.float(inst),
            OpClass::Csr => return self.csr(inst),
            OpClass::Fence => {}
            OpClass::Branch => {
                self.branch(inst);
                return Flow::Exited;
            }
            OpClass::Jump => {
                let link = inst.next_addr() as i64;
                self.set_x(inst.rd, |e| e.push(Instruction::I64Const(link)));
                self.exit(status::CONTINUE, inst.target());
                return Flow::Exited;
            }
            OpClass::IndirectJump => {
                self.jalr(inst);
                return Flow::Exited;
            }
            OpClass::Syscall => {
                self.exit(status::SYSCALL, inst.addr);
                return Flow::Exited;
            }
            OpClass::Halt => {
                self.exit(status::HALT, inst.addr);
                return Flow::Exited;
            }
            OpClass::Illegal => {
                self.exit(status::ILLEGAL_INSTRUCTION, inst.addr);
                return Flow::Exited;
            }
        }
        Flow::Next
    }

    fn alu(&mut self, inst: &Inst) {
        let (rs1, rs2, imm) = (inst.rs1, inst.rs2, inst.imm);

        // Register-register: x[rd] = x[rs1] op x[rs2]
        let rr = |e: &mut Self, op: Instruction<'static>| {
            e.get_x(rs1);
            e.get_x(rs2);
            e.push(op);
        };
        // Register-immediate: x[rd] = x[rs1] op imm
        let ri = |e: &mut Self, op: Instruction<'static>| {
            e.get_x(rs1);
            e.push(Instruction::I64Const(imm));
            e.push(op);
        };
        // 32-bit shifts on the low word, sign-extended
        let shift_w = |e: &mut Self, op: Instruction<'static>, by_imm: bool| {
            e.get_x(rs1);
            e.push(Instruction::I32WrapI64);
            if by_imm {
                e.push(Instruction::I32Const((imm & 0x1f) as i32));
            } else {
                e.get_x(rs2);
                e.push(Instruction::I32WrapI64);
            }
            e.push(op);
            e.push(Instruction::I64ExtendI32S);
        };

        match inst.op {
            Op::Lui => self.set_x(inst.rd, |e| e.push(Instruction::I64Const(imm))),
            Op::Auipc => {
                let value = inst.addr.wrapping_add(imm as u64) as i64;
                self.set_x(inst.rd, |e| e.push(Instruction::I64Const(value)))
            }
            Op::Addi => self.set_x(inst.rd, |e| ri(e, Instruction::I64Add)),
            Op::Xori => self.set_x(inst.rd, |e| ri(e, Instruction::I64Xor)),
            Op::Ori => self.set_x(inst.rd, |e| ri(e, Instruction::I64Or)),
            Op::Andi => self.set_x(inst.rd, |e| ri(e, Instruction::I64And)),
            Op::Slti => self.set_x(inst.rd, |e| {
                ri(e, Instruction::I64LtS);
                e.bool_to_i64();
            }),
            Op::Sltiu => self.set_x(inst.rd, |e| {
                ri(e, Instruction::I64LtU);
                e.bool_to_i64();
            }),
            Op::Slli | Op::Srli | Op::Srai => {
                let op = match inst.op {
                    Op::Slli => Instruction::I64Shl,
                    Op::Srli => Instruction::I64ShrU,
                    _ => Instruction::I64ShrS,
                };
                self.set_x(inst.rd, |e| {
                    e.get_x(rs1);
                    e.push(Instruction::I64Const(imm & 0x3f));
                    e.push(op);
                })
            }
            Op::Add => self.set_x(inst.rd, |e| rr(e, Instruction::I64Add)),
            Op::Sub => self.set_x(inst.rd, |e| rr(e, Instruction::I64Sub)),
            Op::Xor => self.set_x(inst.rd, |e| rr(e, Instruction::I64Xor)),
            Op::Or => self.set_x(inst.rd, |e| rr(e, Instruction::I64Or)),
            Op::And => self.set_x(inst.rd, |e| rr(e, Instruction::I64And)),
            // i64 shifts take the amount modulo 64
            Op::Sll => self.set_x(inst.rd, |e| rr(e, Instruction::I64Shl)),
            Op::Srl => self.set_x(inst.rd, |e| rr(e, Instruction::I64ShrU)),
            Op::Sra => self.set_x(inst.rd, |e| rr(e, Instruction::I64ShrS)),
            Op::Slt => self.set_x(inst.rd, |e| {
                rr(e, Instruction::I64LtS);
                e.bool_to_i64();
            }),
            Op::Sltu => self.set_x(inst.rd, |e| {
                rr(e, Instruction::I64LtU);
                e.bool_to_i64();
            }),
            Op::Addiw => self.set_x(inst.rd, |e| {
                ri(e, Instruction::I64Add);
                e.sext32();
            }),
            Op::Addw => self.set_x(inst.rd, |e| {
                rr(e, Instruction::I64Add);
                e.sext32();
            }),
            Op::Subw => self.set_x(inst.rd, |e| {
                rr(e, Instruction::I64Sub);
                e.sext32();
            }),
            Op::Slliw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32Shl, true)),
            Op::Srliw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32ShrU, true)),
            Op::Sraiw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32ShrS, true)),
            Op::Sllw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32Shl, false)),
            Op::Srlw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32ShrU, false)),
            Op::Sraw => self.set_x(inst.rd, |e| shift_w(e, Instruction::I32ShrS, false)),
            _ => {}
        }
    }

    fn branch(&mut self, inst: &Inst) {
        let cmp = match inst.op {
            Op::Beq => Instruction::I64Eq,
            Op::Bne => Instruction::I64Ne,
            Op::Blt => Instruction::I64LtS,
            Op::Bge => Instruction::I64GeS,
            Op::Bltu => Instruction::I64LtU,
            _ => Instruction::I64GeU,
        };
        self.get_x(inst.rs1);
        self.get_x(inst.rs2);
        self.extend([cmp, Instruction::If(BlockType::Empty)]);
        self.exit(status::CONTINUE, inst.target());
        self.push(Instruction::End);
        self.exit(status::CONTINUE, inst.next_addr());
    }

    fn jalr(&mut self, inst: &Inst) {
        // Target first: rd may equal rs1
        self.get_x(inst.rs1);
        self.extend([
            Instruction::I64Const(inst.imm),
            Instruction::I64Add,
            Instruction::I64Const(!1),
            Instruction::I64And,
            Instruction::LocalSet(T0),
        ]);
        let link = inst.next_addr() as i64;
        self.set_x(inst.rd, |e| e.push(Instruction::I64Const(link)));
        self.extend([
            Instruction::LocalGet(M),
            Instruction::LocalGet(T0),
            Instruction::I64Store(memarg(layout::PC_OFFSET as u64, 3)),
            Instruction::I32Const(status::CONTINUE),
            Instruction::Return,
        ]);
    }

    // ---------------------------------------------------------------------
    // M extension
    // ---------------------------------------------------------------------

    fn muldiv(&mut self, inst: &Inst) {
        if inst.rd == 0 {
            return;
        }
        let word = matches!(
            inst.op,
            Op::Mulw | Op::Divw | Op::Divuw | Op::Remw | Op::Remuw
        );
        let unsigned_word = matches!(inst.op, Op::Divuw | Op::Remuw);

        // T0 = dividend / multiplicand, T1 = divisor / multiplier
        for (reg, local) in [(inst.rs1, T0), (inst.rs2, T1)] {
            self.get_x(reg);
            if unsigned_word {
                self.extend([Instruction::I64Const(LOW32), Instruction::I64And]);
            } else if word {
                self.sext32();
            }
            self.push(Instruction::LocalSet(local));
        }

        let op = inst.op;
        self.set_x(inst.rd, |e| {
            match op {
                Op::Mul | Op::Mulw => e.extend([
                    Instruction::LocalGet(T0),
                    Instruction::LocalGet(T1),
                    Instruction::I64Mul,
                ]),
                Op::Mulhu => e.mulhu(),
                Op::Mulh => {
                    // mulhu - (a < 0 ? b : 0) - (b < 0 ? a : 0)
                    e.mulhu();
                    e.signed_correction(T0, T1);
                    e.signed_correction(T1, T0);
                }
                Op::Mulhsu => {
                    e.mulhu();
                    e.signed_correction(T0, T1);
                }
                Op::Div => e.div_by(Instruction::I64DivS, true),
                Op::Divu | Op::Divuw => e.div_by(Instruction::I64DivU, false),
                Op::Divw => e.div_by(Instruction::I64DivS, false),
                Op::Rem | Op::Remw => e.rem_by(Instruction::I64RemS),
                _ => e.rem_by(Instruction::I64RemU),
            }
            if word {
                e.sext32();
            }
        });
    }

    /// High 64 bits of the unsigned product T0 * T1, from 32-bit limbs.
    /// Clobbers T2 and T3.
    fn mulhu(&mut self) {
        use Instruction::*;
        self.extend([
            // T2 = lo(a) * hi(b)
            LocalGet(T0),
            I64Const(LOW32),
            I64And,
            LocalGet(T1),
            I64Const(32),
            I64ShrU,
            I64Mul,
            LocalSet(T2),
            // T3 = hi(a) * lo(b)
            LocalGet(T0),
            I64Const(32),
            I64ShrU,
            LocalGet(T1),
            I64Const(LOW32),
            I64And,
            I64Mul,
            LocalSet(T3),
            // hi(a) * hi(b)
            LocalGet(T0),
            I64Const(32),
            I64ShrU,
            LocalGet(T1),
            I64Const(32),
            I64ShrU,
            I64Mul,
            // + hi(T2) + hi(T3)
            LocalGet(T2),
            I64Const(32),
            I64ShrU,
            I64Add,
            LocalGet(T3),
            I64Const(32),
            I64ShrU,
            I64Add,
            // + carry out of the middle column
            LocalGet(T0),
            I64Const(LOW32),
            I64And,
            LocalGet(T1),
            I64Const(LOW32),
            I64And,
            I64Mul,
            I64Const(32),
            I64ShrU,
            LocalGet(T2),
            I64Const(LOW32),
            I64And,
            I64Add,
            LocalGet(T3),
            I64Const(LOW32),
            I64And,
            I64Add,
            I64Const(32),
            I64ShrU,
            I64Add,
        ]);
    }

    /// Subtract `other` from the value on the stack when `sign` is negative
    fn signed_correction(&mut self, sign: u32, other: u32) {
        self.extend([
            Instruction::LocalGet(other),
            Instruction::I64Const(0),
            Instruction::LocalGet(sign),
            Instruction::I64Const(0),
            Instruction::I64LtS,
            Instruction::Select,
            Instruction::I64Sub,
        ]);
    }

    /// T0 / T1 with RISC-V results for a zero divisor and, when
    /// `check_overflow`, for i64::MIN / -1
    fn div_by(&mut self, div: Instruction<'static>, check_overflow: bool) {
        self.extend([
            Instruction::LocalGet(T1),
            Instruction::I64Eqz,
            Instruction::If(BlockType::Result(ValType::I64)),
            Instruction::I64Const(-1),
            Instruction::Else,
        ]);
        if check_overflow {
            self.extend([
                Instruction::LocalGet(T0),
                Instruction::I64Const(i64::MIN),
                Instruction::I64Eq,
                Instruction::LocalGet(T1),
                Instruction::I64Const(-1),
                Instruction::I64Eq,
                Instruction::I32And,
                Instruction::If(BlockType::Result(ValType::I64)),
                Instruction::LocalGet(T0),
                Instruction::Else,
                Instruction::LocalGet(T0),
                Instruction::LocalGet(T1),
                div,
                Instruction::End,
            ]);
        } else {
            self.extend([Instruction::LocalGet(T0), Instruction::LocalGet(T1), div]);
        }
        self.push(Instruction::End);
    }

    /// T0 % T1; a zero divisor yields the dividend. Wasm's rem_s already
    /// returns 0 for i64::MIN % -1.
    fn rem_by(&mut self, rem: Instruction<'static>) {
        self.extend([
            Instruction::LocalGet(T1),
            Instruction::I64Eqz,
            Instruction::If(BlockType::Result(ValType::I64)),
            Instruction::LocalGet(T0),
            Instruction::Else,
            Instruction::LocalGet(T0),
            Instruction::LocalGet(T1),
            rem,
            Instruction::End,
        ]);
    }

    // ---------------------------------------------------------------------
    // A extension, single-actor emulation
    // ---------------------------------------------------------------------

    fn atomic(&mut self, inst: &Inst) {
        let Some(access) = inst.op.mem_access() else {
            return;
        };
        let word = access.width == 4;
        self.effective_addr(inst, access.width);

        let load = if word {
            Instruction::I64Load32S(self.guest(2))
        } else {
            Instruction::I64Load(self.guest(3))
        };
        let store = if word {
            Instruction::I64Store32(self.guest(2))
        } else {
            Instruction::I64Store(self.guest(3))
        };

        match inst.op {
            Op::LrW | Op::LrD => {
                self.guest_ptr();
                self.extend([load, Instruction::LocalSet(T0)]);
                self.extend([
                    Instruction::LocalGet(M),
                    Instruction::LocalGet(ADDR),
                    Instruction::I64Store(memarg(layout::RESERVATION_ADDR_OFFSET as u64, 3)),
                    Instruction::LocalGet(M),
                    Instruction::I64Const(1),
                    Instruction::I64Store(memarg(layout::RESERVATION_VALID_OFFSET as u64, 3)),
                ]);
            }
            Op::ScW | Op::ScD => {
                self.extend([
                    Instruction::LocalGet(M),
                    Instruction::I64Load(memarg(layout::RESERVATION_VALID_OFFSET as u64, 3)),
                    Instruction::I32WrapI64,
                    Instruction::LocalGet(M),
                    Instruction::I64Load(memarg(layout::RESERVATION_ADDR_OFFSET as u64, 3)),
                    Instruction::LocalGet(ADDR),
                    Instruction::I64Eq,
                    Instruction::I32And,
                    Instruction::If(BlockType::Result(ValType::I64)),
                ]);
                self.guest_ptr();
                self.get_x(inst.rs2);
                self.extend([
                    store,
                    Instruction::I64Const(0),
                    Instruction::Else,
                    Instruction::I64Const(1),
                    Instruction::End,
                    Instruction::LocalSet(T0),
                    Instruction::LocalGet(M),
                    Instruction::I64Const(0),
                    Instruction::I64Store(memarg(layout::RESERVATION_VALID_OFFSET as u64, 3)),
                ]);
            }
            Op::AmoW(amo) | Op::AmoD(amo) => {
                // T0 = old value, T1 = operand
                self.guest_ptr();
                self.extend([load, Instruction::LocalSet(T0)]);
                self.get_x(inst.rs2);
                if word {
                    self.sext32();
                }
                self.push(Instruction::LocalSet(T1));

                self.guest_ptr();
                self.amo_value(amo);
                self.push(store);
            }
            _ => return,
        }
        self.set_x(inst.rd, |e| e.push(Instruction::LocalGet(T0)));
    }

    fn amo_value(&mut self, amo: AmoOp) {
        use Instruction::*;
        let pick = |cmp: Instruction<'static>| {
            [LocalGet(T0), LocalGet(T1), LocalGet(T0), LocalGet(T1), cmp, Select]
        };
        match amo {
            AmoOp::Swap => self.push(LocalGet(T1)),
            AmoOp::Add => self.extend([LocalGet(T0), LocalGet(T1), I64Add]),
            AmoOp::Xor => self.extend([LocalGet(T0), LocalGet(T1), I64Xor]),
            AmoOp::And => self.extend([LocalGet(T0), LocalGet(T1), I64And]),
            AmoOp::Or => self.extend([LocalGet(T0), LocalGet(T1), I64Or]),
            AmoOp::Min => self.extend(pick(I64LtS)),
            AmoOp::Max => self.extend(pick(I64GtS)),
            AmoOp::Minu => self.extend(pick(I64LtU)),
            AmoOp::Maxu => self.extend(pick(I64GtU)),
        }
    }

    // ---------------------------------------------------------------------
    // F / D extensions
    // ---------------------------------------------------------------------

    fn float(&mut self, inst: &Inst) {
        use Instruction::*;
        let (rd, rs1, rs2, rs3) = (inst.rd, inst.rs1, inst.rs2, inst.rs3);

        // Picks the f32 or f64 variant of an operation
        let by_fmt = |fmt: Fmt, s: Instruction<'static>, d: Instruction<'static>| match fmt {
            Fmt::S => s,
            Fmt::D => d,
        };

        match inst.op {
            Op::Flw | Op::Fld => {
                let (fmt, width, load) = if inst.op == Op::Flw {
                    (Fmt::S, 4, F32Load(self.guest(0)))
                } else {
                    (Fmt::D, 8, F64Load(self.guest(0)))
                };
                self.effective_addr(inst, width);
                self.set_f(rd, fmt, |e| {
                    e.guest_ptr();
                    e.push(load);
                });
            }
            Op::Fsw | Op::Fsd => {
                let (fmt, width, store) = if inst.op == Op::Fsw {
                    (Fmt::S, 4, F32Store(self.guest(0)))
                } else {
                    (Fmt::D, 8, F64Store(self.guest(0)))
                };
                self.effective_addr(inst, width);
                self.guest_ptr();
                self.get_f(rs2, fmt);
                self.push(store);
            }
            Op::FAdd(fmt) | Op::FSub(fmt) | Op::FMul(fmt) | Op::FDiv(fmt) | Op::FMin(fmt)
            | Op::FMax(fmt) => {
                let op = match inst.op {
                    Op::FAdd(_) => by_fmt(fmt, F32Add, F64Add),
                    Op::FSub(_) => by_fmt(fmt, F32Sub, F64Sub),
                    Op::FMul(_) => by_fmt(fmt, F32Mul, F64Mul),
                    Op::FDiv(_) => by_fmt(fmt, F32Div, F64Div),
                    Op::FMin(_) => by_fmt(fmt, F32Min, F64Min),
                    _ => by_fmt(fmt, F32Max, F64Max),
                };
                self.set_f(rd, fmt, |e| {
                    e.get_f(rs1, fmt);
                    e.get_f(rs2, fmt);
                    e.push(op);
                });
            }
            Op::FSqrt(fmt) => self.set_f(rd, fmt, |e| {
                e.get_f(rs1, fmt);
                e.push(by_fmt(fmt, F32Sqrt, F64Sqrt));
            }),
            // Fused forms are computed as a rounded multiply then add
            Op::FMadd(fmt) | Op::FMsub(fmt) | Op::FNmsub(fmt) | Op::FNmadd(fmt) => {
                let negate_product = matches!(inst.op, Op::FNmsub(_) | Op::FNmadd(_));
                let combine = match inst.op {
                    Op::FMadd(_) | Op::FNmsub(_) => by_fmt(fmt, F32Add, F64Add),
                    _ => by_fmt(fmt, F32Sub, F64Sub),
                };
                self.set_f(rd, fmt, |e| {
                    e.get_f(rs1, fmt);
                    e.get_f(rs2, fmt);
                    e.push(by_fmt(fmt, F32Mul, F64Mul));
                    if negate_product {
                        e.push(by_fmt(fmt, F32Neg, F64Neg));
                    }
                    e.get_f(rs3, fmt);
                    e.push(combine);
                });
            }
            Op::FSgnj(fmt) => self.set_f(rd, fmt, |e| {
                e.get_f(rs1, fmt);
                e.get_f(rs2, fmt);
                e.push(by_fmt(fmt, F32Copysign, F64Copysign));
            }),
            Op::FSgnjn(fmt) => self.set_f(rd, fmt, |e| {
                e.get_f(rs1, fmt);
                e.get_f(rs2, fmt);
                e.push(by_fmt(fmt, F32Neg, F64Neg));
                e.push(by_fmt(fmt, F32Copysign, F64Copysign));
            }),
            Op::FSgnjx(fmt) => self.set_f(rd, fmt, |e| match fmt {
                Fmt::S => {
                    e.get_f(rs1, fmt);
                    e.push(I32ReinterpretF32);
                    e.get_f(rs2, fmt);
                    e.extend([
                        I32ReinterpretF32,
                        I32Const(i32::MIN),
                        I32And,
                        I32Xor,
                        F32ReinterpretI32,
                    ]);
                }
                Fmt::D => {
                    e.get_f(rs1, fmt);
                    e.push(I64ReinterpretF64);
                    e.get_f(rs2, fmt);
                    e.extend([
                        I64ReinterpretF64,
                        I64Const(i64::MIN),
                        I64And,
                        I64Xor,
                        F64ReinterpretI64,
                    ]);
                }
            }),
            Op::FEq(fmt) | Op::FLt(fmt) | Op::FLe(fmt) => {
                let cmp = match inst.op {
                    Op::FEq(_) => by_fmt(fmt, F32Eq, F64Eq),
                    Op::FLt(_) => by_fmt(fmt, F32Lt, F64Lt),
                    _ => by_fmt(fmt, F32Le, F64Le),
                };
                self.set_x(rd, |e| {
                    e.get_f(rs1, fmt);
                    e.get_f(rs2, fmt);
                    e.push(cmp);
                    e.bool_to_i64();
                });
            }
            Op::FClass(fmt) => {
                if rd != 0 {
                    self.fclass(rd, rs1, fmt);
                }
            }
            // Round per rm, then saturate; NaN converts to the largest value
            Op::FCvtToInt { from, to, rm } => {
                let (convert, nan_value) = match to {
                    IntFmt::W => (I32TruncSatF64S, i32::MAX as i64),
                    IntFmt::Wu => (I32TruncSatF64U, -1),
                    IntFmt::L => (I64TruncSatF64S, i64::MAX),
                    IntFmt::Lu => (I64TruncSatF64U, -1),
                };
                self.set_x(rd, |e| {
                    e.push(I64Const(nan_value));
                    e.get_f(rs1, from);
                    if from == Fmt::S {
                        e.push(F64PromoteF32);
                    }
                    e.push(LocalSet(FV));
                    e.round(rm);
                    e.push(convert);
                    if matches!(to, IntFmt::W | IntFmt::Wu) {
                        e.push(I64ExtendI32S);
                    }
                    e.extend([LocalGet(FV), LocalGet(FV), F64Ne, Select]);
                });
            }
            Op::FCvtFromInt { from, to } => {
                let op = match (from, to) {
                    (IntFmt::W, Fmt::S) => F32ConvertI32S,
                    (IntFmt::Wu, Fmt::S) => F32ConvertI32U,
                    (IntFmt::L, Fmt::S) => F32ConvertI64S,
                    (IntFmt::Lu, Fmt::S) => F32ConvertI64U,
                    (IntFmt::W, Fmt::D) => F64ConvertI32S,
                    (IntFmt::Wu, Fmt::D) => F64ConvertI32U,
                    (IntFmt::L, Fmt::D) => F64ConvertI64S,
                    (IntFmt::Lu, Fmt::D) => F64ConvertI64U,
                };
                self.set_f(rd, to, |e| {
                    e.get_x(rs1);
                    if matches!(from, IntFmt::W | IntFmt::Wu) {
                        e.push(I32WrapI64);
                    }
                    e.push(op);
                });
            }
            Op::FCvtSD => self.set_f(rd, Fmt::S, |e| {
                e.get_f(rs1, Fmt::D);
                e.push(F32DemoteF64);
            }),
            Op::FCvtDS => self.set_f(rd, Fmt::D, |e| {
                e.get_f(rs1, Fmt::S);
                e.push(F64PromoteF32);
            }),
            Op::FMvXW => self.set_x(rd, |e| {
                e.extend([
                    LocalGet(M),
                    I64Load32S(memarg(layout::freg(rs1), 2)),
                ]);
            }),
            Op::FMvXD => self.set_x(rd, |e| {
                e.extend([LocalGet(M), I64Load(memarg(layout::freg(rs1), 3))]);
            }),
            Op::FMvWX => {
                self.push(LocalGet(M));
                self.get_x(rs1);
                self.extend([
                    I64Const(LOW32),
                    I64And,
                    I64Const(NAN_BOX),
                    I64Or,
                    I64Store(memarg(layout::freg(rd), 3)),
                ]);
            }
            Op::FMvDX => {
                self.push(LocalGet(M));
                self.get_x(rs1);
                self.push(I64Store(memarg(layout::freg(rd), 3)));
            }
            _ => {}
        }
    }

    /// x[rd] = 1 << class(f[rs1]), using T0..T3
    /// Push FV rounded to an integral f64
    fn round(&mut self, rm: RoundingMode) {
        use Instruction::*;
        match rm {
            RoundingMode::Rne => self.extend([LocalGet(FV), F64Nearest]),
            RoundingMode::Rtz => self.extend([LocalGet(FV), F64Trunc]),
            RoundingMode::Rdn => self.extend([LocalGet(FV), F64Floor]),
            RoundingMode::Rup => self.extend([LocalGet(FV), F64Ceil]),
            // trunc(x) plus one unit away from zero when the dropped part is >= 0.5
            RoundingMode::Rmm => self.extend([
                LocalGet(FV),
                F64Trunc,
                F64Const(1.0),
                F64Const(0.0),
                LocalGet(FV),
                LocalGet(FV),
                F64Trunc,
                F64Sub,
                F64Abs,
                F64Const(0.5),
                F64Ge,
                Select,
                LocalGet(FV),
                F64Copysign,
                F64Add,
            ]),
            // frm values 5..7 are reserved and round to nearest
            RoundingMode::Dyn => {
                let modes = [
                    (1, RoundingMode::Rtz),
                    (2, RoundingMode::Rdn),
                    (3, RoundingMode::Rup),
                    (4, RoundingMode::Rmm),
                ];
                for (frm, mode) in modes {
                    self.extend([
                        LocalGet(M),
                        I64Load(memarg(layout::FCSR_OFFSET as u64, 3)),
                        I64Const(5),
                        I64ShrU,
                        I64Const(7),
                        I64And,
                        I64Const(frm),
                        I64Eq,
                        If(BlockType::Result(ValType::F64)),
                    ]);
                    self.round(mode);
                    self.push(Else);
                }
                self.round(RoundingMode::Rne);
                for _ in modes {
                    self.push(End);
                }
            }
        }
    }

    fn fclass(&mut self, rd: u8, rs1: u8, fmt: Fmt) {
        use Instruction::*;
        let (sign_shift, exp_shift, exp_mask, frac_mask, quiet_shift) = match fmt {
            Fmt::S => (31, 23, 0xff, 0x7f_ffff, 22),
            Fmt::D => (63, 52, 0x7ff, (1i64 << 52) - 1, 51),
        };

        // T0 = raw bits
        self.push(LocalGet(M));
        match fmt {
            Fmt::S => self.push(I64Load32U(memarg(layout::freg(rs1), 2))),
            Fmt::D => self.push(I64Load(memarg(layout::freg(rs1), 3))),
        }
        self.extend([
            LocalTee(T0),
            I64Const(exp_shift),
            I64ShrU,
            I64Const(exp_mask),
            I64And,
            LocalSet(T1),
            LocalGet(T0),
            I64Const(frac_mask),
            I64And,
            LocalSet(T2),
            LocalGet(T0),
            I64Const(sign_shift),
            I64ShrU,
            I64Const(1),
            I64And,
            LocalSet(T3),
        ]);

        // Picks `neg` or `pos` by the sign bit
        let by_sign = |neg: i64, pos: i64| {
            [I64Const(neg), I64Const(pos), LocalGet(T3), I32WrapI64, Select]
        };

        self.set_x(rd, |e| {
            e.push(I64Const(1));
            // Infinity or NaN
            e.extend([
                LocalGet(T1),
                I64Const(exp_mask),
                I64Eq,
                If(BlockType::Result(ValType::I64)),
                LocalGet(T2),
                I64Eqz,
                If(BlockType::Result(ValType::I64)),
            ]);
            e.extend(by_sign(0, 7));
            e.extend([
                Else,
                I64Const(9),
                I64Const(8),
                LocalGet(T2),
                I64Const(quiet_shift),
                I64ShrU,
                I32WrapI64,
                Select,
                End,
                Else,
                // Zero or subnormal
                LocalGet(T1),
                I64Eqz,
                If(BlockType::Result(ValType::I64)),
                LocalGet(T2),
                I64Eqz,
                If(BlockType::Result(ValType::I64)),
            ]);
            e.extend(by_sign(3, 4));
            e.push(Else);
            e.extend(by_sign(2, 5));
            e.extend([End, Else]);
            e.extend(by_sign(1, 6));
            e.extend([End, End, I64Shl]);
        });
    }

    // ---------------------------------------------------------------------
    // Zicsr
    // ---------------------------------------------------------------------

    fn csr(&mut self, inst: &Inst) -> Flow {
        let immediate = matches!(inst.op, Op::Csrrwi | Op::Csrrsi | Op::Csrrci);
        let writes = match inst.op {
            Op::Csrrw | Op::Csrrwi => true,
            _ => inst.rs1 != 0,
        };

        let (shift, mask) = match inst.imm {
            CSR_FFLAGS => (0, 0x1f),
            CSR_FRM => (5, 0x7),
            CSR_FCSR => (0, 0xff),
            CSR_CYCLE..=CSR_INSTRET if !writes => {
                self.set_x(inst.rd, |e| e.push(Instruction::I64Const(0)));
                return Flow::Next;
            }
            _ => {
                self.exit(status::ILLEGAL_INSTRUCTION, inst.addr);
                return Flow::Exited;
            }
        };
        let fcsr = || memarg(layout::FCSR_OFFSET as u64, 3);

        // T0 = old field value
        self.extend([
            Instruction::LocalGet(M),
            Instruction::I64Load(fcsr()),
            Instruction::I64Const(shift),
            Instruction::I64ShrU,
            Instruction::I64Const(mask),
            Instruction::I64And,
            Instruction::LocalSet(T0),
        ]);

        if writes {
            // T1 = new field value
            if immediate {
                self.push(Instruction::I64Const(inst.rs1 as i64));
            } else {
                self.get_x(inst.rs1);
            }
            match inst.op {
                Op::Csrrs | Op::Csrrsi => {
                    self.extend([Instruction::LocalGet(T0), Instruction::I64Or]);
                }
                Op::Csrrc | Op::Csrrci => {
                    self.extend([
                        Instruction::I64Const(-1),
                        Instruction::I64Xor,
                        Instruction::LocalGet(T0),
                        Instruction::I64And,
                    ]);
                }
                _ => {}
            }
            self.extend([
                Instruction::LocalSet(T1),
                Instruction::LocalGet(M),
                Instruction::LocalGet(M),
                Instruction::I64Load(fcsr()),
                Instruction::I64Const(!(mask << shift)),
                Instruction::I64And,
                Instruction::LocalGet(T1),
                Instruction::I64Const(mask),
                Instruction::I64And,
                Instruction::I64Const(shift),
                Instruction::I64Shl,
                Instruction::I64Or,
                Instruction::I64Store(fcsr()),
            ]);
        }

        self.set_x(inst.rd, |e| e.push(Instruction::LocalGet(T0)));
        Flow::Next
    }
}
