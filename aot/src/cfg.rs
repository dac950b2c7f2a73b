// cfg.rs - Control Flow Graph builder
//
// Discovers basic blocks from the entry point with a work-list, splitting
// existing blocks when a later target lands inside them, and groups blocks
// under call targets for reporting.

use crate::disasm::{Decoder, Instruction, Op, OpClass};
use crate::error::CfgError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Upper bound on the number of blocks in one module
pub const MAX_BLOCKS: usize = 999_998;

/// How control leaves a basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Runs into the block starting at `next`
    Fallthrough { next: u64 },
    Branch { target: u64, fallthrough: u64 },
    Jump { target: u64 },
    /// `jal` through x1/x5. The return address re-enters via dispatch.
    Call { target: u64, return_addr: u64 },
    /// `jalr`, resolved at runtime through the dispatch table
    IndirectJump,
    /// `ecall`; the host resumes at whatever the trampoline returns
    Syscall { next: u64 },
    /// `ebreak`
    Halt,
    /// Illegal or unsupported instruction
    Trap,
}

impl Terminator {
    /// Statically known successor addresses
    pub fn successors(&self) -> Vec<u64> {
        match *self {
            Terminator::Fallthrough { next } => vec![next],
            Terminator::Branch {
                target,
                fallthrough,
            } => vec![target, fallthrough],
            Terminator::Jump { target } | Terminator::Call { target, .. } => vec![target],
            Terminator::IndirectJump
            | Terminator::Syscall { .. }
            | Terminator::Halt
            | Terminator::Trap => Vec::new(),
        }
    }
}

/// A basic block of instructions
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u64,
    /// Address just past the last instruction
    pub end: u64,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Is this block a `ret` (jalr x0, 0(ra))?
    pub fn is_return(&self) -> bool {
        self.instructions
            .last()
            .is_some_and(|inst| inst.op == Op::Jalr && inst.rd == 0 && inst.rs1 == 1)
    }
}

/// A call target and the blocks reachable from it without entering another
#[derive(Debug, Clone)]
pub struct Function {
    pub entry: u64,
    pub name: String,
    pub blocks: Vec<u64>,
}

/// Control flow graph
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub entry: u64,
    /// Basic blocks by start address
    pub blocks: BTreeMap<u64, BasicBlock>,
    /// Number of times an existing block was split
    pub splits: usize,
    /// Block starts in address order, fixed once discovery is done
    starts: Vec<u64>,
}

impl ControlFlowGraph {
    /// Identifier of the block starting at `addr`: its rank by address
    pub fn block_id(&self, addr: u64) -> Option<u32> {
        self.starts.binary_search(&addr).ok().map(|id| id as u32)
    }

    /// `(start, id)` for every block, in address order
    pub fn block_ids(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.starts
            .iter()
            .enumerate()
            .map(|(id, &start)| (start, id as u32))
    }

    pub fn block_containing(&self, addr: u64) -> Option<&BasicBlock> {
        self.blocks
            .range(..=addr)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.contains(addr))
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    /// Group blocks under the entry point and every call target
    pub fn functions(&self) -> Vec<Function> {
        let mut call_targets = BTreeSet::from([self.entry]);
        for block in self.blocks.values() {
            if let Terminator::Call { target, .. } = block.terminator {
                if self.blocks.contains_key(&target) {
                    call_targets.insert(target);
                }
            }
        }

        let mut seen = BTreeSet::new();
        let mut functions = Vec::new();
        for &entry in &call_targets {
            if seen.contains(&entry) {
                continue;
            }

            let mut blocks = Vec::new();
            let mut worklist = vec![entry];
            while let Some(addr) = worklist.pop() {
                if !seen.insert(addr) {
                    continue;
                }
                let Some(block) = self.blocks.get(&addr) else {
                    continue;
                };
                blocks.push(addr);

                let mut next = block.terminator.successors();
                match block.terminator {
                    Terminator::Call { target, return_addr } => {
                        next.retain(|&succ| succ != target);
                        next.push(return_addr);
                    }
                    Terminator::Syscall { next: resume } => next.push(resume),
                    _ => {}
                }
                worklist.extend(
                    next.into_iter()
                        .filter(|succ| *succ == entry || !call_targets.contains(succ)),
                );
            }

            blocks.sort_unstable();
            functions.push(Function {
                entry,
                name: format!("func_{:x}", entry),
                blocks,
            });
        }

        functions
    }

    /// Split the block containing `at` so that `at` starts a new block.
    /// Returns false when `at` is not an instruction boundary.
    fn split(&mut self, block_start: u64, at: u64) -> bool {
        let Some(block) = self.blocks.get_mut(&block_start) else {
            return false;
        };
        let Some(idx) = block.instructions.iter().position(|inst| inst.addr == at) else {
            return false;
        };

        let tail = BasicBlock {
            start: at,
            end: block.end,
            instructions: block.instructions.split_off(idx),
            terminator: block.terminator,
        };
        block.end = at;
        block.terminator = Terminator::Fallthrough { next: at };

        trace!(
            block = format_args!("0x{:x}", block_start),
            at = format_args!("0x{:x}", at),
            "split block"
        );
        self.blocks.insert(at, tail);
        self.splits += 1;
        true
    }
}

/// Build the control flow graph reachable from `entry`
pub fn build(decoder: &Decoder<'_>, entry: u64) -> Result<ControlFlowGraph, CfgError> {
    decoder.decode_at(entry)?;

    let mut cfg = ControlFlowGraph {
        entry,
        blocks: BTreeMap::new(),
        splits: 0,
        starts: Vec::new(),
    };
    let mut pending = BTreeSet::from([entry]);

    while let Some(start) = pending.pop_first() {
        if cfg.blocks.contains_key(&start) {
            continue;
        }

        if let Some(containing) = cfg.block_containing(start).map(|b| b.start) {
            if !cfg.split(containing, start) {
                trace!(
                    addr = format_args!("0x{:x}", start),
                    "target inside an instruction, ignored"
                );
            }
        } else if let Some(block) = walk_block(decoder, &cfg, &mut pending, start) {
            trace!(
                start = format_args!("0x{:x}", block.start),
                end = format_args!("0x{:x}", block.end),
                terminator = ?block.terminator,
                "discovered block"
            );
            cfg.blocks.insert(start, block);
        }

        if cfg.blocks.len() > MAX_BLOCKS {
            return Err(CfgError::TooManyBlocks {
                count: cfg.blocks.len(),
                limit: MAX_BLOCKS,
            });
        }
    }

    cfg.starts = cfg.blocks.keys().copied().collect();

    debug!(
        blocks = cfg.blocks.len(),
        instructions = cfg.instruction_count(),
        splits = cfg.splits,
        "built control flow graph"
    );
    Ok(cfg)
}

/// Decode forward from `start` until the block ends, queueing every address
/// the block makes reachable. Returns None if `start` cannot be decoded.
fn walk_block(
    decoder: &Decoder<'_>,
    cfg: &ControlFlowGraph,
    pending: &mut BTreeSet<u64>,
    start: u64,
) -> Option<BasicBlock> {
    let mut inst = match decoder.decode_at(start) {
        Ok(inst) => inst,
        Err(err) => {
            trace!(addr = format_args!("0x{:x}", start), %err, "undecodable target skipped");
            return None;
        }
    };
    let mut instructions = Vec::new();

    let terminator = loop {
        let next = inst.next_addr();
        if inst.op.is_terminator() {
            let terminator = classify(&inst);
            match terminator {
                Terminator::Branch {
                    target,
                    fallthrough,
                } => {
                    pending.insert(target);
                    pending.insert(fallthrough);
                }
                Terminator::Jump { target } => {
                    pending.insert(target);
                }
                Terminator::Call {
                    target,
                    return_addr,
                } => {
                    pending.insert(target);
                    pending.insert(return_addr);
                }
                Terminator::Syscall { next } => {
                    pending.insert(next);
                }
                Terminator::IndirectJump if inst.rd != 0 => {
                    pending.insert(next);
                }
                _ => {}
            }
            instructions.push(inst);
            break terminator;
        }

        instructions.push(inst);
        if cfg.blocks.contains_key(&next) || pending.contains(&next) {
            break Terminator::Fallthrough { next };
        }
        inst = match decoder.decode_at(next) {
            Ok(inst) => inst,
            // Runs off the end of code; dispatch reports it at runtime
            Err(_) => break Terminator::Fallthrough { next },
        };
    };

    let end = instructions.last().map_or(start, Instruction::next_addr);
    Some(BasicBlock {
        start,
        end,
        instructions,
        terminator,
    })
}

fn classify(inst: &Instruction) -> Terminator {
    let next = inst.next_addr();
    match inst.op.class() {
        OpClass::Branch => Terminator::Branch {
            target: inst.target(),
            fallthrough: next,
        },
        OpClass::Jump if inst.rd == 1 || inst.rd == 5 => Terminator::Call {
            target: inst.target(),
            return_addr: next,
        },
        OpClass::Jump => Terminator::Jump {
            target: inst.target(),
        },
        OpClass::IndirectJump => Terminator::IndirectJump,
        OpClass::Syscall => Terminator::Syscall { next },
        OpClass::Halt => Terminator::Halt,
        _ => Terminator::Trap,
    }
}
