// wasm_builder.rs - Wasm binary generation
//
// Assembles the translated blocks, the dispatch loop and the data segments
// into a module with wasm-encoder, then validates it with wasmparser.
//
// Function index space:
//   0        env.syscall  (param i64 pc) (result i64 resume_pc)
//   1        run          (param i64 start_pc) (result i32 termination)
//   2..      one function per block, ascending address order

use crate::dispatch::DispatchTable;
use crate::elf::LoadedImage;
use crate::error::EncodeError;
use crate::layout::{self, status, termination, MemoryLayout};
use crate::translate::BlockFunction;
use std::borrow::Cow;
use tracing::debug;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction, MemArg,
    MemorySection, MemoryType, Module, NameMap, NameSection, TypeSection, ValType,
};

const BLOCK_TYPE: u32 = 0;
const RUN_TYPE: u32 = 1;
const SYSCALL_TYPE: u32 = 2;

/// Where the module's linear memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    /// Imported as `env.memory`
    #[default]
    Import,
    /// Defined by the module and exported as `memory`
    Export,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Emit a name section and export every block function
    pub debug: bool,
    pub memory: MemoryMode,
}

/// Build the final Wasm binary
pub fn build(
    image: &LoadedImage,
    table: &DispatchTable,
    layout: &MemoryLayout,
    functions: &[BlockFunction],
    options: &BuildOptions,
) -> Result<Vec<u8>, EncodeError> {
    let mut wasm = Module::new();
    let memory_type = MemoryType {
        minimum: layout.memory_pages(),
        maximum: None,
        memory64: false,
        shared: false,
    };

    let mut types = TypeSection::new();
    types.function(vec![ValType::I32], vec![ValType::I32]);
    types.function(vec![ValType::I64], vec![ValType::I32]);
    types.function(vec![ValType::I64], vec![ValType::I64]);
    wasm.section(&types);

    let mut imports = ImportSection::new();
    if options.memory == MemoryMode::Import {
        imports.import(layout::IMPORT_MODULE, layout::IMPORT_MEMORY, memory_type);
    }
    imports.import(
        layout::IMPORT_MODULE,
        layout::IMPORT_SYSCALL,
        EntityType::Function(SYSCALL_TYPE),
    );
    wasm.section(&imports);

    let mut func_section = FunctionSection::new();
    func_section.function(RUN_TYPE);
    for _ in functions {
        func_section.function(BLOCK_TYPE);
    }
    wasm.section(&func_section);

    if options.memory == MemoryMode::Export {
        let mut memories = MemorySection::new();
        memories.memory(memory_type);
        wasm.section(&memories);
    }

    let mut globals = GlobalSection::new();
    let immutable = |val_type| GlobalType {
        val_type,
        mutable: false,
    };
    globals.global(immutable(ValType::I64), &ConstExpr::i64_const(image.entry as i64));
    globals.global(
        immutable(ValType::I32),
        &ConstExpr::i32_const(layout.ram_base as i32),
    );
    globals.global(
        immutable(ValType::I64),
        &ConstExpr::i64_const(layout.ram_size as i64),
    );
    wasm.section(&globals);

    let mut exports = ExportSection::new();
    exports.export(layout::EXPORT_RUN, ExportKind::Func, layout::RUN_FUNC);
    if options.memory == MemoryMode::Export {
        exports.export(layout::EXPORT_MEMORY, ExportKind::Memory, 0);
    }
    exports.export(layout::EXPORT_ENTRY, ExportKind::Global, 0);
    exports.export(layout::EXPORT_RAM_BASE, ExportKind::Global, 1);
    exports.export(layout::EXPORT_RAM_SIZE, ExportKind::Global, 2);
    if options.debug {
        for (idx, func) in functions.iter().enumerate() {
            exports.export(
                &func.name(),
                ExportKind::Func,
                layout::FIRST_BLOCK_FUNC + idx as u32,
            );
        }
    }
    wasm.section(&exports);

    let mut codes = CodeSection::new();
    codes.function(&build_run_function(table, functions.len() as u32));
    for func in functions {
        let mut wasm_func = Function::new(func.locals.iter().copied());
        for inst in &func.body {
            wasm_func.instruction(inst);
        }
        codes.function(&wasm_func);
    }
    wasm.section(&codes);

    let mut data = DataSection::new();
    data.active(
        0,
        &ConstExpr::i32_const(layout::DISPATCH_TABLE_OFFSET as i32),
        table.to_bytes(),
    );
    for seg in image.segments.iter().filter(|seg| !seg.data.is_empty()) {
        data.active(
            0,
            &ConstExpr::i32_const((layout.ram_base + seg.vaddr) as i32),
            seg.data.iter().copied(),
        );
    }
    wasm.section(&data);

    if options.debug {
        let mut names = NameMap::new();
        names.append(layout::SYSCALL_FUNC, layout::IMPORT_SYSCALL);
        names.append(layout::RUN_FUNC, layout::EXPORT_RUN);
        for (idx, func) in functions.iter().enumerate() {
            names.append(layout::FIRST_BLOCK_FUNC + idx as u32, &func.name());
        }
        let mut name_section = NameSection::new();
        name_section.functions(&names);
        wasm.section(&name_section);
    }

    let bytes = wasm.finish();
    wasmparser::Validator::new()
        .validate_all(&bytes)
        .map_err(|err| EncodeError::Invalid(err.to_string()))?;

    debug!(
        bytes = bytes.len(),
        functions = functions.len() + 2,
        pages = layout.memory_pages(),
        "emitted module"
    );
    Ok(bytes)
}

/// The dispatch loop. Reads pc from the register file, maps it through the
/// dispatch table and branches to the block with a single br_table.
fn build_run_function(table: &DispatchTable, block_count: u32) -> Function {
    use Instruction::*;

    const START: u32 = 0;
    const PC: u32 = 1;
    const IDX: u32 = 2;
    const STATUS: u32 = 3;

    let pc_slot = MemArg {
        offset: layout::PC_OFFSET as u64,
        align: 3,
        memory_index: 0,
    };
    let table_arg = |align| MemArg {
        offset: layout::DISPATCH_TABLE_OFFSET as u64,
        align,
        memory_index: 0,
    };

    let mut func = Function::new(vec![(2, ValType::I64), (1, ValType::I32)]);
    let mut emit = |inst: Instruction<'_>| {
        func.instruction(&inst);
    };

    emit(I32Const(0));
    emit(LocalGet(START));
    emit(I64Store(pc_slot));

    emit(Loop(BlockType::Empty));

    // idx = pc - min; reject pcs outside the table or odd
    emit(I32Const(0));
    emit(I64Load(pc_slot));
    emit(I64Const(table.min_addr as i64));
    emit(I64Sub);
    emit(LocalTee(IDX));
    emit(I64Const(table.span() as i64));
    emit(I64GeU);
    emit(LocalGet(IDX));
    emit(I32WrapI64);
    emit(I32Const(1));
    emit(I32And);
    emit(I32Or);
    emit(If(BlockType::Empty));
    emit(I32Const(termination::BAD_JUMP));
    emit(Return);
    emit(End);

    emit(Block(BlockType::Empty)); // $handle
    emit(Block(BlockType::Empty)); // $bad
    for _ in 0..block_count {
        emit(Block(BlockType::Empty));
    }

    // Entry for granule idx / 2
    emit(LocalGet(IDX));
    match table.width {
        1 => {
            emit(I64Const(1));
            emit(I64ShrU);
            emit(I32WrapI64);
            emit(I32Load8U(table_arg(0)));
        }
        2 => {
            emit(I32WrapI64);
            emit(I32Load16U(table_arg(1)));
        }
        _ => {
            emit(I64Const(1));
            emit(I64Shl);
            emit(I32WrapI64);
            emit(I32Load(table_arg(2)));
        }
    }
    let targets: Vec<u32> = (0..block_count).collect();
    emit(BrTable(Cow::Owned(targets), block_count));

    for id in 0..block_count {
        emit(End);
        emit(I32Const(0));
        emit(Call(layout::FIRST_BLOCK_FUNC + id));
        emit(LocalSet(STATUS));
        emit(Br(block_count - id));
    }

    emit(End); // $bad
    emit(I32Const(termination::BAD_JUMP));
    emit(Return);
    emit(End); // $handle

    emit(LocalGet(STATUS));
    emit(I32Eqz);
    emit(BrIf(0));

    // Syscall: the trampoline returns the resume pc, negative to exit
    emit(LocalGet(STATUS));
    emit(I32Const(status::SYSCALL));
    emit(I32Eq);
    emit(If(BlockType::Empty));
    emit(I32Const(0));
    emit(I64Load(pc_slot));
    emit(Call(layout::SYSCALL_FUNC));
    emit(LocalTee(PC));
    emit(I64Const(0));
    emit(I64LtS);
    emit(If(BlockType::Empty));
    emit(I32Const(termination::EXITED));
    emit(Return);
    emit(End);
    emit(I32Const(0));
    emit(LocalGet(PC));
    emit(I64Store(pc_slot));
    emit(Br(1));
    emit(End);

    // Halt, illegal instruction and memory fault map to the same code
    emit(LocalGet(STATUS));
    emit(Return);
    emit(End); // loop

    emit(Unreachable);
    emit(End);
    func
}
