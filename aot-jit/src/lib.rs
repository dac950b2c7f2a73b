// rv2wasm-jit: Runtime RISC-V to WebAssembly compiler
//
// This crate wraps the rv2wasm AOT compiler for use inside a WebAssembly
// environment. It compiles to wasm32-unknown-unknown via wasm-bindgen, so a
// browser host can compile RISC-V code regions to Wasm at runtime.

use rv2wasm::{CompileOptions, LoadedImage};
use wasm_bindgen::prelude::*;

/// Compile a region of RISC-V machine code to a WebAssembly module.
///
/// Takes raw RISC-V bytes and their virtual address, which is also the entry
/// point. The returned module has the same contract as an AOT-compiled one:
/// it imports `env.memory` and `env.syscall` and exports `run`.
#[wasm_bindgen]
pub fn compile_region(code: &[u8], base_addr: u32) -> Result<Vec<u8>, JsValue> {
    compile_region_inner(code, base_addr).map_err(|e| JsValue::from_str(&describe(&e)))
}

/// Compile errors carry their cause in their own message, so only the
/// outermost error is reported
fn describe(err: &anyhow::Error) -> String {
    err.to_string()
}

fn compile_region_inner(code: &[u8], base_addr: u32) -> anyhow::Result<Vec<u8>> {
    if code.is_empty() {
        anyhow::bail!("empty code region at 0x{:08x}", base_addr);
    }
    let image = LoadedImage::from_raw(code, base_addr as u64)
        .map_err(rv2wasm::CompileError::from)?;

    // The region must fit in the guest RAM window alongside its base address
    let options = CompileOptions {
        ram_size: CompileOptions::default()
            .ram_size
            .max(base_addr as u64 + code.len() as u64),
        ..CompileOptions::default()
    };
    Ok(rv2wasm::compile_image(&image, &options)?)
}

/// Get version string
#[wasm_bindgen]
pub fn version() -> String {
    format!("rv2wasm-jit {}", env!("CARGO_PKG_VERSION"))
}
