//! The x64 backend: storage catalog, register allocator, code stream and the
//! per-opcode emit loop.

pub mod asm;
mod emit;
pub mod jitstate;
pub mod reg_alloc;
pub mod regs;

pub use emit::{compile_block, emit_block, CompiledBlock, EmitConfig, MemoryCallbacks};
