//! Backend core of a dynamic binary translator.
//!
//! The frontend (a guest-ISA decoder, not part of this crate) produces an [ir::Block]
//! of SSA instructions with exact use counts. From there the pipeline is:
//!
//! 1. [opt::constant_propagation] rewrites instructions whose results are statically
//!    known or that collapse under the guest's algebraic identities, and
//!    [opt::dead_code_elimination] reaps what that leaves behind.
//! 2. The x64 emit loop walks the block, using the block-local, use-count-driven
//!    register allocator ([x64::reg_alloc::RegAlloc]) to place every operand and
//!    result in a host register or spill slot, and pushes host operations into an
//!    [x64::asm::CodeStream].
//! 3. The code stream is encoded into an executable buffer; the resulting
//!    [x64::CompiledBlock] is an `extern "C" fn(*mut JitState)` the dispatcher can
//!    call.
//!
//! Compilation is strictly one block at a time with no shared mutable state: if a
//! host embeds several compilation threads, each owns its own allocator, block and
//! code stream.
//!
//! Contract violations (malformed IR, impossible allocator requests) are programming
//! errors and panic; [CompilationError] covers the failures a correct caller can
//! still encounter at the boundary to the operating system and encoder.

pub mod ir;
pub mod log;
pub mod opt;
pub mod x64;

use std::fmt;

pub use x64::{compile_block, CompiledBlock, EmitConfig, MemoryCallbacks};

#[derive(Debug)]
pub enum CompilationError {
    /// An internal invariant broke late enough that we can report it instead of
    /// panicking mid-emission.
    InternalError(String),
    /// The operating system refused us a resource (e.g. executable memory).
    ResourceExhausted(String),
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationError::InternalError(s) => write!(f, "internal error: {s}"),
            CompilationError::ResourceExhausted(s) => write!(f, "resource exhausted: {s}"),
        }
    }
}

impl std::error::Error for CompilationError {}
