//! Block-local optimisation passes.
//!
//! All passes mutate the block in place and run to completion synchronously. The
//! expected order is [constant_propagation] then [dead_code_elimination];
//! [verify_block] can be run after any pass (and is, in debug builds).

mod const_prop;
mod dce;
mod verify;

pub use const_prop::constant_propagation;
pub use dce::dead_code_elimination;
pub use verify::verify_block;
