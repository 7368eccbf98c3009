//! Intermediate representation for the Basil compiler
//!
//! The front end produces an [`IrProgram`]: an ordered list of typed,
//! three-address IR sections plus the pools naming them and holding their
//! constant data.  Back ends consume the program by matching textual
//! lowering rules against each section's instruction stream.

pub mod ir;
pub mod pools;
pub mod rules;

pub use ir::*;
pub use pools::*;
pub use rules::*;
