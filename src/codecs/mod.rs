//! Built-in wire formats.

pub mod binary;
pub mod keyvalues2;
