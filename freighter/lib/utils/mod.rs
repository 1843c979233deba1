//! Utility functions and types.

mod digest;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use path::*;
