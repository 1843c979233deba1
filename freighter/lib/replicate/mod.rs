//! Tree replication and the replication service façade.

mod service;
mod tree;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use service::*;
pub use tree::*;
