//! Wiremux surface types.
//!
//! The single source of truth for the types that cross the public boundary
//! of the connection layer: message opcodes, connection roles, and the
//! control-frame delivery policy.

pub mod opcode;
pub mod role;

pub use opcode::{ControlPolicy, Opcode};
pub use role::Role;
