//! CPU emulation for the MESM-6.
//!
//! - [`decode`]: the 24-bit instruction formats and the opcode space
//! - [`alu`]: floating-point, logical, shift and count kernels
//! - [`execute`]: the fetch/decode/execute state machine

pub mod decode;
pub mod alu;
pub mod execute;

pub use decode::{emit_op, op, EmitError, Instr};
pub use alu::negate;
pub use execute::{Cpu, CpuState, StopCode};
