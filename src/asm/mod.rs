//! External helpers around the core: the octal listing loader and the
//! disassembler.

pub mod loader;
pub mod disasm;

pub use loader::{load_oct, load_oct_from, LoadError};
pub use disasm::{disassemble, LONG_NAMES, SHORT_NAMES};
