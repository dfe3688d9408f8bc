//! Guest physical memory and the architectural register file.
//!
//! Memory is a fixed-size, byte-addressable little-endian array sized at machine construction.
//! Accesses that fall (even partially) outside of it fail with [`MemoryFault`]; the CPU turns
//! those into simulated exceptions.

mod memory;
mod registers;

pub use memory::{AccessWidth, GuestMemory, MemoryFault, RomRange, PAGE_SIZE};
pub use registers::{Eflags, Gpr, RegisterFile};
