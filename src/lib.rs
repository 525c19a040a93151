pub mod chip8;
pub mod debugger;
mod nibble;

pub use nibble::u4;
