/// Outcome of executing a single instruction.
pub enum StepResult {
    /// Keep executing instructions in the current burst.
    Continue,
    /// A sprite was drawn; let the host render before the next instruction
    /// so the display update rate tracks the frame rate.
    WaitForNextFrame,
    /// Execution is stalled on the key-wait instruction (Fx0A) until a key
    /// press latches a value. The program counter does not move while this
    /// is being returned.
    WaitingForKey,
}

/// Error types that can occur while loading or running a program.
#[derive(Debug, thiserror::Error)]
pub enum Chip8Error {
    #[error("program is too large ({size} bytes), max size is {max_size} bytes")]
    ProgramTooLarge { size: usize, max_size: usize },

    #[error("memory access out of bounds at address {address:#05X}")]
    OutOfBounds { address: u16 },

    #[error("stack underflow: attempted to return with an empty call stack")]
    StackUnderflow,

    #[error("stack overflow: call depth exceeds the {capacity} frame capacity")]
    StackOverflow { capacity: usize },
}

pub const DISPLAY_X: usize = 64;
pub const DISPLAY_Y: usize = 32;
/// A type alias for the 64x32 display buffer representation.
pub type Display<T> = [[T; DISPLAY_X]; DISPLAY_Y];
