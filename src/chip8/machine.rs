use rand::{SeedableRng, rngs::StdRng};

use super::{
    Chip8Error, DISPLAY_X, DISPLAY_Y, Display, FONT, FONT_END_ADDRESS, FONT_START_ADDRESS, Opcode,
    StepResult,
};
use crate::u4;

// The memory layout is fixed by the original hardware
pub const ROM_START_ADDRESS: usize = 0x200;
pub const MEMORY_SIZE: usize = 4096;

/// Call depth limit. The original interpreter let the stack grow into
/// neighboring memory; here overflowing it is a reported error.
pub(crate) const STACK_CAPACITY: usize = 16;

/// CHIP-8 virtual machine state.
///
/// Owns every entity of the machine: memory, registers, call stack,
/// framebuffer, timers, keypad and the random source. All of it is created
/// and torn down together by [`Chip8::reset`]; nothing outlives a reset.
pub struct Chip8 {
    /// 4KB memory array, font at the bottom, program from 0x200
    pub(crate) memory: [u8; MEMORY_SIZE],
    /// Display buffer: 64x32 monochrome pixels
    pub(crate) display: Display<bool>,

    /// Program counter: address of the next instruction to execute
    pub(crate) pc: u16,
    /// Index register: used for memory operations
    pub(crate) i: u16,
    /// General-purpose registers V0-VF (VF doubles as the flag register)
    pub(crate) v: [u8; 16],
    /// Call stack, capped at `STACK_CAPACITY` return addresses
    pub(crate) stack: Vec<u16>,

    /// Delay timer: decrements at 60Hz until it reaches 0
    pub(crate) delay_timer: u8,
    /// Sound timer: decrements at 60Hz, the host beeps while non-zero
    pub(crate) sound_timer: u8,

    /// Keypad state: 16 keys mapped as booleans (true = pressed)
    pub(crate) keypad: [bool; 16],
    /// One-slot latch holding the most recently pressed key. Overwritten
    /// by every press, consumed exactly once by the key-wait instruction.
    pub(crate) last_key: Option<u8>,
    /// Register waiting to receive a key while execution is stalled on Fx0A
    pub(crate) waiting_for_key: Option<u4>,

    /// Random source for Cxnn, reseeded on every reset
    pub(crate) rng: StdRng,
}

impl Chip8 {
    pub fn new() -> Self {
        let mut chip8 = Chip8 {
            memory: [0; MEMORY_SIZE],
            display: [[false; DISPLAY_X]; DISPLAY_Y],
            pc: 0,
            i: 0,
            v: [0; 16],
            stack: Vec::with_capacity(STACK_CAPACITY),
            delay_timer: 0,
            sound_timer: 0,
            keypad: [false; 16],
            last_key: None,
            waiting_for_key: None,
            rng: StdRng::from_os_rng(),
        };

        chip8.reset();
        chip8
    }

    /// Resets the whole machine atomically: memory cleared, font rewritten,
    /// registers and timers zeroed, stack/display/keypad cleared, PC set to
    /// the program start, random source reseeded.
    pub fn reset(&mut self) {
        self.memory = [0; MEMORY_SIZE];
        self.memory[FONT_START_ADDRESS..FONT_END_ADDRESS].copy_from_slice(&FONT);

        self.display = [[false; DISPLAY_X]; DISPLAY_Y];
        self.pc = ROM_START_ADDRESS as u16;
        self.i = 0;
        self.v = [0; 16];
        self.stack.clear();
        self.delay_timer = 0;
        self.sound_timer = 0;
        self.keypad = [false; 16];
        self.last_key = None;
        self.waiting_for_key = None;
        self.rng = StdRng::from_os_rng();
    }

    /// Resets the machine, then copies `program` into memory at 0x200.
    ///
    /// Fails with [`Chip8Error::ProgramTooLarge`] if the program does not
    /// fit; the machine is left freshly reset either way.
    pub fn load(&mut self, program: &[u8]) -> Result<(), Chip8Error> {
        self.reset();

        let max_size = MEMORY_SIZE - ROM_START_ADDRESS;
        if program.len() > max_size {
            return Err(Chip8Error::ProgramTooLarge {
                size: program.len(),
                max_size,
            });
        }

        self.memory[ROM_START_ADDRESS..ROM_START_ADDRESS + program.len()].copy_from_slice(program);
        log::info!("loaded {} byte program", program.len());

        Ok(())
    }

    /// Executes exactly one instruction (fetch, decode, execute).
    ///
    /// While the machine is stalled on the key-wait instruction this
    /// returns [`StepResult::WaitingForKey`] without fetching anything; the
    /// first call after a key press consumes the latch and resumes.
    pub fn step(&mut self) -> Result<StepResult, Chip8Error> {
        if let Some(x) = self.waiting_for_key {
            match self.last_key.take() {
                Some(key) => {
                    self.v[x] = key;
                    self.waiting_for_key = None;
                }
                None => return Ok(StepResult::WaitingForKey),
            }
        }

        let word = self.fetch()?;
        log::trace!("pc={:03X} word={:04X}", self.pc, word);

        self.execute(Opcode::decode(word))
    }

    /// Decrements the delay and sound timers, flooring at zero. Driven by
    /// the host at a fixed rate (nominally 60Hz), never by `step`.
    pub fn tick_timers(&mut self) {
        self.delay_timer = self.delay_timer.saturating_sub(1);
        self.sound_timer = self.sound_timer.saturating_sub(1);
    }

    /// Marks a key as held down and latches it as the most recent press.
    pub fn press(&mut self, key: u4) {
        self.keypad[key] = true;
        self.last_key = Some(key.into());
    }

    /// Marks a key as released. The press latch is left alone.
    pub fn release(&mut self, key: u4) {
        self.keypad[key] = false;
    }

    /// Read-only view of the 64x32 pixel grid.
    pub fn display(&self) -> &Display<bool> {
        &self.display
    }

    /// Current delay timer value.
    pub fn delay_timer(&self) -> u8 {
        self.delay_timer
    }

    /// Current sound timer value.
    pub fn sound_timer(&self) -> u8 {
        self.sound_timer
    }

    /// True while the sound timer is non-zero; the host's cue to emit sound.
    pub fn should_beep(&self) -> bool {
        self.sound_timer > 0
    }

    /// Fetches the big-endian instruction word at the program counter.
    fn fetch(&self) -> Result<u16, Chip8Error> {
        let pc = usize::from(self.pc);
        if pc >= MEMORY_SIZE - 2 {
            return Err(Chip8Error::OutOfBounds { address: self.pc });
        }

        Ok(u16::from_be_bytes([self.memory[pc], self.memory[pc + 1]]))
    }

    /// Helper to get a mutable reference to a memory location with bounds
    /// checking, for the instructions that address memory through I.
    pub(crate) fn mem_get(&mut self, addr: u16) -> Result<&mut u8, Chip8Error> {
        self.memory
            .get_mut(usize::from(addr))
            .ok_or(Chip8Error::OutOfBounds { address: addr })
    }
}

impl Default for Chip8 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state() {
        let mut chip8 = Chip8::new();
        chip8.v[3] = 7;
        chip8.delay_timer = 42;
        chip8.stack.push(0x300);
        chip8.press(u4::new(0xA));

        chip8.reset();

        assert_eq!(chip8.pc, 0x200);
        assert_eq!(chip8.i, 0);
        assert_eq!(chip8.v, [0; 16]);
        assert!(chip8.stack.is_empty());
        assert_eq!(chip8.delay_timer, 0);
        assert_eq!(chip8.sound_timer, 0);
        assert_eq!(chip8.keypad, [false; 16]);
        assert_eq!(chip8.last_key, None);
        // the font occupies 0x000-0x04F, everything above is zero
        assert_eq!(chip8.memory[..0x50], FONT);
        assert_eq!(chip8.memory[0x50..], [0; MEMORY_SIZE - 0x50]);
    }

    #[test]
    fn load_copies_program_to_0x200() {
        let mut chip8 = Chip8::new();
        chip8.load(&[0x00, 0xE0, 0x12, 0x00]).unwrap();

        assert_eq!(chip8.memory[0x200..0x204], [0x00, 0xE0, 0x12, 0x00]);
        assert_eq!(chip8.pc, 0x200);
    }

    #[test]
    fn load_accepts_a_full_sized_program() {
        let mut chip8 = Chip8::new();
        assert!(chip8.load(&[0xAB; 0xE00]).is_ok());
        assert_eq!(chip8.memory[MEMORY_SIZE - 1], 0xAB);
    }

    #[test]
    fn load_rejects_an_oversized_program() {
        let mut chip8 = Chip8::new();
        let result = chip8.load(&[0xAB; 0xE01]);

        assert!(matches!(
            result,
            Err(Chip8Error::ProgramTooLarge {
                size: 0xE01,
                max_size: 0xE00
            })
        ));
        // the failed load still left the machine freshly reset
        assert_eq!(chip8.pc, 0x200);
        assert_eq!(chip8.memory[0x50..], [0; MEMORY_SIZE - 0x50]);
    }

    #[test]
    fn fetch_past_memory_end_errors() {
        let mut chip8 = Chip8::new();
        chip8.pc = (MEMORY_SIZE - 2) as u16;

        assert!(matches!(
            chip8.step(),
            Err(Chip8Error::OutOfBounds { address: 4094 })
        ));
    }

    #[test]
    fn timers_floor_at_zero() {
        let mut chip8 = Chip8::new();
        chip8.delay_timer = 2;
        chip8.sound_timer = 1;

        chip8.tick_timers();
        assert_eq!(chip8.delay_timer, 1);
        assert_eq!(chip8.sound_timer, 0);
        assert!(!chip8.should_beep());

        chip8.tick_timers();
        chip8.tick_timers();
        assert_eq!(chip8.delay_timer, 0);
        assert_eq!(chip8.sound_timer, 0);
    }

    #[test]
    fn press_latches_the_most_recent_key() {
        let mut chip8 = Chip8::new();
        chip8.press(u4::new(0x1));
        chip8.press(u4::new(0xC));

        assert!(chip8.keypad[0x1]);
        assert!(chip8.keypad[0xC]);
        // last-writer-wins, no queueing
        assert_eq!(chip8.last_key, Some(0xC));

        chip8.release(u4::new(0xC));
        assert!(!chip8.keypad[0xC]);
        // releasing does not clear the latch
        assert_eq!(chip8.last_key, Some(0xC));
    }
}
