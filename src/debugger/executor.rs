use super::commands::{BreakpointAction, Command, CommandError, CommandResult, SetTarget};
use crate::chip8::{Display, MEMORY_SIZE, Opcode, Runner, StopReason};

/// Executes debugger commands against a [`Runner`] and exposes read-only
/// snapshots of the machine for rendering.
pub struct Executor {
    runner: Runner,
    /// The loaded program, kept around so `reset` can reload it.
    program: Vec<u8>,
}

impl Executor {
    pub fn new(runner: Runner, program: Vec<u8>) -> Self {
        Self { runner, program }
    }

    /// Reports why the run loop stopped since the last poll, if it did.
    pub fn poll(&mut self) -> Option<StopReason> {
        self.runner.take_stop_reason()
    }

    pub fn execute(&mut self, command: Command) -> Result<CommandResult, CommandError> {
        match command {
            Command::Run => {
                self.runner.start();
                Ok(CommandResult::Ok)
            }
            Command::Pause => {
                self.pause();
                Ok(CommandResult::Ok)
            }
            Command::Step => self.execute_step(),
            Command::Reset => self.execute_reset(),
            Command::Breakpoint { action } => Ok(self.handle_breakpoint(action)),
            Command::Set { target, value } => self.handle_set(target, value),
            Command::Mem { start, len } => Ok(self.handle_mem(start, len)),
            Command::Disasm { start, len } => Ok(self.handle_disasm(start, len)),
            Command::Quit => Ok(CommandResult::Quit),
        }
    }

    pub fn pause(&mut self) {
        self.runner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    fn execute_step(&mut self) -> Result<CommandResult, CommandError> {
        self.runner.machine().step()?;
        Ok(CommandResult::Ok)
    }

    fn execute_reset(&mut self) -> Result<CommandResult, CommandError> {
        self.runner.stop();
        self.runner.machine().load(&self.program)?;
        Ok(CommandResult::Ok)
    }

    fn handle_breakpoint(&mut self, action: BreakpointAction) -> CommandResult {
        match action {
            BreakpointAction::Set { addr } => {
                self.runner.add_breakpoint(addr);
            }
            BreakpointAction::Clear { addr } => {
                self.runner.remove_breakpoint(addr);
            }
            BreakpointAction::ClearAll => {
                self.runner.clear_breakpoints();
            }
            BreakpointAction::List => {
                return CommandResult::Breakpoints(self.runner.breakpoints());
            }
        };

        CommandResult::Ok
    }

    fn handle_set(&mut self, target: SetTarget, value: u16) -> Result<CommandResult, CommandError> {
        let mut chip8 = self.runner.machine();

        match target {
            SetTarget::V(reg) => {
                if value > 0xFF {
                    return Err(CommandError::ValueOutOfRange);
                }
                chip8.v[reg] = value as u8;
            }
            SetTarget::I => {
                chip8.i = value;
            }
            SetTarget::Pc => {
                chip8.pc = value;
            }
        }

        Ok(CommandResult::Ok)
    }

    fn handle_mem(&self, start: u16, len: u16) -> CommandResult {
        let chip8 = self.runner.machine();

        let from = usize::from(start).min(MEMORY_SIZE);
        let to = (from + usize::from(len)).min(MEMORY_SIZE);

        CommandResult::MemDump {
            data: chip8.memory[from..to].to_vec(),
            offset: start,
        }
    }

    fn handle_disasm(&self, start: u16, len: u16) -> CommandResult {
        let chip8 = self.runner.machine();

        let mut instructions = Vec::new();
        for idx in 0..usize::from(len) {
            let addr = usize::from(start) + idx * 2;
            if addr + 1 >= MEMORY_SIZE {
                break;
            }

            let word = u16::from_be_bytes([chip8.memory[addr], chip8.memory[addr + 1]]);
            instructions.push((word, Opcode::decode(word)));
        }

        CommandResult::Disasm {
            instructions,
            offset: start,
        }
    }

    // Snapshot getters for the UI. Everything is copied out so the caller
    // never holds the machine lock across a render.

    pub fn display(&self) -> Display<bool> {
        *self.runner.machine().display()
    }

    pub fn pc(&self) -> u16 {
        self.runner.machine().pc
    }

    pub fn i(&self) -> u16 {
        self.runner.machine().i
    }

    pub fn v(&self) -> [u8; 16] {
        self.runner.machine().v
    }

    pub fn stack(&self) -> Vec<u16> {
        self.runner.machine().stack.clone()
    }

    pub fn delay_timer(&self) -> u8 {
        self.runner.machine().delay_timer
    }

    pub fn sound_timer(&self) -> u8 {
        self.runner.machine().sound_timer
    }

    pub fn keypad(&self) -> [bool; 16] {
        self.runner.machine().keypad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip8::Chip8;
    use crate::u4;

    fn executor_with(program: &[u8]) -> Executor {
        let mut chip8 = Chip8::new();
        chip8.load(program).unwrap();
        Executor::new(Runner::new(chip8), program.to_vec())
    }

    #[test]
    fn set_command_writes_registers() {
        let mut executor = executor_with(&[0x12, 0x00]);

        executor
            .execute(Command::Set {
                target: SetTarget::V(u4::new(0x3)),
                value: 0x42,
            })
            .unwrap();
        executor
            .execute(Command::Set {
                target: SetTarget::I,
                value: 0x345,
            })
            .unwrap();
        executor
            .execute(Command::Set {
                target: SetTarget::Pc,
                value: 0x400,
            })
            .unwrap();

        assert_eq!(executor.v()[0x3], 0x42);
        assert_eq!(executor.i(), 0x345);
        assert_eq!(executor.pc(), 0x400);
    }

    #[test]
    fn set_command_rejects_wide_register_values() {
        let mut executor = executor_with(&[0x12, 0x00]);

        let result = executor.execute(Command::Set {
            target: SetTarget::V(u4::new(0x3)),
            value: 0x100,
        });

        assert!(matches!(result, Err(CommandError::ValueOutOfRange)));
    }

    #[test]
    fn step_command_executes_one_instruction() {
        // V5 := 0x21
        let mut executor = executor_with(&[0x65, 0x21]);

        executor.execute(Command::Step).unwrap();

        assert_eq!(executor.v()[0x5], 0x21);
        assert_eq!(executor.pc(), 0x202);
    }

    #[test]
    fn step_command_surfaces_machine_faults() {
        let mut executor = executor_with(&[0x00, 0xEE]);

        let result = executor.execute(Command::Step);

        assert!(matches!(result, Err(CommandError::Machine(_))));
    }

    #[test]
    fn reset_command_reloads_the_program() {
        let mut executor = executor_with(&[0x65, 0x21]);
        executor.execute(Command::Step).unwrap();
        assert_eq!(executor.v()[0x5], 0x21);

        executor.execute(Command::Reset).unwrap();

        assert_eq!(executor.pc(), 0x200);
        assert_eq!(executor.v(), [0; 16]);
        // the program is back in place and runnable
        executor.execute(Command::Step).unwrap();
        assert_eq!(executor.v()[0x5], 0x21);
    }

    #[test]
    fn breakpoint_commands_round_trip() {
        let mut executor = executor_with(&[0x12, 0x00]);

        for addr in [0x400u16, 0x200, 0x300] {
            executor
                .execute(Command::Breakpoint {
                    action: BreakpointAction::Set { addr },
                })
                .unwrap();
        }
        executor
            .execute(Command::Breakpoint {
                action: BreakpointAction::Clear { addr: 0x300 },
            })
            .unwrap();

        let result = executor
            .execute(Command::Breakpoint {
                action: BreakpointAction::List,
            })
            .unwrap();
        assert!(matches!(result, CommandResult::Breakpoints(ref bps) if *bps == vec![0x200, 0x400]));

        executor
            .execute(Command::Breakpoint {
                action: BreakpointAction::ClearAll,
            })
            .unwrap();
        let result = executor
            .execute(Command::Breakpoint {
                action: BreakpointAction::List,
            })
            .unwrap();
        assert!(matches!(result, CommandResult::Breakpoints(ref bps) if bps.is_empty()));
    }

    #[test]
    fn mem_command_dumps_the_requested_range() {
        let mut executor = executor_with(&[0xAB, 0xCD, 0xEF, 0x01]);

        let result = executor
            .execute(Command::Mem {
                start: 0x200,
                len: 4,
            })
            .unwrap();

        match result {
            CommandResult::MemDump { data, offset } => {
                assert_eq!(data, vec![0xAB, 0xCD, 0xEF, 0x01]);
                assert_eq!(offset, 0x200);
            }
            _ => panic!("expected a memory dump"),
        }
    }

    #[test]
    fn mem_command_clamps_to_memory_end() {
        let mut executor = executor_with(&[0x12, 0x00]);

        let result = executor
            .execute(Command::Mem {
                start: 0xFFC,
                len: 100,
            })
            .unwrap();

        match result {
            CommandResult::MemDump { data, .. } => assert_eq!(data.len(), 4),
            _ => panic!("expected a memory dump"),
        }
    }

    #[test]
    fn disasm_command_decodes_words() {
        let mut executor = executor_with(&[0x00, 0xE0, 0x1A, 0xBC]);

        let result = executor
            .execute(Command::Disasm {
                start: 0x200,
                len: 2,
            })
            .unwrap();

        match result {
            CommandResult::Disasm {
                instructions,
                offset,
            } => {
                assert_eq!(offset, 0x200);
                assert_eq!(
                    instructions,
                    vec![
                        (0x00E0, Opcode::ClearScreen),
                        (0x1ABC, Opcode::Jump { nnn: 0xABC })
                    ]
                );
            }
            _ => panic!("expected a disassembly"),
        }
    }
}
