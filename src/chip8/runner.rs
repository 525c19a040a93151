use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Chip8, Chip8Error, StepResult};
use crate::u4;

pub const CPU_HZ: f32 = 700.0;
pub const TIMER_HZ: f32 = 60.0;

const CPU_TIME_STEP: f32 = 1.0 / CPU_HZ;
const TIMER_TIME_STEP: f32 = 1.0 / TIMER_HZ;

/// How long the run loop sleeps between bursts. Also bounds how quickly a
/// stop request is observed.
const PACING_SLEEP: Duration = Duration::from_millis(1);

/// Why the run loop stopped on its own.
#[derive(Debug)]
pub enum StopReason {
    /// Execution reached an address with a breakpoint set.
    Breakpoint(u16),
    /// An instruction failed; the machine is left exactly as the faulting
    /// instruction found it.
    Fault(Chip8Error),
}

/// Continuous execution context for a [`Chip8`] machine.
///
/// The machine lives behind a single mutex; the run thread, key events,
/// timer ticks and host observation all serialize through it, so nothing
/// ever observes a half-applied instruction. Stopping is cooperative: the
/// flag is checked between instruction bursts, never mid-instruction.
pub struct Runner {
    machine: Arc<Mutex<Chip8>>,
    running: Arc<AtomicBool>,
    stop_reason: Arc<Mutex<Option<StopReason>>>,
    breakpoints: Arc<Mutex<HashSet<u16>>>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(chip8: Chip8) -> Self {
        Self {
            machine: Arc::new(Mutex::new(chip8)),
            running: Arc::new(AtomicBool::new(false)),
            stop_reason: Arc::new(Mutex::new(None)),
            breakpoints: Arc::new(Mutex::new(HashSet::new())),
            handle: None,
        }
    }

    /// Starts the run thread. A no-op if the machine is already running.
    pub fn start(&mut self) {
        if self.running.load(Ordering::Acquire) {
            return;
        }

        // A previous thread may have stopped itself on a fault or
        // breakpoint; collect it before spawning a fresh one.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        *lock(&self.stop_reason) = None;
        self.running.store(true, Ordering::Release);

        let machine = Arc::clone(&self.machine);
        let running = Arc::clone(&self.running);
        let stop_reason = Arc::clone(&self.stop_reason);
        let breakpoints = Arc::clone(&self.breakpoints);

        self.handle = Some(std::thread::spawn(move || {
            run_loop(&machine, &running, &stop_reason, &breakpoints);
        }));
    }

    /// Requests a cooperative stop and waits for the run thread to finish
    /// its current instruction. A no-op if already stopped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns why the run loop stopped on its own, at most once per stop.
    pub fn take_stop_reason(&self) -> Option<StopReason> {
        lock(&self.stop_reason).take()
    }

    /// Locks the machine for direct access: single-stepping, observation,
    /// resets. Held guards pause the run thread at an instruction boundary.
    pub fn machine(&self) -> MutexGuard<'_, Chip8> {
        lock(&self.machine)
    }

    /// Forwards a key press into the machine.
    pub fn press(&self, key: u4) {
        lock(&self.machine).press(key);
    }

    /// Forwards a key release into the machine.
    pub fn release(&self, key: u4) {
        lock(&self.machine).release(key);
    }

    /// True while the sound timer is non-zero.
    pub fn should_beep(&self) -> bool {
        lock(&self.machine).should_beep()
    }

    pub fn add_breakpoint(&self, addr: u16) {
        lock(&self.breakpoints).insert(addr);
    }

    pub fn remove_breakpoint(&self, addr: u16) {
        lock(&self.breakpoints).remove(&addr);
    }

    pub fn clear_breakpoints(&self) {
        lock(&self.breakpoints).clear();
    }

    /// Sorted list of the currently set breakpoints.
    pub fn breakpoints(&self) -> Vec<u16> {
        let mut addrs: Vec<u16> = lock(&self.breakpoints).iter().copied().collect();
        addrs.sort_unstable();
        addrs
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Paces instructions at `CPU_HZ` and timer ticks at `TIMER_HZ` with
/// independent accumulators, mirroring real hardware where the timers are
/// not tied to instruction throughput.
fn run_loop(
    machine: &Mutex<Chip8>,
    running: &AtomicBool,
    stop_reason: &Mutex<Option<StopReason>>,
    breakpoints: &Mutex<HashSet<u16>>,
) {
    let mut cpu_accumulator = 0.0f32;
    let mut timer_accumulator = 0.0f32;
    let mut last_instant = Instant::now();

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        let dt = (now - last_instant).as_secs_f32();
        last_instant = now;

        cpu_accumulator += dt;
        timer_accumulator += dt;

        let mut chip8 = lock(machine);
        let bps = lock(breakpoints);

        while timer_accumulator >= TIMER_TIME_STEP {
            timer_accumulator -= TIMER_TIME_STEP;
            chip8.tick_timers();
        }

        while cpu_accumulator >= CPU_TIME_STEP {
            cpu_accumulator -= CPU_TIME_STEP;

            match chip8.step() {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::WaitForNextFrame) | Ok(StepResult::WaitingForKey) => {
                    // Yield to the host: a frame needs rendering, or the
                    // machine is parked on the key-wait instruction. Drop
                    // the backlog so we don't catch up in a burst later.
                    cpu_accumulator = 0.0;
                    break;
                }
                Err(e) => {
                    log::warn!("run loop stopped: {e}");
                    *lock(stop_reason) = Some(StopReason::Fault(e));
                    running.store(false, Ordering::Release);
                    return;
                }
            }

            if bps.contains(&chip8.pc) {
                *lock(stop_reason) = Some(StopReason::Breakpoint(chip8.pc));
                running.store(false, Ordering::Release);
                return;
            }
        }

        drop(bps);
        drop(chip8);

        std::thread::sleep(PACING_SLEEP);
    }
}

/// Mutex lock that shrugs off poisoning: the machine state is plain data
/// and stays consistent even if a panicking thread held the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn runner_with(program: &[u8]) -> Runner {
        let mut chip8 = Chip8::new();
        chip8.load(program).unwrap();
        Runner::new(chip8)
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        // 0x200: jump 0x200
        let mut runner = runner_with(&[0x12, 0x00]);

        runner.start();
        runner.start();
        assert!(runner.is_running());

        runner.stop();
        runner.stop();
        assert!(!runner.is_running());
        assert!(runner.take_stop_reason().is_none());
    }

    #[test]
    fn fault_stops_the_loop_and_is_reported_once() {
        // 0x200: return with an empty stack
        let mut runner = runner_with(&[0x00, 0xEE]);

        runner.start();
        assert!(wait_until(Duration::from_secs(2), || !runner.is_running()));

        assert!(matches!(
            runner.take_stop_reason(),
            Some(StopReason::Fault(Chip8Error::StackUnderflow))
        ));
        assert!(runner.take_stop_reason().is_none());
    }

    #[test]
    fn breakpoints_pause_the_loop() {
        // 0x200: V0 := 1, 0x202: jump 0x200
        let mut runner = runner_with(&[0x60, 0x01, 0x12, 0x00]);
        runner.add_breakpoint(0x202);

        runner.start();
        assert!(wait_until(Duration::from_secs(2), || !runner.is_running()));

        assert!(matches!(
            runner.take_stop_reason(),
            Some(StopReason::Breakpoint(0x202))
        ));
        assert_eq!(runner.machine().pc, 0x202);

        // restarting after clearing the breakpoint keeps the program going
        runner.clear_breakpoints();
        runner.start();
        assert!(runner.is_running());
        runner.stop();
    }

    #[test]
    fn key_events_are_serialized_with_the_run_loop() {
        // 0x200: wait for a key into V4, 0x202: jump 0x202
        let mut runner = runner_with(&[0xF4, 0x0A, 0x12, 0x02]);

        runner.start();
        runner.press(u4::new(0x9));
        runner.release(u4::new(0x9));

        assert!(wait_until(Duration::from_secs(2), || {
            runner.machine().v[4] == 0x9
        }));

        runner.stop();
    }

    #[test]
    fn breakpoint_list_is_sorted() {
        let runner = runner_with(&[0x12, 0x00]);
        runner.add_breakpoint(0x400);
        runner.add_breakpoint(0x200);
        runner.add_breakpoint(0x300);
        runner.remove_breakpoint(0x300);

        assert_eq!(runner.breakpoints(), vec![0x200, 0x400]);
    }
}
