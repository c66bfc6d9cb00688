// An emulated MIPS-like educational machine and the kernel that runs on it:
// processes, counting semaphores, synchronous I/O, round-robin scheduling
// and pass-up exception escalation. The Emulator owns both halves and runs
// the event loop between them: execute the loaded state until the hardware
// raises an exception, let the kernel resolve it into the next control
// transfer, repeat until HALT or PANIC.

pub mod asl;
pub mod board;
pub mod devices;
pub mod exceptions;
pub mod instructions;
pub mod interrupts;
pub mod memory;
pub mod nucleus;
pub mod pcb;
pub mod processor;
pub mod scheduler;
pub mod syscalls;

use board::Program;
use log::error;
use memory::{Bus, Context, SupportStruct, GENERAL, PAGE_FAULT};
use nucleus::Nucleus;
use processor::{Inspector, Machine, ProcessorState, Status, SP};
use thiserror::Error;

/// Top of the stack area; process and handler stacks are carved downward
/// from here, one page apiece.
pub const RAMTOP: u32 = 0x2000_0000;
pub const PAGESIZE: u32 = 0x1000;

/// How the kernel hands control back to the machine. LoadState restores a
/// saved state (popping the status stack the way the hardware does);
/// LoadContext jumps into a support handler with its status taken verbatim;
/// Wait idles until the next interrupt. None of these return.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    LoadState(ProcessorState),
    LoadContext(ProcessorState),
    Wait(Status),
    Halt,
    Panic(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Orderly shutdown: the last process terminated.
    Halt { tod: u64 },
    /// The machine wedged: deadlock or an unrecoverable kernel condition.
    Panic { reason: String },
    /// The inspector quit the run.
    Aborted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no state block at entry point {0:#010x}")]
    MissingEntry(u32),
    #[error("support {0}: {1} handler points at unmapped code {2:#010x}")]
    BadSupportContext(usize, &'static str, u32),
    #[error("device slot {line}.{device} attached twice")]
    DuplicateDevice { line: usize, device: usize },
}

/// Everything a machine needs to boot: the bus with its devices, the mapped
/// programs with their prototype state blocks, the support structures and
/// the boot entry point. Stacks and ASIDs are assigned at load time.
pub struct Configuration {
    pub bus: Bus,
    pub entry: u32,
    /// TOD ceiling guarding against workloads that can never halt.
    pub watchdog: Option<u64>,
    next_stack: u32,
    next_asid: u32,
}

impl Configuration {
    pub fn new(bus: Bus) -> Self {
        Configuration {
            bus,
            entry: 0,
            watchdog: Some(10_000_000),
            next_stack: RAMTOP,
            next_asid: 1,
        }
    }
    /// Map a program and store its prototype state block at the base
    /// address, ready for CreateProcess (or boot) to copy.
    pub fn load(&mut self, program: Program) -> u32 {
        let mut state = ProcessorState::new();
        state.pc = program.base;
        state.entry_hi = self.next_asid;
        state.gpr[SP] = self.next_stack;
        state.status = Status::IEP | Status::IM | Status::TE;
        if program.user {
            state.status |= Status::KUP;
        }
        self.next_asid += 1;
        self.next_stack -= PAGESIZE;
        self.bus.load_program(program.base, &program.ops);
        self.bus.store_state(program.base, state);
        program.base
    }
    /// Register a support structure whose handlers continue a passed-up
    /// process; returns the 1-based id CreateProcess takes.
    pub fn add_support(&mut self, page_fault_pc: u32, general_pc: u32) -> usize {
        let status = Status::IEC | Status::IM | Status::TE;
        let page_fault = Context { pc: page_fault_pc, sp: self.next_stack, status };
        self.next_stack -= PAGESIZE;
        let general = Context { pc: general_pc, sp: self.next_stack, status };
        self.next_stack -= PAGESIZE;
        self.bus.supports.push(SupportStruct::new(page_fault, general));
        self.bus.supports.len()
    }
}

pub struct Emulator {
    pub machine: Machine,
    pub nucleus: Nucleus,
    control: Control,
    watchdog: Option<u64>,
}

impl Emulator {
    pub fn new(config: Configuration) -> Result<Emulator, ConfigError> {
        if config.bus.read_state(config.entry).is_none() {
            return Err(ConfigError::MissingEntry(config.entry));
        }
        for (j, support) in config.bus.supports.iter().enumerate() {
            for &(kind, name) in [(PAGE_FAULT, "page-fault"), (GENERAL, "general")].iter() {
                let pc = support.exc_context[kind].pc;
                if config.bus.fetch(pc).is_none() {
                    return Err(ConfigError::BadSupportContext(j + 1, name, pc));
                }
            }
        }
        let mut slots = config.bus.device_slots();
        slots.sort_unstable();
        for pair in slots.windows(2) {
            if pair[0] == pair[1] {
                return Err(ConfigError::DuplicateDevice { line: pair[0].0, device: pair[0].1 });
            }
        }
        let watchdog = config.watchdog;
        let entry = config.entry;
        let mut machine = Machine::new(config.bus);
        let mut nucleus = Nucleus::new();
        let control = nucleus.init(&mut machine, entry);
        Ok(Emulator { machine, nucleus, control, watchdog })
    }

    /// One control transfer. Returns the outcome once the machine stops.
    pub fn step(&mut self) -> Option<Outcome> {
        if let Some(limit) = self.watchdog {
            if self.machine.tod() > limit {
                return Some(Outcome::Panic {
                    reason: format!("watchdog: tod passed {} µs", limit),
                });
            }
        }
        let control = std::mem::replace(&mut self.control, Control::Halt);
        match control {
            Control::LoadState(mut state) => {
                state.status.pop();
                self.dispatch(state)
            }
            Control::LoadContext(state) => self.dispatch(state),
            Control::Wait(idle) => match self.machine.wait(idle) {
                Ok(saved) => {
                    self.control = exceptions::handle(&mut self.nucleus, &mut self.machine, saved);
                    None
                }
                Err(reason) => Some(Outcome::Panic { reason }),
            },
            Control::Halt => Some(Outcome::Halt { tod: self.machine.tod() }),
            Control::Panic(reason) => {
                error!("kernel panic: {}", reason);
                Some(Outcome::Panic { reason })
            }
        }
    }

    fn dispatch(&mut self, state: ProcessorState) -> Option<Outcome> {
        let saved = self.machine.exec(state);
        if self.machine.bus.passup.is_none() {
            return Some(Outcome::Panic {
                reason: String::from("exception with no pass-up vector installed"),
            });
        }
        self.control = exceptions::handle(&mut self.nucleus, &mut self.machine, saved);
        None
    }

    pub fn run(&mut self, debug: bool) -> Outcome {
        let mut inspector = if debug { Some(Inspector::new()) } else { None };
        loop {
            if let Some(outcome) = self.step() {
                return outcome;
            }
            if let Some(inspector) = inspector.as_mut() {
                if inspector.update(&self.nucleus, &self.machine) {
                    return Outcome::Aborted;
                }
            }
        }
    }

    /// Bytes transmitted so far by one terminal.
    pub fn terminal_output(&self, number: usize) -> Vec<u8> {
        self.machine.bus.terminal_output(number)
    }
}
