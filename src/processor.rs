// The processor model: the saved register file, the status word with its
// three-deep interrupt/mode stack, and the execution loop that runs a loaded
// state until the next exception. The Inspector at the bottom is the
// interactive debugger the devkit binary attaches with --debug.

use crate::devices::{SemId, SEM_COUNT};
use crate::instructions::{Op, WORDLEN};
use crate::memory::Bus;
use crate::nucleus::Nucleus;
use crate::pcb::MAXPROC;
use bitflags::bitflags;
use log::trace;
use std::collections::HashSet;
use std::io;
use std::io::prelude::*;
use termion::{clear, color, cursor};

// General registers, MIPS o32 names minus zero/k0/k1.
pub const AT: usize = 0;
pub const V0: usize = 1;
pub const V1: usize = 2;
pub const A0: usize = 3;
pub const A1: usize = 4;
pub const A2: usize = 5;
pub const A3: usize = 6;
pub const T0: usize = 7;
pub const T8: usize = 23;
pub const T9: usize = 24;
pub const GP: usize = 25;
pub const SP: usize = 26;
pub const FP: usize = 27;
pub const RA: usize = 28;
pub const GPR_COUNT: usize = 29;

// Exception codes in the cause register.
pub const EXC_INT: u32 = 0;
pub const EXC_MOD: u32 = 1;
pub const EXC_TLBL: u32 = 2;
pub const EXC_TLBS: u32 = 3;
pub const EXC_ADEL: u32 = 4;
pub const EXC_ADES: u32 = 5;
pub const EXC_IBE: u32 = 6;
pub const EXC_DBE: u32 = 7;
pub const EXC_SYS: u32 = 8;
pub const EXC_BP: u32 = 9;
pub const EXC_RI: u32 = 10;
pub const EXC_CPU: u32 = 11;
pub const EXC_OV: u32 = 12;

pub fn exc_code(cause: u32) -> u32 {
    (cause >> 2) & 0x1f
}

pub fn ip_lines(cause: u32) -> u32 {
    (cause >> 8) & 0xff
}

pub fn mkcause(code: u32, ip: u32) -> u32 {
    (code << 2) | (ip << 8)
}

bitflags! {
    /// The status word. IEC/KUC are the live interrupt-enable and mode bits;
    /// exception entry pushes them down the three-deep stack and a LoadState
    /// pops them back. IM masks interrupt lines in bits 8-15, TE gates the
    /// processor-local timer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const IEC = 0x0000_0001;
        const KUC = 0x0000_0002;
        const IEP = 0x0000_0004;
        const KUP = 0x0000_0008;
        const IEO = 0x0000_0010;
        const KUO = 0x0000_0020;
        const IM  = 0x0000_ff00;
        const TE  = 0x0800_0000;
    }
}

impl Status {
    /// Exception entry: current -> previous -> old, then kernel mode with
    /// interrupts off.
    pub fn push(&mut self) {
        let bits = self.bits();
        *self = Status::from_bits_retain((bits & !0x3f) | ((bits & 0x0f) << 2));
    }
    /// LoadState: previous -> current, old -> previous.
    pub fn pop(&mut self) {
        let bits = self.bits();
        *self = Status::from_bits_retain((bits & !0x0f) | ((bits >> 2) & 0x0f));
    }
    pub fn accepts(self, line: usize) -> bool {
        self.bits() & (1 << (8 + line)) != 0
    }
    /// Mode the processor was in when this status was pushed.
    pub fn was_user_mode(self) -> bool {
        self.contains(Status::KUP)
    }
}

/// The register file the machine saves on an exception and restores on a
/// LoadState, as one flat copyable block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorState {
    pub entry_hi: u32,
    pub cause: u32,
    pub status: Status,
    pub pc: u32,
    pub gpr: [u32; GPR_COUNT],
}

impl ProcessorState {
    pub fn new() -> Self {
        ProcessorState {
            entry_hi: 0,
            cause: 0,
            status: Status::empty(),
            pc: 0,
            gpr: [0; GPR_COUNT],
        }
    }
    pub fn asid(&self) -> u32 {
        self.entry_hi
    }
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Quantum armed into the processor-local timer on every dispatch.
pub const QUANTUM: u64 = 5_000;
/// Pseudo-clock tick period loaded into the interval timer.
pub const PSECOND: u64 = 100_000;

/// The machine: bus, time-of-day clock and the two timers. `exec` runs a
/// loaded state until it raises an exception; `wait` idles until the next
/// hardware event. Both hand back the saved state the way the hardware
/// deposits it on the BIOS data page.
pub struct Machine {
    pub bus: Bus,
    tod: u64,
    plt: Option<u64>,
    interval: Option<u64>,
}

impl Machine {
    pub fn new(bus: Bus) -> Machine {
        Machine { bus, tod: 0, plt: None, interval: None }
    }
    pub fn tod(&self) -> u64 {
        self.tod
    }
    /// Arm the processor-local timer `usec` from now; clears its pending
    /// interrupt.
    pub fn set_plt(&mut self, usec: u64) {
        self.plt = Some(self.tod + usec);
    }
    /// Reload the interval timer; clears its pending interrupt.
    pub fn load_interval(&mut self, usec: u64) {
        self.interval = Some(self.tod + usec);
    }

    /// Interrupt lines currently deliverable under `status`: pending and
    /// unmasked. Line 1 is the local timer (only with TE), line 2 the
    /// interval timer, lines 3-7 the devices.
    fn pending_lines(&mut self, status: Status) -> u32 {
        self.bus.update(self.tod);
        let mut lines = 0u32;
        if status.contains(Status::TE) && self.plt.map_or(false, |t| self.tod >= t) {
            lines |= 1 << 1;
        }
        if self.interval.map_or(false, |t| self.tod >= t) {
            lines |= 1 << 2;
        }
        lines |= self.bus.pending_lines();
        let mask = (status.bits() >> 8) & 0xff;
        lines & mask
    }

    /// Earliest strictly-future event that could interrupt under `status`.
    fn next_event(&self, status: Status) -> Option<u64> {
        let mut events: Vec<u64> = Vec::new();
        if status.contains(Status::TE) && status.accepts(1) {
            events.extend(self.plt);
        }
        if status.accepts(2) {
            events.extend(self.interval);
        }
        for (line, t) in self.bus.next_completions() {
            if status.accepts(line) {
                events.push(t);
            }
        }
        events.into_iter().filter(|&t| t > self.tod).min()
    }

    fn take_exception(&mut self, mut state: ProcessorState, code: u32, ip: u32) -> ProcessorState {
        state.cause = mkcause(code, ip);
        state.status.push();
        state
    }

    /// Run `state` until the next exception and return the saved state. The
    /// status has already been popped by the caller for a LoadState.
    pub fn exec(&mut self, mut state: ProcessorState) -> ProcessorState {
        loop {
            if state.status.contains(Status::IEC) {
                let pending = self.pending_lines(state.status);
                if pending != 0 {
                    return self.take_exception(state, EXC_INT, pending);
                }
            }
            let op = match self.bus.fetch(state.pc) {
                Some(op) => op,
                None => return self.take_exception(state, EXC_IBE, 0),
            };
            match op {
                Op::Compute { usec } => {
                    let mut remaining = state.gpr[T8] as u64;
                    if remaining == 0 {
                        remaining = usec as u64;
                    }
                    if remaining == 0 {
                        state.pc += WORDLEN;
                        continue;
                    }
                    let horizon = if state.status.contains(Status::IEC) {
                        self.next_event(state.status)
                    } else {
                        None
                    };
                    let chunk = match horizon {
                        Some(t) => remaining.min(t - self.tod),
                        None => remaining,
                    };
                    self.tod += chunk;
                    remaining -= chunk;
                    state.gpr[T8] = remaining as u32;
                    if remaining == 0 {
                        state.pc += WORDLEN;
                    }
                }
                Op::Syscall { num, a1, a2, a3 } => {
                    state.gpr[A0] = num;
                    state.gpr[A1] = a1;
                    state.gpr[A2] = a2;
                    state.gpr[A3] = a3;
                    self.tod += 1;
                    return self.take_exception(state, EXC_SYS, 0);
                }
                Op::Trap { code } => {
                    self.tod += 1;
                    return self.take_exception(state, code, 0);
                }
                Op::IoCommand { line, device, field, value } => {
                    self.tod += 1;
                    let tod = self.tod;
                    if let Some(dev) = self.bus.device_mut(line, device) {
                        dev.write(field, value, tod);
                    }
                    state.pc += WORDLEN;
                }
            }
        }
    }

    /// The WAIT instruction: sleep until an event deliverable under the idle
    /// status word arrives, then take its interrupt.
    pub fn wait(&mut self, idle: Status) -> Result<ProcessorState, String> {
        let mut pending = self.pending_lines(idle);
        if pending == 0 {
            match self.next_event(idle) {
                Some(t) => {
                    trace!("wait: idling from {} to {}", self.tod, t);
                    self.tod = t;
                    pending = self.pending_lines(idle);
                }
                None => return Err(String::from("wait with no pending hardware event")),
            }
        }
        let mut state = ProcessorState::new();
        state.status = idle;
        Ok(self.take_exception(state, EXC_INT, pending))
    }
}

/// Interactive nucleus inspector, attached by `devkit --debug`. Stops after
/// every kernel event; `n` steps, `c` runs to the next TOD breakpoint,
/// `b`/`d` set and delete breakpoints (in microseconds), `w`/`u` watch and
/// unwatch semaphore counters, `q` quits the run.
pub struct Inspector {
    code_running: bool,
    last_cmd: InspectorCmd,
    last_tod: u64,
    breakpoints: HashSet<u64>,
    watched: HashSet<SemId>,
}

#[derive(PartialEq, Clone)]
enum InspectorCmd {
    Quit,
    Step,
    Continue,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Watch(Option<String>),
    Unwatch(Option<String>),
}

impl Inspector {
    pub fn new() -> Box<Self> {
        Box::new(Inspector {
            code_running: false,
            last_cmd: InspectorCmd::Step,
            last_tod: 0,
            breakpoints: HashSet::new(),
            watched: HashSet::new(),
        })
    }
    fn hit_breakpoint(&self, tod: u64) -> bool {
        self.breakpoints.iter().any(|&b| self.last_tod < b && tod >= b)
    }
    fn get_command(&mut self) -> InspectorCmd {
        let mut input = String::new();
        io::stdin().read_line(&mut input).unwrap();
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => InspectorCmd::Quit,
            Some("s") | Some("n") => InspectorCmd::Step,
            Some("c") => InspectorCmd::Continue,
            Some("b") => InspectorCmd::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => InspectorCmd::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("w") => InspectorCmd::Watch(cmd.next().map(String::from)),
            Some("u") => InspectorCmd::Unwatch(cmd.next().map(String::from)),
            _ => self.last_cmd.clone(),
        }
    }
    fn draw(&self, nucleus: &Nucleus, machine: &Machine) {
        print!("{}{}", clear::All, cursor::Goto(1, 1));
        println!("╔════════════════════════════════════════════════════════════╗");
        println!(
            "║ tod {:>10} µs   procs {:>2}   soft-blocked {:>2}   ready {:>2}   ║",
            machine.tod(),
            nucleus.process_count,
            nucleus.soft_blocked,
            nucleus.ready.len(&nucleus.pool),
        );
        println!("╟─────┬──────┬──────────┬────────────┬───────────────────────╢");
        println!("║ pcb │ asid │       pc │     time   │ where                 ║");
        println!("╟─────┼──────┼──────────┼────────────┼───────────────────────╢");
        for p in 0..MAXPROC {
            if nucleus.pool.is_free(p) {
                continue;
            }
            let pcb = nucleus.pool.pcb(p);
            let place = if nucleus.current == Some(p) {
                String::from("running")
            } else if let Some(sem) = pcb.sem {
                format!("blocked on sem {}", sem)
            } else {
                String::from("ready")
            };
            println!(
                "║ {:>3} │ {:>4} │ {:08x} │ {:>7} µs │ {:<21} ║",
                p,
                pcb.state.asid(),
                pcb.state.pc,
                pcb.time,
                place,
            );
        }
        println!("╟─────┴──────┴──────────┴────────────┴───────────────────────╢");
        let active = nucleus.asl.semaphores();
        let asl = active
            .iter()
            .map(|&s| format!("{}:{}", s, nucleus.semaphores[s]))
            .collect::<Vec<_>>()
            .join(" ");
        println!("║ asl {:<56} ║", asl);
        match nucleus.audit() {
            Ok(()) => println!("║ invariants ok {:<45} ║", ""),
            Err(e) => println!(
                "║ {r}invariant violated{n}: {:<39} ║",
                e,
                r = color::Fg(color::Red),
                n = color::Fg(color::Reset)
            ),
        }
        println!("╚════════════════════════════════════════════════════════════╝");
        if !self.watched.is_empty() {
            println!("Watched semaphores");
            for &sem in self.watched.iter().filter(|&&sem| sem < SEM_COUNT) {
                println!("{:>3}: {}", sem, nucleus.semaphores[sem]);
            }
        }
        println!("Inspector attached. n steps one kernel event, c continues, b/d <µs> sets/deletes a TOD breakpoint, w/u <sem> watches/unwatches a counter, q quits.");
        print!("> ");
        io::stdout().flush().expect("");
    }
    /// Called after every kernel event; true means quit the run.
    pub fn update(&mut self, nucleus: &Nucleus, machine: &Machine) -> bool {
        let tod = machine.tod();
        if self.code_running && !self.hit_breakpoint(tod) {
            self.last_tod = tod;
            return false;
        }
        self.code_running = false;
        self.last_tod = tod;
        loop {
            self.draw(nucleus, machine);
            let cmd = self.get_command();
            match &cmd {
                InspectorCmd::Quit => return true,
                InspectorCmd::Step => {
                    self.last_cmd = cmd;
                    return false;
                }
                InspectorCmd::Continue => {
                    self.code_running = true;
                    return false;
                }
                InspectorCmd::SetBreakpoint(arg) => {
                    if let Some(t) = parse_number(arg) {
                        self.breakpoints.insert(t);
                    }
                }
                InspectorCmd::DeleteBreakpoint(arg) => {
                    if let Some(t) = parse_number(arg) {
                        self.breakpoints.remove(&t);
                    }
                }
                InspectorCmd::Watch(arg) => {
                    if let Some(s) = parse_number(arg) {
                        self.watched.insert(s as SemId);
                    }
                }
                InspectorCmd::Unwatch(arg) => {
                    if let Some(s) = parse_number(arg) {
                        self.watched.remove(&(s as SemId));
                    }
                }
            }
        }
    }
}

fn parse_number(arg: &Option<String>) -> Option<u64> {
    match arg {
        Some(text) => text.parse().ok(),
        None => None,
    }
}
