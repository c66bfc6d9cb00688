// The address bus of the emulated machine: the code store the processor
// fetches from, the prototype state blocks workloads hand to CreateProcess,
// the support-structure table, the Pass-Up Vector slot and the attached
// devices. The kernel reaches the hardware exclusively through this type.

use crate::devices::{Device, DEV_PER_LINE, TERM_LINE};
use crate::instructions::{Op, WORDLEN};
use crate::processor::{ProcessorState, Status};
use std::collections::HashMap;

/// Exception and TLB-refill entry points plus the shared kernel stack,
/// installed once at kernel initialization. The values are opaque to the
/// machine; an exception with no vector installed is unrecoverable.
#[derive(Debug, Copy, Clone)]
pub struct PassUpVector {
    pub exception_pc: u32,
    pub refill_pc: u32,
    pub stack: u32,
}

/// Where a passed-up exception continues: the support level's handler entry,
/// stack and status word.
#[derive(Debug, Copy, Clone)]
pub struct Context {
    pub pc: u32,
    pub sp: u32,
    pub status: Status,
}

/// Pass-up kinds, indexing the exception state/context pairs.
pub const PAGE_FAULT: usize = 0;
pub const GENERAL: usize = 1;

/// Per-process support structure: the saved exception state and continuation
/// context for each pass-up kind.
pub struct SupportStruct {
    pub exc_state: [ProcessorState; 2],
    pub exc_context: [Context; 2],
}

impl SupportStruct {
    pub fn new(page_fault: Context, general: Context) -> Self {
        SupportStruct {
            exc_state: [ProcessorState::new(); 2],
            exc_context: [page_fault, general],
        }
    }
}

pub struct Bus {
    code: HashMap<u32, Op>,
    states: HashMap<u32, ProcessorState>,
    devices: Vec<Box<dyn Device>>,
    pub supports: Vec<SupportStruct>,
    pub passup: Option<PassUpVector>,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            code: HashMap::new(),
            states: HashMap::new(),
            devices: Vec::new(),
            supports: Vec::new(),
            passup: None,
        }
    }
    pub fn attach(&mut self, device: Box<dyn Device>) {
        self.devices.push(device);
    }
    /// Map `ops` at `base`, one machine word each.
    pub fn load_program(&mut self, base: u32, ops: &[Op]) {
        for (j, &op) in ops.iter().enumerate() {
            self.code.insert(base + j as u32 * WORDLEN, op);
        }
    }
    pub fn store_state(&mut self, addr: u32, state: ProcessorState) {
        self.states.insert(addr, state);
    }
    pub fn fetch(&self, pc: u32) -> Option<Op> {
        self.code.get(&pc).copied()
    }
    pub fn read_state(&self, addr: u32) -> Option<ProcessorState> {
        self.states.get(&addr).copied()
    }
    pub fn device(&self, line: usize, number: usize) -> Option<&dyn Device> {
        self.devices
            .iter()
            .find(|d| d.line() == line && d.number() == number)
            .map(|d| d.as_ref())
    }
    pub fn device_mut(&mut self, line: usize, number: usize) -> Option<&mut Box<dyn Device>> {
        self.devices
            .iter_mut()
            .find(|d| d.line() == line && d.number() == number)
    }
    /// All attached device slots, for configuration validation.
    pub fn device_slots(&self) -> Vec<(usize, usize)> {
        self.devices.iter().map(|d| (d.line(), d.number())).collect()
    }
    pub fn update(&mut self, tod: u64) {
        for device in &mut self.devices {
            device.update(tod);
        }
    }
    /// Interrupt lines 3-7 with at least one device asserting.
    pub fn pending_lines(&self) -> u32 {
        let mut lines = 0;
        for device in &self.devices {
            if let Some(irq) = device.interrupt_request() {
                lines |= 1 << irq.line;
            }
        }
        lines
    }
    /// Interrupting-devices bitmap for one line.
    pub fn int_bitmap(&self, line: usize) -> u32 {
        let mut bitmap = 0;
        for device in &self.devices {
            if let Some(irq) = device.interrupt_request() {
                if irq.line == line && irq.device < DEV_PER_LINE {
                    bitmap |= 1 << irq.device;
                }
            }
        }
        bitmap
    }
    /// Scheduled completions as (line, due time) pairs.
    pub fn next_completions(&self) -> Vec<(usize, u64)> {
        self.devices
            .iter()
            .filter_map(|d| d.next_event().map(|t| (d.line(), t)))
            .collect()
    }
    /// Bytes transmitted so far by one terminal.
    pub fn terminal_output(&self, number: usize) -> Vec<u8> {
        self.device(TERM_LINE, number)
            .map(|d| d.transmitted().to_vec())
            .unwrap_or_default()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
