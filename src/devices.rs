// Peripheral devices of the emulated machine. Every device owns a register
// frame of four word fields and talks the same protocol: a command makes it
// BUSY, the operation completes `latency` microseconds later, and the device
// then holds its interrupt line asserted until the kernel ACKs it.

use std::collections::VecDeque;

use log::trace;

pub const DEV_PER_LINE: usize = 8;
/// Interrupt lines with devices on them: disk, flash, network, printer, terminal.
pub const DISK_LINE: usize = 3;
pub const FLASH_LINE: usize = 4;
pub const NETWORK_LINE: usize = 5;
pub const PRINTER_LINE: usize = 6;
pub const TERM_LINE: usize = 7;

/// Device semaphores: four plain device classes, terminals split into
/// receive/transmit halves, plus the pseudo-clock in the last slot.
pub const DEV_SEM_COUNT: usize = 4 * DEV_PER_LINE + 2 * DEV_PER_LINE + 1;
pub const CLOCK_SEM: usize = DEV_SEM_COUNT - 1;
pub const MAX_USER_SEMS: usize = 32;
pub const SEM_COUNT: usize = DEV_SEM_COUNT + MAX_USER_SEMS;

pub type SemId = usize;

/// Semaphore slot for a device. Terminals occupy two consecutive slots per
/// device, transmit in the odd one; `transmit` is ignored for other lines.
pub fn device_sem(line: usize, device: usize, transmit: bool) -> SemId {
    if line == TERM_LINE {
        4 * DEV_PER_LINE + device * 2 + transmit as usize
    } else {
        (line - DISK_LINE) * DEV_PER_LINE + device
    }
}

/// True for device and pseudo-clock semaphores, the ones that count as
/// soft-blocked waits.
pub fn is_device_sem(sem: SemId) -> bool {
    sem < DEV_SEM_COUNT
}

/// First user semaphore slot; workloads name their semaphores relative to this.
pub fn user_sem(n: usize) -> SemId {
    DEV_SEM_COUNT + n
}

// Register frame fields.
pub const STATUS: usize = 0;
pub const COMMAND: usize = 1;
pub const DATA0: usize = 2;
pub const DATA1: usize = 3;
// Terminals: two subdevices in one frame.
pub const RECV_STATUS: usize = 0;
pub const RECV_COMMAND: usize = 1;
pub const TRANSM_STATUS: usize = 2;
pub const TRANSM_COMMAND: usize = 3;

// Command codes. Anything >= OPERATION starts the device's one operation;
// terminals carry the character in bits 8-15 of a transmit command.
pub const CMD_RESET: u32 = 0;
pub const CMD_ACK: u32 = 1;
pub const CMD_OPERATION: u32 = 2;

// Status codes. The character of a completed terminal operation sits in
// bits 8-15 above ST_CHAR_OK.
pub const ST_NOT_INSTALLED: u32 = 0;
pub const ST_READY: u32 = 1;
pub const ST_BUSY: u32 = 3;
pub const ST_CHAR_OK: u32 = 5;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct IRQ {
    pub line: usize,
    pub device: usize,
}

pub trait Device {
    fn line(&self) -> usize;
    fn number(&self) -> usize;
    /// Let the device notice that time has passed: completions whose due
    /// time is reached latch their final status and assert the line.
    fn update(&mut self, tod: u64);
    fn read(&self, field: usize) -> u32;
    fn write(&mut self, field: usize, value: u32, tod: u64);
    /// Asserted until the pending completion is ACKed.
    fn interrupt_request(&self) -> Option<IRQ>;
    /// Earliest future completion, for the idle loop's event horizon.
    fn next_event(&self) -> Option<u64>;
    /// Bytes a terminal has transmitted so far; empty for everything else.
    fn transmitted(&self) -> &[u8] {
        &[]
    }
}

/// A disk, flash, network or printer unit: one operation at a time, fixed
/// latency, status READY once the operation has completed.
pub struct IoDevice {
    line: usize,
    number: usize,
    latency: u64,
    status: u32,
    data0: u32,
    data1: u32,
    completion: Option<u64>,
    pending: bool,
}

impl IoDevice {
    pub fn new(line: usize, number: usize, latency: u64) -> Box<Self> {
        Box::new(Self {
            line,
            number,
            latency,
            status: ST_READY,
            data0: 0,
            data1: 0,
            completion: None,
            pending: false,
        })
    }
}

impl Device for IoDevice {
    fn line(&self) -> usize {
        self.line
    }
    fn number(&self) -> usize {
        self.number
    }
    fn update(&mut self, tod: u64) {
        if let Some(due) = self.completion {
            if tod >= due {
                self.completion = None;
                self.status = ST_READY;
                self.pending = true;
                trace!("device {}.{} completed", self.line, self.number);
            }
        }
    }
    fn read(&self, field: usize) -> u32 {
        match field {
            STATUS => self.status,
            DATA0 => self.data0,
            DATA1 => self.data1,
            _ => 0,
        }
    }
    fn write(&mut self, field: usize, value: u32, tod: u64) {
        match field {
            COMMAND => match value {
                CMD_RESET => {
                    self.status = ST_READY;
                    self.completion = None;
                    self.pending = false;
                }
                CMD_ACK => {
                    self.pending = false;
                    if self.completion.is_none() {
                        self.status = ST_READY;
                    }
                }
                _ => {
                    if self.status != ST_BUSY {
                        self.status = ST_BUSY;
                        self.completion = Some(tod + self.latency);
                    }
                }
            },
            DATA0 => self.data0 = value,
            DATA1 => self.data1 = value,
            _ => {}
        }
    }
    fn interrupt_request(&self) -> Option<IRQ> {
        if self.pending {
            Some(IRQ { line: self.line, device: self.number })
        } else {
            None
        }
    }
    fn next_event(&self) -> Option<u64> {
        self.completion
    }
}

struct TermHalf {
    status: u32,
    completion: Option<u64>,
    pending: bool,
}

impl TermHalf {
    fn new() -> Self {
        TermHalf { status: ST_READY, completion: None, pending: false }
    }
    fn ack(&mut self) {
        self.pending = false;
        if self.completion.is_none() {
            self.status = ST_READY;
        }
    }
}

/// A terminal: independent receive and transmit subdevices sharing one
/// register frame. Transmitted bytes are retained for the host to read;
/// received characters come from a scripted input queue.
pub struct Terminal {
    number: usize,
    latency: u64,
    recv: TermHalf,
    xmit: TermHalf,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl Terminal {
    pub fn new(number: usize, latency: u64) -> Box<Self> {
        Box::new(Self {
            number,
            latency,
            recv: TermHalf::new(),
            xmit: TermHalf::new(),
            input: VecDeque::new(),
            output: Vec::new(),
        })
    }
    pub fn with_input(number: usize, latency: u64, input: &str) -> Box<Self> {
        let mut term = Self::new(number, latency);
        term.input = input.bytes().collect();
        term
    }
}

impl Device for Terminal {
    fn line(&self) -> usize {
        TERM_LINE
    }
    fn number(&self) -> usize {
        self.number
    }
    fn update(&mut self, tod: u64) {
        if let Some(due) = self.xmit.completion {
            if tod >= due {
                self.xmit.completion = None;
                self.xmit.pending = true;
                self.output.push((self.xmit.status >> 8) as u8);
                self.xmit.status = ST_CHAR_OK | (self.xmit.status & 0xff00);
                trace!("terminal {} transmitted {:?}", self.number, (self.xmit.status >> 8) as u8 as char);
            }
        }
        if let Some(due) = self.recv.completion {
            if tod >= due {
                self.recv.completion = None;
                self.recv.pending = true;
                let ch = self.input.pop_front().unwrap_or(0);
                self.recv.status = ST_CHAR_OK | (ch as u32) << 8;
            }
        }
    }
    fn read(&self, field: usize) -> u32 {
        match field {
            RECV_STATUS => self.recv.status,
            TRANSM_STATUS => self.xmit.status,
            _ => 0,
        }
    }
    fn write(&mut self, field: usize, value: u32, tod: u64) {
        match field {
            RECV_COMMAND => match value {
                CMD_RESET => self.recv = TermHalf::new(),
                CMD_ACK => self.recv.ack(),
                _ => {
                    // A receive with no input queued stays BUSY until the
                    // scripted input would provide a character.
                    if self.recv.status != ST_BUSY {
                        self.recv.status = ST_BUSY;
                        if !self.input.is_empty() {
                            self.recv.completion = Some(tod + self.latency);
                        }
                    }
                }
            },
            TRANSM_COMMAND => match value {
                CMD_RESET => self.xmit = TermHalf::new(),
                CMD_ACK => self.xmit.ack(),
                _ => {
                    if self.xmit.status & 0xff != ST_BUSY {
                        // The character parks in the status high bits until
                        // the completion latches it.
                        self.xmit.status = ST_BUSY | (value & 0xff00);
                        self.xmit.completion = Some(tod + self.latency);
                    }
                }
            },
            _ => {}
        }
    }
    fn interrupt_request(&self) -> Option<IRQ> {
        if self.xmit.pending || self.recv.pending {
            Some(IRQ { line: TERM_LINE, device: self.number })
        } else {
            None
        }
    }
    fn next_event(&self) -> Option<u64> {
        match (self.xmit.completion, self.recv.completion) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
    fn transmitted(&self) -> &[u8] {
        &self.output
    }
}
