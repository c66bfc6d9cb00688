// The demo board the devkit binary boots: the full device complement and a
// scripted workload that exercises every kernel service. Programs are built
// from ops and mapped together with the prototype state block CreateProcess
// copies.

use crate::devices::{
    user_sem, IoDevice, SemId, Terminal, CMD_OPERATION, COMMAND, DEV_PER_LINE, DISK_LINE,
    FLASH_LINE, NETWORK_LINE, PRINTER_LINE, TERM_LINE, TRANSM_COMMAND,
};
use crate::instructions::Op;
use crate::memory::Bus;
use crate::processor::EXC_OV;
use crate::syscalls::{
    CREATEPROCESS, GETCPUTIME, GETSUPPORTPTR, PASSEREN, TERMINATEPROCESS, VERHOGEN, WAITCLOCK,
    WAITIO,
};
use crate::Configuration;

/// An op-by-op program under construction, mapped at a fixed base address.
pub struct Program {
    pub base: u32,
    pub user: bool,
    pub ops: Vec<Op>,
}

impl Program {
    pub fn at(base: u32) -> Self {
        Program { base, user: false, ops: Vec::new() }
    }
    /// Run this program in user mode.
    pub fn user(mut self) -> Self {
        self.user = true;
        self
    }
    pub fn compute(mut self, usec: u32) -> Self {
        self.ops.push(Op::Compute { usec });
        self
    }
    pub fn syscall(mut self, num: u32, a1: u32, a2: u32, a3: u32) -> Self {
        self.ops.push(Op::Syscall { num, a1, a2, a3 });
        self
    }
    pub fn trap(mut self, code: u32) -> Self {
        self.ops.push(Op::Trap { code });
        self
    }
    pub fn io_command(mut self, line: usize, device: usize, field: usize, value: u32) -> Self {
        self.ops.push(Op::IoCommand { line, device, field, value });
        self
    }
    pub fn create(self, entry: u32, support: usize) -> Self {
        self.syscall(CREATEPROCESS, entry, support as u32, 0)
    }
    pub fn terminate(self) -> Self {
        self.syscall(TERMINATEPROCESS, 0, 0, 0)
    }
    pub fn p(self, sem: SemId) -> Self {
        self.syscall(PASSEREN, sem as u32, 0, 0)
    }
    pub fn v(self, sem: SemId) -> Self {
        self.syscall(VERHOGEN, sem as u32, 0, 0)
    }
    pub fn wait_io(self, line: usize, device: usize, transmit: bool) -> Self {
        self.syscall(WAITIO, line as u32, device as u32, transmit as u32)
    }
    pub fn cpu_time(self) -> Self {
        self.syscall(GETCPUTIME, 0, 0, 0)
    }
    pub fn wait_clock(self) -> Self {
        self.syscall(WAITCLOCK, 0, 0, 0)
    }
    pub fn support_ptr(self) -> Self {
        self.syscall(GETSUPPORTPTR, 0, 0, 0)
    }
    /// Transmit one byte on a terminal and wait for its completion.
    pub fn transmit(self, device: usize, byte: u8) -> Self {
        self.io_command(TERM_LINE, device, TRANSM_COMMAND, (byte as u32) << 8 | CMD_OPERATION)
            .wait_io(TERM_LINE, device, true)
    }
    pub fn print(mut self, device: usize, text: &str) -> Self {
        for byte in text.bytes() {
            self = self.transmit(device, byte);
        }
        self
    }
}

const BOOT: u32 = 0x0000_1000;
const PRODUCER: u32 = 0x0000_2000;
const CONSUMER: u32 = 0x0000_3000;
const WRITER: u32 = 0x0000_4000;
const SLEEPER: u32 = 0x0000_5000;
const FAULTER: u32 = 0x0000_6000;
const HANDLER: u32 = 0x0000_7000;

/// The demo machine: every device slot populated, and a workload of five
/// processes under a boot process that collects them on a semaphore before
/// shutting the machine down.
pub fn devkit() -> Configuration {
    let mut bus = Bus::new();
    for &(line, latency) in [
        (DISK_LINE, 500),
        (FLASH_LINE, 400),
        (NETWORK_LINE, 200),
        (PRINTER_LINE, 300),
    ]
    .iter()
    {
        for number in 0..DEV_PER_LINE {
            bus.attach(IoDevice::new(line, number, latency));
        }
    }
    for number in 0..DEV_PER_LINE {
        bus.attach(Terminal::new(number, 100));
    }
    let mut config = Configuration::new(bus);

    let done = user_sem(0);
    let full = user_sem(1);
    let support = config.add_support(HANDLER, HANDLER);

    config.load(
        Program::at(BOOT)
            .create(PRODUCER, 0)
            .create(CONSUMER, 0)
            .create(WRITER, 0)
            .create(SLEEPER, 0)
            .create(FAULTER, support)
            .p(done)
            .p(done)
            .p(done)
            .p(done)
            .p(done)
            .terminate(),
    );
    config.load(
        Program::at(PRODUCER)
            .compute(2_000)
            .v(full)
            .compute(2_000)
            .v(full)
            .compute(2_000)
            .v(full)
            .v(done)
            .terminate(),
    );
    config.load(
        Program::at(CONSUMER)
            .p(full)
            .compute(1_000)
            .p(full)
            .compute(1_000)
            .p(full)
            .compute(1_000)
            .v(done)
            .terminate(),
    );
    config.load(
        Program::at(WRITER)
            .print(0, "devkit up\n")
            .io_command(DISK_LINE, 0, COMMAND, CMD_OPERATION)
            .wait_io(DISK_LINE, 0, false)
            .cpu_time()
            .v(done)
            .terminate(),
    );
    config.load(
        Program::at(SLEEPER)
            .wait_clock()
            .wait_clock()
            .v(done)
            .terminate(),
    );
    config.load(
        Program::at(FAULTER)
            .support_ptr()
            .compute(300)
            .trap(EXC_OV),
    );
    config.load(
        Program::at(HANDLER)
            .print(1, "!")
            .v(done)
            .terminate(),
    );
    config.entry = BOOT;
    config
}
