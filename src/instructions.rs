// The instruction stream the emulated machine executes. Real code is beside
// the point here; what matters to the kernel is *when* a process computes,
// traps, or touches a device register. Each variant is one machine word.

/// Machine word size; the PC advances by this per instruction.
pub const WORDLEN: u32 = 4;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Op {
    /// Burn CPU time for the given number of microseconds. The countdown
    /// lives in register `t8` of the running state, so a preempted compute
    /// resumes exactly where it left off after the next dispatch.
    Compute { usec: u32 },
    /// Load `a0..a3` and raise exception code 8 (SYSCALL). The saved PC
    /// points at this instruction; the kernel advances it.
    Syscall { num: u32, a1: u32, a2: u32, a3: u32 },
    /// Raise a TLB or program-trap exception code (1-7, 9-12).
    Trap { code: u32 },
    /// Write a device register field, e.g. a disk command or a terminal
    /// transmit command with the character in bits 8-15.
    IoCommand { line: usize, device: usize, field: usize, value: u32 },
}
