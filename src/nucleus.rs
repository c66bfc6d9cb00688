// The kernel's global state, gathered in one context value: the PCB pool,
// the ASL, the ready queue, the running process and the two counters, plus
// the semaphore table whose first slots belong to the devices. Single CPU,
// interrupts disabled while the kernel runs, so plain exclusive access is
// all the locking there is.

use crate::asl::Asl;
use crate::devices::{is_device_sem, SemId, SEM_COUNT};
use crate::memory::PassUpVector;
use crate::pcb::{PcbPool, Pid, ProcQueue, MAXPROC};
use crate::processor::{Machine, PSECOND};
use crate::scheduler;
use crate::Control;
use log::info;

/// Shared kernel stack named by the Pass-Up Vector.
pub const KERNEL_STACK: u32 = 0x0000_2000;
/// Exception and TLB-refill entry points the vector advertises.
pub const EXCEPTION_VECTOR: u32 = 0x0000_0080;
pub const REFILL_VECTOR: u32 = 0x0000_0040;

pub struct Nucleus {
    pub pool: PcbPool,
    pub asl: Asl,
    pub ready: ProcQueue,
    pub current: Option<Pid>,
    /// Live PCBs, i.e. everything not on the free list.
    pub process_count: usize,
    /// Processes blocked on a device or pseudo-clock semaphore.
    pub soft_blocked: usize,
    /// Semaphore counters; slots below DEV_SEM_COUNT are the device and
    /// pseudo-clock semaphores, the rest belong to workloads.
    pub semaphores: [i32; SEM_COUNT],
}

impl Nucleus {
    pub fn new() -> Self {
        Nucleus {
            pool: PcbPool::new(),
            asl: Asl::new(),
            ready: ProcQueue::new(),
            current: None,
            process_count: 0,
            soft_blocked: 0,
            semaphores: [0; SEM_COUNT],
        }
    }

    /// Boot: install the Pass-Up Vector, start the pseudo-clock, create the
    /// first process from the state block at `entry` and dispatch it.
    pub fn init(&mut self, machine: &mut Machine, entry: u32) -> Control {
        machine.bus.passup = Some(PassUpVector {
            exception_pc: EXCEPTION_VECTOR,
            refill_pc: REFILL_VECTOR,
            stack: KERNEL_STACK,
        });
        machine.load_interval(PSECOND);
        let state = match machine.bus.read_state(entry) {
            Some(state) => state,
            None => return Control::Panic(format!("no boot state block at {:#010x}", entry)),
        };
        let p = match self.pool.allocate() {
            Some(p) => p,
            None => return Control::Panic(String::from("pcb pool empty at boot")),
        };
        self.pool.pcb_mut(p).state = state;
        self.ready.enqueue(&mut self.pool, p);
        self.process_count = 1;
        info!("nucleus up, boot process {} at {:#010x}", p, entry);
        scheduler::schedule(self, machine)
    }

    /// Move the head waiter of `sem` to the ready queue. This is the single
    /// place soft_blocked comes back down, so every unblock path agrees.
    pub fn wake(&mut self, sem: SemId) -> Option<Pid> {
        let p = self.asl.remove_blocked(&mut self.pool, sem)?;
        if is_device_sem(sem) {
            self.soft_blocked -= 1;
        }
        self.ready.enqueue(&mut self.pool, p);
        Some(p)
    }

    /// V: increment the counter and, when it stays non-positive, wake the
    /// head waiter.
    pub fn v(&mut self, sem: SemId) -> Option<Pid> {
        self.semaphores[sem] += 1;
        if self.semaphores[sem] <= 0 {
            self.wake(sem)
        } else {
            None
        }
    }

    /// Charge the elapsed slice to the current process. Idempotent within
    /// one kernel entry: the start timestamp moves up to `now`.
    pub fn charge_current(&mut self, now: u64) {
        if let Some(p) = self.current {
            let pcb = self.pool.pcb_mut(p);
            pcb.time += now - pcb.start_tod;
            pcb.start_tod = now;
        }
    }

    /// Structural invariants, checked by tests and the inspector: every PCB
    /// in exactly one place, counters consistent, ASL sorted with no empty
    /// descriptors, wait-queue membership matching the semaphore links.
    pub fn audit(&self) -> Result<(), String> {
        let live = MAXPROC - self.pool.free_count();
        if self.process_count != live {
            return Err(format!("process_count {} but {} live pcbs", self.process_count, live));
        }
        let mut seen = vec![0usize; MAXPROC];
        for p in self.ready.pids(&self.pool) {
            seen[p] += 1;
            if self.pool.pcb(p).sem.is_some() {
                return Err(format!("ready pcb {} still linked to a semaphore", p));
            }
        }
        let entries = self.asl.entries(&self.pool);
        let mut soft = 0;
        for (sem, pids) in &entries {
            if pids.is_empty() {
                return Err(format!("descriptor for sem {} on the asl with no waiters", sem));
            }
            if is_device_sem(*sem) {
                soft += pids.len();
            }
            for &p in pids {
                seen[p] += 1;
                if self.pool.pcb(p).sem != Some(*sem) {
                    return Err(format!("pcb {} queued on sem {} but linked elsewhere", p, sem));
                }
            }
        }
        for pair in entries.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(format!("asl out of order at sem {}", pair[1].0));
            }
        }
        if soft != self.soft_blocked {
            return Err(format!("soft_blocked {} but {} device waiters", self.soft_blocked, soft));
        }
        if let Some(c) = self.current {
            seen[c] += 1;
            if self.pool.pcb(c).sem.is_some() {
                return Err(format!("running pcb {} linked to a semaphore", c));
            }
        }
        for p in 0..MAXPROC {
            let expected = !self.pool.is_free(p) as usize;
            if seen[p] != expected {
                return Err(format!("pcb {} appears in {} places, expected {}", p, seen[p], expected));
            }
        }
        Ok(())
    }
}

impl Default for Nucleus {
    fn default() -> Self {
        Self::new()
    }
}
