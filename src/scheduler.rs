// Round-robin dispatch. One call, one outcome: either the head of the ready
// queue is loaded with a fresh quantum, or the machine halts, idles, or is
// declared deadlocked. The returned Control is consumed by the run loop;
// this function never resumes its caller in any other way.

use crate::nucleus::Nucleus;
use crate::processor::{Machine, Status, QUANTUM};
use crate::Control;
use log::{info, trace, warn};

pub fn schedule(nucleus: &mut Nucleus, machine: &mut Machine) -> Control {
    if let Some(p) = nucleus.ready.dequeue(&mut nucleus.pool) {
        nucleus.current = Some(p);
        machine.set_plt(QUANTUM);
        let pcb = nucleus.pool.pcb_mut(p);
        pcb.start_tod = machine.tod();
        trace!("dispatch pcb {} at pc {:#010x}", p, pcb.state.pc);
        return Control::LoadState(pcb.state);
    }
    nucleus.current = None;
    if nucleus.process_count == 0 {
        info!("no processes left, halting");
        Control::Halt
    } else if nucleus.soft_blocked > 0 {
        trace!("idle: {} soft-blocked", nucleus.soft_blocked);
        Control::Wait(idle_status())
    } else {
        warn!(
            "deadlock: {} processes, none ready, none soft-blocked",
            nucleus.process_count
        );
        Control::Panic(String::from("deadlock: no ready or soft-blocked processes"))
    }
}

/// Idle status word: interrupts on for every line, the local timer off so
/// the quantum cannot fire with nothing running.
fn idle_status() -> Status {
    Status::IEC | Status::IM
}
