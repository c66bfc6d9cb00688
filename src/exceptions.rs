// Exception dispatch. The machine deposits the interrupted state and this
// decides who deals with it: the interrupt handlers, the syscall layer, or
// the pass-up path that either continues the process in its support-level
// handler or kills it.

use crate::interrupts;
use crate::memory::{GENERAL, PAGE_FAULT};
use crate::nucleus::Nucleus;
use crate::processor::{exc_code, Machine, ProcessorState, EXC_INT, EXC_SYS, SP};
use crate::scheduler;
use crate::syscalls;
use crate::Control;
use log::{trace, warn};

pub fn handle(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    match exc_code(saved.cause) {
        EXC_INT => interrupts::handle(nucleus, machine, saved),
        1..=3 => pass_up_or_die(nucleus, machine, saved, PAGE_FAULT),
        EXC_SYS => syscalls::dispatch(nucleus, machine, saved),
        4..=7 | 9..=12 => pass_up_or_die(nucleus, machine, saved, GENERAL),
        code => {
            warn!("undefined exception code {}, terminating current process", code);
            if let Some(p) = nucleus.current {
                syscalls::terminate(nucleus, p);
            }
            scheduler::schedule(nucleus, machine)
        }
    }
}

/// Escalate an exception the kernel does not resolve itself: with a support
/// structure the saved state is parked there and the registered handler
/// context continues the same process; without one the process dies.
pub fn pass_up_or_die(
    nucleus: &mut Nucleus,
    machine: &mut Machine,
    saved: ProcessorState,
    kind: usize,
) -> Control {
    let cur = match nucleus.current {
        Some(cur) => cur,
        None => return Control::Panic(String::from("trap raised with no current process")),
    };
    match nucleus.pool.pcb(cur).support {
        None => {
            trace!("pcb {} has no support structure, dying on code {}", cur, exc_code(saved.cause));
            syscalls::terminate(nucleus, cur);
            scheduler::schedule(nucleus, machine)
        }
        Some(id) => {
            let support = match machine.bus.supports.get_mut(id - 1) {
                Some(support) => support,
                None => return Control::Panic(format!("pcb {} names missing support {}", cur, id)),
            };
            support.exc_state[kind] = saved;
            let context = support.exc_context[kind];
            trace!("passing pcb {} up to support {} handler {:#010x}", cur, id, context.pc);
            let mut state = ProcessorState::new();
            state.entry_hi = saved.entry_hi;
            state.pc = context.pc;
            state.status = context.status;
            state.gpr[SP] = context.sp;
            Control::LoadContext(state)
        }
    }
}
