// Interrupt handling, highest-priority (lowest) line first: the local timer
// ends the quantum, the interval timer broadcasts the pseudo-clock, and the
// device lines run the latch-ACK-V protocol that hands the status to the
// blocked waiter. One device is serviced per entry; anything else still
// pending interrupts again on the next dispatch.

use crate::devices::{
    device_sem, CMD_ACK, COMMAND, DEV_PER_LINE, CLOCK_SEM, RECV_COMMAND, RECV_STATUS, STATUS,
    ST_CHAR_OK, TERM_LINE, TRANSM_COMMAND, TRANSM_STATUS,
};
use crate::nucleus::Nucleus;
use crate::processor::{ip_lines, Machine, ProcessorState, PSECOND, QUANTUM, V0};
use crate::scheduler;
use crate::Control;
use log::{debug, trace};

pub fn handle(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    let ip = ip_lines(saved.cause);
    match (0..8).find(|&line| ip & (1 << line) != 0) {
        Some(1) => quantum_expired(nucleus, machine, saved),
        Some(2) => pseudo_clock(nucleus, machine, saved),
        Some(line) if (3..8).contains(&line) => device(nucleus, machine, saved, line),
        _ => Control::Panic(format!("interrupt with unserviceable IP {:#04x}", ip)),
    }
}

fn quantum_expired(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    machine.set_plt(QUANTUM);
    if let Some(cur) = nucleus.current {
        nucleus.charge_current(machine.tod());
        nucleus.pool.pcb_mut(cur).state = saved;
        nucleus.current = None;
        nucleus.ready.enqueue(&mut nucleus.pool, cur);
        trace!("quantum expired for pcb {}", cur);
    }
    scheduler::schedule(nucleus, machine)
}

/// The 100 ms tick: release every pseudo-clock waiter and zero the counter.
/// The pseudo-clock broadcasts; it does not count.
fn pseudo_clock(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    machine.load_interval(PSECOND);
    let mut woken = 0;
    while nucleus.wake(CLOCK_SEM).is_some() {
        woken += 1;
    }
    nucleus.semaphores[CLOCK_SEM] = 0;
    if woken > 0 {
        debug!("pseudo-clock tick released {} waiters", woken);
    }
    resume(nucleus, machine, saved)
}

fn device(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState, line: usize) -> Control {
    let bitmap = machine.bus.int_bitmap(line);
    let number = match (0..DEV_PER_LINE).find(|&d| bitmap & (1 << d) != 0) {
        Some(number) => number,
        None => return resume(nucleus, machine, saved),
    };
    let tod = machine.tod();
    let device = match machine.bus.device_mut(line, number) {
        Some(device) => device,
        None => return resume(nucleus, machine, saved),
    };
    // Latch the status, then ACK to drop the interrupt line. Terminals
    // service a completed transmission before a pending reception.
    let (latched, sem) = if line == TERM_LINE {
        let transm = device.read(TRANSM_STATUS);
        if transm & 0xff == ST_CHAR_OK {
            device.write(TRANSM_COMMAND, CMD_ACK, tod);
            (transm, device_sem(line, number, true))
        } else {
            let recv = device.read(RECV_STATUS);
            device.write(RECV_COMMAND, CMD_ACK, tod);
            (recv, device_sem(line, number, false))
        }
    } else {
        let status = device.read(STATUS);
        device.write(COMMAND, CMD_ACK, tod);
        (status, device_sem(line, number, false))
    };
    trace!("line {} device {} interrupt, status {:#x}", line, number, latched);
    if let Some(p) = nucleus.v(sem) {
        nucleus.pool.pcb_mut(p).state.gpr[V0] = latched;
        debug!("pcb {} resumed with device status {:#x}", p, latched);
    }
    resume(nucleus, machine, saved)
}

/// Back to whoever was interrupted, or through the scheduler if the
/// interrupt arrived while the machine was idling.
fn resume(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    if nucleus.current.is_some() {
        Control::LoadState(saved)
    } else {
        scheduler::schedule(nucleus, machine)
    }
}
