// The eight kernel services. The syscall number travels in a0, arguments in
// a1-a3, results in v0. Privileged numbers from user mode become a
// reserved-instruction trap; numbers past the table are passed up. The
// saved PC is advanced before dispatch so that even the non-returning
// services resume after the SYSCALL instruction.

use crate::devices::{
    device_sem, is_device_sem, CLOCK_SEM, DEV_PER_LINE, DISK_LINE, RECV_STATUS, SEM_COUNT, STATUS,
    ST_NOT_INSTALLED, TERM_LINE, TRANSM_STATUS,
};
use crate::exceptions;
use crate::instructions::WORDLEN;
use crate::memory::GENERAL;
use crate::nucleus::Nucleus;
use crate::pcb::Pid;
use crate::processor::{ip_lines, mkcause, Machine, ProcessorState, A0, A1, A2, A3, EXC_ADEL, EXC_RI, V0};
use crate::scheduler;
use crate::Control;
use log::debug;

pub const CREATEPROCESS: u32 = 1;
pub const TERMINATEPROCESS: u32 = 2;
pub const PASSEREN: u32 = 3;
pub const VERHOGEN: u32 = 4;
pub const WAITIO: u32 = 5;
pub const GETCPUTIME: u32 = 6;
pub const WAITCLOCK: u32 = 7;
pub const GETSUPPORTPTR: u32 = 8;

pub fn dispatch(nucleus: &mut Nucleus, machine: &mut Machine, mut saved: ProcessorState) -> Control {
    let num = saved.gpr[A0];
    if (CREATEPROCESS..=GETSUPPORTPTR).contains(&num) && saved.status.was_user_mode() {
        debug!("user-mode syscall {}: reserved instruction", num);
        saved.cause = mkcause(EXC_RI, ip_lines(saved.cause));
        return exceptions::pass_up_or_die(nucleus, machine, saved, GENERAL);
    }
    saved.pc += WORDLEN;
    match num {
        CREATEPROCESS => create_process(nucleus, machine, saved),
        TERMINATEPROCESS => terminate_process(nucleus, machine),
        PASSEREN => passeren(nucleus, machine, saved),
        VERHOGEN => verhogen(nucleus, machine, saved),
        WAITIO => wait_io(nucleus, machine, saved),
        GETCPUTIME => get_cpu_time(nucleus, machine, saved),
        WAITCLOCK => wait_clock(nucleus, machine, saved),
        GETSUPPORTPTR => get_support_ptr(nucleus, machine, saved),
        _ => {
            debug!("syscall {} is not a kernel service, passing up", num);
            exceptions::pass_up_or_die(nucleus, machine, saved, GENERAL)
        }
    }
}

fn current(nucleus: &Nucleus) -> Result<Pid, Control> {
    nucleus
        .current
        .ok_or_else(|| Control::Panic(String::from("syscall with no current process")))
}

/// A wild argument is the moral equivalent of a bad dereference on the real
/// machine: an address-error trap, pass-up-or-die.
fn address_trap(
    nucleus: &mut Nucleus,
    machine: &mut Machine,
    mut saved: ProcessorState,
) -> Control {
    saved.cause = mkcause(EXC_ADEL, 0);
    exceptions::pass_up_or_die(nucleus, machine, saved, GENERAL)
}

fn create_process(nucleus: &mut Nucleus, machine: &mut Machine, mut saved: ProcessorState) -> Control {
    let parent = match current(nucleus) {
        Ok(p) => p,
        Err(control) => return control,
    };
    let child_state = match machine.bus.read_state(saved.gpr[A1]) {
        Some(state) => state,
        None => return address_trap(nucleus, machine, saved),
    };
    let support = saved.gpr[A2] as usize;
    if support > machine.bus.supports.len() {
        return address_trap(nucleus, machine, saved);
    }
    match nucleus.pool.allocate() {
        Some(child) => {
            let pcb = nucleus.pool.pcb_mut(child);
            pcb.state = child_state;
            pcb.support = if support > 0 { Some(support) } else { None };
            nucleus.pool.insert_child(parent, child);
            nucleus.ready.enqueue(&mut nucleus.pool, child);
            nucleus.process_count += 1;
            debug!("pcb {} created under {}", child, parent);
            saved.gpr[V0] = 0;
        }
        None => {
            debug!("pcb pool exhausted, create fails");
            saved.gpr[V0] = -1i32 as u32;
        }
    }
    Control::LoadState(saved)
}

fn terminate_process(nucleus: &mut Nucleus, machine: &mut Machine) -> Control {
    let cur = match current(nucleus) {
        Ok(p) => p,
        Err(control) => return control,
    };
    terminate(nucleus, cur);
    scheduler::schedule(nucleus, machine)
}

/// Remove `root` and every descendant, whatever state each is in. Blocked
/// victims leave their wait queue; a P on a plain semaphore is undone, but
/// device counters are left alone since the outstanding completion will
/// still arrive and simply find no waiter.
pub fn terminate(nucleus: &mut Nucleus, root: Pid) {
    nucleus.pool.detach(root);
    let mut worklist = vec![root];
    while let Some(p) = worklist.pop() {
        while let Some(child) = nucleus.pool.remove_first_child(p) {
            worklist.push(child);
        }
        reap(nucleus, p);
    }
}

fn reap(nucleus: &mut Nucleus, p: Pid) {
    if nucleus.current == Some(p) {
        nucleus.current = None;
    } else if let Some(sem) = nucleus.pool.pcb(p).sem {
        nucleus.asl.out_blocked(&mut nucleus.pool, p);
        if is_device_sem(sem) {
            nucleus.soft_blocked -= 1;
        } else {
            nucleus.semaphores[sem] += 1;
        }
    } else {
        nucleus.ready.remove(&mut nucleus.pool, p);
    }
    nucleus.pool.release(p);
    nucleus.process_count -= 1;
    debug!("pcb {} terminated", p);
}

/// Charge the slice, park the saved state in the PCB, block on `sem` and
/// give the CPU away. `soft` marks device and pseudo-clock waits.
fn block(
    nucleus: &mut Nucleus,
    machine: &mut Machine,
    saved: ProcessorState,
    sem: usize,
    soft: bool,
) -> Control {
    let cur = match current(nucleus) {
        Ok(p) => p,
        Err(control) => return control,
    };
    nucleus.charge_current(machine.tod());
    nucleus.pool.pcb_mut(cur).state = saved;
    nucleus.current = None;
    if soft {
        nucleus.soft_blocked += 1;
    }
    if nucleus.asl.insert_blocked(&mut nucleus.pool, sem, cur) {
        return Control::Panic(String::from("semaphore descriptor pool exhausted"));
    }
    debug!("pcb {} blocked on sem {}", cur, sem);
    scheduler::schedule(nucleus, machine)
}

fn passeren(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    let sem = saved.gpr[A1] as usize;
    if sem >= SEM_COUNT {
        return address_trap(nucleus, machine, saved);
    }
    nucleus.semaphores[sem] -= 1;
    if nucleus.semaphores[sem] < 0 {
        block(nucleus, machine, saved, sem, false)
    } else {
        Control::LoadState(saved)
    }
}

fn verhogen(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    let sem = saved.gpr[A1] as usize;
    if sem >= SEM_COUNT {
        return address_trap(nucleus, machine, saved);
    }
    if let Some(p) = nucleus.v(sem) {
        debug!("pcb {} released from sem {}", p, sem);
    }
    Control::LoadState(saved)
}

fn wait_io(nucleus: &mut Nucleus, machine: &mut Machine, mut saved: ProcessorState) -> Control {
    let line = saved.gpr[A1] as usize;
    let device = saved.gpr[A2] as usize;
    let transmit = saved.gpr[A3] != 0;
    if !(DISK_LINE..=TERM_LINE).contains(&line) || device >= DEV_PER_LINE {
        return address_trap(nucleus, machine, saved);
    }
    let sem = device_sem(line, device, transmit);
    nucleus.semaphores[sem] -= 1;
    if nucleus.semaphores[sem] < 0 {
        block(nucleus, machine, saved, sem, true)
    } else {
        // The completion beat us here; its status is still in the register
        // frame, so return it without ever blocking.
        let field = if line == TERM_LINE {
            if transmit {
                TRANSM_STATUS
            } else {
                RECV_STATUS
            }
        } else {
            STATUS
        };
        let status = machine
            .bus
            .device(line, device)
            .map(|d| d.read(field))
            .unwrap_or(ST_NOT_INSTALLED);
        saved.gpr[V0] = status;
        Control::LoadState(saved)
    }
}

fn get_cpu_time(nucleus: &mut Nucleus, machine: &mut Machine, mut saved: ProcessorState) -> Control {
    let cur = match current(nucleus) {
        Ok(p) => p,
        Err(control) => return control,
    };
    let pcb = nucleus.pool.pcb(cur);
    saved.gpr[V0] = (pcb.time + (machine.tod() - pcb.start_tod)) as u32;
    Control::LoadState(saved)
}

fn wait_clock(nucleus: &mut Nucleus, machine: &mut Machine, saved: ProcessorState) -> Control {
    nucleus.semaphores[CLOCK_SEM] -= 1;
    if nucleus.semaphores[CLOCK_SEM] < 0 {
        block(nucleus, machine, saved, CLOCK_SEM, true)
    } else {
        Control::LoadState(saved)
    }
}

fn get_support_ptr(nucleus: &mut Nucleus, _machine: &mut Machine, mut saved: ProcessorState) -> Control {
    let cur = match current(nucleus) {
        Ok(p) => p,
        Err(control) => return control,
    };
    saved.gpr[V0] = nucleus.pool.pcb(cur).support.unwrap_or(0) as u32;
    Control::LoadState(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{user_sem, IoDevice, ST_READY};
    use crate::memory::Bus;
    use crate::pcb::MAXPROC;
    use crate::processor::Status;

    const STATEP: u32 = 0x4000;

    fn setup() -> (Nucleus, Machine) {
        let mut bus = Bus::new();
        let mut proto = ProcessorState::new();
        proto.pc = 0x8000;
        proto.status = Status::IEP | Status::IM | Status::TE;
        bus.store_state(STATEP, proto);
        let mut nucleus = Nucleus::new();
        let boot = nucleus.pool.allocate().unwrap();
        nucleus.current = Some(boot);
        nucleus.process_count = 1;
        (nucleus, Machine::new(bus))
    }

    fn syscall(num: u32, a1: u32, a2: u32, a3: u32) -> ProcessorState {
        let mut saved = ProcessorState::new();
        saved.pc = 0x1000;
        saved.gpr[A0] = num;
        saved.gpr[A1] = a1;
        saved.gpr[A2] = a2;
        saved.gpr[A3] = a3;
        saved
    }

    fn returned(control: Control) -> ProcessorState {
        match control {
            Control::LoadState(state) => state,
            other => panic!("expected LoadState, got {:?}", other),
        }
    }

    #[test]
    fn create_links_the_child_and_returns_zero() {
        let (mut nucleus, mut machine) = setup();
        let parent = nucleus.current.unwrap();
        let state = returned(dispatch(&mut nucleus, &mut machine, syscall(CREATEPROCESS, STATEP, 0, 0)));
        assert_eq!(state.gpr[V0], 0);
        assert_eq!(state.pc, 0x1000 + WORDLEN);
        assert_eq!(nucleus.process_count, 2);
        let child = nucleus.pool.first_child(parent).unwrap();
        assert_eq!(nucleus.pool.parent_of(child), Some(parent));
        assert_eq!(nucleus.ready.head(&nucleus.pool), Some(child));
        assert_eq!(nucleus.pool.pcb(child).state.pc, 0x8000);
        nucleus.audit().unwrap();
    }

    #[test]
    fn create_reports_pool_exhaustion() {
        let (mut nucleus, mut machine) = setup();
        while nucleus.pool.allocate().is_some() {
            nucleus.process_count += 1;
        }
        let before = nucleus.process_count;
        let state = returned(dispatch(&mut nucleus, &mut machine, syscall(CREATEPROCESS, STATEP, 0, 0)));
        assert_eq!(state.gpr[V0] as i32, -1);
        assert_eq!(nucleus.process_count, before);
    }

    #[test]
    fn p_blocks_below_zero_and_v_wakes_in_fifo_order() {
        let (mut nucleus, mut machine) = setup();
        let a = nucleus.current.unwrap();
        let sem = user_sem(0) as u32;
        dispatch(&mut nucleus, &mut machine, syscall(PASSEREN, sem, 0, 0));
        assert_eq!(nucleus.semaphores[sem as usize], -1);
        assert_eq!(nucleus.pool.pcb(a).sem, Some(sem as usize));
        assert_eq!(nucleus.soft_blocked, 0);

        let b = nucleus.pool.allocate().unwrap();
        nucleus.process_count += 1;
        nucleus.current = Some(b);
        dispatch(&mut nucleus, &mut machine, syscall(PASSEREN, sem, 0, 0));
        assert_eq!(nucleus.semaphores[sem as usize], -2);

        let c = nucleus.pool.allocate().unwrap();
        nucleus.process_count += 1;
        nucleus.current = Some(c);
        returned(dispatch(&mut nucleus, &mut machine, syscall(VERHOGEN, sem, 0, 0)));
        returned(dispatch(&mut nucleus, &mut machine, syscall(VERHOGEN, sem, 0, 0)));
        assert_eq!(nucleus.semaphores[sem as usize], 0);
        assert_eq!(nucleus.ready.pids(&nucleus.pool), vec![a, b]);
        nucleus.audit().unwrap();
    }

    #[test]
    fn terminate_undoes_plain_p_but_not_device_counters() {
        let (mut nucleus, mut machine) = setup();
        let a = nucleus.current.unwrap();
        let sem = user_sem(1);
        dispatch(&mut nucleus, &mut machine, syscall(PASSEREN, sem as u32, 0, 0));
        terminate(&mut nucleus, a);
        assert_eq!(nucleus.semaphores[sem], 0);
        assert_eq!(nucleus.process_count, 0);

        let (mut nucleus, mut machine) = setup();
        let b = nucleus.current.unwrap();
        dispatch(&mut nucleus, &mut machine, syscall(WAITIO, DISK_LINE as u32, 2, 0));
        let dsem = device_sem(DISK_LINE, 2, false);
        assert_eq!(nucleus.soft_blocked, 1);
        assert_eq!(nucleus.semaphores[dsem], -1);
        terminate(&mut nucleus, b);
        assert_eq!(nucleus.soft_blocked, 0);
        assert_eq!(nucleus.semaphores[dsem], -1);
        assert_eq!(nucleus.process_count, 0);
        nucleus.audit().unwrap();
    }

    #[test]
    fn terminate_takes_the_whole_subtree() {
        let (mut nucleus, mut machine) = setup();
        let root = nucleus.current.unwrap();
        returned(dispatch(&mut nucleus, &mut machine, syscall(CREATEPROCESS, STATEP, 0, 0)));
        returned(dispatch(&mut nucleus, &mut machine, syscall(CREATEPROCESS, STATEP, 0, 0)));
        let kids = nucleus.pool.children(root);
        let grandchild_parent = kids[0];
        nucleus.current = Some(grandchild_parent);
        nucleus.ready.remove(&mut nucleus.pool, grandchild_parent);
        returned(dispatch(&mut nucleus, &mut machine, syscall(CREATEPROCESS, STATEP, 0, 0)));
        assert_eq!(nucleus.process_count, 4);
        nucleus.current = Some(root);
        nucleus.ready.enqueue(&mut nucleus.pool, grandchild_parent);
        terminate(&mut nucleus, root);
        assert_eq!(nucleus.process_count, 0);
        assert_eq!(nucleus.pool.free_count(), MAXPROC);
        nucleus.audit().unwrap();
    }

    #[test]
    fn user_mode_kernel_service_dies_without_support() {
        let (mut nucleus, mut machine) = setup();
        let mut saved = syscall(GETCPUTIME, 0, 0, 0);
        saved.status = Status::KUP | Status::IEP;
        dispatch(&mut nucleus, &mut machine, saved);
        assert_eq!(nucleus.process_count, 0);
        assert_eq!(nucleus.current, None);
    }

    #[test]
    fn wait_io_returns_live_status_when_completion_already_arrived() {
        let (mut nucleus, mut machine) = setup();
        machine.bus.attach(IoDevice::new(DISK_LINE, 0, 100));
        let sem = device_sem(DISK_LINE, 0, false);
        nucleus.semaphores[sem] = 1;
        let state = returned(dispatch(&mut nucleus, &mut machine, syscall(WAITIO, DISK_LINE as u32, 0, 0)));
        assert_eq!(state.gpr[V0], ST_READY);
        assert_eq!(nucleus.soft_blocked, 0);
        assert_eq!(nucleus.semaphores[sem], 0);
    }

    #[test]
    fn cpu_time_includes_the_running_slice() {
        let (mut nucleus, mut machine) = setup();
        let cur = nucleus.current.unwrap();
        nucleus.pool.pcb_mut(cur).time = 700;
        nucleus.pool.pcb_mut(cur).start_tod = 0;
        let state = returned(dispatch(&mut nucleus, &mut machine, syscall(GETCPUTIME, 0, 0, 0)));
        assert_eq!(state.gpr[V0], 700 + machine.tod() as u32);
    }
}
