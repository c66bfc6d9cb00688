use emips::board::{devkit, Program};
use emips::devices::{
    device_sem, user_sem, IoDevice, Terminal, CLOCK_SEM, CMD_OPERATION, COMMAND, DEV_PER_LINE,
    DISK_LINE, RECV_COMMAND, TERM_LINE,
};
use emips::memory::Bus;
use emips::processor::EXC_OV;
use emips::{Configuration, Emulator, Outcome};

fn test_board() -> Configuration {
    let mut bus = Bus::new();
    for number in 0..DEV_PER_LINE {
        bus.attach(Terminal::new(number, 100));
    }
    bus.attach(IoDevice::new(DISK_LINE, 3, 500));
    Configuration::new(bus)
}

fn run(config: Configuration) -> (Emulator, Outcome) {
    let mut emulator = Emulator::new(config).unwrap();
    let outcome = emulator.run(false);
    (emulator, outcome)
}

fn halted(outcome: &Outcome) -> u64 {
    match outcome {
        Outcome::Halt { tod } => *tod,
        other => panic!("expected a halt, got {:?}", other),
    }
}

fn text(emulator: &Emulator, terminal: usize) -> String {
    String::from_utf8_lossy(&emulator.terminal_output(terminal)).into_owned()
}

#[test]
fn create_and_terminate_reclaims_the_whole_tree() {
    let mut config = test_board();
    let child = config.load(Program::at(0x2000).compute(50_000).terminate());
    config.entry = config.load(
        Program::at(0x1000)
            .create(child, 0)
            .compute(100)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(emulator.nucleus.process_count, 0);
    emulator.nucleus.audit().unwrap();
}

#[test]
fn producer_consumer_handshake() {
    let full = user_sem(1);
    let done = user_sem(0);
    let mut config = test_board();
    let consumer = config.load(
        Program::at(0x2000)
            .p(full)
            .print(0, "C")
            .v(done)
            .terminate(),
    );
    config.entry = config.load(
        Program::at(0x1000)
            .create(consumer, 0)
            .compute(7_000)
            .print(0, "P")
            .v(full)
            .p(done)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(text(&emulator, 0), "PC");
    assert_eq!(emulator.nucleus.semaphores[full], 0);
    assert_eq!(emulator.nucleus.soft_blocked, 0);
    emulator.nucleus.audit().unwrap();
}

#[test]
fn terminal_write_round_trip() {
    let mut config = test_board();
    config.entry = config.load(
        Program::at(0x1000)
            .transmit(3, b'X')
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(text(&emulator, 3), "X");
    // Transmit half of terminal 3: slot 32 + 3*2 + 1.
    assert_eq!(device_sem(TERM_LINE, 3, true), 39);
    assert_eq!(emulator.nucleus.semaphores[39], 0);
    assert_eq!(emulator.nucleus.soft_blocked, 0);
}

#[test]
fn terminal_receive_completes_from_scripted_input() {
    let mut bus = Bus::new();
    bus.attach(Terminal::with_input(0, 100, "z"));
    let mut config = Configuration::new(bus);
    config.entry = config.load(
        Program::at(0x1000)
            .io_command(TERM_LINE, 0, RECV_COMMAND, CMD_OPERATION)
            .wait_io(TERM_LINE, 0, false)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(emulator.nucleus.semaphores[device_sem(TERM_LINE, 0, false)], 0);
}

#[test]
fn disk_wait_io_blocks_until_completion() {
    let mut config = test_board();
    config.entry = config.load(
        Program::at(0x1000)
            .io_command(DISK_LINE, 3, COMMAND, CMD_OPERATION)
            .wait_io(DISK_LINE, 3, false)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    let tod = halted(&outcome);
    // The 500 µs disk latency has to show up in the run time.
    assert!(tod >= 500, "halted after only {} µs", tod);
    assert_eq!(emulator.nucleus.semaphores[device_sem(DISK_LINE, 3, false)], 0);
    assert_eq!(emulator.nucleus.soft_blocked, 0);
}

#[test]
fn quantum_expiry_interleaves_cpu_hogs() {
    let done = user_sem(0);
    let mut config = test_board();
    let hog_a = config.load(
        Program::at(0x2000)
            .compute(12_000)
            .print(0, "A")
            .v(done)
            .terminate(),
    );
    let hog_b = config.load(
        Program::at(0x3000)
            .compute(12_000)
            .print(0, "B")
            .v(done)
            .terminate(),
    );
    config.entry = config.load(
        Program::at(0x1000)
            .create(hog_a, 0)
            .create(hog_b, 0)
            .p(done)
            .p(done)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    let tod = halted(&outcome);
    // Round-robin at 5 ms: A finishes inside its third slice, before B.
    assert_eq!(text(&emulator, 0), "AB");
    assert!(tod >= 24_000, "both hogs need their full compute time, got {} µs", tod);
}

#[test]
fn pseudo_clock_tick_is_a_broadcast() {
    let done = user_sem(0);
    let mut config = test_board();
    let mut sleepers = Vec::new();
    for (j, letter) in ["a", "b", "c"].iter().enumerate() {
        sleepers.push(config.load(
            Program::at(0x2000 + j as u32 * 0x1000)
                .wait_clock()
                .print(j, letter)
                .v(done)
                .terminate(),
        ));
    }
    let mut boot = Program::at(0x8000);
    for &sleeper in &sleepers {
        boot = boot.create(sleeper, 0);
    }
    config.entry = config.load(boot.p(done).p(done).p(done).terminate());
    let (emulator, outcome) = run(config);
    let tod = halted(&outcome);
    assert!(tod >= 100_000, "woke before the interval timer: {} µs", tod);
    assert!(tod < 200_000, "took more than one tick: {} µs", tod);
    for (j, letter) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(text(&emulator, j), *letter);
    }
    assert_eq!(emulator.nucleus.semaphores[CLOCK_SEM], 0);
    assert_eq!(emulator.nucleus.soft_blocked, 0);
    emulator.nucleus.audit().unwrap();
}

#[test]
fn deadlock_is_detected_and_panics() {
    let mut config = test_board();
    config.entry = config.load(Program::at(0x1000).p(user_sem(5)).terminate());
    let (_, outcome) = run(config);
    match outcome {
        Outcome::Panic { reason } => assert!(reason.contains("deadlock"), "reason: {}", reason),
        other => panic!("expected a deadlock panic, got {:?}", other),
    }
}

#[test]
fn pv_balance_without_blocking() {
    let sem = user_sem(7);
    let mut config = test_board();
    config.entry = config.load(
        Program::at(0x1000)
            .v(sem)
            .v(sem)
            .v(sem)
            .p(sem)
            .p(sem)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(emulator.nucleus.semaphores[sem], 1);
}

#[test]
fn v_wakes_waiters_in_fifo_order() {
    let sem = user_sem(2);
    let mutex = user_sem(3);
    let done = user_sem(0);
    let mut config = test_board();
    let first = config.load(
        Program::at(0x2000)
            .p(sem)
            .p(mutex)
            .print(0, "A")
            .v(mutex)
            .v(done)
            .terminate(),
    );
    let second = config.load(
        Program::at(0x3000)
            .p(sem)
            .p(mutex)
            .print(0, "B")
            .v(mutex)
            .v(done)
            .terminate(),
    );
    config.entry = config.load(
        Program::at(0x1000)
            .v(mutex)
            .create(first, 0)
            .create(second, 0)
            .compute(6_000)
            .v(sem)
            .v(sem)
            .p(done)
            .p(done)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    // Both blocked on `sem` in creation order; the two Vs must release them
    // in the same order, so A holds the print mutex first.
    assert_eq!(text(&emulator, 0), "AB");
    emulator.nucleus.audit().unwrap();
}

#[test]
fn trap_passes_up_to_the_support_handler() {
    let done = user_sem(0);
    let mut config = test_board();
    let handler = config.load(
        Program::at(0x5000)
            .print(1, "H")
            .terminate(),
    );
    let support = config.add_support(handler, handler);
    let faulter = config.load(
        Program::at(0x2000)
            .compute(200)
            .trap(EXC_OV),
    );
    config.entry = config.load(
        Program::at(0x1000)
            .create(faulter, support)
            .compute(20_000)
            .p(done)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    // The handler terminates the faulter; boot then deadlocks on `done`,
    // which is exactly how we know nothing else is runnable.
    match outcome {
        Outcome::Panic { reason } => assert!(reason.contains("deadlock"), "reason: {}", reason),
        other => panic!("expected the boot process to deadlock, got {:?}", other),
    }
    assert_eq!(text(&emulator, 1), "H");
}

#[test]
fn trap_without_support_kills_the_process() {
    let mut config = test_board();
    let faulter = config.load(Program::at(0x2000).trap(EXC_OV).print(0, "x"));
    config.entry = config.load(
        Program::at(0x1000)
            .create(faulter, 0)
            .compute(20_000)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    assert_eq!(text(&emulator, 0), "");
    assert_eq!(emulator.nucleus.process_count, 0);
}

#[test]
fn user_mode_kernel_service_is_escalated() {
    let mut config = test_board();
    let sneaky = config.load(
        Program::at(0x2000)
            .user()
            .p(user_sem(4))
            .print(0, "x"),
    );
    config.entry = config.load(
        Program::at(0x1000)
            .create(sneaky, 0)
            .compute(20_000)
            .terminate(),
    );
    let (emulator, outcome) = run(config);
    halted(&outcome);
    // The privileged P from user mode dies before it can block or print.
    assert_eq!(text(&emulator, 0), "");
    assert_eq!(emulator.nucleus.semaphores[user_sem(4)], 0);
}

#[test]
fn devkit_board_boots_and_halts() {
    let mut emulator = Emulator::new(devkit()).unwrap();
    let outcome = emulator.run(false);
    halted(&outcome);
    assert_eq!(text(&emulator, 0), "devkit up\n");
    assert_eq!(text(&emulator, 1), "!");
    assert_eq!(emulator.nucleus.process_count, 0);
    assert_eq!(emulator.nucleus.soft_blocked, 0);
    emulator.nucleus.audit().unwrap();
}
