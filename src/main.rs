use emips::board;
use emips::{Emulator, Outcome};
use std::process;

fn main() {
    env_logger::init();
    let debug = std::env::args().skip(1).any(|arg| arg == "--debug" || arg == "-d");
    let config = board::devkit();
    let mut emulator = match Emulator::new(config) {
        Ok(emulator) => emulator,
        Err(err) => {
            eprintln!("devkit: bad configuration: {}", err);
            process::exit(2);
        }
    };
    let outcome = emulator.run(debug);
    for number in 0..2 {
        let output = emulator.terminal_output(number);
        if !output.is_empty() {
            println!("terminal {}: {}", number, String::from_utf8_lossy(&output));
        }
    }
    match outcome {
        Outcome::Halt { tod } => println!("machine halted at {} µs", tod),
        Outcome::Aborted => println!("run aborted from the inspector"),
        Outcome::Panic { reason } => {
            eprintln!("kernel panic: {}", reason);
            process::exit(1);
        }
    }
}
