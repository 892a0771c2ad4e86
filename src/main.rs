//! MESM-6 Emulator - CLI entry point
//!
//! Commands:
//! - `mesm6 run <listing.oct>` - load an octal listing and run it
//! - `mesm6 disasm <listing.oct>` - print the loaded instruction memory

use clap::{Parser, Subcommand};
use mesm6::{disassemble, load_oct, Cpu, StopCode};

#[derive(Parser)]
#[command(name = "mesm6")]
#[command(version = "0.1.0")]
#[command(about = "An instruction-level emulator of the MESM-6 48-bit computer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program until it halts
    Run {
        /// Path to the octal listing file to execute
        listing: String,
        /// Maximum number of instructions to execute
        #[arg(short, long, default_value = "1000000")]
        max_cycles: u64,
        /// Dump machine state on every cycle (needs RUST_LOG=trace)
        #[arg(short, long)]
        trace: bool,
    },
    /// Disassemble the instruction memory of a listing
    Disasm {
        /// Path to the octal listing file
        listing: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            listing,
            max_cycles,
            trace,
        } => run_listing(&listing, max_cycles, trace),
        Commands::Disasm { listing } => disasm_listing(&listing),
    }
}

fn load_machine(path: &str) -> Cpu {
    let mut cpu = Cpu::with_default_memory();
    if let Err(e) = load_oct(path, &mut cpu.ibus, &mut cpu.dbus) {
        eprintln!("failed to load {}: {}", path, e);
        std::process::exit(1);
    }
    cpu
}

fn run_listing(path: &str, max_cycles: u64, trace: bool) {
    let mut cpu = load_machine(path);
    cpu.trace = trace;

    let executed = cpu.run_limited(max_cycles);

    println!("executed {} instructions", executed);
    println!("{:?}", cpu);
    if cpu.is_running() {
        println!("cycle limit reached, use --max-cycles to raise it");
        return;
    }
    match cpu.stop_code() {
        Some(StopCode::Success) => println!("stopped: success"),
        Some(StopCode::Failure) => {
            println!("stopped: failure");
            std::process::exit(1);
        }
        Some(StopCode::Neutral) => println!("stopped"),
        None => {
            println!("faulted");
            std::process::exit(1);
        }
    }
}

fn disasm_listing(path: &str) {
    let cpu = load_machine(path);

    // ROM occupies the bottom kiloword of the instruction bus
    for addr in 1..1024u16 {
        let word = cpu.ibus.read(addr);
        if word == 0 {
            continue;
        }
        println!(
            "{:05o}: {:<24} {}",
            addr,
            disassemble(word >> 24),
            disassemble(word)
        );
    }
}
