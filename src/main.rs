use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use clap::Parser;
use emu86_core::{CpuConfig, CpuStats, CpuVariant, Reg16, RunMode, SegmentRegister};
use emu86_devices::Machine;
use strum::IntoEnumIterator;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Runs real-mode 8086/80186 machine code")]
struct Args {
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long)]
    show_cpu_state: bool,
    /// Processor to emulate: 8086 or 80186
    #[arg(long, default_value = "8086")]
    cpu: CpuVariant,
    /// Processor clocks per timer tick
    #[arg(long, default_value = "4")]
    timer_ratio: u32,
    /// Fail when an interrupt vector is 0000:0000 instead of jumping there
    #[arg(long)]
    strict_vectors: bool,
    /// ROM image placed at the top of the address space
    #[arg(long)]
    bios: Option<PathBuf>,
    /// Program image, started through a far jump at the reset vector
    #[arg(short, long)]
    program: Option<PathBuf>,
    /// Segment the program is loaded to (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "0", value_parser = parse_number)]
    segment: u32,
    /// Stop after this many instructions
    #[arg(short, long)]
    max_instructions: Option<usize>,
    /// Write the final register state to this file
    #[arg(long)]
    dump_state: Option<PathBuf>,
}

fn parse_number(value: &str) -> Result<u32, std::num::ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn print_state(machine: &Machine) {
    let state = &machine.cpu.state;
    println!();
    println!("========== CPU STATE ===========");
    println!();
    println!("CS:IP: {:04X}:{:04X}", state.cs(), state.ip);
    for reg in Reg16::iter() {
        println!("{reg}: {:04X}", state.get(reg));
    }
    for seg in SegmentRegister::iter() {
        println!("{seg}: {:04X}", state.seg(seg));
    }
    println!("Flags: {} ({:04X})", state.flags, state.flags.to_word());
    println!("Halted: {}", machine.cpu.halted());
}

fn print_stats(stats: &CpuStats, elapsed_secs: f64) {
    println!();
    println!("========== RESULT/STATS ===========");
    println!();
    println!("Instructions: {}", stats.instructions);
    println!("Clocks: {}", stats.cycles);
    println!("Timer ticks: {}", stats.timer_ticks);
    if elapsed_secs > 0.0 {
        println!(
            "Elapsed: {:.3}s ({:.0} op/s, {:.2} MHz effective)",
            elapsed_secs,
            stats.instructions as f64 / elapsed_secs,
            stats.cycles as f64 / elapsed_secs / 1_000_000.0
        );
    }
}

fn main() -> anyhow::Result<()> {
    let Args {
        verbose,
        show_cpu_state,
        cpu,
        timer_ratio,
        strict_vectors,
        bios,
        program,
        segment,
        max_instructions,
        dump_state,
    } = Args::parse();

    let filter = if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if bios.is_none() && program.is_none() {
        anyhow::bail!("nothing to run: pass --bios and/or --program");
    }

    let mut machine = Machine::new(CpuConfig {
        variant: cpu,
        timer_ratio,
        strict_vectors,
    });

    if let Some(path) = bios {
        let image = std::fs::read(&path)
            .with_context(|| format!("failed to read BIOS image {}", path.display()))?;
        machine.load_bios(&image)?;
    }
    if let Some(path) = program {
        let image = std::fs::read(&path)
            .with_context(|| format!("failed to read program {}", path.display()))?;
        machine.load_bootstrapped(segment, &image)?;
    }
    machine.reset();
    debug!(variant = %cpu, timer_ratio, strict_vectors, "machine ready");

    let run_mode = match max_instructions {
        Some(count) => RunMode::RunFor(count),
        None => RunMode::Run,
    };

    let started = Instant::now();
    let result = machine.run(run_mode);
    let elapsed = started.elapsed().as_secs_f64();

    match &result {
        Ok(stats) => print_stats(stats, elapsed),
        Err(err) => {
            println!();
            println!("========== RESULT/STATS ===========");
            println!();
            println!("{err:#?}");
        }
    }

    if show_cpu_state {
        print_state(&machine);
    }

    if let Some(path) = dump_state {
        machine
            .cpu
            .state
            .save(&path)
            .with_context(|| format!("failed to write cpu state to {}", path.display()))?;
    }

    result?;
    Ok(())
}
