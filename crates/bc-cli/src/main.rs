//! Thin binary that assembles one of the bundled example programs, runs it
//! through either linear-scan allocator, and interprets the result: the
//! out-of-scope "tiny CLI" the design spec names, given a real home so the
//! allocators have something to be exercised against end to end.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

mod examples;

use examples::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Allocator {
    Lsra,
    Rlsra,
}

/// Lower a bundled bytecode program, allocate registers and interpret it.
#[derive(Parser)]
#[command(name = "bc-cli", version, about)]
struct Args {
    /// Which bundled example program to run.
    #[arg(value_enum, default_value = "fib")]
    program: Program,

    /// Which linear-scan allocator to use.
    #[arg(long, value_enum, default_value = "lsra")]
    allocator: Allocator,

    /// Number of physical registers in the register file.
    #[arg(long, default_value_t = 2)]
    registers: u32,

    /// Loop bound / argument for the `fib` program; ignored by the others.
    #[arg(long, default_value_t = 10)]
    n: i64,

    /// Print the annotated IR before interpreting it.
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let func = args.program.build(args.n);
    let mut ir = bc_lower::lower(&func).context("lowering the bundled program failed")?;
    ir.recompute_alive_sets();

    match args.allocator {
        Allocator::Lsra => bc_regalloc::lsra::allocate(&mut ir, args.registers).context("forward LSRA failed")?,
        Allocator::Rlsra => bc_regalloc::rlsra::allocate(&mut ir, args.registers).context("reverse RLSRA failed")?,
    }

    if args.dump {
        println!("{ir}");
    }

    let mut interp = bc_interp::Interpreter::new(args.registers);
    let result = interp.run(&ir).context("interpretation failed")?;

    println!("result = {result}");
    println!(
        "spills = {}, restores = {}, moves = {}",
        interp.spill_count, interp.restore_count, interp.move_count
    );

    Ok(())
}
