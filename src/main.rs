//! bismo-host: run a GEMM on the emulated accelerator and report performance

use std::env;

use anyhow::Context;
use bismo_host::{Config, Dispatcher, EmulatedAccel, GemmShape, PackedOperand, RunOptions};

const DEFAULT_DIMS: [usize; 3] = [64, 256, 64];

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: bismo-host [LHS_ROWS [DEPTH [RHS_ROWS]]]");
        println!();
        println!("Runs a 1-bit LHS_ROWS x DEPTH x RHS_ROWS GEMM twice (default 64 256 64).");
        println!("Configuration: {}", Config::user_config_path().map_or_else(
            || "./bismo-host.toml".to_string(),
            |p| p.display().to_string(),
        ));
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }

    let mut dims = DEFAULT_DIMS;
    for (i, arg) in args.iter().take(3).enumerate() {
        dims[i] = arg.parse().with_context(|| format!("invalid dimension {arg:?}"))?;
    }
    let [lhs_rows, depth, rhs_rows] = dims;

    let config = Config::get();
    let accel = EmulatedAccel::from_config(config);
    let cap = config.emulator_capability();
    println!("Hardware ===============================================");
    println!("{cap}");
    println!();

    let shape = GemmShape::for_hardware(&cap, lhs_rows, depth, rhs_rows, 1, 1, false, false);
    let mut dispatcher = Dispatcher::new(accel, shape, RunOptions::from_config(config))
        .context("failed to attach to accelerator")?;
    dispatcher.set_lhs(&PackedOperand::zeroed(shape.lhs))?;
    dispatcher.set_rhs(&PackedOperand::zeroed(shape.rhs))?;

    for run in 1..=2 {
        let report = dispatcher.run().with_context(|| format!("run {run} failed"))?;
        println!("Run {run}");
        println!("{report}");
        println!();
    }

    let mut result = vec![0; lhs_rows * rhs_rows];
    dispatcher.result(&mut result)?;
    println!("Result: {} elements read back", result.len());

    Ok(())
}
