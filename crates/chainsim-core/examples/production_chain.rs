//! Production chain example: ore to plate through a two-step recipe.
//!
//! Stocks ore and machines, runs the `plate_line` recipe twice so the second
//! run stalls on the furnace, and prints what each tick did.
//!
//! Run with: `RUST_LOG=chainsim_core=info cargo run -p chainsim-core --features test-utils --example production_chain`

use chainsim_core::fixed::fixed64_to_f64;
use chainsim_core::id::*;
use chainsim_core::test_utils::{fx, ready_engine};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mut engine = ready_engine("production_chain");
    let first = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
    let second = engine.run_recipe(&RecipeId::new("plate_line")).unwrap();
    println!("started {first} and {second}");

    while engine.recipe_runs().any(|r| !r.is_completed) {
        let report = engine.advance_time(fx(1.0)).unwrap();
        println!(
            "t={:>4.1}h  started={:?} completed={:?} stalled={} recipes_done={:?}",
            fixed64_to_f64(report.to),
            report.started,
            report.completed,
            report.stalled.len(),
            report.recipes_completed,
        );
    }

    for (item, entry) in engine.state().inventory.iter() {
        println!("{item:>8}: {} {}", fixed64_to_f64(entry.quantity), entry.unit);
    }
    println!(
        "energy: {} kWh, hash: {:016x}",
        fixed64_to_f64(engine.state().total_energy_kwh),
        engine.state_hash()
    );
}
