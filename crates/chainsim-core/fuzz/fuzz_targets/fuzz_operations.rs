#![no_main]
use arbitrary::Arbitrary;
use chainsim_core::engine::ProcessRequest;
use chainsim_core::formula::Sizing;
use chainsim_core::id::*;
use chainsim_core::test_utils::*;
use libfuzzer_sys::fuzz_target;

/// A structured engine operation for fuzzing.
#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Smelt { delay_quarters: u8, scale_quarters: u8 },
    Assay { hours: u8 },
    RunRecipe,
    Build { count: u8 },
    Advance { quarters: u8 },
}

/// Top-level fuzz input: a sequence of operations.
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    ops: Vec<FuzzOp>,
}

fuzz_target!(|input: FuzzInput| {
    let mut engine = ready_engine("fuzz");

    // Limit operations to prevent timeouts.
    let max_ops = input.ops.len().min(200);

    for op in &input.ops[..max_ops] {
        // Errors are fine; panics and broken invariants are not.
        match op {
            FuzzOp::Smelt { delay_quarters, scale_quarters } => {
                let at = engine.current_time() + fx(f64::from(*delay_quarters) / 4.0);
                let scale = fx(f64::from(*scale_quarters) / 4.0);
                let _ = engine.start_process(
                    ProcessRequest::new(ProcessId::new("smelt"))
                        .with_sizing(Sizing::scale(scale))
                        .at(at),
                );
            }
            FuzzOp::Assay { hours } => {
                let _ = engine.start_process(
                    ProcessRequest::new(ProcessId::new("assay"))
                        .with_sizing(Sizing::duration(fx(f64::from(*hours)))),
                );
            }
            FuzzOp::RunRecipe => {
                let _ = engine.run_recipe(&RecipeId::new("plate_line"));
            }
            FuzzOp::Build { count } => {
                let _ = engine.build_machine(&MachineId::new("press"), fx(f64::from(*count)));
            }
            FuzzOp::Advance { quarters } => {
                let _ = engine.advance_time(fx(f64::from(*quarters) / 4.0));
            }
        }

        let state = engine.state();
        for (machine, in_use) in &state.machines_in_use {
            assert!(*in_use <= state.machines_built_of(machine));
        }
    }
});
