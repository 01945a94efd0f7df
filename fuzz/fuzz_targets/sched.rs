/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use lcra::fuzzing::func::Func;
use lcra::fuzzing::fuzz_target;
use lcra::interp::{self, Inputs};
use lcra::liveness::compute_ssa_liveness;
use lcra::sched::{block_pressure, schedule};

fuzz_target!(|func: Func| {
    let _ = env_logger::try_init();
    let inputs = Inputs::default();
    let before = match interp::run(&func, &inputs) {
        Ok(outcome) => outcome,
        Err(_) => return,
    };

    let mut scheduled = func.clone();
    let liveness = compute_ssa_liveness(&scheduled);
    schedule(&mut scheduled, &liveness);
    log::trace!("scheduled:\n{}", scheduled);
    for block in func.blocks() {
        assert!(block_pressure(&scheduled, block, &liveness) <= block_pressure(&func, block, &liveness));
    }

    // Scheduling never changes the instruction count, so the step
    // count matches too.
    let after = interp::run(&scheduled, &inputs).expect("scheduled program failed to run");
    assert_eq!(before.steps, after.steps);
    assert!(before.same_effects(&after));
});
