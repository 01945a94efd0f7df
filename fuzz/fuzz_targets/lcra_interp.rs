/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use lcra::fuzzing::func::Func;
use lcra::fuzzing::fuzz_target;
use lcra::interp::{self, Inputs};
use lcra::{MachineEnv, RegallocOptions};

// Allocation must not change what the program does, including when the
// file is small enough to force spilling.
fuzz_target!(|func: Func| {
    let _ = env_logger::try_init();
    log::trace!("func:\n{}", func);

    let inputs = Inputs::default();
    let before = match interp::run(&func, &inputs) {
        Ok(outcome) => outcome,
        Err(_) => return,
    };

    // The reduced file on its own keeps every fixed register.
    let full = lcra::fuzzing::func::machine_env();
    let small = MachineEnv {
        regs: full.reduced_regs.unwrap(),
        reduced_regs: None,
    };
    for env in [full, small].iter() {
        let mut allocated = func.clone();
        let output = lcra::run(&mut allocated, env, &RegallocOptions::default())
            .expect("regalloc did not succeed");
        log::trace!("allocated with {} spills:\n{}", output.stats.spills, allocated);

        let after = interp::run(
            &allocated,
            &Inputs {
                step_limit: 4 * inputs.step_limit,
                ..inputs.clone()
            },
        )
        .expect("allocated program failed to run");
        assert!(before.same_effects(&after), "{:?}\n{:?}", before, after);
    }
});
