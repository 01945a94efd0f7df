/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use lcra::fuzzing::func::Func;
use lcra::fuzzing::fuzz_target;
use lcra::liveness::{compute_reg_liveness, compute_ssa_liveness, reg_update};
use lcra::{PRegSet, RegallocOptions};

fuzz_target!(|func: Func| {
    let _ = env_logger::try_init();

    let first = compute_ssa_liveness(&func);
    let second = compute_ssa_liveness(&func);
    for block in func.blocks() {
        assert!(first.live_in(block).same_members(second.live_in(block)));
        assert!(first.live_out(block).same_members(second.live_out(block)));
    }

    // Once allocated, every block satisfies the dataflow equations over
    // physical registers.
    let mut func = func;
    let env = lcra::fuzzing::func::machine_env();
    let output = lcra::run(&mut func, &env, &RegallocOptions::default())
        .expect("regalloc did not succeed");
    let live = compute_reg_liveness(&func);
    for block in func.blocks() {
        let mut out = PRegSet::empty();
        for &succ in func.block_succs(block) {
            out.union_from(*live.live_in(succ));
        }
        assert_eq!(out, *live.live_out(block));

        let mut regs = out;
        for &inst in func.block_insts(block).iter().rev() {
            regs = reg_update(regs, func.inst(inst));
        }
        assert_eq!(regs, *live.live_in(block));
        assert_eq!(*output.liveness.live_in(block), regs);
    }
});
