/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Linearly-constrained register allocation.
//!
//! Every value gets a base register. Two values interfere at a set of
//! displacements: for the pair `(i, j)`, bit `7 + e` of the constraint
//! is set when `base(i) - base(j) == e` would make a live component of
//! `i` overlap a live component of `j`. Values up to eight registers
//! wide can therefore be packed next to each other without being
//! treated as a single unit.
//!
//! Allocation is a greedy pass in value order. When a value has no
//! legal register, a neighbour is spilled to scratch memory and the
//! whole allocation is retried.

use alloc::vec::Vec;

use crate::liveness::{compute_component_liveness, compute_reg_liveness, compute_ssa_liveness};
use crate::nodearray::NodeArray;
use crate::{
    bit_mask, checker, sched, validate, Func, MachineEnv, Output, PReg, PRegSet, RegAllocError,
    RegallocOptions, Stats, VReg,
};

mod install;
mod interference;
mod solve;
mod spill;
mod ssa;

pub use install::{install_registers, remove_self_moves};
pub use interference::build_interference;
pub use solve::{coalesce_preload_moves, seed_pins};
pub use spill::{choose_spill_node, spill_value};
pub use ssa::lower_phis;

/// Registers left to the allocator when spilling is being stressed.
const STRESS_FILE: u64 = bit_mask(48) << 8;

/// Allocation state for one attempt.
#[derive(Clone, Debug)]
pub struct LcraState {
    pub node_count: usize,

    /// Legal base registers per value.
    pub affinity: Vec<PRegSet>,

    /// Constraint rows: `linear[i]` maps `j` to the displacements
    /// `base(i) - base(j)` that conflict.
    pub linear: Vec<NodeArray>,

    pub solutions: Vec<Option<PReg>>,

    /// Whether each value is defined somewhere and so needs a register.
    pub defined: Vec<bool>,

    /// The first value that could not be placed.
    pub spill_node: Option<VReg>,

    /// Copies from preloaded registers whose destination landed on
    /// the source register.
    pub coalesced: usize,
}

/// Run one allocation attempt of `f` in `file`.
///
/// A state with `spill_node` set describes a failed attempt; errors
/// are reserved for input the allocator can never handle.
pub fn allocate_once(
    f: &Func,
    env: &MachineEnv,
    file: PRegSet,
    stress: bool,
) -> Result<LcraState, RegAllocError> {
    let mut state = LcraState::new(f.num_vregs());

    let mut default_affinity = file;
    if stress {
        default_affinity.intersect_from(PRegSet::from_bits(STRESS_FILE));
    }
    for (_, inst) in f.live_insts() {
        for (_, dest) in f.inst(inst).vreg_dests() {
            state.defined[dest.index()] = true;
            state.affinity[dest.index()] = default_affinity;
        }
    }

    let components = compute_component_liveness(f);
    let regs = compute_reg_liveness(f);
    build_interference(f, &mut state, file, &components, &regs);

    seed_pins(f, env, file, &mut state)?;
    if state.spill_node.is_none() {
        coalesce_preload_moves(f, &mut state);
        state.solve();
    }
    Ok(state)
}

/// Schedule, lower and allocate `func`, then rewrite it onto physical
/// registers.
pub fn run(
    func: &mut Func,
    env: &MachineEnv,
    options: &RegallocOptions,
) -> Result<Output, RegAllocError> {
    if options.validate {
        validate::validate(func)?;
    }

    let mut stats = Stats::default();

    if options.schedule {
        let live = compute_ssa_liveness(func);
        stats.blocks_rescheduled = sched::schedule(func, &live);
    }

    stats.lowered_phis = lower_phis(func);

    let max_rounds = options.max_spill_rounds.unwrap_or(func.num_vregs());

    let mut attempt = None;
    if let Some(reduced) = env.reduced_regs.filter(|_| !options.stress_spilling) {
        stats.attempts += 1;
        let state = allocate_once(func, env, reduced, false)?;
        match state.spill_node {
            None => attempt = Some((state, reduced.len())),
            Some(node) => trace!("reduced file exhausted at {}", node),
        }
    }

    let (state, work_reg_count) = match attempt {
        Some(attempt) => attempt,
        None => loop {
            stats.attempts += 1;
            let state = allocate_once(func, env, env.regs, options.stress_spilling)?;
            let node = match state.spill_node {
                None => break (state, env.regs.end()),
                Some(node) => node,
            };
            if stats.spill_rounds >= max_rounds {
                return Err(RegAllocError::SpillLimit(stats.spill_rounds));
            }
            let victim = choose_spill_node(func, &state)
                .ok_or(RegAllocError::AllocationFailed(node))?;
            trace!("round {}: {} failed, spilling {}", stats.spill_rounds, node, victim);
            spill_value(func, victim, &mut stats);
            stats.spill_rounds += 1;
        },
    };

    if options.verbose_log && trace_enabled!() {
        trace!("allocated:\n{}", func);
        for (i, sol) in state.solutions.iter().enumerate() {
            if let Some(reg) = sol {
                trace!("  v{} -> {}", i, reg);
            }
        }
    }

    if options.check {
        checker::check(func, &state.solutions).map_err(RegAllocError::Checker)?;
    }

    install_registers(func, &state.solutions);
    stats.removed_moves = remove_self_moves(func);
    stats.coalesced_moves = state.coalesced;

    Ok(Output {
        liveness: compute_reg_liveness(func),
        assignments: state.solutions,
        work_reg_count,
        scratch_size: func.scratch_size,
        stats,
    })
}
