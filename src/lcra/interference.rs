/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Interference construction.

use alloc::vec;

use super::LcraState;
use crate::liveness::{component_update, reg_update, ComponentLiveness, RegLiveness};
use crate::{Func, InstData, PRegSet};

/// Bases `b` such that `b + shift + k` is in `allowed` for every
/// `k < count`.
fn bases_fitting(allowed: PRegSet, shift: usize, count: usize) -> PRegSet {
    let mut bases = PRegSet::from_bits(!0);
    for k in 0..count {
        bases.intersect_from(allowed.shift_down(shift + k));
    }
    bases
}

/// Bases that keep every component in `mask` clear of `clobbers`.
fn bases_avoiding(clobbers: PRegSet, mask: u8) -> PRegSet {
    let mut hit = PRegSet::empty();
    for k in 0..8 {
        if mask & (1 << k) != 0 {
            hit.union_from(clobbers.shift_down(k));
        }
    }
    hit.invert()
}

/// Walk every block backward and record interference, narrowing
/// affinities to the attempt's `file`.
pub fn build_interference(
    f: &Func,
    state: &mut LcraState,
    file: PRegSet,
    components: &ComponentLiveness,
    regs: &RegLiveness,
) {
    let mut live = vec![0u8; f.num_vregs()];

    for block in f.blocks() {
        live.copy_from_slice(components.live_out(block));
        let mut preload_live = *regs.live_out(block);

        for &inst in f.block_insts(block).iter().rev() {
            let data = f.inst(inst);
            interfere_dests(state, data, file, preload_live, &live);
            narrow_sources(state, data, file);
            narrow_clobbered(state, data, &live);

            preload_live = reg_update(preload_live, data);
            component_update(&mut live, data);
        }
    }
}

/// Destinations against everything live after the instruction, and
/// against each other.
fn interfere_dests(
    state: &mut LcraState,
    data: &InstData,
    file: PRegSet,
    preload_live: PRegSet,
    live: &[u8],
) {
    let mut allowed = file;
    allowed.subtract(preload_live);

    for (d, dest) in data.vreg_dests() {
        let node = dest.index();
        let offset = data.dests[d].offset as usize;
        let mask = data.write_mask(d);
        state.affinity[node].intersect_from(bases_fitting(allowed, offset, data.write_count(d)));

        for (i, &other) in live.iter().enumerate() {
            let mut other = other;
            if other == 0 {
                continue;
            }
            // A copy leaves its destination equal to the copied
            // component, so the two may share a register.
            if data.is_move() && data.srcs[0].as_vreg().map(|v| v.index()) == Some(i) {
                other &= !(1 << data.srcs[0].offset);
            }
            state.add_interference(node, mask, i, other);
        }

        for (e, earlier) in data.vreg_dests().take(d) {
            state.add_interference(node, mask, earlier.index(), data.write_mask(e));
        }
    }
}

/// A value must fit in the file wherever it is read.
fn narrow_sources(state: &mut LcraState, data: &InstData, file: PRegSet) {
    for (s, src) in data.vreg_srcs() {
        let offset = data.srcs[s].offset as usize;
        state.affinity[src.index()].intersect_from(bases_fitting(file, offset, data.read_count(s)));
    }
}

/// Values live across a clobbering instruction must stay out of the
/// clobbered registers.
fn narrow_clobbered(state: &mut LcraState, data: &InstData, live: &[u8]) {
    let clobbers = PRegSet::from_bits(data.props().clobbers);
    if clobbers.is_empty() {
        return;
    }
    for (i, &mask) in live.iter().enumerate() {
        if mask == 0 || data.vreg_dests().any(|(_, d)| d.index() == i) {
            continue;
        }
        state.affinity[i].intersect_from(bases_avoiding(clobbers, mask));
    }
}
