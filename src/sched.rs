/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Pressure-reducing list scheduling within a block.
//!
//! Each block's non-terminator instructions form a dependency DAG:
//! true dependencies on the writer of every source, plus ordering
//! edges between message-passing instructions whose effects are not
//! visible in the value graph. The DAG is then scheduled bottom-up,
//! greedily picking the head whose placement shrinks the set of live
//! values the most. The new order replaces the old one only if its
//! peak pressure is strictly lower.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use allocator_api2::vec::Vec as ArenaVec;
use bumpalo::Bump;

use crate::bitset::BitSet;
use crate::liveness::{ssa_update, SsaLiveness};
use crate::{Block, Func, Inst, InstData, Message, Opcode, Reg};

/// One instruction in a block's dependency DAG.
pub(crate) struct DagNode<'a> {
    pub inst: Inst,
    /// Earlier nodes this one must follow.
    pub deps: ArenaVec<u32, &'a Bump>,
    /// Number of later nodes still depending on this one.
    pub dependents: u32,
}

struct DagBuilder<'a> {
    nodes: ArenaVec<DagNode<'a>, &'a Bump>,
    bump: &'a Bump,
}

impl<'a> DagBuilder<'a> {
    fn add_dep(&mut self, node: usize, dep: Option<usize>) {
        let dep = match dep {
            Some(dep) => dep,
            None => return,
        };
        debug_assert!(dep < node);
        if self.nodes[node].deps.contains(&(dep as u32)) {
            return;
        }
        self.nodes[node].deps.push(dep as u32);
        self.nodes[dep].dependents += 1;
    }
}

/// Build the dependency DAG over `insts`, which must not contain
/// terminators.
pub(crate) fn build_dag<'a>(
    f: &Func,
    insts: &[Inst],
    bump: &'a Bump,
) -> ArenaVec<DagNode<'a>, &'a Bump> {
    let mut dag = DagBuilder {
        nodes: ArenaVec::with_capacity_in(insts.len(), bump),
        bump,
    };
    let mut writer: ArenaVec<Option<usize>, &Bump> = ArenaVec::new_in(bump);
    writer.resize(f.num_vregs(), None);

    let mut preload = None;
    let mut memory_load = None;
    let mut memory_store = None;
    let mut coverage = None;

    for (node, &inst) in insts.iter().enumerate() {
        let data = f.inst(inst);
        debug_assert!(!data.is_terminator());
        dag.nodes.push(DagNode {
            inst,
            deps: ArenaVec::new_in(dag.bump),
            dependents: 0,
        });

        for (_, src) in data.vreg_srcs() {
            dag.add_dep(node, writer[src.index()]);
        }
        for (_, dest) in data.vreg_dests() {
            writer[dest.index()] = Some(node);
        }

        // Keep preloads and phis at the top.
        dag.add_dep(node, preload);
        if is_preload(data) {
            preload = Some(node);
        }

        match data.props().message {
            Message::Load => {
                dag.add_dep(node, memory_store);
                memory_load = Some(node);
            }
            Message::Store | Message::Atomic | Message::Barrier => {
                dag.add_dep(node, memory_load);
                dag.add_dep(node, memory_store);
                memory_load = Some(node);
                memory_store = Some(node);
            }
            Message::Blend | Message::ZStencil | Message::Tile => {
                dag.add_dep(node, coverage);
                coverage = Some(node);
            }
            Message::Atest => {
                // Ends the shader's side effects and updates coverage.
                dag.add_dep(node, memory_store);
                dag.add_dep(node, coverage);
                memory_store = Some(node);
                coverage = Some(node);
            }
            Message::None | Message::UniformLoad | Message::Texture | Message::Varying => {}
        }

        if data.opcode == Opcode::Discard {
            dag.add_dep(node, coverage);
            dag.add_dep(node, memory_load);
            dag.add_dep(node, memory_store);
            coverage = Some(node);
            memory_load = Some(node);
            memory_store = Some(node);
        }
    }

    dag.nodes
}

fn is_preload(data: &InstData) -> bool {
    data.opcode == Opcode::Phi
        || (data.is_move() && matches!(data.srcs.first().map(|op| op.reg), Some(Reg::Physical(_))))
}

/// Change in the number of live registers from moving `data` above
/// the point where `live` holds.
fn pressure_delta(data: &InstData, live: &BitSet) -> i32 {
    let mut delta = 0;
    for (d, dest) in data.vreg_dests() {
        if live.contains(dest.index()) {
            delta -= data.write_count(d) as i32;
        }
    }
    for (s, src) in data.vreg_srcs() {
        let repeated = data.srcs[..s].iter().any(|op| op.as_vreg() == Some(src));
        if !repeated && !live.contains(src.index()) {
            delta += data.read_count(s) as i32;
        }
    }
    delta
}

/// Values live just above the block's terminators.
fn live_above_terminators(f: &Func, block: Block, liveness: &SsaLiveness) -> BitSet {
    let mut live = liveness.live_out(block).clone();
    let insts = f.block_insts(block);
    for &inst in insts[f.terminator_start(block)..].iter().rev() {
        ssa_update(&mut live, f.inst(inst));
    }
    live
}

/// Peak pressure of `order`, measured bottom-up from the terminators.
/// Only differences between orders of the same block are meaningful.
fn peak_pressure(f: &Func, order: &[Inst], mut live: BitSet) -> i32 {
    let mut pressure = 0;
    let mut peak = 0;
    for &inst in order.iter().rev() {
        let data = f.inst(inst);
        pressure += pressure_delta(data, &live);
        peak = core::cmp::max(peak, pressure);
        ssa_update(&mut live, data);
    }
    peak
}

/// Peak register pressure of `block` in its current order.
pub fn block_pressure(f: &Func, block: Block, liveness: &SsaLiveness) -> i32 {
    let body = &f.block_insts(block)[..f.terminator_start(block)];
    peak_pressure(f, body, live_above_terminators(f, block, liveness))
}

/// Reorder `block` if a lower peak pressure is found. Returns whether
/// the block changed.
pub fn schedule_block(f: &mut Func, block: Block, liveness: &SsaLiveness, bump: &Bump) -> bool {
    let insts = f.block_insts(block);
    let term = f.terminator_start(block);
    if term < 2 {
        return false;
    }
    let body = &insts[..term];

    let live_out = live_above_terminators(f, block, liveness);
    let orig_peak = peak_pressure(f, body, live_out.clone());

    let mut nodes = build_dag(f, body, bump);
    let mut heads: BTreeSet<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.dependents == 0)
        .map(|(i, _)| i)
        .collect();

    let mut live = live_out;
    let mut pressure = 0;
    let mut peak = 0;
    let mut order: Vec<Inst> = Vec::with_capacity(insts.len());

    while !heads.is_empty() {
        let mut best = None;
        let mut min_delta = i32::MAX;
        for &head in heads.iter() {
            let delta = pressure_delta(f.inst(nodes[head].inst), &live);
            if delta < min_delta {
                best = Some(head);
                min_delta = delta;
            }
        }
        let best = match best {
            Some(best) => best,
            None => break,
        };

        heads.remove(&best);
        pressure += min_delta;
        peak = core::cmp::max(peak, pressure);

        let inst = nodes[best].inst;
        order.push(inst);
        ssa_update(&mut live, f.inst(inst));

        for i in 0..nodes[best].deps.len() {
            let dep = nodes[best].deps[i] as usize;
            nodes[dep].dependents -= 1;
            if nodes[dep].dependents == 0 {
                heads.insert(dep);
            }
        }
    }
    debug_assert_eq!(order.len(), body.len());

    trace!(
        "sched: {} peak {} -> {}{}",
        block,
        orig_peak,
        peak,
        if peak < orig_peak { "" } else { " (kept)" }
    );
    if peak >= orig_peak {
        return false;
    }

    order.reverse();
    order.extend_from_slice(&insts[term..]);
    f.set_block_insts(block, order);
    true
}

/// Schedule every block. Returns the number of blocks reordered.
///
/// Reordering within a block leaves block-level liveness unchanged, so
/// one analysis serves every block.
pub fn schedule(f: &mut Func, liveness: &SsaLiveness) -> usize {
    let mut bump = Bump::new();
    let mut changed = 0;
    for b in 0..f.num_blocks() {
        if schedule_block(f, Block::new(b), liveness, &bump) {
            changed += 1;
        }
        bump.reset();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::compute_ssa_liveness;
    use crate::{Operand, VReg};

    /// Check that `order` lists every node of `dag` after its deps.
    fn assert_topological(dag: &[DagNode<'_>], order: &[Inst]) {
        let pos = |inst: Inst| order.iter().position(|&i| i == inst).unwrap();
        for node in dag {
            for &dep in node.deps.iter() {
                let dep = dag[dep as usize].inst;
                assert!(pos(dep) < pos(node.inst), "{} moved above {}", node.inst, dep);
            }
        }
    }

    fn single_block(build: impl FnOnce(&mut Func, Block)) -> (Func, Block) {
        let mut f = Func::new();
        let b0 = f.add_block();
        build(&mut f, b0);
        (f, b0)
    }

    #[test]
    fn minimal_chain_is_kept() {
        let (mut f, b0) = single_block(|f, b| {
            let [a, x, c, p] = f.new_vregs();
            f.push_inst(b, InstData::constant(a, 1));
            f.push_inst(b, InstData::alu(Opcode::IAdd, x, &[a, a]));
            f.push_inst(b, InstData::alu(Opcode::IAdd, c, &[a, x]));
            f.push_inst(b, InstData::constant(p, 0));
            f.push_inst(b, InstData::op(Opcode::Store, &[], &[c.into(), p.into()]));
            f.push_inst(b, InstData::ret());
        });
        let before = f.block_insts(b0).to_vec();
        let live = compute_ssa_liveness(&f);
        assert_eq!(block_pressure(&f, b0, &live), 2);

        let bump = Bump::new();
        assert!(!schedule_block(&mut f, b0, &live, &bump));
        assert_eq!(f.block_insts(b0), &before[..]);
    }

    #[test]
    fn reorder_lowers_peak() {
        // Four constants defined up front, then combined pairwise.
        let (mut f, b0) = single_block(|f, b| {
            let [p, a, x, c, d, e, g, h] = f.new_vregs();
            f.push_inst(b, InstData::constant(p, 0));
            for (i, &v) in [a, x, c, d].iter().enumerate() {
                f.push_inst(b, InstData::constant(v, i as u32 + 1));
            }
            f.push_inst(b, InstData::alu(Opcode::IAdd, e, &[a, x]));
            f.push_inst(b, InstData::alu(Opcode::IAdd, g, &[c, d]));
            f.push_inst(b, InstData::alu(Opcode::IAdd, h, &[e, g]));
            f.push_inst(b, InstData::op(Opcode::Store, &[], &[h.into(), p.into()]));
            f.push_inst(b, InstData::ret());
        });
        let live = compute_ssa_liveness(&f);
        let before = f.block_insts(b0).to_vec();
        assert_eq!(block_pressure(&f, b0, &live), 5);

        let bump = Bump::new();
        assert!(schedule_block(&mut f, b0, &live, &bump));
        assert_eq!(block_pressure(&f, b0, &live), 3);

        let after = f.block_insts(b0).to_vec();
        let term = before.len() - 1;
        let dag = build_dag(&f, &before[..term], &bump);
        assert_topological(&dag, &after);
        assert_eq!(after.last(), before.last());

        // Running again finds nothing better.
        assert!(!schedule_block(&mut f, b0, &live, &bump));
        assert_eq!(f.block_insts(b0), &after[..]);
    }

    #[test]
    fn memory_and_coverage_keep_order() {
        let (mut f, b0) = single_block(|f, b| {
            let [p, a, x, y, z, cov, cov2, alpha, w] = f.new_vregs();
            f.push_inst(b, InstData::mov(cov, crate::PReg::new(60)));
            f.push_inst(b, InstData::constant(p, 16));
            f.push_inst(b, InstData::constant(a, 1));
            f.push_inst(b, InstData::constant(alpha, 2));
            f.push_inst(b, InstData::op(Opcode::Store, &[], &[a.into(), p.into()]));
            f.push_inst(b, InstData::alu(Opcode::Load, x, &[p]));
            f.push_inst(b, InstData::alu(Opcode::LoadUniform, y, &[p]));
            f.push_inst(b, InstData::alu(Opcode::IAdd, z, &[x, y]));
            f.push_inst(b, InstData::alu(Opcode::Atest, cov2, &[cov, alpha]));
            f.push_inst(
                b,
                InstData::op(
                    Opcode::Blend,
                    &[w.into()],
                    &[z.into(), cov2.into(), p.into()],
                ),
            );
            f.push_inst(b, InstData::op(Opcode::Store, &[], &[z.into(), p.into()]));
            f.push_inst(b, InstData::ret());
        });
        let live = compute_ssa_liveness(&f);
        let before = f.block_insts(b0).to_vec();
        let orig_peak = block_pressure(&f, b0, &live);

        let bump = Bump::new();
        let changed = schedule_block(&mut f, b0, &live, &bump);
        let after = f.block_insts(b0).to_vec();
        let dag = build_dag(&f, &before[..before.len() - 1], &bump);
        assert_topological(&dag, &after);
        if changed {
            assert!(block_pressure(&f, b0, &live) < orig_peak);
        } else {
            assert_eq!(after, before);
        }

        // The preload stays first, and ordered message pairs keep their
        // relative order.
        assert_eq!(after[0], before[0]);
        let pos = |inst: Inst| after.iter().position(|&i| i == inst).unwrap();
        let (store0, load, atest, blend, store1) =
            (before[4], before[5], before[8], before[9], before[10]);
        assert!(pos(store0) < pos(load));
        assert!(pos(store0) < pos(atest));
        assert!(pos(atest) < pos(blend));
        assert!(pos(load) < pos(store1));
        assert!(pos(atest) < pos(store1));
    }

    #[test]
    fn dag_dedups_and_orders_memory() {
        let (f, b0) = single_block(|f, b| {
            let [p, a, x] = f.new_vregs();
            f.push_inst(b, InstData::constant(p, 0));
            f.push_inst(b, InstData::constant(a, 1));
            f.push_inst(b, InstData::op(Opcode::Store, &[], &[a.into(), p.into()]));
            f.push_inst(b, InstData::alu(Opcode::Load, x, &[p]));
            f.push_inst(
                b,
                InstData::op(
                    Opcode::Store,
                    &[],
                    &[Operand::vreg(x), Operand::vreg(p)],
                ),
            );
            f.push_inst(b, InstData::op(Opcode::Discard, &[], &[x.into()]));
        });
        let bump = Bump::new();
        let dag = build_dag(&f, f.block_insts(b0), &bump);
        let deps = |n: usize| -> Vec<u32> {
            let mut d: Vec<u32> = dag[n].deps.iter().copied().collect();
            d.sort();
            d
        };
        assert_eq!(deps(2), [0, 1]);
        // The load reads p and follows the store.
        assert_eq!(deps(3), [0, 2]);
        // x and the last load are the same node, recorded once.
        assert_eq!(deps(4), [0, 2, 3]);
        assert_eq!(deps(5), [3, 4]);
        assert_eq!(dag[0].dependents, 3);
        assert_eq!(dag[5].dependents, 0);
    }

    #[test]
    fn schedule_counts_changed_blocks() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let b1 = f.add_block();
        f.add_edge(b0, b1);
        let v: Vec<VReg> = (0..6).map(|_| f.new_vreg()).collect();
        for (i, &x) in v[..4].iter().enumerate() {
            f.push_inst(b0, InstData::constant(x, i as u32));
        }
        f.push_inst(b0, InstData::alu(Opcode::IAdd, v[4], &[v[0], v[1]]));
        f.push_inst(b0, InstData::alu(Opcode::IAdd, v[5], &[v[2], v[3]]));
        f.push_inst(b0, InstData::jump());
        f.push_inst(b1, InstData::op(Opcode::Store, &[], &[v[4].into(), v[5].into()]));
        f.push_inst(b1, InstData::ret());

        let live = compute_ssa_liveness(&f);
        let before = block_pressure(&f, b0, &live);
        assert_eq!(schedule(&mut f, &live), 1);
        assert!(block_pressure(&f, b0, &live) < before);
        assert_eq!(f.inst(*f.block_insts(b0).last().unwrap()).opcode, Opcode::Jump);
    }
}
