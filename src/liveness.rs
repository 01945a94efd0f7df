/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Backward liveness dataflow.
//!
//! Three domains share one worklist solver:
//!
//! - SSA liveness: one bit per value. Phis sit on the incoming edges,
//!   so each predecessor sees the phi destinations killed and its own
//!   phi source made live.
//! - Register liveness: one bit per physical register, counting only
//!   operands that already name a register.
//! - Component liveness: a mask of live 32-bit components per value,
//!   used to build interference.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::bitset::BitSet;
use crate::postorder;
use crate::{Block, Func, InstData, Opcode, PRegSet};

/// Live-in and live-out sets per block.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Liveness<S> {
    pub live_in: Vec<S>,
    pub live_out: Vec<S>,
    /// Number of blocks processed before the fixpoint.
    pub iterations: usize,
}

impl<S> Liveness<S> {
    pub fn live_in(&self, block: Block) -> &S {
        &self.live_in[block.index()]
    }

    pub fn live_out(&self, block: Block) -> &S {
        &self.live_out[block.index()]
    }
}

pub type SsaLiveness = Liveness<BitSet>;
pub type RegLiveness = Liveness<PRegSet>;
pub type ComponentLiveness = Liveness<Vec<u8>>;

/// A lattice for the backward solver.
trait LiveDomain {
    type Set: Clone;

    fn empty(&self, f: &Func) -> Self::Set;

    /// Step backwards over one instruction.
    fn update(&self, live: &mut Self::Set, inst: &InstData);

    /// Union `from` into `into`; returns whether `into` grew.
    fn merge(&self, into: &mut Self::Set, from: &Self::Set) -> bool;

    /// Whether leading phis are edge operations rather than part of
    /// the block body.
    fn phis_on_edges(&self) -> bool {
        false
    }

    /// What flows from `block`'s live-in into `pred`'s live-out.
    fn edge(&self, _f: &Func, _block: Block, _pred: Block, live_in: &Self::Set) -> Self::Set {
        live_in.clone()
    }
}

fn solve<D: LiveDomain>(f: &Func, domain: &D) -> Liveness<D::Set> {
    let n = f.num_blocks();
    let empty = domain.empty(f);
    let mut live_in = vec![empty.clone(); n];
    let mut live_out = vec![empty; n];

    // Postorder first, so most blocks are seen after their successors,
    // then whatever the entry cannot reach.
    let order = postorder::calculate(n, f.entry(), |block| f.block_succs(block))
        .unwrap_or_default();
    let mut queue: VecDeque<Block> = order.into_iter().collect();
    let mut in_queue = BitSet::with_capacity(n);
    for &block in &queue {
        in_queue.insert(block.index());
    }
    for b in (0..n).rev() {
        if !in_queue.contains(b) {
            in_queue.insert(b);
            queue.push_back(Block::new(b));
        }
    }
    let mut iterations = 0;

    while let Some(block) = queue.pop_front() {
        in_queue.remove(block.index());
        iterations += 1;

        let mut live = live_out[block.index()].clone();
        for &inst in f.block_insts(block).iter().rev() {
            let data = f.inst(inst);
            if domain.phis_on_edges() && data.opcode == Opcode::Phi {
                break;
            }
            domain.update(&mut live, data);
        }

        for &pred in f.block_preds(block) {
            let incoming = domain.edge(f, block, pred, &live);
            let grew = domain.merge(&mut live_out[pred.index()], &incoming);
            if grew && !in_queue.contains(pred.index()) {
                in_queue.insert(pred.index());
                queue.push_back(pred);
            }
        }

        live_in[block.index()] = live;
    }

    trace!("liveness: fixpoint after {} block visits", iterations);
    Liveness {
        live_in,
        live_out,
        iterations,
    }
}

struct Ssa;

impl LiveDomain for Ssa {
    type Set = BitSet;

    fn empty(&self, f: &Func) -> BitSet {
        BitSet::with_capacity(f.num_vregs())
    }

    fn update(&self, live: &mut BitSet, inst: &InstData) {
        ssa_update(live, inst);
    }

    fn merge(&self, into: &mut BitSet, from: &BitSet) -> bool {
        into.union_with(from)
    }

    fn phis_on_edges(&self) -> bool {
        true
    }

    fn edge(&self, f: &Func, block: Block, pred: Block, live_in: &BitSet) -> BitSet {
        let mut out = live_in.clone();
        let phis = &f.block_insts(block)[..f.phi_count(block)];
        for &phi in phis {
            for (_, dest) in f.inst(phi).vreg_dests() {
                out.remove(dest.index());
            }
        }
        if let Some(pred_index) = f.pred_index(block, pred) {
            for &phi in phis {
                if let Some(src) = f.inst(phi).srcs.get(pred_index).and_then(|op| op.as_vreg()) {
                    out.insert(src.index());
                }
            }
        }
        out
    }
}

struct Regs;

impl LiveDomain for Regs {
    type Set = PRegSet;

    fn empty(&self, _f: &Func) -> PRegSet {
        PRegSet::empty()
    }

    fn update(&self, live: &mut PRegSet, inst: &InstData) {
        *live = reg_update(*live, inst);
    }

    fn merge(&self, into: &mut PRegSet, from: &PRegSet) -> bool {
        let old = *into;
        into.union_from(*from);
        *into != old
    }
}

struct Components;

impl LiveDomain for Components {
    type Set = Vec<u8>;

    fn empty(&self, f: &Func) -> Vec<u8> {
        vec![0; f.num_vregs()]
    }

    fn update(&self, live: &mut Vec<u8>, inst: &InstData) {
        component_update(live, inst);
    }

    fn merge(&self, into: &mut Vec<u8>, from: &Vec<u8>) -> bool {
        let mut changed = false;
        for (i, f) in into.iter_mut().zip(from.iter()) {
            changed |= *f & !*i != 0;
            *i |= *f;
        }
        changed
    }
}

/// Kill the values `inst` defines, then make live the ones it reads.
pub fn ssa_update(live: &mut BitSet, inst: &InstData) {
    for (_, dest) in inst.vreg_dests() {
        live.remove(dest.index());
    }
    for (_, src) in inst.vreg_srcs() {
        live.insert(src.index());
    }
}

/// Register liveness before `inst`, given the registers live after.
pub fn reg_update(mut live: PRegSet, inst: &InstData) -> PRegSet {
    for (d, dest) in inst.dests.iter().enumerate() {
        if let Some(base) = dest.first_preg() {
            live.subtract(PRegSet::range(base, inst.write_count(d)));
        }
    }
    for (s, src) in inst.srcs.iter().enumerate() {
        if let Some(base) = src.first_preg() {
            live.union_from(PRegSet::range(base, inst.read_count(s)));
        }
    }
    live
}

/// Component liveness before `inst`, given the masks live after.
pub fn component_update(live: &mut [u8], inst: &InstData) {
    for (d, dest) in inst.vreg_dests() {
        live[dest.index()] &= !inst.write_mask(d);
    }
    for (s, src) in inst.vreg_srcs() {
        live[src.index()] |= inst.read_mask(s);
    }
}

pub fn compute_ssa_liveness(f: &Func) -> SsaLiveness {
    solve(f, &Ssa)
}

pub fn compute_reg_liveness(f: &Func) -> RegLiveness {
    solve(f, &Regs)
}

pub fn compute_component_liveness(f: &Func) -> ComponentLiveness {
    solve(f, &Components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operand, PReg, RegFormat, VReg};

    /// `live_in == (live_out - kill) ∪ gen` for a block without phis.
    fn check_block_equation(f: &Func, live: &SsaLiveness, block: Block) {
        let mut expected = live.live_out(block).clone();
        for &inst in f.block_insts(block).iter().rev() {
            ssa_update(&mut expected, f.inst(inst));
        }
        assert!(expected.same_members(live.live_in(block)), "{}", block);

        let mut union = BitSet::with_capacity(f.num_vregs());
        for &succ in f.block_succs(block) {
            union.union_with(live.live_in(succ));
        }
        assert!(union.same_members(live.live_out(block)), "{}", block);
    }

    fn counting_loop() -> (Func, [VReg; 5]) {
        // block0: n = const 10; i0 = const 0; jump
        // block1: i = phi(i0, i1); c = isub n, i; branch c
        // block2: i1 = iadd i, n; jump
        // block3: return
        let mut f = Func::new();
        let b: Vec<Block> = (0..4).map(|_| f.add_block()).collect();
        f.add_edge(b[0], b[1]);
        f.add_edge(b[1], b[2]);
        f.add_edge(b[1], b[3]);
        f.add_edge(b[2], b[1]);
        let [n, i0, i, c, i1] = f.new_vregs();
        f.push_inst(b[0], InstData::constant(n, 10));
        f.push_inst(b[0], InstData::constant(i0, 0));
        f.push_inst(b[0], InstData::jump());
        f.push_inst(b[1], InstData::phi(i, &[i0, i1]));
        f.push_inst(b[1], InstData::alu(Opcode::ISub, c, &[n, i]));
        f.push_inst(b[1], InstData::branch(c));
        f.push_inst(b[2], InstData::alu(Opcode::IAdd, i1, &[i, n]));
        f.push_inst(b[2], InstData::jump());
        f.push_inst(b[3], InstData::ret());
        (f, [n, i0, i, c, i1])
    }

    #[test]
    fn loop_carried_values() {
        let (f, [n, i0, i, _c, i1]) = counting_loop();
        let live = compute_ssa_liveness(&f);
        let b = |n| Block::new(n);

        assert!(live.live_in(b(0)).is_empty());
        let out0: Vec<usize> = live.live_out(b(0)).iter().collect();
        assert_eq!(out0, [n.index(), i0.index()]);

        // The phi destination is defined on the edge, so it is live
        // into the header but killed on both incoming edges.
        assert!(live.live_in(b(1)).contains(i.index()));
        assert!(live.live_in(b(1)).contains(n.index()));
        assert!(!live.live_out(b(2)).contains(i.index()));
        assert!(live.live_out(b(2)).contains(i1.index()));
        assert!(!live.live_out(b(0)).contains(i1.index()));
        assert!(live.live_out(b(2)).contains(n.index()));
        assert!(live.live_in(b(3)).is_empty());
    }

    #[test]
    fn fixpoint_equations_hold() {
        let mut f = Func::new();
        let b: Vec<Block> = (0..4).map(|_| f.add_block()).collect();
        f.add_edge(b[0], b[1]);
        f.add_edge(b[0], b[2]);
        f.add_edge(b[1], b[3]);
        f.add_edge(b[2], b[3]);
        let [x, y, z, w] = f.new_vregs();
        f.push_inst(b[0], InstData::constant(x, 1));
        f.push_inst(b[0], InstData::constant(y, 2));
        f.push_inst(b[0], InstData::branch(x));
        f.push_inst(b[1], InstData::alu(Opcode::IAdd, z, &[x, y]));
        f.push_inst(b[1], InstData::op(Opcode::Store, &[], &[z.into(), y.into()]));
        f.push_inst(b[1], InstData::jump());
        f.push_inst(b[2], InstData::jump());
        f.push_inst(b[3], InstData::alu(Opcode::IMul, w, &[y, y]));
        f.push_inst(b[3], InstData::op(Opcode::Store, &[], &[w.into(), x.into()]));
        f.push_inst(b[3], InstData::ret());

        let live = compute_ssa_liveness(&f);
        for block in f.blocks() {
            check_block_equation(&f, &live, block);
        }

        let again = compute_ssa_liveness(&f);
        for block in f.blocks() {
            assert!(again.live_in(block).same_members(live.live_in(block)));
            assert!(again.live_out(block).same_members(live.live_out(block)));
        }
        assert!(!live.live_in(b[2]).contains(z.index()));
        assert!(live.live_in(b[2]).contains(y.index()));
    }

    #[test]
    fn register_ranges() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [a, v] = f.new_vregs();
        f.push_inst(b0, InstData::mov(a, PReg::new(3)));
        f.push_inst(
            b0,
            InstData::op(
                Opcode::Store,
                &[],
                &[Operand::preg(PReg::new(8)), Operand::vreg(a)],
            )
            .with_vec(4),
        );
        f.push_inst(
            b0,
            InstData::op(Opcode::LoadUniform, &[Operand::preg(PReg::new(8))], &[v.into()])
                .with_vec(2),
        );
        f.push_inst(b0, InstData::ret());

        let live = compute_reg_liveness(&f);
        let expected = PRegSet::range(8, 4).with(PReg::new(3));
        assert_eq!(*live.live_in(b0), expected);

        // A 16-bit load of four halves writes two registers.
        let load = InstData::op(Opcode::Load, &[Operand::preg(PReg::new(4))], &[v.into()])
            .with_vec(4)
            .with_format(RegFormat::F16);
        let before = reg_update(PRegSet::range(4, 3), &load);
        assert_eq!(before, PRegSet::range(6, 1));
    }

    #[test]
    fn register_loop_fixpoint() {
        // block0: r4 = mov r1; jump
        // block1: r5 = iadd r4, r60; branch r5
        // block2: r4 = iadd r5, r2; jump
        // block3: store r5, r4; return
        let r = |n| Operand::preg(PReg::new(n));
        let mut f = Func::new();
        let b: Vec<Block> = (0..4).map(|_| f.add_block()).collect();
        f.add_edge(b[0], b[1]);
        f.add_edge(b[1], b[2]);
        f.add_edge(b[1], b[3]);
        f.add_edge(b[2], b[1]);
        f.push_inst(b[0], InstData::mov(r(4), r(1)));
        f.push_inst(b[0], InstData::jump());
        f.push_inst(b[1], InstData::op(Opcode::IAdd, &[r(5)], &[r(4), r(60)]));
        f.push_inst(b[1], InstData::branch(r(5)));
        f.push_inst(b[2], InstData::op(Opcode::IAdd, &[r(4)], &[r(5), r(2)]));
        f.push_inst(b[2], InstData::jump());
        f.push_inst(b[3], InstData::op(Opcode::Store, &[], &[r(5), r(4)]));
        f.push_inst(b[3], InstData::ret());

        let live = compute_reg_liveness(&f);
        for block in f.blocks() {
            let mut out = PRegSet::empty();
            for &succ in f.block_succs(block) {
                out.union_from(*live.live_in(succ));
            }
            assert_eq!(out, *live.live_out(block), "{}", block);
            let mut regs = out;
            for &inst in f.block_insts(block).iter().rev() {
                regs = reg_update(regs, f.inst(inst));
            }
            assert_eq!(regs, *live.live_in(block), "{}", block);
        }

        // The preloads read inside the loop stay live from the entry
        // around the back edge.
        let set = |regs: &[usize]| {
            let mut set = PRegSet::empty();
            for &n in regs {
                set.add(PReg::new(n));
            }
            set
        };
        assert_eq!(*live.live_in(b[0]), set(&[1, 2, 60]));
        assert_eq!(*live.live_in(b[1]), set(&[2, 4, 60]));
        assert_eq!(*live.live_out(b[1]), set(&[2, 4, 5, 60]));
        assert_eq!(*live.live_in(b[2]), set(&[2, 5, 60]));
        assert_eq!(*live.live_in(b[3]), set(&[4, 5]));
    }

    #[test]
    fn component_masks() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [addr, v, x] = f.new_vregs();
        f.push_inst(b0, InstData::constant(addr, 64));
        f.push_inst(b0, InstData::alu(Opcode::Load, v, &[addr]).with_vec(4));
        f.push_inst(
            b0,
            InstData::op(
                Opcode::IAdd,
                &[x.into()],
                &[Operand::vreg(v).at(2), Operand::vreg(v).at(3)],
            ),
        );
        f.push_inst(b0, InstData::op(Opcode::Store, &[], &[x.into(), addr.into()]));
        f.push_inst(b0, InstData::ret());

        let mut live = vec![0u8; f.num_vregs()];
        let insts = f.block_insts(b0).to_vec();
        // Walk back over the store and the add.
        component_update(&mut live, f.inst(insts[3]));
        assert_eq!(live[x.index()], 0b1);
        component_update(&mut live, f.inst(insts[2]));
        assert_eq!(live[x.index()], 0);
        assert_eq!(live[v.index()], 0b1100);
        component_update(&mut live, f.inst(insts[1]));
        assert_eq!(live[v.index()], 0);

        let solved = compute_component_liveness(&f);
        assert!(solved.live_in(b0).iter().all(|&m| m == 0));
    }
}
