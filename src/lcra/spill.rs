/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill candidate selection and spill code insertion.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::max;
use smallvec::SmallVec;

use super::LcraState;
use crate::{Block, Func, InstData, Opcode, Operand, Reg, Stats, VReg};

/// Preloaded coverage mask.
const COVERAGE_REG: usize = 60;

/// Values that must stay in registers.
fn unspillable(f: &Func) -> Vec<bool> {
    let mut no_spill = vec![false; f.num_vregs()];
    for (_, inst) in f.live_insts() {
        let data = f.inst(inst);
        let fixed = data.no_spill
            || matches!(data.opcode, Opcode::Atest | Opcode::ZsEmit)
            || (data.is_move() && data.srcs[0].first_preg() == Some(COVERAGE_REG));
        if fixed {
            for (_, dest) in data.vreg_dests() {
                no_spill[dest.index()] = true;
            }
        }
    }
    for &(v, _) in f.pinned() {
        no_spill[v.index()] = true;
    }
    no_spill
}

/// Pick the value to spill after an attempt failed at
/// `state.spill_node`.
///
/// Candidates are the failed value's spillable neighbours; the most
/// constrained one wins, and ties go to the first in the row. When no
/// neighbour qualifies the failed value itself is tried.
pub fn choose_spill_node(f: &Func, state: &LcraState) -> Option<VReg> {
    let node = state.spill_node?;
    let no_spill = unspillable(f);

    let mut best = None;
    let mut best_cost = 0;
    for (j, constraint) in state.linear[node.index()].iter() {
        let j = j as usize;
        if constraint == 0 || no_spill[j] {
            continue;
        }
        let cost = state.count_constraints(j);
        if cost > best_cost {
            best = Some(VReg::new(j));
            best_cost = cost;
        }
    }

    if best.is_none() && !no_spill[node.index()] && state.defined[node.index()] {
        best = Some(node);
    }
    best
}

/// Move `v` to a fresh scratch slot: store after each definition and
/// reload before each use, through new short-lived values.
pub fn spill_value(f: &mut Func, v: VReg, stats: &mut Stats) {
    let base = f.scratch_size;
    let mut channels = 0;

    let blocks: Vec<Block> = f.blocks().collect();
    for block in blocks {
        let old = f.block_insts(block).to_vec();
        let mut insts = Vec::with_capacity(old.len());

        for inst in old {
            let data = f.inst(inst);
            let extent = data
                .srcs
                .iter()
                .enumerate()
                .filter(|(_, op)| op.as_vreg() == Some(v))
                .map(|(s, op)| op.offset as usize + data.read_count(s))
                .max();
            let defs: SmallVec<[(usize, usize, usize); 2]> = data
                .dests
                .iter()
                .enumerate()
                .filter(|(_, op)| op.as_vreg() == Some(v))
                .map(|(d, op)| (d, op.offset as usize, data.write_count(d)))
                .collect();

            if let Some(extent) = extent {
                let fill = f.new_vreg();
                insts.push(f.create_inst(InstData::load_scratch(fill, extent, base).with_no_spill()));
                for src in f.inst_mut(inst).srcs.iter_mut() {
                    if src.as_vreg() == Some(v) {
                        src.reg = Reg::Virtual(fill);
                    }
                }
                stats.fills += 1;
            }

            insts.push(inst);

            for (d, offset, count) in defs {
                let tmp = f.new_vreg();
                let data = f.inst_mut(inst);
                data.dests[d] = Operand::vreg(tmp);
                data.no_spill = true;
                let slot = base + 4 * offset as u32;
                insts.push(f.create_inst(InstData::store_scratch(tmp, count, slot)));
                stats.spills += 1;
                channels = max(channels, offset + count);
            }
        }

        f.set_block_insts(block, insts);
    }

    trace!("spilled {} to scratch {}..{}", v, base, base + 4 * channels as u32);
    f.scratch_size += 4 * channels as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{self, Inputs};
    use crate::{PReg, RegFormat};

    #[test]
    fn spill_vector_value() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [p, v, s] = f.new_vregs();
        f.scratch_size = 16;
        f.push_inst(b0, InstData::constant(p, 0));
        f.push_inst(b0, InstData::alu(Opcode::Load, v, &[p]).with_vec(4));
        f.push_inst(
            b0,
            InstData::op(
                Opcode::IAdd,
                &[s.into()],
                &[Operand::vreg(v).at(1), Operand::vreg(v).at(2)],
            ),
        );
        f.push_inst(b0, InstData::ret());

        let mut stats = Stats::default();
        spill_value(&mut f, v, &mut stats);
        assert_eq!((stats.spills, stats.fills), (1, 1));
        assert_eq!(f.scratch_size, 32);

        let insts: Vec<&InstData> = f.block_insts(b0).iter().map(|&i| f.inst(i)).collect();
        let ops: Vec<Opcode> = insts.iter().map(|d| d.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Const,
                Opcode::Load,
                Opcode::StoreScratch,
                Opcode::LoadScratch,
                Opcode::IAdd,
                Opcode::Return
            ]
        );
        assert!(insts[1].no_spill);
        assert_eq!(insts[2].imm, 16);
        assert_eq!(insts[2].read_count(0), 4);
        assert_eq!(insts[3].imm, 16);
        assert_eq!(insts[3].write_count(0), 3);
        assert!(insts[3].no_spill);
        assert_eq!(insts[4].srcs[0].offset, 1);
        assert_eq!(insts[4].srcs[0].as_vreg(), insts[3].dests[0].as_vreg());
        assert!(!f.live_insts().any(|(_, i)| {
            let data = f.inst(i);
            data.reads(v) || data.vreg_dests().any(|(_, d)| d == v)
        }));
    }

    #[test]
    fn spill_half_precision_value() {
        // Four 16-bit channels occupy two registers, in the slot and in
        // the reloads.
        let mut f = Func::new();
        let b0 = f.add_block();
        let [p, v, q, s] = f.new_vregs();
        f.push_inst(b0, InstData::constant(p, 64));
        f.push_inst(
            b0,
            InstData::alu(Opcode::Load, v, &[p])
                .with_vec(4)
                .with_format(RegFormat::F16),
        );
        f.push_inst(b0, InstData::constant(q, 128));
        f.push_inst(
            b0,
            InstData::op(Opcode::Store, &[], &[v.into(), q.into()])
                .with_vec(4)
                .with_format(RegFormat::F16),
        );
        f.push_inst(
            b0,
            InstData::op(Opcode::IAdd, &[s.into()], &[Operand::vreg(v).at(1), p.into()]),
        );
        f.push_inst(b0, InstData::op(Opcode::Store, &[], &[s.into(), p.into()]));
        f.push_inst(b0, InstData::ret());

        let before = interp::run(&f, &Inputs::default()).unwrap();
        let mut stats = Stats::default();
        spill_value(&mut f, v, &mut stats);
        assert_eq!((stats.spills, stats.fills), (1, 2));
        assert_eq!(f.scratch_size, 8);

        let insts: Vec<&InstData> = f.block_insts(b0).iter().map(|&i| f.inst(i)).collect();
        let store = insts
            .iter()
            .find(|d| d.opcode == Opcode::StoreScratch)
            .unwrap();
        assert_eq!(store.read_count(0), 2);
        let reloads: Vec<&&InstData> = insts
            .iter()
            .filter(|d| d.opcode == Opcode::LoadScratch)
            .collect();
        assert_eq!(reloads.len(), 2);
        assert!(reloads.iter().all(|d| d.write_count(0) == 2 && d.imm == 0));

        let after = interp::run(&f, &Inputs::default()).unwrap();
        assert!(before.same_effects(&after));
        assert!(!after.memory.is_empty());
    }

    #[test]
    fn exempt_values_are_not_chosen() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [cov, a] = f.new_vregs();
        f.push_inst(b0, InstData::mov(cov, PReg::new(60)));
        f.push_inst(b0, InstData::constant(a, 1));
        f.push_inst(b0, InstData::op(Opcode::Store, &[], &[a.into(), cov.into()]));
        f.push_inst(b0, InstData::ret());

        let mut state = LcraState::new(2);
        state.defined = vec![true, true];
        state.add_interference(0, 1, 1, 1);
        state.spill_node = Some(a);
        // cov copies the coverage mask, and a is the failed value.
        assert_eq!(choose_spill_node(&f, &state), Some(a));

        f.pin(a, PReg::new(3));
        assert_eq!(choose_spill_node(&f, &state), None);
    }

    #[test]
    fn most_constrained_neighbour_wins() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let vs: [VReg; 4] = f.new_vregs();
        for &v in &vs {
            f.push_inst(b0, InstData::constant(v, 0));
        }
        f.push_inst(b0, InstData::ret());

        let mut state = LcraState::new(4);
        state.add_interference(0, 1, 1, 1);
        state.add_interference(0, 1, 2, 1);
        state.add_interference(2, 1, 3, 1);
        state.spill_node = Some(vs[0]);
        assert_eq!(choose_spill_node(&f, &state), Some(vs[2]));
    }
}
