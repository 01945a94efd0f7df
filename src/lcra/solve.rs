/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Constraint store operations and the greedy solver.

use alloc::vec;
use alloc::vec::Vec;

use super::LcraState;
use crate::nodearray::{NodeArray, NodeValue, MAX_SPARSE};
use crate::{Func, MachineEnv, Opcode, Operand, PReg, PRegSet, RegAllocError, VReg};

/// Largest displacement a constraint can describe.
const MAX_DISPLACEMENT: i32 = 7;

impl LcraState {
    pub fn new(node_count: usize) -> Self {
        LcraState {
            node_count,
            affinity: vec![PRegSet::empty(); node_count],
            linear: vec![NodeArray::new(); node_count],
            solutions: vec![None; node_count],
            defined: vec![false; node_count],
            spill_node: None,
            coalesced: 0,
        }
    }

    /// Record that component set `cmask_i` of `i` and `cmask_j` of `j`
    /// are live at the same time.
    pub fn add_interference(&mut self, i: usize, cmask_i: u8, j: usize, cmask_j: u8) {
        if i == j {
            return;
        }

        let (ci, cj) = (cmask_i as u32, cmask_j as u32);
        let mut forward: NodeValue = 0;
        let mut backward: NodeValue = 0;
        for d in 0..8 {
            // Component k of i meets component k - d of j.
            if ci & (cj << d) != 0 {
                forward |= 1 << (7 - d);
                backward |= 1 << (7 + d);
            }
            // Component k of i meets component k + d of j.
            if ci & (cj >> d) != 0 {
                forward |= 1 << (7 + d);
                backward |= 1 << (7 - d);
            }
        }

        self.linear[i].orr(j as u32, forward, MAX_SPARSE, self.node_count);
        self.linear[j].orr(i as u32, backward, MAX_SPARSE, self.node_count);
    }

    /// Whether the current solution of `i` is compatible with every
    /// solved neighbour.
    pub fn test_linear(&self, i: usize) -> bool {
        let base = match self.solutions[i] {
            Some(base) => base,
            None => return true,
        };
        for (j, constraint) in self.linear[i].iter() {
            let other = match self.solutions[j as usize] {
                Some(other) => other,
                None => continue,
            };
            let d = base.index() as i32 - other.index() as i32;
            if d.abs() <= MAX_DISPLACEMENT && constraint & (1 << (d + MAX_DISPLACEMENT)) != 0 {
                return false;
            }
        }
        true
    }

    /// Assign every remaining value the lowest legal register in its
    /// affinity. Returns false, with `spill_node` set, at the first
    /// value that has none.
    pub fn solve(&mut self) -> bool {
        for i in 0..self.node_count {
            if self.solutions[i].is_some() || !self.defined[i] {
                continue;
            }

            let mut placed = false;
            for reg in self.affinity[i] {
                self.solutions[i] = Some(reg);
                if self.test_linear(i) {
                    placed = true;
                    break;
                }
            }

            if !placed {
                self.solutions[i] = None;
                self.spill_node = Some(VReg::new(i));
                trace!("lcra: no register for v{} in {:?}", i, self.affinity[i]);
                return false;
            }
        }
        true
    }

    /// Total number of displacement bits in the row of `i`; a cost for
    /// keeping `i` in a register.
    pub fn count_constraints(&self, i: usize) -> u32 {
        self.linear[i]
            .iter()
            .map(|(_, constraint)| constraint.count_ones())
            .sum()
    }
}

/// Registers each value must take regardless of the solver.
fn collect_pins(f: &Func) -> Vec<(VReg, PReg)> {
    let mut pins = Vec::new();
    for (_, inst) in f.live_insts() {
        let data = f.inst(inst);
        let mut pin = |op: Option<&Operand>, reg: usize| {
            if let Some(v) = op.and_then(|op| op.as_vreg()) {
                pins.push((v, PReg::new(reg)));
            }
        };
        match data.opcode {
            Opcode::Blend => {
                pin(data.srcs.first(), 0);
                pin(data.srcs.get(3), 4);
                pin(data.dests.first(), 48);
            }
            Opcode::Atest => {
                pin(data.srcs.first(), 60);
                pin(data.dests.first(), 60);
            }
            Opcode::ZsEmit => pin(data.dests.first(), 60),
            _ => {}
        }
    }
    pins.extend_from_slice(f.pinned());
    pins
}

/// Fix the solutions of pinned values.
///
/// A pin outside the machine's register file, or of a value the
/// function does not have, is an error. A pin the attempt's file
/// cannot hold, a value pinned to two registers, or two pinned values
/// that overlap make the attempt fail at the later value.
pub fn seed_pins(
    f: &Func,
    env: &MachineEnv,
    file: PRegSet,
    state: &mut LcraState,
) -> Result<(), RegAllocError> {
    let pins = collect_pins(f);

    for &(v, reg) in &pins {
        if !env.regs.contains(reg) || v.index() >= state.node_count {
            return Err(RegAllocError::InvalidPin(v, reg));
        }
    }

    for &(v, reg) in &pins {
        let node = v.index();
        if !file.contains(reg) {
            trace!("lcra: {} pinned to {} outside this file", v, reg);
            state.spill_node.get_or_insert(v);
            continue;
        }
        match state.solutions[node] {
            None => state.solutions[node] = Some(reg),
            Some(existing) if existing == reg => {}
            Some(existing) => {
                trace!("lcra: {} pinned to both {} and {}", v, existing, reg);
                state.spill_node.get_or_insert(v);
            }
        }
    }
    if state.spill_node.is_some() {
        return Ok(());
    }

    for node in (0..state.node_count).rev() {
        if state.solutions[node].is_some() && !state.test_linear(node) {
            trace!("lcra: pinned v{} conflicts with another pin", node);
            state.spill_node = Some(VReg::new(node));
            break;
        }
    }
    Ok(())
}

/// Place the destination of each copy from a preloaded register on
/// that register when nothing objects.
pub fn coalesce_preload_moves(f: &Func, state: &mut LcraState) {
    for (_, inst) in f.live_insts() {
        let data = f.inst(inst);
        if !data.is_move() {
            continue;
        }
        let (src, dest) = match (data.srcs[0].first_preg(), data.dests[0].as_vreg()) {
            (Some(src), Some(dest)) => (src, dest),
            _ => continue,
        };
        let node = dest.index();
        let base = match src.checked_sub(data.dests[0].offset as usize) {
            Some(base) => PReg::new(base),
            None => continue,
        };
        if state.solutions[node].is_some() || !state.affinity[node].contains(base) {
            continue;
        }

        state.solutions[node] = Some(base);
        if state.test_linear(node) {
            trace!("lcra: coalesced {} into {}", dest, base);
            state.coalesced += 1;
        } else {
            state.solutions[node] = None;
        }
    }
}
