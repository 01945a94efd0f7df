/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Input validation: block structure, operand shapes and SSA form.

use alloc::vec;

use crate::postorder;
use crate::ir::MAX_VALUE_REGS;
use crate::liveness::compute_ssa_liveness;
use crate::{Func, Inst, Opcode, Operand, Reg, RegAllocError, VReg, NUM_REGS};

pub fn validate(f: &Func) -> Result<(), RegAllocError> {
    validate_pins(f)?;
    if f.num_blocks() == 0 {
        return Ok(());
    }
    // Successors must name existing blocks before edges are followed.
    postorder::calculate(f.num_blocks(), f.entry(), |block| f.block_succs(block))?;
    validate_placement(f)?;
    validate_blocks(f)?;
    for (_, inst) in f.live_insts() {
        validate_operands(f, inst)?;
    }
    validate_ssa(f)
}

/// No instruction may be placed twice.
fn validate_placement(f: &Func) -> Result<(), RegAllocError> {
    let mut placed = vec![false; f.num_insts()];
    for (block, inst) in f.live_insts() {
        if core::mem::replace(&mut placed[inst.index()], true) {
            return Err(RegAllocError::BB(block));
        }
    }
    Ok(())
}

/// Explicit pins must name a value of this function.
fn validate_pins(f: &Func) -> Result<(), RegAllocError> {
    match f.pinned().iter().find(|(v, _)| v.index() >= f.num_vregs()) {
        Some(&(v, reg)) => Err(RegAllocError::InvalidPin(v, reg)),
        None => Ok(()),
    }
}

fn validate_blocks(f: &Func) -> Result<(), RegAllocError> {
    if !f.block_preds(f.entry()).is_empty() {
        return Err(RegAllocError::BB(f.entry()));
    }

    for block in f.blocks() {
        let succs = f.block_succs(block);
        if succs.len() > 2 || (succs.len() == 2 && succs[0] == succs[1]) {
            return Err(RegAllocError::BB(block));
        }
        for &succ in succs {
            if !f.block_preds(succ).contains(&block) {
                return Err(RegAllocError::BB(block));
            }
        }
        for &pred in f.block_preds(block) {
            if pred.index() >= f.num_blocks() || !f.block_succs(pred).contains(&block) {
                return Err(RegAllocError::BB(block));
            }
        }

        // Only the last instruction may end the block, and it must agree
        // with the successor count.
        let insts = f.block_insts(block);
        let term = f.terminator_start(block);
        if term + 1 < insts.len() {
            return Err(RegAllocError::BB(block));
        }
        let expected_succs = match insts.get(term).map(|&i| f.inst(i).opcode) {
            Some(Opcode::Branch) => 2..=2,
            Some(Opcode::Jump) => 1..=1,
            Some(Opcode::Return) => 0..=0,
            _ => 0..=1,
        };
        if !expected_succs.contains(&succs.len()) {
            return Err(RegAllocError::BB(block));
        }

        let phis = f.phi_count(block);
        for &inst in &insts[phis..] {
            if f.inst(inst).opcode == Opcode::Phi {
                return Err(RegAllocError::Phi(inst));
            }
        }
        for &inst in &insts[..phis] {
            if block == f.entry() || f.inst(inst).srcs.len() != f.block_preds(block).len() {
                return Err(RegAllocError::Phi(inst));
            }
        }
    }
    Ok(())
}

fn validate_operands(f: &Func, inst: Inst) -> Result<(), RegAllocError> {
    let data = f.inst(inst);
    let props = data.props();

    if props.num_dests.map_or(false, |n| n as usize != data.dests.len())
        || props.num_srcs.map_or(false, |n| n as usize != data.srcs.len())
    {
        return Err(RegAllocError::Operand(inst));
    }
    let shape_ok = match data.opcode {
        Opcode::Collect => (1..=MAX_VALUE_REGS).contains(&data.srcs.len()),
        Opcode::Split => (1..=MAX_VALUE_REGS).contains(&data.dests.len()),
        Opcode::Blend => (3..=4).contains(&data.srcs.len()),
        Opcode::Phi => data.srcs.iter().all(|op| op.as_vreg().is_some()),
        _ => true,
    };
    if !shape_ok || data.vec == 0 || data.vec as usize > 2 * MAX_VALUE_REGS {
        return Err(RegAllocError::Operand(inst));
    }

    let dests = data
        .dests
        .iter()
        .enumerate()
        .map(|(d, op)| (op, data.write_count(d)));
    let srcs = data
        .srcs
        .iter()
        .enumerate()
        .map(|(s, op)| (op, data.read_count(s)));
    for (op, count) in dests.chain(srcs) {
        if !extent_fits(f, op, op.offset as usize + count) {
            return Err(RegAllocError::Operand(inst));
        }
    }
    Ok(())
}

/// Whether an access ending `end` registers past the operand's base
/// stays inside a value or the register file.
fn extent_fits(f: &Func, op: &Operand, end: usize) -> bool {
    match op.reg {
        Reg::Virtual(v) => v.index() < f.num_vregs() && end <= MAX_VALUE_REGS,
        Reg::Physical(p) => p.index() + end <= NUM_REGS,
    }
}

/// Every value has at most one def, and nothing is live into the
/// entry block: a value read on some path from the entry before any
/// def reaches it shows up there.
pub fn validate_ssa(f: &Func) -> Result<(), RegAllocError> {
    let mut defined = vec![false; f.num_vregs()];
    for (_, inst) in f.live_insts() {
        for (_, dest) in f.inst(inst).vreg_dests() {
            if defined[dest.index()] {
                return Err(RegAllocError::SSA(dest, inst));
            }
            defined[dest.index()] = true;
        }
    }

    // Reads of values with no def at all. Unreachable blocks are still
    // allocated, so they count too.
    for (_, inst) in f.live_insts() {
        if let Some((_, src)) = f.inst(inst).vreg_srcs().find(|(_, v)| !defined[v.index()]) {
            return Err(RegAllocError::SSA(src, inst));
        }
    }

    let live = compute_ssa_liveness(f);
    if let Some(v) = live.live_in(f.entry()).iter().next() {
        trace!("validate: {} is live into the entry block", v);
        return Err(RegAllocError::EntryLivein(VReg::new(v)));
    }
    Ok(())
}
