/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Rewriting operands onto the allocation, and cleanup afterwards.

use alloc::vec::Vec;

use crate::{Block, Func, Operand, PReg, Reg};

fn install_operand(op: &mut Operand, solutions: &[Option<PReg>]) {
    if let Reg::Virtual(v) = op.reg {
        let reg = solutions[v.index()].and_then(|base| base.offset(op.offset as usize));
        debug_assert!(reg.is_some(), "{} has no register", v);
        if let Some(reg) = reg {
            *op = Operand::preg(reg);
        }
    }
}

/// Replace every virtual operand with its physical register, folding
/// the component offset in.
pub fn install_registers(f: &mut Func, solutions: &[Option<PReg>]) {
    let insts: Vec<_> = f.live_insts().map(|(_, inst)| inst).collect();
    for inst in insts {
        let data = f.inst_mut(inst);
        for op in data.dests.iter_mut().chain(data.srcs.iter_mut()) {
            install_operand(op, solutions);
        }
    }
}

/// Remove copies whose source and destination ended up in the same
/// register. Returns the number removed.
pub fn remove_self_moves(f: &mut Func) -> usize {
    let mut removed = 0;
    let blocks: Vec<Block> = f.blocks().collect();
    for block in blocks {
        let before = f.block_insts(block).len();
        let insts: Vec<_> = f
            .block_insts(block)
            .iter()
            .copied()
            .filter(|&inst| {
                let data = f.inst(inst);
                let redundant = data.is_move()
                    && data.dests[0].first_preg().is_some()
                    && data.dests[0].first_preg() == data.srcs[0].first_preg();
                if redundant {
                    trace!("removing redundant move {}", data);
                }
                !redundant
            })
            .collect();
        removed += before - insts.len();
        f.set_block_insts(block, insts);
    }
    removed
}
