/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Phi lowering.
//!
//! Each phi `d = phi s0, s1, ...` gets a fresh value `t`. Every
//! predecessor `p_i` copies `t = s_i` just before its terminator, and
//! the phi itself becomes `d = mov t`. Since all of a block's phis
//! read their own `t`, the copies on one edge behave as a parallel
//! copy. The `t` values have one definition per predecessor, so the
//! function is no longer in SSA form afterwards.

use alloc::vec::Vec;
use smallvec::smallvec;

use crate::{Block, Func, InstData, Opcode, Operand};

/// Replace every phi with copies. Returns the number of phis lowered.
pub fn lower_phis(f: &mut Func) -> usize {
    let mut lowered = 0;
    let blocks: Vec<Block> = f.blocks().collect();

    for block in blocks {
        let phis: Vec<_> = f.block_insts(block)[..f.phi_count(block)].to_vec();
        let preds: Vec<Block> = f.block_preds(block).to_vec();

        for phi in phis {
            let tmp = f.new_vreg();
            let srcs = f.inst(phi).srcs.clone();
            for (&pred, &src) in preds.iter().zip(srcs.iter()) {
                let pos = f.terminator_start(pred);
                f.insert_inst(pred, pos, InstData::mov(tmp, src));
            }

            let data = f.inst_mut(phi);
            trace!("lowering phi {}", data);
            data.opcode = Opcode::Mov;
            data.srcs = smallvec![Operand::vreg(tmp)];
            lowered += 1;
        }
    }
    lowered
}
