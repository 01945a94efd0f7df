/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Arbitrary SSA functions for fuzzing and benchmarking.

use alloc::vec;
use alloc::vec::Vec;

use crate::{Block, Func, Inst, InstData, MachineEnv, Opcode, Operand, PReg, VReg};

use arbitrary::Result as ArbitraryResult;
use arbitrary::{Arbitrary, Unstructured};

/// Register holding the coverage mask on entry.
const COVERAGE_REG: usize = 60;

const BINARY_OPS: &[Opcode] = &[
    Opcode::IAdd,
    Opcode::ISub,
    Opcode::IMul,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Lshift,
    Opcode::Rshift,
    Opcode::FAdd,
    Opcode::FMul,
];

#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub control_flow: bool,
    pub max_blocks: usize,
    pub max_insts_per_block: usize,
    /// Multi-register values: collects, splits and wide messages.
    pub vectors: bool,
    /// Memory, varying and texture messages.
    pub messages: bool,
    /// Copies out of the incoming registers at the top of the entry.
    pub preloads: bool,
    /// End the shader with an alpha test and a blend.
    pub fragment_output: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            control_flow: true,
            max_blocks: 24,
            max_insts_per_block: 20,
            vectors: true,
            messages: true,
            preloads: true,
            fragment_output: true,
        }
    }
}

/// Values readable at the current point of the block being built.
struct Avail<'a> {
    /// Single registers defined in this block, including components of
    /// wider values.
    local: Vec<Operand>,
    /// Whole single-register values defined in this block.
    scalars: Vec<VReg>,
    vectors: Vec<(VReg, usize)>,
    /// Registers defined in the entry block, which dominates every
    /// other block.
    entry: &'a [Operand],
}

impl<'a> Avail<'a> {
    fn new(entry: &'a [Operand]) -> Self {
        Avail {
            local: vec![],
            scalars: vec![],
            vectors: vec![],
            entry,
        }
    }

    fn define(&mut self, v: VReg, width: usize) {
        for k in 0..width {
            self.local.push(Operand::vreg(v).at(k));
        }
        if width == 1 {
            self.scalars.push(v);
        } else {
            self.vectors.push((v, width));
        }
    }

    fn choose(&self, u: &mut Unstructured) -> ArbitraryResult<Operand> {
        if !self.entry.is_empty() && u.ratio(1, 4)? {
            Ok(*u.choose(self.entry)?)
        } else {
            Ok(*u.choose(&self.local[..])?)
        }
    }

    fn choose_n(&self, u: &mut Unstructured, n: usize) -> ArbitraryResult<Vec<Operand>> {
        let mut ops = Vec::with_capacity(n);
        for _ in 0..n {
            ops.push(self.choose(u)?);
        }
        Ok(ops)
    }
}

impl<'a> Arbitrary<'a> for Func {
    fn arbitrary(u: &mut Unstructured<'a>) -> ArbitraryResult<Func> {
        Func::arbitrary_with_options(u, &Options::default())
    }
}

impl Func {
    pub fn arbitrary_with_options(u: &mut Unstructured, opts: &Options) -> ArbitraryResult<Func> {
        // General strategy:
        // 1. Create an arbitrary CFG.
        // 2. Fill each block with instructions reading values defined
        //    earlier in the same block or anywhere in the entry block.
        // 3. Values cross other edges through phis, whose sources are
        //    picked once every predecessor has been generated.
        let mut f = Func::new();
        let num_blocks = u.int_in_range(1..=opts.max_blocks.max(1))?;
        for _ in 0..num_blocks {
            f.add_block();
        }

        // A spine of single blocks linked to the next, or fork
        // patterns whose right arm (in `out_blocks`) is connected below
        // to an arbitrary spine block, giving loops and joins. The
        // entry never gains a predecessor.
        let mut from = 0;
        let mut out_blocks = vec![];
        let mut in_blocks = vec![];
        while from < num_blocks {
            in_blocks.push(from);
            if opts.control_flow && num_blocks > 3 && from < num_blocks - 3 && bool::arbitrary(u)? {
                f.add_edge(Block::new(from), Block::new(from + 1));
                f.add_edge(Block::new(from), Block::new(from + 2));
                f.add_edge(Block::new(from + 2), Block::new(from + 3));
                out_blocks.push(from + 1);
                from += 2;
            } else if from < num_blocks - 1 {
                f.add_edge(Block::new(from), Block::new(from + 1));
            }
            from += 1;
        }
        let targets: Vec<usize> = in_blocks.iter().copied().filter(|&b| b != 0).collect();
        for pred in out_blocks {
            let succ = *u.choose(&targets[..])?;
            f.add_edge(Block::new(pred), Block::new(succ));
        }

        let fragment_output = opts.fragment_output && bool::arbitrary(u)?;
        let mut coverage = None;
        let mut entry_values: Vec<Operand> = vec![];
        let mut exports: Vec<Vec<VReg>> = vec![];
        let mut phis: Vec<(Block, Inst)> = vec![];

        for b in 0..num_blocks {
            let block = Block::new(b);
            let mut avail = Avail::new(&entry_values[..]);

            if b == 0 {
                if fragment_output {
                    let cov = f.new_vreg();
                    f.push_inst(block, InstData::mov(cov, PReg::new(COVERAGE_REG)));
                    coverage = Some(cov);
                }
                if opts.preloads {
                    for r in 0..u.int_in_range(0..=3)? {
                        let v = f.new_vreg();
                        f.push_inst(block, InstData::mov(v, PReg::new(r)));
                        avail.define(v, 1);
                    }
                }
            } else if !f.block_preds(block).is_empty() {
                for _ in 0..u.int_in_range(0..=2)? {
                    let v = f.new_vreg();
                    phis.push((block, f.push_inst(block, InstData::phi(v, &[]))));
                    avail.define(v, 1);
                }
            }

            // Every block defines at least one value it can export.
            let seed = f.new_vreg();
            f.push_inst(block, InstData::constant(seed, u32::arbitrary(u)?));
            avail.define(seed, 1);

            for _ in 0..u.int_in_range(0..=opts.max_insts_per_block)? {
                let data = arbitrary_inst(u, &mut f, &mut avail, opts)?;
                f.push_inst(block, data);
            }

            if b + 1 == num_blocks {
                if let Some(cov) = coverage {
                    fragment_epilogue(u, &mut f, block, cov, &avail)?;
                }
            }

            let term = match f.block_succs(block).len() {
                0 => InstData::ret(),
                1 => InstData::jump(),
                _ => InstData::branch(avail.choose(u)?),
            };
            f.push_inst(block, term);

            let Avail { local, scalars, .. } = avail;
            exports.push(scalars);
            if b == 0 {
                entry_values = local;
            }
        }

        for (block, phi) in phis {
            let preds: Vec<Block> = f.block_preds(block).to_vec();
            for pred in preds {
                let src = *u.choose(&exports[pred.index()][..])?;
                f.inst_mut(phi).srcs.push(Operand::vreg(src));
            }
        }

        Ok(f)
    }
}

fn arbitrary_inst(
    u: &mut Unstructured,
    f: &mut Func,
    avail: &mut Avail,
    opts: &Options,
) -> ArbitraryResult<InstData> {
    let dest = f.new_vreg();
    let data = match u.int_in_range(0..=9)? {
        0 => InstData::constant(dest, u32::arbitrary(u)?),
        1..=4 => {
            let opcode = *u.choose(BINARY_OPS)?;
            InstData::op(opcode, &[dest.into()], &avail.choose_n(u, 2)?)
        }
        5 => {
            let opcode = if bool::arbitrary(u)? {
                Opcode::CSel
            } else {
                Opcode::FFma
            };
            InstData::op(opcode, &[dest.into()], &avail.choose_n(u, 3)?)
        }
        6 => InstData::mov(dest, avail.choose(u)?),
        7 if opts.vectors && !avail.vectors.is_empty() && bool::arbitrary(u)? => {
            let (v, width) = *u.choose(&avail.vectors[..])?;
            let mut dests = vec![Operand::vreg(dest)];
            for _ in 1..width {
                let d = f.new_vreg();
                dests.push(Operand::vreg(d));
            }
            for d in &dests {
                if let Some(d) = d.as_vreg() {
                    avail.define(d, 1);
                }
            }
            return Ok(InstData::op(Opcode::Split, &dests, &[Operand::vreg(v)]));
        }
        7 if opts.vectors => {
            let width = u.int_in_range(2..=4)?;
            let data = InstData::op(Opcode::Collect, &[dest.into()], &avail.choose_n(u, width)?);
            avail.define(dest, width);
            return Ok(data);
        }
        8 if opts.messages => {
            let width = if opts.vectors {
                u.int_in_range(1..=4)?
            } else {
                1
            };
            let data = match u.int_in_range(0..=2)? {
                0 => InstData::op(Opcode::Load, &[dest.into()], &[avail.choose(u)?]),
                1 => InstData::alu(Opcode::LdVar, dest, &[]).with_imm(u.int_in_range(0..=7)?),
                _ => InstData::op(Opcode::Texture, &[dest.into()], &avail.choose_n(u, 2)?),
            };
            avail.define(dest, width);
            return Ok(data.with_vec(width));
        }
        9 if opts.messages => {
            let addr = avail.choose(u)?;
            if bool::arbitrary(u)? {
                InstData::op(Opcode::AtomicAdd, &[dest.into()], &[addr, avail.choose(u)?])
            } else if opts.vectors && !avail.vectors.is_empty() && bool::arbitrary(u)? {
                let (v, width) = *u.choose(&avail.vectors[..])?;
                return Ok(InstData::op(Opcode::Store, &[], &[Operand::vreg(v), addr]).with_vec(width));
            } else {
                return Ok(InstData::op(Opcode::Store, &[], &[avail.choose(u)?, addr]));
            }
        }
        _ => InstData::constant(dest, u.int_in_range(0..=255)?),
    };
    avail.define(dest, 1);
    Ok(data)
}

/// Alpha-test the incoming coverage and blend a four-channel colour.
fn fragment_epilogue(
    u: &mut Unstructured,
    f: &mut Func,
    block: Block,
    cov: VReg,
    avail: &Avail,
) -> ArbitraryResult<()> {
    let [tested, colour, out] = f.new_vregs();
    let alpha = avail.choose(u)?;
    f.push_inst(
        block,
        InstData::op(Opcode::Atest, &[tested.into()], &[cov.into(), alpha]),
    );
    f.push_inst(
        block,
        InstData::op(Opcode::Collect, &[colour.into()], &avail.choose_n(u, 4)?),
    );
    let desc = avail.choose(u)?;
    f.push_inst(
        block,
        InstData::op(
            Opcode::Blend,
            &[out.into()],
            &[colour.into(), tested.into(), desc],
        )
        .with_vec(4),
    );
    Ok(())
}

pub fn machine_env() -> MachineEnv {
    MachineEnv::bifrost()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;

    #[test]
    fn generated_functions_validate() {
        let mut seed = 0x2545_f491_u32;
        for _ in 0..64 {
            let bytes: Vec<u8> = (0..4096)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    seed as u8
                })
                .collect();
            let mut u = Unstructured::new(&bytes);
            let f = Func::arbitrary(&mut u).unwrap();
            assert!(validate(&f).is_ok(), "invalid function:\n{}", f);
        }
    }

    #[test]
    fn narrow_files_without_fragment_output() {
        let opts = Options {
            fragment_output: false,
            ..Options::default()
        };
        let env = MachineEnv::with_width(24);
        let mut seed = 0x9e37_79b9_u32;
        for _ in 0..16 {
            let bytes: Vec<u8> = (0..4096)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    seed as u8
                })
                .collect();
            let mut u = Unstructured::new(&bytes);
            let mut f = Func::arbitrary_with_options(&mut u, &opts).unwrap();
            assert!(!f
                .live_insts()
                .any(|(_, i)| matches!(f.inst(i).opcode, Opcode::Blend | Opcode::Atest)));
            let result = crate::run(&mut f, &env, &crate::RegallocOptions::default());
            assert!(
                !matches!(result, Err(crate::RegAllocError::InvalidPin(..))),
                "{:?}",
                result.err()
            );
        }
    }
}
