/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Reference interpreter.
//!
//! Runs a function either on virtual values (before allocation) or on
//! the physical register file (after it), so that the observable
//! behaviour of the two can be compared. Observable behaviour is the
//! final global memory, the sequence of blend and depth/stencil
//! emissions, and whether the thread was discarded. Scratch memory is
//! private and not compared.
//!
//! Message units without a memory model here (textures, varyings,
//! tile reads) return deterministic values derived from their inputs.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

use crate::ir::MAX_VALUE_REGS;
use crate::{Block, FxHashMap, Func, Inst, InstData, Opcode, Operand, Reg, VReg, NUM_REGS};

/// Registers clobbered by a blend are left holding this.
const CLOBBER_PATTERN: u32 = 0xdead_beef;

/// Run error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpError {
    /// A value was read before any definition reached it.
    UndefinedValue(VReg, Inst),
    /// A phi has no source for the edge taken.
    BadPhi(Inst),
    /// The step budget ran out.
    StepLimit,
    /// Fell off a block with more than one successor.
    NoTerminator(Block),
}

impl fmt::Display for InterpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpError::UndefinedValue(v, inst) => write!(f, "{} read undefined {}", inst, v),
            InterpError::BadPhi(inst) => write!(f, "phi {} has no source for this edge", inst),
            InterpError::StepLimit => write!(f, "step limit reached"),
            InterpError::NoTerminator(block) => write!(f, "{} has no terminator", block),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InterpError {}

/// A blend unit request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlendRecord {
    pub colour: SmallVec<[u32; 4]>,
    pub dual: SmallVec<[u32; 4]>,
    pub coverage: u32,
    pub descriptor: u32,
}

/// Initial machine state.
#[derive(Clone, Debug)]
pub struct Inputs {
    /// Register contents on entry, visible to preload copies.
    pub regs: [u32; NUM_REGS],
    /// Maximum number of instructions to execute.
    pub step_limit: usize,
}

impl Default for Inputs {
    fn default() -> Self {
        let mut regs = [0; NUM_REGS];
        for (r, reg) in regs.iter_mut().enumerate() {
            *reg = (r as u32).wrapping_mul(0x0100_0193) ^ 0x55aa;
        }
        Inputs {
            regs,
            step_limit: 100_000,
        }
    }
}

/// What a run left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Global memory written by stores and atomics, by byte address.
    pub memory: BTreeMap<u32, u32>,
    pub blends: Vec<BlendRecord>,
    /// `(coverage, depth, stencil)` per depth/stencil emit.
    pub zs: Vec<(u32, u32, u32)>,
    pub discarded: bool,
    pub steps: usize,
}

impl Outcome {
    /// Whether two runs are observably the same.
    pub fn same_effects(&self, other: &Outcome) -> bool {
        self.memory == other.memory
            && self.blends == other.blends
            && self.zs == other.zs
            && self.discarded == other.discarded
    }
}

type Components = [u32; MAX_VALUE_REGS];

/// Interpreter state.
pub struct Interp<'a> {
    f: &'a Func,
    /// Values by name, for operands that are still virtual.
    values: FxHashMap<VReg, Components>,
    /// Physical registers.
    regs: [u32; NUM_REGS],
    scratch: FxHashMap<u32, u32>,
    outcome: Outcome,
    step_limit: usize,
}

impl<'a> Interp<'a> {
    pub fn new(f: &'a Func, inputs: &Inputs) -> Self {
        Interp {
            f,
            values: FxHashMap::default(),
            regs: inputs.regs,
            scratch: FxHashMap::default(),
            outcome: Outcome::default(),
            step_limit: inputs.step_limit,
        }
    }

    /// Execute from the entry block until a return, a discard, or an
    /// error.
    pub fn run(mut self) -> Result<Outcome, InterpError> {
        let f = self.f;
        if f.num_blocks() == 0 {
            return Ok(self.outcome);
        }
        let mut block = f.entry();
        let mut pred: Option<Block> = None;

        loop {
            if let Some(pred) = pred {
                self.enter_block(block, pred)?;
            }
            let mut next = None;
            for &inst in &f.block_insts(block)[f.phi_count(block)..] {
                self.outcome.steps += 1;
                if self.outcome.steps > self.step_limit {
                    return Err(InterpError::StepLimit);
                }
                match self.step(block, inst)? {
                    Flow::Continue => {}
                    Flow::Goto(succ) => {
                        next = Some(succ);
                        break;
                    }
                    Flow::Stop => return Ok(self.outcome),
                }
            }
            let succ = match next {
                Some(succ) => succ,
                None => match f.block_succs(block) {
                    [] => return Ok(self.outcome),
                    [succ] => *succ,
                    _ => return Err(InterpError::NoTerminator(block)),
                },
            };
            pred = Some(block);
            block = succ;
        }
    }

    /// Evaluate the phis of `block` in parallel for the edge from
    /// `pred`.
    fn enter_block(&mut self, block: Block, pred: Block) -> Result<(), InterpError> {
        let f = self.f;
        let phis = &f.block_insts(block)[..f.phi_count(block)];
        if phis.is_empty() {
            return Ok(());
        }
        let index = f.pred_index(block, pred);
        let mut incoming: SmallVec<[(Operand, u32); 4]> = SmallVec::new();
        for &phi in phis {
            let data = f.inst(phi);
            let src = index
                .and_then(|i| data.srcs.get(i))
                .ok_or(InterpError::BadPhi(phi))?;
            incoming.push((data.dests[0], self.read(phi, src, 0)?));
        }
        for (dest, value) in incoming {
            self.write(&dest, 0, value);
        }
        Ok(())
    }

    fn read(&self, inst: Inst, op: &Operand, k: usize) -> Result<u32, InterpError> {
        let k = op.offset as usize + k;
        match op.reg {
            Reg::Virtual(v) => self
                .values
                .get(&v)
                .and_then(|c| c.get(k))
                .copied()
                .ok_or(InterpError::UndefinedValue(v, inst)),
            Reg::Physical(p) => Ok(self.regs[(p.index() + k) % NUM_REGS]),
        }
    }

    fn write(&mut self, op: &Operand, k: usize, value: u32) {
        let k = op.offset as usize + k;
        match op.reg {
            Reg::Virtual(v) => {
                if let Some(slot) = self.values.entry(v).or_insert([0; MAX_VALUE_REGS]).get_mut(k) {
                    *slot = value;
                }
            }
            Reg::Physical(p) => self.regs[(p.index() + k) % NUM_REGS] = value,
        }
    }

    /// Read `count` components of source `s`.
    fn read_vec(&self, inst: Inst, s: usize, count: usize) -> Result<SmallVec<[u32; 4]>, InterpError> {
        let op = &self.f.inst(inst).srcs[s];
        (0..count).map(|k| self.read(inst, op, k)).collect()
    }

    fn src(&self, inst: Inst, s: usize) -> Result<u32, InterpError> {
        self.read(inst, &self.f.inst(inst).srcs[s], 0)
    }

    fn set_dest(&mut self, data: &InstData, values: &[u32]) {
        let dest = data.dests[0];
        for (k, &value) in values.iter().enumerate() {
            self.write(&dest, k, value);
        }
    }

    fn binary_op(&mut self, inst: Inst, op: impl Fn(u32, u32) -> u32) -> Result<(), InterpError> {
        let f = self.f;
        let value = op(self.src(inst, 0)?, self.src(inst, 1)?);
        self.set_dest(f.inst(inst), &[value]);
        Ok(())
    }

    fn float_op(&mut self, inst: Inst, op: impl Fn(f32, f32) -> f32) -> Result<(), InterpError> {
        self.binary_op(inst, |a, b| op(f32::from_bits(a), f32::from_bits(b)).to_bits())
    }

    fn load_memory(&self, addr: u32) -> u32 {
        match self.outcome.memory.get(&addr) {
            Some(&value) => value,
            None => addr.wrapping_mul(0x9e37_79b9) >> 3,
        }
    }

    fn step(&mut self, block: Block, inst: Inst) -> Result<Flow, InterpError> {
        let f = self.f;
        let data = f.inst(inst);
        let succ = |i: usize| f.block_succs(block).get(i).copied();

        match data.opcode {
            Opcode::Mov => {
                let value = self.src(inst, 0)?;
                self.set_dest(data, &[value]);
            }
            Opcode::Const => self.set_dest(data, &[data.imm]),
            Opcode::Phi => return Err(InterpError::BadPhi(inst)),
            Opcode::IAdd => self.binary_op(inst, u32::wrapping_add)?,
            Opcode::ISub => self.binary_op(inst, u32::wrapping_sub)?,
            Opcode::IMul => self.binary_op(inst, u32::wrapping_mul)?,
            Opcode::And => self.binary_op(inst, |l, r| l & r)?,
            Opcode::Or => self.binary_op(inst, |l, r| l | r)?,
            Opcode::Xor => self.binary_op(inst, |l, r| l ^ r)?,
            Opcode::Lshift => self.binary_op(inst, |l, r| l.wrapping_shl(r))?,
            Opcode::Rshift => self.binary_op(inst, |l, r| l.wrapping_shr(r))?,
            Opcode::FAdd => self.float_op(inst, |l, r| l + r)?,
            Opcode::FMul => self.float_op(inst, |l, r| l * r)?,
            Opcode::FFma => {
                let [a, b, c] = [self.src(inst, 0)?, self.src(inst, 1)?, self.src(inst, 2)?]
                    .map(f32::from_bits);
                self.set_dest(data, &[(a * b + c).to_bits()]);
            }
            Opcode::CSel => {
                let value = if self.src(inst, 0)? != 0 {
                    self.src(inst, 1)?
                } else {
                    self.src(inst, 2)?
                };
                self.set_dest(data, &[value]);
            }
            Opcode::Collect => {
                let values = (0..data.srcs.len())
                    .map(|s| self.src(inst, s))
                    .collect::<Result<SmallVec<[u32; 8]>, _>>()?;
                self.set_dest(data, &values);
            }
            Opcode::Split => {
                let values = self.read_vec(inst, 0, data.dests.len())?;
                for (dest, value) in data.dests.iter().zip(values) {
                    self.write(dest, 0, value);
                }
            }
            Opcode::Load | Opcode::LoadUniform => {
                let addr = self.src(inst, 0)?;
                let values: SmallVec<[u32; 8]> = (0..data.write_count(0) as u32)
                    .map(|k| self.load_memory(addr.wrapping_add(4 * k)))
                    .collect();
                self.set_dest(data, &values);
            }
            Opcode::Store => {
                let values = self.read_vec(inst, 0, data.read_count(0))?;
                let addr = self.src(inst, 1)?;
                for (k, value) in values.into_iter().enumerate() {
                    self.outcome
                        .memory
                        .insert(addr.wrapping_add(4 * k as u32), value);
                }
            }
            Opcode::LoadScratch => {
                let values: SmallVec<[u32; 8]> = (0..data.write_count(0) as u32)
                    .map(|k| self.scratch.get(&(data.imm + 4 * k)).copied().unwrap_or(0))
                    .collect();
                self.set_dest(data, &values);
            }
            Opcode::StoreScratch => {
                let values = self.read_vec(inst, 0, data.read_count(0))?;
                for (k, value) in values.into_iter().enumerate() {
                    self.scratch.insert(data.imm + 4 * k as u32, value);
                }
            }
            Opcode::AtomicAdd => {
                let addr = self.src(inst, 0)?;
                let value = self.src(inst, 1)?;
                let old = self.load_memory(addr);
                self.outcome.memory.insert(addr, old.wrapping_add(value));
                self.set_dest(data, &[old]);
            }
            Opcode::Barrier => {}
            Opcode::Texture => {
                let s = self.src(inst, 0)?;
                let t = self.src(inst, 1)?;
                let values: SmallVec<[u32; 8]> = (0..data.write_count(0) as u32)
                    .map(|k| s.wrapping_mul(31).wrapping_add(t).rotate_left(k + 1) ^ data.imm)
                    .collect();
                self.set_dest(data, &values);
            }
            Opcode::LdVar => {
                let values: SmallVec<[u32; 8]> = (0..data.write_count(0) as u32)
                    .map(|k| data.imm.wrapping_mul(0x0100_0193).wrapping_add(k))
                    .collect();
                self.set_dest(data, &values);
            }
            Opcode::LdTile => {
                let coverage = self.src(inst, 0)?;
                let values: SmallVec<[u32; 8]> = (0..data.write_count(0) as u32)
                    .map(|k| (coverage ^ data.imm).rotate_right(k))
                    .collect();
                self.set_dest(data, &values);
            }
            Opcode::Blend => {
                let count = data.staging_count();
                let record = BlendRecord {
                    colour: self.read_vec(inst, 0, count)?,
                    coverage: self.src(inst, 1)?,
                    descriptor: self.src(inst, 2)?,
                    dual: if data.srcs.len() > 3 {
                        self.read_vec(inst, 3, count)?
                    } else {
                        SmallVec::new()
                    },
                };
                let coverage = record.coverage;
                self.outcome.blends.push(record);
                self.clobber(data.props().clobbers);
                self.set_dest(data, &[coverage]);
            }
            Opcode::Atest => {
                let coverage = self.src(inst, 0)?;
                let alpha = self.src(inst, 1)?;
                self.set_dest(data, &[if alpha != 0 { coverage } else { 0 }]);
            }
            Opcode::ZsEmit => {
                let emit = (self.src(inst, 0)?, self.src(inst, 1)?, self.src(inst, 2)?);
                self.outcome.zs.push(emit);
                self.set_dest(data, &[emit.0]);
            }
            Opcode::Discard => {
                if self.src(inst, 0)? != 0 {
                    self.outcome.discarded = true;
                    return Ok(Flow::Stop);
                }
            }
            Opcode::Jump => {
                return Ok(succ(0).map_or(Flow::Stop, Flow::Goto));
            }
            Opcode::Branch => {
                let taken = if self.src(inst, 0)? != 0 { 0 } else { 1 };
                return Ok(succ(taken).map_or(Flow::Stop, Flow::Goto));
            }
            Opcode::Return => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    fn clobber(&mut self, clobbers: u64) {
        for (r, reg) in self.regs.iter_mut().enumerate() {
            if clobbers & (1 << r) != 0 {
                *reg = CLOBBER_PATTERN;
            }
        }
    }
}

enum Flow {
    Continue,
    Goto(Block),
    Stop,
}

/// Run `f` with the given inputs.
pub fn run(f: &Func, inputs: &Inputs) -> Result<Outcome, InterpError> {
    Interp::new(f, inputs).run()
}
