/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The value/instruction model: opcodes and their properties,
//! operands, instructions, blocks and functions.

use alloc::vec::Vec;
use core::fmt;
use smallvec::{smallvec, SmallVec};

use crate::{PReg, VReg};

define_index!(Inst, Insts, InstData);
define_index!(Block, Blocks, BlockData);

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst{}", self.0)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// Largest number of registers a single value may span.
pub const MAX_VALUE_REGS: usize = 8;

/// The unit a message-passing instruction talks to. Instructions of
/// related classes must keep their relative order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Message {
    None,
    /// Loads from writable memory.
    Load,
    /// Loads from read-only uniform memory; freely reorderable.
    UniformLoad,
    Texture,
    Varying,
    Store,
    Atomic,
    Barrier,
    Blend,
    ZStencil,
    Tile,
    Atest,
}

/// Static properties of an opcode.
#[derive(Clone, Copy, Debug)]
pub struct OpcodeProps {
    pub name: &'static str,
    pub message: Message,
    /// Must not be deleted, and orders against other effects.
    pub side_effects: bool,
    /// Ends a block: `jump`, `branch` or `return`.
    pub terminator: bool,
    /// Bitmask of sources read as staging vectors.
    pub staging_srcs: u8,
    /// Destination 0 is a staging vector.
    pub staging_dest: bool,
    /// Registers overwritten as a side effect.
    pub clobbers: u64,
    /// Fixed destination count, if any.
    pub num_dests: Option<u8>,
    /// Fixed source count, if any.
    pub num_srcs: Option<u8>,
    /// Prints the immediate.
    pub has_imm: bool,
}

const fn props(name: &'static str, num_dests: u8, num_srcs: u8) -> OpcodeProps {
    OpcodeProps {
        name,
        message: Message::None,
        side_effects: false,
        terminator: false,
        staging_srcs: 0,
        staging_dest: false,
        clobbers: 0,
        num_dests: Some(num_dests),
        num_srcs: Some(num_srcs),
        has_imm: false,
    }
}

impl OpcodeProps {
    const fn message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    const fn side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }

    const fn terminator(mut self) -> Self {
        self.terminator = true;
        self.side_effects = true;
        self
    }

    const fn staging_src(mut self, src: u8) -> Self {
        self.staging_srcs |= 1 << src;
        self
    }

    const fn staging_dest(mut self) -> Self {
        self.staging_dest = true;
        self
    }

    const fn imm(mut self) -> Self {
        self.has_imm = true;
        self
    }

    const fn variable_srcs(mut self) -> Self {
        self.num_srcs = None;
        self
    }

    const fn variable_dests(mut self) -> Self {
        self.num_dests = None;
        self
    }
}

/// Operations understood by the backend core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Opcode {
    /// Register-to-register copy of one component.
    Mov,
    /// Materialize the immediate.
    Const,
    /// One source per predecessor, in predecessor order.
    Phi,
    IAdd,
    ISub,
    IMul,
    And,
    Or,
    Xor,
    Lshift,
    Rshift,
    FAdd,
    FMul,
    FFma,
    /// `cond != 0 ? a : b`.
    CSel,
    /// Gather single-register sources into one vector.
    Collect,
    /// Scatter a vector into single-register destinations.
    Split,
    /// `dest = mem[addr..]`, staging destination.
    Load,
    /// Like `Load`, from read-only uniform memory.
    LoadUniform,
    /// `mem[addr..] = data`, sources `[data, addr]`.
    Store,
    /// Reload from the thread's scratch memory at the immediate offset.
    LoadScratch,
    /// Spill to the thread's scratch memory at the immediate offset.
    StoreScratch,
    /// Sources `[addr, value]`; returns the old value.
    AtomicAdd,
    Barrier,
    /// Sources `[s, t]`, staging destination.
    Texture,
    /// Interpolate the varying named by the immediate.
    LdVar,
    /// Read the render target named by the immediate. Source is the
    /// coverage mask.
    LdTile,
    /// Sources `[colour, coverage, descriptor]` plus an optional
    /// dual-source colour. Returns the coverage mask.
    Blend,
    /// Alpha test. Sources `[coverage, alpha]`, returns coverage.
    Atest,
    /// Depth/stencil emit. Sources `[coverage, depth, stencil]`.
    ZsEmit,
    /// Kill the thread when the source is nonzero.
    Discard,
    Jump,
    /// Go to the first successor when the source is nonzero, else the
    /// second.
    Branch,
    Return,
}

impl Opcode {
    pub fn props(self) -> OpcodeProps {
        match self {
            Opcode::Mov => props("mov", 1, 1),
            Opcode::Const => props("const", 1, 0).imm(),
            Opcode::Phi => props("phi", 1, 0).variable_srcs(),
            Opcode::IAdd => props("iadd", 1, 2),
            Opcode::ISub => props("isub", 1, 2),
            Opcode::IMul => props("imul", 1, 2),
            Opcode::And => props("and", 1, 2),
            Opcode::Or => props("or", 1, 2),
            Opcode::Xor => props("xor", 1, 2),
            Opcode::Lshift => props("lshift", 1, 2),
            Opcode::Rshift => props("rshift", 1, 2),
            Opcode::FAdd => props("fadd", 1, 2),
            Opcode::FMul => props("fmul", 1, 2),
            Opcode::FFma => props("ffma", 1, 3),
            Opcode::CSel => props("csel", 1, 3),
            Opcode::Collect => props("collect", 1, 0).variable_srcs(),
            Opcode::Split => props("split", 0, 1).variable_dests(),
            Opcode::Load => props("load", 1, 1).message(Message::Load).staging_dest(),
            Opcode::LoadUniform => props("load_uniform", 1, 1)
                .message(Message::UniformLoad)
                .staging_dest(),
            Opcode::Store => props("store", 0, 2)
                .message(Message::Store)
                .staging_src(0)
                .side_effects(),
            Opcode::LoadScratch => props("load_scratch", 1, 0)
                .message(Message::Load)
                .staging_dest()
                .imm(),
            Opcode::StoreScratch => props("store_scratch", 0, 1)
                .message(Message::Store)
                .staging_src(0)
                .side_effects()
                .imm(),
            Opcode::AtomicAdd => props("atomic_add", 1, 2)
                .message(Message::Atomic)
                .side_effects(),
            Opcode::Barrier => props("barrier", 0, 0)
                .message(Message::Barrier)
                .side_effects(),
            Opcode::Texture => props("texture", 1, 2)
                .message(Message::Texture)
                .staging_dest(),
            Opcode::LdVar => props("ld_var", 1, 0)
                .message(Message::Varying)
                .staging_dest()
                .imm(),
            Opcode::LdTile => props("ld_tile", 1, 1)
                .message(Message::Tile)
                .staging_dest()
                .imm(),
            Opcode::Blend => {
                let mut p = props("blend", 1, 0)
                    .variable_srcs()
                    .message(Message::Blend)
                    .staging_src(0)
                    .staging_src(3)
                    .side_effects();
                // The blend shader runs on the caller's registers.
                p.clobbers = crate::bit_mask(16) | (1 << 48);
                p
            }
            Opcode::Atest => props("atest", 1, 2)
                .message(Message::Atest)
                .side_effects(),
            Opcode::ZsEmit => props("zs_emit", 1, 3)
                .message(Message::ZStencil)
                .side_effects(),
            Opcode::Discard => props("discard", 0, 1).side_effects(),
            Opcode::Jump => props("jump", 0, 0).terminator(),
            Opcode::Branch => props("branch", 0, 1).terminator(),
            Opcode::Return => props("return", 0, 0).terminator(),
        }
    }

    pub fn name(self) -> &'static str {
        self.props().name
    }

    pub fn is_terminator(self) -> bool {
        self.props().terminator
    }
}

/// Register format of format-polymorphic message instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum RegFormat {
    Auto,
    F32,
    F16,
    I32,
    I16,
    U32,
    U16,
}

impl RegFormat {
    /// Two components are packed per 32-bit register.
    pub fn is_16bit(self) -> bool {
        matches!(self, RegFormat::F16 | RegFormat::I16 | RegFormat::U16)
    }

    fn suffix(self) -> &'static str {
        match self {
            RegFormat::Auto => "",
            RegFormat::F32 => ".f32",
            RegFormat::F16 => ".f16",
            RegFormat::I32 => ".i32",
            RegFormat::I16 => ".i16",
            RegFormat::U32 => ".u32",
            RegFormat::U16 => ".u16",
        }
    }
}

/// What an operand names: an unallocated value or a hardware register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Reg {
    Virtual(VReg),
    Physical(PReg),
}

/// A register reference plus a component offset in 32-bit registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Operand {
    pub reg: Reg,
    pub offset: u8,
}

impl Operand {
    pub fn vreg(vreg: VReg) -> Self {
        Operand {
            reg: Reg::Virtual(vreg),
            offset: 0,
        }
    }

    pub fn preg(preg: PReg) -> Self {
        Operand {
            reg: Reg::Physical(preg),
            offset: 0,
        }
    }

    /// The same register at component `offset`.
    pub fn at(self, offset: usize) -> Self {
        Operand {
            reg: self.reg,
            offset: offset as u8,
        }
    }

    pub fn as_vreg(self) -> Option<VReg> {
        match self.reg {
            Reg::Virtual(v) => Some(v),
            Reg::Physical(_) => None,
        }
    }

    pub fn as_preg(self) -> Option<PReg> {
        match self.reg {
            Reg::Physical(p) => Some(p),
            Reg::Virtual(_) => None,
        }
    }

    /// The first physical register accessed, folding in the offset.
    pub fn first_preg(self) -> Option<usize> {
        self.as_preg().map(|p| p.index() + self.offset as usize)
    }
}

impl From<VReg> for Operand {
    fn from(vreg: VReg) -> Self {
        Operand::vreg(vreg)
    }
}

impl From<PReg> for Operand {
    fn from(preg: PReg) -> Self {
        Operand::preg(preg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reg {
            Reg::Virtual(v) if self.offset == 0 => write!(f, "{}", v),
            Reg::Virtual(v) => write!(f, "{}[{}]", v, self.offset),
            Reg::Physical(p) => write!(f, "r{}", p.index() + self.offset as usize),
        }
    }
}

/// One instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct InstData {
    pub opcode: Opcode,
    pub format: RegFormat,
    /// Component count of staging vectors.
    pub vec: u8,
    pub dests: SmallVec<[Operand; 2]>,
    pub srcs: SmallVec<[Operand; 4]>,
    pub imm: u32,
    /// Destinations of this instruction must never be spilled.
    pub no_spill: bool,
}

impl InstData {
    pub fn new(opcode: Opcode) -> Self {
        InstData {
            opcode,
            format: RegFormat::Auto,
            vec: 1,
            dests: smallvec![],
            srcs: smallvec![],
            imm: 0,
            no_spill: false,
        }
    }

    /// An instruction with the given operands.
    pub fn op(opcode: Opcode, dests: &[Operand], srcs: &[Operand]) -> Self {
        let mut inst = InstData::new(opcode);
        inst.dests.extend_from_slice(dests);
        inst.srcs.extend_from_slice(srcs);
        inst
    }

    /// A single-destination instruction over virtual sources.
    pub fn alu(opcode: Opcode, dest: VReg, srcs: &[VReg]) -> Self {
        let mut inst = InstData::new(opcode);
        inst.dests.push(Operand::vreg(dest));
        inst.srcs.extend(srcs.iter().map(|&v| Operand::vreg(v)));
        inst
    }

    pub fn mov(dest: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        InstData::op(Opcode::Mov, &[dest.into()], &[src.into()])
    }

    pub fn constant(dest: VReg, imm: u32) -> Self {
        InstData::alu(Opcode::Const, dest, &[]).with_imm(imm)
    }

    pub fn phi(dest: VReg, srcs: &[VReg]) -> Self {
        InstData::alu(Opcode::Phi, dest, srcs)
    }

    pub fn load_scratch(dest: VReg, count: usize, offset: u32) -> Self {
        InstData::alu(Opcode::LoadScratch, dest, &[])
            .with_vec(count)
            .with_imm(offset)
    }

    pub fn store_scratch(src: VReg, count: usize, offset: u32) -> Self {
        InstData::op(Opcode::StoreScratch, &[], &[Operand::vreg(src)])
            .with_vec(count)
            .with_imm(offset)
    }

    pub fn jump() -> Self {
        InstData::new(Opcode::Jump)
    }

    pub fn branch(cond: impl Into<Operand>) -> Self {
        InstData::op(Opcode::Branch, &[], &[cond.into()])
    }

    pub fn ret() -> Self {
        InstData::new(Opcode::Return)
    }

    pub fn with_format(mut self, format: RegFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_vec(mut self, vec: usize) -> Self {
        self.vec = vec as u8;
        self
    }

    pub fn with_imm(mut self, imm: u32) -> Self {
        self.imm = imm;
        self
    }

    pub fn with_no_spill(mut self) -> Self {
        self.no_spill = true;
        self
    }

    pub fn props(&self) -> OpcodeProps {
        self.opcode.props()
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    /// A plain copy: `mov` from a virtual value or physical register.
    pub fn is_move(&self) -> bool {
        self.opcode == Opcode::Mov
    }

    /// Registers spanned by the staging vector.
    pub fn staging_count(&self) -> usize {
        let vec = self.vec as usize;
        if self.format.is_16bit() {
            (vec + 1) / 2
        } else {
            vec
        }
    }

    /// Registers read through source `s`.
    pub fn read_count(&self, s: usize) -> usize {
        if s < 8 && self.props().staging_srcs & (1 << s) != 0 {
            self.staging_count()
        } else if self.opcode == Opcode::Split {
            self.dests.len()
        } else {
            1
        }
    }

    /// Registers written through destination `d`.
    pub fn write_count(&self, d: usize) -> usize {
        if d == 0 && self.props().staging_dest {
            self.staging_count()
        } else if self.opcode == Opcode::Collect {
            self.srcs.len()
        } else {
            1
        }
    }

    /// Mask of components written by destination `d`.
    pub fn write_mask(&self, d: usize) -> u8 {
        let mask = crate::bit_mask(self.write_count(d)) << self.dests[d].offset;
        mask as u8
    }

    /// Mask of components read by source `s`.
    pub fn read_mask(&self, s: usize) -> u8 {
        let mask = crate::bit_mask(self.read_count(s)) << self.srcs[s].offset;
        mask as u8
    }

    /// Virtual sources with their index.
    pub fn vreg_srcs(&self) -> impl Iterator<Item = (usize, VReg)> + '_ {
        self.srcs
            .iter()
            .enumerate()
            .filter_map(|(i, op)| op.as_vreg().map(|v| (i, v)))
    }

    /// Virtual destinations with their index.
    pub fn vreg_dests(&self) -> impl Iterator<Item = (usize, VReg)> + '_ {
        self.dests
            .iter()
            .enumerate()
            .filter_map(|(i, op)| op.as_vreg().map(|v| (i, v)))
    }

    /// Whether any source reads `vreg`.
    pub fn reads(&self, vreg: VReg) -> bool {
        self.srcs.iter().any(|op| op.as_vreg() == Some(vreg))
    }
}

impl fmt::Display for InstData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props = self.props();
        for (i, dest) in self.dests.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dest)?;
        }
        if !self.dests.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{}{}", props.name, self.format.suffix())?;
        if props.staging_dest || props.staging_srcs != 0 {
            write!(f, ".v{}", self.vec)?;
        }
        for (i, src) in self.srcs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", src)?;
        }
        if props.has_imm {
            if !self.srcs.is_empty() {
                write!(f, ",")?;
            }
            write!(f, " #0x{:x}", self.imm)?;
        }
        if self.no_spill {
            write!(f, " (no_spill)")?;
        }
        Ok(())
    }
}

/// A basic block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BlockData {
    pub insts: Vec<Inst>,
    pub succs: SmallVec<[Block; 2]>,
    pub preds: SmallVec<[Block; 4]>,
}

/// A function: blocks in program order over an instruction arena.
///
/// Instructions are addressed by stable `Inst` indices. Passes that
/// rewrite a block rebuild its `insts` list; instructions dropped from
/// every list stay in the arena but are no longer part of the program.
#[derive(Clone, Debug, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Func {
    insts: Insts,
    blocks: Blocks,
    num_vregs: usize,
    pinned: Vec<(VReg, PReg)>,
    /// Bytes of per-thread scratch memory in use.
    pub scratch_size: u32,
}

impl Func {
    pub fn new() -> Self {
        Func::default()
    }

    pub fn add_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Add a CFG edge. Successor order is significant for `branch`, and
    /// predecessor order is significant for phis.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    pub fn new_vreg(&mut self) -> VReg {
        let vreg = VReg::new(self.num_vregs);
        self.num_vregs += 1;
        vreg
    }

    /// Allocate `n` fresh values.
    pub fn new_vregs<const N: usize>(&mut self) -> [VReg; N] {
        core::array::from_fn(|_| self.new_vreg())
    }

    pub fn num_vregs(&self) -> usize {
        self.num_vregs
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Size of the instruction arena, including dropped instructions.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn entry(&self) -> Block {
        Block::new(0)
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> {
        self.blocks.keys()
    }

    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    pub fn block_succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    pub fn block_preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    /// Position of `pred` in `block`'s predecessor list, which selects
    /// the phi source for that edge.
    pub fn pred_index(&self, block: Block, pred: Block) -> Option<usize> {
        self.blocks[block].preds.iter().position(|&p| p == pred)
    }

    pub fn inst(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: Inst) -> &mut InstData {
        &mut self.insts[inst]
    }

    /// Add an instruction to the arena without placing it in a block.
    pub fn create_inst(&mut self, data: InstData) -> Inst {
        self.insts.push(data)
    }

    /// Append an instruction to the end of `block`.
    pub fn push_inst(&mut self, block: Block, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Insert an instruction at position `pos` of `block`.
    pub fn insert_inst(&mut self, block: Block, pos: usize, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        self.blocks[block].insts.insert(pos, inst);
        inst
    }

    /// Replace the instruction order of `block`.
    pub fn set_block_insts(&mut self, block: Block, insts: Vec<Inst>) {
        self.blocks[block].insts = insts;
    }

    /// Index of the first terminator in `block`, or its length.
    pub fn terminator_start(&self, block: Block) -> usize {
        let insts = &self.blocks[block].insts;
        insts
            .iter()
            .position(|&i| self.insts[i].is_terminator())
            .unwrap_or(insts.len())
    }

    /// Number of leading phis in `block`.
    pub fn phi_count(&self, block: Block) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .take_while(|&&i| self.insts[i].opcode == Opcode::Phi)
            .count()
    }

    /// Pin `vreg` to `preg` across the whole function.
    pub fn pin(&mut self, vreg: VReg, preg: PReg) {
        self.pinned.retain(|&(v, _)| v != vreg);
        self.pinned.push((vreg, preg));
    }

    pub fn pinned(&self) -> &[(VReg, PReg)] {
        &self.pinned
    }

    /// Every instruction that is part of the program, in block order.
    pub fn live_insts(&self) -> impl Iterator<Item = (Block, Inst)> + '_ {
        self.blocks
            .keys()
            .flat_map(move |b| self.blocks[b].insts.iter().map(move |&i| (b, i)))
    }

    /// Number of instructions placed in blocks.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any operand still names a virtual value.
    pub fn has_virtual_operands(&self) -> bool {
        self.live_insts().any(|(_, i)| {
            let data = &self.insts[i];
            data.dests
                .iter()
                .chain(data.srcs.iter())
                .any(|op| op.as_vreg().is_some())
        })
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.blocks.keys() {
            let data = &self.blocks[block];
            write!(f, "{}", block)?;
            if !data.preds.is_empty() {
                write!(f, " (preds:")?;
                for pred in &data.preds {
                    write!(f, " {}", pred)?;
                }
                write!(f, ")")?;
            }
            writeln!(f, " {{")?;
            for &inst in &data.insts {
                writeln!(f, "    {}", self.insts[inst])?;
            }
            write!(f, "}}")?;
            if !data.succs.is_empty() {
                write!(f, " ->")?;
                for succ in &data.succs {
                    write!(f, " {}", succ)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::string::ToString;

    #[test]
    fn staging_counts_follow_format() {
        let [a, b] = [VReg::new(0), VReg::new(1)];
        let tex = InstData::alu(Opcode::Texture, a, &[b, b]).with_vec(4);
        assert_eq!(tex.write_count(0), 4);
        assert_eq!(tex.read_count(0), 1);
        assert_eq!(tex.write_mask(0), 0b1111);

        let tex16 = tex.clone().with_format(RegFormat::F16);
        assert_eq!(tex16.write_count(0), 2);

        let odd = InstData::alu(Opcode::LdVar, a, &[])
            .with_vec(3)
            .with_format(RegFormat::F16);
        assert_eq!(odd.write_count(0), 2);

        let store = InstData::op(
            Opcode::Store,
            &[],
            &[Operand::vreg(a).at(1), Operand::vreg(b)],
        )
        .with_vec(2);
        assert_eq!(store.read_count(0), 2);
        assert_eq!(store.read_mask(0), 0b110);
        assert_eq!(store.read_count(1), 1);
    }

    #[test]
    fn collect_and_split_counts() {
        let v: Vec<VReg> = (0..4).map(VReg::new).collect();
        let collect = InstData::alu(Opcode::Collect, v[0], &v[1..]);
        assert_eq!(collect.write_count(0), 3);

        let split = InstData::op(
            Opcode::Split,
            &[Operand::vreg(v[1]), Operand::vreg(v[2])],
            &[Operand::vreg(v[0])],
        );
        assert_eq!(split.read_count(0), 2);
        assert_eq!(split.write_count(1), 1);
    }

    #[test]
    fn blend_clobbers_low_file() {
        let props = Opcode::Blend.props();
        assert_eq!(props.clobbers, 0xffff | (1 << 48));
        assert!(props.side_effects);
        assert!(!Opcode::IAdd.props().side_effects);
        assert!(Opcode::Return.is_terminator());
    }

    #[test]
    fn edges_and_printing() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let b1 = f.add_block();
        f.add_edge(b0, b1);
        let [a, b] = f.new_vregs();
        f.push_inst(b0, InstData::constant(a, 7));
        f.push_inst(b0, InstData::jump());
        f.push_inst(b1, InstData::alu(Opcode::IAdd, b, &[a, a]));
        f.push_inst(b1, InstData::ret());

        assert_eq!(f.block_preds(b1), &[b0]);
        assert_eq!(f.pred_index(b1, b0), Some(0));
        assert_eq!(f.terminator_start(b0), 1);
        assert_eq!(f.len(), 4);

        let text = f.to_string();
        assert!(text.contains("v0 = const #0x7"));
        assert!(text.contains("v1 = iadd v0, v0"));
        assert!(text.contains("block1 (preds: block0)"));

        let op = Operand::vreg(b).at(2);
        assert_eq!(format!("{}", op), "v1[2]");
        assert_eq!(format!("{}", Operand::preg(PReg::new(3)).at(1)), "r4");
    }
}
