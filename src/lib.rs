/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Liveness analysis, pressure-reducing scheduling and
//! linearly-constrained register allocation for a clause-based GPU
//! backend.
//!
//! The entry point is [`run`], which takes a function in SSA form
//! (see [`ir::Func`]), reorders each block to reduce register
//! pressure, lowers phis, and assigns every virtual value a base
//! register in the machine's register file, spilling to scratch
//! memory when the file is exhausted.

#![allow(dead_code)]
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use alloc::vec::Vec;
use core::fmt;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

#[macro_use]
mod index;
pub use index::VReg;

pub mod bitset;
pub mod checker;
pub mod interp;
pub mod ir;
pub(crate) mod lcra;
pub mod liveness;
pub(crate) mod nodearray;
pub(crate) mod postorder;
pub mod sched;
pub(crate) mod validate;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub use ir::{Block, BlockData, Func, Inst, InstData, Message, Opcode, Operand, Reg, RegFormat};
pub use liveness::RegLiveness;

/// Number of registers in the largest supported register file.
pub const NUM_REGS: usize = 64;

/// A physical 32-bit register, `r0` through `r63`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PReg(u8);

impl PReg {
    pub const MAX: usize = NUM_REGS - 1;

    /// Create a new PReg. The register number must be below 64.
    #[inline(always)]
    pub const fn new(num: usize) -> Self {
        const NUM_MUST_BE_IN_BOUNDS: &[bool; PReg::MAX + 1] = &[true; PReg::MAX + 1];
        let _ = NUM_MUST_BE_IN_BOUNDS[num];
        PReg(num as u8)
    }

    /// The register number.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The register `n` slots above this one, if it still exists.
    #[inline(always)]
    pub fn offset(self, n: usize) -> Option<PReg> {
        let num = self.index() + n;
        if num <= Self::MAX {
            Some(PReg(num as u8))
        } else {
            None
        }
    }
}

impl fmt::Debug for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A mask of the low `n` bits, saturating at 64.
#[inline(always)]
pub(crate) const fn bit_mask(n: usize) -> u64 {
    if n >= 64 {
        !0
    } else {
        (1u64 << n) - 1
    }
}

/// A set of physical registers, one bit per register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PRegSet(u64);

impl PRegSet {
    /// An empty set.
    pub const fn empty() -> Self {
        PRegSet(0)
    }

    /// The registers `r0` up to (but excluding) `r{n}`.
    pub const fn first(n: usize) -> Self {
        PRegSet(bit_mask(n))
    }

    /// `len` consecutive registers starting at `start`.
    pub const fn range(start: usize, len: usize) -> Self {
        if start >= 64 {
            PRegSet(0)
        } else {
            PRegSet(bit_mask(len) << start)
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        PRegSet(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, reg: PReg) -> bool {
        self.0 & (1 << reg.index()) != 0
    }

    pub const fn with(self, reg: PReg) -> Self {
        PRegSet(self.0 | (1 << reg.0))
    }

    pub fn add(&mut self, reg: PReg) {
        self.0 |= 1 << reg.index();
    }

    pub fn remove(&mut self, reg: PReg) {
        self.0 &= !(1 << reg.index());
    }

    pub fn union_from(&mut self, other: PRegSet) {
        self.0 |= other.0;
    }

    pub fn intersect_from(&mut self, other: PRegSet) {
        self.0 &= other.0;
    }

    pub fn subtract(&mut self, other: PRegSet) {
        self.0 &= !other.0;
    }

    pub fn invert(self) -> Self {
        PRegSet(!self.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Shift every member down by `n` registers, dropping those that
    /// fall below `r0`.
    pub fn shift_down(self, n: usize) -> Self {
        if n >= 64 {
            PRegSet(0)
        } else {
            PRegSet(self.0 >> n)
        }
    }

    /// One past the highest register in the set.
    pub fn end(self) -> usize {
        64 - self.0.leading_zeros() as usize
    }

    pub fn iter(self) -> PRegSetIter {
        PRegSetIter { bits: self.0 }
    }
}

impl IntoIterator for PRegSet {
    type Item = PReg;
    type IntoIter = PRegSetIter;
    fn into_iter(self) -> PRegSetIter {
        self.iter()
    }
}

/// Iterator over the members of a [`PRegSet`] in increasing order.
pub struct PRegSetIter {
    bits: u64,
}

impl Iterator for PRegSetIter {
    type Item = PReg;
    fn next(&mut self) -> Option<PReg> {
        if self.bits == 0 {
            None
        } else {
            let index = self.bits.trailing_zeros();
            self.bits &= !(1 << index);
            Some(PReg(index as u8))
        }
    }
}

impl fmt::Debug for PRegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The register file the allocator works with.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct MachineEnv {
    /// Every register an allocated value may occupy.
    pub regs: PRegSet,

    /// A smaller file tried first without spilling. Programs that fit
    /// in it report a lower work register count, which lets more
    /// threads run concurrently.
    pub reduced_regs: Option<PRegSet>,
}

impl MachineEnv {
    /// The 64-register file, with the reduced file made of r0-r15
    /// and r48-r63.
    pub fn bifrost() -> Self {
        MachineEnv {
            regs: PRegSet::first(NUM_REGS),
            reduced_regs: Some(PRegSet::from_bits(bit_mask(16) | (bit_mask(16) << 48))),
        }
    }

    /// A flat file of `width` registers with no reduced variant.
    pub fn with_width(width: usize) -> Self {
        MachineEnv {
            regs: PRegSet::first(width),
            reduced_regs: None,
        }
    }
}

impl Default for MachineEnv {
    fn default() -> Self {
        Self::bifrost()
    }
}

/// Counters describing one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Stats {
    pub spills: usize,
    pub fills: usize,
    pub spill_rounds: usize,
    pub attempts: usize,
    pub blocks_rescheduled: usize,
    pub coalesced_moves: usize,
    pub removed_moves: usize,
    pub lowered_phis: usize,
}

/// The result of allocation. The function itself is rewritten in
/// place; this carries what the packer needs beyond it.
#[derive(Clone, Debug)]
pub struct Output {
    /// Base register of every value, indexed by `VReg`. Values
    /// removed by spilling have no assignment.
    pub assignments: Vec<Option<PReg>>,

    /// Number of registers the allocated program may touch.
    pub work_reg_count: usize,

    /// Bytes of per-thread scratch memory used by spill slots.
    pub scratch_size: u32,

    /// Physical-register liveness of the allocated program.
    pub liveness: RegLiveness,

    pub stats: Stats,
}

impl Output {
    /// The register assigned to `vreg`, if any.
    pub fn assignment(&self, vreg: VReg) -> Option<PReg> {
        self.assignments.get(vreg.index()).copied().flatten()
    }
}

/// An error that prevents allocation.
#[derive(Clone, Debug)]
pub enum RegAllocError {
    /// Invalid SSA for given vreg at given inst: multiple defs or a
    /// use not dominated by its def.
    SSA(VReg, Inst),
    /// A value is live on entry to the function.
    EntryLivein(VReg),
    /// Invalid basic block: a terminator that is not last, more than
    /// two successors, or an entry block with predecessors.
    BB(Block),
    /// A phi that does not have one source per predecessor, or that
    /// follows a non-phi instruction.
    Phi(Inst),
    /// Operand shape does not match the opcode, or a value extent
    /// exceeds eight registers.
    Operand(Inst),
    /// A value is pinned to a register outside the register file.
    InvalidPin(VReg, PReg),
    /// No register is available for the value and nothing it
    /// conflicts with can be spilled.
    AllocationFailed(VReg),
    /// Allocation did not succeed within the given number of spill
    /// rounds.
    SpillLimit(usize),
    /// The allocation checker found an invalid assignment.
    Checker(checker::CheckerErrors),
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::SSA(vreg, inst) => {
                write!(f, "invalid SSA for {} at {}", vreg, inst)
            }
            RegAllocError::EntryLivein(vreg) => write!(f, "{} is live on entry", vreg),
            RegAllocError::BB(block) => write!(f, "malformed block {}", block),
            RegAllocError::Phi(inst) => write!(f, "malformed phi at {}", inst),
            RegAllocError::Operand(inst) => write!(f, "malformed operands at {}", inst),
            RegAllocError::InvalidPin(vreg, preg) => {
                write!(f, "{} pinned to {} outside the register file", vreg, preg)
            }
            RegAllocError::AllocationFailed(vreg) => {
                write!(f, "no register available for {}", vreg)
            }
            RegAllocError::SpillLimit(rounds) => {
                write!(f, "allocation did not converge after {} spill rounds", rounds)
            }
            RegAllocError::Checker(errors) => write!(f, "checker failed: {:?}", errors),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegAllocError {}

/// Options for allocation.
#[derive(Clone, Copy, Debug)]
pub struct RegallocOptions {
    /// Validate the input before doing anything else.
    pub validate: bool,

    /// Run the pressure-reducing scheduler before allocation.
    pub schedule: bool,

    /// Shrink the register file to force spilling.
    pub stress_spilling: bool,

    /// Upper bound on spill rounds. Defaults to the number of values
    /// in the input.
    pub max_spill_rounds: Option<usize>,

    /// Verify the allocation with the symbolic checker before
    /// rewriting operands.
    pub check: bool,

    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for RegallocOptions {
    fn default() -> Self {
        RegallocOptions {
            validate: true,
            schedule: true,
            stress_spilling: false,
            max_spill_rounds: None,
            check: false,
            verbose_log: false,
        }
    }
}

/// Schedule and allocate `func` in place.
pub fn run(
    func: &mut Func,
    env: &MachineEnv,
    options: &RegallocOptions,
) -> Result<Output, RegAllocError> {
    lcra::run(func, env, options)
}
