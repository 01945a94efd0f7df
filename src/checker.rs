/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies that a register assignment keeps every value
//! intact in its registers from each definition to each use.
//!
//! The checker tracks symbolic contents of the 64 physical registers
//! through the program. Each register holds a *set of symbols*: the
//! value components (`v3[1]`) or preloaded inputs (`r60 at entry`) it
//! is known to contain at a program point. A set, rather than a single
//! symbol, is needed because a copy leaves the same bits under two
//! names.
//!
//! ## Formal Definition
//!
//! The lattice per register is the powerset of symbols with a
//! universe element as top and the empty set as bottom, ordered by
//! inclusion; the meet is intersection. The state at a program point
//! maps each register to a lattice value.
//!
//! Transfer functions, where `A` is the register map:
//!
//!   - Clobbering instruction: `A' = A[c -> {} for each clobbered c]`.
//!
//!   - Definition of component `k` of `v` into register `R`:
//!
//!       A' = { A_r -> A[A_r] \ { v[k] } for r != R } ∪ { R -> { v[k] } }
//!
//!     Every other register loses the symbol: it holds a stale copy.
//!
//!   - Copy `d = mov s` into `R` from `S`: as a definition, except that
//!     `R` receives `A[S] ∪ { d[0] }`.
//!
//!   - Write of a physical register `R`: `R -> { preload R }`.
//!
//! The entry block starts with each register holding its own preload
//! symbol; all other blocks start at top. After finding the fixpoint,
//! every source operand is checked: each register it reads must hold
//! the symbol the operand names.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

use crate::{FxHashSet, Func, Inst, Opcode, Operand, PReg, Reg, VReg, NUM_REGS};

/// A set of errors detected by the checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    errors: Vec<CheckerError>,
}

impl CheckerErrors {
    pub fn errors(&self) -> &[CheckerError] {
        &self.errors
    }
}

/// A single error detected by the checker.
#[derive(Clone, Debug)]
pub enum CheckerError {
    /// An operand names a value that has no register.
    MissingAllocation { inst: Inst, vreg: VReg },
    /// An operand extends past the last register.
    OutOfRange { inst: Inst, op: Operand },
    /// The register was never written on some path.
    UnknownValueInReg { inst: Inst, op: Operand, reg: PReg },
    /// The register holds something other than the operand's value.
    IncorrectValuesInReg {
        inst: Inst,
        op: Operand,
        reg: PReg,
        actual: FxHashSet<Symbol>,
    },
    /// Phis must be lowered before checking.
    UnloweredPhi { inst: Inst },
}

/// What a register may be known to contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Component `k` of a value.
    Value(VReg, u8),
    /// The register's content on entry to the function.
    Preload(PReg),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Value(v, 0) => write!(f, "{}", v),
            Symbol::Value(v, k) => write!(f, "{}[{}]", v, k),
            Symbol::Preload(p) => write!(f, "in.{}", p),
        }
    }
}

/// Abstract state of one register.
///
/// Equivalent to a set of symbols, with the universe-set as top and
/// empty set as bottom lattice element. The meet-function is thus set
/// intersection.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerValue {
    /// This value is the "universe set".
    universe: bool,
    symbols: FxHashSet<Symbol>,
}

impl Default for CheckerValue {
    fn default() -> CheckerValue {
        CheckerValue {
            universe: true,
            symbols: FxHashSet::default(),
        }
    }
}

impl CheckerValue {
    /// Meet function of the abstract-interpretation value
    /// lattice. Returns a boolean value indicating whether `self` was
    /// changed.
    fn meet_with(&mut self, other: &CheckerValue) -> bool {
        if self.universe {
            *self = other.clone();
            !other.universe
        } else if other.universe {
            false
        } else {
            let before = self.symbols.len();
            self.symbols.retain(|sym| other.symbols.contains(sym));
            self.symbols.len() != before
        }
    }

    fn from_symbol(sym: Symbol) -> CheckerValue {
        CheckerValue {
            universe: false,
            symbols: core::iter::once(sym).collect(),
        }
    }

    fn empty() -> CheckerValue {
        CheckerValue {
            universe: false,
            symbols: FxHashSet::default(),
        }
    }
}

impl fmt::Display for CheckerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.universe {
            write!(f, "top")
        } else {
            write!(f, "{{ ")?;
            for sym in &self.symbols {
                write!(f, "{} ", sym)?;
            }
            write!(f, "}}")
        }
    }
}

/// Register file state at one program point.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerState {
    top: bool,
    regs: Vec<CheckerValue>,
}

impl Default for CheckerState {
    fn default() -> CheckerState {
        CheckerState {
            top: true,
            regs: vec![CheckerValue::default(); NUM_REGS],
        }
    }
}

impl CheckerState {
    /// The state on entry to the function: every register holds its
    /// preloaded input.
    fn entry() -> CheckerState {
        CheckerState {
            top: false,
            regs: (0..NUM_REGS)
                .map(|r| CheckerValue::from_symbol(Symbol::Preload(PReg::new(r))))
                .collect(),
        }
    }

    /// Merge this checker state with another at a CFG join-point.
    fn meet_with(&mut self, other: &CheckerState) -> bool {
        if self.top {
            *self = other.clone();
            !self.top
        } else if other.top {
            false
        } else {
            let mut changed = false;
            for (into, from) in self.regs.iter_mut().zip(other.regs.iter()) {
                changed |= into.meet_with(from);
            }
            changed
        }
    }

    /// Check the sources of an instruction against this state.
    fn check(&self, inst: Inst, checker: &Checker<'_>, errors: &mut Vec<CheckerError>) {
        let data = checker.f.inst(inst);
        if data.opcode == Opcode::Phi {
            errors.push(CheckerError::UnloweredPhi { inst });
            return;
        }
        for (s, op) in data.srcs.iter().enumerate() {
            let range = match checker.op_regs(inst, op, data.read_count(s)) {
                Ok(range) => range,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for (k, reg) in range.into_iter().enumerate() {
                let expected = checker.symbol(op, k);
                let val = &self.regs[reg.index()];
                trace!(
                    "checker: {} reads {} from {} holding {}",
                    inst,
                    expected,
                    reg,
                    val
                );
                if val.universe {
                    errors.push(CheckerError::UnknownValueInReg { inst, op: *op, reg });
                } else if !val.symbols.contains(&expected) {
                    errors.push(CheckerError::IncorrectValuesInReg {
                        inst,
                        op: *op,
                        reg,
                        actual: val.symbols.clone(),
                    });
                }
            }
        }
    }

    /// Step over an instruction.
    fn update(&mut self, inst: Inst, checker: &Checker<'_>) {
        self.top = false;
        let data = checker.f.inst(inst);

        // A copy forwards whatever names the source register has.
        let copied = if data.is_move() {
            checker
                .op_regs(inst, &data.srcs[0], 1)
                .ok()
                .and_then(|regs| regs.first().copied())
                .map(|reg| self.regs[reg.index()].clone())
        } else {
            None
        };

        let clobbers = data.props().clobbers;
        for r in 0..NUM_REGS {
            if clobbers & (1 << r) != 0 {
                self.regs[r] = CheckerValue::empty();
            }
        }

        for (d, op) in data.dests.iter().enumerate() {
            let range = match checker.op_regs(inst, op, data.write_count(d)) {
                Ok(range) => range,
                Err(_) => continue,
            };
            for (k, reg) in range.into_iter().enumerate() {
                let sym = checker.symbol(op, k);
                for value in self.regs.iter_mut() {
                    value.symbols.remove(&sym);
                }
                let mut value = match (&copied, op.reg) {
                    (Some(src), Reg::Virtual(_)) if !src.universe => src.clone(),
                    _ => CheckerValue::empty(),
                };
                value.symbols.remove(&sym);
                value.symbols.insert(sym);
                self.regs[reg.index()] = value;
            }
        }
    }
}

/// Verifies a solution for a function whose operands still name
/// virtual values.
#[derive(Debug)]
pub struct Checker<'a> {
    f: &'a Func,
    solutions: &'a [Option<PReg>],
    bb_in: Vec<CheckerState>,
}

impl<'a> Checker<'a> {
    /// Create a checker for `f` with the base register of each value
    /// given by `solutions`.
    pub fn new(f: &'a Func, solutions: &'a [Option<PReg>]) -> Checker<'a> {
        let mut bb_in = vec![CheckerState::default(); f.num_blocks()];
        if let Some(entry) = bb_in.first_mut() {
            *entry = CheckerState::entry();
        }
        Checker {
            f,
            solutions,
            bb_in,
        }
    }

    /// The registers an operand touches when it accesses `count`
    /// components.
    fn op_regs(
        &self,
        inst: Inst,
        op: &Operand,
        count: usize,
    ) -> Result<SmallVec<[PReg; 8]>, CheckerError> {
        let base = match op.reg {
            Reg::Virtual(vreg) => match self.solutions.get(vreg.index()).copied().flatten() {
                Some(base) => base,
                None => return Err(CheckerError::MissingAllocation { inst, vreg }),
            },
            Reg::Physical(preg) => preg,
        };
        (0..count)
            .map(|k| {
                base.offset(op.offset as usize + k)
                    .ok_or(CheckerError::OutOfRange { inst, op: *op })
            })
            .collect()
    }

    /// The symbol component `k` of an operand stands for.
    fn symbol(&self, op: &Operand, k: usize) -> Symbol {
        match op.reg {
            Reg::Virtual(vreg) => Symbol::Value(vreg, op.offset + k as u8),
            Reg::Physical(preg) => {
                Symbol::Preload(PReg::new(preg.index() + op.offset as usize + k))
            }
        }
    }

    /// Perform the dataflow analysis to compute checker state at each BB entry.
    fn analyze(&mut self) {
        let mut queue = VecDeque::new();
        let mut queue_set = FxHashSet::default();
        if self.f.num_blocks() > 0 {
            queue.push_back(self.f.entry());
            queue_set.insert(self.f.entry());
        }

        while let Some(block) = queue.pop_front() {
            queue_set.remove(&block);
            let mut state = self.bb_in[block.index()].clone();
            for &inst in self.f.block_insts(block) {
                state.update(inst, self);
            }

            for &succ in self.f.block_succs(block) {
                let cur_succ_in = &self.bb_in[succ.index()];
                let mut new_state = state.clone();
                new_state.meet_with(cur_succ_in);
                if &new_state != cur_succ_in {
                    trace!("checker: {} entry state changed", succ);
                    self.bb_in[succ.index()] = new_state;
                    if queue_set.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    /// Using BB-start state computed by `analyze()`, step the checker state
    /// through each BB and check each instruction's registers.
    fn find_errors(&self) -> Result<(), CheckerErrors> {
        let mut errors = vec![];
        for block in self.f.blocks() {
            let input = &self.bb_in[block.index()];
            if input.top {
                // Unreachable.
                continue;
            }
            let mut state = input.clone();
            for &inst in self.f.block_insts(block) {
                state.check(inst, self, &mut errors);
                state.update(inst, self);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            trace!("checker: {} errors", errors.len());
            Err(CheckerErrors { errors })
        }
    }

    /// Find any errors, returning `Err(CheckerErrors)` with all errors found
    /// or `Ok(())` otherwise.
    pub fn run(mut self) -> Result<(), CheckerErrors> {
        self.analyze();
        let result = self.find_errors();

        if trace_enabled!() {
            self.print_states();
        }
        result
    }

    fn print_states(&self) {
        for block in self.f.blocks() {
            trace!("checker: {}:", block);
            let mut state = self.bb_in[block.index()].clone();
            for &inst in self.f.block_insts(block) {
                trace!("  {}: {}", inst, self.f.inst(inst));
                state.update(inst, self);
                for (r, value) in state.regs.iter().enumerate() {
                    if !value.universe && !value.symbols.is_empty() {
                        trace!("    r{} := {}", r, value);
                    }
                }
            }
        }
    }
}

/// Check `f` against `solutions`.
pub fn check(f: &Func, solutions: &[Option<PReg>]) -> Result<(), CheckerErrors> {
    Checker::new(f, solutions).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Block, InstData};

    fn p(n: usize) -> Option<PReg> {
        Some(PReg::new(n))
    }

    /// `a = const; b = iadd a, a; c = iadd a, b; store c, a`
    fn chain() -> (Func, [VReg; 3]) {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [a, b, c] = f.new_vregs();
        f.push_inst(b0, InstData::constant(a, 1));
        f.push_inst(b0, InstData::alu(Opcode::IAdd, b, &[a, a]));
        f.push_inst(b0, InstData::alu(Opcode::IAdd, c, &[a, b]));
        f.push_inst(b0, InstData::op(Opcode::Store, &[], &[c.into(), a.into()]));
        f.push_inst(b0, InstData::ret());
        (f, [a, b, c])
    }

    #[test]
    fn accepts_valid_assignment() {
        let (f, _) = chain();
        assert!(check(&f, &[p(0), p(1), p(1)]).is_ok());
    }

    #[test]
    fn rejects_overlap() {
        let (f, [a, ..]) = chain();
        // b overwrites a while a is still needed.
        let errors = check(&f, &[p(0), p(0), p(1)]).unwrap_err();
        assert!(errors.errors().iter().any(|e| matches!(
            e,
            CheckerError::IncorrectValuesInReg { op, .. } if op.as_vreg() == Some(a)
        )));
    }

    #[test]
    fn rejects_missing_and_phi() {
        let (f, _) = chain();
        let errors = check(&f, &[p(0), None, p(1)]).unwrap_err();
        assert!(matches!(
            errors.errors()[0],
            CheckerError::MissingAllocation { .. }
        ));

        let mut f = Func::new();
        let b0 = f.add_block();
        let b1 = f.add_block();
        f.add_edge(b0, b1);
        let [x, y] = f.new_vregs();
        f.push_inst(b0, InstData::constant(x, 1));
        f.push_inst(b0, InstData::jump());
        f.push_inst(b1, InstData::phi(y, &[x]));
        f.push_inst(b1, InstData::ret());
        let errors = check(&f, &[p(0), p(1)]).unwrap_err();
        assert!(matches!(errors.errors()[0], CheckerError::UnloweredPhi { .. }));
    }

    #[test]
    fn copies_keep_both_names() {
        let mut f = Func::new();
        let b0 = f.add_block();
        let [a, b, c] = f.new_vregs();
        f.push_inst(b0, InstData::mov(a, PReg::new(60)));
        f.push_inst(b0, InstData::mov(b, a));
        f.push_inst(b0, InstData::alu(Opcode::IAdd, c, &[a, b]));
        f.push_inst(b0, InstData::op(Opcode::Store, &[], &[c.into(), b.into()]));
        f.push_inst(b0, InstData::ret());
        // a and b share r60, which still holds the input.
        assert!(check(&f, &[p(60), p(60), p(1)]).is_ok());

        // Reading r60 after a is moved elsewhere and r60 is reused
        // fails.
        let mut g = f.clone();
        let last = g.block_insts(b0)[3];
        g.inst_mut(last).srcs[1] = Operand::preg(PReg::new(60));
        assert!(check(&g, &[p(60), p(60), p(60)]).is_err());
    }

    #[test]
    fn clobbers_and_joins() {
        let mut f = Func::new();
        let b: Vec<Block> = (0..4).map(|_| f.add_block()).collect();
        f.add_edge(b[0], b[1]);
        f.add_edge(b[0], b[2]);
        f.add_edge(b[1], b[3]);
        f.add_edge(b[2], b[3]);
        let [x, cov, w, t] = f.new_vregs();
        f.push_inst(b[0], InstData::constant(x, 5));
        f.push_inst(b[0], InstData::branch(x));
        f.push_inst(b[1], InstData::mov(cov, PReg::new(60)));
        f.push_inst(
            b[1],
            InstData::op(Opcode::Blend, &[w.into()], &[t.into(), cov.into(), x.into()]),
        );
        f.push_inst(b[1], InstData::jump());
        f.push_inst(b[2], InstData::jump());
        f.push_inst(b[3], InstData::op(Opcode::Store, &[], &[x.into(), x.into()]));
        f.push_inst(b[3], InstData::ret());
        // t is never defined; give it r0 so the blend reads garbage.
        let ok = [p(20), p(60), p(48), p(0)];
        let errors = check(&f, &ok).unwrap_err();
        assert!(errors
            .errors()
            .iter()
            .all(|e| matches!(e, CheckerError::IncorrectValuesInReg { op, .. } if op.as_vreg() == Some(t))));

        // x in r5 is clobbered by the blend on one path only.
        let bad = [p(5), p(60), p(48), p(0)];
        let errors = check(&f, &bad).unwrap_err();
        assert!(errors.errors().iter().any(|e| matches!(
            e,
            CheckerError::IncorrectValuesInReg { op, .. } if op.as_vreg() == Some(x)
        )));
    }
}
