//! Optimization passes over the instruction list.
//!
//! Every pass is a pure function from instruction list to instruction
//! list that preserves label validity and observable behavior. Passes
//! never fold or move code across a label, a jump, a call or a SYSCALL;
//! the windows between such barriers are the only rewrite targets.
//!
//! Levels: 0 none; 1 peephole + constant folding; 2 adds dead-code
//! elimination, copy propagation and jump threading; 3 iterates all
//! passes to a fixpoint (at most 16 rounds).

use crate::ir::{word_modulus, Instruction, LabelId, Op, Operand};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

const MAX_FIXPOINT_ITERATIONS: u32 = 16;

/// Internal invariant violations. User code can never cause these; a
/// pass that produces one has a bug.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OptimizerError {
    #[error("pass '{pass}' broke label integrity: jump to undefined L{label}")]
    LabelIntegrity { pass: &'static str, label: LabelId },
}

/// Counters reported in compilation statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub passes_run: u32,
    pub instructions_removed: u32,
    pub constants_folded: u32,
    pub jumps_threaded: u32,
}

trait Pass {
    fn name(&self) -> &'static str;
    fn min_level(&self) -> u8;
    /// Applies the pass; returns the rewritten list and whether anything
    /// changed.
    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool);
}

pub struct Optimizer {
    level: u8,
    stats: OptimizerStats,
}

impl Optimizer {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(3),
            stats: OptimizerStats::default(),
        }
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.stats
    }

    /// Runs the configured passes over the list. At level 3 the whole
    /// pass pipeline repeats until nothing changes. Label integrity is
    /// verified after every pass.
    pub fn optimize(
        &mut self,
        mut instructions: Vec<Instruction>,
    ) -> Result<Vec<Instruction>, OptimizerError> {
        if self.level == 0 {
            return Ok(instructions);
        }

        let passes: Vec<Box<dyn Pass>> = vec![
            Box::new(Peephole),
            Box::new(ConstantFolding),
            Box::new(DeadCode),
            Box::new(CopyPropagation),
            Box::new(JumpThreading),
        ];

        let rounds = if self.level >= 3 {
            MAX_FIXPOINT_ITERATIONS
        } else {
            1
        };

        for _ in 0..rounds {
            let mut changed = false;
            for pass in &passes {
                if self.level < pass.min_level() {
                    continue;
                }
                let (rewritten, pass_changed) = pass.run(instructions, &mut self.stats);
                instructions = rewritten;
                changed |= pass_changed;
                self.stats.passes_run += 1;
                tracing::trace!(pass = pass.name(), changed = pass_changed, "optimizer pass");
                if let Some(label) = undefined_target(&instructions) {
                    return Err(OptimizerError::LabelIntegrity {
                        pass: pass.name(),
                        label,
                    });
                }
            }
            if !changed {
                break;
            }
        }

        Ok(instructions)
    }
}

/// A jump target with no matching label definition, if any.
fn undefined_target(instructions: &[Instruction]) -> Option<LabelId> {
    let defined: HashSet<LabelId> = instructions.iter().filter_map(|i| i.label_id()).collect();
    instructions
        .iter()
        .filter_map(|i| i.jump_target())
        .find(|target| !defined.contains(target))
}

/// Convenience entry point used by the driver.
pub fn optimize(
    instructions: Vec<Instruction>,
    level: u8,
) -> Result<(Vec<Instruction>, OptimizerStats), OptimizerError> {
    let mut optimizer = Optimizer::new(level);
    let out = optimizer.optimize(instructions)?;
    let stats = optimizer.stats().clone();
    Ok((out, stats))
}

/// True when folding may look past this instruction inside a window.
fn is_window_break(instruction: &Instruction) -> bool {
    instruction.is_barrier()
}

/// Instructions whose result is already a boolean.
fn produces_boolean(instruction: &Instruction) -> bool {
    matches!(
        instruction.op,
        Op::Not
            | Op::BoolAnd
            | Op::BoolOr
            | Op::NumEqual
            | Op::NumNotEqual
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::IsNull
            | Op::HasKey
    )
}

// --- peephole -------------------------------------------------------------

struct Peephole;

impl Pass for Peephole {
    fn name(&self) -> &'static str {
        "peephole"
    }

    fn min_level(&self) -> u8 {
        1
    }

    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool) {
        let mut out: Vec<Instruction> = Vec::with_capacity(input.len());
        let mut changed = false;

        for instruction in input {
            // PUSH x; DROP  =>  (nothing)
            if instruction.op == Op::Drop {
                if let Some(prev) = out.last() {
                    if prev.op == Op::Push && !is_window_break(prev) {
                        out.pop();
                        stats.instructions_removed += 2;
                        changed = true;
                        continue;
                    }
                }
            }

            // PUSH 0; NUMEQUAL  =>  NOT (boolean iszero)
            if instruction.op == Op::NumEqual {
                if let Some(prev) = out.last() {
                    if prev.pushed_word().map(Zero::is_zero).unwrap_or(false) {
                        let span = out.pop().and_then(|i| i.span);
                        let mut not = Instruction::new(Op::Not);
                        not.span = span;
                        out.push(not);
                        stats.instructions_removed += 1;
                        changed = true;
                        continue;
                    }
                }
            }

            // NOT; NOT  =>  (nothing), but only over an operand that is
            // already boolean. Over a plain word the pair is the 0/1
            // normalization idiom and must stay.
            if instruction.op == Op::Not {
                let collapsible = out.len() >= 2
                    && out[out.len() - 1].op == Op::Not
                    && produces_boolean(&out[out.len() - 2]);
                if collapsible {
                    out.pop();
                    stats.instructions_removed += 2;
                    changed = true;
                    continue;
                }
            }

            // SWAP; SWAP  =>  (nothing)
            if instruction.op == Op::Swap {
                if let Some(prev) = out.last() {
                    if prev.op == Op::Swap {
                        out.pop();
                        stats.instructions_removed += 2;
                        changed = true;
                        continue;
                    }
                }
            }

            out.push(instruction);
        }

        (out, changed)
    }
}

// --- constant folding -----------------------------------------------------

struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn min_level(&self) -> u8 {
        1
    }

    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool) {
        let mut out: Vec<Instruction> = Vec::with_capacity(input.len());
        let mut changed = false;

        for instruction in input {
            if let Some(folded) = try_fold(&out, &instruction) {
                out.pop();
                out.pop();
                out.push(folded);
                stats.constants_folded += 1;
                stats.instructions_removed += 2;
                changed = true;
                continue;
            }

            // Unary fold: PUSH a; NOT / INC / DEC and friends are left
            // alone; binary folds dominate in generated code.
            out.push(instruction);
        }

        (out, changed)
    }
}

/// Folds `PUSH a; PUSH b; <binop>` into a single push. Returns the
/// replacement push, or None when the window does not match.
fn try_fold(out: &[Instruction], instruction: &Instruction) -> Option<Instruction> {
    let b = out.last()?.pushed_word()?;
    let a = out.get(out.len().checked_sub(2)?)?.pushed_word()?;

    let word = |x: BigUint| x % word_modulus();
    let boolean = |x: bool| BigUint::from(u8::from(x));
    let modulus = word_modulus();

    let result = match instruction.op {
        Op::Add => word(a + b),
        Op::Sub => {
            // Wrap at 2^256 like the generated guard would.
            if a >= b {
                a - b
            } else {
                modulus - b + a
            }
        }
        Op::Mul => word(a * b),
        Op::Div => {
            if b.is_zero() {
                return None; // the zero guard already branched
            }
            a / b
        }
        Op::Mod => {
            if b.is_zero() {
                return None;
            }
            a % b
        }
        Op::And => a & b,
        Op::Or => a | b,
        Op::Xor => a ^ b,
        Op::Shl => {
            let shift = b.to_u32()?.min(256);
            word(a << shift)
        }
        Op::Shr => {
            let shift = b.to_u32()?.min(256);
            a >> shift
        }
        Op::Min => a.min(b).clone(),
        Op::Max => a.max(b).clone(),
        Op::Lt => boolean(a < b),
        Op::Le => boolean(a <= b),
        Op::Gt => boolean(a > b),
        Op::Ge => boolean(a >= b),
        Op::NumEqual => boolean(a == b),
        Op::NumNotEqual => boolean(a != b),
        _ => return None,
    };

    let mut push = Instruction::push_word(result);
    push.span = instruction.span;
    Some(push)
}

// --- dead code ------------------------------------------------------------

struct DeadCode;

impl Pass for DeadCode {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn min_level(&self) -> u8 {
        2
    }

    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool) {
        let mut out: Vec<Instruction> = Vec::with_capacity(input.len());
        let mut changed = false;
        let mut dead = false;

        for instruction in input {
            if instruction.is_label() {
                dead = false;
            }
            if dead {
                stats.instructions_removed += 1;
                changed = true;
                continue;
            }
            // Unreachable until the next label after an unconditional
            // transfer.
            if instruction.op.ends_flow() {
                dead = true;
            }
            out.push(instruction);
        }

        (out, changed)
    }
}

// --- copy propagation -----------------------------------------------------

struct CopyPropagation;

impl Pass for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn min_level(&self) -> u8 {
        2
    }

    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool) {
        let mut out: Vec<Instruction> = Vec::with_capacity(input.len());
        let mut changed = false;

        for instruction in input {
            // STLOC k; LDLOC k  =>  DUP; STLOC k (straight-line only).
            if instruction.op == Op::LdLoc {
                if let Some(prev) = out.last() {
                    if prev.op == Op::StLoc && prev.operand == instruction.operand {
                        let store = out.pop().expect("just checked");
                        out.push(Instruction::new(Op::Dup));
                        out.push(store);
                        changed = true;
                        continue;
                    }
                }
            }

            // LDLOC k; LDLOC k  =>  LDLOC k; DUP
            if matches!(instruction.op, Op::LdLoc | Op::LdArg | Op::LdSFld) {
                if let Some(prev) = out.last() {
                    if prev.op == instruction.op && prev.operand == instruction.operand {
                        out.push(Instruction::new(Op::Dup));
                        stats.instructions_removed += 1;
                        changed = true;
                        continue;
                    }
                }
            }

            out.push(instruction);
        }

        (out, changed)
    }
}

// --- jump threading -------------------------------------------------------

struct JumpThreading;

impl Pass for JumpThreading {
    fn name(&self) -> &'static str {
        "jump-threading"
    }

    fn min_level(&self) -> u8 {
        2
    }

    fn run(&self, input: Vec<Instruction>, stats: &mut OptimizerStats) -> (Vec<Instruction>, bool) {
        // A label is a trampoline when the first real instruction after
        // it is an unconditional JMP.
        let mut trampolines: HashMap<LabelId, LabelId> = HashMap::new();
        let mut index = 0;
        while index < input.len() {
            if let Some(label) = input[index].label_id() {
                let mut next = index + 1;
                while next < input.len() && input[next].is_label() {
                    next += 1;
                }
                if next < input.len() && input[next].op == Op::Jmp {
                    if let Some(target) = input[next].jump_target() {
                        if target != label {
                            trampolines.insert(label, target);
                        }
                    }
                }
            }
            index += 1;
        }

        if trampolines.is_empty() {
            return (input, false);
        }

        let mut changed = false;
        let mut out = input;
        for instruction in &mut out {
            if instruction.is_label() {
                continue;
            }
            if let Some(target) = instruction.jump_target() {
                if instruction.op == Op::Call {
                    continue; // calls return; threading would skip code
                }
                let resolved = resolve_chain(&trampolines, target);
                if resolved != target {
                    instruction.operand = Operand::Target(resolved);
                    stats.jumps_threaded += 1;
                    changed = true;
                }
            }
        }

        (out, changed)
    }
}

/// Follows trampoline chains, stopping on cycles.
fn resolve_chain(map: &HashMap<LabelId, LabelId>, start: LabelId) -> LabelId {
    let mut seen = HashSet::new();
    let mut current = start;
    while let Some(next) = map.get(&current) {
        if !seen.insert(current) {
            return start;
        }
        current = *next;
    }
    current
}
