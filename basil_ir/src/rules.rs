//! Textual lowering rules
//!
//! Back ends express instruction selection as an ordered list of rules.
//! Each rule is a sequence of match atoms written in the IR's textual
//! syntax followed by an action that emits target instructions.  An
//! operand atom is one of:
//!
//! - `*`            match anything
//! - `r_N` / `f_N`  capture a register under the name `N`; every use of
//!   the same name within a rule must bind the same register
//! - `rK` / `fK`    match the specific register `K`
//! - `#K`           match the specific integer immediate `K`
//! - `label_N`      capture a label under the name `N`
//!
//! Rules are tried in order at each PC and the first match wins, so rule
//! order is the precedence mechanism.  A PC no rule matches is a compiler
//! bug, not a user error.

use basil_common::{assertion_failed, BasilResult};
use smallvec::SmallVec;

use crate::ir::{
    CallKind, CallTarget, IrOp, IrOpKind, IrOperand, IrSection, OperandClass,
    IR_MAX_OP_ARGS,
};

/// Upper bound on distinct captures of one kind within a single rule.
const MAX_MATCH_WILDCARDS: usize = 16;

/// A rule action: receives the section being lowered and the index of the
/// first matched op.
pub type RuleAction<U> = fn(&IrSection, usize, &mut U) -> BasilResult<()>;

/// A rule in textual form, before compilation.
pub struct RuleRaw<U> {
    pub text: &'static str,
    pub action: RuleAction<U>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OperandMatch {
    Any,
    FixedReg(u32),
    FixedFReg(u32),
    FixedI32(i32),
    FloatingReg(usize),
    FloatingFReg(usize),
    FloatingLabel(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LabelMatch {
    Any,
    Floating(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum OpMatch {
    Label(LabelMatch),
    Call { kind: CallKind, ptr: bool },
    Instr {
        kind: IrOpKind,
        operands: SmallVec<[OperandMatch; IR_MAX_OP_ARGS]>,
    },
}

/// A compiled rule: the packed match sequence plus its action.
pub struct Rule<U> {
    matches: SmallVec<[OpMatch; 4]>,
    action: RuleAction<U>,
}

struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text }
    }

    /// Next token, treating commas as separators.
    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start_matches([' ', '\t', '\n', '\r', ',']);
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let end = rest
            .find([' ', '\t', '\n', '\r', ','])
            .unwrap_or(rest.len());
        self.rest = &rest[end..];
        Some(&rest[..end])
    }
}

fn parse_label(text: &str) -> BasilResult<LabelMatch> {
    if text == "*" {
        return Ok(LabelMatch::Any);
    }
    let num = text.parse::<usize>().map_err(|_| assertion_failed!())?;
    Ok(LabelMatch::Floating(num))
}

fn parse_operand(token: &str, class: OperandClass) -> BasilResult<OperandMatch> {
    if token == "*" {
        return Ok(OperandMatch::Any);
    }
    if let Some(rest) = token.strip_prefix("label_") {
        if class != OperandClass::Label {
            return Err(assertion_failed!());
        }
        return match parse_label(rest)? {
            LabelMatch::Any => Ok(OperandMatch::Any),
            LabelMatch::Floating(n) => Ok(OperandMatch::FloatingLabel(n)),
        };
    }
    if let Some(rest) = token.strip_prefix('#') {
        if class != OperandClass::I32 {
            return Err(assertion_failed!());
        }
        let num = rest.parse::<i32>().map_err(|_| assertion_failed!())?;
        return Ok(OperandMatch::FixedI32(num));
    }
    let (is_freg, rest) = match token.as_bytes().first() {
        Some(b'r') => (false, &token[1..]),
        Some(b'f') => (true, &token[1..]),
        _ => return Err(assertion_failed!()),
    };
    match (is_freg, class) {
        (false, OperandClass::Register) | (true, OperandClass::FRegister) => (),
        _ => return Err(assertion_failed!()),
    }
    if let Some(name) = rest.strip_prefix('_') {
        let num = name.parse::<usize>().map_err(|_| assertion_failed!())?;
        Ok(if is_freg {
            OperandMatch::FloatingFReg(num)
        } else {
            OperandMatch::FloatingReg(num)
        })
    } else {
        let num = rest.parse::<u32>().map_err(|_| assertion_failed!())?;
        Ok(if is_freg {
            OperandMatch::FixedFReg(num)
        } else {
            OperandMatch::FixedReg(num)
        })
    }
}

fn parse_atom(tokens: &mut Tokens) -> BasilResult<Option<OpMatch>> {
    let Some(head) = tokens.next() else {
        return Ok(None);
    };

    if let Some(rest) = head.strip_prefix("label_") {
        return Ok(Some(OpMatch::Label(parse_label(rest)?)));
    }

    let call = match head {
        "call" => Some((CallKind::Proc, false)),
        "calli32" => Some((CallKind::I32, false)),
        "callr" => Some((CallKind::Real, false)),
        "callptr" => Some((CallKind::Proc, true)),
        "calli32ptr" => Some((CallKind::I32, true)),
        "callrptr" => Some((CallKind::Real, true)),
        _ => None,
    };
    if let Some((kind, ptr)) = call {
        return Ok(Some(OpMatch::Call { kind, ptr }));
    }

    let kind = IrOpKind::from_name(head).ok_or_else(|| assertion_failed!())?;
    let mut operands = SmallVec::new();
    for class in kind.operand_classes() {
        let token = tokens.next().ok_or_else(|| assertion_failed!())?;
        operands.push(parse_operand(token, *class)?);
    }
    Ok(Some(OpMatch::Instr { kind, operands }))
}

/// Compiles the textual rules to their packed form.  Malformed rule text
/// is an internal error; the corpus is compiled into the back end.
pub fn parse_rules<U>(raw: &[RuleRaw<U>]) -> BasilResult<Vec<Rule<U>>> {
    let mut rules = Vec::with_capacity(raw.len());
    for r in raw {
        let mut tokens = Tokens::new(r.text);
        let mut matches = SmallVec::new();
        while let Some(m) = parse_atom(&mut tokens)? {
            matches.push(m);
        }
        if matches.is_empty() {
            return Err(assertion_failed!());
        }
        rules.push(Rule {
            matches,
            action: r.action,
        });
    }
    Ok(rules)
}

#[derive(Default)]
struct MatchState {
    regs: SmallVec<[(usize, u32); 4]>,
    fregs: SmallVec<[(usize, u32); 4]>,
    labels: SmallVec<[(usize, usize); 4]>,
}

fn bind<T: PartialEq + Copy>(
    pairs: &mut SmallVec<[(usize, T); 4]>,
    key: usize,
    value: T,
) -> BasilResult<bool> {
    for (k, v) in pairs.iter() {
        if *k == key {
            return Ok(*v == value);
        }
    }
    if pairs.len() == MAX_MATCH_WILDCARDS {
        return Err(assertion_failed!());
    }
    pairs.push((key, value));
    Ok(true)
}

fn match_operand(
    operand: &IrOperand,
    m: &OperandMatch,
    state: &mut MatchState,
) -> BasilResult<bool> {
    Ok(match (m, operand) {
        (OperandMatch::Any, _) => true,
        (OperandMatch::FixedReg(k), IrOperand::Reg(r)) => k == r,
        (OperandMatch::FixedFReg(k), IrOperand::FReg(r)) => k == r,
        (OperandMatch::FixedI32(k), IrOperand::I32(v)) => k == v,
        (OperandMatch::FloatingReg(n), IrOperand::Reg(r)) => {
            bind(&mut state.regs, *n, *r)?
        }
        (OperandMatch::FloatingFReg(n), IrOperand::FReg(r)) => {
            bind(&mut state.fregs, *n, *r)?
        }
        (OperandMatch::FloatingLabel(n), IrOperand::Label(l)) => {
            bind(&mut state.labels, *n, *l)?
        }
        _ => return Err(assertion_failed!()),
    })
}

fn match_op(op: &IrOp, m: &OpMatch, state: &mut MatchState) -> BasilResult<bool> {
    match (m, op) {
        (OpMatch::Label(LabelMatch::Any), IrOp::Label(_)) => Ok(true),
        (OpMatch::Label(LabelMatch::Floating(n)), IrOp::Label(l)) => {
            bind(&mut state.labels, *n, *l)
        }
        (OpMatch::Call { kind, ptr }, IrOp::Call { kind: k, target, .. }) => {
            Ok(kind == k && *ptr == matches!(target, CallTarget::Ptr(_)))
        }
        (OpMatch::Instr { kind, operands }, IrOp::Instr(inst)) => {
            if *kind != inst.kind || operands.len() != inst.operands.len() {
                return Ok(false);
            }
            for (m, operand) in operands.iter().zip(&inst.operands) {
                if !match_operand(operand, m, state)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Runs the rule table over a section.  Matched rules invoke their action
/// with the window start and the matcher advances past the window.  NOP
/// entries are skipped silently; anything else that fails to match every
/// rule raises `AssertionFailed`.
pub fn match_rules<U>(
    s: &IrSection,
    rules: &[Rule<U>],
    user: &mut U,
) -> BasilResult<()> {
    let mut pc = 0;
    while pc < s.ops.len() {
        if s.ops[pc].is_nop() {
            pc += 1;
            continue;
        }
        let mut advanced = None;
        for rule in rules {
            let mut state = MatchState::default();
            let mut j = 0;
            while j < rule.matches.len() && pc + j < s.ops.len() {
                if !match_op(&s.ops[pc + j], &rule.matches[j], &mut state)? {
                    break;
                }
                j += 1;
            }
            if j == rule.matches.len() {
                (rule.action)(s, pc, user)?;
                advanced = Some(j);
                break;
            }
        }
        match advanced {
            Some(j) => pc += j,
            None => return Err(assertion_failed!()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{SectionKind, TypeSection};
    use pretty_assertions::assert_eq;

    fn section() -> IrSection {
        IrSection::new(SectionKind::Ir, TypeSection::proc(0, 0))
    }

    fn log_action(
        _s: &IrSection,
        start: usize,
        hits: &mut Vec<usize>,
    ) -> BasilResult<()> {
        hits.push(start);
        Ok(())
    }

    fn other_action(
        _s: &IrSection,
        start: usize,
        hits: &mut Vec<usize>,
    ) -> BasilResult<()> {
        hits.push(start + 1000);
        Ok(())
    }

    #[test]
    fn test_simple_rule_matches() {
        let rules = parse_rules(&[RuleRaw {
            text: "movii32 *, *",
            action: log_action as RuleAction<Vec<usize>>,
        }])
        .unwrap();

        let mut s = section();
        s.add_instr(
            IrOpKind::MovII32,
            vec![IrOperand::Reg(3), IrOperand::I32(42)],
        );

        let mut hits = Vec::new();
        match_rules(&s, &rules, &mut hits).unwrap();
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn test_floating_capture_must_agree() {
        // Fused compare-and-branch: the compare result register must be
        // the branch condition and the taken label must follow.
        let rules = parse_rules(&[
            RuleRaw {
                text: "ltii32 r_1, *, *\njmpc r_1, label_1, *\nlabel_1",
                action: log_action as RuleAction<Vec<usize>>,
            },
            RuleRaw {
                text: "ltii32 *, *, *",
                action: other_action as RuleAction<Vec<usize>>,
            },
            RuleRaw {
                text: "jmpc *, *, *",
                action: other_action as RuleAction<Vec<usize>>,
            },
            RuleRaw {
                text: "label_1",
                action: other_action as RuleAction<Vec<usize>>,
            },
        ])
        .unwrap();

        let mut fused = section();
        fused.add_instr(
            IrOpKind::LtII32,
            vec![IrOperand::Reg(5), IrOperand::Reg(4), IrOperand::I32(10)],
        );
        fused.add_instr(
            IrOpKind::JmpC,
            vec![
                IrOperand::Reg(5),
                IrOperand::Label(2),
                IrOperand::Label(3),
            ],
        );
        fused.add_label(2);

        let mut hits = Vec::new();
        match_rules(&fused, &rules, &mut hits).unwrap();
        assert_eq!(hits, vec![0]);

        // Different condition register: the fused rule must not fire.
        let mut split = section();
        split.add_instr(
            IrOpKind::LtII32,
            vec![IrOperand::Reg(5), IrOperand::Reg(4), IrOperand::I32(10)],
        );
        split.add_instr(
            IrOpKind::JmpC,
            vec![
                IrOperand::Reg(6),
                IrOperand::Label(2),
                IrOperand::Label(3),
            ],
        );
        split.add_label(2);

        let mut hits = Vec::new();
        match_rules(&split, &rules, &mut hits).unwrap();
        assert_eq!(hits, vec![1000, 1001, 1002]);
    }

    #[test]
    fn test_fixed_immediate_has_priority() {
        let rules = parse_rules(&[
            RuleRaw {
                text: "movii32 *, #0",
                action: log_action as RuleAction<Vec<usize>>,
            },
            RuleRaw {
                text: "movii32 *, *",
                action: other_action as RuleAction<Vec<usize>>,
            },
        ])
        .unwrap();

        let mut s = section();
        s.add_instr(
            IrOpKind::MovII32,
            vec![IrOperand::Reg(3), IrOperand::I32(0)],
        );
        s.add_instr(
            IrOpKind::MovII32,
            vec![IrOperand::Reg(3), IrOperand::I32(7)],
        );

        let mut hits = Vec::new();
        match_rules(&s, &rules, &mut hits).unwrap();
        assert_eq!(hits, vec![0, 1001]);
    }

    #[test]
    fn test_nops_are_skipped() {
        let rules = parse_rules(&[RuleRaw {
            text: "end",
            action: log_action as RuleAction<Vec<usize>>,
        }])
        .unwrap();

        let mut s = section();
        s.add_instr(IrOpKind::Nop, vec![]);
        s.add_instr(IrOpKind::End, vec![]);

        let mut hits = Vec::new();
        match_rules(&s, &rules, &mut hits).unwrap();
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn test_missing_pattern_is_internal_error() {
        let rules =
            parse_rules::<Vec<usize>>(&[]).unwrap();
        let mut s = section();
        s.add_instr(IrOpKind::End, vec![]);
        let mut hits = Vec::new();
        let err = match_rules(&s, &rules, &mut hits).unwrap_err();
        assert!(err.is_internal());
    }
}
