use anyhow::Result;
use once_cell::sync::Lazy;

use super::handlers::{arith_op, cmp_op, literal, single, step};
use super::matcher::{Matcher, Pattern};
use super::{ExecCtx, Flow, StepFn};
use crate::val::{Data, Value, arith, compare_op};
use crate::vm::bytecode::{Instruction, Opcode};

/// Builds the fused closure for a matched span.
pub type Build = fn(&[Instruction], &[Option<usize>], &str) -> Result<StepFn>;

const LITERALS: &[Opcode] = &[
    Opcode::PushNull,
    Opcode::PushInt,
    Opcode::PushFloat,
    Opcode::PushString,
    Opcode::PushBool,
    Opcode::PushEnum,
];
const COMPARES: &[Opcode] = &[Opcode::Eq, Opcode::Ne, Opcode::Lt, Opcode::Le, Opcode::Gt, Opcode::Ge];
const ARITH: &[Opcode] = &[Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div, Opcode::Mod];
const PURE_PUSH: &[Opcode] = &[
    Opcode::LoadLocal,
    Opcode::PushNull,
    Opcode::PushInt,
    Opcode::PushFloat,
    Opcode::PushString,
    Opcode::PushBool,
    Opcode::PushEnum,
];

static REGISTRY: Lazy<Vec<Pattern<Build>>> = Lazy::new(|| {
    vec![
        Pattern {
            name: "increment-local",
            parts: vec![
                Matcher::Single(Opcode::LoadLocal),
                Matcher::Single(Opcode::PushInt),
                Matcher::AnyOf(&[Opcode::Add, Opcode::Sub]),
                Matcher::Single(Opcode::StoreLocal),
            ],
            specificity: 4,
            guard: Some(|span| span[0].int == span[3].int),
            build: increment_local,
        },
        Pattern {
            name: "local-compare-branch",
            parts: vec![
                Matcher::Single(Opcode::LoadLocal),
                Matcher::Single(Opcode::PushInt),
                Matcher::AnyOf(COMPARES),
                Matcher::Single(Opcode::JumpIfFalse),
            ],
            specificity: 4,
            guard: None,
            build: local_compare_branch,
        },
        Pattern {
            name: "compare-locals",
            parts: vec![
                Matcher::Single(Opcode::LoadLocal),
                Matcher::Single(Opcode::LoadLocal),
                Matcher::AnyOf(COMPARES),
            ],
            specificity: 3,
            guard: None,
            build: compare_locals,
        },
        Pattern {
            name: "local-literal-arith",
            parts: vec![
                Matcher::Single(Opcode::LoadLocal),
                Matcher::AnyOf(LITERALS),
                Matcher::AnyOf(ARITH),
            ],
            specificity: 3,
            guard: None,
            build: local_literal_arith,
        },
        Pattern {
            name: "store-reload",
            parts: vec![Matcher::Single(Opcode::StoreLocal), Matcher::Single(Opcode::LoadLocal)],
            specificity: 2,
            guard: Some(|span| span[0].int == span[1].int),
            build: store_reload,
        },
        Pattern {
            name: "discard-pure",
            parts: vec![Matcher::AnyOf(PURE_PUSH), Matcher::Single(Opcode::Pop)],
            specificity: 2,
            guard: None,
            build: discard_pure,
        },
        Pattern {
            name: "literal-run",
            parts: vec![Matcher::Repeat(Box::new(Matcher::AnyOf(LITERALS)), 2)],
            specificity: 1,
            guard: None,
            build: literal_run,
        },
        Pattern {
            name: "skip-nops",
            parts: vec![
                Matcher::Wildcard,
                Matcher::Repeat(Box::new(Matcher::Single(Opcode::Nop)), 1),
            ],
            specificity: 0,
            guard: None,
            build: skip_nops,
        },
    ]
});

pub(super) fn registry() -> &'static [Pattern<Build>] {
    &REGISTRY
}

/// Plain handlers for a span, run in order when a fast path does not apply.
fn covered(span: &[Instruction], targets: &[Option<usize>], unit: &str) -> Result<Vec<StepFn>> {
    span.iter().zip(targets).map(|(ins, t)| single(ins, *t, unit)).collect()
}

fn run_covered(handlers: &[StepFn], ctx: &mut ExecCtx<'_>) -> Result<Flow> {
    for h in handlers {
        match h(ctx)? {
            Flow::Next => continue,
            other => return Ok(other),
        }
    }
    Ok(Flow::Next)
}

fn increment_local(span: &[Instruction], targets: &[Option<usize>], unit: &str) -> Result<StepFn> {
    let slot = span[0].int as usize;
    let delta = span[1].int;
    let add = span[2].op == Opcode::Add;
    let fallback = covered(span, targets, unit)?;
    Ok(step(move |ctx| {
        let fast = match ctx.frame.local(slot)?.data() {
            Data::Int(v) if add => v.checked_add(delta),
            Data::Int(v) => v.checked_sub(delta),
            _ => None,
        };
        match fast {
            Some(v) => {
                // an int slot owns nothing, so overwriting in place is safe
                ctx.frame.locals[slot] = Value::int(v);
                Ok(Flow::Next)
            }
            None => run_covered(&fallback, ctx),
        }
    }))
}

fn local_compare_branch(span: &[Instruction], targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    let slot = span[0].int as usize;
    let rhs = Value::int(span[1].int);
    let op = cmp_op(span[2].op);
    let jump = targets[3].unwrap_or(usize::MAX);
    Ok(step(move |ctx| {
        let lhs = ctx.frame.local(slot)?.share();
        let taken = compare_op(op, &lhs, &rhs);
        Ok(if taken { Flow::Next } else { Flow::Jump(jump) })
    }))
}

fn compare_locals(span: &[Instruction], _targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    let (a, b) = (span[0].int as usize, span[1].int as usize);
    let op = cmp_op(span[2].op);
    Ok(step(move |ctx| {
        let lhs = ctx.frame.local(a)?.share();
        let rhs = ctx.frame.local(b)?.share();
        let r = compare_op(op, &lhs, &rhs);
        ctx.frame.push(Value::bool(r));
        Ok(Flow::Next)
    }))
}

fn local_literal_arith(span: &[Instruction], _targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    let slot = span[0].int as usize;
    let rhs = literal(&span[1]);
    let op = arith_op(span[2].op);
    Ok(step(move |ctx| {
        let lhs = ctx.frame.local(slot)?.share();
        let r = arith(op, &lhs, &rhs)?;
        ctx.frame.push(r);
        Ok(Flow::Next)
    }))
}

fn store_reload(span: &[Instruction], _targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    let slot = span[0].int as usize;
    Ok(step(move |ctx| {
        let v = ctx.frame.pop()?;
        ctx.frame.update_local(ctx.heap, slot, v)?;
        let again = ctx.frame.local(slot)?.share();
        ctx.frame.push(again);
        Ok(Flow::Next)
    }))
}

fn discard_pure(_span: &[Instruction], _targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    Ok(step(|_| Ok(Flow::Next)))
}

fn literal_run(span: &[Instruction], _targets: &[Option<usize>], _unit: &str) -> Result<StepFn> {
    let values: Vec<Value> = span.iter().map(literal).collect();
    Ok(step(move |ctx| {
        for v in &values {
            ctx.frame.push(v.share());
        }
        Ok(Flow::Next)
    }))
}

fn skip_nops(span: &[Instruction], targets: &[Option<usize>], unit: &str) -> Result<StepFn> {
    let head = single(&span[0], targets[0], unit)?;
    Ok(step(move |ctx| head(ctx)))
}
