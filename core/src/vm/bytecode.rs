use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Instruction set.
///
/// Control flow addresses targets by lexical depth instead of offsets: a jump
/// with depth parameter `p` (carried in `int`) resumes right after the nearest
/// instruction, in its scan direction, whose own `depth` is at most `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    PushNull,
    PushInt,
    PushFloat,
    PushString,
    PushBool,
    PushEnum,
    Pop,
    Dup,
    Swap,
    AutoConvert,
    LoadLocal,
    MoveLocal,
    StoreLocal,
    ShadowSave,
    ShadowRestore,
    LoadGlobal,
    StoreGlobal,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    And,
    Or,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    JumpBack,
    MakeClosure,
    LoadCapture,
    LoadThis,
    Call,
    CallDirect,
    CallName,
    CallMethod,
    Return,
    ReturnLocals,
    NewStruct,
    NewQueue,
    GetKey,
    GetField,
    SetKey,
    SetField,
    DeleteKey,
    HasKey,
    Length,
    Append,
    Prepend,
    PopFront,
    PopBack,
    FirstKey,
    LastKey,
    DeepCopy,
    ShallowCopy,
    Release,
    TrapSet,
    TrapClear,
    Throw,
    Fatal,
    DeferArm,
    DeferCheck,
    DeferEnd,
    IterNew,
    IterNext,
    IterKey,
    IterValue,
    Yield,
    Finalize,
}

/// Direction a depth-addressed jump scans in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Forward,
    Backward,
}

impl Opcode {
    pub fn is_literal(self) -> bool {
        matches!(
            self,
            Opcode::PushNull
                | Opcode::PushInt
                | Opcode::PushFloat
                | Opcode::PushString
                | Opcode::PushBool
                | Opcode::PushEnum
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }

    pub fn is_arith(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
        )
    }

    /// Depth-addressed control flow and its scan direction.
    pub fn scan(self) -> Option<Scan> {
        match self {
            Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::TrapSet
            | Opcode::IterNext => Some(Scan::Forward),
            Opcode::JumpBack => Some(Scan::Backward),
            _ => None,
        }
    }

    /// Hands control to another frame or the host. Only the last
    /// instruction of a fused step may do this.
    pub fn transfers_control(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallDirect
                | Opcode::CallName
                | Opcode::CallMethod
                | Opcode::Return
                | Opcode::ReturnLocals
                | Opcode::Yield
                | Opcode::Finalize
                | Opcode::IterNext
                | Opcode::DeferEnd
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub int: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str: Option<Arc<str>>,
    #[serde(default, skip_serializing_if = "is_zero_f")]
    pub float: f64,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "is_zero_u")]
    pub line: u32,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u(v: &u32) -> bool {
    *v == 0
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            int: 0,
            str: None,
            float: 0.0,
            depth: 0,
            line: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.str.as_deref().unwrap_or("")
    }

    /// Values popped and pushed. Calls are counted as producing one value.
    pub fn stack_effect(&self) -> (usize, usize) {
        let n = self.int.max(0) as usize;
        match self.op {
            Opcode::Nop
            | Opcode::ShadowSave
            | Opcode::ShadowRestore
            | Opcode::Jump
            | Opcode::JumpBack
            | Opcode::TrapSet
            | Opcode::TrapClear
            | Opcode::Fatal
            | Opcode::DeferArm
            | Opcode::DeferCheck
            | Opcode::DeferEnd
            | Opcode::Finalize
            | Opcode::ReturnLocals => (0, 0),
            Opcode::PushNull
            | Opcode::PushInt
            | Opcode::PushFloat
            | Opcode::PushString
            | Opcode::PushBool
            | Opcode::PushEnum
            | Opcode::LoadLocal
            | Opcode::MoveLocal
            | Opcode::LoadGlobal
            | Opcode::LoadCapture
            | Opcode::LoadThis
            | Opcode::NewStruct
            | Opcode::NewQueue => (0, 1),
            Opcode::Pop
            | Opcode::StoreLocal
            | Opcode::StoreGlobal
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::Throw
            | Opcode::Release
            | Opcode::IterNext => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Swap => (2, 2),
            Opcode::AutoConvert
            | Opcode::Neg
            | Opcode::Not
            | Opcode::GetField
            | Opcode::Length
            | Opcode::PopFront
            | Opcode::PopBack
            | Opcode::FirstKey
            | Opcode::LastKey
            | Opcode::DeepCopy
            | Opcode::ShallowCopy
            | Opcode::IterNew
            | Opcode::IterKey
            | Opcode::IterValue => (1, 1),
            Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::GetKey
            | Opcode::DeleteKey
            | Opcode::HasKey => (2, 1),
            Opcode::SetField | Opcode::Append | Opcode::Prepend => (2, 0),
            Opcode::SetKey => (3, 0),
            Opcode::MakeClosure => (n, 1),
            Opcode::Call | Opcode::CallMethod => (n + 1, 1),
            Opcode::CallDirect | Opcode::CallName => (n, 1),
            Opcode::Return | Opcode::Yield => (n, 0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.op, indent = self.depth as usize * 2)?;
        match self.op {
            Opcode::PushFloat => write!(f, " {}", ryu::Buffer::new().format(self.float))?,
            _ if self.str.is_some() && self.int != 0 => write!(f, " {:?} {}", self.name(), self.int)?,
            _ if self.str.is_some() => write!(f, " {:?}", self.name())?,
            _ if self.int != 0 || self.op.scan().is_some() => write!(f, " {}", self.int)?,
            _ => {}
        }
        Ok(())
    }
}

/// Largest operand stack a straight-line walk of `code` can reach.
pub fn max_stack(code: &[Instruction]) -> usize {
    let mut depth = 0usize;
    let mut high = 0usize;
    for ins in code {
        let (pop, push) = ins.stack_effect();
        depth = depth.saturating_sub(pop) + push;
        high = high.max(depth);
    }
    high
}

/// Hand assembler used by tests, benches and embedders.
#[derive(Debug, Default, Clone)]
pub struct CodeBuilder {
    code: Vec<Instruction>,
    depth: u32,
    line: u32,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_depth(depth: u32) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    fn push(&mut self, mut ins: Instruction) -> &mut Self {
        ins.depth = self.depth;
        ins.line = self.line;
        self.code.push(ins);
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.push(Instruction::new(op))
    }

    pub fn int(&mut self, op: Opcode, int: i64) -> &mut Self {
        self.push(Instruction {
            int,
            ..Instruction::new(op)
        })
    }

    pub fn float(&mut self, op: Opcode, float: f64) -> &mut Self {
        self.push(Instruction {
            float,
            ..Instruction::new(op)
        })
    }

    pub fn str(&mut self, op: Opcode, s: &str) -> &mut Self {
        self.push(Instruction {
            str: Some(Arc::from(s)),
            ..Instruction::new(op)
        })
    }

    pub fn str_int(&mut self, op: Opcode, s: &str, int: i64) -> &mut Self {
        self.push(Instruction {
            int,
            str: Some(Arc::from(s)),
            ..Instruction::new(op)
        })
    }

    /// Emit `body` one level deeper.
    pub fn nest(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.depth += 1;
        body(self);
        self.depth -= 1;
        self
    }

    pub fn push_int(&mut self, v: i64) -> &mut Self {
        self.int(Opcode::PushInt, v)
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.str(Opcode::PushString, s)
    }

    pub fn load(&mut self, slot: i64) -> &mut Self {
        self.int(Opcode::LoadLocal, slot)
    }

    pub fn store(&mut self, slot: i64) -> &mut Self {
        self.int(Opcode::StoreLocal, slot)
    }

    /// `while cond { body }`: `cond` must leave one value on the stack.
    pub fn while_loop(&mut self, cond: impl FnOnce(&mut Self), body: impl FnOnce(&mut Self)) -> &mut Self {
        let d = self.depth as i64;
        self.op(Opcode::Nop);
        self.nest(|b| {
            cond(b);
            b.int(Opcode::JumpIfFalse, d);
            body(b);
            b.int(Opcode::JumpBack, d);
        });
        self.op(Opcode::Nop)
    }

    /// `if cond { then } else { otherwise }`; `cond` is already on the stack.
    pub fn if_else(&mut self, then: impl FnOnce(&mut Self), otherwise: impl FnOnce(&mut Self)) -> &mut Self {
        let d = self.depth as i64;
        self.int(Opcode::JumpIfFalse, d);
        self.nest(then);
        self.int(Opcode::Jump, d);
        self.nest(otherwise);
        self.op(Opcode::Nop)
    }

    /// Guarded block: errors raised in `body` land in `handler` with the
    /// error value on the stack.
    pub fn trap(&mut self, body: impl FnOnce(&mut Self), handler: impl FnOnce(&mut Self)) -> &mut Self {
        let d = self.depth as i64;
        self.int(Opcode::TrapSet, d);
        self.nest(|b| {
            body(b);
            b.op(Opcode::TrapClear);
        });
        self.int(Opcode::Jump, d);
        self.nest(handler);
        self.op(Opcode::Nop)
    }

    /// Deferred block `k`; runs once if armed when the frame exits.
    pub fn deferred(&mut self, k: i64, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.int(Opcode::DeferCheck, k);
        self.nest(body);
        self.op(Opcode::Nop)
    }

    /// `for v in iterable { body }`: the iterable is on the stack; the
    /// iterator lives in local `slot`.
    pub fn for_each(&mut self, slot: i64, body: impl FnOnce(&mut Self)) -> &mut Self {
        let d = self.depth as i64;
        self.op(Opcode::IterNew).store(slot).op(Opcode::Nop);
        self.nest(|b| {
            b.load(slot).int(Opcode::IterNext, d);
            body(b);
            b.int(Opcode::JumpBack, d);
        });
        self.op(Opcode::Nop)
    }

    pub fn build(&mut self) -> Vec<Instruction> {
        std::mem::take(&mut self.code)
    }
}
