use std::sync::Arc;

use anyhow::Result;

use super::{CallTarget, ExecCtx, Flow, StepFn};
use crate::error::VmError;
use crate::pool::{Heap, HeapObject};
use crate::val::{ArithOp, CmpOp, Value, ValueFlags, arith, compare_op, negate};
use crate::vm::bytecode::{Instruction, Opcode};
use crate::vm::callable::Callable;
use crate::vm::frame::PendingReturn;
use crate::vm::iter;

#[inline]
pub(super) fn step<F>(f: F) -> StepFn
where
    F: Fn(&mut ExecCtx<'_>) -> Result<Flow> + 'static,
{
    Box::new(f)
}

pub(super) fn literal(ins: &Instruction) -> Value {
    match ins.op {
        Opcode::PushInt => Value::int(ins.int),
        Opcode::PushFloat => Value::float(ins.float),
        Opcode::PushString => Value::string(ins.str.clone().unwrap_or_else(|| Arc::from(""))),
        Opcode::PushBool => Value::bool(ins.int != 0),
        Opcode::PushEnum => Value::enumeration(ins.int),
        _ => Value::null(),
    }
}

pub(super) fn cmp_op(op: Opcode) -> CmpOp {
    match op {
        Opcode::Eq => CmpOp::Eq,
        Opcode::Ne => CmpOp::Ne,
        Opcode::Lt => CmpOp::Lt,
        Opcode::Le => CmpOp::Le,
        Opcode::Gt => CmpOp::Gt,
        _ => CmpOp::Ge,
    }
}

pub(super) fn arith_op(op: Opcode) -> ArithOp {
    match op {
        Opcode::Add => ArithOp::Add,
        Opcode::Sub => ArithOp::Sub,
        Opcode::Mul => ArithOp::Mul,
        Opcode::Div => ArithOp::Div,
        _ => ArithOp::Mod,
    }
}

/// Read through `target`. Temporaries that own their structure hand the
/// child over instead of a pointer that would dangle once they are disposed.
fn fetch(heap: &mut Heap, target: Value, key: &Value) -> Result<Value> {
    let r = if target.owns_heap() {
        heap.delete_child(&target, key)
    } else {
        heap.get_child(&target, key)
    };
    heap.dispose(target);
    r
}

fn binary(ctx: &mut ExecCtx<'_>) -> Result<(Value, Value)> {
    let rhs = ctx.frame.pop()?;
    let lhs = ctx.frame.pop()?;
    Ok((lhs, rhs))
}

/// Handler for a single instruction. `target` is the resolved jump position
/// for depth-addressed opcodes.
pub(super) fn single(ins: &Instruction, target: Option<usize>, unit: &str) -> Result<StepFn> {
    let slot = ins.int.max(0) as usize;
    let n = slot;
    let name: Arc<str> = ins.str.clone().unwrap_or_else(|| Arc::from(""));
    let jump = target.unwrap_or(usize::MAX);
    let unit_name: Arc<str> = Arc::from(unit);

    Ok(match ins.op {
        Opcode::Nop => step(|_| Ok(Flow::Next)),
        Opcode::PushNull
        | Opcode::PushInt
        | Opcode::PushFloat
        | Opcode::PushString
        | Opcode::PushBool
        | Opcode::PushEnum => {
            let lit = literal(ins);
            step(move |ctx| {
                ctx.frame.push(lit.share());
                Ok(Flow::Next)
            })
        }
        Opcode::Pop => step(|ctx| {
            let v = ctx.frame.pop()?;
            ctx.heap.dispose(v);
            Ok(Flow::Next)
        }),
        Opcode::Dup => step(|ctx| {
            let v = ctx.frame.peek()?.share();
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::Swap => step(|ctx| {
            let (a, b) = binary(ctx)?;
            ctx.frame.push(b);
            ctx.frame.push(a);
            Ok(Flow::Next)
        }),
        Opcode::AutoConvert => step(|ctx| {
            ctx.frame.peek_mut()?.set_flag(ValueFlags::CAN_AUTO_CONVERT);
            Ok(Flow::Next)
        }),
        Opcode::LoadLocal => step(move |ctx| {
            let v = ctx.frame.local(slot)?.share();
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::MoveLocal => step(move |ctx| {
            let v = ctx.frame.take_local(slot)?;
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::StoreLocal => step(move |ctx| {
            let v = ctx.frame.pop()?;
            ctx.frame.update_local(ctx.heap, slot, v)?;
            Ok(Flow::Next)
        }),
        Opcode::ShadowSave => step(move |ctx| {
            ctx.frame.shadow_save(slot)?;
            Ok(Flow::Next)
        }),
        Opcode::ShadowRestore => step(move |ctx| {
            ctx.frame.shadow_restore(ctx.heap, slot)?;
            Ok(Flow::Next)
        }),
        Opcode::LoadGlobal => step(move |ctx| {
            let v = ctx.globals.load(&name);
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::StoreGlobal => step(move |ctx| {
            let v = ctx.frame.pop()?;
            ctx.globals.store(ctx.heap, &name, v)?;
            Ok(Flow::Next)
        }),
        Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            let op = cmp_op(ins.op);
            step(move |ctx| {
                let (lhs, rhs) = binary(ctx)?;
                let r = compare_op(op, &lhs, &rhs);
                ctx.heap.dispose(lhs);
                ctx.heap.dispose(rhs);
                ctx.frame.push(Value::bool(r));
                Ok(Flow::Next)
            })
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            let op = arith_op(ins.op);
            step(move |ctx| {
                let (lhs, rhs) = binary(ctx)?;
                let r = arith(op, &lhs, &rhs);
                ctx.heap.dispose(lhs);
                ctx.heap.dispose(rhs);
                ctx.frame.push(r?);
                Ok(Flow::Next)
            })
        }
        Opcode::Neg => step(|ctx| {
            let v = ctx.frame.pop()?;
            let r = negate(&v);
            ctx.heap.dispose(v);
            ctx.frame.push(r?);
            Ok(Flow::Next)
        }),
        Opcode::Not => step(|ctx| {
            let v = ctx.frame.pop()?;
            let r = v.truthy();
            ctx.heap.dispose(v);
            ctx.frame.push(Value::bool(!r?));
            Ok(Flow::Next)
        }),
        Opcode::And | Opcode::Or => {
            let and = ins.op == Opcode::And;
            step(move |ctx| {
                let (lhs, rhs) = binary(ctx)?;
                let r = lhs.truthy().and_then(|a| Ok((a, rhs.truthy()?)));
                ctx.heap.dispose(lhs);
                ctx.heap.dispose(rhs);
                let (a, b) = r?;
                ctx.frame.push(Value::bool(if and { a && b } else { a || b }));
                Ok(Flow::Next)
            })
        }
        Opcode::Jump | Opcode::JumpBack => step(move |_| Ok(Flow::Jump(jump))),
        Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
            let when = ins.op == Opcode::JumpIfTrue;
            step(move |ctx| {
                let v = ctx.frame.pop()?;
                let r = v.truthy();
                ctx.heap.dispose(v);
                Ok(if r? == when { Flow::Jump(jump) } else { Flow::Next })
            })
        }
        Opcode::MakeClosure => step(move |ctx| {
            let unit = ctx
                .units
                .get(&name)
                .cloned()
                .ok_or_else(|| VmError::malformed(&unit_name, format!("unknown unit '{}'", name)))?;
            let captured = ctx.frame.pop_n(n)?;
            let mut captures = ctx.heap.pools.values.checkout(n);
            captures.extend(captured);
            let v = ctx.heap.alloc(HeapObject::Callable(Callable::Script { unit, captures }));
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::LoadCapture => step(move |ctx| {
            let v = match ctx.heap.callable(&ctx.frame.closure)? {
                Callable::Script { captures, .. } => captures.get(slot).map(Value::share),
                Callable::Host { .. } => None,
            };
            let v = v.ok_or_else(|| VmError::malformed(&unit_name, format!("capture {} out of range", slot)))?;
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::LoadThis => step(|ctx| {
            let v = ctx.frame.this.share();
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::Call => step(move |ctx| {
            let args = ctx.frame.pop_n(n)?;
            let callee = ctx.frame.pop()?;
            ctx.channel.extend(args);
            Ok(Flow::Call {
                target: CallTarget::Value(callee),
                this: Value::null(),
            })
        }),
        Opcode::CallDirect | Opcode::CallName => {
            let direct = ins.op == Opcode::CallDirect;
            step(move |ctx| {
                let args = ctx.frame.pop_n(n)?;
                ctx.channel.extend(args);
                let target = if direct {
                    CallTarget::Unit(name.clone())
                } else {
                    CallTarget::Path(name.clone())
                };
                Ok(Flow::Call {
                    target,
                    this: Value::null(),
                })
            })
        }
        Opcode::CallMethod => step(move |ctx| {
            let args = ctx.frame.pop_n(n)?;
            let receiver = ctx.frame.pop()?;
            let method = ctx.heap.get_child(&receiver, &Value::string(name.clone()));
            match method {
                Ok(method) if !method.is_null() => {
                    ctx.channel.extend(args);
                    Ok(Flow::Call {
                        target: CallTarget::Value(method),
                        this: receiver,
                    })
                }
                other => {
                    ctx.heap.dispose_all(args);
                    ctx.heap.dispose(receiver);
                    other?;
                    Err(VmError::TypeMismatch(format!("receiver has no method '{}'", name)).into())
                }
            }
        }),
        Opcode::Return => step(move |ctx| {
            let values = ctx.frame.pop_n(n)?;
            ctx.channel.extend(values);
            Ok(Flow::Return)
        }),
        Opcode::ReturnLocals => {
            let mask = ins.int as u64;
            step(move |_| Ok(Flow::ReturnLocals(mask)))
        }
        Opcode::NewStruct => step(move |ctx| {
            let v = ctx.heap.alloc_struct(n);
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::NewQueue => step(move |ctx| {
            let v = ctx.heap.alloc_queue(n);
            ctx.frame.push(v);
            Ok(Flow::Next)
        }),
        Opcode::GetKey => step(|ctx| {
            let (target, key) = binary(ctx)?;
            let r = fetch(ctx.heap, target, &key);
            ctx.heap.dispose(key);
            ctx.frame.push(r?);
            Ok(Flow::Next)
        }),
        Opcode::GetField => step(move |ctx| {
            let target = ctx.frame.pop()?;
            let r = fetch(ctx.heap, target, &Value::string(name.clone()))?;
            ctx.frame.push(r);
            Ok(Flow::Next)
        }),
        Opcode::SetKey => step(|ctx| {
            let value = ctx.frame.pop()?;
            let (target, key) = binary(ctx)?;
            let r = ctx.heap.set_child(&target, &key, value);
            ctx.heap.dispose(key);
            ctx.heap.dispose(target);
            r?;
            Ok(Flow::Next)
        }),
        Opcode::SetField => step(move |ctx| {
            let (target, value) = binary(ctx)?;
            let r = ctx.heap.set_child(&target, &Value::string(name.clone()), value);
            ctx.heap.dispose(target);
            r?;
            Ok(Flow::Next)
        }),
        Opcode::DeleteKey => step(|ctx| {
            let (target, key) = binary(ctx)?;
            let r = ctx.heap.delete_child(&target, &key);
            ctx.heap.dispose(key);
            ctx.heap.dispose(target);
            ctx.frame.push(r?);
            Ok(Flow::Next)
        }),
        Opcode::HasKey => step(|ctx| {
            let (target, key) = binary(ctx)?;
            let r = ctx.heap.has_child(&target, &key);
            ctx.heap.dispose(key);
            ctx.heap.dispose(target);
            ctx.frame.push(Value::bool(r?));
            Ok(Flow::Next)
        }),
        Opcode::Length => step(|ctx| {
            let v = ctx.frame.pop()?;
            let r = ctx.heap.length(&v);
            ctx.heap.dispose(v);
            ctx.frame.push(Value::int(r? as i64));
            Ok(Flow::Next)
        }),
        Opcode::Append | Opcode::Prepend => {
            let front = ins.op == Opcode::Prepend;
            step(move |ctx| {
                let (target, value) = binary(ctx)?;
                let r = ctx.heap.append(&target, value, front);
                ctx.heap.dispose(target);
                r?;
                Ok(Flow::Next)
            })
        }
        Opcode::PopFront | Opcode::PopBack => {
            let front = ins.op == Opcode::PopFront;
            step(move |ctx| {
                let target = ctx.frame.pop()?;
                let r = ctx.heap.structure_mut(&target).map(|s| {
                    let v = if front { s.pop_front() } else { s.pop_back() };
                    v.unwrap_or_default()
                });
                ctx.heap.dispose(target);
                ctx.frame.push(r?);
                Ok(Flow::Next)
            })
        }
        Opcode::FirstKey | Opcode::LastKey => {
            let first = ins.op == Opcode::FirstKey;
            step(move |ctx| {
                let target = ctx.frame.pop()?;
                let r = ctx.heap.structure_mut(&target).map(|s| {
                    let k = if first { s.first_key() } else { s.last_key() };
                    k.map_or_else(Value::null, |k| k.to_value())
                });
                ctx.heap.dispose(target);
                ctx.frame.push(r?);
                Ok(Flow::Next)
            })
        }
        Opcode::DeepCopy | Opcode::ShallowCopy => {
            let deep = ins.op == Opcode::DeepCopy;
            step(move |ctx| {
                let v = ctx.frame.pop()?;
                let r = if deep {
                    ctx.heap.deep_copy(&v)
                } else {
                    ctx.heap.shallow_copy(&v)
                };
                ctx.heap.dispose(v);
                ctx.frame.push(r?);
                Ok(Flow::Next)
            })
        }
        Opcode::Release => step(|ctx| {
            let v = ctx.frame.pop()?;
            ctx.heap.release(v)?;
            Ok(Flow::Next)
        }),
        Opcode::TrapSet => step(move |ctx| {
            ctx.frame.trap = Some(jump);
            Ok(Flow::Next)
        }),
        Opcode::TrapClear => step(|ctx| {
            ctx.frame.trap = None;
            Ok(Flow::Next)
        }),
        Opcode::Throw => step(|ctx| {
            let v = ctx.frame.pop()?;
            Err(VmError::Thrown(v).into())
        }),
        Opcode::Fatal => {
            let message = name.to_string();
            step(move |_| Err(VmError::Fatal(message.clone()).into()))
        }
        Opcode::DeferArm => step(move |ctx| {
            ctx.frame.arm_defer(slot)?;
            Ok(Flow::Next)
        }),
        Opcode::DeferCheck => step(move |ctx| {
            Ok(if ctx.frame.take_defer(slot) {
                Flow::Next
            } else {
                Flow::Jump(jump)
            })
        }),
        Opcode::DeferEnd => step(|ctx| {
            if let Some(err) = ctx.frame.pending_error.take() {
                return Err(err);
            }
            Ok(match ctx.frame.pending_return.take() {
                Some(PendingReturn::Values(values)) => {
                    ctx.channel.extend(values);
                    Flow::Return
                }
                Some(PendingReturn::Locals(mask)) => Flow::ReturnLocals(mask),
                None => Flow::Next,
            })
        }),
        Opcode::IterNew => step(|ctx| {
            let v = ctx.frame.pop()?;
            let it = iter::open(ctx.heap, v)?;
            ctx.frame.push(it);
            Ok(Flow::Next)
        }),
        Opcode::IterNext => step(move |ctx| {
            let it = ctx.frame.pop()?;
            let r = iter::step(ctx.heap, &it, jump);
            ctx.heap.dispose(it);
            r
        }),
        Opcode::IterKey | Opcode::IterValue => {
            let key = ins.op == Opcode::IterKey;
            step(move |ctx| {
                let it = ctx.frame.pop()?;
                let r = iter::current(ctx.heap, &it, key);
                ctx.heap.dispose(it);
                ctx.frame.push(r?);
                Ok(Flow::Next)
            })
        }
        Opcode::Yield => step(move |ctx| {
            let values = ctx.frame.pop_n(n)?;
            ctx.channel.extend(values);
            Ok(Flow::Yield)
        }),
        Opcode::Finalize => step(|_| Ok(Flow::Finalize)),
    })
}
