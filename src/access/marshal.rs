//! 原生调用的参数与返回值转换
//!
//! 每个参数按签名中的类型身份转换：
//!
//! - 标量（基本类型、枚举、位域、指针）按值传递：写入临时槽再读回，
//!   转换规则与字段写入完全一致
//! - 结构体、联合体、容器按引用传递：接受兼容引用，或一张表
//!   （分配临时对象并逐项赋值，调用结束后销毁）
//! - 结构体返回值写入调用前分配的存储，所有权交给调用方
//!
//! 转换在持锁的访问上下文中进行，原生函数本身在锁外调用，
//! 以便它自己再次进入 [`Runtime::with_access`]。

use super::{get, AccessContext, ObjectRef, Value};
use crate::core::error::{AccessError, BridgeError, BridgeResult, InvocationError};
use crate::core::runtime::Runtime;
use crate::fields::{assign, read_value, write_value};
use crate::types::{lifecycle, CallFrame, NativeFunction, TypeId, TypeShape};
use std::sync::Arc;

/// 参数如何传递
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Passing {
    /// 不转换
    Raw,
    ByValue,
    ByReference,
}

fn passing(ctx: &AccessContext<'_>, ty: Option<TypeId>) -> Passing {
    let Some(ty) = ty else {
        return Passing::Raw;
    };
    match ctx.types.get(ty).shape {
        TypeShape::Primitive(_)
        | TypeShape::Enum(_)
        | TypeShape::Bitfield(_)
        | TypeShape::Pointer { .. } => Passing::ByValue,
        TypeShape::Struct(_)
        | TypeShape::VirtualStruct(_)
        | TypeShape::Union(_)
        | TypeShape::Container(_) => Passing::ByReference,
        TypeShape::Function(_) | TypeShape::Opaque | TypeShape::Global(_) => Passing::Raw,
    }
}

/// 转换完成、等待调用的帧
#[derive(Debug)]
pub struct PreparedCall {
    pub frame: CallFrame,
    /// 由表构造的临时参数，调用后销毁
    temporaries: Vec<ObjectRef>,
}

fn argument_error(function: &NativeFunction, index: usize, err: BridgeError) -> BridgeError {
    InvocationError::Native {
        function: function.name.clone(),
        message: format!("argument {}: {}", index + 1, err),
    }
    .into()
}

/// 经临时槽把值转换为 `ty` 的规范形式
pub fn normalize(ctx: &mut AccessContext<'_>, ty: TypeId, value: &Value) -> BridgeResult<Value> {
    let slot = ObjectRef::new(lifecycle::allocate(ctx.types, ctx.mem, ty)?, ty);
    let result = write_value(ctx, slot, value).and_then(|()| read_value(ctx, slot));
    lifecycle::destroy(ctx.types, ctx.mem, slot.address, ty)?;
    result
}

/// 转换参数并为结构体返回值分配存储
pub fn prepare(
    ctx: &mut AccessContext<'_>,
    function: &NativeFunction,
    this: Option<ObjectRef>,
    args: &[Value],
) -> BridgeResult<PreparedCall> {
    let signature = &function.signature;
    if !signature.accepts(args.len()) {
        return Err(InvocationError::WrongArgCount {
            function: function.name.clone(),
            expected: signature.arity(),
            got: args.len(),
        }
        .into());
    }

    let mut prepared = PreparedCall {
        frame: CallFrame::new(Vec::with_capacity(args.len())),
        temporaries: Vec::new(),
    };
    prepared.frame.this = this;

    for (index, arg) in args.iter().enumerate() {
        let ty = signature.args.get(index).copied().flatten();
        let converted = convert_argument(ctx, ty, arg, &mut prepared.temporaries);
        match converted {
            Ok(value) => prepared.frame.args.push(value),
            Err(err) => {
                release(ctx, &mut prepared);
                return Err(argument_error(function, index, err));
            }
        }
    }

    if let Some(ret) = signature.ret {
        if passing(ctx, Some(ret)) == Passing::ByReference {
            match lifecycle::allocate(ctx.types, ctx.mem, ret) {
                Ok(address) => prepared.frame.ret = Some(ObjectRef::new(address, ret)),
                Err(err) => {
                    release(ctx, &mut prepared);
                    return Err(err);
                }
            }
        }
    }
    Ok(prepared)
}

fn convert_argument(
    ctx: &mut AccessContext<'_>,
    ty: Option<TypeId>,
    arg: &Value,
    temporaries: &mut Vec<ObjectRef>,
) -> BridgeResult<Value> {
    match (passing(ctx, ty), ty) {
        (Passing::ByValue, Some(ty)) => normalize(ctx, ty, arg),
        (Passing::ByReference, Some(ty)) => match arg {
            Value::Ref(_) => Ok(Value::Ref(get(ctx.types, arg, Some(ty), false)?)),
            Value::Table(_) => {
                let temp = ObjectRef::new(lifecycle::allocate(ctx.types, ctx.mem, ty)?, ty);
                temporaries.push(temp);
                assign(ctx, temp, arg)?;
                Ok(Value::Ref(temp))
            }
            Value::Nil => Err(AccessError::Null(ctx.type_name(ty)).into()),
            _ => Err(AccessError::Expected("reference or table").into()),
        },
        _ => Ok(arg.clone()),
    }
}

/// 销毁临时参数；返回值存储保留
fn release(ctx: &mut AccessContext<'_>, prepared: &mut PreparedCall) {
    for temp in prepared.temporaries.drain(..) {
        if let Err(e) = lifecycle::destroy(ctx.types, ctx.mem, temp.address, temp.ty) {
            tracing::warn!(
                target: "access",
                "Failed to release temporary {}: {}",
                ctx.type_name(temp.ty),
                e
            );
        }
    }
}

/// 调用结束后的收尾：销毁临时对象，转换返回值
pub fn finish(
    ctx: &mut AccessContext<'_>,
    function: &NativeFunction,
    mut prepared: PreparedCall,
    result: BridgeResult<Value>,
) -> BridgeResult<Value> {
    release(ctx, &mut prepared);
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            if let Some(ret) = prepared.frame.ret {
                lifecycle::destroy(ctx.types, ctx.mem, ret.address, ret.ty)?;
            }
            return Err(err);
        }
    };
    if let Some(ret) = prepared.frame.ret {
        return Ok(Value::Ref(ret));
    }
    match function.signature.ret {
        Some(ty) if passing(ctx, Some(ty)) == Passing::ByValue => normalize(ctx, ty, &value),
        _ => Ok(value),
    }
}

/// 完整的一次调用：持锁转换，锁外调用，再持锁收尾
pub fn invoke(
    runtime: &Runtime,
    function: &Arc<NativeFunction>,
    this: Option<ObjectRef>,
    args: &[Value],
) -> BridgeResult<Value> {
    let mut prepared = runtime.with_access(|ctx| prepare(ctx, function, this, args))?;
    let result = function.invoke(runtime, &mut prepared.frame);
    runtime.with_access(|ctx| finish(ctx, function, prepared, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{read_field, write_field};
    use crate::types::{
        FieldDescriptor, FunctionIdentity, PrimitiveKind, StructIdentity, TypeRegistry,
    };

    struct Fixture {
        runtime: Arc<Runtime>,
        i32_t: TypeId,
        bool_t: TypeId,
        point: TypeId,
    }

    fn fixture() -> Fixture {
        let mut b = TypeRegistry::builder();
        let i32_t = b.primitive(PrimitiveKind::I32);
        let bool_t = b.primitive(PrimitiveKind::Bool);
        let point = b.add(
            "point",
            TypeShape::Struct(StructIdentity::new(
                8,
                vec![
                    FieldDescriptor::primitive("x", 0, i32_t),
                    FieldDescriptor::primitive("y", 4, i32_t),
                ],
            )),
        );
        let runtime = Runtime::builder().types(b.build().unwrap()).build().unwrap();
        Fixture {
            runtime,
            i32_t,
            bool_t,
            point,
        }
    }

    #[test]
    fn test_scalar_arguments_are_normalized() {
        let f = fixture();
        let add = Arc::new(NativeFunction::new(
            "add",
            FunctionIdentity::new(vec![Some(f.i32_t), Some(f.i32_t)], Some(f.i32_t)),
            |_, frame| {
                let a = frame.arg(0).as_int().unwrap_or_default();
                let b = frame.arg(1).as_int().unwrap_or_default();
                Ok(Value::Int(a + b))
            },
        ));
        let sum = invoke(&f.runtime, &add, None, &[Value::Int(2), Value::Float(3.0)]).unwrap();
        assert_eq!(sum, Value::Int(5));

        let err = invoke(&f.runtime, &add, None, &[Value::Int(2), Value::from("x")]).unwrap_err();
        assert_eq!(err.to_string(), "add: argument 2: integer expected");
    }

    #[test]
    fn test_scalar_return_uses_declared_type() {
        let f = fixture();
        let truthy = Arc::new(NativeFunction::new(
            "truthy",
            FunctionIdentity::new(vec![], Some(f.bool_t)),
            |_, _| Ok(Value::Int(1)),
        ));
        assert_eq!(invoke(&f.runtime, &truthy, None, &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_table_argument_becomes_temporary() {
        let f = fixture();
        let point = f.point;
        let norm = Arc::new(NativeFunction::new(
            "manhattan",
            FunctionIdentity::new(vec![Some(point)], Some(f.i32_t)),
            |runtime, frame| {
                let p = frame.arg(0).as_object().ok_or(AccessError::NotAReference)?;
                runtime.with_access(|ctx| {
                    let x = read_field(ctx, p, "x")?.as_int().unwrap_or_default();
                    let y = read_field(ctx, p, "y")?.as_int().unwrap_or_default();
                    Ok(Value::Int(x.abs() + y.abs()))
                })
            },
        ));
        let table = Value::Table(vec![
            (Value::from("x"), Value::Int(3)),
            (Value::from("y"), Value::Int(-4)),
        ]);
        let live_before = f.runtime.with_access(|ctx| ctx.mem.live_blocks());
        assert_eq!(invoke(&f.runtime, &norm, None, &[table]).unwrap(), Value::Int(7));
        let live_after = f.runtime.with_access(|ctx| ctx.mem.live_blocks());
        assert_eq!(live_before, live_after);
    }

    #[test]
    fn test_struct_return_is_written_to_caller_storage() {
        let f = fixture();
        let origin = Arc::new(NativeFunction::new(
            "make_point",
            FunctionIdentity::new(vec![], Some(f.point)),
            |runtime, frame| {
                let ret = frame.ret.ok_or(AccessError::Null("point".into()))?;
                runtime.with_access(|ctx| write_field(ctx, ret, "y", &Value::Int(9)))?;
                Ok(Value::Nil)
            },
        ));
        let result = invoke(&f.runtime, &origin, None, &[]).unwrap();
        let p = result.as_object().unwrap();
        assert_eq!(p.ty, f.point);
        let y = f.runtime.with_access(|ctx| read_field(ctx, p, "y")).unwrap();
        assert_eq!(y, Value::Int(9));
    }

    #[test]
    fn test_incompatible_reference_is_rejected() {
        let f = fixture();
        let take = Arc::new(NativeFunction::new(
            "take",
            FunctionIdentity::new(vec![Some(f.point)], None),
            |_, _| Ok(Value::Nil),
        ));
        let wrong = Value::Ref(ObjectRef::new(crate::memory::Address(0x1000), f.i32_t));
        let err = invoke(&f.runtime, &take, None, &[wrong]).unwrap_err();
        assert_eq!(err.category(), "InvocationError");
        assert!(err.to_string().contains("point expected"));
    }
}
