//! 字段、联合体与容器的读写
//!
//! - [`read_field`]/[`write_field`] 按名字经绑定中的访问器读写字段
//! - [`index`]/[`set_index`] 是脚本侧下标操作的统一入口，按对象种类分派
//! - [`read_value`]/[`write_value`]/[`assign`] 处理任意类型的整体读写
//! - `union` 解析带标签的联合体，`container` 实现容器的增删改查

pub mod accessor;
pub mod container;
pub mod union;

pub use accessor::FieldAccessor;
pub use container::CountMode;
pub use union::{UnionResolution, UnionState};

use crate::access::{compatible, is_instance, AccessContext, ObjectRef, Value};
use crate::binding::{Binding, BoundField};
use crate::core::error::{AccessError, BridgeError, BridgeResult, FieldOp, TypeMismatchError};
use crate::memory::Address;
use crate::types::{lifecycle, TypeId, TypeKind, TypeShape};

/// 位域中代表整体数值的伪字段
pub const WHOLE_FIELD: &str = "whole";

/// 标量引用上代表值本身的伪字段
pub const VALUE_FIELD: &str = "value";

fn no_such_field(binding: &Binding, name: &str) -> BridgeError {
    AccessError::NoSuchField {
        type_name: binding.type_name.clone(),
        name: name.to_string(),
    }
    .into()
}

/// 字段所在对象的基址；全局集合按字段名从符号表解析
fn field_owner(
    ctx: &AccessContext<'_>,
    binding: &Binding,
    owner: ObjectRef,
    field: &BoundField,
) -> Result<ObjectRef, AccessError> {
    if binding.kind == TypeKind::Global {
        let address = ctx.globals.resolve(&field.descriptor.name)?;
        return Ok(ObjectRef::new(address, owner.ty));
    }
    Ok(owner)
}

/// 按名字读取字段
pub fn read_field(ctx: &mut AccessContext<'_>, owner: ObjectRef, name: &str) -> BridgeResult<Value> {
    let binding = ctx.binding(owner.ty)?;
    let field = binding
        .field(name)
        .ok_or_else(|| no_such_field(&binding, name))?;
    let result = field_owner(ctx, &binding, owner, field)
        .map_err(BridgeError::from)
        .and_then(|base| field.accessor.read(ctx, base));
    result.map_err(|e| AccessError::field(FieldOp::Read, &binding.type_name, name, e).into())
}

/// 按名字写入字段
pub fn write_field(
    ctx: &mut AccessContext<'_>,
    owner: ObjectRef,
    name: &str,
    value: &Value,
) -> BridgeResult<()> {
    let binding = ctx.binding(owner.ty)?;
    let field = binding
        .field(name)
        .ok_or_else(|| no_such_field(&binding, name))?;
    let result = field_owner(ctx, &binding, owner, field)
        .map_err(BridgeError::from)
        .and_then(|base| field.accessor.write(ctx, base, value));
    result.map_err(|e| AccessError::field(FieldOp::Write, &binding.type_name, name, e).into())
}

/// 字段存储本身的引用
pub fn field_storage(
    ctx: &mut AccessContext<'_>,
    owner: ObjectRef,
    name: &str,
) -> BridgeResult<Option<ObjectRef>> {
    let binding = ctx.binding(owner.ty)?;
    let field = binding
        .field(name)
        .ok_or_else(|| no_such_field(&binding, name))?;
    let base = field_owner(ctx, &binding, owner, field)?;
    Ok(field.accessor.storage(base))
}

// ============================================================================
// 下标分派
// ============================================================================

/// 脚本侧 `obj[key]`
pub fn index(ctx: &mut AccessContext<'_>, obj: ObjectRef, key: &Value) -> BridgeResult<Value> {
    let identity = ctx.types.get(obj.ty);
    match &identity.shape {
        TypeShape::Struct(_)
        | TypeShape::VirtualStruct(_)
        | TypeShape::Union(_)
        | TypeShape::Global(_) => {
            let name = key.as_str().ok_or_else(|| AccessError::InvalidIndex {
                type_name: identity.name.clone(),
                index: describe_key(key),
            })?;
            read_field(ctx, obj, name)
        }
        TypeShape::Container(_) => {
            let i = container::resolve_index(ctx, obj, key)?;
            container::read_item(ctx, obj, i)
        }
        TypeShape::Bitfield(b) => {
            let name = key.as_str().unwrap_or_default();
            let whole = b.base.read_integer(&*ctx.mem, obj.address)? as u64;
            if name == WHOLE_FIELD {
                return Ok(Value::Int(whole as i64));
            }
            let span = b.find(name).ok_or_else(|| AccessError::NoSuchField {
                type_name: identity.name.clone(),
                name: describe_key(key),
            })?;
            let bits = span.extract(whole);
            Ok(if span.size == 1 {
                Value::Bool(bits != 0)
            } else {
                Value::Int(bits as i64)
            })
        }
        _ if key.as_str() == Some(VALUE_FIELD) => read_value(ctx, obj),
        _ => Err(AccessError::NoSuchField {
            type_name: identity.name.clone(),
            name: describe_key(key),
        }
        .into()),
    }
}

/// 脚本侧 `obj[key] = value`
pub fn set_index(
    ctx: &mut AccessContext<'_>,
    obj: ObjectRef,
    key: &Value,
    value: &Value,
) -> BridgeResult<()> {
    let identity = ctx.types.get(obj.ty);
    match &identity.shape {
        TypeShape::Struct(_)
        | TypeShape::VirtualStruct(_)
        | TypeShape::Union(_)
        | TypeShape::Global(_) => {
            let name = key.as_str().ok_or_else(|| AccessError::InvalidIndex {
                type_name: identity.name.clone(),
                index: describe_key(key),
            })?;
            write_field(ctx, obj, name, value)
        }
        TypeShape::Container(_) => {
            if key.as_str() == Some(container::APPEND_KEY) {
                return container::insert(ctx, obj, None, value);
            }
            let i = container::resolve_index(ctx, obj, key)?;
            container::write_item(ctx, obj, i, value)
        }
        TypeShape::Bitfield(b) => {
            let name = key.as_str().unwrap_or_default();
            if name == WHOLE_FIELD {
                let whole = value.as_int().ok_or(AccessError::Expected("integer"))?;
                b.base.write_integer(ctx.mem, obj.address, whole)?;
                return Ok(());
            }
            let span = b.find(name).ok_or_else(|| AccessError::NoSuchField {
                type_name: identity.name.clone(),
                name: describe_key(key),
            })?;
            let bits = match value {
                Value::Bool(flag) => *flag as u64,
                Value::Nil => 0,
                other => other.as_int().ok_or(AccessError::Expected("boolean or number"))? as u64,
            };
            let whole = b.base.read_integer(&*ctx.mem, obj.address)? as u64;
            b.base
                .write_integer(ctx.mem, obj.address, span.insert(whole, bits) as i64)?;
            Ok(())
        }
        _ if key.as_str() == Some(VALUE_FIELD) => write_value(ctx, obj, value),
        _ => Err(AccessError::NoSuchField {
            type_name: identity.name.clone(),
            name: describe_key(key),
        }
        .into()),
    }
}

pub(crate) fn describe_key(key: &Value) -> String {
    match key {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        other => other.type_name().to_string(),
    }
}

// ============================================================================
// 整体读写
// ============================================================================

/// 读取 `obj` 处的值：标量转为脚本值，指针解引用，其余返回引用
pub fn read_value(ctx: &mut AccessContext<'_>, obj: ObjectRef) -> BridgeResult<Value> {
    let identity = ctx.types.get(obj.ty);
    let value = match &identity.shape {
        TypeShape::Primitive(p) => p.read(&*ctx.mem, obj.address)?,
        TypeShape::Enum(e) => Value::Int(e.base.read_integer(&*ctx.mem, obj.address)?),
        TypeShape::Pointer { target: Some(t) } => ctx
            .deref_pointer(obj.address, *t)?
            .map_or(Value::Nil, Value::Ref),
        TypeShape::Pointer { target: None } | TypeShape::Function(_) => {
            let raw = ctx.mem.read_ptr(obj.address)?;
            if raw.is_null() {
                Value::Nil
            } else {
                Value::Int(raw.0 as i64)
            }
        }
        _ => Value::Ref(obj),
    };
    Ok(value)
}

/// 向 `obj` 处写入值
pub fn write_value(ctx: &mut AccessContext<'_>, obj: ObjectRef, value: &Value) -> BridgeResult<()> {
    let identity = ctx.types.get(obj.ty);
    match &identity.shape {
        TypeShape::Primitive(p) => p.write(ctx.mem, obj.address, value)?,
        TypeShape::Enum(e) => {
            let raw = match value {
                Value::Str(key) => e.value_of(key).ok_or_else(|| AccessError::InvalidIndex {
                    type_name: identity.name.clone(),
                    index: key.clone(),
                })?,
                other => other.as_int().ok_or(AccessError::Expected("integer"))?,
            };
            e.base.write_integer(ctx.mem, obj.address, raw)?;
        }
        TypeShape::Bitfield(b) => match value {
            Value::Table(_) | Value::Ref(_) => assign(ctx, obj, value)?,
            other => {
                let whole = other.as_int().ok_or(AccessError::Expected("integer"))?;
                b.base.write_integer(ctx.mem, obj.address, whole)?;
            }
        },
        TypeShape::Pointer { target } => write_pointer(ctx, obj.address, *target, false, value)?,
        TypeShape::Function(_) | TypeShape::Opaque | TypeShape::Global(_) => {
            return Err(AccessError::ReadOnly(identity.name.clone()).into())
        }
        _ => assign(ctx, obj, value)?,
    }
    Ok(())
}

/// 整体赋值：兼容引用做深拷贝，表逐项赋值
pub fn assign(ctx: &mut AccessContext<'_>, dst: ObjectRef, value: &Value) -> BridgeResult<()> {
    let identity = ctx.types.get(dst.ty);
    match value {
        Value::Ref(src) => {
            if !compatible(ctx.types, dst.ty, src.ty, false) {
                return Err(TypeMismatchError::Assign {
                    from: ctx.types.name(src.ty),
                    to: identity.name.clone(),
                }
                .into());
            }
            lifecycle::copy(ctx.types, ctx.mem, dst.address, src.address, dst.ty)
        }
        Value::Table(entries) => match &identity.shape {
            TypeShape::Struct(_)
            | TypeShape::VirtualStruct(_)
            | TypeShape::Union(_)
            | TypeShape::Global(_)
            | TypeShape::Bitfield(_) => {
                for (key, item) in entries {
                    set_index(ctx, dst, key, item)?;
                }
                Ok(())
            }
            TypeShape::Container(_) => {
                for (key, item) in entries {
                    set_index(ctx, dst, &container_key(key), item)?;
                }
                Ok(())
            }
            _ => Err(TypeMismatchError::Assign {
                from: value.type_name().to_string(),
                to: identity.name.clone(),
            }
            .into()),
        },
        scalar => match &identity.shape {
            TypeShape::Primitive(_)
            | TypeShape::Enum(_)
            | TypeShape::Bitfield(_)
            | TypeShape::Pointer { .. } => write_value(ctx, dst, scalar),
            _ => Err(TypeMismatchError::Assign {
                from: scalar.type_name().to_string(),
                to: identity.name.clone(),
            }
            .into()),
        },
    }
}

/// 脚本表的数组部分从 1 开始，容器下标从 0 开始
fn container_key(key: &Value) -> Value {
    match key.as_int() {
        Some(i) if !matches!(key, Value::Str(_)) => Value::Int(i - 1),
        _ => key.clone(),
    }
}

/// 写指针槽
///
/// 接受 nil、兼容引用、void 指针上的整数地址，以及 `{new = true, ...}`：
/// 后者分配一个新的目标对象并把其余表项赋给它。`owns_target` 为真时
/// 被替换的旧目标会被销毁。
pub fn write_pointer(
    ctx: &mut AccessContext<'_>,
    slot: Address,
    target: Option<TypeId>,
    owns_target: bool,
    value: &Value,
) -> BridgeResult<()> {
    let fresh = match value {
        Value::Nil => Address::NULL,
        Value::Ref(r) => match target {
            Some(t) if compatible(ctx.types, t, r.ty, false) || is_instance(ctx, value, t) => {
                r.address
            }
            None => r.address,
            Some(t) => {
                return Err(TypeMismatchError::Assign {
                    from: ctx.types.name(r.ty),
                    to: format!("{}*", ctx.types.name(t)),
                }
                .into())
            }
        },
        Value::Int(raw) if target.is_none() => Address(*raw as u64),
        Value::Table(entries) => {
            let Some(t) = target else {
                return Err(AccessError::Expected("reference").into());
            };
            let wants_new = value.table_get("new").map_or(false, Value::truthy);
            let rest = Value::Table(
                entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != Some("new"))
                    .cloned()
                    .collect(),
            );
            if !wants_new {
                // 赋给现有目标
                let existing = ctx
                    .deref_pointer(slot, t)?
                    .ok_or_else(|| AccessError::Null(ctx.types.name(t)))?;
                return assign(ctx, existing, &rest);
            }
            let created = lifecycle::allocate(ctx.types, ctx.mem, t)?;
            if let Err(e) = assign(ctx, ObjectRef::new(created, t), &rest) {
                lifecycle::destroy(ctx.types, ctx.mem, created, t)?;
                return Err(e);
            }
            created
        }
        _ => return Err(AccessError::Expected("reference").into()),
    };
    crate::access::check_address(fresh)?;

    if owns_target {
        if let Some(t) = target {
            let old = ctx.mem.read_ptr(slot)?;
            if old != fresh && !old.is_null() && !old.is_uninit() {
                lifecycle::destroy(ctx.types, ctx.mem, old, t)?;
            }
        }
    }
    ctx.mem.write_ptr(slot, fresh)?;
    Ok(())
}

#[cfg(test)]
mod tests;
