//! 字段访问器
//!
//! 每个字段在绑定时按模式生成一个 [`FieldAccessor`]，之后的读写都经由
//! 访问器完成，分发路径上不再做偏移运算之外的判断。模式的匹配是穷尽的，
//! 结束标记没有访问器，遇到时返回 [`AccessError::UnhandledMode`]。

use super::{assign, read_value, write_pointer, write_value};
use crate::access::{AccessContext, BoundMethod, ObjectRef, Value};
use crate::binding::BindingCache;
use crate::core::error::{AccessError, BridgeResult};
use crate::types::primitive::{read_fixed_string, write_fixed_string};
use crate::types::{FieldDescriptor, FieldMode, NativeFunction, TypeId, TypeRegistry};
use std::sync::Arc;

/// 单个字段的读写
pub trait FieldAccessor: Send + Sync {
    fn mode(&self) -> FieldMode;

    /// 读取 `owner` 对象中的该字段
    fn read(&self, ctx: &mut AccessContext<'_>, owner: ObjectRef) -> BridgeResult<Value>;

    /// 写入 `owner` 对象中的该字段
    fn write(&self, ctx: &mut AccessContext<'_>, owner: ObjectRef, value: &Value)
        -> BridgeResult<()>;

    /// 指向字段存储本身的引用；方法字段没有存储
    fn storage(&self, owner: ObjectRef) -> Option<ObjectRef>;
}

/// 按字段模式生成访问器
pub fn build_accessor(
    types: &TypeRegistry,
    cache: &BindingCache,
    owner: TypeId,
    index: u32,
    field: &FieldDescriptor,
) -> BridgeResult<Box<dyn FieldAccessor>> {
    let unhandled = || AccessError::UnhandledMode {
        mode: field.mode.to_string(),
        type_name: types.name(owner),
        field: field.name.clone(),
    };
    let offset = field.offset;
    let accessor: Box<dyn FieldAccessor> = match field.mode {
        FieldMode::Primitive => Box::new(ValueAccessor {
            mode: FieldMode::Primitive,
            offset,
            ty: field.ty.ok_or_else(unhandled)?,
        }),
        FieldMode::Substruct => Box::new(ValueAccessor {
            mode: FieldMode::Substruct,
            offset,
            ty: field.ty.ok_or_else(unhandled)?,
        }),
        FieldMode::Container => Box::new(ValueAccessor {
            mode: FieldMode::Container,
            offset,
            ty: field.ty.ok_or_else(unhandled)?,
        }),
        FieldMode::FixedString => Box::new(FixedStringAccessor {
            offset,
            capacity: field.count,
            storage_ty: cache.adhoc_identity(types, owner, index, field)?,
        }),
        FieldMode::Pointer => {
            let pointer_ty = match field.ty {
                Some(t) => types.lookup(&format!("{}*", types.name(t))),
                None => types.lookup("void*"),
            };
            Box::new(PointerAccessor {
                offset,
                target: field.ty,
                owns_target: field.owns_target(),
                pointer_ty,
            })
        }
        FieldMode::FixedArray | FieldMode::PointerVectorLegacy => Box::new(ValueAccessor {
            mode: field.mode,
            offset,
            ty: cache.adhoc_identity(types, owner, index, field)?,
        }),
        FieldMode::ObjectMethod | FieldMode::ClassMethod => Box::new(MethodAccessor {
            mode: field.mode,
            function: field.method.clone().ok_or_else(unhandled)?,
        }),
        FieldMode::End => return Err(unhandled().into()),
    };
    Ok(accessor)
}

// ============================================================================
// 访问器实现
// ============================================================================

/// 按字段类型整体读写：基本类型、子结构体、容器与合成容器
struct ValueAccessor {
    mode: FieldMode,
    offset: usize,
    ty: TypeId,
}

impl FieldAccessor for ValueAccessor {
    fn mode(&self) -> FieldMode {
        self.mode
    }

    fn read(&self, ctx: &mut AccessContext<'_>, owner: ObjectRef) -> BridgeResult<Value> {
        let at = ObjectRef::new(owner.address.offset(self.offset), self.ty);
        match self.mode {
            FieldMode::Primitive => read_value(ctx, at),
            _ => Ok(Value::Ref(at)),
        }
    }

    fn write(
        &self,
        ctx: &mut AccessContext<'_>,
        owner: ObjectRef,
        value: &Value,
    ) -> BridgeResult<()> {
        let at = ObjectRef::new(owner.address.offset(self.offset), self.ty);
        match self.mode {
            FieldMode::Primitive => write_value(ctx, at, value),
            _ => assign(ctx, at, value),
        }
    }

    fn storage(&self, owner: ObjectRef) -> Option<ObjectRef> {
        Some(ObjectRef::new(owner.address.offset(self.offset), self.ty))
    }
}

/// 定长字符缓冲区
struct FixedStringAccessor {
    offset: usize,
    capacity: usize,
    storage_ty: TypeId,
}

impl FieldAccessor for FixedStringAccessor {
    fn mode(&self) -> FieldMode {
        FieldMode::FixedString
    }

    fn read(&self, ctx: &mut AccessContext<'_>, owner: ObjectRef) -> BridgeResult<Value> {
        let text = read_fixed_string(&*ctx.mem, owner.address.offset(self.offset), self.capacity)?;
        Ok(Value::Str(text))
    }

    fn write(
        &self,
        ctx: &mut AccessContext<'_>,
        owner: ObjectRef,
        value: &Value,
    ) -> BridgeResult<()> {
        let text = value.as_str().ok_or(AccessError::Expected("string"))?;
        write_fixed_string(ctx.mem, owner.address.offset(self.offset), self.capacity, text)?;
        Ok(())
    }

    fn storage(&self, owner: ObjectRef) -> Option<ObjectRef> {
        Some(ObjectRef::new(owner.address.offset(self.offset), self.storage_ty))
    }
}

/// 指针字段
struct PointerAccessor {
    offset: usize,
    target: Option<TypeId>,
    owns_target: bool,
    /// 已注册的指针身份，用于 `_field`
    pointer_ty: Option<TypeId>,
}

impl FieldAccessor for PointerAccessor {
    fn mode(&self) -> FieldMode {
        FieldMode::Pointer
    }

    fn read(&self, ctx: &mut AccessContext<'_>, owner: ObjectRef) -> BridgeResult<Value> {
        let slot = owner.address.offset(self.offset);
        match self.target {
            Some(target) => Ok(ctx
                .deref_pointer(slot, target)?
                .map_or(Value::Nil, Value::Ref)),
            None => {
                let raw = ctx.mem.read_ptr(slot)?;
                Ok(if raw.is_null() {
                    Value::Nil
                } else {
                    Value::Int(raw.0 as i64)
                })
            }
        }
    }

    fn write(
        &self,
        ctx: &mut AccessContext<'_>,
        owner: ObjectRef,
        value: &Value,
    ) -> BridgeResult<()> {
        write_pointer(
            ctx,
            owner.address.offset(self.offset),
            self.target,
            self.owns_target,
            value,
        )
    }

    fn storage(&self, owner: ObjectRef) -> Option<ObjectRef> {
        self.pointer_ty
            .map(|ty| ObjectRef::new(owner.address.offset(self.offset), ty))
    }
}

/// 对象方法与类方法
struct MethodAccessor {
    mode: FieldMode,
    function: Arc<NativeFunction>,
}

impl FieldAccessor for MethodAccessor {
    fn mode(&self) -> FieldMode {
        self.mode
    }

    fn read(&self, _ctx: &mut AccessContext<'_>, owner: ObjectRef) -> BridgeResult<Value> {
        let this = match self.mode {
            FieldMode::ObjectMethod => Some(owner),
            _ => None,
        };
        Ok(Value::Method(BoundMethod {
            function: self.function.clone(),
            this,
        }))
    }

    fn write(
        &self,
        _ctx: &mut AccessContext<'_>,
        _owner: ObjectRef,
        _value: &Value,
    ) -> BridgeResult<()> {
        Err(AccessError::ReadOnly(self.function.name.clone()).into())
    }

    fn storage(&self, _owner: ObjectRef) -> Option<ObjectRef> {
        None
    }
}
