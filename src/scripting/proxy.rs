//! 脚本值转换与宿主对象代理
//!
//! 宿主对象在脚本中表现为 [`RefProxy`] userdata，类型表现为 [`TypeHandle`]。
//! 代理本身只保存地址和身份，所有读写都经访问调度完成，因此不持有
//! 任何宿主内存的借用。
//!
//! 运行时通过 `Lua::set_app_data` 挂在脚本状态上，回调里用 [`runtime`] 取回。

use crate::access::{
    self, displace, is_instance, marshal, refs_equal, AccessContext, ObjectRef, Value,
};
use crate::core::error::{AccessError, BridgeError, BridgeResult};
use crate::core::error_chain::ErrorChain;
use crate::core::runtime::Runtime;
use crate::fields::{self, container, union, CountMode};
use crate::types::{lifecycle, EnumKey, TypeId, TypeShape};
use mlua::{
    AnyUserData, Error as LuaError, Function, Lua, MetaMethod, MultiValue, Result as LuaResult,
    Table, UserData, UserDataMethods, Value as LuaValue, Variadic,
};
use std::sync::Arc;

/// 表转换的最大嵌套深度
const MAX_TABLE_DEPTH: usize = 32;

pub(crate) const REF_METHODS_KEY: &str = "struct_bridge.ref_methods";
pub(crate) const TYPE_METHODS_KEY: &str = "struct_bridge.type_methods";
pub(crate) const REF_NEXT_KEY: &str = "struct_bridge.ref_next";
pub(crate) const TYPE_NEXT_KEY: &str = "struct_bridge.type_next";
pub(crate) const LUA_IPAIRS_KEY: &str = "struct_bridge.lua_ipairs";

// ============================================================================
// 基础设施
// ============================================================================

/// 取回挂在脚本状态上的运行时
pub(crate) fn runtime(lua: &Lua) -> LuaResult<Arc<Runtime>> {
    lua.app_data_ref::<Arc<Runtime>>()
        .map(|rt| Arc::clone(&rt))
        .ok_or_else(|| LuaError::RuntimeError("bridge runtime is not attached".to_string()))
}

/// 把宿主错误转为脚本错误，错误链原样保留
#[track_caller]
pub(crate) fn raise(err: impl Into<BridgeError>) -> LuaError {
    LuaError::external(ErrorChain::from(err.into()))
}

/// 在访问上下文中执行，错误转为脚本错误
pub(crate) fn with_ctx<R>(
    lua: &Lua,
    f: impl FnOnce(&mut AccessContext<'_>) -> BridgeResult<R>,
) -> LuaResult<R> {
    let runtime = runtime(lua)?;
    runtime.with_access(f).map_err(raise)
}

// ============================================================================
// 值转换
// ============================================================================

/// 宿主值转脚本值
pub fn to_lua(lua: &Lua, value: Value) -> LuaResult<LuaValue> {
    Ok(match value {
        Value::Nil => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(b),
        Value::Int(i) => LuaValue::Integer(i),
        Value::Float(f) => LuaValue::Number(f),
        Value::Str(s) => LuaValue::String(lua.create_string(&s)?),
        Value::Ref(r) => LuaValue::UserData(lua.create_userdata(RefProxy(r))?),
        Value::Type(ty) => LuaValue::UserData(lua.create_userdata(TypeHandle(ty))?),
        Value::Table(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (k, v) in entries {
                table.raw_set(to_lua(lua, k)?, to_lua(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Method(method) => {
            let function = lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let runtime = runtime(lua)?;
                let args = values(lua, &args)?;
                let result = marshal::invoke(&runtime, &method.function, method.this, &args)
                    .map_err(raise)?;
                to_lua(lua, result)
            })?;
            LuaValue::Function(function)
        }
    })
}

/// 脚本值转宿主值
pub fn from_lua(lua: &Lua, value: &LuaValue) -> LuaResult<Value> {
    convert(lua, value, 0)
}

fn convert(lua: &Lua, value: &LuaValue, depth: usize) -> LuaResult<Value> {
    Ok(match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Int(*i),
        LuaValue::Number(n) => Value::Float(*n),
        LuaValue::String(s) => Value::Str(s.to_str()?.to_string()),
        LuaValue::Table(table) => {
            if depth >= MAX_TABLE_DEPTH {
                return Err(raise(AccessError::Expected("table nested less deeply")));
            }
            let mut entries = Vec::new();
            for pair in table.clone().pairs::<LuaValue, LuaValue>() {
                let (k, v) = pair?;
                entries.push((convert(lua, &k, depth + 1)?, convert(lua, &v, depth + 1)?));
            }
            // 数组部分按下标排序，便于按顺序赋值
            entries.sort_by_key(|(k, _)| match k {
                Value::Int(i) => (0, *i),
                _ => (1, 0),
            });
            Value::Table(entries)
        }
        LuaValue::UserData(ud) => {
            if let Ok(proxy) = ud.borrow::<RefProxy>() {
                Value::Ref(proxy.0)
            } else if let Ok(handle) = ud.borrow::<TypeHandle>() {
                Value::Type(handle.0)
            } else {
                return Err(raise(AccessError::NotAReference));
            }
        }
        _ => return Err(raise(AccessError::Expected("plain value or reference"))),
    })
}

/// 把参数列表转为宿主值
pub(crate) fn values(lua: &Lua, args: &[LuaValue]) -> LuaResult<Vec<Value>> {
    args.iter().map(|a| from_lua(lua, a)).collect()
}

// ============================================================================
// 对象操作（代理方法与 host 命名空间共用）
// ============================================================================

fn type_of(value: &Value) -> Option<TypeId> {
    match value {
        Value::Ref(r) => Some(r.ty),
        Value::Type(ty) => Some(*ty),
        _ => None,
    }
}

/// 类型大小；对引用同时返回地址
pub fn sizeof(ctx: &mut AccessContext<'_>, value: &Value) -> BridgeResult<(Value, Value)> {
    let ty = type_of(value).ok_or(AccessError::Expected("type or reference"))?;
    let size = ctx
        .types
        .byte_size(ty)
        .map_or(Value::Nil, |s| Value::Int(s as i64));
    let address = match value {
        Value::Ref(r) => Value::Int(r.address.0 as i64),
        _ => Value::Nil,
    };
    Ok((size, address))
}

/// 分配一个新对象；给出引用时复制其内容
pub fn new_object(ctx: &mut AccessContext<'_>, value: &Value) -> BridgeResult<ObjectRef> {
    let ty = type_of(value).ok_or(AccessError::Expected("type or reference"))?;
    let address = lifecycle::allocate(ctx.types, ctx.mem, ty)?;
    if matches!(value, Value::Ref(_)) {
        let src = access::get(ctx.types, value, None, false)?;
        if let Err(err) = lifecycle::copy(ctx.types, ctx.mem, address, src.address, ty) {
            lifecycle::destroy(ctx.types, ctx.mem, address, ty)?;
            return Err(err);
        }
    }
    Ok(ObjectRef::new(address, ty))
}

/// 销毁由 `new` 分配的对象；nil 返回 `false`
pub fn delete_object(ctx: &mut AccessContext<'_>, value: &Value) -> BridgeResult<bool> {
    if value.is_nil() {
        return Ok(false);
    }
    let obj = access::get(ctx.types, value, None, false)?;
    lifecycle::destroy(ctx.types, ctx.mem, obj.address, obj.ty)?;
    Ok(true)
}

/// 有序迭代的下一项
///
/// 结构体按声明顺序（基类在前）给出字段；容器给出 0 起的下标；
/// 位域给出位名。`key` 为 nil 或 -1 时从头开始。
pub fn next_entry(
    ctx: &mut AccessContext<'_>,
    obj: ObjectRef,
    key: &Value,
) -> BridgeResult<Option<(Value, Value)>> {
    let identity = ctx.types.get(obj.ty);
    match &identity.shape {
        TypeShape::Struct(_)
        | TypeShape::VirtualStruct(_)
        | TypeShape::Union(_)
        | TypeShape::Global(_) => {
            let binding = ctx.binding(obj.ty)?;
            let after = match key {
                Value::Nil => None,
                other => Some(other.as_str().ok_or(AccessError::Expected("field name"))?),
            };
            let Some(field) = binding.next_field(after) else {
                return Ok(None);
            };
            let name = field.name.clone();
            let value = fields::read_field(ctx, obj, &name)?;
            Ok(Some((Value::Str(name), value)))
        }
        TypeShape::Container(_) => {
            let next = match key {
                Value::Nil => 0,
                other => other.as_int().map_or(0, |i| (i + 1).max(0)) as usize,
            };
            if next >= container::count(ctx, obj, CountMode::Len)? {
                return Ok(None);
            }
            let item = container::read_item(ctx, obj, next)?;
            Ok(Some((Value::Int(next as i64), item)))
        }
        TypeShape::Bitfield(bits) => {
            let after = match key {
                Value::Nil => None,
                Value::Str(name) => match bits.find(name) {
                    Some(span) => Some(i64::from(span.shift)),
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
            let binding = ctx.binding(obj.ty)?;
            let Some(shift) = binding.next_value(ctx.types, after) else {
                return Ok(None);
            };
            let Some((name, _)) = u32::try_from(shift).ok().and_then(|s| bits.item_at(s)) else {
                return Ok(None);
            };
            let name = Value::Str(name.to_string());
            let value = fields::index(ctx, obj, &name)?;
            Ok(Some((name, value)))
        }
        _ => Ok(None),
    }
}

// ============================================================================
// 对象引用代理
// ============================================================================

/// 脚本中的宿主对象引用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefProxy(pub ObjectRef);

/// 结构体类引用上的字段优先于内置属性
fn has_field(ctx: &mut AccessContext<'_>, obj: ObjectRef, name: &str) -> BridgeResult<bool> {
    let identity = ctx.types.get(obj.ty);
    if !matches!(
        identity.shape,
        TypeShape::Struct(_) | TypeShape::VirtualStruct(_) | TypeShape::Union(_) | TypeShape::Global(_)
    ) {
        return Ok(false);
    }
    Ok(ctx.binding(obj.ty)?.field(name).is_some())
}

impl UserData for RefProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: LuaValue| {
            let obj = this.0;
            let key = from_lua(lua, &key)?;
            if let Some(name) = key.as_str() {
                if !with_ctx(lua, |ctx| has_field(ctx, obj, name))? {
                    match name {
                        "_type" => return to_lua(lua, Value::Type(obj.ty)),
                        "_kind" => {
                            let kind = with_ctx(lua, |ctx| Ok(ctx.types.get(obj.ty).kind().name()))?;
                            return Ok(LuaValue::String(lua.create_string(kind)?));
                        }
                        _ => {}
                    }
                    let builtins: Table = lua.named_registry_value(REF_METHODS_KEY)?;
                    let method: LuaValue = builtins.raw_get(name)?;
                    if !method.is_nil() {
                        return Ok(method);
                    }
                }
            }
            let value = with_ctx(lua, |ctx| fields::index(ctx, obj, &key))?;
            to_lua(lua, value)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (LuaValue, LuaValue)| {
                let key = from_lua(lua, &key)?;
                let value = from_lua(lua, &value)?;
                with_ctx(lua, |ctx| fields::set_index(ctx, this.0, &key, &value))
            },
        );

        methods.add_meta_method(MetaMethod::Len, |lua, this, ()| {
            with_ctx(lua, |ctx| container::count(ctx, this.0, CountMode::Len))
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let name = with_ctx(lua, |ctx| Ok(ctx.type_name(this.0.ty)))?;
            Ok(format!("<{}: {}>", name, this.0.address))
        });

        methods.add_meta_function(MetaMethod::Eq, |lua, (a, b): (AnyUserData, AnyUserData)| {
            let (Ok(a), Ok(b)) = (a.borrow::<RefProxy>(), b.borrow::<RefProxy>()) else {
                return Ok(false);
            };
            let (a, b) = (a.0, b.0);
            with_ctx(lua, |ctx| Ok(refs_equal(ctx.types, a, b)))
        });

        methods.add_meta_function(MetaMethod::Pairs, |lua, ud: AnyUserData| {
            let next: Function = lua.named_registry_value(REF_NEXT_KEY)?;
            Ok((next, ud, LuaValue::Nil))
        });
    }
}

fn proxy_of(ud: &AnyUserData) -> LuaResult<ObjectRef> {
    ud.borrow::<RefProxy>()
        .map(|p| p.0)
        .map_err(|_| raise(AccessError::NotAReference))
}

/// 注册代理共用的函数：内置方法表、迭代函数和替换后的 `ipairs`
pub(crate) fn install(lua: &Lua) -> LuaResult<()> {
    let methods = lua.create_table()?;

    methods.set(
        "_field",
        lua.create_function(|lua, (ud, name): (AnyUserData, String)| {
            let obj = proxy_of(&ud)?;
            let storage = with_ctx(lua, |ctx| fields::field_storage(ctx, obj, &name))?;
            to_lua(lua, storage.map_or(Value::Nil, Value::Ref))
        })?,
    )?;

    methods.set(
        "_union",
        lua.create_function(|lua, (ud, name): (AnyUserData, String)| {
            let obj = proxy_of(&ud)?;
            let resolution = with_ctx(lua, |ctx| union::resolve_union(ctx, obj, &name))?;
            let value = to_lua(lua, resolution.value())?;
            let issue = match resolution.issue_message() {
                Some(message) => LuaValue::String(lua.create_string(&message)?),
                None => LuaValue::Nil,
            };
            Ok((value, issue))
        })?,
    )?;

    methods.set(
        "_displace",
        lua.create_function(
            |lua, (ud, index, stride): (AnyUserData, i64, Option<usize>)| {
                let obj = proxy_of(&ud)?;
                let moved = with_ctx(lua, |ctx| displace(ctx.types, obj, index, stride))?;
                to_lua(lua, Value::Ref(moved))
            },
        )?,
    )?;

    methods.set(
        "sizeof",
        lua.create_function(|lua, ud: AnyUserData| {
            let value = Value::Ref(proxy_of(&ud)?);
            let (size, address) = with_ctx(lua, |ctx| sizeof(ctx, &value))?;
            Ok((to_lua(lua, size)?, to_lua(lua, address)?))
        })?,
    )?;

    methods.set(
        "new",
        lua.create_function(|lua, ud: AnyUserData| {
            let value = Value::Ref(proxy_of(&ud)?);
            let created = with_ctx(lua, |ctx| new_object(ctx, &value))?;
            to_lua(lua, Value::Ref(created))
        })?,
    )?;

    methods.set(
        "delete",
        lua.create_function(|lua, ud: AnyUserData| {
            let value = Value::Ref(proxy_of(&ud)?);
            with_ctx(lua, |ctx| delete_object(ctx, &value))
        })?,
    )?;

    methods.set(
        "assign",
        lua.create_function(|lua, (ud, source): (AnyUserData, LuaValue)| {
            let obj = proxy_of(&ud)?;
            let source = from_lua(lua, &source)?;
            with_ctx(lua, |ctx| fields::assign(ctx, obj, &source))
        })?,
    )?;

    methods.set(
        "resize",
        lua.create_function(|lua, (ud, len): (AnyUserData, usize)| {
            let obj = proxy_of(&ud)?;
            with_ctx(lua, |ctx| container::resize(ctx, obj, len))
        })?,
    )?;

    methods.set(
        "insert",
        lua.create_function(|lua, (ud, index, value): (AnyUserData, LuaValue, LuaValue)| {
            let obj = proxy_of(&ud)?;
            let index = from_lua(lua, &index)?;
            let value = from_lua(lua, &value)?;
            with_ctx(lua, |ctx| {
                let at = if index.as_str() == Some(container::APPEND_KEY) {
                    None
                } else {
                    Some(container::resolve_index(ctx, obj, &index)?)
                };
                container::insert(ctx, obj, at, &value)
            })
        })?,
    )?;

    methods.set(
        "erase",
        lua.create_function(|lua, (ud, index): (AnyUserData, LuaValue)| {
            let obj = proxy_of(&ud)?;
            let index = from_lua(lua, &index)?;
            with_ctx(lua, |ctx| {
                let at = container::resolve_index(ctx, obj, &index)?;
                container::erase(ctx, obj, at)
            })
        })?,
    )?;

    lua.set_named_registry_value(REF_METHODS_KEY, methods)?;

    let ref_next = lua.create_function(|lua, (ud, key): (AnyUserData, LuaValue)| {
        let obj = proxy_of(&ud)?;
        let key = from_lua(lua, &key)?;
        match with_ctx(lua, |ctx| next_entry(ctx, obj, &key))? {
            Some((k, v)) => Ok((to_lua(lua, k)?, to_lua(lua, v)?)),
            None => Ok((LuaValue::Nil, LuaValue::Nil)),
        }
    })?;
    lua.set_named_registry_value(REF_NEXT_KEY, ref_next)?;

    install_type_methods(lua)?;
    install_ipairs(lua)
}

/// 宿主容器的 `ipairs` 从下标 0 开始；其他值交给原来的 `ipairs`
fn install_ipairs(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    let original: Function = globals.get("ipairs")?;
    lua.set_named_registry_value(LUA_IPAIRS_KEY, original)?;

    let ipairs = lua.create_function(|lua, args: Variadic<LuaValue>| {
        if let Some(LuaValue::UserData(ud)) = args.first() {
            if let Ok(obj) = proxy_of(ud) {
                let is_container = with_ctx(lua, |ctx| {
                    Ok(matches!(ctx.types.get(obj.ty).shape, TypeShape::Container(_)))
                })?;
                if is_container {
                    let next: Function = lua.named_registry_value(REF_NEXT_KEY)?;
                    return Ok(MultiValue::from_vec(vec![
                        LuaValue::Function(next),
                        LuaValue::UserData(ud.clone()),
                        LuaValue::Integer(-1),
                    ]));
                }
            }
        }
        let original: Function = lua.named_registry_value(LUA_IPAIRS_KEY)?;
        original.call::<MultiValue>(MultiValue::from_vec(args.to_vec()))
    })?;
    globals.set("ipairs", ipairs)
}

// ============================================================================
// 类型句柄
// ============================================================================

/// 脚本中的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeHandle(pub TypeId);

fn enum_property(lua: &Lua, ty: TypeId, key: &Value) -> LuaResult<Option<LuaValue>> {
    let runtime = runtime(lua)?;
    let identity = runtime.types().get(ty);
    let Some(e) = identity.as_enum() else {
        return Ok(None);
    };
    let found = match key {
        Value::Str(name) => match name.as_str() {
            "_first_item" => e.first_item().map(Value::Int),
            "_last_item" => e.last_item().map(Value::Int),
            "attrs" => {
                let table = lua.create_table()?;
                for (value, attrs) in &e.attrs {
                    let inner = lua.create_table()?;
                    for (k, v) in attrs {
                        inner.set(k.as_str(), v.as_str())?;
                    }
                    table.raw_set(*value, inner)?;
                }
                return Ok(Some(LuaValue::Table(table)));
            }
            key => e.value_of(key).map(Value::Int),
        },
        other => match other.as_int().map(|v| e.key_of(v)) {
            Some(EnumKey::Named(name)) => Some(Value::Str(name.to_string())),
            _ => None,
        },
    };
    found.map(|v| to_lua(lua, v)).transpose()
}

impl UserData for TypeHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: LuaValue| {
            let key = from_lua(lua, &key)?;
            if key.as_str() == Some("_kind") {
                let runtime = runtime(lua)?;
                let kind = runtime.types().get(this.0).kind().name();
                return Ok(LuaValue::String(lua.create_string(kind)?));
            }
            if let Some(name) = key.as_str() {
                let builtins: Table = lua.named_registry_value(TYPE_METHODS_KEY)?;
                let method: LuaValue = builtins.raw_get(name)?;
                if !method.is_nil() {
                    return Ok(method);
                }
            }
            match enum_property(lua, this.0, &key)? {
                Some(value) => Ok(value),
                None => Ok(LuaValue::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let runtime = runtime(lua)?;
            Ok(format!("<type: {}>", runtime.types().name(this.0)))
        });

        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (AnyUserData, AnyUserData)| {
            Ok(match (a.borrow::<TypeHandle>(), b.borrow::<TypeHandle>()) {
                (Ok(a), Ok(b)) => a.0 == b.0,
                _ => false,
            })
        });

        methods.add_meta_function(MetaMethod::Pairs, |lua, ud: AnyUserData| {
            let next: Function = lua.named_registry_value(TYPE_NEXT_KEY)?;
            Ok((next, ud, LuaValue::Nil))
        });
    }
}

fn handle_of(ud: &AnyUserData) -> LuaResult<TypeId> {
    ud.borrow::<TypeHandle>()
        .map(|h| h.0)
        .map_err(|_| raise(AccessError::Expected("type")))
}

fn install_type_methods(lua: &Lua) -> LuaResult<()> {
    let methods = lua.create_table()?;

    methods.set(
        "sizeof",
        lua.create_function(|lua, ud: AnyUserData| {
            let value = Value::Type(handle_of(&ud)?);
            let (size, _) = with_ctx(lua, |ctx| sizeof(ctx, &value))?;
            to_lua(lua, size)
        })?,
    )?;

    methods.set(
        "new",
        lua.create_function(|lua, ud: AnyUserData| {
            let value = Value::Type(handle_of(&ud)?);
            let created = with_ctx(lua, |ctx| new_object(ctx, &value))?;
            to_lua(lua, Value::Ref(created))
        })?,
    )?;

    methods.set(
        "is_instance",
        lua.create_function(|lua, (ud, object): (AnyUserData, LuaValue)| {
            let ty = handle_of(&ud)?;
            let object = from_lua(lua, &object)?;
            with_ctx(lua, |ctx| Ok(is_instance(ctx, &object, ty)))
        })?,
    )?;

    lua.set_named_registry_value(TYPE_METHODS_KEY, methods)?;

    // 枚举按定义的值步进，跳过无名的值
    let type_next = lua.create_function(|lua, (ud, key): (AnyUserData, Option<i64>)| {
        let ty = handle_of(&ud)?;
        let item = with_ctx(lua, |ctx| {
            let binding = ctx.binding(ty)?;
            let identity = ctx.types.get(ty);
            let Some(e) = identity.as_enum() else {
                return Ok(None);
            };
            let mut after = key;
            while let Some(value) = binding.next_value(ctx.types, after) {
                if let EnumKey::Named(name) = e.key_of(value) {
                    return Ok(Some((value, name.to_string())));
                }
                after = Some(value);
            }
            Ok(None)
        })?;
        match item {
            Some((value, name)) => Ok((LuaValue::Integer(value), LuaValue::String(lua.create_string(&name)?))),
            None => Ok((LuaValue::Nil, LuaValue::Nil)),
        }
    })?;
    lua.set_named_registry_value(TYPE_NEXT_KEY, type_next)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        EnumIdentity, FieldDescriptor, PrimitiveKind, StructIdentity, TypeRegistry,
    };

    fn lua_with_runtime() -> (Lua, Arc<Runtime>, TypeId) {
        let mut b = TypeRegistry::builder();
        let i32_t = b.primitive(PrimitiveKind::I32);
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
        b.add(
            "color",
            TypeShape::Enum(
                EnumIdentity::contiguous(PrimitiveKind::I32, 0, &[Some("red"), None, Some("blue")])
                    .with_attr(2, "hex", "00f"),
            ),
        );
        let runtime = Runtime::builder().types(b.build().unwrap()).build().unwrap();
        let lua = Lua::new();
        lua.set_app_data(Arc::clone(&runtime));
        install(&lua).unwrap();
        (lua, runtime, point)
    }

    #[test]
    fn test_scalar_conversion() {
        let (lua, _rt, _) = lua_with_runtime();
        let v = to_lua(&lua, Value::from("abc")).unwrap();
        assert_eq!(from_lua(&lua, &v).unwrap(), Value::from("abc"));
        let v: LuaValue = lua.load("{ 10, 20, name = 'x' }").eval().unwrap();
        let Value::Table(entries) = from_lua(&lua, &v).unwrap() else {
            panic!("table expected");
        };
        assert_eq!(entries[0], (Value::Int(1), Value::Int(10)));
        assert_eq!(entries[1], (Value::Int(2), Value::Int(20)));
    }

    #[test]
    fn test_functions_are_not_convertible() {
        let (lua, _rt, _) = lua_with_runtime();
        let f: LuaValue = lua.load("function() end").eval().unwrap();
        assert!(from_lua(&lua, &f).is_err());
    }

    #[test]
    fn test_ref_proxy_fields_and_builtins() {
        let (lua, _rt, point) = lua_with_runtime();
        lua.globals()
            .set("point", to_lua(&lua, Value::Type(point)).unwrap())
            .unwrap();
        let (x, kind, size, names): (i64, String, i64, String) = lua
            .load(
                r#"
                local p = point:new()
                p.x = 3
                p.y = p.x + 1
                local names = {}
                for k, v in pairs(p) do names[#names + 1] = k .. "=" .. v end
                local size = p:sizeof()
                local x = p.x
                p:delete()
                return x, p._kind, size, table.concat(names, ",")
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(x, 3);
        assert_eq!(kind, "struct-type");
        assert_eq!(size, 8);
        assert_eq!(names, "x=3,y=4");
    }

    #[test]
    fn test_unknown_field_raises_access_error() {
        let (lua, _rt, point) = lua_with_runtime();
        lua.globals()
            .set("point", to_lua(&lua, Value::Type(point)).unwrap())
            .unwrap();
        let err = lua
            .load("local p = point:new(); p.z = 1")
            .exec()
            .unwrap_err();
        let chain = ErrorChain::from_lua(&err);
        assert!(chain.has_category("AccessError"));
    }

    #[test]
    fn test_enum_type_handle() {
        let (lua, rt, _) = lua_with_runtime();
        let color = rt.types().lookup("color").unwrap();
        lua.globals()
            .set("color", to_lua(&lua, Value::Type(color)).unwrap())
            .unwrap();
        let (blue, name, first, last, hex, listed): (i64, String, i64, i64, String, String) = lua
            .load(
                r#"
                local listed = {}
                for v, k in pairs(color) do listed[#listed + 1] = v .. ":" .. k end
                return color.blue, color[0], color._first_item, color._last_item,
                    color.attrs[2].hex, table.concat(listed, ",")
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(blue, 2);
        assert_eq!(name, "red");
        assert_eq!((first, last), (0, 2));
        assert_eq!(hex, "00f");
        assert_eq!(listed, "0:red,2:blue");
        let unnamed: LuaValue = lua.load("return color[1]").eval().unwrap();
        assert!(unnamed.is_nil());
    }

    #[test]
    fn test_ipairs_falls_back_for_plain_tables() {
        let (lua, _rt, _) = lua_with_runtime();
        let sum: i64 = lua
            .load("local s = 0; for i, v in ipairs({4, 5, 6}) do s = s + i * v end; return s")
            .eval()
            .unwrap();
        assert_eq!(sum, 4 + 10 + 18);
    }
}
