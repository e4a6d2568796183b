//! 对象引用与访问分发
//!
//! 脚本侧拿到的宿主对象一律是 [`ObjectRef`]（地址 + 身份）。本模块提供
//! 对引用的基本操作：取出、兼容性判断、重解释、位移、相等比较，以及
//! 多态指针的实际类型解析。所有操作都拒绝调试分配器的毒化地址，不会
//! 尝试解引用它。

pub mod marshal;
pub mod value;

pub use value::{BoundMethod, ObjectRef, Value};

use crate::binding::{Binding, BindingCache, BindingKey};
use crate::core::error::{AccessError, BridgeResult, TypeMismatchError};
use crate::core::runtime::GlobalSymbols;
use crate::memory::{Address, HostMemory};
use crate::types::virtual_table::resolve_class;
use crate::types::{ClassResolution, ContainerKind, TypeId, TypeRegistry, TypeShape};
use std::sync::Arc;

/// 一次访问操作所需的上下文
///
/// 由 [`Runtime::with_access`](crate::core::runtime::Runtime::with_access)
/// 构造，构造期间持有挂起锁和内存锁。
pub struct AccessContext<'a> {
    pub types: &'a TypeRegistry,
    pub bindings: &'a BindingCache,
    pub mem: &'a mut dyn HostMemory,
    pub globals: &'a GlobalSymbols,
}

impl<'a> AccessContext<'a> {
    /// 取类型的绑定，首次访问时构建
    pub fn binding(&mut self, ty: TypeId) -> BridgeResult<Arc<Binding>> {
        self.bindings.get_or_build(self.types, BindingKey::Type(ty))
    }

    pub fn type_name(&self, ty: TypeId) -> String {
        self.types.name(ty)
    }

    /// 解析 `address` 处对象的实际类型
    ///
    /// 非多态类型直接返回声明类型；多态类型找不到合法子类时报
    /// [`AccessError::UnknownSubclass`]。
    pub fn resolve_class(&self, address: Address, declared: TypeId) -> Result<TypeId, AccessError> {
        let identity = self.types.get(declared);
        let TypeShape::VirtualStruct(s) = &identity.shape else {
            return Ok(declared);
        };
        let is_leaf = s.dispatch.is_none() && !self.types.has_children(declared);
        let resolution = resolve_class(
            self.types.virtual_table(),
            &*self.mem,
            address,
            declared,
            is_leaf,
            |found, base| self.types.is_subclass(found, base),
        )?;
        match resolution {
            ClassResolution::Known(id) | ClassResolution::Assumed(id) => Ok(id),
            ClassResolution::Unknown(dispatch) => Err(AccessError::UnknownSubclass {
                declared: identity.name.clone(),
                dispatch,
            }),
        }
    }

    /// 读取指针并构造指向目标的引用；空指针返回 `None`
    pub fn deref_pointer(
        &self,
        slot: Address,
        target: TypeId,
    ) -> Result<Option<ObjectRef>, AccessError> {
        let pointee = self.mem.read_ptr(slot)?;
        if pointee.is_null() {
            return Ok(None);
        }
        if pointee.is_uninit() {
            return Err(AccessError::Uninitialized(pointee));
        }
        let ty = self.resolve_class(pointee, target)?;
        Ok(Some(ObjectRef::new(pointee, ty)))
    }
}

/// 检查地址不是毒化值
pub fn check_address(address: Address) -> Result<Address, AccessError> {
    if address.is_uninit() {
        Err(AccessError::Uninitialized(address))
    } else {
        Ok(address)
    }
}

/// 从脚本值中取出引用
///
/// 只有桥接层自己构造的引用能被取出；给出 `expected` 时还要求兼容。
pub fn get(
    types: &TypeRegistry,
    value: &Value,
    expected: Option<TypeId>,
    exact: bool,
) -> BridgeResult<ObjectRef> {
    let reference = value.as_object().ok_or(AccessError::NotAReference)?;
    check_address(reference.address)?;
    if let Some(expected) = expected {
        if !compatible(types, expected, reference.ty, exact) {
            return Err(TypeMismatchError::Expected {
                expected: types.name(expected),
                actual: types.name(reference.ty),
            }
            .into());
        }
    }
    Ok(reference)
}

/// `b` 的值能否当作 `a` 使用
///
/// - 同一身份总是兼容
/// - 指针兼容当且仅当目标兼容；非精确模式下 void 指针接受任何指针
/// - 定长缓冲要求元素兼容且长度相同
/// - 结构体在非精确模式下要求 `b` 是 `a` 的子类，关系不对称
pub fn compatible(types: &TypeRegistry, a: TypeId, b: TypeId, exact: bool) -> bool {
    if a == b {
        return true;
    }
    let (ia, ib) = (types.get(a), types.get(b));
    match (&ia.shape, &ib.shape) {
        (TypeShape::Pointer { target: ta }, TypeShape::Pointer { target: tb }) => {
            match (ta, tb) {
                (Some(ta), Some(tb)) => compatible(types, *ta, *tb, exact),
                (None, _) => !exact,
                (Some(_), None) => false,
            }
        }
        (TypeShape::Container(ca), TypeShape::Container(cb)) => match (ca.kind, cb.kind) {
            (ContainerKind::FixedBuffer { len: la }, ContainerKind::FixedBuffer { len: lb }) => {
                la == lb
                    && match (ca.item, cb.item) {
                        (Some(x), Some(y)) => compatible(types, x, y, exact),
                        _ => false,
                    }
            }
            _ => false,
        },
        (
            TypeShape::Struct(_) | TypeShape::VirtualStruct(_),
            TypeShape::Struct(_) | TypeShape::VirtualStruct(_),
        ) => !exact && types.is_subclass(b, a),
        _ => false,
    }
}

/// 把地址或引用重解释为 `target` 类型，不访问内存；空地址返回 `None`
pub fn cast(types: &TypeRegistry, target: TypeId, value: &Value) -> BridgeResult<Option<ObjectRef>> {
    let address = match value {
        Value::Ref(r) => r.address,
        Value::Int(raw) => Address(*raw as u64),
        Value::Nil => return Ok(None),
        other => {
            return Err(TypeMismatchError::Cast {
                from: other.type_name().to_string(),
                to: types.name(target),
            }
            .into())
        }
    };
    check_address(address)?;
    if address.is_null() {
        return Ok(None);
    }
    Ok(Some(ObjectRef::new(address, target)))
}

/// 返回位于 `address + index * stride` 的新引用，步长默认为类型大小
pub fn displace(
    types: &TypeRegistry,
    reference: ObjectRef,
    index: i64,
    stride: Option<usize>,
) -> BridgeResult<ObjectRef> {
    check_address(reference.address)?;
    let stride = match stride {
        Some(s) => s,
        None => types
            .byte_size(reference.ty)
            .ok_or_else(|| AccessError::Unsized(types.name(reference.ty)))?,
    };
    let delta = index
        .checked_mul(stride as i64)
        .ok_or(AccessError::InvalidIndex {
            type_name: types.name(reference.ty),
            index: index.to_string(),
        })?;
    let address = reference
        .address
        .checked_displace(delta)
        .ok_or(AccessError::InvalidIndex {
            type_name: types.name(reference.ty),
            index: index.to_string(),
        })?;
    check_address(address)?;
    Ok(ObjectRef::new(address, reference.ty))
}

/// 引用相等：同一地址且身份在任一方向上兼容
pub fn refs_equal(types: &TypeRegistry, a: ObjectRef, b: ObjectRef) -> bool {
    a.address == b.address
        && (compatible(types, a.ty, b.ty, false) || compatible(types, b.ty, a.ty, false))
}

/// 值是否是 `ty` 的实例
pub fn is_instance(ctx: &AccessContext<'_>, value: &Value, ty: TypeId) -> bool {
    let Some(reference) = value.as_object() else {
        return false;
    };
    if compatible(ctx.types, ty, reference.ty, false) {
        return true;
    }
    // 引用声明为基类时按实际类型判断
    match ctx.resolve_class(reference.address, reference.ty) {
        Ok(actual) => ctx.types.is_subclass(actual, ty),
        Err(_) => false,
    }
}
