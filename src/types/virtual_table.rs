//! 多态结构体的实际类型解析
//!
//! 多态对象在偏移 0 处存放虚表指针。注册表冻结时为每个声明了虚表地址的
//! 类型建立 `地址 -> 类型` 索引；运行时读取对象头部，按索引找回实际类型。

use super::registry::SchemaError;
use super::{TypeId, TypeIdentity, TypeShape};
use crate::memory::{Address, HostMemory, MemoryError};
use std::collections::HashMap;
use std::sync::Arc;

/// 虚表地址
pub type DispatchPtr = Address;

/// 解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassResolution {
    /// 通过虚表找到的实际类型
    Known(TypeId),
    /// 声明类型没有虚表也没有子类，直接采用声明类型
    Assumed(TypeId),
    /// 无法确定
    Unknown(DispatchPtr),
}

impl ClassResolution {
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            ClassResolution::Known(id) | ClassResolution::Assumed(id) => Some(*id),
            ClassResolution::Unknown(_) => None,
        }
    }
}

/// 虚表索引
#[derive(Debug, Clone, Default)]
pub struct VirtualTable {
    by_dispatch: HashMap<DispatchPtr, TypeId>,
}

impl VirtualTable {
    pub(crate) fn build(types: &[Arc<TypeIdentity>]) -> Result<Self, SchemaError> {
        let mut by_dispatch = HashMap::new();
        for (i, identity) in types.iter().enumerate() {
            let dispatch = match &identity.shape {
                TypeShape::VirtualStruct(s) => s.dispatch,
                _ => None,
            };
            if let Some(address) = dispatch {
                if let Some(previous) = by_dispatch.insert(address, TypeId(i as u32)) {
                    return Err(SchemaError::DuplicateDispatch {
                        address: address.to_string(),
                        first: types[previous.0 as usize].name.clone(),
                        second: identity.name.clone(),
                    });
                }
            }
        }
        Ok(Self { by_dispatch })
    }

    pub fn len(&self) -> usize {
        self.by_dispatch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dispatch.is_empty()
    }

    pub fn lookup(&self, dispatch: DispatchPtr) -> Option<TypeId> {
        self.by_dispatch.get(&dispatch).copied()
    }
}

/// 解析 `address` 处对象的实际类型
///
/// `is_subclass(found, declared)` 与 `declared_is_leaf`（声明类型没有虚表且
/// 没有子类）由调用方根据注册表提供。
pub fn resolve_class(
    table: &VirtualTable,
    mem: &dyn HostMemory,
    address: Address,
    declared: TypeId,
    declared_is_leaf: bool,
    is_subclass: impl Fn(TypeId, TypeId) -> bool,
) -> Result<ClassResolution, MemoryError> {
    let dispatch = mem.read_ptr(address)?;
    match table.lookup(dispatch) {
        Some(found) if is_subclass(found, declared) => Ok(ClassResolution::Known(found)),
        Some(found) => {
            tracing::warn!(
                target: "types",
                "Object at {} has dispatch table of {} which is not a subclass of {}",
                address,
                found,
                declared
            );
            Ok(ClassResolution::Unknown(dispatch))
        }
        None if declared_is_leaf => Ok(ClassResolution::Assumed(declared)),
        None => Ok(ClassResolution::Unknown(dispatch)),
    }
}
