//! 绑定缓存
//!
//! 构建只发生在持有挂起锁时（[`Runtime::with_access`] 保证），因此同一
//! 个键至多构建一次。内部的 `RwLock` 只是为了满足 `Sync`，不承担互斥
//! 构建的职责。
//!
//! [`Runtime::with_access`]: crate::core::runtime::Runtime::with_access

use super::{Binding, BindingKey, BoundField, Stepping};
use crate::core::error::{AccessError, BridgeResult};
use crate::fields::accessor::build_accessor;
use crate::types::{
    ContainerIdentity, FieldDescriptor, FieldMode, PrimitiveKind, TypeId, TypeIdentity,
    TypeRegistry, TypeShape,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// 绑定缓存
#[derive(Debug, Default)]
pub struct BindingCache {
    entries: RwLock<HashMap<BindingKey, Arc<Binding>>>,
    /// 字段 → 合成身份
    adhoc: RwLock<HashMap<(TypeId, u32), TypeId>>,
    /// 合成身份 → 字段
    adhoc_owner: RwLock<HashMap<TypeId, (TypeId, u32)>>,
    builds: AtomicUsize,
}

impl BindingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已缓存的绑定数量
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 累计构建次数
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: BindingKey) -> bool {
        self.cached(key).is_some()
    }

    /// 已缓存的绑定
    pub fn cached(&self, key: BindingKey) -> Option<Arc<Binding>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// 合成身份对应的字段键；普通类型原样返回
    pub fn canonical_key(&self, key: BindingKey) -> BindingKey {
        if let BindingKey::Type(ty) = key {
            let owners = self.adhoc_owner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((owner, index)) = owners.get(&ty) {
                return BindingKey::Field {
                    owner: *owner,
                    index: *index,
                };
            }
        }
        key
    }

    /// 取绑定，未缓存时构建
    pub fn get_or_build(&self, types: &TypeRegistry, key: BindingKey) -> BridgeResult<Arc<Binding>> {
        let key = self.canonical_key(key);
        if let Some(binding) = self.cached(key) {
            return Ok(binding);
        }

        let ty = match key {
            BindingKey::Type(ty) => ty,
            BindingKey::Field { owner, index } => {
                let field = types.field(owner, index as usize).ok_or_else(|| {
                    AccessError::NoSuchField {
                        type_name: types.name(owner),
                        name: format!("#{}", index),
                    }
                })?;
                self.adhoc_identity(types, owner, index, &field)?
            }
        };
        let binding = Arc::new(self.build(types, key, ty)?);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key).or_insert_with(|| {
            self.builds.fetch_add(1, Ordering::Relaxed);
            binding
        });
        Ok(entry.clone())
    }

    /// 为匿名字段形状合成（或取回）容器身份
    pub fn adhoc_identity(
        &self,
        types: &TypeRegistry,
        owner: TypeId,
        index: u32,
        field: &FieldDescriptor,
    ) -> BridgeResult<TypeId> {
        if let Some(id) = self
            .adhoc
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(owner, index))
        {
            return Ok(*id);
        }

        let owner_name = types.name(owner);
        let container = match (field.mode, field.ty) {
            (FieldMode::FixedArray, Some(item)) => ContainerIdentity::fixed(item, field.count),
            (FieldMode::FixedString, _) => {
                let byte = match types.lookup(PrimitiveKind::U8.name()) {
                    Some(id) => id,
                    None => types.append_synthesized(TypeIdentity::new(
                        PrimitiveKind::U8.name(),
                        TypeShape::Primitive(PrimitiveKind::U8),
                    )),
                };
                ContainerIdentity::fixed(byte, field.count)
            }
            (FieldMode::PointerVectorLegacy, Some(item)) => ContainerIdentity::pointer_vector(item),
            _ => {
                return Err(AccessError::UnhandledMode {
                    mode: field.mode.to_string(),
                    type_name: owner_name,
                    field: field.name.clone(),
                }
                .into())
            }
        };
        let container = match field.extra.index_enum {
            Some(e) => container.indexed_by(e),
            None => container,
        };
        let item_name = container
            .item
            .map(|i| types.name(i))
            .unwrap_or_default();
        let name = match container.kind {
            crate::types::ContainerKind::FixedBuffer { len } => format!("{}[{}]", item_name, len),
            kind => format!("{}<{}>", kind, item_name),
        };
        let id = types.append_synthesized(TypeIdentity::new(name, TypeShape::Container(container)));
        self.adhoc
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((owner, index), id);
        self.adhoc_owner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (owner, index));
        tracing::debug!(
            target: "binding",
            "Synthesized {} for {}.{}",
            types.name(id),
            owner_name,
            field.name
        );
        Ok(id)
    }

    fn build(&self, types: &TypeRegistry, key: BindingKey, ty: TypeId) -> BridgeResult<Binding> {
        let identity = types.get(ty);
        let global = matches!(identity.shape, TypeShape::Global(_));
        let mut fields = Vec::new();
        if matches!(
            identity.shape,
            TypeShape::Struct(_) | TypeShape::VirtualStruct(_) | TypeShape::Union(_) | TypeShape::Global(_)
        ) {
            for walked in types.walk_fields(ty) {
                let mut descriptor = walked.field.clone();
                if global {
                    // 全局字段的地址在访问时按名字解析
                    descriptor.offset = 0;
                }
                let accessor =
                    build_accessor(types, self, walked.owner, walked.index as u32, &descriptor)?;
                fields.push(BoundField {
                    name: walked.name,
                    owner: walked.owner,
                    index: walked.index,
                    descriptor,
                    accessor,
                });
            }
        }
        let stepping = match identity.shape {
            TypeShape::Enum(_) => Stepping::Enum,
            TypeShape::Bitfield(_) => Stepping::Bitfield,
            _ => Stepping::None,
        };
        tracing::debug!(
            target: "binding",
            "Built binding for {} ({}): {} fields",
            identity.name,
            key,
            fields.len()
        );
        Ok(Binding::new(
            key,
            ty,
            identity.name.clone(),
            identity.kind(),
            stepping,
            fields,
        ))
    }
}
