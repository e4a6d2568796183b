//! 类型身份注册表
//!
//! 启动时通过 [`TypeRegistryBuilder`] 一次性注册全部身份，之后只读。
//! 唯一的运行期追加是为匿名字段形状合成的容器身份，由绑定缓存在
//! 持有挂起锁时完成。

use super::container::{
    ContainerKind, BIT_VECTOR_HEADER_SIZE, DEQUE_HEADER_SIZE, VECTOR_HEADER_SIZE,
};
use super::structs::{FieldDescriptor, FieldMode};
use super::virtual_table::VirtualTable;
use super::{
    ContainerIdentity, FunctionIdentity, PrimitiveKind, StructIdentity, TypeId, TypeIdentity,
    TypeShape,
};
use crate::memory::POINTER_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;

/// 模式注册错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Type {0} was declared but never defined")]
    Undefined(String),

    #[error("Duplicate type name: {0}")]
    DuplicateName(String),

    #[error("Field list of {0} has an end marker before its last entry")]
    MisplacedSentinel(String),

    #[error("Parent of {child} is not a struct: {parent}")]
    BadParent { child: String, parent: String },

    #[error("Dispatch table {address} registered for both {first} and {second}")]
    DuplicateDispatch {
        address: String,
        first: String,
        second: String,
    },

    #[error("Type id {0} is out of range")]
    BadId(u32),
}

/// 继承展开后的字段
#[derive(Debug, Clone)]
pub struct WalkedField {
    /// 声明该字段的类型
    pub owner: TypeId,
    /// 在声明类型字段表中的下标
    pub index: usize,
    /// 对外名称；被基类同名字段遮蔽时为 `Type.field`
    pub name: String,
    pub field: FieldDescriptor,
}

#[derive(Debug, Default)]
struct RegistryInner {
    types: Vec<Arc<TypeIdentity>>,
    by_name: HashMap<String, TypeId>,
    children: HashMap<TypeId, Vec<TypeId>>,
}

/// 类型身份注册表
#[derive(Debug)]
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    vtable: VirtualTable,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            vtable: VirtualTable::default(),
        }
    }
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 取身份；ID 只由注册表发放，永远有效
    pub fn get(&self, id: TypeId) -> Arc<TypeIdentity> {
        self.read().types[id.0 as usize].clone()
    }

    pub fn try_get(&self, id: TypeId) -> Option<Arc<TypeIdentity>> {
        self.read().types.get(id.0 as usize).cloned()
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.read().by_name.get(name).copied()
    }

    pub fn name(&self, id: TypeId) -> String {
        self.get(id).name.clone()
    }

    pub fn len(&self) -> usize {
        self.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有有名字的身份
    pub fn names(&self) -> Vec<(String, TypeId)> {
        let mut out: Vec<(String, TypeId)> = self
            .read()
            .by_name
            .iter()
            .map(|(n, id)| (n.clone(), *id))
            .collect();
        out.sort();
        out
    }

    pub fn virtual_table(&self) -> &VirtualTable {
        &self.vtable
    }

    /// 直接子类
    pub fn children(&self, id: TypeId) -> Vec<TypeId> {
        self.read().children.get(&id).cloned().unwrap_or_default()
    }

    pub fn has_children(&self, id: TypeId) -> bool {
        self.read()
            .children
            .get(&id)
            .map_or(false, |c| !c.is_empty())
    }

    /// 父类
    pub fn parent(&self, id: TypeId) -> Option<TypeId> {
        self.get(id).as_struct().and_then(|s| s.parent)
    }

    /// `sub` 是否是 `base` 本身或其子类
    pub fn is_subclass(&self, sub: TypeId, base: TypeId) -> bool {
        let mut cursor = Some(sub);
        let mut steps = 0;
        while let Some(id) = cursor {
            if id == base {
                return true;
            }
            steps += 1;
            if steps > self.len() {
                break;
            }
            cursor = self.parent(id);
        }
        false
    }

    /// 字节大小；不透明类型和全局集合没有大小
    pub fn byte_size(&self, id: TypeId) -> Option<usize> {
        self.shape_size(&self.get(id).shape)
    }

    fn shape_size(&self, shape: &TypeShape) -> Option<usize> {
        match shape {
            TypeShape::Primitive(p) => Some(p.size()),
            TypeShape::Pointer { .. } | TypeShape::Function(_) => Some(POINTER_SIZE),
            TypeShape::Container(c) => match c.kind {
                ContainerKind::ValueVector | ContainerKind::PointerVector => {
                    Some(VECTOR_HEADER_SIZE)
                }
                ContainerKind::BitVector => Some(BIT_VECTOR_HEADER_SIZE),
                ContainerKind::Deque => Some(DEQUE_HEADER_SIZE),
                ContainerKind::FixedBuffer { len } => {
                    let item = self.byte_size(c.item?)?;
                    item.checked_mul(len)
                }
            },
            TypeShape::Struct(s) | TypeShape::VirtualStruct(s) => Some(s.size),
            TypeShape::Union(u) => Some(u.size),
            TypeShape::Enum(e) => Some(e.base.size()),
            TypeShape::Bitfield(b) => Some(b.base.size()),
            TypeShape::Opaque | TypeShape::Global(_) => None,
        }
    }

    /// 容器元素的步长
    pub fn item_stride(&self, container: &ContainerIdentity) -> Option<usize> {
        if container.holds_pointers() {
            return Some(POINTER_SIZE);
        }
        self.byte_size(container.item?)
    }

    /// 展开继承链的字段表：基类字段在前，与基类重名的派生字段改名为 `Type.field`
    pub fn walk_fields(&self, id: TypeId) -> Vec<WalkedField> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if chain.contains(&current) {
                break;
            }
            chain.push(current);
            cursor = self.parent(current);
        }
        chain.reverse();

        let mut out: Vec<WalkedField> = Vec::new();
        for owner in chain {
            let identity = self.get(owner);
            let fields = match &identity.shape {
                TypeShape::Struct(s) | TypeShape::VirtualStruct(s) => s.own_fields(),
                TypeShape::Union(u) => u.members(),
                TypeShape::Global(g) => g.members(),
                _ => &[],
            };
            for (index, field) in fields.iter().enumerate() {
                let shadowed = out.iter().any(|w| w.name == field.name);
                let name = if shadowed {
                    format!("{}.{}", identity.name, field.name)
                } else {
                    field.name.clone()
                };
                out.push(WalkedField {
                    owner,
                    index,
                    name,
                    field: field.clone(),
                });
            }
        }
        out
    }

    /// 声明类型中第 `index` 个字段
    pub fn field(&self, owner: TypeId, index: usize) -> Option<FieldDescriptor> {
        let identity = self.get(owner);
        let fields = match &identity.shape {
            TypeShape::Struct(s) | TypeShape::VirtualStruct(s) => s.own_fields(),
            TypeShape::Union(u) => u.members(),
            TypeShape::Global(g) => g.members(),
            _ => return None,
        };
        fields.get(index).cloned()
    }

    /// 追加合成身份，返回新 ID
    pub(crate) fn append_synthesized(&self, identity: TypeIdentity) -> TypeId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = TypeId(inner.types.len() as u32);
        inner.by_name.entry(identity.name.clone()).or_insert(id);
        inner.types.push(Arc::new(identity));
        id
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 注册表构建器
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: Vec<Option<TypeIdentity>>,
    declared_names: Vec<String>,
    by_name: HashMap<String, TypeId>,
    primitives: HashMap<PrimitiveKind, TypeId>,
    pointers: HashMap<Option<TypeId>, TypeId>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 先声明名字，稍后用 [`define`](Self::define) 给出定义；用于自引用类型
    pub fn declare(&mut self, name: &str) -> TypeId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(None);
        self.declared_names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn define(&mut self, id: TypeId, shape: TypeShape) -> &mut Self {
        let name = self.declared_names[id.0 as usize].clone();
        self.types[id.0 as usize] = Some(TypeIdentity::new(name, shape));
        self
    }

    /// 注册有名字的身份
    pub fn add(&mut self, name: &str, shape: TypeShape) -> TypeId {
        let id = self.declare(name);
        self.define(id, shape);
        id
    }

    /// 基本类型（按种类去重）
    pub fn primitive(&mut self, kind: PrimitiveKind) -> TypeId {
        if let Some(id) = self.primitives.get(&kind) {
            return *id;
        }
        let id = self.add(kind.name(), TypeShape::Primitive(kind));
        self.primitives.insert(kind, id);
        id
    }

    /// 指针类型（按目标去重）
    pub fn pointer(&mut self, target: Option<TypeId>) -> TypeId {
        if let Some(id) = self.pointers.get(&target) {
            return *id;
        }
        let name = match target {
            Some(t) => format!("{}*", self.declared_names[t.0 as usize]),
            None => "void*".to_string(),
        };
        let id = self.add(&name, TypeShape::Pointer { target });
        self.pointers.insert(target, id);
        id
    }

    /// 容器类型，名字由种类和元素类型生成
    pub fn container(&mut self, container: ContainerIdentity) -> TypeId {
        let item = container
            .item
            .map(|i| self.declared_names[i.0 as usize].clone())
            .unwrap_or_else(|| "bool".to_string());
        let mut name = match container.kind {
            ContainerKind::FixedBuffer { len } => format!("{}[{}]", item, len),
            kind => format!("{}<{}>", kind, item),
        };
        if container.read_only {
            name = format!("const {}", name);
        }
        if let Some(id) = self.by_name.get(&name) {
            return *id;
        }
        self.add(&name, TypeShape::Container(container))
    }

    pub fn function(&mut self, name: &str, signature: FunctionIdentity) -> TypeId {
        self.add(name, TypeShape::Function(signature))
    }

    pub fn build(self) -> Result<TypeRegistry, SchemaError> {
        let mut types = Vec::with_capacity(self.types.len());
        for (i, slot) in self.types.into_iter().enumerate() {
            match slot {
                Some(identity) => types.push(Arc::new(identity)),
                None => return Err(SchemaError::Undefined(self.declared_names[i].clone())),
            }
        }

        let mut children: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for (i, identity) in types.iter().enumerate() {
            let fields: &[FieldDescriptor] = match &identity.shape {
                TypeShape::Struct(s) | TypeShape::VirtualStruct(s) => &s.fields,
                TypeShape::Union(u) => &u.fields,
                TypeShape::Global(g) => &g.fields,
                _ => &[],
            };
            let sentinel = fields.iter().position(|f| f.mode == FieldMode::End);
            if let Some(pos) = sentinel {
                if pos + 1 != fields.len() {
                    return Err(SchemaError::MisplacedSentinel(identity.name.clone()));
                }
            }
            if let Some(parent) = identity.as_struct().and_then(|s| s.parent) {
                let parent_identity = types
                    .get(parent.0 as usize)
                    .ok_or(SchemaError::BadId(parent.0))?;
                if !parent_identity.is_struct_like() {
                    return Err(SchemaError::BadParent {
                        child: identity.name.clone(),
                        parent: parent_identity.name.clone(),
                    });
                }
                children.entry(parent).or_default().push(TypeId(i as u32));
            }
        }

        let vtable = VirtualTable::build(&types)?;
        tracing::debug!(
            target: "types",
            "Type registry built: {} identities, {} dispatch tables",
            types.len(),
            vtable.len()
        );

        Ok(TypeRegistry {
            inner: RwLock::new(RegistryInner {
                types,
                by_name: self.by_name,
                children,
            }),
            vtable,
        })
    }
}

/// 快速定义一个普通结构体身份
pub fn struct_shape(size: usize, fields: Vec<FieldDescriptor>) -> TypeShape {
    TypeShape::Struct(StructIdentity::new(size, fields))
}
