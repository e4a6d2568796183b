//! 动态绑定生成
//!
//! 脚本首次接触某个类型时，为它生成一份 [`Binding`]：名字到字段访问器
//! 的映射（继承字段按基类在前合并）、稳定的字段顺序表，以及枚举和位域
//! 的取值步进。生成结果存入 [`BindingCache`]，之后的访问直接命中缓存。
//!
//! 定长数组、定长字符串和旧式指针向量字段没有独立身份，绑定时为它们
//! 合成临时容器身份，并以 `(所属类型, 字段下标)` 为键缓存。

pub mod cache;

pub use cache::BindingCache;

use crate::fields::accessor::FieldAccessor;
use crate::types::{FieldDescriptor, TypeId, TypeKind, TypeRegistry, TypeShape};
use std::collections::HashMap;
use std::fmt;

/// 绑定缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKey {
    /// 已注册的类型
    Type(TypeId),
    /// 字段上的匿名形状
    Field { owner: TypeId, index: u32 },
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Type(id) => write!(f, "type {}", id),
            BindingKey::Field { owner, index } => write!(f, "field {}/{}", owner, index),
        }
    }
}

/// 绑定中的一个字段
pub struct BoundField {
    /// 对外名称（被遮蔽时为 `Type.field`）
    pub name: String,
    pub owner: TypeId,
    pub index: usize,
    pub descriptor: FieldDescriptor,
    pub accessor: Box<dyn FieldAccessor>,
}

impl fmt::Debug for BoundField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundField")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("mode", &self.descriptor.mode)
            .finish()
    }
}

/// 枚举/位域的迭代方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stepping {
    None,
    Enum,
    Bitfield,
}

/// 一个类型的绑定
#[derive(Debug)]
pub struct Binding {
    pub key: BindingKey,
    pub ty: TypeId,
    pub type_name: String,
    pub kind: TypeKind,
    pub stepping: Stepping,
    fields: Vec<BoundField>,
    slots: HashMap<String, usize>,
}

impl Binding {
    pub(crate) fn new(
        key: BindingKey,
        ty: TypeId,
        type_name: String,
        kind: TypeKind,
        stepping: Stepping,
        fields: Vec<BoundField>,
    ) -> Self {
        let slots = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            key,
            ty,
            type_name,
            kind,
            stepping,
            fields,
            slots,
        }
    }

    pub fn field(&self, name: &str) -> Option<&BoundField> {
        self.slots.get(name).map(|i| &self.fields[*i])
    }

    /// 按声明顺序排列的字段
    pub fn fields(&self) -> &[BoundField] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// 有序迭代：`after` 之后的下一个字段
    pub fn next_field(&self, after: Option<&str>) -> Option<&BoundField> {
        match after {
            None => self.fields.first(),
            Some(name) => {
                let i = *self.slots.get(name)?;
                self.fields.get(i + 1)
            }
        }
    }

    /// 枚举值或位域起始位的步进；没有下一个时返回 `None`
    pub fn next_value(&self, types: &TypeRegistry, after: Option<i64>) -> Option<i64> {
        let identity = types.get(self.ty);
        match (&self.stepping, &identity.shape) {
            (Stepping::Enum, TypeShape::Enum(e)) => e.next_item(after),
            (Stepping::Bitfield, TypeShape::Bitfield(b)) => {
                let after = match after {
                    Some(v) if v < 0 => None,
                    Some(v) => Some(u32::try_from(v).ok()?),
                    None => None,
                };
                b.next_item(after).map(i64::from)
            }
            _ => None,
        }
    }
}
