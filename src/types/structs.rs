//! 结构体、联合体与字段描述
//!
//! 字段表总以 [`FieldMode::End`] 结尾。字段的模式决定 `ty`、`count`、
//! `extra` 中哪些有意义：
//!
//! | 模式 | ty | count |
//! |---|---|---|
//! | Primitive | 基本/枚举/位域类型 | - |
//! | FixedString | - | 容量 |
//! | Pointer | 指向的类型（`None` 为 void） | 指针标志位 |
//! | FixedArray | 元素类型 | 长度 |
//! | Substruct | 结构体/联合体类型 | - |
//! | Container | 容器类型 | - |
//! | PointerVectorLegacy | 元素指向的类型 | - |
//! | ObjectMethod / ClassMethod | 函数类型 | - |

use super::function::NativeFunction;
use super::TypeId;
use crate::memory::Address;
use std::fmt;
use std::sync::Arc;

/// 指针字段标志：目标归宿主对象所有，复制时深拷贝，销毁时一并销毁
pub const POINTER_OWNS_TARGET: usize = 0x1;

/// 字段模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldMode {
    Primitive,
    FixedString,
    Pointer,
    FixedArray,
    Substruct,
    Container,
    PointerVectorLegacy,
    ObjectMethod,
    ClassMethod,
    /// 字段表结束标记
    End,
}

impl FieldMode {
    pub const ALL: [FieldMode; 10] = [
        FieldMode::Primitive,
        FieldMode::FixedString,
        FieldMode::Pointer,
        FieldMode::FixedArray,
        FieldMode::Substruct,
        FieldMode::Container,
        FieldMode::PointerVectorLegacy,
        FieldMode::ObjectMethod,
        FieldMode::ClassMethod,
        FieldMode::End,
    ];

    pub fn is_method(&self) -> bool {
        matches!(self, FieldMode::ObjectMethod | FieldMode::ClassMethod)
    }

    /// 是否有独立身份之外的匿名形状（需要合成容器身份）
    pub fn is_adhoc_container(&self) -> bool {
        matches!(
            self,
            FieldMode::FixedArray | FieldMode::FixedString | FieldMode::PointerVectorLegacy
        )
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldMode::Primitive => "primitive",
            FieldMode::FixedString => "static-string",
            FieldMode::Pointer => "pointer",
            FieldMode::FixedArray => "static-array",
            FieldMode::Substruct => "substruct",
            FieldMode::Container => "container",
            FieldMode::PointerVectorLegacy => "stl-vector-ptr",
            FieldMode::ObjectMethod => "object-method",
            FieldMode::ClassMethod => "class-method",
            FieldMode::End => "end",
        };
        f.write_str(name)
    }
}

/// 字段附加信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldExtra {
    /// 显式指定的联合体标签字段名
    pub union_tag_field: Option<String>,
    /// 联合体标签取值时使用的枚举属性
    pub union_tag_attr: Option<String>,
    /// 下标枚举
    pub index_enum: Option<TypeId>,
    /// 原始名称（被重命名时保留）
    pub original_name: Option<String>,
}

/// 字段描述
#[derive(Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub offset: usize,
    pub mode: FieldMode,
    pub ty: Option<TypeId>,
    pub count: usize,
    pub extra: FieldExtra,
    /// 方法字段的原生实现
    pub method: Option<Arc<NativeFunction>>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("mode", &self.mode)
            .field("ty", &self.ty)
            .field("count", &self.count)
            .field("extra", &self.extra)
            .field("method", &self.method.as_ref().map(|m| m.name.as_str()))
            .finish()
    }
}

impl FieldDescriptor {
    fn with_mode(name: &str, offset: usize, mode: FieldMode, ty: Option<TypeId>, count: usize) -> Self {
        Self {
            name: name.to_string(),
            offset,
            mode,
            ty,
            count,
            extra: FieldExtra::default(),
            method: None,
        }
    }

    pub fn primitive(name: &str, offset: usize, ty: TypeId) -> Self {
        Self::with_mode(name, offset, FieldMode::Primitive, Some(ty), 0)
    }

    pub fn fixed_string(name: &str, offset: usize, capacity: usize) -> Self {
        Self::with_mode(name, offset, FieldMode::FixedString, None, capacity)
    }

    pub fn pointer(name: &str, offset: usize, target: Option<TypeId>) -> Self {
        Self::with_mode(name, offset, FieldMode::Pointer, target, 0)
    }

    pub fn fixed_array(name: &str, offset: usize, item: TypeId, len: usize) -> Self {
        Self::with_mode(name, offset, FieldMode::FixedArray, Some(item), len)
    }

    pub fn substruct(name: &str, offset: usize, ty: TypeId) -> Self {
        Self::with_mode(name, offset, FieldMode::Substruct, Some(ty), 0)
    }

    pub fn container(name: &str, offset: usize, ty: TypeId) -> Self {
        Self::with_mode(name, offset, FieldMode::Container, Some(ty), 0)
    }

    pub fn pointer_vector_legacy(name: &str, offset: usize, item: TypeId) -> Self {
        Self::with_mode(name, offset, FieldMode::PointerVectorLegacy, Some(item), 0)
    }

    pub fn object_method(name: &str, function: Arc<NativeFunction>) -> Self {
        let mut field = Self::with_mode(name, 0, FieldMode::ObjectMethod, None, 0);
        field.method = Some(function);
        field
    }

    pub fn class_method(name: &str, function: Arc<NativeFunction>) -> Self {
        let mut field = Self::with_mode(name, 0, FieldMode::ClassMethod, None, 0);
        field.method = Some(function);
        field
    }

    pub fn end() -> Self {
        Self::with_mode("", 0, FieldMode::End, None, 0)
    }

    /// 设置指针标志位
    pub fn with_flags(mut self, flags: usize) -> Self {
        self.count = flags;
        self
    }

    pub fn with_index_enum(mut self, index_enum: TypeId) -> Self {
        self.extra.index_enum = Some(index_enum);
        self
    }

    pub fn with_union_tag(mut self, tag_field: &str) -> Self {
        self.extra.union_tag_field = Some(tag_field.to_string());
        self
    }

    pub fn with_union_tag_attr(mut self, attr: &str) -> Self {
        self.extra.union_tag_attr = Some(attr.to_string());
        self
    }

    pub fn owns_target(&self) -> bool {
        self.mode == FieldMode::Pointer && self.count & POINTER_OWNS_TARGET != 0
    }
}

/// 保证字段表以结束标记收尾
pub(crate) fn terminate(mut fields: Vec<FieldDescriptor>) -> Vec<FieldDescriptor> {
    if fields.last().map(|f| f.mode) != Some(FieldMode::End) {
        fields.push(FieldDescriptor::end());
    }
    fields
}

/// 取字段表中结束标记之前的部分
pub fn live_fields(fields: &[FieldDescriptor]) -> &[FieldDescriptor] {
    let end = fields
        .iter()
        .position(|f| f.mode == FieldMode::End)
        .unwrap_or(fields.len());
    &fields[..end]
}

/// 结构体（含多态结构体）
#[derive(Debug, Clone)]
pub struct StructIdentity {
    pub size: usize,
    pub fields: Vec<FieldDescriptor>,
    pub parent: Option<TypeId>,
    /// 多态结构体的虚表地址，固定存放在对象偏移 0 处
    pub dispatch: Option<Address>,
}

impl StructIdentity {
    pub fn new(size: usize, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            size,
            fields: terminate(fields),
            parent: None,
            dispatch: None,
        }
    }

    pub fn with_parent(mut self, parent: TypeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dispatch(mut self, dispatch: Address) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// 本类型声明的字段（不含继承）
    pub fn own_fields(&self) -> &[FieldDescriptor] {
        live_fields(&self.fields)
    }
}

/// 联合体，所有成员偏移为 0
#[derive(Debug, Clone)]
pub struct UnionIdentity {
    pub size: usize,
    pub fields: Vec<FieldDescriptor>,
}

impl UnionIdentity {
    pub fn new(size: usize, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            size,
            fields: terminate(fields),
        }
    }

    pub fn members(&self) -> &[FieldDescriptor] {
        live_fields(&self.fields)
    }

    pub fn member(&self, name: &str) -> Option<(usize, &FieldDescriptor)> {
        self.members().iter().enumerate().find(|(_, f)| f.name == name)
    }
}

/// 全局变量集合；字段地址在访问时按名字从全局符号表解析
#[derive(Debug, Clone)]
pub struct GlobalIdentity {
    pub fields: Vec<FieldDescriptor>,
}

impl GlobalIdentity {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields: terminate(fields),
        }
    }

    pub fn members(&self) -> &[FieldDescriptor] {
        live_fields(&self.fields)
    }
}
