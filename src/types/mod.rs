//! 类型身份模型
//!
//! 每个外部类型对应一个不可变的 [`TypeIdentity`]，描述它的名字、大小，
//! 以及分配/复制/销毁能力。身份在启动时由外部模式生成器注册，进程
//! 生命周期内不变；运行中只会追加为匿名字段合成的容器身份。
//!
//! - `primitive` - 定宽数值与字符串
//! - `enums` - 枚举与位域
//! - `container` - 容器布局
//! - `structs` - 结构体、联合体、字段描述
//! - `function` - 函数签名与原生函数
//! - `registry` - 身份注册表
//! - `virtual_table` - 多态类型的实际类型解析
//! - `lifecycle` - 分配、复制、销毁

pub mod container;
pub mod enums;
pub mod function;
pub mod lifecycle;
pub mod primitive;
pub mod registry;
pub mod structs;
pub mod virtual_table;

pub use container::{ContainerIdentity, ContainerKind};
pub use enums::{BitDescriptor, BitSpan, BitfieldIdentity, EnumIdentity, EnumKey};
pub use function::{CallFrame, FunctionIdentity, NativeFn, NativeFunction};
pub use primitive::PrimitiveKind;
pub use registry::{SchemaError, TypeRegistry, TypeRegistryBuilder};
pub use structs::{
    FieldDescriptor, FieldExtra, FieldMode, GlobalIdentity, StructIdentity, UnionIdentity,
    POINTER_OWNS_TARGET,
};
pub use virtual_table::{ClassResolution, DispatchPtr, VirtualTable};

use std::fmt;

/// 类型身份 ID，是注册表中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 身份种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Primitive,
    Pointer,
    Container,
    Struct,
    Class,
    Union,
    Enum,
    Bitfield,
    Function,
    Opaque,
    Global,
}

impl TypeKind {
    pub fn name(&self) -> &'static str {
        match self {
            TypeKind::Primitive => "primitive",
            TypeKind::Pointer => "pointer",
            TypeKind::Container => "container",
            TypeKind::Struct => "struct-type",
            TypeKind::Class => "class-type",
            TypeKind::Union => "union-type",
            TypeKind::Enum => "enum-type",
            TypeKind::Bitfield => "bitfield-type",
            TypeKind::Function => "function",
            TypeKind::Opaque => "opaque",
            TypeKind::Global => "global",
        }
    }
}

/// 身份的具体形状
#[derive(Debug, Clone)]
pub enum TypeShape {
    Primitive(PrimitiveKind),
    /// 指向 `target`，`None` 为 void 指针
    Pointer { target: Option<TypeId> },
    Container(ContainerIdentity),
    Struct(StructIdentity),
    VirtualStruct(StructIdentity),
    Union(UnionIdentity),
    Enum(EnumIdentity),
    Bitfield(BitfieldIdentity),
    Function(FunctionIdentity),
    /// 外部管理的不透明类型
    Opaque,
    Global(GlobalIdentity),
}

/// 一个外部类型的描述
#[derive(Debug, Clone)]
pub struct TypeIdentity {
    pub name: String,
    pub shape: TypeShape,
}

impl TypeIdentity {
    pub fn new(name: impl Into<String>, shape: TypeShape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn kind(&self) -> TypeKind {
        match &self.shape {
            TypeShape::Primitive(_) => TypeKind::Primitive,
            TypeShape::Pointer { .. } => TypeKind::Pointer,
            TypeShape::Container(_) => TypeKind::Container,
            TypeShape::Struct(_) => TypeKind::Struct,
            TypeShape::VirtualStruct(_) => TypeKind::Class,
            TypeShape::Union(_) => TypeKind::Union,
            TypeShape::Enum(_) => TypeKind::Enum,
            TypeShape::Bitfield(_) => TypeKind::Bitfield,
            TypeShape::Function(_) => TypeKind::Function,
            TypeShape::Opaque => TypeKind::Opaque,
            TypeShape::Global(_) => TypeKind::Global,
        }
    }

    /// 结构体或多态结构体的描述
    pub fn as_struct(&self) -> Option<&StructIdentity> {
        match &self.shape {
            TypeShape::Struct(s) | TypeShape::VirtualStruct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_container(&self) -> Option<&ContainerIdentity> {
        match &self.shape {
            TypeShape::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumIdentity> {
        match &self.shape {
            TypeShape::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_struct_like(&self) -> bool {
        matches!(
            self.shape,
            TypeShape::Struct(_) | TypeShape::VirtualStruct(_)
        )
    }

    /// 值是否以原始整数形式存取（基本类型、枚举、位域）
    pub fn scalar_base(&self) -> Option<PrimitiveKind> {
        match &self.shape {
            TypeShape::Primitive(p) => Some(*p),
            TypeShape::Enum(e) => Some(e.base),
            TypeShape::Bitfield(b) => Some(b.base),
            _ => None,
        }
    }
}
