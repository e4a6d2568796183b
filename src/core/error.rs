//! 统一错误处理模块
//!
//! 按检测位置划分的错误分类：
//!
//! - [`AccessError`]: 字段/索引/模式错误，读写时值类型不符
//! - [`TypeMismatchError`]: cast / assign / is_instance 失败
//! - [`AllocationError`]: 类型不支持分配，或内存不足
//! - [`InvocationError`]: 参数个数错误，或调用中抛出的原生错误
//! - [`UnloadedError`]: 插件卸载后仍调用其绑定
//! - [`UnionTagError`]: 联合体标签越界、无名或找不到成员
//! - [`ContainerError`]: 只读容器上的修改，或索引越界
//!
//! 所有错误都在检测点构造并立即返回，不在中途吞掉。
//! 唯一的例外见 `fields::union`。

use crate::config::ConfigError;
use crate::memory::{Address, MemoryError};
use crate::plugins::PluginError;
use crate::scripting::persistent::PersistenceError;
use std::fmt;
use thiserror::Error;

/// 字段操作方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Read,
    Write,
}

impl fmt::Display for FieldOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldOp::Read => f.write_str("read"),
            FieldOp::Write => f.write_str("write"),
        }
    }
}

/// 访问错误
#[derive(Error, Debug)]
pub enum AccessError {
    /// 值类型不符，例如 "integer expected"
    #[error("{0} expected")]
    Expected(&'static str),

    #[error("Cannot {op} field {type_name}.{field}: {source}.")]
    Field {
        op: FieldOp,
        type_name: String,
        field: String,
        source: Box<BridgeError>,
    },

    #[error("Cannot {op} item {index} of {type_name}: {source}.")]
    Item {
        op: FieldOp,
        type_name: String,
        index: usize,
        source: Box<BridgeError>,
    },

    #[error("Field not found: {type_name}.{name}")]
    NoSuchField { type_name: String, name: String },

    #[error("Invalid index for {type_name}: {index}")]
    InvalidIndex { type_name: String, index: String },

    #[error("Unhandled field mode {mode} in {type_name}.{field}")]
    UnhandledMode {
        mode: String,
        type_name: String,
        field: String,
    },

    #[error("Field {0} is read-only")]
    ReadOnly(String),

    #[error("Null reference to {0}")]
    Null(String),

    #[error("Uninitialized address {0}")]
    Uninitialized(Address),

    #[error("Unknown subclass of {declared} (dispatch table {dispatch})")]
    UnknownSubclass { declared: String, dispatch: Address },

    #[error("Not a host object reference")]
    NotAReference,

    #[error("Address of global {0} is not known")]
    UnknownGlobal(String),

    #[error("Type {0} has no known size")]
    Unsized(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl AccessError {
    pub fn field(op: FieldOp, type_name: &str, field: &str, err: impl Into<BridgeError>) -> Self {
        AccessError::Field {
            op,
            type_name: type_name.to_string(),
            field: field.to_string(),
            source: Box::new(err.into()),
        }
    }

    pub fn item(op: FieldOp, type_name: &str, index: usize, err: impl Into<BridgeError>) -> Self {
        AccessError::Item {
            op,
            type_name: type_name.to_string(),
            index,
            source: Box::new(err.into()),
        }
    }
}

/// 类型不匹配错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeMismatchError {
    #[error("Cannot cast {from} to {to}")]
    Cast { from: String, to: String },

    #[error("Cannot assign {from} to {to}")]
    Assign { from: String, to: String },

    #[error("{expected} expected, got {actual}")]
    Expected { expected: String, actual: String },

    #[error("Not a type: {0}")]
    NotAType(String),
}

/// 分配错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Cannot {op} {type_name}: not supported")]
    NotSupported { op: &'static str, type_name: String },

    #[error("Out of memory allocating {type_name}: {source}")]
    OutOfMemory {
        type_name: String,
        source: MemoryError,
    },
}

/// 调用错误
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("{function}: expected {expected} arguments, got {got}")]
    WrongArgCount {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("{function}: {message}")]
    Native { function: String, message: String },

    #[error("{function} panicked: {message}")]
    Panicked { function: String, message: String },

    #[error("{plugin}.{function}: {source}")]
    Plugin {
        plugin: String,
        function: String,
        source: Box<BridgeError>,
    },

    #[error("{0} is not callable")]
    NotCallable(String),
}

/// 插件卸载后的调用
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{plugin}.{function}: plugin is not loaded")]
pub struct UnloadedError {
    pub plugin: String,
    pub function: String,
}

/// 联合体标签错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnionTagError {
    #[error("{union}: tag value {value} is out of range")]
    OutOfRange { union: String, value: i64 },

    #[error("{union}: tag value {value} is unnamed")]
    Unnamed { union: String, value: i64 },

    #[error("{union}: missing member for tag {tag}")]
    MissingMember { union: String, tag: String },

    #[error("{union}: no tag field found")]
    NoTagField { union: String },

    #[error("{union}: {members} members but {tags} tags")]
    LengthMismatch {
        union: String,
        members: usize,
        tags: usize,
    },
}

/// 容器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("Container {0} is read-only")]
    ReadOnly(String),

    #[error("Index {index} out of bounds for {type_name} (size {len})")]
    OutOfBounds {
        type_name: String,
        index: usize,
        len: usize,
    },

    #[error("Container {0} has a fixed size")]
    FixedSize(String),

    #[error("Container {type_name} does not support {op}")]
    NotSupported { op: &'static str, type_name: String },
}

/// 桥接层顶层错误
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatchError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Unloaded(#[from] UnloadedError),

    #[error(transparent)]
    UnionTag(#[from] UnionTagError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// 脚本代码主动抛出的错误
    #[error("{0}")]
    Guest(String),

    #[error("interrupted")]
    Interrupted,
}

impl BridgeError {
    /// 错误分类名称，供脚本侧区分
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Access(_) | BridgeError::Memory(_) => "AccessError",
            BridgeError::TypeMismatch(_) => "TypeMismatchError",
            BridgeError::Allocation(_) => "AllocationError",
            BridgeError::Invocation(_) => "InvocationError",
            BridgeError::Unloaded(_) => "UnloadedError",
            BridgeError::UnionTag(_) => "UnionTagError",
            BridgeError::Container(_) => "ContainerError",
            BridgeError::Plugin(_) => "PluginError",
            BridgeError::Config(_) => "ConfigError",
            BridgeError::Persistence(_) => "PersistenceError",
            BridgeError::Guest(_) => "Error",
            BridgeError::Interrupted => "Interrupted",
        }
    }

    /// 剥掉字段/调用包装后的根本分类
    pub fn root_category(&self) -> &'static str {
        match self {
            BridgeError::Access(AccessError::Field { source, .. })
            | BridgeError::Access(AccessError::Item { source, .. })
            | BridgeError::Invocation(InvocationError::Plugin { source, .. }) => {
                source.root_category()
            }
            other => other.category(),
        }
    }
}

/// 结果类型别名
pub type BridgeResult<T> = Result<T, BridgeError>;
pub type AccessResult<T> = Result<T, AccessError>;
