//! 脚本侧与宿主侧之间传递的值

use crate::memory::Address;
use crate::types::{NativeFunction, TypeId};
use std::fmt;
use std::sync::Arc;

/// 对象引用：地址 + 解析后的身份
///
/// 引用不拥有对象，每次访问时重新构造，没有析构行为。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub address: Address,
    pub ty: TypeId,
}

impl ObjectRef {
    pub fn new(address: Address, ty: TypeId) -> Self {
        Self { address, ty }
    }
}

/// 绑定到接收者的方法
#[derive(Clone)]
pub struct BoundMethod {
    pub function: Arc<NativeFunction>,
    /// 对象方法的接收者；类方法为 `None`
    pub this: Option<ObjectRef>,
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("function", &self.function.name)
            .field("this", &self.this)
            .finish()
    }
}

/// 动态值
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(ObjectRef),
    /// 类型句柄
    Type(TypeId),
    /// 键值表，保持插入顺序
    Table(Vec<(Value, Value)>),
    Method(BoundMethod),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => {
                Arc::ptr_eq(&a.function, &b.function) && a.this == b.this
            }
            _ => false,
        }
    }
}

impl Value {
    /// 整数值；恰好为整数的有限浮点数也算
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                if *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// 真值：只有 nil 和 false 为假
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Ref(_) => "reference",
            Value::Type(_) => "type",
            Value::Table(_) => "table",
            Value::Method(_) => "function",
        }
    }

    /// 表中按字符串键取值
    pub fn table_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Table(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Ref(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_floats_are_integers() {
        assert_eq!(Value::Float(3.0).as_int(), Some(3));
        assert_eq!(Value::Float(3.5).as_int(), None);
        assert_eq!(Value::Float(f64::NAN).as_int(), None);
        assert_eq!(Value::Str("3".into()).as_int(), None);
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Str("2".into()));
    }

    #[test]
    fn test_table_get() {
        let t = Value::Table(vec![
            (Value::from("new"), Value::Bool(true)),
            (Value::Int(1), Value::Int(5)),
        ]);
        assert_eq!(t.table_get("new"), Some(&Value::Bool(true)));
        assert_eq!(t.table_get("missing"), None);
        assert!(Value::Nil.table_get("new").is_none());
    }
}
