//! 函数类型与原生函数

use super::TypeId;
use crate::access::{ObjectRef, Value};
use crate::core::error::{BridgeError, BridgeResult, InvocationError};
use crate::core::runtime::Runtime;
use crate::core::utils::panic_message;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// 函数签名
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionIdentity {
    /// 参数类型，`None` 表示不做转换直接传递
    pub args: Vec<Option<TypeId>>,
    /// 返回类型；结构体返回值写入调用方提供的存储
    pub ret: Option<TypeId>,
    /// 是否接受多余参数
    pub variadic: bool,
}

impl FunctionIdentity {
    pub fn new(args: Vec<Option<TypeId>>, ret: Option<TypeId>) -> Self {
        Self {
            args,
            ret,
            variadic: false,
        }
    }

    /// 不检查类型的函数
    pub fn untyped(arity: usize) -> Self {
        Self::new(vec![None; arity], None)
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// 参数个数是否可接受
    pub fn accepts(&self, count: usize) -> bool {
        if self.variadic {
            count >= self.args.len()
        } else {
            count == self.args.len()
        }
    }
}

/// 调用帧
#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    /// 对象方法的接收者
    pub this: Option<ObjectRef>,
    /// 已转换的参数
    pub args: Vec<Value>,
    /// 结构体返回值的存储位置
    pub ret: Option<ObjectRef>,
}

impl CallFrame {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            this: None,
            args,
            ret: None,
        }
    }

    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Nil)
    }
}

/// 原生函数体
pub type NativeFn = dyn Fn(&Runtime, &mut CallFrame) -> BridgeResult<Value> + Send + Sync;

/// 命名的原生函数
pub struct NativeFunction {
    pub name: String,
    pub signature: FunctionIdentity,
    body: Arc<NativeFn>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

impl NativeFunction {
    pub fn new<F>(name: &str, signature: FunctionIdentity, body: F) -> Self
    where
        F: Fn(&Runtime, &mut CallFrame) -> BridgeResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            signature,
            body: Arc::new(body),
        }
    }

    /// 调用函数体，panic 在边界处转换为 [`InvocationError::Panicked`]
    pub fn invoke(&self, runtime: &Runtime, frame: &mut CallFrame) -> BridgeResult<Value> {
        if !self.signature.accepts(frame.args.len()) {
            return Err(InvocationError::WrongArgCount {
                function: self.name.clone(),
                expected: self.signature.arity(),
                got: frame.args.len(),
            }
            .into());
        }
        match catch_unwind(AssertUnwindSafe(|| (self.body)(runtime, frame))) {
            Ok(result) => result,
            Err(payload) => Err(BridgeError::Invocation(InvocationError::Panicked {
                function: self.name.clone(),
                message: panic_message(payload.as_ref()),
            })),
        }
    }
}
