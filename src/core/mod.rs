//! 核心模块
//!
//! 包含运行时的核心功能：
//! - `runtime` - 运行时入口，持有类型表、绑定缓存、宿主内存和插件
//! - `error` - 错误类型定义
//! - `error_chain` - 跨越原生与脚本边界的错误链
//! - `suspend` / `interrupt` - 挂起锁与中断请求
//! - `scheduler` - 定时回调调度

pub mod error;
pub mod error_chain;
pub mod interrupt;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod suspend;
pub mod utils;
#[macro_use]
pub mod macros;

// 重新导出错误类型
pub use error::{
    AccessError, AccessResult, AllocationError, BridgeError, BridgeResult, ContainerError,
    FieldOp, InvocationError, TypeMismatchError, UnionTagError, UnloadedError,
};
pub use error_chain::{ErrorChain, ErrorFrame, Verbosity};

// 重新导出主要类型
pub use interrupt::{InterruptFlag, RunGuard};
pub use runtime::{GlobalSymbols, Runtime, RuntimeBuilder};
pub use scheduler::{Cadence, TimerId, TimerQueue};
pub use suspend::{SuspendGuard, SuspendLock};
