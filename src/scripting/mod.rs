//! 脚本桥接
//!
//! 把宿主对象以代理的形式暴露给 Lua 脚本：
//!
//! - [`proxy`]: 对象引用与类型句柄的 userdata 代理，值在两侧之间的转换
//! - [`bridge`]: 脚本状态、`host` 表、定时器和事件分派
//! - [`console`]: 控制台与交互函数
//! - [`safecall`]: 结构化错误值与 `host.safecall`
//! - [`restartable`]: 可以中途交出控制、稍后恢复的调用
//! - [`interpreter`]: 交互式提示
//! - [`persistent`]: 按键保存的持久化记录

pub mod bridge;
pub mod console;
mod hook;
pub mod interpreter;
pub mod persistent;
pub mod proxy;
pub mod restartable;
pub mod safecall;

pub use bridge::ScriptBridge;
pub use console::{Console, SharedConsole, StreamConsole};
pub use interpreter::{Prompt, PromptState};
pub use persistent::{PersistenceError, PersistentEntry, PersistentStore, PERSISTENT_INTS};
pub use proxy::{RefProxy, TypeHandle};
pub use restartable::{CallState, Continuation, RestartableCall};
pub use safecall::{err_value, ErrValue};
