//! 中断检查钩子
//!
//! 脚本运行时一次只允许一个协程挂着钩子：钩子触发时如果发现自己不在
//! 登记的协程上，会把自己摘掉。因此恢复协程时要先把钩子挂到目标协程，
//! 返回后再挂回调用方。[`resume_hooked`] 负责这一步，脚本侧的
//! `coroutine.resume`/`coroutine.wrap` 也换成了经过它的版本。
//!
//! 中断请求在最外层运行结束前一直有效。脚本侧的 `pcall`/`xpcall` 在
//! 中断待处理时不返回 `false`，而是重新抛出中断；`xpcall` 的处理函数
//! 也不会被调用。

use super::proxy::runtime;
use crate::core::error::BridgeError;
use crate::core::error_chain::{split_traceback, ErrorChain};
use crate::core::runtime::Runtime;
use mlua::{
    Error as LuaError, Function, HookTriggers, Lua, MultiValue, Result as LuaResult, Table,
    Thread, Value as LuaValue, Variadic, VmState,
};
use std::sync::Arc;

/// 中断待处理时 `pcall`/`xpcall` 不吞错误
const PROTECTED: &str = r#"
local pending, check = ...
local pcall, xpcall = pcall, xpcall
local pack, unpack = table.pack, table.unpack
_G.pcall = function(f, ...)
    local r = pack(pcall(f, ...))
    if not r[1] then
        check()
    end
    return unpack(r, 1, r.n)
end
_G.xpcall = function(f, handler, ...)
    local r = pack(xpcall(f, function(e)
        if pending() then
            return e
        end
        return handler(e)
    end, ...))
    if not r[1] then
        check()
    end
    return unpack(r, 1, r.n)
end
"#;

/// `coroutine.wrap` 建在替换后的 `coroutine.resume` 之上
const WRAP: &str = r#"
local coroutine = ...
local create, resume = coroutine.create, coroutine.resume
local pack, unpack = table.pack, table.unpack
coroutine.wrap = function(f)
    local co = create(f)
    return function(...)
        local r = pack(resume(co, ...))
        if not r[1] then
            error(r[2], 0)
        end
        return unpack(r, 2, r.n)
    end
end
"#;

fn triggers(runtime: &Runtime) -> HookTriggers {
    HookTriggers::new().every_nth_instruction(runtime.config().scripting.interrupt_interval.max(1))
}

fn check(runtime: Arc<Runtime>) -> impl Fn(&Lua, mlua::Debug) -> LuaResult<VmState> + 'static {
    move |_, _| {
        if runtime.interrupt().is_pending() {
            tracing::debug!(target: "script", "Interrupt check fired");
            return Err(LuaError::external(BridgeError::Interrupted));
        }
        Ok(VmState::Continue)
    }
}

/// 把检查钩子挂到当前正在执行的协程（在回调外调用时为主协程）
pub(crate) fn install(lua: &Lua, runtime: &Arc<Runtime>) {
    lua.set_hook(triggers(runtime), check(Arc::clone(runtime)));
}

/// 带着检查钩子恢复协程，返回后钩子回到调用方
pub(crate) fn resume_hooked(lua: &Lua, thread: &Thread, args: MultiValue) -> LuaResult<MultiValue> {
    let runtime = runtime(lua)?;
    thread.set_hook(triggers(&runtime), check(Arc::clone(&runtime)));
    let result = thread.resume::<MultiValue>(args);
    install(lua, &runtime);
    result
}

/// 替换脚本侧的 `pcall`、`xpcall`、`coroutine.resume` 与 `coroutine.wrap`
///
/// 失败时与标准库一致返回 `false, message`，但中断照常向外传播。
pub(crate) fn patch_library(lua: &Lua, runtime: &Arc<Runtime>) -> LuaResult<()> {
    let flag = Arc::clone(runtime);
    let pending = lua.create_function(move |_, ()| Ok(flag.interrupt().is_pending()))?;
    let flag = Arc::clone(runtime);
    let check = lua.create_function(move |_, ()| {
        if flag.interrupt().is_pending() {
            return Err(LuaError::external(BridgeError::Interrupted));
        }
        Ok(())
    })?;
    lua.load(PROTECTED).set_name("=pcall").call::<()>((pending, check))?;

    let coroutine: Table = lua.globals().get("coroutine")?;
    let resume: Function = lua.create_function(|lua, (co, args): (Thread, Variadic<LuaValue>)| {
        match resume_hooked(lua, &co, MultiValue::from_vec(args.to_vec())) {
            Ok(results) => {
                let mut out = Vec::with_capacity(results.len() + 1);
                out.push(LuaValue::Boolean(true));
                out.extend(results);
                Ok(MultiValue::from_vec(out))
            }
            Err(err) => {
                if ErrorChain::from_lua(&err).is_interrupted() {
                    return Err(err);
                }
                let reason = match &err {
                    LuaError::CoroutineUnresumable => {
                        LuaValue::String(lua.create_string("cannot resume dead coroutine")?)
                    }
                    LuaError::RuntimeError(message) => {
                        LuaValue::String(lua.create_string(split_traceback(message).0)?)
                    }
                    other => LuaValue::Error(Box::new(other.clone())),
                };
                Ok(MultiValue::from_vec(vec![LuaValue::Boolean(false), reason]))
            }
        }
    })?;
    coroutine.set("resume", resume)?;
    lua.load(WRAP).set_name("=coroutine.wrap").call::<()>(coroutine)
}
