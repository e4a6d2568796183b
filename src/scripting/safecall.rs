//! 结构化错误与安全调用
//!
//! - `host.error(message [, cause])` 抛出带位置、调用栈和原因的错误值
//! - `host.safecall(f, ...)` 成功时返回 `true, ...`，失败时返回 `false, err`
//! - `host.onerror(err)` 作为 `xpcall` 的处理函数，把任意错误整理成带调用栈的错误值
//!
//! 错误值是 [`ErrValue`] userdata：`tostring(err)` 只有消息，
//! `err:render(true)` 给出消息、调用栈和原因链。中断不会被 `safecall`
//! 吞掉，而是继续向外传播。

use crate::core::error_chain::{ErrorChain, Verbosity};
use mlua::{
    AnyUserData, Error as LuaError, Function, Lua, MetaMethod, MultiValue, Result as LuaResult,
    Table, UserData, UserDataMethods, Value as LuaValue, Variadic,
};

/// `host.error` 的脚本部分：用 `pcall(error, "", 3)` 取得调用者位置，
/// 层数依赖未经包装的 `pcall`
const PRELUDE: &str = r#"
local host, raise = ...
local pcall, error = pcall, error
function host.error(message, cause)
    local _, where = pcall(error, "", 3)
    if type(where) == "string" then
        where = where:gsub(":%s*$", "")
    end
    if where == "" or type(where) ~= "string" then
        where = nil
    end
    raise(tostring(message), where, cause)
end
"#;

/// 脚本可见的错误值
#[derive(Debug, Clone)]
pub struct ErrValue(pub ErrorChain);

impl ErrValue {
    fn property(&self, lua: &Lua, name: &str) -> LuaResult<LuaValue> {
        let first = self.0.frames().first();
        let text = |s: Option<&str>| -> LuaResult<LuaValue> {
            Ok(match s {
                Some(s) => LuaValue::String(lua.create_string(s)?),
                None => LuaValue::Nil,
            })
        };
        match name {
            "message" => text(Some(self.0.message())),
            "category" => text(Some(self.0.category())),
            "where" => text(first.and_then(|f| f.location.as_deref())),
            "stacktrace" => text(first.and_then(|f| f.trace.as_deref())),
            "cause" => match self.0.cause_chain() {
                Some(cause) => Ok(LuaValue::UserData(lua.create_userdata(ErrValue(cause))?)),
                None => Ok(LuaValue::Nil),
            },
            _ => Ok(LuaValue::Nil),
        }
    }
}

impl UserData for ErrValue {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("render", |_, this, verbose: Option<bool>| {
            let verbosity = if verbose.unwrap_or(false) {
                Verbosity::Verbose
            } else {
                Verbosity::Terse
            };
            Ok(this.0.render(verbosity))
        });

        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            this.property(lua, &key)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.0.render(Verbosity::Terse))
        });
    }
}

/// 把任意脚本错误对象整理成错误链
pub fn chain_of(value: &LuaValue) -> Option<ErrorChain> {
    match value {
        LuaValue::UserData(ud) => ud.borrow::<ErrValue>().ok().map(|e| e.0.clone()),
        LuaValue::Error(err) => Some(ErrorChain::from_lua(err)),
        LuaValue::String(s) => Some(ErrorChain::from_message(&s.to_string_lossy())),
        _ => None,
    }
}

fn raise_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(
        |_, (message, location, cause): (String, Option<String>, LuaValue)| -> LuaResult<()> {
            let mut chain = ErrorChain::new(message);
            if let Some(location) = location {
                chain = chain.with_location(location);
            }
            if let Some(cause) = chain_of(&cause) {
                chain = chain.with_cause(cause);
            }
            Err(LuaError::external(chain))
        },
    )
}

fn safecall_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, (f, args): (Function, Variadic<LuaValue>)| {
        match f.call::<MultiValue>(MultiValue::from_vec(args.to_vec())) {
            Ok(results) => {
                let mut out = Vec::with_capacity(results.len() + 1);
                out.push(LuaValue::Boolean(true));
                out.extend(results);
                Ok(MultiValue::from_vec(out))
            }
            Err(err) => {
                let chain = ErrorChain::from_lua(&err);
                if chain.is_interrupted() {
                    return Err(err);
                }
                tracing::debug!(target: "script", "safecall caught: {}", chain);
                let value = lua.create_userdata(ErrValue(chain))?;
                Ok(MultiValue::from_vec(vec![
                    LuaValue::Boolean(false),
                    LuaValue::UserData(value),
                ]))
            }
        }
    })
}

/// 从 `skip` 层开始的脚本调用栈
fn stack_trace(lua: &Lua, skip: usize) -> String {
    let mut lines = vec!["stack traceback:".to_string()];
    let mut level = skip;
    while let Some(debug) = lua.inspect_stack(level) {
        let source = debug.source();
        let src = source.short_src.as_deref().unwrap_or("?");
        let line = debug.curr_line();
        let location = if line > 0 {
            format!("{}:{}", src, line)
        } else {
            src.to_string()
        };
        match debug.names().name {
            Some(name) => lines.push(format!("\t{}: in function '{}'", location, name)),
            None => lines.push(format!("\t{}: in {}", location, source.what)),
        }
        level += 1;
    }
    lines.join("\n")
}

fn onerror_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, value: LuaValue| {
        let chain = match chain_of(&value) {
            Some(chain) => chain,
            None => {
                let tostring: Function = lua.globals().get("tostring")?;
                ErrorChain::from_message(&tostring.call::<String>(value)?)
            }
        };
        let has_trace = chain.frames().first().is_some_and(|f| f.trace.is_some());
        let chain = if has_trace {
            chain
        } else {
            chain.with_trace(stack_trace(lua, 1))
        };
        Ok(ErrValue(chain))
    })
}

/// 在 `host` 表上注册 `error`、`safecall` 与 `onerror`
pub(crate) fn install(lua: &Lua, host: &Table) -> LuaResult<()> {
    host.set("safecall", safecall_function(lua)?)?;
    host.set("onerror", onerror_function(lua)?)?;
    let raise = raise_function(lua)?;
    lua.load(PRELUDE)
        .set_name("=host.error")
        .call::<()>((host.clone(), raise))
}

/// 从 `safecall` 的第二个返回值取回错误链
pub fn err_value(ud: &AnyUserData) -> Option<ErrorChain> {
    ud.borrow::<ErrValue>().ok().map(|e| e.0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_host() -> Lua {
        let lua = Lua::new();
        let host = lua.create_table().unwrap();
        install(&lua, &host).unwrap();
        lua.globals().set("host", host).unwrap();
        lua
    }

    #[test]
    fn test_safecall_success_passes_results() {
        let lua = lua_with_host();
        let (ok, a, b): (bool, i64, i64) = lua
            .load("return host.safecall(function(x) return x, x * 2 end, 21)")
            .eval()
            .unwrap();
        assert!(ok);
        assert_eq!((a, b), (21, 42));
    }

    #[test]
    fn test_host_error_carries_location_and_cause() {
        let lua = lua_with_host();
        let (ok, err): (bool, AnyUserData) = lua
            .load(
                r#"
                return host.safecall(function()
                    local _, inner = host.safecall(function() error("disk on fire") end)
                    host.error("save failed", inner)
                end)
                "#,
            )
            .set_name("=save")
            .eval()
            .unwrap();
        assert!(!ok);
        let chain = err_value(&err).unwrap();
        assert_eq!(chain.message(), "save failed");
        assert_eq!(chain.frames()[0].location.as_deref(), Some("save:4"));
        assert_eq!(chain.root_cause().unwrap().message, "disk on fire");

        let (terse, verbose, cause, where_): (String, String, String, String) = lua
            .load(
                r#"
                local _, e = ...
                return tostring(e), e:render(true), e.cause.message, e.where
                "#,
            )
            .call((ok, err))
            .unwrap();
        assert_eq!(terse, "save failed");
        assert!(verbose.contains("caused by: disk on fire"));
        assert_eq!(cause, "disk on fire");
        assert_eq!(where_, "save:4");
    }

    #[test]
    fn test_onerror_builds_error_value_with_stacktrace() {
        let lua = lua_with_host();
        let (ok, message, where_, trace, table_message): (bool, String, String, String, String) = lua
            .load(
                r#"
                local function explode() error("broken") end
                local ok, err = xpcall(explode, host.onerror)
                local _, other = xpcall(function() error({}) end, host.onerror)
                return ok, err.message, err.where, err.stacktrace, other.message
                "#,
            )
            .set_name("=handler")
            .eval()
            .unwrap();
        assert!(!ok);
        assert_eq!(message, "broken");
        assert_eq!(where_, "handler:2");
        assert!(trace.starts_with("stack traceback:"));
        assert!(trace.contains("handler:2"));
        assert!(table_message.starts_with("table: "));
    }

    #[test]
    fn test_safecall_reraises_interruption() {
        let lua = lua_with_host();
        let err = lua
            .load(r#"return host.safecall(function() error("interrupted", 0) end)"#)
            .exec()
            .unwrap_err();
        assert!(ErrorChain::from_lua(&err).is_interrupted());
    }
}
