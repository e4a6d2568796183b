//! 控制台与交互相关的 `host` 函数
//!
//! 宿主可以给脚本桥挂一个 [`Console`]。挂上之后脚本就处于交互模式：
//!
//! - `host.is_interactive()`: 是否挂了控制台
//! - `host.interpreter([prompt[, env]])`: 在当前调用里开一个嵌套提示
//! - `host.lineedit([prompt])`: 读一行输入，读取期间释放挂起锁
//! - `host.printerr(...)`: 写到错误流，没有控制台时记入日志
//! - `host.with_suspend(f, ...)`: 持有挂起锁调用 `f`

use super::interpreter::{Prompt, PromptState};
use super::proxy::runtime;
use crate::core::error::BridgeError;
use mlua::{
    Error as LuaError, Function, Lua, MultiValue, Result as LuaResult, Table, Value as LuaValue,
    Variadic,
};
use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

/// 交互式输入输出
pub trait Console {
    /// 显示提示并读取一行；输入结束时返回 `None`
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;

    fn write_out(&mut self, text: &str) -> io::Result<()>;

    fn write_err(&mut self, text: &str) -> io::Result<()>;
}

/// 挂在脚本状态上的控制台
pub type SharedConsole = Rc<RefCell<dyn Console>>;

/// 基于字节流的控制台
pub struct StreamConsole<R, W, E> {
    input: R,
    output: W,
    errors: E,
}

impl<R: BufRead, W: Write, E: Write> StreamConsole<R, W, E> {
    pub fn new(input: R, output: W, errors: E) -> Self {
        Self {
            input,
            output,
            errors,
        }
    }

    pub fn into_parts(self) -> (R, W, E) {
        (self.input, self.output, self.errors)
    }
}

impl<R: BufRead, W: Write, E: Write> Console for StreamConsole<R, W, E> {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        match self.input.read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
        }
    }

    fn write_out(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.output, "{}", text)
    }

    fn write_err(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.errors, "{}", text)?;
        self.errors.flush()
    }
}

/// 进程的标准输入输出
pub fn stdio() -> SharedConsole {
    Rc::new(RefCell::new(StreamConsole::new(
        io::stdin().lock(),
        io::stdout(),
        io::stderr(),
    )))
}

/// 取回挂在脚本状态上的控制台
pub(crate) fn attached(lua: &Lua) -> Option<SharedConsole> {
    lua.app_data_ref::<SharedConsole>().map(|console| Rc::clone(&console))
}

fn io_error(err: io::Error) -> LuaError {
    LuaError::external(err)
}

fn interpreter_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, (prompt, env): (Option<String>, Option<Table>)| {
        let Some(console) = attached(lua) else {
            return Ok((LuaValue::Nil, Some("not interactive".to_string())));
        };
        let runtime = runtime(lua)?;
        let mut nested = Prompt::nested(lua, &runtime, env);
        if let Some(prompt) = prompt {
            nested.set_prompt(prompt);
        }
        let state = nested.run(&*console).map_err(io_error)?;
        if runtime.interrupt().is_pending() {
            return Err(LuaError::external(BridgeError::Interrupted));
        }
        Ok((LuaValue::Boolean(state == PromptState::Done), None))
    })
}

fn lineedit_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, prompt: Option<String>| {
        let Some(console) = attached(lua) else {
            return Ok(None);
        };
        let runtime = runtime(lua)?;
        let mut guard = runtime.suspend().lock();
        let line = runtime.suspend().unlocked(&mut guard, || {
            console.borrow_mut().read_line(prompt.as_deref().unwrap_or(""))
        });
        line.map_err(io_error)
    })
}

fn printerr_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, args: Variadic<LuaValue>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for value in args.iter() {
            parts.push(tostring.call::<String>(value.clone())?);
        }
        let text = parts.join("\t");
        match attached(lua) {
            Some(console) => console.borrow_mut().write_err(&text).map_err(io_error),
            None => {
                tracing::warn!(target: "script", "{}", text);
                Ok(())
            }
        }
    })
}

fn with_suspend_function(lua: &Lua) -> LuaResult<Function> {
    lua.create_function(|lua, (f, args): (Function, Variadic<LuaValue>)| {
        let runtime = runtime(lua)?;
        let _held = runtime.suspend().lock();
        f.call::<MultiValue>(MultiValue::from_vec(args.to_vec()))
    })
}

/// 在 `host` 表上注册交互函数
pub(crate) fn install(lua: &Lua, host: &Table) -> LuaResult<()> {
    host.set("interpreter", interpreter_function(lua)?)?;
    host.set("lineedit", lineedit_function(lua)?)?;
    host.set("printerr", printerr_function(lua)?)?;
    host.set("with_suspend", with_suspend_function(lua)?)?;
    host.set(
        "is_interactive",
        lua.create_function(|lua, ()| Ok(attached(lua).is_some()))?,
    )?;
    Ok(())
}
