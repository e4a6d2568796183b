//! 交互式提示
//!
//! 提示是一个显式的状态机：
//!
//! ```text
//! Init -> AwaitingInput -> Executing -> AwaitingInput ... -> Done | Failed
//! ```
//!
//! 挂起点恰好是"等待一行输入"：[`Prompt::run`] 在读取输入时释放
//! 挂起锁，其他线程可以在这段时间访问宿主对象；拿到输入后重新持锁，
//! 经 [`Prompt::feed`] 进入 `Executing`。
//!
//! 嵌套提示（`host.interpreter`）在给定的环境表里执行，中断待处理时
//! 立即结束，由调用方把中断继续向外抛。
//!
//! 输入规则：
//!
//! - `quit` 结束会话
//! - `=expr` 求值并打印结果
//! - `!expr` 求值并把每个结果展开一层打印
//! - 其他输入先当作表达式，编译失败再当作语句
//!
//! 第一个结果存入 `_`，第 k 个结果存入 `_k`。

use super::bridge::{run_guarded, ScriptBridge};
use super::console::{Console, StreamConsole};
use crate::core::error_chain::{ErrorChain, Verbosity};
use crate::core::runtime::Runtime;
use mlua::{Function, Lua, MultiValue, Result as LuaResult, Table, Value as LuaValue};
use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

const CHUNK_NAME: &str = "=console";

/// 展开一层：`key = value` 形式
const EXPAND: &str = r#"
local value = ...
local lines = {}
for k, v in pairs(value) do
    lines[#lines + 1] = tostring(k) .. " = " .. tostring(v)
end
return lines
"#;

/// 提示状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    Init,
    AwaitingInput,
    Executing,
    Done,
    Failed,
}

impl PromptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PromptState::Done | PromptState::Failed)
    }
}

/// 一行输入的解释方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    /// 打印结果
    Print,
    /// 展开一层打印
    Expand,
    /// 先试表达式，再试语句
    Auto,
}

/// 交互式提示
pub struct Prompt<'a> {
    lua: &'a Lua,
    runtime: Arc<Runtime>,
    env: Option<Table>,
    state: PromptState,
    verbosity: Verbosity,
    history_vars: usize,
    prompt: String,
}

impl<'a> Prompt<'a> {
    pub fn new(bridge: &'a ScriptBridge) -> Self {
        Self::nested(bridge.lua(), bridge.runtime(), None)
    }

    /// 在 `env` 中执行的提示；没有 `env` 时使用全局表
    pub(crate) fn nested(lua: &'a Lua, runtime: &Arc<Runtime>, env: Option<Table>) -> Self {
        let config = &runtime.config().scripting;
        Self {
            lua,
            runtime: Arc::clone(runtime),
            env,
            state: PromptState::Init,
            verbosity: if config.verbose_errors {
                Verbosity::Verbose
            } else {
                Verbosity::Terse
            },
            history_vars: config.history_vars.max(1),
            prompt: config.prompt.clone(),
        }
    }

    pub fn state(&self) -> PromptState {
        self.state
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    /// `Init -> AwaitingInput`
    pub fn start(&mut self) {
        if self.state == PromptState::Init {
            self.state = PromptState::AwaitingInput;
        }
    }

    /// 交付一行输入，返回要显示的输出
    ///
    /// 只在 `AwaitingInput` 状态下接受输入；执行出错时提示保持可用。
    pub fn feed(&mut self, line: &str) -> Vec<String> {
        if self.state != PromptState::AwaitingInput {
            return Vec::new();
        }
        let line = line.trim();
        if line == "quit" {
            self.state = PromptState::Done;
            return Vec::new();
        }
        if line.is_empty() {
            return Vec::new();
        }

        self.state = PromptState::Executing;
        let (mode, source) = match (line.strip_prefix('='), line.strip_prefix('!')) {
            (Some(expr), _) => (LineMode::Print, expr),
            (_, Some(expr)) => (LineMode::Expand, expr),
            _ => (LineMode::Auto, line),
        };
        let output = match self.execute(mode, source) {
            Ok(lines) => lines,
            Err(err) => vec![err.render(self.verbosity)],
        };
        self.state = PromptState::AwaitingInput;
        output
    }

    /// 输入源结束
    pub fn end_of_input(&mut self) {
        if !self.state.is_terminal() {
            self.state = PromptState::Done;
        }
    }

    /// 输入源出错
    pub fn fail(&mut self, reason: &str) {
        tracing::error!(target: "script", "Prompt failed: {}", reason);
        self.state = PromptState::Failed;
    }

    fn execute(&self, mode: LineMode, source: &str) -> Result<Vec<String>, ErrorChain> {
        let history_vars = self.history_vars;
        let env = self.env.clone();
        run_guarded(self.lua, &self.runtime, |lua| {
            let function = compile(lua, mode, source, env.clone())?;
            let results: MultiValue = function.call(())?;
            let results: Vec<LuaValue> = results.into_iter().collect();
            let target = match env {
                Some(env) => env,
                None => lua.globals(),
            };
            store_results(&target, &results, history_vars)?;
            match mode {
                LineMode::Expand => {
                    let mut lines = Vec::new();
                    for value in &results {
                        lines.extend(expand(lua, value)?);
                    }
                    Ok(lines)
                }
                LineMode::Print | LineMode::Auto => results.iter().map(|v| describe(lua, v)).collect(),
            }
        })
    }

    /// 在控制台上驱动提示直到结束
    ///
    /// 等待输入期间释放挂起锁。
    pub fn run<C: Console + ?Sized>(&mut self, console: &RefCell<C>) -> io::Result<PromptState> {
        let runtime = Arc::clone(&self.runtime);
        let mut guard = runtime.suspend().lock();
        self.start();
        while self.state == PromptState::AwaitingInput {
            let prompt = self.prompt.as_str();
            let read = runtime
                .suspend()
                .unlocked(&mut guard, || console.borrow_mut().read_line(prompt));
            match read {
                Ok(None) => self.end_of_input(),
                Ok(Some(line)) => {
                    for text in self.feed(&line) {
                        console.borrow_mut().write_out(&text)?;
                    }
                    if runtime.interrupt().is_pending() {
                        self.fail("interrupted");
                    }
                }
                Err(err) => {
                    self.fail(&err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(self.state)
    }

    /// 以字节流作为控制台驱动提示
    pub fn run_console<R: BufRead, W: Write>(
        &mut self,
        input: R,
        output: W,
    ) -> io::Result<PromptState> {
        let console = RefCell::new(StreamConsole::new(input, output, io::stderr()));
        self.run(&console)
    }
}

fn compile(lua: &Lua, mode: LineMode, source: &str, env: Option<Table>) -> LuaResult<Function> {
    let load = |text: &str| {
        let chunk = lua.load(text.to_string()).set_name(CHUNK_NAME);
        match env.clone() {
            Some(env) => chunk.set_environment(env).into_function(),
            None => chunk.into_function(),
        }
    };
    // 经 select 返回，避免尾调用丢掉这一行的调用位置
    let as_expression = load(&format!("return select(1, {}\n)", source));
    match (mode, as_expression) {
        (_, Ok(function)) => Ok(function),
        (LineMode::Auto, Err(_)) => load(source),
        (_, Err(err)) => Err(err),
    }
}

fn store_results(target: &Table, results: &[LuaValue], history_vars: usize) -> LuaResult<()> {
    target.set("_", results.first().cloned().unwrap_or(LuaValue::Nil))?;
    for (k, value) in results.iter().take(history_vars).enumerate() {
        target.set(format!("_{}", k + 1), value.clone())?;
    }
    Ok(())
}

fn describe(lua: &Lua, value: &LuaValue) -> LuaResult<String> {
    let tostring: Function = lua.globals().get("tostring")?;
    tostring.call::<String>(value.clone())
}

fn expand(lua: &Lua, value: &LuaValue) -> LuaResult<Vec<String>> {
    if !matches!(value, LuaValue::Table(_) | LuaValue::UserData(_)) {
        return Ok(vec![describe(lua, value)?]);
    }
    let expanded: LuaResult<Vec<String>> = lua.load(EXPAND).set_name("=expand").call(value.clone());
    match expanded {
        Ok(lines) => Ok(lines),
        // 没有迭代协议的 userdata
        Err(_) => Ok(vec![describe(lua, value)?]),
    }
}
