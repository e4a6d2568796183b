//! 可重启调用
//!
//! 脚本函数在独立的协程中运行。函数可以直接完成，也可以 `coroutine.yield`
//! 交出一个请求，等宿主稍后带着答复恢复它。两种情况的结果都经同一个
//! 续体送达，调用方不需要区分。
//!
//! 在恢复后的运行中产生的错误会被重新包装：外层帧说明是哪个调用在
//! 恢复时失败，原错误作为原因保留。

use super::bridge::ScriptBridge;
use super::hook;
use super::proxy::{to_lua, values};
use crate::access::Value;
use crate::core::error_chain::ErrorChain;
use mlua::{Function, MultiValue, Result as LuaResult, Thread, ThreadStatus};

/// 调用结果的续体
pub type Continuation = Box<dyn FnOnce(Result<Vec<Value>, ErrorChain>)>;

/// 一步运行后的状态
#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    /// 等待恢复，带着脚本交出的值
    Suspended(Vec<Value>),
    /// 已完成，结果已交给续体
    Finished,
}

/// 一次可重启调用
pub struct RestartableCall {
    label: String,
    thread: Thread,
    continuation: Option<Continuation>,
    resumes: usize,
}

impl RestartableCall {
    /// 开始调用全局函数 `function`
    pub fn start(
        bridge: &ScriptBridge,
        function: &str,
        args: &[Value],
        continuation: impl FnOnce(Result<Vec<Value>, ErrorChain>) + 'static,
    ) -> Result<(Self, CallState), ErrorChain> {
        let thread = bridge.run(|lua| {
            let f: Function = lua.globals().get(function)?;
            lua.create_thread(f)
        })?;
        let mut call = Self {
            label: function.to_string(),
            thread,
            continuation: Some(Box::new(continuation)),
            resumes: 0,
        };
        let state = call.step(bridge, args);
        Ok((call, state))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.continuation.is_none()
    }

    /// 已恢复的次数
    pub fn resumes(&self) -> usize {
        self.resumes
    }

    /// 带着答复恢复；已完成的调用不会再次运行
    pub fn resume(&mut self, bridge: &ScriptBridge, reply: &[Value]) -> CallState {
        if self.is_finished() {
            return CallState::Finished;
        }
        self.resumes += 1;
        self.step(bridge, reply)
    }

    fn step(&mut self, bridge: &ScriptBridge, input: &[Value]) -> CallState {
        let thread = self.thread.clone();
        let outcome = bridge.run(|lua| {
            let input = input
                .iter()
                .cloned()
                .map(|v| to_lua(lua, v))
                .collect::<LuaResult<Vec<_>>>()?;
            let output = hook::resume_hooked(lua, &thread, MultiValue::from_vec(input))?;
            let output = values(lua, &output.into_iter().collect::<Vec<_>>())?;
            let suspended = matches!(thread.status(), ThreadStatus::Resumable);
            Ok((output, suspended))
        });

        match outcome {
            Ok((output, true)) => {
                tracing::debug!(target: "script", "{} suspended", self.label);
                CallState::Suspended(output)
            }
            Ok((output, false)) => {
                self.finish(Ok(output));
                CallState::Finished
            }
            Err(err) => {
                let err = if self.resumes > 0 {
                    err.rehome(format!("{}: resumed call failed", self.label))
                } else {
                    err
                };
                self.finish(Err(err));
                CallState::Finished
            }
        }
    }

    fn finish(&mut self, result: Result<Vec<Value>, ErrorChain>) {
        if let Some(continuation) = self.continuation.take() {
            continuation(result);
        }
    }
}
