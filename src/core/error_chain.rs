//! 结构化错误链
//!
//! 原生代码和脚本之间传递的错误不是字符串，而是一组有序的帧：
//! 每帧带消息、来源位置、可选调用栈，以及指向"原因"帧的下标。
//! 渲染是按需的，分简洁（只有消息）和详细（消息 + 调用栈 + 原因链）两种。
//!
//! 错误链是普通的拥有所有权的数据，可以跨线程、跨协程直接复制，
//! 不需要重新绑定到某个执行上下文。

use super::error::{
    AccessError, AllocationError, BridgeError, ContainerError, InvocationError, TypeMismatchError,
    UnionTagError, UnloadedError,
};
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

const TRACEBACK_MARKER: &str = "\nstack traceback:";
const INTERRUPTED: &str = "interrupted";

/// 错误链中的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// 错误消息
    pub message: String,
    /// 错误分类，例如 "AccessError"
    pub category: String,
    /// 来源位置（`file:line` 或脚本块名:行号）
    pub location: Option<String>,
    /// 完整调用栈
    pub trace: Option<String>,
    /// 原因帧的下标
    pub cause: Option<usize>,
}

impl ErrorFrame {
    fn new(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: category.into(),
            location: None,
            trace: None,
            cause: None,
        }
    }
}

/// 渲染模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// 只有消息
    Terse,
    /// 消息 + 调用栈 + 原因链
    Verbose,
}

/// 有序错误帧列表，第 0 帧是最外层错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorChain {
    frames: Vec<ErrorFrame>,
}

impl ErrorChain {
    /// 以调用点为位置创建单帧错误
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let mut frame = ErrorFrame::new(message, "Error");
        frame.location = Some(caller_location());
        Self {
            frames: vec![frame],
        }
    }

    /// 从任意错误的 `source()` 链构造
    #[track_caller]
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let location = caller_location();
        let mut frames: Vec<ErrorFrame> = Vec::new();
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            let index = frames.len();
            if let Some(chain) = e.downcast_ref::<ErrorChain>() {
                // 已经是错误链，直接拼接
                let base = frames.len();
                if let Some(prev) = frames.last_mut() {
                    prev.cause = Some(base);
                }
                frames.extend(chain.frames.iter().cloned().map(|mut f| {
                    f.cause = f.cause.map(|c| c + base);
                    f
                }));
                break;
            }
            let mut frame = ErrorFrame::new(e.to_string(), classify(e));
            if index > 0 {
                frames[index - 1].cause = Some(index);
            }
            if index == 0 {
                frame.location = Some(location.clone());
            }
            frames.push(frame);
            current = e.source();
        }
        Self { frames }
    }

    /// 从脚本运行时错误构造
    pub fn from_lua(err: &mlua::Error) -> Self {
        let mut frames: Vec<ErrorFrame> = Vec::new();
        push_lua_frames(err, &mut frames, None);
        if frames.is_empty() {
            frames.push(ErrorFrame::new(err.to_string(), "Error"));
        }
        Self { frames }
    }

    /// 从脚本错误文本构造：`chunk:line:` 前缀成为位置，附带的调用栈成为 trace
    pub fn from_message(text: &str) -> Self {
        Self {
            frames: vec![message_frame(text, None)],
        }
    }

    /// 附加原因链，原因的所有帧排在本链之后
    pub fn with_cause(mut self, cause: ErrorChain) -> Self {
        let base = self.frames.len();
        // 原因挂在最内层帧上
        if let Some(last) = self.innermost_index() {
            self.frames[last].cause = Some(base);
        }
        self.frames.extend(cause.frames.into_iter().map(|mut f| {
            f.cause = f.cause.map(|c| c + base);
            f
        }));
        self
    }

    /// 设置最外层帧的调用栈
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        if let Some(first) = self.frames.first_mut() {
            first.trace = Some(trace.into());
        }
        self
    }

    /// 设置最外层帧的来源位置
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        if let Some(first) = self.frames.first_mut() {
            first.location = Some(location.into());
        }
        self
    }

    /// 设置最外层帧的分类
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        if let Some(first) = self.frames.first_mut() {
            first.category = category.into();
        }
        self
    }

    /// 在另一个执行上下文中重新包装：外加一帧，原链作为原因
    #[track_caller]
    pub fn rehome(&self, context: impl Into<String>) -> Self {
        ErrorChain::new(context).with_cause(self.clone())
    }

    pub fn frames(&self) -> &[ErrorFrame] {
        &self.frames
    }

    /// 最外层消息
    pub fn message(&self) -> &str {
        self.frames.first().map(|f| f.message.as_str()).unwrap_or("")
    }

    /// 最外层分类
    pub fn category(&self) -> &str {
        self.frames.first().map(|f| f.category.as_str()).unwrap_or("Error")
    }

    /// 最外层帧的原因，作为独立的错误链
    pub fn cause_chain(&self) -> Option<ErrorChain> {
        let start = self.frames.first()?.cause?;
        if start >= self.frames.len() {
            return None;
        }
        let frames = self.frames[start..]
            .iter()
            .cloned()
            .map(|mut f| {
                f.cause = f.cause.and_then(|c| c.checked_sub(start));
                f
            })
            .collect();
        Some(ErrorChain { frames })
    }

    /// 沿原因链走到底的那一帧
    pub fn root_cause(&self) -> Option<&ErrorFrame> {
        self.innermost_index().map(|i| &self.frames[i])
    }

    /// 链中是否有任何一帧属于 `category`
    pub fn has_category(&self, category: &str) -> bool {
        self.frames.iter().any(|f| f.category == category)
    }

    /// 是否由中断引起
    pub fn is_interrupted(&self) -> bool {
        self.has_category("Interrupted")
    }

    fn innermost_index(&self) -> Option<usize> {
        if self.frames.is_empty() {
            return None;
        }
        let mut index = 0;
        let mut steps = 0;
        while let Some(next) = self.frames[index].cause {
            if next >= self.frames.len() || steps > self.frames.len() {
                break;
            }
            index = next;
            steps += 1;
        }
        Some(index)
    }

    /// 渲染错误
    pub fn render(&self, verbosity: Verbosity) -> String {
        match verbosity {
            Verbosity::Terse => self.message().to_string(),
            Verbosity::Verbose => {
                let mut out = String::new();
                let mut index = if self.frames.is_empty() { None } else { Some(0) };
                let mut first = true;
                let mut steps = 0;
                while let Some(i) = index {
                    if steps > self.frames.len() {
                        break;
                    }
                    let frame = &self.frames[i];
                    if !first {
                        out.push_str("\ncaused by: ");
                    }
                    out.push_str(&frame.message);
                    if let Some(location) = &frame.location {
                        out.push_str("\n  at ");
                        out.push_str(location);
                    }
                    if let Some(trace) = &frame.trace {
                        out.push('\n');
                        out.push_str(trace.trim_end());
                    }
                    first = false;
                    steps += 1;
                    index = frame.cause.filter(|c| *c < self.frames.len());
                }
                out
            }
        }
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl StdError for ErrorChain {}

impl From<BridgeError> for ErrorChain {
    #[track_caller]
    fn from(err: BridgeError) -> Self {
        ErrorChain::from_error(&err)
    }
}

#[track_caller]
fn caller_location() -> String {
    let location = Location::caller();
    format!("{}:{}", location.file(), location.line())
}

/// 尝试把错误归类到分类名
fn classify(err: &(dyn StdError + 'static)) -> String {
    if let Some(e) = err.downcast_ref::<BridgeError>() {
        return e.category().to_string();
    }
    if let Some(e) = err.downcast_ref::<Box<BridgeError>>() {
        return e.category().to_string();
    }
    let name = if err.is::<AccessError>() {
        "AccessError"
    } else if err.is::<TypeMismatchError>() {
        "TypeMismatchError"
    } else if err.is::<AllocationError>() {
        "AllocationError"
    } else if err.is::<InvocationError>() {
        "InvocationError"
    } else if err.is::<UnloadedError>() {
        "UnloadedError"
    } else if err.is::<UnionTagError>() {
        "UnionTagError"
    } else if err.is::<ContainerError>() {
        "ContainerError"
    } else {
        "Error"
    };
    name.to_string()
}

/// 拆分 `chunk:line: message` 形式的脚本错误
fn split_location(message: &str) -> (Option<String>, String) {
    // 块名本身可能包含冒号，从 ": " 处往回找行号
    if let Some(pos) = message.find(": ") {
        let head = &message[..pos];
        if let Some(colon) = head.rfind(':') {
            let line = &head[colon + 1..];
            if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) {
                return (Some(head.to_string()), message[pos + 2..].to_string());
            }
        }
    }
    (None, message.to_string())
}

/// 把脚本运行时附加的调用栈从消息中分离出来
pub(crate) fn split_traceback(message: &str) -> (&str, Option<&str>) {
    match message.find(TRACEBACK_MARKER) {
        Some(pos) => (&message[..pos], Some(message[pos + 1..].trim_end())),
        None => (message, None),
    }
}

fn message_frame(text: &str, trace: Option<String>) -> ErrorFrame {
    let (head, traceback) = split_traceback(text);
    let (location, message) = split_location(head);
    let category = if message == INTERRUPTED { "Interrupted" } else { "Error" };
    let mut frame = ErrorFrame::new(message, category);
    frame.location = location;
    frame.trace = traceback.map(str::to_string).or(trace);
    frame
}

fn push_lua_frames(err: &mlua::Error, frames: &mut Vec<ErrorFrame>, trace: Option<String>) {
    let link = |frames: &mut Vec<ErrorFrame>| {
        let index = frames.len();
        if index > 0 {
            frames[index - 1].cause = Some(index);
        }
    };
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            push_lua_frames(cause, frames, Some(traceback.clone()));
        }
        mlua::Error::WithContext { context, cause } => {
            link(frames);
            let mut frame = ErrorFrame::new(context.clone(), "Error");
            frame.trace = trace;
            frames.push(frame);
            push_lua_frames(cause, frames, None);
        }
        mlua::Error::ExternalError(external) => {
            let inner: &(dyn StdError + 'static) = external.as_ref();
            let chain = match inner.downcast_ref::<ErrorChain>() {
                Some(chain) => chain.clone(),
                None => ErrorChain::from_error(inner),
            };
            link(frames);
            let base = frames.len();
            let mut first = true;
            for mut f in chain.frames {
                f.cause = f.cause.map(|c| c + base);
                if first {
                    if f.trace.is_none() {
                        f.trace = trace.clone();
                    }
                    first = false;
                }
                frames.push(f);
            }
        }
        mlua::Error::RuntimeError(message) => {
            link(frames);
            frames.push(message_frame(message, trace));
        }
        mlua::Error::SyntaxError { message, .. } => {
            link(frames);
            let (location, message) = split_location(message);
            let mut frame = ErrorFrame::new(message, "SyntaxError");
            frame.location = location;
            frames.push(frame);
        }
        other => {
            link(frames);
            let mut frame = ErrorFrame::new(other.to_string(), "Error");
            frame.trace = trace;
            frames.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::FieldOp;

    #[test]
    fn test_terse_and_verbose_render() {
        let err: BridgeError = AccessError::field(
            FieldOp::Write,
            "creature",
            "hp",
            AccessError::Expected("integer"),
        )
        .into();
        let chain = ErrorChain::from(err);
        assert_eq!(
            chain.render(Verbosity::Terse),
            "Cannot write field creature.hp: integer expected."
        );
        let verbose = chain.render(Verbosity::Verbose);
        assert!(verbose.contains("caused by: integer expected"));
        assert!(verbose.contains("error_chain.rs"));
        assert_eq!(chain.category(), "AccessError");
    }

    #[test]
    fn test_with_cause_links_innermost() {
        let outer = ErrorChain::new("while loading").with_category("PluginError");
        let inner = ErrorChain::new("file missing");
        let chain = outer.with_cause(inner);
        assert_eq!(chain.frames().len(), 2);
        assert_eq!(chain.frames()[0].cause, Some(1));
        assert_eq!(chain.root_cause().unwrap().message, "file missing");
        let cause = chain.cause_chain().unwrap();
        assert_eq!(cause.message(), "file missing");
        assert!(cause.cause_chain().is_none());
    }

    #[test]
    fn test_rehome_keeps_original_as_cause() {
        let original = ErrorChain::new("inner failure");
        let rehomed = original.rehome("resumed call failed");
        assert_eq!(rehomed.message(), "resumed call failed");
        assert_eq!(rehomed.root_cause().unwrap().message, "inner failure");
    }

    #[test]
    fn test_split_location() {
        let (loc, msg) = split_location("[string \"x\"]:3: boom");
        assert_eq!(loc.as_deref(), Some("[string \"x\"]:3"));
        assert_eq!(msg, "boom");
        let (loc, msg) = split_location("plain: text");
        assert!(loc.is_none());
        assert_eq!(msg, "plain: text");
    }

    #[test]
    fn test_from_lua_runtime_error() {
        let err = mlua::Error::RuntimeError("chunk:7: interrupted".to_string());
        let chain = ErrorChain::from_lua(&err);
        assert!(chain.is_interrupted());
        assert_eq!(chain.frames()[0].location.as_deref(), Some("chunk:7"));
    }

    #[test]
    fn test_runtime_error_traceback_moves_to_trace() {
        let err = mlua::Error::RuntimeError(
            "chunk:2: boom\nstack traceback:\n\t[C]: in function 'error'\n\tchunk:2: in main chunk"
                .to_string(),
        );
        let chain = ErrorChain::from_lua(&err);
        let frame = &chain.frames()[0];
        assert_eq!(frame.message, "boom");
        assert_eq!(frame.location.as_deref(), Some("chunk:2"));
        assert!(frame.trace.as_deref().unwrap().starts_with("stack traceback:"));
        assert!(!chain.is_interrupted());

        let err = mlua::Error::RuntimeError("interrupted\nstack traceback:\n\t[C]: ?".to_string());
        assert!(ErrorChain::from_lua(&err).is_interrupted());
    }

    #[test]
    fn test_from_message_splits_location_and_trace() {
        let chain = ErrorChain::from_message("=init:4: bad value\nstack traceback:\n\t...");
        assert_eq!(chain.message(), "bad value");
        assert_eq!(chain.frames()[0].location.as_deref(), Some("=init:4"));
        assert!(chain.frames()[0].trace.is_some());
        assert!(ErrorChain::from_message("no location").frames()[0].location.is_none());
    }

    #[test]
    fn test_from_lua_external_chain() {
        let inner = ErrorChain::new("native failure").with_category("InvocationError");
        let err = mlua::Error::external(inner);
        let chain = ErrorChain::from_lua(&err);
        assert_eq!(chain.message(), "native failure");
        assert_eq!(chain.category(), "InvocationError");
    }
}
