//! 协作式中断
//!
//! 宿主设置标志后，脚本运行时的指令计数钩子在下一次检查时
//! 以 "interrupted" 错误中止当前计算。请求在最外层运行结束前一直有效，
//! 脚本捕获中断后下一次检查仍会再次中止；运行结束时清除，
//! 不会误伤下一次无关的运行。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 中断标志
#[derive(Debug, Default)]
pub struct InterruptFlag {
    pending: AtomicBool,
    active_runs: AtomicUsize,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求中断正在进行的运行
    ///
    /// 没有运行在进行时返回 `false`，标志不会被设置。
    pub fn request(&self) -> bool {
        if self.active_runs.load(Ordering::SeqCst) == 0 {
            return false;
        }
        self.pending.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// 是否有运行在进行
    pub fn is_running(&self) -> bool {
        self.active_runs.load(Ordering::SeqCst) > 0
    }

    /// 标记一次运行开始，返回的凭证析构时标记结束
    pub fn enter_run(&self) -> RunGuard<'_> {
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        RunGuard { flag: self }
    }
}

/// 运行期凭证
pub struct RunGuard<'a> {
    flag: &'a InterruptFlag,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        // 最外层运行结束时清掉未消费的请求
        if self.flag.active_runs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.flag.pending.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_run_is_ignored() {
        let flag = InterruptFlag::new();
        assert!(!flag.request());
        assert!(!flag.is_pending());
    }

    #[test]
    fn test_request_stays_pending_for_the_run() {
        let flag = InterruptFlag::new();
        let run = flag.enter_run();
        assert!(flag.request());
        assert!(flag.is_pending());
        assert!(flag.is_pending());
        drop(run);
        assert!(!flag.is_pending());
    }

    #[test]
    fn test_cleared_when_run_ends() {
        let flag = InterruptFlag::new();
        {
            let _outer = flag.enter_run();
            {
                let _inner = flag.enter_run();
                flag.request();
            }
            assert!(flag.is_pending());
        }
        assert!(!flag.is_pending());
        assert!(!flag.is_running());
    }
}
