//! 在途调用计数
//!
//! 约定：
//!
//! 1. 调用方在分派前 [`InFlight::enter`]，拿到凭证才可以调用插件代码
//! 2. 凭证析构时计数减一，归零时唤醒等待者
//! 3. 卸载方先 [`InFlight::close`] 拒绝新的进入，再 [`InFlight::wait_idle`]
//!    等待计数归零
//! 4. 重新加载后 [`InFlight::reopen`]

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Counter {
    count: usize,
    closed: bool,
}

/// 单个插件的在途调用计数
#[derive(Debug)]
pub struct InFlight {
    counter: Mutex<Counter>,
    idle: Condvar,
}

impl Default for InFlight {
    fn default() -> Self {
        Self {
            // 插件加载完成前不接受调用
            counter: Mutex::new(Counter {
                count: 0,
                closed: true,
            }),
            idle: Condvar::new(),
        }
    }
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self) -> MutexGuard<'_, Counter> {
        self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 进入一次调用；已关闭时返回 `None`
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        let mut counter = self.counter();
        if counter.closed {
            return None;
        }
        counter.count += 1;
        Some(InFlightGuard {
            owner: Arc::clone(self),
        })
    }

    /// 拒绝新的进入
    pub fn close(&self) {
        self.counter().closed = true;
    }

    pub fn reopen(&self) {
        self.counter().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.counter().closed
    }

    pub fn count(&self) -> usize {
        self.counter().count
    }

    /// 阻塞直到计数归零
    pub fn wait_idle(&self) {
        let mut counter = self.counter();
        while counter.count > 0 {
            counter = self
                .idle
                .wait(counter)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn exit(&self) {
        let mut counter = self.counter();
        counter.count = counter.count.saturating_sub(1);
        if counter.count == 0 {
            self.idle.notify_all();
        }
    }
}

/// 在途调用凭证
#[must_use = "the call is only counted while the guard is alive"]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.exit();
    }
}
