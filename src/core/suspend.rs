//! 全局挂起锁
//!
//! 任何会触及宿主内存的脚本执行都必须持有这把锁。锁是可重入的：
//! 同一线程可以嵌套获取，计数归零时才真正释放。
//!
//! 绑定缓存的首次构建和插件卸载的收尾都在持锁状态下进行，
//! 因此读者不会看到半构建的代理或半拆除的插件。

use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// 可重入的进程级挂起锁
#[derive(Debug, Default)]
pub struct SuspendLock {
    state: Mutex<LockState>,
    released: Condvar,
}

/// 持锁凭证，析构时释放一层
///
/// 凭证与获取它的线程绑定，不能跨线程移动。
#[must_use = "the suspend lock is released when the guard is dropped"]
pub struct SuspendGuard<'a> {
    lock: &'a SuspendLock,
    _not_send: PhantomData<*const ()>,
}

impl SuspendLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取锁，必要时阻塞；同一线程重复获取只增加计数
    pub fn lock(&self) -> SuspendGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        SuspendGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// 尝试获取锁，被其他线程持有时立即返回 `None`
    pub fn try_lock(&self) -> Option<SuspendGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state();
        match state.owner {
            Some(owner) if owner != me => None,
            _ => {
                state.owner = Some(me);
                state.depth += 1;
                Some(SuspendGuard {
                    lock: self,
                    _not_send: PhantomData,
                })
            }
        }
    }

    /// 当前线程是否持有锁
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state().owner == Some(thread::current().id())
    }

    /// 当前嵌套层数
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    fn release_one(&self) {
        let mut state = self.state();
        if state.depth > 0 {
            state.depth -= 1;
        }
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }

    /// 暂时完全释放锁执行 `f`，之后恢复原来的嵌套层数
    ///
    /// 交互提示等待输入时使用，等待期间其他线程可以进入。
    pub fn unlocked<R>(&self, _guard: &mut SuspendGuard<'_>, f: impl FnOnce() -> R) -> R {
        let saved = {
            let mut state = self.state();
            let saved = state.depth;
            state.depth = 0;
            state.owner = None;
            self.released.notify_all();
            saved
        };
        let result = f();
        let me = thread::current().id();
        let mut state = self.state();
        while state.owner.is_some() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.owner = Some(me);
        state.depth = saved;
        result
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}
