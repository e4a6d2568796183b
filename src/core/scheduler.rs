//! 定时回调调度
//!
//! 回调按两种节奏计时：
//!
//! - `Frames`: 宿主每帧推进一次，类似挂钟时间，模拟卸载后仍然保留
//! - `Ticks`: 宿主模拟每推进一步计一次，模拟卸载时整体取消
//!
//! 队列只负责计时和到期判定，载荷由调用方解释（原生闭包或脚本函数句柄）。

use std::collections::BTreeMap;

/// 计时节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    /// 帧
    Frames,
    /// 模拟步
    Ticks,
}

impl Cadence {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frames" | "frame" => Some(Cadence::Frames),
            "ticks" | "tick" => Some(Cadence::Ticks),
            _ => None,
        }
    }

    /// 是否绑定到模拟生命周期
    pub fn is_simulation(&self) -> bool {
        matches!(self, Cadence::Ticks)
    }
}

/// 定时器 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug)]
struct Timer<T> {
    cadence: Cadence,
    due: u64,
    payload: T,
}

/// 定时器队列
///
/// # 示例
///
/// ```rust
/// use struct_bridge::core::scheduler::{Cadence, TimerQueue};
///
/// let mut queue = TimerQueue::new();
/// queue.schedule(2, Cadence::Frames, "hello");
/// assert!(queue.advance(Cadence::Frames).is_empty());
/// assert_eq!(queue.advance(Cadence::Frames).len(), 1);
/// ```
#[derive(Debug)]
pub struct TimerQueue<T> {
    timers: BTreeMap<TimerId, Timer<T>>,
    frame: u64,
    tick: u64,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
            frame: 0,
            tick: 0,
            next_id: 1,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn now(&self, cadence: Cadence) -> u64 {
        match cadence {
            Cadence::Frames => self.frame,
            Cadence::Ticks => self.tick,
        }
    }

    /// 安排 `delay` 个单位后到期的回调
    pub fn schedule(&mut self, delay: u64, cadence: Cadence, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let due = self.now(cadence) + delay.max(1);
        self.timers.insert(
            id,
            Timer {
                cadence,
                due,
                payload,
            },
        );
        id
    }

    /// 取消定时器，返回其载荷
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.timers.remove(&id).map(|t| t.payload)
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// 仍在等待的定时器的载荷
    pub fn payload(&self, id: TimerId) -> Option<&T> {
        self.timers.get(&id).map(|t| &t.payload)
    }

    /// 推进一个单位，按安排顺序返回到期的回调
    pub fn advance(&mut self, cadence: Cadence) -> Vec<(TimerId, T)> {
        match cadence {
            Cadence::Frames => self.frame += 1,
            Cadence::Ticks => self.tick += 1,
        }
        let now = self.now(cadence);
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.cadence == cadence && t.due <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.timers.remove(&id).map(|t| (id, t.payload)))
            .collect()
    }

    /// 模拟卸载：取消所有按模拟步计时的回调
    pub fn cancel_simulation(&mut self) -> Vec<T> {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.cadence.is_simulation())
            .map(|(id, _)| *id)
            .collect();
        self.tick = 0;
        ids.into_iter()
            .filter_map(|id| self.timers.remove(&id).map(|t| t.payload))
            .collect()
    }

    /// 取出所有定时器
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.timers)
            .into_values()
            .map(|t| t.payload)
            .collect()
    }

    /// 待执行的定时器数
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_and_ticks_are_independent() {
        let mut queue = TimerQueue::new();
        let f = queue.schedule(1, Cadence::Frames, "frame");
        let t = queue.schedule(1, Cadence::Ticks, "tick");

        let due = queue.advance(Cadence::Ticks);
        assert_eq!(due, vec![(t, "tick")]);
        assert!(queue.is_active(f));

        let due = queue.advance(Cadence::Frames);
        assert_eq!(due, vec![(f, "frame")]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_simulation_teardown_keeps_frame_timers() {
        let mut queue = TimerQueue::new();
        let f = queue.schedule(5, Cadence::Frames, 1);
        queue.schedule(5, Cadence::Ticks, 2);
        queue.schedule(9, Cadence::Ticks, 3);

        let cancelled = queue.cancel_simulation();
        assert_eq!(cancelled, vec![2, 3]);
        assert!(queue.is_active(f));
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_cancel_and_order() {
        let mut queue = TimerQueue::new();
        let a = queue.schedule(1, Cadence::Frames, 'a');
        let b = queue.schedule(1, Cadence::Frames, 'b');
        let c = queue.schedule(1, Cadence::Frames, 'c');
        assert_eq!(queue.cancel(b), Some('b'));
        assert_eq!(queue.cancel(b), None);
        let due = queue.advance(Cadence::Frames);
        assert_eq!(due, vec![(a, 'a'), (c, 'c')]);
    }

    #[test]
    fn test_zero_delay_fires_next_advance() {
        let mut queue = TimerQueue::new();
        queue.schedule(0, Cadence::Frames, ());
        assert_eq!(queue.advance(Cadence::Frames).len(), 1);
    }
}
