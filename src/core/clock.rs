use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 单调时钟截止时间，用于有界重试
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }
}

/// 可唤醒的线程睡眠 - 工作线程用它代替 sleep，退出时可以立即唤醒
#[derive(Clone)]
pub struct WakeSignal {
    inner: Arc<WakeInner>,
}

struct WakeInner {
    state: Mutex<WakeState>,
    cond: Condvar,
}

struct WakeState {
    generation: u64,
    closed: bool,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WakeInner {
                state: Mutex::new(WakeState {
                    generation: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// 睡眠 timeout，期间可被 wake()/close() 打断
    ///
    /// 返回 false 表示信号已关闭，线程应退出
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        let generation = state.generation;
        while !state.closed && state.generation == generation {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.closed
    }

    /// 唤醒所有正在睡眠的线程
    pub fn wake(&self) {
        let mut state = self.inner.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.inner.cond.notify_all();
    }

    /// 关闭信号（不可恢复），所有睡眠立即返回 false
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(5));
        assert!(!deadline.expired());
        thread::sleep(Duration::from_millis(10));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_close_interrupts_sleep() {
        let signal = WakeSignal::new();
        let sleeper = signal.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        signal.close();
        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_times_out_while_open() {
        let signal = WakeSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)));
        assert!(!signal.is_closed());
    }
}
