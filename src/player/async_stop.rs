use crate::core::{log_ctx, PlayerError, Result};
use crate::player::session::SessionShared;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

#[derive(Debug, Default)]
struct StopRequest {
    pending: bool,
    clear_last_frame: bool,
    closed: bool,
    /// 已完成的异步拆除次数
    completed: u64,
}

struct StopInner {
    request: Mutex<StopRequest>,
    cond: Condvar,
}

/// 异步停止协调器 - 把耗时的通道拆除放到独立线程
///
/// Idle -> Pending -> Idle，同一时间最多一个停止在途
#[derive(Clone)]
pub struct AsyncStopCoordinator {
    inner: Arc<StopInner>,
}

impl AsyncStopCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                request: Mutex::new(StopRequest::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// 提交停止请求；已有请求在途时返回 false
    pub fn try_request(&self) -> bool {
        let mut request = self.inner.request.lock();
        if request.pending || request.closed {
            return false;
        }
        request.pending = true;
        self.inner.cond.notify_all();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.request.lock().pending
    }

    /// 停止在途时把"清除最后一帧"推迟到拆除完成后；返回 false 表示当前没有在途的停止
    pub fn defer_clear_last_frame(&self) -> bool {
        let mut request = self.inner.request.lock();
        if !request.pending {
            return false;
        }
        request.clear_last_frame = true;
        true
    }

    /// 等待在途的停止完成（不能在持有会话锁时调用）
    pub fn wait_idle(&self) {
        let mut request = self.inner.request.lock();
        while request.pending && !request.closed {
            self.inner.cond.wait(&mut request);
        }
    }

    pub fn completed(&self) -> u64 {
        self.inner.request.lock().completed
    }

    /// 关闭协调器，工作线程处理完当前请求后退出
    pub fn close(&self) {
        let mut request = self.inner.request.lock();
        request.closed = true;
        self.inner.cond.notify_all();
    }

    /// 启动工作线程
    pub(crate) fn spawn(&self, session: Weak<SessionShared>) -> Result<JoinHandle<()>> {
        let coordinator = self.clone();
        thread::Builder::new()
            .name("tsplayer-stop".into())
            .spawn(move || coordinator.run(session))
            .map_err(PlayerError::IoError)
    }

    fn run(&self, session: Weak<SessionShared>) {
        info!("{} ⏹ 异步停止线程启动", log_ctx());
        loop {
            {
                let mut request = self.inner.request.lock();
                while !request.pending && !request.closed {
                    self.inner.cond.wait(&mut request);
                }
                if !request.pending {
                    break;
                }
            }

            match session.upgrade() {
                Some(shared) => {
                    info!("{} ⏹ 异步停止: 开始拆除解码通道", log_ctx());
                    {
                        let mut core = shared.core.lock();
                        shared.teardown(&mut core);
                    }
                    let clear = std::mem::take(&mut self.inner.request.lock().clear_last_frame);
                    if clear {
                        shared.sys.clear_last_frame();
                        info!("{} ⏹ 异步停止: 已清除最后一帧", log_ctx());
                    }
                }
                None => warn!("{} ⚠ 会话已释放，跳过异步拆除", log_ctx()),
            }

            let mut request = self.inner.request.lock();
            request.pending = false;
            request.clear_last_frame = false;
            request.completed += 1;
            self.inner.cond.notify_all();
            info!("{} ⏹ 异步停止完成", log_ctx());
        }
        info!("{} ⏹ 异步停止线程退出", log_ctx());
    }
}

impl Default for AsyncStopCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_single_outstanding_request() {
        let coordinator = AsyncStopCoordinator::new();
        assert!(coordinator.try_request());
        assert!(!coordinator.try_request());
        assert!(coordinator.is_pending());
        assert!(coordinator.defer_clear_last_frame());
    }

    #[test]
    fn test_worker_completes_request_without_session() {
        let coordinator = AsyncStopCoordinator::new();
        let handle = coordinator.spawn(Weak::new()).unwrap();
        assert!(coordinator.try_request());
        coordinator.wait_idle();
        assert!(!coordinator.is_pending());
        assert_eq!(coordinator.completed(), 1);
        assert!(!coordinator.defer_clear_last_frame());
        coordinator.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_close_releases_waiters() {
        let coordinator = AsyncStopCoordinator::new();
        assert!(coordinator.try_request());
        let waiter = coordinator.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || waiter.wait_idle());
        thread::sleep(Duration::from_millis(20));
        coordinator.close();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
