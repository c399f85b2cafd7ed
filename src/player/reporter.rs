use crate::core::{log_ctx, PlayerError, PlayerEvent, Result, WakeSignal};
use crate::player::session::SessionShared;
use log::{debug, info, warn};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_FPS: u32 = 25;
/// 显示缓冲保活的最小间隔
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(10);

/// 码率统计
#[derive(Debug)]
pub struct BitrateMeter {
    start: Option<Instant>,
    start_bytes: u64,
}

impl BitrateMeter {
    pub fn new() -> Self {
        Self {
            start: None,
            start_bytes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.start = None;
        self.start_bytes = 0;
    }

    /// 根据累计字节数更新，返回区间码率 (bps)；第一次调用只建立起点
    pub fn update(&mut self, total_bytes: u64, now: Instant) -> Option<u64> {
        let Some(start) = self.start else {
            self.start = Some(now);
            self.start_bytes = total_bytes;
            return None;
        };
        let elapsed_ms = now.duration_since(start).as_millis() as u64;
        if elapsed_ms == 0 {
            return None;
        }
        let bits = total_bytes.saturating_sub(self.start_bytes) * 8;
        self.start = Some(now);
        self.start_bytes = total_bytes;
        Some(bits * 1000 / elapsed_ms)
    }
}

impl Default for BitrateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// 上报线程周期：1000/fps 毫秒
pub fn report_period(frame_rate: u32) -> Duration {
    let fps = if frame_rate > 0 { frame_rate } else { DEFAULT_FPS };
    Duration::from_millis((1000 / fps.max(1)).max(1) as u64)
}

/// 上报线程 - 刷新显示保活、码率统计，每秒推送一次 Stats 事件
pub struct ReportThread {
    handle: Option<JoinHandle<()>>,
}

impl ReportThread {
    pub(crate) fn spawn(session: Weak<SessionShared>, shutdown: WakeSignal) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("tsplayer-report".into())
            .spawn(move || report_loop(session, shutdown))
            .map_err(PlayerError::IoError)?;
        Ok(Self { handle: Some(handle) })
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 上报线程异常退出", log_ctx());
            }
        }
    }
}

fn report_loop(session: Weak<SessionShared>, shutdown: WakeSignal) {
    info!("{} 📊 上报线程启动", log_ctx());
    let mut period = report_period(0);
    let mut ticks = 0u32;
    let mut last_refresh: Option<Instant> = None;
    let mut meter = BitrateMeter::new();

    while shutdown.sleep(period) {
        let Some(shared) = session.upgrade() else {
            break;
        };
        let Some(mut core) = shared.core.try_lock_for(period) else {
            continue;
        };
        if !core.state.is_running() {
            meter.reset();
            ticks = 0;
            continue;
        }

        let fps = if core.video.frame_rate > 0 { core.video.frame_rate } else { DEFAULT_FPS };
        period = report_period(fps);

        let now = Instant::now();
        if last_refresh.map_or(true, |t| now.duration_since(t) >= KEEP_ALIVE_INTERVAL) {
            if let Some(surface) = shared.surface.as_ref() {
                surface.refresh();
            }
            last_refresh = Some(now);
        }

        ticks += 1;
        if ticks >= fps {
            ticks = 0;
            if let Some(bitrate) = meter.update(core.scheduler.bytes_accepted(), now) {
                core.stats.stream_bitrate = bitrate;
                debug!("{} 📊 写入码率 {} bps", log_ctx(), bitrate);
            }
            let stats = core.snapshot_stats();
            drop(core);
            shared.emit(PlayerEvent::Stats(stats));
        }
    }
    info!("{} 📊 上报线程退出", log_ctx());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_follows_frame_rate() {
        assert_eq!(report_period(0), Duration::from_millis(40));
        assert_eq!(report_period(50), Duration::from_millis(20));
        assert_eq!(report_period(5000), Duration::from_millis(1));
    }

    #[test]
    fn test_bitrate_meter() {
        let mut meter = BitrateMeter::new();
        let t0 = Instant::now();
        assert_eq!(meter.update(1000, t0), None);
        assert_eq!(meter.update(126_000, t0 + Duration::from_secs(1)), Some(1_000_000));
        assert_eq!(meter.update(126_000, t0 + Duration::from_secs(2)), Some(0));
    }
}
