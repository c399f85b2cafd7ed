use crate::core::{
    log_ctx, BufferState, DecodeMode, Deadline, DecoderState, DecoderStatus, FaultKind, PlayerEvent,
    PlayerError, Result, TrickMode, TsPlayerConfig, VideoFormat, WakeSignal,
};
use crate::player::device::SysHint;
use crate::player::session::{SessionCore, SessionShared};
use log::{debug, error, info, warn};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 每 40 次轮询（约 2 秒）做一次低频检查
pub const LOW_FREQ_TICKS: u32 = 40;
/// 在线升级时每次回放的字节数
pub const REPLAY_CHUNK: usize = 64 * 1024;
/// 回放时设备持续没有消费数据的最长等待，有进展就重新计时
const REPLAY_STALL_TIMEOUT: Duration = Duration::from_secs(3);
const REPLAY_BUSY_DELAY: Duration = Duration::from_millis(1);
/// 标清解码配置能处理的最大分辨率
const HD_MAX_WIDTH: u32 = 1920;
const HD_MAX_HEIGHT: u32 = 1080;
/// 低于该数据量视为欠载
const VIDEO_UNDERFLOW_BYTES: u32 = 256;
const AUDIO_UNDERFLOW_BYTES: u32 = 64;
/// 连续恢复失败多少次上报播放错误
const MAX_RECOVERY_FAILURES: u32 = 2;

/// 看门狗参数（会话创建时读取一次）
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stall_detect: bool,
    pub stall_window: Duration,
    pub settle: Duration,
    pub video_high_water: f32,
    pub audio_high_water: f32,
    /// 关闭 H.264 在线升级和强制复位
    pub same_ucode: bool,
}

impl WatchdogSettings {
    pub fn from_config(config: &TsPlayerConfig) -> Self {
        Self {
            interval: config.watchdog_interval(),
            stall_detect: config.watchdog_stall_detect,
            stall_window: config.stall_window(),
            settle: config.settle_delay(),
            video_high_water: config.video_high_water,
            audio_high_water: config.audio_high_water,
            same_ucode: config.h264_same_ucode,
        }
    }
}

/// 一次轮询看到的解码器状态
#[derive(Debug, Clone, Copy)]
pub struct PollSnapshot {
    pub decoder: DecoderState,
    pub format: VideoFormat,
    pub decode_mode: DecodeMode,
    pub video: BufferState,
    pub audio: BufferState,
    pub has_audio: bool,
    pub has_video: bool,
    pub paused: bool,
}

/// 看门狗决定的恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// H.264 切到 4K 配置并回放影子缓冲
    LiveUpgrade,
    /// 设备级强制复位
    ForceReset,
    /// 完整 Stop + Start
    Restart(FaultKind),
}

/// 看门狗滚动计数器
#[derive(Debug, Default)]
pub struct WatchdogState {
    pub video_underflow: bool,
    pub audio_underflow: bool,
    overflow_since: Option<Instant>,
    prev_video_rp: u32,
    prev_audio_rp: u32,
    tick: u32,
    consecutive_failures: u32,
    force_reset_sent: bool,
}

impl WatchdogState {
    /// 新一轮播放开始时清零
    pub fn reset(&mut self) {
        let failures = self.consecutive_failures;
        *self = Self::default();
        // 恢复失败计数跨越看门狗自己触发的重启
        self.consecutive_failures = failures;
    }

    /// 轮询计数，返回本次是否需要做低频检查
    pub fn advance_tick(&mut self) -> bool {
        self.tick += 1;
        if self.tick >= LOW_FREQ_TICKS {
            self.tick = 0;
            return true;
        }
        false
    }

    /// 按顺序判断故障：4K 溢出 -> 未知错误强制复位 -> 新格式致命错误 -> 缓冲卡死
    pub fn classify(&mut self, snap: &PollSnapshot, settings: &WatchdogSettings, now: Instant) -> WatchdogAction {
        let status = snap.decoder.status;

        if !status.contains(DecoderStatus::FATAL_UNKNOWN) {
            self.force_reset_sent = false;
        }

        if !settings.same_ucode && status.has_error() {
            debug!(
                "{} 解码器状态 {:#x} {}x{}",
                log_ctx(),
                status.0,
                snap.decoder.width,
                snap.decoder.height
            );
            if status.contains(DecoderStatus::FATAL_SIZE_OVERFLOW)
                && snap.format == VideoFormat::H264
                && (snap.decoder.width > HD_MAX_WIDTH || snap.decoder.height > HD_MAX_HEIGHT)
            {
                return WatchdogAction::LiveUpgrade;
            }
            if status.contains(DecoderStatus::FATAL_UNKNOWN)
                && snap.format == VideoFormat::H264
                && !self.force_reset_sent
            {
                self.force_reset_sent = true;
                return WatchdogAction::ForceReset;
            }
        }

        // HEVC 只在非 Single 模式重启，AVS2 任何模式都重启
        let restartable = match snap.format {
            VideoFormat::Hevc => snap.decode_mode != DecodeMode::Single,
            VideoFormat::Avs2 => true,
            _ => false,
        };
        if restartable {
            if let Some(kind) = fatal_kind(status) {
                return WatchdogAction::Restart(kind);
            }
        }

        if settings.stall_detect && !snap.paused {
            return self.check_stall(snap, settings, now);
        }
        WatchdogAction::None
    }

    fn check_stall(&mut self, snap: &PollSnapshot, settings: &WatchdogSettings, now: Instant) -> WatchdogAction {
        let video_stuck = !snap.has_video
            || (snap.video.level() >= settings.video_high_water && snap.video.read_pointer == self.prev_video_rp);
        let audio_stuck = !snap.has_audio
            || (snap.audio.level() >= settings.audio_high_water && snap.audio.read_pointer == self.prev_audio_rp);
        self.prev_video_rp = snap.video.read_pointer;
        self.prev_audio_rp = snap.audio.read_pointer;

        if !(video_stuck && audio_stuck) || !(snap.has_video || snap.has_audio) {
            self.overflow_since = None;
            return WatchdogAction::None;
        }

        let since = *self.overflow_since.get_or_insert(now);
        if now.duration_since(since) < settings.stall_window {
            return WatchdogAction::None;
        }
        if snap.format == VideoFormat::Hevc && snap.decode_mode != DecodeMode::Single {
            // HEVC 非 Single 模式重启会导致设备异常，只记录不处理
            info!("{} 🐶 缓冲卡死超过 {:?}，HEVC 非 Single 模式不重启", log_ctx(), settings.stall_window);
            return WatchdogAction::None;
        }
        self.overflow_since = None;
        WatchdogAction::Restart(FaultKind::BufferStall)
    }

    /// 启动阶段的欠载分类，只在状态变化时返回事件
    pub fn check_underflow(&mut self, snap: &PollSnapshot) -> Option<PlayerEvent> {
        let was_underflow = self.video_underflow || self.audio_underflow;
        let mut check_audio = true;
        if snap.has_video {
            let threshold = if snap.format == VideoFormat::Mjpeg {
                VIDEO_UNDERFLOW_BYTES >> 2
            } else {
                VIDEO_UNDERFLOW_BYTES
            };
            self.video_underflow = snap.video.data_len < threshold;
            if self.video_underflow {
                check_audio = false;
            }
        }
        if snap.has_audio && check_audio {
            self.audio_underflow = snap.audio.data_len < AUDIO_UNDERFLOW_BYTES;
        }
        let now_underflow = self.video_underflow || self.audio_underflow;
        match (was_underflow, now_underflow) {
            (false, true) => {
                warn!(
                    "{} 🐶 启动阶段欠载: video={}, audio={}",
                    log_ctx(),
                    self.video_underflow,
                    self.audio_underflow
                );
                Some(PlayerEvent::Underflow {
                    video: self.video_underflow,
                    audio: self.audio_underflow,
                })
            }
            (true, false) => Some(PlayerEvent::UnderflowEnd),
            _ => None,
        }
    }

    /// 记录一次恢复结果，返回需要上报的事件
    pub fn record_recovery(&mut self, kind: FaultKind, ok: bool) -> Option<PlayerEvent> {
        if ok {
            self.consecutive_failures = 0;
            return Some(PlayerEvent::Recovered(kind));
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_RECOVERY_FAILURES {
            self.consecutive_failures = 0;
            error!("{} ❌ 恢复连续失败，上报播放错误: {:?}", log_ctx(), kind);
            return Some(PlayerEvent::PlaybackError(kind));
        }
        None
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

fn fatal_kind(status: DecoderStatus) -> Option<FaultKind> {
    if status.contains(DecoderStatus::FATAL_SIZE_OVERFLOW) {
        Some(FaultKind::ResolutionOverflow)
    } else if status.contains(DecoderStatus::FATAL_UNKNOWN) {
        Some(FaultKind::Unknown)
    } else if status.contains(DecoderStatus::FATAL_NO_MEM) {
        Some(FaultKind::OutOfMemory)
    } else {
        None
    }
}

/// 看门狗线程 - 周期性轮询解码器，会话忙时跳过本次轮询
pub struct WatchdogMonitor {
    handle: Option<JoinHandle<()>>,
}

impl WatchdogMonitor {
    pub(crate) fn spawn(session: Weak<SessionShared>, shutdown: WakeSignal, settings: WatchdogSettings) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("tsplayer-watchdog".into())
            .spawn(move || watchdog_loop(session, shutdown, settings))
            .map_err(PlayerError::IoError)?;
        Ok(Self { handle: Some(handle) })
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 看门狗线程异常退出", log_ctx());
            }
        }
    }
}

fn watchdog_loop(session: Weak<SessionShared>, shutdown: WakeSignal, settings: WatchdogSettings) {
    info!("{} 🐶 看门狗线程启动，间隔 {:?}", log_ctx(), settings.interval);
    while shutdown.sleep(settings.interval) {
        let Some(shared) = session.upgrade() else {
            break;
        };
        let restart = {
            let Some(mut core) = shared.core.try_lock() else {
                continue;
            };
            poll_once(&shared, &mut core, &settings)
        };
        if let Some(kind) = restart {
            // 设备需要稳定时间，期间不占用会话锁
            if !shutdown.sleep(settings.settle) {
                break;
            }
            let mut core = shared.core.lock();
            finish_restart(&shared, &mut core, kind);
        }
    }
    info!("{} 🐶 看门狗线程退出", log_ctx());
}

/// 一次轮询；返回 Some 表示已经停止，等待稳定后重新启动
pub(crate) fn poll_once(
    shared: &SessionShared,
    core: &mut SessionCore,
    settings: &WatchdogSettings,
) -> Option<FaultKind> {
    if !core.state.is_running() {
        return None;
    }
    let snap = core.poll_snapshot()?;
    let low_freq = core.watchdog.advance_tick();

    match core.watchdog.classify(&snap, settings, Instant::now()) {
        WatchdogAction::None => {}
        WatchdogAction::LiveUpgrade => {
            let kind = FaultKind::ResolutionOverflow;
            shared.emit(PlayerEvent::FaultDetected(kind));
            info!(
                "{} 🐶 H.264 分辨率 {}x{} 超出标清配置，在线切换到 4K",
                log_ctx(),
                snap.decoder.width,
                snap.decoder.height
            );
            let ok = match live_upgrade(core) {
                Ok(replayed) => {
                    info!("{} ✅ 在线升级完成，回放 {} 字节", log_ctx(), replayed);
                    true
                }
                Err(e) => {
                    error!("{} ❌ 在线升级失败: {}", log_ctx(), e);
                    false
                }
            };
            if let Some(event) = core.watchdog.record_recovery(kind, ok) {
                shared.emit(event);
            }
        }
        WatchdogAction::ForceReset => {
            let kind = FaultKind::Unknown;
            shared.emit(PlayerEvent::FaultDetected(kind));
            if shared.sys.force_reset_supported() {
                info!("{} 🐶 H.264 未知致命错误，强制复位解码器", log_ctx());
                shared.sys.apply(SysHint::DecoderForceReset);
            } else {
                info!("{} 🐶 H.264 未知致命错误，设备不支持强制复位", log_ctx());
            }
        }
        WatchdogAction::Restart(kind) => {
            shared.emit(PlayerEvent::FaultDetected(kind));
            warn!("{} 🐶 {:?}，重启播放 (格式 {})", log_ctx(), kind, snap.format.name());
            shared.begin_restart(core);
            return Some(kind);
        }
    }

    if low_freq && core.scheduler.in_startup_window() {
        if let Some(event) = core.watchdog.check_underflow(&snap) {
            shared.emit(event);
        }
    }
    None
}

/// 稳定延时之后完成重启
pub(crate) fn finish_restart(shared: &SessionShared, core: &mut SessionCore, kind: FaultKind) {
    if !core.restart_pending {
        info!("{} 🐶 重启期间会话已被停止，放弃重启", log_ctx());
        return;
    }
    let ok = match shared.complete_restart(core) {
        Ok(()) => true,
        Err(e) => {
            error!("{} ❌ 看门狗重启失败: {}", log_ctx(), e);
            false
        }
    };
    if let Some(event) = core.watchdog.record_recovery(kind, ok) {
        shared.emit(event);
    }
}

/// 4K 在线升级：close + init 为 H264_4K2K，按原顺序回放影子缓冲中的全部数据
pub(crate) fn live_upgrade(core: &mut SessionCore) -> Result<usize> {
    let fast = core.fast;
    let trick = core.trick_mode();
    let Some(ring) = core.ring.take() else {
        return Err(PlayerError::InvalidState("影子缓冲不可用".into()));
    };
    let channel = core
        .channels
        .as_mut()
        .and_then(|set| set.video_mut())
        .ok_or_else(|| PlayerError::InvalidState("没有视频通道".into()))?;

    let started = Instant::now();
    channel.reconfigure(|config| config.video_format = VideoFormat::H264_4K2K)?;
    core.video.format = VideoFormat::H264_4K2K;
    if fast && trick != TrickMode::None {
        channel.set_mode(trick)?;
    }

    let mut replayed = 0usize;
    let mut deadline = Deadline::after(REPLAY_STALL_TIMEOUT);
    loop {
        let chunk = ring.peek_chunk(REPLAY_CHUNK);
        if chunk.is_empty() {
            break;
        }
        let mut offset = 0usize;
        while offset < chunk.len() {
            match channel.write(&chunk[offset..]) {
                Ok(n) if n > 0 => {
                    let n = n.min(chunk.len() - offset);
                    ring.consume(n);
                    offset += n;
                    replayed += n;
                    deadline = Deadline::after(REPLAY_STALL_TIMEOUT);
                }
                Ok(_) | Err(PlayerError::WouldBlock) => {
                    if deadline.expired() {
                        error!(
                            "{} ❌ 回放停滞超过 {:?}，已回放 {} 字节，剩余 {} 字节",
                            log_ctx(),
                            REPLAY_STALL_TIMEOUT,
                            replayed,
                            ring.valid_bytes()
                        );
                        return Err(PlayerError::WouldBlock);
                    }
                    thread::sleep(REPLAY_BUSY_DELAY);
                }
                Err(e) => {
                    error!(
                        "{} ❌ 回放影子缓冲写入失败: {} (已回放 {} 字节，剩余 {} 字节)",
                        log_ctx(),
                        e,
                        replayed,
                        ring.valid_bytes()
                    );
                    return Err(e);
                }
            }
        }
    }
    core.stats.live_upgrades += 1;
    info!("{} 🐶 在线升级耗时 {:?}", log_ctx(), started.elapsed());
    Ok(replayed)
}
