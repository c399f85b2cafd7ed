use crate::core::{
    log_ctx, AudioBalance, AudioParams, AvBufferStatus, ChannelRole, DecodeMode, DecoderState, DemuxMode,
    PlaybackState, PlaybackStats, PlayerError, PlayerEvent, PropertyStore, Result, StreamType, SubtitleParams,
    TrickMode, TsPlayerConfig, VideoFormat, VideoParams, WakeSignal, WindowRect, NO_PTS,
};
use crate::player::async_stop::AsyncStopCoordinator;
use crate::player::codec_channel::{ChannelSet, CodecChannel};
use crate::player::device::{
    CodecConfig, DeviceProvider, ElementaryExtractor, NullSysControl, SubtitleService, SysControl, SysHint,
    VideoSurface,
};
use crate::player::extractor_thread::ExtractorThread;
use crate::player::header_recovery::{HeaderPhase, HeaderRecoveryPipeline};
use crate::player::reporter::ReportThread;
use crate::player::shadow_ring::ShadowRingBuffer;
use crate::player::watchdog::{PollSnapshot, WatchdogMonitor, WatchdogSettings, WatchdogState};
use crate::player::write_scheduler::{WriteScheduler, WriteSettings, WriteTaps};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// 音频参数列表最大长度
pub const MAX_AUDIO_PARAMS: usize = 10;
/// 字幕参数列表最大长度
pub const MAX_SUBTITLE_PARAMS: usize = 8;
const MAX_VOLUME: i32 = 100;
const MAX_ERROR_RECOVERY_MODE: u8 = 3;

/// 播放事件分发（每个订阅者一个无界 channel）
struct EventBus {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl EventBus {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: PlayerEvent) {
        // 接收端已 drop 的订阅者直接移除
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// 会话锁保护的全部可变状态
pub(crate) struct SessionCore {
    provider: Arc<dyn DeviceProvider>,
    pub(crate) state: PlaybackState,
    pub(crate) fast: bool,
    demux: DemuxMode,
    pub(crate) video: VideoParams,
    audio: Vec<AudioParams>,
    audio_index: usize,
    subtitles: Vec<SubtitleParams>,
    sub_index: usize,
    window: Option<WindowRect>,
    video_visible: bool,
    volume: i32,
    balance: AudioBalance,
    blackout: bool,
    pub(crate) channels: Option<ChannelSet>,
    pub(crate) ring: Option<ShadowRingBuffer>,
    header: Option<HeaderRecoveryPipeline>,
    pub(crate) scheduler: WriteScheduler,
    pub(crate) watchdog: WatchdogState,
    pub(crate) stats: PlaybackStats,
    /// 看门狗已停止通道，等待稳定后重新启动
    pub(crate) restart_pending: bool,
    /// 本次拆除是否保留解码器内存（快进切换/重启）
    keep_memory: bool,
    decode_mode: DecodeMode,
    has_video: bool,
    has_audio: bool,
    has_sub: bool,
    fix_duration: bool,
    extractor: Option<Box<dyn ElementaryExtractor>>,
    extractor_thread: Option<ExtractorThread>,
    dump_index: u32,
}

impl SessionCore {
    fn new(
        provider: Arc<dyn DeviceProvider>,
        config: &TsPlayerConfig,
        extractor: Option<Box<dyn ElementaryExtractor>>,
    ) -> Self {
        Self {
            provider,
            state: PlaybackState::Idle,
            fast: false,
            demux: if config.soft_demux { DemuxMode::Split } else { DemuxMode::Combined },
            video: VideoParams::default(),
            audio: Vec::new(),
            audio_index: 0,
            subtitles: Vec::new(),
            sub_index: 0,
            window: None,
            video_visible: true,
            volume: MAX_VOLUME,
            balance: AudioBalance::Stereo,
            blackout: config.blackout_policy,
            channels: None,
            ring: None,
            header: None,
            scheduler: WriteScheduler::new(WriteSettings::from_config(config)),
            watchdog: WatchdogState::default(),
            stats: PlaybackStats::default(),
            restart_pending: false,
            keep_memory: false,
            decode_mode: DecodeMode::Single,
            has_video: false,
            has_audio: false,
            has_sub: false,
            fix_duration: false,
            extractor,
            extractor_thread: None,
            dump_index: 0,
        }
    }

    fn selected_audio(&self) -> Option<AudioParams> {
        self.audio.get(self.audio_index).copied()
    }

    /// 快进时使用的特技模式
    pub(crate) fn trick_mode(&self) -> TrickMode {
        if !self.fast {
            TrickMode::None
        } else if self.video.format.uses_hevc_trick_mode() {
            TrickMode::IFrameHevc
        } else {
            TrickMode::IFrame
        }
    }

    /// 看门狗一次轮询需要的全部状态
    pub(crate) fn poll_snapshot(&mut self) -> Option<PollSnapshot> {
        let has_audio = self.has_audio;
        let has_video = self.has_video;
        let set = self.channels.as_mut()?;
        let decoder = set.primary_mut()?.decoder_state();
        let video = if has_video {
            set.video_mut().map(|c| c.video_buffer_state()).unwrap_or_default()
        } else {
            Default::default()
        };
        let audio = if has_audio {
            set.audio_mut().map(|c| c.audio_buffer_state()).unwrap_or_default()
        } else {
            Default::default()
        };
        Some(PollSnapshot {
            decoder,
            format: self.video.format,
            decode_mode: self.decode_mode,
            video,
            audio,
            has_audio,
            has_video,
            paused: self.state == PlaybackState::Paused,
        })
    }

    pub(crate) fn snapshot_stats(&self) -> PlaybackStats {
        PlaybackStats {
            bytes_offered: self.scheduler.bytes_offered(),
            bytes_accepted: self.scheduler.bytes_accepted(),
            write_calls: self.scheduler.write_calls(),
            video_underflow: self.watchdog.video_underflow,
            audio_underflow: self.watchdog.audio_underflow,
            ..self.stats
        }
    }

    fn running_audio_channel(&mut self) -> Option<&mut CodecChannel> {
        if !self.state.is_running() || !self.has_audio {
            return None;
        }
        self.channels.as_mut()?.audio_mut()
    }

    fn decode_mode_for(&self, config: &TsPlayerConfig) -> DecodeMode {
        let mut mode = if config.multi_play { DecodeMode::Stream } else { DecodeMode::Single };
        if config.force_single_mode {
            mode = DecodeMode::Single;
        }
        if config.force_multi_mode {
            mode = DecodeMode::Stream;
        }
        if self.fast && self.video.format == VideoFormat::Hevc {
            mode = DecodeMode::Stream;
        }
        if self.video.format == VideoFormat::Avs {
            mode = DecodeMode::Single;
        }
        mode
    }
}

/// 会话共享部分：工作线程通过 Weak 引用访问
pub(crate) struct SessionShared {
    pub(crate) core: Mutex<SessionCore>,
    pub(crate) config: TsPlayerConfig,
    pub(crate) sys: Arc<dyn SysControl>,
    pub(crate) surface: Option<Arc<dyn VideoSurface>>,
    subtitles: Option<Arc<dyn SubtitleService>>,
    events: EventBus,
    stopper: AsyncStopCoordinator,
    weak: Weak<SessionShared>,
}

impl SessionShared {
    pub(crate) fn emit(&self, event: PlayerEvent) {
        self.events.emit(event);
    }

    /// Idle -> Playing/Fast：选择解复用/解码模式，打开通道并应用待定配置
    fn start_locked(&self, core: &mut SessionCore) -> Result<()> {
        let config = &self.config;
        let audio = core.selected_audio();
        let mut has_audio = audio.map_or(false, |a| a.pid != 0 || (config.multi_play && a.sample_rate != 0));
        if core.fast || !config.has_audio {
            has_audio = false;
        }
        let has_video =
            config.has_video && (core.video.pid != 0 || core.video.format != VideoFormat::Unknown);
        if !has_video && !has_audio {
            return Err(PlayerError::ConfigurationInvalid("没有可播放的音视频流".into()));
        }
        let subtitle = core.subtitles.get(core.sub_index).copied();
        let has_sub = match core.demux {
            DemuxMode::Combined => subtitle.map_or(false, |s| s.pid != 0),
            DemuxMode::Split => subtitle.map_or(false, |s| s.sub_type != 0),
        };
        let decode_mode = core.decode_mode_for(config);

        let mut base = CodecConfig::new(ChannelRole::Combined);
        base.video_format = core.video.format;
        base.video_pid = core.video.pid;
        base.frame_rate = core.video.frame_rate;
        if let Some(audio) = audio {
            base.audio_format = audio.format;
            base.audio_pid = audio.pid;
            base.audio_sample_rate = audio.sample_rate;
            base.audio_channels = audio.channels;
        }
        base.sub_pid = subtitle.map_or(0, |s| s.pid);
        base.decode_mode = decode_mode;
        base.no_poc_reorder = core.fast && decode_mode == DecodeMode::Stream && core.video.format == VideoFormat::H264;

        let mut set = match core.demux {
            DemuxMode::Combined => {
                let mut combined = base.clone();
                combined.has_video = has_video;
                combined.has_audio = has_audio;
                combined.has_sub = has_sub;
                ChannelSet::Combined(CodecChannel::new(core.provider.create(ChannelRole::Combined), combined))
            }
            DemuxMode::Split => {
                let video = has_video.then(|| {
                    let mut video = base.clone();
                    video.role = ChannelRole::Video;
                    video.has_video = true;
                    CodecChannel::new(core.provider.create(ChannelRole::Video), video)
                });
                let audio = has_audio.then(|| {
                    let mut audio = base.clone();
                    audio.role = ChannelRole::Audio;
                    audio.has_audio = true;
                    CodecChannel::new(core.provider.create(ChannelRole::Audio), audio)
                });
                ChannelSet::Split { video, audio }
            }
        };

        if let Err(e) = set.init_all() {
            error!("{} ❌ Start 失败，解码通道无法打开: {}", log_ctx(), e);
            return Err(e);
        }

        let trick = core.trick_mode();
        if trick != TrickMode::None {
            if let Some(video) = set.video_mut() {
                video.set_mode(trick)?;
                video.set_freerun(true)?;
            }
        }

        core.fix_duration = has_video && !has_audio && !core.fast;
        if core.fix_duration {
            self.sys.apply(SysHint::FixDuration(true));
        }
        self.sys.apply(SysHint::AvSync(has_video && has_audio && !core.fast));
        self.sys.apply(SysHint::KeepDecoderMemory(true));

        if has_audio {
            if let Some(channel) = set.audio_mut() {
                channel.set_volume(core.volume as f32 / MAX_VOLUME as f32)?;
                channel.set_audio_balance(core.balance)?;
            }
        }
        if let (Some(rect), Some(surface)) = (core.window, self.surface.as_ref()) {
            surface.set_geometry(rect);
        }
        if has_sub {
            if let (Some(params), Some(service)) = (subtitle, self.subtitles.as_ref()) {
                service.open(&params);
                service.show();
            }
        }

        core.ring = (has_video && core.video.format.is_legacy_h264() && !config.h264_same_ucode)
            .then(|| ShadowRingBuffer::allocate(config.ring_capacity()));
        core.header = (config.header_recovery
            && has_video
            && core.video.format == VideoFormat::Hevc
            && core.demux == DemuxMode::Combined)
            .then(|| HeaderRecoveryPipeline::start(core.video.pid, Duration::from_millis(config.header_capture_ms)));

        core.scheduler.begin_session();
        if config.dump_file {
            let index = core.dump_index;
            core.dump_index += 1;
            if let Err(e) = core.scheduler.open_dump(&config.dump_path, index) {
                warn!("{} ⚠ 无法创建 dump 文件: {}", log_ctx(), e);
            }
        }

        if core.demux == DemuxMode::Split && config.uses_extractor() {
            match core.extractor.take() {
                Some(extractor) => {
                    let thread = ExtractorThread::start(
                        self.weak.clone(),
                        extractor,
                        Duration::from_millis(config.extractor_poll_ms),
                        core.scheduler.backoff_hint(),
                    );
                    match thread {
                        Ok(thread) => core.extractor_thread = Some(thread),
                        Err(e) => error!("{} ❌ 解复用线程启动失败: {}", log_ctx(), e),
                    }
                }
                None => warn!("{} ⚠ 分离模式需要软件解复用器，但没有提供", log_ctx()),
            }
        }

        core.channels = Some(set);
        core.decode_mode = decode_mode;
        core.has_video = has_video;
        core.has_audio = has_audio;
        core.has_sub = has_sub;
        core.watchdog.reset();
        core.state = if core.fast { PlaybackState::Fast } else { PlaybackState::Playing };
        info!(
            "{} ▶ 开始播放: demux={:?}, vfmt={}, vpid={}, has_audio={}, has_sub={}, mode={:?}, fast={}",
            log_ctx(),
            core.demux,
            core.video.format.name(),
            core.video.pid,
            has_audio,
            has_sub,
            decode_mode,
            core.fast
        );
        self.emit(PlayerEvent::Started);
        Ok(())
    }

    /// 同步拆除：关闭通道，释放影子缓冲和头恢复队列（可重复调用）
    pub(crate) fn teardown(&self, core: &mut SessionCore) {
        if let Some(mut thread) = core.extractor_thread.take() {
            if let Some(extractor) = thread.stop() {
                core.extractor = Some(extractor);
            }
        }

        let had_channels = core.channels.is_some();
        if let Some(mut set) = core.channels.take() {
            self.sys.apply(SysHint::KeepDecoderMemory(core.keep_memory));
            self.sys.apply(SysHint::BlackoutPolicy(core.blackout));
            set.close_all();
            core.stats.teardowns += 1;
        }
        if core.fix_duration {
            self.sys.apply(SysHint::FixDuration(false));
            core.fix_duration = false;
        }
        core.ring = None;
        if let Some(mut header) = core.header.take() {
            header.shutdown();
        }
        if core.has_sub {
            if let Some(service) = self.subtitles.as_ref() {
                service.close();
            }
            core.has_sub = false;
        }
        core.scheduler.close_dump();
        core.keep_memory = false;
        core.has_video = false;
        core.has_audio = false;
        core.state = PlaybackState::Idle;

        if had_channels {
            info!("{} ⏹ 播放已停止 (累计拆除 {} 次)", log_ctx(), core.stats.teardowns);
            self.emit(PlayerEvent::Stopped);
        }
    }

    /// 看门狗重启第一步：停止通道，状态保持 Stopping 直到重新启动
    pub(crate) fn begin_restart(&self, core: &mut SessionCore) {
        core.keep_memory = true;
        self.teardown(core);
        core.stats.restarts += 1;
        core.restart_pending = true;
        core.state = PlaybackState::Stopping;
    }

    pub(crate) fn complete_restart(&self, core: &mut SessionCore) -> Result<()> {
        core.restart_pending = false;
        core.state = PlaybackState::Idle;
        self.start_locked(core)
    }

    /// 写入入口（调用方线程和解复用线程共用）
    pub(crate) fn submit_locked(
        &self,
        core: &mut SessionCore,
        stream: StreamType,
        data: &[u8],
        pts: u64,
    ) -> Result<usize> {
        match core.state {
            PlaybackState::Idle => return Err(PlayerError::InvalidState("未开始播放".into())),
            PlaybackState::Stopping => return Err(PlayerError::WouldBlock),
            _ => {}
        }

        if stream == StreamType::Ts && core.demux == DemuxMode::Split {
            let Some(thread) = core.extractor_thread.as_ref() else {
                return Err(PlayerError::ConfigurationInvalid("分离模式只接受 ES 数据".into()));
            };
            let result = thread.push(data);
            let accepted = *result.as_ref().unwrap_or(&0);
            core.scheduler.record_external(data.len(), accepted, data);
            return result;
        }

        self.submit_to_channel(core, stream, data, pts, false)
    }

    /// 解复用线程解出的 ES 包；管道写入时已经计过字节数
    pub(crate) fn submit_extracted(
        &self,
        core: &mut SessionCore,
        stream: StreamType,
        data: &[u8],
        pts: u64,
    ) -> Result<usize> {
        match core.state {
            PlaybackState::Idle => return Err(PlayerError::InvalidState("未开始播放".into())),
            PlaybackState::Stopping => return Err(PlayerError::WouldBlock),
            _ => {}
        }
        self.submit_to_channel(core, stream, data, pts, true)
    }

    fn submit_to_channel(
        &self,
        core: &mut SessionCore,
        stream: StreamType,
        data: &[u8],
        pts: u64,
        relayed: bool,
    ) -> Result<usize> {
        let SessionCore {
            channels,
            ring,
            header,
            scheduler,
            demux,
            ..
        } = core;
        let Some(set) = channels.as_mut() else {
            return Err(PlayerError::InvalidState("解码通道未打开".into()));
        };
        let split = *demux == DemuxMode::Split;
        let channel = match stream {
            StreamType::Ts if !split => set.video_mut(),
            StreamType::Video if split => set.video_mut(),
            StreamType::Audio if split => match set.audio_mut() {
                Some(channel) => Some(channel),
                // 没有音频通道时直接丢弃音频数据
                None => return Ok(data.len()),
            },
            _ => {
                return Err(PlayerError::ConfigurationInvalid(format!(
                    "{:?} 模式不接受 {:?} 数据",
                    demux, stream
                )))
            }
        };
        let Some(channel) = channel else {
            return Err(PlayerError::InvalidState(format!("没有可接收 {:?} 数据的通道", stream)));
        };

        let taps = WriteTaps {
            ring: if stream == StreamType::Audio { None } else { ring.as_ref() },
            header: if stream == StreamType::Ts { header.as_ref() } else { None },
        };
        let result = if relayed {
            scheduler.submit_relayed(channel, stream, data, pts, taps)
        } else {
            scheduler.submit(channel, stream, data, pts, taps)
        };
        if scheduler.take_first_write() {
            info!("{} 🎉 Start 后第一次写入成功", log_ctx());
            self.emit(PlayerEvent::FirstWrite);
        }
        result
    }

    /// Seek 后把恢复的参数集包写入一次
    fn replay_header(&self, core: &mut SessionCore, header: &[u8]) {
        let SessionCore { channels, scheduler, stats, .. } = core;
        let Some(channel) = channels.as_mut().and_then(|set| set.video_mut()) else {
            return;
        };
        match scheduler.submit(channel, StreamType::Ts, header, NO_PTS, WriteTaps::default()) {
            Ok(n) => info!("{} 🧩 Seek 后重新注入 TS 头 {} 字节", log_ctx(), n),
            Err(e) => warn!("{} ⚠ TS 头注入失败: {}", log_ctx(), e),
        }
        stats.header_replays += 1;
    }

    fn pause_channels(core: &mut SessionCore) -> Result<()> {
        if let Some(set) = core.channels.as_mut() {
            for channel in set.channels_mut() {
                channel.pause()?;
            }
        }
        Ok(())
    }
}

/// 播放会话 - 对外接口
///
/// Idle --Start--> Playing --Pause--> Paused --Resume--> Playing
/// Playing --Fast--> Fast --StopFast--> Playing
/// 任意运行状态 --Stop--> Idle（异步模式下经过 Stopping）
pub struct PlaybackSession {
    shared: Arc<SessionShared>,
    shutdown: WakeSignal,
    watchdog: Option<WatchdogMonitor>,
    reporter: Option<ReportThread>,
    stop_worker: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn builder(provider: Arc<dyn DeviceProvider>) -> SessionBuilder {
        SessionBuilder::new(provider)
    }

    // ========== 参数配置 ==========

    pub fn init_video(&self, params: VideoParams) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.state.is_running() {
            return Err(PlayerError::InvalidState("播放中不能修改视频参数".into()));
        }
        info!(
            "{} 🎞 视频参数: pid={}, fmt={}, {}x{}@{}",
            log_ctx(),
            params.pid,
            params.format.name(),
            params.width,
            params.height,
            params.frame_rate
        );
        core.video = params;
        Ok(())
    }

    /// 音频参数列表，遇到 pid 和采样率都为 0 的项结束
    pub fn init_audio(&self, params: &[AudioParams]) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.state.is_running() {
            return Err(PlayerError::InvalidState("播放中不能修改音频参数".into()));
        }
        core.audio = params
            .iter()
            .take_while(|a| !a.is_terminator())
            .take(MAX_AUDIO_PARAMS)
            .copied()
            .collect();
        core.audio_index = 0;
        info!("{} 🔊 音频参数 {} 项", log_ctx(), core.audio.len());
        Ok(())
    }

    /// 字幕参数列表，遇到 pid 为 0 的项结束
    pub fn init_subtitle(&self, params: &[SubtitleParams]) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.state.is_running() {
            return Err(PlayerError::InvalidState("播放中不能修改字幕参数".into()));
        }
        core.subtitles = params
            .iter()
            .take_while(|s| s.pid != 0)
            .take(MAX_SUBTITLE_PARAMS)
            .copied()
            .collect();
        core.sub_index = 0;
        Ok(())
    }

    pub fn set_video_window(&self, rect: WindowRect) -> Result<()> {
        if !rect.is_valid() {
            return Err(PlayerError::ConfigurationInvalid(format!("窗口尺寸无效: {:?}", rect)));
        }
        let mut core = self.shared.core.lock();
        core.window = Some(rect);
        if core.state.is_running() {
            if let Some(surface) = self.shared.surface.as_ref() {
                surface.set_geometry(rect);
            }
        }
        Ok(())
    }

    pub fn video_show(&self) {
        self.set_video_visible(true);
    }

    pub fn video_hide(&self) {
        self.set_video_visible(false);
    }

    fn set_video_visible(&self, visible: bool) {
        let mut core = self.shared.core.lock();
        core.video_visible = visible;
        self.shared.sys.apply(SysHint::VideoVisible(visible));
    }

    pub fn is_video_visible(&self) -> bool {
        self.shared.core.lock().video_visible
    }

    /// 音量 0 - 100
    pub fn set_volume(&self, volume: i32) -> Result<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(PlayerError::ConfigurationInvalid(format!("音量 {} 超出范围 0..=100", volume)));
        }
        let mut core = self.shared.core.lock();
        if let Some(channel) = core.running_audio_channel() {
            channel.set_volume(volume as f32 / MAX_VOLUME as f32)?;
        }
        core.volume = volume;
        Ok(())
    }

    pub fn volume(&self) -> i32 {
        self.shared.core.lock().volume
    }

    pub fn set_audio_balance(&self, balance: AudioBalance) -> Result<()> {
        let mut core = self.shared.core.lock();
        if let Some(channel) = core.running_audio_channel() {
            channel.set_audio_balance(balance)?;
        }
        core.balance = balance;
        self.shared.sys.apply(SysHint::ChannelMask(balance));
        Ok(())
    }

    pub fn audio_balance(&self) -> AudioBalance {
        self.shared.core.lock().balance
    }

    /// 切换到音频列表中的另一条音轨
    pub fn switch_audio_track(&self, pid: u16) -> Result<()> {
        let mut core = self.shared.core.lock();
        let index = core
            .audio
            .iter()
            .position(|a| a.pid == pid)
            .ok_or_else(|| PlayerError::ConfigurationInvalid(format!("音轨 pid={} 不在列表中", pid)))?;
        if core.selected_audio().map(|a| a.pid) == Some(pid) {
            return Ok(());
        }
        let format = core.audio[index].format;
        if let Some(channel) = core.running_audio_channel() {
            channel.switch_audio(pid, format)?;
        }
        core.audio_index = index;
        info!("{} 🔊 切换音轨 pid={}", log_ctx(), pid);
        Ok(())
    }

    pub fn switch_subtitle(&self, pid: u16) -> Result<()> {
        let mut core = self.shared.core.lock();
        let index = core
            .subtitles
            .iter()
            .position(|s| s.pid == pid)
            .ok_or_else(|| PlayerError::ConfigurationInvalid(format!("字幕 pid={} 不在列表中", pid)))?;
        let params = core.subtitles[index];
        core.sub_index = index;
        if !core.state.is_running() {
            return Ok(());
        }
        if let Some(ChannelSet::Combined(channel)) = core.channels.as_mut() {
            channel.set_subtitle_pid(pid)?;
        }
        if let Some(service) = self.shared.subtitles.as_ref() {
            if core.has_sub {
                service.close();
            }
            service.open(&params);
            service.show();
            core.has_sub = true;
        }
        Ok(())
    }

    pub fn subtitle_show_hide(&self, show: bool) {
        if let Some(service) = self.shared.subtitles.as_ref() {
            if show {
                service.show();
            } else {
                service.hide();
            }
        }
    }

    /// 停止时是否黑屏
    pub fn set_blackout_policy(&self, blackout: bool) {
        let mut core = self.shared.core.lock();
        core.blackout = blackout;
        self.shared.sys.apply(SysHint::BlackoutPolicy(blackout));
    }

    /// 清除最后一帧；异步停止在途时推迟到拆除完成之后
    pub fn clear_last_frame(&self) {
        if self.shared.stopper.defer_clear_last_frame() {
            info!("{} 异步停止进行中，清除最后一帧延后执行", log_ctx());
            return;
        }
        self.shared.sys.clear_last_frame();
    }

    /// 解码错误恢复模式 0..=3
    pub fn set_error_recovery(&self, mode: u8) -> Result<()> {
        if mode > MAX_ERROR_RECOVERY_MODE {
            return Err(PlayerError::ConfigurationInvalid(format!("错误恢复模式 {} 超出范围 0..=3", mode)));
        }
        self.shared.sys.apply(SysHint::ErrorRecovery(mode));
        Ok(())
    }

    // ========== 播放控制 ==========

    /// 开始播放；已在播放时直接返回成功
    pub fn start(&self) -> Result<()> {
        self.shared.stopper.wait_idle();
        let mut core = self.shared.core.lock();
        match core.state {
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Fast => return Ok(()),
            PlaybackState::Stopping if core.restart_pending => {
                info!("{} 看门狗重启等待中，立即启动", log_ctx());
                core.restart_pending = false;
                core.state = PlaybackState::Idle;
            }
            PlaybackState::Stopping => {
                return Err(PlayerError::InvalidState("停止尚未完成".into()));
            }
            PlaybackState::Idle => {}
        }
        self.shared.start_locked(&mut core)
    }

    pub fn pause(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        match core.state {
            PlaybackState::Paused => Ok(()),
            PlaybackState::Playing | PlaybackState::Fast => {
                SessionShared::pause_channels(&mut core)?;
                core.state = PlaybackState::Paused;
                info!("{} ⏸ 暂停", log_ctx());
                Ok(())
            }
            state => Err(PlayerError::InvalidState(format!("{:?} 状态不能暂停", state))),
        }
    }

    pub fn resume(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        match core.state {
            PlaybackState::Playing | PlaybackState::Fast => Ok(()),
            PlaybackState::Paused => {
                if let Some(set) = core.channels.as_mut() {
                    for channel in set.channels_mut() {
                        channel.resume()?;
                    }
                }
                core.state = if core.fast { PlaybackState::Fast } else { PlaybackState::Playing };
                info!("{} ▶ 恢复播放", log_ctx());
                Ok(())
            }
            state => Err(PlayerError::InvalidState(format!("{:?} 状态不能恢复", state))),
        }
    }

    /// 快进：切换到 I 帧 + freerun，内部 Stop + Start 使模式生效
    pub fn fast(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        match core.state {
            PlaybackState::Fast => return Ok(()),
            PlaybackState::Playing | PlaybackState::Paused => {}
            state => return Err(PlayerError::InvalidState(format!("{:?} 状态不能快进", state))),
        }
        info!("{} ⏩ 进入快进", log_ctx());
        self.restart_with_fast(&mut core, true)
    }

    pub fn stop_fast(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        if !core.fast {
            return if core.state.is_running() {
                Ok(())
            } else {
                Err(PlayerError::InvalidState(format!("{:?} 状态不能退出快进", core.state)))
            };
        }
        info!("{} ⏩ 退出快进", log_ctx());
        self.restart_with_fast(&mut core, false)
    }

    fn restart_with_fast(&self, core: &mut SessionCore, fast: bool) -> Result<()> {
        core.keep_memory = true;
        self.shared.teardown(core);
        core.fast = fast;
        let result = self.shared.start_locked(core);
        if result.is_err() {
            core.fast = false;
        }
        result
    }

    /// Seek：内部 Stop + Start，然后补发恢复的 TS 头（如果有）
    pub fn seek(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        if !core.state.is_running() {
            return Err(PlayerError::InvalidState(format!("{:?} 状态不能 Seek", core.state)));
        }
        let was_paused = core.state == PlaybackState::Paused;
        let header = core.header.as_ref().and_then(|h| h.recovered_header());

        self.shared.teardown(&mut core);
        self.shared.start_locked(&mut core)?;

        match header {
            Some(header) => {
                if let Some(mut pipeline) = core.header.take() {
                    pipeline.shutdown();
                }
                let pid = core.video.pid;
                core.header = Some(HeaderRecoveryPipeline::with_header(pid, header.clone()));
                self.shared.replay_header(&mut core, &header);
            }
            None => info!("{} Seek: 没有可用的 TS 头，不补发", log_ctx()),
        }

        if was_paused {
            SessionShared::pause_channels(&mut core)?;
            core.state = PlaybackState::Paused;
        }
        Ok(())
    }

    /// 停止播放；已停止时直接返回成功
    ///
    /// 异步模式下只提交请求，拆除在协调线程中完成
    pub fn stop(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.restart_pending {
            info!("{} ⏹ 取消等待中的看门狗重启", log_ctx());
            core.restart_pending = false;
            core.fast = false;
            core.state = PlaybackState::Idle;
            return Ok(());
        }
        match core.state {
            PlaybackState::Idle | PlaybackState::Stopping => return Ok(()),
            _ => {}
        }
        core.fast = false;
        if self.stop_worker.is_some() {
            core.state = PlaybackState::Stopping;
            if self.shared.stopper.try_request() {
                info!("{} ⏹ 异步停止已提交", log_ctx());
            } else {
                info!("{} ⏹ 已有异步停止在途，忽略本次请求", log_ctx());
            }
            return Ok(());
        }
        self.shared.teardown(&mut core);
        Ok(())
    }

    /// 等待在途的异步停止完成
    pub fn wait_stopped(&self) {
        self.shared.stopper.wait_idle();
    }

    // ========== 数据写入 ==========

    /// 写入数据，返回被接受的字节数
    ///
    /// 缓冲水位过高时返回 `PlayerError::WouldBlock`，调用方应等待 `write_backoff()` 后重试
    pub fn write_data(&self, stream: StreamType, data: &[u8], pts: u64) -> Result<usize> {
        let mut core = self.shared.core.lock();
        self.shared.submit_locked(&mut core, stream, data, pts)
    }

    pub fn write_backoff(&self) -> Duration {
        self.shared.core.lock().scheduler.backoff_hint()
    }

    // ========== 状态查询 ==========

    pub fn state(&self) -> PlaybackState {
        self.shared.core.lock().state
    }

    pub fn is_fast(&self) -> bool {
        self.shared.core.lock().fast
    }

    pub fn demux_mode(&self) -> DemuxMode {
        self.shared.core.lock().demux
    }

    pub fn av_buffer_status(&self) -> AvBufferStatus {
        let mut core = self.shared.core.lock();
        let has_audio = core.has_audio;
        let Some(set) = core.channels.as_mut() else {
            return AvBufferStatus::default();
        };
        let video = set.video_mut().map(|c| c.video_buffer_state()).unwrap_or_default();
        let audio = if has_audio {
            set.audio_mut().map(|c| c.audio_buffer_state()).unwrap_or_default()
        } else {
            Default::default()
        };
        AvBufferStatus { audio, video }
    }

    pub fn decoder_state(&self) -> DecoderState {
        let mut core = self.shared.core.lock();
        core.channels
            .as_mut()
            .and_then(|set| set.primary_mut())
            .map(|c| c.decoder_state())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.core.lock().snapshot_stats()
    }

    pub fn header_phase(&self) -> Option<HeaderPhase> {
        self.shared.core.lock().header.as_ref().map(|h| h.phase())
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &TsPlayerConfig {
        &self.shared.config
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        info!("{} 🧹 PlaybackSession 释放", log_ctx());
        let _ = self.stop();
        self.shared.stopper.wait_idle();
        self.shared.stopper.close();
        self.shutdown.close();
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.join();
        }
        if let Some(mut reporter) = self.reporter.take() {
            reporter.join();
        }
        if let Some(handle) = self.stop_worker.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 异步停止线程异常退出", log_ctx());
            }
        }
        let mut core = self.shared.core.lock();
        core.restart_pending = false;
        self.shared.teardown(&mut core);
    }
}

/// 会话构建器 - 注入外部协作者
pub struct SessionBuilder {
    provider: Arc<dyn DeviceProvider>,
    sys: Arc<dyn SysControl>,
    surface: Option<Arc<dyn VideoSurface>>,
    subtitles: Option<Arc<dyn SubtitleService>>,
    extractor: Option<Box<dyn ElementaryExtractor>>,
    config: TsPlayerConfig,
}

impl SessionBuilder {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            sys: Arc::new(NullSysControl),
            surface: None,
            subtitles: None,
            extractor: None,
            config: TsPlayerConfig::default(),
        }
    }

    pub fn sys_control(mut self, sys: Arc<dyn SysControl>) -> Self {
        self.sys = sys;
        self
    }

    pub fn surface(mut self, surface: Arc<dyn VideoSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn subtitle_service(mut self, service: Arc<dyn SubtitleService>) -> Self {
        self.subtitles = Some(service);
        self
    }

    pub fn extractor(mut self, extractor: Box<dyn ElementaryExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(mut self, config: TsPlayerConfig) -> Self {
        self.config = config;
        self
    }

    /// 从属性存储读取配置
    pub fn properties(self, store: &dyn PropertyStore) -> Self {
        self.config(TsPlayerConfig::load(store))
    }

    /// 创建会话并启动看门狗、上报线程（以及异步停止线程）
    pub fn build(self) -> Result<PlaybackSession> {
        let SessionBuilder {
            provider,
            sys,
            surface,
            subtitles,
            extractor,
            config,
        } = self;
        let watchdog_settings = WatchdogSettings::from_config(&config);
        let async_stop = config.async_stop;
        let shared = Arc::new_cyclic(|weak| SessionShared {
            core: Mutex::new(SessionCore::new(provider, &config, extractor)),
            config,
            sys,
            surface,
            subtitles,
            events: EventBus::new(),
            stopper: AsyncStopCoordinator::new(),
            weak: weak.clone(),
        });

        let shutdown = WakeSignal::new();
        let watchdog = WatchdogMonitor::spawn(Arc::downgrade(&shared), shutdown.clone(), watchdog_settings)?;
        let reporter = ReportThread::spawn(Arc::downgrade(&shared), shutdown.clone())?;
        let stop_worker = if async_stop {
            Some(shared.stopper.spawn(Arc::downgrade(&shared))?)
        } else {
            None
        };
        info!(
            "{} ✅ PlaybackSession 创建完成 (async_stop={}, demux={:?})",
            log_ctx(),
            async_stop,
            shared.core.lock().demux
        );
        Ok(PlaybackSession {
            shared,
            shutdown,
            watchdog: Some(watchdog),
            reporter: Some(reporter),
            stop_worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AudioFormat, DecoderStatus, FaultKind, PropertyMap};
    use crate::player::header_recovery::tests::hevc_header_packet;
    use crate::player::sim::{
        SimDeviceProvider, SimExtractor, SimSettings, SimSubtitles, SimSurface, SimSysControl, SubtitleCall,
    };
    use crate::player::watchdog::{finish_restart, poll_once};
    use std::thread;
    use std::time::Instant;

    struct Fixture {
        provider: Arc<SimDeviceProvider>,
        sys: Arc<SimSysControl>,
        session: PlaybackSession,
        events: Receiver<PlayerEvent>,
    }

    /// 看门狗间隔设得很长，测试中手动驱动轮询
    fn fixture(props: PropertyMap) -> Fixture {
        fixture_with(props, |builder| builder)
    }

    fn fixture_with(props: PropertyMap, extra: impl FnOnce(SessionBuilder) -> SessionBuilder) -> Fixture {
        fixture_on(SimSettings::default(), SimSysControl::new(), props, extra)
    }

    fn fixture_on(
        settings: SimSettings,
        sys: SimSysControl,
        props: PropertyMap,
        extra: impl FnOnce(SessionBuilder) -> SessionBuilder,
    ) -> Fixture {
        let provider = Arc::new(SimDeviceProvider::new(settings));
        let sys = Arc::new(sys);
        let props = props.with("iptv.watchdog.interval_ms", 60_000);
        let builder = PlaybackSession::builder(provider.clone())
            .sys_control(sys.clone())
            .properties(&props);
        let session = extra(builder).build().unwrap();
        let events = session.subscribe();
        Fixture {
            provider,
            sys,
            session,
            events,
        }
    }

    fn configure(session: &PlaybackSession, format: VideoFormat) {
        session
            .init_video(VideoParams {
                pid: 256,
                format,
                width: 1920,
                height: 1080,
                frame_rate: 25,
            })
            .unwrap();
        session
            .init_audio(&[
                AudioParams {
                    pid: 257,
                    format: AudioFormat::Aac,
                    sample_rate: 48000,
                    channels: 2,
                },
                AudioParams {
                    pid: 258,
                    format: AudioFormat::Ac3,
                    sample_rate: 48000,
                    channels: 6,
                },
                AudioParams::default(),
            ])
            .unwrap();
    }

    fn drain(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        events.try_iter().filter(|e| !matches!(e, PlayerEvent::Stats(_))).collect()
    }

    fn watchdog_settings(session: &PlaybackSession) -> WatchdogSettings {
        WatchdogSettings::from_config(session.config())
    }

    fn poll(session: &PlaybackSession) -> Option<FaultKind> {
        let settings = watchdog_settings(session);
        let mut core = session.shared.core.lock();
        poll_once(&session.shared, &mut core, &settings)
    }

    #[test]
    fn test_start_reports_audio_and_video() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Playing);
        let state = f.session.decoder_state();
        assert!(state.has_video);
        assert!(state.has_audio);
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        let config = handle.config().unwrap();
        assert_eq!((config.video_pid, config.audio_pid), (256, 257));
        assert_eq!(config.decode_mode, DecodeMode::Single);
        assert_eq!(f.sys.count(SysHint::KeepDecoderMemory(true)), 1);
        assert_eq!(f.sys.count(SysHint::AvSync(true)), 1);
        assert_eq!(drain(&f.events), vec![PlayerEvent::Started]);
    }

    #[test]
    fn test_start_without_streams_is_rejected() {
        let f = fixture(PropertyMap::new());
        assert!(matches!(f.session.start(), Err(PlayerError::ConfigurationInvalid(_))));
        assert_eq!(f.session.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_start_failure_surfaces_bad_handle() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.provider.fail_next_device_inits(1);
        assert!(matches!(f.session.start(), Err(PlayerError::BadHandle(_))));
        assert_eq!(f.session.state(), PlaybackState::Idle);
        f.session.start().unwrap();
    }

    #[test]
    fn test_lifecycle_is_idempotent() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.stop().unwrap();
        f.session.start().unwrap();
        f.session.start().unwrap();
        assert_eq!(f.provider.handles().len(), 1);
        f.session.stop().unwrap();
        f.session.stop().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Idle);
        assert_eq!(f.session.stats().teardowns, 1);
        assert_eq!(f.provider.total_closes(ChannelRole::Combined), 1);
    }

    #[test]
    fn test_write_backpressure_above_high_water() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::Mpeg12);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        handle.set_video_fill(0.995);
        let result = f.session.write_data(StreamType::Ts, &[0u8; 4096], NO_PTS);
        assert!(matches!(result, Err(PlayerError::WouldBlock)));
        assert_eq!(f.session.stats().bytes_accepted, 0);
    }

    #[test]
    fn test_write_requires_running_session() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        assert!(matches!(
            f.session.write_data(StreamType::Ts, &[0u8; 188], NO_PTS),
            Err(PlayerError::InvalidState(_))
        ));
        f.session.start().unwrap();
        assert_eq!(f.session.write_data(StreamType::Ts, &[0u8; 188], NO_PTS).unwrap(), 188);
        assert!(drain(&f.events).contains(&PlayerEvent::FirstWrite));
        assert!(matches!(
            f.session.write_data(StreamType::Video, &[0u8; 188], NO_PTS),
            Err(PlayerError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_live_upgrade_replays_shadow_ring_in_order() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        let data: Vec<u8> = (0..12_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(1316) {
            f.session.write_data(StreamType::Ts, chunk, NO_PTS).unwrap();
        }
        assert_eq!(f.session.shared.core.lock().ring.as_ref().unwrap().valid_bytes(), 12_000);
        drain(&f.events);

        handle.set_status(DecoderStatus::FATAL_SIZE_OVERFLOW, 3840, 2160);
        assert_eq!(poll(&f.session), None);

        let sessions = handle.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1], data);
        assert_eq!(handle.config().unwrap().video_format, VideoFormat::H264_4K2K);
        assert!(f.session.shared.core.lock().ring.is_none());
        assert_eq!(f.session.stats().live_upgrades, 1);
        assert_eq!(f.session.state(), PlaybackState::Playing);

        f.session.write_data(StreamType::Ts, &[0xAB; 500], NO_PTS).unwrap();
        let written = handle.written();
        assert_eq!(written.len(), 12_500);
        assert_eq!(&written[..12_000], &data[..]);
        assert_eq!(
            drain(&f.events),
            vec![
                PlayerEvent::FaultDetected(FaultKind::ResolutionOverflow),
                PlayerEvent::Recovered(FaultKind::ResolutionOverflow)
            ]
        );
    }

    #[test]
    fn test_live_upgrade_waits_for_device_to_drain() {
        let settings = SimSettings {
            video_buffer_size: 16_000,
            ..SimSettings::default()
        };
        let f = fixture_on(settings, SimSysControl::new(), PropertyMap::new(), |builder| builder);
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        let data: Vec<u8> = (0..24_000u32).map(|i| (i % 241) as u8).collect();
        let (first, second) = data.split_at(12_000);
        for chunk in first.chunks(1316) {
            f.session.write_data(StreamType::Ts, chunk, NO_PTS).unwrap();
        }
        handle.drain(12_000);
        for chunk in second.chunks(1316) {
            f.session.write_data(StreamType::Ts, chunk, NO_PTS).unwrap();
        }
        // 影子缓冲比设备缓冲大，回放必须等设备消费
        assert_eq!(f.session.shared.core.lock().ring.as_ref().unwrap().valid_bytes(), 24_000);
        drain(&f.events);

        let stop = WakeSignal::new();
        let drainer = {
            let handle = handle.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while stop.sleep(Duration::from_millis(1)) {
                    handle.drain(4000);
                }
            })
        };
        handle.set_status(DecoderStatus::FATAL_SIZE_OVERFLOW, 3840, 2160);
        assert_eq!(poll(&f.session), None);
        stop.close();
        drainer.join().unwrap();

        let sessions = handle.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1], data);
        assert_eq!(f.session.stats().live_upgrades, 1);
        assert_eq!(
            drain(&f.events),
            vec![
                PlayerEvent::FaultDetected(FaultKind::ResolutionOverflow),
                PlayerEvent::Recovered(FaultKind::ResolutionOverflow)
            ]
        );
    }

    #[test]
    fn test_unknown_fatal_error_requests_force_reset() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        handle.set_status(DecoderStatus::FATAL_UNKNOWN, 1280, 720);
        assert_eq!(poll(&f.session), None);
        assert_eq!(poll(&f.session), None);
        assert_eq!(f.sys.count(SysHint::DecoderForceReset), 1);
        // 通道本身没有被重建
        assert_eq!(handle.init_count(), 1);
    }

    #[test]
    fn test_unknown_fatal_error_without_force_reset_support() {
        let f = fixture_on(
            SimSettings::default(),
            SimSysControl::without_force_reset(),
            PropertyMap::new(),
            |builder| builder,
        );
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        drain(&f.events);
        handle.set_status(DecoderStatus::FATAL_UNKNOWN, 1280, 720);
        assert_eq!(poll(&f.session), None);
        assert_eq!(drain(&f.events), vec![PlayerEvent::FaultDetected(FaultKind::Unknown)]);
        assert_eq!(f.sys.count(SysHint::DecoderForceReset), 0);
        assert_eq!(handle.init_count(), 1);
        assert_eq!(f.session.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_hevc_fatal_error_restarts_session() {
        let f = fixture(PropertyMap::new().with("media.ctcplayer.enable", 1));
        configure(&f.session, VideoFormat::Hevc);
        f.session.start().unwrap();
        let first = f.provider.last(ChannelRole::Combined).unwrap();
        first.set_status(DecoderStatus::FATAL_NO_MEM, 3840, 2160);
        drain(&f.events);

        assert_eq!(poll(&f.session), Some(FaultKind::OutOfMemory));
        assert_eq!(f.session.state(), PlaybackState::Stopping);
        assert!(matches!(
            f.session.write_data(StreamType::Ts, &[0u8; 188], NO_PTS),
            Err(PlayerError::WouldBlock)
        ));
        {
            let mut core = f.session.shared.core.lock();
            finish_restart(&f.session.shared, &mut core, FaultKind::OutOfMemory);
        }
        assert_eq!(f.session.state(), PlaybackState::Playing);
        assert_eq!(f.provider.handles().len(), 2);
        assert_eq!(f.session.stats().restarts, 1);
        assert_eq!(
            drain(&f.events),
            vec![
                PlayerEvent::FaultDetected(FaultKind::OutOfMemory),
                PlayerEvent::Stopped,
                PlayerEvent::Started,
                PlayerEvent::Recovered(FaultKind::OutOfMemory)
            ]
        );
    }

    #[test]
    fn test_two_failed_restarts_raise_playback_error() {
        let f = fixture(PropertyMap::new().with("media.ctcplayer.enable", 1));
        configure(&f.session, VideoFormat::Avs2);
        for _ in 0..2 {
            f.session.start().unwrap();
            let handle = f.provider.last(ChannelRole::Combined).unwrap();
            handle.set_status(DecoderStatus::FATAL_UNKNOWN, 1920, 1080);
            assert_eq!(poll(&f.session), Some(FaultKind::Unknown));
            f.provider.fail_next_device_inits(1);
            let mut core = f.session.shared.core.lock();
            finish_restart(&f.session.shared, &mut core, FaultKind::Unknown);
            assert_eq!(core.state, PlaybackState::Idle);
        }
        let events = drain(&f.events);
        assert_eq!(
            events.iter().filter(|e| **e == PlayerEvent::PlaybackError(FaultKind::Unknown)).count(),
            1
        );
    }

    #[test]
    fn test_stop_cancels_pending_restart() {
        let f = fixture(PropertyMap::new().with("media.ctcplayer.enable", 1));
        configure(&f.session, VideoFormat::Hevc);
        f.session.start().unwrap();
        f.provider
            .last(ChannelRole::Combined)
            .unwrap()
            .set_status(DecoderStatus::FATAL_SIZE_OVERFLOW, 3840, 2160);
        assert!(poll(&f.session).is_some());
        f.session.stop().unwrap();
        {
            let mut core = f.session.shared.core.lock();
            finish_restart(&f.session.shared, &mut core, FaultKind::ResolutionOverflow);
        }
        assert_eq!(f.session.state(), PlaybackState::Idle);
        assert_eq!(f.provider.handles().len(), 1);
    }

    #[test]
    fn test_stall_detection_restarts_h264() {
        let f = fixture(
            PropertyMap::new()
                .with("iptv.playerwatchdog.support", 1)
                .with("iptv.watchdog.stall_ms", 0),
        );
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        handle.set_video_fill(0.5);
        handle.set_audio_fill(1.0);
        assert_eq!(poll(&f.session), None);
        handle.set_video_fill(1.0);
        assert_eq!(poll(&f.session), Some(FaultKind::BufferStall));
        assert_eq!(f.session.state(), PlaybackState::Stopping);
    }

    #[test]
    fn test_async_stop_tears_down_once() {
        let f = fixture(PropertyMap::new().with("media.async.stop.enable", 1));
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        f.session.stop().unwrap();
        f.session.stop().unwrap();
        f.session.wait_stopped();
        assert_eq!(f.session.state(), PlaybackState::Idle);
        assert_eq!(f.session.stats().teardowns, 1);
        assert_eq!(f.provider.total_closes(ChannelRole::Combined), 1);
        // 停止完成后可以重新开始
        f.session.start().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_clear_last_frame_deferred_while_stopping() {
        let f = fixture(PropertyMap::new().with("media.async.stop.enable", 1));
        configure(&f.session, VideoFormat::H264);
        f.session.clear_last_frame();
        assert_eq!(f.sys.clear_frame_count(), 1);
        f.session.start().unwrap();
        f.session.stop().unwrap();
        f.session.clear_last_frame();
        f.session.wait_stopped();
        assert_eq!(f.sys.clear_frame_count(), 2);
    }

    #[test]
    fn test_seek_without_header_skips_replay() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        f.session.seek().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Playing);
        assert_eq!(f.session.stats().header_replays, 0);
        assert!(f.provider.last(ChannelRole::Combined).unwrap().written().is_empty());
    }

    #[test]
    fn test_seek_replays_recovered_header_once() {
        let f = fixture(PropertyMap::new().with("iptv.add.tsheader", 1));
        configure(&f.session, VideoFormat::Hevc);
        f.session.start().unwrap();
        let packet = hevc_header_packet(256);
        f.session.write_data(StreamType::Ts, &packet, NO_PTS).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while f.session.header_phase() != Some(HeaderPhase::Found) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.session.header_phase(), Some(HeaderPhase::Found));

        f.session.seek().unwrap();
        assert_eq!(f.session.stats().header_replays, 1);
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        let header = handle.written();
        assert_eq!(header.len(), 188);
        assert_eq!(&header[..4], &packet[..4]);

        f.session.write_data(StreamType::Ts, &[0x11; 188], NO_PTS).unwrap();
        let written = handle.written();
        assert_eq!(&written[..188], &header[..]);
        assert_eq!(&written[188..], &[0x11; 188][..]);

        // 每次 Seek 各补发一次
        f.session.seek().unwrap();
        assert_eq!(f.session.stats().header_replays, 2);
        assert_eq!(f.provider.last(ChannelRole::Combined).unwrap().written(), header);
    }

    #[test]
    fn test_seek_keeps_pause() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        f.session.pause().unwrap();
        f.session.seek().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Paused);
        assert!(f.provider.last(ChannelRole::Combined).unwrap().paused());
    }

    #[test]
    fn test_pause_resume() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        assert!(matches!(f.session.pause(), Err(PlayerError::InvalidState(_))));
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        f.session.pause().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Paused);
        assert!(handle.paused());
        f.session.resume().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Playing);
        assert!(!handle.paused());
        assert_eq!(handle.init_count(), 1);
    }

    #[test]
    fn test_fast_and_stop_fast() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::Hevc);
        f.session.start().unwrap();
        f.session.fast().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Fast);
        assert!(f.session.is_fast());
        let fast = f.provider.last(ChannelRole::Combined).unwrap();
        assert_eq!(fast.trick_mode(), TrickMode::IFrameHevc);
        assert!(fast.freerun());
        let config = fast.config().unwrap();
        assert!(!config.has_audio);
        assert_eq!(config.decode_mode, DecodeMode::Stream);
        // 快进切换时保留解码器内存
        assert_eq!(f.sys.count(SysHint::KeepDecoderMemory(true)), 3);

        f.session.stop_fast().unwrap();
        assert_eq!(f.session.state(), PlaybackState::Playing);
        let normal = f.provider.last(ChannelRole::Combined).unwrap();
        assert_eq!(normal.trick_mode(), TrickMode::None);
        assert!(normal.config().unwrap().has_audio);
        assert_eq!(f.provider.handles().len(), 3);
    }

    #[test]
    fn test_h264_fast_in_stream_mode_disables_poc_reorder() {
        let f = fixture(PropertyMap::new().with("media.ctcplayer.multimode", 1));
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        f.session.fast().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        assert_eq!(handle.trick_mode(), TrickMode::IFrame);
        assert!(handle.config().unwrap().no_poc_reorder);
    }

    #[test]
    fn test_volume_and_balance() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        assert!(matches!(f.session.set_volume(101), Err(PlayerError::ConfigurationInvalid(_))));
        f.session.set_volume(40).unwrap();
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        assert!((handle.volume() - 0.4).abs() < 1e-6);
        f.session.set_volume(80).unwrap();
        assert!((handle.volume() - 0.8).abs() < 1e-6);
        assert_eq!(f.session.volume(), 80);
        f.session.set_audio_balance(AudioBalance::Mix).unwrap();
        assert!(handle.lr_mix());
        assert_eq!(f.sys.count(SysHint::ChannelMask(AudioBalance::Mix)), 1);
        assert!(AudioBalance::try_from(7).is_err());
    }

    #[test]
    fn test_switch_audio_track() {
        let f = fixture(PropertyMap::new());
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let handle = f.provider.last(ChannelRole::Combined).unwrap();
        f.session.switch_audio_track(257).unwrap();
        f.session.switch_audio_track(258).unwrap();
        assert_eq!(handle.audio_pid(), 258);
        assert!(matches!(
            f.session.switch_audio_track(999),
            Err(PlayerError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_subtitles_follow_lifecycle() {
        let subs = Arc::new(SimSubtitles::default());
        let service = subs.clone();
        let f = fixture_with(PropertyMap::new(), move |b| b.subtitle_service(service));
        configure(&f.session, VideoFormat::H264);
        f.session
            .init_subtitle(&[
                SubtitleParams { pid: 300, sub_type: 1 },
                SubtitleParams { pid: 301, sub_type: 1 },
                SubtitleParams::default(),
            ])
            .unwrap();
        f.session.start().unwrap();
        f.session.switch_subtitle(301).unwrap();
        f.session.subtitle_show_hide(false);
        f.session.stop().unwrap();
        assert_eq!(
            subs.calls(),
            vec![
                SubtitleCall::Open(300),
                SubtitleCall::Show,
                SubtitleCall::Close,
                SubtitleCall::Open(301),
                SubtitleCall::Show,
                SubtitleCall::Hide,
                SubtitleCall::Close,
            ]
        );
        assert_eq!(f.provider.last(ChannelRole::Combined).unwrap().sub_pid(), 301);
    }

    #[test]
    fn test_split_mode_swallows_audio_without_channel() {
        let f = fixture(PropertyMap::new().with("iptv.softdemux", 1).with("iptv.middle.softdemux", 1));
        f.session
            .init_video(VideoParams {
                pid: 256,
                format: VideoFormat::H264,
                ..VideoParams::default()
            })
            .unwrap();
        f.session.start().unwrap();
        assert!(f.provider.last(ChannelRole::Audio).is_none());
        assert_eq!(f.session.write_data(StreamType::Audio, &[0u8; 300], 1000).unwrap(), 300);
        assert_eq!(f.session.write_data(StreamType::Video, &[1u8; 300], 2000).unwrap(), 300);
        let video = f.provider.last(ChannelRole::Video).unwrap();
        assert_eq!(video.written(), vec![1u8; 300]);
        assert_eq!(video.checked_in_pts(), vec![2000]);
        assert_eq!(f.sys.count(SysHint::FixDuration(true)), 1);
        assert!(matches!(
            f.session.write_data(StreamType::Ts, &[0u8; 188], NO_PTS),
            Err(PlayerError::ConfigurationInvalid(_))
        ));
    }

    fn ts_packet(pid: u16, fill: u8) -> Vec<u8> {
        let mut packet = vec![fill; 188];
        packet[0] = 0x47;
        packet[1] = (pid >> 8) as u8;
        packet[2] = (pid & 0xff) as u8;
        packet[3] = 0x10;
        packet
    }

    #[test]
    fn test_split_mode_extractor_feeds_channels() {
        let f = fixture_with(PropertyMap::new().with("iptv.softdemux", 1), |b| {
            b.extractor(Box::new(SimExtractor::new(256, 257)))
        });
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let mut ts = ts_packet(256, 0xA1);
        ts.extend(ts_packet(257, 0xB2));
        ts.extend(ts_packet(256, 0xA3));
        assert_eq!(f.session.write_data(StreamType::Ts, &ts, NO_PTS).unwrap(), ts.len());

        let video = f.provider.last(ChannelRole::Video).unwrap();
        let audio = f.provider.last(ChannelRole::Audio).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while (video.written().len() < 368 || audio.written().len() < 184) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let mut expected = vec![0xA1; 184];
        expected.extend(vec![0xA3; 184]);
        assert_eq!(video.written(), expected);
        assert_eq!(audio.written(), vec![0xB2; 184]);
        // 只统计调用方写入管道的 TS，解出的 ES 不重复计数
        let stats = f.session.stats();
        assert_eq!(stats.bytes_offered, ts.len() as u64);
        assert_eq!(stats.bytes_accepted, ts.len() as u64);

        f.session.stop().unwrap();
        assert!(f.session.shared.core.lock().extractor.is_some());
        f.session.start().unwrap();
    }

    #[test]
    fn test_surface_follows_window_and_keep_alive() {
        let surface = Arc::new(SimSurface::default());
        let f = fixture_with(PropertyMap::new(), {
            let surface = surface.clone();
            move |builder| builder.surface(surface)
        });
        configure(&f.session, VideoFormat::H264);
        let first = WindowRect::new(0, 0, 1280, 720);
        f.session.set_video_window(first).unwrap();
        // 未启动时只记录窗口
        assert!(surface.geometry_updates().is_empty());

        f.session.start().unwrap();
        assert_eq!(surface.geometry_updates(), vec![first]);
        let second = WindowRect::new(100, 50, 640, 360);
        f.session.set_video_window(second).unwrap();
        assert_eq!(surface.geometry_updates(), vec![first, second]);

        f.session.write_data(StreamType::Ts, &[0x47; 188], NO_PTS).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        let stats = loop {
            match f.events.recv_timeout(Duration::from_millis(100)) {
                Ok(PlayerEvent::Stats(stats)) => break stats,
                Ok(_) => {}
                Err(_) => assert!(Instant::now() < deadline, "上报线程没有推送 Stats"),
            }
        };
        assert_eq!(stats.bytes_accepted, 188);
        assert!(surface.refresh_count() > 0);

        f.session.stop().unwrap();
        let refreshes = surface.refresh_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(surface.refresh_count(), refreshes);
    }

    #[test]
    fn test_dump_file_mirrors_accepted_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            PropertyMap::new()
                .with("iptv.dumpfile", 1)
                .with("iptv.dumppath", dir.path().display()),
        );
        configure(&f.session, VideoFormat::Mpeg12);
        f.session.start().unwrap();
        f.session.write_data(StreamType::Ts, &[5u8; 376], NO_PTS).unwrap();
        f.session.stop().unwrap();
        f.session.start().unwrap();
        assert_eq!(std::fs::read(dir.path().join("Live0.ts")).unwrap(), vec![5u8; 376]);
        assert!(dir.path().join("Live1.ts").exists());
    }

    #[test]
    fn test_config_calls_validate_input() {
        let f = fixture(PropertyMap::new());
        assert!(matches!(
            f.session.set_video_window(WindowRect::new(0, 0, 0, 720)),
            Err(PlayerError::ConfigurationInvalid(_))
        ));
        f.session.set_video_window(WindowRect::new(0, 0, 1280, 720)).unwrap();
        assert!(matches!(f.session.set_error_recovery(4), Err(PlayerError::ConfigurationInvalid(_))));
        f.session.set_error_recovery(2).unwrap();
        f.session.video_hide();
        assert!(!f.session.is_video_visible());
        f.session.set_blackout_policy(false);
        assert_eq!(f.sys.count(SysHint::ErrorRecovery(2)), 1);
        assert_eq!(f.sys.count(SysHint::VideoVisible(false)), 1);
        assert_eq!(f.sys.count(SysHint::BlackoutPolicy(false)), 1);

        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        assert!(matches!(
            f.session.init_video(VideoParams::default()),
            Err(PlayerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_drop_stops_playback() {
        let f = fixture(PropertyMap::new().with("media.async.stop.enable", 1));
        configure(&f.session, VideoFormat::H264);
        f.session.start().unwrap();
        let provider = f.provider.clone();
        drop(f);
        assert_eq!(provider.total_closes(ChannelRole::Combined), 1);
        assert!(!provider.last(ChannelRole::Combined).unwrap().is_initialized());
    }
}
