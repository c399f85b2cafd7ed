use crate::core::{log_ctx, Deadline, PlayerError, Result, StreamType, TsPlayerConfig, NO_PTS};
use crate::player::codec_channel::CodecChannel;
use crate::player::header_recovery::HeaderRecoveryPipeline;
use crate::player::shadow_ring::ShadowRingBuffer;
use log::{debug, info, warn};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Start 之后前 N 次成功写入视为启动阶段
pub const STARTUP_WRITE_WINDOW: u32 = 20;

/// 设备忙时的重试间隔
const BUSY_RETRY_DELAY: Duration = Duration::from_micros(100);
/// 部分写入后让出给解码线程的时间
const PARTIAL_WRITE_PAUSE: Duration = Duration::from_millis(2);

/// 写入调度参数（会话创建时从配置读取）
#[derive(Debug, Clone)]
pub struct WriteSettings {
    pub video_high_water: f32,
    pub audio_high_water: f32,
    pub max_attempts: u32,
    pub budget: Duration,
    pub backoff: Duration,
    pub write_log: bool,
    pub collect_enable: bool,
    pub collect_expire: Duration,
}

impl WriteSettings {
    pub fn from_config(config: &TsPlayerConfig) -> Self {
        Self {
            video_high_water: config.video_high_water,
            audio_high_water: config.audio_high_water,
            max_attempts: config.write_retry_attempts.max(1),
            budget: config.retry_budget(),
            backoff: Duration::from_millis(config.write_backoff_ms),
            write_log: config.write_log,
            collect_enable: config.write_collect_enable,
            collect_expire: Duration::from_millis(config.write_collect_expire_ms.max(1)),
        }
    }
}

/// 写入旁路：影子缓冲和 TS 头捕获，只在对应格式下传入
#[derive(Default, Clone, Copy)]
pub struct WriteTaps<'a> {
    pub ring: Option<&'a ShadowRingBuffer>,
    pub header: Option<&'a HeaderRecoveryPipeline>,
}

/// 写入速率统计日志
struct WriteCollect {
    start: Option<Instant>,
    total: u64,
}

/// 写入调度器 - 背压、有界重试、致命错误时重建通道
pub struct WriteScheduler {
    settings: WriteSettings,
    bytes_offered: u64,
    bytes_accepted: u64,
    write_calls: u64,
    startup_writes: u32,
    first_write_pending: bool,
    collect: WriteCollect,
    dump: Option<File>,
}

impl WriteScheduler {
    pub fn new(settings: WriteSettings) -> Self {
        Self {
            settings,
            bytes_offered: 0,
            bytes_accepted: 0,
            write_calls: 0,
            startup_writes: 0,
            first_write_pending: false,
            collect: WriteCollect { start: None, total: 0 },
            dump: None,
        }
    }

    /// 背压时建议调用方等待的时间
    pub fn backoff_hint(&self) -> Duration {
        self.settings.backoff
    }

    pub fn bytes_offered(&self) -> u64 {
        self.bytes_offered
    }

    pub fn bytes_accepted(&self) -> u64 {
        self.bytes_accepted
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls
    }

    /// 新一轮播放开始：重置启动窗口
    pub fn begin_session(&mut self) {
        self.startup_writes = 0;
        self.first_write_pending = true;
        self.collect = WriteCollect { start: None, total: 0 };
    }

    /// 仍处于 Start 后的启动窗口（未满 20 次成功写入）
    pub fn in_startup_window(&self) -> bool {
        self.startup_writes < STARTUP_WRITE_WINDOW
    }

    pub fn startup_writes(&self) -> u32 {
        self.startup_writes
    }

    /// 取出"首次写入成功"标记（只返回一次 true）
    pub fn take_first_write(&mut self) -> bool {
        if self.first_write_pending && self.startup_writes > 0 {
            self.first_write_pending = false;
            return true;
        }
        false
    }

    /// 打开 dump 文件 `<dir>/Live<index>.ts`
    pub fn open_dump(&mut self, dir: &Path, index: u32) -> Result<PathBuf> {
        let path = dir.join(format!("Live{}.ts", index));
        let file = File::create(&path)?;
        info!("{} 💾 dump 文件: {}", log_ctx(), path.display());
        self.dump = Some(file);
        Ok(path)
    }

    pub fn close_dump(&mut self) {
        if let Some(mut file) = self.dump.take() {
            if let Err(e) = file.flush() {
                warn!("{} ⚠ dump 文件 flush 失败: {}", log_ctx(), e);
            }
        }
    }

    /// 记录由其他路径（软件解复用管道）接受的字节
    pub fn record_external(&mut self, offered: usize, accepted: usize, data: &[u8]) {
        self.bytes_offered += offered as u64;
        self.bytes_accepted += accepted as u64;
        self.mirror_to_dump(&data[..accepted.min(data.len())]);
    }

    /// 提交一段数据到解码通道
    ///
    /// - 缓冲占用超过水位时直接返回 `WouldBlock`，不写入任何字节
    /// - 否则在有界重试内尽量写完；返回实际被设备接受的字节数（可能为 0）
    pub fn submit(
        &mut self,
        channel: &mut CodecChannel,
        stream: StreamType,
        data: &[u8],
        pts: u64,
        taps: WriteTaps<'_>,
    ) -> Result<usize> {
        self.bytes_offered += data.len() as u64;
        let written = self.deliver(channel, stream, data, pts, taps)?;
        self.bytes_accepted += written as u64;
        if stream != StreamType::Audio {
            self.mirror_to_dump(&data[..written]);
        }
        Ok(written)
    }

    /// 转发已由 `record_external` 计数的数据（软件解复用出的 ES），不再计入字节统计和 dump
    pub fn submit_relayed(
        &mut self,
        channel: &mut CodecChannel,
        stream: StreamType,
        data: &[u8],
        pts: u64,
        taps: WriteTaps<'_>,
    ) -> Result<usize> {
        self.deliver(channel, stream, data, pts, taps)
    }

    fn deliver(
        &mut self,
        channel: &mut CodecChannel,
        stream: StreamType,
        data: &[u8],
        pts: u64,
        taps: WriteTaps<'_>,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.over_high_water(channel, stream) {
            return Err(PlayerError::WouldBlock);
        }

        if matches!(stream, StreamType::Video | StreamType::Audio) && pts != NO_PTS && pts != u64::MAX {
            if let Err(e) = channel.checkin_pts(pts) {
                debug!("{} checkin_pts 失败: {}", log_ctx(), e);
            }
        }

        let written = self.write_with_retry(channel, data, taps);

        if written > 0 {
            if self.startup_writes < STARTUP_WRITE_WINDOW {
                self.startup_writes += 1;
            }
            self.collect_rate(written);
        } else {
            warn!(
                "{} ⚠ {} 写入失败，{} 字节一个也没写进去",
                log_ctx(),
                channel.role().as_str(),
                data.len()
            );
        }
        Ok(written)
    }

    fn over_high_water(&self, channel: &mut CodecChannel, stream: StreamType) -> bool {
        let (check_video, check_audio) = match stream {
            StreamType::Video => (true, false),
            StreamType::Audio => (false, true),
            StreamType::Ts | StreamType::Subtitle => (true, true),
        };
        let video_level = if check_video { channel.video_buffer_state().level() } else { 0.0 };
        let audio_level = if check_audio { channel.audio_buffer_state().level() } else { 0.0 };
        if video_level >= self.settings.video_high_water || audio_level >= self.settings.audio_high_water {
            if self.settings.write_log {
                info!(
                    "{} 🚧 缓冲水位过高 vlevel={:.5} alevel={:.5}，暂不写入",
                    log_ctx(),
                    video_level,
                    audio_level
                );
            }
            return true;
        }
        false
    }

    /// 重试循环：同时受截止时间和次数限制
    fn write_with_retry(&mut self, channel: &mut CodecChannel, data: &[u8], taps: WriteTaps<'_>) -> usize {
        let deadline = Deadline::after(self.settings.budget);
        let mut written = 0usize;
        let mut attempt = 0u32;

        while written < data.len() && attempt < self.settings.max_attempts {
            attempt += 1;
            self.write_calls += 1;
            match channel.write(&data[written..]) {
                Ok(n) => {
                    let n = n.min(data.len() - written);
                    if n > 0 {
                        let accepted = &data[written..written + n];
                        if let Some(ring) = taps.ring {
                            ring.append(accepted);
                        }
                        if let Some(header) = taps.header {
                            header.capture(accepted);
                        }
                        written += n;
                    }
                    if self.settings.write_log {
                        info!(
                            "{} ✍ codec_write {} / {} 字节 (attempt {})",
                            log_ctx(),
                            written,
                            data.len(),
                            attempt
                        );
                    }
                    if written >= data.len() || deadline.expired() {
                        break;
                    }
                    thread::sleep(PARTIAL_WRITE_PAUSE.min(deadline.remaining()));
                }
                Err(PlayerError::WouldBlock) => {
                    if deadline.expired() {
                        break;
                    }
                    thread::sleep(BUSY_RETRY_DELAY.min(deadline.remaining()));
                }
                Err(e) => {
                    warn!("{} ❌ {} 通道写入错误: {}", log_ctx(), channel.role().as_str(), e);
                    if !channel.is_initialized() {
                        info!("{} 通道已关闭（可能正在停止），放弃本次写入", log_ctx());
                        break;
                    }
                    match channel.reinit() {
                        Ok(()) => info!("{} 🔁 写入错误后通道已重建", log_ctx()),
                        Err(e) => {
                            warn!("{} ❌ 通道重建失败: {}", log_ctx(), e);
                            break;
                        }
                    }
                    if deadline.expired() {
                        break;
                    }
                }
            }
        }

        if written < data.len() {
            debug!(
                "{} 写入未完成: {} / {} 字节, {} 次尝试, 用时 {:?}",
                log_ctx(),
                written,
                data.len(),
                attempt,
                deadline.elapsed()
            );
        }
        written
    }

    fn mirror_to_dump(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(file) = self.dump.as_mut() {
            if let Err(e) = file.write_all(bytes) {
                warn!("{} ⚠ dump 文件写入失败，停止 dump: {}", log_ctx(), e);
                self.dump = None;
            }
        }
    }

    fn collect_rate(&mut self, written: usize) {
        if !self.settings.collect_enable {
            return;
        }
        self.collect.total += written as u64;
        let start = *self.collect.start.get_or_insert_with(Instant::now);
        let expire = start.elapsed();
        if expire >= self.settings.collect_expire {
            let ms = expire.as_millis().max(1) as u64;
            info!(
                "{} 📈 write_collection total:{} expire:{}ms rate:{} KB/s once:{}",
                log_ctx(),
                self.collect.total,
                ms,
                self.collect.total / ms,
                written
            );
            self.collect = WriteCollect { start: None, total: 0 };
        }
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        self.close_dump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelRole, PropertyMap, VideoFormat};
    use crate::player::device::{CodecConfig, DeviceProvider};
    use crate::player::sim::{SimDeviceProvider, SimHandle, SimSettings};

    fn setup(settings: SimSettings) -> (SimDeviceProvider, CodecChannel, SimHandle) {
        let provider = SimDeviceProvider::new(settings);
        let mut config = CodecConfig::new(ChannelRole::Combined);
        config.has_video = true;
        config.has_audio = true;
        config.video_format = VideoFormat::H264;
        config.video_pid = 256;
        config.audio_pid = 257;
        let mut channel = CodecChannel::new(provider.create(ChannelRole::Combined), config);
        channel.init().unwrap();
        let handle = provider.last(ChannelRole::Combined).unwrap();
        (provider, channel, handle)
    }

    fn scheduler() -> WriteScheduler {
        let mut scheduler = WriteScheduler::new(WriteSettings::from_config(&TsPlayerConfig::default()));
        scheduler.begin_session();
        scheduler
    }

    #[test]
    fn test_backpressure_above_high_water() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        handle.set_video_fill(0.995);
        let mut scheduler = scheduler();
        let result = scheduler.submit(&mut channel, StreamType::Video, &[0u8; 4096], NO_PTS, WriteTaps::default());
        assert!(matches!(result, Err(PlayerError::WouldBlock)));
        assert_eq!(scheduler.bytes_accepted(), 0);
        assert_eq!(handle.write_calls(), 0);
    }

    #[test]
    fn test_relayed_writes_skip_byte_accounting() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        let mut scheduler = scheduler();
        scheduler.record_external(376, 376, &[0u8; 376]);
        let n = scheduler
            .submit_relayed(&mut channel, StreamType::Video, &[7u8; 184], 90_000, WriteTaps::default())
            .unwrap();
        assert_eq!(n, 184);
        assert_eq!(handle.written(), vec![7u8; 184]);
        assert_eq!(handle.checked_in_pts(), vec![90_000]);
        assert_eq!(scheduler.bytes_offered(), 376);
        assert_eq!(scheduler.bytes_accepted(), 376);
        assert!(scheduler.take_first_write());
    }

    #[test]
    fn test_retry_is_bounded_when_device_always_busy() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        handle.set_would_block(true);
        let mut scheduler = scheduler();
        let start = Instant::now();
        let written = scheduler
            .submit(&mut channel, StreamType::Ts, &[0u8; 1880], NO_PTS, WriteTaps::default())
            .unwrap();
        assert_eq!(written, 0);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(handle.write_calls() <= 50);
    }

    #[test]
    fn test_partial_writes_are_accumulated() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        handle.set_max_chunk(Some(1000));
        let mut scheduler = scheduler();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let written = scheduler
            .submit(&mut channel, StreamType::Ts, &data, NO_PTS, WriteTaps::default())
            .unwrap();
        assert_eq!(written, 3000);
        assert_eq!(handle.written(), data);
    }

    #[test]
    fn test_accepted_never_exceeds_offered() {
        let (_provider, mut channel, handle) = setup(SimSettings {
            video_buffer_size: 10_000,
            audio_buffer_size: 10_000,
            drain_per_query: 0,
        });
        handle.set_max_chunk(Some(700));
        let mut scheduler = scheduler();
        let mut last_accepted = 0;
        for round in 0..30 {
            let _ = scheduler.submit(&mut channel, StreamType::Video, &[round as u8; 1316], NO_PTS, WriteTaps::default());
            assert!(scheduler.bytes_accepted() <= scheduler.bytes_offered());
            assert!(scheduler.bytes_accepted() >= last_accepted);
            last_accepted = scheduler.bytes_accepted();
            if round % 4 == 0 {
                handle.drain(3000);
            }
        }
        assert_eq!(scheduler.bytes_accepted() as usize, handle.written().len());
    }

    #[test]
    fn test_hard_error_reinits_channel_and_continues() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        handle.fail_next_writes(1);
        let mut scheduler = scheduler();
        let written = scheduler
            .submit(&mut channel, StreamType::Ts, &[7u8; 188], NO_PTS, WriteTaps::default())
            .unwrap();
        assert_eq!(written, 188);
        assert_eq!(handle.init_count(), 2);
        assert!(channel.is_initialized());
    }

    #[test]
    fn test_closed_channel_gives_up() {
        let (_provider, mut channel, _handle) = setup(SimSettings::default());
        channel.close().unwrap();
        let mut scheduler = scheduler();
        let written = scheduler
            .submit(&mut channel, StreamType::Ts, &[1u8; 188], NO_PTS, WriteTaps::default())
            .unwrap();
        assert_eq!(written, 0);
        assert!(!channel.is_initialized());
    }

    #[test]
    fn test_accepted_bytes_mirror_to_ring_and_dump() {
        let (_provider, mut channel, _handle) = setup(SimSettings::default());
        let ring = ShadowRingBuffer::allocate(4096);
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler();
        let path = scheduler.open_dump(dir.path(), 3).unwrap();
        let taps = WriteTaps { ring: Some(&ring), header: None };
        scheduler.submit(&mut channel, StreamType::Ts, &[9u8; 376], NO_PTS, taps).unwrap();
        scheduler.close_dump();
        assert_eq!(ring.valid_bytes(), 376);
        assert!(path.ends_with("Live3.ts"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![9u8; 376]);
    }

    #[test]
    fn test_pts_checkin_and_first_write() {
        let (_provider, mut channel, handle) = setup(SimSettings::default());
        let mut scheduler = scheduler();
        assert!(!scheduler.take_first_write());
        scheduler.submit(&mut channel, StreamType::Video, &[0u8; 64], 9000, WriteTaps::default()).unwrap();
        scheduler.submit(&mut channel, StreamType::Video, &[0u8; 64], NO_PTS, WriteTaps::default()).unwrap();
        assert_eq!(handle.checked_in_pts(), vec![9000]);
        assert!(scheduler.take_first_write());
        assert!(!scheduler.take_first_write());
        assert_eq!(scheduler.startup_writes(), 2);
        assert!(scheduler.in_startup_window());
    }

    #[test]
    fn test_settings_follow_config() {
        let config = TsPlayerConfig::load(&PropertyMap::new().with("iptv.write.retry", 3));
        let settings = WriteSettings::from_config(&config);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.budget, Duration::from_millis(50));
    }
}
