//! 软件模拟的解码设备
//!
//! 没有机顶盒硬件时用于演示程序和测试：固定大小的硬件缓冲、可注入故障、
//! 记录所有写入的字节和设备调用次数

use crate::core::{
    AudioFormat, BufferState, ChannelRole, DecoderState, DecoderStatus, PlayerError, Result, StreamType,
    SubtitleParams, TrickMode, WindowRect, NO_PTS,
};
use crate::player::device::{
    CodecConfig, DecoderDevice, DeviceProvider, ElementaryExtractor, EsPacket, SubtitleService, SysControl,
    SysHint, VideoSurface,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// 模拟设备参数
#[derive(Debug, Clone, Copy)]
pub struct SimSettings {
    pub video_buffer_size: u32,
    pub audio_buffer_size: u32,
    /// 每次查询缓冲状态时"解码"掉的字节数（模拟消费）
    pub drain_per_query: u32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            video_buffer_size: 4 * 1024 * 1024,
            audio_buffer_size: 512 * 1024,
            drain_per_query: 0,
        }
    }
}

struct SimState {
    settings: SimSettings,
    config: Option<CodecConfig>,
    initialized: bool,
    video_len: u32,
    audio_len: u32,
    video_rp: u32,
    audio_rp: u32,
    status: u32,
    width: u32,
    height: u32,
    would_block: bool,
    fail_writes: u32,
    fail_inits: u32,
    fail_closes: u32,
    max_chunk: Option<usize>,
    init_count: u32,
    close_count: u32,
    write_calls: u64,
    sessions: Vec<Vec<u8>>,
    trick_mode: TrickMode,
    freerun: bool,
    volume: f32,
    lr_mix: bool,
    paused: bool,
    pts: Vec<u64>,
    audio_pid: u16,
    sub_pid: u16,
}

impl SimState {
    fn drain(&mut self, bytes: u32) {
        let v = bytes.min(self.video_len);
        self.video_len -= v;
        self.video_rp = self.video_rp.wrapping_add(v);
        let a = bytes.min(self.audio_len);
        self.audio_len -= a;
        self.audio_rp = self.audio_rp.wrapping_add(a);
    }

    fn current_session(&mut self) -> &mut Vec<u8> {
        if self.sessions.is_empty() {
            self.sessions.push(Vec::new());
        }
        let last = self.sessions.len() - 1;
        &mut self.sessions[last]
    }
}

/// 模拟设备的共享句柄，测试通过它注入故障和检查调用记录
#[derive(Clone)]
pub struct SimHandle {
    role: ChannelRole,
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn new(role: ChannelRole, settings: SimSettings) -> Self {
        Self {
            role,
            state: Arc::new(Mutex::new(SimState {
                settings,
                config: None,
                initialized: false,
                video_len: 0,
                audio_len: 0,
                video_rp: 0,
                audio_rp: 0,
                status: 0,
                width: 0,
                height: 0,
                would_block: false,
                fail_writes: 0,
                fail_inits: 0,
                fail_closes: 0,
                max_chunk: None,
                init_count: 0,
                close_count: 0,
                write_calls: 0,
                sessions: Vec::new(),
                trick_mode: TrickMode::None,
                freerun: false,
                volume: 1.0,
                lr_mix: false,
                paused: false,
                pts: Vec::new(),
                audio_pid: 0,
                sub_pid: 0,
            })),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// 设置视频缓冲占用比例
    pub fn set_video_fill(&self, level: f32) {
        let mut state = self.state.lock();
        state.video_len = (state.settings.video_buffer_size as f32 * level) as u32;
    }

    pub fn set_audio_fill(&self, level: f32) {
        let mut state = self.state.lock();
        state.audio_len = (state.settings.audio_buffer_size as f32 * level) as u32;
    }

    pub fn drain(&self, bytes: u32) {
        self.state.lock().drain(bytes);
    }

    pub fn set_status(&self, flags: u32, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.status = flags;
        state.width = width;
        state.height = height;
    }

    /// 每次写入都返回 WouldBlock
    pub fn set_would_block(&self, enable: bool) {
        self.state.lock().would_block = enable;
    }

    /// 接下来 n 次写入返回硬件错误
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    pub fn fail_next_inits(&self, n: u32) {
        self.state.lock().fail_inits = n;
    }

    /// 接下来 n 次 close 返回错误（句柄照样释放）
    pub fn fail_next_closes(&self, n: u32) {
        self.state.lock().fail_closes = n;
    }

    /// 单次写入最多接受的字节数（模拟部分写入）
    pub fn set_max_chunk(&self, max: Option<usize>) {
        self.state.lock().max_chunk = max;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn init_count(&self) -> u32 {
        self.state.lock().init_count
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().close_count
    }

    pub fn write_calls(&self) -> u64 {
        self.state.lock().write_calls
    }

    pub fn config(&self) -> Option<CodecConfig> {
        self.state.lock().config.clone()
    }

    /// 当前（最近一次 init 之后）写入的全部字节
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().sessions.last().cloned().unwrap_or_default()
    }

    /// 每次 init 之后写入的字节，按 init 顺序
    pub fn sessions(&self) -> Vec<Vec<u8>> {
        self.state.lock().sessions.clone()
    }

    pub fn trick_mode(&self) -> TrickMode {
        self.state.lock().trick_mode
    }

    pub fn freerun(&self) -> bool {
        self.state.lock().freerun
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn lr_mix(&self) -> bool {
        self.state.lock().lr_mix
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn checked_in_pts(&self) -> Vec<u64> {
        self.state.lock().pts.clone()
    }

    pub fn audio_pid(&self) -> u16 {
        self.state.lock().audio_pid
    }

    pub fn sub_pid(&self) -> u16 {
        self.state.lock().sub_pid
    }
}

/// 模拟解码设备
pub struct SimDevice {
    handle: SimHandle,
}

impl SimDevice {
    pub fn new(handle: SimHandle) -> Self {
        Self { handle }
    }
}

impl DecoderDevice for SimDevice {
    fn init(&mut self, config: &CodecConfig) -> Result<()> {
        let mut state = self.handle.state.lock();
        if state.fail_inits > 0 {
            state.fail_inits -= 1;
            return Err(PlayerError::BadHandle("模拟设备打开失败".into()));
        }
        state.initialized = true;
        state.init_count += 1;
        state.config = Some(config.clone());
        state.video_len = 0;
        state.audio_len = 0;
        state.status = 0;
        state.trick_mode = TrickMode::None;
        state.paused = false;
        state.audio_pid = config.audio_pid;
        state.sub_pid = config.sub_pid;
        state.sessions.push(Vec::new());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state.lock();
        state.initialized = false;
        state.close_count += 1;
        state.freerun = false;
        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(PlayerError::Other("模拟设备关闭错误".into()));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.handle.state.lock();
        state.write_calls += 1;
        if !state.initialized {
            return Err(PlayerError::BadHandle("模拟设备未打开".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(PlayerError::Other("模拟设备写入错误".into()));
        }
        if state.would_block {
            return Err(PlayerError::WouldBlock);
        }
        let audio = self.handle.role == ChannelRole::Audio;
        let (len, size) = if audio {
            (state.audio_len, state.settings.audio_buffer_size)
        } else {
            (state.video_len, state.settings.video_buffer_size)
        };
        let free = size.saturating_sub(len) as usize;
        if free == 0 {
            return Err(PlayerError::WouldBlock);
        }
        let mut accepted = data.len().min(free);
        if let Some(max) = state.max_chunk {
            accepted = accepted.min(max);
        }
        if audio {
            state.audio_len += accepted as u32;
        } else {
            state.video_len += accepted as u32;
        }
        state.current_session().extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn video_buffer_state(&mut self) -> BufferState {
        let mut state = self.handle.state.lock();
        let drain = state.settings.drain_per_query;
        if drain > 0 && !state.paused {
            state.drain(drain);
        }
        let size = state.settings.video_buffer_size;
        BufferState {
            size,
            data_len: state.video_len,
            free_len: size.saturating_sub(state.video_len),
            read_pointer: state.video_rp,
        }
    }

    fn audio_buffer_state(&mut self) -> BufferState {
        let state = self.handle.state.lock();
        let size = state.settings.audio_buffer_size;
        BufferState {
            size,
            data_len: state.audio_len,
            free_len: size.saturating_sub(state.audio_len),
            read_pointer: state.audio_rp,
        }
    }

    fn decoder_state(&mut self) -> DecoderState {
        let state = self.handle.state.lock();
        DecoderState {
            status: DecoderStatus(state.status),
            width: state.width,
            height: state.height,
            has_video: false,
            has_audio: false,
        }
    }

    fn set_trick_mode(&mut self, mode: TrickMode) -> Result<()> {
        self.handle.state.lock().trick_mode = mode;
        Ok(())
    }

    fn set_freerun(&mut self, enable: bool) -> Result<()> {
        self.handle.state.lock().freerun = enable;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.handle.state.lock().volume = volume;
        Ok(())
    }

    fn set_lr_mix(&mut self, mix: bool) -> Result<()> {
        self.handle.state.lock().lr_mix = mix;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.handle.state.lock().paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.handle.state.lock().paused = false;
        Ok(())
    }

    fn checkin_pts(&mut self, pts: u64) -> Result<()> {
        self.handle.state.lock().pts.push(pts);
        Ok(())
    }

    fn switch_audio(&mut self, pid: u16, _format: AudioFormat) -> Result<()> {
        self.handle.state.lock().audio_pid = pid;
        Ok(())
    }

    fn set_subtitle_pid(&mut self, pid: u16) -> Result<()> {
        self.handle.state.lock().sub_pid = pid;
        Ok(())
    }
}

/// 模拟设备工厂，保留所有创建过的设备句柄
pub struct SimDeviceProvider {
    settings: SimSettings,
    handles: Mutex<Vec<SimHandle>>,
    pending_init_failures: Mutex<u32>,
}

impl SimDeviceProvider {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings,
            handles: Mutex::new(Vec::new()),
            pending_init_failures: Mutex::new(0),
        }
    }

    /// 下一个创建的设备前 n 次 init 失败
    pub fn fail_next_device_inits(&self, n: u32) {
        *self.pending_init_failures.lock() = n;
    }

    pub fn handles(&self) -> Vec<SimHandle> {
        self.handles.lock().clone()
    }

    /// 指定角色最近创建的设备
    pub fn last(&self, role: ChannelRole) -> Option<SimHandle> {
        self.handles.lock().iter().rev().find(|h| h.role == role).cloned()
    }

    /// 指定角色所有设备的 close 次数之和
    pub fn total_closes(&self, role: ChannelRole) -> u32 {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.role == role)
            .map(|h| h.close_count())
            .sum()
    }
}

impl DeviceProvider for SimDeviceProvider {
    fn create(&self, role: ChannelRole) -> Box<dyn DecoderDevice> {
        let handle = SimHandle::new(role, self.settings);
        let failures = std::mem::take(&mut *self.pending_init_failures.lock());
        if failures > 0 {
            handle.fail_next_inits(failures);
        }
        self.handles.lock().push(handle.clone());
        Box::new(SimDevice::new(handle))
    }
}

/// 记录全局开关调用
#[derive(Default)]
pub struct SimSysControl {
    hints: Mutex<Vec<SysHint>>,
    clear_frames: Mutex<u32>,
    force_reset_disabled: bool,
}

impl SimSysControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_force_reset() -> Self {
        Self {
            force_reset_disabled: true,
            ..Self::default()
        }
    }

    pub fn hints(&self) -> Vec<SysHint> {
        self.hints.lock().clone()
    }

    pub fn count(&self, hint: SysHint) -> usize {
        self.hints.lock().iter().filter(|h| **h == hint).count()
    }

    pub fn clear_frame_count(&self) -> u32 {
        *self.clear_frames.lock()
    }
}

impl SysControl for SimSysControl {
    fn apply(&self, hint: SysHint) {
        self.hints.lock().push(hint);
    }

    fn force_reset_supported(&self) -> bool {
        !self.force_reset_disabled
    }

    fn clear_last_frame(&self) {
        *self.clear_frames.lock() += 1;
    }
}

/// 记录窗口调用的模拟显示表面
#[derive(Default)]
pub struct SimSurface {
    geometry: Mutex<Vec<WindowRect>>,
    refreshes: Mutex<u64>,
}

impl SimSurface {
    pub fn geometry_updates(&self) -> Vec<WindowRect> {
        self.geometry.lock().clone()
    }

    pub fn refresh_count(&self) -> u64 {
        *self.refreshes.lock()
    }
}

impl VideoSurface for SimSurface {
    fn set_geometry(&self, rect: WindowRect) {
        self.geometry.lock().push(rect);
    }

    fn refresh(&self) {
        *self.refreshes.lock() += 1;
    }
}

/// 字幕服务调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleCall {
    Open(u16),
    Close,
    Show,
    Hide,
}

#[derive(Default)]
pub struct SimSubtitles {
    calls: Mutex<Vec<SubtitleCall>>,
}

impl SimSubtitles {
    pub fn calls(&self) -> Vec<SubtitleCall> {
        self.calls.lock().clone()
    }
}

impl SubtitleService for SimSubtitles {
    fn open(&self, params: &SubtitleParams) {
        self.calls.lock().push(SubtitleCall::Open(params.pid));
    }

    fn close(&self) {
        self.calls.lock().push(SubtitleCall::Close);
    }

    fn show(&self) {
        self.calls.lock().push(SubtitleCall::Show);
    }

    fn hide(&self) {
        self.calls.lock().push(SubtitleCall::Hide);
    }
}

const TS_PACKET_SIZE: usize = 188;

/// 最简单的按 PID 拆包的软件解复用器：每个 TS 包的负载作为一个 ES 包
pub struct SimExtractor {
    video_pid: u16,
    audio_pid: u16,
    pending: VecDeque<EsPacket>,
    remainder: Vec<u8>,
}

impl SimExtractor {
    pub fn new(video_pid: u16, audio_pid: u16) -> Self {
        Self {
            video_pid,
            audio_pid,
            pending: VecDeque::new(),
            remainder: Vec::new(),
        }
    }

    fn split_packet(&mut self, packet: &[u8]) {
        if packet[0] != 0x47 {
            return;
        }
        let pid = (((packet[1] as u16) << 8) | packet[2] as u16) & 0x1fff;
        let stream = if pid == self.video_pid {
            StreamType::Video
        } else if pid == self.audio_pid {
            StreamType::Audio
        } else {
            return;
        };
        let afc = (packet[3] >> 4) & 0x3;
        if afc & 0x1 == 0 {
            return;
        }
        let mut offset = 4;
        if afc & 0x2 != 0 {
            offset += 1 + packet[4] as usize;
        }
        if offset >= TS_PACKET_SIZE {
            return;
        }
        self.pending.push_back(EsPacket {
            stream,
            data: packet[offset..].to_vec(),
            pts: NO_PTS,
        });
    }
}

impl ElementaryExtractor for SimExtractor {
    fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.remainder.extend_from_slice(data);
        let whole = self.remainder.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        let buffered: Vec<u8> = self.remainder.drain(..whole).collect();
        for packet in buffered.chunks_exact(TS_PACKET_SIZE) {
            self.split_packet(packet);
        }
        Ok(())
    }

    fn next_packet(&mut self) -> Option<EsPacket> {
        self.pending.pop_front()
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.remainder.clear();
    }

    fn description(&self) -> String {
        format!("SimExtractor(vpid={}, apid={})", self.video_pid, self.audio_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_device_accepts_until_full() {
        let provider = SimDeviceProvider::new(SimSettings {
            video_buffer_size: 100,
            audio_buffer_size: 100,
            drain_per_query: 0,
        });
        let mut device = provider.create(ChannelRole::Video);
        device.init(&CodecConfig::new(ChannelRole::Video)).unwrap();
        assert_eq!(device.write(&[1u8; 80]).unwrap(), 80);
        assert_eq!(device.write(&[2u8; 80]).unwrap(), 20);
        assert!(matches!(device.write(&[3u8; 1]), Err(PlayerError::WouldBlock)));
        let handle = provider.last(ChannelRole::Video).unwrap();
        assert_eq!(handle.written().len(), 100);
        handle.drain(50);
        assert_eq!(device.video_buffer_state().data_len, 50);
        assert_eq!(device.video_buffer_state().read_pointer, 50);
    }

    #[test]
    fn test_sim_extractor_splits_by_pid() {
        let mut extractor = SimExtractor::new(256, 257);
        let mut ts = Vec::new();
        for pid in [256u16, 257, 300] {
            let mut packet = vec![0u8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            packet[1] = (pid >> 8) as u8;
            packet[2] = (pid & 0xff) as u8;
            packet[3] = 0x10;
            ts.extend_from_slice(&packet);
        }
        // 分两次送入，中间截断一个包
        extractor.feed(&ts[..200]).unwrap();
        extractor.feed(&ts[200..]).unwrap();
        let first = extractor.next_packet().unwrap();
        assert_eq!(first.stream, StreamType::Video);
        assert_eq!(first.data.len(), TS_PACKET_SIZE - 4);
        assert_eq!(extractor.next_packet().unwrap().stream, StreamType::Audio);
        assert!(extractor.next_packet().is_none());
    }
}
