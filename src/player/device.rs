use crate::core::{
    AudioBalance, AudioFormat, BufferState, ChannelRole, DecodeMode, DecoderState, Result, StreamType,
    SubtitleParams, TrickMode, VideoFormat, WindowRect,
};

/// 解码通道配置（在 init 之前设置）
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub role: ChannelRole,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_sub: bool,
    pub video_format: VideoFormat,
    pub video_pid: u16,
    pub audio_format: AudioFormat,
    pub audio_pid: u16,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub sub_pid: u16,
    pub frame_rate: u32,
    pub decode_mode: DecodeMode,
    /// 快进 + Stream 模式下的 H.264 关闭 POC 重排
    pub no_poc_reorder: bool,
}

impl CodecConfig {
    pub fn new(role: ChannelRole) -> Self {
        Self {
            role,
            has_video: false,
            has_audio: false,
            has_sub: false,
            video_format: VideoFormat::Unknown,
            video_pid: 0,
            audio_format: AudioFormat::Unknown,
            audio_pid: 0,
            audio_sample_rate: 0,
            audio_channels: 0,
            sub_pid: 0,
            frame_rate: 0,
            decode_mode: DecodeMode::Single,
            no_poc_reorder: false,
        }
    }
}

/// 硬件解码器接口（由外部编解码库实现）
///
/// write 永远不会无限阻塞：要么返回接受的字节数（可能为 0），
/// 要么返回 `PlayerError::WouldBlock`；其他错误视为硬件错误
pub trait DecoderDevice: Send {
    fn init(&mut self, config: &CodecConfig) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn video_buffer_state(&mut self) -> BufferState;

    fn audio_buffer_state(&mut self) -> BufferState;

    fn decoder_state(&mut self) -> DecoderState;

    fn set_trick_mode(&mut self, mode: TrickMode) -> Result<()>;

    fn set_freerun(&mut self, enable: bool) -> Result<()>;

    fn set_volume(&mut self, volume: f32) -> Result<()>;

    /// 左右声道混合
    fn set_lr_mix(&mut self, mix: bool) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn checkin_pts(&mut self, pts: u64) -> Result<()>;

    /// 在运行中的通道上切换音轨
    fn switch_audio(&mut self, pid: u16, format: AudioFormat) -> Result<()>;

    fn set_subtitle_pid(&mut self, pid: u16) -> Result<()>;
}

/// 解码设备工厂
pub trait DeviceProvider: Send + Sync {
    fn create(&self, role: ChannelRole) -> Box<dyn DecoderDevice>;
}

/// 设备全局开关（会话级策略值，由调用方显式传入）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysHint {
    /// 停止时保留解码器内存
    KeepDecoderMemory(bool),
    /// 纯视频时强制固定帧时长
    FixDuration(bool),
    /// 设备级强制复位（未知致命错误）
    DecoderForceReset,
    /// 停止时是否黑屏
    BlackoutPolicy(bool),
    ChannelMask(AudioBalance),
    ErrorRecovery(u8),
    AvSync(bool),
    VideoVisible(bool),
}

/// 系统控制接口（sysfs 等全局配置）
pub trait SysControl: Send + Sync {
    fn apply(&self, hint: SysHint);

    /// 设备是否允许应用层触发强制复位
    fn force_reset_supported(&self) -> bool {
        true
    }

    /// 清除最后一帧画面
    fn clear_last_frame(&self);
}

/// 什么都不做的系统控制（无硬件环境）
#[derive(Debug, Default)]
pub struct NullSysControl;

impl SysControl for NullSysControl {
    fn apply(&self, _hint: SysHint) {}

    fn clear_last_frame(&self) {}
}

/// 显示窗口/图形缓冲
pub trait VideoSurface: Send + Sync {
    fn set_geometry(&self, rect: WindowRect);

    /// 空闲时周期性循环一个缓冲，避免画面陈旧
    fn refresh(&self);
}

/// 字幕渲染服务
pub trait SubtitleService: Send + Sync {
    fn open(&self, params: &SubtitleParams);

    fn close(&self);

    fn show(&self);

    fn hide(&self);
}

/// 软件解复用出的 ES 包
#[derive(Debug, Clone, PartialEq)]
pub struct EsPacket {
    pub stream: StreamType,
    pub data: Vec<u8>,
    pub pts: u64,
}

/// 外部软件解复用器（分离模式兼容路径）
pub trait ElementaryExtractor: Send {
    /// 送入原始 TS 数据
    fn feed(&mut self, data: &[u8]) -> Result<()>;

    /// 取出下一个已解出的 ES 包
    fn next_packet(&mut self) -> Option<EsPacket>;

    fn reset(&mut self);

    fn description(&self) -> String;
}
