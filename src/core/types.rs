use serde::{Deserialize, Serialize};

use crate::core::error::PlayerError;

/// 无效时间戳（与 FFmpeg AV_NOPTS_VALUE 一致）
pub const NO_PTS: u64 = 0x8000_0000_0000_0000;

/// 视频编码格式
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoFormat {
    #[default]
    Unknown,
    Mpeg12,
    Mpeg4,
    H264,
    Mjpeg,
    Real,
    Jpeg,
    Vc1,
    Avs,
    /// H.264 4K 专用解码配置
    H264_4K2K,
    Hevc,
    Avs2,
}

impl VideoFormat {
    pub fn name(&self) -> &'static str {
        match self {
            VideoFormat::Unknown => "unknown",
            VideoFormat::Mpeg12 => "mpeg12",
            VideoFormat::Mpeg4 => "mpeg4",
            VideoFormat::H264 => "h264",
            VideoFormat::Mjpeg => "mjpeg",
            VideoFormat::Real => "real",
            VideoFormat::Jpeg => "jpeg",
            VideoFormat::Vc1 => "vc1",
            VideoFormat::Avs => "avs",
            VideoFormat::H264_4K2K => "h264_4k2k",
            VideoFormat::Hevc => "hevc",
            VideoFormat::Avs2 => "avs2",
        }
    }

    /// 从命令行/配置字符串解析
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "mpeg12" | "mpeg2" => VideoFormat::Mpeg12,
            "mpeg4" => VideoFormat::Mpeg4,
            "h264" | "avc" => VideoFormat::H264,
            "mjpeg" => VideoFormat::Mjpeg,
            "real" => VideoFormat::Real,
            "jpeg" => VideoFormat::Jpeg,
            "vc1" => VideoFormat::Vc1,
            "avs" => VideoFormat::Avs,
            "h264_4k2k" => VideoFormat::H264_4K2K,
            "hevc" | "h265" => VideoFormat::Hevc,
            "avs2" => VideoFormat::Avs2,
            _ => return None,
        };
        Some(format)
    }

    /// 高清/4K 需要不同解码配置的格式，需要影子环形缓冲做在线升级
    pub fn is_legacy_h264(&self) -> bool {
        matches!(self, VideoFormat::H264)
    }

    /// 快进时使用 HEVC 专用 I 帧模式的格式
    pub fn uses_hevc_trick_mode(&self) -> bool {
        matches!(self, VideoFormat::Hevc | VideoFormat::Avs2)
    }
}

/// 音频编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioFormat {
    #[default]
    Unknown,
    Mpeg,
    PcmS16Le,
    Aac,
    Ac3,
    Alaw,
    Mulaw,
    Dts,
    PcmS16Be,
    Flac,
    PcmU8,
    Adpcm,
    Amr,
    Wma,
    Vorbis,
    DdPlus,
}

impl AudioFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "mpeg" | "mp2" | "mp3" => AudioFormat::Mpeg,
            "pcm_s16le" => AudioFormat::PcmS16Le,
            "aac" => AudioFormat::Aac,
            "ac3" => AudioFormat::Ac3,
            "alaw" => AudioFormat::Alaw,
            "mulaw" => AudioFormat::Mulaw,
            "dts" => AudioFormat::Dts,
            "pcm_s16be" => AudioFormat::PcmS16Be,
            "flac" => AudioFormat::Flac,
            "pcm_u8" => AudioFormat::PcmU8,
            "adpcm" => AudioFormat::Adpcm,
            "amr" => AudioFormat::Amr,
            "wma" => AudioFormat::Wma,
            "vorbis" => AudioFormat::Vorbis,
            "eac3" | "ddplus" => AudioFormat::DdPlus,
            _ => return None,
        };
        Some(format)
    }
}

/// 写入数据的流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
    /// 完整的 TS 流（由合并模式的通道按 PID 解复用）
    Ts,
}

/// 视频参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoParams {
    pub pid: u16,
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// 音频参数（列表以 pid 与采样率均为 0 的项结尾）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioParams {
    pub pid: u16,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioParams {
    pub fn is_terminator(&self) -> bool {
        self.pid == 0 && self.sample_rate == 0
    }
}

/// 字幕参数（列表以 pid 为 0 的项结尾）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubtitleParams {
    pub pid: u16,
    pub sub_type: u32,
}

/// 视频窗口位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl WindowRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// 声道模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioBalance {
    Left = 1,
    Right = 2,
    Stereo = 3,
    Mix = 4,
}

impl TryFrom<i32> for AudioBalance {
    type Error = PlayerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AudioBalance::Left),
            2 => Ok(AudioBalance::Right),
            3 => Ok(AudioBalance::Stereo),
            4 => Ok(AudioBalance::Mix),
            other => Err(PlayerError::ConfigurationInvalid(format!(
                "声道模式 {} 超出范围 1..=4",
                other
            ))),
        }
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Fast,
    Stopping,
}

impl PlaybackState {
    /// 通道是否处于运行状态（可写入数据）
    pub fn is_running(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Fast)
    }
}

/// 解复用方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemuxMode {
    /// 单通道接收完整 TS，由硬件按 PID 解复用
    Combined,
    /// 音视频分离通道，由软件解复用后写入 ES
    Split,
}

/// 解码器缓冲/节奏策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeMode {
    Single,
    Stream,
}

/// 特技播放模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickMode {
    None,
    /// 只解 I 帧
    IFrame,
    /// HEVC/AVS2 专用 I 帧模式
    IFrameHevc,
}

/// 解码通道角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Combined,
    Video,
    Audio,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Combined => "combined",
            ChannelRole::Video => "video",
            ChannelRole::Audio => "audio",
        }
    }
}

/// 硬件环形缓冲状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferState {
    pub size: u32,
    pub data_len: u32,
    pub free_len: u32,
    pub read_pointer: u32,
}

impl BufferState {
    /// 缓冲占用比例 (0.0 - 1.0)
    pub fn level(&self) -> f32 {
        if self.size == 0 {
            0.0
        } else {
            self.data_len as f32 / self.size as f32
        }
    }
}

/// 音视频缓冲状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvBufferStatus {
    pub audio: BufferState,
    pub video: BufferState,
}

/// 解码器状态位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecoderStatus(pub u32);

impl DecoderStatus {
    pub const ERROR_MASK: u32 = 0x0000_ff00;
    pub const FATAL_SIZE_OVERFLOW: u32 = 0x0000_0100;
    pub const FATAL_UNKNOWN: u32 = 0x0000_0200;
    pub const FATAL_NO_MEM: u32 = 0x0000_0400;

    pub fn has_error(&self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// 解码器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecoderState {
    pub status: DecoderStatus,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
}

/// 解码器故障分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// 分辨率超出当前解码配置
    ResolutionOverflow,
    /// 未知致命错误
    Unknown,
    /// 解码器内存不足
    OutOfMemory,
    /// 缓冲区长时间满且读指针不动
    BufferStall,
}

/// 播放统计
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub bytes_offered: u64,
    pub bytes_accepted: u64,
    pub write_calls: u64,
    pub header_replays: u64,
    pub teardowns: u64,
    pub live_upgrades: u64,
    pub restarts: u64,
    /// 码率（bps）
    pub stream_bitrate: u64,
    pub video_underflow: bool,
    pub audio_underflow: bool,
}

/// 播放事件（通过 channel 推送给应用线程）
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Started,
    Stopped,
    /// Start 之后第一次写入成功
    FirstWrite,
    Underflow { video: bool, audio: bool },
    UnderflowEnd,
    FaultDetected(FaultKind),
    Recovered(FaultKind),
    /// 恢复连续失败
    PlaybackError(FaultKind),
    Stats(PlaybackStats),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_balance_from_legacy_int() {
        assert_eq!(AudioBalance::try_from(1).ok(), Some(AudioBalance::Left));
        assert_eq!(AudioBalance::try_from(4).ok(), Some(AudioBalance::Mix));
        assert!(AudioBalance::try_from(0).is_err());
        assert!(AudioBalance::try_from(5).is_err());
    }

    #[test]
    fn test_buffer_level() {
        let state = BufferState { size: 1000, data_len: 995, free_len: 5, read_pointer: 0 };
        assert!(state.level() > 0.99);
        assert_eq!(BufferState::default().level(), 0.0);
    }

    #[test]
    fn test_decoder_status_flags() {
        let status = DecoderStatus(DecoderStatus::FATAL_SIZE_OVERFLOW);
        assert!(status.has_error());
        assert!(status.contains(DecoderStatus::FATAL_SIZE_OVERFLOW));
        assert!(!status.contains(DecoderStatus::FATAL_NO_MEM));
        assert!(!DecoderStatus(0).has_error());
    }
}
