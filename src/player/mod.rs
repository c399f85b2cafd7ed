// 播放器核心模块

pub mod device;
pub mod sim;           // 模拟解码设备（演示程序 + 测试）
pub mod codec_channel;
pub mod shadow_ring;
pub mod write_scheduler;
pub mod header_recovery;
pub mod watchdog;
pub mod async_stop;
pub mod reporter;
pub mod extractor_thread;
pub mod session;

pub use codec_channel::{ChannelSet, CodecChannel};
pub use device::{
    CodecConfig, DecoderDevice, DeviceProvider, ElementaryExtractor, EsPacket, NullSysControl, SubtitleService,
    SysControl, SysHint, VideoSurface,
};
pub use header_recovery::HeaderPhase;
pub use session::{PlaybackSession, SessionBuilder};
pub use shadow_ring::ShadowRingBuffer;
pub use write_scheduler::WriteScheduler;
