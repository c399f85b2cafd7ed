use crate::core::{
    log_ctx, AudioBalance, AudioFormat, BufferState, ChannelRole, DecoderState, PlayerError, Result, TrickMode,
};
use crate::player::device::{CodecConfig, DecoderDevice};
use log::{debug, info, warn};

/// 解码通道 - 管理一个硬件解码器句柄的生命周期
///
/// Uninitialized --init--> Initialized --close--> Uninitialized
pub struct CodecChannel {
    device: Box<dyn DecoderDevice>,
    config: CodecConfig,
    initialized: bool,
    trick_mode: TrickMode,
    init_count: u32,
}

impl CodecChannel {
    pub fn new(device: Box<dyn DecoderDevice>, config: CodecConfig) -> Self {
        Self {
            device,
            config,
            initialized: false,
            trick_mode: TrickMode::None,
            init_count: 0,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.config.role
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn trick_mode(&self) -> TrickMode {
        self.trick_mode
    }

    /// 打开并配置硬件解码器
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(PlayerError::InvalidState(format!(
                "{} 通道已初始化，需先 close",
                self.config.role.as_str()
            )));
        }
        match self.device.init(&self.config) {
            Ok(()) => {
                self.initialized = true;
                self.init_count += 1;
                info!(
                    "{} ✅ {} 通道初始化: vfmt={}, vpid={}, apid={}, mode={:?}",
                    log_ctx(),
                    self.config.role.as_str(),
                    self.config.video_format.name(),
                    self.config.video_pid,
                    self.config.audio_pid,
                    self.config.decode_mode
                );
                Ok(())
            }
            Err(e) => {
                warn!("{} ❌ {} 通道初始化失败: {}", log_ctx(), self.config.role.as_str(), e);
                Err(PlayerError::BadHandle(e.to_string()))
            }
        }
    }

    /// 关闭硬件解码器，失败时同样视为已关闭
    pub fn close(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        self.trick_mode = TrickMode::None;
        let result = self.device.close();
        if let Err(ref e) = result {
            warn!("{} ⚠ {} 通道关闭出错: {}", log_ctx(), self.config.role.as_str(), e);
        }
        result
    }

    /// 关闭后立即重新打开（仅用于写入致命错误的恢复）
    pub fn reinit(&mut self) -> Result<()> {
        let trick_mode = self.trick_mode;
        if let Err(e) = self.close() {
            warn!("{} ⚠ {} 通道重建前关闭失败，继续重新打开: {}", log_ctx(), self.config.role.as_str(), e);
        }
        self.init()?;
        if trick_mode != TrickMode::None {
            self.set_mode(trick_mode)?;
        }
        info!("{} 🔁 {} 通道已重新初始化", log_ctx(), self.config.role.as_str());
        Ok(())
    }

    /// 修改配置并重新打开（在线升级解码配置）
    pub fn reconfigure(&mut self, update: impl FnOnce(&mut CodecConfig)) -> Result<()> {
        if let Err(e) = self.close() {
            warn!("{} ⚠ {} 通道切换配置前关闭失败，继续重新打开: {}", log_ctx(), self.config.role.as_str(), e);
        }
        update(&mut self.config);
        self.init()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.initialized {
            return Err(PlayerError::BadHandle(format!("{} 通道未初始化", self.config.role.as_str())));
        }
        self.device.write(data)
    }

    pub fn video_buffer_state(&mut self) -> BufferState {
        if !self.initialized {
            return BufferState::default();
        }
        self.device.video_buffer_state()
    }

    pub fn audio_buffer_state(&mut self) -> BufferState {
        if !self.initialized {
            return BufferState::default();
        }
        self.device.audio_buffer_state()
    }

    pub fn decoder_state(&mut self) -> DecoderState {
        let mut state = if self.initialized {
            self.device.decoder_state()
        } else {
            DecoderState::default()
        };
        state.has_video = self.config.has_video;
        state.has_audio = self.config.has_audio;
        state
    }

    pub fn set_mode(&mut self, mode: TrickMode) -> Result<()> {
        if !self.initialized {
            return Err(PlayerError::BadHandle("设置特技模式时通道未初始化".into()));
        }
        self.device.set_trick_mode(mode)?;
        self.trick_mode = mode;
        debug!("{} {} 通道特技模式: {:?}", log_ctx(), self.config.role.as_str(), mode);
        Ok(())
    }

    pub fn set_freerun(&mut self, enable: bool) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.set_freerun(enable)
    }

    /// 音量 0.0 - 1.0
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PlayerError::ConfigurationInvalid(format!("音量 {} 超出范围", volume)));
        }
        if !self.initialized {
            return Ok(());
        }
        self.device.set_volume(volume)
    }

    pub fn set_audio_balance(&mut self, balance: AudioBalance) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.set_lr_mix(balance == AudioBalance::Mix)
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.pause()
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.resume()
    }

    pub fn checkin_pts(&mut self, pts: u64) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.checkin_pts(pts)
    }

    pub fn switch_audio(&mut self, pid: u16, format: AudioFormat) -> Result<()> {
        if !self.initialized {
            return Err(PlayerError::BadHandle("切换音轨时通道未初始化".into()));
        }
        self.device.switch_audio(pid, format)?;
        self.config.has_audio = true;
        self.config.audio_pid = pid;
        self.config.audio_format = format;
        Ok(())
    }

    pub fn set_subtitle_pid(&mut self, pid: u16) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.device.set_subtitle_pid(pid)?;
        self.config.sub_pid = pid;
        Ok(())
    }

    pub fn init_count(&self) -> u32 {
        self.init_count
    }
}

/// 当前播放使用的通道组合，Start 时确定，之后不再改变
pub enum ChannelSet {
    /// 单通道接收完整 TS
    Combined(CodecChannel),
    /// 音视频各自的通道（缺失的流没有通道）
    Split {
        video: Option<CodecChannel>,
        audio: Option<CodecChannel>,
    },
}

impl ChannelSet {
    pub fn video_mut(&mut self) -> Option<&mut CodecChannel> {
        match self {
            ChannelSet::Combined(channel) => Some(channel),
            ChannelSet::Split { video, .. } => video.as_mut(),
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut CodecChannel> {
        match self {
            ChannelSet::Combined(channel) => Some(channel),
            ChannelSet::Split { audio, .. } => audio.as_mut(),
        }
    }

    /// 状态查询使用的主通道：有视频用视频通道，否则用音频通道
    pub fn primary_mut(&mut self) -> Option<&mut CodecChannel> {
        match self {
            ChannelSet::Combined(channel) => Some(channel),
            ChannelSet::Split { video: Some(video), .. } => Some(video),
            ChannelSet::Split { audio, .. } => audio.as_mut(),
        }
    }

    pub fn channels_mut(&mut self) -> Vec<&mut CodecChannel> {
        match self {
            ChannelSet::Combined(channel) => vec![channel],
            ChannelSet::Split { video, audio } => video.iter_mut().chain(audio.iter_mut()).collect(),
        }
    }

    /// 初始化全部通道；任一失败时关闭已打开的通道
    pub fn init_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for channel in self.channels_mut() {
            if let Err(e) = channel.init() {
                result = Err(e);
                break;
            }
        }
        if result.is_err() {
            self.close_all();
        }
        result
    }

    pub fn close_all(&mut self) {
        for channel in self.channels_mut() {
            let _ = channel.close();
        }
    }
}

impl Drop for CodecChannel {
    fn drop(&mut self) {
        if self.initialized {
            warn!("{} ⚠ {} 通道被 drop 时仍处于打开状态，正在关闭", log_ctx(), self.config.role.as_str());
            let _ = self.close();
        }
    }
}
