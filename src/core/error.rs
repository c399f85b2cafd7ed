use thiserror::Error;

use crate::core::types::FaultKind;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// 设备忙（缓冲区满或驱动返回 EAGAIN），调用方应稍后重试
    #[error("设备忙，请稍后重试")]
    WouldBlock,

    #[error("解码通道不可用: {0}")]
    BadHandle(String),

    #[error("解码器致命错误: {0:?}")]
    DecoderFault(FaultKind),

    #[error("配置无效: {0}")]
    ConfigurationInvalid(String),

    #[error("状态错误: {0}")]
    InvalidState(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, PlayerError::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
