// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod config;
pub mod error;

pub use types::*;
pub use clock::*;
pub use config::*;
pub use error::*;

use std::process;
use std::thread;

/// 日志上下文：进程 ID + 线程 ID，便于区分多个工作线程的日志
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
