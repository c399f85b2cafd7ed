use crate::core::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 系统属性存储（key -> 字符串）
///
/// 会话创建时读取一次，之后不再跟随变化
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// 基于 HashMap 的属性表，可从扁平 JSON 对象文件加载
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    values: HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// 从 JSON 文件加载，例如 `{"iptv.softdemux": 1, "iptv.dumppath": "/tmp"}`
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let values = raw
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();
        Ok(Self { values })
    }
}

impl PropertyStore for PropertyMap {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// 播放引擎调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsPlayerConfig {
    /// 分离解复用（音视频独立通道）
    pub soft_demux: bool,
    /// 分离模式下由调用方直接写入 ES（不经过软件解复用器）
    pub es_data: bool,
    /// 多实例策略（决定 Stream/Single 解码模式）
    pub multi_play: bool,
    pub force_single_mode: bool,
    pub force_multi_mode: bool,
    pub has_audio: bool,
    pub has_video: bool,
    /// 影子环形缓冲容量（单位：1316 字节）
    pub ring_units: usize,
    /// 关闭 H.264 影子缓冲及 4K 在线升级
    pub h264_same_ucode: bool,
    pub video_high_water: f32,
    pub audio_high_water: f32,
    pub write_retry_attempts: u32,
    pub write_retry_budget_ms: u64,
    /// 背压时建议调用方退避的时间
    pub write_backoff_ms: u64,
    pub write_log: bool,
    pub write_collect_enable: bool,
    pub write_collect_expire_ms: u64,
    pub watchdog_stall_detect: bool,
    pub watchdog_interval_ms: u64,
    pub watchdog_stall_ms: u64,
    pub watchdog_settle_ms: u64,
    pub async_stop: bool,
    pub header_recovery: bool,
    pub header_capture_ms: u64,
    pub dump_file: bool,
    pub dump_path: PathBuf,
    pub blackout_policy: bool,
    pub extractor_poll_ms: u64,
}

/// 影子环形缓冲的容量单位（7 个 TS 包）
pub const RING_UNIT_BYTES: usize = 1316;

impl Default for TsPlayerConfig {
    fn default() -> Self {
        Self {
            soft_demux: false,
            es_data: false,
            multi_play: false,
            force_single_mode: false,
            force_multi_mode: false,
            has_audio: true,
            has_video: true,
            ring_units: 5000,
            h264_same_ucode: false,
            video_high_water: 0.99,
            audio_high_water: 0.99,
            write_retry_attempts: 50,
            write_retry_budget_ms: 50,
            write_backoff_ms: 20,
            write_log: false,
            write_collect_enable: true,
            write_collect_expire_ms: 3000,
            watchdog_stall_detect: false,
            watchdog_interval_ms: 50,
            watchdog_stall_ms: 2000,
            watchdog_settle_ms: 500,
            async_stop: false,
            header_recovery: false,
            header_capture_ms: 5000,
            dump_file: false,
            dump_path: PathBuf::from("/tmp"),
            blackout_policy: true,
            extractor_poll_ms: 5,
        }
    }
}

impl TsPlayerConfig {
    /// 从属性存储读取全部参数，缺失或非法的值使用默认值
    pub fn load(store: &dyn PropertyStore) -> Self {
        let d = Self::default();
        let config = Self {
            soft_demux: read_flag(store, "iptv.softdemux", d.soft_demux),
            es_data: read_flag(store, "iptv.middle.softdemux", d.es_data),
            multi_play: read_flag(store, "media.ctcplayer.enable", d.multi_play),
            force_single_mode: read_flag(store, "media.ctcplayer.singlemode", d.force_single_mode),
            force_multi_mode: read_flag(store, "media.ctcplayer.multimode", d.force_multi_mode),
            has_audio: read_flag(store, "iptv.hasaudio", d.has_audio),
            has_video: read_flag(store, "iptv.hasvideo", d.has_video),
            ring_units: read_value(store, "iptv.buffersize", d.ring_units),
            h264_same_ucode: read_flag(store, "iptv.h264.sameucode", d.h264_same_ucode),
            video_high_water: read_value(store, "iptv.write.vlevel", d.video_high_water),
            audio_high_water: read_value(store, "iptv.write.alevel", d.audio_high_water),
            write_retry_attempts: read_value(store, "iptv.write.retry", d.write_retry_attempts),
            write_retry_budget_ms: read_value(store, "iptv.write.retry_budget_ms", d.write_retry_budget_ms),
            write_backoff_ms: read_value(store, "iptv.write.backoff_ms", d.write_backoff_ms),
            write_log: read_flag(store, "iptv.write.log", d.write_log),
            write_collect_enable: read_flag(store, "iptv.write_collect.enable", d.write_collect_enable),
            write_collect_expire_ms: read_value(store, "iptv.write_collect.expire", d.write_collect_expire_ms),
            watchdog_stall_detect: read_flag(store, "iptv.playerwatchdog.support", d.watchdog_stall_detect),
            watchdog_interval_ms: read_value(store, "iptv.watchdog.interval_ms", d.watchdog_interval_ms),
            watchdog_stall_ms: read_value(store, "iptv.watchdog.stall_ms", d.watchdog_stall_ms),
            watchdog_settle_ms: read_value(store, "iptv.watchdog.settle_ms", d.watchdog_settle_ms),
            async_stop: read_flag(store, "media.async.stop.enable", d.async_stop),
            header_recovery: read_flag(store, "iptv.add.tsheader", d.header_recovery),
            header_capture_ms: read_value(store, "iptv.tsheader.capture_ms", d.header_capture_ms),
            dump_file: read_flag(store, "iptv.dumpfile", d.dump_file),
            dump_path: store.get("iptv.dumppath").map(PathBuf::from).unwrap_or(d.dump_path),
            blackout_policy: read_flag(store, "iptv.blackout.policy", d.blackout_policy),
            extractor_poll_ms: read_value(store, "iptv.readffmpeg.time", d.extractor_poll_ms),
        };
        info!(
            "⚙️ 播放参数: soft_demux={}, multi_play={}, async_stop={}, watchdog={}, tsheader={}, vlevel={:.2}, alevel={:.2}",
            config.soft_demux,
            config.multi_play,
            config.async_stop,
            config.watchdog_stall_detect,
            config.header_recovery,
            config.video_high_water,
            config.audio_high_water
        );
        config
    }

    pub fn ring_capacity(&self) -> usize {
        RING_UNIT_BYTES * self.ring_units
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.write_retry_budget_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.watchdog_stall_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.watchdog_settle_ms)
    }

    /// 软件解复用器（把 TS 写入管道，由独立线程解出 ES）
    pub fn uses_extractor(&self) -> bool {
        self.soft_demux && !self.es_data
    }
}

fn read_value<T: FromStr + Copy + std::fmt::Display>(store: &dyn PropertyStore, key: &str, default: T) -> T {
    match store.get(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("⚠ 属性 {}={} 无法解析，使用默认值 {}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

fn read_flag(store: &dyn PropertyStore, key: &str, default: bool) -> bool {
    match store.get(key) {
        Some(raw) => match raw.trim() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => match other.parse::<i64>() {
                Ok(n) => n != 0,
                Err(_) => {
                    warn!("⚠ 属性 {}={} 无法解析，使用默认值 {}", key, raw, default);
                    default
                }
            },
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_store_is_empty() {
        let config = TsPlayerConfig::load(&PropertyMap::new());
        assert!(!config.soft_demux);
        assert_eq!(config.ring_capacity(), 1316 * 5000);
        assert_eq!(config.watchdog_interval_ms, 50);
        assert!((config.video_high_water - 0.99).abs() < f32::EPSILON);
    }

    #[test]
    fn test_load_overrides_and_bad_values() {
        let store = PropertyMap::new()
            .with("iptv.softdemux", 1)
            .with("media.async.stop.enable", "true")
            .with("iptv.write.vlevel", "0.8")
            .with("iptv.buffersize", "not-a-number");
        let config = TsPlayerConfig::load(&store);
        assert!(config.soft_demux);
        assert!(config.async_stop);
        assert!((config.video_high_water - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.ring_units, 5000);
        assert!(config.uses_extractor());
    }

    #[test]
    fn test_property_map_from_json() {
        let store = PropertyMap::from_json_str(r#"{"iptv.dumpfile": 1, "iptv.dumppath": "/data"}"#).unwrap();
        assert_eq!(store.get("iptv.dumpfile").as_deref(), Some("1"));
        let config = TsPlayerConfig::load(&store);
        assert!(config.dump_file);
        assert_eq!(config.dump_path, PathBuf::from("/data"));
    }
}
