use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use myy_tsplayer::core::{
    AudioFormat, AudioParams, PlayerEvent, PropertyMap, StreamType, VideoFormat, VideoParams, NO_PTS,
};
use myy_tsplayer::player::sim::{SimDeviceProvider, SimSettings, SimSurface, SimSysControl};
use myy_tsplayer::player::PlaybackSession;

/// 用模拟解码设备播放一个 TS 文件
#[derive(Parser, Debug)]
#[command(name = "myy_tsplayer", version, about = "机顶盒 TS 播放引擎演示")]
struct Args {
    /// 输入 TS 文件
    file: PathBuf,

    #[arg(long, default_value_t = 256)]
    vpid: u16,

    #[arg(long, default_value_t = 257)]
    apid: u16,

    /// 视频格式: h264 / hevc / mpeg12 / avs2 ...
    #[arg(long, default_value = "h264")]
    vformat: String,

    /// 音频格式: aac / ac3 / mpeg ...
    #[arg(long, default_value = "aac")]
    aformat: String,

    /// 每次写入的字节数
    #[arg(long, default_value_t = 1316 * 10)]
    chunk: usize,

    /// 属性文件（JSON 平铺对象，键同系统属性）
    #[arg(long)]
    props: Option<PathBuf>,

    /// 写入这么多字节后执行一次 Seek
    #[arg(long)]
    seek_after: Option<usize>,

    /// 以快进模式播放
    #[arg(long)]
    fast: bool,
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    info!("🎬 MYY TsPlayer 启动: {}", args.file.display());

    let vformat = VideoFormat::from_name(&args.vformat)
        .ok_or_else(|| anyhow!("不支持的视频格式: {}", args.vformat))?;
    let aformat = AudioFormat::from_name(&args.aformat)
        .ok_or_else(|| anyhow!("不支持的音频格式: {}", args.aformat))?;
    let props = match &args.props {
        Some(path) => PropertyMap::from_json_file(path)?,
        None => PropertyMap::new(),
    };
    let data = std::fs::read(&args.file).with_context(|| format!("无法读取 {}", args.file.display()))?;

    let provider = Arc::new(SimDeviceProvider::new(SimSettings {
        drain_per_query: (args.chunk as u32).saturating_mul(2),
        ..SimSettings::default()
    }));
    let session = PlaybackSession::builder(provider)
        .sys_control(Arc::new(SimSysControl::new()))
        .surface(Arc::new(SimSurface::default()))
        .properties(&props)
        .build()?;
    let events = session.subscribe();

    session.init_video(VideoParams {
        pid: args.vpid,
        format: vformat,
        ..VideoParams::default()
    })?;
    session.init_audio(&[AudioParams {
        pid: args.apid,
        format: aformat,
        sample_rate: 48000,
        channels: 2,
    }])?;
    session.start()?;
    if args.fast {
        session.fast()?;
    }

    let chunk = args.chunk.max(1);
    let mut offset = 0usize;
    let mut seek_at = args.seek_after;
    while offset < data.len() {
        let end = (offset + chunk).min(data.len());
        match session.write_data(StreamType::Ts, &data[offset..end], NO_PTS) {
            Ok(0) => thread::sleep(session.write_backoff()),
            Ok(n) => offset += n,
            Err(e) if e.is_transient() => thread::sleep(session.write_backoff()),
            Err(e) => return Err(e.into()),
        }

        if seek_at.map_or(false, |at| offset >= at) {
            seek_at = None;
            info!("⏩ 已写入 {} 字节，执行 Seek", offset);
            session.seek()?;
        }

        for event in events.try_iter() {
            match event {
                PlayerEvent::Stats(_) => {}
                PlayerEvent::PlaybackError(kind) => warn!("❌ 播放错误: {:?}", kind),
                other => info!("📣 {:?}", other),
            }
        }
    }

    let stats = session.stats();
    session.stop()?;
    session.wait_stopped();
    info!(
        "✅ 播放结束: 提交 {} 字节，接受 {} 字节，{} 次写入，码率 {} bps",
        stats.bytes_offered, stats.bytes_accepted, stats.write_calls, stats.stream_bitrate
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
