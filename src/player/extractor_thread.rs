use crate::core::{log_ctx, PlayerError, Result, StreamType, WakeSignal};
use crate::player::device::{ElementaryExtractor, EsPacket};
use crate::player::session::SessionShared;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, info, warn};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 管道容量（原始 TS 数据块个数）
const PIPE_CAPACITY: usize = 256;

/// 软件解复用线程
/// - 调用方写入的 TS 经有界 channel（管道）送到线程，满了就返回 WouldBlock
/// - 线程把数据喂给外部解复用器，解出的 ES 包经写入调度器送入音视频通道
/// - 停止时取回解复用器，下次 Start 复用
pub struct ExtractorThread {
    pipe: Option<Sender<Vec<u8>>>,
    stop: WakeSignal,
    handle: Option<JoinHandle<Box<dyn ElementaryExtractor>>>,
}

impl ExtractorThread {
    pub(crate) fn start(
        session: Weak<SessionShared>,
        extractor: Box<dyn ElementaryExtractor>,
        poll: Duration,
        backoff: Duration,
    ) -> Result<Self> {
        let (pipe_tx, pipe_rx) = bounded::<Vec<u8>>(PIPE_CAPACITY);
        let stop = WakeSignal::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("tsplayer-extractor".into())
            .spawn(move || extract_loop(session, extractor, pipe_rx, thread_stop, poll, backoff))
            .map_err(PlayerError::IoError)?;
        Ok(Self {
            pipe: Some(pipe_tx),
            stop,
            handle: Some(handle),
        })
    }

    /// 写入管道（非阻塞）
    pub fn push(&self, data: &[u8]) -> Result<usize> {
        let Some(pipe) = self.pipe.as_ref() else {
            return Err(PlayerError::InvalidState("解复用线程已停止".into()));
        };
        match pipe.try_send(data.to_vec()) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => {
                info!("{} 🚰 管道已满，暂不写入", log_ctx());
                Err(PlayerError::WouldBlock)
            }
            Err(TrySendError::Disconnected(_)) => Err(PlayerError::InvalidState("解复用线程已退出".into())),
        }
    }

    /// 停止线程并取回解复用器
    pub fn stop(&mut self) -> Option<Box<dyn ElementaryExtractor>> {
        info!("{} 🛑 ExtractorThread::stop() called", log_ctx());
        self.stop.close();
        self.pipe.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(extractor) => Some(extractor),
            Err(_) => {
                error!("{} ❌ 解复用线程异常退出，解复用器丢失", log_ctx());
                None
            }
        }
    }
}

impl Drop for ExtractorThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("{} ⚠ ExtractorThread 被 drop，但未调用 stop()，正在停止", log_ctx());
            let _ = self.stop();
        }
    }
}

fn extract_loop(
    session: Weak<SessionShared>,
    mut extractor: Box<dyn ElementaryExtractor>,
    pipe: Receiver<Vec<u8>>,
    stop: WakeSignal,
    poll: Duration,
    backoff: Duration,
) -> Box<dyn ElementaryExtractor> {
    info!("{} 🎬 解复用线程启动: {}", log_ctx(), extractor.description());
    let poll = poll.max(Duration::from_millis(1));
    let mut chunks = 0usize;
    let mut video_packets = 0usize;
    let mut audio_packets = 0usize;

    'outer: while !stop.is_closed() {
        match pipe.recv_timeout(poll) {
            Ok(chunk) => {
                chunks += 1;
                if let Err(e) = extractor.feed(&chunk) {
                    warn!("{} ⚠ 解复用器拒绝数据: {}", log_ctx(), e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Some(packet) = extractor.next_packet() {
            match packet.stream {
                StreamType::Video => video_packets += 1,
                StreamType::Audio => audio_packets += 1,
                _ => continue,
            }
            if !deliver(&session, packet, &stop, poll, backoff) {
                break 'outer;
            }
        }
    }

    extractor.reset();
    info!(
        "{} 🛑 解复用线程退出（{} 个数据块：{} 视频包，{} 音频包）",
        log_ctx(),
        chunks,
        video_packets,
        audio_packets
    );
    extractor
}

/// 把一个 ES 包完整送入会话；返回 false 表示线程应退出
fn deliver(session: &Weak<SessionShared>, packet: EsPacket, stop: &WakeSignal, poll: Duration, backoff: Duration) -> bool {
    let mut offset = 0usize;
    let mut pts = packet.pts;
    while offset < packet.data.len() {
        if stop.is_closed() {
            return false;
        }
        let Some(shared) = session.upgrade() else {
            return false;
        };
        let result = {
            let Some(mut core) = shared.core.try_lock_for(poll) else {
                continue;
            };
            shared.submit_extracted(&mut core, packet.stream, &packet.data[offset..], pts)
        };
        match result {
            Ok(n) => {
                offset += n;
                pts = crate::core::NO_PTS;
                if n == 0 && !stop.sleep(backoff) {
                    return false;
                }
            }
            Err(PlayerError::WouldBlock) => {
                if !stop.sleep(backoff) {
                    return false;
                }
            }
            Err(e) => {
                warn!("{} ⚠ 丢弃 {:?} 包 ({} 字节): {}", log_ctx(), packet.stream, packet.data.len(), e);
                return true;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::sim::SimExtractor;

    #[test]
    fn test_pipe_backpressure_and_stop_returns_extractor() {
        let mut thread = ExtractorThread::start(
            Weak::new(),
            Box::new(SimExtractor::new(256, 257)),
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(thread.push(&[0u8; 188]).unwrap(), 188);
        let extractor = thread.stop().unwrap();
        assert!(extractor.description().contains("vpid=256"));
        assert!(matches!(thread.push(&[0u8; 188]), Err(PlayerError::InvalidState(_))));
    }
}
