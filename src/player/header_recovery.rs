use crate::core::{log_ctx, WakeSignal};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// HEVC 参数集 NAL 类型
const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
/// 视频 PES 的 stream_id
const PES_VIDEO_STREAM_ID: u8 = 0xE0;

/// 扫描线程空闲时的轮询间隔
const SCAN_IDLE: Duration = Duration::from_millis(5);

/// 捕获周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPhase {
    Idle,
    /// 捕获窗口内，写入数据入队
    Capturing,
    /// 窗口已关闭，扫描剩余队列
    Scanning,
    Found,
    Abandoned,
}

struct HeaderInner {
    phase: HeaderPhase,
    queue: VecDeque<Vec<u8>>,
    header: Option<Vec<u8>>,
    capture_until: Instant,
}

struct HeaderShared {
    video_pid: u16,
    inner: Mutex<HeaderInner>,
    wake: WakeSignal,
}

/// TS 头恢复 - Start 后捕获前几秒的原始 TS，离线扫描 VPS/SPS/PPS，
/// Seek 后把找到的参数集包重新注入解码器
pub struct HeaderRecoveryPipeline {
    shared: Arc<HeaderShared>,
    scanner: Option<JoinHandle<()>>,
}

impl HeaderRecoveryPipeline {
    /// 开始捕获并启动扫描线程
    pub fn start(video_pid: u16, capture_window: Duration) -> Self {
        let shared = Arc::new(HeaderShared {
            video_pid,
            inner: Mutex::new(HeaderInner {
                phase: HeaderPhase::Capturing,
                queue: VecDeque::new(),
                header: None,
                capture_until: Instant::now() + capture_window,
            }),
            wake: WakeSignal::new(),
        });
        let worker = Arc::clone(&shared);
        let scanner = thread::Builder::new()
            .name("tsheader-scan".into())
            .spawn(move || scan_loop(worker));
        let scanner = match scanner {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("{} ❌ TS 头扫描线程创建失败: {}", log_ctx(), e);
                shared.inner.lock().phase = HeaderPhase::Abandoned;
                None
            }
        };
        info!("{} 🧩 TS 头捕获开始: pid={}, 窗口 {:?}", log_ctx(), video_pid, capture_window);
        Self { shared, scanner }
    }

    /// 直接以已知的头创建（Seek 重启后沿用上一次的结果）
    pub fn with_header(video_pid: u16, header: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(HeaderShared {
                video_pid,
                inner: Mutex::new(HeaderInner {
                    phase: HeaderPhase::Found,
                    queue: VecDeque::new(),
                    header: Some(header),
                    capture_until: Instant::now(),
                }),
                wake: WakeSignal::new(),
            }),
            scanner: None,
        }
    }

    pub fn video_pid(&self) -> u16 {
        self.shared.video_pid
    }

    pub fn phase(&self) -> HeaderPhase {
        self.shared.inner.lock().phase
    }

    /// 捕获窗口内，把被接受的数据复制入队
    pub fn capture(&self, bytes: &[u8]) {
        let mut inner = self.shared.inner.lock();
        if inner.phase != HeaderPhase::Capturing {
            return;
        }
        if Instant::now() >= inner.capture_until {
            inner.phase = HeaderPhase::Scanning;
            return;
        }
        inner.queue.push_back(bytes.to_vec());
    }

    pub fn queued_packets(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn recovered_header(&self) -> Option<Vec<u8>> {
        self.shared.inner.lock().header.clone()
    }

    /// 停止扫描线程并释放队列
    pub fn shutdown(&mut self) {
        self.shared.wake.close();
        if let Some(handle) = self.scanner.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ TS 头扫描线程异常退出", log_ctx());
            }
        }
        let mut inner = self.shared.inner.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        if matches!(inner.phase, HeaderPhase::Capturing | HeaderPhase::Scanning) {
            inner.phase = HeaderPhase::Abandoned;
        }
        debug!("{} 🧩 TS 头捕获结束，丢弃 {} 个缓存包", log_ctx(), dropped);
    }
}

impl Drop for HeaderRecoveryPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan_loop(shared: Arc<HeaderShared>) {
    info!("{} 🔍 TS 头扫描线程启动", log_ctx());
    let mut scanned = 0usize;
    loop {
        let next = {
            let mut inner = shared.inner.lock();
            let next = inner.queue.pop_front();
            if next.is_none() {
                let window_closed = Instant::now() >= inner.capture_until;
                if window_closed {
                    inner.phase = HeaderPhase::Abandoned;
                    info!("{} 🧩 捕获窗口内没有找到参数集，放弃 (扫描 {} 段)", log_ctx(), scanned);
                    break;
                }
            } else if Instant::now() >= inner.capture_until && inner.phase == HeaderPhase::Capturing {
                inner.phase = HeaderPhase::Scanning;
            }
            next
        };

        match next {
            Some(bytes) => {
                scanned += 1;
                if let Some(header) = find_header_packet(&bytes, shared.video_pid) {
                    let mut inner = shared.inner.lock();
                    inner.header = Some(header.to_vec());
                    inner.phase = HeaderPhase::Found;
                    inner.queue.clear();
                    info!("{} ✅ 找到 VPS/SPS/PPS 头 (扫描 {} 段)", log_ctx(), scanned);
                    break;
                }
            }
            None => {
                if !shared.wake.sleep(SCAN_IDLE) {
                    break;
                }
            }
        }
    }
    info!("{} 🔍 TS 头扫描线程退出", log_ctx());
}

/// 在一段原始 TS 数据中按字节查找视频 PID 的包，并尝试从中提取参数集包
pub fn find_header_packet(data: &[u8], video_pid: u16) -> Option<[u8; TS_PACKET_SIZE]> {
    let mut i = 0;
    while i + TS_PACKET_SIZE <= data.len() {
        let packet = &data[i..i + TS_PACKET_SIZE];
        if packet[0] != TS_SYNC_BYTE {
            i += 1;
            continue;
        }
        let pid = (((packet[1] as u16) << 8) | packet[2] as u16) & 0x1fff;
        let afc = (packet[3] >> 4) & 0x3;
        if pid != video_pid || afc & 0x1 == 0 {
            i += 1;
            continue;
        }
        if let Some(header) = extract_parameter_sets(packet) {
            return Some(header);
        }
        i += TS_PACKET_SIZE;
    }
    None
}

/// 在单个 TS 包里查找连续的 VPS/SPS/PPS
///
/// 返回的包保留从包头到 PPS 结束的字节，其余补 0；
/// 若 PES 为视频流，清除 PTS/DTS 标志位
pub fn extract_parameter_sets(packet: &[u8]) -> Option<[u8; TS_PACKET_SIZE]> {
    let size = packet.len().min(TS_PACKET_SIZE);
    let limit = size.saturating_sub(4);

    // 第一个起始码后是 PES stream_id
    let mut p = 0;
    let mut pes_stream = None;
    while p < limit {
        if let Some(len) = start_code_len(packet, p) {
            p += len;
            pes_stream = Some(p);
            break;
        }
        p += 1;
    }
    let pes_stream = pes_stream?;

    let mut run_start = None;
    let mut ps_count = 0;
    let mut end = None;
    while p < limit {
        let Some(len) = start_code_len(packet, p) else {
            p += 1;
            continue;
        };
        if ps_count == 3 {
            end = Some(p - 1);
            break;
        }
        let nal_type = (packet[p + len] >> 1) & 0x3f;
        match nal_type {
            NAL_VPS => {
                run_start.get_or_insert(p);
                ps_count = 1;
            }
            NAL_SPS | NAL_PPS if run_start.is_some() => ps_count += 1,
            _ => {
                run_start = None;
                ps_count = 0;
            }
        }
        p += len;
    }

    let end = end?;
    let mut header = [0u8; TS_PACKET_SIZE];
    header[..=end].copy_from_slice(&packet[..=end]);

    let flags = pes_stream + 4;
    if header[pes_stream] == PES_VIDEO_STREAM_ID && flags < TS_PACKET_SIZE {
        let pts_dts = header[flags] & 0xC0;
        if pts_dts == 0x80 || pts_dts == 0xC0 {
            header[flags] &= 0x3F;
        }
    }
    Some(header)
}

/// p 处的起始码长度（00 00 00 01 或 00 00 01）
fn start_code_len(data: &[u8], p: usize) -> Option<usize> {
    if p + 4 < data.len() && data[p] == 0 && data[p + 1] == 0 && data[p + 2] == 0 && data[p + 3] == 1 {
        return Some(4);
    }
    if p + 3 < data.len() && data[p] == 0 && data[p + 1] == 0 && data[p + 2] == 1 {
        return Some(3);
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 构造一个带 VPS/SPS/PPS 的视频 TS 包
    pub(crate) fn hevc_header_packet(pid: u16) -> Vec<u8> {
        let mut packet = vec![0xffu8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
        packet[2] = (pid & 0xff) as u8;
        packet[3] = 0x10;
        let mut body = vec![
            0x00, 0x00, 0x01, PES_VIDEO_STREAM_ID, 0x00, 0x00, 0x80, 0x80, 0x05, 0x21, 0x00, 0x01, 0x00, 0x01,
        ];
        for nal in [NAL_VPS, NAL_SPS, NAL_PPS] {
            body.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, nal << 1, 0x01, 0xAA, 0xBB]);
        }
        // IDR slice
        body.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 19 << 1, 0x01, 0xCC]);
        packet[4..4 + body.len()].copy_from_slice(&body);
        packet
    }

    #[test]
    fn test_extracts_parameter_sets_and_clears_pts_flags() {
        let packet = hevc_header_packet(256);
        let header = extract_parameter_sets(&packet).unwrap();
        // PES 的 PTS 标志被清除
        assert_eq!(header[4 + 3 + 4], 0x00);
        // PPS 之后的 slice 不在头里
        let slice_at = 4 + 14 + 3 * 8;
        assert_eq!(&header[..4], &packet[..4]);
        assert_eq!(&header[18..slice_at], &packet[18..slice_at]);
        assert!(header[slice_at..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_non_consecutive_run_is_rejected() {
        let mut packet = hevc_header_packet(256);
        // 把 SPS 改成普通 slice，打断 VPS/SPS/PPS 序列
        let sps_type_at = 4 + 14 + 8 + 4;
        packet[sps_type_at] = 1 << 1;
        assert!(extract_parameter_sets(&packet).is_none());
    }

    #[test]
    fn test_find_header_skips_other_pids_and_garbage() {
        let mut data = vec![0x12, 0x34, 0x56];
        data.extend_from_slice(&hevc_header_packet(300));
        data.extend_from_slice(&hevc_header_packet(256));
        let header = find_header_packet(&data, 256).unwrap();
        assert_eq!(header[2], 0x00);
        assert!(find_header_packet(&data, 999).is_none());
    }

    #[test]
    fn test_pipeline_finds_header_from_captured_writes() {
        let mut pipeline = HeaderRecoveryPipeline::start(256, Duration::from_secs(5));
        pipeline.capture(&[0u8; 376]);
        pipeline.capture(&hevc_header_packet(256));
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.phase() != HeaderPhase::Found && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pipeline.phase(), HeaderPhase::Found);
        assert_eq!(pipeline.recovered_header().unwrap().len(), TS_PACKET_SIZE);
        // 找到之后不再捕获
        pipeline.capture(&[0u8; 188]);
        assert_eq!(pipeline.queued_packets(), 0);
        pipeline.shutdown();
    }

    #[test]
    fn test_pipeline_abandons_after_window() {
        let pipeline = HeaderRecoveryPipeline::start(256, Duration::from_millis(20));
        pipeline.capture(&[0u8; 188]);
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.phase() != HeaderPhase::Abandoned && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pipeline.phase(), HeaderPhase::Abandoned);
        assert!(pipeline.recovered_header().is_none());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let mut pipeline = HeaderRecoveryPipeline::with_header(256, vec![0x47; 188]);
        assert_eq!(pipeline.phase(), HeaderPhase::Found);
        pipeline.shutdown();
        assert_eq!(pipeline.phase(), HeaderPhase::Found);
        assert_eq!(pipeline.queued_packets(), 0);
    }
}
