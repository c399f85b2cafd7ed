use crate::core::log_ctx;
use log::{debug, info};
use parking_lot::Mutex;

/// 影子环形缓冲 - 镜像最近写入的 H.264 数据，用于 4K 在线升级后回放
///
/// 尽力而为：一旦某次追加会溢出，缓冲永久失效直到会话结束
pub struct ShadowRingBuffer {
    inner: Mutex<RingInner>,
}

struct RingInner {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    valid: usize,
    enabled: bool,
}

impl RingInner {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.valid = 0;
        self.read_pos = 0;
        self.write_pos = 0;
        // 失效后不再需要内存
        self.buffer = Vec::new();
    }
}

impl ShadowRingBuffer {
    /// 分配 capacity 字节；capacity 为 0 时直接处于失效状态
    pub fn allocate(capacity: usize) -> Self {
        let enabled = capacity > 0;
        info!("{} 🧺 影子缓冲分配 {} 字节 (enabled={})", log_ctx(), capacity, enabled);
        Self {
            inner: Mutex::new(RingInner {
                buffer: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
                valid: 0,
                enabled,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn valid_bytes(&self) -> usize {
        self.inner.lock().valid
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// 追加已被设备接受的字节，返回是否仍处于启用状态
    pub fn append(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return false;
        }
        if inner.valid + data.len() > inner.capacity() {
            info!(
                "{} 🧺 影子缓冲将溢出 ({} + {} > {})，永久停用",
                log_ctx(),
                inner.valid,
                data.len(),
                inner.capacity()
            );
            inner.disable();
            return false;
        }
        let capacity = inner.capacity();
        let start = inner.write_pos;
        let first = data.len().min(capacity - start);
        inner.buffer[start..start + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            inner.buffer[..rest].copy_from_slice(&data[first..]);
        }
        inner.write_pos = (start + data.len()) % capacity;
        inner.valid += data.len();
        true
    }

    /// 复制出最多 max 字节的待回放数据（不移动读指针）
    pub fn peek_chunk(&self, max: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        if !inner.enabled || inner.valid == 0 {
            return Vec::new();
        }
        let len = max.min(inner.valid);
        let capacity = inner.capacity();
        let start = inner.read_pos;
        let first = len.min(capacity - start);
        let mut chunk = Vec::with_capacity(len);
        chunk.extend_from_slice(&inner.buffer[start..start + first]);
        if len > first {
            chunk.extend_from_slice(&inner.buffer[..len - first]);
        }
        chunk
    }

    /// 标记 n 字节已回放
    pub fn consume(&self, n: usize) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        let n = n.min(inner.valid);
        let capacity = inner.capacity();
        inner.read_pos = (inner.read_pos + n) % capacity;
        inner.valid -= n;
        debug!("{} 🧺 影子缓冲回放 {} 字节，剩余 {}", log_ctx(), n, inner.valid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay_in_order() {
        let ring = ShadowRingBuffer::allocate(64);
        assert!(ring.append(&[1, 2, 3, 4]));
        assert!(ring.append(&[5, 6]));
        assert_eq!(ring.valid_bytes(), 6);
        assert_eq!(ring.peek_chunk(4), vec![1, 2, 3, 4]);
        ring.consume(4);
        assert_eq!(ring.peek_chunk(100), vec![5, 6]);
        ring.consume(2);
        assert_eq!(ring.valid_bytes(), 0);
        assert!(ring.peek_chunk(10).is_empty());
    }

    #[test]
    fn test_overflow_disables_permanently() {
        let ring = ShadowRingBuffer::allocate(8);
        assert!(ring.append(&[0u8; 6]));
        assert!(!ring.append(&[0u8; 3]));
        assert!(!ring.is_enabled());
        assert_eq!(ring.valid_bytes(), 0);
        // 之后即使空间足够也不再接收
        assert!(!ring.append(&[0u8; 1]));
        assert!(ring.peek_chunk(8).is_empty());
    }

    #[test]
    fn test_wraps_around_capacity() {
        let ring = ShadowRingBuffer::allocate(8);
        assert!(ring.append(&[1, 2, 3, 4, 5, 6]));
        ring.consume(5);
        assert!(ring.append(&[7, 8, 9, 10, 11]));
        assert_eq!(ring.valid_bytes(), 6);
        assert_eq!(ring.peek_chunk(8), vec![6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_zero_capacity_is_disabled() {
        let ring = ShadowRingBuffer::allocate(0);
        assert!(!ring.is_enabled());
        assert!(!ring.append(&[1]));
    }
}
