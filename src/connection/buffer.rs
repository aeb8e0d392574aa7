//! 缓冲区管理
//! 跨读取的帧累积缓冲区，以及写时复制的流动站集合

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;

use super::download::RoverSession;
use crate::common::rtcm::{FrameScanner, RtcmFrame};

/// 帧累积缓冲区
///
/// 每次读取的数据追加到尾部，扫描出完整帧后丢弃已处理部分，
/// 不完整的尾部帧保留到下一次读取。
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加数据并处理所有完整帧，返回处理的帧数
    pub fn extend_and_drain<F>(&mut self, chunk: &[u8], mut on_frame: F) -> usize
    where
        F: FnMut(&RtcmFrame<'_>),
    {
        self.buf.extend_from_slice(chunk);

        let mut scanner = FrameScanner::new(&self.buf);
        let mut count = 0;
        for frame in scanner.by_ref() {
            on_frame(&frame);
            count += 1;
        }
        let consumed = scanner.consumed();
        self.buf.advance(consumed);
        count
    }

    /// 保留的未完成字节数
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// 一次广播的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// 成功入队的流动站数
    pub delivered: usize,
    /// 发送失败并被移除的流动站数
    pub removed: usize,
}

/// 流动站集合
///
/// 写时复制：增删时替换整个列表，广播遍历的是快照，
/// 并发的接入与移除不会打乱正在进行的遍历。
#[derive(Debug, Default)]
pub struct RoverSet {
    rovers: RwLock<Arc<Vec<Arc<RoverSession>>>>,
}

impl RoverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rover: Arc<RoverSession>) {
        let mut guard = self.rovers.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(rover);
        *guard = Arc::new(next);
    }

    /// 移除指定流动站，返回实际移除的数量
    pub fn remove_failed(&self, failed: &[Arc<RoverSession>]) -> usize {
        if failed.is_empty() {
            return 0;
        }
        let mut guard = self.rovers.write();
        let next: Vec<_> = guard
            .iter()
            .filter(|r| !failed.iter().any(|f| Arc::ptr_eq(f, r)))
            .cloned()
            .collect();
        let removed = guard.len() - next.len();
        *guard = Arc::new(next);
        removed
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<Vec<Arc<RoverSession>>> {
        self.rovers.read().clone()
    }

    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&Arc<RoverSession>),
    {
        self.snapshot().iter().for_each(f);
    }

    /// 向所有流动站发送数据，失败者被关闭并移除
    pub fn broadcast(&self, data: &Bytes) -> BroadcastReport {
        let mut failed = Vec::new();
        let mut delivered = 0;
        self.for_each(|rover| match rover.send(data.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!("Dropping rover {} from {}: {}", rover.peer_addr(), rover.mount_name(), e);
                rover.close();
                failed.push(Arc::clone(rover));
            }
        });
        let removed = self.remove_failed(&failed);
        BroadcastReport { delivered, removed }
    }

    /// 关闭并移除所有流动站，返回关闭的数量
    pub fn close_all(&self) -> usize {
        let rovers = std::mem::take(&mut *self.rovers.write());
        rovers.iter().for_each(|r| r.close());
        rovers.len()
    }

    pub fn len(&self) -> usize {
        self.rovers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rtcm::encode_frame;
    use crate::config::RoverConfig;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn rover(name: &str) -> (Arc<RoverSession>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let config = RoverConfig { queue_depth: 8 };
        let session = RoverSession::spawn(name, "127.0.0.1:0".parse().unwrap(), server, &config);
        (session, client)
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = encode_frame(&[0x3E, 0xD0, 0x01, 0x02, 0x03, 0x04]).unwrap();
        let mut buffer = FrameBuffer::new();
        let mut seen = Vec::new();

        let n = buffer.extend_and_drain(&frame[..5], |f| seen.push(f.message_number()));
        assert_eq!(n, 0);
        assert_eq!(buffer.len(), 5);

        let n = buffer.extend_and_drain(&frame[5..], |f| seen.push(f.message_number()));
        assert_eq!(n, 1);
        assert!(buffer.is_empty());
        assert_eq!(seen, vec![Some(1005)]);
    }

    #[test]
    fn test_frame_buffer_discards_garbage_and_clears() {
        let frame = encode_frame(&[0x44, 0x50, 0x00]).unwrap();
        let mut buffer = FrameBuffer::new();
        let mut data = vec![0x11, 0x22, 0x33];
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame[..4]);

        assert_eq!(buffer.extend_and_drain(&data, |_| {}), 1);
        assert_eq!(buffer.len(), 4);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_rover_set_broadcast_and_remove() {
        let set = RoverSet::new();
        let (a, mut a_client) = rover("M1");
        let (b, _b_client) = rover("M1");
        set.add(a.clone());
        set.add(b.clone());
        assert_eq!(set.len(), 2);

        b.close();
        let report = set.broadcast(&Bytes::from_static(b"hello"));
        assert_eq!(report, BroadcastReport { delivered: 1, removed: 1 });
        assert_eq!(set.len(), 1);
        assert!(Arc::ptr_eq(&set.snapshot()[0], &a));

        let mut buf = [0u8; 5];
        a_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_during_mutation() {
        let set = RoverSet::new();
        let (a, _a_client) = rover("M1");
        set.add(a.clone());
        let snapshot = set.snapshot();

        let (b, _b_client) = rover("M1");
        set.add(b);
        set.remove_failed(&[a]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let set = RoverSet::new();
        let (a, _a_client) = rover("M1");
        let (b, _b_client) = rover("M1");
        set.add(a.clone());
        set.add(b.clone());

        assert_eq!(set.close_all(), 2);
        assert!(set.is_empty());
        assert!(!a.is_open() && !b.is_open());
    }
}
