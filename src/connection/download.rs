//! 下载端（流动站）连接处理逻辑
//! 每个流动站有独立的有界发送队列与写任务，基准站读循环只做非阻塞入队

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::CasterStream;
use crate::common::error::RoverError;
use crate::config::RoverConfig;

/// 流动站状态
#[derive(Debug, Clone, Serialize)]
pub struct RoverStatus {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 最后一条上行语句
    pub last_line: Option<String>,
}

/// 流动站会话
#[derive(Debug)]
pub struct RoverSession {
    /// 连接 ID
    id: Uuid,
    /// 挂载点名称
    mount_name: String,
    /// 客户端地址
    peer_addr: SocketAddr,
    /// 是否打开
    open: AtomicBool,
    /// 发送队列
    tx: mpsc::Sender<Bytes>,
    /// 关闭通知
    closed: watch::Sender<bool>,
    /// 已发送字节数
    bytes_sent: AtomicU64,
    /// 已接收字节数
    bytes_received: AtomicU64,
    /// 最后一条上行语句（通常为 GGA）
    last_line: Mutex<Option<String>>,
}

impl RoverSession {
    /// 创建流动站会话并启动写任务与上行读取任务
    pub fn spawn<S>(
        mount_name: impl Into<String>,
        peer_addr: SocketAddr,
        stream: S,
        config: &RoverConfig,
    ) -> Arc<Self>
    where
        S: CasterStream,
    {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            mount_name: mount_name.into(),
            peer_addr,
            open: AtomicBool::new(true),
            tx,
            closed,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_line: Mutex::new(None),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(Arc::clone(&session).write_loop(writer, rx));
        tokio::spawn(Arc::clone(&session).drain_loop(reader));

        tracing::info!("Rover {} attached to {} ({})", peer_addr, session.mount_name, session.id);
        session
    }

    /// 将数据放入发送队列
    ///
    /// 不阻塞。会话已关闭返回 `Closed`；队列满视为慢速消费者，
    /// 会话被关闭并返回 `QueueFull`。
    pub fn send(&self, data: Bytes) -> Result<(), RoverError> {
        if !self.is_open() {
            return Err(RoverError::Closed);
        }
        match self.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Rover {} on {} is too slow, disconnecting", self.peer_addr, self.mount_name);
                self.close();
                Err(RoverError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(RoverError::Closed)
            }
        }
    }

    /// 关闭会话，可重复调用
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.send_replace(true);
            tracing::info!("Rover {} on {} disconnected", self.peer_addr, self.mount_name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mount_name(&self) -> &str {
        &self.mount_name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_line(&self) -> Option<String> {
        self.last_line.lock().clone()
    }

    pub fn status(&self) -> RoverStatus {
        RoverStatus {
            id: self.id,
            peer_addr: self.peer_addr,
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            last_line: self.last_line(),
        }
    }

    async fn write_loop<W>(self: Arc<Self>, mut writer: W, mut rx: mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        let mut closed = self.closed.subscribe();
        while self.is_open() {
            let data = tokio::select! {
                _ = closed.changed() => break,
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            if let Err(e) = writer.write_all(&data).await {
                tracing::warn!("Failed to send data to rover {}: {}", self.peer_addr, e);
                break;
            }
            self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        self.close();
        let _ = writer.shutdown().await;
    }

    /// 读取流动站上行数据（GGA 等），仅记录
    ///
    /// 按字节处理，非 UTF-8 数据不会导致断开。
    async fn drain_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut closed = self.closed.subscribe();
        let mut chunk = BytesMut::with_capacity(READ_CHUNK_LEN);
        let mut line = InboundLine::default();
        while self.is_open() {
            chunk.clear();
            chunk.reserve(READ_CHUNK_LEN);
            let read = tokio::select! {
                _ = closed.changed() => break,
                read = reader.read_buf(&mut chunk) => read,
            };
            match read {
                Ok(0) => {
                    tracing::debug!("Rover {} closed its connection", self.peer_addr);
                    break;
                }
                Ok(n) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    line.feed(&chunk, |raw, truncated| self.record_line(raw, truncated));
                }
                Err(e) => {
                    tracing::debug!("Rover {} read error: {}", self.peer_addr, e);
                    break;
                }
            }
        }
        self.close();
    }

    fn record_line(&self, raw: &[u8], truncated: bool) {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        if truncated {
            tracing::debug!("Rover {} sent a line longer than {} bytes, truncated", self.peer_addr, MAX_LINE_LEN);
        }
        tracing::debug!("Received from rover {}: {}", self.peer_addr, trimmed);
        *self.last_line.lock() = Some(trimmed.to_string());
    }
}

/// 单次读取大小
const READ_CHUNK_LEN: usize = 1024;
/// 保留的上行行最大长度，超出部分丢弃
const MAX_LINE_LEN: usize = 1024;

/// 上行行缓冲，长度受 `MAX_LINE_LEN` 限制
#[derive(Debug, Default)]
struct InboundLine {
    buf: Vec<u8>,
    truncated: bool,
}

impl InboundLine {
    /// 追加数据，每遇到一个换行回调一次完整行
    fn feed<F>(&mut self, data: &[u8], mut on_line: F)
    where
        F: FnMut(&[u8], bool),
    {
        for segment in data.split_inclusive(|&b| b == b'\n') {
            let (body, complete) = match segment.split_last() {
                Some((&b'\n', body)) => (body, true),
                _ => (segment, false),
            };
            let room = MAX_LINE_LEN - self.buf.len();
            if body.len() > room {
                self.truncated = true;
            }
            self.buf.extend_from_slice(&body[..body.len().min(room)]);
            if complete {
                on_line(&self.buf, self.truncated);
                self.buf.clear();
                self.truncated = false;
            }
        }
    }

    fn pending(&self) -> usize {
        self.buf.len()
    }
}
