//! 统计信息模块
//! 跟踪连接与流量指标

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// 已接受连接数
    pub connections_accepted: u64,
    /// 基准站（上传）连接数
    pub publishers: u64,
    /// 流动站（下载）连接数
    pub subscribers: u64,
    /// 源列表请求数
    pub sourcetable_requests: u64,
    /// 404 响应数
    pub not_found: u64,
    /// 协议错误而关闭的连接数
    pub rejected: u64,
    /// 总接收字节数
    pub rx_bytes: u64,
    /// 总转发字节数
    pub tx_bytes: u64,
}

/// 全局统计管理器
#[derive(Debug, Default)]
pub struct CasterStats {
    connections_accepted: AtomicU64,
    publishers: AtomicU64,
    subscribers: AtomicU64,
    sourcetable_requests: AtomicU64,
    not_found: AtomicU64,
    rejected: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl CasterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publisher(&self) {
        self.publishers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber(&self) {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sourcetable_request(&self) {
        self.sourcetable_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// 增加接收字节数
    pub fn add_rx_bytes(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 增加发送字节数
    pub fn add_tx_bytes(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 获取统计快照
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            publishers: self.publishers.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            sourcetable_requests: self.sourcetable_requests.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}
