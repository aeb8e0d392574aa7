//! 挂载点注册表，负责基准站会话的发布、查找与过期清理

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::upload::{BaseStation, StationStatus};
use crate::common::ntrip::SourceTableEntry;

/// 挂载点概要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationSummary {
    pub mountpoint: String,
    pub live: bool,
}

/// 挂载点注册表
///
/// 每个挂载点最多一个活动会话；已停止的会话保留到过期后由 `reap` 清理。
#[derive(Debug, Default)]
pub struct StationRegistry {
    /// 挂载点名称 -> 基准站会话
    stations: RwLock<HashMap<String, Arc<BaseStation>>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布会话，返回被替换的旧会话
    ///
    /// 替换在写锁内完成，并发查找只会看到旧会话或新会话。调用方负责停止旧会话。
    pub async fn publish(&self, station: Arc<BaseStation>) -> Option<Arc<BaseStation>> {
        let mount_name = station.mount_name().to_string();
        let previous = self.stations.write().await.insert(mount_name, station);
        if let Some(previous) = &previous {
            tracing::info!(
                "挂载点 {} 被新连接替换, 旧会话 {} ({})",
                previous.mount_name(),
                previous.id(),
                previous.peer_addr()
            );
        }
        previous
    }

    pub async fn lookup(&self, mount_name: &str) -> Option<Arc<BaseStation>> {
        self.stations.read().await.get(mount_name).cloned()
    }

    /// 所有挂载点及其运行状态，按名称排序
    pub async fn list(&self) -> Vec<StationSummary> {
        let mut list: Vec<_> = self
            .stations
            .read()
            .await
            .iter()
            .map(|(name, station)| StationSummary {
                mountpoint: name.clone(),
                live: station.is_running(),
            })
            .collect();
        list.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
        list
    }

    pub async fn statuses(&self) -> Vec<StationStatus> {
        let mut statuses: Vec<_> = self
            .stations
            .read()
            .await
            .values()
            .map(|station| station.status())
            .collect();
        statuses.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
        statuses
    }

    /// 源列表条目，仅包含运行中的基准站
    pub async fn source_table(&self) -> Vec<SourceTableEntry> {
        let mut entries: Vec<_> = self
            .stations
            .read()
            .await
            .values()
            .filter(|station| station.is_running())
            .map(|station| {
                let geodetic = station.position().and_then(|p| p.geodetic);
                SourceTableEntry {
                    mount_name: station.mount_name().to_string(),
                    latitude: geodetic.map_or(0.0, |g| g.latitude),
                    longitude: geodetic.map_or(0.0, |g| g.longitude),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.mount_name.cmp(&b.mount_name));
        entries
    }

    /// 移除停止超过 `retain` 的会话，返回被移除的挂载点
    pub async fn reap(&self, retain: Duration) -> Vec<String> {
        let mut stations = self.stations.write().await;
        let expired: Vec<String> = stations
            .iter()
            .filter(|(_, station)| station.is_expired(retain))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            stations.remove(name);
            tracing::info!("挂载点 {} 已过期, 从注册表移除", name);
        }
        expired
    }

    /// 停止所有会话
    pub async fn stop_all(&self) {
        for station in self.stations.read().await.values() {
            station.stop();
        }
    }

    pub async fn len(&self) -> usize {
        self.stations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::stats::CasterStats;
    use crate::config::StationConfig;

    fn station(name: &str) -> Arc<BaseStation> {
        let (_client, server) = tokio::io::duplex(64);
        let config = StationConfig {
            capture_dir: None,
            ..StationConfig::default()
        };
        BaseStation::new(name, "127.0.0.1:0".parse().unwrap(), server, config, Arc::new(CasterStats::new()))
    }

    #[tokio::test]
    async fn test_publish_and_lookup() {
        let registry = StationRegistry::new();
        assert!(registry.lookup("M1").await.is_none());

        let first = station("M1");
        assert!(registry.publish(Arc::clone(&first)).await.is_none());
        let found = registry.lookup("M1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[tokio::test]
    async fn test_publish_returns_previous() {
        let registry = StationRegistry::new();
        let first = station("M1");
        let second = station("M1");
        registry.publish(Arc::clone(&first)).await;

        let previous = registry.publish(Arc::clone(&second)).await.unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&registry.lookup("M1").await.unwrap(), &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_reports_live_state() {
        let registry = StationRegistry::new();
        let a = station("B");
        let b = station("A");
        registry.publish(Arc::clone(&a)).await;
        registry.publish(Arc::clone(&b)).await;
        a.stop();

        assert_eq!(
            registry.list().await,
            vec![
                StationSummary { mountpoint: "A".into(), live: true },
                StationSummary { mountpoint: "B".into(), live: false },
            ]
        );
        let table = registry.source_table().await;
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].mount_name, "A");
    }

    #[tokio::test]
    async fn test_reap_removes_only_expired() {
        let registry = StationRegistry::new();
        let stopped = station("OLD");
        let running = station("LIVE");
        registry.publish(Arc::clone(&stopped)).await;
        registry.publish(Arc::clone(&running)).await;
        stopped.stop();

        assert!(registry.reap(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(registry.reap(Duration::ZERO).await, vec!["OLD".to_string()]);
        assert!(registry.lookup("OLD").await.is_none());
        assert!(registry.lookup("LIVE").await.is_some());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let registry = StationRegistry::new();
        let a = station("A");
        registry.publish(Arc::clone(&a)).await;
        registry.stop_all().await;
        assert!(!a.is_running());
        assert!(!registry.is_empty().await);
    }
}
