//! 上传端（基准站）连接处理逻辑
//! 读取基准站数据流，扫描 RTCM 帧，记录原始数据并转发给流动站

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use uuid::Uuid;

use super::buffer::{BroadcastReport, FrameBuffer, RoverSet};
use super::capture::RawCapture;
use super::download::{RoverSession, RoverStatus};
use super::{BoxedStream, CasterStream};
use crate::common::error::RoverError;
use crate::common::rtcm::{AntennaPosition, RtcmFrame, RtcmMessage};
use crate::common::stats::CasterStats;
use crate::config::StationConfig;

/// 基准站状态上报（电量、温度、GSV 快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryUpdate {
    /// 挂载点名称
    pub station_id: String,
    /// 上报时间戳
    #[serde(default)]
    pub timestamp: i64,
    /// 电量
    #[serde(default)]
    pub battery: i32,
    /// 温度
    #[serde(default)]
    pub temperature: i32,
    /// 最近的 GSV 语句
    #[serde(default)]
    pub gsv_sentences: String,
}

/// 基准站状态
#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub mountpoint: String,
    pub live: bool,
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub bytes_broadcast: u64,
    pub valid_frames: u64,
    pub invalid_frames: u64,
    /// 各消息类型计数
    pub message_counts: BTreeMap<u16, u64>,
    pub rovers: Vec<RoverStatus>,
    /// 最近解码的天线参考点
    pub position: Option<AntennaPosition>,
    /// 最近一次状态上报
    pub telemetry: Option<TelemetryUpdate>,
}

/// 帧统计与状态上报
#[derive(Debug, Default)]
struct Telemetry {
    position: Option<AntennaPosition>,
    valid_frames: u64,
    invalid_frames: u64,
    message_counts: BTreeMap<u16, u64>,
    updates: VecDeque<TelemetryUpdate>,
    stopped_at: Option<Instant>,
}

/// 基准站会话
pub struct BaseStation {
    /// 会话 ID
    id: Uuid,
    /// 挂载点名称
    mount_name: String,
    /// 客户端地址
    peer_addr: SocketAddr,
    /// 接入时间
    connected_at: DateTime<Utc>,
    /// 配置参数
    config: StationConfig,
    /// 全局统计
    stats: Arc<CasterStats>,
    /// 运行标志
    running: AtomicBool,
    /// 停止通知
    shutdown: watch::Sender<bool>,
    /// 启动前持有的连接流，启动后交给读取任务
    stream: Mutex<Option<BoxedStream>>,
    /// 已接入的流动站
    rovers: RoverSet,
    /// 跨读取的帧缓冲区
    frames: Mutex<FrameBuffer>,
    /// 已接收字节数
    bytes_received: AtomicU64,
    /// 已转发字节数（按流动站累计）
    bytes_broadcast: AtomicU64,
    telemetry: Mutex<Telemetry>,
}

impl std::fmt::Debug for BaseStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseStation")
            .field("id", &self.id)
            .field("mount_name", &self.mount_name)
            .field("peer_addr", &self.peer_addr)
            .field("running", &self.is_running())
            .field("rovers", &self.rovers.len())
            .finish()
    }
}

/// 读取任务结束（包括 panic）时停止会话
struct StopGuard(Arc<BaseStation>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

impl BaseStation {
    /// 创建基准站会话，尚未开始读取
    pub fn new<S>(
        mount_name: impl Into<String>,
        peer_addr: SocketAddr,
        stream: S,
        config: StationConfig,
        stats: Arc<CasterStats>,
    ) -> Arc<Self>
    where
        S: CasterStream,
    {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            mount_name: mount_name.into(),
            peer_addr,
            connected_at: Utc::now(),
            config,
            stats,
            running: AtomicBool::new(true),
            shutdown,
            stream: Mutex::new(Some(Box::new(stream))),
            rovers: RoverSet::new(),
            frames: Mutex::new(FrameBuffer::new()),
            bytes_received: AtomicU64::new(0),
            bytes_broadcast: AtomicU64::new(0),
            telemetry: Mutex::new(Telemetry::default()),
        })
    }

    /// 启动读取任务，不阻塞调用方
    pub fn start(self: &Arc<Self>) {
        let Some(stream) = self.stream.lock().take() else {
            tracing::debug!("Station {} already started or stopped", self.mount_name);
            return;
        };
        tracing::info!("Station {} from {} started ({})", self.mount_name, self.peer_addr, self.id);
        tokio::spawn(Arc::clone(self).ingest(stream));
    }

    /// 停止会话，可重复调用
    ///
    /// 关闭并移除所有流动站，清空帧缓冲区；读取任务收到通知后关闭连接与记录文件。
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        drop(self.stream.lock().take());
        let closed = self.rovers.close_all();
        self.frames.lock().clear();
        self.telemetry.lock().stopped_at = Some(Instant::now());
        tracing::info!(
            "基准站 {} 已断开, 关闭 {} 个流动站, 接收 {} 字节, 转发 {} 字节",
            self.mount_name,
            closed,
            self.bytes_received(),
            self.bytes_broadcast()
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 停止时间超过保留期限
    pub fn is_expired(&self, retain: Duration) -> bool {
        if self.is_running() {
            return false;
        }
        self.telemetry
            .lock()
            .stopped_at
            .map_or(true, |at| at.elapsed() >= retain)
    }

    /// 接入流动站
    ///
    /// 会话已停止时关闭流动站并返回 `Closed`。
    pub fn add_rover(&self, rover: Arc<RoverSession>) -> Result<(), RoverError> {
        if !self.is_running() {
            rover.close();
            return Err(RoverError::Closed);
        }
        self.rovers.add(Arc::clone(&rover));
        // stop() 可能在加入前已清空集合
        if !self.is_running() {
            self.rovers.remove_failed(std::slice::from_ref(&rover));
            rover.close();
            return Err(RoverError::Closed);
        }
        Ok(())
    }

    /// 扫描数据块中的 RTCM 帧，返回本次完成的帧数
    pub fn observe(&self, chunk: &[u8]) -> usize {
        self.frames
            .lock()
            .extend_and_drain(chunk, |frame| self.record_frame(frame))
    }

    fn record_frame(&self, frame: &RtcmFrame<'_>) {
        let mut telemetry = self.telemetry.lock();
        if !frame.is_valid() {
            telemetry.invalid_frames += 1;
            tracing::warn!(
                "CRC mismatch on {}: transmitted {:06X}, computed {:06X}, length {}",
                self.mount_name,
                frame.transmitted_crc,
                frame.computed_crc,
                frame.payload_len()
            );
            return;
        }
        telemetry.valid_frames += 1;
        if let Some(message_number) = frame.message_number() {
            *telemetry.message_counts.entry(message_number).or_default() += 1;
        }
        tracing::debug!(
            "RTCM message on {}: type={:?}, length={}",
            self.mount_name,
            frame.message_number(),
            frame.payload_len()
        );

        match frame.decode() {
            Ok(RtcmMessage::AntennaPosition(position)) => {
                if let Some(geo) = position.geodetic {
                    tracing::info!(
                        "{} station_id={}, ECEF X={:.4}m Y={:.4}m Z={:.4}m lat={:.8} lon={:.8} alt={:.3}",
                        self.mount_name,
                        position.station_id,
                        position.ecef.x,
                        position.ecef.y,
                        position.ecef.z,
                        geo.latitude,
                        geo.longitude,
                        geo.altitude
                    );
                }
                telemetry.position = Some(position);
            }
            Ok(RtcmMessage::Generic { .. }) => {}
            Err(e) => tracing::debug!("Skipping position decode on {}: {}", self.mount_name, e),
        }
    }

    /// 转发数据块给所有流动站
    pub fn broadcast(&self, chunk: &Bytes) -> BroadcastReport {
        let report = self.rovers.broadcast(chunk);
        let sent = chunk.len() as u64 * report.delivered as u64;
        self.bytes_broadcast.fetch_add(sent, Ordering::Relaxed);
        self.stats.add_tx_bytes(sent);
        report
    }

    async fn ingest(self: Arc<Self>, mut stream: BoxedStream) {
        let _guard = StopGuard(Arc::clone(&self));
        let mut shutdown = self.shutdown.subscribe();
        let mut capture = self.open_capture().await;
        let read_size = self.config.read_buffer_size.max(1);
        let mut buf = BytesMut::with_capacity(read_size);

        while self.is_running() {
            buf.reserve(read_size);
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = stream.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    tracing::info!("Upload connection from {} closed", self.peer_addr);
                    break;
                }
                Ok(n) => {
                    let chunk = buf.split().freeze();
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.stats.add_rx_bytes(n as u64);

                    if self.config.enable_rtcm_parsing {
                        self.observe(&chunk);
                    }
                    if let Some(capture) = capture.as_mut() {
                        capture.write(&chunk).await;
                    }
                    self.broadcast(&chunk);
                }
                Err(e) => {
                    tracing::warn!("Read error from station {}: {}", self.mount_name, e);
                    break;
                }
            }
        }

        if let Some(mut capture) = capture {
            capture.close().await;
        }
    }

    async fn open_capture(&self) -> Option<RawCapture> {
        let dir = self
            .config
            .capture_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())?;
        match RawCapture::open(dir, &self.mount_name).await {
            Ok(capture) => Some(capture),
            Err(e) => {
                tracing::warn!("Cannot open raw capture for {} in {}: {}", self.mount_name, dir.display(), e);
                None
            }
        }
    }

    /// 保存状态上报，超出上限时丢弃最旧的一条
    pub fn add_update(&self, update: TelemetryUpdate) {
        let limit = self.config.max_status_updates.max(1);
        let mut telemetry = self.telemetry.lock();
        while telemetry.updates.len() >= limit {
            telemetry.updates.pop_front();
        }
        telemetry.updates.push_back(update);
    }

    pub fn status(&self) -> StationStatus {
        let rovers = self.rovers.snapshot().iter().map(|r| r.status()).collect();
        let telemetry = self.telemetry.lock();
        StationStatus {
            mountpoint: self.mount_name.clone(),
            live: self.is_running(),
            id: self.id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            bytes_received: self.bytes_received(),
            bytes_broadcast: self.bytes_broadcast(),
            valid_frames: telemetry.valid_frames,
            invalid_frames: telemetry.invalid_frames,
            message_counts: telemetry.message_counts.clone(),
            rovers,
            position: telemetry.position.clone(),
            telemetry: telemetry.updates.back().cloned(),
        }
    }

    pub fn position(&self) -> Option<AntennaPosition> {
        self.telemetry.lock().position.clone()
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

    pub fn rover_count(&self) -> usize {
        self.rovers.len()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_broadcast(&self) -> u64 {
        self.bytes_broadcast.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::geo::Ecef;
    use crate::common::rtcm::{encode_frame, MSG_ANTENNA_REFERENCE};
    use crate::config::RoverConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn config() -> StationConfig {
        StationConfig {
            capture_dir: None,
            ..StationConfig::default()
        }
    }

    fn station(config: StationConfig) -> (Arc<BaseStation>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let station = BaseStation::new("M1", addr(), server, config, Arc::new(CasterStats::new()));
        (station, client)
    }

    fn attach(station: &BaseStation) -> (Arc<RoverSession>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let rover = RoverSession::spawn("M1", addr(), server, &RoverConfig { queue_depth: 16 });
        station.add_rover(Arc::clone(&rover)).unwrap();
        (rover, client)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn position_frame() -> Bytes {
        let position = AntennaPosition {
            message_number: MSG_ANTENNA_REFERENCE,
            station_id: 2003,
            itrf_year: 0,
            ecef: Ecef {
                x: 1_114_104.5999,
                y: -4_850_729.7108,
                z: 3_975_521.4643,
            },
            antenna_height: None,
            geodetic: None,
        };
        encode_frame(&position.encode_payload()).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let (station, mut base) = station(config());
        let mut clients: Vec<_> = (0..3).map(|_| attach(&station).1).collect();
        station.start();

        let chunk: Vec<u8> = (0..100u8).collect();
        base.write_all(&chunk).await.unwrap();

        for client in clients.iter_mut() {
            let mut received = vec![0u8; 100];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(received, chunk);
        }
        eventually(|| station.bytes_broadcast() == 300).await;
        assert_eq!(station.bytes_received(), 100);
    }

    #[tokio::test]
    async fn test_dead_rover_isolated() {
        let (station, mut base) = station(config());
        let (_, mut a) = attach(&station);
        let (dead, dead_client) = attach(&station);
        let (_, mut c) = attach(&station);
        station.start();

        drop(dead_client);
        eventually(|| !dead.is_open()).await;

        let chunk = vec![0xAB; 100];
        base.write_all(&chunk).await.unwrap();

        for client in [&mut a, &mut c] {
            let mut received = vec![0u8; 100];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(received, chunk);
        }
        eventually(|| station.rover_count() == 2).await;
        assert!(station.is_running());
    }

    #[tokio::test]
    async fn test_base_disconnect_closes_rovers() {
        let (station, base) = station(config());
        let (rover, mut client) = attach(&station);
        station.start();

        drop(base);
        eventually(|| !station.is_running()).await;
        assert!(!rover.is_open());
        assert_eq!(station.rover_count(), 0);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (station, _base) = station(config());
        let (rover, _client) = attach(&station);
        station.start();

        station.stop();
        station.stop();
        assert!(!station.is_running());
        assert!(!rover.is_open());

        let (late, _late_client) = tokio::io::duplex(64);
        let late = RoverSession::spawn("M1", addr(), late, &RoverConfig::default());
        assert_eq!(station.add_rover(Arc::clone(&late)), Err(RoverError::Closed));
        assert!(!late.is_open());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (station, mut base) = station(config());
        station.stop();
        station.start();
        // 连接已被释放
        let mut buf = [0u8; 1];
        assert_eq!(base.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_position_decoded_across_reads() {
        let (station, mut base) = station(config());
        station.start();

        let frame = position_frame();
        base.write_all(&frame[..10]).await.unwrap();
        eventually(|| station.bytes_received() == 10).await;
        assert!(station.position().is_none());

        base.write_all(&frame[10..]).await.unwrap();
        eventually(|| station.position().is_some()).await;

        let position = station.position().unwrap();
        assert_eq!(position.station_id, 2003);
        let geo = position.geodetic.unwrap();
        assert!((geo.latitude - 38.80475943).abs() < 1e-6);
        assert!((geo.longitude + 77.06477360).abs() < 1e-6);

        let status = station.status();
        assert_eq!(status.valid_frames, 1);
        assert_eq!(status.message_counts.get(&1005), Some(&1));
    }

    #[test]
    fn test_invalid_frame_counted() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let station = BaseStation::new("M1", addr(), server, config(), Arc::new(CasterStats::new()));

        let mut frame = position_frame().to_vec();
        frame[5] ^= 0x01;
        assert_eq!(station.observe(&frame), 1);
        assert_eq!(station.observe(&position_frame()), 1);

        let status = station.status();
        assert_eq!(status.invalid_frames, 1);
        assert_eq!(status.valid_frames, 1);
        assert!(status.position.is_some());
    }

    #[tokio::test]
    async fn test_raw_capture_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = StationConfig {
            capture_dir: Some(dir.path().to_path_buf()),
            ..StationConfig::default()
        };
        let (station, mut base) = station(config);
        let (_, mut client) = attach(&station);
        station.start();

        base.write_all(b"raw-bytes").await.unwrap();
        let mut received = [0u8; 9];
        client.read_exact(&mut received).await.unwrap();

        let content = std::fs::read(dir.path().join("rtcm-M1.log")).unwrap();
        assert_eq!(content, b"raw-bytes");
    }

    #[test]
    fn test_updates_are_bounded() {
        let (_client, server) = tokio::io::duplex(64);
        let config = StationConfig {
            max_status_updates: 2,
            ..config()
        };
        let station = BaseStation::new("M1", addr(), server, config, Arc::new(CasterStats::new()));

        for battery in 1..=3 {
            station.add_update(TelemetryUpdate {
                station_id: "M1".to_string(),
                timestamp: battery as i64,
                battery,
                temperature: 20,
                gsv_sentences: String::new(),
            });
        }
        assert_eq!(station.status().telemetry.map(|u| u.battery), Some(3));
        assert_eq!(station.telemetry.lock().updates.len(), 2);
    }

    #[test]
    fn test_telemetry_update_json() {
        let json = r#"{"stationId":"M1","timestamp":1700000000,"battery":80,"temperature":31,"gsvSentences":"$GPGSV"}"#;
        let update: TelemetryUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.station_id, "M1");
        assert_eq!(update.battery, 80);
        assert_eq!(update.gsv_sentences, "$GPGSV");
    }
}
