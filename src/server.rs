//! NTRIP Caster 服务器模块
//! 实现核心服务启动、连接分发与过期挂载点清理

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{start_api_server, ApiState};
use crate::common::error::{CasterError, ParseError, ServerError};
use crate::common::ntrip::{build_source_table, read_request_head, NtripRequest, ICY_NOT_FOUND, ICY_OK};
use crate::common::stats::CasterStats;
use crate::config::{CasterConfig, DispatcherConfig, RoverConfig, StationConfig};
use crate::connection::{BaseStation, CasterStream, RoverSession, StationRegistry};

/// 连接分发器
///
/// 读取请求头并按请求类型交给注册表、基准站会话或流动站会话，不跨连接保存状态。
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<StationRegistry>,
    stats: Arc<CasterStats>,
    config: DispatcherConfig,
    station: StationConfig,
    rover: RoverConfig,
}

impl Dispatcher {
    pub fn new(config: &CasterConfig, registry: Arc<StationRegistry>, stats: Arc<CasterStats>) -> Self {
        Self {
            registry,
            stats,
            config: config.dispatcher.clone(),
            station: config.station.clone(),
            rover: config.rover.clone(),
        }
    }

    /// 处理一个已接受的连接
    ///
    /// 协议错误返回 `Err`，连接随流的释放而关闭。
    pub async fn dispatch<S>(&self, mut stream: S, addr: SocketAddr) -> Result<(), CasterError>
    where
        S: CasterStream,
    {
        self.stats.connection_accepted();

        let head = tokio::time::timeout(
            self.config.header_timeout(),
            read_request_head(&mut stream, self.config.max_header_bytes),
        )
        .await
        .unwrap_or(Err(ParseError::HeaderTimeout));
        let request = match head.and_then(|head| head.classify()) {
            Ok(request) => request,
            Err(e) => {
                self.stats.rejected();
                return Err(e.into());
            }
        };

        match request {
            NtripRequest::Source { mount_name } => self.publish(stream, addr, mount_name).await,
            NtripRequest::Download { mount_name } => self.subscribe(stream, addr, mount_name).await,
            NtripRequest::SourceTable => self.source_table(stream, addr).await,
            NtripRequest::Unknown(line) => {
                self.stats.rejected();
                debug!("Closing {} after unsupported request: {}", addr, line);
                Ok(())
            }
        }
    }

    async fn publish<S>(&self, mut stream: S, addr: SocketAddr, mount_name: String) -> Result<(), CasterError>
    where
        S: CasterStream,
    {
        if self.station.source_ack {
            stream.write_all(ICY_OK).await?;
        }

        let station = BaseStation::new(
            mount_name.as_str(),
            addr,
            stream,
            self.station.clone(),
            Arc::clone(&self.stats),
        );
        if let Some(previous) = self.registry.publish(Arc::clone(&station)).await {
            previous.stop();
        }
        station.start();
        self.stats.publisher();
        info!("基准站 {} 接入挂载点 {}", addr, mount_name);
        Ok(())
    }

    async fn subscribe<S>(&self, mut stream: S, addr: SocketAddr, mount_name: String) -> Result<(), CasterError>
    where
        S: CasterStream,
    {
        let station = match self.registry.lookup(&mount_name).await {
            Some(station) if station.is_running() => station,
            _ => {
                self.stats.not_found();
                info!("Rover {} requested unknown mountpoint {}", addr, mount_name);
                stream.write_all(ICY_NOT_FOUND).await?;
                stream.shutdown().await?;
                return Ok(());
            }
        };

        stream.write_all(ICY_OK).await?;
        let rover = RoverSession::spawn(mount_name.as_str(), addr, stream, &self.rover);
        match station.add_rover(rover) {
            Ok(()) => self.stats.subscriber(),
            Err(e) => warn!("Rover {} could not attach to {}: {}", addr, mount_name, e),
        }
        Ok(())
    }

    async fn source_table<S>(&self, mut stream: S, addr: SocketAddr) -> Result<(), CasterError>
    where
        S: CasterStream,
    {
        let response = build_source_table(&self.registry.source_table().await);
        stream.write_all(&response).await?;
        stream.shutdown().await?;
        self.stats.sourcetable_request();
        debug!("Sent source table to {}", addr);
        Ok(())
    }
}

/// NTRIP服务器
#[derive(Debug)]
pub struct NtripServer {
    config: CasterConfig,
    registry: Arc<StationRegistry>,
    stats: Arc<CasterStats>,
    start_time: Instant,
    shutdown: watch::Sender<bool>,
}

impl NtripServer {
    /// 创建新服务器实例
    pub fn new(config: CasterConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(StationRegistry::new()),
            stats: Arc::new(CasterStats::new()),
            start_time: Instant::now(),
            shutdown,
        }
    }

    pub fn registry(&self) -> Arc<StationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<CasterStats> {
        Arc::clone(&self.stats)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(&self.config, self.registry(), self.stats())
    }

    /// 启动服务器：绑定端口、启动状态接口与清理任务，然后进入接受循环
    pub async fn run(&self) -> Result<(), CasterError> {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::BindError(format!("无法绑定地址 {}: {}", bind_addr, e)))?;
        info!("NTRIP Caster 服务器已启动，监听地址: {}", bind_addr);

        if self.config.api.enabled {
            let api_addr = self.config.api.bind_addr;
            let state = ApiState::new(self.registry(), self.stats(), self.start_time);
            tokio::spawn(async move {
                if let Err(e) = start_api_server(api_addr, state).await {
                    error!("API server exited with error: {}", e);
                }
            });
        }

        self.spawn_reaper();
        self.serve(listener).await
    }

    /// 在已绑定的监听器上接受连接，直到 `shutdown`
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CasterError> {
        let dispatcher = Arc::new(self.dispatcher());
        let mut shutdown = self.shutdown.subscribe();

        while !*shutdown.borrow() {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("新连接来自: {}", addr);
                    let _ = stream.set_nodelay(true);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.dispatch(stream, addr).await {
                            warn!("连接处理错误 {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("接受连接失败: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
            }
        }
        Ok(())
    }

    /// 定期移除停止超过保留期的挂载点
    fn spawn_reaper(&self) {
        let registry = self.registry();
        let retain = self.config.station.retain();
        let mut interval = tokio::time::interval(self.config.station.reap_interval());
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let removed = registry.reap(retain).await;
                        if !removed.is_empty() {
                            debug!("Reaped {} expired mountpoints", removed.len());
                        }
                    }
                }
            }
        });
    }

    /// 关闭服务器
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("NTRIP Caster 服务器正在关闭...");
        self.registry.stop_all().await;
        info!("所有连接已关闭");
    }
}
