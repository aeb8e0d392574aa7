//! 管理API模块
//! 提供HTTP接口用于挂载点监控与基准站状态上报

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    routing::{get, post},
    Json, Router, Server,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::common::error::{CasterError, ServerError};
use crate::common::stats::{CasterStats, StatsSnapshot};
use crate::connection::{StationRegistry, StationStatus, StationSummary, TelemetryUpdate};

/// 服务健康状态
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// 服务状态
    pub status: &'static str,
    /// 版本信息
    pub version: &'static str,
    /// 运行时间(秒)
    pub uptime: u64,
    /// 全局统计
    pub stats: StatsSnapshot,
}

/// API共享状态
#[derive(Debug, Clone)]
pub struct ApiState {
    /// 挂载点注册表
    registry: Arc<StationRegistry>,
    /// 统计管理器
    stats: Arc<CasterStats>,
    /// 启动时间
    start_time: Instant,
}

impl ApiState {
    pub fn new(registry: Arc<StationRegistry>, stats: Arc<CasterStats>, start_time: Instant) -> Self {
        Self {
            registry,
            stats,
            start_time,
        }
    }
}

type CorsHeaders = [(HeaderName, &'static str); 1];

/// 获取挂载点列表
pub async fn list_stations(State(state): State<ApiState>) -> (CorsHeaders, Json<Vec<StationSummary>>) {
    let stations = state.registry.list().await;
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(stations))
}

/// 获取单个挂载点详情
pub async fn station_detail(
    State(state): State<ApiState>,
    Path(mountpoint): Path<String>,
) -> Result<(CorsHeaders, Json<StationStatus>), StatusCode> {
    let station = state.registry.lookup(&mountpoint).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(station.status())))
}

/// 接收基准站状态上报
pub async fn post_status(State(state): State<ApiState>, Json(update): Json<TelemetryUpdate>) -> StatusCode {
    info!("status update from {}", update.station_id);
    match state.registry.lookup(&update.station_id).await {
        Some(station) => {
            station.add_update(update);
            StatusCode::ACCEPTED
        }
        None => {
            warn!("Status update for unknown station {}", update.station_id);
            StatusCode::NOT_FOUND
        }
    }
}

/// 获取服务状态
pub async fn get_health(State(state): State<ApiState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.start_time.elapsed().as_secs(),
        stats: state.stats.snapshot(),
    })
}

/// 创建API路由
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/stations", get(list_stations))
        .route("/stations/:mountpoint", get(station_detail))
        .route("/status", post(post_status))
        .route("/health", get(get_health))
        .with_state(state)
}

/// 启动API服务器
pub async fn start_api_server(bind_addr: SocketAddr, state: ApiState) -> Result<(), CasterError> {
    let router = create_router(state);

    info!("Starting API server on {}", bind_addr);

    Server::try_bind(&bind_addr)
        .map_err(|e| ServerError::BindError(format!("无法绑定地址 {}: {}", bind_addr, e)))?
        .serve(router.into_make_service())
        .await
        .map_err(|e| ServerError::InternalError(format!("API server failed: {}", e)))?;

    Ok(())
}
