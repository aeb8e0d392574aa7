//! NTRIP Caster 核心库
//! RTCM3 差分数据转发服务：基准站接入、帧扫描、天线位置解码与流动站分发

pub mod api;
pub mod common;
pub mod config;
pub mod connection;
pub mod server;

use tracing_subscriber::EnvFilter;

pub use common::error::{CasterError, Result};
pub use config::CasterConfig;
pub use server::{Dispatcher, NtripServer};

/// 初始化日志
///
/// `RUST_LOG` 优先，未设置时使用配置中的日志级别。可重复调用。
pub fn init_tracing(config: &config::LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// 启动服务器直到收到 Ctrl-C
pub async fn start_server(config: CasterConfig) -> Result<()> {
    let server = NtripServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到退出信号");
        }
    }
    server.shutdown().await;
    Ok(())
}
