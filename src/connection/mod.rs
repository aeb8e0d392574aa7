//! 连接管理与数据转发核心模块
//! 基准站接入、流动站分发与挂载点注册

pub mod buffer;
pub mod capture;
pub mod download;
pub mod manager;
pub mod upload;

use tokio::io::{AsyncRead, AsyncWrite};

// 重新导出常用类型
pub use buffer::{BroadcastReport, FrameBuffer, RoverSet};
pub use capture::RawCapture;
pub use download::RoverSession;
pub use manager::{StationRegistry, StationSummary};
pub use upload::{BaseStation, StationStatus, TelemetryUpdate};

/// 会话使用的双向字节流（TcpStream、测试用 DuplexStream 等）
pub trait CasterStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> CasterStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 类型擦除后的连接流
pub type BoxedStream = Box<dyn CasterStream>;
