//! 错误处理模块
//! 定义统一错误类型与转换机制

use std::io::Error as IoError;
use thiserror::Error;

/// 全局错误类型
#[derive(Debug, Error)]
pub enum CasterError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    /// 服务器错误
    #[error("服务器错误: {0}")]
    Server(#[from] ServerError),

    /// 协议解析错误
    #[error("协议解析错误: {0}")]
    Parse(#[from] ParseError),

    /// 流动站错误
    #[error("流动站错误: {0}")]
    Rover(#[from] RoverError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] IoError),
}

/// 服务器错误
#[derive(Debug, Error)]
pub enum ServerError {
    /// 绑定端口失败
    #[error("绑定端口失败: {0}")]
    BindError(String),

    /// 内部错误
    #[error("服务器内部错误: {0}")]
    InternalError(String),
}

/// 解析错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// NTRIP协议解析错误
    #[error("NTRIP协议解析错误: {0}")]
    NtripProtocolError(String),

    /// 请求头过长
    #[error("请求头超过 {0} 字节")]
    HeaderTooLong(usize),

    /// 请求头读取超时
    #[error("请求头读取超时")]
    HeaderTimeout,

    /// 请求头结束前连接关闭
    #[error("请求头结束前连接已关闭")]
    ConnectionClosed,

    /// CRC校验失败
    #[error("RTCM CRC校验失败: 传输值 {transmitted:06X}, 计算值 {computed:06X}")]
    CrcMismatch { transmitted: u32, computed: u32 },

    /// 载荷长度不足
    #[error("RTCM {message_number} 载荷不足: 需要 {needed} 字节, 实际 {actual} 字节")]
    PayloadTooShort {
        message_number: u16,
        needed: usize,
        actual: usize,
    },

    /// 不支持的消息类型
    #[error("不支持的RTCM消息类型: {0}")]
    UnsupportedMessage(u16),
}

/// 流动站发送错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoverError {
    /// 连接已关闭
    #[error("流动站连接已关闭")]
    Closed,

    /// 发送队列已满（慢速消费者被断开）
    #[error("流动站发送队列已满")]
    QueueFull,
}

/// 简化错误类型定义
pub type Result<T> = std::result::Result<T, CasterError>;
