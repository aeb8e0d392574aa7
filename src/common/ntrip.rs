//! NTRIP 协议解析模块
//! 请求头读取、请求分类与响应构建

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::ParseError;

/// 订阅成功响应
pub const ICY_OK: &[u8] = b"ICY 200 OK\r\n\r\n";
/// 挂载点不存在响应
pub const ICY_NOT_FOUND: &[u8] = b"ICY 404 Not Found\r\n\r\n";

/// NTRIP请求类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtripRequest {
    /// 上传请求（基准站）
    Source {
        /// 挂载点名称
        mount_name: String,
    },
    /// 下载请求（流动站）
    Download {
        /// 挂载点名称
        mount_name: String,
    },
    /// 挂载点列表请求
    SourceTable,
    /// 未知请求
    Unknown(String),
}

/// 已读取的请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// 请求行
    pub request_line: String,
    /// 头部字段（名称小写）
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// 解析原始请求头文本
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut lines = raw.lines();
        let request_line = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| ParseError::NtripProtocolError("空请求".to_string()))?
            .to_string();

        let headers = lines
            .take_while(|line| !line.trim().is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self {
            request_line,
            headers,
        })
    }

    /// 获取头部字段
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// 对请求行分类
    pub fn classify(&self) -> Result<NtripRequest, ParseError> {
        let parts: Vec<&str> = self.request_line.split_whitespace().collect();
        let method = parts
            .first()
            .ok_or_else(|| ParseError::NtripProtocolError("空请求行".to_string()))?;

        match method.to_ascii_uppercase().as_str() {
            "GET" => {
                let path = parts.get(1).copied().unwrap_or("/");
                match mount_from_path(path) {
                    Some(mount_name) => Ok(NtripRequest::Download { mount_name }),
                    None => Ok(NtripRequest::SourceTable),
                }
            }
            // NTRIP 1.0: SOURCE <password> /<mount> 或 SOURCE /<mount>
            "SOURCE" => {
                let path = parts[1..]
                    .iter()
                    .find(|p| p.starts_with('/'))
                    .or_else(|| parts.get(1))
                    .ok_or_else(|| {
                        ParseError::NtripProtocolError(format!("缺少挂载点: {}", self.request_line))
                    })?;
                let mount_name = mount_from_path(path).ok_or_else(|| {
                    ParseError::NtripProtocolError(format!("无效挂载点: {}", path))
                })?;
                Ok(NtripRequest::Source { mount_name })
            }
            // NTRIP 2.0 上传
            "POST" => {
                let path = parts.get(1).ok_or_else(|| {
                    ParseError::NtripProtocolError(format!("缺少挂载点: {}", self.request_line))
                })?;
                let mount_name = mount_from_path(path).ok_or_else(|| {
                    ParseError::NtripProtocolError(format!("无效挂载点: {}", path))
                })?;
                Ok(NtripRequest::Source { mount_name })
            }
            _ => Ok(NtripRequest::Unknown(self.request_line.clone())),
        }
    }
}

/// 从请求路径提取挂载点，根路径返回 `None`
fn mount_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or_default();
    let name = path.trim_start_matches('/').trim_end_matches('/');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// 读取请求头直到空行
///
/// 逐字节读取，不会消费空行之后的数据（上传端的 RTCM 数据紧随其后）。
pub async fn read_request_head<R>(reader: &mut R, max_len: usize) -> Result<RequestHead, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(_) => return Err(ParseError::ConnectionClosed),
        };
        buf.extend_from_slice(&[byte]);

        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            break;
        }
        if buf.len() >= max_len {
            return Err(ParseError::HeaderTooLong(max_len));
        }
    }
    RequestHead::parse(&String::from_utf8_lossy(&buf))
}

/// 源列表条目
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTableEntry {
    /// 挂载点名称
    pub mount_name: String,
    /// 纬度
    pub latitude: f64,
    /// 经度
    pub longitude: f64,
}

/// 构建源列表响应
pub fn build_source_table(entries: &[SourceTableEntry]) -> Bytes {
    let mut response = BytesMut::new();
    response.extend_from_slice(b"SOURCETABLE 200 OK\r\n");
    for entry in entries {
        response.extend_from_slice(
            format!(
                "STR;{0};{0};RTCM 3;;2;GPS;;;{1:.2};{2:.2};0;0;;none;N;N;0;\r\n",
                entry.mount_name, entry.latitude, entry.longitude
            )
            .as_bytes(),
        );
    }
    response.extend_from_slice(b"ENDSOURCETABLE\r\n\r\n");
    response.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn classify(raw: &str) -> Result<NtripRequest, ParseError> {
        RequestHead::parse(raw)?.classify()
    }

    #[test]
    fn test_parse_source_variants() {
        let expected = NtripRequest::Source {
            mount_name: "M1".to_string(),
        };
        assert_eq!(classify("SOURCE /M1 ICY/1.0\r\n\r\n").unwrap(), expected);
        assert_eq!(classify("SOURCE letmein /M1\r\nSource-Agent: NTRIP test\r\n\r\n").unwrap(), expected);
        assert_eq!(classify("SOURCE M1\r\n\r\n").unwrap(), expected);
        assert_eq!(classify("POST /M1 HTTP/1.1\r\nNtrip-Version: Ntrip/2.0\r\n\r\n").unwrap(), expected);
    }

    #[test]
    fn test_parse_download_and_sourcetable() {
        assert_eq!(
            classify("GET /BASE01 HTTP/1.1\r\nUser-Agent: NTRIP test\r\n\r\n").unwrap(),
            NtripRequest::Download {
                mount_name: "BASE01".to_string()
            }
        );
        assert_eq!(classify("GET / HTTP/1.1\r\n\r\n").unwrap(), NtripRequest::SourceTable);
        assert_eq!(classify("GET\r\n\r\n").unwrap(), NtripRequest::SourceTable);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            classify("DELETE /M1 HTTP/1.1\r\n\r\n").unwrap(),
            NtripRequest::Unknown(_)
        ));
        assert!(classify("SOURCE\r\n\r\n").is_err());
        assert!(classify("SOURCE pass /\r\n\r\n").is_err());
        assert!(RequestHead::parse("\r\n\r\n").is_err());
    }

    #[test]
    fn test_headers() {
        let head = RequestHead::parse("GET /M1 HTTP/1.1\r\nUser-Agent: NTRIP rover\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.header("user-agent"), Some("NTRIP rover"));
        assert_eq!(head.header("HOST"), Some("x"));
        assert_eq!(head.header("authorization"), None);
    }

    #[tokio::test]
    async fn test_read_head_stops_at_blank_line() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"SOURCE /M1 ICY/1.0\r\nSource-Agent: x\r\n\r\n\xD3\x00\x00")
            .await
            .unwrap();

        let head = read_request_head(&mut server, 8192).await.unwrap();
        assert_eq!(head.request_line, "SOURCE /M1 ICY/1.0");

        let mut rest = [0u8; 3];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0xD3, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[b'A'; 200]).await.unwrap();
        assert_eq!(
            read_request_head(&mut server, 64).await,
            Err(ParseError::HeaderTooLong(64))
        );

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"GET /M1 HTTP/1.1\r\n").await.unwrap();
        drop(client);
        assert_eq!(
            read_request_head(&mut server, 8192).await,
            Err(ParseError::ConnectionClosed)
        );
    }

    #[test]
    fn test_build_source_table() {
        let table = build_source_table(&[SourceTableEntry {
            mount_name: "M1".to_string(),
            latitude: 53.3498,
            longitude: -6.2603,
        }]);
        let text = String::from_utf8(table.to_vec()).unwrap();
        assert!(text.starts_with("SOURCETABLE 200 OK\r\n"));
        assert!(text.contains("STR;M1;M1;RTCM 3;;2;GPS;;;53.35;-6.26;"));
        assert!(text.ends_with("ENDSOURCETABLE\r\n\r\n"));

        let empty = build_source_table(&[]);
        assert_eq!(&empty[..], b"SOURCETABLE 200 OK\r\nENDSOURCETABLE\r\n\r\n");
    }
}
