//! 原始数据记录
//! 将基准站上传的原始字节追加写入 `rtcm-<挂载点>.log`

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// 原始数据记录文件
#[derive(Debug)]
pub struct RawCapture {
    /// 文件路径
    path: PathBuf,
    /// 文件句柄，写入失败后置空
    file: Option<File>,
    /// 已写入字节数
    written: u64,
}

/// 记录文件路径，挂载点中 `[A-Za-z0-9_-]` 以外的字符替换为 `_`
pub fn capture_path(dir: &Path, mount_name: &str) -> PathBuf {
    let sanitized: String = mount_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("rtcm-{}.log", sanitized))
}

impl RawCapture {
    /// 以追加方式打开记录文件
    pub async fn open(dir: &Path, mount_name: &str) -> std::io::Result<Self> {
        let path = capture_path(dir, mount_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::debug!("Capturing {} to {}", mount_name, path.display());
        Ok(Self {
            path,
            file: Some(file),
            written: 0,
        })
    }

    /// 写入一块数据并刷新
    ///
    /// 出错时记录告警并停用记录，后续写入直接忽略。
    pub async fn write(&mut self, data: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = match file.write_all(data).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.written += data.len() as u64,
            Err(e) => {
                tracing::warn!("Raw capture to {} failed, disabling: {}", self.path.display(), e);
                self.file = None;
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}
