use crate::{CapsinkError, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 最短滚动间隔
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(10);
/// 最长滚动间隔（12 小时）
pub const MAX_ROTATION_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// 生产者与写入线程之间的队列容量
pub const PACKET_QUEUE_SIZE: usize = 128;
/// 连续写入失败达到该次数后停止会话
pub const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 64;

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub output_dir: PathBuf,
    pub snaplen: u32,
    // 磁盘使用率达到该百分比时停止（1-100，含边界）
    pub usage_threshold: u8,
    pub rotation_interval: Duration,
    pub queue_size: usize,
    pub max_write_failures: u32,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./capture"),
            snaplen: 1600,
            usage_threshold: 90,
            rotation_interval: Duration::from_secs(5 * 60),
            queue_size: PACKET_QUEUE_SIZE,
            max_write_failures: MAX_CONSECUTIVE_WRITE_FAILURES,
        }
    }
}

impl SinkOptions {
    /// 从未经检查的原始值构建选项，任何越界值都会返回配置错误
    pub fn from_raw(
        output_dir: impl Into<PathBuf>,
        snaplen: i64,
        usage_threshold: i64,
        rotation_secs: u64,
    ) -> Result<Self> {
        let options = Self {
            output_dir: output_dir.into(),
            snaplen: check_snaplen(snaplen)?,
            usage_threshold: check_threshold(usage_threshold)?,
            rotation_interval: Duration::from_secs(rotation_secs),
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        check_threshold(i64::from(self.usage_threshold))?;
        check_rotation_interval(self.rotation_interval)?;
        check_snaplen(i64::from(self.snaplen))?;
        // 容量为 0 会变成同步交接通道
        if self.queue_size == 0 {
            return Err(CapsinkError::InvalidQueueSize(self.queue_size));
        }
        if self.max_write_failures == 0 {
            return Err(CapsinkError::InvalidWriteFailureLimit(self.max_write_failures));
        }
        Ok(())
    }
}

pub fn check_threshold(threshold: i64) -> Result<u8> {
    if threshold < 1 || threshold > 100 {
        return Err(CapsinkError::InvalidThreshold(threshold));
    }
    Ok(threshold as u8)
}

pub fn check_rotation_interval(interval: Duration) -> Result<Duration> {
    if interval < MIN_ROTATION_INTERVAL || interval > MAX_ROTATION_INTERVAL {
        return Err(CapsinkError::InvalidRotationInterval(interval.as_secs()));
    }
    Ok(interval)
}

pub fn check_snaplen(snaplen: i64) -> Result<u32> {
    if snaplen <= 0 || snaplen > i64::from(i32::MAX) {
        return Err(CapsinkError::InvalidSnaplen(snaplen));
    }
    Ok(snaplen as u32)
}

/// 创建输出目录；目录已存在且不为空时拒绝启动
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        create_dir(dir).map_err(|e| {
            CapsinkError::DirectoryCreationFailed(format!(
                "Failed to create directory: {}, error: {}",
                dir.display(),
                e
            ))
        })?;
        info!("Created output directory {}", dir.display());
    }

    if fs::read_dir(dir)?.next().is_some() {
        return Err(CapsinkError::OutputDirNotEmpty(dir.to_path_buf()));
    }

    Ok(())
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    // 仅所有者可读写执行
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}
