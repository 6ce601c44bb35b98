//! 磁盘使用率采样

use crate::{CapsinkError, Result};
use log::info;
use std::path::Path;

/// 一次采样的结果，每次滚动时重新获取
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsageSample {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsageSample {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self {
            total_bytes,
            available_bytes,
        }
    }

    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (1.0 - self.available_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    /// 达到阈值即视为超出（含边界）
    pub fn is_over(&self, threshold: u8) -> bool {
        self.percent_used() >= f64::from(threshold)
    }
}

pub trait DiskUsage: Send {
    fn sample(&self, path: &Path) -> Result<DiskUsageSample>;

    /// 返回 (是否超出阈值, 当前使用率)
    fn is_over_threshold(&self, path: &Path, threshold: u8) -> Result<(bool, f64)> {
        let sample = self.sample(path)?;
        Ok((sample.is_over(threshold), sample.percent_used()))
    }
}

/// 通过 statvfs 读取真实文件系统
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDiskUsage;

impl DiskUsage for FsDiskUsage {
    fn sample(&self, path: &Path) -> Result<DiskUsageSample> {
        let stat_err = |source| CapsinkError::DiskUsage {
            path: path.to_path_buf(),
            source,
        };
        let total = fs2::total_space(path).map_err(stat_err)?;
        let avail = fs2::available_space(path).map_err(stat_err)?;
        let sample = DiskUsageSample::new(total, avail);

        info!(
            "Disk usage check: path={} total_b={} avail_b={} percent={:.3}",
            path.display(),
            total,
            avail,
            sample.percent_used()
        );
        Ok(sample)
    }
}
