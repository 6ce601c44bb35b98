use pcap::{Device, Error as PcapError};
use std::path::PathBuf;
use thiserror::Error;

pub mod capture;
pub mod config;
pub mod disk;
pub mod exit;
pub mod sink;
pub mod writer;

pub use capture::{PacketSource, PcapSource, ShutdownFlag, SourceEvent, pump};
pub use config::{SinkOptions, prepare_output_dir};
pub use disk::{DiskUsage, DiskUsageSample, FsDiskUsage};
pub use sink::{CaptureSink, SinkMessage, SinkOutcome, SinkSender, SinkState};
pub use writer::{CaptureFile, CapturedPacket, Clock, RecordStore, SystemClock};

#[derive(Error, Debug)]
pub enum CapsinkError {
    #[error("Pcap error: {0}")]
    PcapError(#[from] PcapError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid device name: {0}")]
    InvalidDevice(String),

    #[error("Invalid usage threshold: {0} (must be between 1 and 100)")]
    InvalidThreshold(i64),

    #[error("Invalid rotation interval: {0}s (must be between 10s and 12h)")]
    InvalidRotationInterval(u64),

    #[error("Invalid BPF filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid snapshot length: {0}")]
    InvalidSnaplen(i64),

    #[error("Invalid packet queue size: {0} (must be at least 1)")]
    InvalidQueueSize(usize),

    #[error("Invalid write failure limit: {0} (must be at least 1)")]
    InvalidWriteFailureLimit(u32),

    #[error("Output directory is not empty: {}", .0.display())]
    OutputDirNotEmpty(PathBuf),

    #[error("Directory creation failed: {0}")]
    DirectoryCreationFailed(String),

    #[error("Unable to check disk usage of {}: {source}", .path.display())]
    DiskUsage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Disk usage {percent:.2}% is already above stop threshold {threshold}%")]
    UsageAboveThreshold { percent: f64, threshold: u8 },

    #[error("Capture file already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("Pcap file error: {0}")]
    PcapFileError(String),

    #[error("{count} consecutive write failures on {}", .path.display())]
    WriteFailuresExceeded { count: u32, path: PathBuf },

    #[error("Capture sink has halted")]
    SinkHalted,
}

impl CapsinkError {
    /// 配置类错误：在开始捕获之前就会被拒绝
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CapsinkError::InvalidDevice(_)
                | CapsinkError::InvalidThreshold(_)
                | CapsinkError::InvalidRotationInterval(_)
                | CapsinkError::InvalidSnaplen(_)
                | CapsinkError::InvalidFilter(_)
                | CapsinkError::InvalidQueueSize(_)
                | CapsinkError::InvalidWriteFailureLimit(_)
                | CapsinkError::OutputDirNotEmpty(_)
                | CapsinkError::UsageAboveThreshold { .. }
        )
    }
}

pub type Result<T, E = CapsinkError> = std::result::Result<T, E>;

/// 获取所有可用的网络设备
pub fn get_available_devices() -> Result<Vec<String>> {
    let devices = Device::list()?;
    let device_names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    Ok(device_names)
}

/// 检查设备名是否存在
pub fn validate_device(device_name: &str) -> Result<()> {
    let devices = get_available_devices()?;
    if devices.iter().any(|d| d == device_name) {
        Ok(())
    } else {
        Err(CapsinkError::InvalidDevice(device_name.to_string()))
    }
}
