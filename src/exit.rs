//! 进程退出码

use crate::CapsinkError;
use crate::sink::SinkOutcome;

pub mod codes {
    /// 正常停止
    pub const SUCCESS: i32 = 0;
    /// 参数或配置无效
    pub const INVALID_CONFIG: i32 = 1;
    /// 磁盘使用率达到阈值后受控停止
    pub const USAGE_THRESHOLD: i32 = 2;
    /// 运行时错误
    pub const RUNTIME_ERROR: i32 = 3;
}

pub fn exit_code(error: &CapsinkError) -> i32 {
    if error.is_config_error() {
        codes::INVALID_CONFIG
    } else {
        codes::RUNTIME_ERROR
    }
}

pub fn outcome_code(outcome: &SinkOutcome) -> i32 {
    match outcome {
        SinkOutcome::Shutdown => codes::SUCCESS,
        SinkOutcome::ThresholdReached { .. } => codes::USAGE_THRESHOLD,
    }
}
