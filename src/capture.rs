//! 数据包来源：libpcap 实时抓包或回放已有文件，以及 Ctrl+C 停止标志。

use crate::sink::SinkSender;
use crate::writer::CapturedPacket;
use crate::{CapsinkError, Result};
use log::{debug, info, warn};
use pcap::{Activated, Active, Capture, Error as PcapError, Offline, Precision};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 实时抓包的读取超时，停止标志至少每隔这么久被检查一次
pub const READ_TIMEOUT_MS: i32 = 1000;

#[derive(Debug)]
pub enum SourceEvent {
    Packet(CapturedPacket),
    /// 超时，暂时没有数据
    Idle,
    /// 回放文件读完
    Exhausted,
}

pub trait PacketSource {
    /// 链路层类型，启动时读取一次
    fn link_type(&self) -> u32;

    fn poll(&mut self) -> Result<SourceEvent>;
}

pub struct PcapSource<T: Activated> {
    cap: Capture<T>,
}

impl PcapSource<Active> {
    pub fn live(device_name: &str, snaplen: u32) -> Result<Self> {
        let cap = Capture::from_device(device_name)?
            .snaplen(snaplen as i32)
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .precision(Precision::Nano)
            .open()?;

        info!("Starting capture on device: {}", device_name);
        Ok(Self { cap })
    }
}

impl PcapSource<Offline> {
    pub fn offline(path: &Path) -> Result<Self> {
        let cap = Capture::from_file_with_precision(path, Precision::Nano)?;
        info!("Replaying capture file: {}", path.display());
        Ok(Self { cap })
    }
}

impl<T: Activated> PcapSource<T> {
    /// 设置 BPF 过滤表达式，空字符串表示不过滤
    pub fn set_filter(&mut self, program: &str) -> Result<()> {
        if program.is_empty() {
            return Ok(());
        }
        self.cap
            .filter(program, true)
            .map_err(|e| CapsinkError::InvalidFilter(format!("{}: {}", program, e)))?;
        info!("BPF filter applied: {}", program);
        Ok(())
    }
}

impl<T: Activated> PacketSource for PcapSource<T> {
    fn link_type(&self) -> u32 {
        self.cap.get_datalink().0 as u32
    }

    fn poll(&mut self) -> Result<SourceEvent> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = capture_timestamp(i64::from(ts.tv_sec), i64::from(ts.tv_usec));
                Ok(SourceEvent::Packet(CapturedPacket::new(
                    timestamp,
                    packet.header.len,
                    packet.data.to_vec(),
                )))
            }
            Err(PcapError::TimeoutExpired) => Ok(SourceEvent::Idle),
            Err(PcapError::NoMorePackets) => Ok(SourceEvent::Exhausted),
            Err(e) => Err(e.into()),
        }
    }
}

/// 把 libpcap 的时间戳转换为自纪元起的时长。
///
/// 打开句柄时请求了纳秒精度，这里假定小数部分是纳秒。libpcap 不支持纳秒精度的设备
/// 会静默保持微秒，此时时间戳的小数部分会偏小一千倍。
/// 负的秒数或越界的小数部分无法写入 pcap 记录，记录警告后归零。
pub fn capture_timestamp(secs: i64, frac_nanos: i64) -> Duration {
    let secs = u64::try_from(secs).unwrap_or_else(|_| {
        warn!("Negative packet timestamp {}s, recording it as the epoch", secs);
        0
    });
    let nanos = match u32::try_from(frac_nanos) {
        Ok(n) if n < 1_000_000_000 => n,
        _ => {
            warn!("Packet timestamp fraction {} out of range, recording it as 0", frac_nanos);
            0
        }
    };
    Duration::new(secs, nanos)
}

/// 收到 SIGINT/SIGTERM/SIGHUP 后被置位的停止标志
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// 注册信号处理函数。注册失败时仍返回一个可手动触发的标志。
    pub fn install() -> Self {
        let shutdown = Self::manual();
        let flag = shutdown.flag.clone();

        if let Err(e) = ctrlc::set_handler(move || {
            info!("Received termination signal");
            flag.store(true, Ordering::SeqCst);
        }) {
            warn!("Unable to install signal handler: {}", e);
        }
        shutdown
    }

    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 把数据包从来源送入队列，直到收到停止信号、来源耗尽或写入端停止。
/// 返回转发的数据包数量。
pub fn pump<S: PacketSource>(source: &mut S, sink: &SinkSender, shutdown: &ShutdownFlag) -> Result<u64> {
    let mut forwarded = 0u64;

    while !shutdown.should_stop() {
        match source.poll()? {
            SourceEvent::Packet(packet) => {
                if sink.send(packet).is_err() {
                    info!("Capture sink halted, stopping packet source");
                    break;
                }
                forwarded += 1;
                if forwarded % 1000 == 0 {
                    debug!("Captured total {} packets", forwarded);
                }
            }
            SourceEvent::Idle => continue,
            SourceEvent::Exhausted => {
                info!("Packet source exhausted");
                break;
            }
        }
    }

    Ok(forwarded)
}
