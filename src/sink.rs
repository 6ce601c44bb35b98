//! 写入线程：持有数据包队列、滚动计时和当前打开的捕获文件。
//!
//! 数据包与滚动请求走同一个有界队列，由唯一的消费者按顺序处理，
//! 所以文件句柄不需要加锁，也不会有数据包跨越滚动边界。

use crate::config::SinkOptions;
use crate::disk::{DiskUsage, FsDiskUsage};
use crate::writer::{CaptureFile, CapturedPacket, Clock, SystemClock};
use crate::{CapsinkError, Result};
use log::{error, info, warn};
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::time::Instant;

#[derive(Debug)]
pub enum SinkMessage {
    Packet(CapturedPacket),
    /// 立即滚动，与计时器到期效果相同
    Rotate,
    /// 处理完队列中排在它前面的消息后停止
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Running,
    Halted,
}

/// 会话结束的原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkOutcome {
    /// 收到停止请求，或所有生产者都已断开
    Shutdown,
    /// 滚动时磁盘使用率达到阈值
    ThresholdReached { percent: f64 },
}

/// 生产者一侧的句柄。队列满时 `send` 会阻塞。
#[derive(Debug, Clone)]
pub struct SinkSender {
    tx: SyncSender<SinkMessage>,
}

impl SinkSender {
    pub fn send(&self, packet: CapturedPacket) -> Result<()> {
        self.send_message(SinkMessage::Packet(packet))
    }

    pub fn rotate(&self) -> Result<()> {
        self.send_message(SinkMessage::Rotate)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_message(SinkMessage::Shutdown)
    }

    fn send_message(&self, message: SinkMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| CapsinkError::SinkHalted)
    }
}

pub struct CaptureSink<D = FsDiskUsage, C = SystemClock> {
    options: SinkOptions,
    link_type: u32,
    disk: D,
    clock: C,
    rx: Receiver<SinkMessage>,
    current: Option<CaptureFile>,
    state: SinkState,
    deadline: Instant,
    write_failures: u32,
    packets_written: u64,
}

impl<D: DiskUsage, C: Clock> CaptureSink<D, C> {
    /// 检查磁盘、打开第一个文件并启动滚动计时。磁盘已超出阈值时拒绝启动。
    pub fn start(
        options: SinkOptions,
        link_type: u32,
        disk: D,
        clock: C,
    ) -> Result<(Self, SinkSender)> {
        options.validate()?;

        let (over, percent) = disk.is_over_threshold(&options.output_dir, options.usage_threshold)?;
        if over {
            error!(
                "Disk usage is already above stop threshold: threshold={} current={:.3}",
                options.usage_threshold, percent
            );
            return Err(CapsinkError::UsageAboveThreshold {
                percent,
                threshold: options.usage_threshold,
            });
        }

        let first = CaptureFile::open(&options.output_dir, &clock.now(), link_type, options.snaplen)?;
        let (tx, rx) = sync_channel(options.queue_size);
        let deadline = Instant::now() + options.rotation_interval;

        info!(
            "Capture sink started: dir={} snaplen={} threshold={}% interval={}s",
            options.output_dir.display(),
            options.snaplen,
            options.usage_threshold,
            options.rotation_interval.as_secs()
        );

        let sink = Self {
            options,
            link_type,
            disk,
            clock,
            rx,
            current: Some(first),
            state: SinkState::Running,
            deadline,
            write_failures: 0,
            packets_written: 0,
        };
        Ok((sink, SinkSender { tx }))
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path())
    }

    /// 主循环。返回时当前文件已关闭，队列接收端已释放。
    pub fn run(mut self) -> Result<SinkOutcome> {
        let result = self.run_loop();
        self.state = SinkState::Halted;
        self.close_current();

        match &result {
            Ok(outcome) => info!(
                "Capture sink stopped: {:?}, {} packets written",
                outcome, self.packets_written
            ),
            Err(e) => error!(
                "Capture sink failed: {}, {} packets written",
                e, self.packets_written
            ),
        }
        result
    }

    fn run_loop(&mut self) -> Result<SinkOutcome> {
        loop {
            // 先检查计时器，持续有包到达时也不会推迟滚动
            let now = Instant::now();
            if now >= self.deadline {
                if let Some(outcome) = self.rotate()? {
                    return Ok(outcome);
                }
                continue;
            }

            match self.rx.recv_timeout(self.deadline - now) {
                Ok(SinkMessage::Packet(packet)) => self.write(&packet)?,
                Ok(SinkMessage::Rotate) => {
                    if let Some(outcome) = self.rotate()? {
                        return Ok(outcome);
                    }
                }
                Ok(SinkMessage::Shutdown) => {
                    info!("Shutdown requested");
                    return Ok(SinkOutcome::Shutdown);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("All packet producers disconnected");
                    return Ok(SinkOutcome::Shutdown);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn rotate(&mut self) -> Result<Option<SinkOutcome>> {
        info!("Rotating capture file...");
        self.close_current();
        self.deadline = Instant::now() + self.options.rotation_interval;

        let dir = &self.options.output_dir;
        match self.disk.is_over_threshold(dir, self.options.usage_threshold) {
            Ok((true, percent)) => {
                info!(
                    "Reached maximum permitted usage: threshold={} current={:.3}",
                    self.options.usage_threshold, percent
                );
                self.state = SinkState::Halted;
                return Ok(Some(SinkOutcome::ThresholdReached { percent }));
            }
            Ok((false, _)) => {}
            Err(e) => warn!("Unable to check available disk space: {}", e),
        }

        let file = CaptureFile::open(dir, &self.clock.now(), self.link_type, self.options.snaplen)
            .map_err(|e| {
                error!("Error creating new file in {}: {}", dir.display(), e);
                self.state = SinkState::Halted;
                e
            })?;
        self.current = Some(file);
        Ok(None)
    }

    fn write(&mut self, packet: &CapturedPacket) -> Result<()> {
        let Some(file) = self.current.as_mut() else {
            return Err(CapsinkError::SinkHalted);
        };

        match file.write_packet(packet) {
            Ok(()) => {
                self.write_failures = 0;
                self.packets_written += 1;
                Ok(())
            }
            Err(e) => {
                self.write_failures += 1;
                error!(
                    "Error writing packet to {} after {} records, {} bytes ({} consecutive failures): {}",
                    file.path().display(),
                    file.records(),
                    file.bytes_written(),
                    self.write_failures,
                    e
                );
                if self.write_failures >= self.options.max_write_failures {
                    return Err(CapsinkError::WriteFailuresExceeded {
                        count: self.write_failures,
                        path: file.path().to_path_buf(),
                    });
                }
                Ok(())
            }
        }
    }

    fn close_current(&mut self) {
        if let Some(file) = self.current.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                error!("Error closing file {}: {}", path.display(), e);
            }
        }
    }
}
