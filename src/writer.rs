use crate::{CapsinkError, Result};
use chrono::{DateTime, Local};
use log::{debug, error, info};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 文件名时间格式，精确到秒
const FILE_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S.pcap";

/// 一个待写入的数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// 自 Unix 纪元起的捕获时间
    pub timestamp: Duration,
    /// 线路上的原始长度
    pub orig_len: u32,
    pub data: Vec<u8>,
}

impl CapturedPacket {
    pub fn new(timestamp: Duration, orig_len: u32, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            orig_len,
            data,
        }
    }
}

/// 用于生成文件名的本地时钟
pub trait Clock: Send {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub fn file_name_for(time: &DateTime<Local>) -> String {
    time.format(FILE_NAME_FORMAT).to_string()
}

/// 捕获文件的底层存储，写入失败后能截断回指定长度
pub trait RecordStore: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

impl RecordStore for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// 当前打开的捕获文件。
///
/// 只有在文件头写入成功后才会构造出该值，因此任何记录都一定位于文件头之后。
/// 每条记录先编码到内存，再整条写入；写入失败时文件被截断回最后一条完整记录的末尾，
/// 之后的记录仍然可读。
/// `close` 会消耗自身，同一个文件不可能被关闭两次。
pub struct CaptureFile<S: RecordStore = File> {
    path: PathBuf,
    store: S,
    // 只负责编码，不直接接触文件
    encoder: PcapWriter<Vec<u8>>,
    snaplen: u32,
    // 最后一条完整记录的结束位置
    committed: u64,
    records: u64,
}

impl CaptureFile {
    pub fn open(
        dir: &Path,
        time: &DateTime<Local>,
        link_type: u32,
        snaplen: u32,
    ) -> Result<Self> {
        let path = dir.join(file_name_for(time));

        // 不允许覆盖已有文件
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => CapsinkError::FileExists(path.clone()),
                _ => CapsinkError::IoError(e),
            })?;

        Self::with_store(path, file, link_type, snaplen)
    }
}

impl<S: RecordStore> CaptureFile<S> {
    /// 在给定存储上写入文件头
    pub fn with_store(path: PathBuf, store: S, link_type: u32, snaplen: u32) -> Result<Self> {
        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen,
            datalink: DataLink::from(link_type),
            ts_resolution: TsResolution::NanoSecond,
            endianness: Endianness::Little,
        };

        let encoder = PcapWriter::with_header(Vec::new(), header)
            .map_err(|e| CapsinkError::PcapFileError(format!("{}: {}", path.display(), e)))?;

        let mut file = Self {
            path,
            store,
            encoder,
            snaplen,
            committed: 0,
            records: 0,
        };
        file.commit()?;

        info!("New capture file created: {}", file.path.display());
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// 已完整写入的字节数（文件头加所有完整记录）
    pub fn bytes_written(&self) -> u64 {
        self.committed
    }

    /// 写入一条记录，超过快照长度的部分被截断
    pub fn write_record(&mut self, timestamp: Duration, orig_len: u32, payload: &[u8]) -> Result<()> {
        // pcap 记录头的秒字段只有 32 位
        if timestamp.as_secs() > u64::from(u32::MAX) {
            return Err(CapsinkError::PcapFileError(format!(
                "timestamp {}s does not fit in a pcap record",
                timestamp.as_secs()
            )));
        }

        let captured = payload.len().min(self.snaplen as usize);
        let data = &payload[..captured];
        let packet = PcapPacket {
            timestamp,
            // 原始长度不能小于实际保存的长度
            orig_len: orig_len.max(captured as u32),
            data: Cow::Borrowed(data),
        };

        if let Err(e) = self.encoder.write_packet(&packet) {
            self.encoder.get_mut().clear();
            return Err(CapsinkError::PcapFileError(e.to_string()));
        }
        self.commit()?;
        self.records += 1;

        if self.records % 1000 == 0 {
            debug!("Wrote {} packets to {}", self.records, self.path.display());
        }
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &CapturedPacket) -> Result<()> {
        self.write_record(packet.timestamp, packet.orig_len, &packet.data)
    }

    /// 刷新并同步到磁盘。失败时同样截断回最后一条完整记录。
    pub fn close(mut self) -> Result<()> {
        if let Err(e) = self.store.flush().and_then(|_| self.store.sync()) {
            self.rollback();
            return Err(CapsinkError::IoError(e));
        }

        info!(
            "Closed capture file {} after {} packets ({} bytes)",
            self.path.display(),
            self.records,
            self.committed
        );
        Ok(())
    }

    // 把编码好的字节整条写入存储
    fn commit(&mut self) -> Result<()> {
        let buf = self.encoder.get_mut();
        let result = self.store.write_all(buf);
        let len = buf.len() as u64;
        buf.clear();

        match result {
            Ok(()) => {
                self.committed += len;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(CapsinkError::IoError(e))
            }
        }
    }

    fn rollback(&mut self) {
        if let Err(e) = self.store.truncate_to(self.committed) {
            error!(
                "Unable to truncate {} back to {} bytes: {}",
                self.path.display(),
                self.committed,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pcap_file::pcap::PcapReader;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const LINKTYPE_ETHERNET: u32 = 1;

    fn stamp(sec: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, sec).unwrap()
    }

    fn read_back(path: &Path) -> (PcapHeader, Vec<(Duration, u32, Vec<u8>)>) {
        let mut reader = PcapReader::new(File::open(path).unwrap()).unwrap();
        let header = reader.header();
        let mut packets = Vec::new();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.unwrap();
            packets.push((packet.timestamp, packet.orig_len, packet.data.into_owned()));
        }
        (header, packets)
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(file_name_for(&stamp(7)), "2024-03-09-14-05-07.pcap");
    }

    #[test]
    fn test_header_bytes() {
        let dir = tempdir().unwrap();
        let mut file = CaptureFile::open(dir.path(), &stamp(0), LINKTYPE_ETHERNET, 1600).unwrap();
        file.write_record(Duration::from_secs(1), 4, &[1, 2, 3, 4]).unwrap();
        let path = file.path().to_path_buf();
        file.close().unwrap();

        let bytes = fs::read(&path).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&0xa1b2_3c4d_u32.to_le_bytes());
        expected.extend_from_slice(&2u16.to_le_bytes());
        expected.extend_from_slice(&4u16.to_le_bytes());
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&1600u32.to_le_bytes());
        expected.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        assert_eq!(&bytes[..24], &expected[..]);
        assert_eq!(bytes.len(), 24 + 16 + 4);
    }

    #[test]
    fn test_header_written_without_records() {
        let dir = tempdir().unwrap();
        let file = CaptureFile::open(dir.path(), &stamp(0), 113, 256).unwrap();
        let path = file.path().to_path_buf();
        file.close().unwrap();

        let (header, packets) = read_back(&path);
        assert_eq!(header.snaplen, 256);
        assert_eq!(u32::from(header.datalink), 113);
        assert_eq!(header.ts_resolution, TsResolution::NanoSecond);
        assert!(packets.is_empty());
    }

    #[test]
    fn test_record_truncated_to_snaplen() {
        let dir = tempdir().unwrap();
        let mut file = CaptureFile::open(dir.path(), &stamp(0), LINKTYPE_ETHERNET, 8).unwrap();
        let payload: Vec<u8> = (0..20).collect();
        file.write_record(Duration::new(10, 5), 20, &payload).unwrap();
        // 原始长度小于负载长度时会被修正
        file.write_record(Duration::new(11, 0), 2, &payload[..4]).unwrap();
        let path = file.path().to_path_buf();
        file.close().unwrap();

        let (_, packets) = read_back(&path);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].1, 20);
        assert_eq!(packets[0].2, payload[..8].to_vec());
        assert_eq!(packets[1].1, 4);
        assert_eq!(packets[1].2, payload[..4].to_vec());
        for (_, orig, data) in &packets {
            assert!(data.len() as u32 <= *orig);
            assert!(data.len() <= 8);
        }
    }

    #[test]
    fn test_round_trip_preserves_order_and_nanos() {
        let dir = tempdir().unwrap();
        let mut file = CaptureFile::open(dir.path(), &stamp(0), LINKTYPE_ETHERNET, 1600).unwrap();
        let sent: Vec<CapturedPacket> = (0..50u32)
            .map(|i| {
                CapturedPacket::new(
                    Duration::new(1_700_000_000 + u64::from(i), i * 1_001),
                    60 + i,
                    vec![i as u8; 60 + i as usize],
                )
            })
            .collect();
        for packet in &sent {
            file.write_packet(packet).unwrap();
        }
        assert_eq!(file.records(), 50);
        let path = file.path().to_path_buf();
        file.close().unwrap();

        let (_, packets) = read_back(&path);
        let expected: Vec<_> = sent
            .iter()
            .map(|p| (p.timestamp, p.orig_len, p.data.clone()))
            .collect();
        assert_eq!(packets, expected);
    }

    #[test]
    fn test_open_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join(file_name_for(&stamp(3)));
        fs::write(&existing, b"keep me").unwrap();

        match CaptureFile::open(dir.path(), &stamp(3), LINKTYPE_ETHERNET, 1600) {
            Err(CapsinkError::FileExists(path)) => assert_eq!(path, existing),
            Err(e) => panic!("expected FileExists, got {:?}", e),
            Ok(_) => panic!("expected FileExists, got an open file"),
        }
        assert_eq!(fs::read(&existing).unwrap(), b"keep me");
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            CaptureFile::open(&missing, &stamp(0), LINKTYPE_ETHERNET, 1600),
            Err(CapsinkError::IoError(_))
        ));
    }

    #[test]
    fn test_close_keeps_written_bytes() {
        let dir = tempdir().unwrap();
        let mut file = CaptureFile::open(dir.path(), &stamp(0), LINKTYPE_ETHERNET, 1600).unwrap();
        file.write_record(Duration::new(1, 0), 3, &[9, 9, 9]).unwrap();
        let path = file.path().to_path_buf();
        file.close().unwrap();

        let before = fs::read(&path).unwrap();
        // 关闭后的文件不会再被打开或修改
        assert!(CaptureFile::open(dir.path(), &stamp(0), LINKTYPE_ETHERNET, 1600).is_err());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    /// 内存中的存储，容量用完后写入失败（可能只写入一部分），模拟磁盘写满
    #[derive(Clone)]
    struct FullDisk {
        state: Arc<Mutex<FullDiskState>>,
    }

    struct FullDiskState {
        data: Vec<u8>,
        capacity: usize,
        fail_sync: bool,
    }

    impl FullDisk {
        fn new(capacity: usize) -> Self {
            Self {
                state: Arc::new(Mutex::new(FullDiskState {
                    data: Vec::new(),
                    capacity,
                    fail_sync: false,
                })),
            }
        }

        fn set_capacity(&self, capacity: usize) {
            self.state.lock().unwrap().capacity = capacity;
        }

        fn fail_sync(&self) {
            self.state.lock().unwrap().fail_sync = true;
        }

        fn bytes(&self) -> Vec<u8> {
            self.state.lock().unwrap().data.clone()
        }
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            let room = state.capacity.saturating_sub(state.data.len());
            if room == 0 {
                return Err(io::Error::new(ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(room);
            state.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RecordStore for FullDisk {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.state.lock().unwrap().data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.state.lock().unwrap().fail_sync {
                return Err(io::Error::new(ErrorKind::Other, "sync failed"));
            }
            Ok(())
        }
    }

    fn read_bytes(bytes: &[u8]) -> Vec<(Duration, u32, Vec<u8>)> {
        let mut reader = PcapReader::new(bytes).unwrap();
        let mut packets = Vec::new();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.unwrap();
            packets.push((packet.timestamp, packet.orig_len, packet.data.into_owned()));
        }
        packets
    }

    fn record(id: u8) -> CapturedPacket {
        CapturedPacket::new(Duration::new(1_700_000_000 + u64::from(id), 0), 100, vec![id; 100])
    }

    #[test]
    fn test_failed_write_leaves_only_complete_records() {
        // 文件头 + 两条完整记录 + 第三条的一半
        let disk = FullDisk::new(24 + 2 * (16 + 100) + 50);
        let mut file =
            CaptureFile::with_store(PathBuf::from("full.pcap"), disk.clone(), LINKTYPE_ETHERNET, 1600)
                .unwrap();

        file.write_packet(&record(0)).unwrap();
        file.write_packet(&record(1)).unwrap();
        assert!(matches!(file.write_packet(&record(2)), Err(CapsinkError::IoError(_))));
        assert_eq!(disk.bytes().len(), 24 + 2 * 116);
        assert_eq!(file.bytes_written(), 24 + 2 * 116);
        assert_eq!(file.records(), 2);

        // 空间释放后继续写入
        disk.set_capacity(usize::MAX);
        file.write_packet(&record(3)).unwrap();
        file.close().unwrap();

        let bytes = disk.bytes();
        assert_eq!(bytes.len(), 24 + 3 * 116);
        let ids: Vec<u8> = read_bytes(&bytes).iter().map(|(_, _, data)| data[0]).collect();
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn test_failure_inside_record_header_is_rolled_back() {
        let disk = FullDisk::new(24 + 10);
        let mut file =
            CaptureFile::with_store(PathBuf::from("full.pcap"), disk.clone(), LINKTYPE_ETHERNET, 1600)
                .unwrap();

        assert!(file.write_packet(&record(5)).is_err());
        assert_eq!(disk.bytes().len(), 24);

        disk.set_capacity(usize::MAX);
        file.write_packet(&record(6)).unwrap();
        file.close().unwrap();

        let packets = read_bytes(&disk.bytes());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], (record(6).timestamp, 100, vec![6; 100]));
    }

    #[test]
    fn test_repeated_failures_never_leave_partial_bytes() {
        let disk = FullDisk::new(24 + 116 + 3);
        let mut file =
            CaptureFile::with_store(PathBuf::from("full.pcap"), disk.clone(), LINKTYPE_ETHERNET, 1600)
                .unwrap();
        file.write_packet(&record(0)).unwrap();
        for id in 1..5 {
            assert!(file.write_packet(&record(id)).is_err());
            assert_eq!(disk.bytes().len(), 24 + 116);
        }
        file.close().unwrap();
        assert_eq!(read_bytes(&disk.bytes()).len(), 1);
    }

    #[test]
    fn test_header_write_failure_is_reported() {
        let disk = FullDisk::new(10);
        let result =
            CaptureFile::with_store(PathBuf::from("full.pcap"), disk.clone(), LINKTYPE_ETHERNET, 1600);
        assert!(matches!(result, Err(CapsinkError::IoError(_))));
        assert!(disk.bytes().is_empty());
    }

    #[test]
    fn test_close_failure_keeps_complete_records() {
        let disk = FullDisk::new(usize::MAX);
        let mut file =
            CaptureFile::with_store(PathBuf::from("full.pcap"), disk.clone(), LINKTYPE_ETHERNET, 1600)
                .unwrap();
        file.write_packet(&record(1)).unwrap();
        file.write_packet(&record(2)).unwrap();
        disk.fail_sync();

        assert!(matches!(file.close(), Err(CapsinkError::IoError(_))));
        let ids: Vec<u8> = read_bytes(&disk.bytes()).iter().map(|(_, _, data)| data[0]).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
