use anyhow::{Context, Result};
use capsink::exit::{codes, exit_code, outcome_code};
use capsink::{
    CapsinkError, CaptureSink, FsDiskUsage, PacketSource, PcapSource, ShutdownFlag, SinkOptions,
    SinkOutcome, SystemClock, prepare_output_dir, pump, validate_device,
};
use clap::Parser;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

// 配置文件结构，所有字段可选，命令行参数优先
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct CaptureConfig {
    interface: Option<String>,
    out: Option<PathBuf>,
    usage: Option<i64>,
    snaplen: Option<i64>,
    timer: Option<u64>,
    bpf: Option<String>,
}

// 命令行参数定义
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 抓包网卡名称 (默认 lo)
    #[arg(short, long)]
    interface: Option<String>,

    /// 输出目录，必须为空或不存在 (默认 ./capture)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// 磁盘使用率达到该百分比时停止捕获，1 到 100 (默认 90)
    #[arg(short, long, allow_negative_numbers = true)]
    usage: Option<i64>,

    /// 每个数据包最多保存的字节数 (默认 1600)
    #[arg(short, long, allow_negative_numbers = true)]
    snaplen: Option<i64>,

    /// 滚动间隔（秒），10 秒到 12 小时 (默认 300)
    #[arg(short, long)]
    timer: Option<u64>,

    /// BPF 过滤表达式
    #[arg(short, long)]
    bpf: Option<String>,

    /// 回放已有的 pcap 文件而不是实时抓包
    #[arg(short, long)]
    read: Option<PathBuf>,

    /// JSON 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct Settings {
    interface: String,
    filter: String,
    replay: Option<PathBuf>,
    options: SinkOptions,
}

// 从配置文件加载配置
fn load_config_from_file(path: &Path) -> Result<CaptureConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Unable to read config file: {}", path.display()))?;
    let config: CaptureConfig = serde_json::from_str(&config_str)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

fn resolve_settings(args: Args) -> Result<Settings> {
    let config = match &args.config {
        Some(path) => load_config_from_file(path)?,
        None => CaptureConfig::default(),
    };

    let out = args.out.or(config.out).unwrap_or_else(|| PathBuf::from("./capture"));
    let options = SinkOptions::from_raw(
        out,
        args.snaplen.or(config.snaplen).unwrap_or(1600),
        args.usage.or(config.usage).unwrap_or(90),
        args.timer.or(config.timer).unwrap_or(5 * 60),
    )?;

    Ok(Settings {
        interface: args
            .interface
            .or(config.interface)
            .unwrap_or_else(|| "lo".to_string()),
        filter: args.bpf.or(config.bpf).unwrap_or_default(),
        replay: args.read,
        options,
    })
}

fn run(args: Args) -> Result<SinkOutcome> {
    let settings = resolve_settings(args)?;

    if settings.replay.is_none() {
        validate_device(&settings.interface)?;
    }
    // 必须在打开抓包设备之前完成
    prepare_output_dir(&settings.options.output_dir)?;

    match &settings.replay {
        Some(path) => {
            let mut source = PcapSource::offline(path)?;
            source.set_filter(&settings.filter)?;
            capture(source, settings.options)
        }
        None => {
            let mut source = PcapSource::live(&settings.interface, settings.options.snaplen)?;
            source.set_filter(&settings.filter)?;
            capture(source, settings.options)
        }
    }
}

fn capture<S>(mut source: S, options: SinkOptions) -> Result<SinkOutcome>
where
    S: PacketSource + Send + 'static,
{
    let shutdown = ShutdownFlag::install();
    let (sink, sender) = CaptureSink::start(options, source.link_type(), FsDiskUsage, SystemClock)?;

    let producer_shutdown = shutdown.clone();
    let producer = thread::spawn(move || pump(&mut source, &sender, &producer_shutdown));

    let outcome = sink.run();
    // 写入端停止后通知抓包线程退出
    shutdown.trigger();

    let forwarded = producer
        .join()
        .map_err(|_| CapsinkError::IoError(std::io::Error::other("capture thread panicked")))?;

    let outcome = outcome?;
    let forwarded = forwarded?;
    info!("Capture finished: {} packets captured, outcome {:?}", forwarded, outcome);
    Ok(outcome)
}

fn failure_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<CapsinkError>() {
        Some(e) => exit_code(e),
        // 其余错误都来自配置文件解析
        None => codes::INVALID_CONFIG,
    }
}

fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(codes::INVALID_CONFIG);
        }
    };

    info!("Initiating packet capture software...");
    let code = match run(args) {
        Ok(outcome) => {
            if let SinkOutcome::ThresholdReached { percent } = outcome {
                info!("Capture stopped: disk usage {:.3}% reached the threshold", percent);
            }
            outcome_code(&outcome)
        }
        Err(e) => {
            error!("{:#}", e);
            failure_code(&e)
        }
    };
    std::process::exit(code);
}
