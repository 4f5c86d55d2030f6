mod audio;
mod config;
mod node;
mod protocol;
mod recorder;
mod udp_bridge;

use anyhow::Result;
use audio::{CaptureBackend, CodecBackend, MicrophoneAdtsStreamer, StreamerConfig};
use clap::{Parser, Subcommand};
use config::Config;
use node::{ControlCommand, MicrophoneNode, StreamSink};
use protocol::ControlMessage;
use recorder::AdtsFileSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use udp_bridge::{Outbound, UdpBridge, UdpSink};

#[derive(Parser)]
#[command(name = "bionic_mic_rs", version, about = "Microphone AAC streaming and sound localization")]
struct Cli {
    /// ALSA card index
    #[arg(short = 'd', long)]
    card: Option<u32>,
    /// ALSA device index
    #[arg(short = 'D', long)]
    device: Option<u32>,
    /// Enable sound-source localization (capture layout from the geometry file)
    #[arg(long)]
    localization: bool,
    /// Mic-array geometry YAML
    #[arg(long)]
    geometry: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the ADTS stream to a file
    Record {
        /// Output .aac file
        #[arg(short, long)]
        output: PathBuf,
        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(short = 't', long)]
        seconds: Option<u64>,
    },
}

#[cfg(feature = "hardware")]
fn hardware_backends() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn CodecBackend>)> {
    Ok((Arc::new(audio::AlsaCapture), Arc::new(audio::FdkAac)))
}

#[cfg(not(feature = "hardware"))]
fn hardware_backends() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn CodecBackend>)> {
    anyhow::bail!("built without hardware support, enable the `hardware` feature")
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    let cli = Cli::parse();

    // 命令行参数覆盖编译时配置
    let mut base = config.streamer_config();
    if let Some(card) = cli.card {
        base.card = card;
    }
    if let Some(device) = cli.device {
        base.device = device;
    }
    if cli.localization {
        base.enable_localization = true;
    }
    if let Some(path) = &cli.geometry {
        base.localization_config_path = path.to_string_lossy().into_owned();
    }

    log::info!(
        "{} {} starting: card={}, device={}, localization={}",
        config.app_name,
        config.app_version,
        base.card,
        base.device,
        base.enable_localization,
    );

    let (capture, codec) = hardware_backends()?;

    match cli.command {
        Some(Commands::Record { output, seconds }) => {
            record(base, capture, codec, output, seconds).await
        }
        None => serve(&config, base, capture, codec).await,
    }
}

/// 常驻模式：UDP 控制命令驱动推流
async fn serve(
    config: &Config,
    base: StreamerConfig,
    capture: Arc<dyn CaptureBackend>,
    codec: Arc<dyn CodecBackend>,
) -> Result<()> {
    // 控制命令通道
    let (tx_control, mut rx_control) = mpsc::channel::<ControlMessage>(16);
    // 发往兄弟进程的数据与事件
    let (tx_out, rx_out) = mpsc::channel::<Outbound>(256);

    let bridge = Arc::new(UdpBridge::new(config, tx_control).await?);
    let bridge_clone = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_clone.run().await {
            log::error!("UdpBridge error: {}", e);
        }
    });
    let bridge_clone = bridge.clone();
    tokio::spawn(async move {
        bridge_clone.forward(rx_out).await;
    });

    let sink = Arc::new(UdpSink::new(tx_out));
    let mut node = MicrophoneNode::spawn(base.clone(), capture, codec, sink)?;

    if config.auto_start {
        node.send(ControlCommand {
            start: true,
            sample_rate: base.sample_rate,
            channels: base.channels,
            bit_rate: base.bit_rate,
            aot: base.aot,
        })?;
    }

    log::info!(
        "Listening for control on {}:{}",
        config.bridge_local_ip,
        config.bridge_local_port
    );

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(msg) = rx_control.recv() => {
                match msg.to_command(&base) {
                    Some(cmd) => {
                        if let Err(e) = node.send(cmd) {
                            log::error!("{}", e);
                            break;
                        }
                    }
                    None => log::warn!("Unhandled control type: {}", msg.msg_type),
                }
            }
        }
    }

    // 停止推流会阻塞等待音频线程退出
    tokio::task::spawn_blocking(move || node.shutdown()).await?;
    Ok(())
}

/// 录制模式：把 ADTS 流写入文件
async fn record(
    base: StreamerConfig,
    capture: Arc<dyn CaptureBackend>,
    codec: Arc<dyn CodecBackend>,
    output: PathBuf,
    seconds: Option<u64>,
) -> Result<()> {
    let sink = Arc::new(AdtsFileSink::create(&output)?);

    let mut streamer = MicrophoneAdtsStreamer::new(capture, codec);
    let s = sink.clone();
    streamer.on_control(move |c| s.publish_control(&c));
    let s = sink.clone();
    streamer.on_data(move |p| s.publish_data(&p));
    let s = sink.clone();
    streamer.on_localization(move |r| s.publish_localization(&r));

    streamer.start(&base)?;
    log::info!("Recording to {}", output.display());

    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping recording...");
                break;
            }
            _ = tick.tick() => {
                if !streamer.is_running() {
                    log::warn!("Stream ended early");
                    break;
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || streamer.stop()).await?;

    sink.flush()?;
    log::info!(
        "Wrote {} ADTS frames to {}",
        sink.frames_written(),
        output.display()
    );
    Ok(())
}
