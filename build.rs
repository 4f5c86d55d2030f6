use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    capture: Capture,
    localization: Localization,
    bridge: Bridge,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Capture {
    card: u32,
    device: u32,
    sample_rate: u32,
    channels: u8,
    bit_rate: u32,
    aot: u8,
    period_size: u32,
    period_count: u32,
}

#[derive(Deserialize)]
struct Localization {
    enabled: bool,
    config_path: String,
    gate_low_confidence: bool,
}

#[derive(Deserialize)]
struct Bridge {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    data_port: u16,
    event_port: u16,
    buffer_size: usize,
    auto_start: bool,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 采集与编码默认参数
    println!("cargo:rustc-env=CAPTURE_CARD={}", config.capture.card);
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.capture.sample_rate);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.capture.channels);
    println!("cargo:rustc-env=CAPTURE_BIT_RATE={}", config.capture.bit_rate);
    println!("cargo:rustc-env=CAPTURE_AOT={}", config.capture.aot);
    println!("cargo:rustc-env=CAPTURE_PERIOD_SIZE={}", config.capture.period_size);
    println!("cargo:rustc-env=CAPTURE_PERIOD_COUNT={}", config.capture.period_count);

    // 声源定位
    println!("cargo:rustc-env=LOCALIZATION_ENABLED={}", config.localization.enabled);
    println!("cargo:rustc-env=LOCALIZATION_CONFIG_PATH={}", config.localization.config_path);
    println!(
        "cargo:rustc-env=LOCALIZATION_GATE_LOW_CONFIDENCE={}",
        config.localization.gate_low_confidence
    );

    // UDP 桥配置
    println!("cargo:rustc-env=BRIDGE_LOCAL_IP={}", config.bridge.local_ip);
    println!("cargo:rustc-env=BRIDGE_LOCAL_PORT={}", config.bridge.local_port);
    println!("cargo:rustc-env=BRIDGE_REMOTE_IP={}", config.bridge.remote_ip);
    println!("cargo:rustc-env=BRIDGE_DATA_PORT={}", config.bridge.data_port);
    println!("cargo:rustc-env=BRIDGE_EVENT_PORT={}", config.bridge.event_port);
    println!("cargo:rustc-env=BRIDGE_BUFFER_SIZE={}", config.bridge.buffer_size);
    println!("cargo:rustc-env=BRIDGE_AUTO_START={}", config.bridge.auto_start);

    link_fdk_aac();
}

// FDK-AAC 只在 hardware 特性下链接；ALSA 由 alsa-sys 自行处理
fn link_fdk_aac() {
    if std::env::var("CARGO_FEATURE_HARDWARE").is_err() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=fdk-aac");
        return;
    }

    pkg_config::Config::new()
        .probe("fdk-aac")
        .expect("Failed to find fdk-aac. Please install libfdk-aac-dev.");
}
