use crate::audio::StreamerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 采集与编码默认参数（控制命令未给出时使用）
    pub card: u32,
    pub device: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_rate: u32,
    pub aot: u8,
    pub period_size: usize,
    pub period_count: u32,

    // 声源定位
    pub localization_enabled: bool,
    pub localization_config_path: String,
    pub gate_low_confidence: bool,

    // UDP 桥配置
    pub bridge_local_ip: &'static str,
    pub bridge_local_port: u16,
    pub bridge_remote_ip: &'static str,
    pub bridge_data_port: u16,
    pub bridge_event_port: u16,
    pub bridge_buffer_size: usize,
    pub auto_start: bool,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            card: env!("CAPTURE_CARD").parse()
                .map_err(|_| "Failed to parse CAPTURE_CARD")?,
            device: env!("CAPTURE_DEVICE").parse()
                .map_err(|_| "Failed to parse CAPTURE_DEVICE")?,
            sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            channels: env!("CAPTURE_CHANNELS").parse()
                .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
            bit_rate: env!("CAPTURE_BIT_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_BIT_RATE")?,
            aot: env!("CAPTURE_AOT").parse()
                .map_err(|_| "Failed to parse CAPTURE_AOT")?,
            period_size: env!("CAPTURE_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_PERIOD_SIZE")?,
            period_count: env!("CAPTURE_PERIOD_COUNT").parse()
                .map_err(|_| "Failed to parse CAPTURE_PERIOD_COUNT")?,

            localization_enabled: env!("LOCALIZATION_ENABLED").parse()
                .map_err(|_| "Failed to parse LOCALIZATION_ENABLED")?,
            localization_config_path: env!("LOCALIZATION_CONFIG_PATH").to_string(),
            gate_low_confidence: env!("LOCALIZATION_GATE_LOW_CONFIDENCE").parse()
                .map_err(|_| "Failed to parse LOCALIZATION_GATE_LOW_CONFIDENCE")?,

            bridge_local_ip: env!("BRIDGE_LOCAL_IP"),
            bridge_local_port: env!("BRIDGE_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse BRIDGE_LOCAL_PORT")?,
            bridge_remote_ip: env!("BRIDGE_REMOTE_IP"),
            bridge_data_port: env!("BRIDGE_DATA_PORT").parse()
                .map_err(|_| "Failed to parse BRIDGE_DATA_PORT")?,
            bridge_event_port: env!("BRIDGE_EVENT_PORT").parse()
                .map_err(|_| "Failed to parse BRIDGE_EVENT_PORT")?,
            bridge_buffer_size: env!("BRIDGE_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse BRIDGE_BUFFER_SIZE")?,
            auto_start: env!("BRIDGE_AUTO_START").parse()
                .map_err(|_| "Failed to parse BRIDGE_AUTO_START")?,
        })
    }

    /// 以配置默认值构造一次推流的参数，控制命令中的字段随后覆盖这些值
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            card: self.card,
            device: self.device,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_rate: self.bit_rate,
            aot: self.aot,
            period_size: self.period_size,
            period_count: self.period_count,
            enable_localization: self.localization_enabled,
            localization_config_path: self.localization_config_path.clone(),
            gate_low_confidence: self.gate_low_confidence,
            ..StreamerConfig::default()
        }
    }
}
