//! Capture → AAC/ADTS streaming with optional sound-source localization.
//!
//! Uses std::thread (NOT tokio tasks) for the real-time path:
//!
//! - Producer thread: `DeviceCapture` → shared frame → encode and localize queues
//! - Encoder thread: channel 0 → AAC → ADTS → data callback
//! - Localizer thread (optional): 4 channels → TDOA direction → localization callback

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender, bounded, select};

use super::aac_codec::{AOT_AAC_LC, CodecBackend, Encoder};
use super::capture::{AudioConfig, CaptureBackend, DeviceCapture};
use super::frame_queue::{FrameQueues, FrameReceivers, SharedFrame};
use super::localization::{MicArrayConfig, MicArrayLocalizer, calc_4ch_separate_db};

/// Streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// ALSA card index
    pub card: u32,
    /// ALSA device index
    pub device: u32,
    /// Capture rate when localization is off
    pub sample_rate: u32,
    /// Capture channel count when localization is off
    pub channels: u8,
    /// AAC bitrate in bits/s
    pub bit_rate: u32,
    /// MPEG-4 audio object type (0 selects AAC-LC)
    pub aot: u8,
    /// Frames per period when localization is off
    pub period_size: usize,
    pub period_count: u32,
    /// Capture layout then comes from the mic-array file
    pub enable_localization: bool,
    pub localization_config_path: String,
    /// Depth of each frame queue
    pub max_queue_size: usize,
    /// Drop results below the array's `min_confidence`
    pub gate_low_confidence: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            card: 1,
            device: 0,
            sample_rate: 16000,
            channels: 1,
            bit_rate: 64000,
            aot: AOT_AAC_LC,
            period_size: 1024,
            period_count: 4,
            enable_localization: false,
            localization_config_path: String::new(),
            max_queue_size: 32,
            gate_low_confidence: false,
        }
    }
}

/// Stream start/stop announcement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamControl {
    pub is_start: bool,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_rate: u32,
    pub aot: u8,
}

/// One ADTS frame ready for transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AdtsPacket {
    pub seq: u32,
    pub pts_ms: u64,
    pub frame_count: u16,
    /// ADTS header included
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalizationResult {
    /// Degrees, counter-clockwise from +x
    pub azimuth: f32,
    /// Degrees above the x/y plane
    pub elevation: f32,
    pub confidence: f32,
    /// Per-channel level in dBFS
    pub loudness: [f32; 4],
}

pub type ControlCallback = Arc<dyn Fn(StreamControl) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(AdtsPacket) + Send + Sync>;
pub type LocalizationCallback = Arc<dyn Fn(LocalizationResult) + Send + Sync>;

struct Session {
    producer: Option<JoinHandle<DeviceCapture>>,
    encoder: Option<JoinHandle<Encoder>>,
    localizer: Option<JoinHandle<()>>,
    /// Dropped on stop to wake the consumers
    shutdown: Option<Sender<()>>,
    control: StreamControl,
    announced: bool,
}

/// Owns the capture and codec backends and one streaming session at a time.
pub struct MicrophoneAdtsStreamer {
    capture_backend: Arc<dyn CaptureBackend>,
    codec_backend: Arc<dyn CodecBackend>,
    on_control: Option<ControlCallback>,
    on_data: Option<DataCallback>,
    on_localization: Option<LocalizationCallback>,
    running: Arc<AtomicBool>,
    session: Option<Session>,
}

impl MicrophoneAdtsStreamer {
    pub fn new(
        capture_backend: Arc<dyn CaptureBackend>,
        codec_backend: Arc<dyn CodecBackend>,
    ) -> Self {
        Self {
            capture_backend,
            codec_backend,
            on_control: None,
            on_data: None,
            on_localization: None,
            running: Arc::new(AtomicBool::new(false)),
            session: None,
        }
    }

    pub fn on_control(&mut self, f: impl Fn(StreamControl) + Send + Sync + 'static) {
        self.on_control = Some(Arc::new(f));
    }

    pub fn on_data(&mut self, f: impl Fn(AdtsPacket) + Send + Sync + 'static) {
        self.on_data = Some(Arc::new(f));
    }

    pub fn on_localization(&mut self, f: impl Fn(LocalizationResult) + Send + Sync + 'static) {
        self.on_localization = Some(Arc::new(f));
    }

    /// False once `stop()` was called or the session ended on a device or codec error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open the device and codec and launch the worker threads.
    ///
    /// Fails while a session is running; call `stop()` first.
    pub fn start(&mut self, cfg: &StreamerConfig) -> Result<()> {
        if self.is_running() {
            bail!("streamer is already running");
        }
        // 上一次会话因设备/编码错误结束时，线程仍需回收
        self.stop();

        let (audio, localizer) = resolve_capture(cfg);
        log::info!(
            "Streamer starting: card={}, device={}, rate={}, ch={}, period={}x{}, gain={}, localization={}",
            cfg.card,
            cfg.device,
            audio.sample_rate,
            audio.channels,
            audio.frame_size,
            audio.period_count,
            audio.gain,
            localizer.is_some(),
        );

        let mut capture = DeviceCapture::new(self.capture_backend.clone());
        capture.open_multi(cfg.card, cfg.device, &audio)?;

        // 编码固定单通道
        let mut encoder = Encoder::new();
        encoder.init(
            self.codec_backend.as_ref(),
            audio.sample_rate,
            1,
            cfg.bit_rate,
            cfg.aot,
        )?;

        let control = StreamControl {
            is_start: true,
            sample_rate: audio.sample_rate,
            channels: 1,
            bit_rate: cfg.bit_rate,
            aot: if cfg.aot == 0 { AOT_AAC_LC } else { cfg.aot },
        };

        let (queues, receivers) = FrameQueues::new(cfg.max_queue_size);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        self.running.store(true, Ordering::SeqCst);
        self.session = Some(Session {
            producer: None,
            encoder: None,
            localizer: None,
            shutdown: Some(shutdown_tx),
            control,
            announced: false,
        });

        let gate = cfg.gate_low_confidence;
        if let Err(e) = self.spawn_workers(capture, encoder, localizer, gate, queues, receivers, shutdown_rx) {
            self.stop();
            return Err(e);
        }

        if let Some(session) = self.session.as_mut() {
            session.announced = true;
        }
        if let Some(cb) = &self.on_control {
            cb(control);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_workers(
        &mut self,
        capture: DeviceCapture,
        encoder: Encoder,
        localizer: Option<MicArrayLocalizer>,
        gate_low_confidence: bool,
        queues: FrameQueues,
        receivers: FrameReceivers,
        shutdown: Receiver<()>,
    ) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            bail!("no session to spawn workers for");
        };
        let FrameReceivers { encode, localize } = receivers;
        let localizing = localizer.is_some();

        let producer = {
            let running = self.running.clone();
            thread::Builder::new()
                .name("mic-capture".into())
                .spawn(move || produce(capture, queues, &running, localizing))?
        };
        session.producer = Some(producer);

        let encoder = {
            let running = self.running.clone();
            let shutdown = shutdown.clone();
            let on_data = self.on_data.clone();
            thread::Builder::new()
                .name("mic-encode".into())
                .spawn(move || encode_loop(encoder, encode, shutdown, &running, on_data))?
        };
        session.encoder = Some(encoder);

        if let Some(localizer) = localizer {
            log::info!("Starting localization thread");
            let on_localization = self.on_localization.clone();
            let handle = thread::Builder::new()
                .name("mic-localize".into())
                .spawn(move || {
                    localize_loop(localizer, localize, shutdown, on_localization, gate_low_confidence)
                })?;
            session.localizer = Some(handle);
        }
        Ok(())
    }

    /// Signal the threads to stop, join them and release the device and codec.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(mut session) = self.session.take() else {
            return;
        };

        // 唤醒等待队列的消费者
        drop(session.shutdown.take());

        let capture = join_worker(session.producer.take(), "capture");
        let encoder = join_worker(session.encoder.take(), "encode");
        join_worker(session.localizer.take(), "localize");

        if let Some(mut capture) = capture {
            capture.close();
        }
        if let Some(mut encoder) = encoder {
            encoder.close();
        }

        if session.announced {
            if let Some(cb) = &self.on_control {
                cb(StreamControl {
                    is_start: false,
                    ..session.control
                });
            }
            log::info!("Streamer stopped");
        }
    }
}

impl Drop for MicrophoneAdtsStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture layout for this session, plus the localizer when enabled.
fn resolve_capture(cfg: &StreamerConfig) -> (AudioConfig, Option<MicArrayLocalizer>) {
    if cfg.enable_localization {
        let mic = MicArrayConfig::load(&cfg.localization_config_path);
        let audio = AudioConfig {
            sample_rate: mic.sample_rate,
            frame_size: mic.frame_size,
            channels: mic.channels,
            gain: mic.audio_gain,
            period_count: cfg.period_count,
        };
        (audio, Some(MicArrayLocalizer::new(mic)))
    } else {
        let audio = AudioConfig {
            sample_rate: cfg.sample_rate,
            frame_size: cfg.period_size,
            channels: cfg.channels as u32,
            gain: 1.0,
            period_count: cfg.period_count,
        };
        (audio, None)
    }
}

fn join_worker<T>(handle: Option<JoinHandle<T>>, name: &str) -> Option<T> {
    match handle?.join() {
        Ok(v) => Some(v),
        Err(_) => {
            log::error!("{} thread panicked", name);
            None
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ======================== Producer ========================

fn produce(
    mut capture: DeviceCapture,
    queues: FrameQueues,
    running: &AtomicBool,
    localizing: bool,
) -> DeviceCapture {
    let mut period = Vec::new();
    while running.load(Ordering::SeqCst) {
        if let Err(e) = capture.read_multi_period(&mut period) {
            log::error!("Capture failed, ending session: {:#}", e);
            running.store(false, Ordering::SeqCst);
            break;
        }
        if period.is_empty() {
            continue;
        }

        let (dropped_encode, dropped_localize) = queues.push(std::mem::take(&mut period));
        if dropped_encode > 0 {
            log::debug!("Encode queue full, dropped {} frame(s)", dropped_encode);
        }
        if localizing && dropped_localize > 0 {
            log::debug!("Localize queue full, dropped {} frame(s)", dropped_localize);
        }
    }
    // Dropping `queues` disconnects the consumers once they drain
    capture
}

// ======================== Encoder consumer ========================

/// Sequence and PTS state of one session's ADTS stream.
struct AdtsClock {
    seq: u32,
    base_ms: u64,
    blocks: u64,
    block_ms_num: u64,
    sample_rate: u64,
}

impl AdtsClock {
    fn new(frame_len: usize, sample_rate: u32) -> Self {
        Self {
            seq: 0,
            base_ms: now_ms(),
            blocks: 0,
            block_ms_num: frame_len as u64 * 1000,
            sample_rate: sample_rate.max(1) as u64,
        }
    }

    fn pts_ms(&self) -> u64 {
        self.base_ms + self.blocks * self.block_ms_num / self.sample_rate
    }

    fn packet(&mut self, payload: Vec<u8>) -> AdtsPacket {
        let packet = AdtsPacket {
            seq: self.seq,
            pts_ms: self.pts_ms(),
            frame_count: 1,
            payload,
        };
        self.seq = self.seq.wrapping_add(1);
        packet
    }
}

fn encode_loop(
    mut encoder: Encoder,
    frames: Receiver<SharedFrame>,
    shutdown: Receiver<()>,
    running: &AtomicBool,
    on_data: Option<DataCallback>,
) -> Encoder {
    let frame_len = encoder.frame_samples_per_ch();
    let mut clock = AdtsClock::new(frame_len, encoder.sample_rate());
    let mut mono: Vec<i16> = Vec::with_capacity(frame_len * 2);
    let mut adts = Vec::new();

    loop {
        let frame = select! {
            recv(shutdown) -> _ => break,
            recv(frames) -> msg => match msg {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        let Some(ch0) = frame.first() else {
            continue;
        };
        mono.extend_from_slice(ch0);

        while mono.len() >= frame_len {
            if let Err(e) = encoder.encode(&mono[..frame_len], &mut adts) {
                log::error!("{:#}, ending session", e);
                running.store(false, Ordering::SeqCst);
                return encoder;
            }
            mono.drain(..frame_len);

            if !adts.is_empty() {
                let packet = clock.packet(std::mem::take(&mut adts));
                if let Some(cb) = &on_data {
                    cb(packet);
                }
            }
            clock.blocks += 1;
        }
    }
    encoder
}

// ======================== Localizer consumer ========================

fn localize_loop(
    mut localizer: MicArrayLocalizer,
    frames: Receiver<SharedFrame>,
    shutdown: Receiver<()>,
    on_localization: Option<LocalizationCallback>,
    gate_low_confidence: bool,
) {
    let min_confidence = localizer.config().min_confidence;
    let mut channels: [Vec<f32>; 4] = Default::default();

    loop {
        let frame = select! {
            recv(shutdown) -> _ => break,
            recv(frames) -> msg => match msg {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        let Some(cb) = &on_localization else {
            continue;
        };
        if frame.len() < 4 {
            continue;
        }

        let samples = frame[..4].iter().map(Vec::len).min().unwrap_or(0);
        for (dst, src) in channels.iter_mut().zip(frame.iter()) {
            dst.clear();
            dst.extend(src[..samples].iter().map(|&s| s as f32 / 32768.0));
        }

        let Some(est) = localizer.localize(&channels, samples) else {
            continue;
        };
        if gate_low_confidence && est.confidence < min_confidence {
            log::debug!("Dropping low-confidence direction ({:.2})", est.confidence);
            continue;
        }

        let db = calc_4ch_separate_db(&channels);
        cb(LocalizationResult {
            azimuth: est.azimuth,
            elevation: est.elevation,
            confidence: est.confidence,
            loudness: db.map(|v| v as f32),
        });
    }
}
