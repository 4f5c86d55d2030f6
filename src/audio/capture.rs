//! Period-based blocking PCM capture with gain and saturation.
//!
//! `DeviceCapture` owns at most one open stream from a [`CaptureBackend`].
//! The stream is released on `close()`, on reopen and on drop.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

/// Fixed-period configuration requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcmParams {
    pub rate: u32,
    pub channels: u32,
    /// Frames per read.
    pub period_size: usize,
    pub period_count: u32,
}

/// An open capture stream delivering S16 interleaved samples.
pub trait PcmStream: Send {
    /// Block until `buf` holds exactly one period (`period_size * channels` samples).
    fn read_interleaved(&mut self, buf: &mut [i16]) -> Result<()>;
}

/// Opens capture streams on a card/device pair.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, card: u32, device: u32, params: &PcmParams) -> Result<Box<dyn PcmStream>>;
}

/// Capture parameters for multi-channel reads.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per period.
    pub frame_size: usize,
    pub channels: u32,
    pub gain: f32,
    pub period_count: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 1024,
            channels: 1,
            gain: 1.0,
            period_count: 4,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            bail!("sample_rate must be positive");
        }
        if !(1..=8).contains(&self.channels) {
            bail!("channels must be within 1..=8, got {}", self.channels);
        }
        if !(self.gain >= 0.0) {
            bail!("gain must be non-negative, got {}", self.gain);
        }
        if self.frame_size == 0 || self.period_count == 0 {
            bail!("period size and count must be positive");
        }
        Ok(())
    }
}

/// Scale by `gain` with round-half-away-from-zero, saturating to the i16 range.
pub fn apply_gain(sample: i16, gain: f32) -> i16 {
    (sample as f32 * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Overruns tolerated within one period before the read is given up.
pub const MAX_RECOVERIES_PER_PERIOD: u32 = 8;

/// Fill `buf` with whole frames from `read`, which returns the frames it got.
///
/// A failed read is handed to `recover` (xrun recovery); reading resumes on
/// success. Returns the number of recoveries performed.
pub fn fill_period<E: Display>(
    buf: &mut [i16],
    channels: usize,
    mut read: impl FnMut(&mut [i16]) -> std::result::Result<usize, E>,
    mut recover: impl FnMut(E) -> Result<()>,
) -> Result<u32> {
    let mut filled = 0;
    let mut recoveries = 0;
    // short reads are normal; keep going until the period is full
    while filled < buf.len() {
        match read(&mut buf[filled..]) {
            Ok(0) => bail!("capture returned no frames"),
            Ok(frames) => filled += frames * channels,
            Err(e) => {
                if recoveries >= MAX_RECOVERIES_PER_PERIOD {
                    bail!("pcm read error after {} recoveries: {}", recoveries, e);
                }
                log::warn!("Capture error: {}, recovering...", e);
                recover(e)?;
                recoveries += 1;
            }
        }
    }
    Ok(recoveries)
}

pub struct DeviceCapture {
    backend: Arc<dyn CaptureBackend>,
    stream: Option<Box<dyn PcmStream>>,
    rate: u32,
    channels: u32,
    period_size: usize,
    period_count: u32,
    gain: f32,
    read_buf: Vec<i16>,
}

impl DeviceCapture {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            stream: None,
            rate: 16000,
            channels: 1,
            period_size: 1024,
            period_count: 4,
            gain: 1.0,
            read_buf: Vec::new(),
        }
    }

    /// Open with unity gain.
    #[allow(dead_code)]
    pub fn open(
        &mut self,
        card: u32,
        device: u32,
        rate: u32,
        channels: u32,
        period_size: usize,
        period_count: u32,
    ) -> Result<()> {
        self.open_multi(
            card,
            device,
            &AudioConfig {
                sample_rate: rate,
                frame_size: period_size,
                channels,
                gain: 1.0,
                period_count,
            },
        )
    }

    /// Open with the period layout and gain taken from `cfg`.
    pub fn open_multi(&mut self, card: u32, device: u32, cfg: &AudioConfig) -> Result<()> {
        self.close();
        cfg.validate().context("Invalid capture configuration")?;

        let params = PcmParams {
            rate: cfg.sample_rate,
            channels: cfg.channels,
            period_size: cfg.frame_size,
            period_count: cfg.period_count,
        };
        let stream = self
            .backend
            .open(card, device, &params)
            .with_context(|| format!("PCM open failed on card {} device {}", card, device))?;

        self.stream = Some(stream);
        self.rate = cfg.sample_rate;
        self.channels = cfg.channels;
        self.period_size = cfg.frame_size;
        self.period_count = cfg.period_count;
        self.gain = cfg.gain;
        self.read_buf = vec![0i16; cfg.frame_size * cfg.channels as usize];

        log::info!(
            "Capture opened: card={}, device={}, rate={}, ch={}, period={}x{}, gain={}",
            card,
            device,
            self.rate,
            self.channels,
            self.period_size,
            self.period_count,
            self.gain,
        );
        Ok(())
    }

    /// Read one period of interleaved samples into `out`.
    #[allow(dead_code)]
    pub fn read_period(&mut self, out: &mut Vec<i16>) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            bail!("capture device is not open");
        };
        out.resize(self.period_size * self.channels as usize, 0);
        stream.read_interleaved(out).context("pcm read error")?;
        if self.gain != 1.0 {
            for s in out.iter_mut() {
                *s = apply_gain(*s, self.gain);
            }
        }
        Ok(())
    }

    /// Read one period and split it into `channels` vectors of `period_size` samples.
    pub fn read_multi_period(&mut self, out: &mut Vec<Vec<i16>>) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            bail!("capture device is not open");
        };
        stream
            .read_interleaved(&mut self.read_buf)
            .context("pcm read error")?;

        let channels = self.channels as usize;
        out.resize_with(channels, Vec::new);
        for ch in out.iter_mut() {
            ch.clear();
            ch.reserve(self.period_size);
        }
        for frame in self.read_buf.chunks_exact(channels) {
            for (dst, &s) in out.iter_mut().zip(frame) {
                dst.push(apply_gain(s, self.gain));
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Capture closed");
        }
    }

    #[allow(dead_code)]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
