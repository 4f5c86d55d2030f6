//! ALSA PCM capture backend.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, bail};

use super::capture::{CaptureBackend, PcmParams, PcmStream, fill_period};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Captures from `hw:<card>,<device>`.
pub struct AlsaCapture;

impl CaptureBackend for AlsaCapture {
    fn open(&self, card: u32, device: u32, params: &PcmParams) -> Result<Box<dyn PcmStream>> {
        let name = format!("hw:{},{}", card, device);
        let (pcm, actual) = open_capture(&name, params)?;

        if actual.sample_rate != params.rate || actual.channels != params.channels {
            bail!(
                "Device '{}' not ready for {} Hz / {} ch (got {} Hz / {} ch)",
                name,
                params.rate,
                params.channels,
                actual.sample_rate,
                actual.channels,
            );
        }
        if actual.period_size != params.period_size {
            log::warn!(
                "ALSA period size {} differs from requested {}, reads stay at {} frames",
                actual.period_size,
                params.period_size,
                params.period_size,
            );
        }

        Ok(Box::new(AlsaPcmStream {
            pcm,
            channels: actual.channels as usize,
        }))
    }
}

struct AlsaPcmStream {
    pcm: PCM,
    channels: usize,
}

impl PcmStream for AlsaPcmStream {
    fn read_interleaved(&mut self, buf: &mut [i16]) -> Result<()> {
        let pcm = &self.pcm;
        let io = pcm.io_i16()?;
        // overrun (EPIPE) / suspend are recovered by snd_pcm_recover; anything else is fatal
        fill_period(
            buf,
            self.channels,
            |chunk| io.readi(chunk),
            |e| pcm.try_recover(e, true).context("Failed to recover PCM capture"),
        )?;
        Ok(())
    }
}

/// Open a PCM device for capture (recording) with a fixed period layout.
pub fn open_capture(device: &str, params: &PcmParams) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Capture", device))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(params.channels)?;
        hwp.set_rate_near(params.rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(params.period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(
            (params.period_size * params.period_count as usize) as alsa::pcm::Frames,
        )?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let actual = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    log::info!(
        "ALSA Capture: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        device,
        actual.sample_rate,
        actual.channels,
        actual.period_size,
        actual.buffer_size,
    );

    Ok((pcm, actual))
}
