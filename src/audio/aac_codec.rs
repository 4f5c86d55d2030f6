//! AAC encoder with ADTS framing.
//!
//! The codec session produces raw AAC access units; every non-empty unit is
//! prefixed here with a 7-byte ADTS header (MPEG-4, no CRC, AAC-LC profile).

use anyhow::{Context, Result, bail};

pub const ADTS_HEADER_LEN: usize = 7;

/// Largest raw access unit accepted from a codec session.
const MAX_AU_BYTES: usize = 6144;

/// AAC-LC audio object type.
pub const AOT_AAC_LC: u8 = 2;

/// Parameters used to open a codec session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub bit_rate: u32,
    pub aot: u8,
}

/// An open block-based AAC encoder.
pub trait CodecSession: Send {
    /// Samples per channel consumed by one `encode_raw` call.
    fn frame_length(&self) -> usize;

    /// Encode one block into raw AAC bytes, returning how many bytes were
    /// written. Zero means the codec is still buffering.
    fn encode_raw(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;
}

pub trait CodecBackend: Send + Sync {
    fn open(&self, params: &CodecParams) -> Result<Box<dyn CodecSession>>;
}

const SAMPLE_RATES: [u32; 12] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
];

/// ADTS sampling frequency index; unknown rates map to the 48 kHz entry.
pub fn sample_rate_index(sample_rate: u32) -> u8 {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(3) as u8
}

/// Build the ADTS header for a raw payload of `aac_length` bytes.
pub fn adts_header(aac_length: usize, sample_rate: u32, channels: u32) -> [u8; ADTS_HEADER_LEN] {
    const PROFILE_LC: u8 = 1;
    let sf_index = sample_rate_index(sample_rate);
    let channels = channels as u8;
    let frame_len = aac_length + ADTS_HEADER_LEN;

    [
        0xFF,
        0xF1, // MPEG-4, layer 0, protection absent
        (PROFILE_LC << 6) | (sf_index << 2) | ((channels & 0x4) >> 2),
        ((channels & 0x3) << 6) | ((frame_len >> 11) & 0x03) as u8,
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x7) << 5) as u8) | 0x1F, // buffer fullness 0x7FF (VBR)
        0xFC,                                    // one raw data block
    ]
}

pub struct Encoder {
    session: Option<Box<dyn CodecSession>>,
    frame_samples_per_ch: usize,
    sample_rate: u32,
    channels: u32,
    raw_buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            session: None,
            frame_samples_per_ch: 1024,
            sample_rate: 16000,
            channels: 1,
            raw_buf: vec![0u8; MAX_AU_BYTES],
        }
    }

    /// Open a codec session; any previous session is closed first.
    pub fn init(
        &mut self,
        backend: &dyn CodecBackend,
        sample_rate: u32,
        channels: u32,
        bit_rate: u32,
        aot: u8,
    ) -> Result<()> {
        self.close();

        let params = CodecParams {
            sample_rate,
            channels,
            bit_rate,
            aot: if aot == 0 { AOT_AAC_LC } else { aot },
        };
        let session = backend
            .open(&params)
            .with_context(|| format!("Failed to open AAC encoder with {:?}", params))?;

        self.frame_samples_per_ch = session.frame_length();
        if self.frame_samples_per_ch == 0 {
            bail!("AAC encoder reported a zero frame length");
        }
        self.session = Some(session);
        self.sample_rate = sample_rate;
        self.channels = channels;

        log::info!(
            "AAC encoder ready: rate={}, ch={}, bitrate={}, aot={}, frame={}",
            sample_rate,
            channels,
            bit_rate,
            params.aot,
            self.frame_samples_per_ch,
        );
        Ok(())
    }

    /// Samples per channel expected by each `encode` call.
    pub fn frame_samples_per_ch(&self) -> usize {
        self.frame_samples_per_ch
    }

    /// Encode exactly one block of `frame_samples_per_ch() * channels` samples.
    ///
    /// `out` is cleared and then holds one ADTS frame, or stays empty while
    /// the codec is still buffering.
    pub fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            bail!("AAC encoder is not initialized");
        };

        out.clear();
        let n = session
            .encode_raw(pcm, &mut self.raw_buf)
            .context("AAC encode failed")?;
        if n == 0 {
            return Ok(());
        }
        if n > self.raw_buf.len() {
            bail!("AAC encoder reported {} bytes for a {} byte buffer", n, self.raw_buf.len());
        }

        out.reserve(ADTS_HEADER_LEN + n);
        out.extend_from_slice(&adts_header(n, self.sample_rate, self.channels));
        out.extend_from_slice(&self.raw_buf[..n]);
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn close(&mut self) {
        if self.session.take().is_some() {
            log::info!("AAC encoder closed");
        }
    }

    #[allow(dead_code)]
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }
}
