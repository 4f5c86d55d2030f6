//! In-memory capture and codec backends for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};

use super::aac_codec::{CodecBackend, CodecParams, CodecSession};
use super::capture::{CaptureBackend, PcmParams, PcmStream};

/// Plays back scripted interleaved periods, then fails like a removed device.
///
/// Built with `endless`, one period repeats forever at a fixed pace. Clones
/// share the script and the open bookkeeping.
#[derive(Clone)]
pub struct ScriptedCapture {
    periods: Arc<Mutex<VecDeque<Vec<i16>>>>,
    endless: Option<(Vec<i16>, Duration)>,
    opened: Arc<Mutex<Option<PcmParams>>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedCapture {
    pub fn from_periods(periods: Vec<Vec<i16>>) -> Self {
        Self {
            periods: Arc::new(Mutex::new(periods.into())),
            endless: None,
            opened: Arc::new(Mutex::new(None)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Repeat `period` forever, sleeping `pace` before each read.
    pub fn endless(period: Vec<i16>, pace: Duration) -> Self {
        Self {
            periods: Arc::new(Mutex::new(VecDeque::new())),
            endless: Some((period, pace)),
            opened: Arc::new(Mutex::new(None)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `count` periods of `frames` frames where channel `c` of frame `i`
    /// holds `f(period, i, c)`.
    pub fn generated(
        count: usize,
        frames: usize,
        channels: usize,
        f: impl Fn(usize, usize, usize) -> i16,
    ) -> Self {
        let periods = (0..count)
            .map(|p| {
                let mut buf = Vec::with_capacity(frames * channels);
                for i in 0..frames {
                    for c in 0..channels {
                        buf.push(f(p, i, c));
                    }
                }
                buf
            })
            .collect();
        Self::from_periods(periods)
    }

    /// Parameters of the most recent open.
    pub fn opened_params(&self) -> Option<PcmParams> {
        *self.opened.lock().unwrap()
    }

    /// Streams opened and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for ScriptedCapture {
    fn open(&self, _card: u32, _device: u32, params: &PcmParams) -> Result<Box<dyn PcmStream>> {
        *self.opened.lock().unwrap() = Some(*params);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            periods: self.periods.clone(),
            endless: self.endless.clone(),
            live: self.live.clone(),
        }))
    }
}

struct ScriptedStream {
    periods: Arc<Mutex<VecDeque<Vec<i16>>>>,
    endless: Option<(Vec<i16>, Duration)>,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PcmStream for ScriptedStream {
    fn read_interleaved(&mut self, buf: &mut [i16]) -> Result<()> {
        let next = self.periods.lock().unwrap().pop_front();
        let period = match (next, &self.endless) {
            (Some(p), _) => p,
            (None, Some((p, pace))) => {
                thread::sleep(*pace);
                p.clone()
            }
            (None, None) => bail!("scripted capture exhausted"),
        };
        buf.fill(0);
        let n = period.len().min(buf.len());
        buf[..n].copy_from_slice(&period[..n]);
        Ok(())
    }
}

#[derive(Default)]
struct FakeCodecState {
    opened: Option<CodecParams>,
    calls: usize,
}

/// Codec returning a fixed-size payload per block after `priming` empty blocks.
#[derive(Clone)]
pub struct FakeCodec {
    frame_len: usize,
    priming: usize,
    fail_after: Option<usize>,
    fail_open: bool,
    state: Arc<Mutex<FakeCodecState>>,
}

impl FakeCodec {
    pub const PAYLOAD_LEN: usize = 16;

    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            priming: 0,
            fail_after: None,
            fail_open: false,
            state: Arc::new(Mutex::new(FakeCodecState::default())),
        }
    }

    pub fn with_priming(mut self, blocks: usize) -> Self {
        self.priming = blocks;
        self
    }

    /// Fail every encode call after `blocks` successful ones.
    pub fn fail_after(mut self, blocks: usize) -> Self {
        self.fail_after = Some(blocks);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opened_params(&self) -> Option<CodecParams> {
        self.state.lock().unwrap().opened
    }

    pub fn encode_calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

impl CodecBackend for FakeCodec {
    fn open(&self, params: &CodecParams) -> Result<Box<dyn CodecSession>> {
        if self.fail_open {
            bail!("fake codec refused {:?}", params);
        }
        self.state.lock().unwrap().opened = Some(*params);
        Ok(Box::new(FakeSession {
            codec: self.clone(),
            channels: params.channels as usize,
        }))
    }
}

struct FakeSession {
    codec: FakeCodec,
    channels: usize,
}

impl CodecSession for FakeSession {
    fn frame_length(&self) -> usize {
        self.codec.frame_len
    }

    fn encode_raw(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        if pcm.len() != self.codec.frame_len * self.channels {
            bail!("fake codec got {} samples", pcm.len());
        }
        let mut state = self.codec.state.lock().unwrap();
        if let Some(limit) = self.codec.fail_after {
            if state.calls >= limit {
                bail!("fake codec failure");
            }
        }
        state.calls += 1;
        if state.calls <= self.codec.priming {
            return Ok(0);
        }
        out[..FakeCodec::PAYLOAD_LEN].fill(state.calls as u8);
        Ok(FakeCodec::PAYLOAD_LEN)
    }
}
