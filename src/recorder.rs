//! ADTS file sink for the `record` subcommand.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::audio::{AdtsPacket, LocalizationResult, StreamControl};
use crate::node::StreamSink;

/// Appends every ADTS frame to a file; the result plays as a raw `.aac` stream.
pub struct AdtsFileSink {
    out: Mutex<BufWriter<File>>,
    frames: Mutex<u64>,
}

impl AdtsFileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
            frames: Mutex::new(0),
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn flush(&self) -> Result<()> {
        match self.out.lock() {
            Ok(mut out) => out.flush().context("Failed to flush ADTS file"),
            Err(_) => anyhow::bail!("ADTS writer poisoned"),
        }
    }
}

impl StreamSink for AdtsFileSink {
    fn publish_control(&self, control: &StreamControl) {
        log::info!(
            "Recording {}: {} Hz, {} ch, {} bps",
            if control.is_start { "started" } else { "stopped" },
            control.sample_rate,
            control.channels,
            control.bit_rate,
        );
    }

    fn publish_data(&self, packet: &AdtsPacket) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = out.write_all(&packet.payload) {
            log::error!("Failed to write ADTS frame {}: {}", packet.seq, e);
            return;
        }
        if let Ok(mut n) = self.frames.lock() {
            *n += 1;
        }
    }

    fn publish_localization(&self, result: &LocalizationResult) {
        log::info!(
            "Direction: azimuth={:.1}, elevation={:.1}, confidence={:.2}",
            result.azimuth,
            result.elevation,
            result.confidence,
        );
    }
}
