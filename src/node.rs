//! Microphone node: turns start/stop commands into streaming sessions.
//!
//! Commands are handled on a dedicated control thread so that opening the
//! device and joining the audio threads never block the async bridges.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};

use crate::audio::{
    AdtsPacket, CaptureBackend, CodecBackend, LocalizationResult, MicrophoneAdtsStreamer,
    StreamControl, StreamerConfig,
};

/// Start or stop request with the codec parameters to use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    pub start: bool,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_rate: u32,
    pub aot: u8,
}

/// Where the node publishes stream events. Called from the audio threads.
pub trait StreamSink: Send + Sync {
    fn publish_control(&self, control: &StreamControl);
    fn publish_data(&self, packet: &AdtsPacket);
    fn publish_localization(&self, result: &LocalizationResult);
}

pub struct MicrophoneNode {
    commands: Sender<ControlCommand>,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl MicrophoneNode {
    /// Spawn the control thread. `base` supplies card, device, period and
    /// localization settings; each START overrides the codec parameters.
    pub fn spawn(
        base: StreamerConfig,
        capture: Arc<dyn CaptureBackend>,
        codec: Arc<dyn CodecBackend>,
        sink: Arc<dyn StreamSink>,
    ) -> Result<Self> {
        let (commands, command_rx) = unbounded();
        let (shutdown, shutdown_rx) = bounded::<()>(0);

        let mut worker = ControlWorker {
            base,
            capture,
            codec,
            sink,
            streamer: None,
        };
        let handle = thread::Builder::new()
            .name("mic-control".into())
            .spawn(move || worker.run(command_rx, shutdown_rx))?;

        log::info!("MicrophoneNode running");
        Ok(Self {
            commands,
            shutdown: Some(shutdown),
            worker: Some(handle),
        })
    }

    pub fn send(&self, cmd: ControlCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow!("MicrophoneNode control thread has exited"))
    }

    /// Stop any running stream and the control thread.
    pub fn shutdown(&mut self) {
        drop(self.shutdown.take());
        if let Some(h) = self.worker.take() {
            if h.join().is_err() {
                log::error!("MicrophoneNode control thread panicked");
            }
            log::info!("MicrophoneNode stopped");
        }
    }
}

impl Drop for MicrophoneNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ControlWorker {
    base: StreamerConfig,
    capture: Arc<dyn CaptureBackend>,
    codec: Arc<dyn CodecBackend>,
    sink: Arc<dyn StreamSink>,
    streamer: Option<MicrophoneAdtsStreamer>,
}

impl ControlWorker {
    fn run(&mut self, commands: Receiver<ControlCommand>, shutdown: Receiver<()>) {
        loop {
            let cmd = select! {
                recv(shutdown) -> _ => break,
                recv(commands) -> msg => match msg {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            if cmd.start {
                log::info!("Received START command");
                self.start_stream(&cmd);
            } else {
                log::info!("Received STOP command");
                self.stop_stream();
            }
        }
        self.stop_stream();
    }

    fn start_stream(&mut self, cmd: &ControlCommand) {
        if self.streamer.as_ref().is_some_and(|s| s.is_running()) {
            log::info!("Stream already running, ignoring start");
            return;
        }
        // 设备或编码错误后会话已结束，先回收
        self.stop_stream();

        let mut streamer = MicrophoneAdtsStreamer::new(self.capture.clone(), self.codec.clone());
        let sink = self.sink.clone();
        streamer.on_control(move |c| {
            log::info!(
                "stream {}, sr={}, ch={}, br={}, aot={}",
                if c.is_start { "start" } else { "stop" },
                c.sample_rate,
                c.channels,
                c.bit_rate,
                c.aot,
            );
            sink.publish_control(&c);
        });
        let sink = self.sink.clone();
        streamer.on_data(move |p| sink.publish_data(&p));
        let sink = self.sink.clone();
        streamer.on_localization(move |r| sink.publish_localization(&r));

        let cfg = StreamerConfig {
            sample_rate: cmd.sample_rate,
            channels: cmd.channels,
            bit_rate: cmd.bit_rate,
            aot: cmd.aot,
            ..self.base.clone()
        };
        match streamer.start(&cfg) {
            Ok(()) => self.streamer = Some(streamer),
            Err(e) => log::error!("Start stream failed: {:#}", e),
        }
    }

    fn stop_stream(&mut self) {
        if let Some(mut streamer) = self.streamer.take() {
            streamer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{FakeCodec, ScriptedCapture};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSink {
        control: Mutex<Vec<StreamControl>>,
        packets: Mutex<usize>,
    }

    impl StreamSink for RecordingSink {
        fn publish_control(&self, control: &StreamControl) {
            self.control.lock().unwrap().push(*control);
        }
        fn publish_data(&self, _packet: &AdtsPacket) {
            *self.packets.lock().unwrap() += 1;
        }
        fn publish_localization(&self, _result: &LocalizationResult) {}
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn command(start: bool) -> ControlCommand {
        ControlCommand {
            start,
            sample_rate: 16000,
            channels: 1,
            bit_rate: 32000,
            aot: 2,
        }
    }

    fn node_with(capture: ScriptedCapture, codec: FakeCodec) -> (MicrophoneNode, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let base = StreamerConfig {
            period_size: 256,
            ..StreamerConfig::default()
        };
        let node = MicrophoneNode::spawn(base, Arc::new(capture), Arc::new(codec), sink.clone())
            .unwrap();
        (node, sink)
    }

    #[test]
    fn start_stop_cycle_publishes_events() {
        let capture = ScriptedCapture::endless(vec![0; 256], Duration::from_millis(1));
        let (mut node, sink) = node_with(capture, FakeCodec::new(256));

        node.send(command(true)).unwrap();
        wait_for("packets", || *sink.packets.lock().unwrap() > 2);
        // duplicate start is ignored
        node.send(command(true)).unwrap();
        node.send(command(false)).unwrap();
        wait_for("stop event", || sink.control.lock().unwrap().len() == 2);

        let control = sink.control.lock().unwrap().clone();
        assert!(control[0].is_start);
        assert_eq!(control[0].bit_rate, 32000);
        assert!(!control[1].is_start);

        node.shutdown();
        node.shutdown();
        assert_eq!(sink.control.lock().unwrap().len(), 2);
    }

    #[test]
    fn shutdown_stops_running_stream() {
        let capture = ScriptedCapture::endless(vec![0; 256], Duration::from_millis(1));
        let (mut node, sink) = node_with(capture, FakeCodec::new(256));

        node.send(command(true)).unwrap();
        wait_for("start event", || sink.control.lock().unwrap().len() == 1);
        node.shutdown();

        let control = sink.control.lock().unwrap();
        assert_eq!(control.len(), 2);
        assert!(!control[1].is_start);
        assert!(node.send(command(true)).is_err());
    }

    #[test]
    fn failed_start_allows_retry() {
        let capture = ScriptedCapture::endless(vec![0; 256], Duration::from_millis(1));
        let (mut node, sink) = node_with(capture, FakeCodec::new(256).failing_open());

        node.send(command(true)).unwrap();
        node.send(command(true)).unwrap();
        node.send(command(false)).unwrap();
        node.shutdown();
        assert!(sink.control.lock().unwrap().is_empty());
    }

    #[test]
    fn start_after_device_loss_restarts() {
        // two periods, then the device disappears
        let capture = ScriptedCapture::from_periods(vec![vec![0; 256], vec![0; 256]]);
        let (mut node, sink) = node_with(capture, FakeCodec::new(256));

        node.send(command(true)).unwrap();
        wait_for("two packets", || *sink.packets.lock().unwrap() == 2);
        // let the capture thread hit the end of the script
        thread::sleep(Duration::from_millis(100));
        node.send(command(true)).unwrap();
        // reaping the dead session emits its stop, the new one starts and
        // ends immediately on the exhausted device
        wait_for("restart", || sink.control.lock().unwrap().len() == 3);
        node.shutdown();

        let starts = sink
            .control
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_start)
            .count();
        assert_eq!(starts, 2);
    }
}
