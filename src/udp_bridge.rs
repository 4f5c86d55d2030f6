use crate::audio::{AdtsPacket, LocalizationResult, StreamControl};
use crate::config::Config;
use crate::node::StreamSink;
use crate::protocol::{self, ControlMessage};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub struct UdpBridge {
    socket: Arc<UdpSocket>,
    data_addr: String,
    event_addr: String,
    tx: mpsc::Sender<ControlMessage>,
    buffer_size: usize,
}

impl UdpBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<ControlMessage>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!(
            "{}:{}",
            config.bridge_local_ip, config.bridge_local_port
        ))
        .await?;
        let data_addr = format!("{}:{}", config.bridge_remote_ip, config.bridge_data_port);
        let event_addr = format!("{}:{}", config.bridge_remote_ip, config.bridge_event_port);

        Ok(Self {
            socket: Arc::new(socket),
            data_addr,
            event_addr,
            tx,
            buffer_size: config.bridge_buffer_size,
        })
    }

    /// Receive JSON control messages until the consumer goes away.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            match serde_json::from_slice::<ControlMessage>(&buf[..len]) {
                Ok(msg) => {
                    if self.tx.send(msg).await.is_err() {
                        log::warn!("Control receiver dropped, bridge exiting");
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring malformed control message from {}: {}", from, e),
            }
        }
        Ok(())
    }

    pub async fn send_data(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(datagram, &self.data_addr).await?;
        Ok(())
    }

    pub async fn send_event(&self, msg: &str) -> anyhow::Result<()> {
        self.socket.send_to(msg.as_bytes(), &self.event_addr).await?;
        Ok(())
    }

    /// Forward everything the sink queued until all senders are dropped.
    pub async fn forward(&self, mut rx: mpsc::Receiver<Outbound>) {
        while let Some(out) = rx.recv().await {
            let res = match &out {
                Outbound::Data(datagram) => self.send_data(datagram).await,
                Outbound::Event(json) => self.send_event(json).await,
            };
            if let Err(e) = res {
                log::warn!("UDP send failed: {}", e);
            }
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Data(Vec<u8>),
    Event(String),
}

/// `StreamSink` that hands events to the async bridge without blocking the
/// audio threads. Full queue means the event is dropped.
pub struct UdpSink {
    tx: mpsc::Sender<Outbound>,
}

impl UdpSink {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    fn push(&self, out: Outbound) {
        if let Err(e) = self.tx.try_send(out) {
            log::warn!("Dropping outbound message: {}", e);
        }
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl StreamSink for UdpSink {
    fn publish_control(&self, control: &StreamControl) {
        match protocol::stream_control_event(control, timestamp_ms()) {
            Ok(json) => self.push(Outbound::Event(json)),
            Err(e) => log::error!("Failed to encode stream_control: {}", e),
        }
    }

    fn publish_data(&self, packet: &AdtsPacket) {
        self.push(Outbound::Data(protocol::adts_datagram(packet)));
    }

    fn publish_localization(&self, result: &LocalizationResult) {
        match protocol::sound_localization_event(result, timestamp_ms()) {
            Ok(json) => self.push(Outbound::Event(json)),
            Err(e) => log::error!("Failed to encode sound_localization: {}", e),
        }
    }
}
