use crate::bus::{Bus, BusMessage};
use crate::config::Config;
use crate::persistence::wav::append_alaw_frame;
use crate::protocol::{parse_stream, LogEvent, RecvBuffer};
use crate::utils::unix_now;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rolling ingress buffer size. A single record can never legitimately come
/// close to this; filling it without consuming a byte is fatal.
const INGRESS_BUFFER_LEN: usize = 4096;

/// The Ingestor: owns the UDP ingress socket, drives the frame parser over
/// the rolling buffer and publishes every decoded record on the bus.
pub struct Collector {
    config: Arc<Config>,
    bus: Bus,
    socket: UdpSocket,
}

impl Collector {
    pub async fn bind(config: Arc<Config>, bus: Bus) -> Result<Self> {
        let addr = config.collector.bind_addr()?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("bind ingress socket {}", addr))?;
        info!(%addr, "collector listening for log server stream");
        Ok(Self {
            config,
            bus,
            socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut buffer = RecvBuffer::with_capacity(INGRESS_BUFFER_LEN);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(buffer.spare()) => {
                    let n = match received {
                        Ok((n, _peer)) => n,
                        Err(err) => {
                            error!(%err, "ingress receive failed");
                            continue;
                        }
                    };
                    if n == 0 {
                        warn!("empty ingress datagram ignored");
                        continue;
                    }
                    buffer.commit(n);
                    self.drain_buffer(&mut buffer)?;
                }
            }
        }
        info!("collector stopped");
        Ok(())
    }

    fn drain_buffer(&self, buffer: &mut RecvBuffer) -> Result<()> {
        let (events, consumed) = parse_stream(buffer.filled(), unix_now());
        if consumed == 0 && buffer.is_full() {
            anyhow::bail!(
                "ingress buffer overflow: a single record exceeds {} bytes",
                INGRESS_BUFFER_LEN
            );
        }
        for parsed in events {
            if self.config.collector.wav_mirror_enabled() {
                if let (LogEvent::Voice(header), Some(payload)) = (&parsed.event, &parsed.voice) {
                    let path = PathBuf::from(&self.config.runtime.work_path)
                        .join(format!("voice_{}.wav", header.call_id));
                    if let Err(err) = append_alaw_frame(&path, payload) {
                        warn!(%err, call_id = header.call_id, "wav mirror write failed");
                    }
                }
            }
            debug!(topic = %parsed.event.topic(), "publishing record");
            self.bus.publish(BusMessage {
                topic: parsed.event.topic(),
                timestamp: parsed.timestamp,
                event: parsed.event,
                voice: parsed.voice,
            });
        }
        buffer.consume(consumed);
        Ok(())
    }
}
