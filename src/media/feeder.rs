use crate::child::ChildHandle;
use crate::config::{FeederConfig, FeederKind, PlayerInstanceConfig};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tracing::debug;

/// A reserved UDP sink towards one media-server input channel. The socket is
/// created at startup and outlives any number of intercepted calls; only the
/// reservation flag toggles.
pub struct Feeder {
    pub stream: String,
    pub kind: FeederKind,
    pub reserved: bool,
    dest: SocketAddr,
    socket: UdpSocket,
}

impl Feeder {
    pub async fn from_config(config: &FeederConfig) -> Result<Self> {
        let dest: SocketAddr = format!("{}:{}", config.ip, config.port)
            .parse()
            .with_context(|| format!("feeder {} destination", config.stream))?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .with_context(|| format!("feeder {} socket", config.stream))?;
        Ok(Self {
            stream: config.stream.clone(),
            kind: config.kind,
            reserved: false,
            dest,
            socket,
        })
    }

    /// Push one raw A-law buffer (480 B mono, 960 B interleaved stereo) to
    /// the media server. No headers on the wire.
    pub async fn forward(&self, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, self.dest)
            .await
            .with_context(|| format!("feeder {} send", self.stream))?;
        Ok(())
    }
}

/// The fixed feeder pool declared by configuration.
pub struct FeederPool {
    feeders: Vec<Feeder>,
}

impl FeederPool {
    pub async fn from_config(configs: &[FeederConfig]) -> Result<Self> {
        let mut feeders = Vec::with_capacity(configs.len());
        for config in configs {
            feeders.push(Feeder::from_config(config).await?);
        }
        Ok(Self { feeders })
    }

    /// Reserve the first free feeder of the requested kind.
    pub fn reserve(&mut self, kind: FeederKind) -> Option<usize> {
        let idx = self
            .feeders
            .iter()
            .position(|f| !f.reserved && f.kind == kind)?;
        self.feeders[idx].reserved = true;
        debug!(stream = %self.feeders[idx].stream, "feeder reserved");
        Some(idx)
    }

    pub fn release(&mut self, idx: usize) {
        if let Some(feeder) = self.feeders.get_mut(idx) {
            feeder.reserved = false;
            debug!(stream = %feeder.stream, "feeder released");
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Feeder> {
        self.feeders.get(idx)
    }

    pub fn release_all(&mut self) {
        for feeder in &mut self.feeders {
            feeder.reserved = false;
        }
    }
}

/// A playback session bound to a legacy player slot.
pub struct PlaybackSession {
    pub call_id: u32,
    pub call_db_id: i64,
    pub file: PathBuf,
    pub handle: ChildHandle,
}

/// One legacy player slot: a media-server stream plus the feeder its child
/// process writes into. The child exists only while a playback runs.
pub struct PlayerSlot {
    pub stream: String,
    pub feeder: String,
    pub session: Option<PlaybackSession>,
}

impl PlayerSlot {
    pub fn is_free(&self) -> bool {
        self.session.is_none()
    }
}

/// The fixed player pool declared by configuration.
pub struct PlayerPool {
    slots: Vec<PlayerSlot>,
}

impl PlayerPool {
    pub fn from_config(configs: &[PlayerInstanceConfig]) -> Self {
        Self {
            slots: configs
                .iter()
                .map(|c| PlayerSlot {
                    stream: c.stream.clone(),
                    feeder: c.feeder.clone(),
                    session: None,
                })
                .collect(),
        }
    }

    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    pub fn find_by_call(&self, call_id: u32, call_db_id: i64) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.session
                .as_ref()
                .map(|p| p.call_id == call_id && p.call_db_id == call_db_id)
                .unwrap_or(false)
        })
    }

    pub fn get(&self, idx: usize) -> Option<&PlayerSlot> {
        self.slots.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PlayerSlot> {
        self.slots.get_mut(idx)
    }

    pub fn drain_sessions(&mut self) -> Vec<PlaybackSession> {
        self.slots.iter_mut().filter_map(|s| s.session.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feeder_config(stream: &str, port: u16, kind: FeederKind) -> FeederConfig {
        FeederConfig {
            stream: stream.to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            kind,
        }
    }

    #[tokio::test]
    async fn reservation_honors_feeder_kind() {
        let mut pool = FeederPool::from_config(&[
            feeder_config("m1", 7001, FeederKind::Mono),
            feeder_config("m2", 7002, FeederKind::Mono),
            feeder_config("s1", 7003, FeederKind::Stereo),
        ])
        .await
        .unwrap();

        let first = pool.reserve(FeederKind::Mono).unwrap();
        let second = pool.reserve(FeederKind::Mono).unwrap();
        assert_ne!(first, second);
        // Both mono feeders taken, a third mono request starves even though
        // the stereo feeder is free.
        assert!(pool.reserve(FeederKind::Mono).is_none());
        assert!(pool.reserve(FeederKind::Stereo).is_some());

        pool.release(first);
        assert_eq!(pool.reserve(FeederKind::Mono), Some(first));
    }

    #[tokio::test]
    async fn forwarded_payload_arrives_verbatim() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let feeder = Feeder::from_config(&feeder_config("m1", port, FeederKind::Mono))
            .await
            .unwrap();

        let payload = vec![0x5au8; 480];
        feeder.forward(&payload).await.unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], payload.as_slice());
    }

    #[test]
    fn player_pool_tracks_busy_slots() {
        let pool = PlayerPool::from_config(&[
            PlayerInstanceConfig {
                stream: "p1".to_string(),
                feeder: "m1".to_string(),
            },
            PlayerInstanceConfig {
                stream: "p2".to_string(),
                feeder: "m2".to_string(),
            },
        ]);
        assert_eq!(pool.find_free(), Some(0));
        assert_eq!(pool.find_by_call(1, 1), None);
    }
}
