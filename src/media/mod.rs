pub mod api;
pub mod feeder;

use crate::bus::{Bus, BusMessage, SubscriptionHandle};
use crate::child::{spawn_supervised, ChildFinished};
use crate::config::{Config, FeederKind, PlaybackMode};
use crate::persistence::store::{CallStore, VoiceTable};
use crate::persistence::CallKind;
use crate::protocol::{CallChangeAction, GroupCallAction, LogEvent, StreamOriginator};
use crate::utils::{render_template, unix_now};
use anyhow::{Context, Result};
use api::{parse_request, playback_file_stem, Reply, Request};
use bytes::Bytes;
use feeder::{FeederPool, PlaybackSession, PlayerPool};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A call currently known to be alive, tracked from setup to release.
struct LiveCall {
    kind: CallKind,
    feeder: Option<usize>,
    cached_a: Option<Bytes>,
    cached_b: Option<Bytes>,
    last_activity: u64,
}

impl LiveCall {
    fn new(kind: CallKind) -> Self {
        Self {
            kind,
            feeder: None,
            cached_a: None,
            cached_b: None,
            last_activity: unix_now(),
        }
    }
}

/// One request handed from a connection task to the router loop, with a
/// one-shot lane for the reply.
struct ApiCall {
    request: Result<Request>,
    reply_tx: oneshot::Sender<Reply>,
}

/// The Media Router: tracks live calls from signaling, routes intercepted
/// voice to reserved feeders, and serves the interception/playback
/// request-reply API.
pub struct MediaRouter {
    config: Arc<Config>,
    bus: Bus,
    store: CallStore,
    listener: TcpListener,
    live_calls: HashMap<u32, LiveCall>,
    feeders: FeederPool,
    players: PlayerPool,
    voice_filters: Option<SubscriptionHandle>,
    player_tx: mpsc::UnboundedSender<ChildFinished<usize>>,
    player_rx: Option<mpsc::UnboundedReceiver<ChildFinished<usize>>>,
}

impl MediaRouter {
    pub async fn new(config: Arc<Config>, bus: Bus) -> Result<Self> {
        let store = CallStore::connect(&config.persistence_manager.pg_conn_info).await?;
        let listener = TcpListener::bind(config.media_manager.command_listener_endpoint.as_str())
            .await
            .with_context(|| {
                format!(
                    "bind command listener {}",
                    config.media_manager.command_listener_endpoint
                )
            })?;
        let feeders = FeederPool::from_config(&config.media_manager.feeders).await?;
        let players = PlayerPool::from_config(&config.media_manager.player.instances);
        let (player_tx, player_rx) = mpsc::unbounded_channel();
        info!(
            endpoint = %config.media_manager.command_listener_endpoint,
            feeders = config.media_manager.feeders.len(),
            players = config.media_manager.player.instances.len(),
            "media router ready"
        );
        Ok(Self {
            config,
            bus,
            store,
            listener,
            live_calls: HashMap::new(),
            feeders,
            players,
            voice_filters: None,
            player_tx,
            player_rx: Some(player_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut signaling_sub = self
            .bus
            .subscribe(self.config.media_manager.subscriptions.clone());
        let mut voice_sub = self.bus.subscribe(Vec::<String>::new());
        self.voice_filters = Some(voice_sub.handle());
        let mut player_rx = self.player_rx.take().expect("media router run twice");
        let (api_tx, mut api_rx) = mpsc::channel::<ApiCall>(32);
        let period = Duration::from_secs(self.config.media_manager.maintenance_frequency.max(1));
        let mut maintenance = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!("media router started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(msg) = signaling_sub.recv() => self.handle_signaling(&msg),
                Some(msg) = voice_sub.recv() => self.route_voice(&msg).await,
                Some(call) = api_rx.recv() => {
                    let reply = self.handle_request(call.request).await;
                    call.reply_tx.send(reply).ok();
                }
                Some(done) = player_rx.recv() => self.handle_player_finished(done).await,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "command connection accepted");
                        tokio::spawn(serve_connection(stream, api_tx.clone(), token.child_token()));
                    }
                    Err(err) => error!(%err, "command listener accept failed"),
                },
                _ = maintenance.tick() => self.run_maintenance(),
            }
        }

        for session in self.players.drain_sessions() {
            session.handle.kill();
        }
        self.feeders.release_all();
        info!("media router stopped");
    }

    fn handle_signaling(&mut self, msg: &BusMessage) {
        match &msg.event {
            LogEvent::DuplexCallChange(change) => {
                if change.action == CallChangeAction::NewCallSetup {
                    self.insert_live_call(change.call_id, CallKind::Duplex);
                }
            }
            LogEvent::SimplexCallStartChange(change) => {
                if change.action == CallChangeAction::NewCallSetup {
                    self.insert_live_call(change.call_id, CallKind::Simplex);
                }
            }
            LogEvent::GroupCallStartChange(change) => {
                if change.action == GroupCallAction::NewCallSetup {
                    self.insert_live_call(change.call_id, CallKind::Group);
                }
            }
            LogEvent::DuplexCallRelease(release) | LogEvent::SimplexCallRelease(release) => {
                self.remove_live_call(release.call_id);
            }
            LogEvent::GroupCallRelease(release) => {
                self.remove_live_call(release.call_id);
            }
            _ => {}
        }
    }

    fn insert_live_call(&mut self, call_id: u32, kind: CallKind) {
        debug!(call_id, ?kind, "live call inserted");
        self.live_calls.insert(call_id, LiveCall::new(kind));
    }

    fn remove_live_call(&mut self, call_id: u32) {
        match self.live_calls.remove(&call_id) {
            Some(call) => {
                if let Some(idx) = call.feeder {
                    self.feeders.release(idx);
                }
                if let Some(filters) = &self.voice_filters {
                    filters.remove_filter(&format!("V_{}", call_id));
                }
                debug!(call_id, "live call removed");
            }
            None => error!(call_id, "release for unknown live call"),
        }
    }

    /// Push one intercepted voice frame towards its feeder: verbatim for
    /// mono calls, interleaved A/B pairing for duplex.
    async fn route_voice(&mut self, msg: &BusMessage) {
        let (header, payload) = match (&msg.event, &msg.voice) {
            (LogEvent::Voice(header), Some(payload)) => (header, payload),
            _ => return,
        };
        let call = match self.live_calls.get_mut(&header.call_id) {
            Some(call) => call,
            None => {
                error!(call_id = header.call_id, "voice for unknown live call");
                return;
            }
        };
        call.last_activity = unix_now();
        let feeder_idx = match call.feeder {
            Some(idx) => idx,
            None => {
                error!(call_id = header.call_id, "no feeder reserved for intercepted call");
                return;
            }
        };

        let outgoing: Option<Vec<u8>> = if call.kind == CallKind::Duplex {
            match header.originator {
                StreamOriginator::ASub => call.cached_a = Some(payload.clone()),
                StreamOriginator::BSub if call.cached_a.is_some() => {
                    call.cached_b = Some(payload.clone())
                }
                _ => {
                    debug!(call_id = header.call_id, "B frame without cached A frame dropped");
                    return;
                }
            }
            match (&call.cached_a, &call.cached_b) {
                (Some(a), Some(b)) => {
                    let merged = interleave(a, b);
                    call.cached_a = None;
                    call.cached_b = None;
                    Some(merged)
                }
                _ => None,
            }
        } else {
            Some(payload.to_vec())
        };

        if let Some(buf) = outgoing {
            if let Some(feeder) = self.feeders.get(feeder_idx) {
                if let Err(err) = feeder.forward(&buf).await {
                    error!(%err, call_id = header.call_id, "feeder forward failed");
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Result<Request>) -> Reply {
        let request = match request {
            Ok(request) => request,
            Err(err) => return Reply::nok(format!("Bad request: {}", err)),
        };
        debug!(?request, "api request");
        match request {
            Request::GetActiveCalls => {
                let mut ids: Vec<u32> = self.live_calls.keys().copied().collect();
                ids.sort_unstable();
                let mut parts = vec![ids.len().to_string()];
                parts.extend(ids.iter().map(|id| id.to_string()));
                Reply::ok(parts)
            }
            Request::StartCallInterception { call_id, format } => {
                self.start_interception(call_id, &format)
            }
            Request::StopCallInterception { call_id } => self.stop_interception(call_id),
            Request::StartPlayCall {
                call_db_id,
                call_id,
                call_type,
                format,
                session,
            } => match self.config.media_manager.playback_mode {
                PlaybackMode::Static => {
                    self.start_play_static(call_db_id, call_id, &call_type, &format, &session)
                        .await
                }
                PlaybackMode::Player => {
                    self.start_play_player(call_db_id, call_id, &call_type, &format)
                        .await
                }
            },
            Request::StopPlayCall {
                call_db_id,
                call_id,
                format,
                session,
                ..
            } => match self.config.media_manager.playback_mode {
                PlaybackMode::Static => {
                    self.stop_play_static(call_db_id, call_id, &format, &session).await
                }
                PlaybackMode::Player => self.stop_play_player(call_db_id, call_id).await,
            },
        }
    }

    fn start_interception(&mut self, call_id: u32, format: &str) -> Reply {
        let endpoint = self.config.media_manager.media_server_endpoint.clone();
        let call = match self.live_calls.get_mut(&call_id) {
            Some(call) => call,
            None => return Reply::nok(format!("Call <{}> not found", call_id)),
        };
        if let Some(idx) = call.feeder {
            // Already intercepted: hand back the same stream URL.
            let stream = self.feeders.get(idx).map(|f| f.stream.clone()).unwrap_or_default();
            return Reply::ok([format!("{}/{}.{}", endpoint, stream, format)]);
        }
        let wanted = match call.kind {
            CallKind::Duplex => FeederKind::Stereo,
            _ => FeederKind::Mono,
        };
        match self.feeders.reserve(wanted) {
            Some(idx) => {
                call.feeder = Some(idx);
                if let Some(filters) = &self.voice_filters {
                    filters.add_filter(format!("V_{}", call_id));
                }
                let stream = self.feeders.get(idx).map(|f| f.stream.clone()).unwrap_or_default();
                info!(call_id, %stream, "interception started");
                Reply::ok([format!("{}/{}.{}", endpoint, stream, format)])
            }
            None => {
                error!(call_id, "no compatible free feeder");
                Reply::nok("Feeder not available")
            }
        }
    }

    fn stop_interception(&mut self, call_id: u32) -> Reply {
        let call = match self.live_calls.get_mut(&call_id) {
            Some(call) => call,
            None => return Reply::nok(format!("Call <{}> not found", call_id)),
        };
        match call.feeder.take() {
            Some(idx) => {
                call.cached_a = None;
                call.cached_b = None;
                self.feeders.release(idx);
                if let Some(filters) = &self.voice_filters {
                    filters.remove_filter(&format!("V_{}", call_id));
                }
                info!(call_id, "interception stopped");
                Reply::ok_simple()
            }
            None => Reply::nok(format!("Call <{}> not intercepted", call_id)),
        }
    }

    /// v2 playback: materialize the blob under its hashed name and let the
    /// external static server do the streaming.
    async fn start_play_static(
        &self,
        call_db_id: i64,
        call_id: u32,
        call_type: &str,
        format: &str,
        session: &str,
    ) -> Reply {
        let table = match VoiceTable::from_api_tag(call_type) {
            Some(table) => table,
            None => {
                error!(call_type, "no tables for call type");
                return Reply::nok(format!("Call <{}> not found", call_id));
            }
        };
        let blob = match self.store.fetch_voice_blob(table, call_db_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Reply::nok(format!("Call <{}> not found", call_id)),
            Err(err) => {
                error!(%err, call_db_id, "voice blob fetch failed");
                return Reply::nok(format!("Call <{}> not found", call_id));
            }
        };
        let stem = playback_file_stem(call_db_id, call_id, session);
        let path = self.playback_path(&stem, format);
        if let Err(err) = tokio::fs::write(&path, &blob).await {
            error!(%err, path = %path.display(), "unable to materialize recording");
            return Reply::nok(format!("Call <{}> not found", call_id));
        }
        info!(call_db_id, call_id, path = %path.display(), "playback file materialized");
        Reply::ok([format!(
            "/{}/{}.{}",
            self.config.media_manager.player.voicerec_url, stem, format
        )])
    }

    async fn stop_play_static(
        &self,
        call_db_id: i64,
        call_id: u32,
        format: &str,
        session: &str,
    ) -> Reply {
        let stem = playback_file_stem(call_db_id, call_id, session);
        let path = self.playback_path(&stem, format);
        debug!(path = %path.display(), "removing playback file");
        tokio::fs::remove_file(&path).await.ok();
        Reply::ok_simple()
    }

    /// v1 playback: bind a free player slot and stream the file through its
    /// child process.
    async fn start_play_player(
        &mut self,
        call_db_id: i64,
        call_id: u32,
        call_type: &str,
        format: &str,
    ) -> Reply {
        let table = match VoiceTable::from_api_tag(call_type) {
            Some(table) => table,
            None => {
                error!(call_type, "no tables for call type");
                return Reply::nok(format!("Call <{}> not found", call_id));
            }
        };
        let slot_idx = match self.players.find_free() {
            Some(idx) => idx,
            None => return Reply::nok("Player unavailable"),
        };
        let blob = match self.store.fetch_voice_blob(table, call_db_id).await {
            Ok(Some(blob)) => blob,
            _ => return Reply::nok(format!("Call <{}> not found", call_id)),
        };

        let (stream, feeder_name) = {
            let slot = self.players.get(slot_idx).expect("slot index");
            (slot.stream.clone(), slot.feeder.clone())
        };
        let file = render_template(
            &self.config.media_manager.player.filename_template,
            &[
                &call_db_id.to_string(),
                &call_id.to_string(),
                &feeder_name,
                format,
            ],
        );
        if let Err(err) = tokio::fs::write(&file, &blob).await {
            error!(%err, file, "unable to materialize playback file");
            return Reply::nok(format!("Call <{}> not found", call_id));
        }
        let command = render_template(
            &self.config.media_manager.player.command_template,
            &[&file, &feeder_name, &stream],
        );
        match spawn_supervised(&command, slot_idx, self.player_tx.clone()) {
            Ok(handle) => {
                if let Some(slot) = self.players.get_mut(slot_idx) {
                    slot.session = Some(PlaybackSession {
                        call_id,
                        call_db_id,
                        file: PathBuf::from(&file),
                        handle,
                    });
                }
                info!(call_id, %stream, "player started");
                Reply::ok([format!(
                    "{}/{}.{}",
                    self.config.media_manager.media_server_endpoint, stream, format
                )])
            }
            Err(err) => {
                error!(%err, "player child could not be started");
                tokio::fs::remove_file(&file).await.ok();
                Reply::nok("Player unavailable")
            }
        }
    }

    async fn stop_play_player(&mut self, call_db_id: i64, call_id: u32) -> Reply {
        let slot_idx = match self.players.find_by_call(call_id, call_db_id) {
            Some(idx) => idx,
            None => return Reply::nok("Call player not found"),
        };
        if let Some(session) = self
            .players
            .get_mut(slot_idx)
            .and_then(|slot| slot.session.as_mut())
        {
            session.handle.stop().await;
            tokio::fs::remove_file(&session.file).await.ok();
        }
        Reply::ok_simple()
    }

    async fn handle_player_finished(&mut self, done: ChildFinished<usize>) {
        if let Some(slot) = self.players.get_mut(done.tag) {
            if let Some(session) = slot.session.take() {
                info!(
                    call_id = session.call_id,
                    stream = %slot.stream,
                    success = done.success,
                    "player finished, slot released"
                );
                tokio::fs::remove_file(&session.file).await.ok();
            }
        }
    }

    fn playback_path(&self, stem: &str, format: &str) -> PathBuf {
        PathBuf::from(&self.config.media_manager.player.voicerec_repo)
            .join(format!("{}.{}", stem, format))
    }

    fn run_maintenance(&mut self) {
        let now = unix_now();
        let inactivity = self.config.media_manager.call_inactivity_period;
        let expired: Vec<u32> = self
            .live_calls
            .iter()
            .filter(|(_, call)| now.saturating_sub(call.last_activity) > inactivity)
            .map(|(&id, _)| id)
            .collect();
        for call_id in expired {
            warn!(call_id, "live call inactive beyond threshold, removing");
            self.remove_live_call(call_id);
        }
    }
}

/// Interleave two equal-length half-duplex buffers sample by sample
/// (A0,B0,A1,B1,…). Pairing is defined for equal lengths; a shorter buffer
/// truncates the pair.
fn interleave(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().min(b.len());
    let mut out = Vec::with_capacity(len * 2);
    for i in 0..len {
        out.push(a[i]);
        out.push(b[i]);
    }
    out
}

/// One command connection: requests are groups of lines terminated by an
/// empty line, each answered in order by the router loop.
async fn serve_connection(
    stream: TcpStream,
    api_tx: mpsc::Sender<ApiCall>,
    token: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let mut parts: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.is_empty() => break,
                    Ok(Some(line)) => parts.push(line),
                    _ => return,
                },
            }
        }
        if parts.is_empty() {
            continue;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = ApiCall {
            request: parse_request(&parts),
            reply_tx,
        };
        if api_tx.send(call).await.is_err() {
            return;
        }
        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => return,
        };
        if write_half.write_all(reply.encode().as_bytes()).await.is_err() {
            return;
        }
    }
}
