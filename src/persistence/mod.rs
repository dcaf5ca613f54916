pub mod store;
pub mod wav;

use crate::alarm::AlarmSender;
use crate::bus::{Bus, BusMessage, Subscription};
use crate::child::{spawn_supervised, ChildFinished, ChildHandle};
use crate::config::Config;
use crate::protocol::{LogEvent, StreamOriginator, VoiceHeader};
use crate::utils::{render_template, unix_now};
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{CallStore, VoiceTable};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a call id maps to while voice for it is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Duplex,
    Simplex,
    Group,
}

impl CallKind {
    pub fn channels(self) -> u16 {
        match self {
            CallKind::Duplex => 2,
            _ => 1,
        }
    }

    pub fn voice_table(self) -> VoiceTable {
        match self {
            CallKind::Group => VoiceTable::Group,
            _ => VoiceTable::Individual,
        }
    }
}

/// Per-call voice assembly state: ordered A-law chunks per stream plus the
/// inactivity clock.
struct VoiceCall {
    kind: CallKind,
    stream_a: Vec<Bytes>,
    stream_b: Vec<Bytes>,
    last_activity: u64,
}

impl VoiceCall {
    fn new(kind: CallKind) -> Self {
        Self {
            kind,
            stream_a: Vec::new(),
            stream_b: Vec::new(),
            last_activity: unix_now(),
        }
    }
}

/// An MP3 conversion in flight: everything needed to finish the voice row
/// once the encoder child reports back.
struct PendingEncode {
    kind: CallKind,
    call_id: u32,
    wav_path: PathBuf,
    mp3_path: PathBuf,
    duration: String,
    handle: ChildHandle,
}

/// The Persister worker: subscribes to signaling and voice, maintains the
/// per-call state machine and writes call rows and voice recordings.
pub struct Persister {
    config: Arc<Config>,
    bus: Bus,
    store: CallStore,
    alarm: AlarmSender,
    calls: HashMap<u32, VoiceCall>,
    pending_encodes: HashMap<u32, PendingEncode>,
    encoder_tx: mpsc::UnboundedSender<ChildFinished<u32>>,
    encoder_rx: Option<mpsc::UnboundedReceiver<ChildFinished<u32>>>,
}

impl Persister {
    pub async fn new(config: Arc<Config>, bus: Bus, alarm: AlarmSender) -> Result<Self> {
        let store = CallStore::connect(&config.persistence_manager.pg_conn_info).await?;
        let (encoder_tx, encoder_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            bus,
            store,
            alarm,
            calls: HashMap::new(),
            pending_encodes: HashMap::new(),
            encoder_tx,
            encoder_rx: Some(encoder_rx),
        })
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut subscription: Subscription = self
            .bus
            .subscribe(self.config.persistence_manager.subscriptions.clone());
        let mut encoder_rx = self.encoder_rx.take().expect("persister run twice");
        let period = Duration::from_secs(self.config.persistence_manager.maintenance_frequency.max(1));
        let mut maintenance = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!("persister started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(msg) = subscription.recv() => self.handle_message(&msg).await,
                Some(done) = encoder_rx.recv() => self.handle_encoder_finished(done).await,
                _ = maintenance.tick() => self.run_maintenance().await,
            }
        }

        for (_, pending) in self.pending_encodes.drain() {
            pending.handle.kill();
        }
        info!("persister stopped");
    }

    async fn handle_message(&mut self, msg: &BusMessage) {
        let ts = msg.timestamp;
        match &msg.event {
            LogEvent::KeepAlive(ka) => {
                self.report(self.store.save_keep_alive(ts, ka).await);
            }
            LogEvent::DuplexCallChange(change) => {
                if change.action == crate::protocol::CallChangeAction::NewCallSetup {
                    self.report(self.store.save_indi_call_setup(ts, change, true).await);
                    self.open_call(change.call_id, CallKind::Duplex);
                } else {
                    self.report(self.store.save_indi_call_change(ts, change).await);
                }
            }
            LogEvent::SimplexCallStartChange(change) => {
                if change.action == crate::protocol::CallChangeAction::NewCallSetup {
                    self.report(self.store.save_indi_call_setup(ts, change, false).await);
                    self.open_call(change.call_id, CallKind::Simplex);
                } else {
                    self.report(self.store.save_indi_call_change(ts, change).await);
                }
            }
            LogEvent::DuplexCallRelease(release) | LogEvent::SimplexCallRelease(release) => {
                self.report(self.store.save_indi_call_release(ts, release).await);
                self.finalize_call(release.call_id).await;
            }
            LogEvent::SimplexCallPttChange(ptt) => {
                self.report(self.store.save_simplex_ptt(ts, ptt).await);
            }
            LogEvent::GroupCallStartChange(change) => {
                if change.action == crate::protocol::GroupCallAction::NewCallSetup {
                    self.report(self.store.save_group_call_setup(ts, change).await);
                    self.open_call(change.call_id, CallKind::Group);
                } else {
                    self.report(self.store.save_group_call_change(ts, change).await);
                }
            }
            LogEvent::GroupCallPttActive(ptt) => {
                self.report(self.store.save_group_ptt_active(ts, ptt).await);
            }
            LogEvent::GroupCallPttIdle(ptt) => {
                self.report(self.store.save_group_ptt_idle(ts, ptt).await);
            }
            LogEvent::GroupCallRelease(release) => {
                self.report(self.store.save_group_call_release(ts, release).await);
                self.finalize_call(release.call_id).await;
            }
            LogEvent::StatusSds(sds) => {
                self.report(self.store.save_status_sds(ts, sds).await);
            }
            LogEvent::TextSds(sds) => {
                self.report(self.store.save_text_sds(ts, sds).await);
            }
            LogEvent::Voice(header) => {
                if let Some(payload) = &msg.voice {
                    self.buffer_voice(header, payload.clone());
                }
            }
        }
    }

    fn open_call(&mut self, call_id: u32, kind: CallKind) {
        debug!(call_id, ?kind, "call setup, voice buffers allocated");
        if self.calls.insert(call_id, VoiceCall::new(kind)).is_some() {
            warn!(call_id, "call setup repeated, previous voice buffers discarded");
        }
    }

    fn buffer_voice(&mut self, header: &VoiceHeader, payload: Bytes) {
        let call = match self.calls.get_mut(&header.call_id) {
            Some(call) => call,
            None => {
                error!(
                    call_id = header.call_id,
                    "protocol error: voice received without a preceding call setup"
                );
                return;
            }
        };
        if call.kind == CallKind::Duplex && header.originator == StreamOriginator::BSub {
            call.stream_b.push(payload);
        } else {
            call.stream_a.push(payload);
        }
        call.last_activity = unix_now();
    }

    /// Materialize the recording of a released or expired call and write its
    /// voice row. The in-memory entry is destroyed either way.
    async fn finalize_call(&mut self, call_id: u32) {
        let call = match self.calls.remove(&call_id) {
            Some(call) => call,
            None => {
                error!(call_id, "no voice buffers found for call");
                return;
            }
        };

        let data = assemble_recording(&call);
        let channels = call.kind.channels();
        let duration = wav::format_duration(wav::duration_seconds(data.len() as u64, channels));
        debug!(
            call_id,
            bytes = data.len(),
            %duration,
            "finalizing voice recording"
        );

        let table = call.kind.voice_table();
        let call_row = match self.store.find_call_row(table, call_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                error!(call_id, "no call row found, voice recording dropped");
                return;
            }
            Err(err) => {
                error!(call_id, %err, "call row lookup failed, voice recording dropped");
                self.alarm.send("persister", "Unable to record voice call");
                return;
            }
        };

        if self.config.basic.mp3_enabled() {
            self.start_mp3_encode(call.kind, call_id, channels, data, duration)
                .await;
        } else {
            let header = wav::alaw_header(channels, data.len() as u32);
            let mut blob = Vec::with_capacity(header.len() + data.len());
            blob.extend_from_slice(&header);
            blob.extend_from_slice(&data);
            let res = self
                .store
                .save_voice_recording(table, &call_row, blob, duration)
                .await;
            self.report(res);
        }
    }

    /// Write the WAV to the working directory and hand it to the external
    /// encoder; the voice row is written when the child reports completion.
    async fn start_mp3_encode(
        &mut self,
        kind: CallKind,
        call_id: u32,
        channels: u16,
        data: Vec<u8>,
        duration: String,
    ) {
        let work = &self.config.runtime.work_path;
        let wav_path = PathBuf::from(work).join(format!("voice_{}.wav", call_id));
        let mp3_path = PathBuf::from(work).join(format!("voice_{}.mp3", call_id));
        let label = format!("voice_{}", call_id);

        let header = wav::alaw_header(channels, data.len() as u32);
        let mut contents = Vec::with_capacity(header.len() + data.len());
        contents.extend_from_slice(&header);
        contents.extend_from_slice(&data);
        if let Err(err) = tokio::fs::write(&wav_path, &contents).await {
            error!(call_id, %err, "unable to stage wav for conversion");
            return;
        }

        let command = render_template(
            &self.config.persistence_manager.mp3_converter_command_template,
            &[
                &wav_path.to_string_lossy(),
                &mp3_path.to_string_lossy(),
                &label,
            ],
        );
        match spawn_supervised(&command, call_id, self.encoder_tx.clone()) {
            Ok(handle) => {
                self.pending_encodes.insert(
                    call_id,
                    PendingEncode {
                        kind,
                        call_id,
                        wav_path,
                        mp3_path,
                        duration,
                        handle,
                    },
                );
            }
            Err(err) => {
                error!(call_id, %err, "mp3 converter could not be started");
                tokio::fs::remove_file(&wav_path).await.ok();
            }
        }
    }

    async fn handle_encoder_finished(&mut self, done: ChildFinished<u32>) {
        let pending = match self.pending_encodes.remove(&done.tag) {
            Some(pending) => pending,
            None => return,
        };
        if done.success {
            match tokio::fs::read(&pending.mp3_path).await {
                Ok(blob) => {
                    let table = pending.kind.voice_table();
                    match self.store.find_call_row(table, pending.call_id).await {
                        Ok(Some(row)) => {
                            let res = self
                                .store
                                .save_voice_recording(table, &row, blob, pending.duration.clone())
                                .await;
                            self.report(res);
                        }
                        other => {
                            error!(call_id = pending.call_id, ?other, "call row lost, mp3 dropped");
                        }
                    }
                }
                Err(err) => {
                    error!(call_id = pending.call_id, %err, "converted mp3 unreadable");
                }
            }
        } else {
            error!(call_id = pending.call_id, "mp3 converter failed, recording left unsaved");
        }
        tokio::fs::remove_file(&pending.wav_path).await.ok();
        tokio::fs::remove_file(&pending.mp3_path).await.ok();
    }

    /// Expire calls whose last voice activity predates the inactivity
    /// window; expiry finalizes exactly like a release, minus the call-row
    /// update only a release event can provide.
    async fn run_maintenance(&mut self) {
        let now = unix_now();
        let inactivity = self.config.persistence_manager.call_inactivity_period;
        let expired: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| now.saturating_sub(call.last_activity) > inactivity)
            .map(|(&id, _)| id)
            .collect();
        for call_id in expired {
            warn!(call_id, "call inactive beyond threshold, finalizing");
            self.finalize_call(call_id).await;
        }
    }

    fn report(&self, res: Result<()>) {
        if let Err(err) = res {
            error!(%err, "storage statement failed");
            self.alarm.send("persister", "Unable to record voice call");
        }
    }
}

/// Flatten the buffered streams into the stored payload: plain
/// concatenation for mono calls, sample-by-sample interleave of paired
/// chunks for duplex. Chunks without a counterpart are discarded.
fn assemble_recording(call: &VoiceCall) -> Vec<u8> {
    match call.kind {
        CallKind::Duplex => {
            if call.stream_a.len() != call.stream_b.len() {
                warn!(
                    a = call.stream_a.len(),
                    b = call.stream_b.len(),
                    "duplex streams uneven, chunks without counterpart discarded"
                );
            }
            let pairs = call.stream_a.len().min(call.stream_b.len());
            let mut out = Vec::with_capacity(pairs * 2 * crate::protocol::ALAW_FRAME_LEN);
            for (a, b) in call.stream_a.iter().zip(call.stream_b.iter()).take(pairs) {
                let len = a.len().min(b.len());
                for i in 0..len {
                    out.push(a[i]);
                    out.push(b[i]);
                }
            }
            out
        }
        _ => {
            let total: usize = call.stream_a.iter().map(|c| c.len()).sum();
            let mut out = Vec::with_capacity(total);
            for chunk in &call.stream_a {
                out.extend_from_slice(chunk);
            }
            out
        }
    }
}
