use crate::bus::{Bus, BusMessage};
use crate::config::Config;
use crate::protocol::{LogEvent, Party, SIGNALING_SIGNATURE, VOICE_SIGNATURE};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Fan-out of newline-terminated JSON lines to every connected client, the
/// external face of the tracer.
pub struct LinePublisher {
    listener: TcpListener,
    tx: broadcast::Sender<String>,
}

impl LinePublisher {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind json publisher {}", addr))?;
        let (tx, _) = broadcast::channel(1024);
        info!(%addr, "json publisher listening");
        Ok(Self { listener, tx })
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (mut stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(%err, "json publisher accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "json subscriber connected");
                    let mut rx = self.tx.subscribe();
                    let client_token = token.child_token();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = client_token.cancelled() => break,
                                line = rx.recv() => match line {
                                    Ok(mut line) => {
                                        line.push('\n');
                                        if stream.write_all(line.as_bytes()).await.is_err() {
                                            break;
                                        }
                                    }
                                    // A lagged client just misses lines.
                                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                    Err(broadcast::error::RecvError::Closed) => break,
                                },
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Counts voice frames and opens the JSON gate once the counter exceeds the
/// configured divisor. A divisor of zero publishes every frame.
struct VoiceRateGate {
    counter: u32,
    every: u32,
}

impl VoiceRateGate {
    fn new(every: u32) -> Self {
        Self { counter: 0, every }
    }

    fn tick(&mut self) -> bool {
        self.counter += 1;
        if self.counter > self.every {
            self.counter = 0;
            true
        } else {
            false
        }
    }
}

/// The Tracer worker: renders every subscribed event as a pipe-delimited
/// line (local tracing) and a JSON object (external publisher), with voice
/// JSON rate reduction.
pub struct Tracer {
    config: Arc<Config>,
    bus: Bus,
    publisher: Option<LinePublisher>,
}

impl Tracer {
    pub async fn new(config: Arc<Config>, bus: Bus) -> Result<Self> {
        let publisher = LinePublisher::bind(&config.tracer_manager.json_publisher).await?;
        Ok(Self {
            config,
            bus,
            publisher: Some(publisher),
        })
    }

    pub fn publisher_addr(&self) -> Result<std::net::SocketAddr> {
        self.publisher
            .as_ref()
            .expect("tracer already running")
            .local_addr()
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut subscription = self
            .bus
            .subscribe(self.config.tracer_manager.subscriptions.clone());
        let publisher = self.publisher.take().expect("tracer run twice");
        let json_tx = publisher.sender();
        tokio::spawn(publisher.run(token.child_token()));

        let mut gate = VoiceRateGate::new(self.config.tracer_manager.publish_one_json_voice_msg_every);
        info!("tracer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(msg) = subscription.recv() => {
                    self.trace_message(&msg, &mut gate, &json_tx);
                }
            }
        }
        info!("tracer stopped");
    }

    fn trace_message(&self, msg: &BusMessage, gate: &mut VoiceRateGate, json_tx: &broadcast::Sender<String>) {
        // The delimited line is always produced for local tracing.
        debug!(target: "callstream::trace", "{}", delimited_line(msg.timestamp, &msg.event));
        let publish = match msg.event {
            LogEvent::Voice(_) => gate.tick(),
            _ => true,
        };
        if publish {
            json_tx.send(json_line(msg.timestamp, &msg.event).to_string()).ok();
        }
    }
}

fn party_fields(line: &mut String, party: &Party) {
    line.push_str(&format!(
        "{}|{}|{}|{}|{}|",
        party.tsi.mnc, party.tsi.mcc, party.tsi.ssi, party.number, party.descr
    ));
}

/// Flat pipe-delimited rendering, one line per event.
pub fn delimited_line(ts: u64, event: &LogEvent) -> String {
    let mut line = match event {
        LogEvent::Voice(_) => format!("|V|{}|{:x}|", ts, VOICE_SIGNATURE),
        other => {
            let header = header_of(other);
            format!(
                "|S|{}|{:x}|{}|{}|{:x}|",
                ts, SIGNALING_SIGNATURE, header.0, header.1, header.2
            )
        }
    };
    match event {
        LogEvent::KeepAlive(ka) => {
            line.push_str(&format!(
                "KEEP_ALIVE|{}|{}|{}|{}|{}|",
                ka.log_server_no, ka.timeout, ka.sw_ver, ka.sw_ver_string, ka.descr
            ));
        }
        LogEvent::DuplexCallChange(c) | LogEvent::SimplexCallStartChange(c) => {
            let label = if matches!(event, LogEvent::DuplexCallChange(_)) {
                "DUPLEX_CALL_CHANGE"
            } else {
                "SIMPLEX_CALL_START_CHANGE"
            };
            line.push_str(&format!(
                "{}|{}|{}|{}|{}|",
                label,
                c.call_id,
                c.action as u8,
                c.action.label(),
                c.timeout
            ));
            party_fields(&mut line, &c.a_party);
            party_fields(&mut line, &c.b_party);
        }
        LogEvent::DuplexCallRelease(r) | LogEvent::SimplexCallRelease(r) => {
            let label = if matches!(event, LogEvent::DuplexCallRelease(_)) {
                "DUPLEX_CALL_RELEASE"
            } else {
                "SIMPLEX_CALL_RELEASE"
            };
            line.push_str(&format!(
                "{}|{}|{}|{}|",
                label,
                r.call_id,
                r.cause as u8,
                r.cause.label()
            ));
        }
        LogEvent::SimplexCallPttChange(p) => {
            line.push_str(&format!(
                "SIMPLEX_CALL_PTT_CHANGE|{}|{}|{}|",
                p.call_id,
                p.talking_party as u8,
                p.talking_party.label()
            ));
        }
        LogEvent::GroupCallStartChange(c) => {
            line.push_str(&format!(
                "GROUP_CALL_START_CHANGE|{}|{}|{}|{}|",
                c.call_id,
                c.action as u8,
                c.action.label(),
                c.timeout
            ));
            party_fields(&mut line, &c.group);
        }
        LogEvent::GroupCallPttActive(p) => {
            line.push_str(&format!("GROUP_CALL_PTT_ACTIVE|{}|", p.call_id));
            party_fields(&mut line, &p.talking_party);
        }
        LogEvent::GroupCallPttIdle(p) => {
            line.push_str(&format!("GROUP_CALL_PTT_IDLE|{}|", p.call_id));
        }
        LogEvent::GroupCallRelease(r) => {
            line.push_str(&format!(
                "GROUP_CALL_RELEASE|{}|{}|{}|",
                r.call_id,
                r.cause as u8,
                r.cause.label()
            ));
        }
        LogEvent::StatusSds(s) => {
            line.push_str("SDS_STATUS|");
            party_fields(&mut line, &s.a_party);
            party_fields(&mut line, &s.b_party);
            line.push_str(&format!("{}|", s.status_value));
        }
        LogEvent::TextSds(s) => {
            line.push_str("SDS_TEXT|");
            party_fields(&mut line, &s.a_party);
            party_fields(&mut line, &s.b_party);
            line.push_str(&format!("{}|", s.text));
        }
        LogEvent::Voice(v) => {
            line.push_str(&format!(
                "VOICE|{}|{}|{}|{}|{}|{}|{}|{}|",
                v.api_version,
                v.originator as u8,
                v.originating_node,
                v.call_id,
                v.source_and_index,
                v.stream_random_id,
                v.packet_seq,
                v.payload1_kind
            ));
        }
    }
    line
}

fn party_json(prefix: &str, party: &Party) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(format!("{}_mnc", prefix), json!(party.tsi.mnc));
    map.insert(format!("{}_mcc", prefix), json!(party.tsi.mcc));
    map.insert(format!("{}_ssi", prefix), json!(party.tsi.ssi));
    map.insert(format!("{}_number", prefix), json!(party.number));
    map.insert(format!("{}_descr", prefix), json!(party.descr));
    Value::Object(map)
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
    base
}

/// JSON rendering with the same field set as the delimited line plus a
/// message-type tag.
pub fn json_line(ts: u64, event: &LogEvent) -> Value {
    let base = match event {
        LogEvent::Voice(_) => json!({
            "type": "V",
            "timestamp": ts,
            "signature": format!("{:x}", VOICE_SIGNATURE),
        }),
        other => {
            let header = header_of(other);
            json!({
                "type": "S",
                "timestamp": ts,
                "signature": format!("{:x}", SIGNALING_SIGNATURE),
                "sequence": header.0,
                "api_version": header.1,
                "msg_id": format!("{:x}", header.2),
            })
        }
    };
    let body = match event {
        LogEvent::KeepAlive(ka) => json!({
            "message_type": "KEEP_ALIVE",
            "log_server_no": ka.log_server_no,
            "timeout": ka.timeout,
            "sw_ver": ka.sw_ver,
            "sw_ver_string": ka.sw_ver_string,
            "descr": ka.descr,
        }),
        LogEvent::DuplexCallChange(c) | LogEvent::SimplexCallStartChange(c) => {
            let label = if matches!(event, LogEvent::DuplexCallChange(_)) {
                "DUPLEX_CALL_CHANGE"
            } else {
                "SIMPLEX_CALL_START_CHANGE"
            };
            let body = json!({
                "message_type": label,
                "call_id": c.call_id,
                "action": c.action as u8,
                "action_label": c.action.label(),
                "timeout": c.timeout,
            });
            merge(
                merge(body, party_json("a", &c.a_party)),
                party_json("b", &c.b_party),
            )
        }
        LogEvent::DuplexCallRelease(r) | LogEvent::SimplexCallRelease(r) => {
            let label = if matches!(event, LogEvent::DuplexCallRelease(_)) {
                "DUPLEX_CALL_RELEASE"
            } else {
                "SIMPLEX_CALL_RELEASE"
            };
            json!({
                "message_type": label,
                "call_id": r.call_id,
                "release_cause": r.cause as u8,
                "release_cause_label": r.cause.label(),
            })
        }
        LogEvent::SimplexCallPttChange(p) => json!({
            "message_type": "SIMPLEX_CALL_PTT_CHANGE",
            "call_id": p.call_id,
            "talking_party": p.talking_party as u8,
            "talking_party_label": p.talking_party.label(),
        }),
        LogEvent::GroupCallStartChange(c) => merge(
            json!({
                "message_type": "GROUP_CALL_START_CHANGE",
                "call_id": c.call_id,
                "action": c.action as u8,
                "action_label": c.action.label(),
                "timeout": c.timeout,
            }),
            party_json("group", &c.group),
        ),
        LogEvent::GroupCallPttActive(p) => merge(
            json!({
                "message_type": "GROUP_CALL_PTT_ACTIVE",
                "call_id": p.call_id,
            }),
            party_json("tp", &p.talking_party),
        ),
        LogEvent::GroupCallPttIdle(p) => json!({
            "message_type": "GROUP_CALL_PTT_IDLE",
            "call_id": p.call_id,
        }),
        LogEvent::GroupCallRelease(r) => json!({
            "message_type": "GROUP_CALL_RELEASE",
            "call_id": r.call_id,
            "release_cause": r.cause as u8,
            "release_cause_label": r.cause.label(),
        }),
        LogEvent::StatusSds(s) => merge(
            merge(
                json!({
                    "message_type": "SDS_STATUS",
                    "precoded_status_value": s.status_value,
                }),
                party_json("a", &s.a_party),
            ),
            party_json("b", &s.b_party),
        ),
        LogEvent::TextSds(s) => merge(
            merge(
                json!({
                    "message_type": "SDS_TEXT",
                    "user_data_length": s.text.len(),
                    "user_data": s.text,
                }),
                party_json("a", &s.a_party),
            ),
            party_json("b", &s.b_party),
        ),
        LogEvent::Voice(v) => json!({
            "message_type": "VOICE",
            "api_version": v.api_version,
            "originator": v.originator as u8,
            "originating_node": v.originating_node,
            "call_id": v.call_id,
            "source_and_index": v.source_and_index,
            "stream_random_id": v.stream_random_id,
            "packet_seq": v.packet_seq,
            "payload1_kind": v.payload1_kind,
        }),
    };
    merge(base, body)
}

fn header_of(event: &LogEvent) -> (u16, u8, u8) {
    let header = match event {
        LogEvent::KeepAlive(e) => &e.header,
        LogEvent::DuplexCallChange(e) | LogEvent::SimplexCallStartChange(e) => &e.header,
        LogEvent::DuplexCallRelease(e) | LogEvent::SimplexCallRelease(e) => &e.header,
        LogEvent::SimplexCallPttChange(e) => &e.header,
        LogEvent::GroupCallStartChange(e) => &e.header,
        LogEvent::GroupCallPttActive(e) => &e.header,
        LogEvent::GroupCallPttIdle(e) => &e.header,
        LogEvent::GroupCallRelease(e) => &e.header,
        LogEvent::StatusSds(e) => &e.header,
        LogEvent::TextSds(e) => &e.header,
        LogEvent::Voice(_) => unreachable!("voice records carry no signaling header"),
    };
    (header.sequence, header.api_version, header.msg_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    fn keep_alive() -> LogEvent {
        LogEvent::KeepAlive(KeepAlive {
            header: MessageHeader {
                sequence: 12,
                api_version: 1,
                msg_id: MSG_KEEP_ALIVE,
            },
            log_server_no: 7,
            timeout: 30,
            sw_ver: "7.60".to_string(),
            sw_ver_string: "7.60.1".to_string(),
            descr: "logserver".to_string(),
        })
    }

    fn voice(call_id: u32) -> LogEvent {
        LogEvent::Voice(VoiceHeader {
            api_version: 1,
            originator: StreamOriginator::ASub,
            originating_node: 3,
            call_id,
            source_and_index: 0,
            stream_random_id: 9,
            packet_seq: 4,
            payload1_kind: PAYLOAD_G711_ALAW,
            payload2_kind: 0,
        })
    }

    #[test]
    fn delimited_keep_alive_line() {
        let line = delimited_line(1700000000, &keep_alive());
        assert_eq!(
            line,
            "|S|1700000000|31474f4c|12|1|1|KEEP_ALIVE|7|30|7.60|7.60.1|logserver|"
        );
    }

    #[test]
    fn delimited_voice_line() {
        let line = delimited_line(5, &voice(100));
        assert_eq!(line, "|V|5|32474f4c|VOICE|1|1|3|100|0|9|4|7|");
    }

    #[test]
    fn json_carries_the_message_type_tag() {
        let value = json_line(5, &keep_alive());
        assert_eq!(value["type"], "S");
        assert_eq!(value["message_type"], "KEEP_ALIVE");
        assert_eq!(value["msg_id"], "1");
        assert_eq!(value["log_server_no"], 7);

        let value = json_line(5, &voice(100));
        assert_eq!(value["type"], "V");
        assert_eq!(value["call_id"], 100);
        assert_eq!(value["payload1_kind"], 7);
    }

    #[test]
    fn voice_gate_publishes_every_nth_frame() {
        let mut gate = VoiceRateGate::new(3);
        // Opens only once the counter exceeds the divisor.
        let decisions: Vec<bool> = (0..8).map(|_| gate.tick()).collect();
        assert_eq!(
            decisions,
            vec![false, false, false, true, false, false, false, true]
        );

        // Divisor zero publishes every frame.
        let mut gate = VoiceRateGate::new(0);
        assert!(gate.tick());
        assert!(gate.tick());
    }

    #[tokio::test]
    async fn line_publisher_fans_out_to_clients() {
        let publisher = LinePublisher::bind("127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().unwrap();
        let tx = publisher.sender();
        let token = CancellationToken::new();
        tokio::spawn(publisher.run(token.clone()));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send("{\"type\":\"S\"}".to_string()).unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"type\":\"S\"}\n");
        token.cancel();
    }
}
