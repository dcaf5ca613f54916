//! Request/reply command socket scenarios against a running Media Router.

use callstream::bus::{Bus, BusMessage};
use callstream::config::{Config, FeederConfig, FeederKind};
use callstream::media::MediaRouter;
use callstream::protocol::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn feeder(stream: &str, port: u16, kind: FeederKind) -> FeederConfig {
    FeederConfig {
        stream: stream.to_string(),
        ip: "127.0.0.1".to_string(),
        port,
        kind,
    }
}

fn simplex_setup(call_id: u32) -> BusMessage {
    BusMessage {
        topic: "S_20".to_string(),
        timestamp: 0,
        event: LogEvent::SimplexCallStartChange(IndiCallChange {
            header: MessageHeader {
                sequence: 1,
                api_version: 1,
                msg_id: MSG_SIMPLEX_CALL_CHANGE,
            },
            call_id,
            action: CallChangeAction::NewCallSetup,
            timeout: 30,
            a_party: Party::default(),
            b_party: Party::default(),
        }),
        voice: None,
    }
}

async fn request(stream: &mut TcpStream, parts: &[&str]) -> Vec<String> {
    let mut wire = parts.join("\n");
    wire.push_str("\n\n");
    stream.write_all(wire.as_bytes()).await.unwrap();

    let mut reply = Vec::new();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches('\n').to_string();
        if line.is_empty() {
            break;
        }
        reply.push(line);
    }
    reply
}

async fn start_router(feeders: Vec<FeederConfig>) -> (CancellationToken, Bus, std::net::SocketAddr) {
    let mut config = Config::default();
    config.persistence_manager.pg_conn_info = "sqlite::memory:".to_string();
    config.media_manager.command_listener_endpoint = "127.0.0.1:0".to_string();
    config.media_manager.media_server_endpoint = "http://media:1935/live".to_string();
    config.media_manager.feeders = feeders;

    let bus = Bus::new();
    let router = MediaRouter::new(Arc::new(config), bus.clone()).await.unwrap();
    let addr = router.local_addr().unwrap();
    let token = CancellationToken::new();
    tokio::spawn(router.run(token.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    (token, bus, addr)
}

#[tokio::test]
async fn active_calls_are_listed_over_the_socket() {
    let (token, bus, addr) = start_router(vec![]).await;

    bus.publish(simplex_setup(100));
    bus.publish(simplex_setup(42));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = request(&mut stream, &["GET_ACTIVE_CALLS"]).await;
    assert_eq!(reply, vec!["OK", "2", "42", "100"]);
    token.cancel();
}

#[tokio::test]
async fn feeder_pool_exhaustion_rejects_the_third_interception() {
    let (token, bus, addr) = start_router(vec![
        feeder("m1", 7201, FeederKind::Mono),
        feeder("m2", 7202, FeederKind::Mono),
        feeder("s1", 7203, FeederKind::Stereo),
    ])
    .await;

    for call_id in [1u32, 2, 3] {
        bus.publish(simplex_setup(call_id));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let first = request(&mut stream, &["START_CALL_INTERCEPTION", "1", "flv"]).await;
    assert_eq!(first, vec!["OK", "http://media:1935/live/m1.flv"]);
    let second = request(&mut stream, &["START_CALL_INTERCEPTION", "2", "flv"]).await;
    assert_eq!(second[0], "OK");
    let third = request(&mut stream, &["START_CALL_INTERCEPTION", "3", "flv"]).await;
    assert_eq!(third, vec!["NOK", "Feeder not available"]);

    // Stopping one interception frees its feeder for the starved call.
    let stopped = request(&mut stream, &["STOP_CALL_INTERCEPTION", "1"]).await;
    assert_eq!(stopped, vec!["OK", "OK"]);
    let retried = request(&mut stream, &["START_CALL_INTERCEPTION", "3", "flv"]).await;
    assert_eq!(retried[0], "OK");
    token.cancel();
}

#[tokio::test]
async fn malformed_requests_get_a_nok() {
    let (token, _bus, addr) = start_router(vec![]).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = request(&mut stream, &["REWIND_TAPE"]).await;
    assert_eq!(reply[0], "NOK");
    let reply = request(&mut stream, &["START_CALL_INTERCEPTION", "not-a-number", "flv"]).await;
    assert_eq!(reply[0], "NOK");
    token.cancel();
}
