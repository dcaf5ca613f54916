use super::*;
use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};
use tracing::trace;

/// One record lifted from the ingress stream: the wall-clock second at which
/// its header was matched, the typed event, and for voice records the raw
/// A-law payload.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub timestamp: u64,
    pub event: LogEvent,
    pub voice: Option<Bytes>,
}

/// Scan `buf` for complete records and return them together with the number
/// of bytes consumed. Bytes of a record whose tail has not arrived yet are
/// left unconsumed; junk bytes and unknown message ids are skipped one byte
/// at a time so the scanner re-synchronizes on the next signature.
pub fn parse_stream(buf: &[u8], now: u64) -> (Vec<ParsedEvent>, usize) {
    let mut events = Vec::new();
    let mut offset = 0usize;

    while buf.len() - offset >= 4 {
        let window = &buf[offset..];
        let signature = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);

        let advanced = if signature == SIGNALING_SIGNATURE {
            parse_signaling(window, now, &mut events)
        } else if signature == VOICE_SIGNATURE {
            parse_voice(window, now, &mut events)
        } else {
            1
        };

        if advanced == 0 {
            // Incomplete record, wait for the next datagram.
            break;
        }
        offset += advanced;
    }

    (events, offset)
}

fn parse_signaling(window: &[u8], now: u64, events: &mut Vec<ParsedEvent>) -> usize {
    if window.len() < 8 {
        return 0;
    }
    let msg_id = window[7];
    let len = match record_len(msg_id) {
        Some(len) => len,
        None => {
            trace!(msg_id, "unknown signaling message id, resynchronizing");
            return 1;
        }
    };
    if window.len() < len {
        return 0;
    }
    match decode_signaling(msg_id, &window[..len]) {
        Ok(event) => events.push(ParsedEvent {
            timestamp: now,
            event,
            voice: None,
        }),
        Err(err) => trace!(msg_id, %err, "undecodable signaling record dropped"),
    }
    len
}

fn parse_voice(window: &[u8], now: u64, events: &mut Vec<ParsedEvent>) -> usize {
    let total = VOICE_PREFIX_LEN + ALAW_FRAME_LEN;
    if window.len() < total {
        return 0;
    }
    match decode_voice_header(&window[..VOICE_PREFIX_LEN]) {
        Ok(header) => {
            if header.payload1_kind == PAYLOAD_G711_ALAW {
                let payload =
                    Bytes::copy_from_slice(&window[VOICE_PREFIX_LEN..VOICE_PREFIX_LEN + ALAW_FRAME_LEN]);
                events.push(ParsedEvent {
                    timestamp: now,
                    event: LogEvent::Voice(header),
                    voice: Some(payload),
                });
            } else {
                trace!(kind = header.payload1_kind, "unprocessed voice payload kind skipped");
            }
        }
        Err(err) => trace!(%err, "undecodable voice record dropped"),
    }
    total
}

fn decode_signaling(msg_id: u8, record: &[u8]) -> Result<LogEvent> {
    let mut cur = Cursor::new(record);
    let header = read_header(&mut cur)?;
    let event = match msg_id {
        MSG_KEEP_ALIVE => {
            let log_server_no = cur.read_u8()?;
            let timeout = cur.read_u8()?;
            cur.read_u16::<LittleEndian>()?;
            cur.read_u32::<LittleEndian>()?;
            let mut sw_ver = [0u8; 4];
            cur.read_exact(&mut sw_ver)?;
            let mut sw_ver_string = [0u8; 20];
            cur.read_exact(&mut sw_ver_string)?;
            let mut descr = [0u8; 64];
            cur.read_exact(&mut descr)?;
            LogEvent::KeepAlive(KeepAlive {
                header,
                log_server_no,
                timeout,
                sw_ver: decode_fixed_str(&sw_ver),
                sw_ver_string: decode_fixed_str(&sw_ver_string),
                descr: decode_fixed_str(&descr),
            })
        }
        MSG_DUPLEX_CALL_CHANGE | MSG_SIMPLEX_CALL_CHANGE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            let action = CallChangeAction::from_u8(cur.read_u8()?);
            let timeout = cur.read_u8()?;
            cur.read_u16::<LittleEndian>()?;
            let a_party = read_party(&mut cur)?;
            let b_party = read_party(&mut cur)?;
            let change = IndiCallChange {
                header,
                call_id,
                action,
                timeout,
                a_party,
                b_party,
            };
            if msg_id == MSG_DUPLEX_CALL_CHANGE {
                LogEvent::DuplexCallChange(change)
            } else {
                LogEvent::SimplexCallStartChange(change)
            }
        }
        MSG_DUPLEX_CALL_RELEASE | MSG_SIMPLEX_CALL_RELEASE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            let cause = ReleaseCause::from_u8(cur.read_u8()?);
            let release = IndiCallRelease {
                header,
                call_id,
                cause,
            };
            if msg_id == MSG_DUPLEX_CALL_RELEASE {
                LogEvent::DuplexCallRelease(release)
            } else {
                LogEvent::SimplexCallRelease(release)
            }
        }
        MSG_SIMPLEX_CALL_PTT_CHANGE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            let talking_party = TalkingParty::from_u8(cur.read_u8()?);
            LogEvent::SimplexCallPttChange(IndiCallPtt {
                header,
                call_id,
                talking_party,
            })
        }
        MSG_GROUP_CALL_CHANGE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            let action = GroupCallAction::from_u8(cur.read_u8()?);
            let timeout = cur.read_u8()?;
            cur.read_u16::<LittleEndian>()?;
            let group = read_party(&mut cur)?;
            LogEvent::GroupCallStartChange(GroupCallChange {
                header,
                call_id,
                action,
                timeout,
                group,
            })
        }
        MSG_GROUP_CALL_PTT_ACTIVE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            cur.read_u32::<LittleEndian>()?;
            let talking_party = read_party(&mut cur)?;
            LogEvent::GroupCallPttActive(GroupCallPttActive {
                header,
                call_id,
                talking_party,
            })
        }
        MSG_GROUP_CALL_PTT_IDLE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            LogEvent::GroupCallPttIdle(GroupCallPttIdle { header, call_id })
        }
        MSG_GROUP_CALL_RELEASE => {
            let call_id = cur.read_u32::<LittleEndian>()?;
            let cause = GroupReleaseCause::from_u8(cur.read_u8()?);
            LogEvent::GroupCallRelease(GroupCallRelease {
                header,
                call_id,
                cause,
            })
        }
        MSG_SDS_STATUS => {
            let a_party = read_party(&mut cur)?;
            let b_party = read_party(&mut cur)?;
            let status_value = cur.read_u16::<LittleEndian>()?;
            LogEvent::StatusSds(StatusSds {
                header,
                a_party,
                b_party,
                status_value,
            })
        }
        MSG_SDS_TEXT => {
            let a_party = read_party(&mut cur)?;
            let b_party = read_party(&mut cur)?;
            let mut text = [0u8; 512];
            cur.read_exact(&mut text)?;
            LogEvent::TextSds(TextSds {
                header,
                a_party,
                b_party,
                text: decode_fixed_str(&text),
            })
        }
        other => anyhow::bail!("no decoder for message id {:#x}", other),
    };
    Ok(event)
}

fn decode_voice_header(prefix: &[u8]) -> Result<VoiceHeader> {
    let mut cur = Cursor::new(prefix);
    cur.read_u32::<LittleEndian>()?; // signature, already matched
    let api_version = cur.read_u8()?;
    let originator = StreamOriginator::from_u8(cur.read_u8()?);
    let originating_node = cur.read_u16::<LittleEndian>()?;
    let call_id = cur.read_u32::<LittleEndian>()?;
    let source_and_index = cur.read_u16::<LittleEndian>()?;
    let stream_random_id = cur.read_u16::<LittleEndian>()?;
    let packet_seq = cur.read_u8()?;
    cur.read_u8()?; // spare
    let payload1_kind = cur.read_u8()?;
    let payload2_kind = cur.read_u8()?;
    Ok(VoiceHeader {
        api_version,
        originator,
        originating_node,
        call_id,
        source_and_index,
        stream_random_id,
        packet_seq,
        payload1_kind,
        payload2_kind,
    })
}

fn read_header(cur: &mut Cursor<&[u8]>) -> Result<MessageHeader> {
    cur.read_u32::<LittleEndian>()?; // signature, already matched
    let sequence = cur.read_u16::<LittleEndian>()?;
    let api_version = cur.read_u8()?;
    let msg_id = cur.read_u8()?;
    Ok(MessageHeader {
        sequence,
        api_version,
        msg_id,
    })
}

fn read_tsi(cur: &mut Cursor<&[u8]>) -> Result<Tsi> {
    let ssi = cur.read_u32::<LittleEndian>()?;
    let mnc = cur.read_u16::<LittleEndian>()?;
    let mcc = cur.read_u16::<LittleEndian>()?;
    Ok(Tsi { ssi, mnc, mcc })
}

fn read_party(cur: &mut Cursor<&[u8]>) -> Result<Party> {
    let tsi = read_tsi(cur)?;
    let len = cur.read_u8()?;
    let mut digits = [0u8; 7];
    cur.read_exact(&mut digits)?;
    let mut descr = [0u8; 64];
    cur.read_exact(&mut descr)?;
    Ok(Party {
        tsi,
        number: decode_number(len, &digits),
        descr: decode_fixed_str(&descr),
    })
}

/// Rolling receive buffer owned by the Ingestor: datagrams append at the
/// tail, the parser consumes from the head, the undecoded remainder compacts
/// back to offset zero.
pub struct RecvBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Writable tail for the next datagram. Empty means a single record has
    /// outgrown the buffer, which is a fatal configuration error upstream.
    pub fn spare(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.buf[len..]
    }

    /// Record `n` freshly received bytes.
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Drop `n` consumed bytes and compact the tail to the head.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_alive_record(log_server_no: u8, timeout: u8) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.extend_from_slice(&SIGNALING_SIGNATURE.to_le_bytes());
        rec.extend_from_slice(&1u16.to_le_bytes());
        rec.push(1); // api version
        rec.push(MSG_KEEP_ALIVE);
        rec.push(log_server_no);
        rec.push(timeout);
        rec.extend_from_slice(&[0u8; 2 + 4]); // spares
        rec.extend_from_slice(b"7.60");
        let mut sw_string = [0u8; 20];
        sw_string[..4].copy_from_slice(b"7.60");
        rec.extend_from_slice(&sw_string);
        let mut descr = [0u8; 64];
        descr[..9].copy_from_slice(b"logserver");
        rec.extend_from_slice(&descr);
        assert_eq!(rec.len(), record_len(MSG_KEEP_ALIVE).unwrap());
        rec
    }

    fn group_call_change_record(call_id: u32, action: u8) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.extend_from_slice(&SIGNALING_SIGNATURE.to_le_bytes());
        rec.extend_from_slice(&2u16.to_le_bytes());
        rec.push(1);
        rec.push(MSG_GROUP_CALL_CHANGE);
        rec.extend_from_slice(&call_id.to_le_bytes());
        rec.push(action);
        rec.push(30); // timeout
        rec.extend_from_slice(&[0u8; 2]);
        rec.extend_from_slice(&party_bytes());
        assert_eq!(rec.len(), record_len(MSG_GROUP_CALL_CHANGE).unwrap());
        rec
    }

    fn party_bytes() -> Vec<u8> {
        let mut party = Vec::new();
        party.extend_from_slice(&1001u32.to_le_bytes()); // ssi
        party.extend_from_slice(&201u16.to_le_bytes()); // mnc
        party.extend_from_slice(&214u16.to_le_bytes()); // mcc
        party.push(4);
        party.extend_from_slice(&[0x12, 0x34, 0, 0, 0, 0, 0]);
        let mut descr = [0u8; 64];
        descr[..5].copy_from_slice(b"group");
        party.extend_from_slice(&descr);
        party
    }

    fn voice_record(call_id: u32, originator: u8, kind: u8, fill: u8) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.extend_from_slice(&VOICE_SIGNATURE.to_le_bytes());
        rec.push(1);
        rec.push(originator);
        rec.extend_from_slice(&7u16.to_le_bytes()); // node
        rec.extend_from_slice(&call_id.to_le_bytes());
        rec.extend_from_slice(&0u16.to_le_bytes());
        rec.extend_from_slice(&0x4242u16.to_le_bytes());
        rec.push(0); // packet seq
        rec.push(0); // spare
        rec.push(kind);
        rec.push(0);
        rec.extend_from_slice(&vec![fill; ALAW_FRAME_LEN]);
        rec
    }

    #[test]
    fn decodes_a_keep_alive_record() {
        let rec = keep_alive_record(7, 30);
        let (events, consumed) = parse_stream(&rec, 1000);
        assert_eq!(consumed, rec.len());
        assert_eq!(events.len(), 1);
        match &events[0].event {
            LogEvent::KeepAlive(ka) => {
                assert_eq!(ka.log_server_no, 7);
                assert_eq!(ka.timeout, 30);
                assert_eq!(ka.sw_ver, "7.60");
                assert_eq!(ka.descr, "logserver");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emits_all_records_despite_junk_between_them() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0xde, 0xad, 0xbe]);
        stream.extend_from_slice(&keep_alive_record(1, 10));
        stream.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44]);
        stream.extend_from_slice(&group_call_change_record(42, 1));
        stream.extend_from_slice(&[0xff]);
        stream.extend_from_slice(&voice_record(42, 0, PAYLOAD_G711_ALAW, 0xd5));

        let (events, consumed) = parse_stream(&stream, 0);
        assert_eq!(events.len(), 3);
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn single_junk_byte_delays_but_never_drops_a_record() {
        let rec = group_call_change_record(9, 1);
        let mut stream = vec![0x55];
        stream.extend_from_slice(&rec);
        let (events, consumed) = parse_stream(&stream, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn fragmented_record_waits_for_the_tail() {
        let rec = group_call_change_record(100, 1);
        assert_eq!(rec.len(), 96);

        let mut buffer = RecvBuffer::with_capacity(4096);

        // 30 + 30 + 36 bytes, one event only after the third chunk
        for (chunk, expect) in [(&rec[..30], 0usize), (&rec[30..60], 0), (&rec[60..], 1)] {
            buffer.spare()[..chunk.len()].copy_from_slice(chunk);
            buffer.commit(chunk.len());
            let (events, consumed) = parse_stream(buffer.filled(), 0);
            assert_eq!(events.len(), expect);
            buffer.consume(consumed);
        }
        assert!(buffer.filled().is_empty());
    }

    #[test]
    fn unknown_message_id_resynchronizes_byte_by_byte() {
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&SIGNALING_SIGNATURE.to_le_bytes());
        bogus.extend_from_slice(&0u16.to_le_bytes());
        bogus.push(1);
        bogus.push(0x7f); // not a known message id
        bogus.extend_from_slice(&keep_alive_record(3, 30));

        let (events, consumed) = parse_stream(&bogus, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(consumed, bogus.len());
    }

    #[test]
    fn voice_record_with_alaw_payload_is_emitted_verbatim() {
        let rec = voice_record(100, 1, PAYLOAD_G711_ALAW, 0xaa);
        let (events, consumed) = parse_stream(&rec, 5);
        assert_eq!(consumed, VOICE_PREFIX_LEN + ALAW_FRAME_LEN);
        assert_eq!(events.len(), 1);
        let parsed = &events[0];
        assert_eq!(parsed.timestamp, 5);
        match &parsed.event {
            LogEvent::Voice(v) => {
                assert_eq!(v.call_id, 100);
                assert_eq!(v.originator, StreamOriginator::ASub);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(parsed.voice.as_ref().unwrap().len(), ALAW_FRAME_LEN);
        assert!(parsed.voice.as_ref().unwrap().iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn voice_record_with_other_payload_kind_is_skipped_whole() {
        let rec = voice_record(100, 0, 2, 0);
        let (events, consumed) = parse_stream(&rec, 0);
        assert!(events.is_empty());
        assert_eq!(consumed, VOICE_PREFIX_LEN + ALAW_FRAME_LEN);
    }

    #[test]
    fn partial_voice_record_consumes_nothing() {
        let rec = voice_record(100, 0, PAYLOAD_G711_ALAW, 0);
        let (events, consumed) = parse_stream(&rec[..200], 0);
        assert!(events.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn recv_buffer_compacts_the_unconsumed_tail() {
        let mut buffer = RecvBuffer::with_capacity(64);
        buffer.spare()[..10].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        buffer.commit(10);
        buffer.consume(4);
        assert_eq!(buffer.filled(), &[5, 6, 7, 8, 9, 10]);
        assert!(!buffer.is_full());
    }
}
