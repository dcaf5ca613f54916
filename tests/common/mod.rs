//! Wire-format builders for driving the ingress pipeline in tests, written
//! against the record layouts the log server emits.

use callstream::protocol::*;

pub fn header(msg_id: u8, sequence: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SIGNALING_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.push(1);
    out.push(msg_id);
    out
}

pub fn party(ssi: u32, descr: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ssi.to_le_bytes());
    out.extend_from_slice(&201u16.to_le_bytes());
    out.extend_from_slice(&214u16.to_le_bytes());
    out.push(4);
    out.extend_from_slice(&[0x12, 0x34, 0, 0, 0, 0, 0]);
    let mut fixed = [0u8; 64];
    let n = descr.len().min(64);
    fixed[..n].copy_from_slice(&descr.as_bytes()[..n]);
    out.extend_from_slice(&fixed);
    out
}

pub fn keep_alive(sequence: u16, log_server_no: u8, timeout: u8) -> Vec<u8> {
    let mut rec = header(MSG_KEEP_ALIVE, sequence);
    rec.push(log_server_no);
    rec.push(timeout);
    rec.extend_from_slice(&[0u8; 2 + 4]);
    rec.extend_from_slice(b"7.60");
    let mut sw_string = [0u8; 20];
    sw_string[..6].copy_from_slice(b"7.60.1");
    rec.extend_from_slice(&sw_string);
    let mut descr = [0u8; 64];
    descr[..9].copy_from_slice(b"logserver");
    rec.extend_from_slice(&descr);
    assert_eq!(rec.len(), record_len(MSG_KEEP_ALIVE).unwrap());
    rec
}

pub fn indi_call_setup(msg_id: u8, sequence: u16, call_id: u32) -> Vec<u8> {
    let mut rec = header(msg_id, sequence);
    rec.extend_from_slice(&call_id.to_le_bytes());
    rec.push(1); // NewCallSetup
    rec.push(30);
    rec.extend_from_slice(&[0u8; 2]);
    rec.extend_from_slice(&party(1001, "alice"));
    rec.extend_from_slice(&party(1002, "bob"));
    assert_eq!(rec.len(), record_len(msg_id).unwrap());
    rec
}

pub fn indi_call_release(msg_id: u8, sequence: u16, call_id: u32, cause: u8) -> Vec<u8> {
    let mut rec = header(msg_id, sequence);
    rec.extend_from_slice(&call_id.to_le_bytes());
    rec.push(cause);
    rec.extend_from_slice(&[0u8; 3]);
    assert_eq!(rec.len(), record_len(msg_id).unwrap());
    rec
}

pub fn group_call_setup(sequence: u16, call_id: u32) -> Vec<u8> {
    let mut rec = header(MSG_GROUP_CALL_CHANGE, sequence);
    rec.extend_from_slice(&call_id.to_le_bytes());
    rec.push(1); // NewCallSetup
    rec.push(30);
    rec.extend_from_slice(&[0u8; 2]);
    rec.extend_from_slice(&party(9001, "dispatch"));
    assert_eq!(rec.len(), record_len(MSG_GROUP_CALL_CHANGE).unwrap());
    rec
}

pub fn group_call_release(sequence: u16, call_id: u32) -> Vec<u8> {
    let mut rec = header(MSG_GROUP_CALL_RELEASE, sequence);
    rec.extend_from_slice(&call_id.to_le_bytes());
    rec.push(1);
    rec.extend_from_slice(&[0u8; 3]);
    rec
}

pub fn voice_frame(call_id: u32, originator: u8, seq: u8, fill: u8) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&VOICE_SIGNATURE.to_le_bytes());
    rec.push(1);
    rec.push(originator);
    rec.extend_from_slice(&1u16.to_le_bytes());
    rec.extend_from_slice(&call_id.to_le_bytes());
    rec.extend_from_slice(&0u16.to_le_bytes());
    rec.extend_from_slice(&0x1234u16.to_le_bytes());
    rec.push(seq);
    rec.push(0);
    rec.push(PAYLOAD_G711_ALAW);
    rec.push(0);
    rec.extend_from_slice(&vec![fill; ALAW_FRAME_LEN]);
    rec
}
