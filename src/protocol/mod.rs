pub mod parser;

pub use parser::{parse_stream, ParsedEvent, RecvBuffer};

/// Signature opening every signaling record ("LOG1", little-endian).
pub const SIGNALING_SIGNATURE: u32 = 0x31474F4C;
/// Signature opening every voice record ("LOG2", little-endian).
pub const VOICE_SIGNATURE: u32 = 0x32474F4C;

/// The only voice payload the pipeline processes: G.711 A-law, 480 bytes.
pub const ALAW_FRAME_LEN: usize = 480;
/// Fixed voice record prefix before payload 1.
pub const VOICE_PREFIX_LEN: usize = 20;

pub const MSG_KEEP_ALIVE: u8 = 0x01;
pub const MSG_DUPLEX_CALL_CHANGE: u8 = 0x10;
pub const MSG_DUPLEX_CALL_RELEASE: u8 = 0x19;
pub const MSG_SIMPLEX_CALL_CHANGE: u8 = 0x20;
pub const MSG_SIMPLEX_CALL_PTT_CHANGE: u8 = 0x21;
pub const MSG_SIMPLEX_CALL_RELEASE: u8 = 0x29;
pub const MSG_GROUP_CALL_CHANGE: u8 = 0x30;
pub const MSG_GROUP_CALL_PTT_ACTIVE: u8 = 0x31;
pub const MSG_GROUP_CALL_PTT_IDLE: u8 = 0x32;
pub const MSG_GROUP_CALL_RELEASE: u8 = 0x39;
pub const MSG_SDS_STATUS: u8 = 0x40;
pub const MSG_SDS_TEXT: u8 = 0x41;

/// Fixed on-wire record size for a known signaling message id.
///
/// Record sizes are part of the framing contract: the parser only ever
/// advances by these amounts, never by scanning for the next signature.
pub fn record_len(msg_id: u8) -> Option<usize> {
    match msg_id {
        MSG_KEEP_ALIVE => Some(104),
        MSG_DUPLEX_CALL_CHANGE => Some(176),
        MSG_DUPLEX_CALL_RELEASE => Some(16),
        MSG_SIMPLEX_CALL_CHANGE => Some(176),
        MSG_SIMPLEX_CALL_PTT_CHANGE => Some(16),
        MSG_SIMPLEX_CALL_RELEASE => Some(16),
        MSG_GROUP_CALL_CHANGE => Some(96),
        MSG_GROUP_CALL_PTT_ACTIVE => Some(96),
        MSG_GROUP_CALL_PTT_IDLE => Some(16),
        MSG_GROUP_CALL_RELEASE => Some(16),
        MSG_SDS_STATUS => Some(170),
        MSG_SDS_TEXT => Some(680),
        _ => None,
    }
}

/// Common 8-byte header of every signaling record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub sequence: u16,
    pub api_version: u8,
    pub msg_id: u8,
}

/// TETRA Subscriber Identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tsi {
    pub ssi: u32,
    pub mnc: u16,
    pub mcc: u16,
}

/// A call party: subscriber identity, decoded user number and the fixed-width
/// display description from the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Party {
    pub tsi: Tsi,
    pub number: String,
    pub descr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallChangeAction {
    KeepAliveOnly = 0,
    NewCallSetup = 1,
    CallThroughConnect = 2,
    ChangeOfAOrBUser = 3,
}

impl CallChangeAction {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NewCallSetup,
            2 => Self::CallThroughConnect,
            3 => Self::ChangeOfAOrBUser,
            _ => Self::KeepAliveOnly,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::KeepAliveOnly => "KEEP_ALIVE_ONLY",
            Self::NewCallSetup => "NEW_CALL_SETUP",
            Self::CallThroughConnect => "CALL_THROUGH_CONNECT",
            Self::ChangeOfAOrBUser => "CHANGE_OF_A_OR_B_USER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupCallAction {
    KeepAliveOnly = 0,
    NewCallSetup = 1,
}

impl GroupCallAction {
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::NewCallSetup
        } else {
            Self::KeepAliveOnly
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::KeepAliveOnly => "KEEP_ALIVE_ONLY",
            Self::NewCallSetup => "NEW_CALL_SETUP",
        }
    }
}

/// Individual (duplex/simplex) call release cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReleaseCause {
    Unknown = 0,
    ARelease = 1,
    BRelease = 2,
}

impl ReleaseCause {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ARelease,
            2 => Self::BRelease,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "RELEASE_CAUSE_UNKNOWN",
            Self::ARelease => "A_SUB_RELEASE",
            Self::BRelease => "B_SUB_RELEASE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupReleaseCause {
    Unknown = 0,
    PttInactivityTimeout = 1,
}

impl GroupReleaseCause {
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::PttInactivityTimeout
        } else {
            Self::Unknown
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "RELEASE_CAUSE_UNKNOWN",
            Self::PttInactivityTimeout => "PTT_INACTIVITY_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TalkingParty {
    None = 0,
    ASub = 1,
    BSub = 2,
}

impl TalkingParty {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ASub,
            2 => Self::BSub,
            _ => Self::None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "TALKING_PARTY_NONE",
            Self::ASub => "TALKING_PARTY_A_SUB",
            Self::BSub => "TALKING_PARTY_B_SUB",
        }
    }
}

/// Which half-duplex stream a voice record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamOriginator {
    Group = 0,
    ASub = 1,
    BSub = 2,
}

impl StreamOriginator {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ASub,
            2 => Self::BSub,
            _ => Self::Group,
        }
    }
}

/// Voice payload kinds with their fixed lengths. Only `G711Alaw` is decoded
/// by the pipeline, the rest are declared by the interface.
pub fn payload_len(kind: u8) -> usize {
    match kind {
        1 => 16,  // TETRA STCH/U
        2 => 18,  // TETRA TCH/S
        3 => 27,  // TETRA TCH/7.2
        4 => 18,  // TETRA TCH/4.8
        5 => 9,   // TETRA TCH/2.4
        7 => 480, // G.711 A-law
        _ => 0,
    }
}

pub const PAYLOAD_G711_ALAW: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub header: MessageHeader,
    pub log_server_no: u8,
    pub timeout: u8,
    pub sw_ver: String,
    pub sw_ver_string: String,
    pub descr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndiCallChange {
    pub header: MessageHeader,
    pub call_id: u32,
    pub action: CallChangeAction,
    pub timeout: u8,
    pub a_party: Party,
    pub b_party: Party,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndiCallRelease {
    pub header: MessageHeader,
    pub call_id: u32,
    pub cause: ReleaseCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndiCallPtt {
    pub header: MessageHeader,
    pub call_id: u32,
    pub talking_party: TalkingParty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCallChange {
    pub header: MessageHeader,
    pub call_id: u32,
    pub action: GroupCallAction,
    pub timeout: u8,
    pub group: Party,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCallPttActive {
    pub header: MessageHeader,
    pub call_id: u32,
    pub talking_party: Party,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCallPttIdle {
    pub header: MessageHeader,
    pub call_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCallRelease {
    pub header: MessageHeader,
    pub call_id: u32,
    pub cause: GroupReleaseCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSds {
    pub header: MessageHeader,
    pub a_party: Party,
    pub b_party: Party,
    pub status_value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSds {
    pub header: MessageHeader,
    pub a_party: Party,
    pub b_party: Party,
    pub text: String,
}

/// The 20-byte voice record prefix. The A-law payload travels next to the
/// event as a separate buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceHeader {
    pub api_version: u8,
    pub originator: StreamOriginator,
    pub originating_node: u16,
    pub call_id: u32,
    pub source_and_index: u16,
    pub stream_random_id: u16,
    pub packet_seq: u8,
    pub payload1_kind: u8,
    pub payload2_kind: u8,
}

/// Everything the ingress stream can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    KeepAlive(KeepAlive),
    DuplexCallChange(IndiCallChange),
    DuplexCallRelease(IndiCallRelease),
    SimplexCallStartChange(IndiCallChange),
    SimplexCallPttChange(IndiCallPtt),
    SimplexCallRelease(IndiCallRelease),
    GroupCallStartChange(GroupCallChange),
    GroupCallPttActive(GroupCallPttActive),
    GroupCallPttIdle(GroupCallPttIdle),
    GroupCallRelease(GroupCallRelease),
    StatusSds(StatusSds),
    TextSds(TextSds),
    Voice(VoiceHeader),
}

impl LogEvent {
    /// Bus topic for this event: `S_<msg id hex>` for signaling,
    /// `V_<call id decimal>` for voice.
    pub fn topic(&self) -> String {
        match self {
            LogEvent::Voice(v) => format!("V_{}", v.call_id),
            other => format!("S_{:x}", other.msg_id()),
        }
    }

    pub fn msg_id(&self) -> u8 {
        match self {
            LogEvent::KeepAlive(_) => MSG_KEEP_ALIVE,
            LogEvent::DuplexCallChange(_) => MSG_DUPLEX_CALL_CHANGE,
            LogEvent::DuplexCallRelease(_) => MSG_DUPLEX_CALL_RELEASE,
            LogEvent::SimplexCallStartChange(_) => MSG_SIMPLEX_CALL_CHANGE,
            LogEvent::SimplexCallPttChange(_) => MSG_SIMPLEX_CALL_PTT_CHANGE,
            LogEvent::SimplexCallRelease(_) => MSG_SIMPLEX_CALL_RELEASE,
            LogEvent::GroupCallStartChange(_) => MSG_GROUP_CALL_CHANGE,
            LogEvent::GroupCallPttActive(_) => MSG_GROUP_CALL_PTT_ACTIVE,
            LogEvent::GroupCallPttIdle(_) => MSG_GROUP_CALL_PTT_IDLE,
            LogEvent::GroupCallRelease(_) => MSG_GROUP_CALL_RELEASE,
            LogEvent::StatusSds(_) => MSG_SDS_STATUS,
            LogEvent::TextSds(_) => MSG_SDS_TEXT,
            LogEvent::Voice(_) => 0,
        }
    }
}

const NUMBER_ALPHABET: &[u8; 16] = b"0123456789*#+DEF";

/// Decode a BCD-packed user number. The length byte counts nibbles; decoding
/// reads ⌊len/2⌋+1 digit bytes and truncates the output at `len` characters.
/// A zero length or one exceeding the digit capacity yields an empty string.
pub fn decode_number(len: u8, digits: &[u8]) -> String {
    let len = len as usize;
    if len == 0 || len >= digits.len() * 2 {
        return String::new();
    }
    let cycles = len / 2;
    let mut out = String::with_capacity(len + 1);
    for byte in digits.iter().take(cycles + 1) {
        out.push(NUMBER_ALPHABET[(byte >> 4) as usize] as char);
        out.push(NUMBER_ALPHABET[(byte & 0x0f) as usize] as char);
    }
    out.truncate(len);
    out
}

/// Decode a fixed-width description field: bytes up to the first NUL,
/// lossily interpreted as UTF-8.
pub fn decode_fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_decoding_covers_half_plus_one_bytes() {
        // 5 nibbles: reads 3 bytes, emits 6 chars, truncates to 5
        let digits = [0x12, 0x34, 0x5f, 0, 0, 0, 0];
        assert_eq!(decode_number(5, &digits), "12345");
    }

    #[test]
    fn number_decoding_extended_alphabet() {
        let digits = [0xab, 0xcd, 0, 0, 0, 0, 0];
        assert_eq!(decode_number(4, &digits), "*#+D");
    }

    #[test]
    fn number_decoding_rejects_out_of_range_lengths() {
        let digits = [0x12; 7];
        assert_eq!(decode_number(0, &digits), "");
        assert_eq!(decode_number(14, &digits), "");
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let mut raw = [0u8; 64];
        raw[..5].copy_from_slice(b"alpha");
        assert_eq!(decode_fixed_str(&raw), "alpha");
        assert_eq!(decode_fixed_str(&[0u8; 64]), "");
    }

    #[test]
    fn topics_render_hex_for_signaling_and_decimal_for_voice() {
        let release = LogEvent::SimplexCallRelease(IndiCallRelease {
            header: MessageHeader {
                sequence: 1,
                api_version: 1,
                msg_id: MSG_SIMPLEX_CALL_RELEASE,
            },
            call_id: 100,
            cause: ReleaseCause::ARelease,
        });
        assert_eq!(release.topic(), "S_29");

        let voice = LogEvent::Voice(VoiceHeader {
            api_version: 1,
            originator: StreamOriginator::ASub,
            originating_node: 1,
            call_id: 100,
            source_and_index: 0,
            stream_random_id: 7,
            packet_seq: 0,
            payload1_kind: PAYLOAD_G711_ALAW,
            payload2_kind: 0,
        });
        assert_eq!(voice.topic(), "V_100");
    }
}
