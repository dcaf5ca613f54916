use anyhow::{anyhow, Result};
use md5::{Digest, Md5};

/// A parsed request from the command socket. On the wire a request is the
/// command line followed by one line per argument, terminated by an empty
/// line; the reply mirrors that shape and always opens with `OK` or `NOK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetActiveCalls,
    StartCallInterception {
        call_id: u32,
        format: String,
    },
    StopCallInterception {
        call_id: u32,
    },
    StartPlayCall {
        call_db_id: i64,
        call_id: u32,
        call_type: String,
        format: String,
        session: String,
    },
    StopPlayCall {
        call_db_id: i64,
        call_id: u32,
        call_type: String,
        format: String,
        session: String,
    },
}

pub fn parse_request(parts: &[String]) -> Result<Request> {
    let command = parts.first().ok_or_else(|| anyhow!("empty request"))?;
    let arg = |i: usize| -> Result<&String> {
        parts
            .get(i)
            .ok_or_else(|| anyhow!("{}: missing argument {}", command, i))
    };
    match command.as_str() {
        "GET_ACTIVE_CALLS" => Ok(Request::GetActiveCalls),
        "START_CALL_INTERCEPTION" => Ok(Request::StartCallInterception {
            call_id: arg(1)?.parse()?,
            format: arg(2)?.clone(),
        }),
        "STOP_CALL_INTERCEPTION" => Ok(Request::StopCallInterception {
            call_id: arg(1)?.parse()?,
        }),
        "START_PLAY_CALL" => Ok(Request::StartPlayCall {
            call_db_id: arg(1)?.parse()?,
            call_id: arg(2)?.parse()?,
            call_type: arg(3)?.clone(),
            format: arg(4)?.clone(),
            session: arg(5)?.clone(),
        }),
        "STOP_PLAY_CALL" => Ok(Request::StopPlayCall {
            call_db_id: arg(1)?.parse()?,
            call_id: arg(2)?.parse()?,
            call_type: arg(3)?.clone(),
            format: arg(4)?.clone(),
            session: arg(5)?.clone(),
        }),
        other => Err(anyhow!("unknown command {}", other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub parts: Vec<String>,
}

impl Reply {
    pub fn ok(parts: impl IntoIterator<Item = String>) -> Self {
        let mut all = vec!["OK".to_string()];
        all.extend(parts);
        Self { parts: all }
    }

    pub fn ok_simple() -> Self {
        Self {
            parts: vec!["OK".to_string(), "OK".to_string()],
        }
    }

    pub fn nok(diagnostic: impl Into<String>) -> Self {
        Self {
            parts: vec!["NOK".to_string(), diagnostic.into()],
        }
    }

    pub fn encode(&self) -> String {
        let mut out = self.parts.join("\n");
        out.push_str("\n\n");
        out
    }

    pub fn is_ok(&self) -> bool {
        self.parts.first().map(|p| p == "OK").unwrap_or(false)
    }
}

/// Deterministic on-disk name of a playback file: the MD5 hex digest of
/// `voice_<call_db_id>_<call_id>_<session>`.
pub fn playback_file_stem(call_db_id: i64, call_id: u32, session: &str) -> String {
    let plain = format!("voice_{}_{}_{}", call_db_id, call_id, session);
    let digest = Md5::digest(plain.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(
            parse_request(&lines(&["GET_ACTIVE_CALLS"])).unwrap(),
            Request::GetActiveCalls
        );
        assert_eq!(
            parse_request(&lines(&["START_CALL_INTERCEPTION", "100", "flv"])).unwrap(),
            Request::StartCallInterception {
                call_id: 100,
                format: "flv".to_string()
            }
        );
        assert_eq!(
            parse_request(&lines(&["START_PLAY_CALL", "42", "100", "I", "wav", "sess"])).unwrap(),
            Request::StartPlayCall {
                call_db_id: 42,
                call_id: 100,
                call_type: "I".to_string(),
                format: "wav".to_string(),
                session: "sess".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_and_short_requests() {
        assert!(parse_request(&lines(&["REWIND_TAPE"])).is_err());
        assert!(parse_request(&lines(&["START_CALL_INTERCEPTION"])).is_err());
        assert!(parse_request(&lines(&["START_CALL_INTERCEPTION", "abc", "wav"])).is_err());
    }

    #[test]
    fn reply_encoding_terminates_with_a_blank_line() {
        let reply = Reply::ok(["url".to_string()]);
        assert_eq!(reply.encode(), "OK\nurl\n\n");
        assert!(reply.is_ok());
        let reply = Reply::nok("Feeder not available");
        assert_eq!(reply.encode(), "NOK\nFeeder not available\n\n");
        assert!(!reply.is_ok());
    }

    #[test]
    fn playback_file_stem_is_a_stable_md5() {
        let stem = playback_file_stem(42, 100, "sess");
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic across invocations and equal inputs.
        assert_eq!(stem, playback_file_stem(42, 100, "sess"));
        assert_ne!(stem, playback_file_stem(42, 100, "other"));
        // Known digest of "voice_42_100_sess".
        assert_eq!(stem, format!("{:x}", Md5::digest(b"voice_42_100_sess")));
    }
}
