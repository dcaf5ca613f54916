use crate::config::RuntimeEnv;
use tracing::{debug, warn};

/// Fire-and-forget bridge to the external alarm CLI. The command location
/// comes from `HTTPD_HOME`/`APLI`, captured once at startup; when they are
/// absent the alarm degrades to a log line.
#[derive(Clone)]
pub struct AlarmSender {
    command_prefix: Option<(String, String)>,
    hostname: String,
}

impl AlarmSender {
    pub fn new(runtime: &RuntimeEnv) -> Self {
        let command_prefix = match (&runtime.httpd_home, &runtime.apli) {
            (Some(home), Some(apli)) => Some((home.clone(), apli.clone())),
            _ => None,
        };
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            command_prefix,
            hostname,
        }
    }

    pub fn send(&self, module: &str, text: &str) {
        let (httpd_home, apli) = match &self.command_prefix {
            Some(prefix) => prefix,
            None => {
                warn!(module, text, "alarm raised but alarm CLI is not configured");
                return;
            }
        };
        let command = format!(
            "{home}/html/{apli}/aplicaciones/ALARMS/createAlarmEvent.pl {home} {apli} \
             --event ACT --object TeNMS --text \"{text}\" --source - \
             --type CALLSTREAM_RECORD --subtype CALLSTREAM_RECORD#{host} \
             --priority 1 --externalKey -",
            home = httpd_home,
            apli = apli,
            text = text,
            host = self.hostname,
        );
        debug!(module, command, "raising alarm");
        tokio::spawn(async move {
            match tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status()
                .await
            {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(code = status.code(), "alarm CLI exited non-zero"),
                Err(err) => warn!(%err, "alarm CLI could not be executed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_environment_degrades_to_logging() {
        let sender = AlarmSender::new(&RuntimeEnv::default());
        // Must not panic or spawn anything.
        sender.send("persister", "Unable to record voice call");
    }
}
