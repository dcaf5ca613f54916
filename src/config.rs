use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(version, about = "TETRA LogApi call-stream processor")]
pub struct Cli {
    /// Configuration file; falls back to $CALLSTREAMSERVER_CONF_FILE.
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub basic: BasicConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub persistence_manager: PersistenceConfig,
    #[serde(default)]
    pub media_manager: MediaConfig,
    #[serde(default)]
    pub tracer_manager: TracerConfig,
    /// Populated from the environment at startup; workers never read the
    /// environment themselves.
    #[serde(skip)]
    pub runtime: RuntimeEnv,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BasicConfig {
    /// 0 = store WAV blobs, 1 = convert to MP3 through the external encoder.
    #[serde(default)]
    pub mp3_mode: u8,
}

impl BasicConfig {
    pub fn mp3_enabled(&self) -> bool {
        self.mp3_mode != 0
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CollectorConfig {
    pub log_server_endpoint: EndpointConfig,
    /// Also mirror each decoded voice frame into a per-call WAV file in the
    /// working directory.
    #[serde(default)]
    pub generate_wav_files: u8,
}

impl CollectorConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.log_server_endpoint.ip, self.log_server_endpoint.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid collector.log_server_endpoint {}:{}",
                    self.log_server_endpoint.ip, self.log_server_endpoint.port
                )
            })
    }

    pub fn wav_mirror_enabled(&self) -> bool {
        self.generate_wav_files != 0
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_server_endpoint: EndpointConfig {
                ip: "127.0.0.1".to_string(),
                port: 4321,
            },
            generate_wav_files: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub pg_conn_info: String,
    /// printf-style template with three `%s` slots: input WAV, output MP3,
    /// log label.
    #[serde(default)]
    pub mp3_converter_command_template: String,
    #[serde(default = "default_inactivity_period")]
    pub call_inactivity_period: u64,
    #[serde(default = "default_maintenance_frequency")]
    pub maintenance_frequency: u64,
    #[serde(default = "default_full_subscriptions")]
    pub subscriptions: Vec<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            pg_conn_info: String::new(),
            mp3_converter_command_template: String::new(),
            call_inactivity_period: default_inactivity_period(),
            maintenance_frequency: default_maintenance_frequency(),
            subscriptions: default_full_subscriptions(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub media_server_endpoint: String,
    #[serde(default = "default_command_listener")]
    pub command_listener_endpoint: String,
    #[serde(default = "default_inactivity_period")]
    pub call_inactivity_period: u64,
    #[serde(default = "default_maintenance_frequency")]
    pub maintenance_frequency: u64,
    #[serde(default)]
    pub playback_mode: PlaybackMode,
    #[serde(default = "default_media_subscriptions")]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub feeders: Vec<FeederConfig>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_server_endpoint: String::new(),
            command_listener_endpoint: default_command_listener(),
            call_inactivity_period: default_inactivity_period(),
            maintenance_frequency: default_maintenance_frequency(),
            playback_mode: PlaybackMode::default(),
            subscriptions: default_media_subscriptions(),
            player: PlayerConfig::default(),
            feeders: Vec::new(),
        }
    }
}

/// Recorded-call playback flavor: `static` materializes a hashed file served
/// by an external static server, `player` drives the legacy child-process
/// player bound to a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    Static,
    Player,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub command_template: String,
    #[serde(default)]
    pub filename_template: String,
    #[serde(default)]
    pub voicerec_repo: String,
    #[serde(default)]
    pub voicerec_url: String,
    #[serde(default)]
    pub instances: Vec<PlayerInstanceConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PlayerInstanceConfig {
    pub stream: String,
    pub feeder: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FeederConfig {
    pub stream: String,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: FeederKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FeederKind {
    #[serde(rename = "M")]
    Mono,
    #[serde(rename = "S")]
    Stereo,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TracerConfig {
    #[serde(default = "default_json_publisher")]
    pub json_publisher: String,
    /// Voice JSON rate divisor: a JSON line is published once the frame
    /// counter exceeds this value. Zero publishes every frame.
    #[serde(default)]
    pub publish_one_json_voice_msg_every: u32,
    #[serde(default = "default_full_subscriptions")]
    pub subscriptions: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            json_publisher: default_json_publisher(),
            publish_one_json_voice_msg_every: 0,
            subscriptions: default_full_subscriptions(),
        }
    }
}

/// Environment-derived settings, read once at startup.
#[derive(Debug, Default, Clone)]
pub struct RuntimeEnv {
    pub work_path: String,
    pub httpd_home: Option<String>,
    pub apli: Option<String>,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        Self {
            work_path: std::env::var("CALLSTREAMSERVER_WORK_PATH").unwrap_or_else(|_| ".".to_string()),
            httpd_home: std::env::var("HTTPD_HOME").ok(),
            apli: std::env::var("APLI").ok(),
        }
    }
}

fn default_inactivity_period() -> u64 {
    300
}

fn default_maintenance_frequency() -> u64 {
    60
}

fn default_command_listener() -> String {
    "127.0.0.1:5580".to_string()
}

fn default_json_publisher() -> String {
    "127.0.0.1:5501".to_string()
}

fn default_full_subscriptions() -> Vec<String> {
    vec!["S_".to_string(), "V_".to_string()]
}

fn default_media_subscriptions() -> Vec<String> {
    // Call setup and release ids only; voice filters are attached per
    // intercepted call.
    vec![
        "S_10".to_string(),
        "S_19".to_string(),
        "S_20".to_string(),
        "S_29".to_string(),
        "S_30".to_string(),
        "S_39".to_string(),
    ]
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
        let mut config: Config = toml::from_str(&raw).with_context(|| format!("parse config {}", path))?;
        config.runtime = RuntimeEnv::from_env();
        Ok(config)
    }

    /// Startup sanity checks; any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.collector.bind_addr()?;
        self.media_manager
            .command_listener_endpoint
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "invalid media_manager.command_listener_endpoint {}",
                    self.media_manager.command_listener_endpoint
                )
            })?;
        self.tracer_manager
            .json_publisher
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "invalid tracer_manager.json_publisher {}",
                    self.tracer_manager.json_publisher
                )
            })?;
        for feeder in &self.media_manager.feeders {
            format!("{}:{}", feeder.ip, feeder.port)
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid feeder destination for stream {}", feeder.stream))?;
        }
        for instance in &self.media_manager.player.instances {
            if !self
                .media_manager
                .feeders
                .iter()
                .any(|f| f.stream == instance.feeder)
            {
                anyhow::bail!(
                    "player instance {} references unknown feeder {}",
                    instance.stream,
                    instance.feeder
                );
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            log_file: None,
            basic: BasicConfig::default(),
            collector: CollectorConfig::default(),
            persistence_manager: PersistenceConfig::default(),
            media_manager: MediaConfig::default(),
            tracer_manager: TracerConfig::default(),
            runtime: RuntimeEnv::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let raw = r#"
log_level = "debug"

[basic]
mp3_mode = 1

[collector.log_server_endpoint]
ip = "0.0.0.0"
port = 4322

[persistence_manager]
pg_conn_info = "postgres://cs@localhost/cs"
call_inactivity_period = 120

[media_manager]
media_server_endpoint = "http://media:1935/live"
command_listener_endpoint = "127.0.0.1:5580"

[[media_manager.feeders]]
stream = "feeder1"
ip = "127.0.0.1"
port = 7001
type = "M"

[[media_manager.feeders]]
stream = "feeder2"
ip = "127.0.0.1"
port = 7002
type = "S"

[[media_manager.player.instances]]
stream = "play1"
feeder = "feeder1"

[tracer_manager]
json_publisher = "127.0.0.1:5501"
publish_one_json_voice_msg_every = 10
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.basic.mp3_enabled());
        assert_eq!(config.collector.log_server_endpoint.port, 4322);
        assert_eq!(config.persistence_manager.call_inactivity_period, 120);
        // untouched keys take their defaults
        assert_eq!(config.persistence_manager.maintenance_frequency, 60);
        assert_eq!(config.media_manager.feeders.len(), 2);
        assert_eq!(config.media_manager.feeders[1].kind, FeederKind::Stereo);
        assert_eq!(config.media_manager.playback_mode, PlaybackMode::Static);
        config.validate().unwrap();
    }

    #[test]
    fn player_instance_must_reference_a_feeder() {
        let mut config = Config::default();
        config.media_manager.player.instances.push(PlayerInstanceConfig {
            stream: "play1".to_string(),
            feeder: "nope".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_cover_the_maintenance_knobs() {
        let config = Config::default();
        assert_eq!(config.persistence_manager.call_inactivity_period, 300);
        assert_eq!(config.media_manager.maintenance_frequency, 60);
        assert_eq!(config.tracer_manager.subscriptions, vec!["S_", "V_"]);
    }
}
