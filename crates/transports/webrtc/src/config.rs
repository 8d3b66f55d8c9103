//! Configuration types for the bridge

use crate::channels::messages;
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Which side of the bridge this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Subscribes to local topics, offers video + data to the remote peer
    Sender,
    /// Connects to a sender, publishes what it receives to local topics
    Receiver,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sender => "sender",
            Mode::Receiver => "receiver",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Sender or receiver
    pub mode: Mode,

    /// Listen address (sender) or signaling server address (receiver), `host:port`
    pub addr: String,

    /// Bridged topics
    pub topics: Vec<TopicConfig>,

    /// STUN/TURN URLs
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Bandwidth allocation between video and data channel
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
}

fn default_ice_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

/// One bridged topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic subscribed to on the local bus
    pub name_in: String,

    /// Topic published to on the remote side
    pub name_out: String,

    /// Registered message type name, e.g. `sensor_msgs/msg/Image`
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Required for image topics
    #[serde(default, rename = "image_spec", skip_serializing_if = "Option::is_none")]
    pub image_spec: Option<ImageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosProfile>,
}

impl TopicConfig {
    pub fn is_image(&self) -> bool {
        self.msg_type == messages::MSG_IMAGE
    }

    /// QoS profile, falling back to the sensor-data default
    pub fn qos_or_default(&self) -> QosProfile {
        self.qos.clone().unwrap_or_default()
    }

    /// Frame interval derived from the configured frame rate
    pub fn frame_interval(&self) -> Duration {
        match &self.image_spec {
            Some(spec) if spec.frame_rate > 0.0 => Duration::from_secs_f64(1.0 / spec.frame_rate),
            _ => Duration::from_secs_f64(1.0 / 30.0),
        }
    }
}

/// Image stream geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum History {
    SystemDefault,
    KeepLast,
    KeepAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    SystemDefault,
    Reliable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    SystemDefault,
    TransientLocal,
    Volatile,
}

/// Bus quality-of-service profile for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosProfile {
    pub history: History,
    #[serde(default = "default_depth")]
    pub depth: u32,
    pub reliability: Reliability,
    pub durability: Durability,
}

fn default_depth() -> u32 {
    10
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            history: History::KeepLast,
            depth: default_depth(),
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
        }
    }
}

/// Bitrate budget shared by the video encoder and the data channel (bps)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub total_bandwidth: u32,
    pub min_video_bitrate: u32,
    pub max_video_bitrate: u32,
    pub target_video_bitrate: u32,
    pub min_data_channel_bandwidth: u32,
    /// Control loop period in milliseconds
    pub adjust_interval_ms: u64,
    /// Smoothing factor in [0, 1]
    pub quality_adjust_sensitivity: f64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            total_bandwidth: 10_000_000,
            min_video_bitrate: 500_000,
            max_video_bitrate: 8_000_000,
            target_video_bitrate: 5_000_000,
            min_data_channel_bandwidth: 500_000,
            adjust_interval_ms: 2000,
            quality_adjust_sensitivity: 0.3,
        }
    }
}

impl BandwidthConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_video_bitrate == 0 {
            return Err(Error::InvalidConfig(
                "min_video_bitrate must be positive".to_string(),
            ));
        }
        if self.min_video_bitrate > self.max_video_bitrate {
            return Err(Error::InvalidConfig(format!(
                "min_video_bitrate ({}) exceeds max_video_bitrate ({})",
                self.min_video_bitrate, self.max_video_bitrate
            )));
        }
        if self.target_video_bitrate < self.min_video_bitrate
            || self.target_video_bitrate > self.max_video_bitrate
        {
            return Err(Error::InvalidConfig(format!(
                "target_video_bitrate {} outside [{}, {}]",
                self.target_video_bitrate, self.min_video_bitrate, self.max_video_bitrate
            )));
        }
        if self.total_bandwidth < self.min_video_bitrate {
            return Err(Error::InvalidConfig(
                "total_bandwidth is below min_video_bitrate".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_adjust_sensitivity) {
            return Err(Error::InvalidConfig(format!(
                "quality_adjust_sensitivity must be in [0, 1], got {}",
                self.quality_adjust_sensitivity
            )));
        }
        if self.adjust_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "adjust_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Sender,
            addr: "localhost:8080".to_string(),
            topics: vec![TopicConfig {
                name_in: "image_raw".to_string(),
                name_out: "image".to_string(),
                msg_type: messages::MSG_IMAGE.to_string(),
                image_spec: Some(ImageSpec::default()),
                qos: Some(QosProfile::default()),
            }],
            ice_servers: default_ice_servers(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

fn topic_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9_\-]+(/[a-z0-9_\-]+)*$").expect("topic name pattern is valid")
    })
}

/// RFC 1123 host name check
fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn validate_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("address '{}' must be host:port", addr)))?;

    port.parse::<u16>()
        .map_err(|_| Error::InvalidConfig(format!("invalid port in address '{}'", addr)))?;

    let all_numeric = host
        .split('.')
        .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()));
    let host_ok = if all_numeric {
        host.parse::<Ipv4Addr>().is_ok()
    } else {
        is_valid_hostname(host)
    };

    if !host_ok {
        return Err(Error::InvalidConfig(format!(
            "invalid host '{}' in address '{}'",
            host, addr
        )));
    }
    Ok(())
}

fn validate_topic_name(name: &str) -> Result<()> {
    if !topic_name_pattern().is_match(name) {
        return Err(Error::InvalidConfig(format!("invalid topic name '{}'", name)));
    }
    Ok(())
}

impl TopicConfig {
    pub fn validate(&self) -> Result<()> {
        validate_topic_name(&self.name_in)?;
        validate_topic_name(&self.name_out)?;

        if !messages::is_registered_type(&self.msg_type) {
            return Err(Error::InvalidConfig(format!(
                "unsupported message type '{}' for topic '{}'",
                self.msg_type, self.name_in
            )));
        }

        if self.is_image() {
            let spec = self.image_spec.as_ref().ok_or_else(|| {
                Error::InvalidConfig(format!("image topic '{}' needs image_spec", self.name_in))
            })?;
            if spec.width == 0 || spec.height == 0 || spec.frame_rate <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "image_spec for '{}' must be positive, got {}x{}@{}",
                    self.name_in, spec.width, spec.height, spec.frame_rate
                )));
            }
        }

        if let Some(qos) = &self.qos {
            if qos.history == History::KeepLast && qos.depth == 0 {
                return Err(Error::InvalidConfig(format!(
                    "keep_last QoS for '{}' needs depth > 0",
                    self.name_in
                )));
            }
        }
        Ok(())
    }
}

impl BridgeConfig {
    /// Load from a JSON file. A missing file yields the default configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Config file {} not found, using default configuration",
                path.display()
            );
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(
            mode = %config.mode,
            addr = %config.addr,
            topics = config.topics.len(),
            "Loaded configuration from {}",
            path.display()
        );
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `host:port` with an IPv4
    /// address or RFC 1123 host, if there are no topics, if any topic is
    /// invalid, or if the bandwidth budget is inconsistent.
    pub fn validate(&self) -> Result<()> {
        validate_addr(&self.addr)?;

        if self.topics.is_empty() {
            return Err(Error::InvalidConfig("at least one topic is required".to_string()));
        }
        for topic in &self.topics {
            topic.validate()?;
        }

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one ICE server is required".to_string(),
            ));
        }
        for url in &self.ice_servers {
            if !url.starts_with("stun:") && !url.starts_with("turn:") && !url.starts_with("turns:")
            {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, turn: or turns:, got {}",
                    url
                )));
            }
        }

        self.bandwidth.validate()
    }

    /// The first image topic, which feeds the video track
    pub fn image_topic(&self) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.is_image())
    }

    /// Topics carried over the data channel
    pub fn data_topics(&self) -> impl Iterator<Item = &TopicConfig> {
        self.topics.iter().filter(|t| !t.is_image())
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_topic(mut self, topic: TopicConfig) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.bandwidth = bandwidth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_topic(width: u32) -> TopicConfig {
        TopicConfig {
            name_in: "image_raw".to_string(),
            name_out: "image".to_string(),
            msg_type: messages::MSG_IMAGE.to_string(),
            image_spec: Some(ImageSpec {
                width,
                height: 480,
                frame_rate: 29.97,
            }),
            qos: None,
        }
    }

    fn config_with(addr: &str, topics: Vec<TopicConfig>) -> BridgeConfig {
        BridgeConfig {
            addr: addr.to_string(),
            topics,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, Mode::Sender);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn test_valid_receiver_config() {
        let config = config_with("localhost:8080", vec![image_topic(640)]).with_mode(Mode::Receiver);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ipv4_address_and_two_topics() {
        let config = config_with("10.3.9.3:8080", vec![image_topic(640), image_topic(640)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_width_rejected() {
        let err = config_with("localhost:8080", vec![image_topic(0)])
            .validate()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_image_topic_requires_spec() {
        let mut topic = image_topic(640);
        topic.image_spec = None;
        assert!(config_with("localhost:8080", vec![topic]).validate().is_err());
    }

    #[test]
    fn test_laser_scan_without_spec() {
        let topic = TopicConfig {
            name_in: "scan".to_string(),
            name_out: "scan".to_string(),
            msg_type: messages::MSG_LASER_SCAN.to_string(),
            image_spec: None,
            qos: None,
        };
        assert!(config_with("localhost:8080", vec![topic]).validate().is_ok());
    }

    #[test]
    fn test_bad_addresses() {
        for addr in ["", "localhost", "localhost:http", "10.3.9.300:80", "-bad-.host:80"] {
            assert!(
                config_with(addr, vec![image_topic(640)]).validate().is_err(),
                "{} should be rejected",
                addr
            );
        }
    }

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("image_raw").is_ok());
        assert!(validate_topic_name("camera/front/image-raw").is_ok());
        assert!(validate_topic_name("Image").is_err());
        assert!(validate_topic_name("/image").is_err());
        assert!(validate_topic_name("image//raw").is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut topic = image_topic(640);
        topic.msg_type = "std_msgs/msg/String".to_string();
        assert!(config_with("localhost:8080", vec![topic]).validate().is_err());
    }

    #[test]
    fn test_bandwidth_validation() {
        assert!(BandwidthConfig::default().validate().is_ok());

        let bad = BandwidthConfig {
            quality_adjust_sensitivity: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = BandwidthConfig {
            target_video_bitrate: 9_000_000,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let raw = r#"{
            "mode": "receiver",
            "addr": "10.3.9.3:8080",
            "topics": [
                {"name_in": "image_raw", "name_out": "image", "type": "sensor_msgs/msg/Image",
                 "image_spec": {"width": 640, "height": 480, "frame_rate": 30},
                 "qos": {"history": "keep_last", "depth": 5, "reliability": "reliable", "durability": "volatile"}},
                {"name_in": "scan", "name_out": "scan", "type": "sensor_msgs/msg/LaserScan"}
            ]
        }"#;
        let config = BridgeConfig::from_json(raw).unwrap();
        assert_eq!(config.mode, Mode::Receiver);
        assert_eq!(config.topics.len(), 2);
        assert_eq!(config.image_topic().unwrap().name_out, "image");
        assert_eq!(config.data_topics().count(), 1);
        assert_eq!(config.topics[0].qos_or_default().reliability, Reliability::Reliable);
        assert_eq!(config.bandwidth.total_bandwidth, 10_000_000);
    }

    #[test]
    fn test_load_missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(dir.path().join("missing.json")).unwrap();
        assert_eq!(config.addr, "localhost:8080");
        assert_eq!(config.topics[0].image_spec, Some(ImageSpec::default()));
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mode": "", "addr": "", "topics": []}"#).unwrap();
        assert!(BridgeConfig::load(&path).unwrap_err().is_config_error());
    }

    #[test]
    fn test_frame_interval() {
        let topic = image_topic(640);
        let interval = topic.frame_interval();
        assert!(interval > Duration::from_millis(33) && interval < Duration::from_millis(34));
    }
}
