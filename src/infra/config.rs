//! Configuration loading from TOML files
//!
//! Decoding happens in two steps: serde reads the file into raw section
//! structs (every field optional, sections kept in file order), then the
//! sections are validated against `ValidationRules` into typed entities.
//!
//! ```toml
//! [gateway]
//! name = "ham"
//!
//! [[broker."sango/1"]]      # <name>/<priority>
//! host = "192.168.1.22"
//! port = 1883
//!
//! [device."dora"]
//! type = "dummy"
//! broker = "sango"
//! ```

use crate::domain::message::{qos_from_level, STATUS_SENDER};
use crate::domain::payload::decode_payload;
use crate::domain::topic::will_topic;
use crate::infra::error::ConfigError;
use crate::infra::tls::{TlsMaterial, TlsSettings};
use crate::infra::validation::ValidationRules;
use bytes::Bytes;
use rumqttc::QoS;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_MAX_RETRY_COUNT: i64 = 3;
const DEFAULT_RETRY_INTERVAL_SECS: i64 = 3;
const DEFAULT_PUBLISH_TIMEOUT_MS: i64 = 5000;
const DEFAULT_BROKER_PRIORITY: i64 = 1;
const DEFAULT_DUMMY_INTERVAL_SECS: i64 = 10;
const DEFAULT_SERIAL_REOPEN_SECS: i64 = 5;
const DEFAULT_SERIAL_BAUD: i64 = 9600;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySection {
    pub name: Option<String>,
    pub max_retry_count: Option<i64>,
    pub retry_interval: Option<i64>,
    pub publish_timeout_ms: Option<i64>,
    pub status_interval: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerSection {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: Option<String>,
    pub will_message: Option<String>,
    pub will_topic: Option<String>,
    pub retry_interval: Option<i64>,
    pub tls: Option<bool>,
    pub cacert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub tls_verify_hostname: Option<bool>,
}

impl BrokerSection {
    /// Fold a later table for the same broker key over this one
    fn merge(self, later: Self) -> Self {
        Self {
            host: later.host.or(self.host),
            port: later.port.or(self.port),
            username: later.username.or(self.username),
            password: later.password.or(self.password),
            topic_prefix: later.topic_prefix.or(self.topic_prefix),
            will_message: later.will_message.or(self.will_message),
            will_topic: later.will_topic.or(self.will_topic),
            retry_interval: later.retry_interval.or(self.retry_interval),
            tls: later.tls.or(self.tls),
            cacert: later.cacert.or(self.cacert),
            client_cert: later.client_cert.or(self.client_cert),
            client_key: later.client_key.or(self.client_key),
            tls_verify_hostname: later.tls_verify_hostname.or(self.tls_verify_hostname),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub broker: Option<String>,
    pub qos: Option<i64>,
    pub retain: Option<bool>,
    pub subscribe: Option<bool>,
    pub interval: Option<i64>,
    pub payload: Option<String>,
    pub serial: Option<String>,
    pub baud: Option<i64>,
    pub size: Option<i64>,
}

/// Raw file shape. Brokers are arrays of tables, devices single tables.
#[derive(Debug, Deserialize)]
pub struct TomlConfig {
    pub gateway: Option<GatewaySection>,
    #[serde(default, deserialize_with = "ordered_sections")]
    pub broker: Vec<(String, Vec<BrokerSection>)>,
    #[serde(default, deserialize_with = "ordered_sections")]
    pub device: Vec<(String, DeviceSection)>,
}

/// Read a table of named sections, keeping file order
fn ordered_sections<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct SectionsVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for SectionsVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a table of named sections")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut sections = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, section)) = map.next_entry::<String, T>()? {
                sections.push((name, section));
            }
            Ok(sections)
        }
    }

    deserializer.deserialize_map(SectionsVisitor(PhantomData))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub name: String,
    pub max_retry_count: u32,
    pub retry_interval: Duration,
    /// Bound on waiting for a publish acknowledgement
    pub publish_timeout: Duration,
    /// Period of status reports, `None` when disabled
    pub status_interval: Option<Duration>,
}

impl GatewayConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT as u32,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS as u64),
            publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS as u64),
            status_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub priority: u8,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Will payload; `Some` enables the will, even when empty
    pub will_message: Option<Bytes>,
    pub will_topic: String,
    pub tls: Option<TlsMaterial>,
    /// Per-broker override of the gateway retry interval
    pub retry_interval: Option<Duration>,
}

impl BrokerConfig {
    /// Plain broker with defaults, mostly for embedding and tests
    pub fn new(
        gateway_name: &str,
        name: impl Into<String>,
        priority: u8,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            host: host.into(),
            port,
            username: None,
            password: None,
            topic_prefix: String::new(),
            will_message: None,
            will_topic: will_topic("", gateway_name, None),
            tls: None,
            retry_interval: None,
        }
    }

    /// `tcp://host:port`, or `ssl://host:port` with TLS
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Dummy { interval: Duration, payload: Bytes },
    Serial { port: String, baud: u32, size: usize, reopen_interval: Duration },
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Dummy { .. } => "dummy",
            DeviceKind::Serial { .. } => "serial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Broker name whose priority group carries this device's messages
    pub broker: Option<String>,
    pub qos: QoS,
    pub retain: bool,
    /// Receive messages published to `<prefix>/<gateway>/<device>/subscribe`
    pub subscribe: bool,
    pub kind: DeviceKind,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    gateway: GatewayConfig,
    brokers: Vec<BrokerConfig>,
    devices: Vec<DeviceConfig>,
    config_file: String,
}

impl Config {
    /// Load configuration from a TOML file with the default rules
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_file_with_rules(path, &ValidationRules::default())
    }

    pub fn from_file_with_rules<P: AsRef<Path>>(
        path: P,
        rules: &ValidationRules,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut config = Self::from_str_with_rules(&content, rules)?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Parse configuration text with the default rules
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::from_str_with_rules(content, &ValidationRules::default())
    }

    pub fn from_str_with_rules(content: &str, rules: &ValidationRules) -> Result<Self, ConfigError> {
        let raw: TomlConfig = toml::from_str(content)?;

        let gateway = build_gateway(raw.gateway.ok_or(ConfigError::MissingGateway)?, rules)?;

        let brokers = raw
            .broker
            .into_iter()
            .map(|(key, tables)| {
                let merged = tables.into_iter().fold(BrokerSection::default(), BrokerSection::merge);
                build_broker(&key, merged, &gateway.name, rules)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let devices = raw
            .device
            .into_iter()
            .map(|(name, section)| build_device(&name, section, &brokers, rules))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { gateway, brokers, devices, config_file: "inline".to_string() })
    }

    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }

    pub fn gateway_name(&self) -> &str {
        &self.gateway.name
    }

    /// Brokers in file order (priority ordering happens in `BrokerSet`)
    pub fn brokers(&self) -> &[BrokerConfig] {
        &self.brokers
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Distinct broker names in file order
    pub fn broker_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.brokers.len());
        for broker in &self.brokers {
            if !names.contains(&broker.name.as_str()) {
                names.push(&broker.name);
            }
        }
        names
    }
}

fn build_gateway(section: GatewaySection, rules: &ValidationRules) -> Result<GatewayConfig, ConfigError> {
    const SECTION: &str = "gateway";

    let name = section.name.unwrap_or_default();
    rules.check_name(SECTION, "name", &name)?;

    let max_retry_count = rules.check_non_negative(
        SECTION,
        "max_retry_count",
        section.max_retry_count.unwrap_or(DEFAULT_MAX_RETRY_COUNT),
    )?;
    let max_retry_count = u32::try_from(max_retry_count)
        .map_err(|_| ConfigError::invalid(SECTION, "max_retry_count", "too large"))?;

    let retry_interval = rules.check_non_negative(
        SECTION,
        "retry_interval",
        section.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
    )?;

    let publish_timeout_ms = section.publish_timeout_ms.unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);
    if publish_timeout_ms <= 0 {
        return Err(ConfigError::invalid(SECTION, "publish_timeout_ms", "must be > 0"));
    }

    let status_interval =
        rules.check_non_negative(SECTION, "status_interval", section.status_interval.unwrap_or(0))?;

    Ok(GatewayConfig {
        name,
        max_retry_count,
        retry_interval: Duration::from_secs(retry_interval),
        publish_timeout: Duration::from_millis(publish_timeout_ms as u64),
        status_interval: (status_interval > 0).then(|| Duration::from_secs(status_interval)),
    })
}

fn build_broker(
    key: &str,
    section: BrokerSection,
    gateway_name: &str,
    rules: &ValidationRules,
) -> Result<BrokerConfig, ConfigError> {
    let label = format!("broker.{:?}", key);

    // "<name>/<priority>"; anything before the last slash is the name
    let (name, priority) = match key.rsplit_once('/') {
        Some((name, arg)) => {
            let priority = arg.parse::<i64>().map_err(|_| {
                ConfigError::invalid(&label, "priority", format!("{:?} is not an integer", arg))
            })?;
            (name, priority)
        }
        None => (key, DEFAULT_BROKER_PRIORITY),
    };
    rules.check_name(&label, "name", name)?;
    let priority = rules.check_priority(&label, priority)?;

    let host = section.host.unwrap_or_default();
    if host.is_empty() {
        return Err(ConfigError::invalid(&label, "host", "must be set"));
    }
    rules.check_len(&label, "host", &host)?;
    if host.contains('\0') {
        return Err(ConfigError::invalid(&label, "host", "must not contain NUL"));
    }

    let port = section.port.ok_or_else(|| ConfigError::invalid(&label, "port", "must be set"))?;
    let port = rules.check_port(&label, port)?;

    if let Some(username) = &section.username {
        rules.check_len(&label, "username", username)?;
    }
    if let Some(password) = &section.password {
        rules.check_len(&label, "password", password)?;
    }

    let topic_prefix = section.topic_prefix.unwrap_or_default();
    rules.check_topic_part(&label, "topic_prefix", &topic_prefix)?;

    let will_message = match section.will_message.as_deref() {
        Some(raw) => {
            let decoded = decode_payload(raw);
            if let Some(warning) = &decoded.warning {
                warn!(broker = %name, warning = %warning, "will_message_partially_parsed");
            }
            if decoded.bytes.len() > rules.max_will_len {
                return Err(ConfigError::invalid(
                    &label,
                    "will_message",
                    format!("is {} bytes, limit is {}", decoded.bytes.len(), rules.max_will_len),
                ));
            }
            Some(decoded.bytes)
        }
        None => None,
    };

    let will_topic = will_topic(&topic_prefix, gateway_name, section.will_topic.as_deref());
    rules.check_topic_part(&label, "will_topic", &will_topic)?;

    let tls = if section.tls.unwrap_or(false) {
        let settings = TlsSettings {
            ca_cert: section.cacert,
            client_cert: section.client_cert,
            client_key: section.client_key,
            verify_hostname: section.tls_verify_hostname.unwrap_or(true),
        };
        for path in [&settings.ca_cert, &settings.client_cert, &settings.client_key].into_iter().flatten() {
            rules.check_len(&label, "certificate path", path)?;
        }
        let material = TlsMaterial::load(&settings)
            .map_err(|source| ConfigError::Tls { section: label.clone(), source })?;
        Some(material)
    } else {
        None
    };

    let retry_interval = match section.retry_interval {
        Some(secs) => {
            let secs = rules.check_non_negative(&label, "retry_interval", secs)?;
            (secs > 0).then(|| Duration::from_secs(secs))
        }
        None => None,
    };

    Ok(BrokerConfig {
        name: name.to_string(),
        priority,
        host,
        port,
        username: section.username.filter(|u| !u.is_empty()),
        password: section.password,
        topic_prefix,
        will_message,
        will_topic,
        tls,
        retry_interval,
    })
}

fn build_device(
    name: &str,
    section: DeviceSection,
    brokers: &[BrokerConfig],
    rules: &ValidationRules,
) -> Result<DeviceConfig, ConfigError> {
    let label = format!("device.{:?}", name);
    rules.check_name(&label, "name", name)?;
    if name == STATUS_SENDER {
        return Err(ConfigError::invalid(&label, "name", "reserved for gateway status reports"));
    }

    let broker = match section.broker {
        Some(broker) => {
            if !brokers.iter().any(|b| b.name == broker) {
                return Err(ConfigError::invalid(
                    &label,
                    "broker",
                    format!("{:?} is not a configured broker", broker),
                ));
            }
            Some(broker)
        }
        None => None,
    };

    let qos_level = section.qos.unwrap_or(0);
    let qos = qos_from_level(qos_level).ok_or_else(|| {
        ConfigError::invalid(&label, "qos", format!("{} out of range 0..=2", qos_level))
    })?;

    let interval = section
        .interval
        .map(|secs| rules.check_non_negative(&label, "interval", secs))
        .transpose()?;

    let kind = match section.device_type.as_deref() {
        Some("dummy") => {
            let interval = interval.unwrap_or(DEFAULT_DUMMY_INTERVAL_SECS as u64);
            if interval == 0 {
                return Err(ConfigError::invalid(&label, "interval", "must be > 0"));
            }
            let payload = section.payload.unwrap_or_default();
            DeviceKind::Dummy {
                interval: Duration::from_secs(interval),
                payload: Bytes::from(payload.into_bytes()),
            }
        }
        Some("serial") => {
            let port = section.serial.filter(|p| !p.is_empty()).ok_or_else(|| {
                ConfigError::invalid(&label, "serial", "port path must be set")
            })?;
            rules.check_len(&label, "serial", &port)?;
            let baud = section.baud.unwrap_or(DEFAULT_SERIAL_BAUD);
            let baud = u32::try_from(baud)
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| ConfigError::invalid(&label, "baud", format!("{} must be > 0", baud)))?;
            let size = rules.check_non_negative(&label, "size", section.size.unwrap_or(0))?;
            DeviceKind::Serial {
                port,
                baud,
                size: size as usize,
                reopen_interval: Duration::from_secs(
                    interval.unwrap_or(DEFAULT_SERIAL_REOPEN_SECS as u64),
                ),
            }
        }
        Some(other) => {
            return Err(ConfigError::invalid(&label, "type", format!("unknown device type {:?}", other)))
        }
        None => return Err(ConfigError::invalid(&label, "type", "must be set")),
    };

    Ok(DeviceConfig {
        name: name.to_string(),
        broker,
        qos,
        retain: section.retain.unwrap_or(false),
        subscribe: section.subscribe.unwrap_or(false),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::error::TlsError;
    use crate::infra::tls::fixtures::{write, CA_PEM, GARBAGE_CERT_PEM};
    use tempfile::tempdir;

    const GATEWAY: &str = "[gateway]\nname = \"ham\"\n";

    fn parse(body: &str) -> Result<Config, ConfigError> {
        Config::parse(&format!("{}{}", GATEWAY, body))
    }

    #[test]
    fn test_broker_settings() {
        let config = parse(
            r#"
[[broker."sango/2"]]
    host = "192.168.1.22"
    port = 1883
    username = "usr"
    password = "pass"
    topic_prefix = "pre"
    will_message = "will"
"#,
        )
        .unwrap();
        assert_eq!(config.brokers().len(), 1);
        let b = &config.brokers()[0];
        assert_eq!(b.name, "sango");
        assert_eq!(b.priority, 2);
        assert_eq!(b.username.as_deref(), Some("usr"));
        assert_eq!(b.password.as_deref(), Some("pass"));
        assert_eq!(b.topic_prefix, "pre");
        assert_eq!(b.will_message.as_deref(), Some(&b"will"[..]));
        assert_eq!(b.will_topic, "pre/ham/will");
        assert_eq!(b.url(), "tcp://192.168.1.22:1883");
        assert!(b.retry_interval.is_none());
    }

    #[test]
    fn test_multiple_brokers_keep_file_order() {
        let config = parse(
            r#"
[[broker."sango/2"]]
    host = "192.168.1.22"
    port = 1883
[[broker."sango/1"]]
    host = "192.168.1.23"
    port = 1883
[[broker."akane"]]
    host = "192.168.1.24"
    port = 1883
"#,
        )
        .unwrap();
        let priorities: Vec<u8> = config.brokers().iter().map(|b| b.priority).collect();
        assert_eq!(priorities, vec![2, 1, 1]);
        assert_eq!(config.broker_names(), vec!["sango", "akane"]);
    }

    #[test]
    fn test_broker_tables_merge() {
        let config = parse(
            r#"
[[broker."sango/1"]]
    host = "192.168.1.22"
    port = 1883
[[broker."sango/1"]]
    port = 1884
"#,
        )
        .unwrap();
        assert_eq!(config.brokers().len(), 1);
        assert_eq!(config.brokers()[0].host, "192.168.1.22");
        assert_eq!(config.brokers()[0].port, 1884);
    }

    #[test]
    fn test_broker_single_table_rejected() {
        let result = parse(
            r#"
[broker."sango/2"]
    host = "192.168.1.22"
    port = 1883
"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_gateway_array_rejected() {
        let result = Config::parse("[[gateway]]\nname = \"ham\"\nmax_retry_count = 30\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_device_array_rejected() {
        let result = parse(
            r#"
[[device."dora/dummy"]]
    qos = 1
    interval = 10
    payload = "Hello world."
"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_gateway() {
        assert!(matches!(Config::parse(""), Err(ConfigError::MissingGateway)));
    }

    #[test]
    fn test_broker_host_too_long() {
        let host = format!("192.168.1.22{}", "a".repeat(300));
        let result = parse(&format!(
            "[[broker.\"sango/2\"]]\n    host = \"{}\"\n    port = 1883\n",
            host
        ));
        assert!(matches!(result, Err(ConfigError::Invalid { field: "host", .. })));
    }

    #[test]
    fn test_broker_port_out_of_range() {
        let result = parse("[[broker.\"sango/2\"]]\n    host = \"h\"\n    port = 65536\n");
        assert!(matches!(result, Err(ConfigError::Invalid { field: "port", .. })));
    }

    #[test]
    fn test_broker_priority_out_of_range() {
        for key in ["sango/10", "sango/0"] {
            let result = parse(&format!("[[broker.\"{}\"]]\n    host = \"h\"\n    port = 1883\n", key));
            assert!(
                matches!(result, Err(ConfigError::Invalid { field: "priority", .. })),
                "{} should be rejected",
                key
            );
        }
    }

    #[test]
    fn test_broker_name_with_slash() {
        let result = parse("[[broker.\"san/go/1\"]]\n    host = \"h\"\n    port = 1883\n");
        assert!(matches!(result, Err(ConfigError::Invalid { field: "name", .. })));
    }

    #[test]
    fn test_broker_will_payloads() {
        let config = parse(
            r#"
[[broker."a/1"]]
    host = "h"
    port = 1883
    will_message = "\\x01\\x0f"
[[broker."b/1"]]
    host = "h"
    port = 1883
    will_message = "\\x01\\x0fffff"
[[broker."c/1"]]
    host = "h"
    port = 1883
"#,
        )
        .unwrap();
        let brokers = config.brokers();
        assert_eq!(brokers[0].will_message.as_deref(), Some(&[1u8, 15][..]));
        assert_eq!(brokers[1].will_message.as_deref(), Some(&[1u8, 15][..]));
        assert!(brokers[2].will_message.is_none());
    }

    #[test]
    fn test_empty_will_message_still_enables_will() {
        let config =
            parse("[[broker.\"a/1\"]]\n    host = \"h\"\n    port = 1883\n    will_message = \"\"\n")
                .unwrap();
        assert_eq!(config.brokers()[0].will_message.as_deref(), Some(&b""[..]));
        assert_eq!(config.brokers()[0].will_topic, "/ham/will");
    }

    #[test]
    fn test_explicit_will_topic() {
        let config = parse(
            r#"
[[broker."a/1"]]
    host = "h"
    port = 1883
    topic_prefix = "prefix"
    will_topic = "willtopic/nested"
"#,
        )
        .unwrap();
        assert_eq!(config.brokers()[0].will_topic, "prefix/willtopic/nested");
    }

    #[test]
    fn test_tls_requires_cacert() {
        let result = parse("[[broker.\"a/1\"]]\n    host = \"h\"\n    port = 8883\n    tls = true\n");
        assert!(matches!(result, Err(ConfigError::Tls { .. })));
    }

    #[test]
    fn test_tls_with_cacert() {
        let dir = tempdir().unwrap();
        let ca = write(dir.path(), "ca.pem", CA_PEM);
        let config = parse(&format!(
            "[[broker.\"a/1\"]]\n    host = \"localhost\"\n    port = 8883\n    tls = true\n    cacert = \"{}\"\n",
            ca.display()
        ))
        .unwrap();
        let broker = &config.brokers()[0];
        assert!(broker.tls.is_some());
        assert_eq!(broker.url(), "ssl://localhost:8883");
    }

    #[test]
    fn test_tls_garbage_cacert_rejected() {
        let dir = tempdir().unwrap();
        let ca = write(dir.path(), "ca.pem", GARBAGE_CERT_PEM);
        let result = parse(&format!(
            "[[broker.\"a/1\"]]\n    host = \"h\"\n    port = 8883\n    tls = true\n    cacert = \"{}\"\n",
            ca.display()
        ));
        assert!(matches!(
            result,
            Err(ConfigError::Tls { source: TlsError::CertificateParse { .. }, .. })
        ));
    }

    #[test]
    fn test_tls_verify_hostname_knob() {
        let dir = tempdir().unwrap();
        let ca = write(dir.path(), "ca.pem", CA_PEM);
        let body = |extra: &str| {
            format!(
                "[[broker.\"a/1\"]]\n    host = \"192.168.1.22\"\n    port = 8883\n    tls = true\n    cacert = \"{}\"\n{}",
                ca.display(),
                extra
            )
        };
        let config = parse(&body("")).unwrap();
        assert!(config.brokers()[0].tls.as_ref().unwrap().verifies_hostname());

        let config = parse(&body("    tls_verify_hostname = false\n")).unwrap();
        assert!(!config.brokers()[0].tls.as_ref().unwrap().verifies_hostname());
    }

    #[test]
    fn test_broker_retry_interval_override() {
        let config = parse(
            "[[broker.\"a/1\"]]\n    host = \"h\"\n    port = 1883\n    retry_interval = 10\n",
        )
        .unwrap();
        assert_eq!(config.brokers()[0].retry_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_gateway_invalid_names() {
        for name in ["bone+lessham", "bone#lessham", "na\\u0000me", ""] {
            let result = Config::parse(&format!("[gateway]\nname = \"{}\"\n", name));
            assert!(result.is_err(), "{:?} should be rejected", name);
        }
        let long = "a".repeat(300);
        assert!(Config::parse(&format!("[gateway]\nname = \"{}\"\n", long)).is_err());
    }

    #[test]
    fn test_gateway_defaults() {
        let config = Config::parse(GATEWAY).unwrap();
        let gw = config.gateway();
        assert_eq!(gw.name, "ham");
        assert_eq!(gw.max_retry_count, 3);
        assert_eq!(gw.retry_interval, Duration::from_secs(3));
        assert_eq!(gw.publish_timeout, Duration::from_millis(5000));
        assert!(gw.status_interval.is_none());
        assert_eq!(gw, &GatewayConfig::new("ham"));
    }

    #[test]
    fn test_gateway_retry_settings() {
        let config = Config::parse(
            "[gateway]\nname = \"sango\"\nmax_retry_count = 10\nretry_interval = 10\nstatus_interval = 30\n",
        )
        .unwrap();
        assert_eq!(config.gateway().max_retry_count, 10);
        assert_eq!(config.gateway().retry_interval, Duration::from_secs(10));
        assert_eq!(config.gateway().status_interval, Some(Duration::from_secs(30)));

        assert!(Config::parse("[gateway]\nname = \"sango\"\nmax_retry_count = -10\n").is_err());
        assert!(Config::parse("[gateway]\nname = \"sango\"\nretry_interval = -10\n").is_err());
        assert!(Config::parse("[gateway]\nname = \"sango\"\nmax_retry_count = aabbcc\n").is_err());
        assert!(Config::parse("[gateway]\nname = \"sango\"\npublish_timeout_ms = 0\n").is_err());
    }

    const BROKER: &str = "[[broker.\"sango/1\"]]\n    host = \"h\"\n    port = 1883\n";

    fn parse_device(device: &str) -> Result<Config, ConfigError> {
        parse(&format!("{}{}", BROKER, device))
    }

    #[test]
    fn test_serial_device() {
        let config = parse_device(
            r#"
[device."dora"]
    type = "serial"
    broker = "sango"
    qos = 1
    serial = "/dev/tty.ble"
    baud = 9600
    size = 4
"#,
        )
        .unwrap();
        let device = &config.devices()[0];
        assert_eq!(device.name, "dora");
        assert_eq!(device.broker.as_deref(), Some("sango"));
        assert_eq!(device.qos, QoS::AtLeastOnce);
        assert_eq!(device.kind.as_str(), "serial");
        match &device.kind {
            DeviceKind::Serial { port, baud, size, .. } => {
                assert_eq!(port, "/dev/tty.ble");
                assert_eq!(*baud, 9600);
                assert_eq!(*size, 4);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_dummy_device() {
        let config = parse_device(
            r#"
[device."dora"]
    type = "dummy"
    broker = "sango"
    qos = 2
    interval = 10
    payload = "Hello world."
    retain = true
    subscribe = true
"#,
        )
        .unwrap();
        let device = &config.devices()[0];
        assert_eq!(device.qos, QoS::ExactlyOnce);
        assert!(device.retain);
        assert!(device.subscribe);
        assert_eq!(
            device.kind,
            DeviceKind::Dummy {
                interval: Duration::from_secs(10),
                payload: Bytes::from_static(b"Hello world.")
            }
        );
    }

    #[test]
    fn test_invalid_devices() {
        let cases = [
            ("unknown broker", "type = \"dummy\"\nbroker = \"doesNotExist\"\n"),
            ("negative qos", "type = \"dummy\"\nqos = -1\n"),
            ("qos too large", "type = \"dummy\"\nqos = 3\n"),
            ("negative interval", "type = \"serial\"\nserial = \"/dev/x\"\ninterval = -1\n"),
            ("zero dummy interval", "type = \"dummy\"\ninterval = 0\n"),
            ("negative baud", "type = \"serial\"\nserial = \"/dev/x\"\nbaud = -9600\n"),
            ("missing serial port", "type = \"serial\"\n"),
            ("unknown type", "type = \"camera\"\n"),
            ("missing type", "qos = 0\n"),
        ];
        for (what, body) in cases {
            let result = parse_device(&format!("[device.\"dora\"]\n{}", body));
            assert!(result.is_err(), "{} should be rejected", what);
        }
    }

    #[test]
    fn test_status_device_name_reserved() {
        let result = parse_device("[device.\"status\"]\ntype = \"dummy\"\n");
        match result {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "name"),
            other => panic!("expected invalid name, got {:?}", other),
        }
        assert!(parse_device("[device.\"statusboard\"]\ntype = \"dummy\"\n").is_ok());
    }
}
