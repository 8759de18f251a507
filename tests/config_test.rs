//! Integration tests for configuration loading

use iot_gateway::infra::{Config, ConfigError, DeviceKind, ValidationRules};
use iot_gateway::services::{BrokerSet, Gateway};
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[gateway]
name = "ham"
max_retry_count = 5
retry_interval = 2
status_interval = 30

[[broker."sango/2"]]
host = "192.168.1.22"
port = 1883
username = "usr"
password = "pass"
topic_prefix = "pre"
will_message = "no letter is good letter."

[[broker."akane/1"]]
host = "192.168.1.23"
port = 1884
retry_interval = 10

[device."dora"]
type = "dummy"
broker = "sango"
qos = 1
interval = 5
payload = "Hello world."
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.config_file(), temp_file.path().display().to_string());
    assert_eq!(config.gateway_name(), "ham");
    assert_eq!(config.gateway().max_retry_count, 5);
    assert_eq!(config.gateway().retry_interval, Duration::from_secs(2));
    assert_eq!(config.gateway().status_interval, Some(Duration::from_secs(30)));
    assert_eq!(config.broker_names(), vec!["sango", "akane"]);

    let sango = &config.brokers()[0];
    assert_eq!(sango.priority, 2);
    assert_eq!(sango.url(), "tcp://192.168.1.22:1883");
    assert_eq!(sango.will_topic, "pre/ham/will");
    assert_eq!(sango.will_message.as_deref(), Some(&b"no letter is good letter."[..]));

    let akane = &config.brokers()[1];
    assert_eq!(akane.retry_interval, Some(Duration::from_secs(10)));
    assert!(akane.will_message.is_none());

    let dora = &config.devices()[0];
    assert_eq!(dora.broker.as_deref(), Some("sango"));
    assert!(matches!(dora.kind, DeviceKind::Dummy { interval, .. } if interval == Duration::from_secs(5)));
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_tls_broker_loads_certificates() {
    let dir = TempDir::new().unwrap();
    let ca = dir.path().join("ca.pem");
    let cert = dir.path().join("client.pem");
    let key = dir.path().join("client.key");
    std::fs::write(&ca, include_str!("fixtures/cert.pem")).unwrap();
    std::fs::write(&cert, include_str!("fixtures/client.pem")).unwrap();
    std::fs::write(&key, include_str!("fixtures/client.key")).unwrap();

    let temp_file = write_config(&format!(
        r#"
[gateway]
name = "ham"

[[broker."secure"]]
host = "mqtt.example.com"
port = 8883
tls = true
cacert = "{}"

[[broker."mutual"]]
host = "192.168.1.22"
port = 8883
tls = true
tls_verify_hostname = false
cacert = "{}"
client_cert = "{}"
client_key = "{}"
"#,
        ca.display(),
        ca.display(),
        cert.display(),
        key.display()
    ));

    let config = Config::from_file(temp_file.path()).unwrap();
    let secure = &config.brokers()[0];
    assert_eq!(secure.url(), "ssl://mqtt.example.com:8883");
    let tls = secure.tls.as_ref().unwrap();
    assert!(!tls.has_client_auth());
    assert!(tls.verifies_hostname());

    let tls = config.brokers()[1].tls.as_ref().unwrap();
    assert!(tls.has_client_auth());
    assert!(!tls.verifies_hostname());
}

#[test]
fn test_tls_pem_wrapped_garbage_rejected() {
    let dir = TempDir::new().unwrap();
    let ca = dir.path().join("ca.pem");
    std::fs::write(&ca, "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n")
        .unwrap();

    let temp_file = write_config(&format!(
        r#"
[gateway]
name = "ham"

[[broker."secure"]]
host = "mqtt.example.com"
port = 8883
tls = true
cacert = "{}"
"#,
        ca.display()
    ));
    assert!(matches!(Config::from_file(temp_file.path()), Err(ConfigError::Tls { .. })));
}

#[test]
fn test_tls_without_cacert_rejected() {
    let temp_file = write_config(
        r#"
[gateway]
name = "ham"

[[broker."secure"]]
host = "mqtt.example.com"
port = 8883
tls = true
"#,
    );
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_custom_rules_applied_to_file() {
    let temp_file = write_config(
        r#"
[gateway]
name = "a-rather-long-gateway-name"

[[broker."sango"]]
host = "localhost"
port = 1883
"#,
    );
    let rules = ValidationRules { max_field_len: 8, ..ValidationRules::default() };
    assert!(Config::from_file_with_rules(temp_file.path(), &rules).is_err());
    assert!(Config::from_file(temp_file.path()).is_ok());
}

#[tokio::test]
async fn test_gateway_orders_configured_brokers() {
    let temp_file = write_config(
        r#"
[gateway]
name = "ham"

[[broker."low/3"]]
host = "localhost"
port = 1883

[[broker."high/1"]]
host = "localhost"
port = 1884

[[broker."mid/2"]]
host = "localhost"
port = 1885
"#,
    );
    let config = Config::from_file(temp_file.path()).unwrap();
    let gateway = Gateway::from_config(&config);
    assert_eq!(gateway.name(), "ham");

    let brokers: &BrokerSet = gateway.brokers();
    let names: Vec<&str> = brokers.iter().map(|b| b.name()).collect();
    assert_eq!(names, vec!["high", "mid", "low"]);
}

#[test]
fn test_sample_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/gateway.toml");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.gateway_name(), "ham");
    assert_eq!(config.broker_names(), vec!["local", "backup"]);
    assert_eq!(config.brokers()[0].will_message.as_deref(), Some(&[0x00, 0x01][..]));
    assert!(matches!(config.devices()[1].kind, DeviceKind::Serial { size: 4, .. }));
}
