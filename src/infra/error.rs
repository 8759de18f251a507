//! Error types for configuration, connectivity and publishing

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration failures. Fatal: the gateway does not start.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing [gateway] section")]
    MissingGateway,

    #[error("{section}: {field} {reason}")]
    Invalid { section: String, field: &'static str, reason: String },

    #[error("{section}: {source}")]
    Tls {
        section: String,
        #[source]
        source: TlsError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: impl Into<String>,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Invalid { section: section.into(), field, reason: reason.into() }
    }
}

/// TLS material loading failures
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("cacert must be set when tls is enabled")]
    MissingCaCert,

    #[error("certificate file {path} could not be read: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse certificate {path}: {reason}")]
    CertificateParse { path: String, reason: String },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("failed to parse private key {path}: {reason}")]
    PrivateKeyParse { path: String, reason: String },

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("client certificate requires private key")]
    MissingClientKey,

    #[error("client key requires client certificate")]
    MissingClientCert,
}

/// Network or handshake failure on a broker connection.
///
/// Never fatal; feeds the reconnect supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("broker {broker}: {reason}")]
    Failed { broker: String, reason: String },

    #[error("broker {0} is not connected")]
    NotConnected(String),
}

/// Generated topic violates the publish topic grammar
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic {0:?} must not include the NUL character")]
    NulCharacter(String),

    #[error("publish topic {topic:?} must not include wildcard {wildcard:?}")]
    Wildcard { topic: String, wildcard: char },

    #[error("topic is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Failure to deliver a single message to a connected broker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before acknowledgement")]
    ConnectionClosed,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Will payload had trailing data that is not a `\xHH` escape.
///
/// Not an error: the bytes decoded before `offset` are still used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("will payload: unparsable data at offset {offset}: {remainder:?}")]
pub struct PayloadParseWarning {
    pub offset: usize,
    pub remainder: String,
}
