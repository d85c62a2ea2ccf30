//! Crate-level error types for startup and wiring failures.
//!
//! Runtime relay failures use [`crate::proxy::types::RelayError`]; this type
//! covers everything that can go wrong before the listener is serving.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid upstream server name: {0}")]
    ServerName(#[from] rustls::pki_types::InvalidDnsNameError),

    #[error("certificate error: {message}")]
    Certificate { message: String },

    #[error("invalid listen address: {0}")]
    ListenAddr(#[from] std::net::AddrParseError),
}

impl Error {
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
