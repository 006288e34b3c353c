use std::io;

use thiserror::Error;

/// Startup and configuration failures. These are the only errors that can
/// stop the server; everything after the listener is bound is best effort.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid correlation domain {domain:?}: {source}")]
    InvalidDomain {
        domain: String,
        #[source]
        source: regex::Error,
    },
    #[error("unable to bind ldap listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("unable to encode storage entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("openssl: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("{0}")]
    Handshake(#[from] openssl::ssl::Error),
    #[error("certificate provider: {0}")]
    Provider(String),
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("tls key rejected: {0}")]
    WeakKey(String),
    #[error("connection is already using tls")]
    AlreadyEncrypted,
    #[error("connection transport is unavailable")]
    TransportUnavailable,
}

/// Failures writing to or reading from a single client connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("ldap codec: {0}")]
    Codec(String),
    /// A complete message arrived but is not valid ldap. The stream is still
    /// aligned on the next message.
    #[error("malformed ldap message: {0}")]
    Malformed(String),
    #[error("connection transport is unavailable")]
    TransportUnavailable,
}
