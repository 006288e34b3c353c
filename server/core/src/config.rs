//! The server configuration as processed from the startup wrapper.
//!
//! [ServerConfig] is the on-disk toml form, [Configuration] is what the rest of
//! the server consumes once defaults are applied and values are checked.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use sketching::tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::constants::DEFAULT_LDAP_ADDRESS;
use crate::error::OperationError;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The root domain that probes embed their identifier under.
    pub domain: String,
    pub ldapbindaddress: Option<String>,
    /// Key for records that carry no correlation identifier. Random if unset.
    pub token: Option<String>,
    pub tls_chain: Option<String>,
    pub tls_key: Option<String>,
    /// Append records to this json-lines file instead of keeping them in memory.
    pub interaction_log: Option<String>,
    pub log_level: Option<LogLevel>,
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, std::io::Error> {
        let mut f = File::open(config_path.as_ref()).map_err(|e| {
            eprintln!(
                "Unable to open config file {:?} -> {:?}",
                config_path.as_ref(),
                e
            );
            e
        })?;

        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            eprintln!("unable to read contents {:?}", e);
            e
        })?;

        toml::from_str(contents.as_str()).map_err(|e| {
            eprintln!("unable to parse config {:?}", e);
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })
    }
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

impl FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err("Must be one of info, debug, trace"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

impl From<LogLevel> for EnvFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Info => EnvFilter::new("info"),
            LogLevel::Debug => EnvFilter::new("debug"),
            LogLevel::Trace => EnvFilter::new("trace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfiguration {
    pub chain: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub domain: String,
    pub ldapaddress: String,
    pub token: String,
    pub tls_config: Option<TlsConfiguration>,
    pub interaction_log: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain: {}, ", self.domain)?;
        write!(f, "ldap address: {}, ", self.ldapaddress)?;
        match &self.tls_config {
            Some(tls) => write!(f, "tls chain: {}, ", tls.chain.display()),
            None => write!(f, "tls chain: built in loopback certificate, "),
        }?;
        match &self.interaction_log {
            Some(p) => write!(f, "interaction log: {}, ", p.display()),
            None => write!(f, "interaction log: memory, "),
        }?;
        write!(f, "log_level: {}", self.log_level)
    }
}

impl Configuration {
    pub fn new(domain: &str) -> Self {
        Configuration {
            domain: domain.to_string(),
            ldapaddress: DEFAULT_LDAP_ADDRESS.to_string(),
            token: Uuid::new_v4().simple().to_string(),
            tls_config: None,
            interaction_log: None,
            log_level: LogLevel::default(),
        }
    }

    pub fn update_ldapbind(&mut self, l: &Option<String>) {
        if let Some(l) = l {
            self.ldapaddress = l.clone();
        }
    }

    pub fn update_token(&mut self, t: &Option<String>) {
        if let Some(t) = t {
            self.token = t.clone();
        }
    }

    pub fn update_tls(&mut self, chain: &Option<String>, key: &Option<String>) {
        self.tls_config = match (chain, key) {
            (Some(chain), Some(key)) => Some(TlsConfiguration {
                chain: PathBuf::from(chain),
                key: PathBuf::from(key),
            }),
            _ => None,
        };
    }

    pub fn update_interaction_log(&mut self, p: &Option<String>) {
        self.interaction_log = p.as_ref().map(PathBuf::from);
    }

    pub fn update_log_level(&mut self, level: &Option<LogLevel>) {
        self.log_level = level.unwrap_or_default();
    }

    /// Apply `sconfig` over the defaults and check the result.
    pub fn try_from_server_config(sconfig: &ServerConfig) -> Result<Self, OperationError> {
        if sconfig.domain.trim().is_empty() {
            return Err(OperationError::InvalidConfiguration(
                "domain must be set".to_string(),
            ));
        }

        if sconfig.tls_chain.is_some() != sconfig.tls_key.is_some() {
            return Err(OperationError::InvalidConfiguration(
                "tls_chain and tls_key must be set together".to_string(),
            ));
        }

        if matches!(&sconfig.token, Some(t) if t.is_empty()) {
            return Err(OperationError::InvalidConfiguration(
                "token must not be empty".to_string(),
            ));
        }

        let mut config = Configuration::new(sconfig.domain.trim());
        config.update_ldapbind(&sconfig.ldapbindaddress);
        config.update_token(&sconfig.token);
        config.update_tls(&sconfig.tls_chain, &sconfig.tls_key);
        config.update_interaction_log(&sconfig.interaction_log);
        config.update_log_level(&sconfig.log_level);

        if config.ldapaddress.starts_with(":::") {
            // takes :::xxxx to xxxx
            let port = config.ldapaddress.replacen(":::", "", 1);
            return Err(OperationError::InvalidConfiguration(format!(
                "Address '{}' looks like an attempt to wildcard bind with IPv6 on port {} - please try using ldapbindaddress = '[::]:{}'",
                config.ldapaddress, port, port
            )));
        }

        SocketAddr::from_str(&config.ldapaddress).map_err(|e| {
            OperationError::InvalidConfiguration(format!(
                "Could not parse LDAP server address {} -> {:?}",
                config.ldapaddress, e
            ))
        })?;

        Ok(config)
    }
}
