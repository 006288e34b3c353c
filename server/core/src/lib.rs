//! The ldapcatch server core. An LDAP responder that answers every request
//! with a scripted success and records what it was asked, so that
//! out-of-band probes (eg JNDI lookups) can be correlated back to whoever
//! triggered them.
//!
//! [create_ldap_server] starts the listener; everything under it is best
//! effort and never takes the process down.

#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate sketching;

pub mod config;
pub mod constants;
pub mod correlation;
pub mod error;
pub mod interaction;
mod ldaps;
pub mod recorder;
pub mod responder;
pub mod storage;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Configuration;
use crate::correlation::CorrelationMatcher;
use crate::error::OperationError;
use crate::recorder::InteractionRecorder;
use crate::responder::LdapResponder;
use crate::storage::{FileStorage, InteractionStorage, MemoryStorage};
use crate::tls::{CertificateProvider, FileCertificateProvider, TlsUpgradeManager};

pub use crate::ldaps::{InteractionLogger, LogSeverity, ProtocolLogger};

#[derive(Clone, Debug)]
pub enum CoreAction {
    Shutdown,
}

pub struct LdapServerHandle {
    clean_shutdown: bool,
    tx: broadcast::Sender<CoreAction>,
    local_addr: SocketAddr,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl LdapServerHandle {
    /// The address the listener is bound to. Differs from the configured
    /// address when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Connections that are already open finish
    /// on their own.
    pub async fn shutdown(&mut self) {
        if self.tx.send(CoreAction::Shutdown).is_err() {
            eprintln!("No receivers acked shutdown request. Treating as unclean.");
            return;
        }

        // Wait on the handles.
        while let Some(handle) = self.handles.pop() {
            if handle.await.is_err() {
                eprintln!("A task failed to join");
            }
        }

        self.clean_shutdown = true;
    }
}

impl Drop for LdapServerHandle {
    fn drop(&mut self) {
        if !self.clean_shutdown {
            eprintln!("⚠️  UNCLEAN SHUTDOWN OCCURRED ⚠️ ");
        }
    }
}

/// The storage named by the configuration: a json-lines file when
/// `interaction_log` is set, memory otherwise.
pub async fn storage_from_config(
    config: &Configuration,
) -> Result<Arc<dyn InteractionStorage>, OperationError> {
    match &config.interaction_log {
        Some(path) => {
            let storage = FileStorage::open(path).await?;
            admin_info!(path = %path.display(), "Recording interactions to file");
            Ok(Arc::new(storage))
        }
        None => {
            admin_warn!("No interaction_log configured, interactions are only kept in memory");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

pub fn certificate_provider_from_config(
    config: &Configuration,
) -> Option<Arc<dyn CertificateProvider>> {
    config.tls_config.as_ref().map(|tls| {
        Arc::new(FileCertificateProvider::new(&tls.chain, &tls.key)) as Arc<dyn CertificateProvider>
    })
}

/// Bind the listener and start serving.
pub async fn create_ldap_server(
    config: &Configuration,
    storage: Arc<dyn InteractionStorage>,
    provider: Option<Arc<dyn CertificateProvider>>,
) -> Result<LdapServerHandle, OperationError> {
    let matcher = CorrelationMatcher::new(&config.domain)?;

    // Refuse to start with a certificate that would fail every handshake.
    if let Some(provider) = provider.as_ref() {
        provider.certificate().map_err(|e| {
            admin_error!(err = ?e, "Unable to load the configured TLS certificate");
            e
        })?;
    }
    let tls = Arc::new(TlsUpgradeManager::new(provider)?);

    let recorder = Arc::new(InteractionRecorder::new(storage, config.token.clone()));
    let responder = Arc::new(LdapResponder::new(recorder.clone(), matcher));
    let logger: Arc<dyn ProtocolLogger> = Arc::new(InteractionLogger::new(recorder));

    let (broadcast_tx, broadcast_rx) = broadcast::channel(4);

    let (ldap_acceptor_handle, local_addr) =
        ldaps::create_ldap_listener(&config.ldapaddress, responder, tls, logger, broadcast_rx)
            .await?;

    admin_info!(%local_addr, domain = %config.domain, "ldapcatch ready to accept connections 🦀");

    Ok(LdapServerHandle {
        clean_shutdown: false,
        tx: broadcast_tx,
        local_addr,
        handles: vec![ldap_acceptor_handle],
    })
}
