//! StartTLS support: certificate selection, acceptor policy, and the in-place
//! handshake over an already established plaintext connection.
//!
//! The acceptor is deliberately permissive. Clients that probe us are often
//! old LDAP stacks, so SSLv3 through TLS 1.2 are offered with any cipher
//! OpenSSL will still agree to.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslOptions, SslVersion};
use openssl::x509::X509;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_openssl::SslStream;

use crate::error::TlsError;

/// Self signed pair valid for 127.0.0.1 and ::1 only.
const LOCALHOST_CERT: &[u8] = include_bytes!("../certs/localhost.crt");
const LOCALHOST_KEY: &[u8] = include_bytes!("../certs/localhost.key");

const LEGACY_CIPHER_LIST: &str = "ALL:@SECLEVEL=0";

const RSA_MIN_KEY_SIZE_BITS: u64 = 2048;
const EC_MIN_KEY_SIZE_BITS: u64 = 224;

#[derive(Clone)]
pub struct CertifiedKey {
    /// Leaf first, followed by any intermediates.
    pub chain: Vec<X509>,
    pub key: PKey<Private>,
}

impl CertifiedKey {
    fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let chain = X509::stack_from_pem(chain_pem)?;
        if chain.is_empty() {
            return Err(TlsError::Provider(
                "certificate chain contains no certificates".to_string(),
            ));
        }
        let key = PKey::private_key_from_pem(key_pem)?;
        Ok(CertifiedKey { chain, key })
    }

    /// The built in loopback certificate.
    pub fn localhost() -> Result<Self, TlsError> {
        Self::from_pem(LOCALHOST_CERT, LOCALHOST_KEY)
    }
}

/// Source of the current server certificate, eg an ACME client that renews in
/// the background. Called on every StartTLS so renewals take effect without a
/// restart.
pub trait CertificateProvider: Send + Sync {
    fn certificate(&self) -> Result<CertifiedKey, TlsError>;
}

/// Loads a PEM chain and key from disk on every request.
#[derive(Debug, Clone)]
pub struct FileCertificateProvider {
    chain: PathBuf,
    key: PathBuf,
}

impl FileCertificateProvider {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(chain: P, key: Q) -> Self {
        FileCertificateProvider {
            chain: chain.as_ref().to_path_buf(),
            key: key.as_ref().to_path_buf(),
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

impl CertificateProvider for FileCertificateProvider {
    fn certificate(&self) -> Result<CertifiedKey, TlsError> {
        let chain_pem = read_pem(&self.chain)?;
        let key_pem = read_pem(&self.key)?;
        let ck = CertifiedKey::from_pem(&chain_pem, &key_pem)?;
        check_privkey_minimums(&ck.key)?;
        Ok(ck)
    }
}

/// Ensure we're enforcing safe minimums for TLS keys
pub fn check_privkey_minimums(privkey: &PKeyRef<Private>) -> Result<(), TlsError> {
    if let Ok(key) = privkey.rsa() {
        if (key.size() as u64) < RSA_MIN_KEY_SIZE_BITS / 8 {
            Err(TlsError::WeakKey(format!(
                "TLS RSA key is less than {RSA_MIN_KEY_SIZE_BITS} bits!"
            )))
        } else {
            debug!("The RSA private key size is: {} bits, that's OK!", key.size() * 8);
            Ok(())
        }
    } else if let Ok(key) = privkey.ec_key() {
        let key_bits = u64::try_from(key.private_key().num_bits()).unwrap_or_default();
        if key_bits < EC_MIN_KEY_SIZE_BITS {
            Err(TlsError::WeakKey(format!(
                "TLS EC key is less than {EC_MIN_KEY_SIZE_BITS} bits! Got: {key_bits}"
            )))
        } else {
            debug!("The EC private key size is: {} bits, that's OK!", key_bits);
            Ok(())
        }
    } else {
        error!("TLS key is not RSA or EC, cannot check minimums!");
        Ok(())
    }
}

/// A plaintext stream that can be handed back if the TLS layer on top of it
/// fails. The tls stream owns one handle, the connection keeps the other.
pub struct SharedIo<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SharedIo<S> {
    fn clone(&self) -> Self {
        SharedIo {
            inner: self.inner.clone(),
        }
    }
}

impl<S> SharedIo<S> {
    fn new(stream: S) -> Self {
        SharedIo {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    fn take(&self) -> Option<S> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(Pin<&mut S>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>>
    where
        S: Unpin,
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(stream) => f(Pin::new(stream)),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream was reclaimed",
            ))),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SharedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.with_stream(|s| s.poll_read(cx, buf))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SharedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.with_stream(|s| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with_stream(|s| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with_stream(|s| s.poll_shutdown(cx))
    }
}

pub type UpgradedStream<S> = SslStream<SharedIo<S>>;

/// A failed upgrade. `stream` is the original plaintext stream when it could
/// be recovered, which is always the case unless the tls layer panicked.
pub struct UpgradeError<S> {
    pub error: TlsError,
    pub stream: Option<S>,
}

pub struct TlsUpgradeManager {
    provider: Option<Arc<dyn CertificateProvider>>,
    localhost: CertifiedKey,
}

impl TlsUpgradeManager {
    pub fn new(provider: Option<Arc<dyn CertificateProvider>>) -> Result<Self, TlsError> {
        let localhost = CertifiedKey::localhost()?;
        Ok(TlsUpgradeManager {
            provider,
            localhost,
        })
    }

    /// The provider's certificate when one is configured, the loopback pair
    /// otherwise. A failing provider also falls back to the loopback pair so
    /// that the handshake can still proceed.
    ///
    /// Providers may block on disk or network, so they run on the blocking
    /// pool rather than the connection's task.
    pub async fn select_certificate(&self) -> CertifiedKey {
        let Some(provider) = self.provider.clone() else {
            return self.localhost.clone();
        };

        let loaded = tokio::task::spawn_blocking(move || provider.certificate())
            .await
            .unwrap_or_else(|e| Err(TlsError::Provider(format!("provider task failed: {e}"))));

        match loaded {
            Ok(ck) => ck,
            Err(e) => {
                security_error!(err = ?e, "Certificate provider failed, using the loopback certificate");
                self.localhost.clone()
            }
        }
    }

    pub async fn acceptor(&self) -> Result<SslAcceptor, TlsError> {
        let ck = self.select_certificate().await;

        let mut tls_builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
        tls_builder.clear_options(SslOptions::NO_SSLV3 | SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1);
        tls_builder.set_cipher_list(LEGACY_CIPHER_LIST)?;
        tls_builder.set_min_proto_version(Some(SslVersion::SSL3))?;
        tls_builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;

        let mut chain = ck.chain.into_iter();
        let leaf = chain
            .next()
            .ok_or_else(|| TlsError::Provider("empty certificate chain".to_string()))?;
        tls_builder.set_certificate(&leaf)?;
        for intermediate in chain {
            tls_builder.add_extra_chain_cert(intermediate)?;
        }
        tls_builder.set_private_key(&ck.key)?;
        tls_builder.check_private_key()?;

        Ok(tls_builder.build())
    }

    /// Run the server side of a handshake over `stream`. On failure the
    /// plaintext stream is returned inside the error so the caller can keep
    /// using it.
    pub async fn upgrade<S>(&self, stream: S) -> Result<UpgradedStream<S>, UpgradeError<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = match self
            .acceptor()
            .await
            .and_then(|acceptor| Ssl::new(acceptor.context()).map_err(TlsError::from))
        {
            Ok(ssl) => ssl,
            Err(error) => {
                return Err(UpgradeError {
                    error,
                    stream: Some(stream),
                })
            }
        };

        let shared = SharedIo::new(stream);
        let reclaim = shared.clone();

        let mut tlsstream = match SslStream::new(ssl, shared) {
            Ok(t) => t,
            Err(e) => {
                return Err(UpgradeError {
                    error: e.into(),
                    stream: reclaim.take(),
                })
            }
        };

        match SslStream::accept(Pin::new(&mut tlsstream)).await {
            Ok(()) => Ok(tlsstream),
            Err(e) => {
                drop(tlsstream);
                Err(UpgradeError {
                    error: TlsError::Handshake(e),
                    stream: reclaim.take(),
                })
            }
        }
    }
}
