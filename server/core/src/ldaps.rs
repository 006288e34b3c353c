//! The LDAP listener. Accepts connections, frames messages with the ldap
//! codec and hands each one to the responder in order.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use ldap3_proto::proto::LdapMsg;
use ldap3_proto::LdapCodec;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};

use crate::error::{OperationError, SessionError, TlsError};
use crate::recorder::InteractionRecorder;
use crate::responder::{Flow, LdapClient, LdapResponder};
use crate::tls::{TlsUpgradeManager, UpgradeError, UpgradedStream};
use crate::CoreAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    /// The listener can not continue.
    Fatal,
    /// A connection task died unexpectedly.
    Panic,
    Print,
}

/// Receives every diagnostic raised by the connection layer.
#[async_trait]
pub trait ProtocolLogger: Send + Sync {
    async fn log(&self, severity: LogSeverity, message: String);
}

/// Turns protocol diagnostics into interactions. Garbage that the codec
/// rejects is as interesting as a well formed probe.
pub struct InteractionLogger {
    recorder: Arc<InteractionRecorder>,
}

impl InteractionLogger {
    pub fn new(recorder: Arc<InteractionRecorder>) -> Self {
        InteractionLogger { recorder }
    }
}

#[async_trait]
impl ProtocolLogger for InteractionLogger {
    async fn log(&self, severity: LogSeverity, message: String) {
        match severity {
            LogSeverity::Fatal | LogSeverity::Panic => {
                admin_error!(?severity, "{}", message);
            }
            LogSeverity::Print => {
                admin_info!("{}", message);
            }
        }
        self.recorder.record_internal(&message).await;
    }
}

enum Transport<S> {
    Plain(S),
    Tls(UpgradedStream<S>),
}

impl<S> AsyncRead for Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Wraps the ldap codec so that a message which was framed but failed to
/// parse is yielded as an item instead of ending the stream.
#[derive(Default)]
struct SessionCodec {
    inner: LdapCodec,
}

impl Decoder for SessionCodec {
    type Item = Result<LdapMsg, io::Error>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let pending = buf.len();
        match self.inner.decode(buf) {
            Ok(msg) => Ok(msg.map(Ok)),
            // The bad message was consumed, the next one starts at buf.
            Err(e) if buf.len() < pending => Ok(Some(Err(e))),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<LdapMsg> for SessionCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: LdapMsg, buf: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(msg, buf)
    }
}

type AbandonFlag = Arc<AtomicBool>;

/// A connected client session.
struct ClientConnection<S> {
    // None only while the transport is being swapped, or after a failed
    // upgrade lost the socket.
    framed: Option<Framed<Transport<S>, SessionCodec>>,
    client_address: SocketAddr,
    tls: Arc<TlsUpgradeManager>,
    in_flight: Mutex<HashMap<i32, AbandonFlag>>,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, client_address: SocketAddr, tls: Arc<TlsUpgradeManager>) -> Self {
        ClientConnection {
            framed: Some(Framed::new(Transport::Plain(stream), SessionCodec::default())),
            client_address,
            tls,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn next(&mut self) -> Option<Result<LdapMsg, SessionError>> {
        let framed = self.framed.as_mut()?;
        framed.next().await.map(|r| match r {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(e)) => Err(SessionError::Malformed(e.to_string())),
            Err(e) => Err(SessionError::Codec(format!("{e:?}"))),
        })
    }

    fn begin(&self, msgid: i32) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msgid, Arc::new(AtomicBool::new(false)));
    }

    fn finish(&self, msgid: i32) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msgid);
    }
}

#[async_trait]
impl<S> LdapClient for ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn remote_address(&self) -> SocketAddr {
        self.client_address
    }

    async fn write(&mut self, msg: LdapMsg) -> Result<(), SessionError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or(SessionError::TransportUnavailable)?;
        framed
            .send(msg)
            .await
            .map_err(|e| SessionError::Codec(format!("{e:?}")))
    }

    async fn start_tls(&mut self) -> Result<(), TlsError> {
        let framed = self.framed.take().ok_or(TlsError::TransportUnavailable)?;
        let parts = framed.into_parts();
        let stream = match parts.io {
            Transport::Plain(stream) => stream,
            tls @ Transport::Tls(_) => {
                let mut restored = FramedParts::new::<LdapMsg>(tls, parts.codec);
                restored.read_buf = parts.read_buf;
                restored.write_buf = parts.write_buf;
                self.framed = Some(Framed::from_parts(restored));
                return Err(TlsError::AlreadyEncrypted);
            }
        };

        if !parts.read_buf.is_empty() {
            request_warn!(
                client_address = %self.client_address,
                pending = parts.read_buf.len(),
                "Discarding plaintext sent ahead of the TLS handshake"
            );
        }

        match self.tls.upgrade(stream).await {
            Ok(tlsstream) => {
                self.framed = Some(Framed::new(Transport::Tls(tlsstream), parts.codec));
                Ok(())
            }
            Err(UpgradeError { error, stream }) => {
                match stream {
                    Some(stream) => {
                        self.framed = Some(Framed::new(Transport::Plain(stream), parts.codec));
                    }
                    None => {
                        security_error!(client_address = %self.client_address, "Lost the client socket during a failed TLS handshake");
                    }
                }
                Err(error)
            }
        }
    }

    fn abandon(&self, msgid: i32) -> bool {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match in_flight.get(&msgid) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn is_abandoned(&self, msgid: i32) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msgid)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or_default()
    }
}

async fn client_process<S>(
    stream: S,
    client_address: SocketAddr,
    responder: Arc<LdapResponder>,
    tls: Arc<TlsUpgradeManager>,
    logger: Arc<dyn ProtocolLogger>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    logger
        .log(
            LogSeverity::Print,
            format!("LDAP client {client_address} connected"),
        )
        .await;

    let mut conn = ClientConnection::new(stream, client_address, tls);

    // Requests on one connection are handled strictly in order.
    while let Some(next) = conn.next().await {
        let protomsg = match next {
            Ok(protomsg) => protomsg,
            Err(e @ SessionError::Malformed(_)) => {
                logger
                    .log(
                        LogSeverity::Print,
                        format!("LDAP client {client_address} sent an invalid message: {e}"),
                    )
                    .await;
                continue;
            }
            Err(e) => {
                // The ber framing itself is broken, nothing after this can be read.
                logger
                    .log(
                        LogSeverity::Print,
                        format!("LDAP client {client_address} sent unreadable data: {e}"),
                    )
                    .await;
                break;
            }
        };

        let msgid = protomsg.msgid;
        conn.begin(msgid);
        let result = responder.handle(&mut conn, protomsg).await;
        conn.finish(msgid);

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                logger
                    .log(
                        LogSeverity::Print,
                        format!("Unable to write to LDAP client {client_address}: {e}"),
                    )
                    .await;
                break;
            }
        }
    }

    logger
        .log(
            LogSeverity::Print,
            format!("LDAP client {client_address} disconnected"),
        )
        .await;
}

/// Runs each connection in its own task, and reports it if that task dies.
fn spawn_client(
    stream: tokio::net::TcpStream,
    client_address: SocketAddr,
    responder: Arc<LdapResponder>,
    tls: Arc<TlsUpgradeManager>,
    logger: Arc<dyn ProtocolLogger>,
) {
    tokio::spawn(async move {
        let session = tokio::spawn(client_process(
            stream,
            client_address,
            responder,
            tls,
            logger.clone(),
        ));
        if let Err(e) = session.await {
            if e.is_panic() {
                logger
                    .log(
                        LogSeverity::Panic,
                        format!("LDAP client {client_address} task panicked"),
                    )
                    .await;
            }
        }
    });
}

async fn ldap_acceptor(
    listener: TcpListener,
    responder: Arc<LdapResponder>,
    tls: Arc<TlsUpgradeManager>,
    logger: Arc<dyn ProtocolLogger>,
    mut rx: broadcast::Receiver<CoreAction>,
) {
    loop {
        tokio::select! {
            action = rx.recv() => {
                match action {
                    Ok(CoreAction::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        logger
                            .log(LogSeverity::Fatal, "LDAP control channel closed, stopping listener".to_string())
                            .await;
                        break;
                    }
                }
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((tcpstream, client_socket_addr)) => {
                        spawn_client(tcpstream, client_socket_addr, responder.clone(), tls.clone(), logger.clone());
                    }
                    Err(e) => {
                        logger
                            .log(LogSeverity::Print, format!("LDAP acceptor error, continuing -> {:?}", e))
                            .await;
                    }
                }
            }
        }
    }
    info!("Stopped LDAP listener");
}

/// Bind `address` and start accepting. Returns the acceptor task and the
/// address actually bound.
pub(crate) async fn create_ldap_listener(
    address: &str,
    responder: Arc<LdapResponder>,
    tls: Arc<TlsUpgradeManager>,
    logger: Arc<dyn ProtocolLogger>,
    rx: broadcast::Receiver<CoreAction>,
) -> Result<(JoinHandle<()>, SocketAddr), OperationError> {
    let addr = SocketAddr::from_str(address).map_err(|e| {
        OperationError::InvalidConfiguration(format!(
            "Could not parse LDAP server address {} -> {:?}",
            address, e
        ))
    })?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| OperationError::Bind {
            address: address.to_string(),
            source,
        })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| OperationError::Bind {
            address: address.to_string(),
            source,
        })?;

    logger
        .log(
            LogSeverity::Print,
            format!("Starting LDAP interface ldap://{local_addr} ..."),
        )
        .await;

    let handle = tokio::spawn(ldap_acceptor(listener, responder, tls, logger, rx));
    Ok((handle, local_addr))
}
