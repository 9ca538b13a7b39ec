use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use ssmp_wire as wire;
use ssmp_wire::{DecodeError, Decoder};

use crate::{
    auth::{Authenticator, PeerInfo},
    connection::Connection,
    dispatch::Dispatcher,
    registry::{ConnectionRegistry, TopicRegistry},
    stats::ServerStats,
    Io, RESP_BAD_REQUEST, RESP_OK,
};

/// Deadline for the first (LOGIN) message on a fresh connection.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
}

/// An SSMP server over a TCP listener, optionally wrapping accepted sockets
/// in TLS.
///
/// Cloning yields another handle to the same server, which makes the terse
/// test idiom possible:
///
/// ```ignore
/// let handle = server.start();
/// // ...
/// server.stop().await;
/// handle.await??;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    listener: TcpListener,
    auth: Arc<dyn Authenticator>,
    tls: Option<TlsAcceptor>,
    connections: ConnectionRegistry,
    topics: TopicRegistry,
    dispatcher: Dispatcher,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        auth: Arc<dyn Authenticator>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let connections = ConnectionRegistry::new();
        let topics = TopicRegistry::new();
        let stats = Arc::new(ServerStats::default());
        let dispatcher =
            Dispatcher::new(topics.clone(), connections.clone(), Arc::clone(&stats));
        Self {
            inner: Arc::new(Inner {
                listener,
                auth,
                tls,
                connections,
                topics,
                dispatcher,
                stats,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// The address the underlying listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Accepts connections in the calling task. Returns only on listener
    /// error or after [`Server::stop`].
    pub async fn serve(&self) -> Result<(), ServerError> {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                accepted = self.inner.listener.accept() => accepted,
            };
            let (stream, addr) = accepted?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, "failed to set TCP_NODELAY: {e:?}");
            }
            let inner = Arc::clone(&self.inner);
            self.inner.tracker.spawn(connect(inner, stream, addr));
        }
    }

    /// Spawns the accept loop and returns immediately.
    pub fn start(&self) -> JoinHandle<Result<(), ServerError>> {
        let server = self.clone();
        tokio::spawn(async move { server.serve().await })
    }

    /// Stops accepting, closes every live connection and waits for the
    /// connection tasks to finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        for conn in self.inner.connections.all() {
            conn.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Writes a human-readable snapshot of the registries and counters.
    /// Safe to call at any time, including during active traffic.
    pub fn dump_stats(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "------- server stats -------")?;
        self.inner.connections.dump(w)?;
        self.inner.topics.dump(w)?;
        writeln!(w, "{:5} connections accepted", self.inner.stats.accepted())?;
        writeln!(w, "{:5} bytes in", self.inner.stats.bytes_rx())?;
        writeln!(w, "{:5} bytes out", self.inner.stats.bytes_tx())?;
        writeln!(w, "----------------------------")
    }
}

struct Login {
    user: String,
    scheme: Vec<u8>,
    cred: Bytes,
}

enum LoginError {
    /// The first message was not a well-formed LOGIN request.
    Invalid,
    /// The transport failed before a full LOGIN arrived.
    Transport,
}

impl From<DecodeError> for LoginError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::InvalidMessage => LoginError::Invalid,
            DecodeError::Eof | DecodeError::Io(_) => LoginError::Transport,
        }
    }
}

/// Drives one accepted socket: TLS wrap, login handshake, registration and
/// the read loop. Ends with the connection closed and deregistered.
async fn connect(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    inner.stats.increment_accepted();
    let mut peer = PeerInfo { addr, peer_certificates: None };
    let io: Box<dyn Io> = match &inner.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => {
                peer.peer_certificates =
                    tls.get_ref().1.peer_certificates().map(|certs| certs.to_vec());
                Box::new(tls)
            }
            Err(e) => {
                debug!(%addr, "TLS handshake failed: {e:?}");
                return;
            }
        },
        None => Box::new(stream),
    };
    let (rd, mut wr) = tokio::io::split(io);
    let mut dec = Decoder::new(rd);

    let login = match timeout(LOGIN_TIMEOUT, read_login(&mut dec)).await {
        Ok(login) => login,
        Err(_) => {
            debug!(%addr, "login timed out");
            return;
        }
    };
    let login = match login {
        Ok(login) => login,
        Err(LoginError::Invalid) => {
            debug!(%addr, "connect rejected: invalid LOGIN");
            let _ = wr.write_all(RESP_BAD_REQUEST).await;
            return;
        }
        Err(LoginError::Transport) => return,
    };
    if !inner.auth.authenticate(&peer, login.user.as_bytes(), &login.scheme, &login.cred) {
        debug!(%addr, user = %login.user, "connect rejected: unauthorized");
        let _ = wr.write_all(&inner.auth.unauthorized()).await;
        return;
    }

    let conn = Connection::new(login.user, addr, wr, Arc::clone(&inner.stats));
    if conn.write(RESP_OK).await.is_err() {
        conn.close();
        return;
    }
    if inner.cancel.is_cancelled() {
        conn.close();
        return;
    }
    if let Some(displaced) = inner.connections.register(&conn) {
        debug!(user = %conn.user(), "closing displaced connection");
        displaced.close();
    }
    info!(user = %conn.user(), %addr, "client connected");
    Arc::clone(&conn).read_loop(dec, &inner.dispatcher).await;
    debug!(user = %conn.user(), %addr, "client disconnected");
}

/// Reads the handshake message: `LOGIN <user> <scheme> [credential]`. The
/// credential is everything after the scheme, possibly empty or binary.
async fn read_login<R: AsyncRead + Unpin>(dec: &mut Decoder<R>) -> Result<Login, LoginError> {
    let verb = dec.decode_verb().await?;
    if dec.bytes(verb) != wire::LOGIN {
        return Err(LoginError::Invalid);
    }
    let user = dec.decode_id().await?;
    let scheme = dec.decode_id().await?;
    let cred = dec.decode_trailing().await?;
    if !dec.at_end() {
        return Err(LoginError::Invalid);
    }
    let login = Login {
        user: String::from_utf8_lossy(dec.bytes(user)).into_owned(),
        scheme: dec.bytes(scheme).to_vec(),
        cred: Bytes::copy_from_slice(dec.bytes(cred)),
    };
    dec.reset();
    Ok(login)
}
