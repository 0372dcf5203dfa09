//! SSH transport built on `russh`.
//!
//! Each accepted TCP connection runs the SSH handshake and password
//! authentication, then forwards its channel opens and channel requests into
//! [`Server::serve_connection`]. Replies to channel requests are sent from
//! spawned tasks through the session [`Handle`], so the connection handler
//! never waits on the shell.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, MethodSet, Pty};
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialCheck;
use crate::payload::{encode_pty_request, encode_subsystem, encode_window_change, Dimensions};
use crate::server::Server;
use crate::transport::{
    ChannelRequest, PendingChannel, Verdict, PTY_REQUEST, SESSION_CHANNEL, SHELL_REQUEST,
    SUBSYSTEM_REQUEST, WINDOW_CHANGE_REQUEST,
};

const CHANNEL_QUEUE: usize = 16;
const REQUEST_QUEUE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("failed to load host key {}: {source}", path.display())]
    HostKey {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read an unencrypted private host key.
pub fn load_host_key(path: &Path) -> Result<KeyPair, SshError> {
    russh_keys::load_secret_key(path, None).map_err(|source| SshError::HostKey {
        path: path.to_path_buf(),
        source,
    })
}

/// Accepts SSH connections and serves them with a [`Server`].
pub struct SshServer {
    server: Server,
    credentials: Arc<dyn CredentialCheck>,
    config: Arc<russh::server::Config>,
}

impl SshServer {
    pub fn new(server: Server, credentials: Arc<dyn CredentialCheck>, host_key: KeyPair) -> Self {
        let config = russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PASSWORD,
            auth_rejection_time: Duration::from_secs(1),
            ..Default::default()
        };
        Self {
            server,
            credentials,
            config: Arc::new(config),
        }
    }

    /// Bind `addr` and serve until `cancel` fires.
    pub async fn listen(&self, addr: &str, cancel: CancellationToken) -> Result<(), SshError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for ssh connections");
        self.serve(listener, cancel).await;
        Ok(())
    }

    /// Accept loop. In-flight connections keep running after `cancel`
    /// fires; only new connections stop being accepted.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("ssh server received cancel signal, stopping accept loop");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((tcp, peer)) => {
                            let _ = tcp.set_nodelay(true);
                            tokio::spawn(serve_tcp(
                                self.server.clone(),
                                self.credentials.clone(),
                                self.config.clone(),
                                tcp,
                                peer,
                            ));
                        }
                        Err(e) => {
                            tracing::error!(?e, "failed to accept ssh connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

async fn serve_tcp(
    server: Server,
    credentials: Arc<dyn CredentialCheck>,
    config: Arc<russh::server::Config>,
    tcp: TcpStream,
    peer: SocketAddr,
) {
    tracing::info!(%peer, "connection accepted");
    let (channels_tx, channels_rx) = mpsc::channel(CHANNEL_QUEUE);
    tokio::spawn(async move {
        server.serve_connection(channels_rx).await;
    });

    let handler = ConnectionHandler {
        peer,
        credentials,
        channels: channels_tx,
        requests: HashMap::new(),
    };
    match russh::server::run_stream(config, tcp, handler).await {
        Ok(session) => {
            if let Err(e) = session.await {
                tracing::debug!(%peer, ?e, "connection ended with error");
            }
        }
        Err(e) => tracing::warn!(%peer, ?e, "ssh handshake failed"),
    }
    tracing::info!(%peer, "connection closed");
}

struct ConnectionHandler {
    peer: SocketAddr,
    credentials: Arc<dyn CredentialCheck>,
    channels: mpsc::Sender<PendingChannel>,
    requests: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
}

impl ConnectionHandler {
    /// Queue a request for the channel's task and answer it once the task
    /// replies. Requests on unknown channels fail straight away.
    async fn forward(&mut self, id: ChannelId, kind: &str, payload: Bytes, session: &mut Session) {
        let (request, reply) = ChannelRequest::new(kind, payload);
        let handle = session.handle();
        match self.requests.get(&id) {
            Some(tx) => {
                if tx.send(request).await.is_err() {
                    self.requests.remove(&id);
                }
            }
            None => {
                session.channel_failure(id);
                return;
            }
        }
        tokio::spawn(send_reply(handle, id, reply));
    }

    async fn forward_without_reply(&mut self, id: ChannelId, kind: &str, payload: Bytes) {
        let Some(tx) = self.requests.get(&id) else {
            return;
        };
        if tx.send(ChannelRequest::without_reply(kind, payload)).await.is_err() {
            self.requests.remove(&id);
        }
    }
}

/// A dropped reply sender means the request was ignored; the client gets
/// a failure so it does not wait forever.
async fn send_reply(handle: Handle, id: ChannelId, reply: oneshot::Receiver<bool>) {
    let result = match reply.await {
        Ok(true) => handle.channel_success(id).await,
        Ok(false) | Err(_) => handle.channel_failure(id).await,
    };
    if result.is_err() {
        tracing::debug!(?id, "connection gone before channel reply");
    }
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.credentials.check_password(user, password.as_bytes()) {
            tracing::info!(peer = %self.peer, %user, "password accepted");
            Ok(Auth::Accept)
        } else {
            tracing::warn!(peer = %self.peer, %user, "password rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let stream = SshChannel {
            inner: channel.into_stream(),
            closer: Some((session.handle(), id)),
        };
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (pending, verdict) = PendingChannel::new(SESSION_CHANNEL, Box::new(stream), requests_rx);
        if self.channels.send(pending).await.is_err() {
            return Ok(false);
        }
        match verdict.await {
            Ok(Verdict::Accepted) => {
                self.requests.insert(id, requests_tx);
                Ok(true)
            }
            Ok(Verdict::Rejected { reason, message }) => {
                tracing::debug!(peer = %self.peer, ?reason, %message, "session channel rejected");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.forward(channel, SHELL_REQUEST, Bytes::new(), session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, SUBSYSTEM_REQUEST, encode_subsystem(name), session)
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Terminal modes are not interpreted.
        let payload = encode_pty_request(term, Dimensions::new(col_width, row_height), &[]);
        self.forward(channel, PTY_REQUEST, payload, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_window_change(Dimensions::new(col_width, row_height));
        self.forward_without_reply(channel, WINDOW_CHANGE_REQUEST, payload)
            .await;
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.requests.remove(&channel);
        Ok(())
    }
}

/// A russh channel stream that also closes the SSH channel on shutdown.
struct SshChannel<S> {
    inner: S,
    closer: Option<(Handle, ChannelId)>,
}

impl<S: AsyncRead + Unpin> AsyncRead for SshChannel<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SshChannel<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let result = std::task::ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        if let Some((handle, id)) = self.closer.take() {
            tokio::spawn(async move {
                let _ = handle.close(id).await;
            });
        }
        Poll::Ready(result)
    }
}
