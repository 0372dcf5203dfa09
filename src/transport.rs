//! Events the secure transport hands to the multiplexer.
//!
//! The transport (see the `ssh` module) does the handshake, encryption and
//! authentication. For every channel a client opens it produces a
//! [`PendingChannel`]; the multiplexer decides whether to accept it and then
//! receives the channel's control requests as [`ChannelRequest`]s.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// The only channel type the multiplexer accepts.
pub const SESSION_CHANNEL: &str = "session";

pub const SHELL_REQUEST: &str = "shell";
pub const SUBSYSTEM_REQUEST: &str = "subsystem";
pub const PTY_REQUEST: &str = "pty-req";
pub const WINDOW_CHANGE_REQUEST: &str = "window-change";

/// A bidirectional byte stream carried by one channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

pub type BoxedChannel = Box<dyn ChannelStream>;

/// Channel open failure reasons, numbered as on the SSH wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

/// The multiplexer's answer to a channel open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: RejectReason, message: String },
}

/// A channel the client asked to open, awaiting a [`Verdict`].
pub struct PendingChannel {
    channel_type: String,
    stream: BoxedChannel,
    requests: mpsc::Receiver<ChannelRequest>,
    verdict: oneshot::Sender<Verdict>,
}

impl PendingChannel {
    /// Wrap a freshly opened channel. The returned receiver resolves once
    /// the channel is accepted or rejected; it errors if the pending channel
    /// is dropped undecided.
    pub fn new(
        channel_type: impl Into<String>,
        stream: BoxedChannel,
        requests: mpsc::Receiver<ChannelRequest>,
    ) -> (Self, oneshot::Receiver<Verdict>) {
        let (verdict, verdict_rx) = oneshot::channel();
        let pending = Self {
            channel_type: channel_type.into(),
            stream,
            requests,
            verdict,
        };
        (pending, verdict_rx)
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Accept the channel, taking ownership of its byte stream and requests.
    pub fn accept(self) -> (BoxedChannel, mpsc::Receiver<ChannelRequest>) {
        let _ = self.verdict.send(Verdict::Accepted);
        (self.stream, self.requests)
    }

    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        let _ = self.verdict.send(Verdict::Rejected {
            reason,
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for PendingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingChannel")
            .field("channel_type", &self.channel_type)
            .finish_non_exhaustive()
    }
}

/// A typed control request received on an open channel.
#[derive(Debug)]
pub struct ChannelRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// A request whose sender wants a reply. The receiver yields the reply,
    /// or errors if the request is dropped without one.
    pub fn new(kind: impl Into<String>, payload: Bytes) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    /// A request that carries no reply (e.g. `window-change`).
    pub fn without_reply(kind: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            payload,
            reply: None,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the request. Later calls are no-ops.
    pub fn reply(&mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }
}
