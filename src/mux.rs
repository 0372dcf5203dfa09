//! Per-connection channel multiplexer.
//!
//! Every channel the client opens is handled on its own task. Session
//! channels wait for either a `shell` request, which starts an interactive
//! [`session`](crate::session) on a [`Terminal`], or a `subsystem` request,
//! which hands the raw channel to a [`SubsystemHandler`].
//!
//! `pty-req` and `window-change` can arrive before the shell request has
//! created a terminal, so they are queued in arrival order. Whatever is
//! queued when the shell starts is applied before the first prompt; later
//! requests are applied by a single drainer task.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::commands::complete::complete;
use crate::commands::CommandRegistry;
use crate::payload::{parse_pty_request, parse_subsystem, parse_window_change};
use crate::session;
use crate::subsystem::{SubsystemHandler, SFTP_SUBSYSTEM};
use crate::terminal::{Resizable, Terminal, TerminalError};
use crate::transport::{
    BoxedChannel, ChannelRequest, PendingChannel, RejectReason, PTY_REQUEST, SESSION_CHANNEL,
    SHELL_REQUEST, SUBSYSTEM_REQUEST, WINDOW_CHANGE_REQUEST,
};

/// Capacity of the queue holding geometry requests for a terminal.
pub const PENDING_REQUEST_CAPACITY: usize = 16;

/// What a connection's channels are served with.
#[derive(Clone)]
pub struct MuxContext {
    pub registry: CommandRegistry,
    pub prompt: Arc<str>,
    pub motd: Option<Arc<str>>,
    pub sftp: Option<Arc<dyn SubsystemHandler>>,
}

/// Serve every channel opened on one connection until the transport stops
/// producing new channels.
pub async fn serve_connection(ctx: MuxContext, mut channels: mpsc::Receiver<PendingChannel>) {
    while let Some(channel) = channels.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_channel(ctx, channel).await;
        });
    }
    tracing::debug!("connection stopped opening channels");
}

/// Classify one channel and route its requests.
///
/// Returns once the channel's request stream ends; the shell or subsystem
/// task it started keeps running on its own.
pub async fn handle_channel(ctx: MuxContext, channel: PendingChannel) {
    let channel_type = channel.channel_type().to_string();
    if channel_type != SESSION_CHANNEL {
        tracing::info!(%channel_type, "rejecting channel");
        channel.reject(
            RejectReason::UnknownChannelType,
            format!("unknown channel type: {channel_type}"),
        );
        return;
    }

    let (stream, mut requests) = channel.accept();
    let (pending_tx, pending_rx) = mpsc::channel(PENDING_REQUEST_CAPACITY);
    let mut stream = Some(stream);
    let mut pending_rx = Some(pending_rx);

    while let Some(mut req) = requests.recv().await {
        match req.kind.as_str() {
            SHELL_REQUEST => {
                if !req.payload.is_empty() {
                    continue;
                }
                let (Some(stream), Some(pending)) = (stream.take(), pending_rx.take()) else {
                    tracing::debug!("ignoring shell request on a channel already in use");
                    continue;
                };
                req.reply(true);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    serve_shell(ctx, stream, pending).await;
                });
            }
            SUBSYSTEM_REQUEST => {
                let name = match parse_subsystem(&req.payload) {
                    Ok(name) => name,
                    Err(e) => {
                        tracing::warn!(?e, "malformed subsystem request");
                        continue;
                    }
                };
                if name != SFTP_SUBSYSTEM {
                    tracing::debug!(subsystem = %name, "ignoring unknown subsystem");
                    continue;
                }
                let Some(handler) = ctx.sftp.clone() else {
                    tracing::debug!("no sftp handler configured");
                    continue;
                };
                let Some(stream) = stream.take() else {
                    tracing::debug!("ignoring subsystem request on a channel already in use");
                    continue;
                };
                req.reply(true);
                tokio::spawn(async move {
                    serve_subsystem(handler, stream).await;
                });
            }
            PTY_REQUEST | WINDOW_CHANGE_REQUEST => {
                if pending_tx.send(req).await.is_err() {
                    tracing::debug!("terminal gone, dropping geometry request");
                }
            }
            other => {
                tracing::debug!(request = %other, "ignoring channel request");
            }
        }
    }
}

async fn serve_shell(
    ctx: MuxContext,
    stream: BoxedChannel,
    mut pending: mpsc::Receiver<ChannelRequest>,
) {
    let mut terminal = Terminal::new(stream, ctx.prompt.to_string());
    let size = terminal.size();
    while let Ok(req) = pending.try_recv() {
        apply_geometry(req, &size);
    }
    let registry = ctx.registry.clone();
    terminal.set_completer(Box::new(move |line, pos, key| complete(&registry, line, pos, key)));

    let drainer = tokio::spawn(drain_pending(pending, size));

    tracing::info!("shell session started");
    let result = match &ctx.motd {
        Some(motd) => match terminal.write(motd.as_bytes()).await {
            Ok(()) => session::run(&mut terminal, &ctx.registry).await,
            Err(e) => Err(e),
        },
        None => session::run(&mut terminal, &ctx.registry).await,
    };
    match result {
        Ok(()) => tracing::info!("shell session exited"),
        Err(TerminalError::Closed) => tracing::info!("shell session closed by client"),
        Err(e) => tracing::debug!(?e, "shell session ended with error"),
    }

    drainer.abort();
    let mut stream = terminal.into_inner();
    let _ = stream.shutdown().await;
}

async fn serve_subsystem(handler: Arc<dyn SubsystemHandler>, mut stream: BoxedChannel) {
    tracing::info!(subsystem = SFTP_SUBSYSTEM, "subsystem started");
    match handler.serve(&mut stream).await {
        Ok(()) => tracing::info!(subsystem = SFTP_SUBSYSTEM, "subsystem client exited"),
        Err(e) => tracing::warn!(subsystem = SFTP_SUBSYSTEM, ?e, "subsystem ended with error"),
    }
    let _ = stream.shutdown().await;
}

/// Apply queued geometry requests to `target` in arrival order.
///
/// `pty-req` is acknowledged once applied; `window-change` carries no
/// reply. Requests with malformed payloads are skipped.
pub async fn drain_pending<R: Resizable>(mut pending: mpsc::Receiver<ChannelRequest>, target: R) {
    while let Some(req) = pending.recv().await {
        apply_geometry(req, &target);
    }
}

fn apply_geometry<R: Resizable>(mut req: ChannelRequest, target: &R) {
    match req.kind.as_str() {
        PTY_REQUEST => match parse_pty_request(&req.payload) {
            Ok(pty) => {
                tracing::debug!(term = %pty.term, width = pty.dimensions.width, height = pty.dimensions.height, "pty allocated");
                target.resize(pty.dimensions);
                req.reply(true);
            }
            Err(e) => tracing::warn!(?e, "malformed pty-req payload"),
        },
        WINDOW_CHANGE_REQUEST => match parse_window_change(&req.payload) {
            Ok(dimensions) => target.resize(dimensions),
            Err(e) => tracing::warn!(?e, "malformed window-change payload"),
        },
        _ => {}
    }
}
