#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sshell::transport::{ChannelRequest, PendingChannel, Verdict};
use sshell::Server;

/// How long a test waits for output before giving up.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// One simulated client connection feeding channel opens into a server.
pub struct TestConnection {
    channels: mpsc::Sender<PendingChannel>,
    pub task: JoinHandle<()>,
}

/// The client side of an accepted channel.
pub struct TestChannel {
    pub stream: DuplexStream,
    requests: mpsc::Sender<ChannelRequest>,
}

pub fn connect(server: &Server) -> TestConnection {
    let (channels, rx) = mpsc::channel(16);
    let server = server.clone();
    let task = tokio::spawn(async move {
        server.serve_connection(rx).await;
    });
    TestConnection { channels, task }
}

impl TestConnection {
    /// Open a channel and wait for the server's verdict.
    pub async fn open(&self, channel_type: &str) -> Result<TestChannel, Verdict> {
        let (server_side, client_side) = tokio::io::duplex(8192);
        let (requests, requests_rx) = mpsc::channel(16);
        let (pending, verdict) = PendingChannel::new(channel_type, Box::new(server_side), requests_rx);
        self.channels.send(pending).await.unwrap();
        match tokio::time::timeout(TIMEOUT, verdict).await.unwrap().unwrap() {
            Verdict::Accepted => Ok(TestChannel {
                stream: client_side,
                requests,
            }),
            rejected => Err(rejected),
        }
    }

    pub async fn open_session(&self) -> TestChannel {
        match self.open("session").await {
            Ok(channel) => channel,
            Err(verdict) => panic!("session channel rejected: {verdict:?}"),
        }
    }

    /// Stop opening channels; the connection task then finishes.
    pub fn close(self) -> JoinHandle<()> {
        self.task
    }
}

impl TestChannel {
    /// Send a request that wants a reply.
    pub async fn request(&self, kind: &str, payload: Bytes) -> oneshot::Receiver<bool> {
        let (request, reply) = ChannelRequest::new(kind, payload);
        self.requests.send(request).await.unwrap();
        reply
    }

    pub async fn notify(&self, kind: &str, payload: Bytes) {
        self.requests
            .send(ChannelRequest::without_reply(kind, payload))
            .await
            .unwrap();
    }

    /// Read from the channel until the accumulated output contains `needle`.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let read = async {
            loop {
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "channel closed before {needle:?}; got {:?}", String::from_utf8_lossy(&out));
                out.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&out).contains(needle) {
                    break;
                }
            }
        };
        tokio::time::timeout(TIMEOUT, read)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
        String::from_utf8(out).unwrap()
    }

    /// Read everything until the server closes the channel.
    pub async fn read_to_end(&mut self) -> String {
        let mut out = String::new();
        tokio::time::timeout(TIMEOUT, self.stream.read_to_string(&mut out))
            .await
            .expect("timed out waiting for channel close")
            .unwrap();
        out
    }
}

/// Await a reply, treating a dropped request as "no reply".
pub async fn reply_of(reply: oneshot::Receiver<bool>) -> Option<bool> {
    tokio::time::timeout(TIMEOUT, reply).await.unwrap().ok()
}
