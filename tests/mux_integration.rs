//! Channel multiplexing through `Server::serve_connection`, driven over
//! in-memory channels instead of a real SSH transport.

mod common;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{connect, reply_of};
use sshell::payload::{encode_pty_request, encode_subsystem, encode_window_change, Dimensions};
use sshell::subsystem::SubsystemHandler;
use sshell::transport::{BoxedChannel, RejectReason, Verdict};
use sshell::{FnCommand, Outcome, Server};

/// Echoes everything back until the client closes its side.
struct EchoSubsystem;

#[async_trait]
impl SubsystemHandler for EchoSubsystem {
    async fn serve(&self, channel: &mut BoxedChannel) -> anyhow::Result<()> {
        let mut buf = [0u8; 256];
        loop {
            let n = channel.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            channel.write_all(&buf[..n]).await?;
        }
    }
}

#[tokio::test]
async fn non_session_channels_are_rejected() {
    let server = Server::new();
    let conn = connect(&server);

    let verdict = conn.open("direct-tcpip").await.err().unwrap();
    assert_eq!(
        verdict,
        Verdict::Rejected {
            reason: RejectReason::UnknownChannelType,
            message: "unknown channel type: direct-tcpip".into(),
        }
    );

    // The connection keeps serving after a rejection.
    conn.open_session().await;
}

#[tokio::test]
async fn shell_runs_commands_until_exit() {
    let server = Server::new().with_prompt("$ ");
    let conn = connect(&server);
    let mut channel = conn.open_session().await;

    let reply = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(reply).await, Some(true));
    channel.read_until("$ ").await;

    // Keystrokes are echoed with a redraw of the prompt, so wait for the
    // command output itself.
    channel.stream.write_all(b"test one two\r").await.unwrap();
    channel.read_until("Test: [one two]\r\n").await;

    channel.stream.write_all(b"bogus\r").await.unwrap();
    channel.read_until("Unknown command: bogus\r\n").await;

    channel.stream.write_all(b"exit\r").await.unwrap();
    let out = channel.read_to_end().await;
    assert!(out.ends_with("Exiting.\r\n"), "got {out:?}");
}

#[tokio::test]
async fn motd_is_written_before_the_first_prompt() {
    let server = Server::new().with_prompt("$ ").with_motd("welcome\n");
    let conn = connect(&server);
    let mut channel = conn.open_session().await;

    channel.request("shell", Bytes::new()).await;
    let out = channel.read_until("$ ").await;
    assert_eq!(out, "welcome\r\n$ ");
}

#[tokio::test]
async fn shell_request_with_payload_is_ignored() {
    let server = Server::new();
    let conn = connect(&server);
    let channel = conn.open_session().await;

    let reply = channel.request("shell", Bytes::from_static(b"junk")).await;
    assert_eq!(reply_of(reply).await, None);

    let reply = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(reply).await, Some(true));
}

#[tokio::test]
async fn second_shell_request_is_ignored() {
    let server = Server::new();
    let conn = connect(&server);
    let channel = conn.open_session().await;

    let first = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(first).await, Some(true));
    let second = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(second).await, None);
}

#[tokio::test]
async fn geometry_before_shell_is_applied_once_the_shell_starts() {
    let server = Server::new().with_prompt("$ ");
    let conn = connect(&server);
    let mut channel = conn.open_session().await;

    let mut pty_reply = channel
        .request("pty-req", encode_pty_request("xterm", Dimensions::new(80, 24), &[]))
        .await;
    channel
        .notify("window-change", encode_window_change(Dimensions::new(120, 40)))
        .await;
    channel
        .notify("window-change", encode_window_change(Dimensions::new(132, 50)))
        .await;

    // No terminal exists yet, so nothing can answer the pty request.
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut pty_reply)
        .await
        .is_err());

    let shell = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(shell).await, Some(true));
    assert_eq!(reply_of(pty_reply).await, Some(true));

    channel.read_until("$ ").await;
    channel.stream.write_all(b"test\r").await.unwrap();
    channel.read_until("Test: []\r\n").await;
}

#[tokio::test]
async fn last_geometry_before_shell_sets_the_line_width() {
    let server = Server::new().with_prompt("$ ");
    let conn = connect(&server);
    let mut channel = conn.open_session().await;

    let pty_reply = channel
        .request("pty-req", encode_pty_request("xterm", Dimensions::new(80, 24), &[]))
        .await;
    channel
        .notify("window-change", encode_window_change(Dimensions::new(120, 40)))
        .await;
    channel
        .notify("window-change", encode_window_change(Dimensions::new(12, 24)))
        .await;
    channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(pty_reply).await, Some(true));
    channel.read_until("$ ").await;

    // With 12 columns, "$ " plus ten characters fills the first row, so the
    // eleventh keystroke redraws from one row up. At 80 or 120 columns the
    // line never wraps.
    channel.stream.write_all(b"abcdefghijk").await.unwrap();
    channel.read_until("\x1b[1A\r$ abcdefghijk").await;
}

#[tokio::test]
async fn unknown_requests_are_ignored() {
    let server = Server::new();
    let conn = connect(&server);
    let channel = conn.open_session().await;

    let reply = channel.request("env", Bytes::from_static(b"\0\0\0\x01A\0\0\0\x01B")).await;
    assert_eq!(reply_of(reply).await, None);

    let reply = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(reply).await, Some(true));
}

#[tokio::test]
async fn sftp_subsystem_gets_the_raw_channel() {
    let server = Server::new().with_sftp(Arc::new(EchoSubsystem));
    let conn = connect(&server);
    let mut channel = conn.open_session().await;

    let reply = channel.request("subsystem", encode_subsystem("sftp")).await;
    assert_eq!(reply_of(reply).await, Some(true));

    channel.stream.write_all(b"\x00\x00\x00\x05\x01ping").await.unwrap();
    let mut buf = [0u8; 9];
    tokio::time::timeout(common::TIMEOUT, channel.stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"\x00\x00\x00\x05\x01ping");

    // No shell may start on a channel handed to a subsystem.
    let shell = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(shell).await, None);

    channel.stream.shutdown().await.unwrap();
    assert_eq!(channel.read_to_end().await, "");
}

#[tokio::test]
async fn unknown_subsystems_get_no_reply() {
    let server = Server::new().with_sftp(Arc::new(EchoSubsystem));
    let conn = connect(&server);
    let channel = conn.open_session().await;

    let reply = channel.request("subsystem", encode_subsystem("netconf")).await;
    assert_eq!(reply_of(reply).await, None);

    // The channel is still free for a shell.
    let reply = channel.request("shell", Bytes::new()).await;
    assert_eq!(reply_of(reply).await, Some(true));
}

#[tokio::test]
async fn sftp_without_handler_is_ignored() {
    let server = Server::new();
    let conn = connect(&server);
    let channel = conn.open_session().await;

    let reply = channel.request("subsystem", encode_subsystem("sftp")).await;
    assert_eq!(reply_of(reply).await, None);
}

#[tokio::test]
async fn channels_on_one_connection_are_independent() {
    let server = Server::new().with_prompt("$ ");
    let conn = connect(&server);
    let mut first = conn.open_session().await;
    let mut second = conn.open_session().await;

    first.request("shell", Bytes::new()).await;
    second.request("shell", Bytes::new()).await;
    first.read_until("$ ").await;
    second.read_until("$ ").await;

    first.stream.write_all(b"exit\r").await.unwrap();
    assert!(first.read_to_end().await.ends_with("Exiting.\r\n"));

    second.stream.write_all(b"test still here\r").await.unwrap();
    second.read_until("Test: [still here]\r\n").await;
}

#[tokio::test]
async fn commands_registered_later_are_visible_to_running_shells() {
    let server = Server::new().with_prompt("$ ");
    let conn = connect(&server);
    let mut channel = conn.open_session().await;
    channel.request("shell", Bytes::new()).await;
    channel.read_until("$ ").await;

    server.register(
        "greet",
        FnCommand::new(|out, args| {
            let _ = writeln!(out, "hello {}", args.join(" "));
            Outcome::Continue
        }),
    );

    channel.stream.write_all(b"gr world\r").await.unwrap();
    channel.read_until("hello world\r\n").await;
}

#[tokio::test]
async fn tab_completes_command_arguments() {
    let server = Server::new().with_prompt("$ ");
    server.register(
        "get",
        FnCommand::new(|out, args| {
            let _ = writeln!(out, "got {}", args.join(","));
            Outcome::Continue
        })
        .with_completions(|| vec!["alpha".into(), "beta".into()]),
    );
    let conn = connect(&server);
    let mut channel = conn.open_session().await;
    channel.request("shell", Bytes::new()).await;
    channel.read_until("$ ").await;

    channel.stream.write_all(b"get be\t\r").await.unwrap();
    channel.read_until("got beta\r\n").await;
}

#[tokio::test]
async fn connection_task_ends_when_transport_stops() {
    let server = Server::new();
    let conn = connect(&server);
    conn.open_session().await;

    let task = conn.close();
    tokio::time::timeout(common::TIMEOUT, task).await.unwrap().unwrap();
}
