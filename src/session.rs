//! Interactive read-dispatch loop for one shell channel.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::commands::{CommandRegistry, Outcome};
use crate::terminal::{Terminal, TerminalError};

/// Written when a command ends the session.
pub const FAREWELL: &str = "Exiting.\n";

/// Output chunks a running command may have in flight to the terminal.
const OUTPUT_QUEUE: usize = 32;

/// Blocking [`io::Write`] sink that forwards each write to the session task.
struct OutputSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl io::Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read lines from `terminal` and run them against `registry` until a
/// command ends the session (`Ok`) or the client goes away (`Err`).
///
/// Lines are split on whitespace only; there is no quoting at this layer.
/// Commands run on the blocking pool so a slow command holds up only its
/// own session, and their output reaches the terminal as it is written.
pub async fn run<S>(terminal: &mut Terminal<S>, registry: &CommandRegistry) -> Result<(), TerminalError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let line = terminal.read_line().await?;
        let mut fields = line.split_whitespace().map(str::to_string);
        let Some(name) = fields.next() else {
            continue;
        };

        let Some((resolved, command)) = registry.lookup(&name) else {
            terminal
                .write(format!("Unknown command: {line}\n").as_bytes())
                .await?;
            continue;
        };

        let args: Vec<String> = fields.collect();
        let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE);
        let task = tokio::task::spawn_blocking(move || {
            let mut sink = OutputSink { tx };
            command.run(&mut sink, &args)
        });
        while let Some(chunk) = rx.recv().await {
            terminal.write(&chunk).await?;
        }

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(command = %resolved, ?e, "command task failed");
                continue;
            }
        };

        match outcome {
            Outcome::Continue => {}
            Outcome::Fail(detail) => {
                tracing::debug!(command = %resolved, %detail, "command failed");
            }
            Outcome::Terminate => {
                terminal.write(FAREWELL.as_bytes()).await?;
                return Ok(());
            }
        }
    }
}
