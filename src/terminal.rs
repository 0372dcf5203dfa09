//! Minimal line editor over a channel byte stream.
//!
//! The client's terminal sends raw keystrokes (it runs in raw mode once a pty
//! has been requested), so echo, cursor movement and line assembly happen
//! here. Output written through [`Terminal::write`] has `\n` translated to
//! `\r\n`. Redraws account for the terminal width, so edits on a line that
//! wraps over several rows land in the right place.

use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::commands::complete::{Completion, COMPLETION_KEY};
use crate::payload::Dimensions;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("terminal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("terminal input closed")]
    Closed,
}

/// Errors meaning the peer went away are reported as [`TerminalError::Closed`].
fn closed_or_io(e: io::Error) -> TerminalError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => TerminalError::Closed,
        _ => TerminalError::Io(e),
    }
}

/// Something that accepts terminal geometry updates.
pub trait Resizable: Send + Sync + 'static {
    fn resize(&self, dimensions: Dimensions);
}

/// Shared terminal geometry, updated from pty/window-change requests.
#[derive(Debug, Clone)]
pub struct TerminalSize {
    inner: Arc<Mutex<Dimensions>>,
}

impl TerminalSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Dimensions::new(width, height))),
        }
    }

    pub fn get(&self) -> Dimensions {
        *self.inner.lock()
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl Resizable for TerminalSize {
    fn resize(&self, dimensions: Dimensions) {
        *self.inner.lock() = dimensions;
    }
}

/// Completion callback: `(line, cursor, key) -> Completion`.
pub type Completer = Box<dyn Fn(&str, usize, char) -> Completion + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Char(char),
    CarriageReturn,
    LineFeed,
    Tab,
    Backspace,
    Delete,
    Left,
    Right,
    Home,
    End,
    KillToStart,
    Interrupt,
    EndOfInput,
    Ignored,
}

/// Decode one key from the front of `data`.
///
/// Returns `None` if `data` holds only part of a key.
fn decode_key(data: &[u8]) -> Option<(Key, usize)> {
    let first = *data.first()?;
    let decoded = match first {
        b'\r' => (Key::CarriageReturn, 1),
        b'\n' => (Key::LineFeed, 1),
        b'\t' => (Key::Tab, 1),
        0x7f | 0x08 => (Key::Backspace, 1),
        0x01 => (Key::Home, 1),
        0x05 => (Key::End, 1),
        0x15 => (Key::KillToStart, 1),
        0x03 => (Key::Interrupt, 1),
        0x04 => (Key::EndOfInput, 1),
        0x1b => return decode_escape(data),
        0x00..=0x1f => (Key::Ignored, 1),
        0x20..=0x7e => (Key::Char(first as char), 1),
        _ => {
            let width = match first {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                _ => return Some((Key::Ignored, 1)),
            };
            if data.len() < width {
                return None;
            }
            match std::str::from_utf8(&data[..width]).ok().and_then(|s| s.chars().next()) {
                Some(c) => (Key::Char(c), width),
                None => (Key::Ignored, 1),
            }
        }
    };
    Some(decoded)
}

/// Decode `ESC [ ...` and `ESC O ...` sequences.
fn decode_escape(data: &[u8]) -> Option<(Key, usize)> {
    let second = *data.get(1)?;
    if second != b'[' && second != b'O' {
        // Drop only the ESC; the next byte is a key of its own.
        return Some((Key::Ignored, 1));
    }
    let body = &data[2..];
    let end = body.iter().position(|b| (0x40..=0x7e).contains(b))?;
    let key = match &body[..=end] {
        b"C" => Key::Right,
        b"D" => Key::Left,
        b"H" | b"1~" | b"7~" => Key::Home,
        b"F" | b"4~" | b"8~" => Key::End,
        b"3~" => Key::Delete,
        _ => Key::Ignored,
    };
    Some((key, 2 + end + 1))
}

/// Translate bare `\n` into `\r\n`.
fn crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &b in data {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

pub struct Terminal<S> {
    stream: S,
    prompt: String,
    size: TerminalSize,
    completer: Option<Completer>,
    line: Vec<char>,
    pos: usize,
    /// Row of the cursor relative to the row the prompt starts on.
    cursor_row: usize,
    input: Vec<u8>,
    after_cr: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Terminal<S> {
    pub fn new(stream: S, prompt: impl Into<String>) -> Self {
        Self {
            stream,
            prompt: prompt.into(),
            size: TerminalSize::default(),
            completer: None,
            line: Vec::new(),
            pos: 0,
            cursor_row: 0,
            input: Vec::new(),
            after_cr: false,
        }
    }

    pub fn set_completer(&mut self, completer: Completer) {
        self.completer = Some(completer);
    }

    /// Handle to this terminal's geometry.
    pub fn size(&self) -> TerminalSize {
        self.size.clone()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Print the prompt and read one line of input.
    ///
    /// Returns [`TerminalError::Closed`] on end of stream or Ctrl-D on an
    /// empty line.
    pub async fn read_line(&mut self) -> Result<String, TerminalError> {
        self.line.clear();
        self.pos = 0;
        self.cursor_row = 0;
        let prompt = self.prompt.clone();
        self.write_raw(prompt.as_bytes()).await?;

        let mut buf = [0u8; 512];
        loop {
            while let Some((key, used)) = decode_key(&self.input) {
                self.input.drain(..used);
                if let Some(line) = self.handle_key(key).await? {
                    return Ok(line);
                }
            }

            let n = self.stream.read(&mut buf).await.map_err(closed_or_io)?;
            if n == 0 {
                return Err(TerminalError::Closed);
            }
            self.input.extend_from_slice(&buf[..n]);
        }
    }

    /// Write command output, translating newlines.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.write_raw(&crlf(data)).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.stream.write_all(data).await.map_err(closed_or_io)?;
        self.stream.flush().await.map_err(closed_or_io)?;
        Ok(())
    }

    async fn handle_key(&mut self, key: Key) -> Result<Option<String>, TerminalError> {
        let after_cr = std::mem::replace(&mut self.after_cr, key == Key::CarriageReturn);
        match key {
            Key::LineFeed if after_cr => {}
            Key::CarriageReturn | Key::LineFeed => {
                let mut out = self.leave_line();
                out.push_str("\r\n");
                self.write_raw(out.as_bytes()).await?;
                self.pos = 0;
                return Ok(Some(self.line.drain(..).collect()));
            }
            Key::Char(c) => {
                self.line.insert(self.pos, c);
                self.pos += 1;
                self.redraw().await?;
            }
            Key::Backspace if self.pos > 0 => {
                self.pos -= 1;
                self.line.remove(self.pos);
                self.redraw().await?;
            }
            Key::Delete if self.pos < self.line.len() => {
                self.line.remove(self.pos);
                self.redraw().await?;
            }
            Key::Left if self.pos > 0 => {
                self.pos -= 1;
                self.redraw().await?;
            }
            Key::Right if self.pos < self.line.len() => {
                self.pos += 1;
                self.redraw().await?;
            }
            Key::Home => {
                self.pos = 0;
                self.redraw().await?;
            }
            Key::End => {
                self.pos = self.line.len();
                self.redraw().await?;
            }
            Key::KillToStart => {
                self.line.drain(..self.pos);
                self.pos = 0;
                self.redraw().await?;
            }
            Key::Interrupt => {
                let mut out = self.leave_line();
                out.push_str("^C\r\n");
                out.push_str(&self.prompt);
                self.line.clear();
                self.pos = 0;
                self.write_raw(out.as_bytes()).await?;
            }
            Key::EndOfInput if self.line.is_empty() => {
                return Err(TerminalError::Closed);
            }
            Key::EndOfInput if self.pos < self.line.len() => {
                self.line.remove(self.pos);
                self.redraw().await?;
            }
            Key::Tab => self.complete().await?,
            _ => {}
        }
        Ok(None)
    }

    async fn complete(&mut self) -> Result<(), TerminalError> {
        let Some(completer) = &self.completer else {
            return Ok(());
        };
        let current: String = self.line.iter().collect();
        let completion = completer(&current, self.pos, COMPLETION_KEY);
        if completion.handled && (completion.line != current || completion.pos != self.pos) {
            self.line = completion.line.chars().collect();
            self.pos = completion.pos.min(self.line.len());
            self.redraw().await?;
        }
        Ok(())
    }

    fn width(&self) -> usize {
        (self.size.get().width as usize).max(1)
    }

    /// Columns taken by the prompt and the whole line.
    fn line_end(&self) -> usize {
        self.prompt.chars().count() + self.line.len()
    }

    /// Row the cursor sits on once the whole line has been written. A line
    /// that exactly fills its last row is followed by a forced wrap.
    fn end_row(&self) -> usize {
        self.line_end() / self.width()
    }

    /// Cursor movement to just past the end of the line, so whatever is
    /// written next does not overwrite it.
    fn leave_line(&mut self) -> String {
        let mut out = String::new();
        let below = self.end_row().saturating_sub(self.cursor_row);
        if below > 0 {
            let _ = write!(out, "\x1b[{below}B");
        }
        self.cursor_row = 0;
        out
    }

    /// Rewrite the prompt and line from the row the prompt starts on, then
    /// put the cursor back at `pos`.
    async fn redraw(&mut self) -> Result<(), TerminalError> {
        let width = self.width();
        let end = self.line_end();
        let mut out = String::with_capacity(self.prompt.len() + self.line.len() + 24);

        if self.cursor_row > 0 {
            let _ = write!(out, "\x1b[{}A", self.cursor_row);
        }
        out.push('\r');
        out.push_str(&self.prompt);
        out.extend(self.line.iter());
        if end > 0 && end % width == 0 {
            out.push_str("\r\n");
        }
        out.push_str("\x1b[J");

        let target = self.prompt.chars().count() + self.pos;
        let row = target / width;
        if target != end {
            let up = self.end_row() - row;
            if up > 0 {
                let _ = write!(out, "\x1b[{up}A");
            }
            out.push('\r');
            let col = target % width;
            if col > 0 {
                let _ = write!(out, "\x1b[{col}C");
            }
        }
        self.cursor_row = row;
        self.write_raw(out.as_bytes()).await
    }
}
