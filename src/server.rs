//! The embeddable shell server.
//!
//! A [`Server`] bundles the command registry with the settings every
//! connection is served with. It is transport-agnostic: something else
//! (normally the `ssh` module) accepts connections and feeds each one's channel
//! opens into [`Server::serve_connection`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::commands::builtin::register_builtins;
use crate::commands::{Command, CommandRegistry, ExecError};
use crate::config::ServerConfig;
use crate::mux::{self, MuxContext};
use crate::subsystem::SubsystemHandler;
use crate::transport::PendingChannel;

pub const DEFAULT_PROMPT: &str = "> ";

#[derive(Clone)]
pub struct Server {
    ctx: MuxContext,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// A server with the built-in `test`, `exit` and `help` commands.
    pub fn new() -> Self {
        let server = Self::empty();
        register_builtins(server.registry());
        server
    }

    /// A server with no commands registered.
    pub fn empty() -> Self {
        Self {
            ctx: MuxContext {
                registry: CommandRegistry::new(),
                prompt: Arc::from(DEFAULT_PROMPT),
                motd: None,
                sftp: None,
            },
        }
    }

    /// A server with the built-in commands and the shell settings from
    /// `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut server = Self::new().with_prompt(&config.prompt);
        if let Some(motd) = &config.motd {
            server = server.with_motd(motd);
        }
        server
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.ctx.prompt = Arc::from(prompt);
        self
    }

    /// Text written once when a shell starts.
    pub fn with_motd(mut self, motd: &str) -> Self {
        self.ctx.motd = Some(Arc::from(motd));
        self
    }

    /// Handler for the `sftp` subsystem. Without one, `sftp` requests are
    /// ignored like any other unknown subsystem.
    pub fn with_sftp(mut self, handler: Arc<dyn SubsystemHandler>) -> Self {
        self.ctx.sftp = Some(handler);
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.ctx.registry
    }

    pub fn prompt(&self) -> &str {
        &self.ctx.prompt
    }

    pub fn register<C: Command + 'static>(&self, name: &str, command: C) {
        self.ctx.registry.register(name, command);
    }

    /// Run a single command line and capture its output.
    /// See [`CommandRegistry::exec`].
    pub fn exec(&self, line: &str) -> Result<String, ExecError> {
        self.ctx.registry.exec(line)
    }

    /// Serve all channels opened on one connection.
    pub async fn serve_connection(&self, channels: mpsc::Receiver<PendingChannel>) {
        mux::serve_connection(self.ctx.clone(), channels).await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.ctx.registry)
            .field("prompt", &self.ctx.prompt)
            .field("sftp", &self.ctx.sftp.is_some())
            .finish()
    }
}
