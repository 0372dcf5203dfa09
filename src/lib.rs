//! sshell - an embeddable remote shell server.
//!
//! Clients connect over SSH, open session channels, and get a line-oriented
//! command interpreter with prefix matching and tab-completion. A session
//! channel may instead request the `sftp` subsystem, which is handed to a
//! pluggable [`subsystem::SubsystemHandler`].

pub mod auth;
pub mod commands;
pub mod config;
pub mod mux;
pub mod payload;
pub mod server;
pub mod session;
#[cfg(feature = "ssh")]
pub mod sftp;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod subsystem;
pub mod terminal;
pub mod transport;

pub use commands::{Command, CommandRegistry, FnCommand, Outcome};
pub use server::Server;
