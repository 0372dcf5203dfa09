use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshell::auth::PasswordCredentials;
use sshell::config::{ConfigError, ServerConfig};
use sshell::sftp::SftpSubsystem;
use sshell::ssh::{self, SshError, SshServer};
use sshell::Server;

#[derive(ClapParser, Debug)]
#[command(name = "sshell", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SSH shell server
    Serve {
        /// Path to a TOML config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config file)
        #[arg(long)]
        listen: Option<String>,

        /// User allowed to log in
        #[arg(long, env = "SSHELL_USER")]
        user: Option<String>,

        /// Password for the login user
        #[arg(long, env = "SSHELL_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Path to the private host key
        #[arg(long)]
        host_key: Option<PathBuf>,

        /// Prompt shown by interactive shells
        #[arg(long)]
        prompt: Option<String>,

        /// Directory sftp clients see as `/`
        #[arg(long)]
        sftp_root: Option<PathBuf>,

        /// Ignore sftp subsystem requests
        #[arg(long)]
        no_sftp: bool,
    },

    /// Run one command line against the built-in commands and print its output
    Exec {
        /// The command line, quoted as a single argument
        line: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum ServerError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("no password configured; set --password, SSHELL_PASSWORD or `password` in the config file")]
    MissingPassword,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            user,
            password,
            host_key,
            prompt,
            sftp_root,
            no_sftp,
        } => {
            let mut settings = match config {
                Some(path) => ServerConfig::load(&path)?.unwrap_or_else(|| {
                    tracing::warn!(path = %path.display(), "config file not found, using defaults");
                    ServerConfig::default()
                }),
                None => ServerConfig::default(),
            };
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            if let Some(user) = user {
                settings.user = user;
            }
            if password.is_some() {
                settings.password = password;
            }
            if let Some(host_key) = host_key {
                settings.host_key = host_key;
            }
            if let Some(prompt) = prompt {
                settings.prompt = prompt;
            }
            if let Some(sftp_root) = sftp_root {
                settings.sftp_root = sftp_root;
            }
            if no_sftp {
                settings.sftp = false;
            }
            run_server(settings).await
        }
        Commands::Exec { line } => {
            let server = Server::new();
            match server.exec(&line) {
                Ok(output) => {
                    print!("{output}");
                    Ok(())
                }
                Err(e) => {
                    print!("{e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sshell=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_server(settings: ServerConfig) -> Result<(), ServerError> {
    let password = settings.password.clone().ok_or(ServerError::MissingPassword)?;
    let host_key = ssh::load_host_key(&settings.host_key)?;
    let credentials = Arc::new(PasswordCredentials::new(&settings.user, password));
    let mut shell = Server::from_config(&settings);
    if settings.sftp {
        tracing::info!(root = %settings.sftp_root.display(), "serving sftp");
        shell = shell.with_sftp(Arc::new(SftpSubsystem::new(&settings.sftp_root)));
    }
    let server = SshServer::new(shell, credentials, host_key);

    let cancel = CancellationToken::new();
    let listen = {
        let cancel = cancel.clone();
        async move { server.listen(&settings.listen, cancel).await }
    };
    tokio::pin!(listen);

    tokio::select! {
        result = &mut listen => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}
