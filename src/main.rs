#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sshbridge
//!
//! Browser-to-SSH bridge.
//!
//! Each WebSocket accepted on `/ws/ssh` or `/ws/sftp` becomes a bridge
//! session that dials one remote host over SSH and relays an interactive
//! shell or a set of file operations as `{type, data}` JSON envelopes.
//!
//! ## Subcommands
//!
//! - `sshbridge serve` (default): run the HTTP/WS server
//! - `sshbridge vault seal`: encrypt a file into the vault directory
//! - `sshbridge vault open`: decrypt a vault file
//!
//! ## API surface
//!
//! | Method | Path                | Auth   | Description                     |
//! |--------|---------------------|--------|---------------------------------|
//! | GET    | `/health`           | No     | Liveness probe                  |
//! | GET    | `/ws/ssh`           | token* | Shell session                   |
//! | GET    | `/ws/sftp`          | token* | File-transfer session           |
//! | POST   | `/api/local-files`  | Yes    | List a local directory          |
//! | POST   | `/api/read-file`    | Yes    | Read a local file               |
//! | POST   | `/api/write-file`   | Yes    | Write a local file (atomic)     |
//! | POST   | `/api/create-file`  | Yes    | Create a local file (atomic)    |
//! | POST   | `/api/delete-files` | Yes    | Delete local files              |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization` header
//! available during the upgrade handshake).

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use sshbridge::config::Config;
use sshbridge::inventory::Inventory;
use sshbridge::remote::credentials::CredentialResolver;
use sshbridge::remote::ssh::SshConnector;
use sshbridge::util::home_path;
use sshbridge::vault::{self, store::VaultStore};
use sshbridge::{routes, AppState, Bridge};

/// Browser-to-SSH bridge service.
#[derive(Parser)]
#[command(name = "sshbridge", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
    /// Encrypt or decrypt files in the vault directory.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },
}

#[derive(Subcommand)]
enum VaultAction {
    /// Encrypt a plaintext file into the vault.
    Seal {
        /// Plaintext file to encrypt.
        #[arg(long)]
        input: String,
        /// File name inside the vault directory.
        #[arg(long)]
        name: String,
        /// Environment variable holding the master password.
        #[arg(long, default_value = "SSHBRIDGE_MASTER_PASSWORD")]
        password_env: String,
    },
    /// Decrypt a vault file.
    Open {
        /// File name inside the vault directory.
        #[arg(long)]
        name: String,
        /// Where to write the plaintext (stdout if absent).
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value = "SSHBRIDGE_MASTER_PASSWORD")]
        password_env: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sshbridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command {
        None | Some(Commands::Serve) => run_server(config).await,
        Some(Commands::Vault { action }) => run_vault(&config, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), String> {
    info!("sshbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set SSHBRIDGE_API_KEY or update config");
    }

    let inventory = match &config.inventory {
        Some(inv) => {
            let path = home_path(&inv.hosts_file);
            let inventory = Inventory::load(&path).map_err(|e| e.to_string())?;
            info!("Loaded {} host(s) from {}", inventory.len(), path.display());
            Some(inventory)
        }
        None => None,
    };

    let resolver = CredentialResolver::from_config(&config.ssh);
    let connector = Arc::new(SshConnector::new(&config.ssh));
    let bridge = Bridge::new(&config, connector, resolver, inventory);
    let state = AppState::new(Arc::new(config), bridge);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", state.config.server.listen))?;

    info!("Server ready");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down...");
    state.registry.shutdown_all().await;
    info!("Goodbye");

    result.map_err(|e| format!("Server error: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

fn master_password(var: &str) -> Result<String, String> {
    std::env::var(var).map_err(|_| format!("Master password not set (expected in ${var})"))
}

fn run_vault(config: &Config, action: VaultAction) -> Result<(), String> {
    let store = VaultStore::new(home_path(&config.vault.dir));

    match action {
        VaultAction::Seal {
            input,
            name,
            password_env,
        } => {
            let password = master_password(&password_env)?;
            let plaintext = zeroize::Zeroizing::new(
                std::fs::read(&input).map_err(|e| format!("Failed to read {input}: {e}"))?,
            );
            let envelope = vault::seal(&plaintext, &password).map_err(|e| e.to_string())?;
            store.save(&name, &envelope).map_err(|e| e.to_string())?;
            info!("Sealed {input} into {}", store.dir().join(&name).display());
        }
        VaultAction::Open {
            name,
            output,
            password_env,
        } => {
            let password = master_password(&password_env)?;
            let envelope = store.load(&name).map_err(|e| e.to_string())?;
            let plaintext = vault::open(&envelope, &password).map_err(|e| e.to_string())?;
            match output {
                Some(path) => std::fs::write(&path, plaintext.as_slice())
                    .map_err(|e| format!("Failed to write {path}: {e}"))?,
                None => std::io::stdout()
                    .write_all(&plaintext)
                    .map_err(|e| format!("Failed to write plaintext: {e}"))?,
            }
        }
    }
    Ok(())
}
