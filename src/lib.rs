#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! sshbridge library: the pieces behind the `sshbridge` binary.
//!
//! - `bridge`: protocol router, shell bridge, file-transfer operations
//! - `sessions`: session state machine and registry
//! - `remote`: backend traits, credential resolution, russh/russh-sftp backend
//! - `protocol`: `{type, data}` envelopes and payloads
//! - `ws`: WebSocket transport
//! - `routes`: HTTP router, health, local file endpoints
//! - `auth`: API key gate
//! - `config`: configuration loading
//! - `inventory`: read-only host inventory
//! - `vault`: encrypted-at-rest envelopes

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod inventory;
pub mod protocol;
pub mod remote;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;
pub mod vault;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use bridge::Bridge;
pub use config::Config;
pub use error::BridgeError;
pub use sessions::SessionRegistry;
pub use state::AppState;
