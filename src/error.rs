//! Bridge error taxonomy.
//!
//! Every handler returns a [`BridgeError`]; the router is the single place
//! that turns one into a client-visible `error` envelope. [`ErrorClass`]
//! groups the variants by remediation:
//!
//! | Class            | Variants                                   | Session after |
//! |------------------|--------------------------------------------|---------------|
//! | `Protocol`       | `Protocol`                                 | unchanged     |
//! | `Authentication` | `NoCredentials`, `Credential`, `AuthRejected` | `Closing`  |
//! | `Transport`      | `Transport`, `Timeout`, `Channel`, `Disconnected` | `Closing` |
//! | `ResourcePolicy` | `Policy`                                   | unchanged     |
//! | `Internal`       | `Remote`                                   | unchanged     |

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed envelope, unknown type, or envelope outside its valid state.
    #[error("{0}")]
    Protocol(String),

    #[error("No credentials available for {0}: supply a password, a key path, or load a key into the SSH agent")]
    NoCredentials(String),

    /// Explicit key material that could not be read or parsed.
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("SSH authentication failed: {0}. Please ensure your public key is in the server's authorized_keys file or the password is correct")]
    AuthRejected(String),

    #[error("SSH connection failed: {0}")]
    Transport(String),

    #[error("SSH connection timed out: {0}")]
    Timeout(String),

    /// Oversized file, directory where a file was expected.
    #[error("{0}")]
    Policy(String),

    /// A single remote operation failed; the connection is still usable.
    #[error("{0}")]
    Remote(String),

    /// The remote connection itself is gone.
    #[error("Remote connection lost: {0}")]
    Disconnected(String),

    /// The duplex channel to the client is broken.
    #[error("Client channel error: {0}")]
    Channel(String),
}

/// Remediation class of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Authentication,
    Transport,
    ResourcePolicy,
    Internal,
}

impl BridgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::NoCredentials(_) | Self::Credential(_) | Self::AuthRejected(_) => {
                ErrorClass::Authentication
            }
            Self::Transport(_) | Self::Timeout(_) | Self::Channel(_) | Self::Disconnected(_) => {
                ErrorClass::Transport
            }
            Self::Policy(_) => ErrorClass::ResourcePolicy,
            Self::Remote(_) => ErrorClass::Internal,
        }
    }

    /// Whether this failure moves the session to `Closing`.
    pub fn ends_session(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Authentication | ErrorClass::Transport
        )
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<russh::Error> for BridgeError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
                BridgeError::Disconnected(err.to_string())
            }
            russh::Error::ConnectionTimeout => BridgeError::Timeout(err.to_string()),
            russh::Error::IO(_) => BridgeError::Transport(err.to_string()),
            _ => BridgeError::Remote(err.to_string()),
        }
    }
}

impl From<russh::keys::Error> for BridgeError {
    fn from(err: russh::keys::Error) -> Self {
        BridgeError::Credential(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for BridgeError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        BridgeError::Remote(err.to_string())
    }
}
