//! Public-key authentication through the local SSH agent.
//!
//! russh's own `impl Signer for AgentClient` borrows the requested key across
//! an `.await`, which makes the `authenticate_publickey_with` future `!Send`.
//! [`AgentSigner`] clones the key first so the whole connect path can run on
//! a spawned tokio task.

use std::future::Future;

use russh::client::{Handle, Handler};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use crate::error::BridgeError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Offer every agent identity in turn. `Ok(false)` means the agent was
/// reachable but the server accepted none of its keys.
pub async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    user: &str,
) -> Result<bool, BridgeError> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| BridgeError::Credential(format!("SSH agent unavailable: {e}")))?
        .dynamic();

    let keys = agent
        .request_identities()
        .await
        .map_err(|e| BridgeError::Credential(format!("Failed to list agent keys: {e}")))?;
    if keys.is_empty() {
        debug!("SSH agent holds no keys");
        return Ok(false);
    }

    let rsa_hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    for key in keys {
        let comment = key.comment().to_string();
        match handle
            .authenticate_publickey_with(
                user,
                key,
                rsa_hash,
                &mut AgentSigner { agent: &mut agent },
            )
            .await
        {
            Ok(result) if result.success() => {
                info!("Agent key accepted: {comment}");
                return Ok(true);
            }
            Ok(_) => debug!("Agent key rejected: {comment}"),
            Err(e) => debug!("Agent signing failed for {comment}: {e}"),
        }
    }
    Ok(false)
}
