//! Join-token minting and redemption. The state machine enforces one-time
//! use (see `command::RedeemToken`); this module just owns the token format
//! and the hash used to index it.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::command::Command;
use crate::error::ControlError;
use crate::kv::Store;
use crate::model::TokenRole;

const TOKEN_BYTES: usize = 32; // 256 bits of entropy

pub struct MintedToken {
    /// Shown to the operator exactly once; never persisted.
    pub raw: String,
    pub issue_command: Command,
}

pub fn mint(role: TokenRole) -> MintedToken {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = to_hex(&bytes);
    let hash = hash_token(&raw);
    MintedToken { raw, issue_command: Command::IssueToken { hash, role } }
}

pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Checks the token exists, is unused, and matches `expected_role`, without
/// consuming it. Callers that go on to issue a certificate must still submit
/// `Command::RedeemToken` through Raft so the single-use guarantee is
/// enforced by every replica, not just the leader that happened to check.
pub fn verify(store: &Store, raw: &str, expected_role: TokenRole) -> Result<(), ControlError> {
    let hash = hash_token(raw);
    let token = store.get_token(&hash).ok_or_else(|| ControlError::Unauthenticated("unknown token".into()))?;
    if token.used {
        return Err(ControlError::Unauthenticated("token already used".into()));
    }
    if token.role != expected_role {
        return Err(ControlError::PermissionDenied("token role mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::apply;

    #[test]
    fn mint_then_verify_then_redeem() {
        let store = Store::new();
        let minted = mint(TokenRole::Worker);
        apply(&store, minted.issue_command.clone()).unwrap();

        assert!(verify(&store, &minted.raw, TokenRole::Worker).is_ok());

        let hash = hash_token(&minted.raw);
        apply(&store, Command::RedeemToken { hash: hash.clone() }).unwrap();
        assert!(verify(&store, &minted.raw, TokenRole::Worker).is_err());
        assert!(apply(&store, Command::RedeemToken { hash }).is_err());
    }

    #[test]
    fn wrong_role_is_rejected() {
        let store = Store::new();
        let minted = mint(TokenRole::Worker);
        apply(&store, minted.issue_command.clone()).unwrap();
        assert!(verify(&store, &minted.raw, TokenRole::Manager).is_err());
    }
}
