//! Namespace access tokens.
//!
//! A token is the concatenation `ns_<base64(namespace_id)>_<64 hex chars>`,
//! where the hex suffix encodes 32 bytes of cryptographic randomness. The
//! raw token is never persisted: the registry stores and looks up the hex
//! SHA-256 of the full token, and the raw form appears only in the one-shot
//! namespace-creation response and in `Authorization: Bearer` headers.

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token prefix segment.
pub const TOKEN_PREFIX: &str = "ns";

/// Length of the random secret, in bytes.
const SECRET_LEN: usize = 32;

/// Generates a fresh token for a namespace.
pub fn generate(namespace_id: &str) -> Result<String, InvalidToken> {
    if namespace_id.is_empty() {
        return Err(InvalidToken::EmptyNamespace);
    }

    let mut secret = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut secret);

    Ok(format!(
        "{TOKEN_PREFIX}_{}_{}",
        base64::encode(namespace_id),
        hex::encode(secret)
    ))
}

/// Parses a token, returning the embedded namespace id.
///
/// The grammar is exact: `ns_<base64>_<64 lowercase hex>`. Anything else is
/// rejected, including uppercase hex.
pub fn parse(token: &str) -> Result<String, InvalidToken> {
    let mut segments = token.split('_');
    let (prefix, namespace, secret) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(prefix), Some(namespace), Some(secret), None) => (prefix, namespace, secret),
        _ => return Err(InvalidToken::Malformed),
    };

    if prefix != TOKEN_PREFIX {
        return Err(InvalidToken::Malformed);
    }

    if secret.len() != SECRET_LEN * 2
        || !secret
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(InvalidToken::Malformed);
    }

    let namespace_id = base64::decode(namespace)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(InvalidToken::Malformed)?;
    if namespace_id.is_empty() {
        return Err(InvalidToken::EmptyNamespace);
    }

    Ok(namespace_id)
}

/// Hex-encoded SHA-256 of the full token; the only persisted form.
pub fn hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidToken {
    #[error("empty namespace id")]
    EmptyNamespace,
    #[error("malformed token")]
    Malformed,
}
