//! Replay-mode token synthesis
//!
//! In replay mode the proxy cannot return real upstream tokens, so recorded
//! auth responses get a freshly signed HS256 JWT instead. The signing secret
//! is a fixed process constant on purpose: it is NOT a security mechanism.
//! It exists so replayed clients can parse and use a structurally valid
//! token. The signer refuses any claim set whose issuer is not the replay
//! issuer, so this key can never mint a token that impersonates anything
//! else.

use anyhow::{bail, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::util::now_millis;

/// Issuer claim of every synthesized token.
pub const REPLAY_ISSUER: &str = "dproxy-replay-mode";
/// Audience claim of every synthesized token.
pub const REPLAY_AUDIENCE: &str = "dproxy";

/// Fixed, documented, non-secret signing key (see module docs).
const SIGNING_KEY: &[u8] = b"dproxy-replay-mode-signing-key-not-a-credential";

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayClaims {
    pub sub: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Sign a replay token for a user/session pair.
pub fn sign_replay_token(user_id: i64, session_id: &str, expiry_seconds: u64) -> Result<String> {
    let iat = now_millis() / 1000;
    let claims = ReplayClaims {
        sub: format!("user-{user_id}"),
        session_id: session_id.to_string(),
        iat,
        exp: iat + expiry_seconds as i64,
        iss: REPLAY_ISSUER.to_string(),
        aud: REPLAY_AUDIENCE.to_string(),
    };
    sign(&claims)
}

/// Sign a claim set. Refuses anything outside the replay issuer/audience.
fn sign(claims: &ReplayClaims) -> Result<String> {
    if claims.iss != REPLAY_ISSUER || claims.aud != REPLAY_AUDIENCE {
        bail!("refusing to sign claims outside the {REPLAY_ISSUER} issuer");
    }
    let token = encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(SIGNING_KEY),
    )?;
    Ok(token)
}

/// Decode and validate a replay token (tests and diagnostics).
pub fn verify_replay_token(token: &str) -> Result<ReplayClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[REPLAY_ISSUER]);
    validation.set_audience(&[REPLAY_AUDIENCE]);
    let data = decode::<ReplayClaims>(token, &DecodingKey::from_secret(SIGNING_KEY), &validation)?;
    Ok(data.claims)
}
