//! Code ids, verifiers and challenge derivation per RFC 7636
//!
//! The service only ever *generates* code ids. Verifier generation and
//! challenge computation are the client half of the flow; they live here so
//! tests and tooling derive challenges exactly the way the verifier checks them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::method::ChallengeMethod;

/// Prefix that makes code ids recognisable in request bodies and support tickets.
pub const CODE_ID_PREFIX: &str = "c_";

/// Random bytes behind each code id (256 bits).
const CODE_ID_BYTES: usize = 32;

/// Longest challenge accepted at registration (RFC 7636 verifier upper bound).
pub const MAX_CHALLENGE_LEN: usize = 128;

/// Length of a base64url-encoded SHA-256 digest without padding.
const S256_CHALLENGE_LEN: usize = 43;

/// Source of fresh code ids.
///
/// The registry owns one; production uses [`RandomCodeGenerator`].
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// CSPRNG-backed generator producing `c_` + 43 base64url characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        generate_code_id()
    }
}

/// Generate an opaque, URL-safe code id with 256 bits of entropy.
///
/// Nothing about the challenge, client or time is encoded in it.
pub fn generate_code_id() -> String {
    let mut bytes = [0u8; CODE_ID_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{CODE_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a cryptographically random PKCE code verifier.
///
/// Produces a 96-byte random value encoded as URL-safe base64 (no padding),
/// which is exactly 128 characters: the RFC 7636 maximum.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 96];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Check a challenge is storable under the given method.
///
/// Every challenge must be 1..=128 unreserved characters
/// (`ALPHA / DIGIT / "-" / "." / "_" / "~"`). An S256 challenge must
/// additionally be a base64url-encoded 32-byte digest.
pub fn validate_challenge(challenge: &str, method: ChallengeMethod) -> Result<()> {
    if challenge.is_empty() {
        return Err(Error::InvalidRequest("code_challenge is empty".into()));
    }
    if challenge.len() > MAX_CHALLENGE_LEN {
        return Err(Error::InvalidRequest(format!(
            "code_challenge exceeds {MAX_CHALLENGE_LEN} characters"
        )));
    }
    if !challenge.bytes().all(is_unreserved) {
        return Err(Error::InvalidRequest(
            "code_challenge contains characters outside the unreserved set".into(),
        ));
    }

    if method == ChallengeMethod::S256 {
        let decodes_to_digest = challenge.len() == S256_CHALLENGE_LEN
            && URL_SAFE_NO_PAD
                .decode(challenge)
                .is_ok_and(|digest| digest.len() == 32);
        if !decodes_to_digest {
            return Err(Error::InvalidRequest(
                "S256 code_challenge must be a base64url SHA-256 digest".into(),
            ));
        }
    }

    Ok(())
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}
