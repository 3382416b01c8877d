//! Proof verification
//!
//! The comparison is constant time over the compared bytes so a caller
//! cannot learn how many leading characters of a guess were right.

use subtle::ConstantTimeEq;

use crate::codegen::compute_challenge;
use crate::method::ChallengeMethod;

/// Check a presented code verifier against a stored challenge.
///
/// - `Plain`: the verifier must equal the challenge.
/// - `S256`: `BASE64URL(SHA256(verifier))` must equal the challenge.
pub fn verify(presented_verifier: &str, stored_challenge: &str, method: ChallengeMethod) -> bool {
    match method {
        ChallengeMethod::Plain => ct_eq(presented_verifier, stored_challenge),
        ChallengeMethod::S256 => ct_eq(&compute_challenge(presented_verifier), stored_challenge),
    }
}

// Length is not secret: S256 challenges are always 43 characters and plain
// challenges are chosen by the client that later presents them.
fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn s256_accepts_matching_verifier() {
        assert!(verify(RFC_VERIFIER, RFC_CHALLENGE, ChallengeMethod::S256));
    }

    #[test]
    fn s256_rejects_wrong_verifier() {
        assert!(!verify("not-the-verifier", RFC_CHALLENGE, ChallengeMethod::S256));
    }

    #[test]
    fn s256_does_not_accept_the_challenge_itself() {
        // Presenting the public challenge as the verifier must fail
        assert!(!verify(RFC_CHALLENGE, RFC_CHALLENGE, ChallengeMethod::S256));
    }

    #[test]
    fn plain_requires_exact_match() {
        assert!(verify("verifier-abc", "verifier-abc", ChallengeMethod::Plain));
        assert!(!verify("verifier-abd", "verifier-abc", ChallengeMethod::Plain));
        assert!(!verify("verifier-ab", "verifier-abc", ChallengeMethod::Plain));
        assert!(!verify("", "verifier-abc", ChallengeMethod::Plain));
    }

    #[test]
    fn plain_does_not_hash() {
        let hashed = compute_challenge("verifier-abc");
        assert!(!verify("verifier-abc", &hashed, ChallengeMethod::Plain));
    }

    #[test]
    fn example_scenario_challenge_verifies() {
        let challenge = compute_challenge("verifier-abc");
        assert!(verify("verifier-abc", &challenge, ChallengeMethod::S256));
    }
}
