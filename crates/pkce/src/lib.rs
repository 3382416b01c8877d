//! PKCE challenge registry
//!
//! Issues opaque code ids for registered challenges, stores them under
//! single-use and TTL semantics, and verifies presented code verifiers in
//! constant time. Token issuance is not this crate's concern; the `exchange`
//! crate drives it once a challenge has been consumed.
//!
//! Challenge flow:
//! 1. Client derives a challenge with `compute_challenge()` (or uses `plain`)
//! 2. `ChallengeRegistry::register()` stores it and returns a code id
//! 3. Redemption calls `ChallengeRegistry::claim()` for exclusive hold
//! 4. `verify()` checks the presented verifier against the claimed record
//! 5. `Claim::commit()` consumes it; dropping the claim instead returns it to pending
//! 6. `spawn_sweep_task()` reclaims records that expire unredeemed

pub mod codegen;
pub mod error;
pub mod method;
pub mod registry;
pub mod sweep;
pub mod verifier;

pub use codegen::{
    CodeGenerator, RandomCodeGenerator, compute_challenge, generate_code_id, generate_verifier,
};
pub use error::{Error, Result};
pub use method::{ChallengeMethod, ExchangeType};
pub use registry::{
    ChallengeRecord, ChallengeRegistry, Claim, EvictionPolicy, RegistrationRequest,
    RegistrySettings,
};
pub use sweep::spawn_sweep_task;
pub use verifier::verify;
