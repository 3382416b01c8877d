//! Shared types for the PKCE exchange workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
