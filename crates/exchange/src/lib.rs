//! Token exchange orchestration
//!
//! Turns a verified PKCE challenge into identity provider tokens. The
//! `TokenOrchestrator` owns the redemption sequence (claim, verify, OTP gate,
//! exchange type guard, consume, issue) and the refresh pass-through. OTP
//! checks are delegated to an `OtpVerifier`.

pub mod error;
pub mod orchestrator;
pub mod otp;

pub use error::{Error, Result};
pub use orchestrator::{ExchangeSettings, RedeemRequest, TokenBundle, TokenOrchestrator};
pub use otp::{HttpOtpVerifier, OtpFuture, OtpSubject, OtpVerifier};
