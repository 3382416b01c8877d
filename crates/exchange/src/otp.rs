//! One-time password gate
//!
//! OTP delivery happens elsewhere; this module only asks an external
//! verifier whether a presented OTP is valid for a subject.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::Serialize;
use tracing::{debug, warn};

/// Whom the OTP was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpSubject<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
}

/// Boxed future returned by [`OtpVerifier::verify`].
pub type OtpFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// External OTP check. Implementations answer `false` for anything other than
/// a positive confirmation.
pub trait OtpVerifier: Send + Sync {
    fn verify<'a>(&'a self, subject: OtpSubject<'a>, otp: &'a Secret<String>) -> OtpFuture<'a>;
}

#[derive(Serialize)]
struct VerifyBody<'a> {
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    otp: &'a str,
}

/// OTP verifier that POSTs `{client_id, username, otp}` to a URL.
///
/// Any 2xx status is a pass. Other statuses and transport errors fail closed.
pub struct HttpOtpVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpOtpVerifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl OtpVerifier for HttpOtpVerifier {
    fn verify<'a>(&'a self, subject: OtpSubject<'a>, otp: &'a Secret<String>) -> OtpFuture<'a> {
        Box::pin(async move {
            let body = VerifyBody {
                client_id: subject.client_id,
                username: subject.username,
                otp: otp.expose(),
            };
            match self.client.post(&self.url).json(&body).send().await {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    debug!(
                        client_id = %subject.client_id,
                        status = %response.status(),
                        "otp rejected"
                    );
                    false
                }
                Err(e) => {
                    warn!(client_id = %subject.client_id, error = %e, "otp verifier unreachable");
                    false
                }
            }
        })
    }
}
