//! Challenge methods and exchange types
//!
//! Both are bound to a challenge at registration time and never change
//! afterwards: the method selects the transform applied to the verifier, the
//! exchange type caps which token classes a redemption may ask for.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transform applied to the code verifier before comparison (RFC 7636 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

impl ChallengeMethod {
    /// Every method this build knows how to verify.
    pub const ALL: [ChallengeMethod; 2] = [ChallengeMethod::Plain, ChallengeMethod::S256];

    /// Wire name, as sent in `code_challenge_method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::Plain => "plain",
            ChallengeMethod::S256 => "S256",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeMethod {
    type Err = Error;

    /// Method names are case-sensitive, matching RFC 7636.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(ChallengeMethod::Plain),
            "S256" => Ok(ChallengeMethod::S256),
            other => Err(Error::InvalidRequest(format!(
                "unsupported code_challenge_method: {other}"
            ))),
        }
    }
}

/// Set of token classes a redemption may produce.
///
/// Serialized as a list of class names, e.g. `["client", "user"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ExchangeType(u8);

impl ExchangeType {
    const CLIENT_BIT: u8 = 0b01;
    const USER_BIT: u8 = 0b10;

    pub const NONE: ExchangeType = ExchangeType(0);
    pub const CLIENT: ExchangeType = ExchangeType(Self::CLIENT_BIT);
    pub const USER: ExchangeType = ExchangeType(Self::USER_BIT);
    pub const BOTH: ExchangeType = ExchangeType(Self::CLIENT_BIT | Self::USER_BIT);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn includes_client(&self) -> bool {
        self.0 & Self::CLIENT_BIT != 0
    }

    pub fn includes_user(&self) -> bool {
        self.0 & Self::USER_BIT != 0
    }

    /// Whether every class in `other` is also in `self`.
    pub fn contains(&self, other: ExchangeType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: ExchangeType) -> ExchangeType {
        ExchangeType(self.0 | other.0)
    }

    /// Class names in canonical order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(2);
        if self.includes_client() {
            names.push("client");
        }
        if self.includes_user() {
            names.push("user");
        }
        names
    }

    /// Parse a list of class names. Duplicates are harmless; unknown names are not.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names.iter().try_fold(ExchangeType::NONE, |acc, name| {
            let class = match name.as_ref() {
                "client" => ExchangeType::CLIENT,
                "user" => ExchangeType::USER,
                other => {
                    return Err(Error::InvalidRequest(format!(
                        "unknown exchange type: {other}"
                    )));
                }
            };
            Ok(acc.union(class))
        })
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("+"))
    }
}

impl TryFrom<Vec<String>> for ExchangeType {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        ExchangeType::from_names(&names)
    }
}

impl From<ExchangeType> for Vec<String> {
    fn from(exchange_type: ExchangeType) -> Self {
        exchange_type
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }
}
