//! Per-connection authorization at the WebSocket upgrade.
//!
//! The handshake authenticates a channel, not a person. Deployments that
//! want to know who is connecting put a bearer token on the upgrade
//! request and plug a `ConnectionAuthorizer` in here.

use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,
    #[error("invalid bearer credential")]
    Invalid,
}

pub trait ConnectionAuthorizer: Send + Sync {
    /// Resolve the upgrade's bearer token, if any, to a principal.
    fn authorize(&self, bearer: Option<&str>) -> Result<Principal, AuthError>;
}

/// Accepts every connection as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ConnectionAuthorizer for AllowAll {
    fn authorize(&self, _bearer: Option<&str>) -> Result<Principal, AuthError> {
        Ok(Principal::anonymous())
    }
}

/// A fixed token list. When not `required`, a missing token is anonymous
/// but a wrong one is still refused.
#[derive(Debug, Clone)]
pub struct StaticTokens {
    tokens: Vec<String>,
    required: bool,
}

impl StaticTokens {
    pub fn new(tokens: Vec<String>, required: bool) -> Self {
        Self { tokens, required }
    }
}

impl StaticTokens {
    /// Index of the token equal to `candidate`. Every configured token is
    /// compared in constant time, whether or not an earlier one matched.
    fn matching(&self, candidate: &str) -> Option<usize> {
        let mut found = None;
        for (i, token) in self.tokens.iter().enumerate() {
            let equal: Choice = token.as_bytes().ct_eq(candidate.as_bytes());
            if bool::from(equal) && found.is_none() {
                found = Some(i);
            }
        }
        found
    }
}

impl ConnectionAuthorizer for StaticTokens {
    fn authorize(&self, bearer: Option<&str>) -> Result<Principal, AuthError> {
        match bearer {
            None if self.required => Err(AuthError::Missing),
            None => Ok(Principal::anonymous()),
            Some(token) => self
                .matching(token)
                .map(|i| Principal {
                    name: format!("token-{i}"),
                })
                .ok_or(AuthError::Invalid),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}
