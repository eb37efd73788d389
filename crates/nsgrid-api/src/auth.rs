//! Bearer-token authentication.
//!
//! A request is made either by the operator (the configured admin token) or
//! by a tenant (an API key, which resolves to exactly one namespace).

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use nsgrid_provision::{Credential, ProvisionError, ProvisionResult};
use sha2::{Digest, Sha256};

use crate::ApiState;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Tenant(Credential),
}

impl Caller {
    /// Ok if the caller may act on `namespace`.
    pub fn authorize(&self, namespace: &str) -> ProvisionResult<()> {
        match self {
            Caller::Admin => Ok(()),
            Caller::Tenant(cred) => cred.authorize(namespace),
        }
    }

    /// The tenant credential; the admin token is bound to no namespace.
    pub fn tenant(&self) -> ProvisionResult<&Credential> {
        match self {
            Caller::Tenant(cred) => Ok(cred),
            Caller::Admin => Err(ProvisionError::Forbidden {
                namespace: "(admin)".to_string(),
            }),
        }
    }
}

/// The token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller of a request.
pub fn authenticate(state: &ApiState, headers: &HeaderMap) -> ProvisionResult<Caller> {
    let token = bearer_token(headers).ok_or(ProvisionError::Unauthorized)?;
    if state
        .admin_token
        .as_deref()
        .is_some_and(|admin| tokens_match(token, admin))
    {
        return Ok(Caller::Admin);
    }
    state.keys.authenticate(token).map(Caller::Tenant)
}

/// Compare fixed-length digests so the comparison does not depend on where
/// the first differing byte is.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer ak_123")), Some("ak_123"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("", "secret"));
    }

    #[test]
    fn admin_may_act_on_any_namespace_but_has_no_tenant() {
        assert!(Caller::Admin.authorize("shop-42").is_ok());
        assert!(Caller::Admin.tenant().is_err());

        let tenant = Caller::Tenant(Credential {
            namespace: "shop-42".to_string(),
            wallet: "w".to_string(),
        });
        assert!(tenant.authorize("shop-42").is_ok());
        assert!(tenant.authorize("shop-43").is_err());
        assert_eq!(tenant.tenant().unwrap().namespace, "shop-42");
    }
}
