//! Access control seam for git transfers.
//!
//! The node asks an [`AccessPolicy`] before every advertisement, fetch and
//! push. Identity and permissions live outside this crate; the two policies
//! here cover an open node and a node with a shared push token.

use axum::http::{header, HeaderMap};

/// Kind of access a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Advertisement of upload-pack, or a fetch.
    Read,
    /// Advertisement of receive-pack, or a push.
    Write,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// No usable credentials; the client should authenticate.
    Unauthenticated,
    /// Credentials were presented but do not grant the access.
    Forbidden,
}

/// Decides whether a request may touch a repository.
pub trait AccessPolicy: Send + Sync + 'static {
    /// Authorizes `access` to `owner/name`.
    fn authorize(
        &self,
        owner: &str,
        name: &str,
        access: Access,
        headers: &HeaderMap,
    ) -> Result<(), Denial>;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _: &str, _: &str, _: Access, _: &HeaderMap) -> Result<(), Denial> {
        Ok(())
    }
}

/// Grants reads to everyone and writes to holders of one bearer token.
#[derive(Debug, Clone)]
pub struct StaticTokenPolicy {
    write_token: String,
}

impl StaticTokenPolicy {
    /// Creates a policy requiring `write_token` for pushes.
    pub fn new(write_token: impl Into<String>) -> Self {
        Self {
            write_token: write_token.into(),
        }
    }
}

/// Extracts a bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AccessPolicy for StaticTokenPolicy {
    fn authorize(&self, owner: &str, name: &str, access: Access, headers: &HeaderMap) -> Result<(), Denial> {
        if access == Access::Read {
            return Ok(());
        }
        match bearer_token(headers) {
            None => Err(Denial::Unauthenticated),
            Some(token) if constant_time_eq(token.as_bytes(), self.write_token.as_bytes()) => Ok(()),
            Some(_) => {
                tracing::warn!(owner, name, "Push with invalid token");
                Err(Denial::Forbidden)
            }
        }
    }
}
