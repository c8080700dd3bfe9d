//! Identity provider contract and permission levels.
//!
//! The directory service (LDAP in the reference deployment) is an
//! external collaborator. The daemon only needs two questions answered:
//! do these credentials belong to someone, and which groups are they in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from credential checks.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("directory service unavailable: {0}")]
    Unavailable(String),
}

/// Permission level of an authenticated user. Ordered so handlers can
/// gate on `user.permissions >= Permissions::Administrator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permissions {
    User,
    Administrator,
}

/// An authenticated operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    pub username: String,
    pub permissions: Permissions,
    pub groups: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.permissions >= Permissions::Administrator
    }
}

/// Directory-service contract.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check credentials and return the authenticated user.
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthUser, AuthError>;

    /// Group memberships for a known username.
    async fn groups(&self, username: &str) -> Result<Vec<String>, AuthError>;
}

/// Statically configured accounts for deployments without a directory
/// service (and for tests).
pub struct StaticIdentityProvider {
    users: Vec<StaticAccount>,
}

struct StaticAccount {
    username: String,
    password: String,
    permissions: Permissions,
    groups: Vec<String>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self { users: Vec::new() }
    }

    pub fn with_user(
        mut self,
        username: &str,
        password: &str,
        admin: bool,
        groups: Vec<String>,
    ) -> Self {
        self.users.push(StaticAccount {
            username: username.to_string(),
            password: password.to_string(),
            permissions: if admin {
                Permissions::Administrator
            } else {
                Permissions::User
            },
            groups,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthUser, AuthError> {
        self.users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .map(|u| AuthUser {
                username: u.username.clone(),
                permissions: u.permissions,
                groups: u.groups.clone(),
            })
            .ok_or(AuthError::InvalidCredentials)
    }

    async fn groups(&self, username: &str) -> Result<Vec<String>, AuthError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.groups.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_are_ordered() {
        assert!(Permissions::Administrator >= Permissions::Administrator);
        assert!(Permissions::Administrator > Permissions::User);
        assert!(Permissions::User < Permissions::Administrator);
    }

    #[tokio::test]
    async fn static_provider_checks_credentials() {
        let provider = StaticIdentityProvider::new().with_user(
            "ops",
            "hunter2",
            true,
            vec!["admins".to_string()],
        );

        let user = provider.authenticate("ops", "hunter2").await.unwrap();
        assert!(user.is_admin());
        assert_eq!(user.groups, vec!["admins"]);

        assert!(provider.authenticate("ops", "wrong").await.is_err());
        assert!(provider.authenticate("ghost", "hunter2").await.is_err());
    }
}
