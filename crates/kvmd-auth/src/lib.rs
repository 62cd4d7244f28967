//! Authentication: credential backends, the in-memory token map and the
//! unix-peer identity table.

mod backends;
mod htpasswd;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tracing::{error, info};

use kvmd_core::ApiError;

pub use backends::{
    AuthBackend, HtpasswdBackend, HttpAuthConfig, HttpBackend, LdapBackend, LdapConfig,
    RadiusBackend, RadiusConfig,
};
pub use htpasswd::HtpasswdFile;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Backend(String),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub struct AuthManager {
    enabled: bool,
    internal: Arc<dyn AuthBackend>,
    external: Option<Arc<dyn AuthBackend>>,
    /// Users always checked against the internal backend even when an
    /// external one is configured (keeps admin reachable when LDAP dies).
    force_internal_users: HashSet<String>,
    tokens: Mutex<HashMap<String, String>>,
    unix_uid_map: HashMap<u32, String>,
}

impl AuthManager {
    pub fn new(
        enabled: bool,
        internal: Arc<dyn AuthBackend>,
        external: Option<Arc<dyn AuthBackend>>,
        force_internal_users: impl IntoIterator<Item = String>,
        unix_uid_map: HashMap<u32, String>,
    ) -> Self {
        Self {
            enabled,
            internal,
            external,
            force_internal_users: force_internal_users.into_iter().collect(),
            tokens: Mutex::new(HashMap::new()),
            unix_uid_map,
        }
    }

    pub fn is_auth_enabled(&self) -> bool {
        self.enabled
    }

    /// Checks credentials without touching the token map (header/basic
    /// flows).
    pub async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        let backend = match &self.external {
            Some(external) if !self.force_internal_users.contains(user) => external.clone(),
            _ => self.internal.clone(),
        };
        backend.authorize(user, passwd).await
    }

    /// Issues (or re-issues) a session token. `expire` is validated
    /// upstream; tokens currently live until logout or restart.
    pub async fn login(&self, user: &str, passwd: &str, _expire: i64) -> Result<Option<String>, AuthError> {
        if !self.authorize(user, passwd).await? {
            error!(user, "access denied");
            return Ok(None);
        }
        let mut tokens = self.tokens.lock();
        if let Some((token, _)) = tokens.iter().find(|(_, owner)| owner.as_str() == user) {
            return Ok(Some(token.clone()));
        }
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        tokens.insert(token.clone(), user.to_owned());
        info!(user, "logged in");
        Ok(Some(token))
    }

    pub fn logout(&self, token: &str) {
        if let Some(user) = self.tokens.lock().remove(token) {
            info!(user, "logged out");
        }
    }

    pub fn check_token(&self, token: &str) -> Option<String> {
        self.tokens.lock().get(token).cloned()
    }

    pub fn check_unix_credentials(&self, uid: u32) -> Option<String> {
        self.unix_uid_map.get(&uid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticBackend(&'static str, &'static str);

    #[async_trait]
    impl AuthBackend for StaticBackend {
        async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
            Ok(user == self.0 && passwd == self.1)
        }
    }

    fn manager() -> AuthManager {
        AuthManager::new(
            true,
            Arc::new(StaticBackend("admin", "adminpass")),
            Some(Arc::new(StaticBackend("remote", "remotepass"))),
            ["admin".to_owned()],
            HashMap::from([(1000, "peer".to_owned())]),
        )
    }

    #[tokio::test]
    async fn login_issues_stable_64_hex_token() {
        let manager = manager();
        let token = manager.login("admin", "adminpass", 0).await.unwrap().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(manager.check_token(&token).as_deref(), Some("admin"));

        // Re-login returns the same live token.
        let again = manager.login("admin", "adminpass", 0).await.unwrap().unwrap();
        assert_eq!(token, again);

        manager.logout(&token);
        assert!(manager.check_token(&token).is_none());
    }

    #[tokio::test]
    async fn bad_credentials_yield_none() {
        let manager = manager();
        assert!(manager.login("admin", "wrong", 0).await.unwrap().is_none());
        assert!(manager.login("ghost", "x", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_internal_bypasses_external() {
        let manager = manager();
        // "admin" only exists internally, "remote" only externally.
        assert!(manager.authorize("admin", "adminpass").await.unwrap());
        assert!(manager.authorize("remote", "remotepass").await.unwrap());
        assert!(!manager.authorize("remote", "adminpass").await.unwrap());
    }

    #[test]
    fn unix_credentials() {
        let manager = manager();
        assert_eq!(manager.check_unix_credentials(1000).as_deref(), Some("peer"));
        assert!(manager.check_unix_credentials(0).is_none());
    }
}
