use crate::errors::{AuthError, SandboxResult};
use crate::models::{AuthMethod, SessionState};
use crate::service::{AuthAttempt, IdentityProvider};
use chrono::{DateTime, Utc};
use ssh_key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Login names ending in this suffix request a direct login.
pub const DIRECT_LOGIN_SUFFIX: &str = "-ws";
/// Lifetime of tokens minted for public key logins.
pub const KEY_LOGIN_TOKEN_DURATION: &str = "24h";

#[derive(Clone)]
pub struct Authenticator {
    identity: Arc<dyn IdentityProvider>,
    login_validity: Duration,
}

impl Authenticator {
    pub fn new(identity: Arc<dyn IdentityProvider>, login_validity: Duration) -> Self {
        Self {
            identity,
            login_validity,
        }
    }

    pub async fn authenticate(
        &self,
        login_name: &str,
        attempt: &AuthAttempt,
    ) -> SandboxResult<SessionState> {
        match attempt {
            AuthAttempt::Password(password) => self.password(login_name, password).await,
            AuthAttempt::PublicKey(key) => self.public_key(login_name, key).await,
        }
    }

    pub async fn password(&self, login_name: &str, password: &str) -> SandboxResult<SessionState> {
        let (username, direct_login) = split_login_name(login_name)?;
        let token = self.identity.login(username, password).await?;
        let user = self.identity.get_user(username).await?;
        debug!("password login accepted for {username} (id {})", user.id);
        Ok(SessionState {
            user,
            token,
            direct_login,
            method: AuthMethod::Password,
        })
    }

    pub async fn public_key(&self, login_name: &str, key: &PublicKey) -> SandboxResult<SessionState> {
        self.public_key_at(login_name, key, Utc::now()).await
    }

    async fn public_key_at(
        &self,
        login_name: &str,
        key: &PublicKey,
        now: DateTime<Utc>,
    ) -> SandboxResult<SessionState> {
        let (username, direct_login) = split_login_name(login_name)?;
        let user = self.identity.get_user(username).await?;

        let stored = PublicKey::from_openssh(user.ssh_key.trim())
            .map_err(|e| AuthError::InvalidStoredKey(e.to_string()))?;
        if stored.key_data() != key.key_data() {
            return Err(AuthError::KeyMismatch.into());
        }

        let validity = chrono::Duration::from_std(self.login_validity)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let expires = user.renewed.checked_add_signed(validity);
        if expires.is_some_and(|expires| expires < now) {
            return Err(AuthError::NotRenewed.into());
        }

        let token = self
            .identity
            .issue_token(username, KEY_LOGIN_TOKEN_DURATION)
            .await?;
        debug!("public key login accepted for {username} (id {})", user.id);
        Ok(SessionState {
            user,
            token,
            direct_login,
            method: AuthMethod::PublicKey,
        })
    }
}

/// Splits `<name>-ws` into `(name, true)`; anything else is `(name, false)`.
fn split_login_name(login_name: &str) -> Result<(&str, bool), AuthError> {
    let (username, direct) = match login_name.strip_suffix(DIRECT_LOGIN_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => (stripped, true),
        _ => (login_name, false),
    };
    let valid = !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !username.starts_with('.');
    if !valid {
        return Err(AuthError::InvalidCredentials(format!(
            "invalid username '{}'",
            login_name.escape_debug()
        )));
    }
    Ok((username, direct))
}
