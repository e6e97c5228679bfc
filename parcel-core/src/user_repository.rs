//! User repository
//!
//! Registration, login and session management against the remote auth
//! provider and the remote profile store. Passwords are verified twice on
//! login: once by the auth provider and once against the stored digest, so a
//! profile that drifted from its auth identity cannot be signed into.
//!
//! Email uniqueness is checked with a query before the auth account is
//! created. Two registrations racing between the check and the create can
//! still both pass; only a server-side constraint closes that gap.

use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::error::{RepositoryError, Result};
use crate::hasher::PasswordHasher;
use crate::model::collections::USERS;
use crate::model::{NewUser, User, fields, normalize_email};
use crate::remote::{AuthClient, RemoteError, RemoteStore, decode, encode, with_timeout};
use crate::session::{Session, SessionStore};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Display name used when only the auth identity is known
pub const PLACEHOLDER_USERNAME: &str = "User";

pub struct UserRepository {
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthClient>,
    session: Arc<dyn SessionStore>,
    cache: Arc<LocalCache>,
    connectivity: Arc<dyn Connectivity>,
    hasher: PasswordHasher,
    timeout: Duration,
}

impl UserRepository {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthClient>,
        session: Arc<dyn SessionStore>,
        cache: Arc<LocalCache>,
        connectivity: Arc<dyn Connectivity>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            remote,
            auth,
            session,
            cache,
            connectivity,
            hasher: PasswordHasher::new(config.password_salt.clone()),
            timeout: config.request_timeout(),
        }
    }

    /// Register a new user and sign them in.
    pub async fn register(&self, new_user: NewUser) -> Result<User> {
        self.ensure_online("register")?;

        let email = normalize_email(&new_user.email);
        let username = new_user.username.trim().to_string();
        if username.is_empty() {
            return Err(RepositoryError::Validation("username must not be empty".to_string()));
        }
        if !email.contains('@') {
            return Err(RepositoryError::Validation(format!("invalid email address: {}", email)));
        }
        if new_user.password.is_empty() {
            return Err(RepositoryError::Validation("password must not be empty".to_string()));
        }

        // Checked before the auth account exists so a duplicate never leaves
        // an orphaned identity behind.
        if self.email_exists(&email).await? {
            info!("Registration rejected, email already registered: {}", email);
            return Err(RepositoryError::EmailTaken(email));
        }

        let password_hash = self.hasher.hash(&new_user.password)?;

        let id = match with_timeout(self.timeout, self.auth.create_account(&email, &new_user.password)).await {
            Ok(id) => id,
            Err(RemoteError::Conflict(_)) => self.resume_registration(&email, &new_user.password).await?,
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let user = User {
            id: id.clone(),
            username,
            email,
            password_hash,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = with_timeout(self.timeout, self.remote.set(USERS, &id, encode(&user)?)).await {
            warn!("Auth account {} created but profile write failed: {}", id, e);
            return Err(e.into());
        }

        self.save_session(&user).await;
        if let Err(e) = self.cache.put(&user, false) {
            warn!("Could not cache user {}: {}", id, e);
        }
        info!("Registered user {} ({})", id, user.email);
        Ok(user)
    }

    /// Sign in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        self.ensure_online("log in")?;

        let email = normalize_email(email);
        // Fail on hashing before the auth provider is contacted.
        self.hasher.hash(password)?;

        let id = match with_timeout(self.timeout, self.auth.sign_in(&email, password)).await {
            Ok(id) => id,
            Err(RemoteError::AuthRejected | RemoteError::NotFound { .. }) => {
                debug!("Auth provider rejected login for {}", email);
                return Err(RepositoryError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        let doc = match with_timeout(self.timeout, self.remote.get(USERS, &id)).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                warn!("Signed in as {} but no profile exists", id);
                self.sign_out_quietly().await;
                return Err(RepositoryError::not_found(USERS, id));
            }
            Err(e) => {
                self.sign_out_quietly().await;
                return Err(e.into());
            }
        };
        let user: User = decode(doc)?;

        if !self.hasher.verify(password, &user.password_hash)? {
            warn!("Stored password digest does not match for user {}", id);
            self.sign_out_quietly().await;
            return Err(RepositoryError::InvalidCredentials);
        }

        self.save_session(&user).await;
        if let Err(e) = self.cache.put(&user, false) {
            warn!("Could not cache user {}: {}", id, e);
        }
        info!("User {} logged in", id);
        Ok(user)
    }

    /// The signed-in user, or `None` when nobody is signed in.
    ///
    /// The remote profile is used when reachable. Otherwise the cached
    /// profile, and failing that a minimal identity with a placeholder name.
    pub async fn get_current_user(&self) -> Option<User> {
        let account = self.auth.current_account().await;
        let session = match self.session.read().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not read session: {}", e);
                None
            }
        };

        let (id, email, name) = match (account, session) {
            (Some(account), session) => {
                let name = account
                    .display_name
                    .or_else(|| session.filter(|s| s.user_id == account.id).map(|s| s.user_name));
                (account.id, account.email, name)
            }
            (None, Some(session)) => (session.user_id, session.email, Some(session.user_name)),
            (None, None) => return None,
        };

        if self.connectivity.is_online() {
            match with_timeout(self.timeout, self.remote.get(USERS, &id)).await {
                Ok(Some(doc)) => match decode::<User>(doc) {
                    Ok(user) => return Some(self.mirror(user)),
                    Err(e) => warn!("Profile {} is malformed: {}", id, e),
                },
                Ok(None) => debug!("No remote profile for {}", id),
                Err(e) => debug!("Could not enrich user {} from remote: {}", id, e),
            }
        }

        match self.cache.get::<User>(&id) {
            Ok(Some(entry)) => return Some(entry.record),
            Ok(None) => {}
            Err(e) => debug!("Could not read cached profile {}: {}", id, e),
        }

        Some(User::minimal(
            id,
            email,
            name.unwrap_or_else(|| PLACEHOLDER_USERNAME.to_string()),
        ))
    }

    /// Sign out remotely and clear the local session. Never fails.
    pub async fn logout(&self) {
        self.sign_out_quietly().await;
        if let Err(e) = self.session.clear().await {
            warn!("Could not clear local session: {}", e);
        }
        info!("Logged out");
    }

    /// Whether an account uses `email`.
    ///
    /// Offline this answers `false`: an unknown state is treated as not
    /// registered, so it must not be used as a hard gate.
    pub async fn is_email_registered(&self, email: &str) -> Result<bool> {
        if !self.connectivity.is_online() {
            debug!("Offline, reporting {} as not registered", email);
            return Ok(false);
        }
        self.email_exists(&normalize_email(email)).await
    }

    /// Overwrite the profile of user `id` and refresh the session's display fields.
    ///
    /// The email and password digest are kept from the stored profile.
    pub async fn update_user(&self, id: &str, user: User) -> Result<User> {
        self.ensure_online("update user")?;

        let username = user.username.trim().to_string();
        if username.is_empty() {
            return Err(RepositoryError::Validation("username must not be empty".to_string()));
        }

        let existing: User = match with_timeout(self.timeout, self.remote.get(USERS, id)).await? {
            Some(doc) => decode(doc)?,
            None => return Err(RepositoryError::not_found(USERS, id)),
        };
        if !user.email.is_empty() && normalize_email(&user.email) != existing.email {
            return Err(RepositoryError::Validation("email cannot be changed".to_string()));
        }

        let updated = User {
            id: id.to_string(),
            username,
            email: existing.email,
            password_hash: existing.password_hash,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };

        let staged = match self.cache.put(&updated, true) {
            Ok(entry) => Some(entry.updated_at_millis),
            Err(e) => {
                warn!("Could not stage user {} in cache: {}", id, e);
                None
            }
        };

        match with_timeout(self.timeout, self.remote.update(USERS, id, encode(&updated)?)).await {
            Ok(()) => {
                if let Some(written_at) = staged {
                    if let Err(e) = self.cache.mark_clean::<User>(id, written_at) {
                        warn!("Could not mark user {} clean: {}", id, e);
                    }
                }
            }
            Err(RemoteError::NotFound { .. }) => {
                if let Err(e) = self.cache.remove::<User>(id) {
                    warn!("Could not drop user {} from cache: {}", id, e);
                }
                return Err(RepositoryError::not_found(USERS, id));
            }
            Err(e) => {
                warn!("Remote write of user {} failed, left dirty: {}", id, e);
                return Err(e.into());
            }
        }

        match self.session.read().await {
            Ok(Some(session)) if session.user_id == id => self.save_session(&updated).await,
            Ok(_) => {}
            Err(e) => warn!("Could not read session: {}", e),
        }
        info!("Updated user {}", id);
        Ok(updated)
    }

    /// An auth identity already exists for `email`. If the supplied password
    /// opens it and no profile was ever written for it, an earlier
    /// registration stopped after creating the identity and is finished now.
    async fn resume_registration(&self, email: &str, password: &str) -> Result<String> {
        let id = match with_timeout(self.timeout, self.auth.sign_in(email, password)).await {
            Ok(id) => id,
            Err(RemoteError::AuthRejected | RemoteError::NotFound { .. }) => {
                return Err(RepositoryError::EmailTaken(email.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match with_timeout(self.timeout, self.remote.get(USERS, &id)).await {
            Ok(None) => {
                info!("Completing interrupted registration of {} ({})", email, id);
                Ok(id)
            }
            Ok(Some(_)) => {
                self.sign_out_quietly().await;
                Err(RepositoryError::EmailTaken(email.to_string()))
            }
            Err(e) => {
                self.sign_out_quietly().await;
                Err(e.into())
            }
        }
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let docs = with_timeout(self.timeout, self.remote.query(USERS, fields::EMAIL, &json!(email))).await?;
        Ok(!docs.is_empty())
    }

    async fn save_session(&self, user: &User) {
        let session = Session::new(user.id.clone(), user.email.clone(), user.username.clone());
        if let Err(e) = self.session.save(&session).await {
            warn!("Could not persist session for {}: {}", user.id, e);
        }
    }

    async fn sign_out_quietly(&self) {
        if let Err(e) = with_timeout(self.timeout, self.auth.sign_out()).await {
            warn!("Remote sign-out failed: {}", e);
        }
    }

    fn mirror(&self, remote: User) -> User {
        match self.cache.merge_remote(remote.clone()) {
            Ok(view) => view,
            Err(e) => {
                warn!("Could not mirror user {} into cache: {}", remote.id, e);
                remote
            }
        }
    }

    fn ensure_online(&self, operation: &str) -> Result<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            debug!("Cannot {} while offline", operation);
            Err(RepositoryError::Offline)
        }
    }
}
