//! User accounts: password hashing, registration, login lockout and session
//! issuance.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::session::{SessionError, SessionKeys};
use crate::store::{Filter, StoreError, Table, Update, User};

pub const MIN_PASSWORD_LEN: usize = 12;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Consecutive failures that trigger a lockout.
pub const FAILS_PER_LOCKOUT: u32 = 3;

/// Largest exponent used for lockout escalation (3^7 = 2187 minutes).
const MAX_LOCKOUT_EXPONENT: u32 = 7;

const SALT_LEN: usize = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
    pub output_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 1,
            lanes: 4,
            output_len: 32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("password hashing: {0}")]
pub struct HashError(String);

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    params: KdfParams,
}

impl PasswordHasher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// Hex-encoded Argon2id digest of `password` under the hex-encoded `salt`.
    pub fn hash(&self, password: &str, salt: &str) -> Result<String, HashError> {
        let salt = hex::decode(salt).map_err(|e| HashError(e.to_string()))?;
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.lanes,
            Some(self.params.output_len),
        )
        .map_err(|e| HashError(e.to_string()))?;
        let mut out = Zeroizing::new(vec![0u8; self.params.output_len]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password.as_bytes(), &salt, &mut out)
            .map_err(|e| HashError(e.to_string()))?;
        Ok(hex::encode(out.as_slice()))
    }

    pub fn verify(&self, user: &User, password: &str) -> Result<bool, HashError> {
        let hash = self.hash(password, &user.salt)?;
        Ok(constant_time_eq(hash.as_bytes(), user.password_hash.as_bytes()))
    }

    /// [`PasswordHasher::hash`] on the blocking thread pool.
    pub async fn hash_async(&self, password: &str, salt: &str) -> Result<String, HashError> {
        let hasher = *self;
        let password = Zeroizing::new(password.to_owned());
        let salt = salt.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&password, &salt))
            .await
            .map_err(|e| HashError(e.to_string()))?
    }

    /// [`PasswordHasher::verify`] on the blocking thread pool.
    pub async fn verify_async(&self, user: &User, password: &str) -> Result<bool, HashError> {
        let hash = self.hash_async(password, &user.salt).await?;
        Ok(constant_time_eq(hash.as_bytes(), user.password_hash.as_bytes()))
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(KdfParams::default())
    }
}

fn generate_salt() -> String {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Lockout length for the `nth` lockout (1-based): `3^(n-1)` minutes.
pub fn lockout_duration(nth: u32) -> Duration {
    let exponent = nth.saturating_sub(1).min(MAX_LOCKOUT_EXPONENT);
    Duration::minutes(3i64.pow(exponent))
}

pub fn password_len_ok(password: &str) -> bool {
    (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&password.len())
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("user is locked out until {until}")]
    Timeout { until: DateTime<Utc> },
    #[error("username or password is incorrect")]
    Incorrect,
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("password length must be {MIN_PASSWORD_LEN}-{MAX_PASSWORD_LEN}")]
    PasswordLength,
    #[error("username or email already used")]
    Taken,
    #[error("current password is incorrect")]
    IncorrectPassword,
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// User accounts plus the session signing keys.
#[derive(Clone)]
pub struct Directory {
    users: Arc<dyn Table<User>>,
    sessions: SessionKeys,
    hasher: PasswordHasher,
    create_lock: Arc<Mutex<()>>,
}

impl Directory {
    pub fn new(users: Arc<dyn Table<User>>, sessions: SessionKeys, hasher: PasswordHasher) -> Self {
        Self {
            users,
            sessions,
            hasher,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn users(&self) -> &dyn Table<User> {
        self.users.as_ref()
    }

    pub fn sessions(&self) -> &SessionKeys {
        &self.sessions
    }

    /// Builds (but does not store) a user with a fresh salt and id.
    pub async fn new_user(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<User, HashError> {
        let salt = generate_salt();
        let password_hash = self.hasher.hash_async(password, &salt).await?;
        Ok(User {
            id: uuid::Uuid::now_v7().to_string(),
            username: username.to_owned(),
            password_hash,
            salt,
            email: email.to_owned(),
            fail_count: 0,
            lockout_until: None,
            password_changed_at: None,
            perm: HashMap::new(),
        })
    }

    /// Creates an account and returns it with a session token.
    ///
    /// The password is hashed first. The uniqueness checks and the insert then
    /// run under one lock so concurrent registrations cannot both claim a
    /// username or email.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<(User, String), AccountError> {
        if !password_len_ok(password) {
            return Err(AccountError::PasswordLength);
        }

        let user = self.new_user(username, password, email).await?;
        let guard = self.create_lock.lock().await;
        for (field, value) in [("username", username), ("email", email)] {
            match self.users.find(&Filter::new().eq(field, value)).await {
                Ok(_) => return Err(AccountError::Taken),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.users.insert(&user).await?;
        drop(guard);

        info!(user_id = %user.id, username, "audit: user.create");
        let token = self.sessions.issue(&user)?;
        Ok((user, token))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        match self.users.find(&Filter::new().eq("username", username)).await {
            Ok(mut users) => {
                if users.len() > 1 {
                    warn!(username, count = users.len(), "duplicate username detected");
                }
                Ok(Some(users.swap_remove(0)))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Checks a username/password pair, applying the lockout policy.
    ///
    /// Every third consecutive failure locks the account for an escalating
    /// period. A successful login clears the failure count.
    pub async fn try_login(&self, username: &str, password: &str) -> Result<User, LoginError> {
        let Some(mut user) = self.find_by_username(username).await? else {
            return Err(LoginError::Incorrect);
        };
        let now = Utc::now();
        if let Some(until) = user.lockout_until.filter(|until| *until > now) {
            return Err(LoginError::Timeout { until });
        }

        if !self.hasher.verify_async(&user, password).await? {
            let fails = user.fail_count + 1;
            let mut update = Update::new().set("failCount", fails)?;
            let lockout = (fails % FAILS_PER_LOCKOUT == 0)
                .then(|| now + lockout_duration(fails / FAILS_PER_LOCKOUT));
            if let Some(until) = lockout {
                update = update.set("lockoutUntil", until)?;
            }
            self.users.part_update(&user.id, &update).await?;
            return match lockout {
                Some(until) => {
                    info!(user_id = %user.id, fails, %until, "audit: user.lockout");
                    Err(LoginError::Timeout { until })
                }
                None => Err(LoginError::Incorrect),
            };
        }

        if user.fail_count != 0 || user.lockout_until.is_some() {
            let reset = Update::new()
                .set("failCount", 0u32)?
                .set("lockoutUntil", None::<DateTime<Utc>>)?;
            self.users.part_update(&user.id, &reset).await?;
            user.fail_count = 0;
            user.lockout_until = None;
        }
        Ok(user)
    }

    /// Replaces a user's password after checking the current one. Tokens
    /// issued before the change stop verifying.
    pub async fn change_password(
        &self,
        user_id: &str,
        current: &str,
        new: &str,
    ) -> Result<User, AccountError> {
        if !password_len_ok(new) {
            return Err(AccountError::PasswordLength);
        }
        let mut user = self.users.get(user_id).await?;
        if !self.hasher.verify_async(&user, current).await? {
            return Err(AccountError::IncorrectPassword);
        }
        user.salt = generate_salt();
        user.password_hash = self.hasher.hash_async(new, &user.salt).await?;
        user.password_changed_at = Some(Utc::now());
        self.users.full_update(&user.id, &user).await?;
        info!(user_id, "audit: user.password_change");
        Ok(user)
    }

    pub async fn remove(&self, user_id: &str) -> Result<(), StoreError> {
        self.users.remove(user_id).await?;
        info!(user_id, "audit: user.delete");
        Ok(())
    }

    pub fn issue_token(&self, user: &User) -> Result<String, SessionError> {
        self.sessions.issue(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RedbTable, Store};

    const LIGHT: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        lanes: 1,
        output_len: 32,
    };

    fn directory() -> (tempfile::TempDir, Directory, Arc<RedbTable<User>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("users.db")).unwrap();
        let users: Arc<RedbTable<User>> = Arc::new(store.table("users").unwrap());
        let directory = Directory::new(
            users.clone(),
            SessionKeys::generate().unwrap(),
            PasswordHasher::new(LIGHT),
        );
        (dir, directory, users)
    }

    #[test]
    fn lockout_escalates_and_caps() {
        assert_eq!(lockout_duration(1), Duration::minutes(1));
        assert_eq!(lockout_duration(2), Duration::minutes(3));
        assert_eq!(lockout_duration(3), Duration::minutes(9));
        assert_eq!(lockout_duration(50), Duration::minutes(2187));
    }

    #[test]
    fn password_bounds() {
        assert!(!password_len_ok("short"));
        assert!(password_len_ok("exactly12chr"));
        assert!(password_len_ok(&"x".repeat(128)));
        assert!(!password_len_ok(&"x".repeat(129)));
    }

    #[test]
    fn hash_depends_on_salt() {
        let hasher = PasswordHasher::new(LIGHT);
        let a = hasher.hash("CorrectHorseBattery1", &hex::encode([1u8; 16])).unwrap();
        let b = hasher.hash("CorrectHorseBattery1", &hex::encode([2u8; 16])).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hashing_yields_to_the_runtime() {
        let hasher = PasswordHasher::new(KdfParams {
            memory_kib: 8 * 1024,
            ..LIGHT
        });
        let salt = hex::encode([3u8; 16]);
        let hashing = hasher.hash_async("CorrectHorseBattery1", &salt);
        tokio::pin!(hashing);

        let finished_first = tokio::select! {
            biased;
            _ = &mut hashing => true,
            _ = std::future::ready(()) => false,
        };
        assert!(!finished_first, "hash ran on the runtime thread");

        let digest = hashing.await.unwrap();
        assert_eq!(digest, hasher.hash("CorrectHorseBattery1", &salt).unwrap());
    }

    #[tokio::test]
    async fn login_with_correct_password() {
        let (_dir, dir, _users) = directory();
        let (user, _token) = dir
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        let logged_in = dir.try_login("alice", "CorrectHorseBattery1").await.unwrap();
        assert_eq!(logged_in.id, user.id);
    }

    #[tokio::test]
    async fn unknown_user_is_incorrect() {
        let (_dir, dir, _users) = directory();
        assert!(matches!(
            dir.try_login("nobody", "CorrectHorseBattery1").await,
            Err(LoginError::Incorrect)
        ));
    }

    #[tokio::test]
    async fn third_failure_locks_out() {
        let (_dir, dir, users) = directory();
        let (user, _) = dir
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(matches!(
                dir.try_login("alice", "wrong-password!").await,
                Err(LoginError::Incorrect)
            ));
        }
        assert!(matches!(
            dir.try_login("alice", "wrong-password!").await,
            Err(LoginError::Timeout { .. })
        ));

        match dir.try_login("alice", "CorrectHorseBattery1").await {
            Err(LoginError::Timeout { until }) => assert!(until > Utc::now()),
            other => panic!("expected timeout, got {other:?}"),
        }
        let stored = users.get(&user.id).await.unwrap();
        assert_eq!(stored.fail_count, 3);
        assert!(stored.is_locked_out(Utc::now()));
    }

    #[tokio::test]
    async fn success_resets_fail_count() {
        let (_dir, dir, users) = directory();
        let (user, _) = dir
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        for _ in 0..2 {
            let _ = dir.try_login("alice", "wrong-password!").await;
        }
        assert_eq!(users.get(&user.id).await.unwrap().fail_count, 2);

        let logged_in = dir.try_login("alice", "CorrectHorseBattery1").await.unwrap();
        assert_eq!(logged_in.fail_count, 0);
        assert_eq!(users.get(&user.id).await.unwrap().fail_count, 0);

        // A fresh streak is needed for the next lockout.
        for _ in 0..2 {
            assert!(matches!(
                dir.try_login("alice", "wrong-password!").await,
                Err(LoginError::Incorrect)
            ));
        }
    }

    #[tokio::test]
    async fn expired_lockout_allows_login() {
        let (_dir, dir, users) = directory();
        let (user, _) = dir
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        users
            .part_update(
                &user.id,
                &Update::new()
                    .set("failCount", 3u32)
                    .unwrap()
                    .set("lockoutUntil", Utc::now() - Duration::minutes(1))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(dir.try_login("alice", "CorrectHorseBattery1").await.is_ok());
    }

    #[tokio::test]
    async fn register_rejects_taken_and_bad_passwords() {
        let (_dir, dir, _users) = directory();
        dir.register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        assert!(matches!(
            dir.register("alice", "CorrectHorseBattery1", "other@example.com").await,
            Err(AccountError::Taken)
        ));
        assert!(matches!(
            dir.register("alice2", "CorrectHorseBattery1", "alice@example.com").await,
            Err(AccountError::Taken)
        ));
        assert!(matches!(
            dir.register("bob", "short", "bob@example.com").await,
            Err(AccountError::PasswordLength)
        ));
    }

    #[tokio::test]
    async fn concurrent_registration_creates_one_account() {
        let (_dir, dir, users) = directory();
        let a = dir.clone();
        let b = dir.clone();
        let (ra, rb) = tokio::join!(
            a.register("alice", "CorrectHorseBattery1", "alice@example.com"),
            b.register("alice", "CorrectHorseBattery1", "alice@example.com"),
        );
        assert!(ra.is_ok() ^ rb.is_ok());
        let found = users
            .find(&Filter::new().eq("username", "alice"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn change_password_swaps_credentials() {
        let (_dir, dir, _users) = directory();
        let (user, _) = dir
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        assert!(matches!(
            dir.change_password(&user.id, "not-the-password", "NewStapleBattery22")
                .await,
            Err(AccountError::IncorrectPassword)
        ));
        let changed = dir
            .change_password(&user.id, "CorrectHorseBattery1", "NewStapleBattery22")
            .await
            .unwrap();
        assert!(changed.password_changed_at.is_some());
        assert!(dir.try_login("alice", "NewStapleBattery22").await.is_ok());
        assert!(matches!(
            dir.try_login("alice", "CorrectHorseBattery1").await,
            Err(LoginError::Incorrect)
        ));
    }
}
