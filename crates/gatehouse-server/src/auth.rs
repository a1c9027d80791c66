use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::ApiError;
use crate::store::{ApiKey, Filter, StoreError, User};
use crate::users::Directory;
use crate::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no api key provided")]
    NoKey,
    #[error("api key present but invalid")]
    ApiKeyUnauthorized,
    #[error("token present but invalid")]
    TokenUnauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The authenticated user behind a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestUser {
    pub id: String,
    pub username: String,
    pub perm: HashMap<String, String>,
}

impl From<User> for RequestUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            perm: u.perm,
        }
    }
}

/// Result of reading a request's credentials. The key is always valid; the
/// user is present only when a bearer token verified.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    pub key: ApiKey,
    pub user: Option<RequestUser>,
    /// Why a supplied bearer token was ignored.
    pub token_error: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The bearer token of the `Authorization` header, if one is present. The
/// scheme name is case-insensitive; any other scheme is reported as an error.
fn bearer_token(headers: &HeaderMap) -> Option<Result<&str, &'static str>> {
    let value = header_str(headers, header::AUTHORIZATION)?;
    let Some((scheme, token)) = value.split_once(char::is_whitespace) else {
        return Some(Err("authorization header has no credentials"));
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Some(Err("unsupported authorization scheme"));
    }
    match token.trim() {
        "" => Some(Err("authorization header has no credentials")),
        token => Some(Ok(token)),
    }
}

/// A fresh API key id: 32 hex characters from the OS RNG.
pub fn generate_key_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Verifies a session token against the signing keys and the user store.
pub async fn verify_user(directory: &Directory, token: &str) -> Result<User, AuthError> {
    let claims = directory.sessions().verify(token).map_err(|e| {
        debug!(error = %e, "session token rejected");
        AuthError::TokenUnauthorized
    })?;
    let user = match directory.users().get(&claims.sub).await {
        Ok(user) => user,
        Err(StoreError::NotFound) => {
            debug!(user_id = %claims.sub, "session token for unknown user");
            return Err(AuthError::TokenUnauthorized);
        }
        Err(e) => return Err(e.into()),
    };
    if claims.predates_password_change(&user) {
        debug!(user_id = %user.id, "session token predates password change");
        return Err(AuthError::TokenUnauthorized);
    }
    Ok(user)
}

impl AppState {
    async fn resolve_key(&self, headers: &HeaderMap) -> Result<ApiKey, AuthError> {
        let key = if let Some(id) = header_str(headers, API_KEY_HEADER) {
            match self.keys.get(id).await {
                Ok(key) => key,
                Err(StoreError::NotFound) => return Err(AuthError::ApiKeyUnauthorized),
                Err(e) => return Err(e.into()),
            }
        } else {
            let origin = header_str(headers, header::ORIGIN).ok_or(AuthError::NoKey)?;
            let mut keys = match self
                .keys
                .find(&Filter::new().eq("allowedOrigins", origin))
                .await
            {
                Ok(keys) => keys,
                Err(StoreError::NotFound) => return Err(AuthError::ApiKeyUnauthorized),
                Err(e) => return Err(e.into()),
            };
            if keys.len() > 1 {
                warn!(origin, count = keys.len(), "origin matches multiple api keys");
                return Err(AuthError::ApiKeyUnauthorized);
            }
            keys.swap_remove(0)
        };

        if key.is_expired(Utc::now()) {
            return Err(AuthError::ApiKeyUnauthorized);
        }
        Ok(key)
    }

    /// Reads the API key (or origin) and optional bearer token of a request.
    ///
    /// Key problems are returned as errors. Token problems are not: the key is
    /// returned with no user and the reason in [`ParsedHeader::token_error`].
    pub async fn parse_header(&self, headers: &HeaderMap) -> Result<ParsedHeader, AuthError> {
        let key = self.resolve_key(headers).await?;
        let mut parsed = ParsedHeader {
            key,
            user: None,
            token_error: None,
        };

        let (Some(directory), Some(token)) = (&self.users, bearer_token(headers)) else {
            return Ok(parsed);
        };
        let token = match token {
            Ok(token) => token,
            Err(reason) => {
                debug!(reason, "authorization header ignored");
                parsed.token_error = Some(reason.to_owned());
                return Ok(parsed);
            }
        };
        match verify_user(directory, token).await {
            Ok(user) => parsed.user = Some(user.into()),
            Err(e) => parsed.token_error = Some(e.to_string()),
        }
        Ok(parsed)
    }

    /// [`AppState::parse_header`] plus authorization for an endpoint.
    ///
    /// Management keys pass only when `allow_management` is set. Any other key
    /// must belong to a registered app and, if `perm` is non-empty, carry it.
    pub async fn verify_header(
        &self,
        headers: &HeaderMap,
        perm: &str,
        allow_management: bool,
    ) -> Result<ParsedHeader, ApiError> {
        let parsed = match self.parse_header(headers).await {
            Ok(parsed) => parsed,
            Err(AuthError::NoKey) => return Err(ApiError::no_key()),
            Err(AuthError::ApiKeyUnauthorized) | Err(AuthError::TokenUnauthorized) => {
                return Err(ApiError::invalid_key())
            }
            Err(AuthError::Store(e)) => {
                error!(error = %e, "error parsing request credentials");
                return Err(ApiError::internal());
            }
        };

        if self.is_management(&parsed.key) {
            if allow_management {
                return Ok(parsed);
            }
            return Err(ApiError::invalid_key());
        }
        if self.registry.get(&parsed.key.app_id).is_none() {
            error!(
                app_id = %parsed.key.app_id,
                key_id = %parsed.key.id,
                "server misconfigured: app id present in key store but app not registered"
            );
            return Err(ApiError::invalid_key());
        }
        if !perm.is_empty() && !parsed.key.has_perm(perm) {
            debug!(app_id = %parsed.key.app_id, perm, "api key lacks permission");
            return Err(ApiError::invalid_key());
        }
        Ok(parsed)
    }

    pub fn is_management(&self, key: &ApiKey) -> bool {
        self.management_app.as_deref() == Some(key.app_id.as_str())
    }

    /// Verifies a bearer token outside of request parsing. Fails with
    /// [`AuthError::TokenUnauthorized`] when user auth is disabled.
    pub async fn verify_user(&self, token: &str) -> Result<User, AuthError> {
        match &self.users {
            Some(directory) => verify_user(directory, token).await,
            None => Err(AuthError::TokenUnauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::HeaderValue;
    use chrono::Duration;

    use super::*;
    use crate::apps::{Registry, SimpleApp};
    use crate::session::{SessionClaims, SessionKeys};
    use crate::store::{RedbTable, Store, Table};
    use crate::users::{KdfParams, PasswordHasher};

    struct Fixture {
        _dir: tempfile::TempDir,
        state: AppState,
        keys: Arc<RedbTable<ApiKey>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("auth.db")).unwrap();
        let keys: Arc<RedbTable<ApiKey>> = Arc::new(store.table("keys").unwrap());
        let users: Arc<RedbTable<User>> = Arc::new(store.table("users").unwrap());
        let registry = Registry::new(vec![Arc::new(SimpleApp::new("notes", None, None))]).unwrap();
        let directory = Directory::new(
            users,
            SessionKeys::generate().unwrap(),
            PasswordHasher::new(KdfParams {
                memory_kib: 64,
                iterations: 1,
                lanes: 1,
                output_len: 32,
            }),
        );
        let state = AppState::new(Arc::new(registry), keys.clone())
            .with_users(directory)
            .with_management_app("admin");
        Fixture {
            _dir: dir,
            state,
            keys,
        }
    }

    fn key(id: &str, app_id: &str) -> ApiKey {
        ApiKey {
            id: id.into(),
            app_id: app_id.into(),
            perm: HashMap::from([("user".to_string(), true)]),
            expiration: None,
            allowed_origins: vec![],
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[tokio::test]
    async fn missing_and_expired_keys_look_the_same() {
        let f = fixture();
        let mut expired = key("old", "notes");
        expired.expiration = Some(Utc::now() - Duration::hours(1));
        f.keys.insert(&expired).await.unwrap();

        let missing = f.state.parse_header(&headers(&[("x-api-key", "nope")])).await;
        let stale = f.state.parse_header(&headers(&[("x-api-key", "old")])).await;
        assert!(matches!(missing, Err(AuthError::ApiKeyUnauthorized)));
        assert!(matches!(stale, Err(AuthError::ApiKeyUnauthorized)));
    }

    #[test]
    fn key_ids_are_32_hex_chars() {
        let id = generate_key_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_key_id());
    }

    #[tokio::test]
    async fn no_headers_is_no_key() {
        let f = fixture();
        assert!(matches!(
            f.state.parse_header(&HeaderMap::new()).await,
            Err(AuthError::NoKey)
        ));
    }

    #[tokio::test]
    async fn origin_fallback_needs_exactly_one_match() {
        let f = fixture();
        let mut a = key("a", "notes");
        a.allowed_origins = vec!["https://notes.example".into()];
        f.keys.insert(&a).await.unwrap();

        let parsed = f
            .state
            .parse_header(&headers(&[("origin", "https://notes.example")]))
            .await
            .unwrap();
        assert_eq!(parsed.key.id, "a");

        let mut b = key("b", "notes");
        b.allowed_origins = vec!["https://notes.example".into()];
        f.keys.insert(&b).await.unwrap();
        assert!(matches!(
            f.state
                .parse_header(&headers(&[("origin", "https://notes.example")]))
                .await,
            Err(AuthError::ApiKeyUnauthorized)
        ));
        assert!(matches!(
            f.state
                .parse_header(&headers(&[("origin", "https://elsewhere.example")]))
                .await,
            Err(AuthError::ApiKeyUnauthorized)
        ));
    }

    #[tokio::test]
    async fn expired_token_keeps_key() {
        let f = fixture();
        f.keys.insert(&key("k", "notes")).await.unwrap();
        let directory = f.state.users.clone().unwrap();
        let (user, _) = directory
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();
        let stale = directory
            .sessions()
            .sign(&SessionClaims::for_user(&user, Utc::now() - Duration::hours(13)))
            .unwrap();

        let bearer = format!("Bearer {stale}");
        let parsed = f
            .state
            .parse_header(&headers(&[("x-api-key", "k"), ("authorization", bearer.as_str())]))
            .await
            .unwrap();
        assert_eq!(parsed.key.id, "k");
        assert!(parsed.user.is_none());
        assert!(parsed.token_error.is_some());
    }

    #[tokio::test]
    async fn valid_token_populates_user() {
        let f = fixture();
        f.keys.insert(&key("k", "notes")).await.unwrap();
        let directory = f.state.users.clone().unwrap();
        let (user, token) = directory
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();

        let bearer = format!("Bearer {token}");
        let parsed = f
            .state
            .parse_header(&headers(&[("x-api-key", "k"), ("authorization", bearer.as_str())]))
            .await
            .unwrap();
        assert_eq!(parsed.user.unwrap().id, user.id);
        assert!(parsed.token_error.is_none());
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let f = fixture();
        f.keys.insert(&key("k", "notes")).await.unwrap();
        let directory = f.state.users.clone().unwrap();
        let (user, token) = directory
            .register("alice", "CorrectHorseBattery1", "alice@example.com")
            .await
            .unwrap();

        let bearer = format!("bearer {token}");
        let parsed = f
            .state
            .parse_header(&headers(&[("x-api-key", "k"), ("authorization", bearer.as_str())]))
            .await
            .unwrap();
        assert_eq!(parsed.user.unwrap().id, user.id);
        assert!(parsed.token_error.is_none());
    }

    #[tokio::test]
    async fn other_authorization_schemes_are_reported() {
        let f = fixture();
        f.keys.insert(&key("k", "notes")).await.unwrap();

        for value in ["Basic YWxpY2U6c2VjcmV0", "Bearer", "Token"] {
            let parsed = f
                .state
                .parse_header(&headers(&[("x-api-key", "k"), ("authorization", value)]))
                .await
                .unwrap();
            assert_eq!(parsed.key.id, "k");
            assert!(parsed.user.is_none());
            assert!(parsed.token_error.is_some(), "{value} was dropped silently");
        }
    }

    #[tokio::test]
    async fn verify_header_enforces_perm_and_registration() {
        let f = fixture();
        f.keys.insert(&key("k", "notes")).await.unwrap();
        f.keys.insert(&key("ghost", "unregistered")).await.unwrap();
        f.keys.insert(&key("admin-key", "admin")).await.unwrap();

        let k = headers(&[("x-api-key", "k")]);
        assert!(f.state.verify_header(&k, "user", false).await.is_ok());
        assert_eq!(
            f.state.verify_header(&k, "crash", false).await.unwrap_err(),
            ApiError::invalid_key()
        );

        let ghost = headers(&[("x-api-key", "ghost")]);
        assert_eq!(
            f.state.verify_header(&ghost, "", false).await.unwrap_err(),
            ApiError::invalid_key()
        );

        let admin = headers(&[("x-api-key", "admin-key")]);
        assert!(f.state.verify_header(&admin, "management", true).await.is_ok());
        assert_eq!(
            f.state
                .verify_header(&admin, "management", false)
                .await
                .unwrap_err(),
            ApiError::invalid_key()
        );

        assert_eq!(
            f.state
                .verify_header(&HeaderMap::new(), "user", false)
                .await
                .unwrap_err(),
            ApiError::no_key()
        );
    }
}
