//! Basic authentication in front of every tunnel route.

use std::collections::HashMap;
use std::fmt;

use argon2::Argon2;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use http::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use http::{HeaderMap, Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{BoxBody, full_body};

pub const REALM: &str = "htun";

/// Decides whether a username/password pair may use the tunnel.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// The authenticated user of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(String);

impl CurrentUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrentUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Users and their argon2 password hashes.
pub struct UserStore {
    users: HashMap<String, String>,
    // Keyed digests of credentials that already passed argon2 verification.
    verified: DashMap<String, [u8; 32]>,
    cache_key: [u8; 16],
}

impl UserStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        let mut cache_key = [0u8; 16];
        OsRng.fill_bytes(&mut cache_key);
        Self {
            users,
            verified: DashMap::new(),
            cache_key,
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Binds the password to this store and to the stored hash, so a
    /// changed hash never matches an old entry.
    fn digest(&self, hash: &str, password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.cache_key);
        hasher.update(hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }
}

impl Authenticator for UserStore {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.users.get(username) else {
            debug!(user = %username, "Unknown user");
            return false;
        };

        let digest = self.digest(hash, password);
        if self
            .verified
            .get(username)
            .is_some_and(|known| *known == digest)
        {
            return true;
        }

        match verify_password(password, hash) {
            Ok(true) => {
                self.verified.insert(username.to_owned(), digest);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(user = %username, error = %e, "Stored password hash is not valid");
                false
            }
        }
    }
}

/// Hashes a password into a PHC string suitable for the user table.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Extracts Basic credentials from `headers` and checks them.
pub fn authenticate(authenticator: &dyn Authenticator, headers: &HeaderMap) -> Option<CurrentUser> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    authenticator
        .authenticate(username, password)
        .then(|| CurrentUser::new(username))
}

pub fn unauthorized() -> Response<BoxBody> {
    let mut response = Response::new(full_body("Unauthorized\r\n"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"htun\""),
    );
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct AllowAll;

    impl Authenticator for AllowAll {
        fn authenticate(&self, _username: &str, _password: &str) -> bool {
            true
        }
    }

    fn basic(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = STANDARD.encode(value);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {token}")).unwrap(),
        );
        headers
    }

    fn store() -> UserStore {
        let hash = hash_password("s3cret").unwrap();
        UserStore::new(HashMap::from([("alice".to_owned(), hash)]))
    }

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
        assert!(verify_password("s3cret", "not-a-hash").is_err());
    }

    #[test]
    fn valid_basic_credentials_pass() {
        let store = store();
        let user = authenticate(&store, &basic("alice:s3cret"));
        assert_eq!(user, Some(CurrentUser::new("alice")));
        // Second time goes through the verified cache.
        assert!(authenticate(&store, &basic("alice:s3cret")).is_some());
    }

    #[test]
    fn verified_cache_holds_digests_only() {
        let store = store();
        assert!(store.authenticate("alice", "s3cret"));

        let cached = *store.verified.get("alice").unwrap();
        assert_ne!(&cached[..6], b"s3cret");
        assert_eq!(cached, store.digest(&store.users["alice"], "s3cret"));

        assert!(!store.authenticate("alice", "wrong"));
        assert!(store.authenticate("alice", "s3cret"));
    }

    #[test]
    fn bad_credentials_are_rejected() {
        let store = store();
        assert!(authenticate(&store, &basic("alice:wrong")).is_none());
        assert!(authenticate(&store, &basic("bob:s3cret")).is_none());
        assert!(authenticate(&store, &basic("no-colon")).is_none());
        assert!(authenticate(&store, &HeaderMap::new()).is_none());

        let mut bearer = HeaderMap::new();
        bearer.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(authenticate(&store, &bearer).is_none());
    }

    #[test]
    fn password_may_contain_colons() {
        let hash = hash_password("a:b:c").unwrap();
        let store = UserStore::new(HashMap::from([("alice".to_owned(), hash)]));
        assert!(authenticate(&store, &basic("alice:a:b:c")).is_some());
    }

    #[test]
    fn challenge_names_the_realm() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[WWW_AUTHENTICATE],
            format!("Basic realm=\"{REALM}\"")
        );
    }
}
