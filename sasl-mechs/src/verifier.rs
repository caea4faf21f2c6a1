use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use sasl_core::engine::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Checks passwords and proxy rights on the acceptor side.
pub trait PasswordVerifier: Send + Sync {
    /// `Ok(false)` for a wrong password or an unknown user, `Err` when the
    /// check itself could not be done.
    fn verify(&self, username: &str, password: &str) -> Result<bool>;

    /// May `authenticated` act as `requested`?
    fn authorize(&self, authenticated: &str, requested: &str) -> bool {
        authenticated == requested
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    /// Argon2 PHC string, see `hash_password`.
    pub password: String,
    /// Identities this user may ask to be authorized as.
    #[serde(default)]
    pub proxy_for: Vec<String>,
}

pub type UserList = HashMap<String, UserEntry>;

pub fn read_user_list(user_list: PathBuf) -> Result<UserList> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(user_list.as_path())
        .with_context(|| format!("'{:?}' must be a user database", user_list))?;

    let mut content = String::new();
    file.read_to_string(&mut content)?;

    Ok(toml::from_str(&content)?)
}

/// Users known from a static list, passwords stored as argon2 hashes.
#[derive(Default, Debug, Clone)]
pub struct StaticVerifier {
    users: UserList,
}

impl StaticVerifier {
    pub fn new(users: UserList) -> Self {
        Self { users }
    }

    pub fn from_file(user_list: PathBuf) -> Result<Self> {
        let users = read_user_list(user_list)?;
        tracing::info!("{} users loaded", users.len());
        Ok(Self::new(users))
    }

    pub fn with_user(mut self, username: &str, password_hash: String) -> Self {
        self.users.insert(
            username.to_string(),
            UserEntry {
                password: password_hash,
                proxy_for: vec![],
            },
        );
        self
    }

    pub fn with_proxy(mut self, username: &str, target: &str) -> Self {
        if let Some(entry) = self.users.get_mut(username) {
            entry.proxy_for.push(target.to_string());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl PasswordVerifier for StaticVerifier {
    fn verify(&self, username: &str, password: &str) -> Result<bool> {
        tracing::debug!(user=%username, "verify password");
        match self.users.get(username) {
            None => Ok(false),
            Some(entry) => verify_password(password, &entry.password),
        }
    }

    fn authorize(&self, authenticated: &str, requested: &str) -> bool {
        authenticated == requested
            || self
                .users
                .get(authenticated)
                .map_or(false, |e| e.proxy_for.iter().any(|p| p == requested))
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Password check followed by the authorization decision, shared by the
/// password based acceptors. Returns the authorized identity.
pub(crate) fn authenticate(
    verifier: &dyn PasswordVerifier,
    username: &str,
    password: &str,
    authzid: Option<&str>,
) -> EngineResult<String> {
    match verifier.verify(username, password) {
        Ok(true) => (),
        Ok(false) => {
            tracing::warn!(user=%username, "login failed");
            return Err(EngineError::BadCredential(format!(
                "login failed for {}",
                username
            )));
        }
        Err(e) => {
            tracing::error!(user=%username, err=%e, "password verification unavailable");
            return Err(EngineError::Unavailable(e.to_string()));
        }
    }

    authorize(verifier, username, authzid)
}

pub(crate) fn authorize(
    verifier: &dyn PasswordVerifier,
    authenticated: &str,
    authzid: Option<&str>,
) -> EngineResult<String> {
    match authzid {
        None | Some("") => Ok(authenticated.to_string()),
        Some(requested) if verifier.authorize(authenticated, requested) => {
            tracing::debug!(user=%authenticated, authz=%requested, "proxy authorization granted");
            Ok(requested.to_string())
        }
        Some(requested) => {
            tracing::error!(user=%authenticated, authz=%requested, "Impersonating user is not supported");
            Err(EngineError::Aborted(format!(
                "{} may not act as {}",
                authenticated, requested
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
        assert!(verify_password("hunter2", "not a phc string").is_err());
    }

    #[test]
    fn test_user_list_from_toml() {
        let users: UserList = toml::from_str(
            r#"
            [alice]
            password = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdHNhbHQ$aGFzaA"
            proxy_for = ["shared"]

            [bob]
            password = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdHNhbHQ$aGFzaA"
            "#,
        )
        .unwrap();
        let verifier = StaticVerifier::new(users);
        assert_eq!(verifier.len(), 2);
        assert!(verifier.authorize("alice", "shared"));
        assert!(!verifier.authorize("bob", "shared"));
        assert!(verifier.authorize("bob", "bob"));
    }

    #[test]
    fn test_unknown_user_is_a_plain_failure() {
        let verifier = StaticVerifier::default();
        assert!(!verifier.verify("nobody", "pw").unwrap());
        assert!(matches!(
            authenticate(&verifier, "nobody", "pw", None),
            Err(EngineError::BadCredential(_))
        ));
    }
}
