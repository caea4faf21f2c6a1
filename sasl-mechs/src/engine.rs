use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sasl_core::engine::*;
use serde::{Deserialize, Serialize};

use super::anonymous::{AnonymousClient, AnonymousServer};
use super::external::{ExternalClient, ExternalServer};
use super::login::{LoginClient, LoginServer};
use super::plain::{PlainClient, PlainServer};
use super::types::Mechanism;
use super::verifier::{PasswordVerifier, StaticVerifier};

pub const ENGINE_NAME: &str = "builtin";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BuiltinConfig {
    /// TOML user database checked by PLAIN and LOGIN acceptors.
    #[serde(default)]
    pub user_list: Option<PathBuf>,
    #[serde(default)]
    pub allow_anonymous: bool,
}

/// Engine for the mechanisms that need no external library.
///
/// Initiators need nothing more. Acceptors need a `PasswordVerifier` for
/// PLAIN and LOGIN, and must allow ANONYMOUS explicitly.
#[derive(Default)]
pub struct BuiltinEngine {
    user_list: Option<PathBuf>,
    verifier: Option<Arc<dyn PasswordVerifier>>,
    allow_anonymous: bool,
    loaded: std::sync::OnceLock<Arc<dyn PasswordVerifier>>,
}

impl BuiltinEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user list, if any, is loaded by `initialize`.
    pub fn from_config(config: BuiltinConfig) -> Self {
        Self {
            user_list: config.user_list,
            allow_anonymous: config.allow_anonymous,
            ..Self::default()
        }
    }

    pub fn with_verifier(mut self, verifier: impl PasswordVerifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    fn current_verifier(&self) -> Option<Arc<dyn PasswordVerifier>> {
        self.verifier.clone().or_else(|| self.loaded.get().cloned())
    }

    fn password_verifier(&self, mechanism: Mechanism) -> EngineResult<Arc<dyn PasswordVerifier>> {
        self.current_verifier().ok_or_else(|| {
            EngineError::Unavailable(format!("{} acceptor needs a password verifier", mechanism))
        })
    }

    fn load_user_list(&self, path: &PathBuf) -> Result<()> {
        let verifier = StaticVerifier::from_file(path.clone())?;
        // a concurrent initialization may have won, both loaded the same file
        let _ = self.loaded.set(Arc::new(verifier));
        Ok(())
    }
}

impl AuthenticationEngine for BuiltinEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn initialize(&self) -> EngineResult<()> {
        if let (Some(path), None) = (&self.user_list, self.loaded.get()) {
            self.load_user_list(path).map_err(|e| {
                tracing::warn!(path=%path.to_string_lossy(), error=%e, "Unable to load user list");
                EngineError::Unavailable(e.to_string())
            })?;
        }
        tracing::debug!(
            verifier = self.current_verifier().is_some(),
            anonymous = self.allow_anonymous,
            "Builtin mechanisms ready"
        );
        Ok(())
    }

    fn mechanisms(&self) -> Vec<MechanismInfo> {
        Mechanism::ALL
            .iter()
            .filter(|m| **m != Mechanism::Anonymous || self.allow_anonymous)
            .map(Mechanism::info)
            .collect()
    }

    fn supports(&self, mechanism: &str, role: Role) -> bool {
        match (mechanism.parse::<Mechanism>(), role) {
            (Ok(Mechanism::Plain), Role::Acceptor) | (Ok(Mechanism::Login), Role::Acceptor) => {
                self.current_verifier().is_some()
            }
            (Ok(Mechanism::Anonymous), _) => self.allow_anonymous,
            (Ok(_), _) => true,
            (Err(_), _) => false,
        }
    }

    fn new_context(
        &self,
        mechanism: &str,
        params: ContextParams<'_>,
    ) -> EngineResult<Option<Box<dyn MechanismContext>>> {
        let mechanism: Mechanism = match mechanism.parse() {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };

        let ctx: Box<dyn MechanismContext> = match (mechanism, params.role) {
            (Mechanism::Plain, Role::Initiator) => Box::new(PlainClient::new(params.config.clone())),
            (Mechanism::Plain, Role::Acceptor) => {
                Box::new(PlainServer::new(self.password_verifier(mechanism)?))
            }
            (Mechanism::Login, Role::Initiator) => Box::new(LoginClient::new(params.config.clone())),
            (Mechanism::Login, Role::Acceptor) => {
                Box::new(LoginServer::new(self.password_verifier(mechanism)?))
            }
            (Mechanism::External, Role::Initiator) => {
                Box::new(ExternalClient::new(params.config.clone()))
            }
            (Mechanism::External, Role::Acceptor) => Box::new(ExternalServer::new(
                params.config,
                self.current_verifier(),
            )),
            (Mechanism::Anonymous, _) if !self.allow_anonymous => {
                return Err(EngineError::Unavailable("anonymous login is disabled".into()))
            }
            (Mechanism::Anonymous, Role::Initiator) => {
                Box::new(AnonymousClient::new(params.config))
            }
            (Mechanism::Anonymous, Role::Acceptor) => Box::new(AnonymousServer::default()),
        };
        Ok(Some(ctx))
    }
}
