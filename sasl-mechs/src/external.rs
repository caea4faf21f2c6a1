use std::sync::Arc;

use sasl_core::config::SessionConfig;
use sasl_core::engine::*;
use sasl_core::interaction::Answers;

use super::plain::identity;
use super::verifier::{authorize, PasswordVerifier};

/// Authentication already done by the transport (TLS client certificate,
/// unix socket credentials). The only payload is an optional authzid.
pub struct ExternalClient {
    config: SessionConfig,
    identity: Option<String>,
}

impl ExternalClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            identity: None,
        }
    }
}

impl MechanismContext for ExternalClient {
    fn start(&mut self, _input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        let external = self
            .config
            .external_identity
            .clone()
            .ok_or_else(|| EngineError::Unavailable("no external identity".into()))?;

        let authzid = self
            .config
            .authorization_identity
            .clone()
            .filter(|authz| authz != &external);
        let message = authzid.clone().unwrap_or_default().into_bytes();

        self.identity = Some(authzid.unwrap_or(external));
        Ok(Status::Complete(message))
    }

    fn step(&mut self, _input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        Err(EngineError::Protocol("EXTERNAL has a single message".into()))
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.identity)
    }
}

pub struct ExternalServer {
    external: Option<String>,
    verifier: Option<Arc<dyn PasswordVerifier>>,
    identity: Option<String>,
}

/// Without a verifier only the external identity itself can be requested.
struct SameIdentity;

impl PasswordVerifier for SameIdentity {
    fn verify(&self, _username: &str, _password: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

impl ExternalServer {
    pub fn new(config: &SessionConfig, verifier: Option<Arc<dyn PasswordVerifier>>) -> Self {
        Self {
            external: config.external_identity.clone(),
            verifier,
            identity: None,
        }
    }

    fn finish(&mut self, authzid: &[u8]) -> EngineResult<Status> {
        let external = self
            .external
            .as_deref()
            .ok_or_else(|| EngineError::Unavailable("no external identity".into()))?;
        let authzid = std::str::from_utf8(authzid)
            .map_err(|_| EngineError::Protocol("invalid UTF-8 in EXTERNAL authzid".into()))?;

        let identity = match &self.verifier {
            Some(verifier) => authorize(verifier.as_ref(), external, Some(authzid))?,
            None => authorize(&SameIdentity, external, Some(authzid))?,
        };
        self.identity = Some(identity);
        Ok(Status::Complete(vec![]))
    }
}

impl MechanismContext for ExternalServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            Some(authzid) => self.finish(authzid),
            None => Ok(Status::Continue(vec![])),
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        if self.identity.is_some() {
            return Err(EngineError::Protocol("EXTERNAL is already complete".into()));
        }
        self.finish(input)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.identity)
    }
}
