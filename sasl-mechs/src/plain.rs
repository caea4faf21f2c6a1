use std::sync::Arc;

use sasl_core::config::{Secret, SessionConfig};
use sasl_core::engine::*;
use sasl_core::interaction::{Answers, InteractionKind, InteractionRequest};

use super::decode::auth_plain;
use super::verifier::{authenticate, PasswordVerifier};

/// Username and password from the configuration, or else from the answers
/// collected so far. Whatever is still missing is returned as prompts.
pub(crate) fn credentials(
    config: &SessionConfig,
    answers: &Answers,
) -> Result<(String, Secret), Vec<InteractionRequest>> {
    let username = config
        .username
        .clone()
        .or_else(|| answers.get_str(InteractionKind::AuthName).map(str::to_string));
    let password = config
        .credential
        .clone()
        .or_else(|| answers.get(InteractionKind::Password).cloned());

    match (username, password) {
        (Some(username), Some(password)) => Ok((username, password)),
        (username, password) => {
            let mut prompts = vec![];
            if username.is_none() {
                prompts.push(InteractionRequest::new(
                    InteractionKind::AuthName,
                    "Please enter your authentication name",
                ));
            }
            if password.is_none() {
                prompts.push(InteractionRequest::new(
                    InteractionKind::Password,
                    "Please enter your password",
                ));
            }
            Err(prompts)
        }
    }
}

pub(crate) fn identity(identity: &Option<String>) -> EngineResult<Outcome> {
    match identity {
        Some(id) => Ok(Outcome {
            ssf: 0,
            max_buffer: 0,
            authorized_identity: id.clone(),
        }),
        None => Err(EngineError::Protocol("exchange is not complete".into())),
    }
}

pub struct PlainClient {
    config: SessionConfig,
    identity: Option<String>,
}

impl PlainClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            identity: None,
        }
    }
}

impl MechanismContext for PlainClient {
    fn start(&mut self, _input: Option<&[u8]>, answers: &Answers) -> EngineResult<Status> {
        let (username, password) = match credentials(&self.config, answers) {
            Ok(v) => v,
            Err(prompts) => return Ok(Status::Interact(prompts)),
        };
        if username.contains('\0') || password.expose().contains(&0) {
            return Err(EngineError::Aborted(
                "PLAIN cannot carry NUL characters".into(),
            ));
        }

        // an authzid equal to the username is left empty
        let authzid = match self.config.authorization_identity.as_deref() {
            Some(authz) if authz != username => authz,
            _ => "",
        };

        let mut message = Vec::with_capacity(authzid.len() + username.len() + password.expose().len() + 2);
        message.extend_from_slice(authzid.as_bytes());
        message.push(0);
        message.extend_from_slice(username.as_bytes());
        message.push(0);
        message.extend_from_slice(password.expose());

        self.identity = Some(if authzid.is_empty() {
            username
        } else {
            authzid.to_string()
        });
        Ok(Status::Complete(message))
    }

    fn step(&mut self, _input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        Err(EngineError::Protocol("PLAIN has a single message".into()))
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.identity)
    }
}

pub struct PlainServer {
    verifier: Arc<dyn PasswordVerifier>,
    identity: Option<String>,
}

impl PlainServer {
    pub fn new(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self {
            verifier,
            identity: None,
        }
    }

    fn try_auth_plain(&mut self, data: &[u8]) -> EngineResult<Status> {
        // Check that we can extract user's login+pass
        let (authz, ubin, pbin) = match auth_plain(data) {
            Ok((_, parts)) => parts,
            Err(e) => {
                tracing::error!(err=?e, "Could not parse the SASL PLAIN data chunk");
                return Err(EngineError::Protocol("malformed PLAIN message".into()));
            }
        };

        // Try to convert it to UTF-8
        let (authz, user, password) = match (
            std::str::from_utf8(authz),
            std::str::from_utf8(ubin),
            std::str::from_utf8(pbin),
        ) {
            (Ok(a), Ok(u), Ok(p)) => (a, u, p),
            _ => {
                tracing::error!("Username or password contain invalid UTF-8 characters");
                return Err(EngineError::Protocol("invalid UTF-8 in PLAIN message".into()));
            }
        };

        let identity = authenticate(self.verifier.as_ref(), user, password, Some(authz))?;
        self.identity = Some(identity);
        Ok(Status::Complete(vec![]))
    }
}

impl MechanismContext for PlainServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            Some(data) if !data.is_empty() => self.try_auth_plain(data),
            _ => Ok(Status::Continue(vec![])),
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        if self.identity.is_some() {
            return Err(EngineError::Protocol("PLAIN is already complete".into()));
        }
        self.try_auth_plain(input)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.identity)
    }
}
