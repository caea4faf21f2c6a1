//! The obsolete but widespread LOGIN mechanism: the acceptor asks for the
//! username then the password, each sent as its own message.

use std::sync::Arc;

use sasl_core::config::{Secret, SessionConfig};
use sasl_core::engine::*;
use sasl_core::interaction::Answers;

use super::plain::{credentials, identity};
use super::verifier::{authenticate, PasswordVerifier};

pub const USERNAME_CHALLENGE: &[u8] = b"Username:";
pub const PASSWORD_CHALLENGE: &[u8] = b"Password:";

#[derive(Debug)]
enum ClientState {
    Error,
    Init,
    WaitUsernameChallenge { username: String, password: Secret },
    WaitPasswordChallenge { username: String, password: Secret },
    Done { username: String },
}

pub struct LoginClient {
    config: SessionConfig,
    state: ClientState,
}

impl LoginClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: ClientState::Init,
        }
    }
}

impl MechanismContext for LoginClient {
    fn start(&mut self, _input: Option<&[u8]>, answers: &Answers) -> EngineResult<Status> {
        let (username, password) = match credentials(&self.config, answers) {
            Ok(v) => v,
            Err(prompts) => return Ok(Status::Interact(prompts)),
        };
        self.state = ClientState::WaitUsernameChallenge { username, password };
        Ok(Status::Continue(vec![]))
    }

    fn step(&mut self, _input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        let (new_state, status) = match std::mem::replace(&mut self.state, ClientState::Error) {
            ClientState::WaitUsernameChallenge { username, password } => {
                let message = username.clone().into_bytes();
                (
                    ClientState::WaitPasswordChallenge { username, password },
                    Status::Continue(message),
                )
            }
            ClientState::WaitPasswordChallenge { username, password } => (
                ClientState::Done { username },
                Status::Complete(password.expose().to_vec()),
            ),
            _ => return Err(EngineError::Protocol("unexpected LOGIN challenge".into())),
        };
        tracing::trace!(state=?new_state, "LOGIN progress");
        self.state = new_state;
        Ok(status)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        match &self.state {
            ClientState::Done { username } => identity(&Some(username.clone())),
            _ => identity(&None),
        }
    }
}

#[derive(Debug)]
enum ServerState {
    Error,
    WaitUsername,
    WaitPassword { username: String },
    Done { identity: String },
}

pub struct LoginServer {
    verifier: Arc<dyn PasswordVerifier>,
    state: ServerState,
}

impl LoginServer {
    pub fn new(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self {
            verifier,
            state: ServerState::WaitUsername,
        }
    }

    fn progress(&mut self, input: &[u8]) -> EngineResult<Status> {
        let text = std::str::from_utf8(input).map_err(|_| {
            tracing::error!("Username or password contain invalid UTF-8 characters");
            EngineError::Protocol("invalid UTF-8 in LOGIN message".into())
        })?;

        let (new_state, status) = match std::mem::replace(&mut self.state, ServerState::Error) {
            ServerState::WaitUsername => (
                ServerState::WaitPassword {
                    username: text.to_string(),
                },
                Status::Continue(PASSWORD_CHALLENGE.to_vec()),
            ),
            ServerState::WaitPassword { username } => {
                let identity = authenticate(self.verifier.as_ref(), &username, text, None)?;
                (ServerState::Done { identity }, Status::Complete(vec![]))
            }
            _ => return Err(EngineError::Protocol("LOGIN is already complete".into())),
        };
        self.state = new_state;
        Ok(status)
    }
}

impl MechanismContext for LoginServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            // some clients send the username right away
            Some(username) if !username.is_empty() => self.progress(username),
            _ => Ok(Status::Continue(USERNAME_CHALLENGE.to_vec())),
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        self.progress(input)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        match &self.state {
            ServerState::Done { identity: id } => identity(&Some(id.clone())),
            _ => identity(&None),
        }
    }
}
