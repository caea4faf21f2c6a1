use std::collections::HashMap;
use std::fmt;

use crate::config::Secret;

/// What kind of information the engine is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    /// Authentication identity.
    AuthName,
    /// Authorization identity.
    User,
    Password,
    Realm,
    /// Free form answer that may be echoed.
    EchoPrompt,
    /// Free form answer that must not be echoed.
    NoEchoPrompt,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthName => "authname",
            Self::User => "user",
            Self::Password => "password",
            Self::Realm => "realm",
            Self::EchoPrompt => "echo-prompt",
            Self::NoEchoPrompt => "noecho-prompt",
        };
        f.write_str(name)
    }
}

/// A prompt raised mid-handshake when the configuration lacks something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRequest {
    pub kind: InteractionKind,
    pub prompt: String,
    pub default_value: Option<String>,
}

impl InteractionRequest {
    pub fn new(kind: InteractionKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Resolves interaction requests on behalf of a session.
///
/// Calls are synchronous: the `start` or `step` call that raised the request
/// blocks until `resolve` returns. Returning `None` means the prompt cannot be
/// answered and fails the handshake. The default value of a request is never
/// used unless the callback returns it explicitly.
pub trait InteractionCallback: Send {
    fn resolve(&mut self, request: &InteractionRequest) -> Option<Secret>;
}

impl<F> InteractionCallback for F
where
    F: FnMut(&InteractionRequest) -> Option<Secret> + Send,
{
    fn resolve(&mut self, request: &InteractionRequest) -> Option<Secret> {
        self(request)
    }
}

/// Answers collected so far during one handshake, handed back to the engine.
#[derive(Default, Debug)]
pub struct Answers {
    values: HashMap<InteractionKind, Secret>,
}

impl Answers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: InteractionKind) -> Option<&Secret> {
        self.values.get(&kind)
    }

    pub fn get_str(&self, kind: InteractionKind) -> Option<&str> {
        self.get(kind).and_then(Secret::expose_str)
    }

    pub fn contains(&self, kind: InteractionKind) -> bool {
        self.values.contains_key(&kind)
    }

    pub fn insert(&mut self, kind: InteractionKind, value: Secret) {
        self.values.insert(kind, value);
    }

    /// Drops (and thus wipes) every collected answer.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
