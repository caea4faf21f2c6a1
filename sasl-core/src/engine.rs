//! The narrow interface between the handshake core and whatever actually
//! implements the mechanisms.
//!
//! An engine is selected by name, then hands out one `MechanismContext` per
//! connection attempt. The core never looks inside mechanism payloads.

use std::fmt;

use thiserror::Error;

use crate::config::{ServiceConfig, SessionConfig};
use crate::interaction::{Answers, InteractionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Static description of a mechanism, used to decide whether it is worth trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechanismInfo {
    pub name: String,
    /// The initiator needs an authentication identity.
    pub needs_username: bool,
    /// The initiator needs a secret.
    pub needs_credential: bool,
    /// Requires an identity asserted by the transport.
    pub needs_external: bool,
    /// Can carry an authorization identity distinct from the username.
    pub supports_proxy: bool,
    /// Strongest security layer the mechanism can negotiate.
    pub max_ssf: u32,
}

impl MechanismInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs_username: false,
            needs_credential: false,
            needs_external: false,
            supports_proxy: false,
            max_ssf: 0,
        }
    }

    pub fn with_username(mut self) -> Self {
        self.needs_username = true;
        self
    }

    pub fn with_credential(mut self) -> Self {
        self.needs_credential = true;
        self
    }

    pub fn with_external(mut self) -> Self {
        self.needs_external = true;
        self
    }

    pub fn with_proxy(mut self) -> Self {
        self.supports_proxy = true;
        self
    }

    pub fn with_max_ssf(mut self, ssf: u32) -> Self {
        self.max_ssf = ssf;
        self
    }
}

/// Everything an engine gets to build a per-connection context.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams<'a> {
    pub role: Role,
    pub service: &'a ServiceConfig,
    pub config: &'a SessionConfig,
}

/// Result of one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Send this payload, more exchanges follow.
    Continue(Vec<u8>),
    /// Send this payload (possibly empty), the exchange is over for us.
    Complete(Vec<u8>),
    /// Answer these prompts, then call again with the same input.
    Interact(Vec<InteractionRequest>),
}

/// Properties reported by a context once it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Strength of the negotiated security layer, 0 when there is none.
    pub ssf: u32,
    /// Largest plaintext the peer accepts in one frame, 0 when unknown.
    pub max_buffer: u32,
    pub authorized_identity: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("bad credential: {0}")]
    BadCredential(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Per-connection state of one mechanism.
pub trait MechanismContext: Send {
    /// First call of the exchange. The initiator gets `None`; the acceptor
    /// gets the initial response the client sent along with its choice.
    fn start(&mut self, input: Option<&[u8]>, answers: &Answers) -> EngineResult<Status>;

    /// Process the peer's last payload.
    fn step(&mut self, input: &[u8], answers: &Answers) -> EngineResult<Status>;

    /// Only called after a `Status::Complete`.
    fn outcome(&self) -> EngineResult<Outcome>;

    /// Split the negotiated security layer into its two directions.
    /// Only called once, after completion, when `outcome().ssf > 0`.
    fn security_layer(&mut self) -> Option<(Box<dyn LayerEncoder>, Box<dyn LayerDecoder>)> {
        None
    }
}

/// Outgoing direction of a security layer.
pub trait LayerEncoder: Send {
    fn seal(&mut self, plaintext: &[u8]) -> EngineResult<Vec<u8>>;
}

/// Incoming direction of a security layer.
pub trait LayerDecoder: Send {
    fn open(&mut self, ciphertext: &[u8]) -> EngineResult<Vec<u8>>;

    /// Bytes a sealed frame may add on top of its plaintext.
    fn overhead(&self) -> usize {
        0
    }
}

pub trait AuthenticationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup, see `Registry::initialize`.
    fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Supported mechanisms, in preference order.
    fn mechanisms(&self) -> Vec<MechanismInfo>;

    /// Whether `mechanism` can currently be served in `role`, e.g. an
    /// acceptor lacking its password database. Unsupported mechanisms are
    /// neither advertised nor selected.
    fn supports(&self, _mechanism: &str, _role: Role) -> bool {
        true
    }

    /// Build a context for `mechanism`, `Ok(None)` if it is not provided.
    fn new_context(
        &self,
        mechanism: &str,
        params: ContextParams<'_>,
    ) -> EngineResult<Option<Box<dyn MechanismContext>>>;
}

impl fmt::Debug for dyn AuthenticationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationEngine")
            .field("name", &self.name())
            .finish()
    }
}
