//! Mechanism negotiated authentication handshakes with an optional security
//! layer, for connection oriented protocols.
//!
//! A `HandshakeSession` drives one exchange against an `AuthenticationEngine`.
//! Once complete, its `SecurityLayer` protects the rest of the connection,
//! either through the blocking adapters of `adapter` or through `FrameCodec`
//! on a `tokio_util` framed transport.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod registry;
pub mod segment;
pub mod session;
pub mod testing;

pub use adapter::{SecuredReader, SecuredStream, SecuredWriter};
pub use codec::{FrameCodec, SecurityLayer};
pub use config::{read_config, Config, Secret, ServiceConfig, SessionConfig};
pub use engine::{AuthenticationEngine, MechanismInfo, Role};
pub use error::{Error, Result};
pub use interaction::{InteractionCallback, InteractionKind, InteractionRequest};
pub use registry::Registry;
pub use session::{HandshakeSession, StartOutcome, State, StepOutcome};
