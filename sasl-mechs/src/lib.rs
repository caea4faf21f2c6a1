//! Mechanisms that need nothing beyond a password database: PLAIN, LOGIN,
//! EXTERNAL and ANONYMOUS, packaged as a `sasl_core` engine.

pub mod anonymous;
pub mod decode;
pub mod engine;
pub mod external;
pub mod login;
pub mod plain;
pub mod types;
pub mod verifier;

pub use engine::{BuiltinConfig, BuiltinEngine, ENGINE_NAME};
pub use types::Mechanism;
pub use verifier::{hash_password, verify_password, PasswordVerifier, StaticVerifier};
